//! Random-walk prediction over an arbitrary element definition.

use std::sync::Arc;

use nalgebra::DMatrix;

use crate::element::{ElementVector, ElementVectorDefinition};
use crate::error::FilterResult;
use crate::residual::{PredictionModel, PredictionResidual, ResidualContext, ResidualCore};

/// `cur = pre ⊞ √dt · n`, element-wise over the wrapped definition.
///
/// The noise vector shares the state definition; its tangent is scaled by
/// `√dt` so the covariance acts as a continuous-time diffusion density.
#[derive(Debug)]
pub struct RandomWalkPrediction {
    core: ResidualCore,
}

impl RandomWalkPrediction {
    pub fn new(name: &str, definition: Arc<ElementVectorDefinition>) -> Self {
        RandomWalkPrediction {
            core: ResidualCore::new(
                name,
                definition.clone(),
                definition.clone(),
                definition.clone(),
                definition,
                true,
                true,
            ),
        }
    }

    /// Wrap into the mechanically-derived residual.
    pub fn into_residual(self) -> PredictionResidual<RandomWalkPrediction> {
        PredictionResidual::new(self)
    }

    fn noise_tangent(
        &self,
        noi: &ElementVector,
        dt: f64,
    ) -> FilterResult<nalgebra::DVector<f64>> {
        let identity = ElementVector::new(self.core.noi_definition().clone());
        Ok(noi.box_minus_owned(&identity)? * dt.abs().sqrt())
    }
}

impl PredictionModel for RandomWalkPrediction {
    fn core(&self) -> &ResidualCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ResidualCore {
        &mut self.core
    }

    fn predict(
        &self,
        cur: &mut ElementVector,
        pre: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let scaled = self.noise_tangent(noi, ctx.dt)?;
        pre.box_plus(&scaled, cur)?;
        Ok(())
    }

    fn predict_jac_pre(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let scaled = self.noise_tangent(noi, ctx.dt)?;
        jac.fill(0.0);
        for (i, spec) in pre.definition().specs().iter().enumerate() {
            let block = pre
                .element(i)
                .boxplus_jac_inp(scaled.rows(spec.offset(), spec.dim()));
            jac.view_mut((spec.offset(), spec.offset()), (spec.dim(), spec.dim()))
                .copy_from(&block);
        }
        Ok(())
    }

    fn predict_jac_noi(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let scale = ctx.dt.abs().sqrt();
        let scaled = self.noise_tangent(noi, ctx.dt)?;
        let identity = ElementVector::new(self.core.noi_definition().clone());
        jac.fill(0.0);
        for (i, spec) in pre.definition().specs().iter().enumerate() {
            // Chain: ∂(pre ⊞ √dt·v)/∂v · √dt · ∂(noi ⊟ id)/∂noi.
            let plus = pre
                .element(i)
                .boxplus_jac_vec(scaled.rows(spec.offset(), spec.dim()));
            let minus = noi.element(i).boxminus_jac_inp(identity.element(i))?;
            jac.view_mut((spec.offset(), spec.offset()), (spec.dim(), spec.dim()))
                .copy_from(&(plus * minus * scale));
        }
        Ok(())
    }
}
