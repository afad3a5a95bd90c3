//! Prediction residuals derived mechanically from a forward model.
//!
//! A [`PredictionModel`] provides `f(pre, n) -> cur` and its two Jacobians. The
//! [`PredictionResidual`] adapter turns it into a full [`Residual`] with
//! innovation `cur ⊟ f(pre, n)`, deriving the residual Jacobians through the
//! `⊟` Jacobians of the current state:
//!
//! ```text
//! ∂r/∂cur = Jminus_inp(cur, f)
//! ∂r/∂pre = Jminus_ref(cur, f) · ∂f/∂pre
//! ∂r/∂noi = Jminus_ref(cur, f) · ∂f/∂noi
//! ```

use std::fmt;

use nalgebra::DMatrix;

use crate::element::ElementVector;
use crate::error::FilterResult;
use crate::residual::{Residual, ResidualContext, ResidualCore};
use crate::time::TimePoint;

/// Forward model `f(pre, n) -> cur` over a shared `pre`/`cur` definition.
pub trait PredictionModel: fmt::Debug + Send {
    fn core(&self) -> &ResidualCore;

    fn core_mut(&mut self) -> &mut ResidualCore;

    /// Evaluate the forward model into `cur`.
    fn predict(
        &self,
        cur: &mut ElementVector,
        pre: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()>;

    /// Jacobian of the predicted state with respect to the `pre` tangent.
    fn predict_jac_pre(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()>;

    /// Jacobian of the predicted state with respect to the noise tangent.
    fn predict_jac_noi(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()>;

    /// Split policy for the underlying measurement stream.
    fn split_measurements(
        &self,
        _t0: TimePoint,
        _t1: TimePoint,
        _t2: TimePoint,
        meas: &ElementVector,
    ) -> FilterResult<(ElementVector, ElementVector)> {
        Ok((meas.clone(), meas.clone()))
    }

    /// Merge policy for the underlying measurement stream.
    fn merge_measurements(
        &self,
        _t0: TimePoint,
        _t1: TimePoint,
        _t2: TimePoint,
        _first: &ElementVector,
        second: &ElementVector,
    ) -> FilterResult<ElementVector> {
        Ok(second.clone())
    }
}

/// Adapter exposing a [`PredictionModel`] as a [`Residual`].
#[derive(Debug)]
pub struct PredictionResidual<P: PredictionModel> {
    model: P,
}

impl<P: PredictionModel> PredictionResidual<P> {
    pub fn new(model: P) -> Self {
        PredictionResidual { model }
    }

    pub fn model(&self) -> &P {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut P {
        &mut self.model
    }

    fn predicted(
        &self,
        pre: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<ElementVector> {
        let mut predicted = ElementVector::new(self.model.core().cur_definition().clone());
        self.model.predict(&mut predicted, pre, noi, ctx)?;
        Ok(predicted)
    }

    /// Block-diagonal `⊟` Jacobian of `cur ⊟ predicted` with respect to either
    /// argument.
    fn boxminus_jacobian(
        cur: &ElementVector,
        predicted: &ElementVector,
        with_respect_to_ref: bool,
    ) -> FilterResult<DMatrix<f64>> {
        let dim = cur.dim();
        let mut jac = DMatrix::zeros(dim, dim);
        for (i, spec) in cur.definition().specs().iter().enumerate() {
            let block = if with_respect_to_ref {
                cur.element(i).boxminus_jac_ref(predicted.element(i))?
            } else {
                cur.element(i).boxminus_jac_inp(predicted.element(i))?
            };
            jac.view_mut((spec.offset(), spec.offset()), (spec.dim(), spec.dim()))
                .copy_from(&block);
        }
        Ok(jac)
    }
}

impl<P: PredictionModel> Residual for PredictionResidual<P> {
    fn core(&self) -> &ResidualCore {
        self.model.core()
    }

    fn core_mut(&mut self) -> &mut ResidualCore {
        self.model.core_mut()
    }

    fn eval(
        &self,
        inn: &mut ElementVector,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let predicted = self.predicted(pre, noi, ctx)?;
        let tangent = cur.box_minus_owned(&predicted)?;
        let reference = ElementVector::new(self.core().inn_definition().clone());
        reference.box_plus(&tangent, inn)?;
        Ok(())
    }

    fn jac_pre(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let predicted = self.predicted(pre, noi, ctx)?;
        let d_ref = Self::boxminus_jacobian(cur, &predicted, true)?;
        let mut forward = DMatrix::zeros(
            self.core().cur_definition().dim(),
            self.core().pre_definition().dim(),
        );
        self.model.predict_jac_pre(&mut forward, pre, noi, ctx)?;
        jac.copy_from(&(d_ref * forward));
        Ok(())
    }

    fn jac_cur(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let predicted = self.predicted(pre, noi, ctx)?;
        jac.copy_from(&Self::boxminus_jacobian(cur, &predicted, false)?);
        Ok(())
    }

    fn jac_noi(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let predicted = self.predicted(pre, noi, ctx)?;
        let d_ref = Self::boxminus_jacobian(cur, &predicted, true)?;
        let mut forward = DMatrix::zeros(
            self.core().cur_definition().dim(),
            self.core().noi_definition().dim(),
        );
        self.model.predict_jac_noi(&mut forward, pre, noi, ctx)?;
        jac.copy_from(&(d_ref * forward));
        Ok(())
    }

    fn is_prediction(&self) -> bool {
        true
    }

    fn predict_initial(
        &self,
        cur: &mut ElementVector,
        pre: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<bool> {
        let noi = ElementVector::new(self.core().noi_definition().clone());
        self.model.predict(cur, pre, &noi, ctx)?;
        Ok(true)
    }

    fn split_measurements(
        &self,
        t0: TimePoint,
        t1: TimePoint,
        t2: TimePoint,
        meas: &ElementVector,
    ) -> FilterResult<(ElementVector, ElementVector)> {
        self.model.split_measurements(t0, t1, t2, meas)
    }

    fn merge_measurements(
        &self,
        t0: TimePoint,
        t1: TimePoint,
        t2: TimePoint,
        first: &ElementVector,
        second: &ElementVector,
    ) -> FilterResult<ElementVector> {
        self.model.merge_measurements(t0, t1, t2, first, second)
    }
}
