//! Pose update with sensor extrinsics.
//!
//! An external system reports the body pose in its own reference frame `J`.
//! The estimated state carries the body pose (`IrIM`, `qIM`) together with the
//! extrinsic calibration of that frame (`IrIJ`, `qIJ`). Predicted measurement:
//!
//! ```text
//! JrJM = R(qIJ)ᵀ · (IrIM - IrIJ)
//! qJM  = qIJ⁻¹ · qIM
//! ```
//!
//! The innovation compares prediction and measurement in the tangent:
//! `inn_pos = JrJM_pred - JrJM_meas + n_pos` and
//! `inn_att = (qJM_pred ⊟ qJM_meas) + n_att`.

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector3};

use crate::element::{ElementVector, ElementVectorDefinition};
use crate::error::FilterResult;
use crate::residual::{Residual, ResidualContext, ResidualCore};
use crate::rotation;

// Innovation / noise element indices.
const POS: usize = 0;
const ATT: usize = 1;

// Current-state element indices.
const BODY_POS: usize = 0;
const BODY_ATT: usize = 1;
const EXT_POS: usize = 2;
const EXT_ATT: usize = 3;

/// Unary update of body pose and extrinsics against an external pose source.
#[derive(Debug)]
pub struct PoseUpdate {
    core: ResidualCore,
}

impl PoseUpdate {
    pub fn new(name: &str) -> Self {
        let tangent_pair = ElementVectorDefinition::new()
            .with_element::<Vector3<f64>>("pos")
            .and_then(|d| d.with_element::<Vector3<f64>>("att"))
            .expect("innovation definition names are unique")
            .shared();
        let cur = ElementVectorDefinition::new()
            .with_element::<Vector3<f64>>("IrIM")
            .and_then(|d| d.with_element::<UnitQuaternion<f64>>("qIM"))
            .and_then(|d| d.with_element::<Vector3<f64>>("IrIJ"))
            .and_then(|d| d.with_element::<UnitQuaternion<f64>>("qIJ"))
            .expect("state definition names are unique")
            .shared();
        PoseUpdate {
            core: ResidualCore::unary(name, tangent_pair.clone(), cur, tangent_pair, false, false),
        }
    }

    /// Definition of the external pose measurement.
    pub fn measurement_definition() -> Arc<ElementVectorDefinition> {
        ElementVectorDefinition::new()
            .with_element::<Vector3<f64>>("JrJM")
            .and_then(|d| d.with_element::<UnitQuaternion<f64>>("qJM"))
            .expect("measurement definition names are unique")
            .shared()
    }

    /// Build a measurement from a reported position and attitude.
    pub fn measurement(pos: Vector3<f64>, att: UnitQuaternion<f64>) -> ElementVector {
        let mut meas = ElementVector::new(Self::measurement_definition());
        if let Ok(p) = meas.get_mut::<Vector3<f64>>("JrJM") {
            *p = pos;
        }
        if let Ok(q) = meas.get_mut::<UnitQuaternion<f64>>("qJM") {
            *q = att;
        }
        meas
    }

    fn predicted(
        &self,
        cur: &ElementVector,
    ) -> FilterResult<(Vector3<f64>, UnitQuaternion<f64>)> {
        let body_pos = cur.get::<Vector3<f64>>("IrIM")?;
        let body_att = cur.get::<UnitQuaternion<f64>>("qIM")?;
        let ext_pos = cur.get::<Vector3<f64>>("IrIJ")?;
        let ext_att = cur.get::<UnitQuaternion<f64>>("qIJ")?;
        let to_j = ext_att.to_rotation_matrix().into_inner().transpose();
        Ok((to_j * (body_pos - ext_pos), ext_att.inverse() * body_att))
    }
}

impl Residual for PoseUpdate {
    fn core(&self) -> &ResidualCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ResidualCore {
        &mut self.core
    }

    fn eval(
        &self,
        inn: &mut ElementVector,
        _pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let (pred_pos, pred_att) = self.predicted(cur)?;
        let meas_pos = ctx.meas.get::<Vector3<f64>>("JrJM")?;
        let meas_att = ctx.meas.get::<UnitQuaternion<f64>>("qJM")?;
        *inn.get_mut::<Vector3<f64>>("pos")? =
            pred_pos - meas_pos + noi.get::<Vector3<f64>>("pos")?;
        *inn.get_mut::<Vector3<f64>>("att")? =
            rotation::boxminus(&pred_att, meas_att) + noi.get::<Vector3<f64>>("att")?;
        Ok(())
    }

    fn jac_pre(
        &self,
        jac: &mut DMatrix<f64>,
        _pre: &ElementVector,
        _cur: &ElementVector,
        _noi: &ElementVector,
        _ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        jac.fill(0.0);
        Ok(())
    }

    fn jac_cur(
        &self,
        jac: &mut DMatrix<f64>,
        _pre: &ElementVector,
        cur: &ElementVector,
        _noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let body_pos = cur.get::<Vector3<f64>>("IrIM")?;
        let ext_pos = cur.get::<Vector3<f64>>("IrIJ")?;
        let ext_att = cur.get::<UnitQuaternion<f64>>("qIJ")?;
        let meas_att = ctx.meas.get::<UnitQuaternion<f64>>("qJM")?;
        let (_, pred_att) = self.predicted(cur)?;

        let to_j = ext_att.to_rotation_matrix().into_inner().transpose();
        let offset = body_pos - ext_pos;
        let gamma_inv = rotation::gamma_inverse(&rotation::boxminus(&pred_att, meas_att));

        jac.fill(0.0);
        self.core.jac_block_cur(jac, POS, BODY_POS).copy_from(&to_j);
        self.core
            .jac_block_cur(jac, POS, EXT_POS)
            .copy_from(&(-to_j));
        self.core
            .jac_block_cur(jac, POS, EXT_ATT)
            .copy_from(&(to_j * rotation::skew(&offset)));
        self.core
            .jac_block_cur(jac, ATT, BODY_ATT)
            .copy_from(&(gamma_inv * to_j));
        self.core
            .jac_block_cur(jac, ATT, EXT_ATT)
            .copy_from(&(-gamma_inv * to_j));
        Ok(())
    }

    fn jac_noi(
        &self,
        jac: &mut DMatrix<f64>,
        _pre: &ElementVector,
        _cur: &ElementVector,
        _noi: &ElementVector,
        _ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        jac.fill(0.0);
        let identity = Matrix3::identity();
        self.core.jac_block_noi(jac, POS, POS).copy_from(&identity);
        self.core.jac_block_noi(jac, ATT, ATT).copy_from(&identity);
        Ok(())
    }
}
