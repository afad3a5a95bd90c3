//! IMU strapdown prediction.
//!
//! State layout (15 tangent dimensions):
//! - `IrIM`: position of the IMU in the inertial frame
//! - `IvM`: velocity of the IMU in the inertial frame
//! - `MwM_bias` / `MfM_bias`: gyroscope and accelerometer biases
//! - `qIM`: attitude mapping body vectors into the inertial frame
//!
//! Discrete mechanisation over a sub-interval of length `dt`, driven by the
//! bound rotational-rate (`MwM`) and specific-force (`MfM`) measurement:
//!
//! ```text
//! ω = MwM - b_g - n_att/√dt            f = MfM - b_f - n_vel/√dt
//! IrIM' = IrIM + dt·IvM + √dt·n_pos
//! IvM'  = IvM + dt·(R(qIM)·f + g)
//! b'    = b + √dt·n_b                  (both biases)
//! qIM'  = qIM ⊞ dt·R(qIM)·ω
//! ```

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector3};

use crate::element::{ElementVector, ElementVectorDefinition};
use crate::error::FilterResult;
use crate::residual::{PredictionModel, PredictionResidual, ResidualContext, ResidualCore};
use crate::rotation;

const GRAVITY: f64 = 9.81;

// Element indices shared by the state and noise definitions.
const POS: usize = 0;
const VEL: usize = 1;
const GYB: usize = 2;
const ACB: usize = 3;
const ATT: usize = 4;

/// Inertial strapdown forward model.
#[derive(Debug)]
pub struct ImuPrediction {
    core: ResidualCore,
    gravity: Vector3<f64>,
}

impl ImuPrediction {
    pub fn new(name: &str) -> Self {
        let state = Self::state_definition();
        let noise = ElementVectorDefinition::new()
            .with_element::<Vector3<f64>>("pos")
            .and_then(|d| d.with_element::<Vector3<f64>>("vel"))
            .and_then(|d| d.with_element::<Vector3<f64>>("gyb"))
            .and_then(|d| d.with_element::<Vector3<f64>>("acb"))
            .and_then(|d| d.with_element::<Vector3<f64>>("att"))
            .expect("noise definition names are unique")
            .shared();
        ImuPrediction {
            core: ResidualCore::new(name, state.clone(), state.clone(), state, noise, true, true),
            gravity: Vector3::new(0.0, 0.0, -GRAVITY),
        }
    }

    /// Joint state definition contributed by this residual.
    pub fn state_definition() -> Arc<ElementVectorDefinition> {
        ElementVectorDefinition::new()
            .with_element::<Vector3<f64>>("IrIM")
            .and_then(|d| d.with_element::<Vector3<f64>>("IvM"))
            .and_then(|d| d.with_element::<Vector3<f64>>("MwM_bias"))
            .and_then(|d| d.with_element::<Vector3<f64>>("MfM_bias"))
            .and_then(|d| d.with_element::<UnitQuaternion<f64>>("qIM"))
            .expect("state definition names are unique")
            .shared()
    }

    /// Definition of the rotational-rate / specific-force measurement.
    pub fn measurement_definition() -> Arc<ElementVectorDefinition> {
        ElementVectorDefinition::new()
            .with_element::<Vector3<f64>>("MwM")
            .and_then(|d| d.with_element::<Vector3<f64>>("MfM"))
            .expect("measurement definition names are unique")
            .shared()
    }

    /// Build a measurement from gyroscope and accelerometer readings.
    pub fn measurement(gyr: Vector3<f64>, acc: Vector3<f64>) -> ElementVector {
        let mut meas = ElementVector::new(Self::measurement_definition());
        if let Ok(w) = meas.get_mut::<Vector3<f64>>("MwM") {
            *w = gyr;
        }
        if let Ok(f) = meas.get_mut::<Vector3<f64>>("MfM") {
            *f = acc;
        }
        meas
    }

    pub fn into_residual(self) -> PredictionResidual<ImuPrediction> {
        PredictionResidual::new(self)
    }

    /// Noise-corrected rates at the current evaluation point.
    fn corrected_rates(
        &self,
        pre: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<(Vector3<f64>, Vector3<f64>)> {
        let sqrt_dt_inv = 1.0 / ctx.dt.sqrt();
        let omega = ctx.meas.get::<Vector3<f64>>("MwM")?
            - pre.get::<Vector3<f64>>("MwM_bias")?
            - sqrt_dt_inv * noi.get::<Vector3<f64>>("att")?;
        let force = ctx.meas.get::<Vector3<f64>>("MfM")?
            - pre.get::<Vector3<f64>>("MfM_bias")?
            - sqrt_dt_inv * noi.get::<Vector3<f64>>("vel")?;
        Ok((omega, force))
    }
}

impl PredictionModel for ImuPrediction {
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
        let dt = ctx.dt;
        let (omega, force) = self.corrected_rates(pre, noi, ctx)?;
        let q = pre.get::<UnitQuaternion<f64>>("qIM")?;
        let rot = q.to_rotation_matrix().into_inner();

        *cur.get_mut::<Vector3<f64>>("IrIM")? = pre.get::<Vector3<f64>>("IrIM")?
            + dt * pre.get::<Vector3<f64>>("IvM")?
            + dt.sqrt() * noi.get::<Vector3<f64>>("pos")?;
        *cur.get_mut::<Vector3<f64>>("IvM")? =
            pre.get::<Vector3<f64>>("IvM")? + dt * (rot * force + self.gravity);
        *cur.get_mut::<Vector3<f64>>("MwM_bias")? =
            pre.get::<Vector3<f64>>("MwM_bias")? + dt.sqrt() * noi.get::<Vector3<f64>>("gyb")?;
        *cur.get_mut::<Vector3<f64>>("MfM_bias")? =
            pre.get::<Vector3<f64>>("MfM_bias")? + dt.sqrt() * noi.get::<Vector3<f64>>("acb")?;
        *cur.get_mut::<UnitQuaternion<f64>>("qIM")? =
            rotation::boxplus(q, &(dt * (rot * omega)));
        Ok(())
    }

    fn predict_jac_pre(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let dt = ctx.dt;
        let (omega, force) = self.corrected_rates(pre, noi, ctx)?;
        let q = pre.get::<UnitQuaternion<f64>>("qIM")?;
        let rot = q.to_rotation_matrix().into_inner();
        let v = dt * (rot * omega);
        let gamma = rotation::gamma_matrix(&v);
        let identity = Matrix3::identity();

        jac.fill(0.0);
        self.core.jac_block_pre(jac, POS, POS).copy_from(&identity);
        self.core
            .jac_block_pre(jac, POS, VEL)
            .copy_from(&(dt * identity));

        self.core.jac_block_pre(jac, VEL, VEL).copy_from(&identity);
        self.core
            .jac_block_pre(jac, VEL, ACB)
            .copy_from(&(-dt * rot));
        self.core
            .jac_block_pre(jac, VEL, ATT)
            .copy_from(&(-dt * rotation::skew(&(rot * force))));

        self.core.jac_block_pre(jac, GYB, GYB).copy_from(&identity);
        self.core.jac_block_pre(jac, ACB, ACB).copy_from(&identity);

        self.core
            .jac_block_pre(jac, ATT, GYB)
            .copy_from(&(-dt * gamma * rot));
        let att_att = rotation::exp_map(&v).to_rotation_matrix().into_inner()
            - dt * gamma * rotation::skew(&(rot * omega));
        self.core.jac_block_pre(jac, ATT, ATT).copy_from(&att_att);
        Ok(())
    }

    fn predict_jac_noi(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let dt = ctx.dt;
        let sqrt_dt = dt.sqrt();
        let (omega, _) = self.corrected_rates(pre, noi, ctx)?;
        let q = pre.get::<UnitQuaternion<f64>>("qIM")?;
        let rot = q.to_rotation_matrix().into_inner();
        let v = dt * (rot * omega);
        let gamma = rotation::gamma_matrix(&v);
        let identity = Matrix3::identity();

        jac.fill(0.0);
        self.core
            .jac_block_noi(jac, POS, POS)
            .copy_from(&(sqrt_dt * identity));
        self.core
            .jac_block_noi(jac, VEL, VEL)
            .copy_from(&(-sqrt_dt * rot));
        self.core
            .jac_block_noi(jac, GYB, GYB)
            .copy_from(&(sqrt_dt * identity));
        self.core
            .jac_block_noi(jac, ACB, ACB)
            .copy_from(&(sqrt_dt * identity));
        self.core
            .jac_block_noi(jac, ATT, ATT)
            .copy_from(&(-sqrt_dt * gamma * rot));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::Residual;
    use nalgebra::DVector;

    #[test]
    fn stationary_imu_predicts_no_motion() {
        let res = ImuPrediction::new("imu_pre").into_residual();
        let meas = ImuPrediction::measurement(Vector3::zeros(), Vector3::new(0.0, 0.0, GRAVITY));
        let ctx = ResidualContext::new(&meas, 0.1);

        let pre = ElementVector::new(res.core().pre_definition().clone());
        let mut cur = ElementVector::new(res.core().cur_definition().clone());
        res.predict_initial(&mut cur, &pre, &ctx).unwrap();
        assert!(cur.box_minus_owned(&pre).unwrap().norm() < 1e-12);
    }

    #[test]
    fn gravity_is_reintroduced_when_tilted() {
        let res = ImuPrediction::new("imu_pre").into_residual();
        // Zero specific force means free fall: velocity integrates gravity.
        let meas = ImuPrediction::measurement(Vector3::zeros(), Vector3::zeros());
        let ctx = ResidualContext::new(&meas, 0.1);

        let pre = ElementVector::new(res.core().pre_definition().clone());
        let mut cur = ElementVector::new(res.core().cur_definition().clone());
        res.predict_initial(&mut cur, &pre, &ctx).unwrap();
        let vel = cur.get::<Vector3<f64>>("IvM").unwrap();
        assert!((vel.z - (-GRAVITY * 0.1)).abs() < 1e-12);
    }

    #[test]
    fn jacobians_match_finite_differences() {
        let res = ImuPrediction::new("imu_pre").into_residual();
        let meas =
            ImuPrediction::measurement(Vector3::new(0.3, -0.1, 0.2), Vector3::new(0.5, 0.2, 9.6));
        let ctx = ResidualContext::new(&meas, 0.1);

        let mut pre = ElementVector::new(res.core().pre_definition().clone());
        *pre.get_mut::<Vector3<f64>>("IrIM").unwrap() = Vector3::new(1.0, -2.0, 0.5);
        *pre.get_mut::<Vector3<f64>>("IvM").unwrap() = Vector3::new(0.4, 0.1, -0.3);
        *pre.get_mut::<Vector3<f64>>("MwM_bias").unwrap() = Vector3::new(0.01, -0.02, 0.005);
        *pre.get_mut::<Vector3<f64>>("MfM_bias").unwrap() = Vector3::new(-0.03, 0.01, 0.02);
        *pre.get_mut::<UnitQuaternion<f64>>("qIM").unwrap() =
            UnitQuaternion::from_euler_angles(0.2, -0.4, 0.6);

        let mut cur = pre.clone();
        let mut step = DVector::zeros(15);
        for i in 0..15 {
            step[i] = 0.01 * ((i % 5) as f64 - 2.0);
        }
        cur.box_plus_assign(&step).unwrap();
        let mut noi = ElementVector::new(res.core().noi_definition().clone());
        let mut noise_step = DVector::zeros(15);
        for i in 0..15 {
            noise_step[i] = 0.002 * ((i % 7) as f64 - 3.0);
        }
        noi.box_plus_assign(&noise_step).unwrap();

        res.test_jacobians(&pre, &cur, &noi, &ctx, 1e-6, 1e-6).unwrap();
    }
}
