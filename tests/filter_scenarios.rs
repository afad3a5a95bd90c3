//! End-to-end filter scenarios: multi-channel scheduling, break-point
//! alignment, and the information-form Gauss-Newton update.

use std::sync::Arc;

use nalgebra::{Cholesky, DMatrix, Matrix3, UnitQuaternion, Vector3};

use manifold_filter::element::{ElementVector, ElementVectorDefinition};
use manifold_filter::error::{FilterError, FilterResult};
use manifold_filter::residual::{
    PredictionModel, PredictionResidual, Residual, ResidualContext, ResidualCore,
};
use manifold_filter::residuals::{ImuPrediction, PoseUpdate, RandomWalkPrediction};
use manifold_filter::time::{Duration, TimePoint};
use manifold_filter::{Filter, FilterConfig};

fn tp(sec: f64) -> TimePoint {
    TimePoint::from_nanos(0) + Duration::from_sec(sec)
}

fn sec(s: f64) -> Duration {
    Duration::from_sec(s)
}

fn vec3_definition(names: &[&str]) -> Arc<ElementVectorDefinition> {
    let mut def = ElementVectorDefinition::new();
    for name in names {
        def.add_element::<Vector3<f64>>(name).unwrap();
    }
    def.shared()
}

fn empty_measurement() -> Arc<ElementVector> {
    Arc::new(ElementVector::empty())
}

fn acc_measurement(x: f64) -> Arc<ElementVector> {
    let def = vec3_definition(&["acc"]);
    let mut meas = ElementVector::new(def);
    *meas.get_mut::<Vector3<f64>>("acc").unwrap() = Vector3::new(x, 0.0, 0.0);
    Arc::new(meas)
}

/// Kinematic coupling `pos_cur = pos_pre + dt * vel_pre`.
#[derive(Debug)]
struct VelocityResidual {
    core: ResidualCore,
}

impl VelocityResidual {
    fn new() -> Self {
        VelocityResidual {
            core: ResidualCore::new(
                "vel_res",
                vec3_definition(&["pos"]),
                vec3_definition(&["pos", "vel"]),
                vec3_definition(&["pos"]),
                vec3_definition(&["pos"]),
                false,
                false,
            ),
        }
    }
}

impl Residual for VelocityResidual {
    fn core(&self) -> &ResidualCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ResidualCore {
        &mut self.core
    }

    fn eval(
        &self,
        inn: &mut ElementVector,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        *inn.get_mut::<Vector3<f64>>("pos")? = pre.get::<Vector3<f64>>("pos")?
            + ctx.dt * pre.get::<Vector3<f64>>("vel")?
            - cur.get::<Vector3<f64>>("pos")?
            + noi.get::<Vector3<f64>>("pos")?;
        Ok(())
    }

    fn jac_pre(
        &self,
        jac: &mut DMatrix<f64>,
        _pre: &ElementVector,
        _cur: &ElementVector,
        _noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        jac.fill(0.0);
        self.core
            .jac_block_pre(jac, 0, 0)
            .copy_from(&Matrix3::identity());
        self.core
            .jac_block_pre(jac, 0, 1)
            .copy_from(&(ctx.dt * Matrix3::identity()));
        Ok(())
    }

    fn jac_cur(
        &self,
        jac: &mut DMatrix<f64>,
        _pre: &ElementVector,
        _cur: &ElementVector,
        _noi: &ElementVector,
        _ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        jac.fill(0.0);
        self.core
            .jac_block_cur(jac, 0, 0)
            .copy_from(&(-Matrix3::identity()));
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
        self.core
            .jac_block_noi(jac, 0, 0)
            .copy_from(&Matrix3::identity());
        Ok(())
    }
}

/// Accelerometer coupling `vel_cur = vel_pre + dt * acc`.
#[derive(Debug)]
struct AccelerometerResidual {
    core: ResidualCore,
}

impl AccelerometerResidual {
    fn new() -> Self {
        let vel = vec3_definition(&["vel"]);
        AccelerometerResidual {
            core: ResidualCore::new("acc_res", vel.clone(), vel.clone(), vel.clone(), vel, true, true),
        }
    }
}

impl Residual for AccelerometerResidual {
    fn core(&self) -> &ResidualCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ResidualCore {
        &mut self.core
    }

    fn eval(
        &self,
        inn: &mut ElementVector,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        let acc = ctx.meas.get::<Vector3<f64>>("acc")?;
        *inn.get_mut::<Vector3<f64>>("vel")? = pre.get::<Vector3<f64>>("vel")?
            + ctx.dt * acc
            - cur.get::<Vector3<f64>>("vel")?
            + noi.get::<Vector3<f64>>("vel")?;
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
        self.core
            .jac_block_pre(jac, 0, 0)
            .copy_from(&Matrix3::identity());
        Ok(())
    }

    fn jac_cur(
        &self,
        jac: &mut DMatrix<f64>,
        _pre: &ElementVector,
        _cur: &ElementVector,
        _noi: &ElementVector,
        _ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        jac.fill(0.0);
        self.core
            .jac_block_cur(jac, 0, 0)
            .copy_from(&(-Matrix3::identity()));
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
        self.core
            .jac_block_noi(jac, 0, 0)
            .copy_from(&Matrix3::identity());
        Ok(())
    }
}

/// Prediction integrating a measured rate: `pos_cur = pos_pre + dt * rate + n`.
/// Splittable but not mergeable, so its measurement times pin break points.
#[derive(Debug)]
struct RatePrediction {
    core: ResidualCore,
}

impl RatePrediction {
    fn new(name: &str) -> Self {
        let pos = vec3_definition(&["pos"]);
        RatePrediction {
            core: ResidualCore::new(name, pos.clone(), pos.clone(), pos.clone(), pos, true, false),
        }
    }

    fn measurement(rate: Vector3<f64>) -> Arc<ElementVector> {
        let mut meas = ElementVector::new(vec3_definition(&["rate"]));
        *meas.get_mut::<Vector3<f64>>("rate").unwrap() = rate;
        Arc::new(meas)
    }
}

impl PredictionModel for RatePrediction {
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
        let rate = ctx.meas.get::<Vector3<f64>>("rate")?;
        *cur.get_mut::<Vector3<f64>>("pos")? =
            pre.get::<Vector3<f64>>("pos")? + ctx.dt * rate + noi.get::<Vector3<f64>>("pos")?;
        Ok(())
    }

    fn predict_jac_pre(
        &self,
        jac: &mut DMatrix<f64>,
        _pre: &ElementVector,
        _noi: &ElementVector,
        _ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        jac.fill(0.0);
        jac.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&Matrix3::identity());
        Ok(())
    }

    fn predict_jac_noi(
        &self,
        jac: &mut DMatrix<f64>,
        _pre: &ElementVector,
        _noi: &ElementVector,
        _ctx: &ResidualContext<'_>,
    ) -> FilterResult<()> {
        jac.fill(0.0);
        jac.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&Matrix3::identity());
        Ok(())
    }
}

/// Velocity + accelerometer fusion on two update-style channels.
#[test]
fn velocity_accelerometer_filter_advances_and_integrates() {
    let mut filter = Filter::default();
    let vel_ch = filter
        .add_residual(Box::new(VelocityResidual::new()), sec(0.1), Duration::ZERO)
        .unwrap();
    let acc_ch = filter
        .add_residual(
            Box::new(AccelerometerResidual::new()),
            sec(0.1),
            Duration::ZERO,
        )
        .unwrap();
    assert_eq!(filter.state_definition().dim(), 6);

    for t in [-0.1, 0.0, 0.2, 0.3, 0.4] {
        filter
            .add_measurement(vel_ch, empty_measurement(), tp(t))
            .unwrap();
    }
    for (t, a) in [(-0.1, -0.1), (0.0, 0.0), (0.1, 0.1), (0.3, 0.4), (0.5, 0.3)] {
        filter.add_measurement(acc_ch, acc_measurement(a), tp(t)).unwrap();
    }

    let connectivity = filter.print_connectivity();
    assert!(connectivity.contains("vel_res"));
    assert!(connectivity.contains("acc_res"));

    filter.update_at(tp(0.5)).unwrap();
    // Horizon: the velocity channel caps the update at its newest measurement.
    assert_eq!(filter.time(), tp(0.4));
    let vel_x = filter.state().get::<Vector3<f64>>("vel").unwrap().x;
    assert!(
        vel_x > 0.05,
        "velocity should integrate the positive acceleration, got {vel_x}"
    );

    // No new measurements below the horizon: the second call is a no-op.
    let state_before = filter.state().clone();
    filter.update_at(tp(0.5)).unwrap();
    assert_eq!(filter.time(), tp(0.4));
    let drift = filter
        .state()
        .box_minus_owned(&state_before)
        .unwrap()
        .norm();
    assert!(drift < 1e-12, "idempotent update drifted by {drift}");
}

/// IMU prediction + extrinsic random walk + pose update over ten cycles.
#[test]
fn imu_pose_filter_converges_and_keeps_extrinsics_bounded() {
    let mut filter = Filter::new(FilterConfig::default());

    let mut imu = ImuPrediction::new("imu_pre").into_residual();
    *imu.core_mut().noise_covariance_mut() *= 1e-4;
    let imu_ch = filter.add_residual(Box::new(imu), sec(0.1), Duration::ZERO).unwrap();

    let extrinsics = ElementVectorDefinition::new()
        .with_element::<Vector3<f64>>("IrIJ")
        .unwrap()
        .with_element::<UnitQuaternion<f64>>("qIJ")
        .unwrap()
        .shared();
    let mut ext = RandomWalkPrediction::new("ext_pre", extrinsics).into_residual();
    *ext.core_mut().noise_covariance_mut() *= 1e-4;
    let ext_ch = filter.add_residual(Box::new(ext), sec(0.1), Duration::ZERO).unwrap();

    let mut pose = PoseUpdate::new("pose_upd");
    *pose.core_mut().noise_covariance_mut() *= 1e-4;
    let pose_ch = filter.add_residual(Box::new(pose), sec(0.1), Duration::ZERO).unwrap();

    assert_eq!(filter.state_definition().dim(), 21);

    let stationary = || {
        Arc::new(ImuPrediction::measurement(
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, 9.81),
        ))
    };
    let consistent_pose =
        || Arc::new(PoseUpdate::measurement(Vector3::zeros(), UnitQuaternion::identity()));

    // Baselines for both prediction channels.
    filter.add_measurement(imu_ch, stationary(), tp(0.0)).unwrap();
    filter.add_measurement(ext_ch, empty_measurement(), tp(0.0)).unwrap();
    filter.update_at(tp(0.0)).unwrap();

    for i in 1..=10 {
        let t = 0.1 * i as f64;
        filter.add_measurement(imu_ch, stationary(), tp(t)).unwrap();
        filter.update_at(tp(t)).unwrap();

        filter
            .add_measurement(pose_ch, consistent_pose(), tp(t + 0.05))
            .unwrap();
        filter
            .add_measurement(ext_ch, empty_measurement(), tp(t + 0.05))
            .unwrap();
        filter.update_at(tp(t + 0.05)).unwrap();
    }

    // Ten cycles at 0.1 s; the final horizon trails the last pose/ext pair.
    assert_eq!(filter.time(), tp(1.0));

    let state = filter.state();
    assert!(state.get::<Vector3<f64>>("IvM").unwrap().norm() < 1e-3);
    assert!(state.get::<Vector3<f64>>("IrIM").unwrap().norm() < 1e-3);
    assert!(
        state.get::<Vector3<f64>>("IrIJ").unwrap().norm() < 1e-3,
        "extrinsic translation must stay bounded"
    );
    assert!(
        Cholesky::new(filter.information().clone()).is_some(),
        "posterior information must stay positive definite"
    );
}

/// First measurement of a prediction channel is only a baseline.
#[test]
fn drop_first_prediction_channel_rejects_reused_timestamp() {
    let mut filter = Filter::default();
    let ch = filter
        .add_residual(
            Box::new(PredictionResidual::new(RatePrediction::new("rate_pre"))),
            sec(0.1),
            Duration::ZERO,
        )
        .unwrap();

    filter
        .add_measurement(ch, RatePrediction::measurement(Vector3::x()), tp(0.0))
        .unwrap();
    // Same timestamp again: the baseline consumed it.
    let err = filter.add_measurement(ch, RatePrediction::measurement(Vector3::x()), tp(0.0));
    assert!(matches!(err, Err(FilterError::Timeline(_))));
    // Later timestamps are accepted.
    filter
        .add_measurement(ch, RatePrediction::measurement(Vector3::x()), tp(0.1))
        .unwrap();
}

/// Two prediction channels at different rates share every break point after
/// alignment; the state is propagated through all sub-intervals.
#[test]
fn split_coverage_aligns_two_prediction_rates() {
    let mut filter = Filter::default();
    let slow_ch = filter
        .add_residual(
            Box::new(PredictionResidual::new(RatePrediction::new("rate_10hz"))),
            sec(0.1),
            Duration::ZERO,
        )
        .unwrap();
    let fast_ch = filter
        .add_residual(
            Box::new(PredictionResidual::new(RatePrediction::new("rate_20hz"))),
            sec(0.1),
            Duration::ZERO,
        )
        .unwrap();

    let rate = Vector3::new(1.0, 0.0, 0.0);
    // Baselines.
    filter.add_measurement(slow_ch, RatePrediction::measurement(rate), tp(0.0)).unwrap();
    filter.add_measurement(fast_ch, RatePrediction::measurement(rate), tp(0.0)).unwrap();
    for t in [0.1, 0.2] {
        filter.add_measurement(slow_ch, RatePrediction::measurement(rate), tp(t)).unwrap();
    }
    for t in [0.05, 0.1, 0.15, 0.2] {
        filter.add_measurement(fast_ch, RatePrediction::measurement(rate), tp(t)).unwrap();
    }

    filter.update_at(tp(0.25)).unwrap();
    assert_eq!(filter.time(), tp(0.2));

    // Both channels constrained every sub-interval, so the integrated rate
    // covers the whole 200 ms horizon.
    let pos = filter.state().get::<Vector3<f64>>("pos").unwrap();
    assert!(
        (pos.x - 0.2).abs() < 1e-6,
        "rate must integrate across all sub-intervals, got {}",
        pos.x
    );
}

/// A numeric failure surfaces to the caller and leaves the estimate untouched.
#[test]
fn numeric_failure_leaves_state_unchanged() {
    let mut filter = Filter::default();
    let mut residual = AccelerometerResidual::new();
    // Degenerate noise covariance: the projected weight cannot be formed.
    *residual.core_mut().noise_covariance_mut() *= 0.0;
    let ch = filter
        .add_residual(Box::new(residual), sec(0.1), Duration::ZERO)
        .unwrap();

    filter.add_measurement(ch, acc_measurement(1.0), tp(0.0)).unwrap();
    filter.add_measurement(ch, acc_measurement(1.0), tp(0.1)).unwrap();

    let err = filter.update_at(tp(0.25));
    assert!(matches!(err, Err(FilterError::Numeric(_))));
    // The working copies were discarded: the state time is still the
    // initialisation time and the estimate is identity.
    assert_eq!(filter.time(), tp(0.0));
    assert!(
        filter
            .state()
            .get::<Vector3<f64>>("vel")
            .unwrap()
            .norm()
            < 1e-12
    );
}
