//! Concrete residuals for inertial / pose fusion.
//!
//! These build on the [`Residual`](crate::residual::Residual) and
//! [`PredictionModel`](crate::residual::PredictionModel) contracts: a generic
//! random-walk prediction over any element definition, a full IMU strapdown
//! prediction, and a pose update with sensor extrinsics.

pub mod imu_prediction;
pub mod pose_update;
pub mod random_walk;

pub use imu_prediction::ImuPrediction;
pub use pose_update::PoseUpdate;
pub use random_walk::RandomWalkPrediction;
