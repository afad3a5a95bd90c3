//! # Manifold Filter
//!
//! A modular, time-aligned recursive state estimator that fuses heterogeneous
//! sensor measurements over manifold-valued states with an information-form
//! iterated Gauss-Newton update. Designed for robotic state estimation
//! (inertial / pose / kinematic fusion) where state components live on mixed
//! manifolds and measurements arrive asynchronously on multiple channels.
//!
//! ## Architecture
//!
//! - [`element`]: manifold element traits (`⊞`, `⊟`, Jacobians) and the named
//!   heterogeneous [`ElementVector`] with flat tangent indexing
//! - [`transformation`]: typed maps between element definitions with analytic
//!   Jacobians and covariance propagation
//! - [`residual`]: binary residual contracts, block Jacobian accessors, and
//!   the mechanically-derived prediction residuals
//! - [`residuals`]: concrete residuals: random-walk, IMU strapdown, pose
//!   update with extrinsics
//! - [`timeline`]: per-channel time-ordered measurement stores with
//!   split/merge alignment policies
//! - [`filter`]: the multi-channel scheduler and information-form estimator

pub mod element;
pub mod error;
pub mod filter;
pub mod logger;
pub mod random;
pub mod residual;
pub mod residuals;
pub mod rotation;
pub mod time;
pub mod timeline;
pub mod transformation;

pub use element::{
    Constant, ElementBase, ElementError, ElementTraits, ElementVector, ElementVectorDefinition,
};
pub use error::{FilterError, FilterResult};
pub use filter::{Filter, FilterConfig};
pub use logger::{init_logger, init_logger_with_level};
pub use random::GaussianSampler;
pub use residual::{
    PredictionModel, PredictionResidual, Residual, ResidualContext, ResidualCore,
};
pub use time::{Clock, Duration, TimePoint};
pub use timeline::{Measurement, MeasurementTimeline, TimelineError};
pub use transformation::Transformation;
