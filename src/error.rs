//! Error types for the manifold-filter library.
//!
//! Module-specific errors (`ElementError`, `TimelineError`) convert into the
//! crate-level [`FilterError`] via `From`, so filter code can use `?` across
//! layer boundaries.

use thiserror::Error;

use crate::element::ElementError;
use crate::timeline::TimelineError;

/// Main result type used throughout the library.
pub type FilterResult<T> = Result<T, FilterError>;

/// Crate-level error type.
#[derive(Debug, Clone, Error)]
pub enum FilterError {
    /// Definition, lookup, or dimension problems on element vectors.
    #[error(transparent)]
    Element(#[from] ElementError),

    /// Measurement ordering or split/merge range problems.
    #[error(transparent)]
    Timeline(#[from] TimelineError),

    /// Non-SPD matrices, failed factorisations, and similar numerical faults.
    #[error("numeric error: {0}")]
    Numeric(String),

    /// The Gauss-Newton iteration did not reach the tangent tolerance.
    #[error(
        "update did not converge within {max_iterations} iterations \
         (last step norm {step_norm:.3e})"
    )]
    NonConvergence {
        max_iterations: usize,
        step_norm: f64,
    },

    /// A residual was evaluated without a measurement on its channel.
    #[error("no measurement bound for residual '{0}'")]
    UnboundMeasurement(String),

    /// Invalid configuration or call arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Raise a programmer error: log a diagnostic, abort in debug builds, and
/// surface the typed error otherwise.
///
/// Definition misuse, dimension mismatches, and unbound measurements are
/// caller bugs, so debug builds fail fast at the raise site. The crate's own
/// test harness is exempt so the `Err` path stays observable; recoverable
/// conditions (timeline ordering, split/merge ranges, numeric failures) go
/// through plain `Err` returns instead.
macro_rules! programmer_error {
    ($err:expr) => {{
        let err = $err;
        tracing::error!(%err, "programmer error");
        #[cfg(not(test))]
        debug_assert!(false, "programmer error: {err}");
        return Err(err.into());
    }};
}

pub(crate) use programmer_error;
