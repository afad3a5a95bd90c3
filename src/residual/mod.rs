//! Residual contracts and their Jacobian plumbing.
//!
//! A [`Residual`] relates the state before a sub-interval (`pre`), the state at
//! its end (`cur`), and a noise vector (`noi`) to an innovation element vector
//! (`inn`): `r = R(pre, cur, n; meas)`. The four element-vector definitions and
//! all per-residual bookkeeping (flags, noise covariance, robust threshold) live
//! in [`ResidualCore`]; concrete residuals embed one and implement the
//! evaluation and the three analytic Jacobians.
//!
//! Measurements are handed in per call through [`ResidualContext`]; residuals
//! never retain a pointer to them between calls.

pub mod prediction;

pub use prediction::{PredictionModel, PredictionResidual};

use std::fmt;
use std::sync::Arc;

use nalgebra::{DMatrix, DMatrixViewMut, DVector};
use tracing::warn;

use crate::element::{ElementVector, ElementVectorDefinition};
use crate::error::{FilterError, FilterResult};
use crate::time::TimePoint;

/// Per-call evaluation context: the bound measurement and the sub-interval
/// length in seconds.
pub struct ResidualContext<'a> {
    pub meas: &'a ElementVector,
    pub dt: f64,
}

impl<'a> ResidualContext<'a> {
    pub fn new(meas: &'a ElementVector, dt: f64) -> Self {
        ResidualContext { meas, dt }
    }
}

/// Definitions, flags, and noise bookkeeping shared by every residual.
#[derive(Debug, Clone)]
pub struct ResidualCore {
    name: String,
    inn: Arc<ElementVectorDefinition>,
    pre: Arc<ElementVectorDefinition>,
    cur: Arc<ElementVectorDefinition>,
    noi: Arc<ElementVectorDefinition>,
    splittable: bool,
    mergeable: bool,
    noise_covariance: DMatrix<f64>,
    huber_threshold: f64,
}

impl ResidualCore {
    pub fn new(
        name: &str,
        inn: Arc<ElementVectorDefinition>,
        pre: Arc<ElementVectorDefinition>,
        cur: Arc<ElementVectorDefinition>,
        noi: Arc<ElementVectorDefinition>,
        splittable: bool,
        mergeable: bool,
    ) -> Self {
        let noi_dim = noi.dim();
        ResidualCore {
            name: name.to_string(),
            inn,
            pre,
            cur,
            noi,
            splittable,
            mergeable,
            noise_covariance: DMatrix::identity(noi_dim, noi_dim),
            huber_threshold: -1.0,
        }
    }

    /// Core of an update residual: empty `pre` definition.
    pub fn unary(
        name: &str,
        inn: Arc<ElementVectorDefinition>,
        cur: Arc<ElementVectorDefinition>,
        noi: Arc<ElementVectorDefinition>,
        splittable: bool,
        mergeable: bool,
    ) -> Self {
        Self::new(
            name,
            inn,
            ElementVectorDefinition::empty(),
            cur,
            noi,
            splittable,
            mergeable,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inn_definition(&self) -> &Arc<ElementVectorDefinition> {
        &self.inn
    }

    pub fn pre_definition(&self) -> &Arc<ElementVectorDefinition> {
        &self.pre
    }

    pub fn cur_definition(&self) -> &Arc<ElementVectorDefinition> {
        &self.cur
    }

    pub fn noi_definition(&self) -> &Arc<ElementVectorDefinition> {
        &self.noi
    }

    /// Residuals with an empty `pre` definition depend on the current state only.
    pub fn is_unary(&self) -> bool {
        self.pre.is_empty()
    }

    pub fn is_splittable(&self) -> bool {
        self.splittable
    }

    pub fn is_mergeable(&self) -> bool {
        self.mergeable
    }

    pub fn noise_covariance(&self) -> &DMatrix<f64> {
        &self.noise_covariance
    }

    /// Mutable access, e.g. `*res.core_mut().noise_covariance_mut() *= 1e-8`.
    pub fn noise_covariance_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.noise_covariance
    }

    /// Replace the noise covariance; must be square of the noise dimension and
    /// symmetric positive definite.
    pub fn set_noise_covariance(&mut self, covariance: DMatrix<f64>) -> FilterResult<()> {
        let noi_dim = self.noi.dim();
        if covariance.nrows() != noi_dim || covariance.ncols() != noi_dim {
            return Err(FilterError::InvalidInput(format!(
                "noise covariance of '{}' must be {noi_dim}x{noi_dim}, got {}x{}",
                self.name,
                covariance.nrows(),
                covariance.ncols()
            )));
        }
        if noi_dim > 0 && nalgebra::Cholesky::new(covariance.clone()).is_none() {
            return Err(FilterError::Numeric(format!(
                "noise covariance of '{}' is not positive definite",
                self.name
            )));
        }
        self.noise_covariance = covariance;
        Ok(())
    }

    /// Huber threshold for the default noise weighting; negative disables it.
    pub fn huber_threshold(&self) -> f64 {
        self.huber_threshold
    }

    pub fn set_huber_threshold(&mut self, threshold: f64) {
        self.huber_threshold = threshold;
    }

    /// Jacobian sub-block of innovation element `inn_idx` with respect to `pre`
    /// element `pre_idx`.
    pub fn jac_block_pre<'a>(
        &self,
        jac: &'a mut DMatrix<f64>,
        inn_idx: usize,
        pre_idx: usize,
    ) -> DMatrixViewMut<'a, f64> {
        Self::block(jac, &self.inn, inn_idx, &self.pre, pre_idx)
    }

    pub fn jac_block_cur<'a>(
        &self,
        jac: &'a mut DMatrix<f64>,
        inn_idx: usize,
        cur_idx: usize,
    ) -> DMatrixViewMut<'a, f64> {
        Self::block(jac, &self.inn, inn_idx, &self.cur, cur_idx)
    }

    pub fn jac_block_noi<'a>(
        &self,
        jac: &'a mut DMatrix<f64>,
        inn_idx: usize,
        noi_idx: usize,
    ) -> DMatrixViewMut<'a, f64> {
        Self::block(jac, &self.inn, inn_idx, &self.noi, noi_idx)
    }

    fn block<'a>(
        jac: &'a mut DMatrix<f64>,
        rows: &ElementVectorDefinition,
        row_idx: usize,
        cols: &ElementVectorDefinition,
        col_idx: usize,
    ) -> DMatrixViewMut<'a, f64> {
        let row_spec = rows.spec(row_idx);
        let col_spec = cols.spec(col_idx);
        jac.view_mut(
            (row_spec.offset(), col_spec.offset()),
            (row_spec.dim(), col_spec.dim()),
        )
    }
}

/// Binary residual contract: evaluation plus analytic Jacobians with respect to
/// each argument.
///
/// `jac_pre`/`jac_cur`/`jac_noi` fill a matrix with `inn.dim()` rows and the
/// tangent dimension of the respective argument as columns; both sides are in
/// tangent coordinates (the innovation is compared against its identity).
pub trait Residual: fmt::Debug + Send {
    fn core(&self) -> &ResidualCore;

    fn core_mut(&mut self) -> &mut ResidualCore;

    fn eval(
        &self,
        inn: &mut ElementVector,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()>;

    fn jac_pre(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()>;

    fn jac_cur(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()>;

    fn jac_noi(
        &self,
        jac: &mut DMatrix<f64>,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<()>;

    /// Prediction residuals are consumed across every sub-interval of an update
    /// and drive the break-point alignment.
    fn is_prediction(&self) -> bool {
        false
    }

    /// Seed `cur` from `pre` with zero noise where the residual can predict;
    /// returns whether anything was written.
    fn predict_initial(
        &self,
        _cur: &mut ElementVector,
        _pre: &ElementVector,
        _ctx: &ResidualContext<'_>,
    ) -> FilterResult<bool> {
        Ok(false)
    }

    /// Produce sub-measurements at `t1` and `t2` from one spanning `[t0, t2]`.
    fn split_measurements(
        &self,
        _t0: TimePoint,
        _t1: TimePoint,
        _t2: TimePoint,
        meas: &ElementVector,
    ) -> FilterResult<(ElementVector, ElementVector)> {
        Ok((meas.clone(), meas.clone()))
    }

    /// Combine measurements at `t1` and `t2` into one spanning `[t0, t2]`.
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

    /// Row weight in `(0, 1]` applied to the whitened system; `inn` is the
    /// innovation in tangent coordinates. The default applies a Huber weight per
    /// innovation element when the core's threshold is enabled.
    fn noise_weighting(&self, inn: &DVector<f64>, row: usize) -> f64 {
        let threshold = self.core().huber_threshold();
        if threshold < 0.0 {
            return 1.0;
        }
        let spec = self
            .core()
            .inn_definition()
            .specs()
            .iter()
            .find(|s| row >= s.offset() && row < s.offset() + s.dim());
        let Some(spec) = spec else {
            return 1.0;
        };
        let norm = inn.rows(spec.offset(), spec.dim()).norm();
        if norm > threshold {
            warn!(
                residual = self.core().name(),
                element = spec.name(),
                norm,
                "down-weighting outlier innovation"
            );
            (threshold * (norm - 0.5 * threshold) / (norm * norm)).sqrt()
        } else {
            1.0
        }
    }

    /// Innovation in tangent coordinates: `eval(...) ⊟ identity`.
    fn residual_tangent(
        &self,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
    ) -> FilterResult<DVector<f64>> {
        let mut inn = ElementVector::new(self.core().inn_definition().clone());
        self.eval(&mut inn, pre, cur, noi, ctx)?;
        let reference = ElementVector::new(self.core().inn_definition().clone());
        Ok(inn.box_minus_owned(&reference)?)
    }

    /// Compare all three analytic Jacobians against central differences at the
    /// given linearisation point.
    fn test_jacobians(
        &self,
        pre: &ElementVector,
        cur: &ElementVector,
        noi: &ElementVector,
        ctx: &ResidualContext<'_>,
        step: f64,
        tolerance: f64,
    ) -> FilterResult<()> {
        let core = self.core();
        let inn_dim = core.inn_definition().dim();

        let args: [(&str, usize); 3] = [
            ("pre", core.pre_definition().dim()),
            ("cur", core.cur_definition().dim()),
            ("noi", core.noi_definition().dim()),
        ];
        for (label, arg_dim) in args {
            if arg_dim == 0 {
                continue;
            }
            let mut analytic = DMatrix::zeros(inn_dim, arg_dim);
            match label {
                "pre" => self.jac_pre(&mut analytic, pre, cur, noi, ctx)?,
                "cur" => self.jac_cur(&mut analytic, pre, cur, noi, ctx)?,
                _ => self.jac_noi(&mut analytic, pre, cur, noi, ctx)?,
            }

            let mut numeric = DMatrix::zeros(inn_dim, arg_dim);
            for col in 0..arg_dim {
                let mut delta = DVector::zeros(arg_dim);
                delta[col] = step;
                let (mut plus_pre, mut plus_cur, mut plus_noi) =
                    (pre.clone(), cur.clone(), noi.clone());
                let (mut minus_pre, mut minus_cur, mut minus_noi) =
                    (pre.clone(), cur.clone(), noi.clone());
                match label {
                    "pre" => {
                        plus_pre.box_plus_assign(&delta)?;
                        minus_pre.box_plus_assign(&(-delta))?;
                    }
                    "cur" => {
                        plus_cur.box_plus_assign(&delta)?;
                        minus_cur.box_plus_assign(&(-delta))?;
                    }
                    _ => {
                        plus_noi.box_plus_assign(&delta)?;
                        minus_noi.box_plus_assign(&(-delta))?;
                    }
                }
                let r_plus = self.residual_tangent(&plus_pre, &plus_cur, &plus_noi, ctx)?;
                let r_minus = self.residual_tangent(&minus_pre, &minus_cur, &minus_noi, ctx)?;
                numeric.column_mut(col).copy_from(&((r_plus - r_minus) / (2.0 * step)));
            }

            let deviation = (&analytic - &numeric).abs().max();
            if deviation > tolerance {
                return Err(FilterError::Numeric(format!(
                    "{label} Jacobian of residual '{}' deviates from finite differences \
                     by {deviation:.3e} (tolerance {tolerance:.3e})",
                    core.name()
                )));
            }
        }
        Ok(())
    }
}
