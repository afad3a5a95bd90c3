//! Multi-channel scheduler and information-form estimator.
//!
//! The filter owns one [`MeasurementTimeline`] per registered residual and the
//! joint state built as the name-keyed union of all residual `pre`/`cur`
//! definitions. [`Filter::update_at`] picks the update horizon from the
//! per-channel latency budgets, aligns prediction channels onto a shared
//! break-point set (splitting and merging their measurement streams), and then
//! walks the sub-intervals chronologically.
//!
//! Per sub-interval `(τ_{i-1}, τ_i]` it iterates Gauss-Newton on the joint
//! tangent of the previous and current state: residual information plus the
//! prior pair `(x̂, I)` on the previous block, solved with a Cholesky
//! factorisation. After convergence the previous block is marginalised out via
//! its Schur complement, yielding the information pair at `τ_i`. The whole
//! update runs on working copies; on any numeric failure the filter state is
//! left untouched.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use nalgebra::{Cholesky, DMatrix, DVector};
use tracing::{debug, info, warn};

use crate::element::{ElementVector, ElementVectorDefinition};
use crate::error::{programmer_error, FilterError, FilterResult};
use crate::residual::{Residual, ResidualContext};
use crate::time::{Clock, Duration, TimePoint};
use crate::timeline::{Measurement, MeasurementTimeline};

/// Iteration controls for the Gauss-Newton update.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Maximum Gauss-Newton iterations per sub-interval.
    pub max_iterations: usize,
    /// Convergence threshold on the infinity norm of the tangent correction.
    pub tangent_tolerance: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            max_iterations: 10,
            tangent_tolerance: 1e-6,
        }
    }
}

impl FilterConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tangent_tolerance(mut self, tangent_tolerance: f64) -> Self {
        self.tangent_tolerance = tangent_tolerance;
        self
    }
}

#[derive(Debug)]
struct ResidualSlot {
    residual: Box<dyn Residual>,
    timeline: MeasurementTimeline,
}

/// Time-aligned recursive estimator over a manifold-valued joint state.
pub struct Filter {
    config: FilterConfig,
    state_definition: Arc<ElementVectorDefinition>,
    slots: Vec<ResidualSlot>,
    state: ElementVector,
    information: DMatrix<f64>,
    time: TimePoint,
    initialized: bool,
}

impl Default for Filter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

impl Filter {
    pub fn new(config: FilterConfig) -> Self {
        let state_definition = ElementVectorDefinition::empty();
        Filter {
            config,
            state: ElementVector::new(state_definition.clone()),
            state_definition,
            slots: Vec::new(),
            information: DMatrix::zeros(0, 0),
            time: TimePoint::MIN,
            initialized: false,
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Joint state definition (union of all residual `pre`/`cur` definitions).
    pub fn state_definition(&self) -> &Arc<ElementVectorDefinition> {
        &self.state_definition
    }

    /// Current estimate `x̂`.
    pub fn state(&self) -> &ElementVector {
        &self.state
    }

    /// Mutable access to the estimate, e.g. to seed values after
    /// initialisation and before the first update.
    pub fn state_mut(&mut self) -> &mut ElementVector {
        &mut self.state
    }

    /// Information matrix of the current estimate.
    pub fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    /// Time of the current estimate.
    pub fn time(&self) -> TimePoint {
        self.time
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Register a residual; allocates its measurement channel and merges its
    /// definitions into the joint state. Returns the channel id.
    pub fn add_residual(
        &mut self,
        residual: Box<dyn Residual>,
        max_wait: Duration,
        min_wait: Duration,
    ) -> FilterResult<usize> {
        if self.initialized {
            return Err(FilterError::InvalidInput(
                "residuals must be registered before the filter is initialised".to_string(),
            ));
        }
        let merged = self
            .state_definition
            .union(residual.core().pre_definition())?
            .union(residual.core().cur_definition())?;
        self.state_definition = Arc::new(merged);
        let timeline = MeasurementTimeline::new(residual.is_prediction(), max_wait, min_wait);
        let channel = self.slots.len();
        info!(
            residual = residual.core().name(),
            channel,
            prediction = residual.is_prediction(),
            "registered residual"
        );
        self.slots.push(ResidualSlot { residual, timeline });
        Ok(channel)
    }

    /// Forward a measurement to a channel's timeline. Order violations and
    /// duplicates are reported but leave the filter operational.
    pub fn add_measurement(
        &mut self,
        channel: usize,
        meas: Measurement,
        t: TimePoint,
    ) -> FilterResult<()> {
        let slot = self
            .slots
            .get_mut(channel)
            .ok_or_else(|| FilterError::InvalidInput(format!("unknown channel {channel}")))?;
        slot.timeline.add_measurement(meas, t).map_err(|err| {
            warn!(channel, %err, "dropping measurement");
            err.into()
        })
    }

    /// Initialise with an identity state and identity information at `time`.
    pub fn init(&mut self, time: TimePoint) {
        let dim = self.state_definition.dim();
        self.state = ElementVector::new(self.state_definition.clone());
        self.information = DMatrix::identity(dim, dim);
        self.time = time;
        self.initialized = true;
        info!(%time, dim, "filter initialised");
    }

    /// Initialise with an identity state and the given covariance.
    pub fn init_with_covariance(
        &mut self,
        covariance: &DMatrix<f64>,
        time: TimePoint,
    ) -> FilterResult<()> {
        let dim = self.state_definition.dim();
        if covariance.nrows() != dim || covariance.ncols() != dim {
            return Err(FilterError::InvalidInput(format!(
                "initial covariance must be {dim}x{dim}, got {}x{}",
                covariance.nrows(),
                covariance.ncols()
            )));
        }
        let chol = Cholesky::new(covariance.clone()).ok_or_else(|| {
            FilterError::Numeric("initial covariance is not positive definite".to_string())
        })?;
        self.init(time);
        self.information = chol.inverse();
        Ok(())
    }

    /// Clear all timelines and drop the state.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.timeline.reset();
        }
        self.state = ElementVector::new(self.state_definition.clone());
        self.information = DMatrix::zeros(0, 0);
        self.time = TimePoint::MIN;
        self.initialized = false;
    }

    /// Run the update against the wall clock.
    pub fn update(&mut self) -> FilterResult<()> {
        self.update_at(Clock::now())
    }

    /// Run the update with an injected notion of "now".
    pub fn update_at(&mut self, now: TimePoint) -> FilterResult<()> {
        if self.slots.is_empty() {
            return Ok(());
        }
        if !self.initialized {
            let Some(start) = self.earliest_data_time() else {
                return Ok(());
            };
            self.init(start);
        }

        let t_star = self
            .slots
            .iter()
            .map(|slot| slot.timeline.maximal_update_time(now))
            .min()
            .unwrap_or(TimePoint::MIN);
        if t_star <= self.time {
            debug!(%t_star, time = %self.time, "no admissible update horizon");
            return Ok(());
        }

        // Break-point candidates: times every channel must be aligned to. A
        // mergeable prediction stream is flexible and contributes nothing; all
        // other channels pin their measurement times.
        let mut boundaries: BTreeSet<TimePoint> = BTreeSet::new();
        for slot in &self.slots {
            if slot.residual.is_prediction() {
                if !slot.residual.core().is_mergeable() {
                    boundaries.extend(slot.timeline.all_in_range(self.time, t_star));
                }
            } else if let Some(t) = slot.timeline.last_in_range(self.time, t_star) {
                boundaries.insert(t);
            }
        }
        boundaries.insert(t_star);

        for slot in &mut self.slots {
            let ResidualSlot { residual, timeline } = slot;
            if !residual.is_prediction() {
                continue;
            }
            if residual.core().is_splittable() {
                timeline.split_all(&boundaries, residual.as_ref());
            }
            if residual.core().is_mergeable() {
                timeline.merge_undesired(&boundaries, residual.as_ref());
            }
        }

        // Final break-point set: all prediction-channel times up to the horizon.
        let mut breaks: BTreeSet<TimePoint> = BTreeSet::new();
        for slot in &self.slots {
            if slot.residual.is_prediction() {
                breaks.extend(slot.timeline.all_in_range(self.time, t_star));
            }
        }
        breaks.insert(t_star);

        let update_times: Vec<Option<TimePoint>> = self
            .slots
            .iter()
            .map(|slot| {
                if slot.residual.is_prediction() {
                    None
                } else {
                    slot.timeline.last_in_range(self.time, t_star)
                }
            })
            .collect();

        // Work on copies; commit only after every sub-interval succeeded.
        let mut work_state = self.state.clone();
        let mut work_info = self.information.clone();
        let mut work_time = self.time;
        for &tau in &breaks {
            if tau <= work_time {
                continue;
            }
            self.step(&mut work_state, &mut work_info, work_time, tau, &update_times)?;
            work_time = tau;
        }

        self.state = work_state;
        self.information = work_info;
        self.time = work_time;
        for slot in &mut self.slots {
            slot.timeline.remove_outdated(t_star);
        }
        info!(time = %self.time, "update committed");
        Ok(())
    }

    /// Human-readable channel/measurement diagram relative to the state time
    /// (or the earliest known measurement before initialisation).
    pub fn print_connectivity(&self) -> String {
        const OFFSET: usize = 12;
        const RESOLUTION: f64 = 0.01;
        let start = if self.initialized {
            self.time
        } else {
            self.earliest_data_time().unwrap_or(self.time)
        };
        let mut out = String::new();
        let _ = writeln!(out, "state time: {}", self.time);
        for (channel, slot) in self.slots.iter().enumerate() {
            let kind = if slot.residual.is_prediction() {
                "pre"
            } else {
                "upd"
            };
            let _ = writeln!(
                out,
                "[{channel}] {:<16} {kind} {}",
                slot.residual.core().name(),
                slot.timeline.render(start, OFFSET, RESOLUTION)
            );
        }
        out
    }

    /// Earliest time any channel knows about, used for lazy initialisation.
    fn earliest_data_time(&self) -> Option<TimePoint> {
        let mut earliest = TimePoint::MAX;
        for slot in &self.slots {
            earliest = earliest.min(slot.timeline.first_time());
            let processed = slot.timeline.last_processed_time();
            if processed != TimePoint::MIN {
                earliest = earliest.min(processed);
            }
        }
        (earliest != TimePoint::MAX).then_some(earliest)
    }

    /// Residuals applicable to `(t_pre, t_cur]` with their bound measurements.
    ///
    /// A starved prediction channel simply skips the sub-interval. An
    /// update-style residual scheduled at a time its timeline does not hold is
    /// an unbound measurement: the alignment promised a payload that is gone.
    fn active_residuals(
        &self,
        t_pre: TimePoint,
        t_cur: TimePoint,
        update_times: &[Option<TimePoint>],
    ) -> FilterResult<Vec<(usize, Measurement)>> {
        let mut active = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.residual.is_prediction() {
                match slot.timeline.get_measurement(t_cur) {
                    Some(meas) => active.push((index, meas.clone())),
                    None => debug!(
                        residual = slot.residual.core().name(),
                        time = %t_cur,
                        "prediction channel has no measurement at boundary"
                    ),
                }
            } else if let Some(t) = update_times[index] {
                if t > t_pre && t <= t_cur {
                    match slot.timeline.get_measurement(t) {
                        Some(meas) => active.push((index, meas.clone())),
                        None => programmer_error!(FilterError::UnboundMeasurement(
                            slot.residual.core().name().to_string()
                        )),
                    }
                }
            }
        }
        Ok(active)
    }

    /// One aligned sub-interval: iterated Gauss-Newton over the joint
    /// `[pre; cur]` tangent followed by marginalisation of the `pre` block.
    fn step(
        &self,
        prior_state: &mut ElementVector,
        prior_info: &mut DMatrix<f64>,
        t_pre: TimePoint,
        t_cur: TimePoint,
        update_times: &[Option<TimePoint>],
    ) -> FilterResult<()> {
        let n = self.state_definition.dim();
        let dt = (t_cur - t_pre).to_sec();
        let active = self.active_residuals(t_pre, t_cur, update_times)?;
        if active.is_empty() {
            warn!(from = %t_pre, to = %t_cur, "no residuals apply to sub-interval");
            return Ok(());
        }

        let mut lin_pre = prior_state.clone();
        let mut lin_cur = prior_state.clone();
        // Seed the current state by running the predictions with zero noise.
        for (index, meas) in &active {
            let slot = &self.slots[*index];
            if !slot.residual.is_prediction() {
                continue;
            }
            let ctx = ResidualContext::new(meas, dt);
            let mut pre_local = ElementVector::new(slot.residual.core().pre_definition().clone());
            pre_local.assign_subset(&lin_pre)?;
            let mut cur_local = ElementVector::new(slot.residual.core().cur_definition().clone());
            if slot.residual.predict_initial(&mut cur_local, &pre_local, &ctx)? {
                lin_cur.assign_subset(&cur_local)?;
            }
        }

        let mut hessian = DMatrix::zeros(2 * n, 2 * n);
        let mut converged = false;
        let mut step_norm = f64::INFINITY;
        for _ in 0..self.config.max_iterations {
            hessian.fill(0.0);
            let mut rhs = DVector::zeros(2 * n);

            for (index, meas) in &active {
                let slot = &self.slots[*index];
                let core = slot.residual.core();
                let ctx = ResidualContext::new(meas, dt);
                let inn_dim = core.inn_definition().dim();

                let mut pre_local = ElementVector::new(core.pre_definition().clone());
                pre_local.assign_subset(&lin_pre)?;
                let mut cur_local = ElementVector::new(core.cur_definition().clone());
                cur_local.assign_subset(&lin_cur)?;
                let noi = ElementVector::new(core.noi_definition().clone());

                let residual = slot
                    .residual
                    .residual_tangent(&pre_local, &cur_local, &noi, &ctx)?;
                let mut j_pre = DMatrix::zeros(inn_dim, core.pre_definition().dim());
                slot.residual
                    .jac_pre(&mut j_pre, &pre_local, &cur_local, &noi, &ctx)?;
                let mut j_cur = DMatrix::zeros(inn_dim, core.cur_definition().dim());
                slot.residual
                    .jac_cur(&mut j_cur, &pre_local, &cur_local, &noi, &ctx)?;
                let mut j_noi = DMatrix::zeros(inn_dim, core.noi_definition().dim());
                slot.residual
                    .jac_noi(&mut j_noi, &pre_local, &cur_local, &noi, &ctx)?;

                // W = (J_noi Σ J_noiᵀ)⁻¹, conjugated with the robust row weights.
                let projected = &j_noi * core.noise_covariance() * j_noi.transpose();
                let chol = Cholesky::new(projected).ok_or_else(|| {
                    FilterError::Numeric(format!(
                        "projected noise covariance of '{}' is not positive definite",
                        core.name()
                    ))
                })?;
                let mut weight = chol.inverse();
                let row_weights: Vec<f64> = (0..inn_dim)
                    .map(|row| slot.residual.noise_weighting(&residual, row))
                    .collect();
                if row_weights.iter().any(|&w| w != 1.0) {
                    for row in 0..inn_dim {
                        for col in 0..inn_dim {
                            weight[(row, col)] *= row_weights[row] * row_weights[col];
                        }
                    }
                }

                let mut stacked = DMatrix::zeros(inn_dim, 2 * n);
                scatter_columns(&mut stacked, 0, &j_pre, core.pre_definition(), &self.state_definition)?;
                scatter_columns(&mut stacked, n, &j_cur, core.cur_definition(), &self.state_definition)?;

                let weighted = &weight * &stacked;
                hessian += stacked.transpose() * &weighted;
                rhs -= stacked.transpose() * (&weight * &residual);
            }

            // Prior block on the previous state.
            let mismatch = lin_pre.box_minus_owned(prior_state)?;
            {
                let mut h_pp = hessian.view_mut((0, 0), (n, n));
                h_pp += &*prior_info;
            }
            let prior_pull = &*prior_info * &mismatch;
            {
                let mut rhs_pre = rhs.rows_mut(0, n);
                rhs_pre -= &prior_pull;
            }

            let chol = Cholesky::new(hessian.clone()).ok_or_else(|| {
                FilterError::Numeric(
                    "combined information system is not positive definite".to_string(),
                )
            })?;
            let delta = chol.solve(&rhs);
            lin_pre.box_plus_assign(&delta.rows(0, n).into_owned())?;
            lin_cur.box_plus_assign(&delta.rows(n, n).into_owned())?;
            step_norm = delta.amax();
            if step_norm < self.config.tangent_tolerance {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(FilterError::NonConvergence {
                max_iterations: self.config.max_iterations,
                step_norm,
            });
        }

        // Marginalise the pre block: I' = H_cc - H_pcᵀ H_pp⁻¹ H_pc.
        let h_pp = hessian.view((0, 0), (n, n)).into_owned();
        let h_pc = hessian.view((0, n), (n, n)).into_owned();
        let h_cc = hessian.view((n, n), (n, n)).into_owned();
        let chol_pp = Cholesky::new(h_pp).ok_or_else(|| {
            FilterError::Numeric("prior information block is not positive definite".to_string())
        })?;
        let marginal = h_cc - h_pc.transpose() * chol_pp.solve(&h_pc);
        let info_next = 0.5 * (&marginal + marginal.transpose());

        debug!(from = %t_pre, to = %t_cur, residuals = active.len(), "sub-interval solved");
        *prior_state = lin_cur;
        *prior_info = info_next;
        Ok(())
    }
}

/// Scatter a residual-local Jacobian into the stacked matrix, mapping each
/// local element to its column range in the joint state tangent.
fn scatter_columns(
    stacked: &mut DMatrix<f64>,
    col_base: usize,
    local: &DMatrix<f64>,
    local_def: &ElementVectorDefinition,
    full_def: &ElementVectorDefinition,
) -> FilterResult<()> {
    let rows = local.nrows();
    for spec in local_def.specs() {
        let full_index = full_def.index_of(spec.name())?;
        let full_offset = full_def.offset(full_index);
        stacked
            .view_mut((0, col_base + full_offset), (rows, spec.dim()))
            .copy_from(&local.view((0, spec.offset()), (rows, spec.dim())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::ResidualCore;

    #[derive(Debug)]
    struct NullUpdateResidual {
        core: ResidualCore,
    }

    impl NullUpdateResidual {
        fn new() -> Self {
            let empty = ElementVectorDefinition::empty();
            NullUpdateResidual {
                core: ResidualCore::new(
                    "null_upd",
                    empty.clone(),
                    empty.clone(),
                    empty.clone(),
                    empty,
                    false,
                    false,
                ),
            }
        }
    }

    impl Residual for NullUpdateResidual {
        fn core(&self) -> &ResidualCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ResidualCore {
            &mut self.core
        }

        fn eval(
            &self,
            _inn: &mut ElementVector,
            _pre: &ElementVector,
            _cur: &ElementVector,
            _noi: &ElementVector,
            _ctx: &ResidualContext<'_>,
        ) -> FilterResult<()> {
            Ok(())
        }

        fn jac_pre(
            &self,
            _jac: &mut DMatrix<f64>,
            _pre: &ElementVector,
            _cur: &ElementVector,
            _noi: &ElementVector,
            _ctx: &ResidualContext<'_>,
        ) -> FilterResult<()> {
            Ok(())
        }

        fn jac_cur(
            &self,
            _jac: &mut DMatrix<f64>,
            _pre: &ElementVector,
            _cur: &ElementVector,
            _noi: &ElementVector,
            _ctx: &ResidualContext<'_>,
        ) -> FilterResult<()> {
            Ok(())
        }

        fn jac_noi(
            &self,
            _jac: &mut DMatrix<f64>,
            _pre: &ElementVector,
            _cur: &ElementVector,
            _noi: &ElementVector,
            _ctx: &ResidualContext<'_>,
        ) -> FilterResult<()> {
            Ok(())
        }
    }

    #[test]
    fn scheduled_measurement_missing_from_timeline_is_unbound() {
        let mut filter = Filter::default();
        filter
            .add_residual(
                Box::new(NullUpdateResidual::new()),
                Duration::from_sec(0.1),
                Duration::ZERO,
            )
            .unwrap();

        // The schedule claims a measurement at t=50ns, but the channel's
        // timeline holds nothing there.
        let update_times = vec![Some(TimePoint::from_nanos(50))];
        let result = filter.active_residuals(
            TimePoint::from_nanos(0),
            TimePoint::from_nanos(100),
            &update_times,
        );
        assert!(matches!(
            result,
            Err(FilterError::UnboundMeasurement(name)) if name == "null_upd"
        ));
    }

    #[test]
    fn update_without_residuals_is_a_no_op() {
        let mut filter = Filter::default();
        assert!(filter.update_at(TimePoint::from_nanos(0)).is_ok());
        assert!(!filter.is_initialized());
    }

    #[test]
    fn config_builders() {
        let config = FilterConfig::default()
            .with_max_iterations(5)
            .with_tangent_tolerance(1e-9);
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.tangent_tolerance, 1e-9);
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let mut filter = Filter::default();
        let err = filter.add_measurement(
            3,
            std::sync::Arc::new(ElementVector::empty()),
            TimePoint::from_nanos(0),
        );
        assert!(matches!(err, Err(FilterError::InvalidInput(_))));
    }
}
