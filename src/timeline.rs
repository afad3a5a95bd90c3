//! Per-channel time-ordered measurement store.
//!
//! Each residual channel owns one [`MeasurementTimeline`]. The timeline enforces
//! strictly increasing timestamps past `last_processed_time`, answers the range
//! queries the filter alignment needs, and applies the residual's split/merge
//! policies to re-time its measurement stream onto a shared break-point set.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::Excluded;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::element::ElementVector;
use crate::error::FilterResult;
use crate::residual::Residual;
use crate::time::{Duration, TimePoint};

/// Shared measurement payload.
pub type Measurement = Arc<ElementVector>;

/// Errors raised by timeline bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    /// Timestamp not after the last processed time.
    #[error("measurement at {t} is not after last processed time {last}")]
    OrderViolation { t: TimePoint, last: TimePoint },

    /// A measurement already exists at this timestamp.
    #[error("measurement at {t} already exists")]
    DuplicateTimestamp { t: TimePoint },

    /// Split or merge invoked with a non-chronological or uncovered range.
    #[error("range error: {0}")]
    Range(String),
}

pub type TimelineResult<T> = Result<T, TimelineError>;

/// Time-ordered measurement map with per-channel latency budget.
#[derive(Debug, Clone)]
pub struct MeasurementTimeline {
    measurements: BTreeMap<TimePoint, Measurement>,
    last_processed_time: TimePoint,
    drop_first: bool,
    max_wait: Duration,
    min_wait: Duration,
}

impl MeasurementTimeline {
    /// `drop_first` is set for prediction channels, which need a baseline
    /// measurement before the first usable interval.
    pub fn new(drop_first: bool, max_wait: Duration, min_wait: Duration) -> Self {
        MeasurementTimeline {
            measurements: BTreeMap::new(),
            last_processed_time: TimePoint::MIN,
            drop_first,
            max_wait,
            min_wait,
        }
    }

    /// Insert a measurement at `t`.
    ///
    /// The first measurement of a `drop_first` channel only records `t` as
    /// processed and is discarded. Timestamps at or before the last processed
    /// time and duplicates are rejected.
    pub fn add_measurement(&mut self, meas: Measurement, t: TimePoint) -> TimelineResult<()> {
        if self.drop_first && self.last_processed_time == TimePoint::MIN {
            info!(time = %t, "dropping first measurement as channel baseline");
            self.last_processed_time = t;
            return Ok(());
        }
        if t <= self.last_processed_time {
            return Err(TimelineError::OrderViolation {
                t,
                last: self.last_processed_time,
            });
        }
        if self.measurements.contains_key(&t) {
            return Err(TimelineError::DuplicateTimestamp { t });
        }
        debug!(time = %t, "adding measurement");
        self.measurements.insert(t, meas);
        Ok(())
    }

    pub fn get_measurement(&self, t: TimePoint) -> Option<&Measurement> {
        self.measurements.get(&t)
    }

    /// Advance `last_processed_time` to the first stored key and erase it.
    pub fn remove_processed_first(&mut self) -> TimelineResult<()> {
        let Some((&first, _)) = self.measurements.iter().next() else {
            return Err(TimelineError::Range(
                "no measurement to remove".to_string(),
            ));
        };
        self.last_processed_time = first;
        self.measurements.remove(&first);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.measurements.clear();
        self.last_processed_time = TimePoint::MIN;
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// First stored key, or `TimePoint::MAX` when empty.
    pub fn first_time(&self) -> TimePoint {
        self.measurements
            .keys()
            .next()
            .copied()
            .unwrap_or(TimePoint::MAX)
    }

    /// Last stored key, or the last processed time when empty.
    pub fn last_time(&self) -> TimePoint {
        self.measurements
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.last_processed_time)
    }

    pub fn last_processed_time(&self) -> TimePoint {
        self.last_processed_time
    }

    pub fn get_first(&self) -> Option<&Measurement> {
        self.measurements.values().next()
    }

    /// Latest update horizon this channel tolerates:
    /// `max(now - max_wait, t_last + min_wait)` with `t_last` the newest stored
    /// key (or the last processed time when the store is empty).
    pub fn maximal_update_time(&self, now: TimePoint) -> TimePoint {
        let mut maximal = now - self.max_wait;
        let reference = self.last_time();
        maximal = maximal.max(reference + self.min_wait);
        maximal
    }

    /// All keys with `start < t <= end`.
    pub fn all_in_range(&self, start: TimePoint, end: TimePoint) -> BTreeSet<TimePoint> {
        self.measurements
            .range((Excluded(start), std::ops::Bound::Included(end)))
            .map(|(&t, _)| t)
            .collect()
    }

    /// Greatest key `<= end` if it is `> start`.
    pub fn last_in_range(&self, start: TimePoint, end: TimePoint) -> Option<TimePoint> {
        self.measurements
            .range(..=end)
            .next_back()
            .map(|(&t, _)| t)
            .filter(|&t| t > start)
    }

    /// Insert a virtual measurement at `t1` by splitting the entry at `t2` via
    /// the residual's policy; requires `t0 <= t1 <= t2` and a measurement at `t2`.
    pub fn split(
        &mut self,
        t0: TimePoint,
        t1: TimePoint,
        t2: TimePoint,
        residual: &dyn Residual,
    ) -> FilterResult<()> {
        if t0 > t1 || t1 > t2 {
            return Err(TimelineError::Range(format!(
                "split times not chronological: {t0} / {t1} / {t2}"
            ))
            .into());
        }
        let Some(meas) = self.measurements.get(&t2).cloned() else {
            return Err(TimelineError::Range(format!(
                "split of '{}' has no measurement at {t2}",
                residual.core().name()
            ))
            .into());
        };
        info!(residual = residual.core().name(), time = %t1, "inserting split measurement");
        let (first, second) = residual.split_measurements(t0, t1, t2, &meas)?;
        self.measurements.insert(t1, Arc::new(first));
        self.measurements.insert(t2, Arc::new(second));
        Ok(())
    }

    /// Split so that every requested time is covered by a stored measurement.
    /// Requests that cannot be covered are logged and skipped.
    pub fn split_all(&mut self, times: &BTreeSet<TimePoint>, residual: &dyn Residual) {
        for &t in times {
            let Some((&t2, _)) = self.measurements.range(t..).next() else {
                warn!(
                    residual = residual.core().name(),
                    time = %t,
                    "no measurement covers requested split time"
                );
                continue;
            };
            if t2 == t {
                continue;
            }
            let t0 = self
                .measurements
                .range(..t)
                .next_back()
                .map(|(&k, _)| k)
                .unwrap_or(self.last_processed_time);
            if let Err(err) = self.split(t0, t, t2, residual) {
                warn!(residual = residual.core().name(), %err, "split failed");
            }
        }
    }

    /// Merge the entry at `t1` into its right neighbour at `t2` via the
    /// residual's policy; the merged entry does not count as processed.
    pub fn merge(
        &mut self,
        t0: TimePoint,
        t1: TimePoint,
        t2: TimePoint,
        residual: &dyn Residual,
    ) -> FilterResult<()> {
        if t0 > t1 || t1 > t2 {
            return Err(TimelineError::Range(format!(
                "merge times not chronological: {t0} / {t1} / {t2}"
            ))
            .into());
        }
        let (Some(first), Some(second)) = (
            self.measurements.get(&t1).cloned(),
            self.measurements.get(&t2).cloned(),
        ) else {
            return Err(TimelineError::Range(format!(
                "merge of '{}' misses a measurement at {t1} or {t2}",
                residual.core().name()
            ))
            .into());
        };
        info!(residual = residual.core().name(), time = %t1, "merging measurement");
        let merged = residual.merge_measurements(t0, t1, t2, &first, &second)?;
        self.measurements.insert(t2, Arc::new(merged));
        self.measurements.remove(&t1);
        Ok(())
    }

    /// Merge every stored key strictly before `max(keep)` that is not in `keep`
    /// into its right neighbour.
    pub fn merge_undesired(&mut self, keep: &BTreeSet<TimePoint>, residual: &dyn Residual) {
        let Some(&last_keep) = keep.iter().next_back() else {
            return;
        };
        let candidates: Vec<TimePoint> = self
            .measurements
            .range(..=last_keep)
            .map(|(&t, _)| t)
            .collect();
        for t1 in candidates {
            if keep.contains(&t1) {
                continue;
            }
            let Some((&t2, _)) = self
                .measurements
                .range((Excluded(t1), std::ops::Bound::Unbounded))
                .next()
            else {
                warn!(
                    residual = residual.core().name(),
                    "no right neighbour to merge into"
                );
                break;
            };
            let t0 = self
                .measurements
                .range(..t1)
                .next_back()
                .map(|(&k, _)| k)
                .unwrap_or(self.last_processed_time);
            if let Err(err) = self.merge(t0, t1, t2, residual) {
                warn!(residual = residual.core().name(), %err, "merge failed");
            }
        }
    }

    /// Drop every entry with key `<= time`, treating each as processed.
    pub fn remove_outdated(&mut self, time: TimePoint) {
        while let Some(&first) = self.measurements.keys().next() {
            if first > time {
                break;
            }
            debug!(time = %first, "removing outdated measurement");
            self.last_processed_time = first;
            self.measurements.remove(&first);
        }
    }

    /// Fixed-resolution occupancy row used by the filter connectivity diagram.
    /// One character per `resolution` seconds starting `start_offset` cells
    /// before `start`; digits count measurements in a cell. The row width is
    /// capped so a distant measurement cannot blow up the rendering.
    pub fn render(&self, start: TimePoint, start_offset: usize, resolution: f64) -> String {
        const MAX_CELLS: usize = 240;
        let width = match self.measurements.keys().next_back() {
            None => start_offset,
            Some(&last) => {
                let cells = ((last - start).to_sec() / resolution)
                    .ceil()
                    .clamp(0.0, MAX_CELLS as f64) as usize;
                start_offset + cells + 1
            }
        };
        let mut counts = vec![0usize; width];
        for &t in self.measurements.keys() {
            let cell = start_offset as isize + ((t - start).to_sec() / resolution).ceil() as isize;
            if cell >= 0 && (cell as usize) < width {
                counts[cell as usize] += 1;
            }
        }
        counts
            .iter()
            .map(|&c| {
                if c == 0 {
                    "-".to_string()
                } else {
                    format!("{}", c.min(9))
                }
            })
            .collect()
    }
}
