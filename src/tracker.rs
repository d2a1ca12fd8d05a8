use crate::models::{SeriesKey, UsageRecord};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq)]
enum SeriesState {
    Cumulative {
        period_start: DateTime<Utc>,
        last_value: f64,
    },
    Windowed {
        last_window_end: DateTime<Utc>,
    },
}

/// Result of feeding one snapshot through a tracker
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeltaBatch {
    /// Every series present in the snapshot, including zero-delta ones
    pub touched: BTreeSet<SeriesKey>,
    /// Positive increments, in processing order
    pub deltas: Vec<(SeriesKey, f64)>,
    /// Tracker state to install once the batch is applied
    pending: HashMap<SeriesKey, SeriesState>,
}

impl DeltaBatch {
    #[cfg(test)]
    pub fn total_for(&self, key: &SeriesKey) -> f64 {
        self.deltas
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, d)| d)
            .sum()
    }
}

/// Per-provider memory of what each series last reported
#[derive(Debug, Default)]
pub struct DeltaTracker {
    state: HashMap<SeriesKey, SeriesState>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn tracked_series(&self) -> usize {
        self.state.len()
    }

    /// Compute deltas for one successfully collected snapshot without changing
    /// tracker state. Call [`DeltaTracker::commit`] once the batch is applied.
    pub fn observe(&self, mut records: Vec<UsageRecord>) -> DeltaBatch {
        // Stable: records sharing a window_end keep their input order.
        records.sort_by_key(|r| r.window_end);

        let mut batch = DeltaBatch::default();
        for record in &records {
            let key = record.series_key();
            let previous = batch
                .pending
                .get(&key)
                .or_else(|| self.state.get(&key))
                .copied();

            let (delta, next) = step(previous, record);
            if let Some(next) = next {
                batch.pending.insert(key.clone(), next);
            }
            if delta > 0.0 {
                batch.deltas.push((key.clone(), delta));
            }
            batch.touched.insert(key);
        }
        batch
    }

    pub fn commit(&mut self, batch: &DeltaBatch) {
        for (key, state) in &batch.pending {
            self.state.insert(key.clone(), *state);
        }
    }
}

/// Delta for one record given the series' previous state, plus the new state if it changes.
fn step(previous: Option<SeriesState>, record: &UsageRecord) -> (f64, Option<SeriesState>) {
    if record.cumulative {
        let delta = match previous {
            Some(SeriesState::Cumulative {
                period_start,
                last_value,
            }) => {
                if record.window_start < period_start {
                    // Stale period; a newer one is already being tracked.
                    return (0.0, None);
                }
                if record.window_start > period_start || record.value < last_value {
                    // New period, or the upstream total was reset.
                    record.value
                } else {
                    record.value - last_value
                }
            }
            // First sighting, or the series switched from windowed reporting.
            _ => record.value,
        };
        let next = SeriesState::Cumulative {
            period_start: record.window_start,
            last_value: record.value,
        };
        (delta.max(0.0), Some(next))
    } else {
        if let Some(SeriesState::Windowed { last_window_end }) = previous {
            if record.window_end <= last_window_end {
                return (0.0, None);
            }
        }
        let next = SeriesState::Windowed {
            last_window_end: record.window_end,
        };
        (record.value, Some(next))
    }
}
