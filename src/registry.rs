use crate::error::InvariantViolation;
use crate::models::SeriesKey;
use crate::tracker::DeltaBatch;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
struct Inner {
    providers: BTreeSet<String>,
    counters: BTreeMap<SeriesKey, f64>,
}

/// Process-wide set of monotonic counters keyed by series.
///
/// The scheduler's apply step is the only writer; exposition handlers read
/// concurrently through [`CounterRegistry::snapshot`]. A whole batch is applied
/// under one write lock, so readers see either none or all of it.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    inner: RwLock<Inner>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a provider's metric families visible before any sample exists.
    pub fn register_provider(&self, provider: &str) {
        self.inner.write().providers.insert(provider.to_string());
    }

    pub fn providers(&self) -> Vec<String> {
        self.inner.read().providers.iter().cloned().collect()
    }

    /// Create a zero counter on first reference; returns the current value.
    pub fn ensure(&self, key: &SeriesKey) -> f64 {
        if let Some(value) = self.inner.read().counters.get(key) {
            return *value;
        }
        let mut inner = self.inner.write();
        inner.providers.insert(key.provider.clone());
        *inner.counters.entry(key.clone()).or_insert(0.0)
    }

    pub fn increment(&self, key: &SeriesKey, delta: f64) -> Result<f64, InvariantViolation> {
        check_delta(key, delta)?;
        let mut inner = self.inner.write();
        inner.providers.insert(key.provider.clone());
        let value = inner.counters.entry(key.clone()).or_insert(0.0);
        *value += delta;
        Ok(*value)
    }

    /// Apply one tracker batch atomically. Nothing is mutated if any delta is invalid.
    pub fn apply(&self, batch: &DeltaBatch) -> Result<(), InvariantViolation> {
        for (key, delta) in &batch.deltas {
            check_delta(key, *delta)?;
        }

        let mut inner = self.inner.write();
        for key in &batch.touched {
            if !inner.counters.contains_key(key) {
                inner.providers.insert(key.provider.clone());
                inner.counters.insert(key.clone(), 0.0);
            }
        }
        for (key, delta) in &batch.deltas {
            if !inner.counters.contains_key(key) {
                inner.providers.insert(key.provider.clone());
            }
            *inner.counters.entry(key.clone()).or_insert(0.0) += delta;
        }
        Ok(())
    }

    pub fn get(&self, key: &SeriesKey) -> Option<f64> {
        self.inner.read().counters.get(key).copied()
    }

    /// Point-in-time copy of every counter, sorted by series.
    pub fn snapshot(&self) -> Vec<(SeriesKey, f64)> {
        self.inner
            .read()
            .counters
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_delta(key: &SeriesKey, delta: f64) -> Result<(), InvariantViolation> {
    if delta.is_finite() && delta >= 0.0 {
        Ok(())
    } else {
        Err(InvariantViolation {
            key: key.clone(),
            delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn key(model: &str) -> SeriesKey {
        SeriesKey::new("openai", MetricKind::Requests, [("model", model)])
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let registry = CounterRegistry::new();
        assert_eq!(registry.ensure(&key("a")), 0.0);
        registry.increment(&key("a"), 3.0).unwrap();
        assert_eq!(registry.ensure(&key("a")), 3.0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.providers(), vec!["openai".to_string()]);
    }

    #[test]
    fn test_negative_increment_rejected() {
        let registry = CounterRegistry::new();
        registry.increment(&key("a"), 1.0).unwrap();

        let err = registry.increment(&key("a"), -0.5).unwrap_err();
        assert_eq!(err.delta, -0.5);
        assert_eq!(registry.get(&key("a")), Some(1.0));

        assert!(registry.increment(&key("a"), f64::INFINITY).is_err());
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let registry = CounterRegistry::new();
        let mut batch = DeltaBatch::default();
        batch.touched.insert(key("a"));
        batch.touched.insert(key("b"));
        batch.deltas.push((key("a"), 2.0));
        batch.deltas.push((key("b"), -1.0));

        assert!(registry.apply(&batch).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_apply_creates_zero_counters_for_touched_keys() {
        let registry = CounterRegistry::new();
        let mut batch = DeltaBatch::default();
        batch.touched.insert(key("a"));
        batch.touched.insert(key("b"));
        batch.deltas.push((key("a"), 2.0));
        batch.deltas.push((key("a"), 1.0));

        registry.apply(&batch).unwrap();
        assert_eq!(
            registry.snapshot(),
            vec![(key("a"), 3.0), (key("b"), 0.0)]
        );
    }

    #[test]
    fn test_snapshots_monotonic() {
        let registry = CounterRegistry::new();
        let mut previous = 0.0;
        for delta in [1.0, 0.0, 2.5, 0.25] {
            registry.increment(&key("a"), delta).unwrap();
            let current = registry.snapshot()[0].1;
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn test_concurrent_snapshot_never_sees_partial_batch() {
        let registry = Arc::new(CounterRegistry::new());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let registry = registry.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let mut batch = DeltaBatch::default();
                    batch.touched.insert(key("a"));
                    batch.touched.insert(key("b"));
                    batch.deltas.push((key("a"), 1.0));
                    batch.deltas.push((key("b"), 1.0));
                    registry.apply(&batch).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut last = 0.0;
                    while !done.load(Ordering::SeqCst) {
                        let snapshot = registry.snapshot();
                        if snapshot.is_empty() {
                            continue;
                        }
                        let a = snapshot[0].1;
                        let b = snapshot[1].1;
                        assert_eq!(a, b, "batch was visible half-applied");
                        assert!(a >= last);
                        last = a;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(registry.get(&key("a")), Some(2_000.0));
    }
}
