use crate::config::MAX_SCRAPE_INTERVAL;
use crate::error::{CycleError, ProviderError};
use crate::models::TimeWindow;
use crate::providers::UsageProvider;
use crate::registry::CounterRegistry;
use crate::telemetry::{Outcome, SelfMetrics};
use crate::tracker::DeltaTracker;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Collecting,
    Applying,
    Failed,
}

/// Summary of one applied cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub records: usize,
    pub series: usize,
    pub deltas: usize,
}

struct ProviderSlot {
    provider: Box<dyn UsageProvider>,
    tracker: DeltaTracker,
    /// Upper bound of the last applied window; the next window starts here
    cursor: DateTime<Utc>,
    state: CycleState,
}

impl ProviderSlot {
    fn transition(&mut self, next: CycleState) {
        debug!(provider = self.provider.name(), from = ?self.state, to = ?next, "cycle state");
        self.state = next;
    }

    async fn run_cycle(
        &mut self,
        registry: &CounterRegistry,
        metrics: &SelfMetrics,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, CycleError> {
        let name = self.provider.name();
        let started = Instant::now();
        let window = TimeWindow::new(self.cursor, now);

        self.transition(CycleState::Collecting);
        let result = self.collect_and_apply(registry, window).await;
        metrics.record_cycle(
            name,
            if result.is_ok() {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            started.elapsed(),
        );

        match &result {
            Ok(report) => {
                info!(
                    provider = name,
                    window_start = %window.start,
                    window_end = %window.end,
                    records = report.records,
                    deltas = report.deltas,
                    "collection applied"
                );
            }
            Err(CycleError::Provider(e)) => {
                self.transition(CycleState::Failed);
                warn!(provider = name, error = %e, "collection failed; window kept for next cycle");
            }
            Err(CycleError::Invariant(e)) => {
                self.transition(CycleState::Failed);
                error!(provider = name, error = %e, "delta batch rejected by registry");
                if cfg!(debug_assertions) {
                    panic!("{}", e);
                }
            }
        }
        self.transition(CycleState::Idle);
        result
    }

    async fn collect_and_apply(
        &mut self,
        registry: &CounterRegistry,
        window: TimeWindow,
    ) -> Result<CycleReport, CycleError> {
        let records = self.provider.collect(window).await?;
        let name = self.provider.name();
        if let Some(stray) = records.iter().find(|r| r.provider != name) {
            return Err(ProviderError::Malformed {
                provider: name.to_string(),
                reason: format!("record tagged with provider '{}'", stray.provider),
            }
            .into());
        }

        // Nothing below this point awaits.
        self.transition(CycleState::Applying);
        let record_count = records.len();
        let batch = self.tracker.observe(records);
        registry.apply(&batch)?;
        self.tracker.commit(&batch);
        self.cursor = window.end;

        Ok(CycleReport {
            records: record_count,
            series: batch.touched.len(),
            deltas: batch.deltas.len(),
        })
    }
}

struct SlotHandle {
    name: &'static str,
    slot: Arc<Mutex<ProviderSlot>>,
}

/// A provider still busy when the tick fires loses that tick.
pub struct Scheduler {
    registry: Arc<CounterRegistry>,
    metrics: Arc<SelfMetrics>,
    interval: Duration,
    grace: Duration,
    slots: Vec<SlotHandle>,
}

impl Scheduler {
    pub fn new(
        providers: Vec<Box<dyn UsageProvider>>,
        registry: Arc<CounterRegistry>,
        metrics: Arc<SelfMetrics>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        if interval > MAX_SCRAPE_INTERVAL {
            warn!(
                requested_secs = interval.as_secs(),
                max_secs = MAX_SCRAPE_INTERVAL.as_secs(),
                "interval clamped to maximum"
            );
        }
        let interval = interval.min(MAX_SCRAPE_INTERVAL);
        // Bounded by MAX_SCRAPE_INTERVAL, so the millisecond count fits in i64.
        let first_start = Utc::now() - chrono::Duration::milliseconds(interval.as_millis() as i64);

        let slots = providers
            .into_iter()
            .map(|provider| {
                let name = provider.name();
                registry.register_provider(name);
                SlotHandle {
                    name,
                    slot: Arc::new(Mutex::new(ProviderSlot {
                        provider,
                        tracker: DeltaTracker::new(),
                        cursor: first_start,
                        state: CycleState::Idle,
                    })),
                }
            })
            .collect();

        Self {
            registry,
            metrics,
            interval,
            grace,
            slots,
        }
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.name).collect()
    }

    /// Where the provider's next window will start
    #[cfg(test)]
    async fn cursor(&self, provider: &str) -> Option<DateTime<Utc>> {
        let handle = self.slots.iter().find(|s| s.name == provider)?;
        Some(handle.slot.lock().await.cursor)
    }

    /// Run one cycle for every provider concurrently and wait for all of them.
    pub async fn run_once(&self) -> Vec<(&'static str, Result<CycleReport, CycleError>)> {
        let cycles = self.slots.iter().map(|handle| async move {
            let mut slot = handle.slot.lock().await;
            let result = slot.run_cycle(&self.registry, &self.metrics, Utc::now()).await;
            (handle.name, result)
        });
        join_all(cycles).await
    }

    /// Tick until `shutdown` fires, then give in-flight cycles `grace` to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            providers = ?self.provider_names(),
            interval_secs = self.interval.as_secs_f64(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick(&mut in_flight),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "collection task panicked");
                    }
                }
            }
        }

        if in_flight.is_empty() {
            info!("scheduler stopped");
            return;
        }

        info!(in_flight = in_flight.len(), "waiting for in-flight collections");
        let drained = tokio::time::timeout(self.grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "grace period elapsed; abandoning in-flight collections"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
        info!("scheduler stopped");
    }

    fn tick(&self, in_flight: &mut JoinSet<()>) {
        for handle in &self.slots {
            let mut slot = match handle.slot.clone().try_lock_owned() {
                Ok(slot) => slot,
                Err(_) => {
                    warn!(provider = handle.name, "previous collection still running; tick dropped");
                    self.metrics.record_dropped_tick(handle.name);
                    continue;
                }
            };

            let registry = self.registry.clone();
            let metrics = self.metrics.clone();
            in_flight.spawn(async move {
                // Outcome is logged and counted inside the cycle.
                let _ = slot.run_cycle(&registry, &metrics, Utc::now()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{labels, MetricKind, SeriesKey, UsageRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a scripted sequence of cumulative totals, one per call
    struct Scripted {
        name: &'static str,
        values: Vec<f64>,
        calls: AtomicUsize,
        windows: parking_lot::Mutex<Vec<TimeWindow>>,
        fail_on: Vec<usize>,
    }

    impl Scripted {
        fn new(name: &'static str, values: Vec<f64>) -> Self {
            Self {
                name,
                values,
                calls: AtomicUsize::new(0),
                windows: parking_lot::Mutex::new(Vec::new()),
                fail_on: Vec::new(),
            }
        }

        fn failing_on(mut self, calls: &[usize]) -> Self {
            self.fail_on = calls.to_vec();
            self
        }
    }

    #[async_trait]
    impl UsageProvider for Arc<Scripted> {
        async fn collect(&self, window: TimeWindow) -> Result<Vec<UsageRecord>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.windows.lock().push(window);
            if self.fail_on.contains(&call) {
                return Err(ProviderError::Malformed {
                    provider: self.name.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            let value = self.values[call.min(self.values.len() - 1)];
            Ok(vec![UsageRecord::new(
                self.name,
                MetricKind::CostUsd,
                labels([("project", "web")]),
                value,
                period_start(),
                window.end,
                true,
            )?])
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    /// Sleeps through several ticks and tracks how many collections overlap
    struct Slow {
        delay: Duration,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl UsageProvider for Arc<Slow> {
        async fn collect(&self, _window: TimeWindow) -> Result<Vec<UsageRecord>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    /// All scripted totals accumulate over one fixed period
    fn period_start() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }

    fn scheduler(providers: Vec<Box<dyn UsageProvider>>, interval_secs: u64) -> Scheduler {
        Scheduler::new(
            providers,
            Arc::new(CounterRegistry::new()),
            Arc::new(SelfMetrics::new().unwrap()),
            Duration::from_secs(interval_secs),
            Duration::from_secs(30),
        )
    }

    fn cost_key(provider: &str) -> SeriesKey {
        SeriesKey::new(provider, MetricKind::CostUsd, [("project", "web")])
    }

    #[tokio::test]
    async fn test_reset_sequence_end_to_end() {
        let provider = Arc::new(Scripted::new("scripted", vec![100.0, 150.0, 40.0, 90.0]));
        let scheduler = scheduler(vec![Box::new(provider) as Box<dyn UsageProvider>], 60);

        let mut previous = 0.0;
        for _ in 0..4 {
            for (_, result) in scheduler.run_once().await {
                result.unwrap();
            }
            let value = scheduler.registry.get(&cost_key("scripted")).unwrap();
            assert!(value >= previous);
            previous = value;
        }
        assert_eq!(previous, 240.0);
    }

    #[tokio::test]
    async fn test_failing_provider_is_isolated() {
        let healthy = Arc::new(Scripted::new("healthy", vec![5.0, 8.0]));
        let flaky = Arc::new(Scripted::new("flaky", vec![3.0]).failing_on(&[0]));
        let scheduler = scheduler(vec![
            Box::new(healthy.clone()) as Box<dyn UsageProvider>,
            Box::new(flaky.clone()),
        ], 60);

        let first = scheduler.run_once().await;
        assert!(first[0].1.is_ok());
        assert!(matches!(first[1].1, Err(CycleError::Provider(_))));
        assert_eq!(scheduler.registry.get(&cost_key("healthy")), Some(5.0));
        assert_eq!(scheduler.registry.get(&cost_key("flaky")), None);

        let second = scheduler.run_once().await;
        assert!(second.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(scheduler.registry.get(&cost_key("healthy")), Some(8.0));
        assert_eq!(scheduler.registry.get(&cost_key("flaky")), Some(3.0));

        // Failed provider retries from the same start; healthy one moves on.
        let flaky_windows = flaky.windows.lock().clone();
        assert_eq!(flaky_windows[1].start, flaky_windows[0].start);
        let healthy_windows = healthy.windows.lock().clone();
        assert_eq!(healthy_windows[1].start, healthy_windows[0].end);

        assert_eq!(scheduler.metrics.cycles("flaky", Outcome::Failure), 1);
        assert_eq!(scheduler.metrics.cycles("flaky", Outcome::Success), 1);
        assert_eq!(
            scheduler.cursor("flaky").await,
            Some(flaky_windows[1].end)
        );
    }

    #[tokio::test]
    async fn test_oversized_interval_clamped() {
        let provider = Arc::new(Scripted::new("scripted", vec![1.0]));
        let scheduler = scheduler(
            vec![Box::new(provider) as Box<dyn UsageProvider>],
            5_000_000_000_000 * 3600,
        );
        assert_eq!(scheduler.interval, MAX_SCRAPE_INTERVAL);

        let cursor = scheduler.cursor("scripted").await.unwrap();
        let lookback = Utc::now() - cursor;
        assert!(lookback >= chrono::Duration::hours(24));
        assert!(lookback < chrono::Duration::hours(25));
    }

    #[tokio::test]
    async fn test_registered_providers_visible_before_first_cycle() {
        let provider = Arc::new(Scripted::new("scripted", vec![1.0]));
        let scheduler = scheduler(vec![Box::new(provider) as Box<dyn UsageProvider>], 60);
        assert_eq!(scheduler.registry.providers(), vec!["scripted".to_string()]);
        assert!(scheduler.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_provider_drops_ticks() {
        let slow = Arc::new(Slow {
            delay: Duration::from_secs(25),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let scheduler = Arc::new(scheduler(vec![Box::new(slow.clone()) as Box<dyn UsageProvider>], 10));
        let shutdown = CancellationToken::new();

        let running = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(65)).await;
        shutdown.cancel();
        running.await.unwrap();

        let calls = slow.calls.load(Ordering::SeqCst);
        assert!((2..=4).contains(&calls), "calls = {calls}");
        assert_eq!(slow.max_active.load(Ordering::SeqCst), 1);
        assert!(scheduler.metrics.dropped_ticks("slow") >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_stuck_cycle_without_touching_state() {
        let stuck = Arc::new(Slow {
            delay: Duration::from_secs(3600),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let scheduler = Arc::new(scheduler(vec![Box::new(stuck.clone()) as Box<dyn UsageProvider>], 10));
        let before = scheduler.cursor("slow").await;
        let shutdown = CancellationToken::new();

        let running = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(stuck.calls.load(Ordering::SeqCst), 1);
        shutdown.cancel();
        running.await.unwrap();

        // Grace (30s) elapsed long before the hour-long collect could finish.
        assert_eq!(scheduler.cursor("slow").await, before);
        assert_eq!(scheduler.metrics.cycles("slow", Outcome::Success), 0);
    }
}
