use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn as_label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

pub struct SelfMetrics {
    registry: Registry,
    cycles: IntCounterVec,
    ticks_dropped: IntCounterVec,
    duration: HistogramVec,
    last_success: GaugeVec,
}

impl SelfMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let cycles = IntCounterVec::new(
            Opts::new(
                "robotheus_collection_cycles_total",
                "Collection cycles by provider and outcome",
            ),
            &["provider", "outcome"],
        )?;
        let ticks_dropped = IntCounterVec::new(
            Opts::new(
                "robotheus_collection_ticks_dropped_total",
                "Ticks skipped because the provider's previous collection was still running",
            ),
            &["provider"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "robotheus_collection_duration_seconds",
                "Time spent in one collection cycle",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["provider"],
        )?;
        let last_success = GaugeVec::new(
            Opts::new(
                "robotheus_last_success_timestamp_seconds",
                "Unix time of the provider's last applied collection",
            ),
            &["provider"],
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(ticks_dropped.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(last_success.clone()))?;

        Ok(Self {
            registry,
            cycles,
            ticks_dropped,
            duration,
            last_success,
        })
    }

    pub fn record_cycle(&self, provider: &str, outcome: Outcome, elapsed: Duration) {
        self.cycles
            .with_label_values(&[provider, outcome.as_label()])
            .inc();
        self.duration
            .with_label_values(&[provider])
            .observe(elapsed.as_secs_f64());
        if outcome == Outcome::Success {
            self.last_success
                .with_label_values(&[provider])
                .set(chrono::Utc::now().timestamp() as f64);
        }
    }

    pub fn record_dropped_tick(&self, provider: &str) {
        self.ticks_dropped.with_label_values(&[provider]).inc();
    }

    #[cfg(test)]
    pub fn cycles(&self, provider: &str, outcome: Outcome) -> u64 {
        self.cycles
            .with_label_values(&[provider, outcome.as_label()])
            .get()
    }

    #[cfg(test)]
    pub fn dropped_ticks(&self, provider: &str) -> u64 {
        self.ticks_dropped.with_label_values(&[provider]).get()
    }

    pub fn render(&self) -> String {
        match TextEncoder::new().encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode self-metrics");
                String::new()
            }
        }
    }
}
