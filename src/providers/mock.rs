use crate::error::ProviderError;
use crate::models::{labels, MetricKind, TimeWindow, UsageRecord};
use crate::providers::UsageProvider;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

pub const PROVIDER: &str = "mock";

/// (model, project, requests per minute, input tokens per request, output tokens per request)
const TRAFFIC: &[(&str, &str, f64, f64, f64)] = &[
    ("gpt-4o", "web", 12.0, 850.0, 320.0),
    ("gpt-4o-mini", "batch", 40.0, 400.0, 90.0),
];

/// USD per second of the day, across all projects
const COST_RATE: f64 = 0.0005;

/// Deterministic synthetic traffic, for demos and dashboards without credentials
pub struct MockProvider;

impl MockProvider {
    pub fn new() -> Self {
        Self
    }

    fn usage_records(window: TimeWindow) -> Result<Vec<UsageRecord>, ProviderError> {
        let minutes = window.duration().num_seconds() as f64 / 60.0;
        let mut records = Vec::new();

        for (model, project, rpm, tokens_in, tokens_out) in TRAFFIC {
            let requests = (rpm * minutes).round();
            let series = labels([("model", *model), ("project", *project), ("api_key", "mock-key")]);

            for (kind, value) in [
                (MetricKind::Requests, requests),
                (MetricKind::TokensIn, requests * tokens_in),
                (MetricKind::TokensOut, requests * tokens_out),
            ] {
                records.push(UsageRecord::new(
                    PROVIDER,
                    kind,
                    series.clone(),
                    value,
                    window.start,
                    window.end,
                    false,
                )?);
            }
        }

        Ok(records)
    }

    fn cost_record(now: DateTime<Utc>) -> Result<UsageRecord, ProviderError> {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        let elapsed = (now - day_start).num_seconds() as f64;

        UsageRecord::new(
            PROVIDER,
            MetricKind::CostUsd,
            labels([("project", "web")]),
            elapsed * COST_RATE,
            day_start,
            day_start + Duration::days(1),
            true,
        )
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageProvider for MockProvider {
    async fn collect(&self, window: TimeWindow) -> Result<Vec<UsageRecord>, ProviderError> {
        let mut records = Self::usage_records(window)?;
        records.push(Self::cost_record(window.end)?);
        Ok(records)
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}
