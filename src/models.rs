use crate::error::ProviderError;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Label name -> label value. Sorted, so insertion order never affects equality.
pub type Labels = BTreeMap<String, String>;

/// What a usage record counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricKind {
    Requests,
    TokensIn,
    TokensOut,
    CostUsd,
}

impl MetricKind {
    /// Family suffix used in `robotheus_<provider>_<suffix>`
    pub fn family(&self) -> &'static str {
        match self {
            MetricKind::Requests => "requests_total",
            MetricKind::TokensIn | MetricKind::TokensOut => "tokens_total",
            MetricKind::CostUsd => "cost_usd_total",
        }
    }

    /// Extra `direction` label for token families
    pub fn direction(&self) -> Option<&'static str> {
        match self {
            MetricKind::TokensIn => Some("input"),
            MetricKind::TokensOut => Some("output"),
            _ => None,
        }
    }
}

/// Time range a collection cycle asks a provider about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        // A clock stepping backwards must not produce an inverted window.
        Self {
            start: start.min(end),
            end,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// One normalized observation from a provider for one reporting bucket
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub provider: String,
    pub metric_kind: MetricKind,
    pub labels: Labels,
    pub value: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// `value` is a total-to-date for the period starting at `window_start`
    pub cumulative: bool,
}

impl UsageRecord {
    /// Validating constructor; adapters surface violations as malformed responses.
    pub fn new(
        provider: &str,
        metric_kind: MetricKind,
        labels: Labels,
        value: f64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        cumulative: bool,
    ) -> Result<Self, ProviderError> {
        if !value.is_finite() || value < 0.0 {
            return Err(ProviderError::Malformed {
                provider: provider.to_string(),
                reason: format!("{:?} value {} is not a non-negative number", metric_kind, value),
            });
        }
        if window_start > window_end {
            return Err(ProviderError::Malformed {
                provider: provider.to_string(),
                reason: format!("window starts at {} after it ends at {}", window_start, window_end),
            });
        }

        Ok(Self {
            provider: provider.to_string(),
            metric_kind,
            labels,
            value,
            window_start,
            window_end,
            cumulative,
        })
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey {
            provider: self.provider.clone(),
            metric_kind: self.metric_kind,
            labels: self.labels.clone(),
        }
    }
}

/// Identity of one counter time series
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub provider: String,
    pub metric_kind: MetricKind,
    pub labels: Labels,
}

impl SeriesKey {
    pub fn new<'a, I>(provider: &str, metric_kind: MetricKind, labels: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            provider: provider.to_string(),
            metric_kind,
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Full exposed metric name
    pub fn metric_name(&self) -> String {
        metric_name(&self.provider, self.metric_kind)
    }
}

pub fn metric_name(provider: &str, kind: MetricKind) -> String {
    format!("robotheus_{}_{}", provider, kind.family())
}

pub fn labels<'a, I>(pairs: I) -> Labels
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
