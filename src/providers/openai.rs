use crate::config::OpenAiConfig;
use crate::error::ProviderError;
use crate::models::{labels, Labels, MetricKind, TimeWindow, UsageRecord};
use crate::providers::UsageProvider;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::{try_join, try_join_all};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

pub const PROVIDER: &str = "openai";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/organization";
const USER_AGENT: &str = "robotheus";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const UNKNOWN: &str = "unknown";
const MAX_PAGES: usize = 500;

/// (endpoint, group_by)
const USAGE_ENDPOINTS: &[(&str, &str)] = &[
    ("completions", "project_id,api_key_id,model"),
    ("embeddings", "project_id,api_key_id,model"),
    ("moderations", "project_id,api_key_id,model"),
    ("images", "project_id,api_key_id,model"),
    ("audio_speeches", "project_id,api_key_id,model"),
    ("audio_transcriptions", "project_id,api_key_id,model"),
    ("vector_stores", "project_id"),
];

const MINUTE: i64 = 60;
const DAY: i64 = 86_400;

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct Page<T> {
    #[serde(default)]
    data: Vec<Bucket<T>>,
    #[serde(default)]
    has_more: bool,
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct Bucket<T> {
    start_time: i64,
    end_time: i64,
    #[serde(default)]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct UsageResult {
    project_id: Option<String>,
    api_key_id: Option<String>,
    model: Option<String>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    #[serde(default)]
    num_model_requests: u64,
}

#[derive(Debug, Deserialize)]
struct CostResult {
    project_id: Option<String>,
    amount: Option<CostAmount>,
}

#[derive(Debug, Deserialize)]
struct CostAmount {
    #[serde(default)]
    value: f64,
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    name: Option<String>,
}

/// Aggregation key; ordered by window end first so output is chronological.
type BucketKey = (i64, i64, MetricKind, Labels);

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    /// project_id -> display name, for the process lifetime. One lookup per id
    /// even when several endpoints ask at once.
    project_names: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
}

impl OpenAiProvider {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key.trim()))
            .context("OpenAI API key contains invalid header characters")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        if let Some(org_id) = config
            .org_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            headers.insert(
                "openai-organization",
                HeaderValue::from_str(org_id).context("Invalid OpenAI organization id")?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build OpenAI HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: REQUEST_TIMEOUT,
            project_names: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch every page of one endpoint. `Ok(None)` means the key may not read it (HTTP 403).
    async fn fetch_pages<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Option<Vec<Bucket<T>>>, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let mut buckets = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page = 0;

        loop {
            let mut request = self
                .client
                .get(&url)
                .timeout(self.request_timeout)
                .query(params);
            if let Some(cursor) = &cursor {
                request = request.query(&[("page", cursor)]);
            }

            debug!(provider = PROVIDER, endpoint, page, "fetching page");
            let response = request.send().await.map_err(|source| ProviderError::Network {
                provider: PROVIDER.to_string(),
                endpoint: endpoint.to_string(),
                source,
            })?;

            let status = response.status();
            if status == reqwest::StatusCode::FORBIDDEN {
                if page == 0 {
                    debug!(provider = PROVIDER, endpoint, "endpoint forbidden for this key, skipping");
                    return Ok(None);
                }
                return Err(ProviderError::Pagination {
                    provider: PROVIDER.to_string(),
                    endpoint: endpoint.to_string(),
                    page,
                    reason: "access revoked mid-pagination".to_string(),
                });
            }
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ProviderError::Auth {
                    provider: PROVIDER.to_string(),
                    endpoint: endpoint.to_string(),
                    status: status.as_u16(),
                });
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Http {
                    provider: PROVIDER.to_string(),
                    endpoint: endpoint.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }

            let bytes = response.bytes().await.map_err(|source| ProviderError::Network {
                provider: PROVIDER.to_string(),
                endpoint: endpoint.to_string(),
                source,
            })?;
            let body: Page<T> =
                serde_json::from_slice(&bytes).map_err(|e| ProviderError::Malformed {
                    provider: PROVIDER.to_string(),
                    reason: format!("{} page {}: {}", endpoint, page, e),
                })?;

            page += 1;
            buckets.extend(body.data);

            if !body.has_more {
                break;
            }
            match body.next_page.filter(|p| !p.is_empty()) {
                Some(next) if page < MAX_PAGES => cursor = Some(next),
                Some(_) => {
                    return Err(ProviderError::Pagination {
                        provider: PROVIDER.to_string(),
                        endpoint: endpoint.to_string(),
                        page,
                        reason: format!("more than {} pages", MAX_PAGES),
                    })
                }
                None => {
                    return Err(ProviderError::Pagination {
                        provider: PROVIDER.to_string(),
                        endpoint: endpoint.to_string(),
                        page,
                        reason: "has_more set without next_page".to_string(),
                    })
                }
            }
        }

        debug!(provider = PROVIDER, endpoint, pages = page, buckets = buckets.len(), "endpoint done");
        Ok(Some(buckets))
    }

    async fn fetch_usage(
        &self,
        endpoint: &str,
        group_by: &str,
        window: TimeWindow,
    ) -> Result<Vec<(BucketKey, f64)>, ProviderError> {
        let start = align_down(window.start.timestamp(), MINUTE);
        let end = window.end.timestamp();
        let params = [
            ("start_time", start.to_string()),
            ("end_time", end.to_string()),
            ("bucket_width", "1m".to_string()),
            ("limit", "1440".to_string()),
            ("group_by", group_by.to_string()),
        ];

        let path = format!("/usage/{}", endpoint);
        let Some(buckets) = self
            .fetch_pages::<UsageResult>(endpoint, &path, &params)
            .await?
        else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for bucket in buckets {
            // Still filling up; it will be collected complete next cycle.
            if bucket.end_time > end {
                continue;
            }
            for result in bucket.results {
                let project = self.project_name(result.project_id.as_deref()).await?;
                let series = labels([
                    ("model", non_empty(result.model.as_deref())),
                    ("project", project.as_str()),
                    ("api_key", non_empty(result.api_key_id.as_deref())),
                ]);

                let mut push = |kind: MetricKind, value: u64| {
                    out.push((
                        (bucket.end_time, bucket.start_time, kind, series.clone()),
                        value as f64,
                    ));
                };
                push(MetricKind::Requests, result.num_model_requests);
                if let Some(tokens) = result.input_tokens {
                    push(MetricKind::TokensIn, tokens);
                }
                if let Some(tokens) = result.output_tokens {
                    push(MetricKind::TokensOut, tokens);
                }
            }
        }
        Ok(out)
    }

    async fn fetch_costs(&self, window: TimeWindow) -> Result<Vec<(BucketKey, f64)>, ProviderError> {
        let start = align_down(window.start.timestamp(), DAY);
        let end = window.end.timestamp();
        let params = [
            ("start_time", start.to_string()),
            ("end_time", end.to_string()),
            ("bucket_width", "1d".to_string()),
            ("limit", "180".to_string()),
            ("group_by", "project_id".to_string()),
        ];

        let Some(buckets) = self
            .fetch_pages::<CostResult>("costs", "/costs", &params)
            .await?
        else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for bucket in buckets.into_iter().filter(|b| b.start_time < end) {
            for result in bucket.results {
                let project = self.project_name(result.project_id.as_deref()).await?;
                let value = result.amount.map(|a| a.value).unwrap_or(0.0);
                out.push((
                    (
                        bucket.end_time,
                        bucket.start_time,
                        MetricKind::CostUsd,
                        labels([("project", project.as_str())]),
                    ),
                    value,
                ));
            }
        }
        Ok(out)
    }

    /// Resolve a project id to its name. Unresolvable ids keep the id itself so
    /// the label stays stable across cycles.
    async fn project_name(&self, project_id: Option<&str>) -> Result<String, ProviderError> {
        let id = match project_id.map(str::trim) {
            Some(id) if !id.is_empty() && id != UNKNOWN => id,
            _ => return Ok(UNKNOWN.to_string()),
        };

        let cell = self
            .project_names
            .lock()
            .entry(id.to_string())
            .or_default()
            .clone();
        // A transport error leaves the cell empty, so a later cycle retries.
        let name = cell.get_or_try_init(|| self.fetch_project_name(id)).await?;
        Ok(name.clone())
    }

    async fn fetch_project_name(&self, id: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(format!("{}/projects/{}", self.base_url, id))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|source| ProviderError::Network {
                provider: PROVIDER.to_string(),
                endpoint: format!("projects/{}", id),
                source,
            })?;

        if !response.status().is_success() {
            debug!(
                provider = PROVIDER,
                project_id = id,
                status = response.status().as_u16(),
                "project name unavailable, using id"
            );
            return Ok(id.to_string());
        }

        Ok(response
            .json::<ProjectResponse>()
            .await
            .ok()
            .and_then(|p| p.name)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| id.to_string()))
    }
}

#[async_trait]
impl UsageProvider for OpenAiProvider {
    async fn collect(&self, window: TimeWindow) -> Result<Vec<UsageRecord>, ProviderError> {
        let usage = try_join_all(
            USAGE_ENDPOINTS
                .iter()
                .map(|(endpoint, group_by)| self.fetch_usage(endpoint, group_by, window)),
        );
        let (usage, costs) = try_join(usage, self.fetch_costs(window)).await?;

        let mut totals: BTreeMap<BucketKey, f64> = BTreeMap::new();
        for (key, value) in usage.into_iter().flatten().chain(costs) {
            *totals.entry(key).or_insert(0.0) += value;
        }

        totals
            .into_iter()
            .map(|((end, start, kind, series), value)| {
                UsageRecord::new(
                    PROVIDER,
                    kind,
                    series,
                    value,
                    timestamp(start)?,
                    timestamp(end)?,
                    kind == MetricKind::CostUsd,
                )
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

fn align_down(secs: i64, width: i64) -> i64 {
    secs - secs.rem_euclid(width)
}

fn non_empty(value: Option<&str>) -> &str {
    value.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(UNKNOWN)
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, ProviderError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| ProviderError::Malformed {
            provider: PROVIDER.to_string(),
            reason: format!("bucket timestamp {} out of range", secs),
        })
}
