pub mod mock;
pub mod openai;

use crate::config::Config;
use crate::error::ProviderError;
use crate::models::{TimeWindow, UsageRecord};
use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// One vendor's usage/billing API, normalized.
///
/// `collect` either returns the complete snapshot for the window or fails;
/// a partially fetched snapshot must never be returned.
#[async_trait]
pub trait UsageProvider: Send + Sync {
    async fn collect(&self, window: TimeWindow) -> Result<Vec<UsageRecord>, ProviderError>;

    /// Stable id used in metric names and the `provider` field of records
    fn name(&self) -> &'static str;
}

/// Build every provider enabled by the configuration.
pub fn from_config(config: &Config, use_mock: bool) -> Result<Vec<Box<dyn UsageProvider>>> {
    let mut providers: Vec<Box<dyn UsageProvider>> = Vec::new();

    if use_mock {
        providers.push(Box::new(mock::MockProvider::new()));
        info!(provider = mock::PROVIDER, "provider enabled");
    }

    if let Some(openai) = config.openai() {
        providers.push(Box::new(openai::OpenAiProvider::new(openai)?));
        info!(provider = openai::PROVIDER, "provider enabled");
    }

    if providers.is_empty() {
        anyhow::bail!("No providers configured. Set OPENAI_API_KEY or pass --mock.");
    }

    Ok(providers)
}
