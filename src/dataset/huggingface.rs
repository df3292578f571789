//! Client for the HuggingFace datasets-server rows API.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::SweBenchInstance;
use crate::error::DatasetError;

/// Base URL for HuggingFace datasets server rows API.
const HUGGINGFACE_ROWS_API: &str = "https://datasets-server.huggingface.co/rows";

/// Paging and retry settings.
#[derive(Debug, Clone)]
pub struct RowsClientConfig {
    /// Rows requested per page. The server caps this at 100.
    pub page_size: usize,
    /// Delay between page requests in milliseconds.
    pub rate_limit_delay_ms: u64,
    /// Retries for a page after rate limiting or a transport error.
    pub max_retries: u32,
}

impl Default for RowsClientConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            rate_limit_delay_ms: 100,
            max_retries: 3,
        }
    }
}

pub struct HuggingFaceRowsClient {
    http_client: Client,
    base_url: String,
    config: RowsClientConfig,
}

#[derive(Debug, Deserialize)]
struct RowsResponse {
    rows: Vec<Row>,
    num_rows_total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct Row {
    row: SweBenchInstance,
}

impl Default for HuggingFaceRowsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HuggingFaceRowsClient {
    pub fn new() -> Self {
        Self::with_base_url(HUGGINGFACE_ROWS_API)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into(),
            config: RowsClientConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RowsClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Fetch one page.
    async fn fetch_page(
        &self,
        dataset: &str,
        split: &str,
        offset: usize,
    ) -> Result<RowsResponse, DatasetError> {
        let offset_str = offset.to_string();
        let length_str = self.config.page_size.to_string();
        let response = self
            .http_client
            .get(&self.base_url)
            .query(&[
                ("dataset", dataset),
                ("config", "default"),
                ("split", split),
                ("offset", offset_str.as_str()),
                ("length", length_str.as_str()),
            ])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| DatasetError::HttpError(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(DatasetError::RateLimited);
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DatasetError::HttpError(format!(
                "API returned status {}: {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| DatasetError::ParseError(format!("Failed to parse response: {}", e)))
    }

    async fn fetch_page_with_retry(
        &self,
        dataset: &str,
        split: &str,
        offset: usize,
    ) -> Result<RowsResponse, DatasetError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_page(dataset, split, offset).await {
                Err(e @ (DatasetError::RateLimited | DatasetError::HttpError(_)))
                    if attempt < self.config.max_retries =>
                {
                    attempt += 1;
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    warn!(offset, attempt, error = %e, "Rows request failed, retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Fetch every row of `dataset` / `split`.
    pub async fn fetch_all(
        &self,
        dataset: &str,
        split: &str,
    ) -> Result<Vec<SweBenchInstance>, DatasetError> {
        let mut instances = Vec::new();
        let mut offset = 0usize;
        loop {
            let page = self.fetch_page_with_retry(dataset, split, offset).await?;
            let received = page.rows.len();
            instances.extend(page.rows.into_iter().map(|r| r.row));
            offset += received;
            debug!(dataset, offset, total = ?page.num_rows_total, "Fetched rows page");

            let done = match page.num_rows_total {
                Some(total) => offset >= total,
                None => received < self.config.page_size,
            };
            if done || received == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.rate_limit_delay_ms)).await;
        }
        Ok(instances)
    }
}
