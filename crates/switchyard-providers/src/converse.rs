//! Converse-compatible HTTP backend.
//!
//! Buffered calls go to `POST {base}/model/{model}/converse`; streamed calls
//! go to `POST {base}/model/{model}/converse-stream` and return NDJSON.

use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tracing::debug;

use switchyard_core::config::ProviderConfig;
use switchyard_core::error::BackendError;

use crate::ndjson::parse_ndjson_stream;
use crate::wire::{ConverseResponse, request_body};
use crate::{ConverseInput, ConverseOutput, ConverseProvider, EventStream, transport_error};

pub struct ConverseHttpProvider {
    id: String,
    pub base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ConverseHttpProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> anyhow::Result<Self> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("Provider '{}' requires a base_url", config.id)
        })?;
        Self::new(
            config.id.clone(),
            base_url,
            config.resolve_api_key(),
            Duration::from_secs(config.timeout_secs()),
        )
    }

    async fn post(
        &self,
        input: &ConverseInput,
        operation: &str,
    ) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}/model/{}/{operation}", self.base_url, input.model_id);
        debug!(provider = %self.id, model = %input.model_id, %operation, "Calling converse backend");

        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(&request_body(input));
        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let response = req.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_http(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ConverseProvider for ConverseHttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn converse(&self, input: &ConverseInput) -> Result<ConverseOutput, BackendError> {
        let response = self.post(input, "converse").await?;
        let body: ConverseResponse = response.json().await.map_err(transport_error)?;
        Ok(body.into_output())
    }

    async fn converse_stream(&self, input: &ConverseInput) -> Result<EventStream, BackendError> {
        let response = self.post(input, "converse-stream").await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport_error));
        Ok(parse_ndjson_stream(bytes))
    }
}
