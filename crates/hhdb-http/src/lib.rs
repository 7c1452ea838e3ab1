//! Single-shot HTTP fetch utilities for HHDB.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "hhdb-http";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response body from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Connection failures, timeouts and non-2xx statuses. A caller may skip
    /// the request and carry on; a decode failure means the endpoint answered
    /// with something other than the expected document.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Request(_) | Self::HttpStatus { .. })
    }
}

/// Issues one GET per call. No retries, no backoff.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        debug!(%status, url = %final_url, "listing response");

        if !status.is_success() {
            return Err(status_error(status, final_url));
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: final_url,
            source,
        })
    }
}

fn status_error(status: StatusCode, url: String) -> FetchError {
    FetchError::HttpStatus {
        status: status.as_u16(),
        url,
    }
}
