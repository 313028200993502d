//! Downloading stored document bytes from a resolved URL.

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

/// Fetches the bytes behind a URL minted by a `DocumentStore`.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Plain HTTP GET.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            bail!("GET {} returned {}", redact_query(url), status);
        }

        let bytes = response.bytes().await?;
        debug!("Fetched {} bytes from {}", bytes.len(), redact_query(url));
        Ok(bytes.to_vec())
    }
}

/// Signed URLs carry their token in the query string; keep it out of logs.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}
