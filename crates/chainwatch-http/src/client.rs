//! Token metadata client backed by `reqwest`.
//!
//! Features:
//! - Credential drawn from the shared pool on every request
//! - Reactive rotation when the provider answers HTTP 429
//! - Tolerant parsing of the provider's nested metadata shapes

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use chainwatch_core::credentials::{redact, CredentialPool};
use chainwatch_core::error::MetadataError;
use chainwatch_core::metadata::MetadataSource;
use chainwatch_core::types::TokenMetadata;

/// Configuration for `HttpMetadataClient`.
#[derive(Debug, Clone)]
pub struct MetadataClientConfig {
    pub url: String,
    pub request_timeout: Duration,
}

impl MetadataClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// REST metadata source sharing the engine's credential pool.
pub struct HttpMetadataClient {
    url: String,
    http: reqwest::Client,
    credentials: Arc<CredentialPool>,
}

impl HttpMetadataClient {
    pub fn new(config: MetadataClientConfig, credentials: Arc<CredentialPool>) -> Self {
        // Builder only fails on TLS backend init; fall back to the default client.
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "custom HTTP client unavailable, using defaults");
                reqwest::Client::new()
            });
        Self {
            url: config.url,
            http,
            credentials,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_once(&self, mint: &str, key: &str) -> Result<TokenMetadata, MetadataError> {
        let unavailable = |reason: String| MetadataError::Unavailable {
            mint: mint.to_string(),
            reason,
        };

        let resp = self
            .http
            .post(&self.url)
            .query(&[("api-key", key)])
            .json(&json!({ "mintAccounts": [mint] }))
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(MetadataError::RateLimited);
        }
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(unavailable(format!("HTTP {status}: {body}")));
        }

        let body: Value = resp.json().await.map_err(|e| unavailable(e.to_string()))?;
        parse_metadata(&body, mint).ok_or_else(|| unavailable("no symbol in response".into()))
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataClient {
    /// One attempt per credential at most; a 429 cools the key and moves on.
    async fn fetch(&self, mint: &str) -> Result<TokenMetadata, MetadataError> {
        let attempts = self.credentials.len().max(1);
        for attempt in 1..=attempts {
            let credential = self.credentials.active()?;
            self.credentials.record_call();
            match self.send_once(mint, &credential.key).await {
                Err(MetadataError::RateLimited) => {
                    tracing::warn!(
                        attempt,
                        key = %redact(&credential.key),
                        mint,
                        "metadata request rate limited, rotating credential"
                    );
                    self.credentials.report_rate_limited(&credential)?;
                }
                other => return other,
            }
        }
        Err(MetadataError::RateLimited)
    }

    fn name(&self) -> &str {
        &self.url
    }
}

/// Extract symbol and decimals for `mint` from a metadata response.
///
/// The response is a list of entries; each may carry the symbol under
/// `onChainMetadata.metadata.data.symbol` or `legacyMetadata.symbol`, and
/// decimals under `legacyMetadata.decimals` or the parsed mint account info.
pub fn parse_metadata(body: &Value, mint: &str) -> Option<TokenMetadata> {
    let entries: Vec<&Value> = match body {
        Value::Array(items) => items.iter().collect(),
        obj @ Value::Object(_) => vec![obj],
        _ => return None,
    };
    let entry = entries
        .iter()
        .find(|e| e.get("account").and_then(Value::as_str) == Some(mint))
        .or_else(|| entries.first())?;

    let symbol = [
        entry.pointer("/onChainMetadata/metadata/data/symbol"),
        entry.pointer("/legacyMetadata/symbol"),
        entry.pointer("/symbol"),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    // On-chain symbols are NUL-padded.
    .map(|s| s.trim_matches(char::from(0)).trim())
    .find(|s| !s.is_empty())?
    .to_string();

    let decimals = [
        entry.pointer("/legacyMetadata/decimals"),
        entry.pointer("/onChainAccountInfo/accountInfo/data/parsed/info/decimals"),
        entry.pointer("/decimals"),
    ]
    .into_iter()
    .flatten()
    .find_map(Value::as_u64)
    .and_then(|d| u8::try_from(d).ok())
    .unwrap_or(0);

    Some(TokenMetadata { symbol, decimals })
}
