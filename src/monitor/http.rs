// src/monitor/http.rs
//! Lightweight metadata fetch used to fingerprint a source without ingesting it.

use anyhow::{Context, Result};
use reqwest::header::{CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::CheckMethod;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Hex SHA-256 fingerprint.
    pub hash: String,
    pub last_modified: Option<String>,
    pub size: Option<u64>,
}

#[async_trait::async_trait]
pub trait MetadataChecker: Send + Sync {
    async fn check(&self, url: &str, method: CheckMethod) -> Result<Metadata>;
}

pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
        // separator so ("ab","c") and ("a","bc") differ
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

pub struct HttpMetadataChecker {
    client: Client,
    timeout: Duration,
}

impl HttpMetadataChecker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("apl-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client, timeout })
    }

    async fn head(&self, url: &str) -> Result<reqwest::Response> {
        self.client
            .head(url)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("HEAD {url}"))?
            .error_for_status()
            .with_context(|| format!("HEAD {url}"))
    }

    /// Full-content fingerprint: SHA-256 of the response body.
    async fn body_fingerprint(&self, url: &str) -> Result<Metadata> {
        let rsp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        let last_modified = header_str(&rsp, LAST_MODIFIED);
        let body = rsp.bytes().await.with_context(|| format!("reading body of {url}"))?;
        Ok(Metadata {
            hash: sha256_hex(&[&body[..]]),
            last_modified,
            size: Some(body.len() as u64),
        })
    }
}

fn header_str(rsp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    rsp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

fn head_fingerprint(last_modified: Option<&str>, size: Option<u64>) -> String {
    let size = size.map(|n| n.to_string()).unwrap_or_default();
    sha256_hex(&[last_modified.unwrap_or("").as_bytes(), size.as_bytes()])
}

#[async_trait::async_trait]
impl MetadataChecker for HttpMetadataChecker {
    async fn check(&self, url: &str, method: CheckMethod) -> Result<Metadata> {
        match method {
            CheckMethod::Head | CheckMethod::Etag => {
                let rsp = self.head(url).await?;
                let last_modified = header_str(&rsp, LAST_MODIFIED);
                let size = header_str(&rsp, CONTENT_LENGTH).and_then(|s| s.parse().ok());
                let etag = header_str(&rsp, ETAG).filter(|_| method == CheckMethod::Etag);
                let hash = match (etag, &last_modified, size) {
                    (Some(tag), _, _) => sha256_hex(&[b"etag".as_slice(), tag.as_bytes()]),
                    // no validators at all: only the body can tell versions apart
                    (None, None, None) => {
                        tracing::debug!(target: "monitor", url, "HEAD carries no validators, hashing body");
                        return self.body_fingerprint(url).await;
                    }
                    (None, lm, size) => head_fingerprint(lm.as_deref(), size),
                };
                Ok(Metadata {
                    hash,
                    last_modified,
                    size,
                })
            }
            CheckMethod::Get => self.body_fingerprint(url).await,
        }
    }
}
