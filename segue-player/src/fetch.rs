//! Network access for manifests and segments
//!
//! A [`Fetcher`] returns the whole response body. Callers race every fetch
//! against a cancellation token, so implementations may ignore the token.

use crate::config::FetchOptions;
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Complete response
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Bytes,
}

impl FetchResponse {
    /// Whether the status is 2xx
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<FetchResponse>>;
}

/// Run a fetch, resolving to `Error::Cancelled` as soon as `cancel` fires
pub async fn fetch_cancellable(
    fetcher: &dyn Fetcher,
    url: &str,
    options: &FetchOptions,
    cancel: CancellationToken,
) -> Result<FetchResponse> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let request = fetcher.fetch(url, options, cancel.clone());
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        response = request => response,
    }
}

/// HTTP fetcher backed by reqwest
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<FetchResponse>> {
        let mut request = self.client.get(url);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let url = url.to_string();

        async move {
            debug!(url = %url, "GET");
            let send = async {
                let response = request.send().await.map_err(|e| Error::Load {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
                let status = response.status().as_u16();
                let body = response.bytes().await.map_err(|e| Error::Load {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
                Ok(FetchResponse { status, body })
            };
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                response = send => response,
            }
        }
        .boxed()
    }
}

#[derive(Clone)]
enum MemoryEntry {
    Ok(Bytes),
    Status(u16),
    Fail(String),
}

/// Serves registered resources from memory
///
/// Unknown URLs answer 404. An optional latency delays every response.
#[derive(Clone, Default)]
pub struct MemoryFetcher {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
    requests: Arc<Mutex<HashMap<String, usize>>>,
    total: Arc<AtomicUsize>,
    latency: Option<Duration>,
    last_headers: Arc<Mutex<Option<FetchOptions>>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(url.into(), MemoryEntry::Ok(body.into()));
    }

    /// Answer `url` with an empty body and `status`
    pub fn insert_status(&self, url: impl Into<String>, status: u16) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(url.into(), MemoryEntry::Status(status));
    }

    /// Fail requests for `url` with a load error
    pub fn fail(&self, url: impl Into<String>, reason: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(url.into(), MemoryEntry::Fail(reason.into()));
    }

    /// Number of requests issued for `url`
    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Options passed with the most recent request
    pub fn last_options(&self) -> Option<FetchOptions> {
        self.last_headers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<FetchResponse>> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(url.to_string())
            .or_default() += 1;
        *self.last_headers.lock().unwrap_or_else(|p| p.into_inner()) = Some(options.clone());

        let entry = self
            .entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(url)
            .cloned();
        let latency = self.latency;
        let url = url.to_string();

        async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            match entry {
                Some(MemoryEntry::Ok(body)) => Ok(FetchResponse { status: 200, body }),
                Some(MemoryEntry::Status(status)) => Ok(FetchResponse {
                    status,
                    body: Bytes::new(),
                }),
                Some(MemoryEntry::Fail(reason)) => Err(Error::Load { url, reason }),
                None => Ok(FetchResponse {
                    status: 404,
                    body: Bytes::new(),
                }),
            }
        }
        .boxed()
    }
}
