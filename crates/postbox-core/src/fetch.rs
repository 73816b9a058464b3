//! Remote sources for webreference content.
//!
//! The cache reads remote content through the [`RemoteSource`] trait so that
//! transports can be swapped out. [`HttpSource`] is the reqwest-backed
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::REFERER;
use reqwest::Client;
use tracing::debug;

use crate::{CoreError, Result};

/// Context of the request that triggered a fetch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Scheme and host of the serving endpoint, e.g. `https://box.example`.
    pub hostpart: String,
    /// Path of the current request.
    pub path: String,
}

impl RequestContext {
    /// Create a request context.
    pub fn new(hostpart: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            hostpart: hostpart.into(),
            path: path.into(),
        }
    }

    /// Value of the `Referer` header: base URL plus current path.
    pub fn referer(&self) -> String {
        let host = self.hostpart.trim_end_matches('/');
        if self.path.starts_with('/') {
            format!("{}{}", host, self.path)
        } else {
            format!("{}/{}", host, self.path)
        }
    }
}

/// A GET request for remote content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    /// Location of the content.
    pub url: String,
    /// `Referer` header value.
    pub referer: String,
}

/// Streaming body of a remote response.
#[async_trait]
pub trait RemoteBody: Send {
    /// Length declared by the remote, if any.
    fn content_length(&self) -> Option<u64>;

    /// Next piece of the body; `None` at the end.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Source of remote content.
///
/// Implementations MUST map network, TLS and status failures to
/// [`CoreError::RemoteUnavailable`] and never retry on their own.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Start a GET request and return the body once headers arrived.
    async fn get(&self, request: &FetchRequest) -> Result<Box<dyn RemoteBody>>;
}

/// reqwest-backed remote source.
#[derive(Clone, Debug)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    /// Create a source whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::RemoteUnavailable(e.to_string()))?;
        Ok(Self { client })
    }
}

struct HttpBody {
    response: reqwest::Response,
}

#[async_trait]
impl RemoteBody for HttpBody {
    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|e| CoreError::RemoteUnavailable(e.to_string()))
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn get(&self, request: &FetchRequest) -> Result<Box<dyn RemoteBody>> {
        debug!(url = %request.url, "fetching remote content");
        let response = self
            .client
            .get(&request.url)
            .header(REFERER, &request.referer)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| CoreError::RemoteUnavailable(e.to_string()))?;
        Ok(Box::new(HttpBody { response }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referer_joins_host_and_path() {
        let ctx = RequestContext::new("https://box.example/", "/refs/7");
        assert_eq!(ctx.referer(), "https://box.example/refs/7");

        let ctx = RequestContext::new("https://box.example", "refs/7");
        assert_eq!(ctx.referer(), "https://box.example/refs/7");
    }
}
