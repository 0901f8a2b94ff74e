//! DoH (DNS over HTTPS) upstream transport.
//!
//! Forwards a raw DNS query as an RFC 8484 GET request: the message is
//! base64url-encoded (no padding) into the `dns` query parameter and the
//! response body is returned untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tracing::debug;

/// Content type for DNS messages.
pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid DoH endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("could not perform request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream request timed out")]
    Timeout,
    #[error("wrong response from DoH server: {0}")]
    Status(StatusCode),
    #[error("could not read message from response: {0}")]
    Body(#[source] reqwest::Error),
}

/// Something that can resolve a raw DNS query into a raw DNS response.
///
/// Implementations must support many concurrent outstanding queries.
pub trait DohClient: Send + Sync {
    fn query(&self, raw: &[u8]) -> impl Future<Output = Result<Vec<u8>, UpstreamError>> + Send;
}

impl<T: DohClient> DohClient for Arc<T> {
    fn query(&self, raw: &[u8]) -> impl Future<Output = Result<Vec<u8>, UpstreamError>> + Send {
        (**self).query(raw)
    }
}

/// DoH client backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpsUpstream {
    client: Client,
    endpoint: Url,
}

impl HttpsUpstream {
    /// Create a client for `endpoint`.
    ///
    /// `timeout` bounds each whole request, body included.
    pub fn new(endpoint: &str, timeout: Option<Duration>) -> Result<Self, UpstreamError> {
        let invalid = |reason: String| UpstreamError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason,
        };

        let endpoint_url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
        if !matches!(endpoint_url.scheme(), "https" | "http") {
            return Err(invalid(format!(
                "unsupported scheme {:?}",
                endpoint_url.scheme()
            )));
        }

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(UpstreamError::Client)?;

        Ok(Self {
            client,
            endpoint: endpoint_url,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Build the GET URL carrying `raw` in the `dns` parameter.
    pub fn request_url(&self, raw: &[u8]) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("dns", &URL_SAFE_NO_PAD.encode(raw));
        url
    }
}

impl DohClient for HttpsUpstream {
    async fn query(&self, raw: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let url = self.request_url(raw);
        debug!(%url, "sending DoH request");

        let response = self
            .client
            .get(url)
            .header(CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .header(ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .send()
            .await
            .map_err(classify)?;

        if response.status() != StatusCode::OK {
            return Err(UpstreamError::Status(response.status()));
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout
            } else {
                UpstreamError::Body(e)
            }
        })?;

        Ok(body.to_vec())
    }
}

fn classify(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout
    } else {
        UpstreamError::Request(err)
    }
}
