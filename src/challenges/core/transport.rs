//! HTTP transport contract used by the session client.
//!
//! The protocol layer only needs "send a request, get status and body back";
//! everything else (cookies, TLS, connection reuse) belongs to the concrete
//! transport.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap};
use http::{HeaderValue, Method};
use thiserror::Error;
use url::Url;

/// Contract that abstracts the underlying HTTP transport.
///
/// Implementations should keep cookies between calls so a session behaves
/// like a single browser tab.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send_form(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        form_fields: &[(String, String)],
    ) -> Result<TransportResponse, TransportError>;

    async fn send_with_body(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<TransportResponse, TransportError>;
}

/// Minimal response representation returned by the transport abstraction.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
}

impl TransportResponse {
    /// Fails with [`TransportError::Status`] on 4xx/5xx responses.
    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if self.status >= 400 {
            return Err(TransportError::Status {
                status: self.status,
                url: self.url.to_string(),
            });
        }
        Ok(self)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

/// Connection and HTTP-level failures. None of these are retried by the core.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("unexpected http status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
}

/// Header value helper that maps conversion failures onto [`TransportError`].
pub fn header_value(name: &str, value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|_| TransportError::InvalidHeader(name.to_string()))
}
