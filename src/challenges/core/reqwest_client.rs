//! Reqwest-based implementation of the `ApiTransport` trait.
//!
//! Provides a thin adapter around `reqwest::Client` that converts between the
//! shared HTTP representations used by the session client and the concrete
//! transport.

use std::time::Duration;

use async_trait::async_trait;
use http::{
    HeaderMap as HttpHeaderMap, HeaderName as HttpHeaderName, HeaderValue as HttpHeaderValue,
    Method as HttpMethod,
};
use reqwest::{Client, Method, header::HeaderMap};
use url::Url;

use super::{ApiTransport, TransportError, TransportResponse};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Reqwest-backed HTTP transport.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a client with a cookie store and the default request timeout.
    /// Redirects are followed, matching what a browser does against the API.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError::Transport(err.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an existing reqwest client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ApiTransport for ReqwestTransport {
    async fn send_form(
        &self,
        method: &HttpMethod,
        url: &Url,
        headers: &HttpHeaderMap,
        form_fields: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        let req_method = map_method(method)?;
        let req_headers = convert_headers(headers)?;

        let response = self
            .client
            .request(req_method, url.as_str())
            .headers(req_headers)
            .form(form_fields)
            .send()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;

        to_transport_response(response).await
    }

    async fn send_with_body(
        &self,
        method: &HttpMethod,
        url: &Url,
        headers: &HttpHeaderMap,
        body: Option<&[u8]>,
    ) -> Result<TransportResponse, TransportError> {
        let req_method = map_method(method)?;
        let req_headers = convert_headers(headers)?;

        let mut builder = self
            .client
            .request(req_method, url.as_str())
            .headers(req_headers);

        if let Some(data) = body {
            builder = builder.body(data.to_vec());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;

        to_transport_response(response).await
    }
}

fn map_method(method: &HttpMethod) -> Result<Method, TransportError> {
    Method::from_bytes(method.as_str().as_bytes())
        .map_err(|err| TransportError::Transport(err.to_string()))
}

fn convert_headers(headers: &HttpHeaderMap) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|_| TransportError::InvalidHeader(name.to_string()))?;
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(name.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

async fn to_transport_response(
    response: reqwest::Response,
) -> Result<TransportResponse, TransportError> {
    let status = response.status().as_u16();
    let headers = convert_back_headers(response.headers())?;
    let url = response.url().clone();
    let body = response
        .bytes()
        .await
        .map_err(|err| TransportError::Transport(err.to_string()))?;

    Ok(TransportResponse {
        status,
        headers,
        body,
        url,
    })
}

fn convert_back_headers(map: &HeaderMap) -> Result<HttpHeaderMap, TransportError> {
    let mut headers = HttpHeaderMap::new();
    for (name, value) in map.iter() {
        let http_name = HttpHeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|_| TransportError::InvalidHeader(name.to_string()))?;
        let http_value = HttpHeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(name.to_string()))?;
        headers.insert(http_name, http_value);
    }
    Ok(headers)
}
