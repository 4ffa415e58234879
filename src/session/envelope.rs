//! Response envelope shared by every API endpoint.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::challenges::core::{AnswerError, TransportError};

/// Status code the API uses for an accepted request.
pub const API_OK: i64 = 200;

/// Errors raised by [`super::SessionClient`]. None of them are retried here.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("malformed api response: {0}")]
    Decode(String),
    #[error("answer encoding failed: {0}")]
    Answer(#[from] AnswerError),
    #[error("invalid api url: {0}")]
    InvalidUrl(String),
    #[error("no session token, authenticate first")]
    NotAuthenticated,
    #[error("no verified captcha, resolve one before querying")]
    NotAuthorized,
}

/// `{code, msg, params, success?}` wrapper around every payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub success: Option<bool>,
}

impl Envelope {
    pub fn parse(body: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(body)
            .map_err(|err| SessionError::Decode(format!("invalid envelope: {err}")))
    }

    pub fn message(&self) -> &str {
        self.msg.as_deref().unwrap_or_default()
    }

    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(false)
    }

    pub fn api_error(&self) -> SessionError {
        SessionError::Api {
            code: self.code,
            message: self.message().to_string(),
        }
    }

    /// Fails with the server's code and message unless the code is 200.
    pub fn ensure_ok(self) -> Result<Self, SessionError> {
        if self.code != API_OK {
            return Err(self.api_error());
        }
        Ok(self)
    }

    /// Like [`Envelope::ensure_ok`] but also requires `success: true`.
    pub fn ensure_success(self) -> Result<Self, SessionError> {
        let envelope = self.ensure_ok()?;
        if !envelope.is_success() {
            return Err(envelope.api_error());
        }
        Ok(envelope)
    }

    /// Deserializes `params` into `T`.
    pub fn params<T: DeserializeOwned>(self) -> Result<T, SessionError> {
        let params = self
            .params
            .ok_or_else(|| SessionError::Decode("response has no params".into()))?;
        serde_json::from_value(params)
            .map_err(|err| SessionError::Decode(format!("unexpected params: {err}")))
    }
}
