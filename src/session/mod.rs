//! Protocol client for the registry query API.
//!
//! A [`SessionClient`] owns one token pair and one client id for the length
//! of a logical query: authenticate, fetch and verify captchas, then query.
//! Calls are strictly sequential; nothing here retries.

pub mod envelope;
pub mod records;

use std::sync::Arc;

use chrono::Utc;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, ORIGIN, REFERER, USER_AGENT};
use http::{HeaderValue, Method};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::challenges::core::{
    ApiTransport, Authorization, CaptchaChallenge, PointSet, Session, encode_answer, header_value,
};

pub use envelope::{API_OK, Envelope, SessionError};
pub use records::{AppRecord, QueryRecord, QueryResponse, SearchType, SiteRecord, parse_record_time};

pub const DEFAULT_API_BASE: &str = "https://hlwicpfwc.miit.gov.cn/icpproject_query/api";
pub const DEFAULT_ACCOUNT: &str = "test";
pub const DEFAULT_SECRET: &str = "test";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0";
pub const DEFAULT_PAGE_SIZE: u32 = 20;

static BROWSER_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(REFERER, HeaderValue::from_static("https://beian.miit.gov.cn/"));
    headers.insert(ORIGIN, HeaderValue::from_static("https://beian.miit.gov.cn"));
    headers
});

/// Connection settings for a [`SessionClient`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub api_base: String,
    pub account: String,
    pub secret: String,
    pub user_agent: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            account: DEFAULT_ACCOUNT.to_string(),
            secret: DEFAULT_SECRET.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    bussiness: String,
    refresh: String,
}

#[derive(Debug, Deserialize)]
struct VerifyParams {
    sign: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CaptchaRequest<'a> {
    client_uid: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    client_uid: &'a str,
    point_json: &'a str,
    secret_key: &'a str,
    token: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    page_num: u32,
    page_size: u32,
    unit_name: &'a str,
    service_type: u8,
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    #[serde(default)]
    list: Vec<Value>,
    #[serde(default)]
    total: Option<u64>,
}

/// Stateful client for one logical query operation.
pub struct SessionClient {
    transport: Arc<dyn ApiTransport>,
    api_base: Url,
    account: String,
    secret: String,
    base_headers: HeaderMap,
    client_id: String,
    session: Option<Session>,
    authorization: Option<Authorization>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("api_base", &self.api_base.as_str())
            .field("client_id", &self.client_id)
            .field("authenticated", &self.session.is_some())
            .field("authorized", &self.authorization.is_some())
            .finish()
    }
}

impl SessionClient {
    /// Creates a client with a freshly generated client id.
    pub fn new(transport: Arc<dyn ApiTransport>, config: &SessionConfig) -> Result<Self, SessionError> {
        Self::with_client_id(transport, config, random_client_id())
    }

    pub fn with_client_id(
        transport: Arc<dyn ApiTransport>,
        config: &SessionConfig,
        client_id: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let api_base = Url::parse(&config.api_base)
            .map_err(|err| SessionError::InvalidUrl(format!("{}: {err}", config.api_base)))?;
        if api_base.cannot_be_a_base() {
            return Err(SessionError::InvalidUrl(config.api_base.clone()));
        }
        let mut base_headers = BROWSER_HEADERS.clone();
        base_headers.insert(USER_AGENT, header_value("user-agent", &config.user_agent)?);

        Ok(Self {
            transport,
            api_base,
            account: config.account.clone(),
            secret: config.secret.clone(),
            base_headers,
            client_id: client_id.into(),
            session: None,
            authorization: None,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    /// Exchanges a time-stamped credential hash for a token pair.
    pub async fn authenticate(&mut self) -> Result<Session, SessionError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let fields = vec![
            (
                "authKey".to_string(),
                auth_key(&self.account, &self.secret, &timestamp),
            ),
            ("timeStamp".to_string(), timestamp),
        ];
        let url = self.endpoint("auth")?;
        let response = self
            .transport
            .send_form(&Method::POST, &url, &self.base_headers, &fields)
            .await?
            .error_for_status()?;
        let tokens: TokenParams = Envelope::parse(&response.body)?.ensure_ok()?.params()?;
        log::debug!("authenticated client {}", self.client_id);
        Ok(self.store_tokens(tokens))
    }

    /// Trades the refresh token for a new token pair.
    pub async fn refresh(&mut self) -> Result<Session, SessionError> {
        let refresh_token = self
            .session
            .as_ref()
            .map(|session| session.refresh_token.clone())
            .ok_or(SessionError::NotAuthenticated)?;
        let mut url = self.endpoint("auth/refresh")?;
        url.query_pairs_mut()
            .append_pair("refreshToken", &refresh_token);
        let response = self
            .transport
            .send_with_body(&Method::GET, &url, &self.base_headers, None)
            .await?
            .error_for_status()?;
        let tokens: TokenParams = Envelope::parse(&response.body)?.ensure_ok()?.params()?;
        log::debug!("refreshed token for client {}", self.client_id);
        Ok(self.store_tokens(tokens))
    }

    /// Requests a new single-use challenge.
    pub async fn fetch_captcha(&self) -> Result<CaptchaChallenge, SessionError> {
        let headers = self.token_headers()?;
        let client_uid = format!("point-{}", self.client_id);
        let body = to_json(&CaptchaRequest {
            client_uid: &client_uid,
        })?;
        let url = self.endpoint("image/getCheckImagePoint")?;
        let response = self
            .transport
            .send_with_body(&Method::POST, &url, &headers, Some(&body))
            .await?
            .error_for_status()?;
        Envelope::parse(&response.body)?.ensure_ok()?.params()
    }

    /// Submits the encrypted answer. `Ok(false)` means the server declined it.
    pub async fn verify(
        &mut self,
        challenge: &CaptchaChallenge,
        points: &PointSet,
    ) -> Result<bool, SessionError> {
        let headers = self.token_headers()?;
        let point_json = encode_answer(points, &challenge.secret_key)?;
        let body = to_json(&VerifyRequest {
            client_uid: &self.client_id,
            point_json: &point_json,
            secret_key: &challenge.secret_key,
            token: &challenge.uuid,
        })?;
        let url = self.endpoint("image/checkImage")?;
        let response = self
            .transport
            .send_with_body(&Method::POST, &url, &headers, Some(&body))
            .await?
            .error_for_status()?;
        let envelope = Envelope::parse(&response.body)?.ensure_ok()?;
        if !envelope.is_success() {
            log::debug!("answer for challenge {} declined", challenge.uuid);
            return Ok(false);
        }
        let VerifyParams { sign } = envelope.params()?;
        self.authorization = Some(Authorization {
            sign,
            challenge_uuid: challenge.uuid.clone(),
        });
        Ok(true)
    }

    /// Queries one page of filing records. Requires a verified captcha.
    pub async fn query(
        &self,
        keyword: &str,
        search_type: SearchType,
        page_num: u32,
        page_size: u32,
    ) -> Result<QueryResponse, SessionError> {
        let authorization = self
            .authorization
            .as_ref()
            .ok_or(SessionError::NotAuthorized)?;
        let mut headers = self.token_headers()?;
        headers.insert(
            HeaderName::from_static("sign"),
            header_value("sign", &authorization.sign)?,
        );
        headers.insert(
            HeaderName::from_static("uuid"),
            header_value("uuid", &authorization.challenge_uuid)?,
        );
        let body = to_json(&QueryRequest {
            page_num,
            page_size,
            unit_name: keyword,
            service_type: search_type.code(),
        })?;
        let url = self.endpoint("icpAbbreviateInfo/queryByCondition")?;
        let response = self
            .transport
            .send_with_body(&Method::POST, &url, &headers, Some(&body))
            .await?
            .error_for_status()?;
        let params: QueryParams = Envelope::parse(&response.body)?
            .ensure_success()?
            .params()?;

        let records = params
            .list
            .into_iter()
            .map(|raw| decode_record(search_type, raw))
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!(
            "query '{keyword}' ({search_type}) page {page_num} returned {} records",
            records.len()
        );
        Ok(QueryResponse {
            search_type,
            records,
            total: params.total,
        })
    }

    fn store_tokens(&mut self, tokens: TokenParams) -> Session {
        let session = Session {
            token: tokens.bussiness,
            refresh_token: tokens.refresh,
            client_id: self.client_id.clone(),
        };
        self.session = Some(session.clone());
        session
    }

    fn token_headers(&self) -> Result<HeaderMap, SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::NotAuthenticated)?;
        let mut headers = self.base_headers.clone();
        headers.insert(
            HeaderName::from_static("token"),
            header_value("token", &session.token)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SessionError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| SessionError::InvalidUrl(self.api_base.to_string()))?
            .pop_if_empty()
            .extend(path.split('/'));
        Ok(url)
    }
}

fn decode_record(search_type: SearchType, raw: Value) -> Result<QueryRecord, SessionError> {
    let record = match search_type {
        SearchType::Domain => serde_json::from_value(raw).map(QueryRecord::Site),
        SearchType::App | SearchType::MiniProgram | SearchType::FastApp => {
            serde_json::from_value(raw).map(QueryRecord::App)
        }
    };
    record.map_err(|err| SessionError::Decode(format!("invalid {search_type} record: {err}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, SessionError> {
    serde_json::to_vec(value).map_err(|err| SessionError::Decode(err.to_string()))
}

/// Lowercase hex MD5 of `account + secret + timestamp`.
pub fn auth_key(account: &str, secret: &str, timestamp: &str) -> String {
    format!("{:x}", md5::compute(format!("{account}{secret}{timestamp}")))
}

/// Random RFC 4122 version 4 identifier.
pub fn random_client_id() -> String {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
