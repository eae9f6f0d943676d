use async_trait::async_trait;
use reqwest::header::HeaderName;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::models::hit::PlateHits;

/// Delivers one hit document to the alert receiver.
///
/// `Ok` carries the 2xx status code. Every `Err` is retryable through the queue.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, hits: &PlateHits, timeout: Duration) -> Result<u16, DeliveryError>;
}

/// How the auth token is attached to outbound requests.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthStyle {
    /// `{auth_header}: {token}`
    #[default]
    Header,
    /// `Authorization: Bearer {token}`
    Bearer,
}

#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub url: String,
    pub auth_token: String,
    pub auth_style: AuthStyle,
    pub auth_header: String,
    pub accept_invalid_certs: bool,
}

/// HTTP client for the plate-hit receiver.
pub struct HttpSender {
    http: Client,
    url: Url,
    auth: Auth,
}

enum Auth {
    Header(HeaderName, String),
    Bearer(String),
}

impl HttpSender {
    pub fn new(settings: &SenderSettings) -> Result<Self, DeliveryError> {
        let url = Url::parse(&settings.url)
            .map_err(|e| DeliveryError::Config(format!("alert url {:?}: {}", settings.url, e)))?;

        let auth = match settings.auth_style {
            AuthStyle::Bearer => Auth::Bearer(settings.auth_token.clone()),
            AuthStyle::Header => {
                let name = HeaderName::from_bytes(settings.auth_header.as_bytes()).map_err(|e| {
                    DeliveryError::Config(format!("auth header {:?}: {}", settings.auth_header, e))
                })?;
                Auth::Header(name, settings.auth_token.clone())
            }
        };

        // The state receiver has shipped with self-signed certificates before.
        let http = Client::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .map_err(DeliveryError::Transport)?;

        Ok(Self { http, url, auth })
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, hits: &PlateHits, timeout: Duration) -> Result<u16, DeliveryError> {
        let request = self.http.post(self.url.clone()).timeout(timeout).json(hits);
        let request = match &self.auth {
            Auth::Header(name, token) => request.header(name.clone(), token),
            Auth::Bearer(token) => request.bearer_auth(token),
        };

        let response = request.send().await.map_err(DeliveryError::Transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        // Reading the body to the end hands the connection back to the pool.
        let raw = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected(ApiError::from_response(status, &raw)))
    }
}

/// Stand-in receiver for dry runs: logs the document instead of posting it.
///
/// With `fail_odd_reads`, documents carrying a read whose ID ends in an odd digit
/// are refused, which exercises the retry path without a live receiver.
#[derive(Debug, Clone, Default)]
pub struct SimSender {
    pub fail_odd_reads: bool,
}

impl SimSender {
    fn refuses(&self, hits: &PlateHits) -> bool {
        self.fail_odd_reads
            && hits.plates.iter().any(|hit| {
                hit.id
                    .chars()
                    .last()
                    .and_then(|c| c.to_digit(10))
                    .map_or(false, |d| d % 2 == 1)
            })
    }
}

#[async_trait]
impl Sender for SimSender {
    async fn send(&self, hits: &PlateHits, _timeout: Duration) -> Result<u16, DeliveryError> {
        if self.refuses(hits) {
            return Err(DeliveryError::Simulated);
        }
        for hit in &hits.plates {
            tracing::info!(read = %hit.id, plate = %hit.plate_number, "Simulated plate hit delivery");
        }
        Ok(200)
    }
}

/// Problem-details body (RFC 7807) returned by the receiver on rejection.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub title: Option<String>,
    pub status: Option<u16>,
    pub detail: Option<String>,
    #[serde(rename = "traceId")]
    pub trace_id: Option<String>,
    pub errors: Option<BTreeMap<String, Vec<String>>>,
    /// Raw body, kept for bodies that are not problem-details.
    #[serde(skip)]
    pub raw: String,
}

impl ApiError {
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let raw = body.trim();
        let mut err: ApiError = serde_json::from_str(raw).unwrap_or_default();
        err.status = Some(status.as_u16());
        err.raw = raw.to_string();
        if is_empty(&err.title) && err.raw.is_empty() {
            err.title = status.canonical_reason().map(str::to_string);
        }
        err
    }

    fn field_messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .flatten()
            .filter(|(_, msgs)| !msgs.is_empty())
            .map(|(field, msgs)| format!("{}: {}", field, msgs.join("; ")))
            .collect()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.field_messages();
        let title = self.title.as_deref().filter(|t| !t.is_empty());
        let detail = self.detail.as_deref().filter(|d| !d.is_empty());

        match (parts.is_empty(), title, detail) {
            (false, Some(title), _) => write!(f, "{}: {}", title, parts.join(" | ")),
            (false, None, _) => write!(f, "{}", parts.join(" | ")),
            (true, Some(title), Some(detail)) => write!(f, "{}: {}", title, detail),
            (true, None, Some(detail)) => write!(f, "{}", detail),
            (true, Some(title), None) => write!(f, "{}", title),
            (true, None, None) if !self.raw.is_empty() => write!(f, "{}", self.raw),
            _ => write!(f, "request failed"),
        }
    }
}

impl std::error::Error for ApiError {}

fn is_empty(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("alert request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("{0}")]
    Rejected(ApiError),

    #[error("invalid sender configuration: {0}")]
    Config(String),

    #[error("simulated vendor failure")]
    Simulated,
}

impl DeliveryError {
    /// HTTP status when the receiver answered; `None` if it was never reached.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryError::Rejected(api) => api.status,
            _ => None,
        }
    }
}
