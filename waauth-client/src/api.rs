use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use waauth_core::{QR_PATH, SessionCommand};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway returned status {status}")]
    Status { status: u16 },
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QrResponse {
    pub qr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// REST side of the gateway: QR retrieval and session control.
#[derive(Debug, Clone)]
pub struct GatewayApi {
    client: reqwest::Client,
    base_url: Url,
}

impl GatewayApi {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// Resolves `path` under the base URL, keeping any path prefix the base
    /// carries.
    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// `Ok(None)` when the gateway has no QR yet (HTTP 404).
    pub async fn fetch_qr(&self) -> Result<Option<String>, ApiError> {
        let url = self.endpoint(QR_PATH)?;
        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("qr not available yet");
                Ok(None)
            }
            status if status.is_success() => {
                let body: QrResponse = response.json().await?;
                Ok(Some(body.qr).filter(|qr| !qr.is_empty()))
            }
            status => Err(ApiError::Status {
                status: status.as_u16(),
            }),
        }
    }

    pub async fn run_command(&self, command: SessionCommand) -> Result<(), ApiError> {
        let url = self.endpoint(command.path())?;
        let response = self.client.post(url).send().await?;
        let status = response.status();

        // Failures usually still carry a `{ success, error }` body.
        let body = match response.json::<CommandResponse>().await {
            Ok(body) => body,
            Err(err) if status.is_success() => return Err(ApiError::Http(err)),
            Err(_) => {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                });
            }
        };

        if body.success {
            return Ok(());
        }
        let message = body
            .error
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| format!("{} failed", command.as_str()));
        warn!(command = command.as_str(), "gateway rejected command: {message}");
        Err(ApiError::Rejected(message))
    }
}
