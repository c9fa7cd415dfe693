use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use waauth_core::Timings;

use crate::{api::DEFAULT_HTTP_TIMEOUT, transport::DEFAULT_CONNECT_TIMEOUT};

/// `config.json` is expected to be tiny; anything larger is treated as corrupt.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:3000/ws";
const MAX_URL_LEN: usize = 2048;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "waauth", about = "WhatsApp gateway session authenticator")]
pub struct ClientArgs {
    /// WebSocket endpoint of the gateway.
    #[arg(long)]
    pub gateway_url: Option<String>,
    /// Base URL of the gateway REST API; derived from the gateway URL when omitted.
    #[arg(long)]
    pub api_base_url: Option<String>,
    /// Page to return to once the session is authenticated.
    #[arg(long)]
    pub return_to: Option<String>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// Write the resolved settings back to `--config`.
    #[arg(long, default_value_t = false)]
    pub save_config: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SavedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,
    #[serde(default)]
    pub timings: Timings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub gateway_url: Url,
    pub api_base_url: Url,
    pub return_to: Option<Url>,
    pub timings: Timings,
    pub connect_timeout: Duration,
    pub http_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigSaveError {
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} is too long (max 2048 chars)")]
    UrlTooLong { field: &'static str },
    #[error("invalid {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("{field} must use one of {expected}, got {scheme}")]
    UnsupportedScheme {
        field: &'static str,
        expected: &'static str,
        scheme: String,
    },
    #[error("config file {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: ConfigLoadError,
    },
}

impl ClientConfig {
    pub fn with_gateway(gateway_url: Url) -> Result<Self, ConfigError> {
        let api_base_url = api_base_from_gateway(&gateway_url)?;
        Ok(Self {
            gateway_url,
            api_base_url,
            return_to: None,
            timings: Timings::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        })
    }

    /// Resolves settings with command-line values taking precedence over the
    /// saved file, which takes precedence over built-in defaults.
    pub fn resolve(args: &ClientArgs, saved: Option<&SavedConfig>) -> Result<Self, ConfigError> {
        let saved = saved.cloned().unwrap_or_default();

        let gateway_raw = args
            .gateway_url
            .clone()
            .or(saved.gateway_url)
            .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_owned());
        let gateway_url = parse_url("gateway_url", &gateway_raw, &["ws", "wss"])?;

        let api_base_url = match args.api_base_url.clone().or(saved.api_base_url) {
            Some(raw) => with_trailing_slash(parse_url("api_base_url", &raw, &["http", "https"])?),
            None => api_base_from_gateway(&gateway_url)?,
        };

        let return_to = args
            .return_to
            .clone()
            .or(saved.return_to)
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| parse_url("return_to", &raw, &["http", "https"]))
            .transpose()?;

        Ok(Self {
            gateway_url,
            api_base_url,
            return_to,
            timings: saved.timings,
            connect_timeout: saved
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        })
    }

    pub fn to_saved(&self) -> SavedConfig {
        SavedConfig {
            gateway_url: Some(self.gateway_url.to_string()),
            api_base_url: Some(self.api_base_url.to_string()),
            return_to: self.return_to.as_ref().map(Url::to_string),
            timings: self.timings,
            connect_timeout_ms: Some(self.connect_timeout.as_millis() as u64),
        }
    }

    /// Gateway URL tagged so the gateway pushes QR and readiness events to
    /// this socket.
    pub fn connection_url(&self, timestamp_ms: u64) -> Url {
        let mut url = self.gateway_url.clone();
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !matches!(key.as_ref(), "clientType" | "needsQR" | "timestamp"))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            pairs.extend_pairs(retained);
            pairs.append_pair("clientType", "auth");
            pairs.append_pair("needsQR", "true");
            pairs.append_pair("timestamp", &timestamp_ms.to_string());
        }
        url
    }
}

fn parse_url(field: &'static str, raw: &str, schemes: &[&'static str]) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    if raw.len() > MAX_URL_LEN {
        return Err(ConfigError::UrlTooLong { field });
    }
    let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { field, source })?;
    if !schemes.iter().any(|scheme| *scheme == url.scheme()) {
        return Err(ConfigError::UnsupportedScheme {
            field,
            expected: if schemes.contains(&"ws") {
                "ws/wss"
            } else {
                "http/https"
            },
            scheme: url.scheme().to_owned(),
        });
    }
    Ok(url)
}

/// HTTP origin of the gateway plus the directory holding the socket
/// endpoint, so `ws://host/app/ws` maps to `http://host/app/`.
fn api_base_from_gateway(gateway_url: &Url) -> Result<Url, ConfigError> {
    let scheme = match gateway_url.scheme() {
        "wss" => "https",
        _ => "http",
    };
    let host = gateway_url.host_str().unwrap_or("127.0.0.1");
    let path = gateway_url.path();
    let parent = path.rfind('/').map_or("/", |end| &path[..=end]);
    let raw = match gateway_url.port() {
        Some(port) => format!("{scheme}://{host}:{port}{parent}"),
        None => format!("{scheme}://{host}{parent}"),
    };
    Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl {
        field: "api_base_url",
        source,
    })
}

/// Relative joins keep the last path segment only behind a trailing slash.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

pub fn parse_config_json(data: &str) -> Result<SavedConfig, serde_json::Error> {
    serde_json::from_str::<SavedConfig>(data)
}

pub fn load_config_from_path(path: &Path) -> Result<SavedConfig, ConfigLoadError> {
    let meta = fs::metadata(path).map_err(ConfigLoadError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigLoadError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigLoadError::Read)?;
    parse_config_json(&data).map_err(ConfigLoadError::Parse)
}

pub fn save_config_to_path(path: &Path, config: &SavedConfig) -> Result<(), ConfigSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config).map_err(ConfigSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(ConfigSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(ConfigSaveError::Rename)?;
    Ok(())
}

/// Loads the saved config named by `--config`, if any, and resolves it.
pub fn load_client_config(args: &ClientArgs) -> Result<ClientConfig, ConfigError> {
    let saved = match &args.config {
        Some(path) if path.exists() => Some(load_config_from_path(path).map_err(|source| {
            ConfigError::Load {
                path: path.clone(),
                source,
            }
        })?),
        _ => None,
    };
    ClientConfig::resolve(args, saved.as_ref())
}
