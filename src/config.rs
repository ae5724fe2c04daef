use std::{env, fmt, net::SocketAddr, str::FromStr, thread, time::Duration};

use thiserror::Error;

use crate::auth::AuthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportChoice {
    Stdio,
    Http,
    WebSocket,
    Sse,
}

impl FromStr for TransportChoice {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "sse" => Ok(Self::Sse),
            other => Err(ConfigError::InvalidTransport(other.to_string())),
        }
    }
}

impl fmt::Display for TransportChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub struct Config {
    pub transport: TransportChoice,
    pub bind_addr: String,
    pub bind_port: u16,
    pub api_token: Option<String>,
    pub require_tls: bool,
    pub trust_forwarded_proto: bool,
    pub worker_threads: usize,
    pub request_timeout: Option<Duration>,
    pub http_path: String,
    pub ws_path: String,
    pub sse_path: String,
    pub message_path: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("transport", &self.transport)
            .field("bind_addr", &self.bind_addr)
            .field("bind_port", &self.bind_port)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("require_tls", &self.require_tls)
            .field("trust_forwarded_proto", &self.trust_forwarded_proto)
            .field("worker_threads", &self.worker_threads)
            .field("request_timeout", &self.request_timeout)
            .field("http_path", &self.http_path)
            .field("ws_path", &self.ws_path)
            .field("sse_path", &self.sse_path)
            .field("message_path", &self.message_path)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_TRANSPORT must be one of stdio, http, websocket, sse (got {0:?})")]
    InvalidTransport(String),
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("{0} must be true or false")]
    InvalidFlag(&'static str),
    #[error("MCP_WORKER_THREADS must be a positive integer")]
    InvalidWorkerThreads,
    #[error("MCP_REQUEST_TIMEOUT_MS must be a positive integer")]
    InvalidTimeout,
    #[error("{0} must start with '/'")]
    InvalidPath(&'static str),
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let transport = get("MCP_TRANSPORT")
            .map(|value| value.parse::<TransportChoice>())
            .transpose()?
            .unwrap_or(TransportChoice::Stdio);
        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = get("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);
        let api_token = get("MCP_API_TOKEN");
        let require_tls = get("MCP_REQUIRE_TLS")
            .map(|value| parse_flag(&value, "MCP_REQUIRE_TLS"))
            .transpose()?
            .unwrap_or(false);
        let trust_forwarded_proto = get("MCP_TRUST_FORWARDED_PROTO")
            .map(|value| parse_flag(&value, "MCP_TRUST_FORWARDED_PROTO"))
            .transpose()?
            .unwrap_or(false);
        let worker_threads = get("MCP_WORKER_THREADS")
            .map(|value| {
                value
                    .parse::<usize>()
                    .ok()
                    .filter(|threads| *threads > 0)
                    .ok_or(ConfigError::InvalidWorkerThreads)
            })
            .transpose()?
            .unwrap_or_else(default_worker_threads);
        let request_timeout = get("MCP_REQUEST_TIMEOUT_MS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .ok()
                    .filter(|millis| *millis > 0)
                    .map(Duration::from_millis)
                    .ok_or(ConfigError::InvalidTimeout)
            })
            .transpose()?;

        let config = Self {
            transport,
            bind_addr,
            bind_port,
            api_token,
            require_tls,
            trust_forwarded_proto,
            worker_threads,
            request_timeout,
            http_path: endpoint_path(get("MCP_HTTP_PATH"), "MCP_HTTP_PATH", "/mcp")?,
            ws_path: endpoint_path(get("MCP_WS_PATH"), "MCP_WS_PATH", "/ws")?,
            sse_path: endpoint_path(get("MCP_SSE_PATH"), "MCP_SSE_PATH", "/sse")?,
            message_path: endpoint_path(get("MCP_MESSAGE_PATH"), "MCP_MESSAGE_PATH", "/message")?,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    /// Static-token bearer auth when `MCP_API_TOKEN` is set, otherwise open.
    pub fn auth(&self) -> AuthConfig {
        let auth = match &self.api_token {
            Some(token) => AuthConfig::static_token(token.clone()),
            None => AuthConfig::disabled(),
        };
        auth.require_secure_transport(self.require_tls)
            .trust_forwarded_proto(self.trust_forwarded_proto)
    }
}

fn parse_flag(value: &str, key: &'static str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag(key)),
    }
}

fn endpoint_path(
    value: Option<String>,
    key: &'static str,
    default: &str,
) -> Result<String, ConfigError> {
    match value {
        Some(path) if path.starts_with('/') => Ok(path),
        Some(_) => Err(ConfigError::InvalidPath(key)),
        None => Ok(default.to_string()),
    }
}

fn default_worker_threads() -> usize {
    thread::available_parallelism().map_or(4, |threads| threads.get())
}
