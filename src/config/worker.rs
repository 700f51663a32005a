// src/config/worker.rs
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use redis::{
    ConnectionAddr, ConnectionInfo, ErrorKind, IntoConnectionInfo, RedisConnectionInfo, RedisError,
    RedisResult,
};
use thiserror::Error;

pub const DEFAULT_REDIS_ADDR: &str = "localhost:6379";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_GROQ_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_CENTRIFUGO_CHANNEL: &str = "trade-signals";
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Claim wait per XREADGROUP call.
pub const CLAIM_BLOCK: Duration = Duration::from_secs(5);

/// Every problem found while validating the environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{}", describe(.missing, .invalid))]
    Invalid {
        missing: Vec<&'static str>,
        invalid: Vec<InvalidSetting>,
    },
    #[error("failed to read prompt file {path}: {reason}")]
    PromptFile { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSetting {
    pub key: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl fmt::Display for InvalidSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?} ({})", self.key, self.value, self.reason)
    }
}

fn describe(missing: &[&'static str], invalid: &[InvalidSetting]) -> String {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!(
            "Missing required environment variables: {}",
            missing.join(", ")
        ));
    }
    if !invalid.is_empty() {
        let list: Vec<String> = invalid.iter().map(|i| i.to_string()).collect();
        parts.push(format!("Invalid environment variables: {}", list.join(", ")));
    }
    parts.join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Broadcast gateway settings; present only when both URL and key are set.
#[derive(Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    pub api_url: String,
    pub api_key: String,
    pub channel: String,
}

impl fmt::Debug for BroadcastConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastConfig")
            .field("api_url", &self.api_url)
            .field("api_key_len", &self.api_key.len())
            .field("channel", &self.channel)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub model_name: String,
    pub inference_api_key: String,
    pub inference_api_url: String,
    pub redis_addr: String,
    pub redis_password: String,
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub signal_stream: String,
    pub prompt_file: PathBuf,
    pub broadcast: Option<BroadcastConfig>,
    pub health_port: u16,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub claim_block: Duration,
    pub log_format: LogFormat,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // secrets only by length
        f.debug_struct("WorkerConfig")
            .field("model_name", &self.model_name)
            .field("inference_api_key_len", &self.inference_api_key.len())
            .field("inference_api_url", &self.inference_api_url)
            .field("redis_addr", &self.redis_addr)
            .field("redis_password_len", &self.redis_password.len())
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("signal_stream", &self.signal_stream)
            .field("prompt_file", &self.prompt_file)
            .field("broadcast", &self.broadcast)
            .field("health_port", &self.health_port)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .finish()
    }
}

impl WorkerConfig {
    /// Read and validate the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Validate settings from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut missing = Vec::new();
        let mut invalid = Vec::new();

        let mut required = |key: &'static str| match get(key) {
            Some(v) => v,
            None => {
                missing.push(key);
                String::new()
            }
        };

        let model_name = required("GROQ_MODEL_NAME");
        let inference_api_key = required("GROQ_API_KEY");
        let stream = required("STREAM");
        let group = required("GROUP");
        let consumer = required("CONSUMER");
        let signal_stream = required("SIGNAL_STREAM");
        let prompt_file = required("PROMPT_FILE");

        let broadcast = match (get("CENTRIFUGO_API_URL"), get("CENTRIFUGO_API_KEY")) {
            (Some(api_url), Some(api_key)) => Some(BroadcastConfig {
                api_url,
                api_key,
                channel: get("CENTRIFUGO_CHANNEL")
                    .unwrap_or_else(|| DEFAULT_CENTRIFUGO_CHANNEL.to_string()),
            }),
            (Some(_), None) => {
                missing.push("CENTRIFUGO_API_KEY");
                None
            }
            (None, Some(_)) => {
                missing.push("CENTRIFUGO_API_URL");
                None
            }
            (None, None) => None,
        };

        let health_port = match get("HEALTH_PORT") {
            None => DEFAULT_HEALTH_PORT,
            Some(raw) => raw.parse::<u16>().unwrap_or_else(|_| {
                invalid.push(InvalidSetting {
                    key: "HEALTH_PORT",
                    value: raw,
                    reason: "expected a port number",
                });
                DEFAULT_HEALTH_PORT
            }),
        };

        let backoff_base_ms =
            parse_millis(get("BACKOFF_BASE_MS"), "BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS, &mut invalid);
        let backoff_max_ms =
            parse_millis(get("BACKOFF_MAX_MS"), "BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS, &mut invalid);
        if backoff_max_ms < backoff_base_ms {
            invalid.push(InvalidSetting {
                key: "BACKOFF_MAX_MS",
                value: backoff_max_ms.to_string(),
                reason: "must not be below BACKOFF_BASE_MS",
            });
        }

        let log_format = match get("LOG_FORMAT").map(|v| v.to_ascii_lowercase()) {
            None => LogFormat::Compact,
            Some(v) if v == "compact" => LogFormat::Compact,
            Some(v) if v == "json" => LogFormat::Json,
            Some(v) => {
                invalid.push(InvalidSetting {
                    key: "LOG_FORMAT",
                    value: v,
                    reason: "expected compact or json",
                });
                LogFormat::Compact
            }
        };

        if !missing.is_empty() || !invalid.is_empty() {
            return Err(ConfigError::Invalid { missing, invalid });
        }

        Ok(Self {
            model_name,
            inference_api_key,
            inference_api_url: get("GROQ_API_URL").unwrap_or_else(|| DEFAULT_GROQ_API_URL.to_string()),
            redis_addr: get("REDIS_ADDR").unwrap_or_else(|| DEFAULT_REDIS_ADDR.to_string()),
            redis_password: get("REDIS_PASSWORD").unwrap_or_default(),
            stream,
            group,
            consumer,
            signal_stream,
            prompt_file: PathBuf::from(prompt_file),
            broadcast,
            health_port,
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
            claim_block: CLAIM_BLOCK,
            log_format,
        })
    }

    /// Redis connection settings from `REDIS_ADDR` and `REDIS_PASSWORD`.
    ///
    /// The password is carried as-is, never spliced into a URL. A full
    /// `redis://` address keeps its own settings unless `REDIS_PASSWORD` is set.
    pub fn redis_connection_info(&self) -> RedisResult<ConnectionInfo> {
        let mut info = if self.redis_addr.starts_with("redis://")
            || self.redis_addr.starts_with("rediss://")
        {
            self.redis_addr.as_str().into_connection_info()?
        } else {
            let (host, port) = split_host_port(&self.redis_addr)?;
            ConnectionInfo {
                addr: ConnectionAddr::Tcp(host, port),
                redis: RedisConnectionInfo::default(),
            }
        };
        if !self.redis_password.is_empty() {
            info.redis.password = Some(self.redis_password.clone());
        }
        Ok(info)
    }

    pub fn broadcast_enabled(&self) -> bool {
        self.broadcast.is_some()
    }

    /// Read the prompt template named by `PROMPT_FILE`.
    pub fn load_prompt_template(&self) -> Result<String, ConfigError> {
        std::fs::read_to_string(&self.prompt_file).map_err(|e| ConfigError::PromptFile {
            path: self.prompt_file.clone(),
            reason: e.to_string(),
        })
    }
}

// "host:port", "host" or "[v6]:port"; the port defaults to 6379.
fn split_host_port(addr: &str) -> RedisResult<(String, u16)> {
    let invalid = || {
        RedisError::from((
            ErrorKind::InvalidClientConfig,
            "invalid REDIS_ADDR",
            addr.to_string(),
        ))
    };
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
            (host, port.parse::<u16>().map_err(|_| invalid())?)
        }
        _ => (addr, DEFAULT_REDIS_PORT),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

fn parse_millis(
    raw: Option<String>,
    key: &'static str,
    default: u64,
    invalid: &mut Vec<InvalidSetting>,
) -> u64 {
    let Some(raw) = raw else {
        return default;
    };
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => ms,
        _ => {
            invalid.push(InvalidSetting {
                key,
                value: raw,
                reason: "expected a positive number of milliseconds",
            });
            default
        }
    }
}
