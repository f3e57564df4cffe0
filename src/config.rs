use std::env;

use serde::Serialize;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SEGMENT_EXTENSIONS: &str = "m3u8,aac,ts,mp3,m4a";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/139.0.0.0 Safari/537.36 Edg/139.0.0.0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub port_scan_limit: u16,
    pub stream_proxy: StreamProxyConfig,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamProxyConfig {
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub segment_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverConfig {
    pub api_base: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub ttl_seconds: u64,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let host = env::var("PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let port = env_u16("PROXY_PORT", 3032)?;
        let port_scan_limit = env_u16("PROXY_PORT_SCAN_LIMIT", 10)?;
        if port_scan_limit == 0 {
            return Err(ConfigError::Message(
                "PROXY_PORT_SCAN_LIMIT must be greater than zero".into(),
            ));
        }
        if host.trim().is_empty() {
            return Err(ConfigError::Message("PROXY_HOST must not be empty".into()));
        }

        Ok(Self {
            host,
            port,
            port_scan_limit,
            stream_proxy: StreamProxyConfig::from_env()?,
            resolver: ResolverConfig::from_env()?,
        })
    }
}

impl StreamProxyConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let timeout_ms = env_u64("STREAM_TIMEOUT_MS", 10_000)?;
        let retry_attempts = env_u32("SEGMENT_RETRY_ATTEMPTS", 3)?;
        if retry_attempts == 0 {
            return Err(ConfigError::Message(
                "SEGMENT_RETRY_ATTEMPTS must be greater than zero".into(),
            ));
        }
        let retry_delay_ms = env_u64("SEGMENT_RETRY_DELAY_MS", 150)?;
        let raw_extensions = env::var("SEGMENT_EXTENSIONS")
            .unwrap_or_else(|_| DEFAULT_SEGMENT_EXTENSIONS.to_string());
        let segment_extensions = parse_extension_list(&raw_extensions);
        if segment_extensions.is_empty() {
            return Err(ConfigError::Message(
                "SEGMENT_EXTENSIONS must list at least one extension".into(),
            ));
        }

        Ok(Self {
            timeout_ms,
            retry_attempts,
            retry_delay_ms,
            segment_extensions,
        })
    }
}

impl ResolverConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let api_base = env::var("RADIKO_API_BASE").unwrap_or_else(|_| "https://radiko.jp".into());
        let base_url = Url::parse(&api_base)
            .map_err(|err| ConfigError::Message(format!("Invalid RADIKO_API_BASE: {err}")))?;
        if base_url.scheme() != "https" && base_url.scheme() != "http" {
            return Err(ConfigError::Message(
                "RADIKO_API_BASE must be an http(s) URL".into(),
            ));
        }
        let user_agent =
            env::var("RADIKO_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());
        if user_agent.trim().is_empty() {
            return Err(ConfigError::Message(
                "RADIKO_USER_AGENT must not be empty".into(),
            ));
        }
        let timeout_ms = env_u64("RESOLVE_TIMEOUT_MS", 10_000)?;
        let ttl_seconds = env_u64("RESOLVE_TTL_SECONDS", 180)?;

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            user_agent,
            timeout_ms,
            ttl_seconds,
        })
    }
}

pub fn parse_extension_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

fn env_u16(key: &str, default: u16) -> Result<u16, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Message(format!("{key} must be a valid u16"))),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Message(format!("{key} must be a valid u32"))),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Message(format!("{key} must be a valid u64"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_extension_list;

    #[test]
    fn extension_list_is_normalized() {
        let parsed = parse_extension_list(" M3U8, .aac ,ts,, mp3 ");
        assert_eq!(parsed, vec!["m3u8", "aac", "ts", "mp3"]);
    }

    #[test]
    fn empty_extension_list_parses_to_nothing() {
        assert!(parse_extension_list(" , ,").is_empty());
    }
}
