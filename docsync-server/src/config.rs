//! Server configuration.
//!
//! Defaults suit a local development server. [`ServerConfig::from_env`]
//! overlays `DOCSYNC_*` environment variables.

use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("{0} must be positive")]
    NonPositive(&'static str),
    #[error("{key} must be within {min}..={max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("sign_sessions requires a secret key")]
    MissingSecret,
    #[error("{0}: include and exclude lists are mutually exclusive")]
    ConflictingLists(&'static str),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Ping interval in milliseconds (0 disables keep-alive)
    pub keep_alive_ms: u64,
    /// Close a connection whose last pong is older than this
    pub keep_alive_timeout_ms: u64,
    /// How often to sweep for unused sessions
    pub check_unused_sessions_ms: u64,
    /// How long a session without connections survives
    pub unused_session_lifetime_ms: u64,
    /// How often to log server statistics
    pub stats_log_frequency_ms: u64,
    /// Lifetime of issued session tokens
    pub session_token_expiration_secs: u64,
    /// Sign session ids and tokens with `secret_key`
    pub sign_sessions: bool,
    pub secret_key: Option<String>,
    /// Allow the server to generate session ids
    pub generate_session_ids: bool,
    /// Largest accepted websocket message in bytes
    pub max_message_size: usize,
    /// Accepted but not negotiated
    pub websocket_compression_level: Option<u32>,
    pub websocket_compression_mem_level: Option<u32>,
    /// Request headers copied into the token payload (all when both empty)
    pub include_headers: Vec<String>,
    pub exclude_headers: Vec<String>,
    pub include_cookies: Vec<String>,
    pub exclude_cookies: Vec<String>,
    /// `host[:port]` entries; `host:*` allows any port. Empty means the
    /// Origin host must match the Host header.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5006".to_string(),
            keep_alive_ms: 37_000,
            keep_alive_timeout_ms: 74_000,
            check_unused_sessions_ms: 17_000,
            unused_session_lifetime_ms: 15_000,
            stats_log_frequency_ms: 15_000,
            session_token_expiration_secs: 300,
            sign_sessions: false,
            secret_key: None,
            generate_session_ids: true,
            max_message_size: 20 * 1024 * 1024,
            websocket_compression_level: None,
            websocket_compression_mem_level: None,
            include_headers: Vec::new(),
            exclude_headers: Vec::new(),
            include_cookies: Vec::new(),
            exclude_cookies: Vec::new(),
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `DOCSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overlaid with `DOCSYNC_*` entries of `vars`.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix("DOCSYNC_") else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "BIND_ADDR" => config.bind_addr = value.to_string(),
                "KEEP_ALIVE_MS" => config.keep_alive_ms = parse(key.as_ref(), value)?,
                "KEEP_ALIVE_TIMEOUT_MS" => config.keep_alive_timeout_ms = parse(key.as_ref(), value)?,
                "CHECK_UNUSED_SESSIONS_MS" => {
                    config.check_unused_sessions_ms = parse(key.as_ref(), value)?
                }
                "UNUSED_SESSION_LIFETIME_MS" => {
                    config.unused_session_lifetime_ms = parse(key.as_ref(), value)?
                }
                "STATS_LOG_FREQUENCY_MS" => config.stats_log_frequency_ms = parse(key.as_ref(), value)?,
                "SESSION_TOKEN_EXPIRATION" => {
                    config.session_token_expiration_secs = parse(key.as_ref(), value)?
                }
                "SIGN_SESSIONS" => config.sign_sessions = parse_bool(key.as_ref(), value)?,
                "SECRET_KEY" => config.secret_key = Some(value.to_string()),
                "GENERATE_SESSION_IDS" => config.generate_session_ids = parse_bool(key.as_ref(), value)?,
                "MAX_MESSAGE_SIZE" => config.max_message_size = parse(key.as_ref(), value)?,
                "WEBSOCKET_COMPRESSION_LEVEL" => {
                    config.websocket_compression_level = Some(parse(key.as_ref(), value)?)
                }
                "WEBSOCKET_COMPRESSION_MEM_LEVEL" => {
                    config.websocket_compression_mem_level = Some(parse(key.as_ref(), value)?)
                }
                "INCLUDE_HEADERS" => config.include_headers = parse_list(value),
                "EXCLUDE_HEADERS" => config.exclude_headers = parse_list(value),
                "INCLUDE_COOKIES" => config.include_cookies = parse_list(value),
                "EXCLUDE_COOKIES" => config.exclude_cookies = parse_list(value),
                "ALLOW_WEBSOCKET_ORIGIN" => config.allowed_origins = parse_list(value),
                other => log::debug!("Ignoring unknown setting DOCSYNC_{other}"),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_unused_sessions_ms == 0 {
            return Err(ConfigError::NonPositive("check_unused_sessions_ms"));
        }
        if self.unused_session_lifetime_ms == 0 {
            return Err(ConfigError::NonPositive("unused_session_lifetime_ms"));
        }
        if self.stats_log_frequency_ms == 0 {
            return Err(ConfigError::NonPositive("stats_log_frequency_ms"));
        }
        if self.session_token_expiration_secs == 0 {
            return Err(ConfigError::NonPositive("session_token_expiration_secs"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::NonPositive("max_message_size"));
        }
        if self.keep_alive_ms > 0 && self.keep_alive_timeout_ms == 0 {
            return Err(ConfigError::NonPositive("keep_alive_timeout_ms"));
        }
        if self.sign_sessions && self.secret_key.is_none() {
            return Err(ConfigError::MissingSecret);
        }
        check_range("websocket_compression_level", self.websocket_compression_level, 0, 9)?;
        check_range("websocket_compression_mem_level", self.websocket_compression_mem_level, 1, 9)?;
        if !self.include_headers.is_empty() && !self.exclude_headers.is_empty() {
            return Err(ConfigError::ConflictingLists("headers"));
        }
        if !self.include_cookies.is_empty() && !self.exclude_cookies.is_empty() {
            return Err(ConfigError::ConflictingLists("cookies"));
        }
        Ok(())
    }

    /// `None` when keep-alive is disabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_ms > 0).then(|| Duration::from_millis(self.keep_alive_ms))
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn check_unused_sessions(&self) -> Duration {
        Duration::from_millis(self.check_unused_sessions_ms)
    }

    pub fn unused_session_lifetime(&self) -> Duration {
        Duration::from_millis(self.unused_session_lifetime_ms)
    }

    pub fn stats_log_frequency(&self) -> Duration {
        Duration::from_millis(self.stats_log_frequency_ms)
    }

    pub fn session_token_expiration(&self) -> Duration {
        Duration::from_secs(self.session_token_expiration_secs)
    }

    pub fn header_allowed(&self, name: &str) -> bool {
        list_allows(&self.include_headers, &self.exclude_headers, name)
    }

    pub fn cookie_allowed(&self, name: &str) -> bool {
        list_allows(&self.include_cookies, &self.exclude_cookies, name)
    }
}

fn list_allows(include: &[String], exclude: &[String], name: &str) -> bool {
    if !include.is_empty() {
        return include.iter().any(|n| n.eq_ignore_ascii_case(name));
    }
    !exclude.iter().any(|n| n.eq_ignore_ascii_case(name))
}

fn check_range(key: &'static str, value: Option<u32>, min: u32, max: u32) -> Result<(), ConfigError> {
    match value {
        Some(v) if v < min || v > max => Err(ConfigError::OutOfRange {
            key,
            value: v,
            min,
            max,
        }),
        _ => Ok(()),
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keep_alive(), Some(Duration::from_millis(37_000)));
        assert_eq!(config.max_message_size, 20 * 1024 * 1024);
    }

    #[test]
    fn test_from_vars() {
        let config = ServerConfig::from_vars([
            ("DOCSYNC_KEEP_ALIVE_MS", "0"),
            ("DOCSYNC_SIGN_SESSIONS", "yes"),
            ("DOCSYNC_SECRET_KEY", "abc"),
            ("DOCSYNC_ALLOW_WEBSOCKET_ORIGIN", "example.com:*, localhost:5006"),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();
        assert_eq!(config.keep_alive(), None);
        assert!(config.sign_sessions);
        assert_eq!(config.secret_key.as_deref(), Some("abc"));
        assert_eq!(config.allowed_origins, vec!["example.com:*", "localhost:5006"]);
    }

    #[test]
    fn test_signing_without_secret() {
        let err = ServerConfig::from_vars([("DOCSYNC_SIGN_SESSIONS", "true")]).unwrap_err();
        assert_eq!(err, ConfigError::MissingSecret);
    }

    #[test]
    fn test_bad_number() {
        let err = ServerConfig::from_vars([("DOCSYNC_MAX_MESSAGE_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_non_positive_intervals() {
        let config = ServerConfig {
            check_unused_sessions_ms: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositive("check_unused_sessions_ms")));
    }

    #[test]
    fn test_compression_range() {
        let config = ServerConfig {
            websocket_compression_level: Some(10),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn test_header_lists() {
        let config = ServerConfig {
            include_headers: vec!["User-Agent".into()],
            ..ServerConfig::default()
        };
        assert!(config.header_allowed("user-agent"));
        assert!(!config.header_allowed("authorization"));

        let config = ServerConfig {
            exclude_cookies: vec!["secret".into()],
            ..ServerConfig::default()
        };
        assert!(config.cookie_allowed("theme"));
        assert!(!config.cookie_allowed("secret"));

        let both = ServerConfig {
            include_headers: vec!["a".into()],
            exclude_headers: vec!["b".into()],
            ..ServerConfig::default()
        };
        assert_eq!(both.validate(), Err(ConfigError::ConflictingLists("headers")));
    }
}
