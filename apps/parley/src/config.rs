use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::media::MediaConstraints;

/// Public STUN servers used for reachability discovery. No relay fallback is configured.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
/// Time for a released capture device to settle before it is requested again.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(600);
pub const DEFAULT_SIGNAL_NAMESPACE: &str = "webrtc";
pub const DEFAULT_TIMER_NAMESPACE: &str = "debate-state";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ice_servers: Vec<IceServer>,
    pub retry_delay: Duration,
    pub signal_namespace: String,
    pub timer_namespace: String,
    pub media: MediaConstraints,
    pub deduplicate_candidates: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::stun(*url))
                .collect(),
            retry_delay: DEFAULT_RETRY_DELAY,
            signal_namespace: DEFAULT_SIGNAL_NAMESPACE.to_string(),
            timer_namespace: DEFAULT_TIMER_NAMESPACE.to_string(),
            media: MediaConstraints::default(),
            deduplicate_candidates: false,
        }
    }
}

impl Config {
    /// Load configuration from `PARLEY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(servers) = non_empty("PARLEY_STUN_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect();
        }
        if non_empty("PARLEY_DISABLE_STUN").is_some_and(|v| is_truthy(&v)) {
            config.ice_servers.clear();
        }
        if let Some(raw) = non_empty("PARLEY_RETRY_DELAY_MS") {
            let millis: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PARLEY_RETRY_DELAY_MS",
                value: raw.clone(),
            })?;
            config.retry_delay = Duration::from_millis(millis);
        }
        if let Some(namespace) = non_empty("PARLEY_SIGNAL_NAMESPACE") {
            config.signal_namespace = namespace;
        }
        if let Some(raw) = non_empty("PARLEY_DEDUP_CANDIDATES") {
            config.deduplicate_candidates = is_truthy(&raw);
        }
        Ok(config)
    }

    /// Host candidates only; for loopback runs and tests.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_media(mut self, media: MediaConstraints) -> Self {
        self.media = media;
        self
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.retry_delay, Duration::from_millis(600));
        assert_eq!(config.signal_namespace, "webrtc");
        assert!(!config.deduplicate_candidates);
    }

    #[test]
    fn test_custom_stun_list() {
        let config = Config::from_lookup(lookup(&[(
            "PARLEY_STUN_SERVERS",
            "stun:a.example:3478, stun:b.example:3478,",
        )]))
        .unwrap();
        let urls: Vec<_> = config
            .ice_servers
            .iter()
            .flat_map(|s| s.urls.clone())
            .collect();
        assert_eq!(urls, vec!["stun:a.example:3478", "stun:b.example:3478"]);
    }

    #[test]
    fn test_disable_stun_wins() {
        let config = Config::from_lookup(lookup(&[
            ("PARLEY_STUN_SERVERS", "stun:a.example:3478"),
            ("PARLEY_DISABLE_STUN", "1"),
        ]))
        .unwrap();
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn test_retry_delay_parsing() {
        let config = Config::from_lookup(lookup(&[("PARLEY_RETRY_DELAY_MS", "250")])).unwrap();
        assert_eq!(config.retry_delay, Duration::from_millis(250));

        let err = Config::from_lookup(lookup(&[("PARLEY_RETRY_DELAY_MS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "PARLEY_RETRY_DELAY_MS",
                value: "soon".into()
            }
        );
    }
}
