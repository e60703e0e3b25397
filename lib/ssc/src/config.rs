//! Client configuration

use std::time::Duration;

use crate::error::SscError;

/// Self-service client configuration
#[derive(Debug, Clone)]
pub struct SscConfig {
    /// Workflow backend base URL (e.g., https://ssc.example.org/api)
    pub server_url: String,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// Token status poll interval
    pub poll_interval: Duration,
    /// Upper bound on one token command
    pub poll_timeout: Duration,
    /// Interval of the out-of-band presence check
    pub presence_interval: Duration,
    /// Pause between backend re-fetches while the workflow is in a server-side state
    pub server_wait: Duration,
    /// Consecutive server-side re-fetches tolerated in one personalization run
    pub max_server_rounds: u32,
}

impl SscConfig {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            poll_timeout: Duration::from_secs(120),
            presence_interval: Duration::from_millis(500),
            server_wait: Duration::from_millis(1000),
            max_server_rounds: 30,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, SscError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SscError> {
        let server_url = lookup("SSC_SERVER_URL")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SscError::Config("SSC_SERVER_URL is required".to_string()))?;
        url::Url::parse(&server_url)
            .map_err(|e| SscError::Config(format!("Invalid SSC_SERVER_URL: {}", e)))?;

        let defaults = Self::new(&server_url);

        let number = |key: &str, default: u64| -> Result<u64, SscError> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| SscError::Config(format!("{} must be a number, got {:?}", key, raw))),
                None => Ok(default),
            }
        };

        let max_server_rounds = number(
            "SSC_MAX_SERVER_ROUNDS",
            u64::from(defaults.max_server_rounds),
        )?;

        let config = Self {
            request_timeout: Duration::from_secs(number(
                "SSC_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            poll_interval: Duration::from_millis(number(
                "SSC_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            poll_timeout: Duration::from_secs(number(
                "SSC_POLL_TIMEOUT_SECS",
                defaults.poll_timeout.as_secs(),
            )?),
            presence_interval: Duration::from_millis(number(
                "SSC_PRESENCE_INTERVAL_MS",
                defaults.presence_interval.as_millis() as u64,
            )?),
            server_wait: Duration::from_millis(number(
                "SSC_SERVER_WAIT_MS",
                defaults.server_wait.as_millis() as u64,
            )?),
            max_server_rounds: u32::try_from(max_server_rounds).map_err(|_| {
                SscError::Config("SSC_MAX_SERVER_ROUNDS out of range".to_string())
            })?,
            ..defaults
        };

        // tokio intervals panic on a zero period
        if config.poll_interval.is_zero() || config.presence_interval.is_zero() {
            return Err(SscError::Config(
                "SSC_POLL_INTERVAL_MS and SSC_PRESENCE_INTERVAL_MS must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}
