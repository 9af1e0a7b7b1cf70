//! Stream Client Configuration Settings
//!
//! Configuration types for the stream client, built in code or loaded from
//! environment variables under a caller-chosen prefix.

use std::time::Duration;

use url::Url;

/// API credentials for authenticated channels.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
    passphrase: Option<String>,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: None,
        }
    }

    /// Attach a passphrase (required by some login schemes).
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }

    /// Get the passphrase, if any.
    #[must_use]
    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Complete stream client configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Interval between liveness probes.
    pub heartbeat_interval: Duration,
    /// Silence longer than `heartbeat_interval * timeout_multiplier` is fatal.
    pub timeout_multiplier: u32,
    /// Delay before the first redial.
    pub initial_backoff: Duration,
    /// Ceiling for the redial delay.
    pub max_backoff: Duration,
    /// Growth factor applied to the redial delay after each failure.
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the delay (0.15 = ±15%).
    pub jitter_factor: f64,
    /// Redial attempts before giving up (0 = unlimited).
    pub max_retries: u32,
    /// Capacity of the dispatch queue.
    pub dispatch_queue_size: usize,
    /// Number of dispatch workers.
    pub worker_count: usize,
    /// Deadline for a single transport write.
    pub write_timeout: Duration,
    /// Deadline for a single dial.
    pub dial_timeout: Duration,
    /// Upper bound on how long `close()` waits for background loops.
    pub close_timeout: Duration,
    /// Deadline for a login acknowledgement.
    pub login_timeout: Duration,
    /// Credentials for private channels.
    pub credentials: Option<Credentials>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            heartbeat_interval: Duration::from_secs(20),
            timeout_multiplier: 2,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.15,
            max_retries: 0, // Unlimited
            dispatch_queue_size: 4096,
            worker_count: 32,
            write_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(5),
            credentials: None,
        }
    }
}

impl StreamConfig {
    /// Create a configuration for an endpoint with default tuning.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat timeout multiplier.
    #[must_use]
    pub const fn with_timeout_multiplier(mut self, multiplier: u32) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    /// Set the initial and maximum redial delays.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the jitter fraction.
    #[must_use]
    pub const fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Set the redial attempt limit (0 = unlimited).
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the dispatch queue capacity and worker count.
    #[must_use]
    pub const fn with_dispatch(mut self, queue_size: usize, worker_count: usize) -> Self {
        self.dispatch_queue_size = queue_size;
        self.worker_count = worker_count;
        self
    }

    /// Set the write deadline.
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the close wait bound.
    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the login acknowledgement deadline.
    #[must_use]
    pub const fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Attach credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Create configuration from environment variables.
    ///
    /// Reads `{PREFIX}_URL` (required) and the optional tuning variables
    /// `{PREFIX}_HEARTBEAT_INTERVAL_SECS`, `{PREFIX}_TIMEOUT_MULTIPLIER`,
    /// `{PREFIX}_MAX_BACKOFF_SECS`, `{PREFIX}_MAX_RETRIES`,
    /// `{PREFIX}_DISPATCH_QUEUE_SIZE`, `{PREFIX}_WORKER_COUNT`. Credentials are
    /// loaded when both `{PREFIX}_API_KEY` and `{PREFIX}_API_SECRET` are set;
    /// `{PREFIX}_API_PASSPHRASE` is optional. Unparsable tuning values fall
    /// back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL variable is missing or empty, or the
    /// resulting configuration fails [`validate`](Self::validate).
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| format!("{prefix}_{suffix}");
        let defaults = Self::default();

        let url_key = var("URL");
        let url = lookup(&url_key).ok_or_else(|| ConfigError::MissingEnvVar(url_key.clone()))?;
        if url.is_empty() {
            return Err(ConfigError::EmptyValue(url_key));
        }

        let credentials = match (lookup(&var("API_KEY")), lookup(&var("API_SECRET"))) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                let credentials = Credentials::new(key, secret);
                Some(match lookup(&var("API_PASSPHRASE")) {
                    Some(passphrase) if !passphrase.is_empty() => {
                        credentials.with_passphrase(passphrase)
                    }
                    _ => credentials,
                })
            }
            _ => None,
        };

        let config = Self {
            url,
            heartbeat_interval: parse_duration_secs(
                lookup(&var("HEARTBEAT_INTERVAL_SECS")),
                defaults.heartbeat_interval,
            ),
            timeout_multiplier: parse_or(
                lookup(&var("TIMEOUT_MULTIPLIER")),
                defaults.timeout_multiplier,
            ),
            max_backoff: parse_duration_secs(lookup(&var("MAX_BACKOFF_SECS")), defaults.max_backoff),
            max_retries: parse_or(lookup(&var("MAX_RETRIES")), defaults.max_retries),
            dispatch_queue_size: parse_or(
                lookup(&var("DISPATCH_QUEUE_SIZE")),
                defaults.dispatch_queue_size,
            ),
            worker_count: parse_or(lookup(&var("WORKER_COUNT")), defaults.worker_count),
            credentials,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the client cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed = Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::UnsupportedScheme(parsed.scheme().to_string()));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid("heartbeat_interval", "must be non-zero"));
        }

        if self.timeout_multiplier < 2 {
            return Err(ConfigError::invalid(
                "timeout_multiplier",
                "must be at least 2",
            ));
        }

        if self.dispatch_queue_size == 0 {
            return Err(ConfigError::invalid("dispatch_queue_size", "must be non-zero"));
        }

        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count", "must be non-zero"));
        }

        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::invalid(
                "max_backoff",
                "must not be less than initial_backoff",
            ));
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                "must be a finite value of at least 1.0",
            ));
        }

        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid("jitter_factor", "must be in [0, 1)"));
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),

    /// URL could not be parsed.
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// URL scheme is not `ws` or `wss`.
    #[error("unsupported url scheme {0:?}, expected ws or wss")]
    UnsupportedScheme(String),

    /// A tuning value is out of range.
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl ConfigError {
    const fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::InvalidValue { field, reason }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_duration_secs(value: Option<String>, default: Duration) -> Duration {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}
