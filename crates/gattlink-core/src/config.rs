// ── Connection tuning ──
//
// Immutable once built. A controller receives its ConnectionConfig by
// value and never mutates it; the config crate builds these from TOML.

use std::time::Duration;

use crate::error::CoreError;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DISCOVER_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_BACKOFF: Duration = Duration::from_millis(1);

// ── ReconnectPolicy ──────────────────────────────────────────────────

/// Exponential backoff applied between automatic reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first automatic attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Attempts allowed before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,

    /// Leading attempts that reopen the link directly, with no scan and no
    /// backoff delay. Default: 0.
    pub immediate_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            immediate_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    ///
    /// `initial_delay * 2^attempt`, capped at `max_delay`, never shorter
    /// than one millisecond.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(31));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
            .max(MIN_BACKOFF)
    }

    /// Whether another automatic attempt is allowed after `attempts` tries.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }

    /// Whether attempt `attempt` (0-based) skips scanning.
    pub fn is_immediate(&self, attempt: u32) -> bool {
        attempt < self.immediate_attempts
    }

    /// Wait before attempt `attempt`: none for immediate attempts, then
    /// backoff counted from the first scanning attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if self.is_immediate(attempt) {
            Duration::ZERO
        } else {
            self.backoff(attempt - self.immediate_attempts)
        }
    }
}

// ── ConnectionConfig ─────────────────────────────────────────────────

/// Tunables for one device controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    auto_reconnect: bool,
    discover_services_delay: Duration,
    connect_timeout: Duration,
    discover_timeout: Duration,
    reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            discover_services_delay: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discover_timeout: DEFAULT_DISCOVER_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Pause between link establishment and the start of service discovery.
    pub fn discover_services_delay(&self) -> Duration {
        self.discover_services_delay
    }

    /// Budget for the whole connect phase (scanning plus connecting).
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn discover_timeout(&self) -> Duration {
        self.discover_timeout
    }

    pub fn reconnect(&self) -> &ReconnectPolicy {
        &self.reconnect
    }
}

// ── Builder ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn discover_services_delay(mut self, delay: Duration) -> Self {
        self.config.discover_services_delay = delay;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn discover_timeout(mut self, timeout: Duration) -> Self {
        self.config.discover_timeout = timeout;
        self
    }

    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect.initial_delay = delay;
        self
    }

    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect.max_delay = delay;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    pub fn reconnect_immediate_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.immediate_attempts = attempts;
        self
    }

    pub fn build(self) -> Result<ConnectionConfig, CoreError> {
        let c = &self.config;
        if c.connect_timeout.is_zero() {
            return Err(CoreError::invalid_config("connect_timeout", "must be positive"));
        }
        if c.discover_timeout.is_zero() {
            return Err(CoreError::invalid_config("discover_timeout", "must be positive"));
        }
        if c.reconnect.initial_delay.is_zero() {
            return Err(CoreError::invalid_config(
                "reconnect_initial_delay",
                "must be positive",
            ));
        }
        if c.reconnect.max_delay < c.reconnect.initial_delay {
            return Err(CoreError::invalid_config(
                "reconnect_max_delay",
                "must not be shorter than the initial delay",
            ));
        }
        Ok(self.config)
    }
}

/// Convert a signed millisecond count (as read from TOML or env) into a
/// `Duration`, rejecting negative values.
pub fn duration_from_millis(field: &str, millis: i64) -> Result<Duration, CoreError> {
    u64::try_from(millis)
        .map(Duration::from_millis)
        .map_err(|_| CoreError::invalid_config(field, format!("negative duration ({millis}ms)")))
}
