//! Session tunables.

use std::time::Duration;

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 25;
pub const DEFAULT_LOCK_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_PENDING_CALLS: usize = 8192;

/// Per-session configuration, builder-style.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between keepalive pings. Also bounds each ping round trip.
    pub keepalive_interval: Duration,
    /// Round-trip latency above which the peer counts as dead. Defaults to
    /// a third of the keepalive interval.
    pub client_timeout: Duration,
    /// Inbound calls executing at once; calls beyond the bound queue.
    pub max_concurrent_requests: usize,
    /// Deadline applied to outbound calls without an explicit timeout.
    /// `None` waits forever.
    pub default_call_timeout: Option<Duration>,
    /// How long a per-identifier inbound lock outlives its dispatch.
    pub lock_grace: Duration,
    /// Cap on outstanding outbound calls.
    pub max_pending_calls: usize,
    /// Disable the keepalive task entirely. Meant for tests.
    pub keepalive_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            client_timeout: DEFAULT_KEEPALIVE_INTERVAL / 3,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            default_call_timeout: None,
            lock_grace: DEFAULT_LOCK_GRACE,
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
            keepalive_enabled: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the keepalive interval and re-derive the client timeout.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self.client_timeout = interval / 3;
        self
    }

    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn max_concurrent_requests(mut self, bound: usize) -> Self {
        self.max_concurrent_requests = bound;
        self
    }

    pub fn default_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_call_timeout = timeout;
        self
    }

    pub fn lock_grace(mut self, grace: Duration) -> Self {
        self.lock_grace = grace;
        self
    }

    pub fn max_pending_calls(mut self, cap: usize) -> Self {
        self.max_pending_calls = cap;
        self
    }

    pub fn keepalive_enabled(mut self, enabled: bool) -> Self {
        self.keepalive_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SessionConfig::default();
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.client_timeout, Duration::from_secs(10));
        assert_eq!(config.max_concurrent_requests, 25);
        assert_eq!(config.default_call_timeout, None);
        assert_eq!(config.lock_grace, Duration::from_secs(2));
        assert_eq!(config.max_pending_calls, 8192);
        assert!(config.keepalive_enabled);
    }

    #[test]
    fn keepalive_interval_rederives_client_timeout() {
        let config = SessionConfig::new().keepalive_interval(Duration::from_secs(9));
        assert_eq!(config.client_timeout, Duration::from_secs(3));

        let config = config.client_timeout(Duration::from_secs(1));
        assert_eq!(config.client_timeout, Duration::from_secs(1));
    }
}
