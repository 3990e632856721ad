//! Configuration for the IP throttler.

use crate::realip::{Cidr, RealIpResolver};
use crate::stats::IpThrottler;
use gatehouse_core::ConfigError;
use gatehouse_events::{BlockList, SecurityEventBus};
use std::time::Duration;

/// Configuration for the IP throttler and its middleware.
pub struct ThrottleConfig {
    pub(crate) requests_per_minute: u32,
    pub(crate) burst_size: u32,
    pub(crate) enable_progressive: bool,
    pub(crate) max_penalty_minutes: u32,
    pub(crate) enable_suspicious_detection: bool,
    pub(crate) suspicious_threshold: u64,
    pub(crate) suspicious_penalty_minutes: u32,
    pub(crate) enable_subnet_limiting: bool,
    pub(crate) subnet_requests_per_minute: u32,
    pub(crate) subnet_v4_prefix: u8,
    pub(crate) subnet_v6_prefix: u8,
    pub(crate) whitelist: Vec<Cidr>,
    pub(crate) blacklist: Vec<Cidr>,
    pub(crate) resolver: RealIpResolver,
    pub(crate) blocklist: Option<BlockList>,
    pub(crate) bus: Option<SecurityEventBus>,
    pub(crate) idle_eviction: Duration,
    pub(crate) sweep_interval: Duration,
    pub(crate) name: String,
}

impl ThrottleConfig {
    /// Creates a new builder for configuring the throttler.
    pub fn builder() -> ThrottleConfigBuilder {
        ThrottleConfigBuilder::new()
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
            enable_progressive: true,
            max_penalty_minutes: 60,
            enable_suspicious_detection: true,
            suspicious_threshold: 10,
            suspicious_penalty_minutes: 30,
            enable_subnet_limiting: false,
            subnet_requests_per_minute: 600,
            subnet_v4_prefix: 24,
            subnet_v6_prefix: 64,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            resolver: RealIpResolver::default(),
            blocklist: None,
            bus: None,
            idle_eviction: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
            name: "test".to_string(),
        }
    }
}

/// Builder for [`ThrottleConfig`].
pub struct ThrottleConfigBuilder {
    requests_per_minute: u32,
    burst_size: u32,
    enable_progressive: bool,
    max_penalty_minutes: u32,
    enable_suspicious_detection: bool,
    suspicious_threshold: u64,
    suspicious_penalty_minutes: u32,
    enable_subnet_limiting: bool,
    subnet_requests_per_minute: u32,
    subnet_v4_prefix: u8,
    subnet_v6_prefix: u8,
    whitelist: Vec<String>,
    blacklist: Vec<String>,
    trusted_proxies: Vec<String>,
    blocklist: Option<BlockList>,
    bus: Option<SecurityEventBus>,
    idle_eviction: Duration,
    sweep_interval: Duration,
    name: String,
}

impl Default for ThrottleConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - requests_per_minute: 60, burst_size: 10
    /// - progressive penalties on, capped at 60 minutes
    /// - suspicious detection on: threshold 10, penalty 30 minutes
    /// - subnet limiting off (600/min, /24 v4, /64 v6 when enabled)
    /// - no whitelist, blacklist, or trusted proxies
    /// - idle records evicted after 30 minutes
    /// - name: `"<unnamed>"`
    pub fn new() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
            enable_progressive: true,
            max_penalty_minutes: 60,
            enable_suspicious_detection: true,
            suspicious_threshold: 10,
            suspicious_penalty_minutes: 30,
            enable_subnet_limiting: false,
            subnet_requests_per_minute: 600,
            subnet_v4_prefix: 24,
            subnet_v6_prefix: 64,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            trusted_proxies: Vec::new(),
            blocklist: None,
            bus: None,
            idle_eviction: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
            name: "<unnamed>".to_string(),
        }
    }

    /// Sustained per-IP admission rate.
    pub fn requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    /// Per-IP burst capacity.
    pub fn burst_size(mut self, burst: u32) -> Self {
        self.burst_size = burst;
        self
    }

    /// Enables or disables progressive penalties (one minute per ten
    /// accumulated failures, capped).
    pub fn progressive_penalties(mut self, enabled: bool) -> Self {
        self.enable_progressive = enabled;
        self
    }

    /// Cap on the progressive penalty, in minutes.
    pub fn max_penalty_minutes(mut self, minutes: u32) -> Self {
        self.max_penalty_minutes = minutes;
        self
    }

    /// Enables or disables suspicious-burst detection.
    pub fn suspicious_detection(mut self, enabled: bool) -> Self {
        self.enable_suspicious_detection = enabled;
        self
    }

    /// Failures within five minutes before an IP is considered suspicious.
    pub fn suspicious_threshold(mut self, threshold: u64) -> Self {
        self.suspicious_threshold = threshold;
        self
    }

    /// Penalty applied to suspicious IPs, in minutes. Twice this much earns
    /// a temporary blacklist at double the threshold.
    pub fn suspicious_penalty_minutes(mut self, minutes: u32) -> Self {
        self.suspicious_penalty_minutes = minutes;
        self
    }

    /// Enables the shared per-subnet budget.
    pub fn subnet_limiting(mut self, enabled: bool) -> Self {
        self.enable_subnet_limiting = enabled;
        self
    }

    /// Shared subnet admission rate.
    pub fn subnet_requests_per_minute(mut self, rpm: u32) -> Self {
        self.subnet_requests_per_minute = rpm;
        self
    }

    /// Subnet prefix lengths used to derive the shared key.
    pub fn subnet_prefixes(mut self, v4: u8, v6: u8) -> Self {
        self.subnet_v4_prefix = v4;
        self.subnet_v6_prefix = v6;
        self
    }

    /// Addresses or CIDR blocks that bypass throttling entirely.
    pub fn whitelist<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = entries.into_iter().map(Into::into).collect();
        self
    }

    /// Addresses or CIDR blocks that are always denied.
    pub fn blacklist<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = entries.into_iter().map(Into::into).collect();
        self
    }

    /// Peers allowed to assert the client address via forwarding headers.
    pub fn trusted_proxies<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_proxies = entries.into_iter().map(Into::into).collect();
        self
    }

    /// Shares the security monitor's block list; blocked addresses are
    /// denied with 403 before any accounting.
    pub fn blocklist(mut self, blocklist: BlockList) -> Self {
        self.blocklist = Some(blocklist);
        self
    }

    /// Emits throttle denials onto the given security event bus.
    pub fn event_bus(mut self, bus: SecurityEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// How long an untouched, unpenalized record lives before eviction.
    pub fn idle_eviction(mut self, idle: Duration) -> Self {
        self.idle_eviction = idle;
        self
    }

    /// Interval of the background eviction sweep.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the name for this instance (used in logs).
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Builds the configuration and its throttling engine.
    pub fn build(self) -> Result<ThrottleConfig, ConfigError> {
        if self.requests_per_minute == 0 {
            return Err(ConfigError::NonPositive {
                field: "requests_per_minute",
            });
        }
        if self.burst_size == 0 {
            return Err(ConfigError::NonPositive { field: "burst_size" });
        }
        if self.enable_subnet_limiting && self.subnet_requests_per_minute == 0 {
            return Err(ConfigError::NonPositive {
                field: "subnet_requests_per_minute",
            });
        }
        if self.subnet_v4_prefix > 32 || self.subnet_v6_prefix > 128 {
            return Err(ConfigError::Invalid {
                field: "subnet_prefixes",
                reason: "v4 prefix must be <= 32 and v6 prefix <= 128".to_string(),
            });
        }

        let parse_all = |entries: &[String]| -> Result<Vec<Cidr>, ConfigError> {
            entries.iter().map(|s| Cidr::parse(s)).collect()
        };

        Ok(ThrottleConfig {
            requests_per_minute: self.requests_per_minute,
            burst_size: self.burst_size,
            enable_progressive: self.enable_progressive,
            max_penalty_minutes: self.max_penalty_minutes,
            enable_suspicious_detection: self.enable_suspicious_detection,
            suspicious_threshold: self.suspicious_threshold.max(1),
            suspicious_penalty_minutes: self.suspicious_penalty_minutes,
            enable_subnet_limiting: self.enable_subnet_limiting,
            subnet_requests_per_minute: self.subnet_requests_per_minute,
            subnet_v4_prefix: self.subnet_v4_prefix,
            subnet_v6_prefix: self.subnet_v6_prefix,
            whitelist: parse_all(&self.whitelist)?,
            blacklist: parse_all(&self.blacklist)?,
            resolver: RealIpResolver::new(&self.trusted_proxies)?,
            blocklist: self.blocklist,
            bus: self.bus,
            idle_eviction: self.idle_eviction,
            sweep_interval: self.sweep_interval,
            name: self.name,
        })
    }

    /// Builds the configuration and wraps it in a throttling engine.
    pub fn build_engine(self) -> Result<IpThrottler, ConfigError> {
        Ok(IpThrottler::new(self.build()?))
    }
}
