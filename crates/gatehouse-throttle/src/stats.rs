//! The throttling engine: per-IP and per-subnet accounting.

use crate::config::ThrottleConfig;
use crate::realip::subnet_key;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The address is on the static blacklist.
    Blacklisted,
    /// The address was auto-blocked by the security monitor.
    AutoBlocked,
    /// The address is serving a progressive or suspicious-behavior penalty.
    UnderPenalty,
    /// The address is serving a temporary blacklist earned by a failure burst.
    TemporarilyBlacklisted,
    /// The address's subnet exhausted its shared budget.
    SubnetLimit,
    /// The address exhausted its own budget.
    RateLimit,
}

impl DenyReason {
    /// Human-readable reason used in `Request throttled: <reason>` bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::Blacklisted => "IP blacklisted",
            DenyReason::AutoBlocked => "IP blocked",
            DenyReason::UnderPenalty => "IP under penalty",
            DenyReason::TemporarilyBlacklisted => "IP temporarily blacklisted",
            DenyReason::SubnetLimit => "Subnet rate limit exceeded",
            DenyReason::RateLimit => "Rate limit exceeded",
        }
    }

    /// Denials that are final for the client (403, not re-counted) rather
    /// than transient throttling (429).
    pub fn is_forbidden(self) -> bool {
        matches!(self, DenyReason::Blacklisted | DenyReason::AutoBlocked)
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// The request may proceed.
    Allowed,
    /// The request is denied.
    Denied {
        reason: DenyReason,
        /// Time until the client should try again, when known.
        retry_after: Option<Duration>,
    },
}

impl ThrottleDecision {
    fn denied(reason: DenyReason, retry_after: Option<Duration>) -> Self {
        Self::Denied {
            reason,
            retry_after,
        }
    }
}

/// Point-in-time view of one address's record, for dashboards and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSnapshot {
    pub total: u64,
    pub failed: u64,
    pub penalty_remaining: Option<Duration>,
    pub blacklist_remaining: Option<Duration>,
}

#[derive(Debug)]
struct IpStats {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    total: u64,
    failed: u64,
    last_failure: Option<Instant>,
    penalty_until: Option<Instant>,
    blacklisted_until: Option<Instant>,
}

impl IpStats {
    fn new(now: Instant, burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: now,
            last_seen: now,
            total: 0,
            failed: 0,
            last_failure: None,
            penalty_until: None,
            blacklisted_until: None,
        }
    }

    /// Effective refill rate given the failure ratio.
    fn adaptive_rate(&self, baseline: u32) -> f64 {
        let baseline = baseline as f64;
        if self.total == 0 {
            return baseline;
        }
        let ratio = self.failed as f64 / self.total as f64;
        if ratio > 0.5 {
            baseline / 4.0
        } else if ratio > 0.2 {
            baseline / 2.0
        } else {
            baseline
        }
    }

    fn refill(&mut self, now: Instant, rate_per_minute: f64, burst: u32) {
        let elapsed = now.duration_since(self.last_refill);
        let added = elapsed.as_secs_f64() * rate_per_minute / 60.0;
        if added > 0.0 {
            self.tokens = (self.tokens + added).min(burst as f64);
            self.last_refill = now;
        }
    }

    fn restrained(&self, now: Instant) -> bool {
        matches!(self.penalty_until, Some(until) if until > now)
            || matches!(self.blacklisted_until, Some(until) if until > now)
    }
}

#[derive(Debug)]
struct SubnetStats {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

struct ThrottlerInner {
    config: ThrottleConfig,
    ips: RwLock<HashMap<IpAddr, Arc<Mutex<IpStats>>>>,
    subnets: RwLock<HashMap<String, Arc<Mutex<SubnetStats>>>>,
}

/// The per-IP throttling engine.
///
/// Admission combines a static blacklist/whitelist, the monitor's shared
/// block list, progressive penalties earned through failures, an optional
/// per-subnet budget, and an adaptive per-IP token bucket whose refill rate
/// degrades as the address's failure ratio climbs.
#[derive(Clone)]
pub struct IpThrottler {
    inner: Arc<ThrottlerInner>,
    cancel: CancellationToken,
}

impl IpThrottler {
    pub(crate) fn new(config: ThrottleConfig) -> Self {
        let inner = Arc::new(ThrottlerInner {
            config,
            ips: RwLock::new(HashMap::new()),
            subnets: RwLock::new(HashMap::new()),
        });
        let cancel = CancellationToken::new();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sweep = Arc::downgrade(&inner);
            let token = cancel.clone();
            handle.spawn(async move {
                let (interval, idle_limit) = {
                    let Some(inner) = sweep.upgrade() else { return };
                    (inner.config.sweep_interval, inner.config.idle_eviction)
                };
                let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(inner) = sweep.upgrade() else { break };
                            let now = Instant::now();
                            let mut evicted = 0;
                            {
                                let mut ips =
                                    inner.ips.write().unwrap_or_else(|e| e.into_inner());
                                let before = ips.len();
                                ips.retain(|_, entry| {
                                    let stats =
                                        entry.lock().unwrap_or_else(|e| e.into_inner());
                                    now.duration_since(stats.last_seen) <= idle_limit
                                        || stats.restrained(now)
                                });
                                evicted += before - ips.len();
                            }
                            {
                                let mut subnets =
                                    inner.subnets.write().unwrap_or_else(|e| e.into_inner());
                                let before = subnets.len();
                                subnets.retain(|_, entry| {
                                    let stats =
                                        entry.lock().unwrap_or_else(|e| e.into_inner());
                                    now.duration_since(stats.last_seen) <= idle_limit
                                });
                                evicted += before - subnets.len();
                            }
                            if evicted > 0 {
                                tracing::debug!(evicted, "evicted idle throttle records");
                            }
                        }
                    }
                }
            });
        }

        Self { inner, cancel }
    }

    /// Stops the background eviction sweep. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn entry(&self, ip: IpAddr, now: Instant) -> Arc<Mutex<IpStats>> {
        if let Some(entry) = self
            .inner
            .ips
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ip)
        {
            return Arc::clone(entry);
        }
        let mut ips = self.inner.ips.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(ips.entry(ip).or_insert_with(|| {
            Arc::new(Mutex::new(IpStats::new(now, self.inner.config.burst_size)))
        }))
    }

    /// Runs the admission sequence for `ip`.
    pub fn check(&self, ip: IpAddr) -> ThrottleDecision {
        let config = &self.inner.config;

        if config.blacklist.iter().any(|cidr| cidr.contains(&ip)) {
            return ThrottleDecision::denied(DenyReason::Blacklisted, None);
        }
        if config.whitelist.iter().any(|cidr| cidr.contains(&ip)) {
            return ThrottleDecision::Allowed;
        }
        if let Some(blocklist) = &config.blocklist {
            if blocklist.is_blocked(&ip) {
                return ThrottleDecision::denied(DenyReason::AutoBlocked, None);
            }
        }

        let now = Instant::now();
        let entry = self.entry(ip, now);
        let mut stats = entry.lock().unwrap_or_else(|e| e.into_inner());
        stats.last_seen = now;

        if let Some(until) = stats.penalty_until {
            if until > now {
                return ThrottleDecision::denied(
                    DenyReason::UnderPenalty,
                    Some(until.duration_since(now)),
                );
            }
        }
        if let Some(until) = stats.blacklisted_until {
            if until > now {
                return ThrottleDecision::denied(
                    DenyReason::TemporarilyBlacklisted,
                    Some(until.duration_since(now)),
                );
            }
        }

        let rate = stats.adaptive_rate(config.requests_per_minute);
        stats.refill(now, rate, config.burst_size);

        if config.enable_subnet_limiting && !self.admit_subnet(ip, now) {
            return ThrottleDecision::denied(DenyReason::SubnetLimit, None);
        }

        if stats.tokens >= 1.0 {
            stats.tokens -= 1.0;
            stats.total += 1;
            ThrottleDecision::Allowed
        } else {
            // Time until the next whole token accrues at the current rate.
            let wait = Duration::from_secs_f64(60.0 / rate.max(f64::MIN_POSITIVE));
            ThrottleDecision::denied(DenyReason::RateLimit, Some(wait))
        }
    }

    fn admit_subnet(&self, ip: IpAddr, now: Instant) -> bool {
        let config = &self.inner.config;
        let key = subnet_key(ip, config.subnet_v4_prefix, config.subnet_v6_prefix);

        let entry = {
            if let Some(entry) = self
                .inner
                .subnets
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&key)
            {
                Arc::clone(entry)
            } else {
                let mut subnets = self.inner.subnets.write().unwrap_or_else(|e| e.into_inner());
                Arc::clone(subnets.entry(key).or_insert_with(|| {
                    Arc::new(Mutex::new(SubnetStats {
                        tokens: config.subnet_requests_per_minute as f64,
                        last_refill: now,
                        last_seen: now,
                    }))
                }))
            }
        };

        let mut stats = entry.lock().unwrap_or_else(|e| e.into_inner());
        stats.last_seen = now;
        let elapsed = now.duration_since(stats.last_refill);
        let added = elapsed.as_secs_f64() * config.subnet_requests_per_minute as f64 / 60.0;
        if added > 0.0 {
            stats.tokens = (stats.tokens + added).min(config.subnet_requests_per_minute as f64);
            stats.last_refill = now;
        }
        if stats.tokens >= 1.0 {
            stats.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Records a failed response (status >= 400) from `ip` and applies
    /// progressive penalties and suspicious-behavior escalation.
    pub fn record_failure(&self, ip: IpAddr) {
        let config = &self.inner.config;
        if config.whitelist.iter().any(|cidr| cidr.contains(&ip)) {
            return;
        }

        let now = Instant::now();
        let entry = self.entry(ip, now);
        let mut stats = entry.lock().unwrap_or_else(|e| e.into_inner());

        let previous_failure = stats.last_failure;
        stats.failed += 1;
        stats.last_failure = Some(now);

        if config.enable_progressive {
            let minutes = (stats.failed / 10).min(config.max_penalty_minutes as u64);
            if minutes > 0 {
                let until = now + Duration::from_secs(minutes * 60);
                extend(&mut stats.penalty_until, until);
                tracing::info!(
                    ip = %ip,
                    failed = stats.failed,
                    penalty_minutes = minutes,
                    "progressive penalty applied"
                );
            }
        }

        if config.enable_suspicious_detection {
            let burst = matches!(
                previous_failure,
                Some(prev) if now.duration_since(prev) < Duration::from_secs(300)
            );
            if burst && stats.failed >= config.suspicious_threshold {
                let until =
                    now + Duration::from_secs(config.suspicious_penalty_minutes as u64 * 60);
                extend(&mut stats.penalty_until, until);
                tracing::warn!(
                    ip = %ip,
                    failed = stats.failed,
                    "suspicious failure burst, penalty escalated"
                );
                if stats.failed >= config.suspicious_threshold * 2 {
                    let until = now
                        + Duration::from_secs(config.suspicious_penalty_minutes as u64 * 2 * 60);
                    extend(&mut stats.blacklisted_until, until);
                    tracing::warn!(ip = %ip, "IP temporarily blacklisted");
                }
            }
        }
    }

    /// Blocks `ip` until `duration` from now, as if it had earned a
    /// temporary blacklist.
    pub fn block_ip(&self, ip: IpAddr, duration: Duration) {
        let now = Instant::now();
        let entry = self.entry(ip, now);
        let mut stats = entry.lock().unwrap_or_else(|e| e.into_inner());
        extend(&mut stats.blacklisted_until, now + duration);
    }

    /// Lifts any penalty or temporary blacklist on `ip`.
    pub fn unblock_ip(&self, ip: IpAddr) {
        if let Some(entry) = self
            .inner
            .ips
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ip)
        {
            let mut stats = entry.lock().unwrap_or_else(|e| e.into_inner());
            stats.penalty_until = None;
            stats.blacklisted_until = None;
        }
        if let Some(blocklist) = &self.inner.config.blocklist {
            blocklist.unblock(&ip);
        }
    }

    /// Point-in-time view of the record for `ip`.
    pub fn snapshot(&self, ip: IpAddr) -> Option<IpSnapshot> {
        let entry = {
            let ips = self.inner.ips.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(ips.get(&ip)?)
        };
        let stats = entry.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let remaining = |until: Option<Instant>| {
            until.and_then(|u| (u > now).then(|| u.duration_since(now)))
        };
        Some(IpSnapshot {
            total: stats.total,
            failed: stats.failed,
            penalty_remaining: remaining(stats.penalty_until),
            blacklist_remaining: remaining(stats.blacklisted_until),
        })
    }

    /// Number of addresses currently tracked.
    pub fn tracked_ips(&self) -> usize {
        self.inner.ips.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn config(&self) -> &ThrottleConfig {
        &self.inner.config
    }
}

impl Drop for IpThrottler {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.cancel.cancel();
        }
    }
}

/// Pushes `slot` forward to `until`, never backward.
fn extend(slot: &mut Option<Instant>, until: Instant) {
    match slot {
        Some(existing) if *existing >= until => {}
        _ => *slot = Some(until),
    }
}
