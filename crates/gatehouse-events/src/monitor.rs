//! Aggregation of suspicious events into automatic IP blocks.

use crate::bus::{SecurityEventBus, SecuritySink};
use crate::event::{SecurityAction, SecurityEvent, SecurityEventKind, Severity};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Shared set of temporarily blocked addresses.
///
/// The monitor writes it; the throttler consults it on admission. Entries
/// expire lazily on lookup and eagerly during the monitor's sweep.
#[derive(Clone, Default)]
pub struct BlockList {
    entries: Arc<RwLock<HashMap<IpAddr, Instant>>>,
}

impl BlockList {
    /// Creates an empty block list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks `ip` for `duration` from now. Extends an existing block only
    /// if the new expiry is later.
    pub fn block(&self, ip: IpAddr, duration: Duration) {
        let until = Instant::now() + duration;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(ip).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    /// Removes any block for `ip`.
    pub fn unblock(&self, ip: &IpAddr) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ip);
    }

    /// Whether `ip` is currently blocked. An expired entry is removed.
    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(ip) {
                Some(&until) if until > now => return true,
                Some(_) => {}
                None => return false,
            }
        }
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ip);
        false
    }

    /// Number of live entries (expired ones included until purged).
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, &mut until| until > now);
    }
}

/// Configuration for the [`SecurityMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Suspicious events per IP inside `window` before the IP is blocked.
    pub block_threshold: usize,
    /// Rolling window over which suspicious events are counted.
    pub window: Duration,
    /// How long an auto-blocked IP stays blocked.
    pub block_duration: Duration,
    /// Interval of the background sweep evicting stale offender records.
    pub sweep_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            block_threshold: 10,
            window: Duration::from_secs(600),
            block_duration: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct MonitorInner {
    config: MonitorConfig,
    offenders: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
    blocklist: BlockList,
    bus: SecurityEventBus,
}

/// Counts suspicious events per client IP and blocks offenders.
///
/// The monitor subscribes to a [`SecurityEventBus`]; when one IP accumulates
/// `block_threshold` suspicious events within the rolling window, the IP is
/// added to the shared [`BlockList`] and a single `ip_blocked` event is
/// emitted back onto the bus.
#[derive(Clone)]
pub struct SecurityMonitor {
    inner: Arc<MonitorInner>,
    cancel: CancellationToken,
}

impl SecurityMonitor {
    /// Creates a monitor and subscribes it to `bus`.
    ///
    /// Returns the monitor; its [`BlockList`] handle is shared with whoever
    /// enforces the blocks (usually the IP throttler).
    pub fn install(config: MonitorConfig, bus: &SecurityEventBus) -> Self {
        let monitor = Self::new(config, bus.clone());
        bus.subscribe(monitor.clone());
        monitor
    }

    fn new(config: MonitorConfig, bus: SecurityEventBus) -> Self {
        let inner = Arc::new(MonitorInner {
            config,
            offenders: Mutex::new(HashMap::new()),
            blocklist: BlockList::new(),
            bus,
        });
        let cancel = CancellationToken::new();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sweep = Arc::downgrade(&inner);
            let token = cancel.clone();
            handle.spawn(async move {
                let interval = {
                    let Some(inner) = sweep.upgrade() else { return };
                    inner.config.sweep_interval
                };
                let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(inner) = sweep.upgrade() else { break };
                            if let Some(cutoff) =
                                Instant::now().checked_sub(inner.config.window)
                            {
                                let mut offenders =
                                    inner.offenders.lock().unwrap_or_else(|e| e.into_inner());
                                offenders.retain(|_, hits| {
                                    while matches!(hits.front(), Some(&t) if t < cutoff) {
                                        hits.pop_front();
                                    }
                                    !hits.is_empty()
                                });
                            }
                            inner.blocklist.purge_expired();
                        }
                    }
                }
            });
        }

        Self { inner, cancel }
    }

    /// The block list this monitor writes to.
    pub fn blocklist(&self) -> BlockList {
        self.inner.blocklist.clone()
    }

    /// Current suspicious-event count for `ip` inside the rolling window.
    pub fn suspicion_count(&self, ip: &IpAddr) -> usize {
        let cutoff = Instant::now().checked_sub(self.inner.config.window);
        self.inner
            .offenders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(ip)
            .map(|hits| {
                hits.iter()
                    .filter(|&&t| cutoff.map_or(true, |c| t >= c))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Stops the background sweep. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn record(&self, event: &SecurityEvent) {
        if !event.kind.is_suspicious() {
            return;
        }
        let Ok(ip) = event.client_ip.parse::<IpAddr>() else {
            return;
        };
        if self.inner.blocklist.is_blocked(&ip) {
            return;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.inner.config.window);
        let should_block = {
            let mut offenders = self
                .inner
                .offenders
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let hits = offenders.entry(ip).or_default();
            while matches!((hits.front(), cutoff), (Some(&t), Some(c)) if t < c) {
                hits.pop_front();
            }
            hits.push_back(now);
            if hits.len() >= self.inner.config.block_threshold {
                // Start a fresh count for the next offense cycle.
                hits.clear();
                true
            } else {
                false
            }
        };

        if should_block {
            self.inner
                .blocklist
                .block(ip, self.inner.config.block_duration);
            tracing::warn!(
                ip = %ip,
                block_secs = self.inner.config.block_duration.as_secs(),
                "auto-blocking IP after repeated suspicious activity"
            );
            self.inner.bus.emit(
                SecurityEvent::new(
                    SecurityEventKind::IpBlocked,
                    Severity::High,
                    SecurityAction::Blocked,
                    format!(
                        "IP blocked for {}s after repeated suspicious activity",
                        self.inner.config.block_duration.as_secs()
                    ),
                )
                .with_client_ip(ip.to_string()),
            );
        }
    }
}

impl SecuritySink for SecurityMonitor {
    fn receive(&self, event: &SecurityEvent) {
        self.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suspicious(ip: &str) -> SecurityEvent {
        SecurityEvent::new(
            SecurityEventKind::SuspiciousRequest,
            Severity::Medium,
            SecurityAction::Monitored,
            "probe",
        )
        .with_client_ip(ip)
    }

    #[test]
    fn blocklist_expires_entries() {
        let list = BlockList::new();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        list.block(ip, Duration::from_millis(20));
        assert!(list.is_blocked(&ip));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!list.is_blocked(&ip));
        assert!(list.is_empty());
    }

    #[test]
    fn blocklist_keeps_the_later_expiry() {
        let list = BlockList::new();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        list.block(ip, Duration::from_secs(60));
        list.block(ip, Duration::from_millis(1));
        // The longer block wins.
        std::thread::sleep(Duration::from_millis(5));
        assert!(list.is_blocked(&ip));
    }

    #[tokio::test]
    async fn monitor_blocks_at_the_threshold() {
        let bus = SecurityEventBus::new();
        let monitor = SecurityMonitor::install(
            MonitorConfig {
                block_threshold: 3,
                window: Duration::from_secs(60),
                block_duration: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(60),
            },
            &bus,
        );
        let blocklist = monitor.blocklist();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        // Feed the monitor directly; bus dispatch order is not the point.
        monitor.receive(&suspicious("203.0.113.5"));
        monitor.receive(&suspicious("203.0.113.5"));
        assert!(!blocklist.is_blocked(&ip));

        monitor.receive(&suspicious("203.0.113.5"));
        assert!(blocklist.is_blocked(&ip));
    }

    #[tokio::test]
    async fn blocking_emits_ip_blocked_once() {
        let bus = SecurityEventBus::new();
        let blocked_events = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let blocked_clone = Arc::clone(&blocked_events);
        bus.subscribe_fn(move |event| {
            if event.kind == SecurityEventKind::IpBlocked {
                blocked_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let monitor = SecurityMonitor::install(
            MonitorConfig {
                block_threshold: 2,
                ..MonitorConfig::default()
            },
            &bus,
        );

        for _ in 0..5 {
            monitor.receive(&suspicious("203.0.113.6"));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            blocked_events.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn non_suspicious_kinds_are_ignored() {
        let bus = SecurityEventBus::new();
        let monitor = SecurityMonitor::install(
            MonitorConfig {
                block_threshold: 1,
                ..MonitorConfig::default()
            },
            &bus,
        );

        let event = SecurityEvent::new(
            SecurityEventKind::RateLimitExceeded,
            Severity::Low,
            SecurityAction::Blocked,
            "limited",
        )
        .with_client_ip("203.0.113.7");
        monitor.receive(&event);

        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert!(!monitor.blocklist().is_blocked(&ip));
    }

    #[tokio::test]
    async fn counts_are_per_ip() {
        let bus = SecurityEventBus::new();
        let monitor = SecurityMonitor::install(
            MonitorConfig {
                block_threshold: 3,
                ..MonitorConfig::default()
            },
            &bus,
        );

        monitor.receive(&suspicious("203.0.113.1"));
        monitor.receive(&suspicious("203.0.113.2"));
        monitor.receive(&suspicious("203.0.113.1"));

        let one: IpAddr = "203.0.113.1".parse().unwrap();
        let two: IpAddr = "203.0.113.2".parse().unwrap();
        assert_eq!(monitor.suspicion_count(&one), 2);
        assert_eq!(monitor.suspicion_count(&two), 1);
        assert!(!monitor.blocklist().is_blocked(&one));
    }
}
