//! Security event bus and auto-blocking monitor for gatehouse.
//!
//! Protection components (throttler, CSRF validator, input validator)
//! describe what they saw as [`SecurityEvent`]s and emit them through a
//! [`SecurityEventBus`]. Sinks receive events fire-and-forget — one spawned
//! task per sink per event — so a slow log shipper never stalls request
//! processing.
//!
//! The [`SecurityMonitor`] is a sink that aggregates suspicious events per
//! client IP and, past a threshold, adds the address to a shared
//! [`BlockList`] that the IP throttler enforces on admission.
//!
//! ```
//! use gatehouse_events::{MonitorConfig, SecurityEventBus, SecurityMonitor};
//!
//! # async fn example() {
//! let bus = SecurityEventBus::new();
//! bus.subscribe_fn(|event| {
//!     tracing::info!(kind = ?event.kind, ip = %event.client_ip, "security event");
//! });
//!
//! let monitor = SecurityMonitor::install(MonitorConfig::default(), &bus);
//! let blocklist = monitor.blocklist(); // hand this to the throttler
//! # let _ = blocklist;
//! # }
//! ```

mod addr;
mod bus;
mod event;
mod monitor;

pub use addr::{ClientIp, PeerAddr};
pub use bus::{SecurityEventBus, SecuritySink};
pub use event::{SecurityAction, SecurityEvent, SecurityEventKind, Severity};
pub use monitor::{BlockList, MonitorConfig, SecurityMonitor};
