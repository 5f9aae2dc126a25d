//! Active network quality monitor: staggered ICMP probing over a live
//! target set, windowed latency/loss/jitter aggregation, batched InfluxDB
//! export, and threshold alarms with external handlers.

pub mod agent;
pub mod alarm;
pub mod config;
pub mod dns;
pub mod loader;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod syslog;
pub mod watch;
