pub mod handler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::registry::{Target, TargetKey};
use crate::sink::DataPoint;
use crate::syslog::EventLog;

/// Checks completed data points against per-target thresholds, rate-limits
/// re-fires, and dispatches the external handler.
pub struct AlarmEvaluator {
    rate: Duration,
    global_receiver: String,
    last_fired: RwLock<HashMap<(String, String), DateTime<Utc>>>,
    events: Arc<EventLog>,
}

impl AlarmEvaluator {
    pub fn new(rate_secs: u64, global_receiver: String, events: Arc<EventLog>) -> Self {
        Self {
            rate: Duration::from_secs(rate_secs),
            global_receiver,
            last_fired: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// The handler that applies to a target: its own override, else the
    /// global receiver.
    pub fn effective_receiver<'a>(&'a self, target: &'a Target) -> &'a str {
        if target.alarm_receiver.is_empty() {
            &self.global_receiver
        } else {
            &target.alarm_receiver
        }
    }

    /// Evaluate one data point. `target` is the registry snapshot the worker
    /// probed with, so threshold edits apply from the next window onward.
    pub fn evaluate(&self, point: &DataPoint, target: &Target) {
        if target.alarm_rtt_ms == 0 && target.alarm_loss_pct == 0 && target.alarm_jitter_ms == 0 {
            return;
        }

        let receiver = self.effective_receiver(target);
        if receiver.is_empty() || receiver.eq_ignore_ascii_case("none") {
            debug!(
                host = %point.target_name,
                "no alarm receiver configured, skipping alarm check",
            );
            return;
        }

        let reasons = triggered_reasons(point, target);
        if reasons.is_empty() {
            return;
        }

        let key = (point.organization.clone(), point.target_name.clone());
        let now = Utc::now();
        {
            let last = self.last_fired.read();
            if let Some(fired) = last.get(&key) {
                let since = (now - *fired).to_std().unwrap_or(Duration::ZERO);
                if since < self.rate {
                    debug!(
                        host = %point.target_name,
                        since_secs = since.as_secs(),
                        rate_secs = self.rate.as_secs(),
                        "alarm suppressed by rate limit",
                    );
                    return;
                }
            }
        }
        self.last_fired.write().insert(key, now);

        let reasons_joined = reasons.join(",");
        error!(
            host = %point.target_name,
            ip = %point.original_address,
            organization = %point.organization,
            reasons = %reasons_joined,
            receiver = %receiver,
            "ALARM",
        );
        self.events.alarm(&format!(
            "ALARM: {} ({}) in {} - {} - RTT={:.1}ms LOSS={:.1}% JITTER={:.1}ms",
            point.target_name,
            point.original_address,
            point.organization,
            reasons_joined,
            point.avg_rtt_ms,
            point.loss_pct,
            point.jitter_ms,
        ));

        let invocation = handler::Invocation::new(receiver, point, target, &reasons);
        tokio::spawn(async move {
            invocation.execute().await;
        });
    }

    /// Forget alarm state for targets removed by a reload.
    pub fn prune(&self, removed: &[TargetKey]) {
        if removed.is_empty() {
            return;
        }
        let mut last = self.last_fired.write();
        for key in removed {
            last.remove(&(key.organization.clone(), key.name.clone()));
        }
    }

    #[cfg(test)]
    fn last_fired_count(&self) -> usize {
        self.last_fired.read().len()
    }
}

/// The alarm channels a data point trips, as reason tokens.
pub fn triggered_reasons(point: &DataPoint, target: &Target) -> Vec<String> {
    let mut reasons = Vec::new();

    if target.alarm_rtt_ms > 0 && point.avg_rtt_ms > f64::from(target.alarm_rtt_ms) {
        reasons.push(format!(
            "ping_time={:.1}ms>{}ms",
            point.avg_rtt_ms, target.alarm_rtt_ms
        ));
    }
    if target.alarm_loss_pct > 0 && point.loss_pct > f64::from(target.alarm_loss_pct) {
        reasons.push(format!(
            "packet_loss={:.1}%>{}%",
            point.loss_pct, target.alarm_loss_pct
        ));
    }
    if target.alarm_jitter_ms > 0 && point.jitter_ms > f64::from(target.alarm_jitter_ms) {
        reasons.push(format!(
            "jitter={:.1}ms>{}ms",
            point.jitter_ms, target.alarm_jitter_ms
        ));
    }

    reasons
}
