use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::probe::Prober;
use crate::registry::{Target, TargetKey};
use crate::sink::{DataPoint, PointWriter};

use super::aggregate::aggregate;
use super::Pipeline;

/// Per-window view of a target, read from the registry at the window
/// boundary so DNS and threshold edits apply without a worker restart.
struct Snapshot {
    addr: IpAddr,
    source: Option<IpAddr>,
    source_label: String,
    target: Target,
}

fn snapshot_target<P, W>(pipeline: &Pipeline<P, W>, key: &TargetKey) -> Option<Snapshot> {
    let reg = pipeline.registry.read();
    let target = reg.get(&key.organization, &key.name)?;
    if target.ip != key.ip {
        // The key now belongs to a different target definition; this
        // worker's target was replaced.
        return None;
    }
    let addr = target.probe_addr()?;
    let (source, source_label) = effective_source(target, pipeline);
    Some(Snapshot {
        addr,
        source,
        source_label,
        target: target.clone(),
    })
}

/// Per-target override wins over the global source; "default" and empty
/// both mean "let the OS pick".
fn effective_source<P, W>(target: &Target, pipeline: &Pipeline<P, W>) -> (Option<IpAddr>, String) {
    if !target.ping_source.is_empty() && target.ping_source != "default" {
        if let Ok(addr) = target.ping_source.parse::<IpAddr>() {
            return (Some(addr), target.ping_source.clone());
        }
    }
    match pipeline.cadence.global_source {
        Some(addr) => (Some(addr), addr.to_string()),
        None => (None, "default".to_string()),
    }
}

/// The long-lived loop for one target: probe `datapoint_pings` times per
/// window at the ping interval, aggregate, and forward the data point.
///
/// Cancellation (shutdown or removal) discards the in-flight window.
pub(super) async fn run_target<P: Prober, W: PointWriter>(
    pipeline: Arc<Pipeline<P, W>>,
    key: TargetKey,
    cancel: CancellationToken,
    start_delay: Duration,
) {
    if !start_delay.is_zero() {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(start_delay) => {}
        }
    }

    let pings = pipeline.cadence.datapoint_pings;
    let mut ticker = tokio::time::interval(pipeline.cadence.ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!(%key, interval = ?pipeline.cadence.ping_interval, "scheduler started");

    let mut samples: Vec<Duration> = Vec::with_capacity(pings as usize);

    loop {
        let Some(snapshot) = snapshot_target(&pipeline, &key) else {
            debug!(%key, "target no longer in registry, scheduler exiting");
            return;
        };

        samples.clear();
        let mut window_start = Utc::now();

        for i in 0..pings {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if i == 0 {
                // Window timestamps are anchored to the first probe, not
                // the scheduled boundary.
                window_start = Utc::now();
            }

            let rtt = tokio::select! {
                _ = cancel.cancelled() => return,
                rtt = pipeline.prober.probe(
                    snapshot.addr,
                    snapshot.source,
                    pipeline.cadence.ping_timeout,
                ) => rtt,
            };

            match rtt {
                Some(rtt) => samples.push(rtt),
                None => debug!(%key, probe = i + 1, "probe lost"),
            }
        }

        let stats = aggregate(&samples, pings);
        debug!(
            %key,
            avg_rtt_ms = stats.avg_rtt_ms,
            loss_pct = stats.loss_pct,
            jitter_ms = stats.jitter_ms,
            "window complete",
        );

        let point = DataPoint {
            organization: key.organization.clone(),
            target_name: key.name.clone(),
            original_address: key.ip.clone(),
            resolved_address: Some(snapshot.addr),
            source_address: snapshot.source_label.clone(),
            window_start,
            avg_rtt_ms: stats.avg_rtt_ms,
            loss_pct: stats.loss_pct,
            jitter_ms: stats.jitter_ms,
            is_dns_name: snapshot.target.is_dns_name,
        };

        pipeline.batcher.push(point.clone());
        if let Some(alarms) = &pipeline.alarms {
            alarms.evaluate(&point, &snapshot.target);
        }
    }
}
