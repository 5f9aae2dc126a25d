pub mod aggregate;
mod worker;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::alarm::AlarmEvaluator;
use crate::config::Settings;
use crate::dns::DnsResolver;
use crate::probe::Prober;
use crate::registry::{Registry, TargetDiff, TargetKey};
use crate::sink::{Batcher, PointWriter};

/// Cap on any single worker's initial stagger delay.
const MAX_STAGGER: Duration = Duration::from_millis(100);

/// Probe cadence parameters shared by every worker.
#[derive(Debug, Clone)]
pub struct Cadence {
    pub datapoint_pings: u32,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// Parsed global source override; None lets the OS pick.
    pub global_source: Option<IpAddr>,
}

impl Cadence {
    pub fn from_settings(settings: &Settings) -> Self {
        let global_source = if settings.ping_source.is_empty() || settings.ping_source == "default"
        {
            None
        } else {
            settings.ping_source.parse().ok()
        };

        Self {
            datapoint_pings: settings.datapoint_pings,
            ping_interval: settings.ping_interval(),
            ping_timeout: Duration::from_secs(settings.ping_timeout),
            global_source,
        }
    }
}

/// Everything a per-target worker needs, shared once.
pub struct Pipeline<P, W> {
    pub registry: Arc<RwLock<Registry>>,
    pub prober: Arc<P>,
    pub batcher: Arc<Batcher<W>>,
    pub alarms: Option<Arc<AlarmEvaluator>>,
    pub cadence: Cadence,
}

struct WorkerHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

/// Owns the per-target workers: starts them staggered, stops exactly the
/// removed ones on reload, and applies candidate registries.
pub struct Supervisor<P, W> {
    pipeline: Arc<Pipeline<P, W>>,
    resolver: Arc<DnsResolver>,
    workers: Mutex<HashMap<TargetKey, WorkerHandle>>,
    cancel: CancellationToken,
    spawned: AtomicUsize,
}

impl<P: Prober, W: PointWriter> Supervisor<P, W> {
    pub fn new(
        pipeline: Arc<Pipeline<P, W>>,
        resolver: Arc<DnsResolver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            resolver,
            workers: Mutex::new(HashMap::new()),
            cancel,
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<RwLock<Registry>> {
        &self.pipeline.registry
    }

    /// Number of currently running workers.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Total workers ever started; unchanged targets across a reload do not
    /// increase it.
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Apply a validated candidate registry with minimum disruption:
    /// carry over resolution state for unchanged targets, resolve new
    /// hostname targets, diff, swap the shared registry, and start/stop
    /// exactly the changed workers.
    pub async fn reconcile(&self, mut candidate: Registry) -> TargetDiff {
        self.carry_over(&mut candidate);

        let summary = self.resolver.preflight(&mut candidate).await;
        if summary.removed > 0 {
            info!(
                removed = summary.removed,
                "targets dropped during DNS resolution",
            );
        }

        let diff = self.pipeline.registry.read().diff(&candidate);
        *self.pipeline.registry.write() = candidate;

        self.stop_workers(&diff.removed);
        self.start_workers(&diff.added);

        if let Some(alarms) = &self.pipeline.alarms {
            alarms.prune(&diff.removed);
        }

        diff
    }

    /// Copy resolution state from the live registry into a candidate for
    /// every key both contain, so reloads do not re-resolve or disturb
    /// unchanged targets.
    fn carry_over(&self, candidate: &mut Registry) {
        let current = self.pipeline.registry.read();
        for (org_name, org) in candidate.organizations.iter_mut() {
            for target in org.hosts.iter_mut() {
                if let Some(existing) = current.get(org_name, &target.name) {
                    if existing.ip == target.ip {
                        target.resolved = existing.resolved;
                        target.last_dns_check = existing.last_dns_check;
                        target.is_dns_name = existing.is_dns_name;
                    }
                }
            }
        }
    }

    fn stop_workers(&self, removed: &[TargetKey]) {
        let mut workers = self.workers.lock();
        for key in removed {
            if let Some(handle) = workers.remove(key) {
                debug!(%key, "stopping scheduler");
                handle.cancel.cancel();
            }
        }
    }

    /// Start one worker per added key, staggered so a batch of N spreads
    /// its first probes instead of bursting.
    fn start_workers(&self, added: &[TargetKey]) {
        let n = added.len();
        if n == 0 {
            return;
        }

        let step = self.pipeline.cadence.ping_interval / n as u32;
        let mut workers = self.workers.lock();

        for (k, key) in added.iter().enumerate() {
            if workers.contains_key(key) {
                continue;
            }

            let delay = step
                .checked_mul(k as u32)
                .unwrap_or(MAX_STAGGER)
                .min(MAX_STAGGER);
            let token = self.cancel.child_token();
            let join = tokio::spawn(worker::run_target(
                Arc::clone(&self.pipeline),
                key.clone(),
                token.clone(),
                delay,
            ));

            debug!(%key, ?delay, "starting scheduler");
            workers.insert(
                key.clone(),
                WorkerHandle {
                    cancel: token,
                    join,
                },
            );
            self.spawned.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Cancel every worker and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock();
            workers.drain().map(|(_, h)| h).collect()
        };

        for handle in handles {
            let _ = handle.join.await;
        }
    }
}
