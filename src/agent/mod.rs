use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alarm::AlarmEvaluator;
use crate::config::Settings;
use crate::dns::{self, DnsResolver};
use crate::loader::Loader;
use crate::probe::IcmpProber;
use crate::registry::Registry;
use crate::scheduler::{Cadence, Pipeline, Supervisor};
use crate::sink::influx::InfluxWriter;
use crate::sink::Batcher;
use crate::syslog::EventLog;
use crate::watch::{hosts_per_second, TargetWatcher};

/// Command-line toggles the agent honors.
#[derive(Debug, Clone)]
pub struct Options {
    pub config_path: PathBuf,
    pub targets_path: PathBuf,
    /// Skip alarm evaluation entirely.
    pub no_alarm: bool,
    /// Suppress alarm events on the system log.
    pub no_log: bool,
}

/// Orchestrates every component: loader, DNS, sink, schedulers, alarms,
/// file watcher. Owns the root cancellation token.
pub struct Agent {
    settings: Settings,
    options: Options,
    events: Arc<EventLog>,
    supervisor: Option<Arc<Supervisor<IcmpProber, InfluxWriter>>>,
    batcher: Option<Arc<Batcher<InfluxWriter>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
    /// Cancelled only after every worker has exited, so the final flush
    /// cannot race with a worker finishing its last window.
    batcher_cancel: CancellationToken,
}

impl Agent {
    /// Load and validate the main settings file.
    pub fn new(options: Options) -> Result<Self> {
        info!(file = %options.config_path.display(), "loading configuration");
        let settings = Settings::load(&options.config_path)
            .with_context(|| format!("loading {}", options.config_path.display()))?;
        info!(%settings, "configuration loaded");

        let events = Arc::new(EventLog::new(!options.no_log));

        Ok(Self {
            settings,
            options,
            events,
            supervisor: None,
            batcher: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
            batcher_cancel: CancellationToken::new(),
        })
    }

    /// Bring every component up. Any error here is a startup failure and
    /// exits the process non-zero.
    pub async fn start(&mut self) -> Result<()> {
        // Load and validate the target set before touching the network.
        info!(file = %self.options.targets_path.display(), "loading targets");
        let loader = Loader::new(self.settings.clone(), self.options.targets_path.clone());
        let loaded = loader.load().context("loading targets")?;
        info!(
            organizations = loaded.registry.organizations.len(),
            targets = loaded.registry.total_targets(),
            "targets validated",
        );

        // The sink must be reachable before probing begins.
        let writer = Arc::new(InfluxWriter::new(&self.settings)?);
        writer
            .health()
            .await
            .context("InfluxDB health check failed")?;
        info!(url = %self.settings.influx_url, "connected to InfluxDB");

        let batcher = Arc::new(Batcher::new(
            Arc::clone(&writer),
            self.settings.influx_batch_size,
        ));
        Arc::clone(&batcher).start(
            Duration::from_secs(self.settings.influx_batch_time),
            self.batcher_cancel.clone(),
        );

        let alarms = if self.options.no_alarm {
            info!("alarm system disabled by --noalarm");
            None
        } else {
            Some(Arc::new(AlarmEvaluator::new(
                self.settings.alarm_rate,
                self.settings.alarm_receiver.clone(),
                Arc::clone(&self.events),
            )))
        };

        let registry = Arc::new(RwLock::new(Registry::default()));
        let resolver = Arc::new(DnsResolver::new());
        let pipeline = Arc::new(Pipeline {
            registry: Arc::clone(&registry),
            prober: Arc::new(IcmpProber),
            batcher: Arc::clone(&batcher),
            alarms,
            cadence: Cadence::from_settings(&self.settings),
        });
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&pipeline),
            Arc::clone(&resolver),
            self.cancel.child_token(),
        ));

        // Resolve hostname targets and start the per-target schedulers.
        info!("resolving hostname targets");
        let includes = loaded.includes.clone();
        let diff = supervisor.reconcile(loaded.registry).await;

        let total = registry.read().total_targets();
        let per_second = hosts_per_second(total, self.settings.datapoint_time);
        info!(
            targets = total,
            started = diff.added.len(),
            hosts_per_second = per_second,
            "monitoring started",
        );
        self.events.info(&format!(
            "smogping started: monitoring {total} targets, starting {per_second} \
             hosts/second over {} seconds",
            self.settings.datapoint_time
        ));

        if let Some(task) = dns::spawn_refresh(
            Arc::clone(&resolver),
            Arc::clone(&registry),
            Arc::clone(&self.events),
            self.settings.dns_refresh,
            self.cancel.child_token(),
        ) {
            self.tasks.push(task);
        }

        let watcher = TargetWatcher::new(
            loader,
            Arc::clone(&supervisor),
            Arc::clone(&self.events),
            self.settings.datapoint_time,
        );
        match watcher.spawn(includes, self.cancel.child_token()) {
            Ok(task) => self.tasks.push(task),
            Err(e) => warn!(error = %e, "file watching unavailable, live reload disabled"),
        }

        self.supervisor = Some(supervisor);
        self.batcher = Some(batcher);

        info!("agent running");
        Ok(())
    }

    /// Drain: stop workers, flush the batch queue, stop auxiliary tasks.
    pub async fn stop(&mut self) {
        info!("draining");
        self.cancel.cancel();

        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }

        // All workers have exited; the batcher's task now performs the
        // mandatory final flush.
        self.batcher_cancel.cancel();
        if let Some(batcher) = &self.batcher {
            batcher.wait_for_shutdown().await;
        }

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        self.events.info("smogping stopped");
        info!("agent stopped");
    }
}
