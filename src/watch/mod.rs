use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::loader::Loader;
use crate::probe::Prober;
use crate::scheduler::Supervisor;
use crate::sink::PointWriter;
use crate::syslog::EventLog;

/// Quiet period after the last Write/Create event before a reload runs.
const DEBOUNCE: Duration = Duration::from_secs(2);

/// Watches the target-set file and its includes, debounces edit bursts, and
/// drives reload-validate-reconcile. A failed reload leaves the running
/// registry untouched.
pub struct TargetWatcher<P, W> {
    loader: Loader,
    supervisor: Arc<Supervisor<P, W>>,
    events: Arc<EventLog>,
    datapoint_time: u64,
}

impl<P: Prober, W: PointWriter> TargetWatcher<P, W> {
    pub fn new(
        loader: Loader,
        supervisor: Arc<Supervisor<P, W>>,
        events: Arc<EventLog>,
        datapoint_time: u64,
    ) -> Self {
        Self {
            loader,
            supervisor,
            events,
            datapoint_time,
        }
    }

    /// Start watching. The returned task owns the filesystem watcher and
    /// exits on cancellation.
    pub fn spawn(
        self,
        initial_includes: Vec<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })
        .context("creating file watcher")?;

        let mut watched: HashSet<PathBuf> = HashSet::new();
        watch_file(&mut watcher, &mut watched, self.loader.targets_path());
        for include in &initial_includes {
            watch_file(&mut watcher, &mut watched, include);
        }

        let handle = tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the task.
            let mut watcher = watcher;
            let mut deadline: Option<tokio::time::Instant> = None;

            loop {
                let sleep_until = deadline
                    .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

                tokio::select! {
                    _ = cancel.cancelled() => return,

                    event = rx.recv() => match event {
                        Some(Ok(event)) => {
                            if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                                debug!(paths = ?event.paths, "target file changed");
                                deadline = Some(tokio::time::Instant::now() + DEBOUNCE);
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "file watcher error");
                        }
                        None => return,
                    },

                    _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                        deadline = None;
                        self.reload(&mut watcher, &mut watched).await;
                    }
                }
            }
        });

        Ok(handle)
    }

    /// Load, validate, and apply the current target files.
    async fn reload(&self, watcher: &mut RecommendedWatcher, watched: &mut HashSet<PathBuf>) {
        info!("reloading targets");

        let loaded = match self.loader.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(error = %e, "target reload failed, keeping current targets");
                return;
            }
        };

        let includes = loaded.includes.clone();
        let diff = self.supervisor.reconcile(loaded.registry).await;

        if diff.is_noop() {
            debug!("no target changes detected");
        } else {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                unchanged = diff.unchanged.len(),
                "target changes applied",
            );
            for key in &diff.added {
                debug!(%key, "added target");
            }
            for key in &diff.removed {
                debug!(%key, "removed target");
            }

            let total = self.supervisor.registry().read().total_targets();
            let per_second = hosts_per_second(total, self.datapoint_time);
            self.events.info(&format!(
                "Targets reloaded: monitoring {total} targets, starting {per_second} \
                 hosts/second over {} seconds",
                self.datapoint_time
            ));
        }

        // Newly referenced include files must be watched from now on.
        for include in &includes {
            watch_file(watcher, watched, include);
        }
    }
}

/// Rate at which staggered schedulers come up, for operator summaries.
pub fn hosts_per_second(total: usize, datapoint_time: u64) -> usize {
    if datapoint_time == 0 {
        return total;
    }
    (total as u64).div_ceil(datapoint_time) as usize
}

fn watch_file(watcher: &mut RecommendedWatcher, watched: &mut HashSet<PathBuf>, path: &Path) {
    if watched.contains(path) || !path.exists() {
        return;
    }
    match watcher.watch(path, RecursiveMode::NonRecursive) {
        Ok(()) => {
            debug!(file = %path.display(), "watching file");
            watched.insert(path.to_path_buf());
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "failed to watch file");
        }
    }
}
