use parking_lot::Mutex;
use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::warn;

/// Operator-visible events on the host system log: startup summary, DNS
/// changes, reload summaries, and alarms.
///
/// A failed syslog connection degrades to process logging only; the daemon
/// keeps running. `--nolog` suppresses alarm events but keeps lifecycle
/// events.
pub struct EventLog {
    writer: Option<Mutex<Logger<LoggerBackend, Formatter3164>>>,
    alarms_enabled: bool,
}

impl EventLog {
    /// Connect to the local syslog daemon facility.
    pub fn new(alarms_enabled: bool) -> Self {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: "smogping".to_string(),
            pid: std::process::id(),
        };

        let writer = match syslog::unix(formatter) {
            Ok(logger) => Some(Mutex::new(logger)),
            Err(e) => {
                warn!(error = %e, "failed to initialize syslog, continuing without it");
                None
            }
        };

        Self {
            writer,
            alarms_enabled,
        }
    }

    /// An EventLog that never touches the host syslog; used by tests.
    pub fn disabled() -> Self {
        Self {
            writer: None,
            alarms_enabled: false,
        }
    }

    pub fn info(&self, message: &str) {
        if let Some(writer) = &self.writer {
            if let Err(e) = writer.lock().info(message) {
                warn!(error = %e, "syslog write failed");
            }
        }
    }

    pub fn warning(&self, message: &str) {
        if let Some(writer) = &self.writer {
            if let Err(e) = writer.lock().warning(message) {
                warn!(error = %e, "syslog write failed");
            }
        }
    }

    /// Alarm events honor the `--nolog` suppression toggle.
    pub fn alarm(&self, message: &str) {
        if self.alarms_enabled {
            self.warning(message);
        }
    }
}
