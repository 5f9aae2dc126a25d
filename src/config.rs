use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Upper bound on any configuration file we will read.
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Typed configuration failure carrying enough context to point the
/// operator at the offending file and field.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid configuration in {file}: {field} = {value} - {message}")]
    Validation {
        file: String,
        field: String,
        value: String,
        message: String,
    },

    /// The TOML document could not be parsed.
    #[error("parse error in {file}{}: {message}\n{context}", position_suffix(.line))]
    Parse {
        file: String,
        line: Option<usize>,
        message: String,
        context: String,
    },

    /// The file itself is unusable (missing, unreadable, wrong type, too big).
    #[error("unusable file {file}: {message}")]
    File { file: String, message: String },

    /// The target set exceeds what the configured probe budget can sustain.
    #[error(
        "target count ({count}) exceeds theoretical maximum ({ceiling}): with \
         max_concurrent_pings={max_concurrent_pings} and datapoint_time={datapoint_time}s \
         at most {ceiling} targets can be monitored; increase max_concurrent_pings \
         or datapoint_time"
    )]
    Capacity {
        count: usize,
        ceiling: usize,
        max_concurrent_pings: u32,
        datapoint_time: u64,
    },
}

fn position_suffix(line: &Option<usize>) -> String {
    match line {
        Some(l) => format!(" at line {l}"),
        None => String::new(),
    }
}

/// Main settings file. Unknown keys here are fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// InfluxDB endpoint, e.g. "http://localhost:8086".
    #[serde(default)]
    pub influx_url: String,

    /// InfluxDB API token.
    #[serde(default)]
    pub influx_token: String,

    /// InfluxDB organization.
    #[serde(default)]
    pub influx_org: String,

    /// InfluxDB bucket receiving the `ping` measurement.
    #[serde(default)]
    pub influx_bucket: String,

    /// Points accumulated before a size-triggered flush. Default: 100.
    #[serde(default = "default_batch_size")]
    pub influx_batch_size: usize,

    /// Seconds between time-triggered flushes. Default: 10.
    #[serde(default = "default_batch_time")]
    pub influx_batch_time: u64,

    /// Probes per observation window. Default: 5.
    #[serde(default = "default_datapoint_pings")]
    pub datapoint_pings: u32,

    /// Observation window length in seconds. Default: 60.
    #[serde(default = "default_datapoint_time")]
    pub datapoint_time: u64,

    /// Per-probe reply deadline in seconds. Default: 2.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,

    /// Global source address: "default" lets the OS pick.
    #[serde(default = "default_ping_source")]
    pub ping_source: String,

    /// Seconds between DNS re-resolutions; 0 disables. Default: 600.
    #[serde(default = "default_dns_refresh")]
    pub dns_refresh: u64,

    /// Minimum seconds between alarm firings per target. Default: 300.
    #[serde(default = "default_alarm_rate")]
    pub alarm_rate: u64,

    /// Global alarm handler script; targets without their own receiver
    /// skip alarms entirely when this is empty.
    #[serde(default)]
    pub alarm_receiver: String,

    /// Probe concurrency budget used for capacity checking. Default: 50.
    #[serde(default = "default_max_concurrent_pings")]
    pub max_concurrent_pings: u32,
}

// --- Default value functions ---

fn default_batch_size() -> usize {
    100
}

fn default_batch_time() -> u64 {
    10
}

fn default_datapoint_pings() -> u32 {
    5
}

fn default_datapoint_time() -> u64 {
    60
}

fn default_ping_timeout() -> u64 {
    2
}

fn default_ping_source() -> String {
    "default".to_string()
}

fn default_dns_refresh() -> u64 {
    600
}

fn default_alarm_rate() -> u64 {
    300
}

fn default_max_concurrent_pings() -> u32 {
    50
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            influx_url: String::new(),
            influx_token: String::new(),
            influx_org: String::new(),
            influx_bucket: String::new(),
            influx_batch_size: default_batch_size(),
            influx_batch_time: default_batch_time(),
            datapoint_pings: default_datapoint_pings(),
            datapoint_time: default_datapoint_time(),
            ping_timeout: default_ping_timeout(),
            ping_source: default_ping_source(),
            dns_refresh: default_dns_refresh(),
            alarm_rate: default_alarm_rate(),
            alarm_receiver: String::new(),
            max_concurrent_pings: default_max_concurrent_pings(),
        }
    }
}

/// Keys the main settings file may contain.
const SETTINGS_KEYS: &[&str] = &[
    "influx_url",
    "influx_token",
    "influx_org",
    "influx_bucket",
    "influx_batch_size",
    "influx_batch_time",
    "datapoint_pings",
    "datapoint_time",
    "ping_timeout",
    "ping_source",
    "dns_refresh",
    "alarm_rate",
    "alarm_receiver",
    "max_concurrent_pings",
];

// --- Loading and validation ---

impl Settings {
    /// Load and validate the main settings file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read_config_file(path)?;
        let doc = parse_document(path, &text)?;

        let unknown = unknown_keys(&doc, SETTINGS_KEYS);
        if let Some(key) = unknown.first() {
            return Err(ConfigError::Validation {
                file: path.display().to_string(),
                field: key.clone(),
                value: String::new(),
                message: "unknown configuration field".to_string(),
            });
        }

        let settings: Settings = Settings::deserialize(doc).map_err(|e| ConfigError::Parse {
            file: path.display().to_string(),
            line: None,
            message: e.to_string(),
            context: String::new(),
        })?;

        settings.validate(&path.display().to_string())?;
        Ok(settings.with_defaults())
    }

    /// Validate field values against their allowed ranges.
    pub fn validate(&self, file: &str) -> Result<(), ConfigError> {
        let err = |field: &str, value: String, message: &str| ConfigError::Validation {
            file: file.to_string(),
            field: field.to_string(),
            value,
            message: message.to_string(),
        };

        if self.influx_url.is_empty() {
            return Err(err("influx_url", String::new(), "cannot be empty"));
        }
        if !is_valid_url(&self.influx_url) {
            return Err(err(
                "influx_url",
                self.influx_url.clone(),
                "must start with http:// or https://",
            ));
        }
        if self.influx_token.is_empty() {
            return Err(err("influx_token", String::new(), "cannot be empty"));
        }
        if self.influx_org.is_empty() {
            return Err(err("influx_org", String::new(), "cannot be empty"));
        }
        if self.influx_bucket.is_empty() {
            return Err(err("influx_bucket", String::new(), "cannot be empty"));
        }

        if self.influx_batch_size > 10_000 {
            return Err(err(
                "influx_batch_size",
                self.influx_batch_size.to_string(),
                "must be between 0 and 10000",
            ));
        }
        if self.influx_batch_time > 3600 {
            return Err(err(
                "influx_batch_time",
                self.influx_batch_time.to_string(),
                "must be between 0 and 3600 seconds",
            ));
        }
        if self.datapoint_pings < 1 || self.datapoint_pings > 100 {
            return Err(err(
                "datapoint_pings",
                self.datapoint_pings.to_string(),
                "must be between 1 and 100",
            ));
        }
        if self.datapoint_time < 1 || self.datapoint_time > 86_400 {
            return Err(err(
                "datapoint_time",
                self.datapoint_time.to_string(),
                "must be between 1 and 86400 seconds",
            ));
        }
        if self.ping_timeout < 1 || self.ping_timeout > 60 {
            return Err(err(
                "ping_timeout",
                self.ping_timeout.to_string(),
                "must be between 1 and 60 seconds",
            ));
        }
        if self.dns_refresh > 86_400 {
            return Err(err(
                "dns_refresh",
                self.dns_refresh.to_string(),
                "must be between 0 and 86400 seconds",
            ));
        }
        if self.alarm_rate > 3600 {
            return Err(err(
                "alarm_rate",
                self.alarm_rate.to_string(),
                "must be between 0 and 3600 seconds",
            ));
        }
        if self.max_concurrent_pings < 1 || self.max_concurrent_pings > 1000 {
            return Err(err(
                "max_concurrent_pings",
                self.max_concurrent_pings.to_string(),
                "must be between 1 and 1000",
            ));
        }

        if !is_valid_source(&self.ping_source) {
            return Err(err(
                "ping_source",
                self.ping_source.clone(),
                "must be 'default' or a valid IP address",
            ));
        }

        if self.ping_timeout >= self.datapoint_time {
            warn!(
                ping_timeout = self.ping_timeout,
                datapoint_time = self.datapoint_time,
                "ping_timeout should be less than datapoint_time",
            );
        }

        let interval = self.datapoint_time as f64 / f64::from(self.datapoint_pings);
        if interval < 1.0 {
            warn!(
                interval_secs = interval,
                "ping interval is very short; consider fewer datapoint_pings or a longer datapoint_time",
            );
        }
        if self.ping_timeout as f64 > interval {
            warn!(
                ping_timeout = self.ping_timeout,
                interval_secs = interval,
                "ping_timeout exceeds the ping interval; probe operations may overlap",
            );
        }

        Ok(())
    }

    /// Replace disabled batching values with workable defaults.
    fn with_defaults(mut self) -> Self {
        if self.influx_batch_size == 0 {
            self.influx_batch_size = default_batch_size();
        }
        if self.influx_batch_time == 0 {
            self.influx_batch_time = default_batch_time();
        }
        self
    }

    /// Time between individual probes, truncated to whole nanoseconds.
    pub fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(
            self.datapoint_time * 1_000_000_000 / u64::from(self.datapoint_pings),
        )
    }

    /// Most targets the configured probe budget can sustain.
    pub fn capacity_ceiling(&self) -> usize {
        self.max_concurrent_pings as usize * self.datapoint_time as usize
    }
}

/// "default", empty, or a parseable IP address.
pub fn is_valid_source(source: &str) -> bool {
    source.is_empty() || source == "default" || source.parse::<IpAddr>().is_ok()
}

fn is_valid_url(url: &str) -> bool {
    (url.starts_with("http://") || url.starts_with("https://")) && url.len() >= 10
}

// --- Shared file-level helpers (also used by the target-set loader) ---

/// Guard and read a configuration file: regular, non-empty, at most 1 MiB.
pub fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    let file_err = |message: String| ConfigError::File {
        file: path.display().to_string(),
        message,
    };

    let meta = std::fs::metadata(path).map_err(|e| file_err(e.to_string()))?;
    if !meta.is_file() {
        return Err(file_err("not a regular file".to_string()));
    }
    if meta.len() == 0 {
        return Err(file_err("file is empty".to_string()));
    }
    if meta.len() > MAX_CONFIG_FILE_SIZE {
        return Err(file_err(format!(
            "file too large ({} bytes), maximum {} bytes",
            meta.len(),
            MAX_CONFIG_FILE_SIZE
        )));
    }

    std::fs::read_to_string(path).map_err(|e| file_err(format!("cannot read file: {e}")))
}

/// Parse TOML, enriching syntax errors with a context window around the
/// reported line.
pub fn parse_document(path: &Path, text: &str) -> Result<toml::Value, ConfigError> {
    text.parse::<toml::Value>().map_err(|e| {
        let line = e.span().map(|span| line_of_offset(text, span.start));
        ConfigError::Parse {
            file: path.display().to_string(),
            line,
            message: e.message().to_string(),
            context: line.map(|l| context_window(text, l)).unwrap_or_default(),
        }
    })
}

/// Top-level keys of `doc` that are not in `known`.
pub fn unknown_keys(doc: &toml::Value, known: &[&str]) -> Vec<String> {
    match doc.as_table() {
        Some(table) => table
            .keys()
            .filter(|k| !known.contains(&k.as_str()))
            .cloned()
            .collect(),
        None => Vec::new(),
    }
}

/// 1-based line number containing the given byte offset.
fn line_of_offset(text: &str, offset: usize) -> usize {
    text.as_bytes()
        .iter()
        .take(offset)
        .filter(|&&b| b == b'\n')
        .count()
        + 1
}

/// Five lines of the document centered on `line` (1-based), the offending
/// line marked.
pub fn context_window(text: &str, line: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if line == 0 || line > lines.len() {
        return String::new();
    }

    let start = line.saturating_sub(3);
    let end = (line + 2).min(lines.len());

    let mut out = String::new();
    for (i, content) in lines.iter().enumerate().take(end).skip(start) {
        let n = i + 1;
        let marker = if n == line { "> " } else { "  " };
        out.push_str(&format!("{marker}{n}: {content}\n"));
    }
    out
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "influx={} bucket={} pings={}/{}s timeout={}s dns_refresh={}s",
            self.influx_url,
            self.influx_bucket,
            self.datapoint_pings,
            self.datapoint_time,
            self.ping_timeout,
            self.dns_refresh,
        )
    }
}
