use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One probe destination inside an organization.
///
/// The serialized shape matches a `hosts` entry of the target-set file;
/// resolution state is runtime-only and never written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,

    /// Address input: a literal IP or a DNS hostname.
    pub ip: String,

    /// RTT alarm threshold in milliseconds; 0 disables the channel.
    #[serde(rename = "alarmping", default)]
    pub alarm_rtt_ms: u32,

    /// Loss alarm threshold in percent; 0 disables the channel.
    #[serde(rename = "alarmloss", default)]
    pub alarm_loss_pct: u32,

    /// Jitter alarm threshold in milliseconds; 0 disables the channel.
    #[serde(rename = "alarmjitter", default)]
    pub alarm_jitter_ms: u32,

    /// Handler override: path, empty (use global), or "none" (suppress).
    #[serde(rename = "alarmreceiver", default)]
    pub alarm_receiver: String,

    /// Source-address override: "default", empty, or a literal IP.
    #[serde(rename = "pingsource", default)]
    pub ping_source: String,

    /// Address actually probed; differs from `ip` only for DNS targets.
    #[serde(skip)]
    pub resolved: Option<IpAddr>,

    /// When the hostname was last resolved; None for literal targets.
    #[serde(skip)]
    pub last_dns_check: Option<DateTime<Utc>>,

    /// True when `ip` is a hostname rather than a literal address.
    #[serde(skip)]
    pub is_dns_name: bool,
}

impl Target {
    pub fn new(name: &str, ip: &str) -> Self {
        Self {
            name: name.to_string(),
            ip: ip.to_string(),
            alarm_rtt_ms: 0,
            alarm_loss_pct: 0,
            alarm_jitter_ms: 0,
            alarm_receiver: String::new(),
            ping_source: String::new(),
            resolved: None,
            last_dns_check: None,
            is_dns_name: false,
        }
    }

    /// The address to probe: the resolved address, or the literal input.
    pub fn probe_addr(&self) -> Option<IpAddr> {
        self.resolved.or_else(|| self.ip.parse().ok())
    }
}

/// A named group of targets, ordered as they appeared in the files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default)]
    pub hosts: Vec<Target>,
}

/// Identity of a target for diffing: threshold or source edits on the same
/// key leave a running worker untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub organization: String,
    pub name: String,
    pub ip: String,
}

impl TargetKey {
    pub fn new(organization: &str, target: &Target) -> Self {
        Self {
            organization: organization.to_string(),
            name: target.name.clone(),
            ip: target.ip.clone(),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.organization, self.name, self.ip)
    }
}

/// Result of comparing two registries.
#[derive(Debug, Default)]
pub struct TargetDiff {
    pub added: Vec<TargetKey>,
    pub removed: Vec<TargetKey>,
    pub unchanged: Vec<TargetKey>,
}

impl TargetDiff {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Authoritative in-memory target set, grouped by organization.
///
/// `BTreeMap` keeps iteration order stable across reloads so diffing,
/// logging, and round-trip serialization are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub organizations: BTreeMap<String, Organization>,
}

impl Registry {
    pub fn total_targets(&self) -> usize {
        self.organizations.values().map(|o| o.hosts.len()).sum()
    }

    /// Iterate `(organization, target)` pairs in stable order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Target)> {
        self.organizations
            .iter()
            .flat_map(|(org, o)| o.hosts.iter().map(move |t| (org.as_str(), t)))
    }

    pub fn get(&self, organization: &str, name: &str) -> Option<&Target> {
        self.organizations
            .get(organization)?
            .hosts
            .iter()
            .find(|t| t.name == name)
    }

    pub fn get_mut(&mut self, organization: &str, name: &str) -> Option<&mut Target> {
        self.organizations
            .get_mut(organization)?
            .hosts
            .iter_mut()
            .find(|t| t.name == name)
    }

    /// Compare against a candidate registry, keyed by
    /// `(organization, name, ip)`.
    pub fn diff(&self, new: &Registry) -> TargetDiff {
        let old_keys: std::collections::HashSet<TargetKey> =
            self.iter().map(|(org, t)| TargetKey::new(org, t)).collect();
        let new_keys: std::collections::HashSet<TargetKey> =
            new.iter().map(|(org, t)| TargetKey::new(org, t)).collect();

        let mut diff = TargetDiff::default();
        for (org, t) in new.iter() {
            let key = TargetKey::new(org, t);
            if old_keys.contains(&key) {
                diff.unchanged.push(key);
            } else {
                diff.added.push(key);
            }
        }
        for (org, t) in self.iter() {
            let key = TargetKey::new(org, t);
            if !new_keys.contains(&key) {
                diff.removed.push(key);
            }
        }
        diff
    }
}

/// Allowed characters for target and organization names.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ' '))
}

/// A literal IP address or an RFC-1123 hostname.
pub fn is_valid_address(address: &str) -> bool {
    if address.is_empty() || address.len() > 253 {
        return false;
    }
    if address.parse::<IpAddr>().is_ok() {
        return true;
    }
    address.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}
