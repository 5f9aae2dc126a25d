use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{parse_document, read_config_file, ConfigError, Settings};
use crate::registry::{is_valid_address, is_valid_name, Organization, Registry};

/// Serialized shape of a target-set file. Included files carry the same
/// shape minus `include`.
#[derive(Debug, Default, Deserialize)]
pub struct TargetsDocument {
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub organizations: BTreeMap<String, Organization>,
}

/// A validated candidate registry plus the include files it referenced,
/// which the file watcher must also observe.
#[derive(Debug)]
pub struct LoadedTargets {
    pub registry: Registry,
    pub includes: Vec<PathBuf>,
}

/// Loads and validates the target-set file and its includes. Never touches
/// live state; the reconciler decides what to do with the candidate.
#[derive(Debug, Clone)]
pub struct Loader {
    settings: Settings,
    targets_path: PathBuf,
}

impl Loader {
    pub fn new(settings: Settings, targets_path: PathBuf) -> Self {
        Self {
            settings,
            targets_path,
        }
    }

    pub fn targets_path(&self) -> &Path {
        &self.targets_path
    }

    /// Load the main target-set file, merge its includes, and validate the
    /// combined result against naming rules and the capacity ceiling.
    pub fn load(&self) -> Result<LoadedTargets, ConfigError> {
        let main = self.load_file(&self.targets_path, true)?;

        let mut registry = Registry {
            organizations: main.organizations,
        };

        let mut includes = Vec::new();
        for include in &main.include {
            let path = match self.resolve_include(include) {
                Ok(path) => path,
                Err(e) => return Err(e),
            };

            debug!(file = %path.display(), "loading included target file");
            let doc = match self.load_file(&path, false) {
                Ok(doc) => doc,
                Err(e) => {
                    // A broken include degrades to a warning; the rest of
                    // the target set still loads.
                    warn!(file = %path.display(), error = %e, "skipping included target file");
                    continue;
                }
            };

            for (org_name, org) in doc.organizations {
                registry
                    .organizations
                    .entry(org_name)
                    .or_default()
                    .hosts
                    .extend(org.hosts);
            }
            includes.push(path);
        }

        self.validate_registry(&registry)?;

        Ok(LoadedTargets { registry, includes })
    }

    /// Resolve an include path against the main target-set file's directory.
    fn resolve_include(&self, include: &str) -> Result<PathBuf, ConfigError> {
        let file = self.targets_path.display().to_string();
        if include.is_empty() {
            return Err(ConfigError::Validation {
                file: file.clone(),
                field: "include".to_string(),
                value: String::new(),
                message: "include file path cannot be empty".to_string(),
            });
        }
        if !is_valid_include_path(include) {
            return Err(ConfigError::Validation {
                file: file.clone(),
                field: "include".to_string(),
                value: include.to_string(),
                message: "invalid include file path (must be a .toml/.tml file)".to_string(),
            });
        }

        let path = Path::new(include);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            let dir = self.targets_path.parent().unwrap_or_else(|| Path::new("."));
            Ok(dir.join(path))
        }
    }

    fn load_file(&self, path: &Path, is_main: bool) -> Result<TargetsDocument, ConfigError> {
        let text = read_config_file(path)?;
        let doc = parse_document(path, &text)?;

        for key in unknown_target_keys(&doc, is_main) {
            if is_main {
                return Err(ConfigError::Validation {
                    file: path.display().to_string(),
                    field: key,
                    value: String::new(),
                    message: "unknown targets configuration field".to_string(),
                });
            }
            warn!(file = %path.display(), field = %key, "ignoring unknown field in included file");
        }

        let parsed: TargetsDocument =
            TargetsDocument::deserialize(doc).map_err(|e| ConfigError::Parse {
                file: path.display().to_string(),
                line: None,
                message: e.to_string(),
                context: String::new(),
            })?;

        self.validate_document(path, &parsed, is_main)?;
        Ok(parsed)
    }

    /// Structural validation of a single file's contents.
    fn validate_document(
        &self,
        path: &Path,
        doc: &TargetsDocument,
        is_main: bool,
    ) -> Result<(), ConfigError> {
        let file = path.display().to_string();

        if is_main && doc.organizations.is_empty() && doc.include.is_empty() {
            return Err(ConfigError::Validation {
                file: file.clone(),
                field: "organizations".to_string(),
                value: "0".to_string(),
                message: "at least one organization must be defined".to_string(),
            });
        }

        for (org_name, org) in &doc.organizations {
            validate_organization(&file, org_name, org)?;
        }

        Ok(())
    }

    /// Cross-file validation of the merged result.
    fn validate_registry(&self, registry: &Registry) -> Result<(), ConfigError> {
        let file = self.targets_path.display().to_string();

        for (org_name, org) in &registry.organizations {
            // Duplicates can only appear after merging includes, so the
            // uniqueness check runs on the combined organization.
            let mut names = HashSet::new();
            let mut ips = HashSet::new();
            for target in &org.hosts {
                if !names.insert(target.name.as_str()) {
                    return Err(ConfigError::Validation {
                        file: file.clone(),
                        field: format!("organizations.{org_name}.hosts.name"),
                        value: target.name.clone(),
                        message: "duplicate host name in organization".to_string(),
                    });
                }
                if !ips.insert(target.ip.as_str()) {
                    warn!(
                        organization = %org_name,
                        host = %target.name,
                        ip = %target.ip,
                        "duplicate address within organization",
                    );
                }
            }

            if org.hosts.len() > 1000 {
                return Err(ConfigError::Validation {
                    file: file.clone(),
                    field: format!("organizations.{org_name}.hosts"),
                    value: org.hosts.len().to_string(),
                    message: "too many hosts (max 1000 per organization)".to_string(),
                });
            }
        }

        let mut seen_names: HashMap<&str, &str> = HashMap::new();
        for (org_name, target) in registry.iter() {
            if let Some(other_org) = seen_names.insert(&target.name, org_name) {
                if other_org != org_name {
                    warn!(
                        host = %target.name,
                        first = %other_org,
                        second = %org_name,
                        "host name appears in multiple organizations",
                    );
                }
            }
        }

        let total = registry.total_targets();
        if total == 0 {
            return Err(ConfigError::Validation {
                file: file.clone(),
                field: "organizations".to_string(),
                value: "0".to_string(),
                message: "no hosts defined across all organizations".to_string(),
            });
        }
        if total > 10_000 {
            return Err(ConfigError::Validation {
                file: file.clone(),
                field: "organizations".to_string(),
                value: total.to_string(),
                message: "too many total hosts (maximum 10000)".to_string(),
            });
        }

        let ceiling = self.settings.capacity_ceiling();
        if total > ceiling {
            return Err(ConfigError::Capacity {
                count: total,
                ceiling,
                max_concurrent_pings: self.settings.max_concurrent_pings,
                datapoint_time: self.settings.datapoint_time,
            });
        }
        if total * 5 >= ceiling * 4 {
            warn!(
                targets = total,
                ceiling,
                "target count is approaching the configured probe capacity",
            );
        }

        Ok(())
    }
}

fn validate_organization(
    file: &str,
    org_name: &str,
    org: &Organization,
) -> Result<(), ConfigError> {
    if !is_valid_name(org_name) {
        return Err(ConfigError::Validation {
            file: file.to_string(),
            field: "organizations".to_string(),
            value: org_name.to_string(),
            message: "organization name must be 1-100 characters of [A-Za-z0-9_.- ]".to_string(),
        });
    }

    if org.hosts.is_empty() {
        warn!(organization = %org_name, "organization has no hosts defined");
    }

    for (i, target) in org.hosts.iter().enumerate() {
        let field = |suffix: &str| format!("organizations.{org_name}.hosts[{i}].{suffix}");
        let err = |field: String, value: String, message: &str| ConfigError::Validation {
            file: file.to_string(),
            field,
            value,
            message: message.to_string(),
        };

        if !is_valid_name(&target.name) {
            return Err(err(
                field("name"),
                target.name.clone(),
                "host name must be 1-100 characters of [A-Za-z0-9_.- ]",
            ));
        }
        if !is_valid_address(&target.ip) {
            return Err(err(
                field("ip"),
                target.ip.clone(),
                "invalid IP address or hostname",
            ));
        }
        if target.alarm_rtt_ms > 10_000 {
            return Err(err(
                field("alarmping"),
                target.alarm_rtt_ms.to_string(),
                "must be between 0 and 10000 ms",
            ));
        }
        if target.alarm_loss_pct > 100 {
            return Err(err(
                field("alarmloss"),
                target.alarm_loss_pct.to_string(),
                "must be between 0 and 100 percent",
            ));
        }
        if target.alarm_jitter_ms > 10_000 {
            return Err(err(
                field("alarmjitter"),
                target.alarm_jitter_ms.to_string(),
                "must be between 0 and 10000 ms",
            ));
        }
        if target.alarm_receiver.len() > 500 {
            return Err(err(
                field("alarmreceiver"),
                target.alarm_receiver.clone(),
                "alarm receiver too long (max 500 characters)",
            ));
        }
        if !crate::config::is_valid_source(&target.ping_source) {
            return Err(err(
                field("pingsource"),
                target.ping_source.clone(),
                "must be 'default' or a valid IP address",
            ));
        }
    }

    Ok(())
}

/// Include paths must be plain TOML files with no control characters.
fn is_valid_include_path(path: &str) -> bool {
    if path.contains(['\0', '\n', '\r']) {
        return false;
    }
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e == "toml" || e == "tml")
        .unwrap_or(false)
}

/// Keys of a target-set document that the schema does not define, as dotted
/// paths. `include` is only defined in the main file.
fn unknown_target_keys(doc: &toml::Value, is_main: bool) -> Vec<String> {
    const HOST_KEYS: &[&str] = &[
        "name",
        "ip",
        "alarmping",
        "alarmloss",
        "alarmjitter",
        "alarmreceiver",
        "pingsource",
    ];

    let mut unknown = Vec::new();
    let Some(table) = doc.as_table() else {
        return unknown;
    };

    for (key, value) in table {
        match key.as_str() {
            "include" if is_main => {}
            "organizations" => {
                let Some(orgs) = value.as_table() else {
                    continue;
                };
                for (org_name, org) in orgs {
                    let Some(org_table) = org.as_table() else {
                        continue;
                    };
                    for (org_key, hosts) in org_table {
                        if org_key != "hosts" {
                            unknown.push(format!("organizations.{org_name}.{org_key}"));
                            continue;
                        }
                        let Some(hosts) = hosts.as_array() else {
                            continue;
                        };
                        for (i, host) in hosts.iter().enumerate() {
                            let Some(host_table) = host.as_table() else {
                                continue;
                            };
                            for host_key in host_table.keys() {
                                if !HOST_KEYS.contains(&host_key.as_str()) {
                                    unknown.push(format!(
                                        "organizations.{org_name}.hosts[{i}].{host_key}"
                                    ));
                                }
                            }
                        }
                    }
                }
            }
            other => unknown.push(other.to_string()),
        }
    }

    unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn settings() -> Settings {
        Settings {
            influx_url: "http://localhost:8086".to_string(),
            influx_token: "t".to_string(),
            influx_org: "o".to_string(),
            influx_bucket: "b".to_string(),
            ..Settings::default()
        }
    }

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).expect("write targets file");
        path
    }

    #[test]
    fn test_load_simple_targets() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(
            &dir,
            "targets.toml",
            r#"
[organizations.backbone]
hosts = [
    { name = "core-1", ip = "192.0.2.1", alarmping = 200 },
    { name = "core-2", ip = "192.0.2.2" },
]
"#,
        );

        let loaded = Loader::new(settings(), path).load().expect("load");
        assert_eq!(loaded.registry.total_targets(), 2);
        assert!(loaded.includes.is_empty());

        let t = loaded.registry.get("backbone", "core-1").expect("target");
        assert_eq!(t.alarm_rtt_ms, 200);
        assert_eq!(t.alarm_loss_pct, 0);
    }

    #[test]
    fn test_include_merges_and_concatenates() {
        let dir = TempDir::new().expect("tempdir");
        write(
            &dir,
            "extra.toml",
            r#"
[organizations.backbone]
hosts = [ { name = "core-3", ip = "192.0.2.3" } ]

[organizations.edge]
hosts = [ { name = "edge-1", ip = "198.51.100.1" } ]
"#,
        );
        let path = write(
            &dir,
            "targets.toml",
            r#"
include = ["extra.toml"]

[organizations.backbone]
hosts = [ { name = "core-1", ip = "192.0.2.1" } ]
"#,
        );

        let loaded = Loader::new(settings(), path).load().expect("load");
        assert_eq!(loaded.registry.total_targets(), 3);
        assert_eq!(loaded.includes.len(), 1);

        // Main-file hosts come first, include hosts append after.
        let backbone = &loaded.registry.organizations["backbone"];
        assert_eq!(backbone.hosts[0].name, "core-1");
        assert_eq!(backbone.hosts[1].name, "core-3");
        assert!(loaded.registry.get("edge", "edge-1").is_some());
    }

    #[test]
    fn test_broken_include_is_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(
            &dir,
            "targets.toml",
            r#"
include = ["missing.toml"]

[organizations.net]
hosts = [ { name = "a", ip = "192.0.2.1" } ]
"#,
        );

        let loaded = Loader::new(settings(), path).load().expect("load");
        assert_eq!(loaded.registry.total_targets(), 1);
        assert!(loaded.includes.is_empty());
    }

    #[test]
    fn test_unknown_key_fatal_in_main() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(
            &dir,
            "targets.toml",
            r#"
surprise = true

[organizations.net]
hosts = [ { name = "a", ip = "192.0.2.1" } ]
"#,
        );

        let err = Loader::new(settings(), path).load().unwrap_err();
        assert!(err.to_string().contains("surprise"));
    }

    #[test]
    fn test_unknown_host_key_fatal_in_main() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(
            &dir,
            "targets.toml",
            r#"
[organizations.net]
hosts = [ { name = "a", ip = "192.0.2.1", wibble = 1 } ]
"#,
        );

        let err = Loader::new(settings(), path).load().unwrap_err();
        assert!(err.to_string().contains("wibble"));
    }

    #[test]
    fn test_unknown_key_tolerated_in_include() {
        let dir = TempDir::new().expect("tempdir");
        write(
            &dir,
            "extra.toml",
            r#"
surprise = true

[organizations.net]
hosts = [ { name = "b", ip = "192.0.2.2" } ]
"#,
        );
        let path = write(
            &dir,
            "targets.toml",
            r#"
include = ["extra.toml"]

[organizations.net]
hosts = [ { name = "a", ip = "192.0.2.1" } ]
"#,
        );

        let loaded = Loader::new(settings(), path).load().expect("load");
        assert_eq!(loaded.registry.total_targets(), 2);
    }

    #[test]
    fn test_duplicate_name_in_organization_fails() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(
            &dir,
            "targets.toml",
            r#"
[organizations.net]
hosts = [
    { name = "a", ip = "192.0.2.1" },
    { name = "a", ip = "192.0.2.2" },
]
"#,
        );

        let err = Loader::new(settings(), path).load().unwrap_err();
        assert!(err.to_string().contains("duplicate host name"));
    }

    #[test]
    fn test_capacity_rejection_names_count_and_ceiling() {
        let dir = TempDir::new().expect("tempdir");
        let mut doc = String::from("[organizations.big]\nhosts = [\n");
        for i in 0..700 {
            doc.push_str(&format!("    {{ name = \"h{i}\", ip = \"192.0.2.1\" }},\n"));
        }
        doc.push_str("]\n");
        let path = write(&dir, "targets.toml", &doc);

        let mut s = settings();
        s.max_concurrent_pings = 10;
        s.datapoint_time = 60;

        let err = Loader::new(s, path).load().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("700"), "missing count: {msg}");
        assert!(msg.contains("600"), "missing ceiling: {msg}");
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(
            &dir,
            "targets.toml",
            r#"
[organizations.net]
hosts = [ { name = "a", ip = "192.0.2.1", alarmloss = 101 } ]
"#,
        );

        let err = Loader::new(settings(), path).load().unwrap_err();
        assert!(err.to_string().contains("alarmloss"));
    }

    #[test]
    fn test_invalid_include_extension_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(
            &dir,
            "targets.toml",
            r#"
include = ["extra.conf"]

[organizations.net]
hosts = [ { name = "a", ip = "192.0.2.1" } ]
"#,
        );

        let err = Loader::new(settings(), path).load().unwrap_err();
        assert!(err.to_string().contains("include"));
    }

    #[test]
    fn test_round_trip_preserves_registry() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(
            &dir,
            "targets.toml",
            r#"
[organizations.backbone]
hosts = [
    { name = "core-1", ip = "192.0.2.1", alarmping = 200, alarmloss = 5, pingsource = "10.0.0.9" },
    { name = "core-2", ip = "svc.example.test", alarmreceiver = "none" },
]

[organizations.edge]
hosts = [ { name = "edge-1", ip = "198.51.100.1", alarmjitter = 30 } ]
"#,
        );

        let first = Loader::new(settings(), path).load().expect("load").registry;

        let serialized = toml::to_string(&first).expect("serialize registry");
        let reparsed = write(&dir, "roundtrip.toml", &serialized);
        let second = Loader::new(settings(), reparsed)
            .load()
            .expect("reload")
            .registry;

        assert_eq!(first, second);
    }
}
