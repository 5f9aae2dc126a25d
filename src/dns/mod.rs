use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::Registry;
use crate::syslog::EventLog;

/// Deadline for a single hostname lookup.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// One cached hostname resolution.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub resolved: IpAddr,
    pub last_checked: DateTime<Utc>,
    pub changes: u32,
}

/// Counts reported by the startup pre-flight pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreflightSummary {
    pub dns_resolved: usize,
    pub literal: usize,
    pub removed: usize,
}

/// Resolves hostname targets and owns the hostname cache.
#[derive(Default)]
pub struct DnsResolver {
    cache: Mutex<HashMap<String, CacheEntry>>,
}

/// A hostname is anything that does not parse as an address but contains a
/// dot and at least one ASCII letter.
pub fn is_dns_name(address: &str) -> bool {
    address.parse::<IpAddr>().is_err()
        && address.contains('.')
        && address.chars().any(|c| c.is_ascii_alphabetic())
}

/// Pick the first IPv4 address if any, else the first address.
pub fn select_address<I: IntoIterator<Item = IpAddr>>(addrs: I) -> Option<IpAddr> {
    let mut first = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        first.get_or_insert(addr);
    }
    first
}

impl DnsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a hostname with the lookup deadline, preferring IPv4.
    pub async fn resolve(&self, hostname: &str) -> Result<IpAddr> {
        let lookup = tokio::net::lookup_host(format!("{hostname}:0"));
        let addrs = tokio::time::timeout(RESOLVE_TIMEOUT, lookup)
            .await
            .with_context(|| format!("DNS lookup for {hostname} timed out"))?
            .with_context(|| format!("DNS lookup for {hostname} failed"))?;

        match select_address(addrs.map(|sa| sa.ip())) {
            Some(addr) => Ok(addr),
            None => bail!("no addresses returned for {hostname}"),
        }
    }

    /// Record a resolution in the cache, bumping the change counter when the
    /// address moved.
    fn record(&self, hostname: &str, resolved: IpAddr) -> u32 {
        let mut cache = self.cache.lock();
        match cache.get_mut(hostname) {
            Some(entry) => {
                if entry.resolved != resolved {
                    entry.changes += 1;
                }
                entry.resolved = resolved;
                entry.last_checked = Utc::now();
                entry.changes
            }
            None => {
                cache.insert(
                    hostname.to_string(),
                    CacheEntry {
                        resolved,
                        last_checked: Utc::now(),
                        changes: 0,
                    },
                );
                0
            }
        }
    }

    pub fn cached(&self, hostname: &str) -> Option<CacheEntry> {
        self.cache.lock().get(hostname).cloned()
    }

    /// Resolve every unresolved target in a candidate registry. Hostname
    /// targets that fail to resolve are dropped with a warning; literal
    /// targets are marked resolved as-is.
    pub async fn preflight(&self, registry: &mut Registry) -> PreflightSummary {
        let mut summary = PreflightSummary::default();

        for (org_name, org) in registry.organizations.iter_mut() {
            let mut kept = Vec::with_capacity(org.hosts.len());

            for mut target in org.hosts.drain(..) {
                if target.resolved.is_some() {
                    // Carried over from the previous registry on reload.
                    if target.is_dns_name {
                        summary.dns_resolved += 1;
                    } else {
                        summary.literal += 1;
                    }
                    kept.push(target);
                    continue;
                }

                if is_dns_name(&target.ip) {
                    target.is_dns_name = true;
                    match self.resolve(&target.ip).await {
                        Ok(addr) => {
                            debug!(
                                host = %target.name,
                                hostname = %target.ip,
                                resolved = %addr,
                                organization = %org_name,
                                "resolved hostname target",
                            );
                            self.record(&target.ip, addr);
                            target.resolved = Some(addr);
                            target.last_dns_check = Some(Utc::now());
                            summary.dns_resolved += 1;
                            kept.push(target);
                        }
                        Err(e) => {
                            warn!(
                                host = %target.name,
                                hostname = %target.ip,
                                organization = %org_name,
                                error = %e,
                                "dropping target: hostname did not resolve",
                            );
                            summary.removed += 1;
                        }
                    }
                } else {
                    match target.ip.parse::<IpAddr>() {
                        Ok(addr) => {
                            target.resolved = Some(addr);
                            summary.literal += 1;
                            kept.push(target);
                        }
                        Err(_) => {
                            // Validation admits bare single-label names that
                            // are neither addresses nor dotted hostnames.
                            warn!(
                                host = %target.name,
                                address = %target.ip,
                                organization = %org_name,
                                "dropping target: address is neither an IP nor a resolvable hostname",
                            );
                            summary.removed += 1;
                        }
                    }
                }
            }

            org.hosts = kept;
        }

        summary
    }

    /// Re-resolve every hostname target once, applying changes to the shared
    /// registry under its write lock.
    pub async fn refresh(&self, registry: &Arc<RwLock<Registry>>, events: &EventLog) {
        let hostnames: Vec<(String, String, String, IpAddr)> = {
            let reg = registry.read();
            reg.iter()
                .filter(|(_, t)| t.is_dns_name)
                .filter_map(|(org, t)| {
                    t.resolved
                        .map(|addr| (org.to_string(), t.name.clone(), t.ip.clone(), addr))
                })
                .collect()
        };

        let mut checked = 0usize;
        let mut changed = 0usize;
        let mut errors = 0usize;

        for (org, name, hostname, old_addr) in hostnames {
            checked += 1;
            let new_addr = match self.resolve(&hostname).await {
                Ok(addr) => addr,
                Err(e) => {
                    debug!(host = %name, hostname = %hostname, error = %e, "DNS refresh failed, keeping previous address");
                    errors += 1;
                    continue;
                }
            };

            let now = Utc::now();
            {
                let mut reg = registry.write();
                if let Some(target) = reg.get_mut(&org, &name) {
                    target.resolved = Some(new_addr);
                    target.last_dns_check = Some(now);
                }
            }

            if new_addr != old_addr {
                changed += 1;
                self.record(&hostname, new_addr);
                info!(
                    host = %name,
                    hostname = %hostname,
                    organization = %org,
                    old = %old_addr,
                    new = %new_addr,
                    "DNS CHANGE",
                );
                events.warning(&format!(
                    "DNS CHANGE: {name} ({hostname}) in {org} changed from {old_addr} to {new_addr}"
                ));
            } else {
                self.record(&hostname, new_addr);
            }
        }

        if changed > 0 {
            info!(checked, changed, errors, "DNS refresh completed");
            events.info(&format!(
                "DNS refresh completed: {checked} names checked, {changed} changed, {errors} errors"
            ));
        } else {
            debug!(checked, errors, "DNS refresh completed, no changes");
        }
    }
}

/// Spawn the periodic refresh task. A zero interval disables refresh.
pub fn spawn_refresh(
    resolver: Arc<DnsResolver>,
    registry: Arc<RwLock<Registry>>,
    events: Arc<EventLog>,
    interval_secs: u64,
    cancel: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        debug!("DNS refresh disabled (dns_refresh = 0)");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the pre-flight
        // results stand until a full interval has passed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    resolver.refresh(&registry, &events).await;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Target;

    #[test]
    fn test_is_dns_name() {
        assert!(is_dns_name("svc.example.test"));
        assert!(is_dns_name("a.b"));
        assert!(!is_dns_name("192.0.2.1"));
        assert!(!is_dns_name("2001:db8::1"));
        assert!(!is_dns_name("10.20.30.40"));
        assert!(!is_dns_name("localhost"));
        assert!(!is_dns_name("1.2.3.4.5"));
    }

    #[test]
    fn test_select_address_prefers_first_ipv4() {
        let addrs: Vec<IpAddr> = vec![
            "2001:db8::1".parse().expect("ip"),
            "192.0.2.7".parse().expect("ip"),
            "192.0.2.8".parse().expect("ip"),
        ];
        assert_eq!(
            select_address(addrs),
            Some("192.0.2.7".parse().expect("ip"))
        );
    }

    #[test]
    fn test_select_address_falls_back_to_first() {
        let addrs: Vec<IpAddr> = vec![
            "2001:db8::1".parse().expect("ip"),
            "2001:db8::2".parse().expect("ip"),
        ];
        assert_eq!(
            select_address(addrs),
            Some("2001:db8::1".parse().expect("ip"))
        );
        assert_eq!(select_address(Vec::<IpAddr>::new()), None);
    }

    #[test]
    fn test_record_counts_changes() {
        let resolver = DnsResolver::new();
        let a1: IpAddr = "10.0.0.1".parse().expect("ip");
        let a2: IpAddr = "10.0.0.2".parse().expect("ip");

        assert_eq!(resolver.record("svc.example.test", a1), 0);
        assert_eq!(resolver.record("svc.example.test", a1), 0);
        assert_eq!(resolver.record("svc.example.test", a2), 1);
        assert_eq!(resolver.record("svc.example.test", a2), 1);

        let entry = resolver.cached("svc.example.test").expect("entry");
        assert_eq!(entry.resolved, a2);
        assert_eq!(entry.changes, 1);
    }

    #[tokio::test]
    async fn test_preflight_marks_literal_targets() {
        let mut registry = Registry::default();
        registry
            .organizations
            .entry("net".to_string())
            .or_default()
            .hosts
            .push(Target::new("lo", "127.0.0.1"));

        let resolver = DnsResolver::new();
        let summary = resolver.preflight(&mut registry).await;

        assert_eq!(summary.literal, 1);
        assert_eq!(summary.removed, 0);
        let t = registry.get("net", "lo").expect("target");
        assert!(!t.is_dns_name);
        assert_eq!(t.resolved, Some("127.0.0.1".parse().expect("ip")));
    }

    #[tokio::test]
    async fn test_preflight_keeps_carried_over_resolution() {
        let mut registry = Registry::default();
        let mut t = Target::new("svc", "svc.example.test");
        t.is_dns_name = true;
        t.resolved = Some("10.0.0.2".parse().expect("ip"));
        registry
            .organizations
            .entry("net".to_string())
            .or_default()
            .hosts
            .push(t);

        let resolver = DnsResolver::new();
        let summary = resolver.preflight(&mut registry).await;

        assert_eq!(summary.dns_resolved, 1);
        assert_eq!(summary.removed, 0);
        let t = registry.get("net", "svc").expect("target");
        assert_eq!(t.resolved, Some("10.0.0.2".parse().expect("ip")));
    }
}
