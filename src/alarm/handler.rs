use std::time::Duration;

use chrono::SecondsFormat;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::registry::Target;
use crate::sink::DataPoint;

/// Wall-clock budget for one handler run.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully prepared handler run: script path, positional arguments, and
/// environment. Built synchronously so dispatch can move it into a task.
#[derive(Debug, Clone)]
pub struct Invocation {
    receiver: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    host: String,
    address: String,
}

impl Invocation {
    pub fn new(receiver: &str, point: &DataPoint, target: &Target, reasons: &[String]) -> Self {
        let timestamp = point
            .window_start
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let reasons_joined = reasons.join(",");
        let rtt = format!("{:.1}", point.avg_rtt_ms);
        let loss = format!("{:.1}", point.loss_pct);
        let jitter = format!("{:.1}", point.jitter_ms);

        let args = vec![
            point.target_name.clone(),
            point.original_address.clone(),
            point.organization.clone(),
            rtt.clone(),
            loss.clone(),
            jitter.clone(),
            reasons_joined.clone(),
            timestamp.clone(),
        ];

        let env = vec![
            ("SMOGPING_HOST".to_string(), point.target_name.clone()),
            ("SMOGPING_IP".to_string(), point.original_address.clone()),
            ("SMOGPING_ORG".to_string(), point.organization.clone()),
            ("SMOGPING_RTT".to_string(), rtt),
            ("SMOGPING_LOSS".to_string(), loss),
            ("SMOGPING_JITTER".to_string(), jitter),
            ("SMOGPING_REASONS".to_string(), reasons_joined),
            ("SMOGPING_TIMESTAMP".to_string(), timestamp),
            (
                "SMOGPING_ALARM_PING".to_string(),
                target.alarm_rtt_ms.to_string(),
            ),
            (
                "SMOGPING_ALARM_LOSS".to_string(),
                target.alarm_loss_pct.to_string(),
            ),
            (
                "SMOGPING_ALARM_JITTER".to_string(),
                target.alarm_jitter_ms.to_string(),
            ),
        ];

        Self {
            receiver: receiver.to_string(),
            args,
            env,
            host: point.target_name.clone(),
            address: point.original_address.clone(),
        }
    }

    #[cfg(test)]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[cfg(test)]
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Run the handler through a shell interpreter so plain scripts work,
    /// capturing output and bounding the run at [`HANDLER_TIMEOUT`].
    pub async fn execute(self) {
        debug!(
            receiver = %self.receiver,
            host = %self.host,
            "executing alarm receiver",
        );

        let mut command = Command::new("/bin/bash");
        command
            .arg(&self.receiver)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);

        let output = match tokio::time::timeout(HANDLER_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(
                    receiver = %self.receiver,
                    host = %self.host,
                    ip = %self.address,
                    error = %e,
                    "alarm receiver failed to start",
                );
                return;
            }
            Err(_) => {
                error!(
                    receiver = %self.receiver,
                    host = %self.host,
                    ip = %self.address,
                    timeout_secs = HANDLER_TIMEOUT.as_secs(),
                    "alarm receiver timed out",
                );
                return;
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim();

        if !output.status.success() {
            error!(
                receiver = %self.receiver,
                host = %self.host,
                ip = %self.address,
                status = %output.status,
                output = %combined,
                "alarm receiver failed",
            );
        } else if combined.is_empty() {
            debug!(host = %self.host, "alarm receiver completed, no output");
        } else {
            info!(host = %self.host, output = %combined, "alarm receiver completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn sample_point() -> DataPoint {
        DataPoint {
            organization: "backbone".to_string(),
            target_name: "core-1".to_string(),
            original_address: "192.0.2.1".to_string(),
            resolved_address: Some("192.0.2.1".parse().expect("ip")),
            source_address: "default".to_string(),
            window_start: Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts"),
            avg_rtt_ms: 350.04,
            loss_pct: 7.2,
            jitter_ms: 12.0,
            is_dns_name: false,
        }
    }

    fn sample_target() -> Target {
        let mut t = Target::new("core-1", "192.0.2.1");
        t.alarm_rtt_ms = 200;
        t.alarm_loss_pct = 5;
        t.alarm_jitter_ms = 10;
        t
    }

    #[test]
    fn test_invocation_arguments() {
        let reasons = vec![
            "ping_time=350.0ms>200ms".to_string(),
            "packet_loss=7.2%>5%".to_string(),
        ];
        let inv = Invocation::new("/opt/alert.sh", &sample_point(), &sample_target(), &reasons);

        assert_eq!(
            inv.args(),
            &[
                "core-1",
                "192.0.2.1",
                "backbone",
                "350.0",
                "7.2",
                "12.0",
                "ping_time=350.0ms>200ms,packet_loss=7.2%>5%",
                "2023-11-14T22:13:20Z",
            ]
        );
    }

    #[test]
    fn test_invocation_environment() {
        let reasons = vec!["jitter=12.0ms>10ms".to_string()];
        let inv = Invocation::new("/opt/alert.sh", &sample_point(), &sample_target(), &reasons);

        let env: std::collections::HashMap<&str, &str> = inv
            .env()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        assert_eq!(env["SMOGPING_HOST"], "core-1");
        assert_eq!(env["SMOGPING_ORG"], "backbone");
        assert_eq!(env["SMOGPING_RTT"], "350.0");
        assert_eq!(env["SMOGPING_REASONS"], "jitter=12.0ms>10ms");
        assert_eq!(env["SMOGPING_TIMESTAMP"], "2023-11-14T22:13:20Z");
        assert_eq!(env["SMOGPING_ALARM_PING"], "200");
        assert_eq!(env["SMOGPING_ALARM_LOSS"], "5");
        assert_eq!(env["SMOGPING_ALARM_JITTER"], "10");
    }

    #[tokio::test]
    async fn test_execute_passes_args_and_env() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let out_path = dir.path().join("out.txt");
        let script_path = dir.path().join("handler.sh");

        {
            let mut script = std::fs::File::create(&script_path).expect("create script");
            writeln!(
                script,
                "#!/bin/bash\necho \"$1 $3 $SMOGPING_LOSS\" > {}",
                out_path.display()
            )
            .expect("write script");
        }
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let reasons = vec!["packet_loss=7.2%>5%".to_string()];
        let inv = Invocation::new(
            script_path.to_str().expect("path"),
            &sample_point(),
            &sample_target(),
            &reasons,
        );
        inv.execute().await;

        let out = std::fs::read_to_string(&out_path).expect("handler output");
        assert_eq!(out.trim(), "core-1 backbone 7.2");
    }
}
