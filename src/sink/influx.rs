use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::config::Settings;

use super::{DataPoint, PointWriter};

/// Deadline for the startup health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// InfluxDB v2 client: one health probe at startup, then line-protocol
/// writes of flushed batches.
pub struct InfluxWriter {
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

impl InfluxWriter {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            url: settings.influx_url.trim_end_matches('/').to_string(),
            token: settings.influx_token.clone(),
            org: settings.influx_org.clone(),
            bucket: settings.influx_bucket.clone(),
        })
    }

    /// Verify the store is reachable and healthy. Startup fails on error.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.url);
        let response = self
            .http
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("connecting to InfluxDB at {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("InfluxDB health check returned status {status}");
        }

        let health: HealthResponse = response
            .json()
            .await
            .context("decoding InfluxDB health response")?;

        if health.status != "pass" {
            bail!("InfluxDB health check failed: {}", health.status);
        }

        Ok(())
    }

    fn write_url(&self) -> String {
        format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            self.url, self.org, self.bucket
        )
    }
}

impl PointWriter for InfluxWriter {
    async fn write(&self, points: Vec<DataPoint>) -> Result<()> {
        let mut body = String::with_capacity(points.len() * 160);
        for point in &points {
            body.push_str(&encode_point(point));
            body.push('\n');
        }

        let response = self
            .http
            .post(self.write_url())
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .context("sending write request to InfluxDB")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("InfluxDB write returned status {status}: {detail}");
        }

        debug!(points = points.len(), "wrote batch to InfluxDB");
        Ok(())
    }
}

/// Encode one data point as an InfluxDB line.
///
/// Unsuffixed numeric fields are float64 in line protocol, which matches the
/// schema; the `resolved_ip` tag appears only for hostname targets whose
/// resolution differs from the input.
pub fn encode_point(point: &DataPoint) -> String {
    let mut line = String::with_capacity(160);
    line.push_str("ping");

    push_tag(&mut line, "host", &point.target_name);
    push_tag(&mut line, "ip", &point.original_address);
    push_tag(&mut line, "organization", &point.organization);
    push_tag(&mut line, "source", &point.source_address);

    if point.is_dns_name {
        if let Some(resolved) = point.resolved_address {
            let resolved = resolved.to_string();
            if resolved != point.original_address {
                push_tag(&mut line, "resolved_ip", &resolved);
            }
        }
    }
    push_tag(
        &mut line,
        "is_dns_name",
        if point.is_dns_name { "true" } else { "false" },
    );

    line.push_str(&format!(
        " rtt_avg={},packet_loss={},jitter={} {}",
        point.avg_rtt_ms,
        point.loss_pct,
        point.jitter_ms,
        point.window_start.timestamp_nanos_opt().unwrap_or_default(),
    ));
    line
}

fn push_tag(line: &mut String, key: &str, value: &str) {
    line.push(',');
    line.push_str(key);
    line.push('=');
    for c in value.chars() {
        // Commas, spaces and equals signs are special in tag values.
        if matches!(c, ',' | ' ' | '=') {
            line.push('\\');
        }
        line.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn sample_point() -> DataPoint {
        DataPoint {
            organization: "backbone".to_string(),
            target_name: "core-1".to_string(),
            original_address: "192.0.2.1".to_string(),
            resolved_address: Some("192.0.2.1".parse().expect("ip")),
            source_address: "default".to_string(),
            window_start: Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts"),
            avg_rtt_ms: 1.5,
            loss_pct: 0.0,
            jitter_ms: 0.25,
            is_dns_name: false,
        }
    }

    #[test]
    fn test_encode_literal_target() {
        let line = encode_point(&sample_point());
        assert_eq!(
            line,
            "ping,host=core-1,ip=192.0.2.1,organization=backbone,source=default,\
             is_dns_name=false rtt_avg=1.5,packet_loss=0,jitter=0.25 \
             1700000000000000000"
        );
    }

    #[test]
    fn test_encode_dns_target_adds_resolved_ip() {
        let mut point = sample_point();
        point.original_address = "svc.example.test".to_string();
        point.resolved_address = Some("10.0.0.2".parse().expect("ip"));
        point.is_dns_name = true;

        let line = encode_point(&point);
        assert!(line.contains("ip=svc.example.test"));
        assert!(line.contains("resolved_ip=10.0.0.2"));
        assert!(line.contains("is_dns_name=true"));
    }

    #[test]
    fn test_encode_omits_resolved_ip_when_equal() {
        let mut point = sample_point();
        point.original_address = "10.0.0.2".to_string();
        point.resolved_address = Some("10.0.0.2".parse().expect("ip"));

        let line = encode_point(&point);
        assert!(!line.contains("resolved_ip"));
    }

    #[test]
    fn test_encode_escapes_tag_values() {
        let mut point = sample_point();
        point.target_name = "core 1,west=a".to_string();

        let line = encode_point(&point);
        assert!(line.contains(r"host=core\ 1\,west\=a"));
    }
}
