//! Out-of-band traffic meter probe.
//!
//! Some seedbox providers expose a JSON endpoint with the box's outbound
//! traffic counter. The registry polls it at a low duty cycle and the
//! dispatcher excludes instances that have exhausted their budget.

use std::time::Duration;

use serde::Deserialize;

use crate::services::instance::THROTTLED_TRAFFIC_SENTINEL;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Payload of the traffic meter endpoint. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
struct TrafficReport {
    /// Outbound traffic consumed so far, MiB.
    #[serde(default)]
    out: f64,
    /// Upstream is rate-limiting the box right now.
    #[serde(default, rename = "trafficThrottled")]
    traffic_throttled: bool,
}

fn report_to_bytes(report: &TrafficReport) -> u64 {
    if report.traffic_throttled {
        return THROTTLED_TRAFFIC_SENTINEL;
    }
    (report.out * BYTES_PER_MIB) as u64
}

/// Polls traffic meter endpoints.
pub struct TrafficProbe {
    http: reqwest::Client,
}

impl TrafficProbe {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Fetch the meter and convert to bytes. Any failure degrades to 0,
    /// which the eligibility check treats as "unknown, allowed".
    pub async fn outbound_bytes(&self, instance: &str, url: &str) -> u64 {
        let report = match self.fetch(url).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(instance = %instance, error = %e, "traffic probe failed");
                return 0;
            }
        };

        let bytes = report_to_bytes(&report);
        if report.traffic_throttled {
            tracing::warn!(instance = %instance, "traffic meter reports throttled link");
        } else {
            tracing::debug!(
                instance = %instance,
                out_mib = report.out,
                "traffic probe succeeded"
            );
        }
        bytes
    }

    async fn fetch(&self, url: &str) -> Result<TrafficReport, reqwest::Error> {
        self.http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<TrafficReport>()
            .await
    }
}

impl Default for TrafficProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_converts_mib_to_bytes() {
        let report: TrafficReport = serde_json::from_str(r#"{"out": 2.5}"#).unwrap();
        assert_eq!(report_to_bytes(&report), 2_621_440);
    }

    #[test]
    fn test_throttled_overrides_counter() {
        let report: TrafficReport =
            serde_json::from_str(r#"{"out": 1.0, "trafficThrottled": true}"#).unwrap();
        assert_eq!(report_to_bytes(&report), THROTTLED_TRAFFIC_SENTINEL);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let report: TrafficReport =
            serde_json::from_str(r#"{"out": 1.0, "in": 4.0, "period": "monthly"}"#).unwrap();
        assert_eq!(report_to_bytes(&report), 1_048_576);
    }

    #[test]
    fn test_missing_fields_default_to_zero() {
        let report: TrafficReport = serde_json::from_str("{}").unwrap();
        assert_eq!(report_to_bytes(&report), 0);
    }
}
