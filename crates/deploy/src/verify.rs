//! Checks against the live endpoint after a deploy.
//!
//! A failed verification never reverts the deployment; it only changes the outcome reported
//! to the operator.

use std::{fmt, time::Duration};

use serde::Serialize;
use serde_json::json;

use crate::{
    audit::{AuditLedger, AuditScope, EventType},
    config::{RetrySettings, VerifyMode},
    platform::{Platform, ProbeResponse},
    retry::retry_transient,
};

/// Consecutive `/health` probes made in comprehensive mode.
const STABILITY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl VerificationCheck {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub mode: VerifyMode,
    pub url: Option<String>,
    /// Why nothing was checked, if nothing was.
    pub skipped: Option<String>,
    pub checks: Vec<VerificationCheck>,
}

impl VerificationReport {
    fn skipped(mode: VerifyMode, url: Option<&str>, reason: &str) -> Self {
        Self {
            mode,
            url: url.map(String::from),
            skipped: Some(reason.to_string()),
            checks: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &VerificationCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = &self.skipped {
            return writeln!(f, "Verification: SKIPPED ({})", reason);
        }
        let status = if self.passed() { "PASSED" } else { "FAILED" };
        writeln!(f, "Verification ({}): {}", self.mode, status)?;
        for check in &self.checks {
            let icon = if check.passed { "[ok]" } else { "[FAILED]" };
            writeln!(f, "  {} {}: {}", icon, check.name, check.detail)?;
        }
        Ok(())
    }
}

pub struct PostDeploymentVerifier<'a, P: Platform> {
    platform: &'a P,
    mode: VerifyMode,
    max_latency: Duration,
    retry: &'a RetrySettings,
}

impl<'a, P: Platform> PostDeploymentVerifier<'a, P> {
    pub fn new(platform: &'a P, mode: VerifyMode, max_latency: Duration, retry: &'a RetrySettings) -> Self {
        Self {
            platform,
            mode,
            max_latency,
            retry,
        }
    }

    pub async fn verify(
        &self,
        url: Option<&str>,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> VerificationReport {
        let report = match (self.mode, url) {
            (VerifyMode::Skip, _) => VerificationReport::skipped(self.mode, url, "disabled"),
            (_, None) => VerificationReport::skipped(self.mode, None, "no service URL"),
            (_, Some(url)) => self.run_checks(url).await,
        };

        if report.skipped.is_none() {
            let checks: Vec<_> = report
                .checks
                .iter()
                .map(|c| json!({ "name": c.name, "passed": c.passed, "detail": c.detail }))
                .collect();
            let event = if report.passed() {
                EventType::VerificationPassed
            } else {
                EventType::VerificationFailed
            };
            ledger.record(
                event,
                scope,
                json!({ "mode": self.mode, "url": report.url, "checks": checks }),
            );
        }
        report
    }

    async fn run_checks(&self, url: &str) -> VerificationReport {
        let base = url.trim_end_matches('/');
        let health = format!("{}/health", base);
        let mut checks = Vec::new();

        if self.mode == VerifyMode::Comprehensive {
            checks.push(if base.starts_with("https://") {
                VerificationCheck::pass("https", "served over TLS")
            } else {
                VerificationCheck::fail("https", format!("{} is not an https URL", base))
            });
        }

        let root = self.probe(base).await;
        checks.push(match &root {
            Ok(response) if response.status < 500 => {
                VerificationCheck::pass("reachable", format!("HTTP {}", response.status))
            }
            Ok(response) => VerificationCheck::fail("reachable", format!("HTTP {}", response.status)),
            Err(error) => VerificationCheck::fail("reachable", error.clone()),
        });

        checks.push(health_check("health", self.probe(&health).await));

        if self.mode == VerifyMode::Comprehensive {
            if let Ok(response) = &root {
                let latency_ms = response.latency.as_millis();
                checks.push(if response.latency <= self.max_latency {
                    VerificationCheck::pass("latency", format!("{} ms", latency_ms))
                } else {
                    VerificationCheck::fail(
                        "latency",
                        format!("{} ms exceeds {} ms", latency_ms, self.max_latency.as_millis()),
                    )
                });
            }

            let mut failures = 0;
            for _ in 0..STABILITY_ATTEMPTS {
                if !is_healthy(&self.probe(&health).await) {
                    failures += 1;
                }
            }
            checks.push(if failures == 0 {
                VerificationCheck::pass("stability", format!("{} consecutive healthy probes", STABILITY_ATTEMPTS))
            } else {
                VerificationCheck::fail(
                    "stability",
                    format!("{} of {} probes unhealthy", failures, STABILITY_ATTEMPTS),
                )
            });
        }

        for check in checks.iter().filter(|c| !c.passed) {
            tracing::warn!(check = %check.name, detail = %check.detail, "Verification check failed");
        }

        VerificationReport {
            mode: self.mode,
            url: Some(base.to_string()),
            skipped: None,
            checks,
        }
    }

    /// Transport failures are retried; any HTTP answer is returned as is.
    async fn probe(&self, url: &str) -> Result<ProbeResponse, String> {
        retry_transient(self.retry, url, || self.platform.probe(url))
            .await
            .map_err(|e| format!("{:#}", e))
    }
}

fn is_healthy(probe: &Result<ProbeResponse, String>) -> bool {
    matches!(probe, Ok(response) if is_2xx(response))
}

fn is_2xx(response: &ProbeResponse) -> bool {
    (200..300).contains(&response.status)
}

fn health_check(name: &str, probe: Result<ProbeResponse, String>) -> VerificationCheck {
    match probe {
        Ok(response) if is_2xx(&response) => {
            VerificationCheck::pass(name, format!("HTTP {}", response.status))
        }
        Ok(response) => VerificationCheck::fail(name, format!("HTTP {}", response.status)),
        Err(error) => VerificationCheck::fail(name, error),
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::{config::AuditSettings, testing::FakePlatform};

    fn retry() -> RetrySettings {
        RetrySettings {
            attempts: 2,
            delay_ms: 1,
        }
    }

    fn ledger(temp_dir: &TempDir) -> AuditLedger {
        AuditLedger::open(temp_dir.path().join("audit"), &AuditSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_smoke_passes_against_healthy_endpoint() {
        let temp_dir = TempDir::new("edgeship-verify").expect("Failed to create temp dir");
        let mut ledger = ledger(&temp_dir);
        let platform = FakePlatform::new();
        let retry = retry();

        let report = PostDeploymentVerifier::new(&platform, VerifyMode::Smoke, Duration::from_secs(1), &retry)
            .verify(Some("https://api.workers.dev/"), &mut ledger, &AuditScope::none())
            .await;

        assert!(report.passed());
        assert_eq!(report.checks.len(), 2);
        assert_eq!(
            platform.calls(),
            vec![
                "probe:https://api.workers.dev".to_string(),
                "probe:https://api.workers.dev/health".to_string(),
            ]
        );
        assert_eq!(ledger.session().count(EventType::VerificationPassed), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let temp_dir = TempDir::new("edgeship-verify").expect("Failed to create temp dir");
        let mut ledger = ledger(&temp_dir);
        let platform = FakePlatform::new().with_probe_status(None);
        let retry = retry();

        let report = PostDeploymentVerifier::new(&platform, VerifyMode::Smoke, Duration::from_secs(1), &retry)
            .verify(Some("https://api.workers.dev"), &mut ledger, &AuditScope::none())
            .await;

        assert!(!report.passed());
        assert_eq!(report.failures().count(), 2);
        // Connection failures are retried.
        assert_eq!(platform.calls_to("probe"), 4);
        assert!(report.to_string().contains("[FAILED] health"));
        assert_eq!(ledger.session().count(EventType::VerificationFailed), 1);
    }

    #[tokio::test]
    async fn test_comprehensive_adds_checks() {
        let temp_dir = TempDir::new("edgeship-verify").expect("Failed to create temp dir");
        let mut ledger = ledger(&temp_dir);
        let platform = FakePlatform::new();
        let retry = retry();

        let report = PostDeploymentVerifier::new(&platform, VerifyMode::Comprehensive, Duration::from_millis(1), &retry)
            .verify(Some("http://api.example.com"), &mut ledger, &AuditScope::none())
            .await;

        let failed: Vec<&str> = report.failures().map(|c| c.name.as_str()).collect();
        assert_eq!(failed, vec!["https", "latency"]);
        assert_eq!(report.checks.len(), 5);
        assert_eq!(platform.calls_to("probe:http://api.example.com/health"), 1 + STABILITY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_skipped_without_url_or_when_disabled() {
        let temp_dir = TempDir::new("edgeship-verify").expect("Failed to create temp dir");
        let mut ledger = ledger(&temp_dir);
        let platform = FakePlatform::new();
        let retry = retry();

        let report = PostDeploymentVerifier::new(&platform, VerifyMode::Smoke, Duration::from_secs(1), &retry)
            .verify(None, &mut ledger, &AuditScope::none())
            .await;
        assert!(report.passed());
        assert!(report.skipped.is_some());

        let report = PostDeploymentVerifier::new(&platform, VerifyMode::Skip, Duration::from_secs(1), &retry)
            .verify(Some("https://api.workers.dev"), &mut ledger, &AuditScope::none())
            .await;
        assert!(report.to_string().contains("SKIPPED"));
        assert_eq!(platform.call_count(), 0);
    }
}
