//! Per-deployment reports assembled from audit events.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use serde::{Deserialize, Serialize};

use super::event::{AuditEvent, AuditLevel, EventType};
use crate::{
    fs::FsHandler,
    state::{DeploymentId, DeploymentStatus, Phase},
};

/// Outcome of one phase as seen in the event history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub succeeded: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub deployment_id: DeploymentId,
    pub domain: Option<String>,
    pub environment: Option<String>,
    /// `Running` when the history ends without a terminal event.
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub phases: Vec<PhaseSummary>,
    pub total_events: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub rollback: Vec<String>,
}

/// Paths of the written report files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFiles {
    pub json: PathBuf,
    pub text: PathBuf,
    pub csv: PathBuf,
}

impl DeploymentReport {
    /// Summarize the history of one deployment. Works for partial histories.
    pub fn from_events(id: &DeploymentId, events: &[AuditEvent]) -> Result<Self> {
        let first = events
            .first()
            .with_context(|| format!("No audit events recorded for deployment {}", id))?;

        let mut report = Self {
            deployment_id: id.clone(),
            domain: first.domain.clone(),
            environment: None,
            status: DeploymentStatus::Running,
            started_at: first.timestamp,
            finished_at: None,
            url: None,
            phases: Vec::new(),
            total_events: events.len(),
            errors: Vec::new(),
            warnings: Vec::new(),
            rollback: Vec::new(),
        };

        for event in events {
            let phase = event
                .details
                .get("phase")
                .and_then(|v| serde_json::from_value::<Phase>(v.clone()).ok());

            match event.event_type {
                EventType::DeploymentStarted => {
                    report.environment = event.detail_str("environment").map(String::from);
                    report.started_at = event.timestamp;
                }
                EventType::PhaseStarted => {
                    if let Some(phase) = phase {
                        report.phases.push(PhaseSummary {
                            phase,
                            started_at: event.timestamp,
                            finished_at: None,
                            succeeded: None,
                            error: None,
                        });
                    }
                }
                EventType::PhaseCompleted | EventType::PhaseFailed => {
                    let open = match phase {
                        Some(phase) => report.phases.iter_mut().rev().find(|p| p.phase == phase),
                        None => None,
                    };
                    if let Some(summary) = open {
                        summary.finished_at = Some(event.timestamp);
                        summary.succeeded = Some(event.event_type == EventType::PhaseCompleted);
                        summary.error = event.detail_str("error").map(String::from);
                    }
                }
                EventType::DeploymentCompleted => {
                    report.status = DeploymentStatus::Succeeded;
                    report.finished_at = Some(event.timestamp);
                    report.url = event.detail_str("url").map(String::from);
                }
                EventType::DeploymentFailed => {
                    report.status = DeploymentStatus::Failed;
                    report.finished_at = Some(event.timestamp);
                }
                EventType::UserCancelled => {
                    report.status = DeploymentStatus::Cancelled;
                    report.finished_at = Some(event.timestamp);
                }
                EventType::RollbackActionSucceeded | EventType::RollbackActionFailed => {
                    let icon = if event.event_type == EventType::RollbackActionSucceeded {
                        "[ok]"
                    } else {
                        "[FAILED]"
                    };
                    report.rollback.push(format!(
                        "{} {}",
                        icon,
                        event.detail_str("action").unwrap_or("unknown action")
                    ));
                }
                _ => {}
            }

            let message = || {
                event
                    .detail_str("error")
                    .or_else(|| event.detail_str("reason"))
                    .map(|m| format!("{}: {}", event.event_type, m))
                    .unwrap_or_else(|| event.event_type.to_string())
            };
            match event.level {
                AuditLevel::Error => report.errors.push(message()),
                AuditLevel::Warn => report.warnings.push(message()),
                _ => {}
            }
        }

        Ok(report)
    }

    /// Write `<id>.json`, `<id>.txt` and `<id>.csv` under `dir`.
    pub fn write(&self, dir: &Path) -> Result<ReportFiles> {
        let files = ReportFiles {
            json: dir.join(format!("{}.json", self.deployment_id)),
            text: dir.join(format!("{}.txt", self.deployment_id)),
            csv: dir.join(format!("{}.csv", self.deployment_id)),
        };

        FsHandler::write_json_atomic(&files.json, self)?;
        FsHandler::write_atomic(&files.text, self.to_string().as_bytes())?;
        FsHandler::write_atomic(&files.csv, &self.phase_csv()?)?;

        tracing::info!(path = %files.text.display(), "Deployment report written");
        Ok(files)
    }

    fn phase_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["phase", "started_at", "finished_at", "outcome", "error"])?;
        for summary in &self.phases {
            writer.write_record([
                summary.phase.to_string(),
                summary.started_at.to_rfc3339(),
                summary
                    .finished_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                outcome(summary.succeeded).to_string(),
                summary.error.clone().unwrap_or_default(),
            ])?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to finish report CSV: {}", e))
    }
}

fn outcome(succeeded: Option<bool>) -> &'static str {
    match succeeded {
        Some(true) => "ok",
        Some(false) => "FAILED",
        None => "incomplete",
    }
}

impl fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Deployment {}", self.deployment_id)?;
        writeln!(f, "  Domain:      {}", self.domain.as_deref().unwrap_or("-"))?;
        writeln!(f, "  Environment: {}", self.environment.as_deref().unwrap_or("-"))?;
        writeln!(f, "  Status:      {}", self.status)?;
        writeln!(f, "  Started:     {}", self.started_at.to_rfc3339())?;
        if let Some(finished) = self.finished_at {
            let duration = finished - self.started_at;
            writeln!(
                f,
                "  Finished:    {} ({:.1}s)",
                finished.to_rfc3339(),
                duration.num_milliseconds() as f64 / 1000.0
            )?;
        }
        if let Some(url) = &self.url {
            writeln!(f, "  URL:         {}", url)?;
        }
        writeln!(f, "  Events:      {}", self.total_events)?;
        writeln!(f)?;

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_header(vec!["Phase", "Outcome", "Error"]);
        for summary in &self.phases {
            table.add_row(vec![
                summary.phase.to_string(),
                outcome(summary.succeeded).to_string(),
                summary.error.clone().unwrap_or_default(),
            ]);
        }
        writeln!(f, "{}", table)?;

        if !self.rollback.is_empty() {
            writeln!(f)?;
            writeln!(f, "Rollback:")?;
            for line in &self.rollback {
                writeln!(f, "  {}", line)?;
            }
        }

        if !self.errors.is_empty() {
            writeln!(f)?;
            writeln!(f, "Errors:")?;
            for error in &self.errors {
                writeln!(f, "  - {}", error)?;
            }
        }

        if !self.warnings.is_empty() {
            writeln!(f)?;
            writeln!(f, "Warnings:")?;
            for warning in &self.warnings {
                writeln!(f, "  - {}", warning)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempdir::TempDir;

    use super::*;
    use crate::{
        audit::{AuditLedger, AuditScope},
        config::AuditSettings,
    };

    #[test]
    fn test_report_for_failed_deployment() {
        let temp_dir = TempDir::new("edgeship-report").expect("Failed to create temp dir");
        let mut ledger =
            AuditLedger::open(temp_dir.path().to_path_buf(), &AuditSettings::default()).unwrap();
        let id = DeploymentId::from("deploy-failed".to_string());
        let scope = AuditScope::deployment("example.com", id.clone());

        ledger.begin_deployment(&id, "example.com", "production");
        ledger.phase_started(&scope, Phase::Credentials);
        ledger.phase_completed(&scope, Phase::Credentials);
        ledger.phase_started(&scope, Phase::Database);
        ledger.phase_failed(&scope, Phase::Database, "quota exceeded");
        ledger.record(
            EventType::DeploymentFailed,
            &scope,
            json!({ "phase": "database", "error": "quota exceeded" }),
        );

        let (report, files) = ledger.generate_deployment_report(&id).unwrap();
        assert_eq!(report.status, DeploymentStatus::Failed);
        assert_eq!(report.environment.as_deref(), Some("production"));
        assert_eq!(report.phases.len(), 2);
        assert_eq!(report.phases[1].succeeded, Some(false));
        assert!(report.errors.iter().any(|e| e.contains("quota exceeded")));

        assert!(files.json.is_file());
        assert!(files.csv.is_file());
        let text = std::fs::read_to_string(&files.text).unwrap();
        assert!(text.contains("Status:      failed"));
        assert!(text.contains("FAILED"));
    }

    #[test]
    fn test_report_from_disk_and_incomplete_history() {
        let temp_dir = TempDir::new("edgeship-report").expect("Failed to create temp dir");
        let id = DeploymentId::from("deploy-aborted".to_string());
        {
            let mut ledger =
                AuditLedger::open(temp_dir.path().to_path_buf(), &AuditSettings::default())
                    .unwrap();
            let scope = AuditScope::deployment("example.com", id.clone());
            ledger.begin_deployment(&id, "example.com", "staging");
            ledger.phase_started(&scope, Phase::Validation);
            // The process dies here.
        }

        let (report, _) = AuditLedger::report_from_disk(temp_dir.path(), &id).unwrap();
        assert_eq!(report.status, DeploymentStatus::Running);
        assert_eq!(report.phases[0].succeeded, None);
    }

    #[test]
    fn test_unknown_deployment_is_an_error() {
        let id = DeploymentId::from("deploy-missing".to_string());
        assert!(DeploymentReport::from_events(&id, &[]).is_err());
    }
}
