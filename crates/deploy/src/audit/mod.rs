//! Append-only audit ledger.
//!
//! One [`AuditLedger`] lives for the whole process invocation. It owns the [`AuditSession`]
//! (the in-memory event list and metrics) and the durable [`LogSinks`]. Workflows receive it by
//! `&mut` and call [`AuditLedger::record`]; every event is flushed to disk as it is recorded.

mod event;
mod report;
mod sink;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub use event::{AuditCategory, AuditEvent, AuditLevel, EventClass, EventType, Retention};
pub use report::{DeploymentReport, PhaseSummary, ReportFiles};
pub use sink::{LogFormat, LogSinks, LogTarget, MAIN_LOG_STEM, read_events};

use crate::{
    config::AuditSettings,
    fs::FsHandler,
    state::{DeploymentId, DeploymentStatus, Phase},
};

/// Domain and deployment an event belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditScope {
    pub domain: Option<String>,
    pub deployment_id: Option<DeploymentId>,
}

impl AuditScope {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            deployment_id: None,
        }
    }

    pub fn deployment(domain: impl Into<String>, deployment_id: DeploymentId) -> Self {
        Self {
            domain: Some(domain.into()),
            deployment_id: Some(deployment_id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub total_events: u64,
    pub error_count: u64,
    pub warning_count: u64,
    pub deployment_count: u64,
    pub rollback_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message. `None` while running or after success.
    pub error: Option<String>,
}

/// What the session knows about one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentAuditContext {
    pub domain: String,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: DeploymentStatus,
    pub phases: Vec<PhaseRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub deployments: BTreeMap<DeploymentId, DeploymentAuditContext>,
    pub events: Vec<AuditEvent>,
    pub metrics: SessionMetrics,
}

impl AuditSession {
    fn new() -> Self {
        let start_time = Utc::now();
        let suffix: u32 = rand::random();
        Self {
            session_id: format!("session-{}-{:08x}", start_time.format("%Y%m%dT%H%M%S"), suffix),
            start_time,
            deployments: BTreeMap::new(),
            events: Vec::new(),
            metrics: SessionMetrics::default(),
        }
    }

    /// Events recorded for one deployment, in sequence order.
    pub fn events_for(&self, id: &DeploymentId) -> Vec<&AuditEvent> {
        self.events
            .iter()
            .filter(|e| e.deployment_id.as_ref() == Some(id))
            .collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

pub struct AuditLedger {
    session: AuditSession,
    sinks: LogSinks,
    next_sequence: u64,
    finished: bool,
}

impl AuditLedger {
    /// Open the ledger rooted at `dir` and record the session start.
    pub fn open(dir: PathBuf, settings: &AuditSettings) -> Result<Self> {
        let sinks = LogSinks::new(dir, settings.clone())?;
        let mut ledger = Self {
            session: AuditSession::new(),
            sinks,
            next_sequence: 1,
            finished: false,
        };
        tracing::debug!(session_id = %ledger.session.session_id, dir = %ledger.dir().display(), "Audit session opened");
        ledger.record(
            EventType::SessionStarted,
            &AuditScope::none(),
            json!({ "pid": std::process::id() }),
        );
        Ok(ledger)
    }

    pub fn session(&self) -> &AuditSession {
        &self.session
    }

    pub fn dir(&self) -> &Path {
        self.sinks.root()
    }

    pub fn write_failures(&self) -> u64 {
        self.sinks.write_failures()
    }

    /// Record one event. Never fails; durable write errors are logged and counted.
    ///
    /// Oversized target files are rotated first. A write that rotates anything is preceded by
    /// one [`EventType::LogRotated`] event, in the fresh files, listing every rotated target.
    pub fn record(&mut self, event_type: EventType, scope: &AuditScope, details: Value) -> u64 {
        let now = Utc::now();
        let category = event_type.class().category;
        let targets = self.sinks.targets(category, &self.session.session_id, now);

        let rotations = self.sinks.rotate_oversized(&targets, now);
        if !rotations.is_empty() {
            let rotated_targets: Vec<String> = rotations
                .iter()
                .map(|r| r.target.stem().display().to_string())
                .collect();
            let files: Vec<String> = rotations
                .iter()
                .flat_map(|r| &r.rotated_files)
                .map(|p| p.display().to_string())
                .collect();
            self.append(
                EventType::LogRotated,
                &AuditScope::none(),
                json!({
                    "targets": rotated_targets,
                    "rotated_files": files,
                }),
                now,
            );
        }

        self.append(event_type, scope, details, now)
    }

    fn append(
        &mut self,
        event_type: EventType,
        scope: &AuditScope,
        details: Value,
        timestamp: DateTime<Utc>,
    ) -> u64 {
        let class = event_type.class();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let details = match details {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let event = AuditEvent {
            sequence,
            session_id: self.session.session_id.clone(),
            timestamp,
            event_type,
            level: class.level,
            category: class.category,
            retention: class.retention,
            domain: scope.domain.clone(),
            deployment_id: scope.deployment_id.clone(),
            details,
        };

        let targets = self
            .sinks
            .targets(class.category, &self.session.session_id, timestamp);
        self.sinks.write(&event, &targets);

        let metrics = &mut self.session.metrics;
        metrics.total_events += 1;
        match class.level {
            AuditLevel::Error => metrics.error_count += 1,
            AuditLevel::Warn => metrics.warning_count += 1,
            _ => {}
        }
        if event_type == EventType::RollbackStarted {
            metrics.rollback_count += 1;
        }

        tracing::trace!(sequence, %event_type, "Audit event recorded");
        self.session.events.push(event);
        sequence
    }

    /// Start tracking a deployment and record its start.
    pub fn begin_deployment(&mut self, id: &DeploymentId, domain: &str, environment: &str) {
        self.session.deployments.insert(
            id.clone(),
            DeploymentAuditContext {
                domain: domain.to_string(),
                environment: environment.to_string(),
                started_at: Utc::now(),
                finished_at: None,
                status: DeploymentStatus::Running,
                phases: Vec::new(),
            },
        );
        self.session.metrics.deployment_count += 1;
        self.record(
            EventType::DeploymentStarted,
            &AuditScope::deployment(domain, id.clone()),
            json!({ "environment": environment }),
        );
    }

    pub fn phase_started(&mut self, scope: &AuditScope, phase: Phase) {
        if let Some(ctx) = self.context_mut(scope) {
            ctx.phases.push(PhaseRecord {
                phase,
                started_at: Utc::now(),
                finished_at: None,
                error: None,
            });
        }
        self.record(EventType::PhaseStarted, scope, json!({ "phase": phase }));
    }

    pub fn phase_completed(&mut self, scope: &AuditScope, phase: Phase) {
        self.close_phase(scope, phase, None);
        self.record(EventType::PhaseCompleted, scope, json!({ "phase": phase }));
    }

    pub fn phase_failed(&mut self, scope: &AuditScope, phase: Phase, error: &str) {
        self.close_phase(scope, phase, Some(error.to_string()));
        self.record(
            EventType::PhaseFailed,
            scope,
            json!({ "phase": phase, "error": error }),
        );
    }

    /// Mark a deployment terminal in the session.
    pub fn end_deployment(&mut self, id: &DeploymentId, status: DeploymentStatus) {
        if let Some(ctx) = self.session.deployments.get_mut(id) {
            ctx.status = status;
            ctx.finished_at = Some(Utc::now());
        }
    }

    fn close_phase(&mut self, scope: &AuditScope, phase: Phase, error: Option<String>) {
        if let Some(record) = self
            .context_mut(scope)
            .and_then(|ctx| ctx.phases.iter_mut().rev().find(|p| p.phase == phase))
        {
            record.finished_at = Some(Utc::now());
            record.error = error;
        }
    }

    fn context_mut(&mut self, scope: &AuditScope) -> Option<&mut DeploymentAuditContext> {
        let id = scope.deployment_id.as_ref()?;
        self.session.deployments.get_mut(id)
    }

    /// Build the report for one deployment and write it under `reports/`.
    pub fn generate_deployment_report(&self, id: &DeploymentId) -> Result<(DeploymentReport, ReportFiles)> {
        let events: Vec<AuditEvent> = self.session.events_for(id).into_iter().cloned().collect();
        let report = DeploymentReport::from_events(id, &events)?;
        let files = report.write(&self.dir().join("reports"))?;
        Ok((report, files))
    }

    /// Build a report for a deployment recorded by an earlier invocation.
    pub fn report_from_disk(dir: &Path, id: &DeploymentId) -> Result<(DeploymentReport, ReportFiles)> {
        let events: Vec<AuditEvent> = read_events(dir)?
            .into_iter()
            .filter(|e| e.deployment_id.as_ref() == Some(id))
            .collect();
        let report = DeploymentReport::from_events(id, &events)?;
        let files = report.write(&dir.join("reports"))?;
        Ok((report, files))
    }

    /// Record the session end and write the session summary. Later calls are no-ops.
    pub fn finish(&mut self) -> Result<Option<PathBuf>> {
        if self.finished {
            return Ok(None);
        }
        self.finished = true;

        let duration = Utc::now() - self.session.start_time;
        let metrics = self.session.metrics.clone();
        self.record(
            EventType::SessionFinished,
            &AuditScope::none(),
            json!({
                "duration_ms": duration.num_milliseconds(),
                "total_events": metrics.total_events + 1,
                "error_count": metrics.error_count,
                "warning_count": metrics.warning_count,
                "deployment_count": metrics.deployment_count,
                "rollback_count": metrics.rollback_count,
                "write_failures": self.write_failures(),
            }),
        );

        let path = self
            .dir()
            .join("sessions")
            .join(format!("{}-summary.json", self.session.session_id));
        let summary = json!({
            "session_id": self.session.session_id,
            "start_time": self.session.start_time,
            "end_time": Utc::now(),
            "metrics": self.session.metrics,
            "deployments": self.session.deployments,
        });
        FsHandler::write_json_atomic(&path, &summary)
            .context("Failed to write audit session summary")?;
        tracing::debug!(path = %path.display(), "Audit session summary written");
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    fn single_format(max_file_bytes: u64) -> AuditSettings {
        AuditSettings {
            max_file_bytes,
            formats: vec![LogFormat::Jsonl],
            daily_partition: false,
            session_partition: false,
            ..AuditSettings::default()
        }
    }

    #[test]
    fn test_sequences_are_gap_free() {
        let temp_dir = TempDir::new("edgeship-audit").expect("Failed to create temp dir");
        // A tiny limit forces many rotations, which insert events of their own.
        let mut ledger = AuditLedger::open(temp_dir.path().to_path_buf(), &single_format(600)).unwrap();
        let scope = AuditScope::domain("example.com");
        for i in 0..250 {
            ledger.record(EventType::CommandExecuted, &scope, json!({ "i": i }));
        }

        let sequences: Vec<u64> = ledger.session().events.iter().map(|e| e.sequence).collect();
        let expected: Vec<u64> = (1..=sequences.len() as u64).collect();
        assert_eq!(sequences, expected);
        assert!(ledger.session().count(EventType::LogRotated) > 0);
    }

    #[test]
    fn test_single_rotation_starts_fresh_file() {
        let temp_dir = TempDir::new("edgeship-audit").expect("Failed to create temp dir");
        let max = 2_000;
        let mut ledger = AuditLedger::open(temp_dir.path().to_path_buf(), &single_format(max)).unwrap();
        let main = temp_dir.path().join("audit.jsonl");
        let scope = AuditScope::domain("example.com");

        while std::fs::metadata(&main).unwrap().len() <= max {
            ledger.record(EventType::CommandExecuted, &scope, json!({ "padding": "x".repeat(64) }));
        }
        assert_eq!(ledger.session().count(EventType::LogRotated), 0);

        let seq = ledger.record(EventType::CommandExecuted, &scope, json!({ "after": true }));
        assert_eq!(ledger.session().count(EventType::LogRotated), 1);

        let content = std::fs::read_to_string(&main).unwrap();
        let lines: Vec<AuditEvent> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].event_type, EventType::LogRotated);
        assert_eq!(lines[1].sequence, seq);

        // Subsequent small writes stay in the fresh file.
        ledger.record(EventType::CommandExecuted, &scope, json!({}));
        assert_eq!(ledger.session().count(EventType::LogRotated), 1);
        assert_eq!(std::fs::read_to_string(&main).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_one_rotation_event_across_partitions() {
        let temp_dir = TempDir::new("edgeship-audit").expect("Failed to create temp dir");
        let max = 2_000;
        let settings = AuditSettings {
            max_file_bytes: max,
            formats: vec![LogFormat::Jsonl],
            ..AuditSettings::default()
        };
        assert!(settings.daily_partition && settings.session_partition);
        let mut ledger = AuditLedger::open(temp_dir.path().to_path_buf(), &settings).unwrap();
        let main = temp_dir.path().join("audit.jsonl");
        let scope = AuditScope::domain("example.com");

        while std::fs::metadata(&main).unwrap().len() <= max {
            ledger.record(EventType::CommandExecuted, &scope, json!({ "padding": "x".repeat(64) }));
        }
        ledger.record(EventType::CommandExecuted, &scope, json!({ "after": true }));

        assert_eq!(ledger.session().count(EventType::LogRotated), 1);
        let rotated = ledger
            .session()
            .events
            .iter()
            .find(|e| e.event_type == EventType::LogRotated)
            .unwrap();
        assert_eq!(rotated.details["targets"].as_array().map(Vec::len), Some(3));

        let fresh: Vec<AuditEvent> = std::fs::read_to_string(&main)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].event_type, EventType::LogRotated);
    }

    #[test]
    fn test_metrics_and_phase_tracking() {
        let temp_dir = TempDir::new("edgeship-audit").expect("Failed to create temp dir");
        let mut ledger =
            AuditLedger::open(temp_dir.path().to_path_buf(), &AuditSettings::default()).unwrap();
        let id = DeploymentId::from("deploy-test".to_string());
        let scope = AuditScope::deployment("example.com", id.clone());

        ledger.begin_deployment(&id, "example.com", "production");
        ledger.phase_started(&scope, Phase::Database);
        ledger.phase_failed(&scope, Phase::Database, "boom");
        ledger.record(EventType::RollbackStarted, &scope, json!({}));

        let session = ledger.session();
        assert_eq!(session.metrics.deployment_count, 1);
        assert_eq!(session.metrics.rollback_count, 1);
        assert_eq!(session.metrics.error_count, 1);
        assert_eq!(session.metrics.warning_count, 1);
        let ctx = &session.deployments[&id];
        assert_eq!(ctx.phases[0].error.as_deref(), Some("boom"));

        // Security events land in the dedicated log.
        ledger.record(EventType::CredentialsResolved, &scope, json!({}));
        assert!(temp_dir.path().join("security/audit.jsonl").is_file());
        assert!(temp_dir
            .path()
            .join(format!("sessions/{}.log", ledger.session().session_id))
            .is_file());
    }

    #[test]
    fn test_finish_writes_summary_once() {
        let temp_dir = TempDir::new("edgeship-audit").expect("Failed to create temp dir");
        let mut ledger =
            AuditLedger::open(temp_dir.path().to_path_buf(), &AuditSettings::default()).unwrap();
        let path = ledger.finish().unwrap().expect("summary path");
        assert!(path.is_file());
        assert!(ledger.finish().unwrap().is_none());
        assert_eq!(ledger.session().count(EventType::SessionFinished), 1);
    }
}
