//! Durable audit log files.
//!
//! Every event is written to up to four targets (main, daily, session, category) and each target
//! in every configured format. A failed write is logged and counted, never propagated, so one
//! broken file or format cannot silence the others.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::{AuditCategory, AuditEvent};
use crate::{config::AuditSettings, fs::FsHandler};

/// File name stem of the main log.
pub const MAIN_LOG_STEM: &str = "audit";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    Jsonl,
    Text,
    Csv,
}

impl LogFormat {
    pub fn extension(self) -> &'static str {
        match self {
            LogFormat::Jsonl => "jsonl",
            LogFormat::Text => "log",
            LogFormat::Csv => "csv",
        }
    }
}

/// A log file path without its format extension.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogTarget(PathBuf);

impl LogTarget {
    pub fn path(&self, format: LogFormat) -> PathBuf {
        let mut name = self.0.as_os_str().to_owned();
        name.push(".");
        name.push(format.extension());
        PathBuf::from(name)
    }

    pub fn stem(&self) -> &Path {
        &self.0
    }
}

/// A target whose oversized files were moved aside.
#[derive(Debug, Clone)]
pub struct Rotation {
    pub target: LogTarget,
    pub rotated_files: Vec<PathBuf>,
}

/// Writes audit events to the configured files.
#[derive(Debug)]
pub struct LogSinks {
    root: PathBuf,
    settings: AuditSettings,
    write_failures: u64,
}

impl LogSinks {
    pub fn new(root: PathBuf, settings: AuditSettings) -> Result<Self> {
        FsHandler::create_dir(&root)
            .with_context(|| format!("Failed to prepare audit directory {}", root.display()))?;
        Ok(Self {
            root,
            settings,
            write_failures: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn formats(&self) -> &[LogFormat] {
        &self.settings.formats
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures
    }

    pub fn main_target(&self) -> LogTarget {
        LogTarget(self.root.join(MAIN_LOG_STEM))
    }

    /// Every file an event of `category` in `session_id` at `at` goes to.
    pub fn targets(
        &self,
        category: AuditCategory,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Vec<LogTarget> {
        let mut targets = vec![self.main_target()];
        if self.settings.daily_partition {
            targets.push(LogTarget(
                self.root
                    .join("daily")
                    .join(format!("audit-{}", at.format("%Y-%m-%d"))),
            ));
        }
        if self.settings.session_partition {
            targets.push(LogTarget(self.root.join("sessions").join(session_id)));
        }
        if let Some(dir) = category.dedicated_dir() {
            targets.push(LogTarget(self.root.join(dir).join(MAIN_LOG_STEM)));
        }
        targets
    }

    /// Move aside every file of `targets` that has grown past the size limit.
    pub fn rotate_oversized(&self, targets: &[LogTarget], now: DateTime<Utc>) -> Vec<Rotation> {
        let suffix = now.format("%Y%m%dT%H%M%S%.3f").to_string();
        let mut rotations = Vec::new();

        for target in targets {
            let mut rotated_files = Vec::new();
            for format in &self.settings.formats {
                let path = target.path(*format);
                let oversized = std::fs::metadata(&path)
                    .map(|m| m.is_file() && m.len() > self.settings.max_file_bytes)
                    .unwrap_or(false);
                if !oversized {
                    continue;
                }

                let rotated = rotated_path(target, &suffix, *format);
                match std::fs::rename(&path, &rotated) {
                    Ok(()) => {
                        tracing::debug!(from = %path.display(), to = %rotated.display(), "Rotated audit log");
                        rotated_files.push(rotated);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to rotate audit log");
                    }
                }
            }
            if !rotated_files.is_empty() {
                rotations.push(Rotation {
                    target: target.clone(),
                    rotated_files,
                });
            }
        }

        rotations
    }

    /// Append `event` to every target in every format.
    pub fn write(&mut self, event: &AuditEvent, targets: &[LogTarget]) {
        for target in targets {
            for format in self.settings.formats.clone() {
                let path = target.path(format);
                if let Err(e) = append(&path, format, event) {
                    self.write_failures += 1;
                    tracing::warn!(
                        path = %path.display(),
                        %format,
                        sequence = event.sequence,
                        error = %e,
                        "Failed to write audit event"
                    );
                }
            }
        }
    }
}

/// `<stem>.<suffix>.<ext>`, with a counter when several rotations share a timestamp.
fn rotated_path(target: &LogTarget, suffix: &str, format: LogFormat) -> PathBuf {
    let stem = target.stem().display().to_string();
    let mut candidate = LogTarget(PathBuf::from(format!("{}.{}", stem, suffix))).path(format);
    let mut counter = 1;
    while candidate.exists() {
        candidate = LogTarget(PathBuf::from(format!("{}.{}-{}", stem, suffix, counter))).path(format);
        counter += 1;
    }
    candidate
}

fn append(path: &Path, format: LogFormat, event: &AuditEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        FsHandler::create_dir(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    match format {
        LogFormat::Jsonl => {
            let line = serde_json::to_string(event).context("Failed to serialize event")?;
            writeln!(file, "{}", line)?;
        }
        LogFormat::Text => {
            writeln!(file, "{}", event.to_text())?;
        }
        LogFormat::Csv => append_csv(file, event)?,
    }

    Ok(())
}

fn append_csv(file: File, event: &AuditEvent) -> Result<()> {
    let is_empty = file.metadata().map(|m| m.len() == 0).unwrap_or(true);
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_empty {
        writer.write_record(AuditEvent::CSV_HEADER)?;
    }
    writer.write_record(event.csv_record())?;
    writer.flush()?;
    Ok(())
}

/// Read every event from the main JSONL log, rotated files included, ordered by sequence
/// within each session.
pub fn read_events(root: &Path) -> Result<Vec<AuditEvent>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(root)
        .with_context(|| format!("Failed to read audit directory {}", root.display()))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            name.starts_with(MAIN_LOG_STEM) && name.ends_with(".jsonl")
        })
        .collect();
    files.sort();

    let mut events = Vec::new();
    for path in files {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(path = %path.display(), line = line_no + 1, error = %e, "Skipping unreadable audit line");
                }
            }
        }
    }

    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.session_id.cmp(&b.session_id))
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
    Ok(events)
}

#[cfg(test)]
mod tests {
    use serde_json::Map;
    use tempdir::TempDir;

    use super::*;
    use crate::audit::event::{EventType, Retention};

    fn event(sequence: u64, event_type: EventType) -> AuditEvent {
        let class = event_type.class();
        AuditEvent {
            sequence,
            session_id: "session-1".to_string(),
            timestamp: Utc::now(),
            event_type,
            level: class.level,
            category: class.category,
            retention: Retention::Standard,
            domain: Some("example.com".to_string()),
            deployment_id: None,
            details: Map::new(),
        }
    }

    #[test]
    fn test_targets_include_partitions_and_category() {
        let temp_dir = TempDir::new("edgeship-sink").expect("Failed to create temp dir");
        let sinks = LogSinks::new(temp_dir.path().to_path_buf(), AuditSettings::default()).unwrap();

        let targets = sinks.targets(AuditCategory::Security, "s1", Utc::now());
        assert_eq!(targets.len(), 4);
        assert!(targets[2].stem().ends_with("sessions/s1"));
        assert!(targets[3].stem().ends_with("security/audit"));

        let targets = sinks.targets(AuditCategory::Deployment, "s1", Utc::now());
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn test_write_all_formats() {
        let temp_dir = TempDir::new("edgeship-sink").expect("Failed to create temp dir");
        let mut sinks =
            LogSinks::new(temp_dir.path().to_path_buf(), AuditSettings::default()).unwrap();
        let main = sinks.main_target();

        sinks.write(&event(1, EventType::SessionStarted), std::slice::from_ref(&main));
        sinks.write(&event(2, EventType::PhaseStarted), std::slice::from_ref(&main));

        let csv = std::fs::read_to_string(main.path(LogFormat::Csv)).unwrap();
        assert_eq!(csv.lines().count(), 3, "header plus two rows");
        assert!(csv.starts_with("sequence,timestamp"));

        let text = std::fs::read_to_string(main.path(LogFormat::Text)).unwrap();
        assert_eq!(text.lines().count(), 2);

        let events = read_events(temp_dir.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(sinks.write_failures(), 0);
    }

    #[test]
    fn test_one_broken_format_does_not_block_others() {
        let temp_dir = TempDir::new("edgeship-sink").expect("Failed to create temp dir");
        let mut sinks =
            LogSinks::new(temp_dir.path().to_path_buf(), AuditSettings::default()).unwrap();
        let main = sinks.main_target();

        // A directory where the text log should be makes that single write fail.
        std::fs::create_dir_all(main.path(LogFormat::Text)).unwrap();
        sinks.write(&event(1, EventType::SessionStarted), std::slice::from_ref(&main));

        assert_eq!(sinks.write_failures(), 1);
        assert!(main.path(LogFormat::Jsonl).is_file());
        assert!(main.path(LogFormat::Csv).is_file());
    }

    #[test]
    fn test_rotate_only_oversized() {
        let temp_dir = TempDir::new("edgeship-sink").expect("Failed to create temp dir");
        let settings = AuditSettings {
            max_file_bytes: 10,
            formats: vec![LogFormat::Jsonl],
            ..AuditSettings::default()
        };
        let sinks = LogSinks::new(temp_dir.path().to_path_buf(), settings).unwrap();
        let main = sinks.main_target();

        assert!(sinks.rotate_oversized(std::slice::from_ref(&main), Utc::now()).is_empty());

        std::fs::write(main.path(LogFormat::Jsonl), "x".repeat(20)).unwrap();
        let rotations = sinks.rotate_oversized(std::slice::from_ref(&main), Utc::now());
        assert_eq!(rotations.len(), 1);
        assert!(!main.path(LogFormat::Jsonl).exists());
        assert!(rotations[0].rotated_files[0].is_file());
    }
}
