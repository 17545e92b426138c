//! Audit event taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::DeploymentId;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AuditLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AuditCategory {
    Deployment,
    Resource,
    Validation,
    /// Routed to the `security/` log as well.
    Security,
    /// Routed to the `compliance/` log as well.
    Compliance,
    System,
}

impl AuditCategory {
    /// Dedicated log directory for categories that get one.
    pub fn dedicated_dir(self) -> Option<&'static str> {
        match self {
            AuditCategory::Security => Some("security"),
            AuditCategory::Compliance => Some("compliance"),
            _ => None,
        }
    }
}

/// How long an event must be kept, in days. `Permanent` is never purged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Retention {
    Short,
    Standard,
    Extended,
    Permanent,
}

impl Retention {
    pub fn days(self) -> Option<u32> {
        match self {
            Retention::Short => Some(30),
            Retention::Standard => Some(90),
            Retention::Extended => Some(365),
            Retention::Permanent => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EventType {
    SessionStarted,
    SessionFinished,
    DeploymentStarted,
    DeploymentCompleted,
    DeploymentFailed,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    CredentialsResolved,
    CredentialsRejected,
    ResourcesDiscovered,
    DatabaseCreated,
    DatabaseReused,
    DatabaseDeleted,
    SecretsGenerated,
    SecretsReused,
    SecretDeployed,
    SecretDeployFailed,
    DistributionEmitted,
    ValidationPassed,
    ValidationFailed,
    ValidationSkipped,
    AssessmentFinding,
    ConfirmationApproved,
    UserCancelled,
    CommandExecuted,
    CommandFailed,
    RollbackRegistered,
    RollbackStarted,
    RollbackActionSucceeded,
    RollbackActionFailed,
    RollbackCompleted,
    RollbackSkipped,
    VerificationPassed,
    VerificationFailed,
    LogRotated,
}

/// Level, category and retention attached to every event of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventClass {
    pub level: AuditLevel,
    pub category: AuditCategory,
    pub retention: Retention,
}

impl EventType {
    pub fn class(self) -> EventClass {
        use AuditCategory as C;
        use AuditLevel as L;
        use EventType::*;
        use Retention as R;

        let (level, category, retention) = match self {
            SessionStarted | SessionFinished => (L::Info, C::System, R::Standard),
            LogRotated => (L::Debug, C::System, R::Short),
            DeploymentStarted | DeploymentCompleted => (L::Info, C::Deployment, R::Extended),
            DeploymentFailed => (L::Error, C::Deployment, R::Extended),
            PhaseStarted | PhaseCompleted => (L::Debug, C::Deployment, R::Short),
            PhaseFailed => (L::Error, C::Deployment, R::Standard),
            CredentialsResolved => (L::Info, C::Security, R::Extended),
            CredentialsRejected => (L::Error, C::Security, R::Permanent),
            ResourcesDiscovered => (L::Info, C::Resource, R::Standard),
            DatabaseCreated | DatabaseReused => (L::Info, C::Resource, R::Extended),
            DatabaseDeleted => (L::Warn, C::Compliance, R::Permanent),
            SecretsGenerated | SecretsReused | SecretDeployed => {
                (L::Info, C::Security, R::Extended)
            }
            SecretDeployFailed => (L::Error, C::Security, R::Permanent),
            DistributionEmitted => (L::Info, C::Security, R::Extended),
            ValidationPassed | ValidationSkipped => (L::Info, C::Validation, R::Standard),
            ValidationFailed => (L::Error, C::Validation, R::Standard),
            AssessmentFinding => (L::Warn, C::Compliance, R::Extended),
            ConfirmationApproved => (L::Info, C::Compliance, R::Permanent),
            UserCancelled => (L::Warn, C::Compliance, R::Permanent),
            CommandExecuted => (L::Info, C::Deployment, R::Standard),
            CommandFailed => (L::Error, C::Deployment, R::Extended),
            RollbackRegistered => (L::Debug, C::Resource, R::Standard),
            RollbackStarted | RollbackCompleted | RollbackActionSucceeded => {
                (L::Warn, C::Compliance, R::Permanent)
            }
            RollbackSkipped => (L::Warn, C::Compliance, R::Permanent),
            RollbackActionFailed => (L::Error, C::Compliance, R::Permanent),
            VerificationPassed => (L::Info, C::Deployment, R::Standard),
            VerificationFailed => (L::Warn, C::Deployment, R::Extended),
        };

        EventClass {
            level,
            category,
            retention,
        }
    }
}

/// One immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence: u64,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub level: AuditLevel,
    pub category: AuditCategory,
    pub retention: Retention,
    pub domain: Option<String>,
    pub deployment_id: Option<DeploymentId>,
    pub details: Map<String, Value>,
}

impl AuditEvent {
    /// Single-line plain-text rendering.
    pub fn to_text(&self) -> String {
        let mut line = format!(
            "{} [{}] #{} {} ({})",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.level.to_string().to_uppercase(),
            self.sequence,
            self.event_type,
            self.category,
        );
        if let Some(domain) = &self.domain {
            line.push_str(&format!(" domain={}", domain));
        }
        if let Some(id) = &self.deployment_id {
            line.push_str(&format!(" deployment={}", id));
        }
        for (key, value) in &self.details {
            match value {
                Value::String(s) => line.push_str(&format!(" {}={}", key, s)),
                other => line.push_str(&format!(" {}={}", key, other)),
            }
        }
        line
    }

    pub const CSV_HEADER: [&'static str; 9] = [
        "sequence",
        "timestamp",
        "session_id",
        "event_type",
        "level",
        "category",
        "domain",
        "deployment_id",
        "details",
    ];

    pub fn csv_record(&self) -> [String; 9] {
        [
            self.sequence.to_string(),
            self.timestamp.to_rfc3339(),
            self.session_id.clone(),
            self.event_type.to_string(),
            self.level.to_string(),
            self.category.to_string(),
            self.domain.clone().unwrap_or_default(),
            self.deployment_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            Value::Object(self.details.clone()).to_string(),
        ]
    }

    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }
}
