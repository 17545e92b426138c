//! Compensating actions for remote side effects.
//!
//! Workflows register one action right after each reversible mutation succeeds. Actions are
//! never edited; a replay undoes them newest first and keeps going past failures.

use std::{collections::BTreeSet, fmt, path::PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    audit::{AuditLedger, AuditScope, EventType},
    credentials::Credentials,
    platform::Platform,
};

/// Resource kind used for managed databases.
pub const DATABASE_RESOURCE: &str = "database";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RollbackKind {
    DeleteResource,
    DeleteSecret,
    RemoveLocalFile,
}

/// What a compensating action undoes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RollbackTarget {
    DeleteResource {
        resource: String,
        name: String,
        id: Option<String>,
    },
    DeleteSecret {
        worker: String,
        key: String,
    },
    RemoveLocalFile {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackAction {
    pub target: RollbackTarget,
    pub description: String,
    pub registered_at: DateTime<Utc>,
}

impl RollbackAction {
    fn new(target: RollbackTarget, description: String) -> Self {
        Self {
            target,
            description,
            registered_at: Utc::now(),
        }
    }

    pub fn delete_database(name: impl Into<String>, id: Option<String>) -> Self {
        let name = name.into();
        let description = format!("delete database '{}'", name);
        Self::new(
            RollbackTarget::DeleteResource {
                resource: DATABASE_RESOURCE.to_string(),
                name,
                id,
            },
            description,
        )
    }

    pub fn delete_secret(worker: impl Into<String>, key: impl Into<String>) -> Self {
        let (worker, key) = (worker.into(), key.into());
        let description = format!("delete secret {} from worker '{}'", key, worker);
        Self::new(RollbackTarget::DeleteSecret { worker, key }, description)
    }

    pub fn remove_local_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let description = format!("remove {}", path.display());
        Self::new(RollbackTarget::RemoveLocalFile { path }, description)
    }

    pub fn kind(&self) -> RollbackKind {
        match self.target {
            RollbackTarget::DeleteResource { .. } => RollbackKind::DeleteResource,
            RollbackTarget::DeleteSecret { .. } => RollbackKind::DeleteSecret,
            RollbackTarget::RemoveLocalFile { .. } => RollbackKind::RemoveLocalFile,
        }
    }

    async fn undo<P: Platform>(&self, platform: &P, creds: &Credentials) -> Result<()> {
        match &self.target {
            RollbackTarget::DeleteResource { resource, name, .. } => {
                if resource != DATABASE_RESOURCE {
                    anyhow::bail!("Don't know how to delete a {} resource", resource);
                }
                platform.delete_database(creds, name).await
            }
            RollbackTarget::DeleteSecret { worker, key } => {
                platform.delete_secret(creds, worker, key).await
            }
            RollbackTarget::RemoveLocalFile { path } => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

/// Ordered, append-only list of compensating actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRegistry {
    actions: Vec<RollbackAction>,
    /// Indexes of actions already undone by an earlier replay.
    #[serde(default)]
    undone: BTreeSet<usize>,
}

impl RollbackRegistry {
    pub fn register(&mut self, action: RollbackAction) {
        tracing::debug!(action = %action.description, "Rollback action registered");
        self.actions.push(action);
    }

    /// Register and record the registration in the ledger.
    pub fn register_audited(
        &mut self,
        action: RollbackAction,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) {
        ledger.record(
            EventType::RollbackRegistered,
            scope,
            json!({ "kind": action.kind(), "action": action.description }),
        );
        self.register(action);
    }

    pub fn actions(&self) -> &[RollbackAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn count(&self, kind: RollbackKind) -> usize {
        self.actions.iter().filter(|a| a.kind() == kind).count()
    }

    /// Actions not yet undone.
    pub fn pending(&self) -> usize {
        self.actions.len() - self.undone.len()
    }

    /// Undo every pending action, most recent first.
    ///
    /// A failed action is recorded and the remaining ones are still attempted. Actions that
    /// succeed are not attempted again by later replays.
    pub async fn replay<P: Platform>(
        &mut self,
        platform: &P,
        creds: &Credentials,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> RollbackReport {
        let pending = self.pending();
        tracing::warn!(pending, "Rolling back");
        ledger.record(
            EventType::RollbackStarted,
            scope,
            json!({ "pending": pending }),
        );

        let mut report = RollbackReport::default();
        for (index, action) in self.actions.iter().enumerate().rev() {
            if self.undone.contains(&index) {
                continue;
            }

            match action.undo(platform, creds).await {
                Ok(()) => {
                    tracing::info!(action = %action.description, "Rolled back");
                    ledger.record(
                        EventType::RollbackActionSucceeded,
                        scope,
                        json!({ "kind": action.kind(), "action": action.description }),
                    );
                    self.undone.insert(index);
                    report.outcomes.push(RollbackOutcome {
                        description: action.description.clone(),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::error!(action = %action.description, error = %e, "Rollback action failed");
                    ledger.record(
                        EventType::RollbackActionFailed,
                        scope,
                        json!({
                            "kind": action.kind(),
                            "action": action.description,
                            "error": format!("{:#}", e),
                        }),
                    );
                    report.outcomes.push(RollbackOutcome {
                        description: action.description.clone(),
                        error: Some(format!("{:#}", e)),
                    });
                }
            }
        }

        ledger.record(
            EventType::RollbackCompleted,
            scope,
            json!({ "succeeded": report.succeeded(), "failed": report.failed() }),
        );
        report
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub description: String,
    pub error: Option<String>,
}

/// Outcome of one replay, in the order actions were attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub outcomes: Vec<RollbackOutcome>,
}

impl RollbackReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_complete() {
            "COMPLETE"
        } else {
            "INCOMPLETE"
        };
        writeln!(f, "Rollback Status: {}", status)?;
        if self.outcomes.is_empty() {
            writeln!(f, "  nothing to roll back")?;
        }
        for outcome in &self.outcomes {
            match &outcome.error {
                None => writeln!(f, "  [ok] {}", outcome.description)?,
                Some(error) => writeln!(f, "  [FAILED] {}: {}", outcome.description, error)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::{config::AuditSettings, testing::FakePlatform};

    fn creds() -> Credentials {
        Credentials {
            token: "tok".to_string(),
            account_id: "acc".to_string(),
            zone_id: "zone".to_string(),
            zone_name: None,
        }
    }

    #[tokio::test]
    async fn test_replay_runs_in_reverse_order() {
        let temp_dir = TempDir::new("edgeship-rollback").expect("Failed to create temp dir");
        let mut ledger =
            AuditLedger::open(temp_dir.path().join("audit"), &AuditSettings::default()).unwrap();
        let platform = FakePlatform::new().with_database("app-db", "db-1");

        let mut registry = RollbackRegistry::default();
        registry.register(RollbackAction::delete_database("app-db", Some("db-1".to_string())));
        registry.register(RollbackAction::delete_secret("api", "API_SECRET"));
        registry.register(RollbackAction::delete_secret("api", "JWT_SECRET"));

        let report = registry
            .replay(&platform, &creds(), &mut ledger, &AuditScope::none())
            .await;

        assert!(report.is_complete());
        assert_eq!(
            platform.calls(),
            vec![
                "delete_secret:api:JWT_SECRET".to_string(),
                "delete_secret:api:API_SECRET".to_string(),
                "delete_database:app-db".to_string(),
            ]
        );
        assert_eq!(registry.pending(), 0);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_replay() {
        let temp_dir = TempDir::new("edgeship-rollback").expect("Failed to create temp dir");
        let mut ledger =
            AuditLedger::open(temp_dir.path().join("audit"), &AuditSettings::default()).unwrap();
        // The database does not exist remotely, so deleting it fails.
        let platform = FakePlatform::new();

        let mut registry = RollbackRegistry::default();
        registry.register(RollbackAction::delete_database("gone-db", None));
        registry.register(RollbackAction::delete_secret("api", "API_SECRET"));

        let report = registry
            .replay(&platform, &creds(), &mut ledger, &AuditScope::none())
            .await;

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(registry.pending(), 1);
        assert_eq!(ledger.session().count(EventType::RollbackActionFailed), 1);
        let rendered = report.to_string();
        assert!(rendered.contains("INCOMPLETE"));
        assert!(rendered.contains("[FAILED] delete database 'gone-db'"));

        // A second replay only retries what is still pending.
        let platform = FakePlatform::new().with_database("gone-db", "db-9");
        let report = registry
            .replay(&platform, &creds(), &mut ledger, &AuditScope::none())
            .await;
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_remove_local_file() {
        let temp_dir = TempDir::new("edgeship-rollback").expect("Failed to create temp dir");
        let mut ledger =
            AuditLedger::open(temp_dir.path().join("audit"), &AuditSettings::default()).unwrap();
        let file = temp_dir.path().join("material.json");
        std::fs::write(&file, "{}").unwrap();

        let mut registry = RollbackRegistry::default();
        registry.register(RollbackAction::remove_local_file(&file));
        registry.register(RollbackAction::remove_local_file(temp_dir.path().join("missing")));

        let report = registry
            .replay(&FakePlatform::new(), &creds(), &mut ledger, &AuditScope::none())
            .await;
        assert!(report.is_complete());
        assert!(!file.exists());
    }

    #[test]
    fn test_serialized_form_is_tagged() {
        let action = RollbackAction::delete_secret("api", "API_SECRET");
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["target"]["kind"], "delete-secret");
        assert_eq!(action.kind(), RollbackKind::DeleteSecret);
    }
}
