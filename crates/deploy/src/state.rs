//! Deployment configuration and per-session deployment state.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{credentials::Credentials, fs::FsHandler, rollback::RollbackRegistry};

/// Unique identifier of one deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Generate a fresh id such as `deploy-20250118t101500-brave-otter-3fa2`.
    pub fn generate() -> Self {
        let name = names::Generator::default()
            .next()
            .unwrap_or_else(|| "unnamed".to_string());
        let suffix: u16 = rand::rng().random();
        Self(format!(
            "deploy-{}-{}-{:04x}",
            Utc::now().format("%Y%m%dt%H%M%S"),
            name,
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Phases of one deployment, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Initializing,
    Credentials,
    Discovery,
    Database,
    Secrets,
    Validation,
    Assessment,
    Confirmation,
    Deployment,
    Verification,
    Rollback,
    Finished,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DeploymentStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeploymentStatus::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    /// Remote identifier. `None` only in dry runs where nothing was created.
    pub id: Option<String>,
    pub created: bool,
    pub reused: bool,
}

impl DatabaseConfig {
    pub fn is_resolved(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Secret values keyed by name.
    pub keys: BTreeMap<String, String>,
    pub distribution_path: Option<PathBuf>,
    pub reused: bool,
}

impl fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .field("distribution_path", &self.distribution_path)
            .field("reused", &self.reused)
            .finish()
    }
}

/// Everything the executor needs, built up phase by phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub domain: String,
    pub environment: String,
    pub worker: WorkerConfig,
    pub database: Option<DatabaseConfig>,
    /// Secret values stay in memory and in the secret material file only.
    #[serde(skip)]
    pub secrets: Option<SecretsConfig>,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

impl DeploymentConfig {
    pub fn new(domain: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            environment: environment.into(),
            ..Default::default()
        }
    }

    /// Identifiers that must be known before a real deploy may run.
    pub fn unresolved(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.credentials.is_none() {
            missing.push("credentials");
        }
        if self.worker.name.is_empty() {
            missing.push("worker name");
        }
        match &self.database {
            Some(db) if db.is_resolved() => {}
            _ => missing.push("database id"),
        }
        if self.secrets.is_none() {
            missing.push("secrets");
        }
        missing
    }
}

/// Mutable record of one deployment, owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub deployment_id: DeploymentId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub current_phase: Phase,
    pub status: DeploymentStatus,
    pub rollback: RollbackRegistry,
    pub config: DeploymentConfig,
    /// Phase in which the deployment failed, if it did.
    pub failed_phase: Option<Phase>,
}

impl DeploymentState {
    pub fn new(domain: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            deployment_id: DeploymentId::generate(),
            start_time: Utc::now(),
            end_time: None,
            current_phase: Phase::Initializing,
            status: DeploymentStatus::Running,
            rollback: RollbackRegistry::default(),
            config: DeploymentConfig::new(domain, environment),
            failed_phase: None,
        }
    }

    pub fn enter(&mut self, phase: Phase) {
        tracing::debug!(deployment_id = %self.deployment_id, %phase, "Entering phase");
        self.current_phase = phase;
    }

    /// Mark the deployment terminal. Later calls are ignored.
    pub fn finish(&mut self, status: DeploymentStatus) {
        if self.status.is_terminal() {
            return;
        }
        if status == DeploymentStatus::Failed {
            self.failed_phase = Some(self.current_phase);
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        if status == DeploymentStatus::Succeeded {
            self.current_phase = Phase::Finished;
        }
    }

    pub fn file_path(dir: &Path, id: &DeploymentId) -> PathBuf {
        dir.join(format!("{}.json", id))
    }

    /// Persist the state so a later `rollback` invocation can pick it up.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::file_path(dir, &self.deployment_id);
        FsHandler::write_json_atomic(&path, self)
            .with_context(|| format!("Failed to save deployment state {}", self.deployment_id))?;
        Ok(path)
    }

    pub fn load(dir: &Path, id: &DeploymentId) -> Result<Self> {
        let path = Self::file_path(dir, id);
        FsHandler::read_json(&path)?
            .with_context(|| format!("No saved state for deployment {} in {}", id, dir.display()))
    }
}
