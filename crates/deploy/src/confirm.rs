//! Operator approval before the deploy command runs.

use std::fmt;

use anyhow::Result;
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use serde_json::json;

use crate::{
    audit::{AuditLedger, AuditScope, EventType},
    discovery::DiscoveredConfig,
    error::DeployError,
    operator::Operator,
    rollback::RollbackRegistry,
    state::DeploymentConfig,
};

/// What is about to happen, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSummary {
    pub domain: String,
    pub environment: String,
    pub worker: String,
    pub manifest: Option<String>,
    pub database: String,
    pub secrets: String,
    pub pending_rollback: usize,
    pub findings: usize,
    pub dry_run: bool,
}

impl DeploymentSummary {
    pub fn new(
        config: &DeploymentConfig,
        discovered: &DiscoveredConfig,
        registry: &RollbackRegistry,
        findings: usize,
        dry_run: bool,
    ) -> Self {
        let database = match &config.database {
            Some(db) => {
                let state = if db.created {
                    "created"
                } else if db.reused {
                    "reused"
                } else {
                    "not created (dry run)"
                };
                format!("{} ({})", db.name, state)
            }
            None => "-".to_string(),
        };
        let secrets = match &config.secrets {
            Some(secrets) => format!(
                "{} key(s), {}",
                secrets.keys.len(),
                if secrets.reused { "reused" } else { "new" }
            ),
            None => "-".to_string(),
        };

        Self {
            domain: config.domain.clone(),
            environment: config.environment.clone(),
            worker: config.worker.name.clone(),
            manifest: discovered
                .deploy_manifest()
                .map(|m| m.path.display().to_string()),
            database,
            secrets,
            pending_rollback: registry.pending(),
            findings,
            dry_run,
        }
    }
}

impl fmt::Display for DeploymentSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_header(vec!["Pending deployment", ""]);
        table.add_row(vec!["Domain", self.domain.as_str()]);
        table.add_row(vec!["Environment", self.environment.as_str()]);
        table.add_row(vec!["Worker", self.worker.as_str()]);
        table.add_row(vec!["Manifest", self.manifest.as_deref().unwrap_or("-")]);
        table.add_row(vec!["Database", self.database.as_str()]);
        table.add_row(vec!["Secrets", self.secrets.as_str()]);
        table.add_row(vec![
            "Rollback actions".to_string(),
            self.pending_rollback.to_string(),
        ]);
        if self.findings > 0 {
            table.add_row(vec!["Assessment findings".to_string(), self.findings.to_string()]);
        }
        if self.dry_run {
            table.add_row(vec!["Mode", "dry run"]);
        }
        write!(f, "{}", table)
    }
}

pub struct ConfirmationGate<'a> {
    operator: &'a dyn Operator,
    auto_approve: bool,
}

impl<'a> ConfirmationGate<'a> {
    pub fn new(operator: &'a dyn Operator) -> Self {
        Self {
            operator,
            auto_approve: false,
        }
    }

    pub fn auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    /// Show `summary` and require an explicit yes. Declining raises
    /// [`DeployError::UserCancelled`].
    pub fn confirm(
        &self,
        summary: &DeploymentSummary,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Result<()> {
        self.operator.notify(&summary.to_string());

        if self.auto_approve || !self.operator.is_interactive() {
            tracing::info!("Deployment approved automatically");
            ledger.record(EventType::ConfirmationApproved, scope, json!({ "automatic": true }));
            return Ok(());
        }

        let question = format!(
            "Deploy worker '{}' to {} ({})?",
            summary.worker, summary.domain, summary.environment
        );
        if self.operator.ask_yes_no(&question, false)? {
            ledger.record(EventType::ConfirmationApproved, scope, json!({ "automatic": false }));
            return Ok(());
        }

        tracing::warn!("Deployment declined by operator");
        ledger.record(
            EventType::UserCancelled,
            scope,
            json!({ "phase": "confirmation" }),
        );
        Err(DeployError::UserCancelled("deployment declined at confirmation".to_string()).into())
    }
}
