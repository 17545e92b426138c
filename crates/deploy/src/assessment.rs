//! Optional pre-deployment assessment hook.
//!
//! Embedders can plug in their own checks (cost estimates, policy rules, ...) by implementing
//! [`AssessmentProvider`]. Findings never block a deployment; they are logged and audited.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    audit::{AuditLedger, AuditScope, EventType},
    state::DeploymentConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FindingSeverity {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: FindingSeverity,
    pub message: String,
}

impl Finding {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: FindingSeverity::Warning,
            message: message.into(),
        }
    }
}

pub trait AssessmentProvider: Send + Sync {
    fn name(&self) -> &str;

    fn assess(&self, config: &DeploymentConfig) -> Result<Vec<Finding>>;
}

/// Finds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAssessment;

impl AssessmentProvider for NoAssessment {
    fn name(&self) -> &str {
        "none"
    }

    fn assess(&self, _config: &DeploymentConfig) -> Result<Vec<Finding>> {
        Ok(Vec::new())
    }
}

/// Run `provider` and record its findings. A failing provider is reported and ignored.
pub fn run_assessment(
    provider: &dyn AssessmentProvider,
    config: &DeploymentConfig,
    ledger: &mut AuditLedger,
    scope: &AuditScope,
) -> Vec<Finding> {
    let findings = match provider.assess(config) {
        Ok(findings) => findings,
        Err(e) => {
            tracing::warn!(provider = provider.name(), error = %format!("{:#}", e), "Assessment failed");
            return Vec::new();
        }
    };

    for finding in &findings {
        tracing::warn!(provider = provider.name(), severity = %finding.severity, "{}", finding.message);
        ledger.record(
            EventType::AssessmentFinding,
            scope,
            json!({
                "provider": provider.name(),
                "severity": finding.severity,
                "message": finding.message,
            }),
        );
    }
    findings
}
