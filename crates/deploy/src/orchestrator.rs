//! Drives one deployment through its phases.
//!
//! The orchestrator owns the [`DeploymentState`] of a run and hands the workflows what they
//! need: the platform, the operator, the rollback registry and the audit ledger. Any error
//! ends the run in the phase it happened in; the configured [`RollbackPolicy`] then decides
//! whether compensating actions are replayed right away. Cancellations never roll back.

use std::{fmt, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;

use crate::{
    assessment::{AssessmentProvider, NoAssessment, run_assessment},
    audit::{AuditLedger, AuditScope, DeploymentReport, EventType},
    config::{RollbackPolicy, Settings, VerifyMode},
    confirm::{ConfirmationGate, DeploymentSummary},
    credentials::{CredentialInputs, CredentialProvider, Credentials, TokenCache},
    database::DatabaseWorkflow,
    discovery::{
        ConfigOverrides, DiscoveredConfig, ResourceDiscovery, StoredConfig, merge_database_name,
        merge_worker_name,
    },
    error::{DeployError, ExitStatus},
    executor::DeploymentExecutor,
    operator::Operator,
    platform::Platform,
    process::CommandRunner,
    rollback::RollbackReport,
    secrets::SecretWorkflow,
    state::{DeploymentConfig, DeploymentId, DeploymentState, DeploymentStatus, Phase},
    validation::{ValidationContext, ValidationPipeline, ValidationReport},
    verify::{PostDeploymentVerifier, VerificationReport},
};

/// One deploy invocation as requested by the operator.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub domain: String,
    pub environment: String,
    pub dry_run: bool,
    /// Credential values given on the command line.
    pub explicit: CredentialInputs,
    pub overrides: ConfigOverrides,
    /// Overrides the configured policy.
    pub rollback_policy: Option<RollbackPolicy>,
    /// Overrides the configured verification mode.
    pub verify: Option<VerifyMode>,
    /// Treat binding mismatches as fatal.
    pub strict: bool,
    /// Skip the confirmation prompt.
    pub auto_approve: bool,
}

impl DeployRequest {
    pub fn new(domain: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            environment: environment.into(),
            ..Default::default()
        }
    }
}

/// Why a run stopped early.
#[derive(Debug)]
pub struct DeploymentFailure {
    pub phase: Phase,
    pub error: anyhow::Error,
    /// Present when compensating actions were replayed.
    pub rollback: Option<RollbackReport>,
    /// Actions still registered, to be replayed with `edgeship rollback`.
    pub pending_rollback: usize,
}

impl DeploymentFailure {
    pub fn remediation(&self) -> Option<String> {
        DeployError::find(&self.error).and_then(DeployError::remediation)
    }
}

impl fmt::Display for DeploymentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} phase failed: {:#}", self.phase, self.error)
    }
}

#[derive(Debug)]
pub struct DeploymentOutcome {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    pub url: Option<String>,
    pub verification: Option<VerificationReport>,
    pub failure: Option<DeploymentFailure>,
    pub report: Option<DeploymentReport>,
    pub state_path: Option<PathBuf>,
}

impl DeploymentOutcome {
    pub fn exit_status(&self) -> ExitStatus {
        if let Some(failure) = &self.failure {
            return ExitStatus::from_error(&failure.error);
        }
        match &self.verification {
            Some(report) if !report.passed() => ExitStatus::VerificationFailed,
            _ => ExitStatus::Success,
        }
    }
}

/// What a successful run of the phases produced.
struct Completed {
    url: Option<String>,
    verification: Option<VerificationReport>,
}

pub struct Orchestrator<'a, P: Platform, R: CommandRunner> {
    platform: &'a P,
    runner: &'a R,
    operator: &'a dyn Operator,
    settings: &'a Settings,
    credentials: CredentialProvider<'a, P>,
    env: CredentialInputs,
    assessment: Box<dyn AssessmentProvider>,
    vars: Option<Vec<(String, String)>>,
}

impl<'a, P: Platform, R: CommandRunner> Orchestrator<'a, P, R> {
    pub fn new(platform: &'a P, runner: &'a R, operator: &'a dyn Operator, settings: &'a Settings) -> Self {
        Self {
            platform,
            runner,
            operator,
            settings,
            credentials: CredentialProvider::new(platform, operator)
                .with_cache(TokenCache::new(settings.credential_cache_path())),
            env: CredentialInputs::from_env(),
            assessment: Box::new(NoAssessment),
            vars: None,
        }
    }

    pub fn with_assessment(mut self, provider: impl AssessmentProvider + 'static) -> Self {
        self.assessment = Box::new(provider);
        self
    }

    /// Replace the credential values read from the process environment.
    pub fn with_env_credentials(mut self, env: CredentialInputs) -> Self {
        self.env = env;
        self
    }

    /// Replace the allow-listed variables read from the process environment.
    pub fn with_vars(mut self, vars: Vec<(String, String)>) -> Self {
        self.vars = Some(vars);
        self
    }

    /// Run a full deployment. Never returns early: failures are reported in the outcome.
    pub async fn deploy(&mut self, request: &DeployRequest, ledger: &mut AuditLedger) -> DeploymentOutcome {
        let mut state = DeploymentState::new(&request.domain, &request.environment);
        let id = state.deployment_id.clone();
        let scope = AuditScope::deployment(&request.domain, id.clone());
        tracing::info!(deployment_id = %id, domain = %request.domain, environment = %request.environment, "Deployment started");
        ledger.begin_deployment(&id, &request.domain, &request.environment);

        let mut outcome = DeploymentOutcome {
            deployment_id: id.clone(),
            status: DeploymentStatus::Running,
            url: None,
            verification: None,
            failure: None,
            report: None,
            state_path: None,
        };

        match self.run_phases(request, &mut state, ledger, &scope).await {
            Ok(completed) => {
                state.config.worker.url = completed.url.clone();
                state.finish(DeploymentStatus::Succeeded);
                ledger.record(
                    EventType::DeploymentCompleted,
                    &scope,
                    json!({
                        "url": completed.url,
                        "dry_run": request.dry_run,
                        "verified": completed.verification.as_ref().map(VerificationReport::passed),
                    }),
                );
                if !request.dry_run {
                    self.store_config(&state);
                }
                outcome.url = completed.url;
                outcome.verification = completed.verification;
                tracing::info!(deployment_id = %id, url = ?outcome.url, "Deployment finished");
            }
            Err(error) => {
                let phase = state.current_phase;
                let message = format!("{:#}", error);
                ledger.phase_failed(&scope, phase, &message);

                if DeployError::find(&error).is_some_and(DeployError::is_cancellation) {
                    state.finish(DeploymentStatus::Cancelled);
                    tracing::warn!(deployment_id = %id, %phase, "Deployment cancelled");
                    outcome.failure = Some(DeploymentFailure {
                        phase,
                        error,
                        rollback: None,
                        pending_rollback: state.rollback.pending(),
                    });
                } else {
                    state.finish(DeploymentStatus::Failed);
                    tracing::error!(deployment_id = %id, %phase, error = %message, "Deployment failed");
                    ledger.record(
                        EventType::DeploymentFailed,
                        &scope,
                        json!({ "phase": phase, "error": message }),
                    );
                    let rollback = self
                        .apply_rollback_policy(request, &mut state, ledger, &scope)
                        .await;
                    outcome.failure = Some(DeploymentFailure {
                        phase,
                        error,
                        rollback,
                        pending_rollback: state.rollback.pending(),
                    });
                }
            }
        }

        outcome.status = state.status;
        ledger.end_deployment(&id, state.status);

        match state.save(&self.settings.deployments_dir()) {
            Ok(path) => outcome.state_path = Some(path),
            Err(e) => tracing::warn!(error = %format!("{:#}", e), "Failed to save deployment state"),
        }

        match ledger.generate_deployment_report(&id) {
            Ok((report, _)) => outcome.report = Some(report),
            Err(e) => tracing::warn!(error = %format!("{:#}", e), "Failed to write deployment report"),
        }

        outcome
    }

    async fn run_phases(
        &mut self,
        request: &DeployRequest,
        state: &mut DeploymentState,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Result<Completed> {
        let domain = request.domain.as_str();
        let environment = request.environment.as_str();

        enter(state, ledger, scope, Phase::Credentials);
        let creds = self
            .credentials
            .acquire(domain, request.explicit.clone(), self.env.clone(), ledger, scope)
            .await?;
        state.config.credentials = Some(creds.clone());
        ledger.phase_completed(scope, Phase::Credentials);

        enter(state, ledger, scope, Phase::Discovery);
        let discovered = self.discover(request, &creds, state, ledger, scope)?;
        ledger.phase_completed(scope, Phase::Discovery);

        enter(state, ledger, scope, Phase::Database);
        let suggested = merge_database_name(&request.overrides, &discovered, domain, environment);
        let database = DatabaseWorkflow::new(self.platform, self.operator, &creds)
            .dry_run(request.dry_run)
            .handle_database_setup(domain, environment, Some(&suggested), &mut state.rollback, ledger, scope)
            .await?;
        state.config.database = Some(database);
        self.checkpoint(state);
        ledger.phase_completed(scope, Phase::Database);

        enter(state, ledger, scope, Phase::Secrets);
        let worker = state.config.worker.name.clone();
        let secrets = SecretWorkflow::new(
            self.platform,
            self.operator,
            &creds,
            &self.settings.secrets,
            self.settings.secrets_dir(),
            self.settings.distribution_dir(),
        )
        .dry_run(request.dry_run)
        .handle_secret_management(domain, environment, &worker, &mut state.rollback, ledger, scope)
        .await?;
        state.config.secrets = Some(secrets);
        self.checkpoint(state);
        ledger.phase_completed(scope, Phase::Secrets);

        let executor = self.executor();

        enter(state, ledger, scope, Phase::Validation);
        let validation = self
            .validate_with(request, &creds, &discovered, &executor, &state.config, ledger, scope)
            .await?;
        self.operator.notify(&validation.to_string());
        ledger.phase_completed(scope, Phase::Validation);

        enter(state, ledger, scope, Phase::Assessment);
        let findings = run_assessment(self.assessment.as_ref(), &state.config, ledger, scope);
        ledger.phase_completed(scope, Phase::Assessment);

        enter(state, ledger, scope, Phase::Confirmation);
        let summary = DeploymentSummary::new(
            &state.config,
            &discovered,
            &state.rollback,
            findings.len(),
            request.dry_run,
        );
        ConfirmationGate::new(self.operator)
            .auto_approve(request.auto_approve)
            .confirm(&summary, ledger, scope)?;
        ledger.phase_completed(scope, Phase::Confirmation);

        enter(state, ledger, scope, Phase::Deployment);
        let deployed = executor
            .deploy(&state.config, &discovered, request.dry_run, ledger, scope)
            .await?;
        ledger.phase_completed(scope, Phase::Deployment);

        let verification = if request.dry_run {
            None
        } else {
            enter(state, ledger, scope, Phase::Verification);
            let mode = request.verify.unwrap_or(self.settings.deploy.verify);
            let report = PostDeploymentVerifier::new(
                self.platform,
                mode,
                Duration::from_millis(self.settings.deploy.max_latency_ms),
                &self.settings.retry,
            )
            .verify(deployed.url.as_deref(), ledger, scope)
            .await;
            self.operator.notify(&report.to_string());
            ledger.phase_completed(scope, Phase::Verification);
            Some(report)
        };

        Ok(Completed {
            url: deployed.url,
            verification,
        })
    }

    fn discover(
        &self,
        request: &DeployRequest,
        creds: &Credentials,
        state: &mut DeploymentState,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Result<DiscoveredConfig> {
        let discovered = ResourceDiscovery::new(&self.settings.project_dir, self.settings.stored_configs_dir())
            .discover(&request.domain, &request.environment)?;

        if let Some(stored_zone) = discovered.stored.as_ref().and_then(|s| s.zone_id.as_deref())
            && stored_zone != creds.zone_id
        {
            tracing::warn!(stored = stored_zone, resolved = %creds.zone_id, "Zone differs from the previous deployment");
        }

        state.config.worker.name = merge_worker_name(&request.overrides, &discovered, &request.domain);
        ledger.record(
            EventType::ResourcesDiscovered,
            scope,
            json!({
                "worker": state.config.worker.name,
                "manifest": discovered.manifest.as_ref().map(|m| m.path.display().to_string()),
                "manifest_source": discovered.manifest.as_ref().map(|m| m.source),
                "stored_config": discovered.stored.is_some(),
                "first_deployment": discovered.is_first_deployment(),
            }),
        );
        Ok(discovered)
    }

    #[allow(clippy::too_many_arguments)]
    async fn validate_with(
        &self,
        request: &DeployRequest,
        creds: &Credentials,
        discovered: &DiscoveredConfig,
        executor: &DeploymentExecutor<'_, R>,
        config: &DeploymentConfig,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Result<ValidationReport> {
        let mut settings = self.settings.validation.clone();
        settings.strict_bindings |= request.strict;

        let ctx = ValidationContext {
            creds,
            project_dir: &self.settings.project_dir,
            environment: &request.environment,
            discovered,
            dry_run_command: executor.command(config, discovered, true).ok(),
        };
        ValidationPipeline::new(
            self.platform,
            self.runner,
            &settings,
            &self.settings.platform,
            &self.settings.timeouts,
            &self.settings.retry,
        )
        .run(&ctx, ledger, scope)
        .await
    }

    fn executor(&self) -> DeploymentExecutor<'a, R> {
        let executor = DeploymentExecutor::new(
            self.runner,
            &self.settings.platform,
            &self.settings.deploy,
            &self.settings.timeouts,
            &self.settings.project_dir,
        );
        match &self.vars {
            Some(vars) => executor.with_vars(vars.clone()),
            None => executor,
        }
    }

    /// Persist the state so a crash leaves a replayable record of side effects.
    fn checkpoint(&self, state: &DeploymentState) {
        if state.rollback.is_empty() {
            return;
        }
        if let Err(e) = state.save(&self.settings.deployments_dir()) {
            tracing::warn!(error = %format!("{:#}", e), "Failed to checkpoint deployment state");
        }
    }

    fn store_config(&self, state: &DeploymentState) {
        let config = &state.config;
        let stored = StoredConfig {
            domain: config.domain.clone(),
            environment: config.environment.clone(),
            worker_name: Some(config.worker.name.clone()),
            worker_url: config.worker.url.clone(),
            database_name: config.database.as_ref().map(|db| db.name.clone()),
            database_id: config.database.as_ref().and_then(|db| db.id.clone()),
            account_id: config.credentials.as_ref().map(|c| c.account_id.clone()),
            zone_id: config.credentials.as_ref().map(|c| c.zone_id.clone()),
            updated_at: Some(Utc::now()),
        };
        match stored.save(&self.settings.stored_configs_dir()) {
            Ok(path) => tracing::debug!(path = %path.display(), "Stored configuration updated"),
            Err(e) => tracing::warn!(error = %format!("{:#}", e), "Failed to store configuration"),
        }
    }

    async fn apply_rollback_policy(
        &self,
        request: &DeployRequest,
        state: &mut DeploymentState,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Option<RollbackReport> {
        let pending = state.rollback.pending();
        if pending == 0 {
            return None;
        }
        let creds = state.config.credentials.clone()?;
        let policy = request
            .rollback_policy
            .unwrap_or(self.settings.deploy.rollback_policy);

        let replay = match policy {
            RollbackPolicy::Automatic => true,
            RollbackPolicy::Manual => false,
            RollbackPolicy::Prompt => self
                .operator
                .ask_yes_no(
                    &format!("{} change(s) were made before the failure. Roll them back now?", pending),
                    false,
                )
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "No rollback answer, leaving changes in place");
                    false
                }),
        };

        if !replay {
            let hint = format!("edgeship rollback {}", state.deployment_id);
            tracing::warn!(pending, %policy, "Changes left in place; run `{}` to undo them", hint);
            ledger.record(
                EventType::RollbackSkipped,
                scope,
                json!({ "policy": policy, "pending": pending, "hint": hint }),
            );
            return None;
        }

        state.enter(Phase::Rollback);
        ledger.phase_started(scope, Phase::Rollback);
        let report = state
            .rollback
            .replay(self.platform, &creds, ledger, scope)
            .await;
        if report.is_complete() {
            ledger.phase_completed(scope, Phase::Rollback);
        } else {
            ledger.phase_failed(scope, Phase::Rollback, &format!("{} action(s) failed", report.failed()));
        }
        self.operator.notify(&report.to_string());
        Some(report)
    }

    /// Replay the pending actions of a deployment recorded earlier.
    pub async fn rollback(
        &mut self,
        id: &DeploymentId,
        explicit: CredentialInputs,
        ledger: &mut AuditLedger,
    ) -> Result<RollbackReport> {
        let dir = self.settings.deployments_dir();
        let mut state = DeploymentState::load(&dir, id)?;
        let domain = state.config.domain.clone();
        let scope = AuditScope::deployment(&domain, id.clone());

        if state.rollback.pending() == 0 {
            tracing::info!(deployment_id = %id, "Nothing to roll back");
            return Ok(RollbackReport::default());
        }

        let creds = self
            .credentials
            .acquire(&domain, explicit, self.env.clone(), ledger, &scope)
            .await?;
        let report = state.rollback.replay(self.platform, &creds, ledger, &scope).await;
        state
            .save(&dir)
            .with_context(|| format!("Rolled back, but failed to update state of {}", id))?;
        Ok(report)
    }

    /// Run credentials, discovery and the validation pipeline only.
    pub async fn validate(&mut self, request: &DeployRequest, ledger: &mut AuditLedger) -> Result<ValidationReport> {
        let scope = AuditScope::domain(&request.domain);
        let mut state = DeploymentState::new(&request.domain, &request.environment);

        let creds = self
            .credentials
            .acquire(&request.domain, request.explicit.clone(), self.env.clone(), ledger, &scope)
            .await?;
        state.config.credentials = Some(creds.clone());
        let discovered = self.discover(request, &creds, &mut state, ledger, &scope)?;
        let executor = self.executor();
        self.validate_with(request, &creds, &discovered, &executor, &state.config, ledger, &scope)
            .await
    }
}

fn enter(state: &mut DeploymentState, ledger: &mut AuditLedger, scope: &AuditScope, phase: Phase) {
    state.enter(phase);
    ledger.phase_started(scope, phase);
}
