//! Multi-phase pre-deployment validation.
//!
//! Categories run in a fixed order and each yields exactly one [`ValidationResult`]. The first
//! failed category that cannot be skipped stops the pipeline; later categories produce no
//! result.

use std::{fmt, path::Path};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    audit::{AuditLedger, AuditScope, EventType},
    config::{PlatformSettings, RetrySettings, TimeoutSettings, ValidationSettings},
    credentials::Credentials,
    discovery::DiscoveredConfig,
    error::DeployError,
    platform::Platform,
    process::{CommandRunner, CommandSpec},
};

mod checks;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ValidationCategory {
    Prerequisites,
    Authentication,
    Network,
    Configuration,
    EndpointStructure,
    Readiness,
}

impl ValidationCategory {
    /// Pipeline order.
    pub const ALL: [ValidationCategory; 6] = [
        Self::Prerequisites,
        Self::Authentication,
        Self::Network,
        Self::Configuration,
        Self::EndpointStructure,
        Self::Readiness,
    ];

    /// Whether a failure here may be reported without stopping the pipeline. Only the
    /// endpoint probe qualifies, and only while no deployment of the target exists yet.
    pub fn is_skippable(self, discovered: &DiscoveredConfig) -> bool {
        self == Self::EndpointStructure && discovered.is_first_deployment()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValidationStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub category: ValidationCategory,
    pub status: ValidationStatus,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn new(category: ValidationCategory) -> Self {
        Self {
            category,
            status: ValidationStatus::Passed,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn skipped(category: ValidationCategory, reason: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Skipped,
            warnings: vec![reason.into()],
            ..Self::new(category)
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Settle the status from the collected errors.
    fn finish(mut self) -> Self {
        if !self.errors.is_empty() {
            self.status = ValidationStatus::Failed;
        }
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == ValidationStatus::Failed
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let icon = match self.status {
            ValidationStatus::Passed => "[ok]",
            ValidationStatus::Failed => "[FAILED]",
            ValidationStatus::Skipped => "[skipped]",
        };
        writeln!(f, "  {} {}", icon, self.category)?;
        for error in &self.errors {
            writeln!(f, "      error: {}", error)?;
        }
        for warning in &self.warnings {
            writeln!(f, "      warning: {}", warning)?;
        }
        Ok(())
    }
}

/// Results of a pipeline run that reached the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    pub fn warnings(&self) -> usize {
        self.results.iter().map(|r| r.warnings.len()).sum()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Validation:")?;
        for result in &self.results {
            write!(f, "{}", result)?;
        }
        Ok(())
    }
}

/// What the checks look at.
pub struct ValidationContext<'a> {
    pub creds: &'a Credentials,
    pub project_dir: &'a Path,
    pub environment: &'a str,
    pub discovered: &'a DiscoveredConfig,
    /// `deploy --dry-run` invocation for the readiness phase.
    pub dry_run_command: Option<CommandSpec>,
}

pub struct ValidationPipeline<'a, P: Platform, R: CommandRunner> {
    platform: &'a P,
    runner: &'a R,
    settings: &'a ValidationSettings,
    platform_settings: &'a PlatformSettings,
    timeouts: &'a TimeoutSettings,
    retry: &'a RetrySettings,
}

impl<'a, P: Platform, R: CommandRunner> ValidationPipeline<'a, P, R> {
    pub fn new(
        platform: &'a P,
        runner: &'a R,
        settings: &'a ValidationSettings,
        platform_settings: &'a PlatformSettings,
        timeouts: &'a TimeoutSettings,
        retry: &'a RetrySettings,
    ) -> Self {
        Self {
            platform,
            runner,
            settings,
            platform_settings,
            timeouts,
            retry,
        }
    }

    /// Run every category in order, stopping at the first fatal failure.
    pub async fn run(
        &self,
        ctx: &ValidationContext<'_>,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();

        for category in ValidationCategory::ALL {
            tracing::info!(%category, "Validating");
            let result = self.check(category, ctx).await;
            audit(&result, ledger, scope);

            if result.is_failed() && !category.is_skippable(ctx.discovered) {
                tracing::error!(%category, errors = ?result.errors, "Validation failed");
                return Err(DeployError::ValidationPhase {
                    category,
                    errors: result.errors,
                }
                .into());
            }
            for warning in &result.warnings {
                tracing::warn!(%category, "{}", warning);
            }
            report.results.push(result);
        }

        Ok(report)
    }

    async fn check(&self, category: ValidationCategory, ctx: &ValidationContext<'_>) -> ValidationResult {
        match category {
            ValidationCategory::Prerequisites => self.check_prerequisites().await,
            ValidationCategory::Authentication => self.check_authentication(ctx).await,
            ValidationCategory::Network => self.check_network().await,
            ValidationCategory::Configuration => self.check_configuration(ctx).await,
            ValidationCategory::EndpointStructure => self.check_endpoint_structure(ctx).await,
            ValidationCategory::Readiness => self.check_readiness(ctx).await,
        }
    }
}

fn audit(result: &ValidationResult, ledger: &mut AuditLedger, scope: &AuditScope) {
    let (event_type, details) = match result.status {
        ValidationStatus::Passed => (
            EventType::ValidationPassed,
            json!({ "category": result.category, "warnings": result.warnings }),
        ),
        ValidationStatus::Failed => (
            EventType::ValidationFailed,
            json!({
                "category": result.category,
                "errors": result.errors,
                "warnings": result.warnings,
            }),
        ),
        ValidationStatus::Skipped => (
            EventType::ValidationSkipped,
            json!({ "category": result.category, "reason": result.warnings.first() }),
        ),
    };
    ledger.record(event_type, scope, details);
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::{
        config::AuditSettings,
        discovery::{ResourceDiscovery, StoredConfig},
        testing::{FakePlatform, ScriptedRunner},
    };

    const MANIFEST: &str = r#"
name = "edge-api"
main = "src/index.ts"
compatibility_date = "2024-09-01"

[[d1_databases]]
binding = "DB"
database_name = "app-db"
database_id = "db-existing"
"#;

    fn creds() -> Credentials {
        Credentials {
            token: "tok".to_string(),
            account_id: FakePlatform::ACCOUNT_ID.to_string(),
            zone_id: FakePlatform::ZONE_ID.to_string(),
            zone_name: None,
        }
    }

    fn settings() -> ValidationSettings {
        ValidationSettings {
            min_free_disk_mb: 0,
            min_free_memory_mb: 0,
            ..ValidationSettings::default()
        }
    }

    fn fast_retry() -> RetrySettings {
        RetrySettings {
            attempts: 2,
            delay_ms: 1,
        }
    }

    struct Fixture {
        temp_dir: TempDir,
        ledger: AuditLedger,
    }

    fn fixture(manifest: &str) -> Fixture {
        let temp_dir = TempDir::new("edgeship-validation").expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join("wrangler.toml"), manifest).unwrap();
        let ledger = AuditLedger::open(temp_dir.path().join("audit"), &AuditSettings::default()).unwrap();
        Fixture { temp_dir, ledger }
    }

    fn node_ok() -> ScriptedRunner {
        ScriptedRunner::new().respond("node --version", 0, &["v20.11.1"])
    }

    fn validation_events(ledger: &AuditLedger) -> usize {
        ledger.session().count(EventType::ValidationPassed)
            + ledger.session().count(EventType::ValidationFailed)
            + ledger.session().count(EventType::ValidationSkipped)
    }

    #[tokio::test]
    async fn test_all_phases_pass_on_first_deployment() {
        let mut fx = fixture(MANIFEST);
        let platform = FakePlatform::new().with_database("app-db", "db-existing");
        let runner = node_ok();
        let settings = settings();
        let (platform_settings, timeouts, retry) = (PlatformSettings::default(), TimeoutSettings::default(), fast_retry());
        let discovered = ResourceDiscovery::new(fx.temp_dir.path(), fx.temp_dir.path().join("configs"))
            .discover("example.com", "production")
            .unwrap();
        let creds = creds();
        let ctx = ValidationContext {
            creds: &creds,
            project_dir: fx.temp_dir.path(),
            environment: "production",
            discovered: &discovered,
            dry_run_command: Some(CommandSpec::new("wrangler", ["deploy", "--dry-run"])),
        };

        let report = ValidationPipeline::new(&platform, &runner, &settings, &platform_settings, &timeouts, &retry)
            .run(&ctx, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap();

        assert_eq!(report.results.len(), 6);
        let endpoint = &report.results[4];
        assert_eq!(endpoint.category, ValidationCategory::EndpointStructure);
        assert_eq!(endpoint.status, ValidationStatus::Skipped);
        assert!(report.results.iter().all(|r| !r.is_failed()));
        assert_eq!(runner.count("deploy --dry-run"), 1);
        assert_eq!(validation_events(&fx.ledger), 6);
    }

    #[tokio::test]
    async fn test_prerequisite_failure_stops_pipeline() {
        let mut fx = fixture(MANIFEST);
        let platform = FakePlatform::new();
        let runner = node_ok().without_program("wrangler");
        let settings = settings();
        let (platform_settings, timeouts, retry) = (PlatformSettings::default(), TimeoutSettings::default(), fast_retry());
        let discovered = DiscoveredConfig::default();
        let creds = creds();
        let ctx = ValidationContext {
            creds: &creds,
            project_dir: fx.temp_dir.path(),
            environment: "production",
            discovered: &discovered,
            dry_run_command: None,
        };

        let err = ValidationPipeline::new(&platform, &runner, &settings, &platform_settings, &timeouts, &retry)
            .run(&ctx, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap_err();

        match DeployError::find(&err) {
            Some(DeployError::ValidationPhase { category, errors }) => {
                assert_eq!(*category, ValidationCategory::Prerequisites);
                assert!(errors[0].contains("wrangler"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(validation_events(&fx.ledger), 1);
        assert_eq!(platform.call_count(), 0);
    }

    #[tokio::test]
    async fn test_old_node_version_fails() {
        let mut fx = fixture(MANIFEST);
        let platform = FakePlatform::new();
        let runner = ScriptedRunner::new().respond("node --version", 0, &["v16.20.0"]);
        let settings = settings();
        let (platform_settings, timeouts, retry) = (PlatformSettings::default(), TimeoutSettings::default(), fast_retry());
        let discovered = DiscoveredConfig::default();
        let creds = creds();
        let ctx = ValidationContext {
            creds: &creds,
            project_dir: fx.temp_dir.path(),
            environment: "production",
            discovered: &discovered,
            dry_run_command: None,
        };

        let err = ValidationPipeline::new(&platform, &runner, &settings, &platform_settings, &timeouts, &retry)
            .run(&ctx, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("v16"));
    }

    #[tokio::test]
    async fn test_missing_whoami_is_a_warning() {
        let mut fx = fixture(MANIFEST);
        let platform = FakePlatform::new()
            .with_database("app-db", "db-existing")
            .with_whoami(None);
        let runner = node_ok();
        let settings = settings();
        let (platform_settings, timeouts, retry) = (PlatformSettings::default(), TimeoutSettings::default(), fast_retry());
        let discovered = ResourceDiscovery::new(fx.temp_dir.path(), fx.temp_dir.path().join("configs"))
            .discover("example.com", "production")
            .unwrap();
        let creds = creds();
        let ctx = ValidationContext {
            creds: &creds,
            project_dir: fx.temp_dir.path(),
            environment: "production",
            discovered: &discovered,
            dry_run_command: None,
        };

        let report = ValidationPipeline::new(&platform, &runner, &settings, &platform_settings, &timeouts, &retry)
            .run(&ctx, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap();
        let auth = &report.results[1];
        assert_eq!(auth.status, ValidationStatus::Passed);
        assert_eq!(auth.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_binding_mismatch_warns_or_fails_in_strict_mode() {
        let manifest = MANIFEST.replace("app-db", "missing-db");
        let mut fx = fixture(&manifest);
        let platform = FakePlatform::new();
        let runner = node_ok();
        let (platform_settings, timeouts, retry) = (PlatformSettings::default(), TimeoutSettings::default(), fast_retry());
        let discovered = ResourceDiscovery::new(fx.temp_dir.path(), fx.temp_dir.path().join("configs"))
            .discover("example.com", "production")
            .unwrap();
        let creds = creds();
        let ctx = ValidationContext {
            creds: &creds,
            project_dir: fx.temp_dir.path(),
            environment: "production",
            discovered: &discovered,
            dry_run_command: None,
        };

        let lenient = settings();
        let report = ValidationPipeline::new(&platform, &runner, &lenient, &platform_settings, &timeouts, &retry)
            .run(&ctx, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap();
        let config = &report.results[3];
        assert_eq!(config.category, ValidationCategory::Configuration);
        assert!(config.warnings.iter().any(|w| w.contains("not found")));

        let strict = ValidationSettings {
            strict_bindings: true,
            ..settings()
        };
        let err = ValidationPipeline::new(&platform, &runner, &strict, &platform_settings, &timeouts, &retry)
            .run(&ctx, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap_err();
        assert!(matches!(
            DeployError::find(&err),
            Some(DeployError::ValidationPhase {
                category: ValidationCategory::Configuration,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_missing_mandatory_key_fails() {
        let mut fx = fixture("name = \"edge-api\"\n");
        let platform = FakePlatform::new();
        let runner = node_ok();
        let settings = settings();
        let (platform_settings, timeouts, retry) = (PlatformSettings::default(), TimeoutSettings::default(), fast_retry());
        let discovered = ResourceDiscovery::new(fx.temp_dir.path(), fx.temp_dir.path().join("configs"))
            .discover("example.com", "production")
            .unwrap();
        let creds = creds();
        let ctx = ValidationContext {
            creds: &creds,
            project_dir: fx.temp_dir.path(),
            environment: "production",
            discovered: &discovered,
            dry_run_command: None,
        };

        let err = ValidationPipeline::new(&platform, &runner, &settings, &platform_settings, &timeouts, &retry)
            .run(&ctx, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("configuration"));
        assert!(message.contains("main"));
    }

    #[tokio::test]
    async fn test_missing_manifest_is_a_warning() {
        let temp_dir = TempDir::new("edgeship-validation").expect("Failed to create temp dir");
        let mut ledger = AuditLedger::open(temp_dir.path().join("audit"), &AuditSettings::default()).unwrap();
        let platform = FakePlatform::new();
        let runner = node_ok();
        let settings = settings();
        let (platform_settings, timeouts, retry) = (PlatformSettings::default(), TimeoutSettings::default(), fast_retry());
        let discovered = ResourceDiscovery::new(temp_dir.path(), temp_dir.path().join("configs"))
            .discover("example.com", "production")
            .unwrap();
        let creds = creds();
        let ctx = ValidationContext {
            creds: &creds,
            project_dir: temp_dir.path(),
            environment: "production",
            discovered: &discovered,
            dry_run_command: None,
        };

        let report = ValidationPipeline::new(&platform, &runner, &settings, &platform_settings, &timeouts, &retry)
            .run(&ctx, &mut ledger, &AuditScope::none())
            .await
            .unwrap();
        let config = &report.results[3];
        assert_eq!(config.status, ValidationStatus::Passed);
        assert!(config.warnings.iter().any(|w| w.contains("deploying with defaults")));
    }

    #[tokio::test]
    async fn test_unhealthy_live_endpoint_stops_later_deployments() {
        let mut fx = fixture(MANIFEST);
        let configs = fx.temp_dir.path().join("configs");
        StoredConfig {
            domain: "example.com".to_string(),
            environment: "production".to_string(),
            worker_url: Some("https://edge-api.workers.dev".to_string()),
            ..Default::default()
        }
        .save(&configs)
        .unwrap();

        let platform = FakePlatform::new()
            .with_database("app-db", "db-existing")
            .with_probe_status(Some(503));
        let runner = node_ok();
        let settings = ValidationSettings {
            endpoints: Vec::new(),
            ..settings()
        };
        let (platform_settings, timeouts, retry) = (PlatformSettings::default(), TimeoutSettings::default(), fast_retry());
        let discovered = ResourceDiscovery::new(fx.temp_dir.path(), &configs)
            .discover("example.com", "production")
            .unwrap();
        let creds = creds();
        let ctx = ValidationContext {
            creds: &creds,
            project_dir: fx.temp_dir.path(),
            environment: "production",
            discovered: &discovered,
            dry_run_command: None,
        };

        assert!(!discovered.is_first_deployment());
        let err = ValidationPipeline::new(&platform, &runner, &settings, &platform_settings, &timeouts, &retry)
            .run(&ctx, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap_err();
        assert!(matches!(
            DeployError::find(&err),
            Some(DeployError::ValidationPhase {
                category: ValidationCategory::EndpointStructure,
                ..
            })
        ));
        assert_eq!(platform.calls_to("probe:https://edge-api.workers.dev/health"), 1);
        assert_eq!(ledger_readiness(&fx.ledger), 0);
    }

    fn ledger_readiness(ledger: &AuditLedger) -> usize {
        ledger
            .session()
            .events
            .iter()
            .filter(|e| e.details.get("category").is_some_and(|c| c == "readiness"))
            .count()
    }

    #[test]
    fn test_endpoint_structure_skippable_only_before_first_deployment() {
        let first = DiscoveredConfig::default();
        assert!(first.is_first_deployment());
        assert!(ValidationCategory::EndpointStructure.is_skippable(&first));
        assert!(!ValidationCategory::Readiness.is_skippable(&first));
    }
}
