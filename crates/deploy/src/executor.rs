//! Runs the provider CLI deploy command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::json;

use crate::{
    audit::{AuditLedger, AuditScope, EventType},
    config::{DeploySettings, PlatformSettings, TimeoutSettings},
    discovery::DiscoveredConfig,
    platform::WranglerCmdBuilder,
    process::{CommandRunner, CommandSpec},
    state::DeploymentConfig,
    url_extract::{UrlSources, extract_url},
};

/// Allow-listed variables that are set (and non-empty) in the environment, in allow-list order.
pub fn allowed_vars(
    allowlist: &[String],
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<(String, String)> {
    allowlist
        .iter()
        .filter_map(|key| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .map(|value| (key.clone(), value))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub url: Option<String>,
    pub dry_run: bool,
    pub output: Vec<String>,
}

pub struct DeploymentExecutor<'a, R: CommandRunner> {
    runner: &'a R,
    platform_settings: &'a PlatformSettings,
    deploy_settings: &'a DeploySettings,
    timeouts: &'a TimeoutSettings,
    project_dir: PathBuf,
    vars: Vec<(String, String)>,
}

impl<'a, R: CommandRunner> DeploymentExecutor<'a, R> {
    /// Variables are read from the process environment.
    pub fn new(
        runner: &'a R,
        platform_settings: &'a PlatformSettings,
        deploy_settings: &'a DeploySettings,
        timeouts: &'a TimeoutSettings,
        project_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            platform_settings,
            deploy_settings,
            timeouts,
            project_dir: project_dir.into(),
            vars: allowed_vars(&deploy_settings.var_allowlist, |key| std::env::var(key).ok()),
        }
    }

    pub fn with_vars(mut self, vars: Vec<(String, String)>) -> Self {
        self.vars = vars;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// The deploy invocation for `config`, using the most specific discovered manifest.
    ///
    /// Without a manifest the worker name and entry point are passed on the command line.
    pub fn command(
        &self,
        config: &DeploymentConfig,
        discovered: &DiscoveredConfig,
        dry_run: bool,
    ) -> Result<CommandSpec> {
        let creds = config
            .credentials
            .as_ref()
            .context("Credentials must be resolved before building the deploy command")?;

        let mut builder = WranglerCmdBuilder::deploy().dry_run(dry_run);
        if let Some(manifest) = discovered.deploy_manifest() {
            if manifest.is_non_default_path() {
                builder = builder.config(&manifest.path);
            }
            let env = manifest
                .declares_environment(&config.environment)
                .then(|| config.environment.clone());
            builder = builder.env(env);
        } else {
            let main = discovered
                .manifest
                .as_ref()
                .and_then(|m| m.main.clone())
                .unwrap_or_else(|| self.deploy_settings.default_main.clone());
            builder = builder
                .name(&config.worker.name)
                .compatibility_date(&self.deploy_settings.default_compatibility_date)
                .script(main);
        }
        for (key, value) in &self.vars {
            builder = builder.var(key, value);
        }

        Ok(creds
            .inject(CommandSpec::new(&self.platform_settings.cli_program, builder.build()))
            .current_dir(&self.project_dir)
            .timeout(self.timeouts.deploy())
            .stream(true))
    }

    /// Run the deploy. Never retried: a failed deploy may still have changed remote state.
    pub async fn deploy(
        &self,
        config: &DeploymentConfig,
        discovered: &DiscoveredConfig,
        dry_run: bool,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Result<DeployOutcome> {
        if !dry_run {
            let unresolved = config.unresolved();
            if !unresolved.is_empty() {
                anyhow::bail!(
                    "Refusing to deploy with unresolved {}",
                    unresolved.join(", ")
                );
            }
        }

        let spec = self.command(config, discovered, dry_run)?;
        let command = redacted_command_line(&spec);
        tracing::info!(%command, worker = %config.worker.name, "Deploying");

        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(e) => {
                ledger.record(
                    EventType::CommandFailed,
                    scope,
                    json!({ "command": command, "error": format!("{:#}", e) }),
                );
                return Err(e);
            }
        };

        if !output.success() {
            ledger.record(
                EventType::CommandFailed,
                scope,
                json!({
                    "command": command,
                    "exit_code": output.exit_code,
                    "timed_out": output.timed_out,
                }),
            );
        }
        let output = output.check(&spec)?;

        ledger.record(
            EventType::CommandExecuted,
            scope,
            json!({
                "command": command,
                "dry_run": dry_run,
                "vars": self.vars.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            }),
        );

        let url = if dry_run {
            None
        } else {
            extract_url(&UrlSources {
                output: &output.lines,
                routes: discovered.routes(),
                worker: &config.worker.name,
                environment: &config.environment,
                subdomain: &self.platform_settings.default_subdomain,
            })
        };
        if url.is_none() && !dry_run {
            tracing::warn!("Deployed, but no service URL could be determined");
        }

        Ok(DeployOutcome {
            url,
            dry_run,
            output: output.lines,
        })
    }
}

/// Command line with `--var` values masked.
fn redacted_command_line(spec: &CommandSpec) -> String {
    let mut parts = vec![spec.program.clone()];
    let mut after_var = false;
    for arg in &spec.args {
        if after_var {
            let key = arg.split(':').next().unwrap_or_default();
            parts.push(format!("{}:***", key));
        } else {
            parts.push(arg.clone());
        }
        after_var = arg == "--var";
    }
    parts.join(" ")
}
