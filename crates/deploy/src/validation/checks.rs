use anyhow::{Context, Result};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use super::{ValidationCategory, ValidationContext, ValidationPipeline, ValidationResult};
use crate::{
    discovery::{Manifest, manifest_candidates},
    error::DeployError,
    fs::FsHandler,
    platform::{DatabaseInfo, Platform},
    process::{CommandRunner, CommandSpec},
    retry::retry_transient,
};

const MB: u64 = 1024 * 1024;

impl<P: Platform, R: CommandRunner> ValidationPipeline<'_, P, R> {
    pub(super) async fn check_prerequisites(&self) -> ValidationResult {
        let mut result = ValidationResult::new(ValidationCategory::Prerequisites);

        let mut commands = self.settings.required_commands.clone();
        if !commands.contains(&self.platform_settings.cli_program) {
            commands.push(self.platform_settings.cli_program.clone());
        }
        for command in &commands {
            if !self.runner.is_available(command) {
                result.error(format!("`{}` was not found on PATH", command));
            }
        }

        if self.settings.min_node_major > 0 && self.runner.is_available("node") {
            match self.node_version().await {
                Ok((raw, major)) if major < self.settings.min_node_major => result.error(format!(
                    "node {} is older than the required major version {}",
                    raw, self.settings.min_node_major
                )),
                Ok((raw, _)) => tracing::debug!(version = %raw, "Node version ok"),
                Err(e) => result.error(format!("could not determine the node version: {:#}", e)),
            }
        }

        result.finish()
    }

    async fn node_version(&self) -> Result<(String, u32)> {
        let spec = CommandSpec::new("node", ["--version"]).timeout(self.timeouts.command());
        let output = self.runner.run(&spec).await?.check(&spec)?;
        let raw = output
            .lines
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .context("`node --version` printed nothing")?
            .to_string();
        let major = parse_major(&raw).with_context(|| format!("unrecognised version '{}'", raw))?;
        Ok((raw, major))
    }

    pub(super) async fn check_authentication(&self, ctx: &ValidationContext<'_>) -> ValidationResult {
        let mut result = ValidationResult::new(ValidationCategory::Authentication);

        match self.platform.verify_token(&ctx.creds.token).await {
            Ok(true) => {}
            Ok(false) => result.error("the API token was rejected by the platform"),
            Err(e) => result.error(format!("could not verify the API token: {:#}", e)),
        }

        match self.platform.whoami(ctx.creds).await {
            Ok(Some(identity)) => tracing::debug!(%identity, "Provider CLI identity"),
            Ok(None) => result.warn(format!(
                "`{} whoami` reports no login; the API token will be used",
                self.platform_settings.cli_program
            )),
            Err(e) => result.warn(format!("could not check the provider CLI login: {:#}", e)),
        }

        result.finish()
    }

    pub(super) async fn check_network(&self) -> ValidationResult {
        let mut result = ValidationResult::new(ValidationCategory::Network);

        for endpoint in &self.settings.endpoints {
            match retry_transient(self.retry, endpoint, || self.platform.probe(endpoint)).await {
                Ok(response) => tracing::debug!(
                    %endpoint,
                    status = response.status,
                    latency_ms = response.latency.as_millis() as u64,
                    "Endpoint reachable"
                ),
                Err(e) => result.error(format!("{} is unreachable: {:#}", endpoint, e)),
            }
        }

        result.finish()
    }

    pub(super) async fn check_configuration(&self, ctx: &ValidationContext<'_>) -> ValidationResult {
        let mut result = ValidationResult::new(ValidationCategory::Configuration);

        // Discovery skips unreadable files; here they are reported.
        for (path, source) in manifest_candidates(ctx.project_dir, ctx.environment) {
            if path.is_file()
                && let Err(e) = Manifest::load_toml(&path, source, ctx.environment)
            {
                result.error(format!("{:#}", e));
            }
        }

        let Some(manifest) = ctx.discovered.deploy_manifest() else {
            result.warn(format!(
                "no wrangler manifest found in {}, deploying with defaults",
                ctx.project_dir.display()
            ));
            return result.finish();
        };

        let file = manifest
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        for key in &self.settings.mandatory_manifest_keys {
            if !manifest.keys.contains(key) {
                result.error(format!("manifest {} is missing required key '{}'", file, key));
            }
        }

        if !manifest.databases.is_empty() {
            match self.platform.list_databases(ctx.creds).await {
                Ok(remote) => {
                    for mismatch in binding_mismatches(manifest, &remote) {
                        let message = mismatch.to_string();
                        if self.settings.strict_bindings {
                            result.error(message);
                        } else {
                            result.warn(message);
                        }
                    }
                }
                Err(e) => result.error(format!("could not list databases: {:#}", e)),
            }
        }

        result.finish()
    }

    pub(super) async fn check_endpoint_structure(&self, ctx: &ValidationContext<'_>) -> ValidationResult {
        let category = ValidationCategory::EndpointStructure;
        let url = ctx
            .discovered
            .stored
            .as_ref()
            .and_then(|stored| stored.worker_url.as_deref());
        let Some(url) = url.filter(|_| !ctx.discovered.is_first_deployment()) else {
            return ValidationResult::skipped(category, "first deployment, no live endpoint yet");
        };

        let mut result = ValidationResult::new(category);
        let health = format!("{}/health", url.trim_end_matches('/'));
        match retry_transient(self.retry, &health, || self.platform.probe(&health)).await {
            Ok(response) if response.is_success() => {}
            Ok(response) => result.error(format!("{} returned HTTP {}", health, response.status)),
            Err(e) => result.error(format!("{} is unreachable: {:#}", health, e)),
        }
        result.finish()
    }

    pub(super) async fn check_readiness(&self, ctx: &ValidationContext<'_>) -> ValidationResult {
        let mut result = ValidationResult::new(ValidationCategory::Readiness);

        if self.settings.min_free_disk_mb > 0 {
            match FsHandler::available_space(ctx.project_dir) {
                Ok(free) if free / MB < self.settings.min_free_disk_mb => result.error(format!(
                    "only {} MB of disk space free, {} MB required",
                    free / MB,
                    self.settings.min_free_disk_mb
                )),
                Ok(_) => {}
                Err(e) => result.warn(format!("{:#}", e)),
            }
        }

        if self.settings.min_free_memory_mb > 0 {
            match available_memory_mb() {
                Some(free) if free < self.settings.min_free_memory_mb => result.error(format!(
                    "only {} MB of memory available, {} MB required",
                    free, self.settings.min_free_memory_mb
                )),
                Some(_) => {}
                None => result.warn("could not determine available memory"),
            }
        }

        if self.settings.build_dry_run
            && let Some(spec) = &ctx.dry_run_command
        {
            match self.runner.run(spec).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    let tail: Vec<&str> = output.lines.iter().rev().take(5).rev().map(String::as_str).collect();
                    result.error(format!(
                        "`{}` failed: {}",
                        spec.command_line(),
                        tail.join(" | ")
                    ));
                }
                Err(e) => result.error(format!("`{}` could not run: {:#}", spec.command_line(), e)),
            }
        }

        result.finish()
    }
}

/// `v20.11.1` -> 20
fn parse_major(version: &str) -> Option<u32> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()?
        .parse()
        .ok()
}

fn binding_mismatches(manifest: &Manifest, remote: &[DatabaseInfo]) -> Vec<DeployError> {
    let mut mismatches = Vec::new();
    for declared in &manifest.databases {
        let binding = declared
            .binding
            .clone()
            .unwrap_or_else(|| "<unnamed>".to_string());
        let mismatch = |reason: String| DeployError::BindingMismatch {
            binding: binding.clone(),
            reason,
        };

        let Some(name) = &declared.database_name else {
            mismatches.push(mismatch("missing field database_name".to_string()));
            continue;
        };
        let Some(found) = remote.iter().find(|db| &db.name == name) else {
            mismatches.push(mismatch(format!("database '{}' not found", name)));
            continue;
        };
        match &declared.database_id {
            None => mismatches.push(mismatch("missing field database_id".to_string())),
            Some(id) if id != &found.id => mismatches.push(mismatch(format!(
                "database_id {} does not match remote id {}",
                id, found.id
            ))),
            Some(_) => {}
        }
    }
    mismatches
}

/// Memory the OS reports as available to new processes, `None` when it reports nothing.
fn available_memory_mb() -> Option<u64> {
    let system =
        System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::everything()));
    let available = system.available_memory();
    (available > 0).then_some(available / MB)
}
