//! Layered tool settings.
//!
//! Settings are resolved from built-in defaults, then an optional `Edgeship.toml`, then
//! `EDGESHIP_*` environment variables (nested keys separated by `__`, e.g.
//! `EDGESHIP_AUDIT__MAX_FILE_BYTES`).

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::audit::LogFormat;

/// The default name of the settings file looked up in the working directory.
pub const SETTINGS_FILENAME: &str = "Edgeship.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "EDGESHIP_";

/// What to do with registered rollback actions when a deployment fails.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RollbackPolicy {
    /// Replay compensating actions immediately.
    Automatic,
    /// Ask the operator; non-interactive sessions answer no.
    #[default]
    Prompt,
    /// Never replay in-process. Use `edgeship rollback <id>` later.
    Manual,
}

/// Depth of the post-deployment checks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VerifyMode {
    Skip,
    #[default]
    Smoke,
    Comprehensive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    /// Base URL of the platform REST API.
    pub api_base_url: String,
    /// Program used for provider CLI calls.
    pub cli_program: String,
    /// Default subdomain workers are published under.
    pub default_subdomain: String,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.cloudflare.com/client/v4".to_string(),
            cli_program: "wrangler".to_string(),
            default_subdomain: "workers.dev".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Directory holding every audit artifact. Relative paths resolve under `state_dir`.
    pub dir: PathBuf,
    /// Files larger than this are rotated before the next write.
    pub max_file_bytes: u64,
    /// Formats every log line is written in.
    pub formats: Vec<LogFormat>,
    /// Also write `daily/audit-YYYY-MM-DD.*`.
    pub daily_partition: bool,
    /// Also write `sessions/<session-id>.*`.
    pub session_partition: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("audit"),
            max_file_bytes: 10 * 1024 * 1024,
            formats: vec![LogFormat::Jsonl, LogFormat::Text, LogFormat::Csv],
            daily_partition: true,
            session_partition: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub network_secs: u64,
    pub command_secs: u64,
    pub deploy_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            network_secs: 10,
            command_secs: 60,
            deploy_secs: 300,
        }
    }
}

impl TimeoutSettings {
    pub fn network(&self) -> Duration {
        Duration::from_secs(self.network_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn deploy(&self) -> Duration {
        Duration::from_secs(self.deploy_secs)
    }
}

/// Fixed-count, fixed-delay retry for transient calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: usize,
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1000,
        }
    }
}

impl RetrySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Constant backoff for `backon`. The first call is not counted as a retry.
    pub fn backoff(&self) -> backon::ConstantBuilder {
        backon::ConstantBuilder::default()
            .with_delay(self.delay())
            .with_max_times(self.attempts.saturating_sub(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Commands that must be on `PATH`.
    pub required_commands: Vec<String>,
    /// Minimum major version reported by `node --version`.
    pub min_node_major: u32,
    /// Endpoints probed by the network phase.
    pub endpoints: Vec<String>,
    /// Keys every manifest must declare.
    pub mandatory_manifest_keys: Vec<String>,
    /// Treat binding mismatches as fatal.
    pub strict_bindings: bool,
    pub min_free_disk_mb: u64,
    pub min_free_memory_mb: u64,
    /// Run `deploy --dry-run` as part of the readiness phase.
    pub build_dry_run: bool,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            required_commands: vec!["node".to_string(), "wrangler".to_string()],
            min_node_major: 18,
            endpoints: vec![
                "https://api.cloudflare.com".to_string(),
                "https://registry.npmjs.org".to_string(),
            ],
            mandatory_manifest_keys: vec![
                "name".to_string(),
                "main".to_string(),
                "compatibility_date".to_string(),
            ],
            strict_bindings: false,
            min_free_disk_mb: 100,
            min_free_memory_mb: 128,
            build_dry_run: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretSettings {
    /// Names of the secrets generated for every worker.
    pub keys: Vec<String>,
    /// Random bytes per generated secret (hex-encoded, so twice as many characters).
    pub length_bytes: usize,
    /// Write the distribution bundle after deploying.
    pub emit_distribution: bool,
}

impl Default for SecretSettings {
    fn default() -> Self {
        Self {
            keys: vec!["API_SECRET".to_string(), "JWT_SECRET".to_string()],
            length_bytes: 32,
            emit_distribution: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// Environment variables forwarded as `--var KEY:VALUE` when present.
    pub var_allowlist: Vec<String>,
    pub rollback_policy: RollbackPolicy,
    pub verify: VerifyMode,
    /// Latency above which comprehensive verification warns.
    pub max_latency_ms: u64,
    /// Entry point deployed when the project has no wrangler manifest and `package.json`
    /// names no `main`.
    pub default_main: String,
    /// Compatibility date passed when the project has no wrangler manifest.
    pub default_compatibility_date: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            var_allowlist: [
                "NODE_ENV",
                "LOG_LEVEL",
                "API_VERSION",
                "SERVICE_NAME",
                "SERVICE_DOMAIN",
                "CORS_ORIGINS",
                "FEATURE_FLAGS",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            rollback_policy: RollbackPolicy::default(),
            verify: VerifyMode::default(),
            max_latency_ms: 2000,
            default_main: "src/index.js".to_string(),
            default_compatibility_date: "2024-09-01".to_string(),
        }
    }
}

/// Complete tool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory of every local state file.
    pub state_dir: PathBuf,
    /// Directory searched for manifests.
    pub project_dir: PathBuf,
    /// Credential cache file. Defaults to a file under the user config directory.
    pub credential_cache: Option<PathBuf>,
    pub platform: PlatformSettings,
    pub audit: AuditSettings,
    pub timeouts: TimeoutSettings,
    pub retry: RetrySettings,
    pub validation: ValidationSettings,
    pub secrets: SecretSettings,
    pub deploy: DeploySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".edgeship"),
            project_dir: PathBuf::from("."),
            credential_cache: None,
            platform: PlatformSettings::default(),
            audit: AuditSettings::default(),
            timeouts: TimeoutSettings::default(),
            retry: RetrySettings::default(),
            validation: ValidationSettings::default(),
            secrets: SecretSettings::default(),
            deploy: DeploySettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, the settings file and the environment.
    ///
    /// An explicitly given file must exist. Without one, `Edgeship.toml` in the working
    /// directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Settings file not found: {}", path.display());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                let default_path = PathBuf::from(SETTINGS_FILENAME);
                if default_path.exists() {
                    figment = figment.merge(Toml::file(default_path));
                }
            }
        }

        let settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to parse settings")?;

        tracing::debug!(state_dir = %settings.state_dir.display(), "Settings loaded");
        Ok(settings)
    }

    /// Audit directory, resolved under `state_dir` when relative.
    pub fn audit_dir(&self) -> PathBuf {
        if self.audit.dir.is_absolute() {
            self.audit.dir.clone()
        } else {
            self.state_dir.join(&self.audit.dir)
        }
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.state_dir.join("secrets")
    }

    pub fn distribution_dir(&self) -> PathBuf {
        self.state_dir.join("distribution")
    }

    pub fn stored_configs_dir(&self) -> PathBuf {
        self.state_dir.join("configs")
    }

    pub fn deployments_dir(&self) -> PathBuf {
        self.state_dir.join("deployments")
    }

    /// Location of the credential cache, outside the project tree.
    pub fn credential_cache_path(&self) -> PathBuf {
        if let Some(path) = &self.credential_cache {
            return path.clone();
        }
        dirs::config_dir()
            .unwrap_or_else(|| self.state_dir.clone())
            .join("edgeship")
            .join("credentials")
    }

    /// Settings rooted in `dir`, used by tests and throwaway runs.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            state_dir: dir.join(".edgeship"),
            project_dir: dir.to_path_buf(),
            credential_cache: Some(dir.join(".edgeship").join("credentials")),
            ..Self::default()
        }
    }
}
