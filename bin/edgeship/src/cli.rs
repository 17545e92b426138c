use clap::{Args, Parser, Subcommand};
use edgeship_deploy::{
    ConfigOverrides, CredentialInputs, DeployRequest, RollbackPolicy, VerifyMode,
};
use tracing::level_filters::LevelFilter;

/// The default environment name.
const DEFAULT_ENVIRONMENT: &str = "production";

#[derive(Parser)]
#[command(name = "edgeship")]
#[command(
    author,
    version,
    about = "Deploy edge workers with their database and secrets, with audit and rollback"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "EDGESHIP_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to a settings file. Defaults to `Edgeship.toml` in the working directory.
    #[arg(long, global = true, alias = "settings", env = "EDGESHIP_CONFIG")]
    pub config: Option<String>,

    /// Never prompt. Questions are answered with their defaults and destructive choices are
    /// never taken.
    #[arg(long, global = true, env = "EDGESHIP_NON_INTERACTIVE")]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run every phase and deploy the worker.
    Deploy(DeployArgs),

    /// Run credential resolution, discovery and the validation pipeline only.
    Validate(TargetArgs),

    /// Undo the recorded side effects of an earlier deployment.
    Rollback {
        /// The deployment id printed by `deploy`.
        deployment_id: String,

        #[clap(flatten)]
        credentials: CredentialArgs,
    },

    /// Print the report of an earlier deployment.
    Report {
        /// The deployment id printed by `deploy`.
        deployment_id: String,
    },
}

/// Credential values. Anything missing is read from the environment, the cache, or asked for.
#[derive(Debug, Clone, Args)]
pub struct CredentialArgs {
    /// API token. Prefer the `CLOUDFLARE_API_TOKEN` environment variable.
    #[arg(long, hide_env_values = true)]
    pub token: Option<String>,

    /// Account id.
    #[arg(long)]
    pub account_id: Option<String>,

    /// Zone id of the domain.
    #[arg(long)]
    pub zone_id: Option<String>,
}

impl CredentialArgs {
    pub fn to_inputs(&self) -> CredentialInputs {
        CredentialInputs {
            token: self.token.clone(),
            account_id: self.account_id.clone(),
            zone_id: self.zone_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// The domain the worker serves.
    #[arg(short, long, env = "EDGESHIP_DOMAIN")]
    pub domain: String,

    /// The target environment.
    #[arg(short, long, env = "EDGESHIP_ENVIRONMENT", default_value = DEFAULT_ENVIRONMENT)]
    pub environment: String,

    /// Treat binding mismatches between the manifest and the resolved database as fatal.
    #[arg(long, env = "EDGESHIP_STRICT")]
    pub strict: bool,

    #[clap(flatten)]
    pub credentials: CredentialArgs,
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    #[clap(flatten)]
    pub target: TargetArgs,

    /// Resolve and validate everything without creating or changing anything.
    #[arg(long, env = "EDGESHIP_DRY_RUN")]
    pub dry_run: bool,

    /// Skip the confirmation prompt.
    #[arg(short, long)]
    pub yes: bool,

    /// What to do with the recorded side effects when a phase fails.
    ///
    /// Defaults to the value from the settings file (`prompt`).
    #[arg(long, env = "EDGESHIP_ROLLBACK")]
    pub rollback: Option<RollbackPolicy>,

    /// Depth of the post-deployment checks.
    #[arg(long, env = "EDGESHIP_VERIFY")]
    pub verify: Option<VerifyMode>,

    /// Worker name, overriding the manifest and any stored configuration.
    #[arg(long, alias = "name")]
    pub worker_name: Option<String>,

    /// Database name, overriding the manifest and any stored configuration.
    #[arg(long, alias = "database")]
    pub database_name: Option<String>,
}

impl TargetArgs {
    pub fn to_request(&self) -> DeployRequest {
        DeployRequest {
            explicit: self.credentials.to_inputs(),
            strict: self.strict,
            ..DeployRequest::new(&self.domain, &self.environment)
        }
    }
}

impl DeployArgs {
    pub fn to_request(&self) -> DeployRequest {
        DeployRequest {
            dry_run: self.dry_run,
            overrides: ConfigOverrides {
                worker_name: self.worker_name.clone(),
                database_name: self.database_name.clone(),
            },
            rollback_policy: self.rollback,
            verify: self.verify,
            auto_approve: self.yes,
            ..self.target.to_request()
        }
    }
}
