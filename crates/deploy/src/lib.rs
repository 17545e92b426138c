//! edgeship-deploy - Deployment orchestration for edge serverless workers.
//!
//! This crate resolves credentials, discovers or provisions the resources a worker needs,
//! validates the environment, runs the platform CLI and verifies the result, keeping an
//! audit trail and a replayable rollback record of every side effect.

pub mod assessment;
pub mod audit;
pub mod config;
pub mod confirm;
pub mod credentials;
pub mod database;
pub mod discovery;
pub mod error;
pub mod executor;
mod fs;
pub mod operator;
pub mod platform;
pub mod process;
mod retry;
pub mod rollback;
pub mod secrets;
pub mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod url_extract;
pub mod validation;
pub mod verify;

mod orchestrator;
pub use orchestrator::{DeployRequest, DeploymentFailure, DeploymentOutcome, Orchestrator};

pub use audit::{AuditLedger, AuditScope, DeploymentReport, EventType};
pub use config::{RollbackPolicy, Settings, VerifyMode};
pub use credentials::{CredentialInputs, Credentials};
pub use discovery::ConfigOverrides;
pub use error::{DeployError, ExitStatus};
pub use operator::{NonInteractiveOperator, Operator, TerminalOperator};
pub use platform::{CloudflarePlatform, Platform};
pub use process::{CommandRunner, ProcessRunner};
pub use state::{DeploymentId, DeploymentState, DeploymentStatus, Phase};
