//! edgeship deploys edge workers together with the database and secrets they need.

mod cli;

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command};
use edgeship_deploy::{
    AuditLedger, CloudflarePlatform, DeploymentId, ExitStatus, NonInteractiveOperator, Operator,
    Orchestrator, ProcessRunner, Settings, TerminalOperator, rollback::RollbackReport,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "edgeship failed");
            ExitCode::from(ExitStatus::from_error(&e).code())
        }
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let settings = Settings::load(cli.config.as_deref().map(PathBuf::from).as_deref())?;

    if let Command::Report { deployment_id } = &cli.command {
        let id = DeploymentId::from(deployment_id.clone());
        let (report, files) = AuditLedger::report_from_disk(&settings.audit_dir(), &id)?;
        println!("{}", report);
        tracing::info!(path = %files.json.display(), "Report regenerated");
        return Ok(ExitStatus::Success);
    }

    let operator: Box<dyn Operator> = if cli.non_interactive {
        Box::new(NonInteractiveOperator)
    } else {
        Box::new(TerminalOperator::default())
    };
    let platform = CloudflarePlatform::new(
        settings.platform.clone(),
        settings.timeouts.clone(),
        settings.retry.clone(),
    )?;
    let runner = ProcessRunner;
    let mut ledger = AuditLedger::open(settings.audit_dir(), &settings.audit)
        .context("Failed to open the audit log")?;

    let mut orchestrator = Orchestrator::new(&platform, &runner, operator.as_ref(), &settings);

    let status = match &cli.command {
        Command::Deploy(args) => {
            let outcome = orchestrator.deploy(&args.to_request(), &mut ledger).await;

            if let Some(failure) = &outcome.failure {
                eprintln!("Deployment {} {}: {}", outcome.deployment_id, outcome.status, failure);
                if let Some(remediation) = failure.remediation() {
                    eprintln!("  hint: {}", remediation);
                }
                if failure.rollback.is_none() && failure.pending_rollback > 0 {
                    eprintln!(
                        "  {} change(s) were left in place; undo them with `edgeship rollback {}`",
                        failure.pending_rollback, outcome.deployment_id
                    );
                }
            } else {
                println!(
                    "Deployment {} {}: {}",
                    outcome.deployment_id,
                    outcome.status,
                    outcome.url.as_deref().unwrap_or("no service URL")
                );
            }
            if let Some(report) = &outcome.report {
                println!("{}", report);
            }
            outcome.exit_status()
        }
        Command::Validate(args) => {
            let report = orchestrator.validate(&args.to_request(), &mut ledger).await;
            match report {
                Ok(report) => {
                    println!("{}", report);
                    ExitStatus::Success
                }
                Err(e) => {
                    eprintln!("Validation failed: {:#}", e);
                    ExitStatus::from_error(&e)
                }
            }
        }
        Command::Rollback {
            deployment_id,
            credentials,
        } => {
            let id = DeploymentId::from(deployment_id.clone());
            let result = orchestrator
                .rollback(&id, credentials.to_inputs(), &mut ledger)
                .await;
            rollback_status(&id, result)
        }
        Command::Report { .. } => ExitStatus::Success,
    };

    match ledger.finish() {
        Ok(Some(path)) => tracing::debug!(path = %path.display(), "Session summary written"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %format!("{:#}", e), "Failed to write session summary"),
    }

    Ok(status)
}

/// Print the rollback result. Errors become an exit status so the session is still finished.
fn rollback_status(id: &DeploymentId, result: Result<RollbackReport>) -> ExitStatus {
    match result {
        Ok(report) => {
            println!("{}", report);
            if report.is_complete() {
                ExitStatus::Success
            } else {
                ExitStatus::Failure
            }
        }
        Err(e) => {
            eprintln!("Rollback of {} failed: {:#}", id, e);
            ExitStatus::from_error(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_errors_become_exit_status() {
        let id = DeploymentId::from("deploy-missing".to_string());
        let status = rollback_status(&id, Err(anyhow::anyhow!("no deployment state for {}", id)));
        assert_eq!(status, ExitStatus::Failure);
        assert_eq!(status.code(), 1);

        assert_eq!(rollback_status(&id, Ok(RollbackReport::default())), ExitStatus::Success);
    }
}
