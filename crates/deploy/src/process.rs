//! Subprocess execution with bounded timeouts.
//!
//! Output of both streams is forwarded line by line to the log (so the operator sees progress)
//! and buffered so callers can parse it or attach it to an error.

use std::{
    fmt,
    future::Future,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};

use crate::{config::RetrySettings, error::DeployError, retry::retry_transient};

/// Variables kept when a command runs with a cleared environment.
const PASSTHROUGH_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "USERPROFILE",
    "APPDATA",
    "SYSTEMROOT",
    "TMPDIR",
    "TEMP",
    "TMP",
    "LANG",
];

/// A fully described command invocation.
#[derive(Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child. Values are never logged.
    pub env: Vec<(String, String)>,
    /// Start from an empty environment (plus [`PASSTHROUGH_ENV`]).
    pub clear_env: bool,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Duration,
    /// Forward output lines at info level instead of trace.
    pub stream: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            clear_env: false,
            stdin: None,
            current_dir: None,
            timeout: Duration::from_secs(60),
            stream: false,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn clear_env(mut self, clear: bool) -> Self {
        self.clear_env = clear;
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// The command line as the operator would type it.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.command_line())
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("clear_env", &self.clear_env)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// What a finished (or killed) command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when killed by a signal or on timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Combined stdout and stderr, one line per entry, in arrival order.
    pub lines: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Turn an unsuccessful run into [`DeployError::CommandExecution`].
    pub fn check(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(DeployError::CommandExecution {
            command: spec.command_line(),
            exit_code: self.exit_code,
            timed_out: self.timed_out,
            output: self.text(),
        }
        .into())
    }
}

/// Runs external commands.
pub trait CommandRunner: Send + Sync {
    /// Run to completion or until `spec.timeout`. Only spawn failures are errors; a non-zero
    /// exit is reported in the output.
    fn run(&self, spec: &CommandSpec) -> impl Future<Output = Result<CommandOutput>> + Send;

    /// Whether `program` can be found on `PATH`.
    fn is_available(&self, program: &str) -> bool;
}

/// Run and fail on a non-zero exit.
pub async fn run_checked<R: CommandRunner>(runner: &R, spec: &CommandSpec) -> Result<CommandOutput> {
    runner.run(spec).await?.check(spec)
}

/// Run a read-only command, retrying with the configured fixed backoff.
///
/// Never use this for commands with side effects.
pub async fn run_transient<R: CommandRunner>(
    runner: &R,
    spec: &CommandSpec,
    retry: &RetrySettings,
) -> Result<CommandOutput> {
    retry_transient(retry, &spec.command_line(), || run_checked(runner, spec)).await
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        if spec.clear_env {
            cmd.env_clear();
            for key in PASSTHROUGH_ENV {
                if let Ok(value) = std::env::var(key) {
                    cmd.env(key, value);
                }
            }
        }
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(command = %spec.command_line(), timeout = ?spec.timeout, "Spawning command");

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn `{}`", spec.command_line()))?;

        if let Some(input) = &spec.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin
                .write_all(input.as_bytes())
                .await
                .context("Failed to write to child stdin")?;
            // Dropping closes the pipe so the child sees EOF.
            drop(stdin);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let readers = [
            spawn_line_reader(child.stdout.take(), tx.clone()),
            spawn_line_reader(child.stderr.take(), tx),
        ];

        let mut lines = Vec::new();
        let waited = timeout(spec.timeout, async {
            while let Some(line) = rx.recv().await {
                if spec.stream {
                    tracing::info!(program = %spec.program, "{}", line);
                } else {
                    tracing::trace!(program = %spec.program, "{}", line);
                }
                lines.push(line);
            }
            child.wait().await
        })
        .await;

        match waited {
            Ok(status) => {
                let status = status.context("Failed to wait for child process")?;
                tracing::debug!(command = %spec.command_line(), ?status, "Command finished");
                Ok(CommandOutput {
                    exit_code: status.code(),
                    timed_out: false,
                    lines,
                })
            }
            Err(_) => {
                tracing::error!(command = %spec.command_line(), timeout = ?spec.timeout, "Command timed out, killing it");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill timed out command");
                }
                for reader in readers {
                    reader.abort();
                }
                Ok(CommandOutput {
                    exit_code: None,
                    timed_out: true,
                    lines,
                })
            }
        }
    }

    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

fn spawn_line_reader<R>(reader: Option<R>, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else {
            return;
        };
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}
