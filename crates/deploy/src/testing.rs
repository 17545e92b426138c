//! In-memory doubles for the external seams, used by unit and integration tests.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};

use crate::{
    credentials::Credentials,
    operator::Operator,
    platform::{Account, DatabaseInfo, Platform, ProbeResponse, Zone},
    process::{CommandOutput, CommandRunner, CommandSpec},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct FakeState {
    token_valid: bool,
    accounts: Vec<Account>,
    zones: Vec<Zone>,
    databases: Vec<DatabaseInfo>,
    secrets: BTreeMap<(String, String), String>,
    /// 1-based index of the `put_secret` call that fails.
    fail_secret_put_at: Option<usize>,
    secret_puts: usize,
    whoami: Option<String>,
    probe_status: Option<u16>,
    calls: Vec<String>,
    next_id: u32,
}

/// A [`Platform`] keeping remote state in memory and logging every call.
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    pub const ACCOUNT_ID: &'static str = "acc-0001";
    pub const ZONE_ID: &'static str = "zone-0001";

    /// One account, one `example.com` zone, a valid token and a healthy endpoint.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                token_valid: true,
                accounts: vec![Account {
                    id: Self::ACCOUNT_ID.to_string(),
                    name: "Main".to_string(),
                }],
                zones: vec![Zone {
                    id: Self::ZONE_ID.to_string(),
                    name: "example.com".to_string(),
                }],
                databases: Vec::new(),
                secrets: BTreeMap::new(),
                fail_secret_put_at: None,
                secret_puts: 0,
                whoami: Some("ops@example.com".to_string()),
                probe_status: Some(200),
                calls: Vec::new(),
                next_id: 1,
            }),
        }
    }

    pub fn with_token_valid(self, valid: bool) -> Self {
        lock(&self.state).token_valid = valid;
        self
    }

    pub fn with_accounts(self, accounts: Vec<Account>) -> Self {
        lock(&self.state).accounts = accounts;
        self
    }

    pub fn with_zones(self, zones: Vec<Zone>) -> Self {
        lock(&self.state).zones = zones;
        self
    }

    pub fn with_database(self, name: &str, id: &str) -> Self {
        lock(&self.state).databases.push(DatabaseInfo {
            id: id.to_string(),
            name: name.to_string(),
        });
        self
    }

    /// Make the `k`-th secret upload (1-based) fail.
    pub fn fail_secret_put_at(self, k: usize) -> Self {
        lock(&self.state).fail_secret_put_at = Some(k);
        self
    }

    pub fn with_whoami(self, identity: Option<&str>) -> Self {
        lock(&self.state).whoami = identity.map(String::from);
        self
    }

    /// `None` makes every probe fail to connect.
    pub fn with_probe_status(self, status: Option<u16>) -> Self {
        lock(&self.state).probe_status = status;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.state).calls.len()
    }

    /// Calls whose name starts with `prefix`.
    pub fn calls_to(&self, prefix: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn databases(&self) -> Vec<DatabaseInfo> {
        lock(&self.state).databases.clone()
    }

    /// `(worker, key)` pairs currently stored remotely.
    pub fn secrets(&self) -> Vec<(String, String)> {
        lock(&self.state).secrets.keys().cloned().collect()
    }

    pub fn secret_value(&self, worker: &str, key: &str) -> Option<String> {
        lock(&self.state)
            .secrets
            .get(&(worker.to_string(), key.to_string()))
            .cloned()
    }

    fn call(&self, name: String) -> MutexGuard<'_, FakeState> {
        let mut state = lock(&self.state);
        state.calls.push(name);
        state
    }
}

impl Platform for FakePlatform {
    async fn verify_token(&self, _token: &str) -> Result<bool> {
        Ok(self.call("verify_token".to_string()).token_valid)
    }

    async fn list_accounts(&self, _token: &str) -> Result<Vec<Account>> {
        Ok(self.call("list_accounts".to_string()).accounts.clone())
    }

    async fn list_zones(&self, _token: &str, _account_id: &str) -> Result<Vec<Zone>> {
        Ok(self.call("list_zones".to_string()).zones.clone())
    }

    async fn whoami(&self, _creds: &Credentials) -> Result<Option<String>> {
        Ok(self.call("whoami".to_string()).whoami.clone())
    }

    async fn list_databases(&self, _creds: &Credentials) -> Result<Vec<DatabaseInfo>> {
        Ok(self.call("list_databases".to_string()).databases.clone())
    }

    async fn create_database(&self, _creds: &Credentials, name: &str) -> Result<DatabaseInfo> {
        let mut state = self.call(format!("create_database:{}", name));
        if state.databases.iter().any(|db| db.name == name) {
            anyhow::bail!("A database with name '{}' already exists", name);
        }
        let info = DatabaseInfo {
            id: format!("db-{:04}", state.next_id),
            name: name.to_string(),
        };
        state.next_id += 1;
        state.databases.push(info.clone());
        Ok(info)
    }

    async fn delete_database(&self, _creds: &Credentials, name: &str) -> Result<()> {
        let mut state = self.call(format!("delete_database:{}", name));
        let before = state.databases.len();
        state.databases.retain(|db| db.name != name);
        if state.databases.len() == before {
            anyhow::bail!("Database '{}' not found", name);
        }
        Ok(())
    }

    async fn put_secret(&self, _creds: &Credentials, worker: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.call(format!("put_secret:{}:{}", worker, key));
        state.secret_puts += 1;
        if state.fail_secret_put_at == Some(state.secret_puts) {
            anyhow::bail!("Upload of secret {} failed", key);
        }
        state
            .secrets
            .insert((worker.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn delete_secret(&self, _creds: &Credentials, worker: &str, key: &str) -> Result<()> {
        self.call(format!("delete_secret:{}:{}", worker, key))
            .secrets
            .remove(&(worker.to_string(), key.to_string()));
        Ok(())
    }

    async fn probe(&self, url: &str) -> Result<ProbeResponse> {
        let status = self.call(format!("probe:{}", url)).probe_status;
        let status = status.with_context(|| format!("Connection refused: {}", url))?;
        Ok(ProbeResponse {
            status,
            latency: Duration::from_millis(25),
            body: "ok".to_string(),
        })
    }
}

struct ScriptedResponse {
    pattern: String,
    output: CommandOutput,
}

/// A [`CommandRunner`] returning canned outputs and recording invocations.
///
/// The first response whose pattern is contained in the command line wins; anything else
/// succeeds with no output.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Vec<ScriptedResponse>,
    missing: Vec<String>,
    invocations: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, pattern: &str, exit_code: i32, lines: &[&str]) -> Self {
        self.responses.push(ScriptedResponse {
            pattern: pattern.to_string(),
            output: CommandOutput {
                exit_code: Some(exit_code),
                timed_out: false,
                lines: lines.iter().map(|l| l.to_string()).collect(),
            },
        });
        self
    }

    pub fn time_out(mut self, pattern: &str) -> Self {
        self.responses.push(ScriptedResponse {
            pattern: pattern.to_string(),
            output: CommandOutput {
                exit_code: None,
                timed_out: true,
                lines: vec!["still working...".to_string()],
            },
        });
        self
    }

    /// Pretend `program` is not on `PATH`.
    pub fn without_program(mut self, program: &str) -> Self {
        self.missing.push(program.to_string());
        self
    }

    pub fn invocations(&self) -> Vec<CommandSpec> {
        lock(&self.invocations).clone()
    }

    /// Number of invocations whose command line contains `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        lock(&self.invocations)
            .iter()
            .filter(|spec| spec.command_line().contains(pattern))
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        lock(&self.invocations).push(spec.clone());

        if !self.is_available(&spec.program) {
            anyhow::bail!("Failed to spawn `{}`: not found", spec.command_line());
        }

        let line = spec.command_line();
        Ok(self
            .responses
            .iter()
            .find(|r| line.contains(&r.pattern))
            .map(|r| r.output.clone())
            .unwrap_or(CommandOutput {
                exit_code: Some(0),
                timed_out: false,
                lines: Vec::new(),
            }))
    }

    fn is_available(&self, program: &str) -> bool {
        !self.missing.iter().any(|m| m == program)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Answer {
    YesNo(bool),
    Choice(usize),
    Text(String),
}

/// An [`Operator`] replaying queued answers. Questions without a queued answer get their
/// default.
pub struct ScriptedOperator {
    interactive: bool,
    answers: Mutex<VecDeque<Answer>>,
    questions: Mutex<Vec<String>>,
    notices: Mutex<Vec<String>>,
    prompts: AtomicUsize,
}

impl Default for ScriptedOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOperator {
    pub fn new() -> Self {
        Self {
            interactive: true,
            answers: Mutex::new(VecDeque::new()),
            questions: Mutex::new(Vec::new()),
            notices: Mutex::new(Vec::new()),
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            ..Self::new()
        }
    }

    fn push(self, answer: Answer) -> Self {
        lock(&self.answers).push_back(answer);
        self
    }

    pub fn yes(self) -> Self {
        self.push(Answer::YesNo(true))
    }

    pub fn no(self) -> Self {
        self.push(Answer::YesNo(false))
    }

    pub fn choice(self, index: usize) -> Self {
        self.push(Answer::Choice(index))
    }

    pub fn text(self, text: &str) -> Self {
        self.push(Answer::Text(text.to_string()))
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn questions(&self) -> Vec<String> {
        lock(&self.questions).clone()
    }

    pub fn notices(&self) -> Vec<String> {
        lock(&self.notices).clone()
    }

    /// Answers not consumed yet.
    pub fn remaining(&self) -> usize {
        lock(&self.answers).len()
    }

    fn next(&self, question: &str) -> Option<Answer> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        lock(&self.questions).push(question.to_string());
        lock(&self.answers).pop_front()
    }
}

impl Operator for ScriptedOperator {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn ask_yes_no(&self, question: &str, default: bool) -> Result<bool> {
        match self.next(question) {
            None => Ok(default),
            Some(Answer::YesNo(answer)) => Ok(answer),
            Some(other) => anyhow::bail!("Scripted answer {:?} does not fit '{}'", other, question),
        }
    }

    fn ask_choice(&self, question: &str, options: &[String], default: usize) -> Result<usize> {
        match self.next(question) {
            None => Ok(default),
            Some(Answer::Choice(index)) if index < options.len() => Ok(index),
            Some(other) => anyhow::bail!("Scripted answer {:?} does not fit '{}'", other, question),
        }
    }

    fn ask_text(&self, question: &str, default: Option<&str>) -> Result<String> {
        match self.next(question) {
            None => default
                .map(String::from)
                .with_context(|| format!("No scripted answer for '{}'", question)),
            Some(Answer::Text(text)) => Ok(text),
            Some(other) => anyhow::bail!("Scripted answer {:?} does not fit '{}'", other, question),
        }
    }

    fn ask_secret(&self, question: &str) -> Result<String> {
        match self.next(question) {
            Some(Answer::Text(text)) => Ok(text),
            _ => anyhow::bail!("No scripted secret for '{}'", question),
        }
    }

    fn notify(&self, message: &str) {
        lock(&self.notices).push(message.to_string());
    }
}
