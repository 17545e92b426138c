//! Production [`Platform`]: REST API for account data, provider CLI for resources.

use std::time::Instant;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, de::DeserializeOwned};

use super::{Account, DatabaseInfo, Platform, ProbeResponse, WranglerCmdBuilder, Zone};
use crate::{
    config::{PlatformSettings, RetrySettings, TimeoutSettings},
    credentials::Credentials,
    process::{CommandRunner, CommandSpec, ProcessRunner, run_checked, run_transient},
    retry::retry_transient,
};

/// Bytes of a probe body kept for diagnostics.
const PROBE_BODY_LIMIT: usize = 512;

/// Page size for listing endpoints.
const PER_PAGE: u32 = 50;

/// Matches both the TOML snippet and the JSON object printed after `d1 create`.
const DATABASE_ID_PATTERN: &str = r#""?database_id"?\s*[=:]\s*"([0-9a-fA-F-]{8,})""#;

/// Response envelope shared by every REST endpoint.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    result: Option<T>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TokenStatus {
    status: String,
}

/// Talks to the platform REST API and drives the provider CLI through a [`CommandRunner`].
pub struct CloudflarePlatform<R: CommandRunner = ProcessRunner> {
    client: reqwest::Client,
    settings: PlatformSettings,
    timeouts: TimeoutSettings,
    retry: RetrySettings,
    runner: R,
}

impl CloudflarePlatform<ProcessRunner> {
    pub fn new(
        settings: PlatformSettings,
        timeouts: TimeoutSettings,
        retry: RetrySettings,
    ) -> Result<Self> {
        Self::with_runner(settings, timeouts, retry, ProcessRunner)
    }
}

impl<R: CommandRunner> CloudflarePlatform<R> {
    pub fn with_runner(
        settings: PlatformSettings,
        timeouts: TimeoutSettings,
        retry: RetrySettings,
        runner: R,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeouts.network())
            .user_agent(concat!("edgeship/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            settings,
            timeouts,
            retry,
            runner,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.api_base_url.trim_end_matches('/'), path)
    }

    /// GET an API path and unwrap the envelope.
    async fn api_get<T: DeserializeOwned>(&self, token: &str, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("Failed to send GET {}", path))?;

        let status = response.status();
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse GET {} response ({})", path, status))?;

        if !envelope.success {
            let messages = envelope
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ");
            anyhow::bail!("API error on GET {}: {}", path, messages);
        }

        envelope
            .result
            .with_context(|| format!("No result in GET {} response", path))
    }

    async fn verify_token_once(&self, token: &str) -> Result<bool> {
        let response = self
            .client
            .get(self.url("/user/tokens/verify"))
            .bearer_auth(token)
            .send()
            .await
            .context("Failed to reach the token verification endpoint")?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            tracing::debug!(%status, "Token rejected");
            return Ok(false);
        }

        let envelope: ApiEnvelope<TokenStatus> = response
            .json()
            .await
            .context("Failed to parse token verification response")?;

        Ok(envelope.success
            && envelope
                .result
                .is_some_and(|r| r.status.eq_ignore_ascii_case("active")))
    }

    /// Provider CLI command with credentials injected into a cleared environment.
    fn cli(&self, creds: &Credentials, args: Vec<String>) -> CommandSpec {
        creds
            .inject(CommandSpec::new(&self.settings.cli_program, args))
            .timeout(self.timeouts.command())
    }
}

impl<R: CommandRunner> Platform for CloudflarePlatform<R> {
    async fn verify_token(&self, token: &str) -> Result<bool> {
        retry_transient(&self.retry, "verify token", || self.verify_token_once(token)).await
    }

    async fn list_accounts(&self, token: &str) -> Result<Vec<Account>> {
        let path = format!("/accounts?per_page={}", PER_PAGE);
        retry_transient(&self.retry, "list accounts", || self.api_get(token, &path)).await
    }

    async fn list_zones(&self, token: &str, account_id: &str) -> Result<Vec<Zone>> {
        let path = format!("/zones?account.id={}&per_page={}", account_id, PER_PAGE);
        retry_transient(&self.retry, "list zones", || self.api_get(token, &path)).await
    }

    async fn whoami(&self, creds: &Credentials) -> Result<Option<String>> {
        let spec = self.cli(creds, WranglerCmdBuilder::whoami());
        let output = retry_transient(&self.retry, "whoami", || self.runner.run(&spec)).await?;
        Ok(parse_whoami(&output.text()))
    }

    async fn list_databases(&self, creds: &Credentials) -> Result<Vec<DatabaseInfo>> {
        let spec = self.cli(creds, WranglerCmdBuilder::d1_list());
        let output = run_transient(&self.runner, &spec, &self.retry).await?;
        parse_database_list(&output.text())
    }

    async fn create_database(&self, creds: &Credentials, name: &str) -> Result<DatabaseInfo> {
        let spec = self.cli(creds, WranglerCmdBuilder::d1_create(name));
        let output = run_checked(&self.runner, &spec)
            .await
            .with_context(|| format!("Failed to create database '{}'", name))?;

        if let Some(id) = parse_created_database_id(&output.text()) {
            return Ok(DatabaseInfo {
                id,
                name: name.to_string(),
            });
        }

        // Older CLI versions print no id; look it up.
        self.list_databases(creds)
            .await?
            .into_iter()
            .find(|db| db.name == name)
            .with_context(|| format!("Database '{}' was created but is not listed", name))
    }

    async fn delete_database(&self, creds: &Credentials, name: &str) -> Result<()> {
        let spec = self.cli(creds, WranglerCmdBuilder::d1_delete(name));
        run_checked(&self.runner, &spec)
            .await
            .with_context(|| format!("Failed to delete database '{}'", name))?;
        Ok(())
    }

    async fn put_secret(&self, creds: &Credentials, worker: &str, key: &str, value: &str) -> Result<()> {
        let spec = self
            .cli(creds, WranglerCmdBuilder::secret_put(worker, key))
            .stdin(value);
        run_checked(&self.runner, &spec)
            .await
            .with_context(|| format!("Failed to put secret {} on worker {}", key, worker))?;
        Ok(())
    }

    async fn delete_secret(&self, creds: &Credentials, worker: &str, key: &str) -> Result<()> {
        let spec = self
            .cli(creds, WranglerCmdBuilder::secret_delete(worker, key))
            .stdin("y\n");
        run_checked(&self.runner, &spec)
            .await
            .with_context(|| format!("Failed to delete secret {} from worker {}", key, worker))?;
        Ok(())
    }

    async fn probe(&self, url: &str) -> Result<ProbeResponse> {
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        let latency = started.elapsed();
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(ProbeResponse {
            status,
            latency,
            body: body.chars().take(PROBE_BODY_LIMIT).collect(),
        })
    }
}

fn parse_whoami(output: &str) -> Option<String> {
    let lower = output.to_ascii_lowercase();
    if lower.contains("not authenticated") || lower.contains("not logged in") {
        return None;
    }

    output
        .lines()
        .find_map(|line| {
            let (_, rest) = line.split_once("associated with the email")?;
            Some(rest.trim().trim_end_matches('.').to_string())
        })
        .or_else(|| Some("api-token".to_string()))
}

fn parse_database_list(output: &str) -> Result<Vec<DatabaseInfo>> {
    // The CLI may print banner lines before the JSON array.
    let start = output.find('[').context("No JSON array in database list output")?;
    serde_json::from_str(&output[start..]).context("Failed to parse database list")
}

fn parse_created_database_id(output: &str) -> Option<String> {
    let re = Regex::new(DATABASE_ID_PATTERN).ok()?;
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
