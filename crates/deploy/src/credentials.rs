//! Credential resolution.
//!
//! Each of the token, account id and zone id is taken from the first source that has it:
//! explicit flags, environment, the local cache, an operator prompt (token only), and finally
//! remote discovery through the platform using the resolved token.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    audit::{AuditLedger, AuditScope, EventType},
    error::DeployError,
    fs::FsHandler,
    operator::Operator,
    platform::{Account, Platform, Zone},
    process::CommandSpec,
};

pub const TOKEN_ENV: &str = "CLOUDFLARE_API_TOKEN";
pub const ACCOUNT_ENV: &str = "CLOUDFLARE_ACCOUNT_ID";
pub const ZONE_ENV: &str = "CLOUDFLARE_ZONE_ID";

/// Validated remote-access credentials. Immutable for the rest of the session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub account_id: String,
    pub zone_id: String,
    pub zone_name: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("zone_id", &self.zone_id)
            .field("zone_name", &self.zone_name)
            .finish()
    }
}

impl Credentials {
    /// Run `spec` with a cleared environment holding only system basics and these credentials.
    pub fn inject(&self, spec: CommandSpec) -> CommandSpec {
        spec.clear_env(true)
            .env(TOKEN_ENV, &self.token)
            .env(ACCOUNT_ENV, &self.account_id)
    }
}

/// Partially known credential values from one source.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialInputs {
    pub token: Option<String>,
    pub account_id: Option<String>,
    pub zone_id: Option<String>,
}

impl fmt::Debug for CredentialInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialInputs")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("account_id", &self.account_id)
            .field("zone_id", &self.zone_id)
            .finish()
    }
}

impl CredentialInputs {
    /// Read the standard environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            token: get(TOKEN_ENV),
            account_id: get(ACCOUNT_ENV),
            zone_id: get(ZONE_ENV),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.token.is_some() && self.account_id.is_some() && self.zone_id.is_some()
    }
}

/// Where a credential value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CredentialSource {
    Explicit,
    Environment,
    Cache,
    Prompt,
    Remote,
}

#[derive(Clone, Serialize, Deserialize)]
struct CacheEntry {
    token: String,
    account_id: Option<String>,
    zone_id: Option<String>,
    zone_name: Option<String>,
    /// Domain the zone was resolved for.
    domain: Option<String>,
    cached_at: DateTime<Utc>,
}

/// Opaque on-disk credential cache shared between invocations.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable cache is treated as empty.
    fn load(&self) -> Option<CacheEntry> {
        let encoded = match std::fs::read_to_string(&self.path) {
            Ok(encoded) => encoded,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read credential cache");
                return None;
            }
        };

        let decoded = BASE64
            .decode(encoded.trim())
            .context("invalid encoding")
            .and_then(|bytes| serde_json::from_slice(&bytes).context("invalid content"));
        match decoded {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring corrupted credential cache");
                None
            }
        }
    }

    fn store(&self, creds: &Credentials, domain: &str) -> Result<()> {
        let entry = CacheEntry {
            token: creds.token.clone(),
            account_id: Some(creds.account_id.clone()),
            zone_id: Some(creds.zone_id.clone()),
            zone_name: creds.zone_name.clone(),
            domain: Some(domain.to_string()),
            cached_at: Utc::now(),
        };
        let json = serde_json::to_vec(&entry).context("Failed to serialize credential cache")?;
        FsHandler::write_atomic(&self.path, BASE64.encode(json).as_bytes())
            .context("Failed to write credential cache")
    }
}

/// Resolves [`Credentials`] once per session.
pub struct CredentialProvider<'a, P: Platform> {
    platform: &'a P,
    operator: &'a dyn Operator,
    cache: Option<TokenCache>,
    resolved: Option<Credentials>,
}

impl<'a, P: Platform> CredentialProvider<'a, P> {
    pub fn new(platform: &'a P, operator: &'a dyn Operator) -> Self {
        Self {
            platform,
            operator,
            cache: None,
            resolved: None,
        }
    }

    pub fn with_cache(mut self, cache: TokenCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Resolve credentials for `domain`.
    ///
    /// When `explicit` and `env` together supply every value, no remote call and no prompt is
    /// made. Otherwise the token is verified before any id is derived remotely.
    pub async fn acquire(
        &mut self,
        domain: &str,
        explicit: CredentialInputs,
        env: CredentialInputs,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Result<Credentials> {
        if let Some(creds) = &self.resolved {
            return Ok(creds.clone());
        }

        let cached = self.cache.as_ref().and_then(TokenCache::load);

        let (token, token_source) = match pick(&explicit.token, &env.token) {
            Some(found) => found,
            None => match cached.as_ref().map(|c| c.token.clone()) {
                Some(token) => (token, CredentialSource::Cache),
                None => (self.prompt_token()?, CredentialSource::Prompt),
            },
        };

        let account = pick(&explicit.account_id, &env.account_id).or_else(|| {
            cached
                .as_ref()
                .and_then(|c| c.account_id.clone())
                .map(|id| (id, CredentialSource::Cache))
        });
        let zone = pick(&explicit.zone_id, &env.zone_id).or_else(|| {
            cached
                .as_ref()
                .filter(|c| c.domain.as_deref() == Some(domain))
                .and_then(|c| c.zone_id.clone())
                .map(|id| (id, CredentialSource::Cache))
        });
        let mut zone_name = cached
            .as_ref()
            .filter(|c| c.domain.as_deref() == Some(domain))
            .and_then(|c| c.zone_name.clone());

        let needs_remote = account.is_none() || zone.is_none();
        if needs_remote {
            tracing::info!("Verifying API token");
            if !self.platform.verify_token(&token).await? {
                ledger.record(
                    EventType::CredentialsRejected,
                    scope,
                    json!({ "token_source": token_source.to_string() }),
                );
                return Err(DeployError::InvalidCredential(format!(
                    "the {} token was rejected by the platform",
                    token_source
                ))
                .into());
            }
        }

        let account_id = match account {
            Some((id, source)) => (id, source),
            None => {
                let accounts = self.platform.list_accounts(&token).await?;
                let chosen = self.choose_account(accounts)?;
                tracing::info!(account = %chosen.name, "Account resolved");
                (chosen.id, CredentialSource::Remote)
            }
        };

        let zone_id = match zone {
            Some((id, source)) => (id, source),
            None => {
                let zones = self.platform.list_zones(&token, &account_id.0).await?;
                let chosen = self.choose_zone(domain, zones)?;
                tracing::info!(zone = %chosen.name, "Zone resolved");
                zone_name = Some(chosen.name);
                (chosen.id, CredentialSource::Remote)
            }
        };

        let creds = Credentials {
            token,
            account_id: account_id.0,
            zone_id: zone_id.0,
            zone_name,
        };

        if let Some(cache) = &self.cache
            && let Err(e) = cache.store(&creds, domain)
        {
            tracing::warn!(error = %e, "Credentials resolved but not cached");
        }

        ledger.record(
            EventType::CredentialsResolved,
            scope,
            json!({
                "token_source": token_source.to_string(),
                "account_source": account_id.1.to_string(),
                "zone_source": zone_id.1.to_string(),
                "account_id": creds.account_id,
                "zone_id": creds.zone_id,
                "verified": needs_remote,
            }),
        );

        self.resolved = Some(creds.clone());
        Ok(creds)
    }

    fn prompt_token(&self) -> Result<String> {
        if !self.operator.is_interactive() {
            return Err(DeployError::InvalidCredential(format!(
                "no API token supplied (set {} or pass --token)",
                TOKEN_ENV
            ))
            .into());
        }
        self.operator.ask_secret("API token")
    }

    fn choose_account(&self, accounts: Vec<Account>) -> Result<Account> {
        let options: Vec<String> = accounts
            .iter()
            .map(|a| format!("{} ({})", a.name, a.id))
            .collect();
        let index = self.choose("account", &options)?;
        accounts
            .into_iter()
            .nth(index)
            .context("Selected account is out of range")
    }

    fn choose_zone(&self, domain: &str, zones: Vec<Zone>) -> Result<Zone> {
        let mut candidates: Vec<Zone> = zones.into_iter().filter(|z| z.covers(domain)).collect();
        // Most specific zone first.
        candidates.sort_by(|a, b| b.name.len().cmp(&a.name.len()));

        if candidates.is_empty() {
            anyhow::bail!(
                "No zone in this account covers {}; add the domain to the account or pass --zone-id",
                domain
            );
        }

        let options: Vec<String> = candidates
            .iter()
            .map(|z| format!("{} ({})", z.name, z.id))
            .collect();
        let index = self.choose("zone", &options)?;
        candidates
            .into_iter()
            .nth(index)
            .context("Selected zone is out of range")
    }

    /// Single candidates are taken as is; several need an operator choice.
    fn choose(&self, kind: &str, options: &[String]) -> Result<usize> {
        match options.len() {
            0 => anyhow::bail!(
                "No {} is visible to this token; check the token's permissions",
                kind
            ),
            1 => Ok(0),
            candidates if !self.operator.is_interactive() => Err(DeployError::AmbiguousResource {
                kind: kind.to_string(),
                candidates,
            }
            .into()),
            _ => self
                .operator
                .ask_choice(&format!("Select the {} to deploy to", kind), options, 0),
        }
    }
}

fn pick(explicit: &Option<String>, env: &Option<String>) -> Option<(String, CredentialSource)> {
    explicit
        .clone()
        .map(|v| (v, CredentialSource::Explicit))
        .or_else(|| env.clone().map(|v| (v, CredentialSource::Environment)))
}
