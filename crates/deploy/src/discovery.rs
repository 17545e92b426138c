//! Local configuration discovery.
//!
//! Manifests are found by an ordered list of strategies, the first hit wins:
//! `wrangler.<env>.toml`, then `wrangler.toml`, then `package.json` (worker name only).
//! Values from a previous run are read from the stored configuration and combined with the
//! operator's explicit values by the typed merge functions at the bottom of this module.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::fs::FsHandler;

pub const ROOT_MANIFEST: &str = "wrangler.toml";
pub const PACKAGE_MANIFEST: &str = "package.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ManifestSource {
    EnvironmentManifest,
    RootManifest,
    PackageMetadata,
}

/// A database binding declared by a manifest. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestBinding {
    pub binding: Option<String>,
    pub database_name: Option<String>,
    pub database_id: Option<String>,
}

/// What a manifest declares, with the environment section already applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub path: PathBuf,
    pub source: ManifestSource,
    pub name: Option<String>,
    pub main: Option<String>,
    pub compatibility_date: Option<String>,
    pub routes: Vec<String>,
    /// Names of the `[env.*]` sections.
    pub environments: Vec<String>,
    pub databases: Vec<ManifestBinding>,
    /// Keys present at the top level, used for mandatory-key checks.
    pub keys: BTreeSet<String>,
}

impl Manifest {
    /// Parse a wrangler TOML manifest and apply the `environment` section when present.
    pub fn load_toml(path: &Path, source: ManifestSource, environment: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let table: Table = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Self::from_table(path, source, &table, environment))
    }

    fn from_table(path: &Path, source: ManifestSource, table: &Table, environment: &str) -> Self {
        let env_sections = table.get("env").and_then(Value::as_table);
        let environments = env_sections
            .map(|envs| envs.keys().cloned().collect())
            .unwrap_or_default();
        let section = env_sections
            .and_then(|envs| envs.get(environment))
            .and_then(Value::as_table);

        let base_name = str_field(table, "name");
        // A section without its own name deploys as `<name>-<env>`.
        let name = match section {
            Some(section) => str_field(section, "name")
                .or_else(|| base_name.map(|n| format!("{}-{}", n, environment))),
            None => base_name,
        };

        // Routes and bindings are not inherited by environment sections.
        let scoped = section.unwrap_or(table);

        Self {
            path: path.to_path_buf(),
            source,
            name,
            main: str_field(scoped, "main").or_else(|| str_field(table, "main")),
            compatibility_date: str_field(scoped, "compatibility_date")
                .or_else(|| str_field(table, "compatibility_date")),
            routes: routes(scoped),
            environments,
            databases: bindings(scoped),
            keys: table.keys().cloned().collect(),
        }
    }

    /// Whether the manifest has a section for `environment`.
    pub fn declares_environment(&self, environment: &str) -> bool {
        self.environments.iter().any(|e| e == environment)
    }

    /// Whether the file is not the one the provider CLI picks up by default.
    pub fn is_non_default_path(&self) -> bool {
        self.path
            .file_name()
            .is_some_and(|name| name != ROOT_MANIFEST)
    }

    pub fn is_deployable(&self) -> bool {
        self.source != ManifestSource::PackageMetadata
    }
}

fn str_field(table: &Table, key: &str) -> Option<String> {
    table
        .get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .filter(|s| !s.trim().is_empty())
}

/// `route = "..."`, `routes = ["..."]` and `routes = [{ pattern = "..." }]` are all accepted.
fn routes(table: &Table) -> Vec<String> {
    let mut routes = Vec::new();
    if let Some(route) = table.get("route") {
        routes.extend(route_pattern(route));
    }
    if let Some(list) = table.get("routes").and_then(Value::as_array) {
        routes.extend(list.iter().filter_map(route_pattern));
    }
    routes
}

fn route_pattern(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Table(t) => str_field(t, "pattern"),
        _ => None,
    }
}

fn bindings(table: &Table) -> Vec<ManifestBinding> {
    table
        .get("d1_databases")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_table)
                .map(|t| ManifestBinding {
                    binding: str_field(t, "binding"),
                    database_name: str_field(t, "database_name"),
                    database_id: str_field(t, "database_id"),
                })
                .collect()
        })
        .unwrap_or_default()
}

type Strategy = fn(&Path, &str) -> Option<Manifest>;

/// Manifest strategies, most specific first.
const STRATEGIES: &[(&str, Strategy)] = &[
    ("environment manifest", environment_manifest),
    ("root manifest", root_manifest),
    ("package metadata", package_metadata),
];

/// TOML manifests that apply to `environment`, most specific first.
pub fn manifest_candidates(dir: &Path, environment: &str) -> [(PathBuf, ManifestSource); 2] {
    [
        (
            dir.join(format!("wrangler.{}.toml", environment)),
            ManifestSource::EnvironmentManifest,
        ),
        (dir.join(ROOT_MANIFEST), ManifestSource::RootManifest),
    ]
}

fn environment_manifest(dir: &Path, environment: &str) -> Option<Manifest> {
    let [(path, source), _] = manifest_candidates(dir, environment);
    load_if_present(&path, source, environment)
}

fn root_manifest(dir: &Path, environment: &str) -> Option<Manifest> {
    let [_, (path, source)] = manifest_candidates(dir, environment);
    load_if_present(&path, source, environment)
}

fn load_if_present(path: &Path, source: ManifestSource, environment: &str) -> Option<Manifest> {
    if !path.is_file() {
        return None;
    }
    match Manifest::load_toml(path, source, environment) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "Skipping unreadable manifest");
            None
        }
    }
}

fn package_metadata(dir: &Path, _environment: &str) -> Option<Manifest> {
    let path = dir.join(PACKAGE_MANIFEST);
    let content = std::fs::read_to_string(&path).ok()?;
    let json: serde_json::Value = serde_json::from_str(&content).ok()?;
    // Scoped package names (`@org/name`) are not valid worker names.
    let name = json
        .get("name")
        .and_then(serde_json::Value::as_str)
        .map(|n| n.rsplit('/').next().unwrap_or(n).to_string())
        .filter(|n| !n.is_empty())?;

    Some(Manifest {
        path,
        source: ManifestSource::PackageMetadata,
        name: Some(name),
        main: json
            .get("main")
            .and_then(serde_json::Value::as_str)
            .map(String::from),
        compatibility_date: None,
        routes: Vec::new(),
        environments: Vec::new(),
        databases: Vec::new(),
        keys: BTreeSet::new(),
    })
}

/// Identifiers remembered from the last successful deployment of a domain/environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConfig {
    pub domain: String,
    pub environment: String,
    pub worker_name: Option<String>,
    pub worker_url: Option<String>,
    pub database_name: Option<String>,
    pub database_id: Option<String>,
    pub account_id: Option<String>,
    pub zone_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StoredConfig {
    pub fn path(dir: &Path, domain: &str, environment: &str) -> PathBuf {
        dir.join(format!("{}-{}.json", slug(domain), slug(environment)))
    }

    pub fn load(dir: &Path, domain: &str, environment: &str) -> Result<Option<Self>> {
        FsHandler::read_json(&Self::path(dir, domain, environment))
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path(dir, &self.domain, &self.environment);
        FsHandler::write_json_atomic(&path, self)
            .with_context(|| format!("Failed to save stored configuration for {}", self.domain))?;
        Ok(path)
    }
}

/// Everything discovery found for one domain/environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredConfig {
    pub manifest: Option<Manifest>,
    pub stored: Option<StoredConfig>,
}

impl DiscoveredConfig {
    /// No live endpoint is known for this domain/environment yet.
    pub fn is_first_deployment(&self) -> bool {
        self.stored
            .as_ref()
            .is_none_or(|stored| stored.worker_url.is_none())
    }

    pub fn routes(&self) -> &[String] {
        self.manifest
            .as_ref()
            .map(|m| m.routes.as_slice())
            .unwrap_or_default()
    }

    /// The manifest the provider CLI should deploy from, if any.
    pub fn deploy_manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref().filter(|m| m.is_deployable())
    }
}

/// Finds manifests in the project directory and stored configuration in the state directory.
#[derive(Debug, Clone)]
pub struct ResourceDiscovery {
    project_dir: PathBuf,
    configs_dir: PathBuf,
}

impl ResourceDiscovery {
    pub fn new(project_dir: impl Into<PathBuf>, configs_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            configs_dir: configs_dir.into(),
        }
    }

    pub fn configs_dir(&self) -> &Path {
        &self.configs_dir
    }

    /// Run the manifest strategies and load stored identifiers.
    pub fn discover(&self, domain: &str, environment: &str) -> Result<DiscoveredConfig> {
        let manifest = STRATEGIES.iter().find_map(|(label, strategy)| {
            let found = strategy(&self.project_dir, environment)?;
            tracing::info!(strategy = label, path = %found.path.display(), "Manifest discovered");
            Some(found)
        });
        if manifest.is_none() {
            tracing::info!(dir = %self.project_dir.display(), "No manifest found, using defaults");
        }

        let stored = StoredConfig::load(&self.configs_dir, domain, environment)?;
        if stored.is_some() {
            tracing::debug!(domain, environment, "Stored configuration found");
        }

        Ok(DiscoveredConfig { manifest, stored })
    }
}

/// Values supplied by the operator on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub worker_name: Option<String>,
    pub database_name: Option<String>,
}

/// Lowercase, alphanumerics and single dashes.
pub fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Worker name: explicit > manifest > stored > domain slug.
pub fn merge_worker_name(
    overrides: &ConfigOverrides,
    discovered: &DiscoveredConfig,
    domain: &str,
) -> String {
    overrides
        .worker_name
        .clone()
        .or_else(|| discovered.manifest.as_ref().and_then(|m| m.name.clone()))
        .or_else(|| {
            discovered
                .stored
                .as_ref()
                .and_then(|s| s.worker_name.clone())
        })
        .unwrap_or_else(|| slug(domain))
}

/// Proposed database name: explicit > manifest binding > stored > `<domain>-<env>-db`.
pub fn merge_database_name(
    overrides: &ConfigOverrides,
    discovered: &DiscoveredConfig,
    domain: &str,
    environment: &str,
) -> String {
    overrides
        .database_name
        .clone()
        .or_else(|| {
            discovered
                .manifest
                .as_ref()
                .and_then(|m| m.databases.iter().find_map(|b| b.database_name.clone()))
        })
        .or_else(|| {
            discovered
                .stored
                .as_ref()
                .and_then(|s| s.database_name.clone())
        })
        .unwrap_or_else(|| default_database_name(domain, environment))
}

pub fn default_database_name(domain: &str, environment: &str) -> String {
    format!("{}-{}-db", slug(domain), slug(environment))
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    const MANIFEST: &str = r#"
name = "edge-api"
main = "src/index.ts"
compatibility_date = "2024-09-01"
routes = [{ pattern = "api.example.com/*", zone_name = "example.com" }]

[[d1_databases]]
binding = "DB"
database_name = "edge-api-db"
database_id = "1111-2222"

[env.staging]
route = "staging.example.com/*"

[[env.staging.d1_databases]]
binding = "DB"
database_name = "edge-api-staging-db"
"#;

    #[test]
    fn test_root_manifest_fields() {
        let temp_dir = TempDir::new("edgeship-discovery").expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join(ROOT_MANIFEST), MANIFEST).unwrap();

        let discovery = ResourceDiscovery::new(temp_dir.path(), temp_dir.path().join("configs"));
        let found = discovery.discover("example.com", "production").unwrap();
        let manifest = found.manifest.expect("manifest");

        assert_eq!(manifest.source, ManifestSource::RootManifest);
        assert_eq!(manifest.name.as_deref(), Some("edge-api"));
        assert_eq!(manifest.routes, vec!["api.example.com/*"]);
        assert_eq!(manifest.databases[0].database_id.as_deref(), Some("1111-2222"));
        assert!(!manifest.declares_environment("production"));
        assert!(manifest.keys.contains("compatibility_date"));
        assert!(!manifest.is_non_default_path());
    }

    #[test]
    fn test_environment_section_applies() {
        let temp_dir = TempDir::new("edgeship-discovery").expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join(ROOT_MANIFEST), MANIFEST).unwrap();

        let discovery = ResourceDiscovery::new(temp_dir.path(), temp_dir.path().join("configs"));
        let manifest = discovery
            .discover("example.com", "staging")
            .unwrap()
            .manifest
            .unwrap();

        assert!(manifest.declares_environment("staging"));
        assert_eq!(manifest.name.as_deref(), Some("edge-api-staging"));
        assert_eq!(manifest.routes, vec!["staging.example.com/*"]);
        assert_eq!(manifest.databases.len(), 1);
        assert_eq!(manifest.databases[0].database_id, None);
        assert_eq!(manifest.main.as_deref(), Some("src/index.ts"));
    }

    #[test]
    fn test_most_specific_manifest_wins() {
        let temp_dir = TempDir::new("edgeship-discovery").expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join(ROOT_MANIFEST), MANIFEST).unwrap();
        std::fs::write(
            temp_dir.path().join("wrangler.production.toml"),
            "name = \"edge-api-prod\"\n",
        )
        .unwrap();

        let discovery = ResourceDiscovery::new(temp_dir.path(), temp_dir.path().join("configs"));
        let manifest = discovery
            .discover("example.com", "production")
            .unwrap()
            .manifest
            .unwrap();
        assert_eq!(manifest.source, ManifestSource::EnvironmentManifest);
        assert_eq!(manifest.name.as_deref(), Some("edge-api-prod"));
        assert!(manifest.is_non_default_path());
        assert!(manifest.routes.is_empty());
    }

    #[test]
    fn test_package_json_fallback_and_broken_manifest() {
        let temp_dir = TempDir::new("edgeship-discovery").expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join(ROOT_MANIFEST), "name = [broken").unwrap();
        std::fs::write(
            temp_dir.path().join(PACKAGE_MANIFEST),
            r#"{"name": "@acme/billing-worker", "version": "1.0.0"}"#,
        )
        .unwrap();

        let discovery = ResourceDiscovery::new(temp_dir.path(), temp_dir.path().join("configs"));
        let found = discovery.discover("example.com", "production").unwrap();
        let manifest = found.manifest.clone().unwrap();
        assert_eq!(manifest.source, ManifestSource::PackageMetadata);
        assert_eq!(manifest.name.as_deref(), Some("billing-worker"));
        assert!(found.deploy_manifest().is_none());
    }

    #[test]
    fn test_merge_precedence() {
        let temp_dir = TempDir::new("edgeship-discovery").expect("Failed to create temp dir");
        let configs = temp_dir.path().join("configs");
        StoredConfig {
            domain: "example.com".to_string(),
            environment: "production".to_string(),
            worker_name: Some("stored-worker".to_string()),
            worker_url: Some("https://stored-worker.workers.dev".to_string()),
            database_name: Some("stored-db".to_string()),
            ..Default::default()
        }
        .save(&configs)
        .unwrap();

        let discovery = ResourceDiscovery::new(temp_dir.path(), &configs);
        let found = discovery.discover("example.com", "production").unwrap();
        assert!(!found.is_first_deployment());

        let none = ConfigOverrides::default();
        assert_eq!(merge_worker_name(&none, &found, "example.com"), "stored-worker");
        assert_eq!(
            merge_database_name(&none, &found, "example.com", "production"),
            "stored-db"
        );

        let explicit = ConfigOverrides {
            worker_name: Some("flag-worker".to_string()),
            database_name: None,
        };
        assert_eq!(merge_worker_name(&explicit, &found, "example.com"), "flag-worker");

        let empty = DiscoveredConfig::default();
        assert!(empty.is_first_deployment());
        assert_eq!(merge_worker_name(&none, &empty, "Example.com"), "example-com");
        assert_eq!(
            merge_database_name(&none, &empty, "example.com", "production"),
            "example-com-production-db"
        );
    }
}
