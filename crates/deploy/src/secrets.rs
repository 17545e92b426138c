//! Worker secret generation, persistence and upload.
//!
//! Secret material lives in `<state>/secrets/<domain>.json` (owner-only). Values are uploaded
//! one key at a time and every successful upload gets its own compensating delete. The
//! optional distribution bundle is a convenience copy for the people consuming the worker
//! and is never part of rollback.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::{
    audit::{AuditLedger, AuditScope, EventType},
    config::SecretSettings,
    credentials::Credentials,
    fs::FsHandler,
    operator::Operator,
    platform::Platform,
    rollback::{RollbackAction, RollbackRegistry},
    state::SecretsConfig,
};

const DISTRIBUTION_ENV_FILE: &str = ".env";
const DISTRIBUTION_MANIFEST_FILE: &str = "manifest.json";

/// Generated secret values for one domain.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMaterial {
    pub domain: String,
    pub environment: String,
    pub generated_at: DateTime<Utc>,
    pub values: BTreeMap<String, String>,
}

impl std::fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretMaterial")
            .field("domain", &self.domain)
            .field("environment", &self.environment)
            .field("generated_at", &self.generated_at)
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretMaterial {
    /// Fresh random values for `keys`, hex-encoded.
    pub fn generate(domain: &str, environment: &str, keys: &[String], length_bytes: usize) -> Self {
        let mut rng = rand::rng();
        let values = keys
            .iter()
            .map(|key| {
                let mut bytes = vec![0u8; length_bytes];
                rng.fill_bytes(&mut bytes);
                (key.clone(), hex::encode(bytes))
            })
            .collect();

        Self {
            domain: domain.to_string(),
            environment: environment.to_string(),
            generated_at: Utc::now(),
            values,
        }
    }

    pub fn path(dir: &Path, domain: &str) -> PathBuf {
        dir.join(format!("{}.json", domain))
    }

    pub fn load(dir: &Path, domain: &str) -> Result<Option<Self>> {
        FsHandler::read_json(&Self::path(dir, domain))
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path(dir, &self.domain);
        FsHandler::write_json_atomic(&path, self).context("Failed to persist secret material")?;
        Ok(path)
    }

    fn covers(&self, keys: &[String]) -> bool {
        keys.iter().all(|k| self.values.contains_key(k))
    }

    fn into_config(self, reused: bool) -> SecretsConfig {
        SecretsConfig {
            keys: self.values,
            distribution_path: None,
            reused,
        }
    }
}

pub fn fingerprint(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionEntry {
    pub name: String,
    pub sha256: String,
}

/// Written next to the `.env` file so consumers can check they hold the current values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionManifest {
    pub domain: String,
    pub environment: String,
    pub worker: String,
    pub generated_at: DateTime<Utc>,
    pub secrets: Vec<DistributionEntry>,
}

/// Write `.env` and `manifest.json` under `<dir>/<domain>/`.
pub fn emit_distribution(dir: &Path, worker: &str, material: &SecretMaterial) -> Result<PathBuf> {
    let bundle = dir.join(&material.domain);

    let env_file: String = material
        .values
        .iter()
        .map(|(key, value)| format!("{}={}\n", key, value))
        .collect();
    FsHandler::write_atomic(&bundle.join(DISTRIBUTION_ENV_FILE), env_file.as_bytes())?;

    let manifest = DistributionManifest {
        domain: material.domain.clone(),
        environment: material.environment.clone(),
        worker: worker.to_string(),
        generated_at: material.generated_at,
        secrets: material
            .values
            .iter()
            .map(|(name, value)| DistributionEntry {
                name: name.clone(),
                sha256: fingerprint(value),
            })
            .collect(),
    };
    FsHandler::write_json_atomic(&bundle.join(DISTRIBUTION_MANIFEST_FILE), &manifest)?;

    Ok(bundle)
}

pub struct SecretWorkflow<'a, P: Platform> {
    platform: &'a P,
    operator: &'a dyn Operator,
    creds: &'a Credentials,
    settings: &'a SecretSettings,
    secrets_dir: PathBuf,
    distribution_dir: PathBuf,
    dry_run: bool,
}

impl<'a, P: Platform> SecretWorkflow<'a, P> {
    pub fn new(
        platform: &'a P,
        operator: &'a dyn Operator,
        creds: &'a Credentials,
        settings: &'a SecretSettings,
        secrets_dir: impl Into<PathBuf>,
        distribution_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            platform,
            operator,
            creds,
            settings,
            secrets_dir: secrets_dir.into(),
            distribution_dir: distribution_dir.into(),
            dry_run: false,
        }
    }

    /// Generate without persisting or uploading.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Reuse or regenerate the secrets of `worker` and upload new ones.
    ///
    /// Stops at the first failed upload; only keys uploaded before it have compensating
    /// actions.
    pub async fn handle_secret_management(
        &self,
        domain: &str,
        environment: &str,
        worker: &str,
        registry: &mut RollbackRegistry,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Result<SecretsConfig> {
        if let Some(existing) = self.reusable(domain, environment)? {
            let reuse = self.operator.ask_yes_no(
                &format!(
                    "Secrets for {} were generated at {}. Reuse them?",
                    domain,
                    existing.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                true,
            )?;
            if reuse {
                tracing::info!(domain, keys = existing.values.len(), "Reusing secret material");
                ledger.record(
                    EventType::SecretsReused,
                    scope,
                    json!({ "keys": existing.values.keys().collect::<Vec<_>>() }),
                );
                return Ok(existing.into_config(true));
            }
        }

        let material = SecretMaterial::generate(
            domain,
            environment,
            &self.settings.keys,
            self.settings.length_bytes,
        );
        ledger.record(
            EventType::SecretsGenerated,
            scope,
            json!({ "keys": material.values.keys().collect::<Vec<_>>(), "dry_run": self.dry_run }),
        );

        if self.dry_run {
            tracing::info!(domain, "Dry run: secrets generated but not stored or uploaded");
            return Ok(material.into_config(false));
        }

        let path = SecretMaterial::path(&self.secrets_dir, domain);
        let existed = path.exists();
        material.save(&self.secrets_dir)?;
        if !existed {
            registry.register_audited(RollbackAction::remove_local_file(&path), ledger, scope);
        }

        for (key, value) in &material.values {
            match self.platform.put_secret(self.creds, worker, key, value).await {
                Ok(()) => {
                    tracing::info!(worker, key = %key, "Secret uploaded");
                    registry.register_audited(RollbackAction::delete_secret(worker, key), ledger, scope);
                    ledger.record(
                        EventType::SecretDeployed,
                        scope,
                        json!({ "worker": worker, "key": key, "sha256": fingerprint(value) }),
                    );
                }
                Err(e) => {
                    ledger.record(
                        EventType::SecretDeployFailed,
                        scope,
                        json!({ "worker": worker, "key": key, "error": format!("{:#}", e) }),
                    );
                    return Err(e).with_context(|| format!("Failed to upload secret {} to {}", key, worker));
                }
            }
        }

        let distribution_path = self.distribute(worker, &material, ledger, scope);
        let mut config = material.into_config(false);
        config.distribution_path = distribution_path;
        Ok(config)
    }

    fn reusable(&self, domain: &str, environment: &str) -> Result<Option<SecretMaterial>> {
        let Some(material) = SecretMaterial::load(&self.secrets_dir, domain)? else {
            return Ok(None);
        };
        if material.environment != environment {
            tracing::debug!(stored = %material.environment, environment, "Stored secrets belong to another environment");
            return Ok(None);
        }
        if !material.covers(&self.settings.keys) {
            tracing::info!(domain, "Stored secrets lack configured keys, regenerating");
            return Ok(None);
        }
        Ok(Some(material))
    }

    /// Failures here are reported and swallowed.
    fn distribute(
        &self,
        worker: &str,
        material: &SecretMaterial,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Option<PathBuf> {
        if !self.settings.emit_distribution {
            return None;
        }
        match self.operator.ask_yes_no("Write the secret distribution bundle?", true) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping distribution bundle");
                return None;
            }
        }

        match emit_distribution(&self.distribution_dir, worker, material) {
            Ok(bundle) => {
                self.operator
                    .notify(&format!("Secret bundle written to {}", bundle.display()));
                ledger.record(
                    EventType::DistributionEmitted,
                    scope,
                    json!({ "path": bundle.display().to_string() }),
                );
                Some(bundle)
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Failed to write distribution bundle");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::{
        config::AuditSettings,
        rollback::RollbackKind,
        testing::{FakePlatform, ScriptedOperator},
    };

    fn creds() -> Credentials {
        Credentials {
            token: "tok".to_string(),
            account_id: FakePlatform::ACCOUNT_ID.to_string(),
            zone_id: FakePlatform::ZONE_ID.to_string(),
            zone_name: None,
        }
    }

    struct Fixture {
        temp_dir: TempDir,
        ledger: AuditLedger,
        registry: RollbackRegistry,
        settings: SecretSettings,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new("edgeship-secrets").expect("Failed to create temp dir");
        let ledger = AuditLedger::open(temp_dir.path().join("audit"), &AuditSettings::default()).unwrap();
        Fixture {
            temp_dir,
            ledger,
            registry: RollbackRegistry::default(),
            settings: SecretSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_generate_persist_and_upload() {
        let mut fx = fixture();
        let platform = FakePlatform::new();
        let operator = ScriptedOperator::non_interactive();
        let creds = creds();
        let root = fx.temp_dir.path().to_path_buf();

        let secrets = SecretWorkflow::new(&platform, &operator, &creds, &fx.settings, root.join("secrets"), root.join("dist"))
            .handle_secret_management("example.com", "production", "api", &mut fx.registry, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap();

        assert_eq!(secrets.keys.len(), 2);
        assert!(secrets.keys.values().all(|v| v.len() == 64));
        assert_eq!(fx.registry.count(RollbackKind::DeleteSecret), 2);
        assert_eq!(fx.registry.count(RollbackKind::RemoveLocalFile), 1);
        assert_eq!(
            platform.secret_value("api", "API_SECRET").as_deref(),
            secrets.keys.get("API_SECRET").map(String::as_str)
        );

        let stored = SecretMaterial::load(&root.join("secrets"), "example.com").unwrap().unwrap();
        assert_eq!(stored.values, secrets.keys);

        let bundle = secrets.distribution_path.expect("bundle");
        let manifest: DistributionManifest = FsHandler::read_json(&bundle.join(DISTRIBUTION_MANIFEST_FILE))
            .unwrap()
            .unwrap();
        assert_eq!(manifest.secrets.len(), 2);
        assert_eq!(manifest.secrets[0].sha256, fingerprint(&secrets.keys["API_SECRET"]));
        let env_file = std::fs::read_to_string(bundle.join(DISTRIBUTION_ENV_FILE)).unwrap();
        assert!(env_file.starts_with("API_SECRET="));
    }

    #[tokio::test]
    async fn test_reuse_uploads_nothing() {
        let mut fx = fixture();
        let root = fx.temp_dir.path().to_path_buf();
        let material = SecretMaterial::generate("example.com", "production", &fx.settings.keys, 16);
        material.save(&root.join("secrets")).unwrap();

        let platform = FakePlatform::new();
        let operator = ScriptedOperator::non_interactive();
        let creds = creds();

        let secrets = SecretWorkflow::new(&platform, &operator, &creds, &fx.settings, root.join("secrets"), root.join("dist"))
            .handle_secret_management("example.com", "production", "api", &mut fx.registry, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap();

        assert!(secrets.reused);
        assert_eq!(secrets.keys, material.values);
        assert_eq!(platform.call_count(), 0);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_other_environment_material_is_not_reused() {
        let mut fx = fixture();
        let root = fx.temp_dir.path().to_path_buf();
        SecretMaterial::generate("example.com", "staging", &fx.settings.keys, 16)
            .save(&root.join("secrets"))
            .unwrap();

        let platform = FakePlatform::new();
        let operator = ScriptedOperator::non_interactive();
        let creds = creds();

        let secrets = SecretWorkflow::new(&platform, &operator, &creds, &fx.settings, root.join("secrets"), root.join("dist"))
            .handle_secret_management("example.com", "production", "api", &mut fx.registry, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap();

        assert!(!secrets.reused);
        // The material file already existed, so only the uploads are compensated.
        assert_eq!(fx.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_kth_upload_failure_keeps_earlier_actions() {
        let mut fx = fixture();
        fx.settings.keys = vec!["A".to_string(), "B".to_string(), "C".to_string(), "D".to_string()];
        fx.settings.emit_distribution = false;
        let root = fx.temp_dir.path().to_path_buf();
        let platform = FakePlatform::new().fail_secret_put_at(3);
        let operator = ScriptedOperator::non_interactive();
        let creds = creds();

        let err = SecretWorkflow::new(&platform, &operator, &creds, &fx.settings, root.join("secrets"), root.join("dist"))
            .handle_secret_management("example.com", "production", "api", &mut fx.registry, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Failed to upload secret C"));
        assert_eq!(fx.registry.count(RollbackKind::DeleteSecret), 2);
        assert_eq!(platform.calls_to("put_secret"), 3);
        assert_eq!(fx.ledger.session().count(EventType::SecretDeployFailed), 1);
    }

    #[tokio::test]
    async fn test_declined_bundle_is_skipped() {
        let mut fx = fixture();
        let root = fx.temp_dir.path().to_path_buf();
        let platform = FakePlatform::new();
        let operator = ScriptedOperator::new().no();
        let creds = creds();

        let secrets = SecretWorkflow::new(&platform, &operator, &creds, &fx.settings, root.join("secrets"), root.join("dist"))
            .handle_secret_management("example.com", "production", "api", &mut fx.registry, &mut fx.ledger, &AuditScope::none())
            .await
            .unwrap();

        assert_eq!(secrets.distribution_path, None);
        assert!(!root.join("dist").exists());
        assert_eq!(fx.registry.count(RollbackKind::DeleteSecret), 2);
    }

    #[test]
    fn test_debug_hides_values() {
        let material = SecretMaterial::generate("example.com", "production", &["K".to_string()], 8);
        let rendered = format!("{:?}", material);
        assert!(!rendered.contains(&material.values["K"]));
    }
}
