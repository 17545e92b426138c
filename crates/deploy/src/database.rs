//! Idempotent database provisioning.

use anyhow::{Context, Result};
use serde_json::json;

use crate::{
    audit::{AuditLedger, AuditScope, EventType},
    credentials::Credentials,
    discovery::default_database_name,
    operator::Operator,
    platform::{DatabaseInfo, Platform},
    rollback::{RollbackAction, RollbackRegistry},
    state::DatabaseConfig,
};

/// What to do with a database that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
enum ExistingChoice {
    Reuse,
    Rename,
    Recreate,
}

impl ExistingChoice {
    const ALL: [ExistingChoice; 3] = [Self::Reuse, Self::Rename, Self::Recreate];

    fn label(self) -> &'static str {
        match self {
            Self::Reuse => "Reuse the existing database",
            Self::Rename => "Create a new database with a different name",
            Self::Recreate => "Delete it and create a fresh one (all data is lost)",
        }
    }
}

pub struct DatabaseWorkflow<'a, P: Platform> {
    platform: &'a P,
    operator: &'a dyn Operator,
    creds: &'a Credentials,
    dry_run: bool,
}

impl<'a, P: Platform> DatabaseWorkflow<'a, P> {
    pub fn new(platform: &'a P, operator: &'a dyn Operator, creds: &'a Credentials) -> Self {
        Self {
            platform,
            operator,
            creds,
            dry_run: false,
        }
    }

    /// Only query; never create or delete.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Make sure a database exists for `domain`/`environment` and return its identifiers.
    ///
    /// A database created here gets exactly one compensating delete in `registry`. Reusing an
    /// existing one registers nothing.
    pub async fn handle_database_setup(
        &self,
        domain: &str,
        environment: &str,
        suggested_name: Option<&str>,
        registry: &mut RollbackRegistry,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Result<DatabaseConfig> {
        let proposed = suggested_name
            .map(String::from)
            .unwrap_or_else(|| default_database_name(domain, environment));
        let mut name = if self.operator.is_interactive() {
            self.operator.ask_text("Database name", Some(&proposed))?
        } else {
            proposed
        };

        loop {
            let Some(existing) = self.find(&name).await? else {
                return self.create(&name, false, registry, ledger, scope).await;
            };

            if self.dry_run || !self.operator.is_interactive() {
                return Ok(self.reuse(existing, ledger, scope));
            }

            let options: Vec<String> = ExistingChoice::ALL.iter().map(|c| c.label().to_string()).collect();
            let index = self.operator.ask_choice(
                &format!("Database '{}' already exists ({})", existing.name, existing.id),
                &options,
                0,
            )?;
            let choice = ExistingChoice::ALL
                .get(index)
                .copied()
                .context("Selected option is out of range")?;
            tracing::debug!(database = %name, choice = %choice, "Existing database");

            match choice {
                ExistingChoice::Reuse => return Ok(self.reuse(existing, ledger, scope)),
                ExistingChoice::Rename => {
                    let fallback = format!("{}-2", name);
                    name = self.operator.ask_text("New database name", Some(&fallback))?;
                }
                ExistingChoice::Recreate => {
                    let confirmed = self.operator.ask_yes_no(
                        &format!(
                            "Permanently delete database '{}' and all of its data?",
                            existing.name
                        ),
                        false,
                    )?;
                    if !confirmed {
                        continue;
                    }

                    self.platform
                        .delete_database(self.creds, &existing.name)
                        .await
                        .with_context(|| format!("Failed to delete database '{}'", existing.name))?;
                    // The deleted original cannot be restored by any rollback.
                    tracing::warn!(database = %existing.name, id = %existing.id, "Database deleted, this cannot be undone");
                    ledger.record(
                        EventType::DatabaseDeleted,
                        scope,
                        json!({
                            "name": existing.name,
                            "id": existing.id,
                            "irreversible": true,
                        }),
                    );
                    return self.create(&name, true, registry, ledger, scope).await;
                }
            }
        }
    }

    async fn find(&self, name: &str) -> Result<Option<DatabaseInfo>> {
        let databases = self
            .platform
            .list_databases(self.creds)
            .await
            .context("Failed to list databases")?;
        Ok(databases.into_iter().find(|db| db.name == name))
    }

    fn reuse(&self, existing: DatabaseInfo, ledger: &mut AuditLedger, scope: &AuditScope) -> DatabaseConfig {
        tracing::info!(database = %existing.name, id = %existing.id, "Reusing database");
        ledger.record(
            EventType::DatabaseReused,
            scope,
            json!({ "name": existing.name, "id": existing.id }),
        );
        DatabaseConfig {
            name: existing.name,
            id: Some(existing.id),
            created: false,
            reused: true,
        }
    }

    async fn create(
        &self,
        name: &str,
        replaced: bool,
        registry: &mut RollbackRegistry,
        ledger: &mut AuditLedger,
        scope: &AuditScope,
    ) -> Result<DatabaseConfig> {
        if self.dry_run {
            tracing::info!(database = %name, "Dry run: database would be created");
            return Ok(DatabaseConfig {
                name: name.to_string(),
                id: None,
                created: false,
                reused: false,
            });
        }

        tracing::info!(database = %name, "Creating database");
        let created = self
            .platform
            .create_database(self.creds, name)
            .await
            .with_context(|| format!("Failed to create database '{}'", name))?;

        registry.register_audited(
            RollbackAction::delete_database(&created.name, Some(created.id.clone())),
            ledger,
            scope,
        );
        ledger.record(
            EventType::DatabaseCreated,
            scope,
            json!({ "name": created.name, "id": created.id, "replaced": replaced }),
        );

        Ok(DatabaseConfig {
            name: created.name,
            id: Some(created.id),
            created: true,
            reused: false,
        })
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

    fn ledger(temp_dir: &TempDir) -> AuditLedger {
        AuditLedger::open(temp_dir.path().join("audit"), &AuditSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_absent_database_is_created_with_one_action() {
        let temp_dir = TempDir::new("edgeship-database").expect("Failed to create temp dir");
        let mut ledger = ledger(&temp_dir);
        let platform = FakePlatform::new();
        let operator = ScriptedOperator::non_interactive();
        let creds = creds();
        let mut registry = RollbackRegistry::default();

        let db = DatabaseWorkflow::new(&platform, &operator, &creds)
            .handle_database_setup("example.com", "production", None, &mut registry, &mut ledger, &AuditScope::none())
            .await
            .unwrap();

        assert!(db.created);
        assert_eq!(db.name, "example-com-production-db");
        assert!(db.is_resolved());
        assert_eq!(registry.count(RollbackKind::DeleteResource), 1);
        assert_eq!(ledger.session().count(EventType::DatabaseCreated), 1);
    }

    #[tokio::test]
    async fn test_existing_database_reused_without_actions() {
        let temp_dir = TempDir::new("edgeship-database").expect("Failed to create temp dir");
        let mut ledger = ledger(&temp_dir);
        let platform = FakePlatform::new().with_database("app-db", "db-existing");
        let operator = ScriptedOperator::non_interactive();
        let creds = creds();
        let mut registry = RollbackRegistry::default();

        let db = DatabaseWorkflow::new(&platform, &operator, &creds)
            .handle_database_setup("example.com", "production", Some("app-db"), &mut registry, &mut ledger, &AuditScope::none())
            .await
            .unwrap();

        assert!(db.reused);
        assert_eq!(db.id.as_deref(), Some("db-existing"));
        assert!(registry.is_empty());
        assert_eq!(platform.calls_to("create_database"), 0);
        assert_eq!(operator.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_declined_recreate_returns_to_choice() {
        let temp_dir = TempDir::new("edgeship-database").expect("Failed to create temp dir");
        let mut ledger = ledger(&temp_dir);
        let platform = FakePlatform::new().with_database("app-db", "db-existing");
        let operator = ScriptedOperator::new()
            .text("app-db")
            .choice(2)
            .no()
            .choice(0);
        let creds = creds();
        let mut registry = RollbackRegistry::default();

        let db = DatabaseWorkflow::new(&platform, &operator, &creds)
            .handle_database_setup("example.com", "production", None, &mut registry, &mut ledger, &AuditScope::none())
            .await
            .unwrap();

        assert!(db.reused);
        assert_eq!(platform.calls_to("delete_database"), 0);
        assert!(registry.is_empty());
        assert_eq!(operator.remaining(), 0);
    }

    #[tokio::test]
    async fn test_recreate_registers_only_the_new_database() {
        let temp_dir = TempDir::new("edgeship-database").expect("Failed to create temp dir");
        let mut ledger = ledger(&temp_dir);
        let platform = FakePlatform::new().with_database("app-db", "db-existing");
        let operator = ScriptedOperator::new().text("app-db").choice(2).yes();
        let creds = creds();
        let mut registry = RollbackRegistry::default();

        let db = DatabaseWorkflow::new(&platform, &operator, &creds)
            .handle_database_setup("example.com", "production", None, &mut registry, &mut ledger, &AuditScope::none())
            .await
            .unwrap();

        assert!(db.created);
        assert_ne!(db.id.as_deref(), Some("db-existing"));
        assert_eq!(registry.len(), 1);
        let deleted = ledger
            .session()
            .events
            .iter()
            .find(|e| e.event_type == EventType::DatabaseDeleted)
            .expect("deleted event");
        assert_eq!(deleted.details["irreversible"], true);
    }

    #[tokio::test]
    async fn test_rename_creates_under_new_name() {
        let temp_dir = TempDir::new("edgeship-database").expect("Failed to create temp dir");
        let mut ledger = ledger(&temp_dir);
        let platform = FakePlatform::new().with_database("app-db", "db-existing");
        let operator = ScriptedOperator::new()
            .text("app-db")
            .choice(1)
            .text("app-db-v2");
        let creds = creds();
        let mut registry = RollbackRegistry::default();

        let db = DatabaseWorkflow::new(&platform, &operator, &creds)
            .handle_database_setup("example.com", "production", None, &mut registry, &mut ledger, &AuditScope::none())
            .await
            .unwrap();

        assert_eq!(db.name, "app-db-v2");
        assert!(db.created);
        assert_eq!(platform.databases().len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_only_queries() {
        let temp_dir = TempDir::new("edgeship-database").expect("Failed to create temp dir");
        let mut ledger = ledger(&temp_dir);
        let platform = FakePlatform::new();
        let operator = ScriptedOperator::non_interactive();
        let creds = creds();
        let mut registry = RollbackRegistry::default();

        let db = DatabaseWorkflow::new(&platform, &operator, &creds)
            .dry_run(true)
            .handle_database_setup("example.com", "staging", None, &mut registry, &mut ledger, &AuditScope::none())
            .await
            .unwrap();

        assert!(!db.created);
        assert_eq!(db.id, None);
        assert_eq!(platform.calls(), vec!["list_databases".to_string()]);
        assert!(registry.is_empty());
    }
}
