//! Seam between the orchestration engine and the edge platform.
//!
//! Every remote call the workflows make goes through [`Platform`]. The production
//! implementation, [`CloudflarePlatform`], talks to the REST API for account data and drives
//! the provider CLI for resource and secret management. Tests substitute
//! [`crate::testing::FakePlatform`].

use std::{future::Future, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;

mod cloudflare;
mod wrangler;

pub use cloudflare::CloudflarePlatform;
pub use wrangler::WranglerCmdBuilder;

/// An account visible to a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
}

/// A DNS zone visible to a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

impl Zone {
    /// Whether `domain` is this zone's apex or one of its subdomains.
    pub fn covers(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let zone = self.name.trim_end_matches('.').to_ascii_lowercase();
        domain == zone || domain.ends_with(&format!(".{}", zone))
    }
}

/// A managed database as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    #[serde(alias = "uuid")]
    pub id: String,
    pub name: String,
}

/// Result of an HTTP probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub latency: Duration,
    /// The first few hundred bytes of the body.
    pub body: String,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Remote operations used by the workflows.
///
/// Listing and verification calls are safe to retry. Mutating calls are not retried by
/// callers.
pub trait Platform: Send + Sync {
    /// Check a token against the platform. `Ok(false)` means the platform rejected it.
    fn verify_token(&self, token: &str) -> impl Future<Output = Result<bool>> + Send;

    fn list_accounts(&self, token: &str) -> impl Future<Output = Result<Vec<Account>>> + Send;

    fn list_zones(
        &self,
        token: &str,
        account_id: &str,
    ) -> impl Future<Output = Result<Vec<Zone>>> + Send;

    /// Identity reported by the provider CLI, `None` when it is not logged in.
    fn whoami(&self, creds: &Credentials) -> impl Future<Output = Result<Option<String>>> + Send;

    fn list_databases(
        &self,
        creds: &Credentials,
    ) -> impl Future<Output = Result<Vec<DatabaseInfo>>> + Send;

    fn create_database(
        &self,
        creds: &Credentials,
        name: &str,
    ) -> impl Future<Output = Result<DatabaseInfo>> + Send;

    fn delete_database(
        &self,
        creds: &Credentials,
        name: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn put_secret(
        &self,
        creds: &Credentials,
        worker: &str,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_secret(
        &self,
        creds: &Credentials,
        worker: &str,
        key: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Issue a GET with a bounded timeout.
    fn probe(&self, url: &str) -> impl Future<Output = Result<ProbeResponse>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_covers_apex_and_subdomains() {
        let zone = Zone {
            id: "z1".to_string(),
            name: "example.com".to_string(),
        };
        assert!(zone.covers("example.com"));
        assert!(zone.covers("api.example.com"));
        assert!(zone.covers("API.Example.com."));
        assert!(!zone.covers("badexample.com"));
        assert!(!zone.covers("example.org"));
    }

    #[test]
    fn test_database_info_accepts_uuid_field() {
        let info: DatabaseInfo =
            serde_json::from_str(r#"{"uuid": "abc-123", "name": "main-db", "version": "beta"}"#)
                .unwrap();
        assert_eq!(info.id, "abc-123");
        assert_eq!(info.name, "main-db");
    }
}
