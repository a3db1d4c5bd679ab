//! Storage collaborator contracts.
//!
//! The core pulls BYOK credentials, routing settings, and custom rules from
//! these traits per request, and pushes ledger batches through
//! [`LedgerStore`]. Implementations live behind trait objects so the binary
//! can wire in relational storage without touching the core; the in-memory
//! implementation in [`memory`] backs tests and single-node deployments.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::LedgerEntry;
use crate::routing::{RoutingRule, RuleScope, Strategy};

/// A sealed per-user provider key at rest.
///
/// `ciphertext` is base64(nonce ‖ AES-GCM body) — see [`crate::crypto`].
/// At most one active key exists per (user, provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredProviderKey {
    pub user_id: String,
    pub provider: String,
    pub ciphertext: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Per-user BYOK credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The active key for (user, provider), if any.
    async fn get_provider_key(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<StoredProviderKey>, StoreError>;

    async fn list_provider_keys(&self, user_id: &str)
        -> Result<Vec<StoredProviderKey>, StoreError>;

    /// Insert or replace the key for (user, provider).
    async fn upsert_provider_key(&self, key: StoredProviderKey) -> Result<(), StoreError>;

    /// Returns whether a key existed.
    async fn delete_provider_key(&self, user_id: &str, provider: &str)
        -> Result<bool, StoreError>;
}

/// System-wide routing settings plus per-user strategy preferences.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn default_strategy(&self) -> Result<Strategy, StoreError>;
    async fn is_locked(&self) -> Result<bool, StoreError>;
    async fn set_default_strategy(
        &self,
        strategy: Strategy,
        updated_by: &str,
    ) -> Result<(), StoreError>;
    async fn set_lock(&self, locked: bool, updated_by: &str) -> Result<(), StoreError>;
    async fn user_strategy(&self, user_id: &str) -> Result<Option<Strategy>, StoreError>;
    /// `None` clears the preference.
    async fn set_user_strategy(
        &self,
        user_id: &str,
        strategy: Option<Strategy>,
    ) -> Result<(), StoreError>;
}

/// Custom routing rules.
#[async_trait]
pub trait RulesStore: Send + Sync {
    /// All enabled global rules.
    async fn active_rules(&self) -> Result<Vec<RoutingRule>, StoreError>;
    /// Enabled global rules plus the user's own.
    async fn active_rules_for_user(&self, user_id: &str)
        -> Result<Vec<RoutingRule>, StoreError>;
    /// Replace the rule set for one scope.
    async fn save_rules(
        &self,
        rules: Vec<RoutingRule>,
        scope: RuleScope,
        updated_by: &str,
    ) -> Result<(), StoreError>;
}

/// Sink for request-ledger batches.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create(&self, entries: &[LedgerEntry]) -> Result<(), StoreError>;
}
