//! In-memory store implementation.
//!
//! Backs tests and single-node deployments where routing state does not need
//! to survive a restart. All four contracts are implemented on one struct so
//! the binary can hand out `Arc` clones of a single instance.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::ledger::LedgerEntry;
use crate::routing::{RoutingRule, RuleScope, Strategy};

use super::{
    CredentialStore, LedgerStore, RulesStore, SettingsStore, StoreError, StoredProviderKey,
};

#[derive(Debug, Clone)]
struct Settings {
    default_strategy: Strategy,
    locked: bool,
    updated_by: String,
    updated_at: chrono::DateTime<Utc>,
}

/// One store for everything. Cheap to construct per test.
#[derive(Default)]
pub struct MemoryStore {
    // (user_id, provider) → sealed key
    keys: RwLock<HashMap<(String, String), StoredProviderKey>>,
    settings: RwLock<Option<Settings>>,
    user_strategies: RwLock<HashMap<String, Strategy>>,
    global_rules: RwLock<Vec<RoutingRule>>,
    user_rules: RwLock<HashMap<String, Vec<RoutingRule>>>,
    ledger: RwLock<Vec<LedgerEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger rows written so far — test observability.
    pub async fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.ledger.read().await.clone()
    }

    /// Who last changed the system settings, and when.
    pub async fn settings_audit(&self) -> Option<(String, chrono::DateTime<Utc>)> {
        self.settings
            .read()
            .await
            .as_ref()
            .map(|s| (s.updated_by.clone(), s.updated_at))
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get_provider_key(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<StoredProviderKey>, StoreError> {
        let keys = self.keys.read().await;
        Ok(keys
            .get(&(user_id.to_string(), provider.to_string()))
            .filter(|k| k.is_active)
            .cloned())
    }

    async fn list_provider_keys(
        &self,
        user_id: &str,
    ) -> Result<Vec<StoredProviderKey>, StoreError> {
        let keys = self.keys.read().await;
        let mut out: Vec<StoredProviderKey> = keys
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(out)
    }

    async fn upsert_provider_key(&self, key: StoredProviderKey) -> Result<(), StoreError> {
        let mut keys = self.keys.write().await;
        keys.insert((key.user_id.clone(), key.provider.clone()), key);
        Ok(())
    }

    async fn delete_provider_key(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<bool, StoreError> {
        let mut keys = self.keys.write().await;
        Ok(keys.remove(&(user_id.to_string(), provider.to_string())).is_some())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn default_strategy(&self) -> Result<Strategy, StoreError> {
        Ok(self
            .settings
            .read()
            .await
            .as_ref()
            .map(|s| s.default_strategy)
            .unwrap_or_default())
    }

    async fn is_locked(&self) -> Result<bool, StoreError> {
        Ok(self.settings.read().await.as_ref().map(|s| s.locked).unwrap_or(false))
    }

    async fn set_default_strategy(
        &self,
        strategy: Strategy,
        updated_by: &str,
    ) -> Result<(), StoreError> {
        let mut settings = self.settings.write().await;
        let locked = settings.as_ref().map(|s| s.locked).unwrap_or(false);
        *settings = Some(Settings {
            default_strategy: strategy,
            locked,
            updated_by: updated_by.to_string(),
            updated_at: Utc::now(),
        });
        Ok(())
    }

    async fn set_lock(&self, locked: bool, updated_by: &str) -> Result<(), StoreError> {
        let mut settings = self.settings.write().await;
        let default_strategy = settings
            .as_ref()
            .map(|s| s.default_strategy)
            .unwrap_or_default();
        *settings = Some(Settings {
            default_strategy,
            locked,
            updated_by: updated_by.to_string(),
            updated_at: Utc::now(),
        });
        Ok(())
    }

    async fn user_strategy(&self, user_id: &str) -> Result<Option<Strategy>, StoreError> {
        Ok(self.user_strategies.read().await.get(user_id).copied())
    }

    async fn set_user_strategy(
        &self,
        user_id: &str,
        strategy: Option<Strategy>,
    ) -> Result<(), StoreError> {
        let mut prefs = self.user_strategies.write().await;
        match strategy {
            Some(s) => {
                prefs.insert(user_id.to_string(), s);
            }
            None => {
                prefs.remove(user_id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RulesStore for MemoryStore {
    async fn active_rules(&self) -> Result<Vec<RoutingRule>, StoreError> {
        Ok(self
            .global_rules
            .read()
            .await
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    async fn active_rules_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<RoutingRule>, StoreError> {
        let mut rules = self.active_rules().await?;
        if let Some(own) = self.user_rules.read().await.get(user_id) {
            rules.extend(own.iter().filter(|r| r.enabled).cloned());
        }
        Ok(rules)
    }

    async fn save_rules(
        &self,
        rules: Vec<RoutingRule>,
        scope: RuleScope,
        _updated_by: &str,
    ) -> Result<(), StoreError> {
        match scope {
            RuleScope::Global => *self.global_rules.write().await = rules,
            RuleScope::User(user_id) => {
                self.user_rules.write().await.insert(user_id, rules);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn create(&self, entries: &[LedgerEntry]) -> Result<(), StoreError> {
        self.ledger.write().await.extend_from_slice(entries);
        Ok(())
    }
}
