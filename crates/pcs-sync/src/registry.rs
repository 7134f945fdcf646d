use chrono::{DateTime, Utc};
use pcs_core::{Provider, ProviderPatch};
use tokio::sync::RwLock;
use tracing::warn;

use crate::SyncError;

/// Provider connection records, in registration order.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: RwLock<Vec<Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole registry. Later duplicates of an id are dropped.
    pub async fn replace_all(&self, providers: Vec<Provider>) {
        let mut unique: Vec<Provider> = Vec::with_capacity(providers.len());
        for provider in providers {
            if unique.iter().any(|p| p.id == provider.id) {
                warn!(provider_id = %provider.id, "duplicate provider id; keeping the first");
                continue;
            }
            unique.push(provider);
        }
        *self.providers.write().await = unique;
    }

    pub async fn list(&self) -> Vec<Provider> {
        self.providers.read().await.clone()
    }

    pub async fn active(&self) -> Vec<Provider> {
        self.providers
            .read()
            .await
            .iter()
            .filter(|p| p.is_active)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<Provider> {
        self.providers.read().await.iter().find(|p| p.id == id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.providers.read().await.iter().any(|p| p.id == id)
    }

    pub async fn add(&self, provider: Provider) -> Result<Provider, SyncError> {
        let mut providers = self.providers.write().await;
        if providers.iter().any(|p| p.id == provider.id) {
            return Err(SyncError::DuplicateProvider(provider.id));
        }
        providers.push(provider.clone());
        Ok(provider)
    }

    /// Returns the updated record and whether its default margin changed.
    pub async fn update(
        &self,
        id: &str,
        patch: ProviderPatch,
    ) -> Result<(Provider, bool), SyncError> {
        let mut providers = self.providers.write().await;
        let provider = providers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| SyncError::ProviderNotFound(id.to_string()))?;
        let margin_changed = provider.apply_patch(patch);
        Ok((provider.clone(), margin_changed))
    }

    pub async fn remove(&self, id: &str) -> Result<Provider, SyncError> {
        let mut providers = self.providers.write().await;
        let index = providers
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| SyncError::ProviderNotFound(id.to_string()))?;
        Ok(providers.remove(index))
    }

    pub async fn mark_synced(&self, id: &str, at: DateTime<Utc>) {
        if let Some(provider) = self.providers.write().await.iter_mut().find(|p| p.id == id) {
            provider.last_sync_at = Some(at);
        }
    }
}
