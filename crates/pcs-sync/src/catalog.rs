//! Reconciliation store for canonical catalog entries.
//!
//! Entries are keyed by the canonical id derived from `(provider_id,
//! native_id)`, so a re-sync lands on the record it produced last time.
//! Every write to a `ProviderService` goes through this type.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use pcs_core::{MarginSource, Platform, PricingRule, ProviderService, ServiceFilter, SyncStatus};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::pricing::{self, ApplyRulesReport};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub inserted: usize,
    pub updated: usize,
    /// Known entries the provider no longer listed, now `Pending`.
    pub unlisted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogStats {
    pub total: usize,
    pub active: usize,
    pub by_provider: BTreeMap<String, usize>,
    pub by_platform: BTreeMap<Platform, usize>,
}

#[derive(Debug, Default)]
struct CatalogState {
    services: Vec<ProviderService>,
    index: HashMap<Uuid, usize>,
}

impl CatalogState {
    fn reindex(&mut self) {
        self.index = self
            .services
            .iter()
            .enumerate()
            .map(|(pos, s)| (s.id, pos))
            .collect();
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut ProviderService> {
        let pos = *self.index.get(&id)?;
        self.services.get_mut(pos)
    }

    /// Administrator decisions (activation, non-default margins) and first-seen
    /// time survive; everything the provider reports is replaced.
    fn merge(&mut self, mut incoming: ProviderService) -> MergeOutcome {
        incoming.id = incoming.key().canonical_id();
        match self.get_mut(incoming.id) {
            Some(existing) => {
                incoming.first_seen_at = existing.first_seen_at;
                incoming.is_active = existing.is_active;
                if existing.margin_source != MarginSource::ProviderDefault {
                    incoming.margin_percent = existing.margin_percent;
                    incoming.margin_source = existing.margin_source;
                }
                incoming.reprice();
                *existing = incoming;
                MergeOutcome::Updated
            }
            None => {
                incoming.reprice();
                self.index.insert(incoming.id, self.services.len());
                self.services.push(incoming);
                MergeOutcome::Inserted
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    state: RwLock<CatalogState>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted snapshot. Prices are recomputed on the way in.
    pub async fn replace_all(&self, services: Vec<ProviderService>) {
        let mut state = CatalogState::default();
        for service in services {
            state.merge(service);
        }
        *self.state.write().await = state;
    }

    /// Merge a batch in order; a later record for the same id wins.
    pub async fn merge_batch(&self, incoming: Vec<ProviderService>) -> MergeCounts {
        let mut state = self.state.write().await;
        let mut counts = MergeCounts::default();
        for service in incoming {
            match state.merge(service) {
                MergeOutcome::Inserted => counts.inserted += 1,
                MergeOutcome::Updated => counts.updated += 1,
            }
        }
        counts
    }

    /// Merge a full provider catalog. Entries of `provider_id` missing from
    /// `incoming` are kept but marked [`SyncStatus::Pending`].
    pub async fn reconcile_provider(
        &self,
        provider_id: &str,
        incoming: Vec<ProviderService>,
        now: DateTime<Utc>,
    ) -> MergeCounts {
        let listed: HashSet<Uuid> = incoming.iter().map(|s| s.key().canonical_id()).collect();
        let mut state = self.state.write().await;
        let mut counts = MergeCounts::default();
        for service in incoming {
            match state.merge(service) {
                MergeOutcome::Inserted => counts.inserted += 1,
                MergeOutcome::Updated => counts.updated += 1,
            }
        }
        for service in state
            .services
            .iter_mut()
            .filter(|s| s.provider_id == provider_id && !listed.contains(&s.id))
        {
            if service.sync_status != SyncStatus::Pending {
                service.sync_status = SyncStatus::Pending;
                service.updated_at = now;
            }
            counts.unlisted += 1;
        }
        counts
    }

    /// Flag every entry of a provider whose catalog could not be fetched.
    pub async fn mark_provider_failed(
        &self,
        provider_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> usize {
        let mut state = self.state.write().await;
        let mut flagged = 0;
        for service in state
            .services
            .iter_mut()
            .filter(|s| s.provider_id == provider_id)
        {
            service.sync_status = SyncStatus::Error;
            service.last_error = Some(message.to_string());
            service.updated_at = now;
            flagged += 1;
        }
        flagged
    }

    pub async fn merge(&self, incoming: ProviderService) -> MergeOutcome {
        self.state.write().await.merge(incoming)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.services.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn list_all(&self) -> Vec<ProviderService> {
        self.state.read().await.services.clone()
    }

    pub async fn list_by_provider(&self, provider_id: &str) -> Vec<ProviderService> {
        self.filter(&ServiceFilter {
            provider_id: Some(provider_id.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn filter(&self, filter: &ServiceFilter) -> Vec<ProviderService> {
        self.state
            .read()
            .await
            .services
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<ProviderService> {
        let state = self.state.read().await;
        let pos = *state.index.get(&id)?;
        state.services.get(pos).cloned()
    }

    pub async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<ProviderService, SyncError> {
        let mut state = self.state.write().await;
        let service = state.get_mut(id).ok_or(SyncError::ServiceNotFound(id))?;
        service.is_active = active;
        service.updated_at = now;
        Ok(service.clone())
    }

    pub async fn delete(&self, id: Uuid) -> Result<ProviderService, SyncError> {
        let mut state = self.state.write().await;
        let pos = state
            .index
            .get(&id)
            .copied()
            .ok_or(SyncError::ServiceNotFound(id))?;
        let removed = state.services.remove(pos);
        state.reindex();
        Ok(removed)
    }

    /// Drop every entry owned by `provider_id`; returns how many were removed.
    pub async fn remove_by_provider(&self, provider_id: &str) -> usize {
        let mut state = self.state.write().await;
        let before = state.services.len();
        state.services.retain(|s| s.provider_id != provider_id);
        let removed = before - state.services.len();
        if removed > 0 {
            state.reindex();
        }
        removed
    }

    /// Manual per-service override; survives later syncs.
    pub async fn set_service_margin(
        &self,
        id: Uuid,
        margin_percent: f64,
        now: DateTime<Utc>,
    ) -> Result<ProviderService, SyncError> {
        let mut state = self.state.write().await;
        let service = state.get_mut(id).ok_or(SyncError::ServiceNotFound(id))?;
        service.set_margin(margin_percent, MarginSource::Manual);
        service.updated_at = now;
        Ok(service.clone())
    }

    /// Reset every entry of a provider to its default margin, clearing overrides.
    pub async fn reprice_provider(
        &self,
        provider_id: &str,
        margin_percent: f64,
        now: DateTime<Utc>,
    ) -> usize {
        let mut state = self.state.write().await;
        let mut repriced = 0;
        for service in state
            .services
            .iter_mut()
            .filter(|s| s.provider_id == provider_id)
        {
            service.set_margin(margin_percent, MarginSource::ProviderDefault);
            service.updated_at = now;
            repriced += 1;
        }
        repriced
    }

    pub async fn apply_rules(&self, rules: &[PricingRule], now: DateTime<Utc>) -> ApplyRulesReport {
        let mut state = self.state.write().await;
        pricing::apply_rules(&mut state.services, rules, now)
    }

    pub async fn stats(&self) -> CatalogStats {
        let state = self.state.read().await;
        let mut stats = CatalogStats {
            total: state.services.len(),
            ..Default::default()
        };
        for service in &state.services {
            if service.is_active {
                stats.active += 1;
            }
            *stats
                .by_provider
                .entry(service.provider_id.clone())
                .or_default() += 1;
            *stats.by_platform.entry(service.platform).or_default() += 1;
        }
        stats
    }
}
