//! Provider sync orchestration, pricing and the in-process marketplace API.

pub mod catalog;
pub mod config;
pub mod pricing;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use pcs_adapters::{
    ActionApiAdapter, AdapterError, AdapterRegistry, Normalizer, ProviderBalance,
    ACTION_API_PROTOCOL,
};
use pcs_core::{
    PricingRule, Provider, ProviderPatch, ProviderService, ServiceFilter, SyncResult,
};
use pcs_storage::{CatalogStore, HttpFetcher};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use catalog::{Catalog, CatalogStats, MergeCounts, MergeOutcome};
pub use config::{ConcurrentSyncPolicy, SyncConfig};
pub use pricing::{ApplyRulesReport, RuleBook, RuleDraft};
pub use registry::ProviderRegistry;

pub const CRATE_NAME: &str = "pcs-sync";

/// Slack on top of the HTTP timeout before an adapter call is abandoned.
const FETCH_CEILING_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("provider {0} not found")]
    ProviderNotFound(String),
    #[error("provider {0} already exists")]
    DuplicateProvider(String),
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("pricing rule {0} not found")]
    RuleNotFound(String),
    #[error("pricing rule {0} already exists")]
    DuplicateRule(String),
    #[error("sync already in progress for provider {0}")]
    ConcurrentSyncRejected(String),
    #[error(transparent)]
    Provider(#[from] AdapterError),
    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),
}

/// One mutex per provider id; syncs of the same provider never interleave.
#[derive(Debug, Default)]
struct SyncLocks {
    by_provider: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncLocks {
    async fn lock_for(&self, provider_id: &str) -> Arc<Mutex<()>> {
        self.by_provider
            .lock()
            .await
            .entry(provider_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the entry only if it is still `lock`; a provider re-added under
    /// the same id keeps its newer mutex.
    async fn forget(&self, provider_id: &str, lock: &Arc<Mutex<()>>) {
        let mut by_provider = self.by_provider.lock().await;
        if by_provider
            .get(provider_id)
            .is_some_and(|held| Arc::ptr_eq(held, lock))
        {
            by_provider.remove(provider_id);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.by_provider.lock().await.len()
    }
}

/// Exclusive hold on one provider: no sync or provider-scoped write for the
/// same id runs while it lives.
struct ProviderLock {
    provider: Provider,
    lock: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

/// The marketplace core: provider registry, catalog, rule book and the sync
/// pipeline over them, backed by a [`CatalogStore`].
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct Marketplace {
    config: Arc<SyncConfig>,
    store: Arc<dyn CatalogStore>,
    http: Arc<HttpFetcher>,
    adapters: Arc<AdapterRegistry>,
    normalizer: Arc<Normalizer>,
    registry: Arc<ProviderRegistry>,
    catalog: Arc<Catalog>,
    rules: Arc<RuleBook>,
    sync_locks: Arc<SyncLocks>,
    persist_lock: Arc<Mutex<()>>,
}

impl Marketplace {
    /// Empty marketplace over `store`. Nothing is loaded until [`Self::load`].
    pub fn new(config: SyncConfig, store: Arc<dyn CatalogStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config: Arc::new(config),
            store,
            http: Arc::new(http),
            adapters: Arc::new(AdapterRegistry::with_builtin()),
            normalizer: Arc::new(Normalizer::default()),
            registry: Arc::new(ProviderRegistry::new()),
            catalog: Arc::new(Catalog::new()),
            rules: Arc::new(RuleBook::default()),
            sync_locks: Arc::new(SyncLocks::default()),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    /// New marketplace with persisted state (or seed files) loaded.
    pub async fn open(config: SyncConfig, store: Arc<dyn CatalogStore>) -> Result<Self> {
        let marketplace = Self::new(config, store)?;
        marketplace.load().await?;
        Ok(marketplace)
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = Arc::new(adapters);
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Replace in-memory state with the store's contents. Providers and rules
    /// fall back to the configured seed files when the store has none.
    pub async fn load(&self) -> Result<()> {
        let mut providers = self.store.load_providers().await.context("loading providers")?;
        if providers.is_empty() {
            providers = config::load_provider_seed(&self.config.providers_file)?;
            if !providers.is_empty() {
                info!(
                    count = providers.len(),
                    path = %self.config.providers_file.display(),
                    "seeding providers"
                );
                self.store
                    .save_providers(&providers)
                    .await
                    .context("saving seeded providers")?;
            }
        }
        self.registry.replace_all(providers).await;

        let mut rules = self.store.load_rules().await.context("loading pricing rules")?;
        if rules.is_empty() {
            let now = Utc::now();
            rules = config::load_rule_seed(&self.config.rules_file)?
                .into_iter()
                .map(|draft| draft.into_rule(now))
                .collect();
            if !rules.is_empty() {
                info!(
                    count = rules.len(),
                    path = %self.config.rules_file.display(),
                    "seeding pricing rules"
                );
                self.store
                    .save_rules(&rules)
                    .await
                    .context("saving seeded pricing rules")?;
            }
        }
        self.rules.replace_all(rules).await;

        let mut services = self.store.load_services().await.context("loading services")?;
        let known = self.registry.list().await;
        services.retain(|s| {
            let owned = known.iter().any(|p| p.id == s.provider_id);
            if !owned {
                warn!(provider_id = %s.provider_id, service_id = %s.id, "dropping orphaned service");
            }
            owned
        });
        self.catalog.replace_all(services).await;

        info!(
            providers = known.len(),
            services = self.catalog.len().await,
            "marketplace state loaded"
        );
        Ok(())
    }

    pub async fn list_providers(&self) -> Vec<Provider> {
        self.registry.list().await
    }

    pub async fn get_provider(&self, id: &str) -> Result<Provider, SyncError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| SyncError::ProviderNotFound(id.to_string()))
    }

    pub async fn add_provider(&self, provider: Provider) -> Result<Provider, SyncError> {
        let provider = self.registry.add(provider).await?;
        info!(provider_id = %provider.id, "provider added");
        self.persist_providers().await?;
        Ok(provider)
    }

    /// A changed default margin reprices every service of the provider.
    pub async fn update_provider(
        &self,
        id: &str,
        patch: ProviderPatch,
    ) -> Result<Provider, SyncError> {
        let _held = self.lock_provider(id, ConcurrentSyncPolicy::Wait).await?;
        let (provider, margin_changed) = self.registry.update(id, patch).await?;
        if margin_changed {
            let repriced = self
                .catalog
                .reprice_provider(id, provider.default_margin_percent, Utc::now())
                .await;
            info!(provider_id = id, repriced, "provider margin changed");
            self.persist_services().await?;
        }
        self.persist_providers().await?;
        Ok(provider)
    }

    /// Removes the provider and every service it owns. Returns the number of
    /// services removed.
    /// Waits for an in-flight sync of the provider to finish first.
    pub async fn remove_provider(&self, id: &str) -> Result<usize, SyncError> {
        let held = self.lock_provider(id, ConcurrentSyncPolicy::Wait).await?;
        self.registry.remove(id).await?;
        let removed = self.catalog.remove_by_provider(id).await;
        self.sync_locks.forget(id, &held.lock).await;
        info!(provider_id = id, removed_services = removed, "provider removed");
        self.persist_catalog().await?;
        Ok(removed)
    }

    /// Only providers on the action API expose a balance.
    pub async fn provider_balance(&self, id: &str) -> Result<ProviderBalance, SyncError> {
        let provider = self.get_provider(id).await?;
        if provider.api_protocol != ACTION_API_PROTOCOL {
            return Err(AdapterError::protocol(
                id,
                format!("balance lookup is not supported over `{}`", provider.api_protocol),
            )
            .into());
        }
        Ok(ActionApiAdapter.fetch_balance(&self.http, &provider).await?)
    }

    pub async fn list_services(&self, filter: Option<&ServiceFilter>) -> Vec<ProviderService> {
        match filter {
            Some(filter) => self.catalog.filter(filter).await,
            None => self.catalog.list_all().await,
        }
    }

    pub async fn get_service(&self, id: Uuid) -> Result<ProviderService, SyncError> {
        self.catalog.get(id).await.ok_or(SyncError::ServiceNotFound(id))
    }

    pub async fn set_service_active(
        &self,
        id: Uuid,
        active: bool,
    ) -> Result<ProviderService, SyncError> {
        let service = self.catalog.set_active(id, active, Utc::now()).await?;
        self.persist_services().await?;
        Ok(service)
    }

    pub async fn delete_service(&self, id: Uuid) -> Result<ProviderService, SyncError> {
        let service = self.catalog.delete(id).await?;
        self.persist_services().await?;
        Ok(service)
    }

    pub async fn catalog_stats(&self) -> CatalogStats {
        self.catalog.stats().await
    }

    pub async fn set_service_margin(
        &self,
        id: Uuid,
        margin_percent: f64,
    ) -> Result<ProviderService, SyncError> {
        let service = self
            .catalog
            .set_service_margin(id, margin_percent, Utc::now())
            .await?;
        debug!(service_id = %id, margin_percent, resale_rate = service.resale_rate, "service margin set");
        self.persist_services().await?;
        Ok(service)
    }

    /// Sets the provider default and resets all of its services to it, manual
    /// overrides included. Returns the number of services repriced.
    pub async fn set_provider_margin(
        &self,
        provider_id: &str,
        margin_percent: f64,
    ) -> Result<usize, SyncError> {
        let _held = self
            .lock_provider(provider_id, ConcurrentSyncPolicy::Wait)
            .await?;
        self.registry
            .update(
                provider_id,
                ProviderPatch {
                    default_margin_percent: Some(margin_percent),
                    ..Default::default()
                },
            )
            .await?;
        let repriced = self
            .catalog
            .reprice_provider(provider_id, margin_percent, Utc::now())
            .await;
        info!(provider_id, margin_percent, repriced, "provider margin set");
        self.persist_catalog().await?;
        Ok(repriced)
    }

    /// Apply `rules`, or the stored rule book when `None`.
    pub async fn apply_pricing_rules(
        &self,
        rules: Option<&[PricingRule]>,
    ) -> Result<ApplyRulesReport, SyncError> {
        let stored;
        let rules = match rules {
            Some(rules) => rules,
            None => {
                stored = self.rules.list().await;
                stored.as_slice()
            }
        };
        let report = self.catalog.apply_rules(rules, Utc::now()).await;
        info!(
            rules = rules.len(),
            evaluated = report.evaluated,
            repriced = report.repriced,
            unmatched = report.unmatched,
            "pricing rules applied"
        );
        self.persist_services().await?;
        Ok(report)
    }

    pub async fn list_rules(&self) -> Vec<PricingRule> {
        self.rules.list().await
    }

    pub async fn add_rule(&self, draft: RuleDraft) -> Result<PricingRule, SyncError> {
        let rule = self.rules.add(draft, Utc::now()).await?;
        self.persist_rules().await?;
        Ok(rule)
    }

    pub async fn update_rule(&self, id: &str, draft: RuleDraft) -> Result<PricingRule, SyncError> {
        let rule = self.rules.update(id, draft, Utc::now()).await?;
        self.persist_rules().await?;
        Ok(rule)
    }

    pub async fn remove_rule(&self, id: &str) -> Result<PricingRule, SyncError> {
        let rule = self.rules.remove(id).await?;
        self.persist_rules().await?;
        Ok(rule)
    }

    /// Sync one provider by id, whether or not it is active.
    ///
    /// Fetch and record failures are reported inside the returned
    /// [`SyncResult`]; only an unknown provider or an overlapping sync under
    /// [`ConcurrentSyncPolicy::Reject`] are errors.
    pub async fn trigger_sync(&self, provider_id: &str) -> Result<SyncResult, SyncError> {
        let held = self
            .lock_provider(provider_id, self.config.concurrent_sync)
            .await?;
        let mut result = self.sync_one(&held.provider).await;
        self.registry.mark_synced(provider_id, Utc::now()).await;

        result.persisted = match self.persist_catalog().await {
            Ok(()) => true,
            Err(err) => {
                error!(provider_id, error = %err, "sync finished but catalog was not persisted");
                false
            }
        };
        // History carries the flag, so it is written last and does not affect it.
        if let Err(err) = self.store.append_sync_result(&result).await {
            error!(provider_id, error = %err, "failed to append sync history");
        }

        info!(
            provider_id,
            seen = result.total_services_seen,
            new = result.new_services,
            updated = result.updated_services,
            errors = result.error_count,
            persisted = result.persisted,
            duration_seconds = result.duration_seconds,
            "provider sync finished"
        );
        Ok(result)
    }

    /// Sync every active provider concurrently. One provider failing never
    /// stops the others; providers already syncing are skipped.
    pub async fn trigger_sync_all(&self) -> Vec<SyncResult> {
        let providers = self.registry.active().await;
        let mut tasks = JoinSet::new();
        for provider in providers {
            let marketplace = self.clone();
            tasks.spawn(async move {
                let outcome = marketplace.trigger_sync(&provider.id).await;
                (provider.id, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(result))) => results.push(result),
                Ok((provider_id, Err(SyncError::ConcurrentSyncRejected(_)))) => {
                    info!(provider_id = %provider_id, "sync already in progress; skipped");
                }
                Ok((provider_id, Err(err))) => {
                    warn!(provider_id = %provider_id, error = %err, "provider sync not run");
                }
                Err(err) => error!(error = %err, "provider sync task panicked"),
            }
        }
        results.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        results
    }

    /// Most recent first; `None` uses the configured window.
    pub async fn get_sync_history(&self, limit: Option<usize>) -> Result<Vec<SyncResult>, SyncError> {
        self.store
            .list_recent_sync_results(limit.unwrap_or(self.config.history_limit))
            .await
            .map_err(SyncError::Persistence)
    }

    /// Take the provider's mutex under `policy` and read the provider while
    /// holding it, so the caller sees any change made by the previous holder.
    async fn lock_provider(
        &self,
        provider_id: &str,
        policy: ConcurrentSyncPolicy,
    ) -> Result<ProviderLock, SyncError> {
        // Unknown ids never get a mutex.
        self.get_provider(provider_id).await?;
        let lock = self.sync_locks.lock_for(provider_id).await;
        let guard = match policy {
            ConcurrentSyncPolicy::Reject => lock
                .clone()
                .try_lock_owned()
                .map_err(|_| SyncError::ConcurrentSyncRejected(provider_id.to_string()))?,
            ConcurrentSyncPolicy::Wait => lock.clone().lock_owned().await,
        };
        match self.registry.get(provider_id).await {
            Some(provider) => Ok(ProviderLock {
                provider,
                lock,
                _guard: guard,
            }),
            None => {
                // Removed while we waited.
                drop(guard);
                self.sync_locks.forget(provider_id, &lock).await;
                Err(SyncError::ProviderNotFound(provider_id.to_string()))
            }
        }
    }

    /// Fetch, normalize and reconcile one provider. Never fails: problems are
    /// counted in the result.
    async fn sync_one(&self, provider: &Provider) -> SyncResult {
        let clock = Instant::now();
        let mut result = SyncResult::started(&provider.id, Utc::now());
        let span = info_span!("provider_sync", provider_id = %provider.id);

        async {
            let adapter = self.adapters.adapter_for(provider);
            let ceiling = self.http.timeout() + FETCH_CEILING_SLACK;
            let fetched = match tokio::time::timeout(
                ceiling,
                adapter.fetch_services(&self.http, provider),
            )
            .await
            {
                Ok(fetched) => fetched,
                Err(_) => Err(AdapterError::unreachable(
                    &provider.id,
                    format!("no response within {ceiling:?}"),
                )),
            };

            let records = match fetched {
                Ok(records) => records,
                Err(err) => {
                    let message = err.to_string();
                    let flagged = self
                        .catalog
                        .mark_provider_failed(&provider.id, &message, Utc::now())
                        .await;
                    warn!(error = %err, flagged, "provider fetch failed");
                    result.record_error(message);
                    return;
                }
            };

            result.total_services_seen = records.len();
            let now = Utc::now();
            let mut normalized = Vec::with_capacity(records.len());
            for (index, raw) in records.iter().enumerate() {
                match self.normalizer.normalize(provider, raw, now) {
                    Ok(service) => normalized.push(service),
                    Err(err) => {
                        debug!(index, error = %err, "skipping unmappable record");
                        result.record_error(format!("record {index}: {err}"));
                    }
                }
            }

            let counts = self
                .catalog
                .reconcile_provider(&provider.id, normalized, now)
                .await;
            if counts.unlisted > 0 {
                debug!(unlisted = counts.unlisted, "entries no longer listed by provider");
            }
            result.new_services = counts.inserted;
            result.updated_services = counts.updated;
        }
        .instrument(span)
        .await;

        result.duration_seconds = clock.elapsed().as_secs_f64();
        result
    }

    async fn persist_providers(&self) -> Result<(), SyncError> {
        let _guard = self.persist_lock.lock().await;
        let providers = self.registry.list().await;
        self.store
            .save_providers(&providers)
            .await
            .map_err(SyncError::Persistence)
    }

    async fn persist_services(&self) -> Result<(), SyncError> {
        let _guard = self.persist_lock.lock().await;
        let services = self.catalog.list_all().await;
        self.store
            .save_services(&services)
            .await
            .map_err(SyncError::Persistence)
    }

    /// Providers and services together, snapshotted under the persist lock so
    /// an older snapshot never overwrites a newer one.
    async fn persist_catalog(&self) -> Result<(), SyncError> {
        let _guard = self.persist_lock.lock().await;
        let services = self.catalog.list_all().await;
        let providers = self.registry.list().await;
        self.store
            .save_services(&services)
            .await
            .map_err(SyncError::Persistence)?;
        self.store
            .save_providers(&providers)
            .await
            .map_err(SyncError::Persistence)
    }

    async fn persist_rules(&self) -> Result<(), SyncError> {
        let _guard = self.persist_lock.lock().await;
        let rules = self.rules.list().await;
        self.store
            .save_rules(&rules)
            .await
            .map_err(SyncError::Persistence)
    }

    /// Recurring `trigger_sync_all`, on the cron expression when configured and
    /// the fixed interval otherwise. `None` when the scheduler is disabled.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let marketplace = self.clone();
        let run = move |_uuid: Uuid, _l: JobScheduler| {
            let marketplace = marketplace.clone();
            Box::pin(async move {
                let results = marketplace.trigger_sync_all().await;
                let errors: usize = results.iter().map(|r| r.error_count).sum();
                info!(providers = results.len(), errors, "scheduled sync finished");
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        };

        let job = match &self.config.sync_cron {
            Some(cron) => Job::new_async(cron.as_str(), run)
                .with_context(|| format!("creating scheduler job for cron {cron}"))?,
            None => Job::new_repeated_async(self.config.sync_interval(), run).with_context(|| {
                format!(
                    "creating scheduler job every {} minutes",
                    self.config.sync_interval_minutes
                )
            })?,
        };
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
