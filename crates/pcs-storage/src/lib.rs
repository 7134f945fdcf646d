//! Durable catalog persistence + HTTP fetch utilities for PCS.

mod http;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use pcs_core::{PricingRule, Provider, ProviderService, SyncResult};
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};

pub const CRATE_NAME: &str = "pcs-storage";

const PROVIDERS_FILE: &str = "providers.json";
const SERVICES_FILE: &str = "services.json";
const RULES_FILE: &str = "pricing_rules.json";
const HISTORY_FILE: &str = "sync_history.jsonl";

/// Record store the catalog survives restarts through.
///
/// Collections are saved whole; sync history is append-only.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load_providers(&self) -> Result<Vec<Provider>>;
    async fn save_providers(&self, providers: &[Provider]) -> Result<()>;

    async fn load_services(&self) -> Result<Vec<ProviderService>>;
    async fn save_services(&self, services: &[ProviderService]) -> Result<()>;

    async fn load_rules(&self) -> Result<Vec<PricingRule>>;
    async fn save_rules(&self, rules: &[PricingRule]) -> Result<()>;

    async fn append_sync_result(&self, result: &SyncResult) -> Result<()>;

    /// Newest first, at most `limit` entries.
    async fn list_recent_sync_results(&self, limit: usize) -> Result<Vec<SyncResult>>;
}

/// One JSON document per collection under `root`, replaced atomically on save.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    history_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            history_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_collection<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.root.join(name);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }

    async fn write_collection<T: Serialize>(&self, name: &str, items: &[T]) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(items).with_context(|| format!("serializing {name}"))?;
        self.write_atomic(name, &bytes).await
    }

    /// Write through a temp file in the same directory, then rename over the target.
    async fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating store directory {}", self.root.display()))?;

        let path = self.root.join(name);
        let temp_path = self.root.join(format!(".{name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for JsonFileStore {
    async fn load_providers(&self) -> Result<Vec<Provider>> {
        self.read_collection(PROVIDERS_FILE).await
    }

    async fn save_providers(&self, providers: &[Provider]) -> Result<()> {
        self.write_collection(PROVIDERS_FILE, providers).await
    }

    async fn load_services(&self) -> Result<Vec<ProviderService>> {
        self.read_collection(SERVICES_FILE).await
    }

    async fn save_services(&self, services: &[ProviderService]) -> Result<()> {
        self.write_collection(SERVICES_FILE, services).await
    }

    async fn load_rules(&self) -> Result<Vec<PricingRule>> {
        self.read_collection(RULES_FILE).await
    }

    async fn save_rules(&self, rules: &[PricingRule]) -> Result<()> {
        self.write_collection(RULES_FILE, rules).await
    }

    async fn append_sync_result(&self, result: &SyncResult) -> Result<()> {
        let mut line = serde_json::to_string(result).context("serializing sync result")?;
        line.push('\n');

        let _guard = self.history_lock.lock().await;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating store directory {}", self.root.display()))?;
        let path = self.root.join(HISTORY_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", path.display()))?;
        Ok(())
    }

    async fn list_recent_sync_results(&self, limit: usize) -> Result<Vec<SyncResult>> {
        let path = self.root.join(HISTORY_FILE);
        let _guard = self.history_lock.lock().await;
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        let mut results = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SyncResult>(line) {
                Ok(result) => results.push(result),
                Err(err) => warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %err,
                    "skipping unreadable sync history entry"
                ),
            }
        }
        Ok(results.into_iter().rev().take(limit).collect())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    providers: Vec<Provider>,
    services: Vec<ProviderService>,
    rules: Vec<PricingRule>,
    history: Vec<SyncResult>,
}

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, simulating an unavailable backend.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            anyhow::bail!("memory store is rejecting writes");
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load_providers(&self) -> Result<Vec<Provider>> {
        Ok(self.state.lock().await.providers.clone())
    }

    async fn save_providers(&self, providers: &[Provider]) -> Result<()> {
        self.ensure_writable()?;
        self.state.lock().await.providers = providers.to_vec();
        Ok(())
    }

    async fn load_services(&self) -> Result<Vec<ProviderService>> {
        Ok(self.state.lock().await.services.clone())
    }

    async fn save_services(&self, services: &[ProviderService]) -> Result<()> {
        self.ensure_writable()?;
        self.state.lock().await.services = services.to_vec();
        Ok(())
    }

    async fn load_rules(&self) -> Result<Vec<PricingRule>> {
        Ok(self.state.lock().await.rules.clone())
    }

    async fn save_rules(&self, rules: &[PricingRule]) -> Result<()> {
        self.ensure_writable()?;
        self.state.lock().await.rules = rules.to_vec();
        Ok(())
    }

    async fn append_sync_result(&self, result: &SyncResult) -> Result<()> {
        self.ensure_writable()?;
        self.state.lock().await.history.push(result.clone());
        Ok(())
    }

    async fn list_recent_sync_results(&self, limit: usize) -> Result<Vec<SyncResult>> {
        let state = self.state.lock().await;
        Ok(state.history.iter().rev().take(limit).cloned().collect())
    }
}
