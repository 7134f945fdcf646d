use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use pcs_core::Provider;
use pcs_storage::HttpClientConfig;
use serde::Deserialize;

use crate::pricing::RuleDraft;

/// What happens when a sync is requested for a provider that is already syncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrentSyncPolicy {
    #[default]
    Reject,
    Wait,
}

impl ConcurrentSyncPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub providers_file: PathBuf,
    pub rules_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_interval_minutes: u64,
    /// Overrides the fixed interval when set.
    pub sync_cron: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub concurrent_sync: ConcurrentSyncPolicy,
    pub history_limit: usize,
    pub log_level: String,
    pub log_json: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from any variable lookup; unset or unparseable values use defaults.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            get(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false)
        };
        let number = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            data_dir: get("PCS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            providers_file: get("PCS_PROVIDERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./config/providers.yaml")),
            rules_file: get("PCS_RULES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./config/pricing_rules.yaml")),
            scheduler_enabled: flag("PCS_SCHEDULER_ENABLED"),
            sync_interval_minutes: number("PCS_SYNC_INTERVAL_MINUTES", 60).max(1),
            sync_cron: get("PCS_SYNC_CRON").filter(|v| !v.trim().is_empty()),
            http_timeout_secs: number("PCS_HTTP_TIMEOUT_SECS", 20).max(1),
            user_agent: get("PCS_USER_AGENT").unwrap_or_else(|| "pcs-sync/0.1".to_string()),
            concurrent_sync: get("PCS_CONCURRENT_SYNC")
                .and_then(|v| ConcurrentSyncPolicy::parse(&v))
                .unwrap_or_default(),
            history_limit: number("PCS_HISTORY_LIMIT", 50) as usize,
            log_level: get("PCS_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_json: get("PCS_LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes * 60)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout(),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

#[derive(Debug, Deserialize)]
struct ProviderSeedFile {
    #[serde(default)]
    providers: Vec<Provider>,
}

#[derive(Debug, Deserialize)]
struct RuleSeedFile {
    #[serde(default)]
    rules: Vec<RuleDraft>,
}

fn read_seed(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    std::fs::read_to_string(path)
        .map(Some)
        .with_context(|| format!("reading {}", path.display()))
}

/// Providers declared in a YAML seed file. A missing file yields an empty list.
pub fn load_provider_seed(path: &Path) -> Result<Vec<Provider>> {
    let Some(text) = read_seed(path)? else {
        return Ok(Vec::new());
    };
    let file: ProviderSeedFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.providers)
}

pub fn load_rule_seed(path: &Path) -> Result<Vec<RuleDraft>> {
    let Some(text) = read_seed(path)? else {
        return Ok(Vec::new());
    };
    let file: RuleSeedFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.rules)
}
