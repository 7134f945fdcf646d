//! Canonical catalog model for provider sync and resale pricing.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pcs-core";

/// Namespace for canonical service ids derived from [`ServiceKey`].
const SERVICE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a9e_54b3_4d0a_9c1e_7a52_e3f0_b8d4);

/// Round to two decimal places, the precision every resale price is quoted in.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Resale price for one unit. Negative inputs are accepted and priced as given.
pub fn compute_resale_rate(base_rate: f64, margin_percent: f64) -> f64 {
    round2(base_rate + base_rate * margin_percent / 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Followers,
    Likes,
    Views,
    Comments,
    Shares,
    Subscribers,
}

impl ServiceType {
    pub const ALL: [ServiceType; 6] = [
        ServiceType::Followers,
        ServiceType::Likes,
        ServiceType::Views,
        ServiceType::Comments,
        ServiceType::Shares,
        ServiceType::Subscribers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Followers => "followers",
            ServiceType::Likes => "likes",
            ServiceType::Views => "views",
            ServiceType::Comments => "comments",
            ServiceType::Shares => "shares",
            ServiceType::Subscribers => "subscribers",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Tiktok,
    Youtube,
    Twitter,
    Facebook,
    Snapchat,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Instagram,
        Platform::Tiktok,
        Platform::Youtube,
        Platform::Twitter,
        Platform::Facebook,
        Platform::Snapchat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Youtube => "youtube",
            Platform::Twitter => "twitter",
            Platform::Facebook => "facebook",
            Platform::Snapchat => "snapchat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    High,
    Medium,
    Low,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::High => "high",
            QualityTier::Medium => "medium",
            QualityTier::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [QualityTier::High, QualityTier::Medium, QualityTier::Low]
            .into_iter()
            .find(|q| q.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeedTier {
    Fast,
    #[default]
    Medium,
    Slow,
}

impl SpeedTier {
    /// Completion estimate used when a provider does not quote one per service.
    pub fn typical_completion_time(self) -> &'static str {
        match self {
            SpeedTier::Fast => "0-6 hours",
            SpeedTier::Medium => "6-24 hours",
            SpeedTier::Slow => "1-3 days",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
}

/// Who decided the margin currently applied to a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarginSource {
    #[default]
    ProviderDefault,
    Manual,
    Rule,
}

fn default_protocol() -> String {
    "generic".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_sync_interval() -> u32 {
    60
}

fn default_reliability() -> u8 {
    50
}

/// One external catalog source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub api_endpoint: String,
    #[serde(default)]
    pub api_credential: String,
    /// Wire protocol name used to pick a fetch adapter.
    #[serde(default = "default_protocol")]
    pub api_protocol: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_reliability")]
    pub reliability_score: u8,
    #[serde(default)]
    pub speed_tier: SpeedTier,
    #[serde(default)]
    pub supported_platforms: BTreeSet<Platform>,
    #[serde(default)]
    pub default_margin_percent: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_minutes: u32,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Provider {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        api_endpoint: impl Into<String>,
        default_margin_percent: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            api_endpoint: api_endpoint.into(),
            api_credential: String::new(),
            api_protocol: default_protocol(),
            is_active: true,
            reliability_score: default_reliability(),
            speed_tier: SpeedTier::default(),
            supported_platforms: BTreeSet::new(),
            default_margin_percent,
            currency: default_currency(),
            sync_interval_minutes: default_sync_interval(),
            last_sync_at: None,
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.api_protocol = protocol.into();
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.api_credential = credential.into();
        self
    }

    /// Apply a partial update. Returns `true` when the default margin changed.
    ///
    /// `id` and `last_sync_at` are not patchable.
    pub fn apply_patch(&mut self, patch: ProviderPatch) -> bool {
        let ProviderPatch {
            name,
            api_endpoint,
            api_credential,
            api_protocol,
            is_active,
            reliability_score,
            speed_tier,
            supported_platforms,
            default_margin_percent,
            currency,
            sync_interval_minutes,
        } = patch;

        if let Some(v) = name {
            self.name = v;
        }
        if let Some(v) = api_endpoint {
            self.api_endpoint = v;
        }
        if let Some(v) = api_credential {
            self.api_credential = v;
        }
        if let Some(v) = api_protocol {
            self.api_protocol = v;
        }
        if let Some(v) = is_active {
            self.is_active = v;
        }
        if let Some(v) = reliability_score {
            self.reliability_score = v.min(100);
        }
        if let Some(v) = speed_tier {
            self.speed_tier = v;
        }
        if let Some(v) = supported_platforms {
            self.supported_platforms = v;
        }
        if let Some(v) = currency {
            self.currency = v;
        }
        if let Some(v) = sync_interval_minutes {
            self.sync_interval_minutes = v;
        }
        match default_margin_percent {
            Some(v) if v != self.default_margin_percent => {
                self.default_margin_percent = v;
                true
            }
            _ => false,
        }
    }
}

/// Partial provider update; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderPatch {
    pub name: Option<String>,
    pub api_endpoint: Option<String>,
    pub api_credential: Option<String>,
    pub api_protocol: Option<String>,
    pub is_active: Option<bool>,
    pub reliability_score: Option<u8>,
    pub speed_tier: Option<SpeedTier>,
    pub supported_platforms: Option<BTreeSet<Platform>>,
    pub default_margin_percent: Option<f64>,
    pub currency: Option<String>,
    pub sync_interval_minutes: Option<u32>,
}

/// Composite reconciliation key: owning provider plus the provider's own service id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub provider_id: String,
    pub native_id: String,
}

impl ServiceKey {
    pub fn new(provider_id: impl Into<String>, native_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            native_id: native_id.into(),
        }
    }

    /// Stable id for the catalog entry this key names.
    ///
    /// Each component is length-prefixed before hashing, so ids that contain
    /// separator characters cannot collide across the provider/native boundary.
    pub fn canonical_id(&self) -> Uuid {
        let mut bytes =
            Vec::with_capacity(16 + self.provider_id.len() + self.native_id.len());
        bytes.extend_from_slice(&(self.provider_id.len() as u64).to_be_bytes());
        bytes.extend_from_slice(self.provider_id.as_bytes());
        bytes.extend_from_slice(&(self.native_id.len() as u64).to_be_bytes());
        bytes.extend_from_slice(self.native_id.as_bytes());
        Uuid::new_v5(&SERVICE_ID_NAMESPACE, &bytes)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.native_id)
    }
}

/// Canonical, resale-ready catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderService {
    pub id: Uuid,
    pub provider_id: String,
    pub provider_native_service_id: String,
    pub display_name: String,
    pub localized_name: String,
    pub description: String,
    pub localized_description: String,
    pub service_type: ServiceType,
    pub platform: Platform,
    pub category: String,
    pub base_rate: f64,
    pub margin_percent: f64,
    #[serde(default)]
    pub margin_source: MarginSource,
    pub resale_rate: f64,
    pub min_quantity: u64,
    pub max_quantity: u64,
    pub is_active: bool,
    pub quality_tier: QualityTier,
    pub supports_refill: bool,
    pub supports_cancel: bool,
    pub average_completion_time: String,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub last_error: Option<String>,
    #[serde(default)]
    pub extra_fields: Map<String, JsonValue>,
}

impl ProviderService {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.provider_id, &self.provider_native_service_id)
    }

    pub fn set_margin(&mut self, margin_percent: f64, source: MarginSource) {
        self.margin_percent = margin_percent;
        self.margin_source = source;
        self.reprice();
    }

    pub fn set_base_rate(&mut self, base_rate: f64) {
        self.base_rate = base_rate;
        self.reprice();
    }

    pub fn reprice(&mut self) {
        self.resale_rate = compute_resale_rate(self.base_rate, self.margin_percent);
    }

    pub fn pricing_is_consistent(&self) -> bool {
        self.resale_rate == compute_resale_rate(self.base_rate, self.margin_percent)
    }
}

/// Query over the catalog snapshot. Rate bounds apply to `resale_rate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceFilter {
    pub provider_id: Option<String>,
    pub platform: Option<Platform>,
    pub service_type: Option<ServiceType>,
    pub quality_tier: Option<QualityTier>,
    pub min_rate: Option<f64>,
    pub max_rate: Option<f64>,
    pub is_active: Option<bool>,
}

impl ServiceFilter {
    pub fn matches(&self, service: &ProviderService) -> bool {
        self.provider_id
            .as_deref()
            .map_or(true, |id| service.provider_id == id)
            && self.platform.map_or(true, |p| service.platform == p)
            && self.service_type.map_or(true, |t| service.service_type == t)
            && self.quality_tier.map_or(true, |q| service.quality_tier == q)
            && self.min_rate.map_or(true, |min| service.resale_rate >= min)
            && self.max_rate.map_or(true, |max| service.resale_rate <= max)
            && self.is_active.map_or(true, |a| service.is_active == a)
    }
}

/// Optional match criteria of a pricing rule. Absent fields always match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub service_type: Option<ServiceType>,
    #[serde(default)]
    pub quality_tier: Option<QualityTier>,
    /// Matches services whose `min_quantity` is at least this value.
    #[serde(default)]
    pub min_quantity: Option<u64>,
    /// Matches services whose `max_quantity` is at most this value.
    #[serde(default)]
    pub max_quantity: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub margin_percent: f64,
    #[serde(default)]
    pub fixed_markup: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

/// Immutable record of one sync attempt for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub provider_id: String,
    pub total_services_seen: usize,
    pub new_services: usize,
    pub updated_services: usize,
    pub error_count: usize,
    pub error_details: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// `false` when the sync ran but the catalog could not be saved. Covers
    /// the catalog snapshot only; the history entry is written afterwards.
    pub persisted: bool,
}

impl SyncResult {
    pub fn started(provider_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.into(),
            total_services_seen: 0,
            new_services: 0,
            updated_services: 0,
            error_count: 0,
            error_details: Vec::new(),
            started_at,
            duration_seconds: 0.0,
            persisted: false,
        }
    }

    pub fn record_error(&mut self, detail: impl Into<String>) {
        self.error_count += 1;
        self.error_details.push(detail.into());
    }

    pub fn is_clean(&self) -> bool {
        self.error_count == 0 && self.persisted
    }
}

/// Untyped service object as returned by a provider, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawServiceRecord(pub Map<String, JsonValue>);

impl RawServiceRecord {
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.0
    }
}

impl From<Map<String, JsonValue>> for RawServiceRecord {
    fn from(value: Map<String, JsonValue>) -> Self {
        Self(value)
    }
}
