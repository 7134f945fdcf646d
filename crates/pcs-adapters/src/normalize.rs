//! Raw provider record -> canonical [`ProviderService`].
//!
//! Every mapping here is total: unknown inputs land on a documented fallback
//! rather than failing. Only records missing identity or price data are
//! rejected.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pcs_core::{
    compute_resale_rate, MarginSource, Platform, Provider, ProviderService, QualityTier,
    RawServiceRecord, ServiceKey, ServiceType, SyncStatus,
};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::json_number;
use crate::localize::{Localizer, TermDictionaryLocalizer};

/// Keys with a canonical home; everything else is carried in `extra_fields`.
pub const CANONICAL_KEYS: &[&str] = &[
    "service",
    "name",
    "type",
    "category",
    "rate",
    "min",
    "max",
    "refill",
    "cancel",
    "description",
    "average_time",
    "dripfeed",
];

pub const PREMIUM_KEYWORDS: &[&str] = &["premium", "hq", "high quality", "real", "vip"];

pub const DEFAULT_MIN_QUANTITY: u64 = 1;
pub const DEFAULT_MAX_QUANTITY: u64 = 100_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    #[error("record has no `service` id")]
    MissingNativeId,
    #[error("service {native_id}: missing name")]
    MissingName { native_id: String },
    #[error("service {native_id}: invalid rate `{raw}`")]
    InvalidRate { native_id: String, raw: String },
    #[error("service {native_id}: invalid `{field}` quantity `{raw}`")]
    InvalidQuantity {
        native_id: String,
        field: &'static str,
        raw: String,
    },
    #[error("service {native_id}: min quantity {min} exceeds max quantity {max}")]
    InvertedQuantityRange {
        native_id: String,
        min: u64,
        max: u64,
    },
}

/// Exact match on the panel `type` vocabulary; anything else is `followers`.
pub fn map_service_type(raw_type: &str) -> ServiceType {
    let raw = raw_type.trim().to_ascii_lowercase();
    if let Some(service_type) = ServiceType::parse(&raw) {
        return service_type;
    }
    match raw.as_str() {
        "custom comments" | "custom comments package" | "mentions custom list" => {
            ServiceType::Comments
        }
        _ => ServiceType::Followers,
    }
}

fn service_type_from_name(name: &str) -> Option<ServiceType> {
    let lower = name.to_lowercase();
    [
        ("subscriber", ServiceType::Subscribers),
        ("follower", ServiceType::Followers),
        ("comment", ServiceType::Comments),
        ("like", ServiceType::Likes),
        ("view", ServiceType::Views),
        ("share", ServiceType::Shares),
    ]
    .into_iter()
    .find(|(needle, _)| lower.contains(needle))
    .map(|(_, service_type)| service_type)
}

/// Panels often send generic types (`Default`, `Package`); the name is a
/// better signal for those.
fn infer_service_type(raw_type: Option<&str>, name: &str) -> ServiceType {
    let raw = raw_type.unwrap_or_default();
    if ServiceType::parse(raw).is_some() {
        return map_service_type(raw);
    }
    let mapped = map_service_type(raw);
    if mapped != ServiceType::Followers {
        return mapped;
    }
    service_type_from_name(name).unwrap_or(mapped)
}

/// Best-effort platform guess from free text. Heuristic, not authoritative.
pub trait PlatformClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Option<Platform>;
}

/// Full platform names match as substrings; abbreviations only as whole words,
/// so "ig" does not fire inside "high".
#[derive(Debug, Clone)]
pub struct KeywordPlatformClassifier {
    names: Vec<(Platform, Vec<String>)>,
    abbreviations: Vec<(Platform, Vec<String>)>,
}

impl KeywordPlatformClassifier {
    pub fn new(
        names: Vec<(Platform, Vec<String>)>,
        abbreviations: Vec<(Platform, Vec<String>)>,
    ) -> Self {
        Self {
            names,
            abbreviations,
        }
    }
}

impl Default for KeywordPlatformClassifier {
    fn default() -> Self {
        fn owned(words: &[&str]) -> Vec<String> {
            words.iter().map(|w| w.to_string()).collect()
        }
        Self::new(
            vec![
                (Platform::Instagram, owned(&["instagram"])),
                (Platform::Tiktok, owned(&["tiktok", "tik tok"])),
                (Platform::Youtube, owned(&["youtube"])),
                (Platform::Twitter, owned(&["twitter", "x.com"])),
                (Platform::Facebook, owned(&["facebook"])),
                (Platform::Snapchat, owned(&["snapchat"])),
            ],
            vec![
                (Platform::Instagram, owned(&["insta", "ig"])),
                (Platform::Youtube, owned(&["yt"])),
                (Platform::Twitter, owned(&["x", "tweet", "tweets", "retweets"])),
                (Platform::Facebook, owned(&["fb"])),
                (Platform::Snapchat, owned(&["snap"])),
            ],
        )
    }
}

impl PlatformClassifier for KeywordPlatformClassifier {
    fn classify(&self, text: &str) -> Option<Platform> {
        let lower = text.to_lowercase();
        if let Some((platform, _)) = self
            .names
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w.as_str())))
        {
            return Some(*platform);
        }

        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        self.abbreviations
            .iter()
            .find(|(_, words)| words.iter().any(|w| tokens.contains(&w.as_str())))
            .map(|(platform, _)| *platform)
    }
}

/// Default classifier over category text, falling back to Instagram.
pub fn map_platform(raw_category_text: &str) -> Platform {
    KeywordPlatformClassifier::default()
        .classify(raw_category_text)
        .unwrap_or(Platform::Instagram)
}

pub fn determine_quality_tier(name: &str, rate: f64) -> QualityTier {
    let lower = name.to_lowercase();
    if PREMIUM_KEYWORDS.iter().any(|k| lower.contains(k)) || rate > 1.0 {
        QualityTier::High
    } else if rate > 0.5 {
        QualityTier::Medium
    } else {
        QualityTier::Low
    }
}

pub fn extract_extra_fields(raw: &RawServiceRecord) -> Map<String, JsonValue> {
    raw.fields()
        .iter()
        .filter(|(key, _)| !CANONICAL_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn text_field(raw: &RawServiceRecord, key: &str) -> Option<String> {
    match raw.get(key)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn flag_field(raw: &RawServiceRecord, key: &str) -> bool {
    match raw.get(key) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(JsonValue::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y"
        ),
        _ => false,
    }
}

fn quantity_field(
    raw: &RawServiceRecord,
    native_id: &str,
    field: &'static str,
    default: u64,
) -> Result<u64, NormalizationError> {
    let Some(value) = raw.get(field).filter(|v| !v.is_null()) else {
        return Ok(default);
    };
    let invalid = || NormalizationError::InvalidQuantity {
        native_id: native_id.to_string(),
        field,
        raw: value.to_string(),
    };
    let number = json_number(value).ok_or_else(invalid)?;
    if !number.is_finite() || number < 0.0 || number.fract() != 0.0 {
        return Err(invalid());
    }
    Ok(number as u64)
}

/// Maps raw records onto the canonical schema using pluggable classifier and
/// localization strategies.
#[derive(Clone)]
pub struct Normalizer {
    classifier: Arc<dyn PlatformClassifier>,
    localizer: Arc<dyn Localizer>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            classifier: Arc::new(KeywordPlatformClassifier::default()),
            localizer: Arc::new(TermDictionaryLocalizer::arabic()),
        }
    }
}

impl Normalizer {
    pub fn new(classifier: Arc<dyn PlatformClassifier>, localizer: Arc<dyn Localizer>) -> Self {
        Self {
            classifier,
            localizer,
        }
    }

    pub fn with_localizer(mut self, localizer: Arc<dyn Localizer>) -> Self {
        self.localizer = localizer;
        self
    }

    pub fn locale(&self) -> &str {
        self.localizer.locale()
    }

    fn platform_for(&self, provider: &Provider, category: &str, name: &str) -> Platform {
        self.classifier
            .classify(category)
            .or_else(|| self.classifier.classify(name))
            .or_else(|| {
                // A single-platform provider is a better guess than the global default.
                let mut platforms = provider.supported_platforms.iter();
                match (platforms.next(), platforms.next()) {
                    (Some(only), None) => Some(*only),
                    _ => None,
                }
            })
            .unwrap_or(Platform::Instagram)
    }

    /// Priced at the provider's default margin.
    pub fn normalize(
        &self,
        provider: &Provider,
        raw: &RawServiceRecord,
        now: DateTime<Utc>,
    ) -> Result<ProviderService, NormalizationError> {
        let native_id = text_field(raw, "service").ok_or(NormalizationError::MissingNativeId)?;
        let name = text_field(raw, "name").ok_or_else(|| NormalizationError::MissingName {
            native_id: native_id.clone(),
        })?;

        let rate_value = raw.get("rate").cloned().unwrap_or(JsonValue::Null);
        let base_rate = json_number(&rate_value)
            .filter(|r| r.is_finite() && *r >= 0.0)
            .ok_or_else(|| NormalizationError::InvalidRate {
                native_id: native_id.clone(),
                raw: rate_value.to_string(),
            })?;

        let min_quantity = quantity_field(raw, &native_id, "min", DEFAULT_MIN_QUANTITY)?;
        let max_quantity = quantity_field(raw, &native_id, "max", DEFAULT_MAX_QUANTITY)?;
        if min_quantity > max_quantity {
            return Err(NormalizationError::InvertedQuantityRange {
                native_id,
                min: min_quantity,
                max: max_quantity,
            });
        }

        let category = text_field(raw, "category").unwrap_or_default();
        let description = text_field(raw, "description").unwrap_or_default();
        let raw_type = text_field(raw, "type");
        let average_completion_time = text_field(raw, "average_time")
            .unwrap_or_else(|| provider.speed_tier.typical_completion_time().to_string());

        let margin_percent = provider.default_margin_percent;
        let key = ServiceKey::new(&provider.id, &native_id);

        Ok(ProviderService {
            id: key.canonical_id(),
            provider_id: provider.id.clone(),
            provider_native_service_id: native_id,
            localized_name: self.localizer.localize_name(&name),
            localized_description: self.localizer.localize_description(&description),
            service_type: infer_service_type(raw_type.as_deref(), &name),
            platform: self.platform_for(provider, &category, &name),
            quality_tier: determine_quality_tier(&name, base_rate),
            display_name: name,
            description,
            category,
            base_rate,
            margin_percent,
            margin_source: MarginSource::ProviderDefault,
            resale_rate: compute_resale_rate(base_rate, margin_percent),
            min_quantity,
            max_quantity,
            is_active: true,
            supports_refill: flag_field(raw, "refill"),
            supports_cancel: flag_field(raw, "cancel"),
            average_completion_time,
            first_seen_at: now,
            updated_at: now,
            sync_status: SyncStatus::Synced,
            last_error: None,
            extra_fields: extract_extra_fields(raw),
        })
    }
}
