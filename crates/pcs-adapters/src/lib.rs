//! Provider fetch adapters + normalization of raw provider catalogs.

pub mod localize;
pub mod normalize;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pcs_core::{Provider, RawServiceRecord};
use pcs_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub use localize::{IdentityLocalizer, Localizer, TermDictionaryLocalizer};
pub use normalize::{
    determine_quality_tier, extract_extra_fields, map_platform, map_service_type,
    KeywordPlatformClassifier, NormalizationError, Normalizer, PlatformClassifier,
};

pub const CRATE_NAME: &str = "pcs-adapters";

pub const ACTION_API_PROTOCOL: &str = "action_api";
pub const GENERIC_PROTOCOL: &str = "generic";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("provider {provider_id} unreachable: {message}")]
    ProviderUnreachable {
        provider_id: String,
        message: String,
    },
    #[error("provider {provider_id} protocol error: {message}")]
    ProviderProtocol {
        provider_id: String,
        message: String,
    },
}

impl AdapterError {
    pub fn unreachable(provider_id: &str, message: impl Into<String>) -> Self {
        AdapterError::ProviderUnreachable {
            provider_id: provider_id.to_string(),
            message: message.into(),
        }
    }

    pub fn protocol(provider_id: &str, message: impl Into<String>) -> Self {
        AdapterError::ProviderProtocol {
            provider_id: provider_id.to_string(),
            message: message.into(),
        }
    }

    fn from_fetch(provider_id: &str, err: FetchError) -> Self {
        match err.disposition() {
            RetryDisposition::Retryable => Self::unreachable(provider_id, err.to_string()),
            RetryDisposition::NonRetryable => Self::protocol(provider_id, err.to_string()),
        }
    }
}

/// Turns one provider's wire protocol into raw service records.
///
/// Adapters do I/O only; they never touch the catalog.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn protocol(&self) -> &'static str;

    async fn fetch_services(
        &self,
        http: &HttpFetcher,
        provider: &Provider,
    ) -> Result<Vec<RawServiceRecord>, AdapterError>;
}

/// Operations multiplexed through a single action endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderAction {
    Services,
    Add,
    Status,
    Balance,
}

impl ProviderAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderAction::Services => "services",
            ProviderAction::Add => "add",
            ProviderAction::Status => "status",
            ProviderAction::Balance => "balance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderBalance {
    pub balance: f64,
    pub currency: String,
}

/// One POST endpoint, `key` + `action` form fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionApiAdapter;

impl ActionApiAdapter {
    async fn call(
        &self,
        http: &HttpFetcher,
        provider: &Provider,
        action: ProviderAction,
    ) -> Result<JsonValue, AdapterError> {
        let resp = http
            .post_form(
                &provider.id,
                &provider.api_endpoint,
                &[
                    ("key", provider.api_credential.as_str()),
                    ("action", action.as_str()),
                ],
            )
            .await
            .map_err(|e| AdapterError::from_fetch(&provider.id, e))?;
        parse_json_body(&provider.id, &resp.body)
    }

    pub async fn fetch_balance(
        &self,
        http: &HttpFetcher,
        provider: &Provider,
    ) -> Result<ProviderBalance, AdapterError> {
        let value = self.call(http, provider, ProviderAction::Balance).await?;
        reject_error_envelope(&provider.id, value.get("error"))?;
        let balance = value
            .get("balance")
            .and_then(json_number)
            .ok_or_else(|| AdapterError::protocol(&provider.id, "balance response has no `balance`"))?;
        let currency = value
            .get("currency")
            .and_then(JsonValue::as_str)
            .unwrap_or(provider.currency.as_str())
            .to_string();
        Ok(ProviderBalance { balance, currency })
    }
}

#[async_trait]
impl ProviderAdapter for ActionApiAdapter {
    fn protocol(&self) -> &'static str {
        ACTION_API_PROTOCOL
    }

    async fn fetch_services(
        &self,
        http: &HttpFetcher,
        provider: &Provider,
    ) -> Result<Vec<RawServiceRecord>, AdapterError> {
        let value = self.call(http, provider, ProviderAction::Services).await?;
        service_list_from_envelope(&provider.id, value)
    }
}

/// Conventional `GET {endpoint}/services` with a bearer credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestListAdapter;

#[async_trait]
impl ProviderAdapter for RestListAdapter {
    fn protocol(&self) -> &'static str {
        GENERIC_PROTOCOL
    }

    async fn fetch_services(
        &self,
        http: &HttpFetcher,
        provider: &Provider,
    ) -> Result<Vec<RawServiceRecord>, AdapterError> {
        let url = format!("{}/services", provider.api_endpoint.trim_end_matches('/'));
        let resp = http
            .get(&provider.id, &url, Some(provider.api_credential.as_str()))
            .await
            .map_err(|e| AdapterError::from_fetch(&provider.id, e))?;
        let value = parse_json_body(&provider.id, &resp.body)?;
        service_list_from_envelope(&provider.id, value)
    }
}

fn parse_json_body(provider_id: &str, body: &[u8]) -> Result<JsonValue, AdapterError> {
    serde_json::from_slice(body)
        .map_err(|e| AdapterError::protocol(provider_id, format!("invalid JSON body: {e}")))
}

fn reject_error_envelope(provider_id: &str, error: Option<&JsonValue>) -> Result<(), AdapterError> {
    match error {
        Some(JsonValue::String(message)) => Err(AdapterError::protocol(provider_id, message.clone())),
        Some(JsonValue::Null) | None => Ok(()),
        Some(other) => Err(AdapterError::protocol(provider_id, other.to_string())),
    }
}

/// Accepts a bare array, or an object wrapping it under `services` or `data`.
///
/// Non-object entries are kept as empty records so normalization counts them
/// as failures instead of silently dropping them.
pub fn service_list_from_envelope(
    provider_id: &str,
    value: JsonValue,
) -> Result<Vec<RawServiceRecord>, AdapterError> {
    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => {
            reject_error_envelope(provider_id, map.get("error"))?;
            match map.remove("services").or_else(|| map.remove("data")) {
                Some(JsonValue::Array(items)) => items,
                _ => {
                    return Err(AdapterError::protocol(
                        provider_id,
                        "response object carries no service list",
                    ))
                }
            }
        }
        other => {
            return Err(AdapterError::protocol(
                provider_id,
                format!("unexpected response shape: {other}"),
            ))
        }
    };

    Ok(items
        .into_iter()
        .map(|item| match item {
            JsonValue::Object(map) => RawServiceRecord(map),
            other => {
                warn!(provider_id, entry = %other, "non-object service entry");
                RawServiceRecord::default()
            }
        })
        .collect())
}

pub(crate) fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Protocol name -> adapter. Unknown protocols use the generic REST adapter.
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
    fallback: Arc<dyn ProviderAdapter>,
}

impl AdapterRegistry {
    pub fn new(fallback: Arc<dyn ProviderAdapter>) -> Self {
        let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(fallback.protocol(), fallback.clone());
        Self { adapters, fallback }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new(Arc::new(RestListAdapter));
        registry.register(Arc::new(ActionApiAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.protocol(), adapter);
    }

    pub fn adapter_for(&self, provider: &Provider) -> Arc<dyn ProviderAdapter> {
        match self.adapters.get(provider.api_protocol.as_str()) {
            Some(adapter) => adapter.clone(),
            None => {
                warn!(
                    provider_id = %provider.id,
                    protocol = %provider.api_protocol,
                    "no adapter for protocol; using generic"
                );
                self.fallback.clone()
            }
        }
    }

    pub fn protocols(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.adapters.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcs_storage::HttpClientConfig;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .expect("fetcher")
    }

    fn action_provider(endpoint: String) -> Provider {
        Provider::new("panel-a", "Panel A", endpoint, 30.0)
            .with_protocol(ACTION_API_PROTOCOL)
            .with_credential("k1")
    }

    #[tokio::test]
    async fn action_api_posts_services_action() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2"))
            .and(body_string_contains("key=k1"))
            .and(body_string_contains("action=services"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"service": 1, "name": "IG Followers", "rate": "0.90", "min": "10", "max": "1000"},
                {"service": "2", "name": "TikTok Likes", "rate": 0.4, "min": 50, "max": 5000}
            ])))
            .mount(&server)
            .await;

        let provider = action_provider(format!("{}/api/v2", server.uri()));
        let records = ActionApiAdapter
            .fetch_services(&http(), &provider)
            .await
            .expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("name"), Some(&json!("TikTok Likes")));
    }

    #[tokio::test]
    async fn action_api_error_envelope_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "Invalid API key"})))
            .mount(&server)
            .await;

        let err = ActionApiAdapter
            .fetch_services(&http(), &action_provider(server.uri()))
            .await
            .expect_err("error envelope");
        assert!(
            matches!(err, AdapterError::ProviderProtocol { ref message, .. } if message == "Invalid API key")
        );
    }

    #[tokio::test]
    async fn action_api_reads_balance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("action=balance"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"balance": "100.84292", "currency": "USD"})),
            )
            .mount(&server)
            .await;

        let balance = ActionApiAdapter
            .fetch_balance(&http(), &action_provider(server.uri()))
            .await
            .expect("balance");
        assert_eq!(balance.currency, "USD");
        assert!((balance.balance - 100.84292).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rest_adapter_gets_services_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/services"))
            .and(header("authorization", "Bearer rest-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"service": "a1", "name": "YouTube Views", "rate": 0.1}]
            })))
            .mount(&server)
            .await;

        let provider = Provider::new("rest", "Rest", format!("{}/v1/", server.uri()), 20.0)
            .with_credential("rest-token");
        let records = RestListAdapter
            .fetch_services(&http(), &provider)
            .await
            .expect("records");
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn server_errors_are_unreachable_and_bad_bodies_are_protocol_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down/services"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/junk/services"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let down = Provider::new("down", "Down", format!("{}/down", server.uri()), 10.0);
        let junk = Provider::new("junk", "Junk", format!("{}/junk", server.uri()), 10.0);

        let err = RestListAdapter.fetch_services(&http(), &down).await.expect_err("502");
        assert!(matches!(err, AdapterError::ProviderUnreachable { .. }));

        let err = RestListAdapter.fetch_services(&http(), &junk).await.expect_err("html");
        assert!(matches!(err, AdapterError::ProviderProtocol { .. }));
    }

    #[test]
    fn envelope_keeps_non_object_entries_for_error_accounting() {
        let records =
            service_list_from_envelope("p", json!({"services": [{"service": 1}, 42]})).expect("list");
        assert_eq!(records.len(), 2);
        assert!(records[1].fields().is_empty());

        assert!(service_list_from_envelope("p", json!({"status": "ok"})).is_err());
        assert!(service_list_from_envelope("p", json!("nope")).is_err());
    }

    #[test]
    fn registry_falls_back_to_generic_for_unknown_protocols() {
        let registry = AdapterRegistry::with_builtin();
        assert_eq!(registry.protocols(), vec![ACTION_API_PROTOCOL, GENERIC_PROTOCOL]);

        let action = action_provider("https://panel.test".into());
        assert_eq!(registry.adapter_for(&action).protocol(), ACTION_API_PROTOCOL);

        let odd = Provider::new("odd", "Odd", "https://odd.test", 10.0).with_protocol("soap");
        assert_eq!(registry.adapter_for(&odd).protocol(), GENERIC_PROTOCOL);
    }
}
