use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pcs_adapters::{AdapterError, AdapterRegistry, ProviderAdapter, ACTION_API_PROTOCOL};
use pcs_core::{
    MarginSource, Platform, PricingRule, Provider, ProviderPatch, ProviderService, QualityTier,
    RawServiceRecord, RuleConditions, ServiceFilter, ServiceKey, SyncResult, SyncStatus,
};
use pcs_storage::{CatalogStore, HttpFetcher, JsonFileStore, MemoryStore};
use pcs_sync::{ConcurrentSyncPolicy, Marketplace, RuleDraft, SyncConfig, SyncError};
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config() -> SyncConfig {
    SyncConfig {
        http_timeout_secs: 5,
        ..SyncConfig::default()
    }
}

async fn serve_action_api(server: &MockServer, body: Value) {
    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/api/v2"))
        .and(body_string_contains("action=services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn serve_slowly(server: &MockServer, body: Value, delay: Duration) {
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(body)
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

fn action_provider(server: &MockServer, margin: f64) -> Provider {
    Provider::new("panel-p", "Panel P", format!("{}/api/v2", server.uri()), margin)
        .with_protocol(ACTION_API_PROTOCOL)
        .with_credential("secret")
}

#[tokio::test]
async fn resync_updates_the_same_record_when_upstream_price_moves() {
    let server = MockServer::start().await;
    serve_action_api(
        &server,
        json!([{"service": "123", "name": "Instagram Followers", "rate": "0.50", "min": 10, "max": 5000}]),
    )
    .await;

    let m = Marketplace::new(config(), Arc::new(MemoryStore::new())).expect("marketplace");
    m.add_provider(action_provider(&server, 30.0)).await.expect("add");

    let first = m.trigger_sync("panel-p").await.expect("first sync");
    assert_eq!((first.new_services, first.updated_services), (1, 0));
    let id = ServiceKey::new("panel-p", "123").canonical_id();
    assert_eq!(m.get_service(id).await.expect("service").resale_rate, 0.65);

    serve_action_api(
        &server,
        json!([{"service": "123", "name": "Instagram Followers", "rate": "0.80", "min": 10, "max": 5000}]),
    )
    .await;
    let second = m.trigger_sync("panel-p").await.expect("second sync");
    assert_eq!((second.new_services, second.updated_services), (0, 1));

    let services = m.list_services(None).await;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, id);
    assert_eq!(services[0].base_rate, 0.80);
    assert_eq!(services[0].resale_rate, 1.04);
}

#[tokio::test]
async fn repeated_sync_of_unchanged_catalog_is_idempotent() {
    let server = MockServer::start().await;
    serve_action_api(
        &server,
        json!([
            {"service": 1, "name": "Instagram Likes", "rate": 0.2},
            {"service": 2, "name": "TikTok Views", "rate": 0.05},
            {"service": 3, "name": "YouTube Subscribers", "rate": 3.0}
        ]),
    )
    .await;

    let m = Marketplace::new(config(), Arc::new(MemoryStore::new())).expect("marketplace");
    m.add_provider(action_provider(&server, 20.0)).await.expect("add");

    let first = m.trigger_sync("panel-p").await.expect("first");
    let second = m.trigger_sync("panel-p").await.expect("second");
    assert_eq!(first.new_services, 3);
    assert_eq!(second.new_services, 0);
    assert_eq!(second.updated_services, 3);
    assert_eq!(m.list_services(None).await.len(), 3);
}

#[tokio::test]
async fn one_malformed_record_does_not_sink_the_batch() {
    let server = MockServer::start().await;
    serve_action_api(
        &server,
        json!([
            {"service": 1, "name": "Instagram Likes", "rate": 0.2},
            {"service": 2, "name": "Instagram Views", "rate": "n/a"},
            {"service": 3, "name": "Instagram Comments", "rate": 1.5},
            {"service": 4, "name": "Instagram Shares", "rate": 0.7}
        ]),
    )
    .await;

    let m = Marketplace::new(config(), Arc::new(MemoryStore::new())).expect("marketplace");
    m.add_provider(action_provider(&server, 20.0)).await.expect("add");

    let result = m.trigger_sync("panel-p").await.expect("sync");
    assert_eq!(result.total_services_seen, 4);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.error_details.len(), 1);
    assert!(result.error_details[0].contains("invalid rate"));
    assert_eq!(m.list_services(None).await.len(), 3);
}

#[tokio::test]
async fn higher_priority_rule_wins_and_unmatched_services_keep_margin() {
    let server = MockServer::start().await;
    serve_action_api(
        &server,
        json!([
            {"service": "ig-hq", "name": "Instagram HQ Followers", "category": "Instagram", "rate": 1.2},
            {"service": "tt", "name": "TikTok Likes", "category": "TikTok", "rate": 0.4}
        ]),
    )
    .await;

    let m = Marketplace::new(config(), Arc::new(MemoryStore::new())).expect("marketplace");
    m.add_provider(action_provider(&server, 30.0)).await.expect("add");
    m.trigger_sync("panel-p").await.expect("sync");

    let ig_high = RuleConditions {
        platform: Some(Platform::Instagram),
        quality_tier: Some(QualityTier::High),
        ..Default::default()
    };
    let now = chrono::Utc::now();
    let p5: PricingRule = RuleDraft::new("p5", 40.0)
        .with_priority(5)
        .with_conditions(ig_high.clone())
        .into_rule(now);
    let p9: PricingRule = RuleDraft::new("p9", 60.0)
        .with_priority(9)
        .with_conditions(ig_high)
        .into_rule(now);

    m.apply_pricing_rules(Some(&[p5.clone()][..])).await.expect("apply p5");
    let hq = ServiceKey::new("panel-p", "ig-hq").canonical_id();
    let tt = ServiceKey::new("panel-p", "tt").canonical_id();
    assert_eq!(m.get_service(hq).await.expect("hq").resale_rate, 1.68);
    assert_eq!(m.get_service(tt).await.expect("tt").margin_percent, 30.0);

    let report = m
        .apply_pricing_rules(Some(&[p9, p5][..]))
        .await
        .expect("apply both");
    assert_eq!(report.repriced, 1);
    let priced = m.get_service(hq).await.expect("hq");
    assert_eq!(priced.margin_percent, 60.0);
    assert_eq!(priced.margin_source, MarginSource::Rule);
    assert_eq!(priced.resale_rate, 1.92);
}

#[tokio::test]
async fn manual_margin_survives_resync_until_provider_margin_is_reset() {
    let server = MockServer::start().await;
    serve_action_api(&server, json!([{"service": 5, "name": "Instagram Likes", "rate": 1.0}])).await;

    let m = Marketplace::new(config(), Arc::new(MemoryStore::new())).expect("marketplace");
    m.add_provider(action_provider(&server, 30.0)).await.expect("add");
    m.trigger_sync("panel-p").await.expect("sync");

    let id = ServiceKey::new("panel-p", "5").canonical_id();
    m.set_service_margin(id, 80.0).await.expect("manual margin");
    m.trigger_sync("panel-p").await.expect("resync");
    assert_eq!(m.get_service(id).await.expect("svc").resale_rate, 1.8);

    assert_eq!(m.set_provider_margin("panel-p", 10.0).await.expect("reset"), 1);
    let reset = m.get_service(id).await.expect("svc");
    assert_eq!(reset.resale_rate, 1.1);
    assert_eq!(
        m.get_provider("panel-p").await.expect("provider").default_margin_percent,
        10.0
    );
}

#[tokio::test]
async fn removing_a_provider_cascades_to_its_services() {
    let server = MockServer::start().await;
    serve_action_api(
        &server,
        json!([
            {"service": 1, "name": "Instagram Likes", "rate": 0.2},
            {"service": 2, "name": "Instagram Views", "rate": 0.1}
        ]),
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let m = Marketplace::new(config(), store.clone()).expect("marketplace");
    m.add_provider(action_provider(&server, 20.0)).await.expect("add");
    m.trigger_sync("panel-p").await.expect("sync");

    assert_eq!(m.remove_provider("panel-p").await.expect("remove"), 2);
    let filter = ServiceFilter {
        provider_id: Some("panel-p".into()),
        ..Default::default()
    };
    assert!(m.list_services(Some(&filter)).await.is_empty());
    assert!(store.load_services().await.expect("saved").is_empty());
    assert!(matches!(
        m.remove_provider("panel-p").await,
        Err(SyncError::ProviderNotFound(_))
    ));
}

#[tokio::test]
async fn removing_a_provider_mid_sync_leaves_no_services_behind() {
    let server = MockServer::start().await;
    serve_slowly(
        &server,
        json!([{"service": 1, "name": "Instagram Likes", "rate": 0.2}]),
        Duration::from_millis(500),
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let m = Marketplace::new(config(), store.clone()).expect("marketplace");
    m.add_provider(action_provider(&server, 20.0)).await.expect("add");

    let background = {
        let m = m.clone();
        tokio::spawn(async move { m.trigger_sync("panel-p").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let removed = m.remove_provider("panel-p").await.expect("remove");
    let synced = background.await.expect("join").expect("sync");
    assert_eq!(synced.new_services, 1);
    assert_eq!(removed, 1);

    assert!(m.list_providers().await.is_empty());
    assert!(m.list_services(None).await.is_empty());
    assert!(store.load_services().await.expect("saved").is_empty());
    assert!(store.load_providers().await.expect("saved").is_empty());
}

#[tokio::test]
async fn margin_change_during_sync_is_not_undone_by_it() {
    let server = MockServer::start().await;
    serve_slowly(
        &server,
        json!([{"service": 1, "name": "Instagram Likes", "rate": 1.0}]),
        Duration::from_millis(400),
    )
    .await;

    let m = Marketplace::new(config(), Arc::new(MemoryStore::new())).expect("marketplace");
    m.add_provider(action_provider(&server, 30.0)).await.expect("add");

    let background = {
        let m = m.clone();
        tokio::spawn(async move { m.trigger_sync("panel-p").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(m.set_provider_margin("panel-p", 50.0).await.expect("margin"), 1);
    background.await.expect("join").expect("sync");

    let service = &m.list_services(None).await[0];
    assert_eq!(service.margin_percent, 50.0);
    assert_eq!(service.margin_source, MarginSource::ProviderDefault);
    assert_eq!(service.resale_rate, 1.5);

    let background = {
        let m = m.clone();
        tokio::spawn(async move { m.trigger_sync("panel-p").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    m.update_provider(
        "panel-p",
        ProviderPatch {
            default_margin_percent: Some(60.0),
            ..Default::default()
        },
    )
    .await
    .expect("update");
    background.await.expect("join").expect("sync");

    let service = &m.list_services(None).await[0];
    assert_eq!(service.margin_percent, 60.0);
    assert_eq!(service.resale_rate, 1.6);
}

#[tokio::test]
async fn failed_fetch_flags_existing_services_until_next_good_sync() {
    let server = MockServer::start().await;
    serve_action_api(
        &server,
        json!([
            {"service": 1, "name": "Instagram Likes", "rate": 0.2},
            {"service": 2, "name": "Instagram Views", "rate": 0.1}
        ]),
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let m = Marketplace::new(config(), store.clone()).expect("marketplace");
    m.add_provider(action_provider(&server, 20.0)).await.expect("add");
    m.trigger_sync("panel-p").await.expect("first sync");

    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let failed = m.trigger_sync("panel-p").await.expect("failed sync");
    assert_eq!(failed.error_count, 1);

    let saved = store.load_services().await.expect("saved");
    assert_eq!(saved.len(), 2);
    for service in &saved {
        assert_eq!(service.sync_status, SyncStatus::Error);
        assert_eq!(service.last_error.as_deref(), Some(failed.error_details[0].as_str()));
        assert!(service.pricing_is_consistent());
    }

    serve_action_api(&server, json!([{"service": 1, "name": "Instagram Likes", "rate": 0.2}])).await;
    m.trigger_sync("panel-p").await.expect("recovered sync");
    let likes = m
        .get_service(ServiceKey::new("panel-p", "1").canonical_id())
        .await
        .expect("likes");
    assert_eq!(likes.sync_status, SyncStatus::Synced);
    assert!(likes.last_error.is_none());
    let views = m
        .get_service(ServiceKey::new("panel-p", "2").canonical_id())
        .await
        .expect("views");
    assert_eq!(views.sync_status, SyncStatus::Pending);
}

/// Accepts everything except sync history.
struct NoHistoryStore(MemoryStore);

#[async_trait]
impl CatalogStore for NoHistoryStore {
    async fn load_providers(&self) -> anyhow::Result<Vec<Provider>> {
        self.0.load_providers().await
    }
    async fn save_providers(&self, providers: &[Provider]) -> anyhow::Result<()> {
        self.0.save_providers(providers).await
    }
    async fn load_services(&self) -> anyhow::Result<Vec<ProviderService>> {
        self.0.load_services().await
    }
    async fn save_services(&self, services: &[ProviderService]) -> anyhow::Result<()> {
        self.0.save_services(services).await
    }
    async fn load_rules(&self) -> anyhow::Result<Vec<PricingRule>> {
        self.0.load_rules().await
    }
    async fn save_rules(&self, rules: &[PricingRule]) -> anyhow::Result<()> {
        self.0.save_rules(rules).await
    }
    async fn append_sync_result(&self, _result: &SyncResult) -> anyhow::Result<()> {
        anyhow::bail!("history log unavailable")
    }
    async fn list_recent_sync_results(&self, limit: usize) -> anyhow::Result<Vec<SyncResult>> {
        self.0.list_recent_sync_results(limit).await
    }
}

#[tokio::test]
async fn persisted_flag_reflects_the_catalog_not_the_history_log() {
    let server = MockServer::start().await;
    serve_action_api(&server, json!([{"service": 1, "name": "IG Likes", "rate": 0.2}])).await;

    let store = Arc::new(NoHistoryStore(MemoryStore::new()));
    let m = Marketplace::new(config(), store.clone()).expect("marketplace");
    m.add_provider(action_provider(&server, 20.0)).await.expect("add");

    let result = m.trigger_sync("panel-p").await.expect("sync");
    assert!(result.persisted);
    assert_eq!(store.load_services().await.expect("saved").len(), 1);
    assert!(m.get_sync_history(None).await.expect("history").is_empty());
}

#[tokio::test]
async fn overlapping_sync_for_the_same_provider_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"service": 1, "name": "IG Likes", "rate": 0.2}]))
                .set_delay(Duration::from_millis(600)),
        )
        .mount(&server)
        .await;

    let m = Marketplace::new(config(), Arc::new(MemoryStore::new())).expect("marketplace");
    m.add_provider(action_provider(&server, 20.0)).await.expect("add");

    let background = {
        let m = m.clone();
        tokio::spawn(async move { m.trigger_sync("panel-p").await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(matches!(
        m.trigger_sync("panel-p").await,
        Err(SyncError::ConcurrentSyncRejected(id)) if id == "panel-p"
    ));
    let finished = background.await.expect("join").expect("first sync");
    assert_eq!(finished.new_services, 1);
}

#[tokio::test]
async fn wait_policy_serializes_overlapping_syncs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"service": 1, "name": "IG Likes", "rate": 0.2}]))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let config = SyncConfig {
        concurrent_sync: ConcurrentSyncPolicy::Wait,
        ..config()
    };
    let m = Marketplace::new(config, Arc::new(MemoryStore::new())).expect("marketplace");
    m.add_provider(action_provider(&server, 20.0)).await.expect("add");

    let (a, b) = tokio::join!(m.trigger_sync("panel-p"), m.trigger_sync("panel-p"));
    let mut news = [a.expect("a").new_services, b.expect("b").new_services];
    news.sort_unstable();
    assert_eq!(news, [0, 1]);
}

#[tokio::test]
async fn unsaved_sync_is_flagged_not_persisted() {
    let server = MockServer::start().await;
    serve_action_api(&server, json!([{"service": 1, "name": "IG Likes", "rate": 0.2}])).await;

    let store = Arc::new(MemoryStore::new());
    let m = Marketplace::new(config(), store.clone()).expect("marketplace");
    m.add_provider(action_provider(&server, 20.0)).await.expect("add");

    store.set_reject_writes(true);
    let result = m.trigger_sync("panel-p").await.expect("sync");
    assert_eq!(result.new_services, 1);
    assert!(!result.persisted);
    assert!(!result.is_clean());
    assert!(matches!(
        m.set_provider_margin("panel-p", 5.0).await,
        Err(SyncError::Persistence(_))
    ));
}

#[tokio::test]
async fn sync_all_isolates_provider_failures_and_records_history() {
    let good = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "services": [{"service": "a", "name": "YouTube Views", "rate": 0.01}]
        })))
        .mount(&good)
        .await;
    let broken = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "maintenance"})))
        .mount(&broken)
        .await;

    let m = Marketplace::new(config(), Arc::new(MemoryStore::new())).expect("marketplace");
    m.add_provider(Provider::new("a-good", "Good", good.uri(), 10.0))
        .await
        .expect("add good");
    m.add_provider(Provider::new("b-broken", "Broken", broken.uri(), 10.0))
        .await
        .expect("add broken");
    let mut idle = Provider::new("c-idle", "Idle", broken.uri(), 10.0);
    idle.is_active = false;
    m.add_provider(idle).await.expect("add idle");

    let results = m.trigger_sync_all().await;
    let ids: Vec<_> = results.iter().map(|r| r.provider_id.as_str()).collect();
    assert_eq!(ids, vec!["a-good", "b-broken"]);
    assert_eq!(results[0].new_services, 1);
    assert_eq!(results[1].error_count, 1);
    assert!(results[1].error_details[0].contains("maintenance"));

    let history = m.get_sync_history(Some(10)).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(m.get_sync_history(Some(1)).await.expect("history").len(), 1);
}

struct FixtureAdapter;

#[async_trait]
impl ProviderAdapter for FixtureAdapter {
    fn protocol(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_services(
        &self,
        _http: &HttpFetcher,
        _provider: &Provider,
    ) -> Result<Vec<RawServiceRecord>, AdapterError> {
        let value = json!({"service": "f1", "name": "Snapchat Views", "rate": 0.3, "geo": "SA"});
        match value {
            Value::Object(map) => Ok(vec![RawServiceRecord(map)]),
            _ => Ok(Vec::new()),
        }
    }
}

#[tokio::test]
async fn registered_protocols_need_no_orchestrator_changes() {
    let mut adapters = AdapterRegistry::with_builtin();
    adapters.register(Arc::new(FixtureAdapter));

    let m = Marketplace::new(config(), Arc::new(MemoryStore::new()))
        .expect("marketplace")
        .with_adapters(adapters);
    m.add_provider(Provider::new("fx", "Fixture", "unused://", 50.0).with_protocol("fixture"))
        .await
        .expect("add");

    let result = m.trigger_sync("fx").await.expect("sync");
    assert_eq!(result.new_services, 1);
    let service = &m.list_services(None).await[0];
    assert_eq!(service.platform, Platform::Snapchat);
    assert_eq!(service.resale_rate, 0.45);
    assert_eq!(service.extra_fields.get("geo"), Some(&json!("SA")));
}

#[tokio::test]
async fn state_survives_a_restart_through_the_file_store() {
    let server = MockServer::start().await;
    serve_action_api(&server, json!([{"service": 9, "name": "Instagram Likes", "rate": 0.5}])).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let cfg = SyncConfig {
        data_dir: dir.path().to_path_buf(),
        providers_file: dir.path().join("none.yaml"),
        rules_file: dir.path().join("none.yaml"),
        ..config()
    };
    let store = Arc::new(JsonFileStore::new(dir.path()));
    let m = Marketplace::open(cfg.clone(), store).await.expect("open");
    m.add_provider(action_provider(&server, 30.0)).await.expect("add");
    m.trigger_sync("panel-p").await.expect("sync");
    m.add_rule(RuleDraft::new("flat", 12.0)).await.expect("rule");

    let reopened = Marketplace::open(cfg, Arc::new(JsonFileStore::new(dir.path())))
        .await
        .expect("reopen");
    assert_eq!(reopened.list_providers().await.len(), 1);
    assert_eq!(reopened.list_services(None).await.len(), 1);
    assert_eq!(reopened.list_rules().await.len(), 1);
    assert_eq!(reopened.get_sync_history(None).await.expect("history").len(), 1);
    assert!(reopened
        .get_provider("panel-p")
        .await
        .expect("provider")
        .last_sync_at
        .is_some());
}
