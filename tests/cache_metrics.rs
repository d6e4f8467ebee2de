mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use paddock::application::repos::ContentReader;
use paddock::cache::{
    CacheConfig, DurableConfig, DurableStore, MemoryBackend, ResourceKey, TtlStore,
};
use paddock::infra::auth::StaticAuth;
use paddock::infra::gateway::{GatewayOptions, ListLimits, RestGateway};
use paddock::query::{QueryClient, QueryConfig, QueryKey};
use paddock::realtime::{ChangeEvent, ChangeFeedListener, ChannelTransport, Operation};
use reqwest::Url;
use serde_json::json;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{harness, item};

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Gateway memory tier: miss, hit, eviction.
    let tiny = CacheConfig {
        capacity: 1,
        ..CacheConfig::default()
    };
    let store: TtlStore<&'static str, u32> = TtlStore::new(&tiny);
    assert!(store.get(&"featured").is_none());
    store.insert("featured", 1, Duration::from_secs(60));
    assert_eq!(store.get(&"featured"), Some(1));
    store.insert("items", 2, Duration::from_secs(60));

    // Durable tier: miss then hit.
    let durable = DurableStore::new(Arc::new(MemoryBackend::new()), DurableConfig::default());
    assert!(durable.get::<Vec<u32>>(&ResourceKey::Items).await.is_none());
    durable.set(&ResourceKey::Items, &vec![1u32]).await;
    assert!(durable.get::<Vec<u32>>(&ResourceKey::Items).await.is_some());

    // Gateway round trip, then a stale fallback once the entry expires.
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1, "published": true }])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let gateway = RestGateway::new(GatewayOptions {
        base_url: Url::parse(&format!("{}/", server.uri())).expect("mock server url"),
        anon_key: "anon-key".into(),
        request_timeout: Duration::from_secs(5),
        limits: ListLimits::default(),
        cache: CacheConfig {
            list_ttl: Duration::from_millis(20),
            ..CacheConfig::default()
        },
    })
    .expect("gateway");
    gateway.fetch(&ResourceKey::Items).await.expect("fresh read");
    tokio::time::sleep(Duration::from_millis(60)).await;
    gateway.fetch(&ResourceKey::Items).await.expect("stale read");

    // Orchestrator falling through to the built-in fallback.
    let h = harness(vec![item(1, "f1")], StaticAuth::anonymous());
    h.backend.fail(true);
    assert!(h.content.all_items().await.is_empty());

    // Query layer: one fetch, then a hit.
    let client = QueryClient::new(QueryConfig::default(), None);
    for _ in 0..2 {
        client
            .fetch(QueryKey::items(), || async {
                Ok(paddock::query::QueryData::Items(Arc::new(Vec::new())))
            })
            .await
            .expect("query");
    }

    // Change feed.
    let listener = ChangeFeedListener::new(client, Arc::new(ChannelTransport::new()));
    listener
        .apply(&ChangeEvent::new(
            "posts",
            Operation::Delete,
            None,
            Some(json!({ "id": 1 })),
        ))
        .await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "paddock_gateway_cache_hit_total",
        "paddock_gateway_cache_miss_total",
        "paddock_gateway_cache_evict_total",
        "paddock_gateway_fetch_ms",
        "paddock_gateway_stale_served_total",
        "paddock_durable_hit_total",
        "paddock_durable_miss_total",
        "paddock_read_fallback_total",
        "paddock_query_fetch_total",
        "paddock_query_hit_total",
        "paddock_change_events_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
