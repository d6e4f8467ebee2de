use std::sync::Arc;
use std::time::Duration;

use paddock::application::repos::{
    ContentReader, ContentWriter, Payload, Principal, RepoError, Role,
};
use paddock::cache::{CacheConfig, Freshness, ResourceKey, ResourcePrefix};
use paddock::domain::entities::ItemInput;
use paddock::infra::gateway::{GatewayOptions, ListLimits, RestGateway};
use reqwest::Url;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway_for(server: &MockServer, cache: CacheConfig) -> Arc<RestGateway> {
    let base_url = Url::parse(&format!("{}/", server.uri())).expect("mock server url");
    Arc::new(
        RestGateway::new(GatewayOptions {
            base_url,
            anon_key: "anon-key".into(),
            request_timeout: Duration::from_secs(5),
            limits: ListLimits::default(),
            cache,
        })
        .expect("gateway"),
    )
}

fn row(id: i64, category: &str) -> serde_json::Value {
    json!({
        "id": id,
        "slug": format!("item-{id}"),
        "title": format!("Item {id}"),
        "category": category,
        "content": "Body",
        "published": true,
        "trending": true,
        "created_at": "2024-05-01T10:00:00Z"
    })
}

fn items(payload: &Payload) -> Vec<i64> {
    match payload {
        Payload::Items(rows) => rows.iter().map(|item| item.id).collect(),
        other => panic!("expected a list, got {other:?}"),
    }
}

#[tokio::test]
async fn memory_hit_skips_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/posts"))
        .and(query_param("published", "eq.true"))
        .and(query_param("trending", "eq.true"))
        .and(query_param("limit", "6"))
        .and(header("apikey", "anon-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row(1, "f1")])))
        .expect(1)
        .mount(&server)
        .await;
    let gateway = gateway_for(&server, CacheConfig::default());

    let first = gateway.fetch(&ResourceKey::Featured).await.expect("first read");
    assert_eq!(first.freshness, Freshness::Fetched);
    assert_eq!(items(&first.payload), vec![1]);

    let second = gateway.fetch(&ResourceKey::Featured).await.expect("second read");
    assert_eq!(second.freshness, Freshness::Cached);
    assert_eq!(items(&second.payload), vec![1]);
}

#[tokio::test]
async fn category_reads_filter_on_the_category_column() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/posts"))
        .and(query_param("category", "eq.motogp"))
        .and(query_param("order", "created_at.desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row(4, "motogp")])))
        .expect(1)
        .mount(&server)
        .await;
    let gateway = gateway_for(&server, CacheConfig::default());

    let fetched = gateway
        .fetch(&ResourceKey::ItemsByCategory("motogp".into()))
        .await
        .expect("category read");
    assert_eq!(items(&fetched.payload), vec![4]);
}

#[tokio::test]
async fn empty_detail_response_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/posts"))
        .and(query_param("id", "eq.42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    let gateway = gateway_for(&server, CacheConfig::default());

    let err = gateway
        .fetch(&ResourceKey::ItemById(42))
        .await
        .expect_err("missing row");
    assert!(matches!(err, RepoError::NotFound));
}

#[tokio::test]
async fn expired_entry_is_served_stale_when_backend_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row(1, "f1"), row(2, "f1")])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    let cache = CacheConfig {
        list_ttl: Duration::from_millis(50),
        ..CacheConfig::default()
    };
    let gateway = gateway_for(&server, cache);

    let fresh = gateway.fetch(&ResourceKey::Items).await.expect("fresh read");
    assert_eq!(items(&fresh.payload), vec![1, 2]);

    tokio::time::sleep(Duration::from_millis(120)).await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/posts"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let stale = gateway.fetch(&ResourceKey::Items).await.expect("stale read");
    assert_eq!(stale.freshness, Freshness::Stale);
    assert_eq!(items(&stale.payload), vec![1, 2]);
}

#[tokio::test]
async fn failure_without_retained_entry_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let gateway = gateway_for(&server, CacheConfig::default());

    let err = gateway
        .fetch(&ResourceKey::Items)
        .await
        .expect_err("nothing to fall back to");
    assert!(err.is_transient());
}

#[tokio::test]
async fn categories_without_id_or_name_are_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/categories"))
        .and(query_param("is_active", "eq.true"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Range", "0-2/3")
                .set_body_json(json!([
                    { "id": "f1", "name": "Formula 1", "level": 1 },
                    { "id": "", "name": "Ghost", "level": 1 },
                    { "id": "wec", "name": "", "level": 1 }
                ])),
        )
        .mount(&server)
        .await;
    let gateway = gateway_for(&server, CacheConfig::default());

    let fetched = gateway.fetch(&ResourceKey::Categories).await.expect("categories");
    match fetched.payload {
        Payload::Categories(categories) => {
            let ids: Vec<&str> = categories.iter().map(|c| c.id.as_str()).collect();
            assert_eq!(ids, vec!["f1"]);
        }
        other => panic!("expected categories, got {other:?}"),
    }
}

#[tokio::test]
async fn unique_violation_maps_to_duplicate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/posts"))
        .and(header("authorization", "Bearer editor-token"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "23505",
            "message": "duplicate key value violates unique constraint",
            "details": "Key (slug)=(monaco) already exists."
        })))
        .mount(&server)
        .await;
    let gateway = gateway_for(&server, CacheConfig::default());
    let actor = Principal {
        user_id: "editor-1".into(),
        role: Role::Editor,
        access_token: Some("editor-token".into()),
    };
    let input = ItemInput {
        title: "Monaco".into(),
        slug: Some("monaco".into()),
        category: "f1".into(),
        content: "Body".into(),
        ..Default::default()
    };

    let err = gateway
        .insert_item(&actor, &input)
        .await
        .expect_err("duplicate slug");
    assert!(matches!(err, RepoError::Duplicate { .. }));
}

#[tokio::test]
async fn invalidation_drops_entries_and_busts_intermediaries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row(1, "f1")])))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/rest/v1/posts"))
        .and(header("cache-control", "no-cache"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let gateway = gateway_for(&server, CacheConfig::default());

    gateway.fetch(&ResourceKey::Items).await.expect("first read");
    assert_eq!(gateway.cached_entries(), 1);

    let dropped = gateway.invalidate(&[ResourcePrefix::Lists]).await;
    assert_eq!(dropped, 1);

    let refetched = gateway.fetch(&ResourceKey::Items).await.expect("refetch");
    assert_eq!(refetched.freshness, Freshness::Fetched);
}

#[tokio::test]
async fn disabled_cache_always_reaches_the_backend() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row(1, "f1")])))
        .expect(2)
        .mount(&server)
        .await;
    let cache = CacheConfig {
        enabled: false,
        ..CacheConfig::default()
    };
    let gateway = gateway_for(&server, cache);

    gateway.fetch(&ResourceKey::Items).await.expect("first");
    gateway.fetch(&ResourceKey::Items).await.expect("second");
    assert_eq!(gateway.cached_entries(), 0);
}

#[tokio::test]
async fn editor_listing_uses_the_session_and_bypasses_the_cache() {
    let server = MockServer::start().await;
    let mut draft = row(2, "f1");
    draft["published"] = json!(false);
    Mock::given(method("GET"))
        .and(path("/rest/v1/posts"))
        .and(query_param("order", "created_at.desc"))
        .and(header("authorization", "Bearer editor-token"))
        .and(header("cache-control", "no-cache"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([draft, row(1, "f1")])))
        .expect(2)
        .mount(&server)
        .await;
    let gateway = gateway_for(&server, CacheConfig::default());
    let actor = Principal {
        user_id: "editor-1".into(),
        role: Role::Editor,
        access_token: Some("editor-token".into()),
    };

    for _ in 0..2 {
        let listed = gateway.list_items(&actor).await.expect("editor listing");
        let ids: Vec<i64> = listed.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(!listed[0].published);
    }
    assert_eq!(gateway.cached_entries(), 0);
}
