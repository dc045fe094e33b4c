use reqwest::StatusCode;
use serde_json::json;
use subcache::caching::{CacheStatus, CachingStrategy};
use subcache::fetch::{FetchError, RequestInit, ResponseBody, ReturnType, check_graphql_errors};
use subcache_test::{REQUEST_ID, Upstream};

use crate::utils::Fixture;

#[tokio::test]
async fn test_get_is_cached_by_default() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("product/1");

    for _ in 0..3 {
        let (body, response) = fixture
            .fetch(url.as_str(), RequestInit::default(), fixture.options())
            .await
            .unwrap();
        assert_eq!(
            body,
            ResponseBody::Json(json!({"id": 1, "title": "Widget 1"}))
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.status_text(), "OK");
    }

    assert_eq!(upstream.hits("/product/1"), 1);
    assert_eq!(fixture.store.sets(), 1);
    assert_eq!(
        fixture.statuses(),
        [CacheStatus::Miss, CacheStatus::Hit, CacheStatus::Hit]
    );
}

#[tokio::test]
async fn test_post_without_strategy_is_not_cached() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("graphql");

    for _ in 0..2 {
        let init = RequestInit::new("POST").with_body(r#"{"query":"{ products }"}"#);
        let (body, _) = fixture
            .fetch(url.as_str(), init, fixture.options())
            .await
            .unwrap();
        assert_eq!(
            body,
            ResponseBody::Json(json!({"data": {"echo": {"query": "{ products }"}}}))
        );
    }

    assert_eq!(upstream.hits("/graphql"), 2);
    assert_eq!(fixture.store.gets(), 0);
    assert_eq!(fixture.store.sets(), 0);
    // bypassed calls are not reported
    assert!(fixture.statuses().is_empty());
}

#[tokio::test]
async fn test_post_with_strategy_is_cached() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("graphql");

    for _ in 0..2 {
        let init = RequestInit::new("post").with_body(r#"{"query":"{ products }"}"#);
        let options = fixture.options().with_strategy(CachingStrategy::long());
        fixture.fetch(url.as_str(), init, options).await.unwrap();
    }

    assert_eq!(upstream.hits("/graphql"), 1);
    assert_eq!(fixture.store.sets(), 1);

    // a different body is a different key
    let init = RequestInit::new("POST").with_body(r#"{"query":"{ users }"}"#);
    let options = fixture.options().with_strategy(CachingStrategy::long());
    fixture.fetch(url.as_str(), init, options).await.unwrap();
    assert_eq!(upstream.hits("/graphql"), 2);
}

#[tokio::test]
async fn test_no_store_strategy() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("product/2");

    for _ in 0..2 {
        let options = fixture.options().with_strategy(CachingStrategy::no_store());
        fixture
            .fetch(url.as_str(), RequestInit::default(), options)
            .await
            .unwrap();
    }

    assert_eq!(upstream.hits("/product/2"), 2);
    assert_eq!(fixture.store.gets(), 0);
    assert_eq!(fixture.store.sets(), 0);
}

#[tokio::test]
async fn test_graphql_errors_are_not_cached() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("graphql");

    let fetch = |body: &'static str| {
        let init = RequestInit::new("POST").with_body(body);
        let options = fixture
            .options()
            .with_strategy(CachingStrategy::short())
            .with_should_cache_response(|body, _| check_graphql_errors(body));
        fixture.fetch(url.as_str(), init, options)
    };

    for _ in 0..2 {
        let (body, response) = fetch(r#"{"query":"fail"}"#).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!check_graphql_errors(&body));
    }
    assert_eq!(upstream.hits("/graphql"), 2);
    assert_eq!(fixture.store.sets(), 0);

    for _ in 0..2 {
        fetch(r#"{"query":"ok"}"#).await.unwrap();
    }
    assert_eq!(upstream.hits("/graphql"), 3);
    assert_eq!(fixture.store.sets(), 1);
}

#[tokio::test]
async fn test_should_cache_response_sees_status() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("respond_statuscode/503");

    for _ in 0..2 {
        let options = fixture
            .options()
            .with_should_cache_response(|_, response| response.status().is_success());
        let (_, response) = fixture
            .fetch(url.as_str(), RequestInit::default(), options)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    assert_eq!(upstream.hits("/respond_statuscode/503"), 2);
    assert_eq!(fixture.store.sets(), 0);
}

#[tokio::test]
async fn test_response_metadata_is_restored() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("respond_statuscode/404");

    for _ in 0..2 {
        let (body, response) = fixture
            .fetch(url.as_str(), RequestInit::default(), fixture.options())
            .await
            .unwrap();
        // an empty body is not JSON, but valid text
        assert_eq!(body, ResponseBody::Text(String::new()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.status_text(), "Not Found");
        assert_eq!(response.header("x-request-id"), Some(REQUEST_ID));
    }

    assert_eq!(upstream.hits("/respond_statuscode/404"), 1);
    assert_eq!(fixture.statuses(), [CacheStatus::Miss, CacheStatus::Hit]);
}

#[tokio::test]
async fn test_json_falls_back_to_text() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("garbage");

    let (body, _) = fixture
        .fetch(url.as_str(), RequestInit::default(), fixture.options())
        .await
        .unwrap();
    assert_eq!(body.as_text(), Some("<html>definitely not json</html>"));

    let options = fixture.options().with_return_type(ReturnType::Text);
    let (body, _) = fixture
        .fetch(url.as_str(), RequestInit::default(), options)
        .await
        .unwrap();
    assert_eq!(body.as_text(), Some("<html>definitely not json</html>"));
}

#[tokio::test]
async fn test_bytes_return_type() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("binary");

    for _ in 0..2 {
        let options = fixture.options().with_return_type(ReturnType::Bytes);
        let (body, response) = fixture
            .fetch(url.as_str(), RequestInit::default(), options)
            .await
            .unwrap();
        assert_eq!(body, ResponseBody::Bytes(vec![0xff, 0xfe, 0x00, 0x01]));
        assert_eq!(
            response.header("content-type"),
            Some("application/octet-stream")
        );
    }

    assert_eq!(upstream.hits("/binary"), 1);
}

#[tokio::test]
async fn test_undecodable_body() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("binary");

    let err = fixture
        .fetch(url.as_str(), RequestInit::default(), fixture.options())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::BodyDecode { status: 200, .. }));
    assert_eq!(
        err.to_string(),
        "upstream response code: 200 (request id: test-request-id)"
    );
    assert_eq!(fixture.store.sets(), 0);
}

#[tokio::test]
async fn test_custom_cache_key() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();

    let key = json!(["products", "featured"]);
    for path in ["product/1", "product/2"] {
        let options = fixture.options().with_cache_key(key.clone());
        let (body, _) = fixture
            .fetch(upstream.url(path).as_str(), RequestInit::default(), options)
            .await
            .unwrap();
        assert_eq!(body.as_json().unwrap()["id"], 1);
    }

    assert_eq!(upstream.all_hits(), [("/product/1".to_owned(), 1)]);
}

#[tokio::test]
async fn test_headers_are_part_of_the_key() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("product/3");

    for locale in ["en", "de", "en"] {
        let init = RequestInit::default().with_header("accept-language", locale);
        fixture
            .fetch(url.as_str(), init, fixture.options())
            .await
            .unwrap();
    }

    assert_eq!(upstream.hits("/product/3"), 2);
}

#[tokio::test]
async fn test_events_report_upstream_url() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("product/4");

    for _ in 0..2 {
        fixture
            .fetch(url.as_str(), RequestInit::default(), fixture.options())
            .await
            .unwrap();
    }

    let events = fixture.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].key, events[1].key);
    assert_eq!(events[0].key.len(), 64);
    for event in events {
        assert_eq!(event.url, url);
        assert!(event.end_time >= event.start_time);
    }
}

#[tokio::test]
async fn test_request_errors() {
    subcache_test::setup();
    let fixture = Fixture::new();

    let err = fixture
        .fetch("not a url", RequestInit::default(), fixture.options())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InvalidUrl(_)));

    let err = fixture
        .fetch(
            "http://localhost/",
            RequestInit::new("NOT A METHOD"),
            fixture.options(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InvalidMethod(_)));

    assert_eq!(fixture.store.gets(), 0);
}
