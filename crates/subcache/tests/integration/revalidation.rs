use std::time::Duration;

use serde_json::json;
use subcache::caching::{CacheStatus, CachingStrategy};
use subcache::fetch::{RequestInit, ResponseBody};
use subcache_test::Upstream;

use crate::utils::Fixture;

fn count(body: &ResponseBody) -> u64 {
    body.as_json().unwrap()["count"].as_u64().unwrap()
}

#[tokio::test]
async fn test_stale_response_is_revalidated() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("counter");
    let strategy = CachingStrategy::custom(Duration::from_secs(10), Duration::from_secs(60));

    let fetch = || {
        let options = fixture.options().with_strategy(strategy);
        fixture.fetch(url.as_str(), RequestInit::default(), options)
    };

    let (body, _) = fetch().await.unwrap();
    assert_eq!(count(&body), 1);

    fixture.clock.advance(Duration::from_secs(20));

    // the stale value is served, the upstream is requested in the background
    let (body, _) = fetch().await.unwrap();
    assert_eq!(count(&body), 1);
    assert_eq!(upstream.hits("/counter"), 2);

    let (body, _) = fetch().await.unwrap();
    assert_eq!(count(&body), 2);
    assert_eq!(upstream.hits("/counter"), 2);

    assert_eq!(
        fixture.statuses(),
        [CacheStatus::Miss, CacheStatus::Stale, CacheStatus::Hit]
    );
}

#[tokio::test]
async fn test_expired_response_is_refetched() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("counter");

    let fetch = || fixture.fetch(url.as_str(), RequestInit::default(), fixture.options());

    let (body, _) = fetch().await.unwrap();
    assert_eq!(count(&body), 1);

    // past the 10 seconds of the `short` preset
    fixture.clock.advance(Duration::from_secs(11));

    let (body, _) = fetch().await.unwrap();
    assert_eq!(count(&body), 2);
    assert_eq!(fixture.statuses(), [CacheStatus::Miss, CacheStatus::Miss]);
}

#[tokio::test]
async fn test_single_revalidation_per_key() {
    subcache_test::setup();
    let upstream = Upstream::new();
    let fixture = Fixture::new();
    let url = upstream.url("delay/200");
    let strategy = CachingStrategy::custom(Duration::from_secs(1), Duration::from_secs(60));

    let fetch = || {
        let options = fixture.options().with_strategy(strategy);
        fixture
            .runner
            .fetch_with_server_cache(&fixture.client, url.as_str(), RequestInit::default(), options)
    };

    fetch().await.unwrap();
    fixture.defer.settled().await;
    fixture.clock.advance(Duration::from_secs(5));

    // all of these are served stale while the first revalidation is still waiting on the upstream
    for _ in 0..5 {
        let (body, _) = fetch().await.unwrap();
        assert_eq!(body, ResponseBody::Json(json!({"delayed": 200})));
    }
    fixture.defer.settled().await;

    assert_eq!(upstream.hits("/delay/200"), 2);
    assert_eq!(fixture.store.sets(), 2);
    assert_eq!(fixture.runner.coordinator().in_flight(), 0);
}
