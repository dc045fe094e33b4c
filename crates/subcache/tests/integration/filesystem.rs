use std::sync::Arc;

use subcache::caching::{FilesystemStore, build_key};
use subcache::fetch::RequestInit;
use subcache_test::Upstream;

use crate::utils::{Fixture, manual_clock};

#[tokio::test]
async fn test_responses_survive_restarts() {
    subcache_test::setup();
    let cache_dir = subcache_test::tempdir();
    let upstream = Upstream::new();
    let url = upstream.url("product/7");

    let clock = manual_clock();
    let store = FilesystemStore::new(cache_dir.path())
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    let fixture = Fixture::with_store(clock, Arc::new(store));

    let (body, _) = fixture
        .fetch(url.as_str(), RequestInit::default(), fixture.options())
        .await
        .unwrap();
    assert_eq!(body.as_json().unwrap()["title"], "Widget 7");

    let store = FilesystemStore::new(cache_dir.path()).unwrap();
    let key = build_key(&(url.as_str(), RequestInit::default())).unwrap();
    assert!(store.entry_path(&key).is_file());

    // a second store on the same directory, as after a restart
    let store = store.with_clock(Arc::new(fixture.clock.clone()));
    let restarted = Fixture::with_store(fixture.clock.clone(), Arc::new(store));
    let (body, response) = restarted
        .fetch(url.as_str(), RequestInit::default(), restarted.options())
        .await
        .unwrap();
    assert_eq!(body.as_json().unwrap()["title"], "Widget 7");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    assert_eq!(upstream.hits("/product/7"), 1);
    assert_eq!(restarted.store.sets(), 0);
}

#[tokio::test]
async fn test_cleanup_removes_expired_responses() {
    subcache_test::setup();
    let cache_dir = subcache_test::tempdir();
    let upstream = Upstream::new();

    let clock = manual_clock();
    let store = FilesystemStore::new(cache_dir.path())
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    let fixture = Fixture::with_store(clock, Arc::new(store));

    for path in ["product/1", "product/2"] {
        fixture
            .fetch(
                upstream.url(path).as_str(),
                RequestInit::default(),
                fixture.options(),
            )
            .await
            .unwrap();
    }

    // the `short` preset expires after 10 seconds
    fixture.clock.advance(std::time::Duration::from_secs(11));

    let store = FilesystemStore::new(cache_dir.path())
        .unwrap()
        .with_clock(Arc::new(fixture.clock.clone()));
    let stats = store.cleanup(false).unwrap();
    assert_eq!(stats.removed_files, 2);
    assert_eq!(stats.retained_files, 0);
}
