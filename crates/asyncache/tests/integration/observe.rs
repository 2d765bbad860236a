use std::sync::{Arc, Mutex};
use std::time::Duration;

use asyncache::{
    AsyncCache, CacheError, Fetcher, ListenerMode, ObserveError, Resource, ResourceState,
    SharedResource, Status,
};
use asyncache_test::{ScriptedProducer, setup};

#[tokio::test(start_paused = true)]
async fn test_no_cache_resolves_after_retries() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_err("first".to_owned())
        .then_err("second".to_owned())
        .then_ok(42);
    let resource = SharedResource::new(Resource::new(producer.clone(), ()));
    let fetcher = Fetcher::new(resource.clone()).with_retry_count(2);
    assert_eq!(fetcher.status(), Status::NoCache);

    assert_eq!(fetcher.observe_once().await, Ok(42));
    assert_eq!(producer.calls(), 3);
    assert_eq!(resource.lock().status(), &Status::Cached(42));
}

#[tokio::test(start_paused = true)]
async fn test_retries_produce_a_single_terminal_transition() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_err("flaky".to_owned())
        .then_ok(1);
    let resource = SharedResource::new(Resource::new(producer, ()));
    let transitions = Arc::new(Mutex::new(Vec::new()));
    {
        let transitions = Arc::clone(&transitions);
        resource
            .lock()
            .add_listener(ListenerMode::Persistent, move |prev, next| {
                transitions
                    .lock()
                    .unwrap()
                    .push((prev.state(), next.state()));
            });
    }

    let fetcher = Fetcher::new(resource).with_retry_count(1);
    assert_eq!(fetcher.observe_once().await, Ok(1));

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (ResourceState::NoCache, ResourceState::Fetching),
            (ResourceState::Fetching, ResourceState::Cached),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_observers_share_one_production() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_ok_after(Duration::from_millis(50), 7);
    let fetcher = Fetcher::new(Resource::new(producer.clone(), ()));

    let (first, second) = futures::join!(fetcher.observe_once(), fetcher.observe_once());

    assert_eq!(first, Ok(7));
    assert_eq!(second, Ok(7));
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_failures_are_shared() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_err_after(Duration::from_millis(50), "down".to_owned());
    let fetcher = Fetcher::new(Resource::new(producer.clone(), ()));

    let (first, second) = futures::join!(fetcher.observe_once(), fetcher.observe_once());

    assert_eq!(first, Err(ObserveError::Producer("down".to_owned())));
    assert_eq!(second, first);
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_is_refetched() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_err("down".to_owned())
        .then_ok(5);
    let fetcher = Fetcher::new(Resource::new(producer.clone(), ()));

    let err = fetcher.observe_once().await.unwrap_err();
    assert_eq!(err.producer().map(String::as_str), Some("down"));
    assert_eq!(fetcher.status(), Status::Error("down".to_owned()));

    assert_eq!(fetcher.observe_once().await, Ok(5));
    assert_eq!(fetcher.observe_once().await, Ok(5));
    assert_eq!(producer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cache_observers_join_the_boot() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_ok_after(Duration::from_millis(50), 3);
    let cache = AsyncCache::builder(producer.clone(), ()).build();

    let (first, second) = futures::join!(cache.observe_once(), cache.observe_once());

    assert_eq!(first, Ok(3));
    assert_eq!(second, Ok(3));
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_observer_interrupted_by_dispose() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_ok_after(Duration::from_millis(50), 3);
    let cache = AsyncCache::builder(producer, ()).build();

    let (observed, ()) = futures::join!(cache.observe_once(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.dispose();
    });

    assert_eq!(observed, Err(CacheError::Interrupted.into()));
}
