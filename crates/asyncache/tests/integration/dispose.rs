use std::time::Duration;

use asyncache::{AsyncCache, CacheError, Emission};
use asyncache_test::{Recorder, ScriptedProducer, settle, setup};
use tokio::time::sleep;

fn slow() -> ScriptedProducer<(), u32, String> {
    ScriptedProducer::new().then_ok_after(Duration::from_millis(100), 1)
}

#[tokio::test(start_paused = true)]
async fn test_dispose_mid_flight() {
    setup();

    let producer = slow();
    let cache = AsyncCache::builder(producer.clone(), ()).build();
    let recorder = Recorder::attach(cache.channel());

    sleep(Duration::from_millis(20)).await;
    cache.dispose();
    cache.dispose();
    settle().await;

    assert!(cache.is_disposed());
    assert!(recorder.emissions().is_empty());
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_rejects_operations() {
    setup();

    let cache = AsyncCache::builder(slow(), ()).build();
    let control = cache.control();
    settle().await;

    cache.dispose();

    assert_eq!(cache.force_update(None), Err(CacheError::Disposed));
    assert_eq!(control.force_update(None), Err(CacheError::Disposed));
    assert_eq!(
        cache.observe_once().await,
        Err(CacheError::Disposed.into())
    );
}

#[tokio::test(start_paused = true)]
async fn test_dispose_keeps_past_emissions() {
    setup();

    let cache = AsyncCache::builder(slow(), ()).replay_count(1).build();
    settle().await;
    cache.dispose();

    let late = Recorder::attach(cache.channel());
    assert_eq!(late.emissions(), vec![Emission::Value(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_drop_cancels_production() {
    setup();

    let producer = slow();
    let cache = AsyncCache::builder(producer.clone(), ()).build();
    let recorder = Recorder::attach(cache.channel());
    let control = cache.control();

    sleep(Duration::from_millis(20)).await;
    drop(cache);
    settle().await;

    assert!(recorder.emissions().is_empty());
    assert_eq!(control.force_update(None), Err(CacheError::Disposed));
}
