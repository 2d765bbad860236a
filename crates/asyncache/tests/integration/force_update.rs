use std::time::Duration;

use asyncache::{AsyncCache, Emission, Status};
use asyncache_test::{Recorder, ScriptedProducer, settle, setup};
use futures::StreamExt;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_stale_success_is_discarded() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_ok_after(Duration::from_millis(100), 1)
        .then_ok_after(Duration::from_millis(10), 2);
    let cache = AsyncCache::builder(producer.clone(), ()).build();
    let recorder = Recorder::attach(cache.channel());

    sleep(Duration::from_millis(20)).await;
    cache.force_update(None).unwrap();
    settle().await;

    assert_eq!(producer.calls(), 2);
    assert_eq!(recorder.emissions(), vec![Emission::Value(2)]);
    assert_eq!(cache.status(), Status::Cached(2));
}

#[tokio::test(start_paused = true)]
async fn test_stale_failure_is_discarded() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_err_after(Duration::from_millis(100), "stale".to_owned())
        .then_ok_after(Duration::from_millis(10), 2);
    let cache = AsyncCache::builder(producer.clone(), ()).build();
    let recorder = Recorder::attach(cache.channel());

    sleep(Duration::from_millis(20)).await;
    cache.force_update(None).unwrap();
    settle().await;

    assert_eq!(recorder.emissions(), vec![Emission::Value(2)]);
    assert!(recorder.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fresher_result_wins_when_stale_would_finish_first() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_ok_after(Duration::from_millis(50), 1)
        .then_ok_after(Duration::from_millis(100), 2);
    let cache = AsyncCache::builder(producer.clone(), ()).build();
    let recorder = Recorder::attach(cache.channel());

    sleep(Duration::from_millis(20)).await;
    cache.force_update(None).unwrap();

    // the first production would have finished here
    sleep(Duration::from_millis(60)).await;
    assert!(recorder.emissions().is_empty());

    settle().await;
    assert_eq!(recorder.emissions(), vec![Emission::Value(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_control_channel_rebinds_arguments() {
    setup();

    let producer = |arg: u32| async move {
        sleep(Duration::from_millis(50)).await;
        Ok::<_, String>(arg * 10)
    };
    let cache = AsyncCache::builder(producer, 1).build();
    let mut stream = cache.stream();

    sleep(Duration::from_millis(20)).await;
    cache.control().force_update(Some(9)).unwrap();

    assert_eq!(stream.next().await, Some(Emission::Value(90)));

    // later updates keep the rebound arguments
    cache.control().force_update(None).unwrap();
    assert_eq!(stream.next().await, Some(Emission::Value(90)));
}

#[tokio::test(start_paused = true)]
async fn test_existing_subscribers_see_later_boots() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_ok(1)
        .then_ok(2)
        .then_ok(3);
    let cache = AsyncCache::builder(producer.clone(), ()).build();
    let recorder = Recorder::attach(cache.channel());

    for _ in 0..2 {
        settle().await;
        cache.force_update(None).unwrap();
    }
    settle().await;

    assert_eq!(recorder.values(), vec![1, 2, 3]);
}
