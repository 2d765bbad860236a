use asyncache::{AsyncCache, Emission};
use asyncache_test::{Recorder, ScriptedProducer, settle, setup};

fn counting() -> ScriptedProducer<(), u32, String> {
    ScriptedProducer::new()
        .then_ok(1)
        .then_ok(2)
        .then_ok(3)
        .then_ok(4)
        .then_ok(5)
}

#[tokio::test(start_paused = true)]
async fn test_late_subscribers_get_bounded_history() {
    setup();

    let cache = AsyncCache::builder(counting(), ()).replay_count(3).build();
    settle().await;

    let early = Recorder::attach(cache.channel());
    assert_eq!(early.values(), vec![1]);

    cache.force_update(None).unwrap();
    settle().await;
    let second = Recorder::attach(cache.channel());
    assert_eq!(second.values(), vec![1, 2]);

    for _ in 0..3 {
        cache.force_update(None).unwrap();
        settle().await;
    }
    let late = Recorder::attach(cache.channel());

    assert_eq!(early.values(), vec![1, 2, 3, 4, 5]);
    assert_eq!(second.values(), vec![1, 2, 3, 4, 5]);
    assert_eq!(late.values(), vec![3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_no_replay_by_default() {
    setup();

    let cache = AsyncCache::builder(counting(), ()).build();
    settle().await;

    let late = Recorder::attach(cache.channel());
    assert!(late.emissions().is_empty());

    cache.force_update(None).unwrap();
    settle().await;
    assert_eq!(late.values(), vec![2]);
}

#[tokio::test(start_paused = true)]
async fn test_replay_includes_errors() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_err("down".to_owned())
        .then_ok(1);
    let cache = AsyncCache::builder(producer, ()).replay_count(2).build();

    settle().await;
    cache.force_update(None).unwrap();
    settle().await;

    let late = Recorder::attach(cache.channel());
    assert_eq!(
        late.emissions(),
        vec![Emission::Error("down".to_owned()), Emission::Value(1)]
    );
}
