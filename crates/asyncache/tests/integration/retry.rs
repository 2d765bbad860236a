use asyncache::{AsyncCache, CacheConfig, Emission, Status};
use asyncache_test::{Recorder, ScriptedProducer, settle, setup};

#[tokio::test(start_paused = true)]
async fn test_always_failing_producer_exhausts_budget() {
    setup();

    for retry_count in [0, 1, 3] {
        let producer = ScriptedProducer::<(), u32, String>::new().then_err("down".to_owned());
        let cache = AsyncCache::builder(producer.clone(), ())
            .retry_count(retry_count)
            .build();
        let recorder = Recorder::attach(cache.channel());

        settle().await;

        assert_eq!(producer.calls(), retry_count as usize + 1);
        assert_eq!(
            recorder.emissions(),
            vec![Emission::Error("down".to_owned())]
        );
        assert_eq!(cache.status(), Status::Error("down".to_owned()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_success_after_two_failures() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_err("first".to_owned())
        .then_err("second".to_owned())
        .then_ok(42);
    let cache = AsyncCache::builder(producer.clone(), ())
        .retry_count(2)
        .build();
    let recorder = Recorder::attach(cache.channel());

    settle().await;

    assert_eq!(producer.calls(), 3);
    assert_eq!(recorder.emissions(), vec![Emission::Value(42)]);
    assert!(recorder.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retries_reuse_arguments() {
    setup();

    let producer = ScriptedProducer::<u32, u32, String>::new()
        .then_err("flaky".to_owned())
        .then_err("flaky".to_owned())
        .then_ok(1);
    let cache = AsyncCache::new(
        producer.clone(),
        5,
        CacheConfig {
            retry_count: 4,
            replay_count: 0,
        },
    );

    settle().await;

    assert_eq!(producer.arguments(), vec![5, 5, 5]);
    assert_eq!(cache.status(), Status::Cached(1));
}

#[tokio::test(start_paused = true)]
async fn test_force_update_recovers_from_error() {
    setup();

    let producer = ScriptedProducer::<(), u32, String>::new()
        .then_err("down".to_owned())
        .then_ok(1);
    let cache = AsyncCache::builder(producer.clone(), ()).build();
    let recorder = Recorder::attach(cache.channel());

    settle().await;
    assert_eq!(recorder.errors(), vec!["down".to_owned()]);

    // the channel stays open after an error
    cache.force_update(None).unwrap();
    settle().await;

    assert_eq!(
        recorder.emissions(),
        vec![Emission::Error("down".to_owned()), Emission::Value(1)]
    );
    assert_eq!(cache.status(), Status::Cached(1));
}
