use std::sync::{Arc, Mutex};

use asyncache::{AsyncCache, Interceptor, Status};
use asyncache_test::{Recorder, settle, setup};

type Log = Arc<Mutex<Vec<String>>>;

struct Tagging {
    name: &'static str,
    log: Log,
    arguments: fn(u32) -> u32,
    value: fn(u32) -> u32,
}

impl Interceptor<u32, u32, String> for Tagging {
    fn before(&self, arguments: &mut u32) {
        self.log.lock().unwrap().push(format!("{} before", self.name));
        *arguments = (self.arguments)(*arguments);
    }

    fn after(&self, outcome: &mut Result<u32, String>) {
        self.log.lock().unwrap().push(format!("{} after", self.name));
        if let Ok(value) = outcome {
            *value = (self.value)(*value);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_interceptors_run_in_order() {
    setup();

    let log = Log::default();
    let producer = |arg: u32| async move { Ok::<_, String>(arg) };
    let cache = AsyncCache::builder(producer, 1)
        .interceptor(Tagging {
            name: "a",
            log: log.clone(),
            arguments: |arg| arg + 1,
            value: |value| value + 1,
        })
        .interceptor(Tagging {
            name: "b",
            log: log.clone(),
            arguments: |arg| arg * 10,
            value: |value| value * 2,
        })
        .build();
    let recorder = Recorder::attach(cache.channel());

    settle().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["a before", "b before", "a after", "b after"]
    );
    assert_eq!(recorder.values(), vec![42]);
    assert_eq!(cache.status(), Status::Cached(42));
}

#[tokio::test(start_paused = true)]
async fn test_interceptors_wrap_every_attempt() {
    setup();

    let log = Log::default();
    let producer = |_: u32| async { Err::<u32, _>("down".to_owned()) };
    let cache = AsyncCache::builder(producer, 0)
        .retry_count(2)
        .interceptor(Tagging {
            name: "only",
            log: log.clone(),
            arguments: |arg| arg,
            value: |value| value,
        })
        .build();
    let recorder = Recorder::attach(cache.channel());

    settle().await;

    assert_eq!(log.lock().unwrap().len(), 6);
    assert_eq!(recorder.errors(), vec!["down".to_owned()]);
}
