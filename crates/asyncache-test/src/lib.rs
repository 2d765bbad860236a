//! Helpers for testing caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Run async tests with paused time (`#[tokio::test(start_paused = true)]`). Producer delays
//!    are then deterministic, and [`settle`] advances the clock past every scripted delay.
//!
//!  - Hold on to the [`Recorder`] for as long as emissions should be collected. Dropping it
//!    unsubscribes from the channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asyncache::{Emission, Multicast, Producer, Subscription};
use futures::future::{BoxFuture, FutureExt};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `asyncache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("asyncache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Sleeps long enough for every scripted producer delay to elapse.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(60)).await;
}

#[derive(Clone, Debug)]
struct Step<T, E> {
    delay: Duration,
    outcome: Result<T, E>,
}

#[derive(Debug)]
struct Script<A, T, E> {
    steps: VecDeque<Step<T, E>>,
    calls: Vec<A>,
}

/// A producer that replays a pre-programmed sequence of outcomes.
///
/// Every call consumes the next step of the script. The last step is repeated once the script
/// runs out, so a single [`then_err`](Self::then_err) makes a producer that always fails.
#[derive(Debug)]
pub struct ScriptedProducer<A, T, E> {
    script: Arc<Mutex<Script<A, T, E>>>,
}

impl<A, T, E> Clone for ScriptedProducer<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
        }
    }
}

impl<A, T, E> Default for ScriptedProducer<A, T, E> {
    fn default() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                steps: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }
}

impl<A, T, E> ScriptedProducer<A, T, E>
where
    A: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, delay: Duration, outcome: Result<T, E>) -> Self {
        self.script
            .lock()
            .unwrap()
            .steps
            .push_back(Step { delay, outcome });
        self
    }

    pub fn then_ok(self, value: T) -> Self {
        self.push(Duration::ZERO, Ok(value))
    }

    pub fn then_err(self, error: E) -> Self {
        self.push(Duration::ZERO, Err(error))
    }

    /// Succeeds with `value` after `delay`.
    pub fn then_ok_after(self, delay: Duration, value: T) -> Self {
        self.push(delay, Ok(value))
    }

    /// Fails with `error` after `delay`.
    pub fn then_err_after(self, delay: Duration, error: E) -> Self {
        self.push(delay, Err(error))
    }

    /// The number of times the producer was called.
    pub fn calls(&self) -> usize {
        self.script.lock().unwrap().calls.len()
    }

    /// The arguments of every call, in call order.
    pub fn arguments(&self) -> Vec<A> {
        self.script.lock().unwrap().calls.clone()
    }
}

impl<A, T, E> Producer<A, T, E> for ScriptedProducer<A, T, E>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn produce(&self, arguments: A) -> BoxFuture<'static, Result<T, E>> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(arguments);
            let step = if script.steps.len() > 1 {
                script.steps.pop_front()
            } else {
                script.steps.front().cloned()
            };
            step.expect("producer called without a scripted outcome")
        };

        async move {
            if !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
            step.outcome
        }
        .boxed()
    }
}

/// Collects everything emitted on a [`Multicast`] channel.
#[derive(Debug)]
pub struct Recorder<T, E> {
    emissions: Arc<Mutex<Vec<Emission<T, E>>>>,
    _subscription: Subscription,
}

impl<T, E> Recorder<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Subscribes to `channel`, receiving its replay history first.
    pub fn attach(channel: &Multicast<T, E>) -> Self {
        let emissions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emissions);
        let subscription = channel.subscribe_with(move |emission| {
            sink.lock().unwrap().push(emission.clone());
        });
        Self {
            emissions,
            _subscription: subscription,
        }
    }

    pub fn emissions(&self) -> Vec<Emission<T, E>> {
        self.emissions.lock().unwrap().clone()
    }

    pub fn values(&self) -> Vec<T> {
        self.emissions
            .lock()
            .unwrap()
            .iter()
            .filter_map(|emission| match emission {
                Emission::Value(value) => Some(value.clone()),
                Emission::Error(_) => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<E> {
        self.emissions
            .lock()
            .unwrap()
            .iter()
            .filter_map(|emission| match emission {
                Emission::Value(_) => None,
                Emission::Error(error) => Some(error.clone()),
            })
            .collect()
    }
}
