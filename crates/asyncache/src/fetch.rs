//! Driving fetches of a [`Resource`] and observing their outcome.
//!
//! The [`Fetcher`] is the only place where a producer is invoked. A fetch moves the resource
//! into [`Status::Fetching`], runs up to `retry_count + 1` producer attempts with identical
//! arguments, and finally settles the resource in [`Status::Cached`] or [`Status::Error`].
//! Retries happen within a single `Fetching` period, so listeners only see the final outcome.
//!
//! [`Fetcher::observe_once`] resolves a single observation against the current state without
//! ever running two fetches for the same resource at once: observers arriving while a fetch
//! is in flight wait for that fetch instead of starting their own.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use futures::FutureExt;
use futures::channel::oneshot;
use tokio::task::JoinHandle;

use crate::error::{CacheError, ObserveError};
use crate::producer::{DynInterceptor, intercepted};
use crate::resource::{ListenerMode, Resource, ResourceState, SharedResource, Status};

/// The result of a single fetch or observation.
pub type FetchResult<T, E> = Result<T, ObserveError<E>>;

/// The outcome of a fetch started with [`Fetcher::begin_fetch`].
///
/// The fetch runs on its own task and keeps going when this handle is dropped. If the fetch
/// is superseded by a newer one, or the resource is invalidated, the handle resolves to
/// [`CacheError::Superseded`].
pub struct FetchHandle<T, E> {
    inner: FetchHandleInner<T, E>,
}

enum FetchHandleInner<T, E> {
    Ready(Option<FetchResult<T, E>>),
    Task(JoinHandle<FetchResult<T, E>>),
}

impl<T, E> FetchHandle<T, E> {
    fn ready(result: FetchResult<T, E>) -> Self {
        FetchHandle {
            inner: FetchHandleInner::Ready(Some(result)),
        }
    }
}

impl<T, E> Unpin for FetchHandle<T, E> {}

impl<T, E> Future for FetchHandle<T, E> {
    type Output = FetchResult<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            FetchHandleInner::Ready(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => panic!("FetchHandle polled after completion"),
            },
            FetchHandleInner::Task(task) => match ready!(Pin::new(task).poll(cx)) {
                Ok(result) => Poll::Ready(result),
                Err(err) if err.is_cancelled() => {
                    Poll::Ready(Err(CacheError::Superseded.into()))
                }
                Err(err) => panic::resume_unwind(err.into_panic()),
            },
        }
    }
}

impl<T, E> fmt::Debug for FetchHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner {
            FetchHandleInner::Ready(Some(_)) => "ready",
            FetchHandleInner::Ready(None) => "done",
            FetchHandleInner::Task(_) => "running",
        };
        f.debug_tuple("FetchHandle").field(&state).finish()
    }
}

/// How an in-flight fetch ended, as seen by a waiting observer.
enum Settled<T, E> {
    Value(T),
    Failure(E),
    /// The resource moved on to another fetch or was invalidated.
    Restarted,
}

enum Pending<T, E> {
    Settle(oneshot::Receiver<Settled<T, E>>),
    Fetch(FetchHandle<T, E>),
}

/// Starts fetches of a shared [`Resource`] with a bounded retry budget.
pub struct Fetcher<A, T, E> {
    resource: SharedResource<A, T, E>,
    retry_count: u32,
    interceptors: Arc<[DynInterceptor<A, T, E>]>,
}

impl<A, T, E> Clone for Fetcher<A, T, E> {
    fn clone(&self) -> Self {
        Fetcher {
            resource: self.resource.clone(),
            retry_count: self.retry_count,
            interceptors: Arc::clone(&self.interceptors),
        }
    }
}

impl<A, T, E> fmt::Debug for Fetcher<A, T, E>
where
    A: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("resource", &self.resource)
            .field("retry_count", &self.retry_count)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl<A, T, E> Fetcher<A, T, E>
where
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new(resource: impl Into<SharedResource<A, T, E>>) -> Self {
        Fetcher {
            resource: resource.into(),
            retry_count: 0,
            interceptors: Arc::from(Vec::new()),
        }
    }

    /// Sets the number of additional attempts after a failed one.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_interceptors(mut self, interceptors: Vec<DynInterceptor<A, T, E>>) -> Self {
        self.interceptors = Arc::from(interceptors);
        self
    }

    /// A snapshot of the current status.
    pub fn status(&self) -> Status<T, E> {
        self.resource.lock().status().clone()
    }

    pub fn set_arguments(&self, arguments: A) {
        self.resource.lock().set_arguments(arguments);
    }

    /// Marks the resource as outdated and discards the in-flight fetch, if any.
    ///
    /// The next [`observe_once`](Self::observe_once) starts a new fetch.
    pub fn invalidate(&self) {
        let mut resource = self.resource.lock();
        if !resource.is_closed() {
            resource.invalidate();
        }
    }

    /// Starts a new fetch, superseding any fetch that is still in flight.
    ///
    /// If the resource has no producer, the previously cached value is passed through as a
    /// successful result. Without a previous value the resource is marked as
    /// [`Status::NeedUpdate`] and the fetch fails with [`CacheError::MissingProducer`].
    ///
    /// # Panics
    ///
    /// The fetch is spawned on the current tokio runtime, so this panics outside of one.
    pub fn begin_fetch(&self) -> FetchHandle<T, E> {
        let mut resource = self.resource.lock();
        self.begin_fetch_locked(&mut resource)
    }

    fn begin_fetch_locked(&self, resource: &mut Resource<A, T, E>) -> FetchHandle<T, E> {
        if resource.is_closed() {
            return FetchHandle::ready(Err(CacheError::Disposed.into()));
        }

        let previous = resource.status().value().cloned();
        let generation = resource.begin();

        let Some(producer) = resource.producer().cloned() else {
            tracing::debug!("no producer configured, passing the previous value through");
            return match previous {
                Some(value) => {
                    resource.complete(generation, Status::Cached(value.clone()));
                    FetchHandle::ready(Ok(value))
                }
                None => {
                    resource.complete(generation, Status::NeedUpdate);
                    FetchHandle::ready(Err(CacheError::MissingProducer.into()))
                }
            };
        };

        let arguments = resource.arguments().clone();
        let interceptors = Arc::clone(&self.interceptors);
        let retry_count = self.retry_count;
        let shared = self.resource.clone();

        let task = tokio::spawn(async move {
            let start = Instant::now();
            let mut attempt = 0;
            let outcome = loop {
                metric!(counter("cache.producer.attempt") += 1);
                let attempt_arguments = arguments.clone();
                let production = AssertUnwindSafe(async {
                    intercepted(&producer, &interceptors, attempt_arguments).await
                });
                let outcome = match production.catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        tracing::error!(generation, "producer panicked");
                        // release waiting observers before unwinding
                        shared.lock().complete(generation, Status::NeedUpdate);
                        panic::resume_unwind(panic);
                    }
                };
                match outcome {
                    Err(_) if attempt < retry_count => {
                        attempt += 1;
                        metric!(counter("cache.producer.retry") += 1);
                        tracing::debug!(attempt, retry_count, "producer failed, retrying");
                    }
                        outcome => break outcome,
                }
            };
            metric!(timer("cache.producer.duration") = start.elapsed());

            let (status, result) = match outcome {
                Ok(value) => (Status::Cached(value.clone()), Ok(value)),
                Err(error) => {
                    tracing::debug!(attempts = attempt + 1, "producer failed");
                    (Status::Error(error.clone()), Err(ObserveError::Producer(error)))
                }
            };

            if shared.lock().complete(generation, status) {
                result
            } else {
                tracing::trace!(generation, "discarding the result of a superseded fetch");
                Err(CacheError::Superseded.into())
            }
        });

        resource.set_in_flight(task.abort_handle());
        FetchHandle {
            inner: FetchHandleInner::Task(task),
        }
    }

    /// Resolves exactly one outcome for the resource.
    ///
    /// - `Cached`: returns the cached value without fetching.
    /// - `Fetching`: waits for the fetch that is already in flight.
    /// - `NoCache`, `Error`, `NeedUpdate`: starts a new fetch and waits for it.
    ///
    /// If the awaited fetch is superseded before it settles, the observation follows the
    /// resource to its next outcome.
    pub async fn observe_once(&self) -> FetchResult<T, E> {
        loop {
            let pending = {
                let mut resource = self.resource.lock();
                if resource.is_closed() {
                    return Err(CacheError::Disposed.into());
                }

                match resource.state() {
                    ResourceState::Cached => {
                        metric!(counter("resource.observe") += 1, "result" => "hit");
                        match resource.status() {
                            Status::Cached(value) => return Ok(value.clone()),
                            other => unreachable!("{:?} without a cached value", other.state()),
                        }
                    }
                    ResourceState::Fetching => {
                        metric!(counter("resource.observe") += 1, "result" => "coalesced");
                        Pending::Settle(wait_for_settle(&mut resource))
                    }
                    ResourceState::NoCache | ResourceState::Error | ResourceState::NeedUpdate => {
                        metric!(counter("resource.observe") += 1, "result" => "fetch");
                        Pending::Fetch(self.begin_fetch_locked(&mut resource))
                    }
                }
            };

            match pending {
                Pending::Settle(settled) => match settled.await {
                    Ok(Settled::Value(value)) => return Ok(value),
                    Ok(Settled::Failure(error)) => return Err(ObserveError::Producer(error)),
                    Ok(Settled::Restarted) => continue,
                    Err(oneshot::Canceled) => return Err(CacheError::Interrupted.into()),
                },
                Pending::Fetch(fetch) => match fetch.await {
                    Err(ObserveError::Cache(CacheError::Superseded)) => continue,
                    result => return result,
                },
            }
        }
    }
}

impl<A, T, E> Fetcher<A, T, E> {
    pub fn resource(&self) -> &SharedResource<A, T, E> {
        &self.resource
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Tears down the resource: the in-flight fetch is aborted and listeners are dropped.
    pub(crate) fn close(&self) {
        self.resource.lock().close();
    }
}

/// Registers a one-shot listener that reports the next transition of a fetching resource.
fn wait_for_settle<A, T, E>(resource: &mut Resource<A, T, E>) -> oneshot::Receiver<Settled<T, E>>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let mut sender = Some(sender);
    resource.add_listener(ListenerMode::Once, move |_, next| {
        let settled = match next {
            Status::Cached(value) => Settled::Value(value.clone()),
            Status::Error(error) => Settled::Failure(error.clone()),
            _ => Settled::Restarted,
        };
        if let Some(sender) = sender.take() {
            sender.send(settled).ok();
        }
    });
    receiver
}
