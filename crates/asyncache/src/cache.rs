//! The [`AsyncCache`]: a single logical value shared by many subscribers.
//!
//! A cache owns a [`Resource`] together with a [`Fetcher`] that carries the retry budget, a
//! [`Multicast`] channel, and a control channel accepting [`Operation`]s. It boots once on
//! construction and again on every [`Operation::ForceUpdate`].
//!
//! Each boot supersedes the previous production immediately: a generation counter is
//! bumped under the pipeline lock, and a production only forwards its outcome to the
//! channel while its generation is still current. The multicast channel itself lives as long
//! as the cache, so existing subscribers keep receiving the results of later boots.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::StreamExt;
use futures::channel::mpsc;
use tokio::task::AbortHandle;

use crate::config::CacheConfig;
use crate::error::{CacheError, ObserveError};
use crate::fetch::{FetchResult, Fetcher};
use crate::multicast::{Emission, EmissionStream, Multicast, Subscription};
use crate::producer::{DynInterceptor, Interceptor, Producer};
use crate::resource::{Resource, ResourceState, Status};

/// Commands accepted by the control channel of an [`AsyncCache`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation<A> {
    /// Cancels the active production and boots a new one.
    ///
    /// `Some(arguments)` rebinds the producer arguments first, `None` keeps the current ones.
    ForceUpdate(Option<A>),
}

/// Sends [`Operation`]s to an [`AsyncCache`] from anywhere.
pub struct ControlHandle<A> {
    sender: mpsc::UnboundedSender<Operation<A>>,
}

impl<A> Clone for ControlHandle<A> {
    fn clone(&self) -> Self {
        ControlHandle {
            sender: self.sender.clone(),
        }
    }
}

impl<A> fmt::Debug for ControlHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl<A> ControlHandle<A> {
    /// Queues `operation` for the cache.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::Disposed`] once the cache was disposed.
    pub fn send(&self, operation: Operation<A>) -> Result<(), CacheError> {
        self.sender
            .unbounded_send(operation)
            .map_err(|_| CacheError::Disposed)
    }

    pub fn force_update(&self, arguments: Option<A>) -> Result<(), CacheError> {
        self.send(Operation::ForceUpdate(arguments))
    }
}

#[derive(Debug, Default)]
struct Pipeline {
    generation: u64,
    active: Option<AbortHandle>,
    disposed: bool,
}

struct CacheInner<A, T, E> {
    fetcher: Fetcher<A, T, E>,
    channel: Multicast<T, E>,
    pipeline: Mutex<Pipeline>,
}

impl<A, T, E> CacheInner<A, T, E> {
    fn pipeline(&self) -> MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops all productions for good. Returns `false` if this already happened.
    fn shutdown(&self) -> bool {
        let mut pipeline = self.pipeline();
        if pipeline.disposed {
            return false;
        }
        pipeline.disposed = true;
        pipeline.generation += 1;
        if let Some(active) = pipeline.active.take() {
            active.abort();
        }
        drop(pipeline);

        self.fetcher.close();
        true
    }
}

impl<A, T, E> CacheInner<A, T, E>
where
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn handle_operation(self: &Arc<Self>, operation: Operation<A>) -> Result<(), CacheError> {
        match operation {
            Operation::ForceUpdate(arguments) => {
                tracing::debug!("forcing cache update");
                self.boot(arguments)
            }
        }
    }

    /// Supersedes the active production and starts a new one.
    fn boot(self: &Arc<Self>, arguments: Option<A>) -> Result<(), CacheError> {
        let mut pipeline = self.pipeline();
        if pipeline.disposed {
            return Err(CacheError::Disposed);
        }

        if let Some(active) = pipeline.active.take() {
            active.abort();
        }
        pipeline.generation += 1;
        let generation = pipeline.generation;

        if let Some(arguments) = arguments {
            self.fetcher.set_arguments(arguments);
        }

        metric!(counter("cache.boot") += 1);
        tracing::debug!(generation, "booting cache production");

        let fetch = self.fetcher.begin_fetch();
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let emission = match fetch.await {
                Ok(value) => Emission::Value(value),
                Err(ObserveError::Producer(error)) => Emission::Error(error),
                Err(ObserveError::Cache(error)) => {
                    tracing::debug!(generation, %error, "production ended without a result");
                    return;
                }
            };
            inner.publish(generation, emission);
        });
        pipeline.active = Some(task.abort_handle());

        Ok(())
    }

    /// Forwards the outcome of the production started in `generation`, unless it was
    /// superseded in the meantime.
    fn publish(&self, generation: u64, emission: Emission<T, E>) {
        let mut pipeline = self.pipeline();
        if pipeline.disposed || pipeline.generation != generation {
            tracing::trace!(generation, "discarding the outcome of a canceled production");
            return;
        }
        pipeline.active = None;

        let kind = if emission.is_error() { "error" } else { "value" };
        metric!(counter("cache.emission") += 1, "kind" => kind);
        self.channel.emit(emission);
    }
}

/// Builds an [`AsyncCache`].
pub struct AsyncCacheBuilder<A, T, E> {
    resource: Resource<A, T, E>,
    config: CacheConfig,
    interceptors: Vec<DynInterceptor<A, T, E>>,
}

impl<A, T, E> AsyncCacheBuilder<A, T, E>
where
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Applies all options of `config`.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.config.retry_count = retry_count;
        self
    }

    pub fn replay_count(mut self, replay_count: usize) -> Self {
        self.config.replay_count = replay_count;
        self
    }

    /// Appends an interceptor. Interceptors run in the order they were added.
    pub fn interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: Interceptor<A, T, E>,
    {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Seeds the resource with a known status before the first boot.
    pub fn initial_status(mut self, status: Status<T, E>) -> Self {
        self.resource = self.resource.with_status(status);
        self
    }

    /// Creates the cache and boots its first production.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> AsyncCache<A, T, E> {
        let AsyncCacheBuilder {
            resource,
            config,
            interceptors,
        } = self;

        let fetcher = Fetcher::new(resource)
            .with_retry_count(config.retry_count)
            .with_interceptors(interceptors);

        let inner = Arc::new(CacheInner {
            fetcher,
            channel: Multicast::new(config.replay_count),
            pipeline: Mutex::new(Pipeline::default()),
        });

        let (sender, receiver) = mpsc::unbounded();
        tokio::spawn(run_control(Arc::downgrade(&inner), receiver));

        let cache = AsyncCache {
            inner,
            control: ControlHandle { sender },
            config,
        };
        if let Err(error) = cache.inner.boot(None) {
            tracing::error!(%error, "initial boot of a fresh cache failed");
        }
        cache
    }
}

/// Processes control commands until the channel is closed or the cache is gone.
async fn run_control<A, T, E>(
    inner: Weak<CacheInner<A, T, E>>,
    mut receiver: mpsc::UnboundedReceiver<Operation<A>>,
) where
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    while let Some(operation) = receiver.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(error) = inner.handle_operation(operation) {
            tracing::debug!(%error, "dropping control operation");
        }
    }
    tracing::trace!("control channel closed");
}

/// An asynchronous resource cache.
///
/// The cache performs at most one production at a time, retries failed productions up to
/// its retry budget, and forwards every outcome to a multicast channel that new subscribers
/// can join at any time. Dropping the cache disposes it.
///
/// Subscriber callbacks run while the cache publishes and must not call
/// [`handle_operation`](Self::handle_operation) or [`dispose`](Self::dispose) directly. Use a
/// [`ControlHandle`] to trigger updates from within a callback.
pub struct AsyncCache<A, T, E> {
    inner: Arc<CacheInner<A, T, E>>,
    control: ControlHandle<A>,
    config: CacheConfig,
}

impl<A, T, E> AsyncCache<A, T, E>
where
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Starts building a cache around `producer`, called with `arguments`.
    pub fn builder<P>(producer: P, arguments: A) -> AsyncCacheBuilder<A, T, E>
    where
        P: Producer<A, T, E>,
    {
        AsyncCacheBuilder {
            resource: Resource::new(producer, arguments),
            config: CacheConfig::default(),
            interceptors: Vec::new(),
        }
    }

    /// Creates and boots a cache with the given configuration.
    pub fn new<P>(producer: P, arguments: A, config: CacheConfig) -> Self
    where
        P: Producer<A, T, E>,
    {
        Self::builder(producer, arguments).config(config).build()
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// The multicast channel every production is forwarded to.
    pub fn channel(&self) -> &Multicast<T, E> {
        &self.inner.channel
    }

    pub fn subscribe<V, R>(&self, on_value: V, on_error: R) -> Subscription
    where
        V: FnMut(&T) + Send + 'static,
        R: FnMut(&E) + Send + 'static,
    {
        self.inner.channel.subscribe(on_value, on_error)
    }

    pub fn stream(&self) -> EmissionStream<T, E> {
        self.inner.channel.stream()
    }

    /// A handle to the control channel.
    pub fn control(&self) -> ControlHandle<A> {
        self.control.clone()
    }

    /// A snapshot of the underlying resource status.
    pub fn status(&self) -> Status<T, E> {
        self.inner.fetcher.status()
    }

    pub fn state(&self) -> ResourceState {
        self.inner.fetcher.resource().lock().state()
    }

    /// Resolves one value from the underlying resource, sharing any in-flight production.
    ///
    /// Fetches started here use the cache's retry budget, but their outcome is only returned
    /// to the caller and not forwarded to the multicast channel.
    pub async fn observe_once(&self) -> FetchResult<T, E> {
        self.inner.fetcher.observe_once().await
    }

    /// Cancels the active production and marks the resource as outdated.
    pub fn invalidate(&self) {
        let mut pipeline = self.inner.pipeline();
        if pipeline.disposed {
            return;
        }
        if let Some(active) = pipeline.active.take() {
            active.abort();
        }
        pipeline.generation += 1;
        self.inner.fetcher.invalidate();
    }

    /// Executes `operation` right away instead of queueing it on the control channel.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::Disposed`] once the cache was disposed.
    pub fn handle_operation(&self, operation: Operation<A>) -> Result<(), CacheError> {
        self.inner.handle_operation(operation)
    }

    /// Shorthand for [`Operation::ForceUpdate`].
    pub fn force_update(&self, arguments: Option<A>) -> Result<(), CacheError> {
        self.handle_operation(Operation::ForceUpdate(arguments))
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.pipeline().disposed
    }

    /// Cancels the active production and stops accepting control operations.
    ///
    /// Nothing is emitted after this returns. Disposing again does nothing.
    pub fn dispose(&self) {
        self.control.sender.close_channel();
        if self.inner.shutdown() {
            tracing::debug!("cache disposed");
        }
    }
}

impl<A, T, E> Drop for AsyncCache<A, T, E> {
    fn drop(&mut self) {
        self.control.sender.close_channel();
        self.inner.shutdown();
    }
}

impl<A, T, E> fmt::Debug for AsyncCache<A, T, E>
where
    A: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pipeline = self.inner.pipeline.try_lock();
        let mut debug = f.debug_struct("AsyncCache");
        debug
            .field("config", &self.config)
            .field("resource", self.inner.fetcher.resource())
            .field("channel", &self.inner.channel);
        if let Ok(pipeline) = pipeline {
            debug
                .field("generation", &pipeline.generation)
                .field("disposed", &pipeline.disposed);
        }
        debug.finish()
    }
}
