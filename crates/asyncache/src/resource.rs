//! The resource descriptor and its state transition engine.
//!
//! A [`Resource`] holds the lifecycle [`Status`] of a single cached value together with the
//! producer that computes it, the arguments the producer is called with, and an ordered list
//! of listeners. The status is only ever replaced through [`Resource::transition`], which
//! notifies every listener with the previous and the new status, in registration order.
//!
//! Listeners run synchronously while the resource is borrowed mutably. Trying to lock the
//! same [`SharedResource`] from inside one of its listeners is a logic error and panics
//! instead of deadlocking.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;

use crate::error::CacheError;
use crate::producer::{DynProducer, Producer};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Resources currently dispatching listeners on this thread, innermost last.
    static NOTIFYING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Marks a resource as dispatching listeners on the current thread until dropped.
struct NotifyGuard;

impl NotifyGuard {
    fn enter(resource: u64) -> Self {
        NOTIFYING.with(|notifying| notifying.borrow_mut().push(resource));
        NotifyGuard
    }
}

impl Drop for NotifyGuard {
    fn drop(&mut self) {
        NOTIFYING.with(|notifying| notifying.borrow_mut().pop());
    }
}

fn assert_not_notifying(resource: u64) {
    let notifying = NOTIFYING.with(|notifying| notifying.borrow().contains(&resource));
    assert!(
        !notifying,
        "resource mutated from within a resource listener"
    );
}

/// The lifecycle state of a [`Resource`], without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Nothing was ever fetched.
    NoCache,
    /// A fetch is in flight.
    Fetching,
    /// The last fetch failed.
    Error,
    /// The last fetch succeeded.
    Cached,
    /// The cached value was invalidated and must be fetched again.
    NeedUpdate,
}

impl ResourceState {
    /// Whether the state machine allows moving from `self` to `to`.
    ///
    /// Any state may start a new fetch or be invalidated. `Cached` and `Error` can only be
    /// reached by completing a fetch.
    pub fn can_transition_to(self, to: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, to),
            (_, Fetching) | (_, NeedUpdate) | (Fetching, Cached) | (Fetching, Error)
        )
    }

    /// Whether this state ends a fetch.
    pub fn is_settled(self) -> bool {
        matches!(self, ResourceState::Cached | ResourceState::Error)
    }
}

/// A [`ResourceState`] together with the payload that belongs to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status<T, E> {
    NoCache,
    Fetching,
    Error(E),
    Cached(T),
    NeedUpdate,
}

impl<T, E> Status<T, E> {
    pub fn state(&self) -> ResourceState {
        match self {
            Status::NoCache => ResourceState::NoCache,
            Status::Fetching => ResourceState::Fetching,
            Status::Error(_) => ResourceState::Error,
            Status::Cached(_) => ResourceState::Cached,
            Status::NeedUpdate => ResourceState::NeedUpdate,
        }
    }

    /// The cached value, if this is [`Status::Cached`].
    pub fn value(&self) -> Option<&T> {
        match self {
            Status::Cached(value) => Some(value),
            _ => None,
        }
    }

    /// The failure detail, if this is [`Status::Error`].
    pub fn error(&self) -> Option<&E> {
        match self {
            Status::Error(error) => Some(error),
            _ => None,
        }
    }
}

impl<T, E> Default for Status<T, E> {
    fn default() -> Self {
        Status::NoCache
    }
}

/// Identifies a listener registered with [`Resource::add_listener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Whether a listener stays registered after it was invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerMode {
    Persistent,
    Once,
}

/// A transition callback, invoked with the previous and the new status.
pub type Listener<T, E> = Box<dyn FnMut(&Status<T, E>, &Status<T, E>) + Send>;

struct ListenerEntry<T, E> {
    id: ListenerId,
    mode: ListenerMode,
    callback: Listener<T, E>,
}

/// Describes a single cached resource.
///
/// `A` are the producer arguments, `T` the produced value and `E` the producer failure.
pub struct Resource<A, T, E> {
    id: u64,
    status: Status<T, E>,
    producer: Option<DynProducer<A, T, E>>,
    arguments: A,
    listeners: Vec<ListenerEntry<T, E>>,
    next_listener_id: u64,
    /// Bumped whenever a fetch starts or the resource is invalidated. Completions carrying
    /// an older generation are discarded.
    generation: u64,
    in_flight: Option<AbortHandle>,
    closed: bool,
}

impl<A, T, E> Resource<A, T, E> {
    /// Creates a resource in [`Status::NoCache`] backed by `producer`.
    pub fn new<P>(producer: P, arguments: A) -> Self
    where
        P: Producer<A, T, E>,
    {
        Self::from_parts(Some(Arc::new(producer)), arguments)
    }

    /// Creates a resource without a producer.
    ///
    /// Fetching such a resource passes the previously cached value through, see
    /// [`Fetcher::begin_fetch`](crate::Fetcher::begin_fetch).
    pub fn without_producer(arguments: A) -> Self {
        Self::from_parts(None, arguments)
    }

    pub fn from_parts(producer: Option<DynProducer<A, T, E>>, arguments: A) -> Self {
        Resource {
            id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
            status: Status::NoCache,
            producer,
            arguments,
            listeners: Vec::new(),
            next_listener_id: 0,
            generation: 0,
            in_flight: None,
            closed: false,
        }
    }

    /// Replaces the initial status, e.g. to seed the resource with a known value.
    pub fn with_status(mut self, status: Status<T, E>) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> &Status<T, E> {
        &self.status
    }

    pub fn state(&self) -> ResourceState {
        self.status.state()
    }

    pub fn producer(&self) -> Option<&DynProducer<A, T, E>> {
        self.producer.as_ref()
    }

    pub fn arguments(&self) -> &A {
        &self.arguments
    }

    /// Rebinds the arguments used by every following fetch.
    pub fn set_arguments(&mut self, arguments: A) {
        self.arguments = arguments;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Moves the resource into a new status and notifies all listeners.
    ///
    /// Moving to [`Status::NeedUpdate`] invalidates the resource: the in-flight fetch is
    /// aborted and its result discarded.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidTransition`] if the state machine does not allow the
    /// change. In that case nothing is modified and no listener is invoked.
    pub fn transition(&mut self, status: Status<T, E>) -> Result<(), CacheError> {
        let from = self.state();
        let to = status.state();
        if !from.can_transition_to(to) {
            return Err(CacheError::InvalidTransition { from, to });
        }
        if to == ResourceState::NeedUpdate {
            self.next_generation();
        }
        self.apply(status);
        Ok(())
    }

    /// The single place where `status` is written.
    fn apply(&mut self, status: Status<T, E>) {
        assert_not_notifying(self.id);

        let previous = std::mem::replace(&mut self.status, status);
        tracing::trace!(from = ?previous.state(), to = ?self.state(), "resource transition");

        {
            let _guard = NotifyGuard::enter(self.id);
            for listener in &mut self.listeners {
                (listener.callback)(&previous, &self.status);
            }
        }
        self.listeners
            .retain(|listener| listener.mode == ListenerMode::Persistent);
    }

    /// Appends a listener that is invoked on every following transition.
    pub fn add_listener<F>(&mut self, mode: ListenerMode, callback: F) -> ListenerId
    where
        F: FnMut(&Status<T, E>, &Status<T, E>) + Send + 'static,
    {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push(ListenerEntry {
            id,
            mode,
            callback: Box::new(callback),
        });
        id
    }

    /// Removes the listener `id`, or all listeners if `None` is given.
    ///
    /// Returns whether anything was removed.
    pub fn remove_listener(&mut self, id: Option<ListenerId>) -> bool {
        let before = self.listeners.len();
        match id {
            Some(id) => self.listeners.retain(|listener| listener.id != id),
            None => self.listeners.clear(),
        }
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Starts a new generation, aborting the fetch task of the previous one.
    pub(crate) fn next_generation(&mut self) -> u64 {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.abort();
        }
        self.generation += 1;
        self.generation
    }

    pub(crate) fn set_in_flight(&mut self, handle: AbortHandle) {
        self.in_flight = Some(handle);
    }

    /// Applies the result of a fetch started in `generation`.
    ///
    /// Returns `false` without touching the resource if a newer generation started since, or
    /// if the resource was moved out of `Fetching` in the meantime.
    pub(crate) fn complete(&mut self, generation: u64, status: Status<T, E>) -> bool {
        if self.generation != generation
            || self.closed
            || !self.state().can_transition_to(status.state())
        {
            return false;
        }
        self.in_flight = None;
        self.apply(status);
        true
    }

    /// Marks the resource as [`Status::NeedUpdate`], discarding any in-flight fetch.
    pub(crate) fn invalidate(&mut self) {
        self.next_generation();
        self.apply(Status::NeedUpdate);
    }

    pub(crate) fn begin(&mut self) -> u64 {
        let generation = self.next_generation();
        self.apply(Status::Fetching);
        generation
    }

    /// Tears the resource down: the in-flight fetch is aborted and all listeners dropped.
    pub(crate) fn close(&mut self) {
        self.next_generation();
        self.listeners.clear();
        self.closed = true;
    }
}

impl<A: fmt::Debug, T, E> fmt::Debug for Resource<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("state", &self.state())
            .field("arguments", &self.arguments)
            .field("has_producer", &self.producer.is_some())
            .field("listeners", &self.listeners.len())
            .field("generation", &self.generation)
            .field("closed", &self.closed)
            .finish()
    }
}

/// A [`Resource`] shared between the fetch tasks and the observers of a cache.
pub struct SharedResource<A, T, E> {
    id: u64,
    inner: Arc<Mutex<Resource<A, T, E>>>,
}

impl<A, T, E> SharedResource<A, T, E> {
    pub fn new(resource: Resource<A, T, E>) -> Self {
        SharedResource {
            id: resource.id,
            inner: Arc::new(Mutex::new(resource)),
        }
    }

    /// Locks the resource.
    ///
    /// # Panics
    ///
    /// Panics when called from within a listener of this same resource.
    pub fn lock(&self) -> MutexGuard<'_, Resource<A, T, E>> {
        assert_not_notifying(self.id);
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A, T, E> Clone for SharedResource<A, T, E> {
    fn clone(&self) -> Self {
        SharedResource {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T, E> From<Resource<A, T, E>> for SharedResource<A, T, E> {
    fn from(resource: Resource<A, T, E>) -> Self {
        Self::new(resource)
    }
}

impl<A, T, E> fmt::Debug for SharedResource<A, T, E>
where
    A: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Ok(resource) => resource.fmt(f),
            Err(_) => f.write_str("SharedResource(<locked>)"),
        }
    }
}
