//! A publish/subscribe channel with an optional bounded replay history.
//!
//! Every [`emit`](Multicast::emit) is fanned out to all current subscribers in subscription
//! order. With a replay depth of `N > 0`, the last `N` emissions are kept and handed to new
//! subscribers, in their original order, before any live emission.
//!
//! An [`Emission::Error`] does not close the channel: a cache may emit fresh values after a
//! failure once it is booted again.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{Stream, StreamExt};

/// A single item delivered on a [`Multicast`] channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Emission<T, E> {
    Value(T),
    Error(E),
}

impl<T, E> Emission<T, E> {
    pub fn is_error(&self) -> bool {
        matches!(self, Emission::Error(_))
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Emission::Value(value) => Ok(value),
            Emission::Error(error) => Err(error),
        }
    }
}

impl<T, E> From<Result<T, E>> for Emission<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Emission::Value(value),
            Err(error) => Emission::Error(error),
        }
    }
}

type Subscriber<T, E> = Box<dyn FnMut(&Emission<T, E>) + Send>;

struct Channel<T, E> {
    subscribers: BTreeMap<u64, Subscriber<T, E>>,
    next_id: u64,
    history: VecDeque<Emission<T, E>>,
    replay_depth: usize,
}

/// A multicast delivery channel.
///
/// Subscriber callbacks run synchronously inside [`emit`](Self::emit) and must not call back
/// into the same channel.
pub struct Multicast<T, E> {
    channel: Arc<Mutex<Channel<T, E>>>,
}

impl<T, E> Clone for Multicast<T, E> {
    fn clone(&self) -> Self {
        Multicast {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<T, E> Multicast<T, E> {
    fn lock(&self) -> MutexGuard<'_, Channel<T, E>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, E> fmt::Debug for Multicast<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel = self.lock();
        f.debug_struct("Multicast")
            .field("subscribers", &channel.subscribers.len())
            .field("history", &channel.history.len())
            .field("replay_depth", &channel.replay_depth)
            .finish()
    }
}

impl<T, E> Multicast<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a channel replaying up to `replay_depth` past emissions to new subscribers.
    ///
    /// A depth of `0` creates a plain live broadcast.
    pub fn new(replay_depth: usize) -> Self {
        Multicast {
            channel: Arc::new(Mutex::new(Channel {
                subscribers: BTreeMap::new(),
                next_id: 0,
                history: VecDeque::with_capacity(replay_depth),
                replay_depth,
            })),
        }
    }

    pub fn replay_depth(&self) -> usize {
        self.lock().replay_depth
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// The emissions a new subscriber would currently be replayed.
    pub fn history(&self) -> Vec<Emission<T, E>> {
        self.lock().history.iter().cloned().collect()
    }

    /// Subscribes with separate value and error callbacks.
    pub fn subscribe<V, R>(&self, mut on_value: V, mut on_error: R) -> Subscription
    where
        V: FnMut(&T) + Send + 'static,
        R: FnMut(&E) + Send + 'static,
    {
        self.subscribe_with(move |emission| match emission {
            Emission::Value(value) => on_value(value),
            Emission::Error(error) => on_error(error),
        })
    }

    /// Subscribes a single callback for all emissions.
    ///
    /// The replay history is delivered to `callback` before this returns.
    pub fn subscribe_with<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(&Emission<T, E>) + Send + 'static,
    {
        let mut channel = self.lock();
        for emission in &channel.history {
            callback(emission);
        }

        let id = channel.next_id;
        channel.next_id += 1;
        channel.subscribers.insert(id, Box::new(callback));
        drop(channel);

        let channel = Arc::downgrade(&self.channel);
        Subscription::new(move || unsubscribe(&channel, id))
    }

    /// Subscribes and returns the emissions as a [`Stream`].
    pub fn stream(&self) -> EmissionStream<T, E> {
        let (sender, receiver) = mpsc::unbounded();
        let subscription = self.subscribe_with(move |emission| {
            sender.unbounded_send(emission.clone()).ok();
        });
        EmissionStream {
            receiver,
            _subscription: subscription,
        }
    }

    /// Delivers `emission` to every subscriber and records it in the replay history.
    pub fn emit(&self, emission: Emission<T, E>) {
        let mut channel = self.lock();
        for subscriber in channel.subscribers.values_mut() {
            subscriber(&emission);
        }

        if channel.replay_depth > 0 {
            if channel.history.len() == channel.replay_depth {
                channel.history.pop_front();
            }
            channel.history.push_back(emission);
        }
    }
}

fn unsubscribe<T, E>(channel: &Weak<Mutex<Channel<T, E>>>, id: u64) {
    if let Some(channel) = channel.upgrade() {
        channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .remove(&id);
    }
}

/// Keeps a subscription alive. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// A [`Stream`] of emissions, created by [`Multicast::stream`].
#[derive(Debug)]
pub struct EmissionStream<T, E> {
    receiver: mpsc::UnboundedReceiver<Emission<T, E>>,
    _subscription: Subscription,
}

impl<T, E> Unpin for EmissionStream<T, E> {}

impl<T, E> Stream for EmissionStream<T, E> {
    type Item = Emission<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}
