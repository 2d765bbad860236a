//! An asynchronous resource cache.
//!
//! An [`AsyncCache`] keeps a single logical value produced by an asynchronous [`Producer`].
//! It deduplicates concurrent fetches, retries failed productions immediately up to a bounded
//! budget, and forwards every outcome to a [`Multicast`] channel with an optional replay
//! history. A [`ControlHandle`] restarts the production on demand, discarding the result of
//! the production it replaces.
//!
//! The building blocks are usable on their own: a [`Resource`] is the state machine of one
//! cached value, and a [`Fetcher`] runs deduplicated, retried fetches against it.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod multicast;
pub mod producer;
pub mod resource;

pub use cache::{AsyncCache, AsyncCacheBuilder, ControlHandle, Operation};
pub use config::{CacheConfig, Config};
pub use error::{CacheError, ObserveError};
pub use fetch::{FetchHandle, FetchResult, Fetcher};
pub use multicast::{Emission, EmissionStream, Multicast, Subscription};
pub use producer::{DynInterceptor, DynProducer, Interceptor, Producer};
pub use resource::{ListenerId, ListenerMode, Resource, ResourceState, SharedResource, Status};
