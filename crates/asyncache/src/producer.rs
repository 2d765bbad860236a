use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

/// Computes the value of a cached resource.
///
/// A producer is called with a fresh clone of the bound arguments on every attempt, so it has
/// to be safe to call repeatedly with the same arguments. It is responsible for its own
/// timeouts; the cache only reacts to the eventual outcome.
///
/// Any `Fn(A) -> impl Future<Output = Result<T, E>>` closure is a producer.
pub trait Producer<A, T, E>: Send + Sync + 'static {
    fn produce(&self, arguments: A) -> BoxFuture<'static, Result<T, E>>;
}

impl<A, T, E, F, Fut> Producer<A, T, E> for F
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    fn produce(&self, arguments: A) -> BoxFuture<'static, Result<T, E>> {
        self(arguments).boxed()
    }
}

pub type DynProducer<A, T, E> = Arc<dyn Producer<A, T, E>>;

/// Hooks that run around every producer attempt.
///
/// Interceptors are applied in registration order: all `before` hooks see the arguments
/// before the producer does, and all `after` hooks see the outcome before it is recorded on
/// the resource. Both hooks do nothing by default.
pub trait Interceptor<A, T, E>: Send + Sync + 'static {
    fn before(&self, _arguments: &mut A) {}

    fn after(&self, _outcome: &mut Result<T, E>) {}
}

pub type DynInterceptor<A, T, E> = Arc<dyn Interceptor<A, T, E>>;

/// Runs one producer attempt through the interceptor chain.
pub(crate) fn intercepted<A, T, E>(
    producer: &DynProducer<A, T, E>,
    interceptors: &[DynInterceptor<A, T, E>],
    mut arguments: A,
) -> BoxFuture<'static, Result<T, E>>
where
    A: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    for interceptor in interceptors {
        interceptor.before(&mut arguments);
    }
    let production = producer.produce(arguments);
    let interceptors = interceptors.to_vec();

    async move {
        let mut outcome = production.await;
        for interceptor in &interceptors {
            interceptor.after(&mut outcome);
        }
        outcome
    }
    .boxed()
}
