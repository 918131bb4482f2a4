use std::sync::Arc;

use crate::consumer::{BatchConsumer, Consumer};

/// Middleware around a [`Consumer`]: takes the next consumer in the chain and
/// returns one that wraps it.
pub type ConsumerInterceptor = Arc<dyn Fn(Arc<dyn Consumer>) -> Arc<dyn Consumer> + Send + Sync>;

/// Middleware around a [`BatchConsumer`].
pub type BatchConsumerInterceptor =
    Arc<dyn Fn(Arc<dyn BatchConsumer>) -> Arc<dyn BatchConsumer> + Send + Sync>;

/// Wrap `consumer` so that `interceptors[0]` runs first and `consumer` runs last.
///
/// An empty list returns `consumer` itself.
pub fn chain_consumer_interceptors(
    consumer: Arc<dyn Consumer>,
    interceptors: &[ConsumerInterceptor],
) -> Arc<dyn Consumer> {
    interceptors
        .iter()
        .rev()
        .fold(consumer, |next, interceptor| interceptor(next))
}

/// Wrap `consumer` so that `interceptors[0]` runs first and `consumer` runs last.
///
/// An empty list returns `consumer` itself.
pub fn chain_batch_consumer_interceptors(
    consumer: Arc<dyn BatchConsumer>,
    interceptors: &[BatchConsumerInterceptor],
) -> Arc<dyn BatchConsumer> {
    interceptors
        .iter()
        .rev()
        .fold(consumer, |next, interceptor| interceptor(next))
}
