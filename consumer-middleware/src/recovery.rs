//! Interceptors that turn a panic inside the wrapped consumer into an ordinary
//! consumption result, so the batch is Nacked instead of taking the worker down.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use consumer_engine::{
    BatchConsumer, BatchConsumerInterceptor, BoxedMessage, Consumer, ConsumerInterceptor, Message,
    ProcessContext,
};
use futures::FutureExt;

pub use consumer_engine::panic_message;

/// Called with the batch context and the panic payload. Its result becomes the
/// consumption result.
pub type RecoveryHandler =
    Arc<dyn Fn(&ProcessContext, Box<dyn Any + Send>) -> anyhow::Result<()> + Send + Sync>;

/// A handler that reports the panic as an error.
pub fn panic_as_error(_ctx: &ProcessContext, payload: Box<dyn Any + Send>) -> anyhow::Result<()> {
    Err(anyhow!("consumer panicked: {}", panic_message(&*payload)))
}

struct Recovering<C: ?Sized> {
    next: Arc<C>,
    handler: RecoveryHandler,
}

#[async_trait]
impl Consumer for Recovering<dyn Consumer> {
    async fn consume(&self, ctx: &ProcessContext, message: &dyn Message) -> anyhow::Result<()> {
        match AssertUnwindSafe(self.next.consume(ctx, message))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => (self.handler)(ctx, payload),
        }
    }
}

#[async_trait]
impl BatchConsumer for Recovering<dyn BatchConsumer> {
    async fn batch_consume(
        &self,
        ctx: &ProcessContext,
        messages: &[BoxedMessage],
    ) -> anyhow::Result<()> {
        match AssertUnwindSafe(self.next.batch_consume(ctx, messages))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => (self.handler)(ctx, payload),
        }
    }
}

pub fn consumer_interceptor<F>(handler: F) -> ConsumerInterceptor
where
    F: Fn(&ProcessContext, Box<dyn Any + Send>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let handler: RecoveryHandler = Arc::new(handler);
    Arc::new(move |next: Arc<dyn Consumer>| {
        let wrapped: Arc<dyn Consumer> = Arc::new(Recovering {
            next,
            handler: handler.clone(),
        });
        wrapped
    })
}

pub fn batch_consumer_interceptor<F>(handler: F) -> BatchConsumerInterceptor
where
    F: Fn(&ProcessContext, Box<dyn Any + Send>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let handler: RecoveryHandler = Arc::new(handler);
    Arc::new(move |next: Arc<dyn BatchConsumer>| {
        let wrapped: Arc<dyn BatchConsumer> = Arc::new(Recovering {
            next,
            handler: handler.clone(),
        });
        wrapped
    })
}
