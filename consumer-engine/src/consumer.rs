use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::ProcessContext;
use crate::message::{BoxedMessage, Message};

/// Consumption logic for one message at a time.
///
/// An `Err` makes the engine Nack the message (unless it was acked immediately);
/// it never stops the engine.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, ctx: &ProcessContext, message: &dyn Message) -> anyhow::Result<()>;
}

/// Consumption logic for a batch of messages, in arrival order.
///
/// The batch is acknowledged as a whole: every message is Acked on `Ok` and
/// Nacked on `Err`.
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    async fn batch_consume(
        &self,
        ctx: &ProcessContext,
        messages: &[BoxedMessage],
    ) -> anyhow::Result<()>;
}

/// Adapter returned by [`consumer_fn`].
pub struct ConsumerFn<F>(F);

/// Use a plain function or closure as a [`Consumer`].
///
/// ```ignore
/// let consumer = consumer_fn(|_ctx, message| {
///     async move {
///         println!("{:?}", message.data());
///         Ok(())
///     }
///     .boxed()
/// });
/// ```
pub fn consumer_fn<F>(f: F) -> ConsumerFn<F>
where
    F: for<'a> Fn(&'a ProcessContext, &'a dyn Message) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    ConsumerFn(f)
}

#[async_trait]
impl<F> Consumer for ConsumerFn<F>
where
    F: for<'a> Fn(&'a ProcessContext, &'a dyn Message) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    async fn consume(&self, ctx: &ProcessContext, message: &dyn Message) -> anyhow::Result<()> {
        (self.0)(ctx, message).await
    }
}

/// Adapter returned by [`batch_consumer_fn`].
pub struct BatchConsumerFn<F>(F);

/// Use a plain function or closure as a [`BatchConsumer`].
pub fn batch_consumer_fn<F>(f: F) -> BatchConsumerFn<F>
where
    F: for<'a> Fn(&'a ProcessContext, &'a [BoxedMessage]) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    BatchConsumerFn(f)
}

#[async_trait]
impl<F> BatchConsumer for BatchConsumerFn<F>
where
    F: for<'a> Fn(&'a ProcessContext, &'a [BoxedMessage]) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    async fn batch_consume(
        &self,
        ctx: &ProcessContext,
        messages: &[BoxedMessage],
    ) -> anyhow::Result<()> {
        (self.0)(ctx, messages).await
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::testing::FakeMessage;

    #[tokio::test]
    async fn test_consumer_fn_sees_the_message() {
        let consumer = consumer_fn(|_, message| {
            async move {
                anyhow::ensure!(message.data() == b"payload", "unexpected payload");
                Ok(())
            }
            .boxed()
        });

        let message = FakeMessage::new("payload");
        consumer
            .consume(&ProcessContext::default(), &message)
            .await
            .expect("consumer rejected the payload");

        let other = FakeMessage::new("something else");
        assert!(consumer
            .consume(&ProcessContext::default(), &other)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_batch_consumer_fn_sees_messages_in_order() {
        let consumer = batch_consumer_fn(|_, messages| {
            async move {
                let payloads: Vec<&[u8]> = messages.iter().map(|m| m.data()).collect();
                let expected = vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()];
                anyhow::ensure!(payloads == expected, "out of order");
                Ok(())
            }
            .boxed()
        });

        let messages: Vec<BoxedMessage> = ["a", "b", "c"]
            .into_iter()
            .map(|p| FakeMessage::new(p).boxed())
            .collect();

        consumer
            .batch_consume(&ProcessContext::default(), &messages)
            .await
            .expect("batch was not delivered in order");
    }
}
