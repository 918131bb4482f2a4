//! Interceptors that log the start and end of every consumption.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use consumer_engine::{
    BatchConsumer, BatchConsumerInterceptor, BoxedMessage, Consumer, ConsumerInterceptor, Message,
    ProcessContext,
};
use tokio::time::Instant;
use tracing::{error, info};

struct Logging<C: ?Sized> {
    next: Arc<C>,
}

fn log_start(message_count: usize) {
    info!(message_count, "Start consume message.");
}

fn log_end(message_count: usize, elapsed: Duration, result: &anyhow::Result<()>) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    match result {
        Ok(()) => info!(message_count, elapsed_ms, "End consume message."),
        Err(err) => {
            let error = format!("{:#}", err);
            error!(message_count, elapsed_ms, error = %error, "End consume message.");
        }
    }
}

#[async_trait]
impl Consumer for Logging<dyn Consumer> {
    async fn consume(&self, ctx: &ProcessContext, message: &dyn Message) -> anyhow::Result<()> {
        log_start(1);
        let started = Instant::now();
        let result = self.next.consume(ctx, message).await;
        log_end(1, started.elapsed(), &result);
        result
    }
}

#[async_trait]
impl BatchConsumer for Logging<dyn BatchConsumer> {
    async fn batch_consume(
        &self,
        ctx: &ProcessContext,
        messages: &[BoxedMessage],
    ) -> anyhow::Result<()> {
        log_start(messages.len());
        let started = Instant::now();
        let result = self.next.batch_consume(ctx, messages).await;
        log_end(messages.len(), started.elapsed(), &result);
        result
    }
}

pub fn consumer_interceptor() -> ConsumerInterceptor {
    Arc::new(|next: Arc<dyn Consumer>| {
        let wrapped: Arc<dyn Consumer> = Arc::new(Logging { next });
        wrapped
    })
}

pub fn batch_consumer_interceptor() -> BatchConsumerInterceptor {
    Arc::new(|next: Arc<dyn BatchConsumer>| {
        let wrapped: Arc<dyn BatchConsumer> = Arc::new(Logging { next });
        wrapped
    })
}

#[cfg(test)]
mod tests {
    use consumer_engine::testing::FakeMessage;
    use consumer_engine::{
        batch_consumer_fn, chain_batch_consumer_interceptors, chain_consumer_interceptors,
        consumer_fn,
    };
    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn test_logging_passes_results_through() {
        let consumer: Arc<dyn Consumer> = Arc::new(consumer_fn(|_, message| {
            async move {
                anyhow::ensure!(message.data() != b"bad", "bad payload");
                Ok(())
            }
            .boxed()
        }));
        let chain = chain_consumer_interceptors(consumer, &[consumer_interceptor()]);
        let ctx = ProcessContext::default();

        chain
            .consume(&ctx, &FakeMessage::new("good"))
            .await
            .expect("logging changed a success");
        let err = chain
            .consume(&ctx, &FakeMessage::new("bad"))
            .await
            .expect_err("logging swallowed an error");
        assert_eq!(err.to_string(), "bad payload");
    }

    #[tokio::test]
    async fn test_batch_logging_sees_every_message() {
        let consumer: Arc<dyn BatchConsumer> = Arc::new(batch_consumer_fn(|_, messages| {
            let count = messages.len();
            async move {
                anyhow::ensure!(count == 3, "expected 3 messages, got {}", count);
                Ok(())
            }
            .boxed()
        }));
        let chain = chain_batch_consumer_interceptors(consumer, &[batch_consumer_interceptor()]);

        let messages: Vec<BoxedMessage> = ["a", "b", "c"]
            .into_iter()
            .map(|p| FakeMessage::new(p).boxed())
            .collect();
        chain
            .batch_consume(&ProcessContext::default(), &messages)
            .await
            .expect("batch did not reach the consumer intact");
    }
}
