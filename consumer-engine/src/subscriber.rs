use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DeliverError;
use crate::message::BoxedMessage;

/// A message backend.
///
/// `subscribe` receives messages and hands each one to `deliverer` until
/// `shutdown` is cancelled or the backend fails. It must not return early while
/// both the token and the backend are healthy: returning ends the engine's input.
/// A subscriber that returns an error stops the engine with it.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, shutdown: CancellationToken, deliverer: Deliverer) -> anyhow::Result<()>;
}

#[async_trait]
impl<S: Subscriber + ?Sized> Subscriber for Arc<S> {
    async fn subscribe(&self, shutdown: CancellationToken, deliverer: Deliverer) -> anyhow::Result<()> {
        (**self).subscribe(shutdown, deliverer).await
    }
}

/// Push side of the engine's queue, handed to the [`Subscriber`].
///
/// Delivery waits while the queue is full. Messages that cannot be delivered are
/// Nacked before the error is returned, so the backend may redeliver them.
#[derive(Clone, Debug)]
pub struct Deliverer {
    sender: mpsc::Sender<BoxedMessage>,
    shutdown: CancellationToken,
}

impl Deliverer {
    pub(crate) fn new(sender: mpsc::Sender<BoxedMessage>, shutdown: CancellationToken) -> Self {
        Self { sender, shutdown }
    }

    pub async fn deliver(&self, message: BoxedMessage) -> Result<(), DeliverError> {
        if self.shutdown.is_cancelled() {
            message.nack();
            return Err(DeliverError::ShuttingDown);
        }

        tokio::select! {
            biased;

            permit = self.sender.reserve() => match permit {
                Ok(permit) => {
                    permit.send(message);
                    Ok(())
                }
                Err(_) => {
                    message.nack();
                    Err(DeliverError::Closed)
                }
            },
            _ = self.shutdown.cancelled() => {
                message.nack();
                Err(DeliverError::ShuttingDown)
            }
        }
    }

    /// Whether the engine asked the subscriber to stop.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::Message;
    use crate::testing::FakeMessage;

    #[tokio::test]
    async fn test_deliver_enqueues_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let deliverer = Deliverer::new(tx, CancellationToken::new());

        for payload in ["a", "b"] {
            deliverer
                .deliver(FakeMessage::new(payload).boxed())
                .await
                .expect("delivery failed");
        }

        assert_eq!(rx.recv().await.map(|m| m.data().to_vec()), Some(b"a".to_vec()));
        assert_eq!(rx.recv().await.map(|m| m.data().to_vec()), Some(b"b".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_gives_up_on_shutdown_while_full() {
        let (tx, _rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let deliverer = Deliverer::new(tx, shutdown.clone());

        deliverer
            .deliver(FakeMessage::new("fills").boxed())
            .await
            .expect("delivery failed");

        let blocked = FakeMessage::new("blocked");
        let pending = tokio::spawn({
            let deliverer = deliverer.clone();
            let blocked = blocked.clone();
            async move { deliverer.deliver(blocked.boxed()).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        shutdown.cancel();
        assert_eq!(
            pending.await.expect("deliver task panicked"),
            Err(DeliverError::ShuttingDown)
        );
        assert!(blocked.nacked());
        assert!(deliverer.is_shutting_down());
    }

    #[tokio::test]
    async fn test_deliver_nacks_when_queue_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let deliverer = Deliverer::new(tx, CancellationToken::new());

        let message = FakeMessage::new("orphan");
        assert_eq!(
            deliverer.deliver(message.clone().boxed()).await,
            Err(DeliverError::Closed)
        );
        assert_eq!(message.nack_count(), 1);
        assert!(!message.acked());
    }
}
