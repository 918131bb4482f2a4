//! In-memory doubles for exercising consumers, interceptors and the engine
//! without a real message backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DeliverError;
use crate::message::{BoxedMessage, Message};
use crate::subscriber::{Deliverer, Subscriber};

#[derive(Debug)]
struct FakeMessageInner {
    data: Vec<u8>,
    acks: AtomicUsize,
    nacks: AtomicUsize,
}

/// A message that records how often it was acked and nacked.
///
/// Clones share their counters, so a test can keep one clone and hand another
/// to the engine.
#[derive(Clone, Debug)]
pub struct FakeMessage {
    inner: Arc<FakeMessageInner>,
}

impl FakeMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(FakeMessageInner {
                data: data.into(),
                acks: AtomicUsize::new(0),
                nacks: AtomicUsize::new(0),
            }),
        }
    }

    pub fn boxed(self) -> BoxedMessage {
        Box::new(self)
    }

    pub fn acked(&self) -> bool {
        self.ack_count() > 0
    }

    pub fn nacked(&self) -> bool {
        self.nack_count() > 0
    }

    pub fn ack_count(&self) -> usize {
        self.inner.acks.load(Ordering::SeqCst)
    }

    pub fn nack_count(&self) -> usize {
        self.inner.nacks.load(Ordering::SeqCst)
    }
}

impl Message for FakeMessage {
    fn data(&self) -> &[u8] {
        &self.inner.data
    }

    fn ack(&self) {
        self.inner.acks.fetch_add(1, Ordering::SeqCst);
    }

    fn nack(&self) {
        self.inner.nacks.fetch_add(1, Ordering::SeqCst);
    }
}

enum Event {
    Message(BoxedMessage),
    Close(Option<anyhow::Error>),
}

/// A subscriber fed by the test. Messages are delivered in the order they were
/// added; `close` or `close_with_error` ends the subscription after everything
/// added before it was delivered.
pub struct FakeSubscriber {
    events: mpsc::UnboundedSender<Event>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl FakeSubscriber {
    pub fn new() -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            events,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn add_message<M: Message + 'static>(&self, message: M) {
        self.push(Event::Message(Box::new(message)));
    }

    /// End the subscription cleanly.
    pub fn close(&self) {
        self.push(Event::Close(None));
    }

    /// End the subscription with `err`, which the engine then returns.
    pub fn close_with_error(&self, err: impl Into<anyhow::Error>) {
        self.push(Event::Close(Some(err.into())));
    }

    fn push(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::warn!("fake subscriber already finished, event dropped");
        }
    }
}

impl Default for FakeSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscriber for FakeSubscriber {
    async fn subscribe(&self, shutdown: CancellationToken, deliverer: Deliverer) -> anyhow::Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .map_err(|_| anyhow!("fake subscriber lock poisoned"))?
            .take()
            .context("fake subscriber can only be subscribed once")?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = receiver.recv() => match event {
                    Some(Event::Message(message)) => match deliverer.deliver(message).await {
                        Ok(()) => {}
                        Err(DeliverError::ShuttingDown) => return Ok(()),
                        Err(err) => return Err(err.into()),
                    },
                    Some(Event::Close(Some(err))) => return Err(err),
                    Some(Event::Close(None)) | None => return Ok(()),
                },
            }
        }
    }
}
