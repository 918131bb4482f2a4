//! The stage between the subscriber and the workers.
//!
//! [`create_batching_queue`] groups incoming messages into batches bounded by a
//! maximum size and a maximum wait, whichever is reached first.
//! [`create_single_queue`] forwards every message as its own unit. Either way the
//! queue runs as one task that exclusively owns its accumulator, and the input
//! channel's capacity is the only back-pressure in the system.

use std::slice;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::ProcessContext;
use crate::error::DeliverError;
use crate::message::BoxedMessage;
use crate::subscriber::Deliverer;

enum Payload {
    Single(BoxedMessage),
    Multi(Vec<BoxedMessage>),
}

/// A unit of work flowing from the queue to a worker: one message, or an ordered
/// batch of them. The message sequence never changes after creation.
pub struct QueuedMessage {
    ctx: ProcessContext,
    payload: Payload,
    enqueued_at: Instant,
}

impl QueuedMessage {
    fn single(ctx: ProcessContext, message: BoxedMessage) -> Self {
        Self {
            ctx,
            payload: Payload::Single(message),
            enqueued_at: Instant::now(),
        }
    }

    fn multi(ctx: ProcessContext, messages: Vec<BoxedMessage>) -> Self {
        Self {
            ctx,
            payload: Payload::Multi(messages),
            enqueued_at: Instant::now(),
        }
    }

    pub fn count(&self) -> usize {
        self.messages().len()
    }

    /// The wrapped messages, in arrival order.
    pub fn messages(&self) -> &[BoxedMessage] {
        match &self.payload {
            Payload::Single(message) => slice::from_ref(message),
            Payload::Multi(messages) => messages,
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self.payload, Payload::Single(_))
    }

    pub fn context(&self) -> &ProcessContext {
        &self.ctx
    }

    /// Replace the context with the one `f` derives from it.
    pub(crate) fn retag(&mut self, f: impl FnOnce(ProcessContext) -> ProcessContext) {
        let ctx = std::mem::take(&mut self.ctx);
        self.ctx = f(ctx);
    }

    /// When the batch left the queue stage.
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Ack every message, in order.
    pub fn ack(&self) {
        for message in self.messages() {
            message.ack();
        }
    }

    /// Nack every message, in order.
    pub fn nack(&self) {
        for message in self.messages() {
            message.nack();
        }
    }
}

/// Write side of a queue. Dropping it closes the queue's input: messages already
/// buffered are still flushed, further sends through any [`Deliverer`] fail.
pub struct QueueInput {
    sender: mpsc::Sender<BoxedMessage>,
    closed: CancellationToken,
}

impl QueueInput {
    fn new(sender: mpsc::Sender<BoxedMessage>) -> (Self, CancellationToken) {
        let closed = CancellationToken::new();
        (
            Self {
                sender,
                closed: closed.clone(),
            },
            closed,
        )
    }

    /// Push a message, waiting while the input is full. Nacks the message if the
    /// queue has stopped.
    pub async fn send(&self, message: BoxedMessage) -> Result<(), DeliverError> {
        self.sender
            .send(message)
            .await
            .map_err(|SendError(message)| {
                message.nack();
                DeliverError::Closed
            })
    }

    /// A push handle for subscribers that also gives up once `shutdown` is cancelled.
    pub fn deliverer(&self, shutdown: CancellationToken) -> Deliverer {
        Deliverer::new(self.sender.clone(), shutdown)
    }
}

impl Drop for QueueInput {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Start a queue that emits batches of at most `chunk_size` messages, flushing a
/// partial batch once `flush_interval` has passed since the batch started
/// accumulating. Empty batches are never emitted. When the input closes, pending
/// messages are flushed as a final batch and the output closes.
///
/// `create_context` builds the context of every emitted batch.
pub fn create_batching_queue<F>(
    create_context: F,
    chunk_size: usize,
    flush_interval: Duration,
) -> (QueueInput, mpsc::Receiver<QueuedMessage>, JoinHandle<()>)
where
    F: Fn() -> ProcessContext + Send + 'static,
{
    let (in_tx, mut in_rx) = mpsc::channel(chunk_size);
    let (out_tx, out_rx) = mpsc::channel(1);
    let (input, closed) = QueueInput::new(in_tx);

    let handle = tokio::spawn(async move {
        loop {
            let (messages, open) =
                buffering(&mut in_rx, &closed, chunk_size, flush_interval).await;

            if !messages.is_empty() {
                let batch = QueuedMessage::multi(create_context(), messages);
                if let Err(SendError(batch)) = out_tx.send(batch).await {
                    // Nobody is left to consume: hand the messages back to the backend.
                    batch.nack();
                    break;
                }
            }

            if !open {
                break;
            }
        }
    });

    (input, out_rx, handle)
}

/// Start a queue that forwards each message as its own unit, in arrival order.
pub fn create_single_queue<F>(
    create_context: F,
    capacity: usize,
) -> (QueueInput, mpsc::Receiver<QueuedMessage>, JoinHandle<()>)
where
    F: Fn() -> ProcessContext + Send + 'static,
{
    let (in_tx, mut in_rx) = mpsc::channel::<BoxedMessage>(capacity);
    let (out_tx, out_rx) = mpsc::channel(1);
    let (input, closed) = QueueInput::new(in_tx);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                received = in_rx.recv() => {
                    let Some(message) = received else {
                        break;
                    };
                    let queued = QueuedMessage::single(create_context(), message);
                    if let Err(SendError(queued)) = out_tx.send(queued).await {
                        queued.nack();
                        break;
                    }
                }
                _ = closed.cancelled() => in_rx.close(),
            }
        }
    });

    (input, out_rx, handle)
}

/// Accumulate one batch. Returns the batch and whether the input is still open.
async fn buffering(
    input: &mut mpsc::Receiver<BoxedMessage>,
    closed: &CancellationToken,
    chunk_size: usize,
    flush_interval: Duration,
) -> (Vec<BoxedMessage>, bool) {
    let mut messages = Vec::with_capacity(chunk_size);

    // One deadline per batch: it bounds the total wait, not the gap between messages.
    let deadline = tokio::time::sleep(flush_interval);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            received = input.recv() => match received {
                Some(message) => {
                    messages.push(message);
                    if messages.len() >= chunk_size {
                        return (messages, true);
                    }
                }
                None => return (messages, false),
            },
            _ = closed.cancelled() => input.close(),
            _ = &mut deadline => return (messages, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::testing::FakeMessage;

    async fn push(input: &QueueInput, payload: &str) -> FakeMessage {
        let message = FakeMessage::new(payload);
        input
            .send(message.clone().boxed())
            .await
            .expect("queue input closed early");
        message
    }

    async fn drain(output: &mut mpsc::Receiver<QueuedMessage>) -> Vec<Vec<String>> {
        let mut batches = Vec::new();
        while let Some(batch) = output.recv().await {
            batches.push(
                batch
                    .messages()
                    .iter()
                    .map(|m| String::from_utf8_lossy(m.data()).into_owned())
                    .collect(),
            );
        }
        batches
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_close_on_size_or_interval() {
        let (input, mut output, handle) =
            create_batching_queue(ProcessContext::default, 3, Duration::from_millis(4));

        tokio::spawn(async move {
            push(&input, "1").await;
            push(&input, "2").await;
            sleep(Duration::from_millis(6)).await;
            for payload in ["3", "4", "5", "6"] {
                push(&input, payload).await;
            }
            sleep(Duration::from_millis(6)).await;
            push(&input, "7").await;
            push(&input, "8").await;
            drop(input);
        });

        let batches = drain(&mut output).await;
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 3, 1, 2]);

        let flattened: Vec<String> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, ["1", "2", "3", "4", "5", "6", "7", "8"]);

        handle.await.expect("queue task panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_input_fills_whole_chunks() {
        let (input, mut output, handle) =
            create_batching_queue(ProcessContext::default, 4, Duration::from_secs(10));

        tokio::spawn(async move {
            for i in 0..10 {
                push(&input, &i.to_string()).await;
            }
        });

        let sizes: Vec<usize> = drain(&mut output).await.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        handle.await.expect("queue task panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_queue_never_emits_empty_batches() {
        let (input, mut output, handle) =
            create_batching_queue(ProcessContext::default, 3, Duration::from_millis(4));

        sleep(Duration::from_millis(50)).await;
        assert!(output.try_recv().is_err());

        drop(input);
        assert!(output.recv().await.is_none());
        handle.await.expect("queue task panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_bounds_the_whole_batch_not_the_gaps() {
        let (input, mut output, _handle) =
            create_batching_queue(ProcessContext::default, 10, Duration::from_millis(10));

        tokio::spawn(async move {
            // Gaps of 3ms never exceed the interval, but the batch must still close
            // 10ms after it started accumulating.
            for i in 0..6 {
                push(&input, &i.to_string()).await;
                sleep(Duration::from_millis(3)).await;
            }
        });

        let started = Instant::now();
        let first = output.recv().await.expect("no batch emitted");
        assert_eq!(first.count(), 4);
        let waited = started.elapsed();
        assert!(
            waited >= Duration::from_millis(10) && waited < Duration::from_millis(12),
            "{waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_blocks_once_the_pipeline_is_full() {
        let (input, mut output, _handle) =
            create_batching_queue(ProcessContext::default, 3, Duration::from_secs(1));

        let mut accepted = 0;
        for i in 0..20 {
            let message = FakeMessage::new(i.to_string()).boxed();
            match timeout(Duration::from_millis(5), input.send(message)).await {
                Ok(sent) => {
                    sent.expect("queue input closed early");
                    accepted += 1;
                }
                Err(_) => break,
            }
        }
        // One batch in the output slot, one waiting to be sent, one chunk buffered.
        assert_eq!(accepted, 9);

        let blocked = input.send(FakeMessage::new("blocked").boxed());
        tokio::pin!(blocked);
        assert!(timeout(Duration::from_millis(5), &mut blocked).await.is_err());

        let first = output.recv().await.expect("no batch emitted");
        assert_eq!(first.count(), 3);

        timeout(Duration::from_millis(5), &mut blocked)
            .await
            .expect("send still blocked after a batch was taken")
            .expect("queue input closed early");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_queue_forwards_each_message() {
        let (input, mut output, handle) = create_single_queue(ProcessContext::default, 4);

        tokio::spawn(async move {
            for i in 0..8 {
                push(&input, &i.to_string()).await;
            }
        });

        let mut payloads = Vec::new();
        while let Some(queued) = output.recv().await {
            assert!(queued.is_single());
            assert_eq!(queued.count(), 1);
            payloads.push(String::from_utf8_lossy(queued.messages()[0].data()).into_owned());
        }
        assert_eq!(payloads, ["0", "1", "2", "3", "4", "5", "6", "7"]);

        handle.await.expect("queue task panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_batch_gets_a_fresh_context() {
        #[derive(Clone, Debug, PartialEq)]
        struct Serial(usize);

        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let (input, mut output, _handle) = create_batching_queue(
            move || ProcessContext::default().with_value(Serial(counter.fetch_add(1, Ordering::SeqCst))),
            2,
            Duration::from_secs(1),
        );

        for i in 0..4 {
            push(&input, &i.to_string()).await;
        }

        let first = output.recv().await.expect("no batch emitted");
        let second = output.recv().await.expect("no batch emitted");
        assert_eq!(first.context().get::<Serial>(), Some(&Serial(0)));
        assert_eq!(second.context().get::<Serial>(), Some(&Serial(1)));
        assert!(first.enqueued_at() <= second.enqueued_at());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_input_closes_queue_despite_live_deliverers() {
        let (input, mut output, handle) =
            create_batching_queue(ProcessContext::default, 5, Duration::from_secs(1));
        let deliverer = input.deliverer(CancellationToken::new());

        let pending = push(&input, "pending").await;
        drop(input);

        let batch = output.recv().await.expect("pending message was not flushed");
        assert_eq!(batch.count(), 1);
        assert!(output.recv().await.is_none());
        handle.await.expect("queue task panicked");

        let late = FakeMessage::new("late");
        assert_eq!(
            deliverer.deliver(late.clone().boxed()).await,
            Err(DeliverError::Closed)
        );
        assert_eq!(late.nack_count(), 1);
        assert_eq!(pending.nack_count(), 0);
    }

    #[test]
    fn test_ack_and_nack_cover_every_message_in_order() {
        let messages: Vec<FakeMessage> = (0..3).map(|i| FakeMessage::new(i.to_string())).collect();
        let batch = QueuedMessage::multi(
            ProcessContext::default(),
            messages.iter().map(|m| m.clone().boxed()).collect(),
        );

        assert_eq!(batch.count(), 3);
        batch.ack();
        assert!(messages.iter().all(|m| m.acked() && !m.nacked()));

        let single = QueuedMessage::single(ProcessContext::default(), messages[0].clone().boxed());
        single.nack();
        assert_eq!(messages[0].nack_count(), 1);
        assert_eq!(messages[1].nack_count(), 0);
    }
}
