use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{
    Config, ConsumerMode, EngineSettings, DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY,
    DEFAULT_FLUSH_INTERVAL,
};
use crate::consumer::{BatchConsumer, Consumer};
use crate::context::ProcessContext;
use crate::error::{panic_message, ConfigError, EngineError};
use crate::interceptor::{
    chain_batch_consumer_interceptors, chain_consumer_interceptors, BatchConsumerInterceptor,
    ConsumerInterceptor,
};
use crate::logger::{Logger, TracingLogger};
use crate::queue::{create_batching_queue, create_single_queue, QueuedMessage};
use crate::signals::ShutdownSignals;
use crate::stats::{ConsumeEnd, Dequeue, End, NopStatsHandler, Stats, StatsHandler, Tag};
use crate::subscriber::Subscriber;

const SIGNAL_STAGE: &str = "signal";
const SUBSCRIBE_STAGE: &str = "subscribe";
const QUEUE_STAGE: &str = "queue";
const WORKER_STAGE: &str = "worker";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Created = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Created,
            1 => EngineState::Running,
            2 => EngineState::ShuttingDown,
            _ => EngineState::Stopped,
        }
    }
}

/// Options for an [`Engine`], applied in call order: scalar options override
/// earlier values, interceptor options append.
pub struct EngineBuilder {
    subscriber: Arc<dyn Subscriber>,
    chunk_size: usize,
    flush_interval: Duration,
    ack_immediately: bool,
    concurrency: usize,
    trap_signals: bool,
    logger: Arc<dyn Logger>,
    stats_handler: Arc<dyn StatsHandler>,
    consumer: Option<Arc<dyn Consumer>>,
    batch_consumer: Option<Arc<dyn BatchConsumer>>,
    consumer_interceptors: Vec<ConsumerInterceptor>,
    batch_consumer_interceptors: Vec<BatchConsumerInterceptor>,
}

impl EngineBuilder {
    fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            subscriber,
            chunk_size: DEFAULT_CHUNK_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            ack_immediately: false,
            concurrency: DEFAULT_CONCURRENCY,
            trap_signals: true,
            logger: Arc::new(TracingLogger),
            stats_handler: Arc::new(NopStatsHandler),
            consumer: None,
            batch_consumer: None,
            consumer_interceptors: Vec::new(),
            batch_consumer_interceptors: Vec::new(),
        }
    }

    /// Maximum number of messages per batch.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Maximum time a batch accumulates before it is flushed partially filled.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Ack every batch before consuming it. A failed consumption is then never
    /// redelivered.
    pub fn with_ack_immediately(mut self, ack_immediately: bool) -> Self {
        self.ack_immediately = ack_immediately;
        self
    }

    /// Number of workers consuming batches in parallel.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Whether SIGINT and SIGTERM shut the engine down.
    pub fn with_trap_signals(mut self, trap_signals: bool) -> Self {
        self.trap_signals = trap_signals;
        self
    }

    pub fn with_logger<L: Logger + 'static>(mut self, logger: L) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    pub fn with_stats_handler<H: StatsHandler + 'static>(mut self, stats_handler: H) -> Self {
        self.stats_handler = Arc::new(stats_handler);
        self
    }

    pub fn with_consumer<C: Consumer + 'static>(mut self, consumer: C) -> Self {
        self.consumer = Some(Arc::new(consumer));
        self
    }

    pub fn with_batch_consumer<C: BatchConsumer + 'static>(mut self, consumer: C) -> Self {
        self.batch_consumer = Some(Arc::new(consumer));
        self
    }

    /// Append interceptors around the consumer. The first one registered is the
    /// outermost.
    pub fn with_consumer_interceptors(
        mut self,
        interceptors: impl IntoIterator<Item = ConsumerInterceptor>,
    ) -> Self {
        self.consumer_interceptors.extend(interceptors);
        self
    }

    /// Append interceptors around the batch consumer. The first one registered is
    /// the outermost.
    pub fn with_batch_consumer_interceptors(
        mut self,
        interceptors: impl IntoIterator<Item = BatchConsumerInterceptor>,
    ) -> Self {
        self.batch_consumer_interceptors.extend(interceptors);
        self
    }

    /// Apply every scalar setting read from the environment.
    pub fn with_settings(self, settings: &EngineSettings) -> Self {
        self.with_chunk_size(settings.chunk_size)
            .with_flush_interval(settings.flush_interval.0)
            .with_ack_immediately(settings.ack_immediately.into())
            .with_concurrency(settings.concurrency)
            .with_trap_signals(settings.trap_signals.into())
    }

    pub fn build(self) -> Result<Engine, ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::InvalidFlushInterval);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }

        let consumer = match (self.consumer, self.batch_consumer) {
            (None, None) => return Err(ConfigError::MissingConsumer),
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingConsumers),
            (Some(consumer), None) => {
                warn_unused_interceptors(
                    &*self.logger,
                    "batch consumer",
                    self.batch_consumer_interceptors.len(),
                );
                ConsumerMode::Single(chain_consumer_interceptors(
                    consumer,
                    &self.consumer_interceptors,
                ))
            }
            (None, Some(consumer)) => {
                warn_unused_interceptors(
                    &*self.logger,
                    "consumer",
                    self.consumer_interceptors.len(),
                );
                ConsumerMode::Batch(chain_batch_consumer_interceptors(
                    consumer,
                    &self.batch_consumer_interceptors,
                ))
            }
        };

        Ok(Engine {
            subscriber: self.subscriber,
            config: Config {
                chunk_size: self.chunk_size,
                flush_interval: self.flush_interval,
                ack_immediately: self.ack_immediately,
                concurrency: self.concurrency,
                trap_signals: self.trap_signals,
                consumer,
                logger: self.logger,
                stats_handler: self.stats_handler,
            },
            state: AtomicU8::new(EngineState::Created as u8),
        })
    }
}

/// Interceptors for the mode the engine does not run are ignored.
fn warn_unused_interceptors(logger: &dyn Logger, kind: &str, count: usize) {
    if count > 0 {
        logger.print(format_args!(
            "Ignoring {} {} interceptor(s): no {} is configured",
            count, kind, kind
        ));
    }
}

/// Drives messages from a [`Subscriber`] through the queue into the workers.
pub struct Engine {
    subscriber: Arc<dyn Subscriber>,
    config: Config,
    state: AtomicU8,
}

type StageOutput = (&'static str, Result<(), EngineError>);

impl Engine {
    pub fn builder<S: Subscriber + 'static>(subscriber: S) -> EngineBuilder {
        EngineBuilder::new(Arc::new(subscriber))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Run every stage until the subscriber finishes and all pending batches are
    /// consumed, or until `shutdown` is cancelled, a signal is received, or a
    /// stage fails. Returns the first stage error.
    ///
    /// Can only be called once.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        if self
            .state
            .compare_exchange(
                EngineState::Created as u8,
                EngineState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(EngineError::AlreadyStarted);
        }

        let logger = &self.config.logger;
        logger.print(format_args!("Start consumer engine"));

        let result = self.run(shutdown.child_token()).await;

        self.set_state(EngineState::Stopped);
        match &result {
            Ok(()) => logger.print(format_args!("Finish consumer engine")),
            Err(err) => logger.print(format_args!("Finish consumer engine with error: {}", err)),
        }
        result
    }

    async fn run(&self, token: CancellationToken) -> Result<(), EngineError> {
        let config = &self.config;
        let mut stages = JoinSet::new();

        // Stops the signal stage once everything else has finished on its own.
        let signals_done = CancellationToken::new();
        if config.trap_signals {
            spawn_stage(
                &mut stages,
                SIGNAL_STAGE,
                watch_signals(token.clone(), signals_done.clone(), config.logger.clone()),
            );
        }

        let stats = config.stats_handler.clone();
        let batch_token = token.clone();
        let create_context = move || {
            let ctx = ProcessContext::new(batch_token.child_token());
            let ctx = stats.tag_process(ctx, Tag::Begin);
            stats.tag_process(ctx, Tag::Enqueue)
        };
        let (input, batches, queue) = match &config.consumer {
            ConsumerMode::Single(_) => create_single_queue(create_context, config.chunk_size),
            ConsumerMode::Batch(_) => {
                create_batching_queue(create_context, config.chunk_size, config.flush_interval)
            }
        };

        let subscriber = self.subscriber.clone();
        let logger = config.logger.clone();
        let subscriber_token = token.clone();
        spawn_stage(&mut stages, SUBSCRIBE_STAGE, async move {
            logger.print(format_args!("Start subscribe process"));
            let deliverer = input.deliverer(subscriber_token.clone());
            let result = subscriber.subscribe(subscriber_token, deliverer).await;
            // Closing the input lets the queue flush what is pending and stop.
            drop(input);
            logger.print(format_args!("Finish subscribe process"));
            result.map_err(EngineError::Subscriber)
        });

        spawn_stage(&mut stages, QUEUE_STAGE, join_queue(queue));

        let batches = Arc::new(Mutex::new(batches));
        for id in 0..config.concurrency {
            let worker = Worker {
                id,
                consumer: config.consumer.clone(),
                stats_handler: config.stats_handler.clone(),
                logger: config.logger.clone(),
                ack_immediately: config.ack_immediately,
                batches: batches.clone(),
            };
            spawn_stage(&mut stages, WORKER_STAGE, worker.run());
        }
        drop(batches);

        let mut pending = config.concurrency + 2;
        let mut first_error = None;
        let mut shutting_down = false;

        loop {
            tokio::select! {
                biased;

                joined = stages.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    let (stage, result) = joined.unwrap_or_else(|err| {
                        ("unknown", Err(stage_panicked("unknown", err)))
                    });

                    if stage != SIGNAL_STAGE {
                        pending -= 1;
                        if pending == 0 {
                            signals_done.cancel();
                        }
                    }

                    if let Err(err) = result {
                        config
                            .logger
                            .print(format_args!("The {} stage failed: {}", stage, err));
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        token.cancel();
                    }
                }
                _ = token.cancelled(), if !shutting_down => {
                    shutting_down = true;
                    self.set_state(EngineState::ShuttingDown);
                    config.logger.print(format_args!("Shutting down consumer engine"));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Spawn a stage, turning a panic inside it into an error naming the stage.
fn spawn_stage<F>(stages: &mut JoinSet<StageOutput>, stage: &'static str, future: F)
where
    F: Future<Output = Result<(), EngineError>> + Send + 'static,
{
    stages.spawn(async move {
        let result = AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(EngineError::StagePanicked {
                    stage,
                    message: panic_message(&*panic),
                })
            });
        (stage, result)
    });
}

fn stage_panicked(stage: &'static str, err: JoinError) -> EngineError {
    let message = if err.is_panic() {
        panic_message(&*err.into_panic())
    } else {
        err.to_string()
    };
    EngineError::StagePanicked { stage, message }
}

async fn join_queue(queue: JoinHandle<()>) -> Result<(), EngineError> {
    queue
        .await
        .map_err(|err| stage_panicked(QUEUE_STAGE, err))
}

async fn watch_signals(
    token: CancellationToken,
    done: CancellationToken,
    logger: Arc<dyn Logger>,
) -> Result<(), EngineError> {
    let mut signals = ShutdownSignals::install()?;

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            signal = signals.recv() => {
                logger.print(format_args!("Received signal: {}", signal));
                token.cancel();
            }
        }
    }

    logger.print(format_args!("Finish os signal monitoring"));
    Ok(())
}

struct Worker {
    id: usize,
    consumer: ConsumerMode,
    stats_handler: Arc<dyn StatsHandler>,
    logger: Arc<dyn Logger>,
    ack_immediately: bool,
    batches: Arc<Mutex<mpsc::Receiver<QueuedMessage>>>,
}

impl Worker {
    async fn run(self) -> Result<(), EngineError> {
        self.logger
            .print(format_args!("Start consume process (worker {})", self.id));

        loop {
            let next = self.batches.lock().await.recv().await;
            let Some(batch) = next else {
                break;
            };
            self.handle(batch).await;
        }

        self.logger
            .print(format_args!("Finish consume process (worker {})", self.id));
        Ok(())
    }

    async fn handle(&self, mut batch: QueuedMessage) {
        let stats = &self.stats_handler;

        if self.ack_immediately {
            batch.ack();
        }

        stats.handle_process(
            batch.context(),
            &Stats::Dequeue(Dequeue {
                begin_time: batch.enqueued_at(),
                end_time: Instant::now(),
            }),
        );

        batch.retag(|ctx| stats.tag_process(ctx, Tag::ConsumeBegin));

        let begin_time = Instant::now();
        let result = self.consume(&batch).await;
        let end_time = Instant::now();

        if !self.ack_immediately {
            match result {
                Ok(()) => batch.ack(),
                Err(_) => batch.nack(),
            }
        }

        stats.handle_process(
            batch.context(),
            &Stats::ConsumeEnd(ConsumeEnd {
                begin_time,
                end_time,
                error: result.as_ref().err(),
            }),
        );

        stats.handle_process(
            batch.context(),
            &Stats::End(End {
                message_count: batch.count(),
                begin_time: batch.enqueued_at(),
                end_time: Instant::now(),
            }),
        );
    }

    async fn consume(&self, batch: &QueuedMessage) -> anyhow::Result<()> {
        match &self.consumer {
            ConsumerMode::Single(consumer) => {
                for message in batch.messages() {
                    consumer.consume(batch.context(), &**message).await?;
                }
                Ok(())
            }
            ConsumerMode::Batch(consumer) => {
                consumer
                    .batch_consume(batch.context(), batch.messages())
                    .await
            }
        }
    }
}
