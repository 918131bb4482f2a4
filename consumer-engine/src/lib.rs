//! Turn a push-style stream of acknowledgeable messages into calls against
//! user-supplied consumption logic.
//!
//! A [`Subscriber`] adapts some queueing backend and delivers [`Message`]s. The
//! [`Engine`] feeds them through a micro-batching queue into a pool of workers,
//! each running an interceptor-wrapped [`Consumer`] or [`BatchConsumer`] and then
//! acknowledging the messages according to the configured policy. A
//! [`StatsHandler`] observes every batch at fixed lifecycle points.

pub mod config;
pub mod consumer;
pub mod context;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod logger;
pub mod message;
pub mod queue;
mod signals;
pub mod stats;
pub mod subscriber;
pub mod testing;

pub use config::{
    Config, ConsumerMode, EngineSettings, DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY,
    DEFAULT_FLUSH_INTERVAL,
};
pub use consumer::{batch_consumer_fn, consumer_fn, BatchConsumer, Consumer};
pub use context::ProcessContext;
pub use engine::{Engine, EngineBuilder, EngineState};
pub use error::{panic_message, ConfigError, DeliverError, EngineError};
pub use interceptor::{
    chain_batch_consumer_interceptors, chain_consumer_interceptors, BatchConsumerInterceptor,
    ConsumerInterceptor,
};
pub use logger::{Logger, NopLogger, TracingLogger};
pub use message::{BoxedMessage, Message};
pub use stats::{ConsumeEnd, Dequeue, End, NopStatsHandler, Stats, StatsHandler, Tag};
pub use subscriber::{Deliverer, Subscriber};
