//! Observability hooks invoked at fixed points of every batch's lifecycle.
//!
//! For each batch the engine calls, in order:
//!
//! 1. [`StatsHandler::tag_process`] with [`Tag::Begin`] then [`Tag::Enqueue`], when
//!    the queue emits the batch. The returned context is attached to the batch.
//! 2. [`StatsHandler::handle_process`] with [`Stats::Dequeue`], once a worker picks
//!    the batch up.
//! 3. [`StatsHandler::tag_process`] with [`Tag::ConsumeBegin`], right before the
//!    consumer runs.
//! 4. [`StatsHandler::handle_process`] with [`Stats::ConsumeEnd`], right after the
//!    consumer returns, carrying its error if any.
//! 5. [`StatsHandler::handle_process`] with [`Stats::End`], after the batch was
//!    acked or nacked.

use std::time::Duration;

use tokio::time::Instant;

use crate::context::ProcessContext;

/// Marker for a lifecycle point that may enrich the batch's context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Processing of a batch begins.
    Begin,
    /// The batch was placed on the queue's output.
    Enqueue,
    /// The consumer is about to be invoked.
    ConsumeBegin,
}

/// Time a batch spent between leaving the queue and being picked up by a worker.
#[derive(Clone, Copy, Debug)]
pub struct Dequeue {
    pub begin_time: Instant,
    pub end_time: Instant,
}

/// Outcome of one consumer invocation.
#[derive(Clone, Copy, Debug)]
pub struct ConsumeEnd<'a> {
    pub begin_time: Instant,
    pub end_time: Instant,
    pub error: Option<&'a anyhow::Error>,
}

/// A batch was fully processed, including ack/nack.
#[derive(Clone, Copy, Debug)]
pub struct End {
    pub message_count: usize,
    pub begin_time: Instant,
    pub end_time: Instant,
}

impl Dequeue {
    pub fn elapsed(&self) -> Duration {
        self.end_time.saturating_duration_since(self.begin_time)
    }
}

impl ConsumeEnd<'_> {
    pub fn elapsed(&self) -> Duration {
        self.end_time.saturating_duration_since(self.begin_time)
    }
}

impl End {
    pub fn elapsed(&self) -> Duration {
        self.end_time.saturating_duration_since(self.begin_time)
    }
}

/// A record produced at a lifecycle point.
#[derive(Clone, Copy, Debug)]
pub enum Stats<'a> {
    Dequeue(Dequeue),
    ConsumeEnd(ConsumeEnd<'a>),
    End(End),
}

/// Hook through which tracing and metrics backends observe the engine.
///
/// Called concurrently from every worker; implementations synchronize their own
/// state.
pub trait StatsHandler: Send + Sync {
    /// Returns the context to use from this point on.
    fn tag_process(&self, ctx: ProcessContext, tag: Tag) -> ProcessContext;

    fn handle_process(&self, ctx: &ProcessContext, stats: &Stats<'_>);
}

/// The default handler: does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopStatsHandler;

impl StatsHandler for NopStatsHandler {
    fn tag_process(&self, ctx: ProcessContext, _tag: Tag) -> ProcessContext {
        ctx
    }

    fn handle_process(&self, _ctx: &ProcessContext, _stats: &Stats<'_>) {}
}
