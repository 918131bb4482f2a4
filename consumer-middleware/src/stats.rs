use consumer_engine::{ProcessContext, Stats, StatsHandler, Tag};
use tokio::time::Instant;

pub const METRIC_QUEUE_WAIT: &str = "consumer_queue_wait_seconds";
pub const METRIC_CONSUME_DURATION: &str = "consumer_consume_duration_seconds";
pub const METRIC_CONSUME_RESULT: &str = "consumer_consume_total";
pub const METRIC_PROCESS_DURATION: &str = "consumer_process_duration_seconds";
pub const METRIC_MESSAGES: &str = "consumer_messages_total";

/// When the engine began processing a batch, stored in its context.
#[derive(Clone, Copy, Debug)]
struct BatchStarted(Instant);

/// Reports batch lifecycle timings through the `metrics` facade, labelled with
/// the consumer's name.
#[derive(Clone, Debug)]
pub struct MetricsStatsHandler {
    consumer: String,
}

impl MetricsStatsHandler {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
        }
    }
}

impl StatsHandler for MetricsStatsHandler {
    fn tag_process(&self, ctx: ProcessContext, tag: Tag) -> ProcessContext {
        match tag {
            Tag::Begin => ctx.with_value(BatchStarted(Instant::now())),
            Tag::Enqueue | Tag::ConsumeBegin => ctx,
        }
    }

    fn handle_process(&self, ctx: &ProcessContext, stats: &Stats<'_>) {
        match stats {
            Stats::Dequeue(dequeue) => {
                metrics::histogram!(METRIC_QUEUE_WAIT, "consumer" => self.consumer.clone())
                    .record(dequeue.elapsed().as_secs_f64());
            }
            Stats::ConsumeEnd(end) => {
                let result = if end.error.is_some() { "error" } else { "success" };
                metrics::histogram!(
                    METRIC_CONSUME_DURATION,
                    "consumer" => self.consumer.clone(),
                    "result" => result
                )
                .record(end.elapsed().as_secs_f64());
                metrics::counter!(
                    METRIC_CONSUME_RESULT,
                    "consumer" => self.consumer.clone(),
                    "result" => result
                )
                .increment(1);
            }
            Stats::End(end) => {
                let started = ctx
                    .get::<BatchStarted>()
                    .map_or(end.begin_time, |started| started.0);
                metrics::histogram!(METRIC_PROCESS_DURATION, "consumer" => self.consumer.clone())
                    .record(end.end_time.saturating_duration_since(started).as_secs_f64());
                metrics::counter!(METRIC_MESSAGES, "consumer" => self.consumer.clone())
                    .increment(end.message_count as u64);
            }
        }
    }
}
