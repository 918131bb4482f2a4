use http::Extensions;
use tokio_util::sync::CancellationToken;

/// Per-batch processing context.
///
/// Created by the queue when a batch is emitted and threaded through every stats
/// hook and the consumer call for that batch. It carries the engine's cancellation
/// signal and a typed map that [`StatsHandler`](crate::StatsHandler)s use to keep
/// values (timers, spans, ids) alive for the lifetime of one batch.
#[derive(Clone, Debug, Default)]
pub struct ProcessContext {
    cancellation: CancellationToken,
    extensions: Extensions,
}

impl ProcessContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            extensions: Extensions::new(),
        }
    }

    /// Token cancelled when the engine starts shutting down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Store a value, replacing any previous value of the same type.
    pub fn with_value<T>(mut self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.extensions.insert(value);
        self
    }

    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.extensions.insert(value)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.extensions.get::<T>()
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.extensions.remove::<T>()
    }
}
