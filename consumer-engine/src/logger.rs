use std::fmt;

/// Sink for engine, stage and worker lifecycle lines. Nothing is printed per
/// batch.
pub trait Logger: Send + Sync {
    fn print(&self, args: fmt::Arguments<'_>);
}

/// Forwards lines to `tracing` at info level. The engine's default.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn print(&self, args: fmt::Arguments<'_>) {
        tracing::info!(target: "consumer_engine", "{}", args);
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopLogger;

impl Logger for NopLogger {
    fn print(&self, _args: fmt::Arguments<'_>) {}
}
