//! Cross-cutting pieces to compose into a `consumer_engine::Engine`: panic
//! recovery and logging interceptors, and a `metrics`-backed stats handler.
//!
//! Register recovery before logging so that it wraps the logging layer too.

pub mod logging;
pub mod recovery;
pub mod stats;

pub use stats::MetricsStatsHandler;
