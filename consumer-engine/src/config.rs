use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;

use crate::consumer::{BatchConsumer, Consumer};
use crate::logger::Logger;
use crate::stats::StatsHandler;

pub const DEFAULT_CHUNK_SIZE: usize = 4;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CONCURRENCY: usize = 1;

/// The consumer the engine drives, with its interceptor chain already applied.
#[derive(Clone)]
pub enum ConsumerMode {
    Single(Arc<dyn Consumer>),
    Batch(Arc<dyn BatchConsumer>),
}

impl fmt::Debug for ConsumerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerMode::Single(_) => f.write_str("Single"),
            ConsumerMode::Batch(_) => f.write_str("Batch"),
        }
    }
}

/// Validated engine configuration, produced by [`crate::EngineBuilder::build`].
#[derive(Clone)]
pub struct Config {
    pub chunk_size: usize,
    pub flush_interval: Duration,
    pub ack_immediately: bool,
    pub concurrency: usize,
    pub trap_signals: bool,
    pub consumer: ConsumerMode,
    pub logger: Arc<dyn Logger>,
    pub stats_handler: Arc<dyn StatsHandler>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("chunk_size", &self.chunk_size)
            .field("flush_interval", &self.flush_interval)
            .field("ack_immediately", &self.ack_immediately)
            .field("concurrency", &self.concurrency)
            .field("trap_signals", &self.trap_signals)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

/// Scalar engine settings read from the environment.
#[derive(Envconfig, Clone, Debug)]
pub struct EngineSettings {
    #[envconfig(from = "CONSUMER_CHUNK_SIZE", default = "4")]
    pub chunk_size: usize,

    #[envconfig(from = "CONSUMER_FLUSH_INTERVAL_MS", default = "10000")]
    pub flush_interval: EnvMsDuration,

    #[envconfig(from = "CONSUMER_ACK_IMMEDIATELY", default = "false")]
    pub ack_immediately: FlexBool,

    #[envconfig(from = "CONSUMER_CONCURRENCY", default = "1")]
    pub concurrency: usize,

    #[envconfig(from = "CONSUMER_TRAP_SIGNALS", default = "true")]
    pub trap_signals: FlexBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected a whole number of milliseconds")
    }
}

impl std::error::Error for ParseEnvMsDurationError {}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

/// A boolean that also accepts `1`/`0`, `yes`/`no` and `on`/`off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlexBool(pub bool);

impl FromStr for FlexBool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(FlexBool(true)),
            "false" | "0" | "no" | "off" | "" => Ok(FlexBool(false)),
            _ => Err(format!("Invalid boolean value: {}", s)),
        }
    }
}

impl From<FlexBool> for bool {
    fn from(flex: FlexBool) -> Self {
        flex.0
    }
}
