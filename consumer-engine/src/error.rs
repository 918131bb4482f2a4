use std::any::Any;

use thiserror::Error;

/// Enumeration of invalid engine configurations, detected before anything runs.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no consumer configured: set either a consumer or a batch consumer")]
    MissingConsumer,
    #[error("both a consumer and a batch consumer are configured, only one may be set")]
    ConflictingConsumers,
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("flush interval must be greater than zero")]
    InvalidFlushInterval,
    #[error("concurrency must be greater than zero")]
    InvalidConcurrency,
}

/// Enumeration of errors that stop a running engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine was already started")]
    AlreadyStarted,
    #[error("subscribe stage failed: {0:#}")]
    Subscriber(anyhow::Error),
    #[error("signal stage failed to install handlers")]
    Signal(#[from] std::io::Error),
    #[error("{stage} stage panicked: {message}")]
    StagePanicked {
        stage: &'static str,
        message: String,
    },
}

/// Enumeration of reasons a message could not be handed to the engine.
///
/// In both cases the message has already been Nacked.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeliverError {
    #[error("the engine is shutting down")]
    ShuttingDown,
    #[error("the message queue no longer accepts input")]
    Closed,
}

/// Render a caught panic payload as text.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_reads_str_and_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");

        let payload: Box<dyn Any + Send> = Box::new(format!("owned {}", 42));
        assert_eq!(panic_message(&*payload), "owned 42");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }

    #[test]
    fn test_subscriber_error_names_the_stage() {
        let err = EngineError::Subscriber(anyhow::anyhow!("connection reset"));
        assert_eq!(err.to_string(), "subscribe stage failed: connection reset");

        let err = EngineError::StagePanicked {
            stage: "worker",
            message: "boom".to_owned(),
        };
        assert_eq!(err.to_string(), "worker stage panicked: boom");
    }
}
