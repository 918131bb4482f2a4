/// A message received from a queueing backend.
///
/// Implementations are provided by backend adapters. The engine reads the payload
/// and calls at most one of [`ack`](Message::ack) or [`nack`](Message::nack) per
/// consumption. Calling neither leaves redelivery to the backend (e.g. when a
/// visibility timeout expires).
pub trait Message: Send + Sync {
    /// The raw payload.
    fn data(&self) -> &[u8];

    /// Tell the backend the message was handled and must not be redelivered.
    fn ack(&self);

    /// Tell the backend the message was not handled and should be redelivered.
    fn nack(&self);
}

/// A message owned by the engine while it flows through the pipeline.
pub type BoxedMessage = Box<dyn Message>;
