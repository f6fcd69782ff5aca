use thiserror::Error;

/// Failure writing a batch line to the output sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sink closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to spawn dispatcher loop: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Dispatcher has been shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum ServoError {
    #[error("Servo on channel {channel} could not register: {source}")]
    Register {
        channel: u32,
        #[source]
        source: DispatchError,
    },
}
