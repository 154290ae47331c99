//! Cable-layer error taxonomy, kept distinct from driver errors so a caller
//! can match on "the channel broke" without pulling in printer semantics.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum CableError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed frame: {0}")]
    Protocol(#[from] cable_protocol::FrameDecodeError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("server rejected the subscription")]
    SubscriptionRejected,
    #[error("not connected")]
    NotConnected,
    #[error("a connect is already in progress")]
    AlreadyConnecting,
    #[error("operation canceled")]
    Canceled,
    #[error("cable client shut down")]
    Stopped,
}

impl From<sequential_runner::RunnerError> for CableError {
    fn from(e: sequential_runner::RunnerError) -> Self {
        match e {
            sequential_runner::RunnerError::Canceled => CableError::Canceled,
            sequential_runner::RunnerError::Stopped => CableError::Stopped,
        }
    }
}
