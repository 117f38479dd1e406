use thiserror::Error;

use crate::client::ClientId;
use crate::timer::TimerError;
use crate::tnc::TncError;

#[derive(Debug, Error)]
pub enum Ax25Error {
    #[error("listener with identity {0} already exists")]
    ListenerExists(String),

    #[error("priority must be between 0 and 10 inclusive: {0}")]
    InvalidPriority(u8),

    #[error("KISS port must be between 0 and 15 inclusive: {0}")]
    InvalidPort(u8),

    #[error("no client registered with identity {0}")]
    UnknownClient(ClientId),

    #[error("connection is not established")]
    NotConnected,

    #[error(transparent)]
    Frame(#[from] ax25core::frame::FrameError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Tnc(#[from] TncError),
}
