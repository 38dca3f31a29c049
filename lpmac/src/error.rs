use crate::device::frame::FrameError;
use crate::NodeId;

/// Why a MAC operation did not complete.
///
/// Callers interested only in success can map any of these to `false`.
#[derive(thiserror::Error, Debug)]
pub enum MacError {
    #[error("No acknowledgment from {destination:08X} after {attempts} attempts.")]
    RetriesExhausted { destination: NodeId, attempts: u32 },

    #[error("Busy channel")]
    ChannelBusy,

    #[error("Invalid destination {0:08X}.")]
    InvalidDestination(NodeId),

    #[error("Bad frame error.")]
    FrameError(#[from] FrameError),

    #[error("Internal radio error. Context: {context}")]
    Radio { context: String },

    #[error("MAC engine is not running.")]
    Stopped,

    #[error("Underlying I/O Error.")]
    IoError(#[from] std::io::Error),
}

impl MacError {
    pub(crate) fn radio(err: impl std::fmt::Debug) -> Self {
        MacError::Radio {
            context: format!("{:?}", err),
        }
    }
}
