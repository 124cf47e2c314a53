//! Error types shared across the IPC boundary
//!
//! Synchronous calls report failure through these kinds mapped to wire
//! status codes; nothing unwinds across the boundary.

use thiserror::Error;

/// Window-management error kinds
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WmError {
    /// A token or window handle is already registered
    #[error("handle already registered")]
    DuplicateRegistration,

    /// The referenced token, window, or buffer key is unknown
    #[error("unknown handle")]
    UnknownHandle,

    /// The service-wide window count limit was reached
    #[error("exceed maximum window limit")]
    LimitExceeded,

    /// Shared-memory creation, resize, or mapping failed
    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    /// No buffer slot is available; retry on the next vsync
    #[error("no buffer available")]
    QueueStarvation,

    /// The input channel send queue is full; the message was dropped
    #[error("input channel full")]
    ChannelOverflow,

    /// The peer connection is gone
    #[error("client connection closed")]
    ClientDead,

    /// A buffer-queue operation was attempted in the wrong slot state
    #[error("invalid buffer state: {0}")]
    BadSlotState(&'static str),
}

impl WmError {
    /// Wire status code for this error kind
    pub fn code(&self) -> i32 {
        match self {
            WmError::DuplicateRegistration => 1,
            WmError::UnknownHandle => 2,
            WmError::LimitExceeded => 3,
            WmError::AllocationFailure(_) => 4,
            WmError::QueueStarvation => 5,
            WmError::ChannelOverflow => 6,
            WmError::ClientDead => 7,
            WmError::BadSlotState(_) => 8,
        }
    }

    /// Rebuild an error from its wire form
    pub fn from_wire(code: i32, message: String) -> Self {
        match code {
            1 => WmError::DuplicateRegistration,
            2 => WmError::UnknownHandle,
            3 => WmError::LimitExceeded,
            4 => WmError::AllocationFailure(message),
            5 => WmError::QueueStarvation,
            6 => WmError::ChannelOverflow,
            8 => WmError::BadSlotState("remote"),
            _ => WmError::ClientDead,
        }
    }
}

impl From<nix::Error> for WmError {
    fn from(err: nix::Error) -> Self {
        WmError::AllocationFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for err in [
            WmError::DuplicateRegistration,
            WmError::UnknownHandle,
            WmError::LimitExceeded,
            WmError::QueueStarvation,
            WmError::ChannelOverflow,
        ] {
            let rebuilt = WmError::from_wire(err.code(), err.to_string());
            assert_eq!(rebuilt, err);
        }
    }

    #[test]
    fn limit_message_is_user_visible() {
        assert_eq!(WmError::LimitExceeded.to_string(), "exceed maximum window limit");
    }
}
