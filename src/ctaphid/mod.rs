pub mod channel;
pub mod dispatch;
pub mod packet;
pub mod transaction;
pub mod types;

pub use dispatch::run_ctaphid_loop;

use crate::ctap2::Ctap2Server;
use crate::u2f::U2fServer;

#[derive(Debug, thiserror::Error)]
pub enum CtapHidError {
    #[error("Invalid command: {0:#04x}")]
    InvalidCommand(u8),
    #[error("Invalid length: {0}")]
    InvalidLength(usize),
    #[error("Bad sequence number: expected {expected}, got {got}")]
    InvalidSeq { expected: u8, got: u8 },
    #[error("Transaction interrupted by a new request")]
    Interrupted,
    #[error("Assembly timeout")]
    Timeout,
    #[error("Channel busy")]
    ChannelBusy,
    #[error("Invalid channel: {0:#x}")]
    InvalidChannel(u32),
    #[error("Unexpected continuation packet")]
    UnexpectedCont,
    #[error("Fragment after message completed")]
    AlreadyComplete,
}

impl CtapHidError {
    /// CTAPHID_ERROR code sent to the host.
    pub fn code(&self) -> u8 {
        use types::*;
        match self {
            Self::InvalidCommand(_) | Self::UnexpectedCont => ERR_INVALID_CMD,
            Self::InvalidLength(_) => ERR_INVALID_LEN,
            Self::InvalidSeq { .. } | Self::Interrupted => ERR_INVALID_SEQ,
            Self::Timeout => ERR_MSG_TIMEOUT,
            Self::ChannelBusy => ERR_CHANNEL_BUSY,
            Self::InvalidChannel(_) => ERR_INVALID_CHANNEL,
            Self::AlreadyComplete => ERR_OTHER,
        }
    }
}

/// Executes reassembled CBOR and MSG payloads. Runs on a blocking thread, so
/// implementations may wait on user approval.
pub trait CtapHandler: Send + Sync {
    fn handle_cbor(&self, request: &[u8]) -> Vec<u8>;
    fn handle_msg(&self, request: &[u8]) -> Vec<u8>;
}

/// CTAP2 behind CTAPHID_CBOR, U2F behind CTAPHID_MSG.
pub struct Authenticators {
    pub ctap2: Ctap2Server,
    pub u2f: U2fServer,
}

impl CtapHandler for Authenticators {
    fn handle_cbor(&self, request: &[u8]) -> Vec<u8> {
        self.ctap2.handle(request)
    }

    fn handle_msg(&self, request: &[u8]) -> Vec<u8> {
        self.u2f.handle(request)
    }
}
