// TGD - ERROR TAXONOMY
// One error enum for the whole crate. Malformed input drops the buffer,
// exhaustion is surfaced to the caller, backend timeouts latch the dead flag,
// protocol mismatches are fatal only at init.

use thiserror::Error;

use crate::protocol::wire::MacAddr;

#[derive(Debug, Error)]
pub enum TgdError {
    // Malformed input
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("malformed A-MSDU: {0}")]
    MalformedAmsdu(&'static str),
    #[error("malformed control message: {0}")]
    MalformedMessage(&'static str),
    #[error("unknown control message type {0}")]
    UnknownMessage(u8),

    // Resource exhaustion
    #[error("no free link for peer {0}")]
    NoFreeLink(MacAddr),
    #[error("link id {0} already bound to another link")]
    LinkIdInUse(i32),
    #[error("no link bound to peer {0}")]
    UnknownPeer(MacAddr),
    #[error("event of {0} bytes exceeds the event size limit")]
    EventTooLarge(usize),
    #[error("empty event")]
    EmptyEvent,
    #[error("event intake disabled")]
    IntakeDisabled,
    #[error("queue full")]
    QueueFull,
    #[error("payload of {len} bytes exceeds {max}")]
    PayloadTooLarge { len: usize, max: usize },

    // Backend / platform
    #[error("baseband API version mismatch: expected {expected:#x}, found {found:#x}")]
    ApiVersionMismatch { expected: u32, found: u32 },
    #[error("baseband call failed with code {0}")]
    Baseband(i32),
    #[error("firmware returned error code {0}")]
    Firmware(u8),
    #[error("hardware path disabled after a config call timeout")]
    HardwareDead,
    #[error("hardware config call failed with code {0:#x}")]
    ConfigCall(i32),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    // Security
    #[error("security gate not connected to {0}")]
    NotConnected(MacAddr),
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    // Misc
    #[error("handler already registered")]
    AlreadyRegistered,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TgdError>;
