use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced while reading SIP messages from a transport
#[derive(Error, Debug)]
pub enum Error {
    /// The byte source closed at a PDU boundary
    #[error("connection closed")]
    Eof,

    /// The byte source closed in the middle of a PDU
    #[error("connection closed mid-message")]
    ShortRead,

    /// The bytes on the wire do not frame as SIP
    #[error("protocol error: {0}")]
    Protocol(#[from] rtcgate_sip_core::Error),

    /// Transport I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
