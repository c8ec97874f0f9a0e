use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing or manipulating SIP messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The framer needs more bytes before the current PDU completes.
    /// Transient: feed more data and parse again.
    #[error("need more data")]
    NeedMoreData,

    /// A header line that cannot be parsed. Fatal for the current PDU;
    /// callers drop the connection.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// A header required by an operation is absent
    #[error("missing header: {0}")]
    MissingHeader(String),

    /// A header is present but its value cannot be used
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}
