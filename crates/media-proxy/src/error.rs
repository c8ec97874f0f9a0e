use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the media proxy
#[derive(Error, Debug)]
pub enum Error {
    /// No even/odd UDP port pair could be bound
    #[error("failed to allocate an RTP/RTCP port pair")]
    PortAllocation,

    /// SDP that does not parse at all
    #[error("SDP parse error: {0}")]
    Sdp(String),

    /// SDP without a media description; fatal for the call
    #[error("SDP carries no media description")]
    NoMediaDescription,

    /// SDP media description without a usable connection address
    #[error("SDP carries no connection information")]
    NoConnectionInformation,

    /// The SDP connection address did not resolve
    #[error("cannot resolve media address {0}")]
    Resolve(String),

    /// RTP framing error; fatal for the relay
    #[error("RTP parse error: {0}")]
    Rtp(String),

    /// RTCP framing error; fatal for the relay
    #[error("RTCP parse error: {0}")]
    Rtcp(String),

    /// Peer-connection failure while re-emitting packets
    #[error("peer connection error: {0}")]
    Peer(String),

    /// Socket I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
