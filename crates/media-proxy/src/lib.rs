//! Media proxy for the rtcgate bridge.
//!
//! The SIP leg speaks plaintext RTP/RTCP over UDP while the browser leg is
//! DTLS/SRTP inside the peer connection; [`RtpProxy`] owns the UDP side,
//! advertises itself to both peers through SDP rewriting, and relays packets
//! between the two.

pub mod error;
pub mod proxy;

pub use error::{Error, Result};
pub use proxy::RtpProxy;
