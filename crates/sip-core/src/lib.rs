//! SIP protocol support for the rtcgate bridge.
//!
//! This crate is transport-independent: it provides the SIP message envelope,
//! an incremental PDU framer that can be driven from any byte stream, and the
//! contact-rewriting state a bridge keeps per call. Actual sockets live in
//! `rtcgate-sip-transport`.

pub mod contact;
pub mod error;
pub mod framer;
pub mod message;

pub use contact::ContactMap;
pub use error::{Error, Result};
pub use framer::SipFramer;
pub use message::SipMessage;
