//! SIP transport layer for the rtcgate bridge.
//!
//! Two byte-stream shapes feed the framer: a plain TCP read half toward the
//! SIP server, and a WebSocket message stream from the browser flattened into
//! bytes by the adapter in [`ws`]. [`MessageReader`] drives the incremental
//! framer over either.

pub mod error;
pub mod reader;
pub mod ws;

pub use error::{Error, Result};
pub use reader::MessageReader;
pub use ws::{ws_byte_stream, WsByteReader, WsReaderConfig};
