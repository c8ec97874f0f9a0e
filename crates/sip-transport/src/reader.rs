//! Async SIP message reading over any byte stream.

use rtcgate_sip_core::{Error as SipError, SipFramer, SipMessage};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

// Bytes pulled from the source per read.
const READ_CHUNK: usize = 4096;

/// Reads SIP PDUs from a byte stream.
///
/// The source only has to expose incremental reads: a TCP read half and the
/// WebSocket byte adapter both qualify. Short reads and arbitrary PDU
/// fragmentation are absorbed by the framer, which keeps its buffer across
/// calls, so successive `read_message` calls return concatenated PDUs one at
/// a time.
pub struct MessageReader<R> {
    source: R,
    framer: SipFramer,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(source: R) -> Self {
        MessageReader {
            source,
            framer: SipFramer::new(),
        }
    }

    /// Reads the next complete PDU.
    ///
    /// [`Error::Eof`] means the source closed between PDUs;
    /// [`Error::ShortRead`] means it closed with a partial PDU buffered.
    pub async fn read_message(&mut self) -> Result<SipMessage> {
        loop {
            match self.framer.parse() {
                Ok(msg) => return Ok(msg),
                Err(SipError::NeedMoreData) => {
                    let mut chunk = [0u8; READ_CHUNK];
                    let n = self.source.read(&mut chunk).await?;
                    if n == 0 {
                        if self.framer.is_idle() {
                            return Err(Error::Eof);
                        }
                        return Err(Error::ShortRead);
                    }
                    self.framer.feed(&chunk[..n]);
                }
                Err(e) => return Err(Error::Protocol(e)),
            }
        }
    }
}
