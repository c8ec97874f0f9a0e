//! WebSocket byte adapter.
//!
//! SIP-over-WS delivers PDUs as WebSocket messages, but the browser's WS
//! layer may split one PDU across several messages or report a spurious
//! end-of-stream on an idle connection. A pump task drains the message stream
//! into an in-process pipe so the framer sees one contiguous byte view; the
//! pipe's read half is the byte source handed to
//! [`MessageReader`](crate::MessageReader).

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncWriteExt, ReadHalf, SimplexStream, WriteHalf};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

// Pipe capacity between the pump task and the framer.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Retry policy for transient end-of-stream reports from the WS library.
#[derive(Debug, Clone, Copy)]
pub struct WsReaderConfig {
    /// End-of-stream reads tolerated before the pipe closes.
    pub eof_retries: u32,
    /// Delay between end-of-stream retries.
    pub retry_delay: Duration,
}

impl Default for WsReaderConfig {
    fn default() -> Self {
        WsReaderConfig {
            eof_retries: 15,
            retry_delay: Duration::from_millis(10),
        }
    }
}

/// Byte-stream read side produced by [`ws_byte_stream`].
pub type WsByteReader = ReadHalf<SimplexStream>;

/// Spawns the pump task for a WebSocket message stream and returns the
/// byte-stream read side.
///
/// The pump ends when the end-of-stream retry budget is spent, on the first
/// non-EOF error, or on a Close frame. Ending closes the pipe, which
/// propagates EOF to the reader.
pub fn ws_byte_stream<S>(source: S, config: WsReaderConfig) -> WsByteReader
where
    S: Stream<Item = tungstenite::Result<Message>> + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::simplex(PIPE_CAPACITY);
    tokio::spawn(pump(source, write_half, config));
    read_half
}

async fn pump<S>(mut source: S, mut pipe: WriteHalf<SimplexStream>, config: WsReaderConfig)
where
    S: Stream<Item = tungstenite::Result<Message>> + Send + Unpin,
{
    let mut retries = config.eof_retries;
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                if pipe.write_all(text.as_bytes()).await.is_err() {
                    return; // reader dropped
                }
            }
            Some(Ok(Message::Binary(data))) => {
                if pipe.write_all(&data).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(_))) => {
                debug!("websocket close frame, closing byte pipe");
                return;
            }
            // Ping/pong and raw frames carry no SIP bytes.
            Some(Ok(_)) => {}
            Some(Err(e)) if is_transient_eof(&e) => {
                if retries == 0 {
                    warn!("websocket EOF retry budget spent, closing byte pipe");
                    return;
                }
                retries -= 1;
                tokio::time::sleep(config.retry_delay).await;
            }
            Some(Err(e)) => {
                warn!("websocket read failed: {e}");
                return;
            }
            None => {
                if retries == 0 {
                    debug!("websocket stream ended, closing byte pipe");
                    return;
                }
                retries -= 1;
                tokio::time::sleep(config.retry_delay).await;
            }
        }
    }
}

/// End-of-stream shapes the WS library reports for an idle or closed socket.
fn is_transient_eof(e: &tungstenite::Error) -> bool {
    matches!(
        e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed
    )
}
