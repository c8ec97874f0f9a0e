//! Incremental SIP PDU framer.
//!
//! The framer is a push parser: the transport feeds it raw bytes as they
//! arrive and asks for a message; until a full PDU (start line + header block
//! + `Content-Length` bytes of body) is buffered, `parse` returns
//! [`Error::NeedMoreData`]. Parser state survives across calls, so a PDU may
//! arrive in arbitrarily small fragments, and bytes belonging to the next PDU
//! are never consumed early.

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::message::{Header, SipMessage};

/// Where the framer currently is inside a PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    StatusLine,
    Header,
    Body,
}

/// Incremental SIP PDU parser.
#[derive(Debug)]
pub struct SipFramer {
    buf: BytesMut,
    state: FramerState,
    start_line: String,
    headers: Vec<Header>,
    body_len: usize,
}

impl SipFramer {
    pub fn new() -> Self {
        SipFramer {
            buf: BytesMut::new(),
            state: FramerState::StatusLine,
            start_line: String::new(),
            headers: Vec::new(),
            body_len: 0,
        }
    }

    /// Appends raw bytes from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// True when the framer sits at a PDU boundary with nothing buffered
    /// except line terminators. Readers use this to tell a clean close from
    /// a connection dropped mid-PDU.
    pub fn is_idle(&self) -> bool {
        self.state == FramerState::StatusLine
            && self.buf.iter().all(|b| matches!(b, b'\r' | b'\n'))
    }

    /// Advances the state machine over the buffered bytes.
    ///
    /// Returns one complete message, [`Error::NeedMoreData`] while the
    /// current PDU is still partial, or [`Error::MalformedHeader`] for input
    /// that can never frame (fatal for the connection).
    pub fn parse(&mut self) -> Result<SipMessage> {
        loop {
            match self.state {
                FramerState::StatusLine => {
                    let Some(line) = self.take_line() else {
                        return Err(Error::NeedMoreData);
                    };
                    // CRLF keep-alives between PDUs.
                    if line.is_empty() {
                        continue;
                    }
                    self.start_line = line;
                    self.state = FramerState::Header;
                }
                FramerState::Header => {
                    let Some(line) = self.take_line() else {
                        return Err(Error::NeedMoreData);
                    };
                    if line.is_empty() {
                        self.body_len = self.content_length()?;
                        self.state = FramerState::Body;
                    } else if line.starts_with(' ') || line.starts_with('\t') {
                        // Folded continuation of the previous header value.
                        let Some(prev) = self.headers.last_mut() else {
                            return Err(Error::MalformedHeader(line));
                        };
                        prev.value.push(' ');
                        prev.value.push_str(line.trim());
                    } else {
                        let (name, value) = split_header(&line)?;
                        self.headers.push(Header { name, value });
                    }
                }
                FramerState::Body => {
                    if self.buf.len() < self.body_len {
                        return Err(Error::NeedMoreData);
                    }
                    let body = self.buf.split_to(self.body_len).freeze();
                    let start_line = std::mem::take(&mut self.start_line);
                    let headers = std::mem::take(&mut self.headers);
                    self.state = FramerState::StatusLine;
                    self.body_len = 0;
                    return Ok(SipMessage::from_parts(start_line, headers, body));
                }
            }
        }
    }

    /// Takes one `\n`-delimited line off the buffer, stripping `\r\n`.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        if line.ends_with(b"\r") {
            line.truncate(pos - 1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// `Content-Length` of the accumulated header block; absent means zero.
    fn content_length(&self) -> Result<usize> {
        let Some(header) = self.headers.iter().find(|h| h.name == "content-length") else {
            return Ok(0);
        };
        header
            .value
            .trim()
            .parse()
            .map_err(|_| Error::MalformedHeader(format!("content-length: {}", header.value)))
    }
}

/// Splits `Name: value`, lowercasing the name and trimming the value.
fn split_header(line: &str) -> Result<(String, String)> {
    let colon = line
        .find(':')
        .ok_or_else(|| Error::MalformedHeader(line.to_string()))?;
    let name = line[..colon].trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(Error::MalformedHeader(line.to_string()));
    }
    Ok((name, line[colon + 1..].trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.com>\r\n\
        From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
        CSeq: 314159 INVITE\r\n\
        Contact: <sip:alice@pc33.atlanta.com>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 3\r\n\r\nabc";

    #[test]
    fn reads_one_message() {
        let mut framer = SipFramer::new();
        framer.feed(INVITE);
        let msg = framer.parse().unwrap();
        assert_eq!(msg.start_line(), "INVITE sip:bob@biloxi.com SIP/2.0");
        assert_eq!(msg.header("content-type"), Some("application/sdp"));
        assert_eq!(msg.body(), b"abc");
        assert!(framer.is_idle());
    }

    #[test]
    fn reads_concatenated_messages_one_at_a_time() {
        let mut second = INVITE.to_vec();
        let len = second.len();
        second[len - 3..].copy_from_slice(b"123");

        let mut framer = SipFramer::new();
        framer.feed(INVITE);
        framer.feed(&second);

        assert_eq!(framer.parse().unwrap().body(), b"abc");
        assert_eq!(framer.parse().unwrap().body(), b"123");
        assert_eq!(framer.parse(), Err(Error::NeedMoreData));
    }

    #[test]
    fn does_not_consume_past_the_current_body() {
        let mut framer = SipFramer::new();
        framer.feed(INVITE);
        framer.feed(b"NEXT");
        assert_eq!(framer.parse().unwrap().body(), b"abc");
        // The next PDU's bytes are intact and still pending.
        assert!(!framer.is_idle());
        assert_eq!(framer.parse(), Err(Error::NeedMoreData));
    }

    #[test]
    fn fragmentation_is_invisible() {
        // Whole-message parse as the reference.
        let mut whole = SipFramer::new();
        whole.feed(INVITE);
        let expected = whole.parse().unwrap();

        // Feed the same PDU one byte at a time.
        let mut framer = SipFramer::new();
        let mut result = None;
        for b in INVITE {
            framer.feed(std::slice::from_ref(b));
            match framer.parse() {
                Ok(msg) => {
                    result = Some(msg);
                    break;
                }
                Err(Error::NeedMoreData) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(result.unwrap(), expected);

        // And in a few uneven chunks, split mid-header-value.
        let mut framer = SipFramer::new();
        for chunk in [&INVITE[..52], &INVITE[52..199], &INVITE[199..]] {
            framer.feed(chunk);
        }
        assert_eq!(framer.parse().unwrap(), expected);
    }

    #[test]
    fn partial_pdu_needs_more_data() {
        let mut framer = SipFramer::new();
        framer.feed(&INVITE[..INVITE.len() - 1]);
        assert_eq!(framer.parse(), Err(Error::NeedMoreData));
        framer.feed(&INVITE[INVITE.len() - 1..]);
        assert_eq!(framer.parse().unwrap().body(), b"abc");
    }

    #[test]
    fn missing_content_length_means_empty_body() {
        let mut framer = SipFramer::new();
        framer.feed(b"ACK sip:bob@biloxi.com SIP/2.0\r\nCSeq: 314159 ACK\r\n\r\n");
        let msg = framer.parse().unwrap();
        assert_eq!(msg.body(), b"");
        assert!(framer.is_idle());
    }

    #[test]
    fn folded_header_lines_join_the_previous_value() {
        let mut framer = SipFramer::new();
        framer.feed(
            b"INVITE sip:x SIP/2.0\r\n\
              Subject: first\r\n  folded tail\r\n\
              Content-Length: 0\r\n\r\n",
        );
        let msg = framer.parse().unwrap();
        assert_eq!(msg.header("subject"), Some("first folded tail"));
    }

    #[test]
    fn header_line_without_colon_is_malformed() {
        let mut framer = SipFramer::new();
        framer.feed(b"INVITE sip:x SIP/2.0\r\nnot a header line\r\n\r\n");
        assert!(matches!(framer.parse(), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn non_numeric_content_length_is_malformed() {
        let mut framer = SipFramer::new();
        framer.feed(b"INVITE sip:x SIP/2.0\r\nContent-Length: lots\r\n\r\n");
        assert!(matches!(framer.parse(), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn bare_lf_lines_are_accepted() {
        let mut framer = SipFramer::new();
        framer.feed(b"OPTIONS sip:x SIP/2.0\nContent-Length: 2\n\nhi");
        let msg = framer.parse().unwrap();
        assert_eq!(msg.body(), b"hi");
    }

    #[test]
    fn keepalive_crlf_between_pdus_is_skipped() {
        let mut framer = SipFramer::new();
        framer.feed(b"\r\n\r\n");
        assert_eq!(framer.parse(), Err(Error::NeedMoreData));
        assert!(framer.is_idle());
        framer.feed(INVITE);
        assert_eq!(framer.parse().unwrap().body(), b"abc");
    }
}
