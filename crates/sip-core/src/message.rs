//! SIP message envelope.
//!
//! A message is a free-form start line (request line or status line), an
//! ordered set of headers keyed by lowercase name, and an opaque byte body.
//! `Content-Length` is authoritative for the body and is rewritten to the
//! current body length on serialization.

use std::borrow::Cow;
use std::fmt::Write as _;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::framer::SipFramer;

/// Transport tag presented toward the SIP server.
const TAG_TCP: &[u8] = b"SIP/2.0/TCP";
/// Transport tag presented toward the browser.
const TAG_WS: &[u8] = b"SIP/2.0/WS";

/// One SIP header: lowercase name plus the raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A parsed SIP message (request or response).
///
/// Header lookups are case-insensitive and return the first occurrence;
/// header order is preserved for serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    start_line: String,
    headers: Vec<Header>,
    body: Bytes,
}

impl SipMessage {
    /// Creates an empty message with the given start line.
    pub fn new(start_line: impl Into<String>) -> Self {
        SipMessage {
            start_line: start_line.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub(crate) fn from_parts(start_line: String, headers: Vec<Header>, body: Bytes) -> Self {
        SipMessage { start_line, headers, body }
    }

    /// Parses a single complete PDU from a buffer.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut framer = SipFramer::new();
        framer.feed(raw);
        framer.parse()
    }

    /// The request or status line, without its line terminator.
    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    /// First value of the named header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    /// Replaces the first occurrence of the named header, or appends it.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        match self.headers.iter_mut().find(|h| h.name == name) {
            Some(h) => h.value = value.to_string(),
            None => self.headers.push(Header { name, value: value.to_string() }),
        }
    }

    /// The message body, exactly `Content-Length` bytes of it.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body as text, for SDP handling.
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Substring test against the start line. The start line is
    /// single-purpose, so this is enough to recognize a request method.
    pub fn is_method(&self, method: &str) -> bool {
        self.start_line.contains(method)
    }

    /// Substring test against the start line for a response code.
    pub fn is_status(&self, status: &str) -> bool {
        self.start_line.contains(status)
    }

    /// The `<...>` URI of the `Contact` header, if any.
    pub fn contact_uri(&self) -> Option<&str> {
        extract_addr(self.header("contact")?)
    }

    /// Computes the SIP-facing contact for a WS-side contact.
    ///
    /// The user part comes from this message's `To` URI (the text between the
    /// first `:` and the last `@`); `local_addr` is the bridge's TCP address
    /// toward the SIP server; the attribute suffix after `>` of `ws_contact`
    /// is carried over. Returns `(sip_addr, sip_contact)`.
    pub fn contact_from_to(&self, ws_contact: &str, local_addr: &str) -> Result<(String, String)> {
        let to = self
            .header("to")
            .ok_or_else(|| Error::MissingHeader("to".to_string()))?;
        let colon = to
            .find(':')
            .ok_or_else(|| Error::InvalidHeader(format!("to: {to}")))?;
        let at = to
            .rfind('@')
            .filter(|at| *at > colon)
            .ok_or_else(|| Error::InvalidHeader(format!("to: {to}")))?;
        let user = &to[colon + 1..at];

        let attrs = ws_contact
            .find('>')
            .map(|i| &ws_contact[i + 1..])
            .unwrap_or("");

        let addr = format!("sip:{user}@{local_addr};transport=tcp");
        let contact = format!("<{addr}>{attrs}");
        Ok((addr, contact))
    }

    /// Serializes the message for the wire.
    ///
    /// `Content-Length` is forced to the body length (appended if absent),
    /// every header line is CRLF-terminated, a blank line closes the header
    /// block, the body is emitted verbatim, and finally the transport tag is
    /// swapped so the message reads correctly on the other side's transport.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = String::with_capacity(256);
        let _ = write!(head, "{}\r\n", self.start_line);
        let mut wrote_length = false;
        for h in &self.headers {
            if h.name == "content-length" {
                if !wrote_length {
                    let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
                    wrote_length = true;
                }
                continue;
            }
            let _ = write!(head, "{}: {}\r\n", canonical_name(&h.name), h.value);
        }
        if !wrote_length {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        }
        head.push_str("\r\n");

        let mut raw = Vec::with_capacity(head.len() + self.body.len());
        raw.extend_from_slice(head.as_bytes());
        raw.extend_from_slice(&self.body);
        swap_transport_tag(&mut raw);
        raw
    }
}

/// URI between `<` and `>` (or end of value), as in `Contact: <sip:a@b>;x`.
fn extract_addr(value: &str) -> Option<&str> {
    let start = value.find('<')? + 1;
    let rest = &value[start..];
    let end = rest.find('>').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Canonical MIME capitalization for an emitted header name
/// (`content-length` becomes `Content-Length`).
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
        upper = ch == '-';
    }
    out
}

/// Swaps the first `SIP/2.0/TCP` or `SIP/2.0/WS` token for its opposite.
///
/// One swap only: the start-of-message `Via` carries the tag of the transport
/// the message arrived on, and egress is always the other transport.
fn swap_transport_tag(raw: &mut Vec<u8>) {
    let tcp = find(raw, TAG_TCP);
    let ws = find(raw, TAG_WS);
    match (tcp, ws) {
        (Some(t), Some(w)) if t < w => replace_at(raw, t, TAG_TCP.len(), TAG_WS),
        (Some(t), None) => replace_at(raw, t, TAG_TCP.len(), TAG_WS),
        (_, Some(w)) => replace_at(raw, w, TAG_WS.len(), TAG_TCP),
        (None, None) => {}
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn replace_at(raw: &mut Vec<u8>, at: usize, len: usize, with: &[u8]) {
    raw.splice(at..at + len, with.iter().copied());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipMessage {
        let raw = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
                    Via: SIP/2.0/WS h7kjh.invalid;branch=z9hG4bK776asdhds\r\n\
                    To: Bob <sip:bob@biloxi.com>\r\n\
                    From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
                    Contact: <sip:alice@h7kjh.invalid;transport=ws>;expires=600\r\n\
                    Content-Type: application/sdp\r\n\
                    Content-Length: 3\r\n\r\nabc";
        SipMessage::parse(raw).unwrap()
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let msg = invite();
        assert_eq!(msg.header("content-type"), Some("application/sdp"));
        assert_eq!(msg.header("Content-Type"), Some("application/sdp"));
        assert_eq!(msg.header("x-missing"), None);
    }

    #[test]
    fn method_and_status_tests_use_the_start_line() {
        let msg = invite();
        assert!(msg.is_method("INVITE"));
        assert!(!msg.is_method("REGISTER"));

        let ok = SipMessage::parse(b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert!(ok.is_status("200"));
        assert!(!ok.is_status("486"));
    }

    #[test]
    fn contact_uri_strips_angle_brackets() {
        let msg = invite();
        assert_eq!(
            msg.contact_uri(),
            Some("sip:alice@h7kjh.invalid;transport=ws")
        );
    }

    #[test]
    fn contact_from_to_builds_the_sip_side_contact() {
        let msg = invite();
        let ws_contact = "<sip:alice@h7kjh.invalid;transport=ws>;expires=600";
        let (addr, contact) = msg.contact_from_to(ws_contact, "10.0.0.9:41834").unwrap();
        assert_eq!(addr, "sip:bob@10.0.0.9:41834;transport=tcp");
        assert_eq!(contact, "<sip:bob@10.0.0.9:41834;transport=tcp>;expires=600");
    }

    #[test]
    fn contact_from_to_requires_a_to_header() {
        let msg = SipMessage::parse(b"ACK sip:x SIP/2.0\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(
            msg.contact_from_to("<sip:a@b>", "1.2.3.4:5"),
            Err(Error::MissingHeader("to".to_string()))
        );
    }

    #[test]
    fn serialization_rewrites_content_length() {
        let mut msg = invite();
        msg.set_body(&b"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n"[..]);
        let raw = msg.to_bytes();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("Content-Length: 31\r\n"));
        assert!(text.ends_with("\r\n\r\nv=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n"));
    }

    #[test]
    fn serialization_appends_content_length_when_absent() {
        let mut msg = SipMessage::new("OPTIONS sip:x SIP/2.0");
        msg.set_header("max-forwards", "70");
        let text = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn ws_tag_swaps_to_tcp() {
        let msg = SipMessage::parse(
            b"INVITE sip:x SIP/2.0\r\nVia: SIP/2.0/WS h;branch=z\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        let text = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(text.contains("Via: SIP/2.0/TCP h;branch=z\r\n"));
        assert!(!text.contains("SIP/2.0/WS"));
    }

    #[test]
    fn tcp_tag_swaps_to_ws() {
        let msg = SipMessage::parse(
            b"SIP/2.0 200 OK\r\nVia: SIP/2.0/TCP h;branch=z\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        let text = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(!text.contains("Via: SIP/2.0/TCP"));
        assert!(text.contains("Via: SIP/2.0/WS h;branch=z\r\n"));
    }

    #[test]
    fn only_the_first_tag_is_swapped() {
        let msg = SipMessage::parse(
            b"INVITE sip:x SIP/2.0\r\n\
              Via: SIP/2.0/WS h1;branch=z1\r\n\
              Via: SIP/2.0/TCP h2;branch=z2\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();
        let text = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(text.contains("Via: SIP/2.0/TCP h1;branch=z1\r\n"));
        assert!(text.contains("Via: SIP/2.0/TCP h2;branch=z2\r\n"));
    }

    #[test]
    fn body_bytes_survive_serialization_exactly() {
        let mut msg = SipMessage::new("MESSAGE sip:x SIP/2.0");
        msg.set_body(&b"a\x00b\x00c"[..]);
        let raw = msg.to_bytes();
        assert!(raw.ends_with(b"\r\n\r\na\x00b\x00c"));

        let reparsed = SipMessage::parse(&raw).unwrap();
        assert_eq!(reparsed.body(), b"a\x00b\x00c");
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        // Tag-free message: the transport swap is covered separately.
        let raw = b"REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
                    To: Bob <sip:bob@biloxi.com>\r\n\
                    Call-ID: 843817637684230@998sdasdh09\r\n\
                    CSeq: 1826 REGISTER\r\n\
                    Content-Length: 4\r\n\r\nbody";
        let msg = SipMessage::parse(raw).unwrap();
        let reparsed = SipMessage::parse(&msg.to_bytes()).unwrap();
        assert_eq!(reparsed, msg);
    }
}
