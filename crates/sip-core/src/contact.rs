//! Contact-rewriting state for one call.
//!
//! The browser must address the bridge, not the SIP server, and vice versa,
//! so each side sees a locally terminated `Contact`. The map holds the two
//! inverse directions and grows monotonically as WS-origin messages arrive;
//! it is never cleared while the call lives.

use std::collections::HashMap;

/// The two inverse mappings between the WS-side and SIP-side `Contact`.
#[derive(Debug, Default)]
pub struct ContactMap {
    /// Original WS `Contact` value to rewritten SIP-side `Contact` value.
    ws_to_sip: HashMap<String, String>,
    /// Canonical SIP address (`sip:user@host;transport=tcp`) back to the
    /// original WS `Contact` value.
    sip_to_ws: HashMap<String, String>,
}

impl ContactMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a WS contact together with its rewritten SIP-side form.
    pub fn learn(&mut self, ws_contact: &str, sip_addr: &str, sip_contact: &str) {
        self.sip_to_ws
            .insert(sip_addr.to_string(), ws_contact.to_string());
        self.ws_to_sip
            .insert(ws_contact.to_string(), sip_contact.to_string());
    }

    /// SIP-side contact previously minted for a WS contact.
    pub fn sip_contact(&self, ws_contact: &str) -> Option<&str> {
        self.ws_to_sip.get(ws_contact).map(String::as_str)
    }

    /// Original WS contact for a SIP address minted by [`learn`](Self::learn).
    pub fn ws_contact(&self, sip_addr: &str) -> Option<&str> {
        self.sip_to_ws.get(sip_addr).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMessage;

    #[test]
    fn contacts_round_trip_between_the_two_sides() {
        let raw = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
            To: Bob <sip:bob@biloxi.com>\r\n\
            Contact: <sip:alice@h7kjh.invalid;transport=ws>;expires=600\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = SipMessage::parse(raw).unwrap();
        let ws_contact = msg.header("contact").unwrap().to_string();

        let mut map = ContactMap::new();
        let (sip_addr, sip_contact) = msg.contact_from_to(&ws_contact, "10.0.0.9:41834").unwrap();
        map.learn(&ws_contact, &sip_addr, &sip_contact);

        assert_eq!(map.sip_contact(&ws_contact), Some(sip_contact.as_str()));

        // A later SIP-side message whose Contact URI is the minted address
        // maps back to the original WS contact verbatim.
        let reply = SipMessage::parse(
            format!("SIP/2.0 200 OK\r\nContact: <{sip_addr}>\r\nContent-Length: 0\r\n\r\n")
                .as_bytes(),
        )
        .unwrap();
        let uri = reply.contact_uri().unwrap();
        assert_eq!(map.ws_contact(uri), Some(ws_contact.as_str()));
    }

    #[test]
    fn unknown_addresses_stay_unmapped() {
        let map = ContactMap::new();
        assert_eq!(map.ws_contact("sip:nobody@10.0.0.1;transport=tcp"), None);
        assert_eq!(map.sip_contact("<sip:nobody@x>"), None);
    }
}
