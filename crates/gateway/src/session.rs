//! Per-call session orchestration.
//!
//! One call owns one WebSocket, one TCP connection to the SIP server, one
//! peer connection, one RTP proxy, one contact map, and one cancellation
//! token. The two signaling pumps run concurrently with the media relays;
//! a fatal error anywhere cancels the token and tears the whole call down.
//! Exactly one task writes each outbound connection: the SIP-to-WS pump owns
//! the WebSocket sink, the WS-to-SIP pump owns the TCP write half.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use rtcgate_media_proxy::RtpProxy;
use rtcgate_sip_core::{ContactMap, SipMessage};
use rtcgate_sip_transport::{
    ws_byte_stream, Error as TransportError, MessageReader, WsByteReader, WsReaderConfig,
};

use crate::peer;

/// Path the browser's SIP stack connects to.
pub const WS_PATH: &str = "/ws";

/// Gateway-wide settings shared by every call.
#[derive(Debug)]
pub struct GatewayConfig {
    /// Address the media proxy binds and advertises in SDP.
    pub media_host: IpAddr,
    /// SIP server `host:port` for the TCP leg.
    pub sip_server: String,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Runs one call to completion.
pub async fn run(stream: TcpStream, config: Arc<GatewayConfig>) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_ws_path)
        .await
        .context("websocket upgrade")?;

    let proxy = Arc::new(
        RtpProxy::new(config.media_host)
            .await
            .context("allocating media proxy")?,
    );
    info!("media proxy listening at {}", proxy.local_addr());

    let (peer, audio_track) = peer::new_peer_connection()
        .await
        .context("creating peer connection")?;
    let rtp_sender = peer
        .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .context("adding audio track")?;
    peer.add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await
        .context("adding audio transceiver")?;

    let sip_stream = TcpStream::connect(&config.sip_server)
        .await
        .with_context(|| format!("connecting to sip server {}", config.sip_server))?;
    let local_addr = sip_stream.local_addr()?;
    let (sip_read, sip_write) = sip_stream.into_split();

    let cancel = CancellationToken::new();
    spawn_media_relays(&peer, &proxy, &audio_track, rtp_sender, &cancel);

    let (ws_sink, ws_source) = ws_stream.split();
    let ws_bytes = ws_byte_stream(ws_source, WsReaderConfig::default());

    let contacts = Arc::new(Mutex::new(ContactMap::new()));

    let result = tokio::select! {
        res = sip_to_ws(MessageReader::new(sip_read), ws_sink, &peer, &proxy, &contacts) => {
            res.context("sip to ws pump")
        }
        res = ws_to_sip(
            MessageReader::new(ws_bytes),
            sip_write,
            &peer,
            &proxy,
            &contacts,
            local_addr,
        ) => {
            res.context("ws to sip pump")
        }
    };

    cancel.cancel();
    if let Err(e) = peer.close().await {
        debug!("closing peer connection: {e}");
    }
    result
}

/// Rejects upgrade requests for anything but the SIP signaling path.
fn check_ws_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == WS_PATH {
        Ok(response)
    } else {
        warn!("rejecting websocket upgrade for {}", request.uri().path());
        let mut rejection = ErrorResponse::new(Some("not found".to_string()));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    }
}

/// Launches the four media relays under the call's cancellation scope.
///
/// The toward-SIP RTP relay waits for the browser's track to show up via
/// `on_track`; the others start immediately and no-op until the SIP peer is
/// negotiated. A relay failing is media-fatal: it cancels the whole call.
fn spawn_media_relays(
    peer: &Arc<RTCPeerConnection>,
    proxy: &Arc<RtpProxy>,
    audio_track: &Arc<TrackLocalStaticRTP>,
    rtp_sender: Arc<RTCRtpSender>,
    cancel: &CancellationToken,
) {
    {
        let proxy = proxy.clone();
        let cancel = cancel.clone();
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            info!("remote track: {}", track.codec().capability.mime_type);
            let proxy = proxy.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                tokio::spawn(async move {
                    if let Err(e) = proxy.relay_to_sip(track, cancel.clone()).await {
                        warn!("rtp relay to sip: {e}");
                        cancel.cancel();
                    }
                });
            })
        }));
    }

    let from_sip = {
        let proxy = proxy.clone();
        let sink = audio_track.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = proxy.relay_from_sip(sink, cancel.clone()).await {
                warn!("rtp relay from sip: {e}");
                cancel.cancel();
            }
        }
    };
    tokio::spawn(from_sip);

    let rtcp_to_sip = {
        let proxy = proxy.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = proxy.relay_rtcp_to_sip(rtp_sender, cancel.clone()).await {
                warn!("rtcp relay to sip: {e}");
                cancel.cancel();
            }
        }
    };
    tokio::spawn(rtcp_to_sip);

    let rtcp_from_sip = {
        let proxy = proxy.clone();
        let peer = peer.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = proxy.relay_rtcp_from_sip(peer, cancel.clone()).await {
                warn!("rtcp relay from sip: {e}");
                cancel.cancel();
            }
        }
    };
    tokio::spawn(rtcp_from_sip);
}

/// SIP server to browser signaling pump.
///
/// When the SIP side offers (INVITE with a session body), the bridge answers
/// toward SIP by way of the proxy and offers toward the browser; its 200 with
/// SDP gets the same treatment.
async fn sip_to_ws(
    mut reader: MessageReader<OwnedReadHalf>,
    mut ws_sink: WsSink,
    peer: &Arc<RTCPeerConnection>,
    proxy: &Arc<RtpProxy>,
    contacts: &Arc<Mutex<ContactMap>>,
) -> anyhow::Result<()> {
    let mut pending_offer: Option<RTCSessionDescription> = None;
    loop {
        let mut msg = match reader.read_message().await {
            Ok(msg) => msg,
            Err(TransportError::Eof) => {
                info!("sip server closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        rewrite_contact_toward_ws(&mut msg, contacts);

        if msg.is_method("INVITE") && msg.header("content-disposition") == Some("session") {
            let offer = peer.create_offer(None).await?;
            peer.set_local_description(offer.clone()).await?;
            proxy.set_remote_sdp(&msg.body_str()).await?;
            msg.set_body(offer.sdp.clone().into_bytes());
            pending_offer = Some(offer);
        } else if msg.is_status("200") && msg.header("content-type") == Some("application/sdp") {
            proxy.set_remote_sdp(&msg.body_str()).await?;
            match &pending_offer {
                Some(offer) => msg.set_body(offer.sdp.clone().into_bytes()),
                None => warn!("200 with sdp before any local offer, forwarding as-is"),
            }
        }

        let raw = msg.to_bytes();
        debug!("sip -> ws: {}", String::from_utf8_lossy(&raw));
        ws_sink
            .send(Message::Text(String::from_utf8_lossy(&raw).into_owned()))
            .await?;
    }
}

/// Browser to SIP server signaling pump.
///
/// When the browser offers (INVITE with SDP), the bridge answers toward the
/// browser and offers the proxy's address toward SIP; the browser's 200 with
/// SDP closes the reverse negotiation.
async fn ws_to_sip(
    mut reader: MessageReader<WsByteReader>,
    mut sip_write: OwnedWriteHalf,
    peer: &Arc<RTCPeerConnection>,
    proxy: &Arc<RtpProxy>,
    contacts: &Arc<Mutex<ContactMap>>,
    local_addr: SocketAddr,
) -> anyhow::Result<()> {
    loop {
        let mut msg = match reader.read_message().await {
            Ok(msg) => msg,
            Err(TransportError::Eof) => {
                info!("browser closed the websocket");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        rewrite_contact_toward_sip(&mut msg, contacts, local_addr);

        let has_sdp = msg.header("content-type") == Some("application/sdp");
        if msg.is_method("INVITE") && has_sdp {
            let body = msg.body_str().into_owned();
            // On an authenticated retry the peer connection is already
            // negotiating; only the SDP rewrite applies.
            if msg.header("proxy-authorization").is_none() {
                let offer = RTCSessionDescription::offer(body.clone())?;
                peer.set_remote_description(offer).await?;
                let answer = peer.create_answer(None).await?;
                peer.set_local_description(answer).await?;
            }
            msg.set_body(proxy.local_sdp(&body)?.into_bytes());
        } else if msg.is_status("200") && has_sdp {
            let body = msg.body_str().into_owned();
            let answer = RTCSessionDescription::answer(body.clone())?;
            peer.set_remote_description(answer).await?;
            msg.set_body(proxy.local_sdp(&body)?.into_bytes());
        }

        let raw = msg.to_bytes();
        debug!("ws -> sip: {}", String::from_utf8_lossy(&raw));
        sip_write.write_all(&raw).await?;
    }
}

/// Replaces a SIP-side `Contact` with the browser's original one when the
/// URI is an address this call minted earlier.
fn rewrite_contact_toward_ws(msg: &mut SipMessage, contacts: &Mutex<ContactMap>) {
    let Some(uri) = msg.contact_uri().map(str::to_owned) else {
        return;
    };
    let ws_contact = contacts.lock().ws_contact(&uri).map(str::to_owned);
    if let Some(contact) = ws_contact {
        msg.set_header("contact", &contact);
    }
}

/// Mints the SIP-side contact for a WS message, records both directions in
/// the map, and overwrites the outgoing `Contact`.
fn rewrite_contact_toward_sip(
    msg: &mut SipMessage,
    contacts: &Mutex<ContactMap>,
    local_addr: SocketAddr,
) {
    let Some(ws_contact) = msg.header("contact").map(str::to_owned) else {
        return;
    };
    match msg.contact_from_to(&ws_contact, &local_addr.to_string()) {
        Ok((sip_addr, sip_contact)) => {
            contacts
                .lock()
                .learn(&ws_contact, &sip_addr, &sip_contact);
            msg.set_header("contact", &sip_contact);
        }
        Err(e) => debug!("leaving contact unrewritten: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http;

    fn upgrade_request(path: &str) -> Request {
        http::Request::builder().uri(path).body(()).unwrap()
    }

    #[test]
    fn signaling_path_is_accepted() {
        let response = Response::new(());
        assert!(check_ws_path(&upgrade_request("/ws"), response).is_ok());
    }

    #[test]
    fn other_paths_are_rejected_with_404() {
        let response = Response::new(());
        let rejection = check_ws_path(&upgrade_request("/media"), response).unwrap_err();
        assert_eq!(rejection.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn ws_contact_is_learned_and_restored() {
        let contacts = Mutex::new(ContactMap::new());
        let local_addr: SocketAddr = "10.0.0.9:41834".parse().unwrap();

        let raw = b"REGISTER sip:biloxi.com SIP/2.0\r\n\
            To: Bob <sip:bob@biloxi.com>\r\n\
            Contact: <sip:bob@h7kjh.invalid;transport=ws>;expires=600\r\n\
            Content-Length: 0\r\n\r\n";
        let mut outbound = SipMessage::parse(raw).unwrap();
        rewrite_contact_toward_sip(&mut outbound, &contacts, local_addr);
        assert_eq!(
            outbound.header("contact"),
            Some("<sip:bob@10.0.0.9:41834;transport=tcp>;expires=600")
        );

        let reply = b"SIP/2.0 200 OK\r\n\
            Contact: <sip:bob@10.0.0.9:41834;transport=tcp>\r\n\
            Content-Length: 0\r\n\r\n";
        let mut inbound = SipMessage::parse(reply).unwrap();
        rewrite_contact_toward_ws(&mut inbound, &contacts);
        assert_eq!(
            inbound.header("contact"),
            Some("<sip:bob@h7kjh.invalid;transport=ws>;expires=600")
        );
    }

    #[test]
    fn contactless_messages_pass_through_unchanged() {
        let contacts = Mutex::new(ContactMap::new());
        let local_addr: SocketAddr = "10.0.0.9:41834".parse().unwrap();

        let raw = b"ACK sip:bob@biloxi.com SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        let mut msg = SipMessage::parse(raw).unwrap();
        rewrite_contact_toward_sip(&mut msg, &contacts, local_addr);
        assert_eq!(msg.header("contact"), None);
    }
}
