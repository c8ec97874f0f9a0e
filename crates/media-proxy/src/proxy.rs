//! The RTP proxy: a paired RTP/RTCP UDP endpoint advertised to both peers.
//!
//! The proxy binds RTP on a random even port P and RTCP on P+1. The SIP
//! peer's addresses start unknown and are captured from its SDP; until then
//! the toward-SIP relays drop packets and the from-SIP relays simply receive
//! nothing, so media tasks may start before negotiation completes.

use std::io::Cursor;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::sdp::description::common::{Address, ConnectionInformation};
use webrtc::sdp::description::media::{MediaDescription, RangedPort};
use webrtc::sdp::description::session::SessionDescription;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::{Marshal, Unmarshal};

use crate::error::{Error, Result};

// One datagram of scratch, reused across packets; nothing allocates on the
// hot path.
const SCRATCH_LEN: usize = 1600;

// Attempts at binding an even/odd port pair before giving up.
const MAX_PORT_ATTEMPTS: usize = 64;

/// Payload type stamped on RTP toward the SIP peer when its SDP names none
/// (the browser's dynamic Opus mapping).
const DEFAULT_SIP_PAYLOAD_TYPE: u8 = 111;

/// Media-level attributes that survive the SDP rewrite.
const KEPT_ATTRIBUTES: [&str; 3] = ["rtpmap", "fmtp", "ptime"];

/// Local UDP media endpoint relaying between the WebRTC peer connection and
/// the SIP peer.
pub struct RtpProxy {
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
    host: IpAddr,
    rtp_port: u16,
    /// SIP peer's RTP address, set once its SDP arrives.
    peer_rtp: RwLock<Option<SocketAddr>>,
    /// SIP peer's RTCP address (RTP port + 1).
    peer_rtcp: RwLock<Option<SocketAddr>>,
    /// Payload type stamped toward SIP, derived from the SIP SDP's rtpmap.
    sip_payload_type: AtomicU8,
}

impl RtpProxy {
    /// Binds the RTP/RTCP socket pair on `host`: RTP on a random even port,
    /// RTCP right above it.
    pub async fn new(host: IpAddr) -> Result<Self> {
        for _ in 0..MAX_PORT_ATTEMPTS {
            let rtp_socket = UdpSocket::bind((host, 0)).await?;
            let rtp_port = rtp_socket.local_addr()?.port();
            if rtp_port % 2 != 0 {
                continue;
            }
            let Ok(rtcp_socket) = UdpSocket::bind((host, rtp_port + 1)).await else {
                continue;
            };
            debug!("rtp proxy bound rtp={} rtcp={}", rtp_port, rtp_port + 1);
            return Ok(RtpProxy {
                rtp_socket,
                rtcp_socket,
                host,
                rtp_port,
                peer_rtp: RwLock::new(None),
                peer_rtcp: RwLock::new(None),
                sip_payload_type: AtomicU8::new(DEFAULT_SIP_PAYLOAD_TYPE),
            });
        }
        Err(Error::PortAllocation)
    }

    /// Local RTP address, as advertised in rewritten SDP.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.rtp_port)
    }

    pub fn rtp_port(&self) -> u16 {
        self.rtp_port
    }

    /// Captures the SIP peer's media addresses from its SDP.
    ///
    /// The first media description's connection address (falling back to the
    /// session-level one) and port become `peer_rtp`; `peer_rtcp` is the same
    /// host one port up. When the media section carries an `rtpmap`, its
    /// payload number becomes the type stamped on RTP toward SIP.
    pub async fn set_remote_sdp(&self, sdp: &str) -> Result<()> {
        let parsed = parse_sdp(sdp)?;
        let media = parsed
            .media_descriptions
            .first()
            .ok_or(Error::NoMediaDescription)?;

        let conn = media
            .connection_information
            .as_ref()
            .or(parsed.connection_information.as_ref())
            .ok_or(Error::NoConnectionInformation)?;
        let address = conn
            .address
            .as_ref()
            .ok_or(Error::NoConnectionInformation)?
            .address
            .clone();
        let port = media.media_name.port.value as u16;

        let target = format!("{address}:{port}");
        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| Error::Resolve(format!("{target}: {e}")))?
            .next()
            .ok_or_else(|| Error::Resolve(target.clone()))?;

        *self.peer_rtp.write() = Some(addr);
        *self.peer_rtcp.write() = Some(SocketAddr::new(addr.ip(), addr.port() + 1));

        if let Some(pt) = first_rtpmap_payload(media) {
            self.sip_payload_type.store(pt, Ordering::Relaxed);
        }
        info!("sip media peer is {addr}");
        Ok(())
    }

    /// Rewrites a peer's SDP so it addresses this proxy.
    ///
    /// The first media description gets the proxy's host and RTP port and the
    /// plaintext `RTP/AVP` transport; of its attributes only `rtpmap`,
    /// `fmtp` and `ptime` survive, and session-level attributes are dropped.
    /// The rest of the SDP passes through untouched.
    pub fn local_sdp(&self, remote_sdp: &str) -> Result<String> {
        let mut parsed = parse_sdp(remote_sdp)?;
        if parsed.media_descriptions.is_empty() {
            return Err(Error::NoMediaDescription);
        }
        parsed.attributes.clear();

        let media = &mut parsed.media_descriptions[0];
        media.connection_information = Some(ConnectionInformation {
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: Some(Address {
                address: self.host.to_string(),
                ttl: None,
                range: None,
            }),
        });
        media.media_name.port = RangedPort {
            value: self.rtp_port as isize,
            range: None,
        };
        media.media_name.protos = vec!["RTP".to_string(), "AVP".to_string()];
        media
            .attributes
            .retain(|a| KEPT_ATTRIBUTES.contains(&a.key.as_str()));

        Ok(parsed.marshal())
    }

    /// Relays RTP read from the WebRTC track toward the SIP peer, stamping
    /// the SIP-side payload type on the way out.
    pub async fn relay_to_sip(
        &self,
        track: Arc<TrackRemote>,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug!("rtp relay to sip running");
        let mut scratch = vec![0u8; SCRATCH_LEN];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = track.read_rtp() => {
                    let Ok((mut packet, _)) = res else {
                        debug!("webrtc track ended");
                        return Ok(());
                    };
                    self.forward_to_sip(&mut packet, &mut scratch).await?;
                }
            }
        }
    }

    /// Relays RTP received from the SIP peer into the local WebRTC track.
    /// Every packet round-trips through the RTP parser, so framing errors
    /// stop the relay instead of reaching the browser.
    pub async fn relay_from_sip(
        &self,
        sink: Arc<TrackLocalStaticRTP>,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug!("rtp relay from sip running");
        let mut scratch = vec![0u8; SCRATCH_LEN];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.rtp_socket.recv_from(&mut scratch) => {
                    let (n, _) = res?;
                    let mut raw = &scratch[..n];
                    let packet = webrtc::rtp::packet::Packet::unmarshal(&mut raw)
                        .map_err(|e| Error::Rtp(e.to_string()))?;
                    if sink.write_rtp(&packet).await.is_err() {
                        debug!("local track closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Relays RTCP feedback read from the RTP sender toward the SIP peer.
    pub async fn relay_rtcp_to_sip(
        &self,
        sender: Arc<RTCRtpSender>,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug!("rtcp relay to sip running");
        let mut scratch = vec![0u8; SCRATCH_LEN];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = sender.read(&mut scratch) => {
                    let Ok((packets, _)) = res else {
                        debug!("rtp sender closed");
                        return Ok(());
                    };
                    let peer = *self.peer_rtcp.read();
                    if let Some(addr) = peer {
                        let data = webrtc::rtcp::packet::marshal(&packets)
                            .map_err(|e| Error::Rtcp(e.to_string()))?;
                        self.send_tolerating_refusal(&self.rtcp_socket, &data, addr)
                            .await?;
                    }
                }
            }
        }
    }

    /// Relays RTCP received from the SIP peer into the peer connection,
    /// unmarshaling into packet objects so feedback handling triggers.
    pub async fn relay_rtcp_from_sip(
        &self,
        peer: Arc<RTCPeerConnection>,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug!("rtcp relay from sip running");
        let mut scratch = vec![0u8; SCRATCH_LEN];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.rtcp_socket.recv_from(&mut scratch) => {
                    let (n, _) = res?;
                    let mut raw = &scratch[..n];
                    let packets = webrtc::rtcp::packet::unmarshal(&mut raw)
                        .map_err(|e| Error::Rtcp(e.to_string()))?;
                    if peer.write_rtcp(&packets).await.is_err() {
                        debug!("peer connection closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stamps the SIP payload type and sends one RTP packet to `peer_rtp`,
    /// if it is known yet.
    async fn forward_to_sip(
        &self,
        packet: &mut webrtc::rtp::packet::Packet,
        scratch: &mut [u8],
    ) -> Result<()> {
        let peer = *self.peer_rtp.read();
        let Some(addr) = peer else {
            trace!("dropping rtp packet, sip peer not negotiated yet");
            return Ok(());
        };
        packet.header.payload_type = self.sip_payload_type.load(Ordering::Relaxed);
        let n = packet
            .marshal_to(scratch)
            .map_err(|e| Error::Rtp(e.to_string()))?;
        self.send_tolerating_refusal(&self.rtp_socket, &scratch[..n], addr)
            .await
    }

    /// UDP send where a refused destination only drops the packet: the SIP
    /// peer may not be listening yet, and the next packet is 20 ms away.
    async fn send_tolerating_refusal(
        &self,
        socket: &UdpSocket,
        data: &[u8],
        addr: SocketAddr,
    ) -> Result<()> {
        match socket.send_to(data, addr).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                trace!("media peer {addr} refused a packet");
                Ok(())
            }
            Err(e) => {
                warn!("udp send to {addr} failed: {e}");
                Err(e.into())
            }
        }
    }
}

fn parse_sdp(sdp: &str) -> Result<SessionDescription> {
    SessionDescription::unmarshal(&mut Cursor::new(sdp))
        .map_err(|e| Error::Sdp(e.to_string()))
}

/// Payload number of the first `rtpmap` attribute, e.g. `rtpmap:111 opus/...`.
fn first_rtpmap_payload(media: &MediaDescription) -> Option<u8> {
    let value = media
        .attributes
        .iter()
        .find(|a| a.key == "rtpmap")?
        .value
        .as_deref()?;
    value.split_whitespace().next()?.parse().ok()
}
