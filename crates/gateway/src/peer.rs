//! WebRTC peer-connection construction.

use std::sync::Arc;

use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Builds the per-call peer connection and the local Opus track that carries
/// SIP-side audio toward the browser.
pub async fn new_peer_connection(
) -> Result<(Arc<RTCPeerConnection>, Arc<TrackLocalStaticRTP>), webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };
    let peer = Arc::new(api.new_peer_connection(config).await?);

    // The handler must not keep the connection alive; the session is the only
    // owner, so it holds a weak handle.
    let weak = Arc::downgrade(&peer);
    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let weak = weak.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Failed => {
                    warn!("peer connection failed");
                    if let Some(peer) = weak.upgrade() {
                        if let Err(e) = peer.close().await {
                            warn!("closing failed peer connection: {e}");
                        }
                    }
                }
                RTCPeerConnectionState::Closed => info!("peer connection closed"),
                state => info!("peer connection state: {state}"),
            }
        })
    }));

    let audio_track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            ..Default::default()
        },
        "audio".to_string(),
        "rtcgate".to_string(),
    ));

    Ok((peer, audio_track))
}
