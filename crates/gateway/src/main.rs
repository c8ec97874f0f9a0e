//! rtcgate: bridges SIP-over-WebSocket browsers to a SIP-over-TCP server,
//! terminating WebRTC media locally and relaying RTP/RTCP over a local UDP
//! proxy.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod peer;
mod session;

use session::GatewayConfig;

/// Address the WebSocket signaling endpoint listens on.
const LISTEN_ADDR: &str = "localhost:8088";

#[derive(Parser, Debug)]
#[command(name = "rtcgate", version, about = "WebRTC to SIP voice gateway")]
struct Args {
    /// Address the media proxy binds and advertises in SDP
    #[arg(long)]
    host: IpAddr,

    /// SIP server endpoint, e.g. 1.2.3.5:5060
    #[arg(long)]
    sip: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(GatewayConfig {
        media_host: args.host,
        sip_server: args.sip,
    });

    let listener = TcpListener::bind(LISTEN_ADDR)
        .await
        .with_context(|| format!("cannot listen on {LISTEN_ADDR}"))?;
    info!("listening for sip-over-ws connections at http://{LISTEN_ADDR}{}", session::WS_PATH);

    loop {
        let (stream, remote) = listener.accept().await?;
        let config = config.clone();
        tokio::spawn(async move {
            info!("new websocket connection from {remote}");
            // A failed call never takes the accept loop down; the browser
            // sees the closed socket and may reconnect.
            if let Err(e) = session::run(stream, config).await {
                error!("call from {remote} ended with error: {e:#}");
            } else {
                info!("call from {remote} finished");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn both_flags_are_required() {
        assert!(Args::try_parse_from(["rtcgate"]).is_err());
        assert!(Args::try_parse_from(["rtcgate", "--host", "10.0.0.1"]).is_err());
        assert!(Args::try_parse_from(["rtcgate", "--sip", "10.0.0.2:5060"]).is_err());

        let args =
            Args::try_parse_from(["rtcgate", "--host", "10.0.0.1", "--sip", "10.0.0.2:5060"])
                .unwrap();
        assert_eq!(args.host, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(args.sip, "10.0.0.2:5060");
    }

    #[test]
    fn host_must_be_an_ip_address() {
        assert!(Args::try_parse_from(["rtcgate", "--host", "not-an-ip", "--sip", "x:1"]).is_err());
    }
}
