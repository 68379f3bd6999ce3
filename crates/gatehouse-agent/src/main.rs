//! gatehouse-agent: reference agent.
//!
//! Connects to the gateway's agent endpoint, keeps the stream alive and logs
//! every session the gateway opens, feeds and closes.

mod sessions;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use gatehouse_core::{cbor_decode, cbor_encode, Packet, PacketType, StatusCode};
use sessions::{Event, SessionTable};
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// gatehouse-agent: reference agent
#[derive(Parser, Debug)]
#[command(name = "gatehouse-agent", version, about = "Reference agent for the gatehouse gateway")]
struct Cli {
    /// Gateway agent endpoint
    #[arg(long, default_value = "ws://127.0.0.1:8010/agent")]
    url: String,

    /// Agent token
    #[arg(long)]
    token: String,

    /// Seconds between keep-alive packets
    #[arg(long, default_value_t = 30)]
    keepalive_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "agent failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut req = cli
        .url
        .as_str()
        .into_client_request()
        .context("invalid gateway url")?;
    req.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", cli.token)).context("invalid token")?,
    );

    let (ws, _) = tokio_tungstenite::connect_async(req)
        .await
        .with_context(|| format!("connecting to {}", cli.url))?;
    info!(url = %cli.url, "connected to gateway");
    let (mut sink, mut stream) = ws.split();

    let keep_alive = cbor_encode(&Packet::new(PacketType::KeepAlive, Vec::new()))?;
    let mut ticker = tokio::time::interval(Duration::from_secs(cli.keepalive_secs.max(1)));
    let mut table = SessionTable::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sink.send(Message::Binary(keep_alive.clone().into()))
                    .await
                    .context("sending keep-alive")?;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let packet: Packet = match cbor_decode(&data) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "undecodable packet from gateway");
                            continue;
                        }
                    };
                    log_packet(&mut table, &packet);
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1000, String::new()));
                    if StatusCode::from_close_code(code) != StatusCode::Ok {
                        bail!("gateway closed the stream: {code} {reason}");
                    }
                    info!("gateway closed the stream");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("reading from gateway"),
                None => {
                    info!("gateway stream ended");
                    return Ok(());
                }
            },
        }
    }
}

fn log_packet(table: &mut SessionTable, packet: &Packet) {
    match table.apply(packet) {
        Ok(Event::Opened {
            session_id,
            connection_type,
        }) => {
            let args = table
                .get(&session_id)
                .map(|s| s.params.cmd_list.len() + s.params.client_args.len())
                .unwrap_or(0);
            info!(
                session_id = %session_id,
                connection_type = %connection_type,
                args,
                open = table.len(),
                "session opened"
            );
        }
        Ok(Event::Closed { session_id }) => {
            info!(session_id = %session_id, open = table.len(), "session closed");
        }
        Ok(Event::Data { session_id, bytes }) => {
            info!(session_id = %session_id, packet_type = %packet.packet_type, bytes, "packet received");
        }
        Ok(Event::Ignored) => {
            debug!(packet_type = %packet.packet_type, "packet without session id");
        }
        Err(e) => warn!(error = %e, "malformed packet from gateway"),
    }
}
