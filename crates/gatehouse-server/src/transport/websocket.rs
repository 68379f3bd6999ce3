//! WebSocket transport using tokio-tungstenite.
//!
//! Clients connect on `/client`, agents on `/agent`. Session metadata rides in
//! the HTTP upgrade headers. Each binary message carries one CBOR-encoded
//! [`Packet`]; the terminal status goes out in the close frame.

use crate::gateway::Gateway;
use crate::handshake::ClientMetadata;
use crate::relay::PeerHandle;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gatehouse_core::{
    cbor_decode, cbor_encode, BoxFuture, GateError, GateResult, Packet, PacketSource, StatusCode,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Maximum accepted message size (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;
/// Close-frame reasons are capped at 123 bytes by the protocol.
const MAX_CLOSE_REASON: usize = 123;

pub const CLIENT_PATH: &str = "/client";
pub const AGENT_PATH: &str = "/agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Agent,
}

/// What the upgrade request told us about the peer.
#[derive(Debug, Clone)]
struct Upgrade {
    role: Role,
    token: String,
    hostname: String,
    machine_id: String,
    kernel_version: String,
    connection_name: String,
}

fn header(req: &Request, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn bearer(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim().to_string(),
        _ => value.to_string(),
    }
}

fn read_upgrade(req: &Request) -> Option<Upgrade> {
    let role = match req.uri().path() {
        CLIENT_PATH => Role::Client,
        AGENT_PATH => Role::Agent,
        _ => return None,
    };
    Some(Upgrade {
        role,
        token: bearer(&header(req, "authorization")),
        hostname: header(req, "hostname"),
        machine_id: header(req, "machine_id"),
        kernel_version: header(req, "kernel_version"),
        connection_name: header(req, "connection_name"),
    })
}

/// Reads packets from the inbound half of a WebSocket.
pub struct WsPacketSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WsPacketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_packet(&mut self) -> GateResult<Option<Packet>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > MAX_WS_FRAME_SIZE {
                        return Err(GateError::Transport(format!(
                            "WS frame too large: {} bytes (max {MAX_WS_FRAME_SIZE})",
                            data.len()
                        )));
                    }
                    return cbor_decode::<Packet>(&data).map(Some);
                }
                Some(Ok(Message::Close(_))) => return Err(GateError::Canceled),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(GateError::Transport(format!("WS recv failed: {e}"))),
            }
        }
    }
}

impl<S> PacketSource for WsPacketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn recv(&mut self) -> BoxFuture<'_, GateResult<Option<Packet>>> {
        Box::pin(self.next_packet())
    }
}

fn close_frame(result: &GateResult<()>) -> CloseFrame<'static> {
    let (code, mut reason) = match result {
        Ok(()) => (StatusCode::Ok.close_code(), String::new()),
        Err(e) => (e.code().close_code(), e.to_string()),
    };
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}

/// Drain the outbound queue onto the socket, then send the close frame once
/// the stream's owner has a terminal status.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Packet>,
    mut done: oneshot::Receiver<CloseFrame<'static>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = loop {
        tokio::select! {
            biased;
            frame = &mut done => {
                // Flush whatever was queued before the session ended.
                while let Ok(packet) = rx.try_recv() {
                    if send_packet(&mut sink, &packet).await.is_err() {
                        return;
                    }
                }
                break frame.ok();
            }
            packet = rx.recv() => match packet {
                Some(packet) => {
                    if send_packet(&mut sink, &packet).await.is_err() {
                        return;
                    }
                }
                None => break (&mut done).await.ok(),
            },
        }
    };
    if let Some(frame) = frame {
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "failed sending close frame");
        }
    }
    let _ = sink.close().await;
}

async fn send_packet<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    packet: &Packet,
) -> GateResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = cbor_encode(packet)?;
    sink.send(Message::Binary(bytes.into())).await.map_err(|e| {
        debug!(error = %e, "WS send failed");
        GateError::Transport(format!("WS send failed: {e}"))
    })
}

/// Upgrade an accepted byte stream and serve it as a client or agent.
pub async fn serve_connection<S>(
    gateway: Arc<Gateway>,
    stream: S,
    remote: SocketAddr,
    capacity: usize,
) -> GateResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut upgrade = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match read_upgrade(req) {
            Some(u) => {
                upgrade = Some(u);
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some("unknown path".to_string()));
                *err.status_mut() = http::StatusCode::NOT_FOUND;
                Err(err)
            }
        }
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| GateError::Transport(format!("WS handshake failed: {e}")))?;
    let upgrade = upgrade
        .ok_or_else(|| GateError::Transport("WS handshake produced no request".into()))?;
    debug!(remote = %remote, role = ?upgrade.role, "WebSocket connection accepted");

    let (sink, stream) = ws.split();
    let (handle, rx) = PeerHandle::channel(capacity);
    let (done_tx, done_rx) = oneshot::channel();
    let writer = tokio::spawn(write_loop(sink, rx, done_rx));
    let source = WsPacketSource { stream };

    let result = match upgrade.role {
        Role::Client => {
            let meta = ClientMetadata {
                token: upgrade.token,
                hostname: upgrade.hostname,
                machine_id: upgrade.machine_id,
                kernel_version: upgrade.kernel_version,
                connection_name: upgrade.connection_name,
                remote: Some(remote.ip()),
            };
            gateway.serve_client(meta, source, handle).await
        }
        Role::Agent => gateway.serve_agent(&upgrade.token, source, handle).await,
    };

    if let Err(e) = &result {
        info!(remote = %remote, role = ?upgrade.role, code = ?e.code(), error = %e, "closing stream with error");
    }
    let _ = done_tx.send(close_frame(&result));
    if let Err(e) = writer.await {
        warn!(error = %e, "WebSocket writer task failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{client_meta, fixture, AGENT_TOKEN};
    use gatehouse_core::packet::{SPEC_AGENT_CONNECTION_PARAMS, SPEC_CLIENT_EXEC_ARGS};
    use gatehouse_core::{AgentConnectionParams, PacketType};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::MaybeTlsStream;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn listen(gateway: Arc<Gateway>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, remote)) = listener.accept().await {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(gateway, tcp, remote, 16).await;
                });
            }
        });
        addr
    }

    async fn connect(addr: SocketAddr, path: &str, headers: &[(&'static str, String)]) -> Client {
        let mut req = format!("ws://{addr}{path}").into_client_request().unwrap();
        for (name, value) in headers {
            req.headers_mut()
                .insert(*name, HeaderValue::from_str(value).unwrap());
        }
        let (ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, packet: &Packet) {
        ws.send(Message::Binary(cbor_encode(packet).unwrap().into()))
            .await
            .unwrap();
    }

    async fn next_packet(ws: &mut Client) -> Packet {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => return cbor_decode(&data).unwrap(),
                Message::Close(frame) => panic!("unexpected close: {frame:?}"),
                _ => continue,
            }
        }
    }

    async fn close_code(ws: &mut Client) -> u16 {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        assert_eq!(bearer("Bearer abc"), "abc");
        assert_eq!(bearer("bearer abc"), "abc");
        assert_eq!(bearer("abc"), "abc");
    }

    #[test]
    fn close_reason_is_capped() {
        let frame = close_frame(&Err(GateError::Internal("é".repeat(200))));
        assert!(frame.reason.len() <= MAX_CLOSE_REASON);
        assert_eq!(u16::from(frame.code), 4500);
    }

    #[tokio::test]
    async fn relays_between_client_and_agent() {
        let fx = fixture(vec![]);
        let addr = listen(fx.gateway.clone()).await;

        let mut agent = connect(
            addr,
            AGENT_PATH,
            &[("authorization", format!("Bearer {AGENT_TOKEN}"))],
        )
        .await;
        while fx.gateway.registry().agent_count().await == 0 {
            tokio::task::yield_now().await;
        }

        let meta = client_meta("shell");
        let mut client = connect(
            addr,
            CLIENT_PATH,
            &[
                ("authorization", format!("Bearer {}", meta.token)),
                ("connection_name", "shell".to_string()),
                ("hostname", "laptop".to_string()),
            ],
        )
        .await;

        let args = cbor_encode(&vec!["--flag".to_string()]).unwrap();
        send(
            &mut client,
            &Packet::new(PacketType::GatewayConnect, Vec::new()).with_spec(SPEC_CLIENT_EXEC_ARGS, args),
        )
        .await;

        let connect_pkt = next_packet(&mut agent).await;
        assert_eq!(connect_pkt.packet_type, PacketType::AgentConnect);
        let params: AgentConnectionParams =
            cbor_decode(&connect_pkt.spec[SPEC_AGENT_CONNECTION_PARAMS]).unwrap();
        assert_eq!(params.client_args, vec!["--flag".to_string()]);
        let session_id = connect_pkt.session_id().unwrap().to_string();

        send(
            &mut agent,
            &Packet::new(PacketType::Data, b"hello".to_vec())
                .with_spec(gatehouse_core::packet::SPEC_GATEWAY_SESSION_ID, session_id.as_bytes()),
        )
        .await;
        assert_eq!(next_packet(&mut client).await.payload, b"hello");

        client.close(None).await.unwrap();
        let close = next_packet(&mut agent).await;
        assert_eq!(close.packet_type, PacketType::CloseSession);
        assert_eq!(close.session_id(), Some(session_id.as_str()));
    }

    #[tokio::test]
    async fn bad_token_closes_with_unauthenticated() {
        let fx = fixture(vec![]);
        let addr = listen(fx.gateway.clone()).await;

        let mut client = connect(
            addr,
            CLIENT_PATH,
            &[
                ("authorization", "Bearer nope".to_string()),
                ("connection_name", "shell".to_string()),
            ],
        )
        .await;
        assert_eq!(close_code(&mut client).await, 4001);
    }

    #[tokio::test]
    async fn absent_agent_closes_with_failed_precondition() {
        let fx = fixture(vec![]);
        let addr = listen(fx.gateway.clone()).await;
        let meta = client_meta("shell");

        let mut client = connect(
            addr,
            CLIENT_PATH,
            &[
                ("authorization", format!("Bearer {}", meta.token)),
                ("connection_name", "shell".to_string()),
            ],
        )
        .await;
        send(&mut client, &Packet::new(PacketType::Data, b"x".to_vec())).await;
        assert_eq!(close_code(&mut client).await, 4009);
    }

    #[tokio::test]
    async fn unknown_path_is_refused() {
        let fx = fixture(vec![]);
        let addr = listen(fx.gateway.clone()).await;
        let req = format!("ws://{addr}/elsewhere").into_client_request().unwrap();
        assert!(tokio_tungstenite::connect_async(req).await.is_err());
    }
}
