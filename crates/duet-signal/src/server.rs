//! WebSocket signal server implementation

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::messages::{Envelope, ErrorCode, RoomRef, SignalMessage};
use crate::registry::{JoinOutcome, RegistryStats, RelayTarget, RoomRegistry};
use crate::room::ConnId;

/// Longest HTTP request head inspected before deciding how to serve a connection
const MAX_REQUEST_HEAD: usize = 2048;

/// Give up waiting for a complete request head after this many peeks
const MAX_HEAD_PEEKS: usize = 50;

/// Counts served on `/health` and `/stats`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub connections: usize,
}

/// Signal server state
#[derive(Clone, Default)]
pub struct SignalServer {
    registry: Arc<RoomRegistry>,
    /// Outbound text frames per live connection
    peers: Arc<DashMap<ConnId, mpsc::UnboundedSender<String>>>,
    next_conn: Arc<AtomicU64>,
}

/// How an accepted TCP connection will be served
enum Incoming {
    /// Plain HTTP request for the given path
    Http(String),
    WebSocket,
}

impl SignalServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the signal server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.registry.room_count()
    }

    /// Get live connection count (for monitoring)
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            registry: self.registry.stats(),
            connections: self.peers.len(),
        }
    }

    fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Handle a single connection (HTTP or WebSocket)
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Incoming::Http(path) = classify(&stream).await? {
            debug!("HTTP {} from {}", path, peer_addr);
            return respond_http(&mut stream, self.stats()).await;
        }

        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn = self.next_conn_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.peers.insert(conn, tx);
        info!("New client connected: {} from {}", conn, peer_addr);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if ws_sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket error on {}: {:?}", conn, e);
                    break;
                }
            };

            self.handle_frame(conn, text);
        }

        self.disconnect(conn);
        let _ = writer.await;
        Ok(())
    }

    /// Handle one text frame from `conn`
    fn handle_frame(&self, conn: ConnId, text: String) {
        let envelope = match Envelope::from_json(&text) {
            Ok(envelope) => envelope,
            Err(e) => return self.reject_invalid(conn, e),
        };

        if envelope.is_relayed() {
            let room_id = envelope.room_id().map(str::to_owned);
            return self.relay(conn, &envelope.event, room_id, text);
        }

        match SignalMessage::from_json(&text) {
            Ok(request) => self.handle_message(conn, request),
            Err(e) => self.reject_invalid(conn, e),
        }
    }

    fn reject_invalid(&self, conn: ConnId, e: serde_json::Error) {
        self.send(
            conn,
            SignalMessage::error(ErrorCode::InvalidMessage, format!("Invalid message: {}", e)),
        );
    }

    /// Handle a decoded room-management message from `conn`
    fn handle_message(&self, conn: ConnId, msg: SignalMessage) {
        match msg {
            SignalMessage::Join(RoomRef { room_id }) => {
                info!("Client {} joining room {}", conn, room_id);
                let reply = match self.registry.join(conn, &room_id) {
                    JoinOutcome::Created => {
                        info!("Room {} created by {}", room_id, conn);
                        SignalMessage::RoomCreated(RoomRef::new(room_id))
                    }
                    JoinOutcome::Joined => {
                        info!("Client {} joined room {}", conn, room_id);
                        SignalMessage::RoomJoined(RoomRef::new(room_id))
                    }
                    JoinOutcome::Full => {
                        info!("Room {} is full, rejecting {}", room_id, conn);
                        SignalMessage::FullRoom(RoomRef::new(room_id))
                    }
                    JoinOutcome::AlreadyInRoom(current) => SignalMessage::error(
                        ErrorCode::AlreadyInRoom,
                        format!("Already in room {}", current),
                    ),
                };
                self.send(conn, reply);
            }

            SignalMessage::Leave(RoomRef { room_id }) => {
                if self.registry.room_of(conn).as_deref() != Some(room_id.as_str()) {
                    self.send(
                        conn,
                        SignalMessage::error(ErrorCode::NotInRoom, format!("Not in room {}", room_id)),
                    );
                    return;
                }
                info!("Client {} left room {}", conn, room_id);
                self.depart(conn);
            }

            other => {
                self.send(
                    conn,
                    SignalMessage::error(
                        ErrorCode::UnexpectedMessage,
                        format!("Clients may not send {}", other.event()),
                    ),
                );
            }
        }
    }

    /// Forward `frame` unchanged to the other member of the sender's room
    fn relay(&self, conn: ConnId, event: &str, room_id: Option<String>, frame: String) {
        let room_id = match room_id.or_else(|| self.registry.room_of(conn)) {
            Some(room_id) => room_id,
            None => {
                self.send(
                    conn,
                    SignalMessage::error(ErrorCode::NotInRoom, "Not in a room"),
                );
                return;
            }
        };

        match self.registry.relay_target(conn, &room_id) {
            RelayTarget::Peer(peer) => {
                debug!("Relaying {} from {} to {} in room {}", event, conn, peer, room_id);
                if !self.push(peer, frame) {
                    debug!("Peer {} went away before relay", peer);
                }
            }
            RelayTarget::NoPeer => {
                debug!("Dropping {} from {}: room {} has no peer", event, conn, room_id);
            }
            RelayTarget::NotMember => {
                warn!("Rejecting {} from {}: not a member of room {}", event, conn, room_id);
                self.send(
                    conn,
                    SignalMessage::error(
                        ErrorCode::NotInRoom,
                        format!("Not a member of room {}", room_id),
                    ),
                );
            }
        }
    }

    /// Connection closed: drop its queue and leave its room
    fn disconnect(&self, conn: ConnId) {
        self.peers.remove(&conn);
        info!("Client disconnected: {}", conn);
        self.depart(conn);
    }

    fn depart(&self, conn: ConnId) {
        let Some(departure) = self.registry.leave(conn) else {
            return;
        };

        debug!(
            "Room {} now at generation {}",
            departure.room_id, departure.generation
        );

        if let Some(survivor) = departure.survivor {
            self.send(survivor, SignalMessage::PeerLeft(RoomRef::new(departure.room_id)));
        }
    }

    /// Encode and queue a server message for `conn`
    fn send(&self, conn: ConnId, msg: SignalMessage) -> bool {
        match msg.to_json() {
            Ok(frame) => self.push(conn, frame),
            Err(e) => {
                warn!("Failed to encode {}: {}", msg.event(), e);
                false
            }
        }
    }

    /// Queue a text frame for `conn`, returning false if the connection is gone
    fn push(&self, conn: ConnId, frame: String) -> bool {
        match self.peers.get(&conn) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }
}

/// Peek at the request head to tell plain HTTP from a WebSocket upgrade
async fn classify(stream: &TcpStream) -> std::io::Result<Incoming> {
    let mut buf = [0u8; MAX_REQUEST_HEAD];

    for _ in 0..MAX_HEAD_PEEKS {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(Incoming::WebSocket);
        }

        let head = &buf[..n];
        let prefix = n.min(4);
        if head[..prefix] != b"GET "[..prefix] {
            return Ok(Incoming::WebSocket);
        }

        let text = String::from_utf8_lossy(head);
        if text.to_ascii_lowercase().contains("upgrade: websocket") {
            return Ok(Incoming::WebSocket);
        }
        if text.contains("\r\n\r\n") || n == buf.len() {
            let path = request_path(&text).to_string();
            return Ok(Incoming::Http(path));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Ok(Incoming::WebSocket)
}

fn request_path(request: &str) -> &str {
    request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
}

/// Handle an HTTP request (for health checks)
async fn respond_http<S>(
    stream: &mut S,
    stats: ServerStats,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let (status, body) = match request_path(&request) {
        "/health" => (
            "200 OK",
            serde_json::json!({
                "status": "healthy",
                "rooms": stats.registry.rooms,
                "connections": stats.connections,
            })
            .to_string(),
        ),
        "/stats" => ("200 OK", serde_json::to_string(&stats)?),
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
