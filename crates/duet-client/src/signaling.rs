//! WebSocket link to the signal server
//!
//! [`connect`] opens the socket and spawns a pump task that bridges it to a
//! pair of channels, so the session only ever sees [`SignalMessage`]s. The
//! inbound channel closes when the socket does.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use duet_signal::SignalMessage;

use crate::error::SessionError;

/// Timeout for the WebSocket handshake
const WS_TIMEOUT: Duration = Duration::from_secs(30);

/// Channels bridged to an open signal server connection
pub struct SignalLink {
    pub outbound: mpsc::UnboundedSender<SignalMessage>,
    pub inbound: mpsc::UnboundedReceiver<SignalMessage>,
    pump: JoinHandle<()>,
}

impl SignalLink {
    /// Whether the socket is still being pumped
    pub fn is_open(&self) -> bool {
        !self.pump.is_finished()
    }

    pub fn close(self) {
        self.pump.abort();
    }
}

/// Connect to the signal server at `url`
pub async fn connect(url: &str) -> Result<SignalLink, SessionError> {
    let url = Url::parse(url).map_err(|e| SessionError::Connect(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(SessionError::Connect(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    }

    debug!("Connecting to signal server: {}", url);

    let ws = match timeout(WS_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => return Err(SessionError::Connect(e.to_string())),
        Err(_) => return Err(SessionError::Timeout),
    };
    info!("Connected to signal server {}", url);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                outgoing = out_rx.recv() => {
                    let Some(msg) = outgoing else {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    };
                    let json = match msg.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to encode {}: {}", msg.event(), e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(Message::Text(json)).await {
                        warn!("Signal server send failed: {}", e);
                        break;
                    }
                }
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match SignalMessage::from_json(&text) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed signal message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Signal server closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Signal server connection error: {}", e);
                        break;
                    }
                    // Ignore non-text messages (ping/pong/binary)
                    Some(Ok(_)) => continue,
                },
            }
        }
        debug!("Signal pump stopped");
    });

    Ok(SignalLink {
        outbound: out_tx,
        inbound: in_rx,
        pump,
    })
}
