//! Websocket transport.
//!
//! One upgrade endpoint; the trailing path segment names the room
//! (`/ws/<room>` by convention). Each accepted socket becomes one
//! [`Connection`] attached to the room's session:
//!
//! ```text
//! accept ──► upgrade ──► session_for_room ──► session.add(conn)
//!                                             subscribe at offset 0
//!            read loop ──► hub.handle_frame           │
//!            write pump ◄── bounded channel ◄── session.send
//! ```
//!
//! Keep-alive is the transport's job: the write pump pings on a 45 s period
//! and the read loop enforces a 50 s silence deadline. The core above only
//! ever sees complete binary frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::hub::Hub;
use crate::protocol::{RoomName, MAX_FRAME_SIZE};
use crate::session::Connection;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Period between keep-alive pings. Must stay below `pong_deadline`.
    pub ping_period: Duration,
    /// Connection is dropped after this much silence.
    pub pong_deadline: Duration,
    /// Maximum accepted frame size.
    pub max_frame_size: usize,
    /// Capacity of each connection's outbound channel.
    pub send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9999".to_string(),
            ping_period: Duration::from_secs(45),
            pong_deadline: Duration::from_secs(50),
            max_frame_size: MAX_FRAME_SIZE,
            send_queue: 5,
        }
    }
}

/// The websocket relay server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<Hub>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, hub: Arc<Hub>) -> Self {
        Self { config, hub }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (lets tests bind port 0 first).
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let hub = self.hub.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, config).await {
                    log::debug!("connection from {addr} ended: {e}");
                }
            });
        }
    }
}

/// Outbound half of one websocket, as seen by the session layer. Writes are
/// best-effort: a full or closed channel silently drops the frame.
struct WsConnection {
    tx: mpsc::Sender<WsMessage>,
}

impl Connection for WsConnection {
    fn write(&self, frame: Bytes) {
        if self.tx.try_send(WsMessage::Binary(frame)).is_err() {
            log::debug!("outbound channel full or closed, dropping frame");
        }
    }
}

/// Last path segment, e.g. `/ws/doc` → `doc`.
fn room_name_from_path(path: &str) -> Option<RoomName> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit('/').next() {
        Some(segment) if !segment.is_empty() => Some(RoomName::from(segment)),
        _ => None,
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Hub>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok::<_, ErrorResponse>(resp)
    })
    .await?;

    let room = match room_name_from_path(&path) {
        Some(room) => room,
        None => {
            log::warn!("closing connection from {addr}: no room name in path {path:?}");
            return Ok(());
        }
    };
    log::info!("connection from {addr} joined room {room}");

    let session = hub.session_for_room(&room, None);
    let (tx, mut rx) = mpsc::channel::<WsMessage>(config.send_queue);
    let conn: Arc<dyn Connection> = Arc::new(WsConnection { tx: tx.clone() });
    session.add(conn.clone());
    hub.subscribe_room(&session, 0, None).await;

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Write pump: outbound frames plus keep-alive pings.
    let ping_period = config.ping_period;
    let write_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick is immediate
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(msg) => {
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read loop. Any inbound traffic (pongs included) resets the deadline.
    loop {
        let msg = match tokio::time::timeout(config.pong_deadline, ws_rx.next()).await {
            Err(_) => {
                log::debug!("read deadline expired for {addr}");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                log::debug!("websocket error from {addr}: {e}");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        match msg {
            WsMessage::Binary(data) => {
                if data.len() > config.max_frame_size {
                    log::warn!(
                        "dropping {}-byte frame from {addr} (limit {})",
                        data.len(),
                        config.max_frame_size
                    );
                    continue;
                }
                hub.handle_frame(&data, &session, None).await;
            }
            WsMessage::Ping(payload) => {
                let _ = tx.try_send(WsMessage::Pong(payload));
            }
            WsMessage::Pong(_) => {}
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    log::info!("connection from {addr} left room {}", session.room_name());
    session.remove_conn(&conn, &hub);
    // Dropping both senders closes the channel; the write pump sends Close
    // and exits.
    drop(conn);
    drop(tx);
    let _ = write_task.await;
    Ok(())
}
