//! Websocket client with confirmation bookkeeping.
//!
//! Mirrors the server's contract from the other side: updates and
//! subscription requests carry client-allocated confirmation numbers and
//! stay in an `unconfirmed` map until the server confirms them; inbound Sync
//! payloads are appended to a per-room byte buffer and acknowledged
//! immediately. Integration tests drive the full relay through this client.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{Message, Reader, RoomName, SubEntry};

/// Client-side failures surfaced to callers.
#[derive(Debug)]
pub enum ClientError {
    /// `connect` was not called or the connection is gone.
    NotConnected,
    /// The websocket handshake failed.
    Handshake(tokio_tungstenite::tungstenite::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "client is not connected"),
            Self::Handshake(e) => write!(f, "websocket handshake failed: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

#[derive(Default)]
struct ClientState {
    /// Outgoing messages not yet confirmed by the server, by confirmation
    /// number.
    unconfirmed: HashMap<u64, Vec<u8>>,
    /// Next confirmation number expected back from the server.
    next_expected_confirmation: u64,
    /// Next confirmation number to allocate.
    next_confirmation: u64,
    /// Accumulated update bytes per room (own updates included).
    rooms: HashMap<RoomName, Vec<u8>>,
}

impl ClientState {
    fn confirmed_up_to(&mut self, conf: u64) {
        while conf >= self.next_expected_confirmation {
            self.unconfirmed.remove(&self.next_expected_confirmation);
            self.next_expected_confirmation += 1;
        }
    }
}

/// A relay client bound to one server URL.
pub struct SyncClient {
    url: String,
    state: Arc<Mutex<ClientState>>,
    send_tx: Option<mpsc::Sender<Vec<u8>>>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a client for `url` (e.g. `ws://127.0.0.1:9999/ws/doc`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Arc::new(Mutex::new(ClientState::default())),
            send_tx: None,
            read_task: None,
            write_task: None,
        }
    }

    /// Connect and spawn the read/write pumps. A second call while connected
    /// is a no-op.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.send_tx.is_some() {
            return Ok(());
        }
        let (ws, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(ClientError::Handshake)?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(10);
        self.send_tx = Some(tx.clone());

        self.write_task = Some(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if ws_tx.send(WsMessage::Binary(frame.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_tx.send(WsMessage::Close(None)).await;
        }));

        let state = self.state.clone();
        self.read_task = Some(tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    WsMessage::Binary(data) => read_frame(&state, &tx, &data),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        }));
        Ok(())
    }

    /// Stop the pumps and close the socket.
    pub async fn disconnect(&mut self) {
        self.send_tx = None;
        if let Some(read) = self.read_task.take() {
            read.abort();
            let _ = read.await;
        }
        // With every sender gone the write pump drains, sends Close and
        // exits.
        if let Some(write) = self.write_task.take() {
            let _ = write.await;
        }
    }

    /// Request subscriptions for the given rooms.
    pub async fn subscribe(&self, subs: Vec<SubEntry>) -> Result<(), ClientError> {
        let frame = {
            let mut state = self.state.lock().unwrap();
            let conf = state.next_confirmation;
            state.next_confirmation += 1;
            let frame = Message::Awareness {
                confirmation: conf,
                subs,
                client_state: String::new(),
            }
            .encode();
            state.unconfirmed.insert(conf, frame.clone());
            frame
        };
        self.send(frame).await
    }

    /// Send an update for `room`, applying it locally as well (the server
    /// broadcasts to everyone but the origin).
    pub async fn update_room(&self, room: &RoomName, data: &[u8]) -> Result<(), ClientError> {
        let frame = {
            let mut state = self.state.lock().unwrap();
            let conf = state.next_confirmation;
            state.next_confirmation += 1;
            let frame = Message::Sync {
                confirmation: conf,
                room: room.clone(),
                payload: data.to_vec(),
            }
            .encode();
            state.unconfirmed.insert(conf, frame.clone());
            state
                .rooms
                .entry(room.clone())
                .or_default()
                .extend_from_slice(data);
            frame
        };
        self.send(frame).await
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        let tx = self.send_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(frame).await.map_err(|_| ClientError::NotConnected)
    }

    /// Block until the server has confirmed every outstanding message.
    pub async fn wait_for_confs(&self) {
        loop {
            if self.state.lock().unwrap().unconfirmed.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Number of messages still awaiting confirmation.
    pub fn unconfirmed_count(&self) -> usize {
        self.state.lock().unwrap().unconfirmed.len()
    }

    /// The update bytes accumulated for `room` so far.
    pub fn room_data(&self, room: &RoomName) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }
}

/// Handle one inbound transport frame (possibly several messages).
fn read_frame(state: &Arc<Mutex<ClientState>>, tx: &mpsc::Sender<Vec<u8>>, data: &[u8]) {
    let mut r = Reader::new(data);
    while !r.is_empty() {
        let message = match Message::decode(&mut r) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("client: dropping malformed frame: {e}");
                return;
            }
        };
        match message {
            Message::Sync {
                confirmation,
                room,
                payload,
            } => {
                {
                    let mut st = state.lock().unwrap();
                    st.rooms.entry(room).or_default().extend_from_slice(&payload);
                }
                // Acknowledge receipt + persistence.
                let ack = Message::Confirmation { confirmation }.encode();
                if tx.try_send(ack).is_err() {
                    log::debug!("client: send queue full, acknowledgement dropped");
                }
            }
            Message::Confirmation { confirmation } => {
                state.lock().unwrap().confirmed_up_to(confirmation);
            }
            Message::Awareness { confirmation, .. } => {
                // Subscription echo: confirmation-shaped, clears the
                // pending subscribe request.
                state.lock().unwrap().confirmed_up_to(confirmation);
            }
            Message::ConfirmedByHost { offset } => {
                log::debug!("client: host confirmed offset {offset}");
            }
            Message::HostUnconfirmedByClient {
                client_confirmation,
                offset,
            } => {
                log::debug!(
                    "client: host holds unconfirmed update {client_confirmation} at offset {offset}"
                );
            }
        }
    }
}
