//! Client sessions and the transport-facing connection seam.
//!
//! A session is one logical client identity, bound to exactly one room for
//! its lifetime. The transport may attach several connections to it (a
//! reconnect races the old socket's teardown); exactly one is active and
//! receives outbound frames. When the active connection goes away the oldest
//! surviving one is promoted, and when the last one goes away the hub
//! destroys the session.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::confirm::{ClientConfirmation, ServerConfirmation};
use crate::hub::Hub;
use crate::protocol::{Message, RoomName};

/// Outbound sink owned by the transport layer.
///
/// `write` is non-blocking and best-effort: implementations queue the frame
/// and silently drop it when the underlying channel is full or closed. The
/// transport calls [`Session::add`] on upgrade and [`Session::remove_conn`]
/// on teardown.
pub trait Connection: Send + Sync {
    fn write(&self, frame: Bytes);
}

#[derive(Default)]
struct SessionState {
    /// Currently active connection, if any.
    conn: Option<Arc<dyn Connection>>,
    /// All attached connections, in arrival order.
    conns: Vec<Arc<dyn Connection>>,
    /// Confirmations this server allocated towards the client.
    server_confirmation: ServerConfirmation,
    /// Confirmations received back from the server side of a peer.
    client_confirmation: ClientConfirmation,
}

/// A logical client bound to one room.
pub struct Session {
    id: u64,
    room: RoomName,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(id: u64, room: RoomName) -> Self {
        Self {
            id,
            room,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn room_name(&self) -> &RoomName {
        &self.room
    }

    /// Attach a connection. The first one attached becomes active.
    pub fn add(&self, conn: Arc<dyn Connection>) {
        let mut state = self.state.lock().unwrap();
        state.conns.push(conn.clone());
        if state.conn.is_none() {
            state.conn = Some(conn);
        }
    }

    /// Detach a connection. Promotes the oldest survivor when the active one
    /// departs; asks the hub to destroy this session when none remain.
    pub fn remove_conn(&self, conn: &Arc<dyn Connection>, hub: &Hub) {
        let empty = {
            let mut state = self.state.lock().unwrap();
            state.conns.retain(|c| !Arc::ptr_eq(c, conn));
            let was_active = state
                .conn
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, conn));
            if was_active {
                state.conn = state.conns.first().cloned();
            }
            state.conn.is_none()
        };
        // Outside the session mutex: the hub takes the sessions-registry
        // lock, which must come first in the lock order.
        if empty {
            if let Err(e) = hub.remove_session(self.id) {
                log::debug!("session {} not removed: {e}", self.id);
            }
        }
    }

    pub fn has_active_conn(&self) -> bool {
        self.state.lock().unwrap().conn.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().conns.len()
    }

    /// Forward a pre-encoded frame to the active connection, dropping it
    /// silently when there is none.
    pub fn send(&self, frame: Bytes) {
        let state = self.state.lock().unwrap();
        if let Some(conn) = &state.conn {
            conn.write(frame);
        }
    }

    /// Send an update frame; empty frames are skipped.
    pub fn send_update(&self, frame: Bytes) {
        if !frame.is_empty() {
            self.send(frame);
        }
    }

    /// Announce a room's durable offset (emission hook, not wired into the
    /// broadcast loop).
    pub fn send_confirmed_by_host(&self, offset: u64) {
        self.send(Bytes::from(Message::ConfirmedByHost { offset }.encode()));
    }

    /// Re-surface an accepted but not yet durable client update (emission
    /// hook, not wired into the broadcast loop).
    pub fn send_host_unconfirmed_by_client(&self, client_confirmation: u64, offset: u64) {
        self.send(Bytes::from(
            Message::HostUnconfirmedByClient {
                client_confirmation,
                offset,
            }
            .encode(),
        ));
    }

    /// Allocate the next server→client confirmation number.
    pub fn allocate_confirmation(&self) -> u64 {
        self.state.lock().unwrap().server_confirmation.allocate()
    }

    /// Record a room change under a previously allocated confirmation.
    pub fn mark_room_changed(&self, room: RoomName, conf: u64) {
        self.state
            .lock()
            .unwrap()
            .server_confirmation
            .mark_changed(room, conf);
    }

    /// The client acknowledged receipt + durability up to `conf`.
    pub fn client_acknowledged(&self, conf: u64) {
        self.state
            .lock()
            .unwrap()
            .server_confirmation
            .client_acknowledged(conf);
    }

    /// The peer's server confirmed `conf` towards us. Returns true iff the
    /// contiguous confirmed prefix advanced.
    pub fn server_confirmed(&self, conf: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .client_confirmation
            .server_confirmed(conf)
    }

    /// True when the client has acknowledged every allocated confirmation.
    pub fn confirmations_in_sync(&self) -> bool {
        self.state.lock().unwrap().server_confirmation.in_sync()
    }
}
