//! Process-wide registry of rooms and sessions, and the entry point for
//! decoded frames.
//!
//! Lock order, to be respected everywhere: rooms-registry → room;
//! room-sessions map → sessions-registry → session. The PRNG and the
//! document cache are leaves. No path holds a room mutex while taking a
//! session mutex except the send fan-out, which only ever takes the
//! session's own mutex and never the reverse.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::{Message, ProtocolError, Reader, RoomName, MAX_FRAME_SIZE};
use crate::provider::{DocumentProvider, ProviderCtx};
use crate::room::{Room, RoomState};
use crate::session::Session;

/// Registry errors. Not user-visible; callers log and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The session still has live connections.
    SessionBusy(u64),
    /// No session registered under this id.
    UnknownSession(u64),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionBusy(id) => {
                write!(f, "session {id} still has connections attached")
            }
            Self::UnknownSession(id) => write!(f, "session {id} does not exist"),
        }
    }
}

impl std::error::Error for HubError {}

/// The process-wide room/session registry.
pub struct Hub {
    /// RW lock: `get_room` is a hot read path.
    rooms: RwLock<HashMap<RoomName, Arc<Room>>>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    /// roomName → sessionId, consulted by the upgrade endpoint.
    room_sessions: Mutex<HashMap<RoomName, u64>>,
    seed: Mutex<StdRng>,
    provider: Arc<dyn DocumentProvider>,
}

impl Hub {
    pub fn new(provider: Arc<dyn DocumentProvider>) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self {
            rooms: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            room_sessions: Mutex::new(HashMap::new()),
            seed: Mutex::new(StdRng::seed_from_u64(nanos)),
            provider,
        }
    }

    fn gen_u32(&self) -> u32 {
        self.seed.lock().unwrap().random()
    }

    fn gen_u64(&self) -> u64 {
        self.seed.lock().unwrap().random()
    }

    /// Get or create the room for `name`. Safe for parallel access; the same
    /// instance comes back for the same name.
    ///
    /// On a miss the new room's own mutex is taken *before* the registry
    /// write lock is released and held until the offset is populated from
    /// storage, so no concurrent caller can observe a stale zero offset.
    pub fn get_room(&self, name: &RoomName, ctx: ProviderCtx<'_>) -> Arc<Room> {
        if let Some(room) = self.rooms.read().unwrap().get(name) {
            return room.clone();
        }
        let mut rooms = self.rooms.write().unwrap();
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = Arc::new(Room::new(self.gen_u32()));
        rooms.insert(name.clone(), room.clone());
        let mut state = room
            .state()
            .try_lock()
            .expect("freshly created room mutex cannot be contended");
        drop(rooms);
        state.offset = self.provider.read_room_size(name, ctx);
        drop(state);
        room
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap().len()
    }

    /// Create a session bound to `room`. Eagerly materializes the document
    /// so initial content exists before the first update or replay.
    pub fn create_session(&self, room: &RoomName, ctx: ProviderCtx<'_>) -> Arc<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        let id = self.gen_u64();
        if sessions.contains_key(&id) {
            // A 64-bit collision means the RNG is being misused; continuing
            // would hand one client another client's session.
            panic!("generated the same session id twice");
        }
        let session = Arc::new(Session::new(id, room.clone()));
        self.provider.get_document(room, ctx);
        sessions.insert(id, session.clone());
        session
    }

    pub fn get_session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Drop a session. Fails with [`HubError::SessionBusy`] while any
    /// connection is still attached.
    pub fn remove_session(&self, id: u64) -> Result<(), HubError> {
        let room = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get(&id) {
                None => return Err(HubError::UnknownSession(id)),
                Some(session) if session.connection_count() > 0 => {
                    return Err(HubError::SessionBusy(id));
                }
                Some(session) => {
                    let room = session.room_name().clone();
                    sessions.remove(&id);
                    room
                }
            }
        };
        let mut map = self.room_sessions.lock().unwrap();
        if map.get(&room) == Some(&id) {
            map.remove(&room);
        }
        Ok(())
    }

    /// Session for the upgrade endpoint: reuse the room's registered session
    /// when it is still alive, otherwise create one and register it.
    pub fn session_for_room(&self, name: &RoomName, ctx: ProviderCtx<'_>) -> Arc<Session> {
        let mut map = self.room_sessions.lock().unwrap();
        if let Some(id) = map.get(name) {
            if let Some(session) = self.get_session(*id) {
                return session;
            }
            // Stale entry from a torn-down session.
        }
        let session = self.create_session(name, ctx);
        map.insert(name.clone(), session.id());
        session
    }

    /// Run `f` against the room's state under its mutex, after pruning
    /// subscribers whose connection is gone. When `f` reports a
    /// modification and the room is not yet queued, it is registered with
    /// the writer once the mutex is released.
    pub(crate) async fn modify_room<F>(&self, name: &RoomName, ctx: ProviderCtx<'_>, f: F)
    where
        F: FnOnce(&mut RoomState) -> bool,
    {
        let room = self.get_room(name, ctx);
        let register = {
            let mut state = room.state().lock().await;
            state.prune_dead_subs();
            let modified = f(&mut state);
            if modified && !state.registered {
                state.registered = true;
                true
            } else {
                false
            }
        };
        if register {
            self.provider.register_room_update(&room, name, ctx);
        }
    }

    /// Accept an update payload from `origin`: buffer it for the writer,
    /// advance the room offset, and fan it out to every other subscriber.
    pub async fn update_room(
        &self,
        name: &RoomName,
        origin: &Arc<Session>,
        payload: &[u8],
        ctx: ProviderCtx<'_>,
    ) {
        self.modify_room(name, ctx, |state| {
            state.append_update(name, origin, payload);
            true
        })
        .await;
    }

    /// Subscribe `session` to its room from `offset`. Already-caught-up
    /// subscribers go live immediately; the rest wait for the writer's
    /// replay pass.
    pub async fn subscribe_room(
        &self,
        session: &Arc<Session>,
        offset: u32,
        ctx: ProviderCtx<'_>,
    ) {
        let name = session.room_name().clone();
        self.modify_room(&name, ctx, |state| state.admit_or_defer(session, offset))
            .await;
    }

    /// Decode and dispatch every message in a transport frame. Decoding
    /// errors drop the rest of the frame but never the connection.
    pub async fn handle_frame(&self, frame: &[u8], session: &Arc<Session>, ctx: ProviderCtx<'_>) {
        if frame.len() > MAX_FRAME_SIZE {
            log::warn!(
                "dropping {}-byte frame from session {} (limit {MAX_FRAME_SIZE})",
                frame.len(),
                session.id()
            );
            return;
        }
        let mut r = Reader::new(frame);
        while !r.is_empty() {
            match Message::decode(&mut r) {
                Ok(message) => self.handle_message(message, session, ctx).await,
                Err(ProtocolError::UnknownKind(kind)) => {
                    log::warn!(
                        "session {}: skipping frame with unknown message kind {kind}",
                        session.id()
                    );
                    return;
                }
                Err(e) => {
                    log::warn!("session {}: dropping malformed frame: {e}", session.id());
                    return;
                }
            }
        }
    }

    async fn handle_message(
        &self,
        message: Message,
        session: &Arc<Session>,
        ctx: ProviderCtx<'_>,
    ) {
        match message {
            Message::Sync {
                confirmation: _,
                room,
                payload,
            } => {
                if room != *session.room_name() {
                    log::debug!(
                        "session {} sent a sync for {room} but is bound to {}",
                        session.id(),
                        session.room_name()
                    );
                }
                self.update_room(session.room_name(), session, &payload, ctx)
                    .await;
            }
            Message::Awareness {
                confirmation,
                subs,
                client_state,
            } => {
                for sub in &subs {
                    if sub.room != *session.room_name() {
                        log::debug!(
                            "session {}: ignoring awareness entry for foreign room {}",
                            session.id(),
                            sub.room
                        );
                        continue;
                    }
                    match u32::try_from(sub.offset) {
                        Ok(offset) => self.subscribe_room(session, offset, ctx).await,
                        Err(_) => log::warn!(
                            "session {}: subscription offset {} out of range",
                            session.id(),
                            sub.offset
                        ),
                    }
                }
                // The client state is opaque; it is carried back untouched,
                // like every other payload in the system.
                let echo = Message::Awareness {
                    confirmation,
                    subs,
                    client_state,
                };
                session.send(Bytes::from(echo.encode()));
            }
            Message::Confirmation { confirmation } => {
                session.client_acknowledged(confirmation);
            }
            Message::HostUnconfirmedByClient { .. } | Message::ConfirmedByHost { .. } => {
                // Server→client kinds; a client sending them is confused but
                // harmless.
                log::debug!(
                    "session {}: ignoring inbound server-only message",
                    session.id()
                );
            }
        }
    }
}
