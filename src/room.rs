//! Per-room in-memory state.
//!
//! A room is the unit of fan-out and durability: its offset counts every
//! byte appended to the log since creation, `pending_writes` buffers the
//! length-prefixed records the file writer has not flushed yet, and the two
//! subscriber lists separate live sessions from those still awaiting
//! catch-up replay.
//!
//! Invariants, all maintained under the room mutex:
//! - `offset` == on-disk log size + `pending_writes.len()`
//! - a session appears in at most one of `subs` / `pending_subs`
//! - `registered` is true iff the file writer still owes this room work

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::protocol::{write_payload, Message, RoomName};
use crate::session::Session;

/// A session waiting for catch-up replay, with the offset it resumes from.
pub struct PendingSub {
    pub session: Arc<Session>,
    pub offset: u32,
}

#[derive(Default)]
pub(crate) struct RoomState {
    /// True while the file writer owes this room a drain pass.
    pub(crate) registered: bool,
    /// Length-prefixed records not yet flushed to disk.
    pub(crate) pending_writes: Vec<u8>,
    /// Live subscribers, in subscription order.
    pub(crate) subs: Vec<Arc<Session>>,
    /// Subscribers awaiting replay.
    pub(crate) pending_subs: Vec<PendingSub>,
    /// Bytes appended to the log since room creation.
    pub(crate) offset: u32,
}

impl RoomState {
    pub(crate) fn has_session(&self, session: &Arc<Session>) -> bool {
        self.subs.iter().any(|s| Arc::ptr_eq(s, session))
    }

    /// Drop subscribers whose active connection is gone, preserving order.
    pub(crate) fn prune_dead_subs(&mut self) {
        if self.subs.iter().any(|s| !s.has_active_conn()) {
            self.subs.retain(|s| s.has_active_conn());
        }
    }

    /// Append a payload as a length-prefixed record, advance the offset by
    /// the record length, and fan the update out to every live subscriber
    /// except the origin.
    pub(crate) fn append_update(
        &mut self,
        room: &RoomName,
        origin: &Arc<Session>,
        payload: &[u8],
    ) {
        let before = self.pending_writes.len();
        write_payload(&mut self.pending_writes, payload);
        self.offset += (self.pending_writes.len() - before) as u32;

        let frame = Bytes::from(
            Message::Sync {
                confirmation: u64::from(self.offset),
                room: room.clone(),
                payload: payload.to_vec(),
            }
            .encode(),
        );
        for sub in &self.subs {
            if !Arc::ptr_eq(sub, origin) {
                sub.send_update(frame.clone());
            }
        }
    }

    /// Admit a subscriber directly when it is already caught up, otherwise
    /// park it for the file writer's replay pass. Returns whether the writer
    /// has work to do.
    pub(crate) fn admit_or_defer(&mut self, session: &Arc<Session>, offset: u32) -> bool {
        if self.has_session(session) {
            return false;
        }
        if self.offset != offset {
            self.pending_subs.push(PendingSub {
                session: session.clone(),
                offset,
            });
            return true;
        }
        self.subs.push(session.clone());
        false
    }
}

/// A named collaborative room.
pub struct Room {
    /// Random identifier scoping client room-session state; fixed at
    /// creation.
    room_session_id: u32,
    state: Mutex<RoomState>,
}

impl Room {
    pub(crate) fn new(room_session_id: u32) -> Self {
        Self {
            room_session_id,
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn room_session_id(&self) -> u32 {
        self.room_session_id
    }

    pub(crate) fn state(&self) -> &Mutex<RoomState> {
        &self.state
    }

    /// Current offset: total bytes appended to the log since creation.
    pub async fn offset(&self) -> u32 {
        self.state.lock().await.offset
    }

    /// Bytes buffered for the next flush.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending_writes.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subs.len()
    }

    pub async fn pending_subscriber_count(&self) -> usize {
        self.state.lock().await.pending_subs.len()
    }

    pub async fn is_registered(&self) -> bool {
        self.state.lock().await.registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestConn;

    fn session_with_conn(id: u64) -> (Arc<Session>, Arc<TestConn>) {
        let session = Arc::new(Session::new(id, RoomName::from("r")));
        let conn = TestConn::new();
        session.add(conn.clone());
        (session, conn)
    }

    #[test]
    fn test_append_update_length_prefixes() {
        let mut state = RoomState::default();
        let (origin, _) = session_with_conn(1);
        let room = RoomName::from("r");

        state.append_update(&room, &origin, &[1, 2, 3]);
        assert_eq!(state.pending_writes, vec![3, 1, 2, 3]);
        assert_eq!(state.offset, 4);

        state.append_update(&room, &origin, &[0xAA]);
        assert_eq!(state.pending_writes, vec![3, 1, 2, 3, 1, 0xAA]);
        assert_eq!(state.offset, 6);
    }

    #[test]
    fn test_append_update_broadcasts_to_others() {
        let mut state = RoomState::default();
        let (origin, origin_conn) = session_with_conn(1);
        let (other, other_conn) = session_with_conn(2);
        state.subs.push(origin.clone());
        state.subs.push(other.clone());

        let room = RoomName::from("r");
        state.append_update(&room, &origin, &[9, 8]);

        assert!(origin_conn.frames().is_empty());
        let msgs = other_conn.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(
            msgs[0],
            Message::Sync {
                confirmation: 3,
                room: room.clone(),
                payload: vec![9, 8],
            }
        );
    }

    #[test]
    fn test_admit_at_current_offset() {
        let mut state = RoomState::default();
        let (session, _) = session_with_conn(1);

        assert!(!state.admit_or_defer(&session, 0));
        assert_eq!(state.subs.len(), 1);
        assert!(state.pending_subs.is_empty());

        // Subscribing again is a no-op.
        assert!(!state.admit_or_defer(&session, 0));
        assert_eq!(state.subs.len(), 1);
    }

    #[test]
    fn test_defer_at_stale_offset() {
        let mut state = RoomState::default();
        state.offset = 10;
        let (session, _) = session_with_conn(1);

        assert!(state.admit_or_defer(&session, 0));
        assert!(state.subs.is_empty());
        assert_eq!(state.pending_subs.len(), 1);
        assert_eq!(state.pending_subs[0].offset, 0);
    }

    #[test]
    fn test_prune_dead_subs_keeps_order() {
        let mut state = RoomState::default();
        let (alive_a, _conn_a) = session_with_conn(1);
        let dead = Arc::new(Session::new(2, RoomName::from("r")));
        let (alive_b, _conn_b) = session_with_conn(3);
        state.subs = vec![alive_a.clone(), dead, alive_b.clone()];

        state.prune_dead_subs();
        assert_eq!(state.subs.len(), 2);
        assert!(Arc::ptr_eq(&state.subs[0], &alive_a));
        assert!(Arc::ptr_eq(&state.subs[1], &alive_b));
    }
}
