//! # syncroom — room-based real-time update relay
//!
//! Synchronizes opaque binary update streams across clients grouped into
//! named rooms. Each room is one collaboratively edited document: the relay
//! accepts updates from any subscribed client, appends them to a per-room
//! append-only log, fans them out to every other subscriber, and replays the
//! log to late subscribers before they go live. Update payloads are never
//! parsed; they are assumed to be CRDT deltas that compose at the client.
//!
//! ```text
//! Client A ──┐                        ┌── Client B
//!            ▼                        ▼
//!        ┌────────┐  frames   ┌──────────────┐
//!        │ Server │ ────────► │     Hub      │
//!        └────────┘           │ rooms        │
//!                             │ sessions     │
//!                             └──────┬───────┘
//!                                    │ pending writes / pending subs
//!                                    ▼
//!                             ┌──────────────┐   append    ┌───────────┐
//!                             │  LogWriter   │ ──────────► │ <dir>/<r> │
//!                             │ (coalescing) │ ◄────────── │ one file  │
//!                             └──────────────┘   replay    │ per room  │
//!                                                          └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — varint framing codec and the six wire message kinds
//! - [`confirm`] — per-direction acknowledgement trackers
//! - [`provider`] — document storage capability (disk and in-memory)
//! - [`writer`] — coalescing background worker owning the log files
//! - [`room`] / [`session`] / [`hub`] — the in-memory relay core
//! - [`server`] — websocket transport and keep-alive
//! - [`client`] — websocket client with confirmation bookkeeping

pub mod client;
pub mod confirm;
pub mod hub;
pub mod protocol;
pub mod provider;
pub mod room;
pub mod server;
pub mod session;
pub mod writer;

pub use client::{ClientError, SyncClient};
pub use confirm::{ClientConfirmation, ServerConfirmation};
pub use hub::{Hub, HubError};
pub use protocol::{Message, MessageKind, ProtocolError, Reader, RoomName, SubEntry};
pub use provider::{
    DiskDocumentProvider, Document, DocumentCallbacks, DocumentProvider,
    MemoryDocumentProvider, ProviderCtx,
};
pub use room::{PendingSub, Room};
pub use server::{ServerConfig, SyncServer};
pub use session::{Connection, Session};
pub use writer::{LogWriter, WriterConfig};

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use crate::protocol::{Message, Reader};
    use crate::session::Connection;

    /// Connection double that records every frame written to it.
    pub struct TestConn {
        frames: Mutex<Vec<Bytes>>,
    }

    impl TestConn {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }

        pub fn frames(&self) -> Vec<Bytes> {
            self.frames.lock().unwrap().clone()
        }

        /// All recorded frames, decoded.
        pub fn messages(&self) -> Vec<Message> {
            let mut messages = Vec::new();
            for frame in self.frames() {
                let mut r = Reader::new(&frame);
                while !r.is_empty() {
                    messages.push(Message::decode(&mut r).expect("test frame decodes"));
                }
            }
            messages
        }
    }

    impl Connection for TestConn {
        fn write(&self, frame: Bytes) {
            self.frames.lock().unwrap().push(frame);
        }
    }
}
