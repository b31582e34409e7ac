//! Coalescing log writer.
//!
//! One background worker per instance owns every room's append-only log
//! file. Rooms with pending work enqueue themselves exactly once (gated by
//! the room's `registered` flag); the worker drains the queue one room at a
//! time:
//!
//! ```text
//! queue ──► sleep(coalesce_delay) ──► lock room ──┬─ replay to pending subs
//!                                                 ├─ append pending writes
//!                                                 └─ unlock
//! ```
//!
//! The delay sits *before* the lock: updates arriving during the sleep land
//! in the same flush, trading end-to-end latency for amortized syscalls. The
//! disk IO happens while the room mutex is held so that no update can race
//! into a half-written log, and so an observer always reads a prefix of the
//! accepted record sequence.
//!
//! The log file is only ever opened for writing here; replay readers open it
//! read-only.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::protocol::{Message, Reader, RoomName};
use crate::room::Room;

const LOG_FILE_MODE: u32 = 0o600;

/// Knobs for the writer worker.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Directory holding one log file per room, named by the room.
    pub data_dir: PathBuf,
    /// Queue capacity for room registrations.
    pub queue_len: usize,
    /// How long to wait after a registration before flushing, so rapid
    /// updates coalesce into one append.
    pub coalesce_delay: Duration,
}

impl WriterConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            queue_len: 1000,
            coalesce_delay: Duration::from_millis(800),
        }
    }

    /// Short delay so tests don't wait out the production coalescing window.
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            queue_len: 64,
            coalesce_delay: Duration::from_millis(25),
        }
    }
}

pub(crate) struct RoomUpdate {
    pub room: Arc<Room>,
    pub name: RoomName,
}

/// Handle to the background writer task.
pub struct LogWriter {
    tx: mpsc::Sender<RoomUpdate>,
    data_dir: PathBuf,
}

impl LogWriter {
    /// Start the worker. It runs for the life of the process.
    pub fn spawn(config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_len);
        let data_dir = config.data_dir.clone();
        tokio::spawn(drain_loop(rx, config));
        Self { tx, data_dir }
    }

    pub fn log_path(&self, name: &RoomName) -> PathBuf {
        self.data_dir.join(name.as_str())
    }

    /// Size of a room's log file; 0 when it does not exist yet.
    pub fn read_room_size(&self, name: &RoomName) -> u32 {
        let path = self.log_path(name);
        match std::fs::metadata(&path) {
            Ok(meta) => meta.len() as u32,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                log::warn!("unexpected error reading stats of {}: {e}", path.display());
                0
            }
        }
    }

    /// Queue a room for draining. Never blocks the caller: on a full queue
    /// the registration is handed to a task that waits for capacity, so a
    /// room whose `registered` flag is set is never lost.
    pub(crate) fn enqueue(&self, room: Arc<Room>, name: RoomName) {
        match self.tx.try_send(RoomUpdate { room, name }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(update)) => {
                log::debug!("writer queue full, deferring registration of {}", update.name);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(update).await.is_err() {
                        log::warn!("writer queue closed while deferring a registration");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(update)) => {
                log::warn!("writer queue closed, dropping registration of {}", update.name);
            }
        }
    }
}

async fn drain_loop(mut rx: mpsc::Receiver<RoomUpdate>, config: WriterConfig) {
    while let Some(update) = rx.recv().await {
        tokio::time::sleep(config.coalesce_delay).await;
        drain_room(&config.data_dir, &update).await;
    }
    log::debug!("writer queue closed, worker exiting");
}

/// One drain pass for one room. Holds the room mutex for the whole pass.
async fn drain_room(dir: &Path, update: &RoomUpdate) {
    let path = dir.join(update.name.as_str());
    let mut state = update.room.state().lock().await;

    let pending = std::mem::take(&mut state.pending_writes);
    let data_available = !pending.is_empty();
    let pending_subs = std::mem::take(&mut state.pending_subs);

    for sub in pending_subs {
        if state.has_session(&sub.session) {
            continue;
        }
        let mut data = match read_log_from(&path, sub.offset).await {
            Ok(data) => data,
            Err(e) => {
                log::warn!("failed to read {} for replay: {e}", path.display());
                Vec::new()
            }
        };
        data.extend_from_slice(&pending);
        let caught_up_offset = u64::from(sub.offset) + data.len() as u64;

        let mut r = Reader::new(&data);
        while let Ok(payload) = r.read_payload() {
            let frame = Message::Sync {
                confirmation: caught_up_offset,
                room: update.name.clone(),
                payload: payload.to_vec(),
            }
            .encode();
            sub.session.send_update(Bytes::from(frame));
        }
        if !r.is_empty() {
            log::warn!(
                "log {} has a truncated trailing record ({} bytes unread)",
                path.display(),
                r.remaining()
            );
        }
        state.subs.push(sub.session);
    }

    // Clear before the append so the next update batch can re-register even
    // if this flush fails.
    state.registered = false;

    if data_available {
        if let Err(e) = append_log(&path, &pending).await {
            log::warn!(
                "failed to append {} bytes to {}: {e}; keeping them buffered for the next pass",
                pending.len(),
                path.display()
            );
            // Restore the snapshot at the head of the buffer.
            let mut restored = pending;
            restored.extend_from_slice(&state.pending_writes);
            state.pending_writes = restored;
        }
    }
}

/// Read the log from `offset` to the end. A missing file reads as empty.
async fn read_log_from(path: &Path, offset: u32) -> io::Result<Vec<u8>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    if offset > 0 {
        file.seek(io::SeekFrom::Start(u64::from(offset))).await?;
    }
    let mut data = Vec::new();
    file.read_to_end(&mut data).await?;
    Ok(data)
}

async fn append_log(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        options.mode(LOG_FILE_MODE);
    }
    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}
