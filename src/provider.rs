//! Document providers: where a room's log lives and what it starts with.
//!
//! The relay core talks to storage through the [`DocumentProvider`]
//! capability trait. The production implementation is backed by the
//! [`LogWriter`]; a purely in-memory variant backs fast tests. Initial
//! content comes from callbacks injected at construction so embedders can
//! source it from an external datastore — the opaque `ctx` handle exists for
//! exactly that (a transaction threaded through unchanged; the core never
//! looks inside it).

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::protocol::{Message, Reader, RoomName};
use crate::room::Room;
use crate::writer::{LogWriter, WriterConfig};

/// Opaque handle threaded through to the initial-content callbacks.
pub type ProviderCtx<'a> = Option<&'a (dyn Any + Send + Sync)>;

/// Callbacks supplying (and optionally writing back) a document's initial
/// content.
pub struct DocumentCallbacks {
    pub get_initial_content: Box<dyn Fn(&str, ProviderCtx<'_>) -> Vec<u8> + Send + Sync>,
    pub set_initial_content: Option<Box<dyn Fn(&str, ProviderCtx<'_>, &[u8]) + Send + Sync>>,
}

impl DocumentCallbacks {
    /// No initial content, no writeback.
    pub fn empty() -> Self {
        Self {
            get_initial_content: Box::new(|_, _| Vec::new()),
            set_initial_content: None,
        }
    }
}

impl Default for DocumentCallbacks {
    fn default() -> Self {
        Self::empty()
    }
}

/// Storage capability consumed by the hub and the room machinery.
pub trait DocumentProvider: Send + Sync {
    /// Materialize the document for `name`. Idempotent: the same instance is
    /// returned for the same name for the life of the process.
    fn get_document(&self, name: &RoomName, ctx: ProviderCtx<'_>) -> Arc<Document>;

    /// Current size of the room's log, which doubles as its offset.
    fn read_room_size(&self, name: &RoomName, ctx: ProviderCtx<'_>) -> u32;

    /// Queue a room for the writer's next drain pass.
    fn register_room_update(&self, room: &Arc<Room>, name: &RoomName, ctx: ProviderCtx<'_>);
}

/// A room's backing document: its name and where its log is written.
pub struct Document {
    name: RoomName,
    write_path: PathBuf,
}

impl Document {
    pub fn name(&self) -> &RoomName {
        &self.name
    }

    pub fn write_path(&self) -> &Path {
        &self.write_path
    }

    /// Truncate-write the initial contents, creating the file with mode
    /// 0600. Updates appended later are strict appends after this.
    pub fn set_initial_content(&self, contents: &[u8]) -> io::Result<()> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.write_path)?;
        io::Write::write_all(&mut file, contents)
    }

    /// Whole-file read; empty when the file does not exist.
    pub fn initial_content_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.write_path).unwrap_or_default()
    }
}

/// Production provider: documents are files in a directory, owned by one
/// background [`LogWriter`].
pub struct DiskDocumentProvider {
    data_dir: PathBuf,
    documents: Mutex<HashMap<RoomName, Arc<Document>>>,
    callbacks: DocumentCallbacks,
    writer: LogWriter,
}

impl DiskDocumentProvider {
    /// Create the provider and start its writer worker. Must be called from
    /// within a tokio runtime.
    pub fn new(config: WriterConfig, callbacks: DocumentCallbacks) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let data_dir = config.data_dir.clone();
        let writer = LogWriter::spawn(config);
        Ok(Self {
            data_dir,
            documents: Mutex::new(HashMap::new()),
            callbacks,
            writer,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl DocumentProvider for DiskDocumentProvider {
    fn get_document(&self, name: &RoomName, ctx: ProviderCtx<'_>) -> Arc<Document> {
        let mut documents = self.documents.lock().unwrap();
        if let Some(doc) = documents.get(name) {
            return doc.clone();
        }
        let doc = Arc::new(Document {
            name: name.clone(),
            write_path: self.data_dir.join(name.as_str()),
        });
        let initial = (self.callbacks.get_initial_content)(name.as_str(), ctx);
        if !initial.is_empty() {
            if let Err(e) = doc.set_initial_content(&initial) {
                log::warn!(
                    "failed to write initial content of {}: {e}",
                    doc.write_path.display()
                );
            }
        }
        documents.insert(name.clone(), doc.clone());
        doc
    }

    fn read_room_size(&self, name: &RoomName, ctx: ProviderCtx<'_>) -> u32 {
        self.get_document(name, ctx);
        self.writer.read_room_size(name)
    }

    fn register_room_update(&self, room: &Arc<Room>, name: &RoomName, ctx: ProviderCtx<'_>) {
        self.get_document(name, ctx);
        self.writer.enqueue(room.clone(), name.clone());
    }
}

/// Test provider keeping each room's log in memory and draining rooms
/// immediately, with the same admit-pending-subscribers semantics as the
/// disk writer but no coalescing delay.
#[derive(Default)]
pub struct MemoryDocumentProvider {
    logs: Arc<Mutex<HashMap<RoomName, Vec<u8>>>>,
    documents: Mutex<HashMap<RoomName, Arc<Document>>>,
    callbacks: DocumentCallbacks,
}

impl MemoryDocumentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callbacks(callbacks: DocumentCallbacks) -> Self {
        Self {
            callbacks,
            ..Self::default()
        }
    }

    /// The room's in-memory log, for assertions.
    pub fn log_contents(&self, name: &RoomName) -> Vec<u8> {
        self.logs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

impl DocumentProvider for MemoryDocumentProvider {
    fn get_document(&self, name: &RoomName, ctx: ProviderCtx<'_>) -> Arc<Document> {
        let mut documents = self.documents.lock().unwrap();
        if let Some(doc) = documents.get(name) {
            return doc.clone();
        }
        let doc = Arc::new(Document {
            name: name.clone(),
            write_path: PathBuf::from(name.as_str()),
        });
        let initial = (self.callbacks.get_initial_content)(name.as_str(), ctx);
        if !initial.is_empty() {
            let mut logs = self.logs.lock().unwrap();
            let buf = logs.entry(name.clone()).or_default();
            if buf.is_empty() {
                buf.extend_from_slice(&initial);
            }
        }
        documents.insert(name.clone(), doc.clone());
        doc
    }

    fn read_room_size(&self, name: &RoomName, ctx: ProviderCtx<'_>) -> u32 {
        self.get_document(name, ctx);
        self.logs
            .lock()
            .unwrap()
            .get(name)
            .map_or(0, |buf| buf.len() as u32)
    }

    fn register_room_update(&self, room: &Arc<Room>, name: &RoomName, _ctx: ProviderCtx<'_>) {
        let logs = self.logs.clone();
        let room = room.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let mut state = room.state().lock().await;
            let pending = std::mem::take(&mut state.pending_writes);
            let pending_subs = std::mem::take(&mut state.pending_subs);

            let mut logs = logs.lock().unwrap();
            let log_buf = logs.entry(name.clone()).or_default();

            for sub in pending_subs {
                if state.has_session(&sub.session) {
                    continue;
                }
                let mut data: Vec<u8> = log_buf
                    .get(sub.offset as usize..)
                    .unwrap_or_default()
                    .to_vec();
                data.extend_from_slice(&pending);
                let caught_up_offset = u64::from(sub.offset) + data.len() as u64;

                let mut r = Reader::new(&data);
                while let Ok(payload) = r.read_payload() {
                    let frame = Message::Sync {
                        confirmation: caught_up_offset,
                        room: name.clone(),
                        payload: payload.to_vec(),
                    }
                    .encode();
                    sub.session.send_update(Bytes::from(frame));
                }
                state.subs.push(sub.session);
            }

            state.registered = false;
            log_buf.extend_from_slice(&pending);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_callbacks(counter: Arc<Mutex<u32>>) -> DocumentCallbacks {
        DocumentCallbacks {
            get_initial_content: Box::new(move |_, _| {
                *counter.lock().unwrap() += 1;
                b"seed".to_vec()
            }),
            set_initial_content: None,
        }
    }

    #[tokio::test]
    async fn test_disk_provider_memoizes_documents() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(0));
        let provider = DiskDocumentProvider::new(
            WriterConfig::for_testing(dir.path()),
            counting_callbacks(calls.clone()),
        )
        .unwrap();

        let name = RoomName::from("doc");
        let first = provider.get_document(&name, None);
        let second = provider.get_document(&name, None);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disk_provider_writes_initial_content() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DiskDocumentProvider::new(
            WriterConfig::for_testing(dir.path()),
            DocumentCallbacks {
                get_initial_content: Box::new(|_, _| vec![1, 0xAB]),
                set_initial_content: None,
            },
        )
        .unwrap();

        let name = RoomName::from("doc");
        let doc = provider.get_document(&name, None);
        assert_eq!(std::fs::read(doc.write_path()).unwrap(), vec![1, 0xAB]);
        assert_eq!(provider.read_room_size(&name, None), 2);
        assert_eq!(doc.initial_content_bytes(), vec![1, 0xAB]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_initial_content_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let provider = DiskDocumentProvider::new(
            WriterConfig::for_testing(dir.path()),
            DocumentCallbacks {
                get_initial_content: Box::new(|_, _| vec![0]),
                set_initial_content: None,
            },
        )
        .unwrap();

        let doc = provider.get_document(&RoomName::from("doc"), None);
        let mode = std::fs::metadata(doc.write_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_disk_provider_size_of_missing_room() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DiskDocumentProvider::new(
            WriterConfig::for_testing(dir.path()),
            DocumentCallbacks::empty(),
        )
        .unwrap();
        assert_eq!(provider.read_room_size(&RoomName::from("empty"), None), 0);
    }

    #[tokio::test]
    async fn test_memory_provider_tracks_size() {
        let provider = MemoryDocumentProvider::with_callbacks(DocumentCallbacks {
            get_initial_content: Box::new(|name, _| {
                if name == "seeded" {
                    vec![2, 7, 8]
                } else {
                    Vec::new()
                }
            }),
            set_initial_content: None,
        });

        assert_eq!(provider.read_room_size(&RoomName::from("seeded"), None), 3);
        assert_eq!(provider.read_room_size(&RoomName::from("fresh"), None), 0);
    }

    #[test]
    fn test_ctx_is_passed_through() {
        let seen = Arc::new(Mutex::new(false));
        let seen_clone = seen.clone();
        let callbacks = DocumentCallbacks {
            get_initial_content: Box::new(move |_, ctx| {
                if let Some(ctx) = ctx {
                    if let Some(tag) = ctx.downcast_ref::<&str>() {
                        *seen_clone.lock().unwrap() = *tag == "tx";
                    }
                }
                Vec::new()
            }),
            set_initial_content: None,
        };
        let provider = MemoryDocumentProvider::with_callbacks(callbacks);

        let tag: &str = "tx";
        provider.get_document(&RoomName::from("doc"), Some(&tag));
        assert!(*seen.lock().unwrap());
    }
}
