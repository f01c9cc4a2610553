//! Per-device cursor persistence.
//!
//! A cursor is the highest `seq_num` a device has durably applied for a
//! chat. Cursors only move forward: [`CursorStore::advance`] ignores any
//! value not strictly greater than the stored one. A write has reached disk
//! by the time `advance` returns, so a message counts as delivered only once
//! its cursor survives a crash.
//!
//! "No entry" and "entry at zero" differ: a chat without an entry has never
//! been subscribed on this device and is subscribed fresh; a chat with an
//! entry resumes from it.

use async_trait::async_trait;
use seq_types::{ChatId, DeviceId, SeqNum};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Cursor store errors.
#[derive(Debug, Error)]
pub enum CursorStoreError {
    /// Reading or writing the cursor file failed.
    #[error("cursor file {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The cursor file is not valid JSON.
    #[error("corrupt cursor file {path}: {source}")]
    Corrupt {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The device id file is unreadable.
    #[error("invalid device id in {path}")]
    InvalidDeviceId {
        /// File involved.
        path: PathBuf,
    },
}

/// Durable `chat_id -> last_seq_num` map owned by one device.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Stored cursor, or `None` if this device never subscribed to the chat.
    async fn lookup(&self, chat_id: &ChatId) -> Result<Option<SeqNum>, CursorStoreError>;

    /// Move the cursor to `seq` if that is strictly greater than the stored
    /// value. Returns whether anything changed.
    async fn advance(&self, chat_id: &ChatId, seq: SeqNum) -> Result<bool, CursorStoreError>;

    /// Create an entry at `seq` if none exists. Returns the stored value.
    async fn ensure(&self, chat_id: &ChatId, seq: SeqNum) -> Result<SeqNum, CursorStoreError>;

    /// All stored cursors.
    async fn entries(&self) -> Result<BTreeMap<ChatId, SeqNum>, CursorStoreError>;

    /// Stored cursor, defaulting to zero.
    async fn get(&self, chat_id: &ChatId) -> Result<SeqNum, CursorStoreError> {
        Ok(self.lookup(chat_id).await?.unwrap_or_default())
    }
}

/// Volatile cursor store.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<BTreeMap<ChatId, SeqNum>>,
}

impl MemoryCursorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn lookup(&self, chat_id: &ChatId) -> Result<Option<SeqNum>, CursorStoreError> {
        Ok(self.cursors.lock().await.get(chat_id).copied())
    }

    async fn advance(&self, chat_id: &ChatId, seq: SeqNum) -> Result<bool, CursorStoreError> {
        let mut cursors = self.cursors.lock().await;
        Ok(raise(&mut cursors, chat_id, seq))
    }

    async fn ensure(&self, chat_id: &ChatId, seq: SeqNum) -> Result<SeqNum, CursorStoreError> {
        Ok(*self.cursors.lock().await.entry(*chat_id).or_insert(seq))
    }

    async fn entries(&self) -> Result<BTreeMap<ChatId, SeqNum>, CursorStoreError> {
        Ok(self.cursors.lock().await.clone())
    }
}

fn raise(cursors: &mut BTreeMap<ChatId, SeqNum>, chat_id: &ChatId, seq: SeqNum) -> bool {
    match cursors.get(chat_id) {
        Some(current) if *current >= seq => false,
        _ => {
            cursors.insert(*chat_id, seq);
            true
        }
    }
}

/// Cursor store backed by one JSON file per device.
///
/// The whole map is rewritten on every change: written to a temporary file,
/// synced, then renamed over the previous version.
#[derive(Debug)]
pub struct FileCursorStore {
    path: PathBuf,
    cursors: Mutex<BTreeMap<ChatId, SeqNum>>,
}

impl FileCursorStore {
    /// Open (or create) the cursor file of `device_id` under `dir`.
    pub async fn open(dir: &Path, device_id: &DeviceId) -> Result<Self, CursorStoreError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| io_error(dir, source))?;
        let path = dir.join(format!("cursors-{device_id}.json"));

        let cursors = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| CursorStoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(io_error(&path, source)),
        };

        tracing::debug!(path = %path.display(), chats = cursors.len(), "cursor store opened");
        Ok(Self {
            path,
            cursors: Mutex::new(cursors),
        })
    }

    /// Read the device id stored in `dir`, creating one on first use.
    pub async fn load_or_create_device_id(dir: &Path) -> Result<DeviceId, CursorStoreError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| io_error(dir, source))?;
        let path = dir.join("device-id");

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents
                .trim()
                .parse()
                .map_err(|_| CursorStoreError::InvalidDeviceId { path }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let id = DeviceId::random().map_err(|_| CursorStoreError::InvalidDeviceId { path: path.clone() })?;
                write_durably(&path, id.to_string().as_bytes()).await?;
                tracing::info!(device = %id, "created device id");
                Ok(id)
            }
            Err(source) => Err(io_error(&path, source)),
        }
    }

    /// Path of the cursor file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, cursors: &BTreeMap<ChatId, SeqNum>) -> Result<(), CursorStoreError> {
        let contents = serde_json::to_vec_pretty(cursors).map_err(|source| CursorStoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        write_durably(&self.path, &contents).await
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn lookup(&self, chat_id: &ChatId) -> Result<Option<SeqNum>, CursorStoreError> {
        Ok(self.cursors.lock().await.get(chat_id).copied())
    }

    async fn advance(&self, chat_id: &ChatId, seq: SeqNum) -> Result<bool, CursorStoreError> {
        let mut cursors = self.cursors.lock().await;
        let mut next = cursors.clone();
        if !raise(&mut next, chat_id, seq) {
            return Ok(false);
        }
        // Memory follows disk, never the other way round.
        self.persist(&next).await?;
        *cursors = next;
        tracing::trace!(chat_id = %chat_id, seq = %seq, "cursor advanced");
        Ok(true)
    }

    async fn ensure(&self, chat_id: &ChatId, seq: SeqNum) -> Result<SeqNum, CursorStoreError> {
        let mut cursors = self.cursors.lock().await;
        if let Some(current) = cursors.get(chat_id) {
            return Ok(*current);
        }
        let mut next = cursors.clone();
        next.insert(*chat_id, seq);
        self.persist(&next).await?;
        *cursors = next;
        Ok(seq)
    }

    async fn entries(&self) -> Result<BTreeMap<ChatId, SeqNum>, CursorStoreError> {
        Ok(self.cursors.lock().await.clone())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CursorStoreError {
    CursorStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write via temp file + fsync + rename so a crash leaves the old or the new
/// contents, never a torn file.
async fn write_durably(path: &Path, contents: &[u8]) -> Result<(), CursorStoreError> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|source| io_error(&tmp, source))?;
    file.write_all(contents)
        .await
        .map_err(|source| io_error(&tmp, source))?;
    file.sync_all().await.map_err(|source| io_error(&tmp, source))?;
    drop(file);
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| io_error(path, source))
}
