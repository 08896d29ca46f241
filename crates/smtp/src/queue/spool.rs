/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    collections::VecDeque,
    fmt,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use common::config::queue::{QueueBackend, QueueConfig};
use parking_lot::Mutex;
use uuid::Uuid;

use super::RelaySession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    Io(String),
    Corrupt(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Io(err) => write!(f, "queue I/O error: {err}"),
            QueueError::Corrupt(err) => write!(f, "corrupt queue item: {err}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub seq: u64,
    pub inner: RelaySession,
}

/// Durable FIFO of relay sessions. Enqueue and dequeue are atomic;
/// `snapshot` is a consistent, non-destructive read. FIFO order survives
/// process restarts.
pub trait QueueStore: Send + Sync {
    fn enqueue(&self, item: RelaySession) -> Result<u64, QueueError>;
    fn dequeue(&self) -> Result<Option<QueuedItem>, QueueError>;
    fn peek(&self) -> Result<Option<QueuedItem>, QueueError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn snapshot(&self) -> Result<Vec<QueuedItem>, QueueError>;
    fn remove_by_index(&self, index: usize) -> Result<Option<QueuedItem>, QueueError>;
    fn remove_by_indices(&self, indices: &[usize]) -> Result<Vec<QueuedItem>, QueueError>;
    fn remove_by_uid(&self, uid: Uuid) -> Result<Option<QueuedItem>, QueueError>;
    fn remove_by_uids(&self, uids: &[Uuid]) -> Result<Vec<QueuedItem>, QueueError>;
    fn clear(&self) -> Result<(), QueueError>;
}

/// On-disk backend: one bincode blob per item, zero-padded sequence numbers
/// as file names so a directory scan restores FIFO order.
pub struct FsQueue {
    path: PathBuf,
    state: Mutex<FsQueueState>,
}

struct FsQueueState {
    index: VecDeque<(u64, Uuid)>,
    next_seq: u64,
}

impl FsQueue {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        fs::create_dir_all(path).map_err(|err| QueueError::Io(err.to_string()))?;

        let mut entries: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(path).map_err(|err| QueueError::Io(err.to_string()))? {
            let entry = entry.map_err(|err| QueueError::Io(err.to_string()))?;
            let file_path = entry.path();
            let seq = file_path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".msg"))
                .and_then(|seq| seq.parse::<u64>().ok());
            if let Some(seq) = seq {
                entries.push((seq, file_path));
            }
        }
        entries.sort();

        let mut index = VecDeque::with_capacity(entries.len());
        let mut next_seq = 0;
        for (seq, file_path) in entries {
            match read_item(&file_path) {
                Ok(item) => {
                    index.push_back((seq, item.uid()));
                    next_seq = next_seq.max(seq + 1);
                }
                Err(err) => {
                    tracing::warn!(file = ?file_path, %err, "discarding corrupt queue item");
                    let _ = fs::remove_file(&file_path);
                }
            }
        }

        Ok(FsQueue {
            path: path.to_path_buf(),
            state: Mutex::new(FsQueueState { index, next_seq }),
        })
    }

    fn file_path(&self, seq: u64) -> PathBuf {
        self.path.join(format!("{seq:020}.msg"))
    }

    fn take_at(
        &self,
        state: &mut FsQueueState,
        position: usize,
    ) -> Result<Option<QueuedItem>, QueueError> {
        let Some((seq, _)) = state.index.remove(position) else {
            return Ok(None);
        };
        let file_path = self.file_path(seq);
        let item = read_item(&file_path);
        let _ = fs::remove_file(&file_path);
        match item {
            Ok(inner) => Ok(Some(QueuedItem { seq, inner })),
            Err(err) => {
                tracing::warn!(file = ?file_path, %err, "discarding corrupt queue item");
                Ok(None)
            }
        }
    }
}

fn read_item(path: &Path) -> Result<RelaySession, QueueError> {
    let bytes = fs::read(path).map_err(|err| QueueError::Io(err.to_string()))?;
    bincode::deserialize(&bytes).map_err(|err| QueueError::Corrupt(err.to_string()))
}

impl QueueStore for FsQueue {
    fn enqueue(&self, item: RelaySession) -> Result<u64, QueueError> {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let bytes =
            bincode::serialize(&item).map_err(|err| QueueError::Corrupt(err.to_string()))?;
        let file_path = self.file_path(seq);
        let tmp_path = self.path.join(format!("{seq:020}.tmp"));
        fs::write(&tmp_path, &bytes).map_err(|err| QueueError::Io(err.to_string()))?;
        fs::rename(&tmp_path, &file_path).map_err(|err| QueueError::Io(err.to_string()))?;

        state.index.push_back((seq, item.uid()));
        Ok(seq)
    }

    fn dequeue(&self) -> Result<Option<QueuedItem>, QueueError> {
        let mut state = self.state.lock();
        // A corrupt head is discarded and the scan continues; one bad item
        // never halts the consumer.
        while !state.index.is_empty() {
            if let Some(item) = self.take_at(&mut state, 0)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn peek(&self) -> Result<Option<QueuedItem>, QueueError> {
        let state = self.state.lock();
        for (seq, _) in state.index.iter() {
            match read_item(&self.file_path(*seq)) {
                Ok(inner) => return Ok(Some(QueuedItem { seq: *seq, inner })),
                Err(_) => continue,
            }
        }
        Ok(None)
    }

    fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    fn snapshot(&self) -> Result<Vec<QueuedItem>, QueueError> {
        let state = self.state.lock();
        let mut items = Vec::with_capacity(state.index.len());
        for (seq, _) in state.index.iter() {
            if let Ok(inner) = read_item(&self.file_path(*seq)) {
                items.push(QueuedItem { seq: *seq, inner });
            }
        }
        Ok(items)
    }

    fn remove_by_index(&self, index: usize) -> Result<Option<QueuedItem>, QueueError> {
        let mut state = self.state.lock();
        if index >= state.index.len() {
            return Ok(None);
        }
        self.take_at(&mut state, index)
    }

    fn remove_by_indices(&self, indices: &[usize]) -> Result<Vec<QueuedItem>, QueueError> {
        let mut state = self.state.lock();
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut removed = Vec::new();
        for index in sorted.into_iter().rev() {
            if index < state.index.len() {
                if let Some(item) = self.take_at(&mut state, index)? {
                    removed.push(item);
                }
            }
        }
        removed.reverse();
        Ok(removed)
    }

    fn remove_by_uid(&self, uid: Uuid) -> Result<Option<QueuedItem>, QueueError> {
        let mut state = self.state.lock();
        match state.index.iter().position(|(_, item_uid)| *item_uid == uid) {
            Some(position) => self.take_at(&mut state, position),
            None => Ok(None),
        }
    }

    fn remove_by_uids(&self, uids: &[Uuid]) -> Result<Vec<QueuedItem>, QueueError> {
        let mut removed = Vec::new();
        for uid in uids {
            if let Some(item) = self.remove_by_uid(*uid)? {
                removed.push(item);
            }
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        for (seq, _) in std::mem::take(&mut state.index) {
            let _ = fs::remove_file(self.file_path(seq));
        }
        Ok(())
    }
}

/// In-memory backend for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

#[derive(Default)]
struct MemoryQueueState {
    items: VecDeque<QueuedItem>,
    next_seq: u64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueue {
    fn enqueue(&self, item: RelaySession) -> Result<u64, QueueError> {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.items.push_back(QueuedItem { seq, inner: item });
        Ok(seq)
    }

    fn dequeue(&self) -> Result<Option<QueuedItem>, QueueError> {
        Ok(self.state.lock().items.pop_front())
    }

    fn peek(&self) -> Result<Option<QueuedItem>, QueueError> {
        Ok(self.state.lock().items.front().cloned())
    }

    fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    fn snapshot(&self) -> Result<Vec<QueuedItem>, QueueError> {
        Ok(self.state.lock().items.iter().cloned().collect())
    }

    fn remove_by_index(&self, index: usize) -> Result<Option<QueuedItem>, QueueError> {
        Ok(self.state.lock().items.remove(index))
    }

    fn remove_by_indices(&self, indices: &[usize]) -> Result<Vec<QueuedItem>, QueueError> {
        let mut state = self.state.lock();
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut removed = Vec::new();
        for index in sorted.into_iter().rev() {
            if let Some(item) = state.items.remove(index) {
                removed.push(item);
            }
        }
        removed.reverse();
        Ok(removed)
    }

    fn remove_by_uid(&self, uid: Uuid) -> Result<Option<QueuedItem>, QueueError> {
        let mut state = self.state.lock();
        match state.items.iter().position(|item| item.inner.uid() == uid) {
            Some(position) => Ok(state.items.remove(position)),
            None => Ok(None),
        }
    }

    fn remove_by_uids(&self, uids: &[Uuid]) -> Result<Vec<QueuedItem>, QueueError> {
        let mut removed = Vec::new();
        for uid in uids {
            if let Some(item) = self.remove_by_uid(*uid)? {
                removed.push(item);
            }
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<(), QueueError> {
        self.state.lock().items.clear();
        Ok(())
    }
}

type Factory = dyn Fn(&QueueConfig) -> Result<Arc<dyn QueueStore>, QueueError> + Send + Sync;

static QUEUE_INSTANCE: Mutex<Option<Arc<dyn QueueStore>>> = Mutex::new(None);
static QUEUE_FACTORY: Mutex<Option<Arc<Factory>>> = Mutex::new(None);

/// Returns the process-wide queue, opening it through the installed factory
/// (or the configured default backend) on first use.
pub fn queue(config: &QueueConfig) -> Result<Arc<dyn QueueStore>, QueueError> {
    if let Some(store) = QUEUE_INSTANCE.lock().as_ref() {
        return Ok(store.clone());
    }
    let factory = QUEUE_FACTORY.lock().clone();
    let store = match factory {
        Some(factory) => factory(config)?,
        None => match config.backend {
            QueueBackend::Disk => Arc::new(FsQueue::open(&config.path)?) as Arc<dyn QueueStore>,
            QueueBackend::Memory => Arc::new(MemoryQueue::new()),
        },
    };
    *QUEUE_INSTANCE.lock() = Some(store.clone());
    Ok(store)
}

/// Installs a backend factory; the next `queue()` call uses it. Tests use
/// this to run against the in-memory backend.
pub fn install_factory(
    factory: impl Fn(&QueueConfig) -> Result<Arc<dyn QueueStore>, QueueError> + Send + Sync + 'static,
) {
    *QUEUE_FACTORY.lock() = Some(Arc::new(factory));
    *QUEUE_INSTANCE.lock() = None;
}

/// Drops the open queue and any installed factory. Test isolation hook.
pub fn reset() {
    *QUEUE_FACTORY.lock() = None;
    *QUEUE_INSTANCE.lock() = None;
}
