//! Shared offline queue with write-through JSON persistence.
//!
//! The file also records the highest sequence number ever handed out, so numbering
//! resumes past it after a restart even when the queue itself was empty.

use std::path::{Path, PathBuf};

use lanchat_core::{OfflineQueue, QueueSnapshot, QueuedMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::OutboxError;

/// On-disk form of the outbox.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredOutbox {
    #[serde(default)]
    last_sequence: u64,
    #[serde(default)]
    queue: QueueSnapshot,
}

#[derive(Debug, Default)]
struct State {
    queue: OfflineQueue,
    /// Highest sequence seen by `note_sequence` or `enqueue`; 0 if none.
    last_sequence: u64,
}

impl State {
    fn stored(&self) -> StoredOutbox {
        StoredOutbox {
            last_sequence: self.last_sequence,
            queue: self.queue.to_snapshot(),
        }
    }
}

/// The node's offline queue. One lock guards the state; every mutation is written to
/// `path` (when set) before the lock is released. Writes run on the blocking pool.
#[derive(Debug)]
pub struct Outbox {
    state: Mutex<State>,
    path: Option<PathBuf>,
}

impl Outbox {
    /// Queue that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(State::default()),
            path: None,
        }
    }

    /// Restore from `path`. A missing file gives an empty queue; an unreadable one is
    /// moved aside to `<path>.bad` so it is not overwritten. Called once at startup.
    pub fn load(path: PathBuf) -> Self {
        let state = match read_stored(&path) {
            Ok(Some(stored)) => {
                let queue = OfflineQueue::from_snapshot(stored.queue);
                if !queue.is_empty() {
                    log::info!(
                        "restored {} queued message(s) for {} peer(s) from {}",
                        queue.len(),
                        queue.destinations().len(),
                        path.display()
                    );
                }
                let last_sequence = stored.last_sequence.max(queue.max_sequence().unwrap_or(0));
                State { queue, last_sequence }
            }
            Ok(None) => State::default(),
            Err(e) => {
                log::warn!("discarding offline queue {}: {e}", path.display());
                let aside = path.with_extension("json.bad");
                if let Err(e) = std::fs::rename(&path, &aside) {
                    log::warn!("cannot move {} aside: {e}", path.display());
                }
                State::default()
            }
        };
        Self {
            state: Mutex::new(state),
            path: Some(path),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Queue `msg` and persist. Returns false if that `(destination, sequence)` was already queued.
    pub async fn enqueue(&self, msg: QueuedMessage) -> bool {
        let mut state = self.state.lock().await;
        let sequence = msg.sequence;
        let added = state.queue.enqueue(msg);
        if added {
            state.last_sequence = state.last_sequence.max(sequence);
            self.persist(&state).await;
        }
        added
    }

    /// Remove one item after a successful delivery and persist.
    pub async fn remove(&self, destination: &str, sequence: u64) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.queue.remove(destination, sequence).is_some();
        if removed {
            self.persist(&state).await;
        }
        removed
    }

    /// Record that `sequence` was handed out. Persisted when it raises the high-water mark.
    pub async fn note_sequence(&self, sequence: u64) {
        let mut state = self.state.lock().await;
        if sequence > state.last_sequence {
            state.last_sequence = sequence;
            self.persist(&state).await;
        }
    }

    /// Highest sequence ever noted or queued, if any.
    pub async fn last_sequence(&self) -> Option<u64> {
        let state = self.state.lock().await;
        Some(state.last_sequence).filter(|&s| s > 0)
    }

    pub async fn begin_drain(&self, destination: &str) -> Option<Vec<QueuedMessage>> {
        self.state.lock().await.queue.begin_drain(destination)
    }

    pub async fn finish_drain(&self, destination: &str) {
        self.state.lock().await.queue.finish_drain(destination);
    }

    pub async fn is_draining(&self, destination: &str) -> bool {
        self.state.lock().await.queue.is_draining(destination)
    }

    pub async fn pending(&self, destination: &str) -> Vec<QueuedMessage> {
        self.state.lock().await.queue.pending(destination)
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        self.state.lock().await.queue.to_snapshot()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.queue.is_empty()
    }

    /// Write the current state out (no-op for an in-memory outbox).
    pub async fn flush(&self) -> Result<(), OutboxError> {
        let state = self.state.lock().await;
        match &self.path {
            Some(path) => write_stored(path.clone(), &state.stored()).await,
            None => Ok(()),
        }
    }

    async fn persist(&self, state: &State) {
        if let Some(path) = &self.path {
            if let Err(e) = write_stored(path.clone(), &state.stored()).await {
                log::error!("cannot persist offline queue to {}: {e}", path.display());
            }
        }
    }
}

fn read_stored(path: &Path) -> Result<Option<StoredOutbox>, OutboxError> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&data)?))
}

async fn write_stored(path: PathBuf, stored: &StoredOutbox) -> Result<(), OutboxError> {
    let json = serde_json::to_string_pretty(stored)?;
    tokio::task::spawn_blocking(move || write_atomically(&path, &json))
        .await
        .map_err(std::io::Error::other)??;
    Ok(())
}

/// Write via a temp file and rename so a crash never leaves a half-written file.
fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(dest: &str, seq: u64, content: &str) -> QueuedMessage {
        QueuedMessage {
            destination: dest.to_string(),
            content: content.to_string(),
            sequence: seq,
        }
    }

    #[tokio::test]
    async fn survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/queue.json");

        let outbox = Outbox::load(path.clone());
        assert!(outbox.is_empty().await);
        assert!(outbox.enqueue(msg("10.0.0.2", 2, "b")).await);
        assert!(outbox.enqueue(msg("10.0.0.2", 1, "a")).await);
        assert!(!outbox.enqueue(msg("10.0.0.2", 1, "a")).await);
        drop(outbox);

        let reopened = Outbox::load(path.clone());
        let pending = reopened.pending("10.0.0.2").await;
        assert_eq!(pending.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(reopened.last_sequence().await, Some(2));

        assert!(reopened.remove("10.0.0.2", 1).await);
        drop(reopened);
        assert_eq!(Outbox::load(path).len().await, 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{not json").unwrap();

        let outbox = Outbox::load(path.clone());
        assert!(outbox.is_empty().await);
        assert!(dir.path().join("queue.json.bad").exists());

        outbox.enqueue(msg("10.0.0.2", 1, "a")).await;
        let on_disk: StoredOutbox =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.queue["10.0.0.2"].len(), 1);
        assert_eq!(on_disk.last_sequence, 1);
    }

    #[tokio::test]
    async fn in_memory_flush_is_noop() {
        let outbox = Outbox::in_memory();
        outbox.enqueue(msg("10.0.0.2", 1, "a")).await;
        assert!(outbox.flush().await.is_ok());
        assert!(outbox.path().is_none());
    }

    #[tokio::test]
    async fn sequence_high_water_survives_restart_with_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let outbox = Outbox::load(path.clone());
        assert_eq!(outbox.last_sequence().await, None);
        outbox.note_sequence(1).await;
        outbox.note_sequence(2).await;
        outbox.note_sequence(1).await;
        assert!(outbox.is_empty().await);
        drop(outbox);

        let reopened = Outbox::load(path);
        assert!(reopened.is_empty().await);
        assert_eq!(reopened.last_sequence().await, Some(2));
    }

    #[tokio::test]
    async fn delivered_items_still_count_toward_high_water() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let outbox = Outbox::load(path.clone());
        outbox.enqueue(msg("10.0.0.2", 7, "a")).await;
        outbox.remove("10.0.0.2", 7).await;
        drop(outbox);
        assert_eq!(Outbox::load(path).last_sequence().await, Some(7));
    }
}
