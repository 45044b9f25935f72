//! # File Journal Message Store
//!
//! Durable message store backed by one append-only JSON-lines journal per
//! queue (`<data_dir>/<queue>.journal`). The in-memory index answers every
//! read; the journal is only read back when the store is opened.
//!
//! Every mutation is appended to the journal first and applied to the index
//! only once the write succeeded. A failed append is truncated away so the
//! journal never keeps a record the index does not reflect.

use crate::error::BrokerError;
use crate::message::{Message, MessageId, QueueName, Timestamp};
use crate::store::{MessageIndex, MessageStore, QueueIndex};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;

const JOURNAL_EXTENSION: &str = "journal";

/// Compute SHA-256 checksum of a message body
pub fn compute_checksum(data: &Bytes) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// One line of a queue journal
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Enqueued { message: Message, checksum: String },
    Removed { message_id: MessageId },
}

impl JournalRecord {
    fn enqueued(message: &Message) -> Self {
        Self::Enqueued {
            checksum: compute_checksum(&message.body),
            message: message.clone(),
        }
    }

    fn to_line(&self) -> Result<Vec<u8>, BrokerError> {
        let mut line = serde_json::to_vec(self)
            .map_err(|e| BrokerError::storage(format!("Failed to encode journal record: {}", e)))?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Open journal of one queue
struct Journal {
    path: PathBuf,
    /// `None` after a compaction replaced the file but could not reopen it
    file: Option<fs::File>,
    /// Bytes known to be committed
    len: u64,
    /// `removed` records since the last compaction
    removals: usize,
}

impl Journal {
    async fn create(path: PathBuf) -> Result<Self, BrokerError> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error("create journal", &path, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| io_error("inspect journal", &path, e))?
            .len();

        Ok(Self {
            path,
            file: Some(file),
            len,
            removals: 0,
        })
    }

    /// Handle for appending, reattaching to the journal file if needed
    async fn writer(&mut self) -> Result<&mut fs::File, BrokerError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = open_for_append(&self.path).await?;
                info!(path = %self.path.display(), "Reattached journal after compaction");
                file
            }
        };
        Ok(self.file.insert(file))
    }

    /// Append records as one write, rolling the file back if it fails
    async fn append(&mut self, records: &[JournalRecord], fsync: bool) -> Result<(), BrokerError> {
        let mut buffer = Vec::new();
        for record in records {
            buffer.extend_from_slice(&record.to_line()?);
        }

        let committed = self.len;
        let file = self.writer().await?;
        let failure = match write_durably(file, &buffer, fsync).await {
            Ok(()) => None,
            Err(e) => Some((e, file.set_len(committed).await.err())),
        };

        if let Some((e, truncate_error)) = failure {
            if let Some(truncate_error) = truncate_error {
                warn!(
                    path = %self.path.display(),
                    error = %truncate_error,
                    "Failed to roll back partial journal write"
                );
            }
            return Err(io_error("append to journal", &self.path, e));
        }

        self.len += buffer.len() as u64;
        Ok(())
    }

    /// Rewrite the journal so it holds only `live` messages
    async fn compact(&mut self, live: &[Message]) -> Result<(), BrokerError> {
        let temp_path = self.path.with_extension("tmp");

        let mut buffer = Vec::new();
        for message in live {
            buffer.extend_from_slice(&JournalRecord::enqueued(message).to_line()?);
        }

        let mut temp_file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_error("create compacted journal", &temp_path, e))?;
        temp_file
            .write_all(&buffer)
            .await
            .map_err(|e| io_error("write compacted journal", &temp_path, e))?;
        temp_file
            .flush()
            .await
            .map_err(|e| io_error("flush compacted journal", &temp_path, e))?;
        temp_file
            .sync_all()
            .await
            .map_err(|e| io_error("sync compacted journal", &temp_path, e))?;
        drop(temp_file);

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| io_error("replace journal", &self.path, e))?;

        // The old handle refers to the replaced file from here on
        self.file = None;
        self.len = buffer.len() as u64;
        self.removals = 0;
        self.file = Some(open_for_append(&self.path).await?);

        info!(
            path = %self.path.display(),
            live_messages = live.len(),
            "Compacted journal"
        );
        Ok(())
    }
}

async fn open_for_append(path: &Path) -> Result<fs::File, BrokerError> {
    fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_error("reopen journal", path, e))
}

async fn write_durably(file: &mut fs::File, buffer: &[u8], fsync: bool) -> std::io::Result<()> {
    file.write_all(buffer).await?;
    file.flush().await?;
    if fsync {
        file.sync_data().await?;
    }
    Ok(())
}

fn io_error(action: &str, path: &Path, error: std::io::Error) -> BrokerError {
    BrokerError::storage(format!(
        "Failed to {} '{}': {}",
        action,
        path.display(),
        error
    ))
}

/// Messages recovered from a journal
struct Replayed {
    messages: Vec<Message>,
    removals: usize,
    /// Length of the committed prefix; anything after it is a torn write
    committed_len: u64,
}

/// Rebuild the live message set from journal contents
fn replay(path: &Path, contents: &[u8]) -> Result<Replayed, BrokerError> {
    let committed_len = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);

    let mut live: HashMap<MessageId, Message> = HashMap::new();
    let mut removals = 0;

    for (line_number, line) in contents[..committed_len].split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let record: JournalRecord = serde_json::from_slice(line).map_err(|e| {
            BrokerError::storage(format!(
                "Corrupt journal '{}' at line {}: {}",
                path.display(),
                line_number + 1,
                e
            ))
        })?;

        match record {
            JournalRecord::Enqueued { message, checksum } => {
                if compute_checksum(&message.body) != checksum {
                    return Err(BrokerError::storage(format!(
                        "Checksum mismatch in journal '{}' at line {} for message {}",
                        path.display(),
                        line_number + 1,
                        message.id
                    )));
                }
                live.insert(message.id.clone(), message);
            }
            JournalRecord::Removed { message_id } => {
                live.remove(&message_id);
                removals += 1;
            }
        }
    }

    Ok(Replayed {
        messages: live.into_values().collect(),
        removals,
        committed_len: committed_len as u64,
    })
}

/// Durable message store writing one journal per queue
pub struct FileMessageStore {
    data_dir: PathBuf,
    index: MessageIndex,
    journals: DashMap<QueueName, Arc<Mutex<Journal>>>,
    /// Serialises queue creation and deletion
    lifecycle: Mutex<()>,
    compact_threshold: usize,
    fsync: bool,
}

impl FileMessageStore {
    /// Open the store in `data_dir`, replaying every journal found there
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Storage` if the directory cannot be created or a
    /// journal holds a corrupt committed record.
    pub async fn open(
        data_dir: PathBuf,
        compact_threshold: usize,
        fsync: bool,
    ) -> Result<Self, BrokerError> {
        fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| io_error("create data directory", &data_dir, e))?;

        let store = Self {
            data_dir,
            index: MessageIndex::new(),
            journals: DashMap::new(),
            lifecycle: Mutex::new(()),
            compact_threshold: compact_threshold.max(1),
            fsync,
        };

        let mut entries = fs::read_dir(&store.data_dir)
            .await
            .map_err(|e| io_error("read data directory", &store.data_dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("read data directory", &store.data_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
                continue;
            }

            let Some(queue) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| QueueName::new(s.to_string()).ok())
            else {
                warn!(path = %path.display(), "Skipping journal with invalid queue name");
                continue;
            };

            store.load_queue(queue, path).await?;
        }

        info!(
            data_dir = %store.data_dir.display(),
            queues = store.journals.len(),
            "Opened file message store"
        );
        Ok(store)
    }

    async fn load_queue(&self, queue: QueueName, path: PathBuf) -> Result<(), BrokerError> {
        let contents = fs::read(&path)
            .await
            .map_err(|e| io_error("read journal", &path, e))?;
        let replayed = replay(&path, &contents)?;

        if replayed.committed_len < contents.len() as u64 {
            warn!(
                queue = %queue,
                path = %path.display(),
                discarded_bytes = contents.len() as u64 - replayed.committed_len,
                "Discarding torn record at end of journal"
            );
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| io_error("open journal", &path, e))?;
            file.set_len(replayed.committed_len)
                .await
                .map_err(|e| io_error("truncate journal", &path, e))?;
        }

        let mut journal = Journal::create(path).await?;
        journal.removals = replayed.removals;

        debug!(
            queue = %queue,
            messages = replayed.messages.len(),
            "Replayed journal"
        );
        self.index.restore_queue(queue.clone(), replayed.messages);

        if journal.removals >= self.compact_threshold {
            let queue_index = self.index.queue(&queue)?;
            journal.compact(&queue_index.snapshot()).await?;
        }

        self.journals.insert(queue, Arc::new(Mutex::new(journal)));
        Ok(())
    }

    fn journal_path(&self, queue: &QueueName) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", queue.as_str(), JOURNAL_EXTENSION))
    }

    fn journal(&self, queue: &QueueName) -> Result<Arc<Mutex<Journal>>, BrokerError> {
        self.journals
            .get(queue)
            .map(|j| Arc::clone(j.value()))
            .ok_or_else(|| BrokerError::QueueNotFound {
                queue_name: queue.to_string(),
            })
    }

    /// Lock the journal of `queue`, failing if the queue was deleted while waiting
    async fn lock_journal(&self, queue: &QueueName) -> Result<OwnedMutexGuard<Journal>, BrokerError> {
        let journal = self.journal(queue)?;
        let guard = Arc::clone(&journal).lock_owned().await;

        let still_registered = self
            .journals
            .get(queue)
            .is_some_and(|current| Arc::ptr_eq(current.value(), &journal));
        if !still_registered {
            return Err(BrokerError::QueueNotFound {
                queue_name: queue.to_string(),
            });
        }
        Ok(guard)
    }

    /// Journal and apply the removal of `ids` that are still present
    async fn remove_all(
        &self,
        queue: &QueueName,
        queue_index: &QueueIndex,
        ids: Vec<MessageId>,
    ) -> Result<Vec<MessageId>, BrokerError> {
        let mut journal = self.lock_journal(queue).await?;

        // Re-check under the journal lock; a concurrent remove may have won
        let present: Vec<MessageId> = ids
            .into_iter()
            .filter(|id| queue_index.contains(id))
            .collect();
        if present.is_empty() {
            return Ok(present);
        }

        let records: Vec<JournalRecord> = present
            .iter()
            .map(|id| JournalRecord::Removed {
                message_id: id.clone(),
            })
            .collect();
        journal.append(&records, self.fsync).await?;

        for id in &present {
            queue_index.remove(id);
        }
        journal.removals += present.len();

        if journal.removals >= self.compact_threshold {
            // Either journal on disk is complete; a handle left detached is
            // reopened by the next append
            if let Err(e) = journal.compact(&queue_index.snapshot()).await {
                warn!(queue = %queue, error = %e, "Journal compaction failed");
            }
        }

        Ok(present)
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn create_queue(&self, queue: &QueueName) -> Result<bool, BrokerError> {
        let _guard = self.lifecycle.lock().await;
        if self.index.contains_queue(queue) {
            return Ok(false);
        }

        let journal = Journal::create(self.journal_path(queue)).await?;
        self.journals
            .insert(queue.clone(), Arc::new(Mutex::new(journal)));
        self.index.create_queue(queue);

        info!(queue = %queue, "Created queue journal");
        Ok(true)
    }

    async fn delete_queue(&self, queue: &QueueName) -> Result<bool, BrokerError> {
        let _guard = self.lifecycle.lock().await;
        let Ok(journal) = self.journal(queue) else {
            return Ok(false);
        };

        // Wait for in-progress appends before removing the file
        let journal = journal.lock().await;
        match fs::remove_file(&journal.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("remove journal", &journal.path, e)),
        }

        self.journals.remove(queue);
        self.index.drop_queue(queue);

        info!(queue = %queue, "Deleted queue journal");
        Ok(true)
    }

    fn contains_queue(&self, queue: &QueueName) -> bool {
        self.index.contains_queue(queue)
    }

    fn list_queues(&self) -> Vec<QueueName> {
        self.index.list_queues()
    }

    async fn enqueue(&self, queue: &QueueName, body: Bytes) -> Result<MessageId, BrokerError> {
        let queue_index = self.index.queue(queue)?;
        let mut journal = self.lock_journal(queue).await?;

        let message = queue_index.allocate(body);
        journal
            .append(&[JournalRecord::enqueued(&message)], self.fsync)
            .await?;

        let message_id = message.id.clone();
        queue_index.insert(message);

        debug!(queue = %queue, message_id = %message_id, "Journaled message");
        Ok(message_id)
    }

    fn get(
        &self,
        queue: &QueueName,
        message_id: &MessageId,
    ) -> Result<Option<Message>, BrokerError> {
        Ok(self.index.queue(queue)?.get(message_id))
    }

    async fn remove(&self, queue: &QueueName, message_id: &MessageId) -> Result<bool, BrokerError> {
        let queue_index = self.index.queue(queue)?;
        if !queue_index.contains(message_id) {
            return Ok(false);
        }

        let removed = self
            .remove_all(queue, &queue_index, vec![message_id.clone()])
            .await?;
        Ok(!removed.is_empty())
    }

    fn count(&self, queue: &QueueName) -> Result<usize, BrokerError> {
        Ok(self.index.queue(queue)?.len())
    }

    fn oldest(
        &self,
        queue: &QueueName,
        limit: usize,
        exclude: &dyn Fn(&MessageId) -> bool,
    ) -> Result<Vec<Message>, BrokerError> {
        Ok(self.index.queue(queue)?.oldest(limit, exclude))
    }

    async fn purge_before(
        &self,
        queue: &QueueName,
        cutoff: &Timestamp,
    ) -> Result<Vec<MessageId>, BrokerError> {
        let queue_index = self.index.queue(queue)?;
        let expired = queue_index.enqueued_before(cutoff);
        if expired.is_empty() {
            return Ok(expired);
        }

        self.remove_all(queue, &queue_index, expired).await
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}
