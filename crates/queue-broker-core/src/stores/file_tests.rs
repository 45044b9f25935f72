//! Tests for the file journal message store.

use super::*;
use std::io::Write;
use tempfile::TempDir;

fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

async fn open(dir: &TempDir) -> FileMessageStore {
    FileMessageStore::open(dir.path().to_path_buf(), 1000, false)
        .await
        .unwrap()
}

fn journal_lines(dir: &TempDir, name: &str) -> Vec<String> {
    let contents = std::fs::read_to_string(dir.path().join(format!("{}.journal", name))).unwrap();
    contents.lines().map(str::to_string).collect()
}

fn append_raw(dir: &TempDir, name: &str, bytes: &[u8]) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(dir.path().join(format!("{}.journal", name)))
        .unwrap();
    file.write_all(bytes).unwrap();
}

#[test]
fn test_compute_checksum() {
    let checksum = compute_checksum(&Bytes::from_static(b"hello"));
    assert_eq!(
        checksum,
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
}

#[test]
fn test_replay_ignores_blank_lines_and_applies_removals() {
    let message = Message::new(Bytes::from_static(b"a"), 0);
    let mut contents = JournalRecord::enqueued(&message).to_line().unwrap();
    contents.extend_from_slice(b"\n");
    contents.extend_from_slice(
        &JournalRecord::Removed {
            message_id: message.id.clone(),
        }
        .to_line()
        .unwrap(),
    );

    let replayed = replay(Path::new("q.journal"), &contents).unwrap();
    assert!(replayed.messages.is_empty());
    assert_eq!(replayed.removals, 1);
    assert_eq!(replayed.committed_len, contents.len() as u64);
}

mod persistence {
    use super::*;

    /// Verify that messages survive closing and reopening the store.
    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let (kept, removed) = {
            let store = open(&dir).await;
            store.create_queue(&queue("orders")).await.unwrap();
            let kept = store
                .enqueue(&queue("orders"), Bytes::from_static(b"{\"x\":1}"))
                .await
                .unwrap();
            let removed = store
                .enqueue(&queue("orders"), Bytes::from_static(b"{\"x\":2}"))
                .await
                .unwrap();
            assert!(store.remove(&queue("orders"), &removed).await.unwrap());
            (kept, removed)
        };

        let store = open(&dir).await;
        assert_eq!(store.list_queues(), vec![queue("orders")]);
        assert_eq!(store.count(&queue("orders")).unwrap(), 1);

        let message = store.get(&queue("orders"), &kept).unwrap().unwrap();
        assert_eq!(message.body, Bytes::from_static(b"{\"x\":1}"));
        assert!(store.get(&queue("orders"), &removed).unwrap().is_none());
    }

    /// Verify that an empty queue is still known after reopening.
    #[tokio::test]
    async fn test_empty_queue_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir).await;
            assert!(store.create_queue(&queue("empty")).await.unwrap());
        }

        let store = open(&dir).await;
        assert!(store.contains_queue(&queue("empty")));
        assert_eq!(store.count(&queue("empty")).unwrap(), 0);
    }

    /// Verify that sequence numbers continue after a restart.
    #[tokio::test]
    async fn test_sequence_continues_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir).await;
            store.create_queue(&queue("orders")).await.unwrap();
            store
                .enqueue(&queue("orders"), Bytes::from_static(b"first"))
                .await
                .unwrap();
        }

        let store = open(&dir).await;
        store
            .enqueue(&queue("orders"), Bytes::from_static(b"second"))
            .await
            .unwrap();

        let oldest = store.oldest(&queue("orders"), 10, &|_| false).unwrap();
        assert_eq!(oldest[0].body, Bytes::from_static(b"first"));
        assert_eq!(oldest[1].body, Bytes::from_static(b"second"));
        assert!(oldest[0].sequence < oldest[1].sequence);
    }

    /// Verify that deleting a queue removes its journal.
    #[tokio::test]
    async fn test_delete_queue_removes_journal() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.create_queue(&queue("orders")).await.unwrap();
        assert!(dir.path().join("orders.journal").exists());

        assert!(store.delete_queue(&queue("orders")).await.unwrap());
        assert!(!dir.path().join("orders.journal").exists());
        assert!(!store.delete_queue(&queue("orders")).await.unwrap());

        let reopened = open(&dir).await;
        assert!(reopened.list_queues().is_empty());
    }

    /// Verify that an enqueue racing a queue deletion does not report success.
    #[tokio::test]
    async fn test_enqueue_waiting_on_deleted_queue_fails() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir).await);
        store.create_queue(&queue("orders")).await.unwrap();

        let held = store.journal(&queue("orders")).unwrap().lock_owned().await;

        let deleting = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.delete_queue(&queue("orders")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let enqueueing = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .enqueue(&queue("orders"), Bytes::from_static(b"late"))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        drop(held);
        assert!(deleting.await.unwrap().unwrap());
        let err = enqueueing.await.unwrap().unwrap_err();

        assert!(matches!(err, BrokerError::QueueNotFound { .. }));
        assert!(!dir.path().join("orders.journal").exists());
    }

    /// Verify that files other than journals are ignored.
    #[tokio::test]
    async fn test_unrelated_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not a journal").unwrap();
        std::fs::write(dir.path().join("-bad-.journal"), b"").unwrap();

        let store = open(&dir).await;
        assert!(store.list_queues().is_empty());
    }
}

mod recovery {
    use super::*;

    /// Verify that a torn final record is discarded and truncated away.
    #[tokio::test]
    async fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir).await;
            store.create_queue(&queue("orders")).await.unwrap();
            store
                .enqueue(&queue("orders"), Bytes::from_static(b"whole"))
                .await
                .unwrap();
        }
        append_raw(&dir, "orders", b"{\"op\":\"enqueued\",\"mess");

        let store = open(&dir).await;
        assert_eq!(store.count(&queue("orders")).unwrap(), 1);

        // New appends start on a clean line
        store
            .enqueue(&queue("orders"), Bytes::from_static(b"after"))
            .await
            .unwrap();
        drop(store);

        let reopened = open(&dir).await;
        assert_eq!(reopened.count(&queue("orders")).unwrap(), 2);
        assert_eq!(journal_lines(&dir, "orders").len(), 2);
    }

    /// Verify that a corrupt committed record fails the open.
    #[tokio::test]
    async fn test_corrupt_line_is_an_error() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir).await;
            store.create_queue(&queue("orders")).await.unwrap();
        }
        append_raw(&dir, "orders", b"this is not json\n");

        let result = FileMessageStore::open(dir.path().to_path_buf(), 1000, false).await;
        match result {
            Err(BrokerError::Storage { message }) => {
                assert!(message.contains("line 1"), "unexpected message: {}", message)
            }
            Err(other) => panic!("Expected storage error, got {:?}", other),
            Ok(_) => panic!("Expected storage error"),
        }
    }

    /// Verify that a body that does not match its checksum fails the open.
    #[tokio::test]
    async fn test_checksum_mismatch_is_an_error() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir).await;
            store.create_queue(&queue("orders")).await.unwrap();
            store
                .enqueue(&queue("orders"), Bytes::from_static(b"original"))
                .await
                .unwrap();
        }

        let path = dir.path().join("orders.journal");
        let tampered = std::fs::read_to_string(&path).unwrap().replace(
            &base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"original"),
            &base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"tampered"),
        );
        std::fs::write(&path, tampered).unwrap();

        let result = FileMessageStore::open(dir.path().to_path_buf(), 1000, false).await;
        match result {
            Err(BrokerError::Storage { message }) => {
                assert!(message.contains("Checksum mismatch"))
            }
            Err(other) => panic!("Expected storage error, got {:?}", other),
            Ok(_) => panic!("Expected storage error"),
        }
    }
}

mod compaction {
    use super::*;

    /// Verify that reaching the removal threshold rewrites the journal.
    #[tokio::test]
    async fn test_compaction_keeps_only_live_messages() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::open(dir.path().to_path_buf(), 2, true)
            .await
            .unwrap();
        store.create_queue(&queue("orders")).await.unwrap();

        let mut ids = Vec::new();
        for body in ["a", "b", "c"] {
            ids.push(
                store
                    .enqueue(&queue("orders"), Bytes::from(body))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(journal_lines(&dir, "orders").len(), 3);

        store.remove(&queue("orders"), &ids[0]).await.unwrap();
        assert_eq!(journal_lines(&dir, "orders").len(), 4);

        store.remove(&queue("orders"), &ids[1]).await.unwrap();
        let lines = journal_lines(&dir, "orders");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(ids[2].as_str()));
        assert!(!dir.path().join("orders.tmp").exists());

        // Appends after compaction go to the new journal
        store
            .enqueue(&queue("orders"), Bytes::from_static(b"d"))
            .await
            .unwrap();
        drop(store);

        let reopened = open(&dir).await;
        assert_eq!(reopened.count(&queue("orders")).unwrap(), 2);
    }

    /// Verify that purging expired messages journals their removal.
    #[tokio::test]
    async fn test_purge_before_is_durable() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir).await;
            store.create_queue(&queue("orders")).await.unwrap();
            store
                .enqueue(&queue("orders"), Bytes::from_static(b"old"))
                .await
                .unwrap();

            let cutoff = Timestamp::now().plus(chrono::Duration::seconds(1));
            let purged = store.purge_before(&queue("orders"), &cutoff).await.unwrap();
            assert_eq!(purged.len(), 1);
        }

        let store = open(&dir).await;
        assert_eq!(store.count(&queue("orders")).unwrap(), 0);
    }

    /// Verify that a journal left detached by compaction reattaches on append.
    #[tokio::test]
    async fn test_detached_journal_reattaches_before_append() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir).await;
            store.create_queue(&queue("orders")).await.unwrap();
            store
                .enqueue(&queue("orders"), Bytes::from_static(b"a"))
                .await
                .unwrap();

            store.journal(&queue("orders")).unwrap().lock().await.file = None;

            store
                .enqueue(&queue("orders"), Bytes::from_static(b"b"))
                .await
                .unwrap();
        }

        let reopened = open(&dir).await;
        assert_eq!(reopened.count(&queue("orders")).unwrap(), 2);
    }

    /// Verify that appends fail rather than vanish when the journal cannot be reopened.
    #[tokio::test]
    async fn test_detached_journal_append_fails_when_file_is_gone() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.create_queue(&queue("orders")).await.unwrap();
        store
            .enqueue(&queue("orders"), Bytes::from_static(b"a"))
            .await
            .unwrap();

        store.journal(&queue("orders")).unwrap().lock().await.file = None;
        std::fs::remove_file(dir.path().join("orders.journal")).unwrap();

        let err = store
            .enqueue(&queue("orders"), Bytes::from_static(b"b"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Storage { .. }));
        assert_eq!(store.count(&queue("orders")).unwrap(), 1);
    }
}
