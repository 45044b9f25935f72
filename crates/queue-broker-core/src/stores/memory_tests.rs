//! Tests for the in-memory message store.

use super::*;

fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

async fn store_with_queue(name: &str) -> InMemoryMessageStore {
    let store = InMemoryMessageStore::new();
    store.create_queue(&queue(name)).await.unwrap();
    store
}

// ============================================================================
// Queue Management Tests
// ============================================================================

mod queue_management {
    use super::*;

    /// Verify that creating a queue twice reports the second call as a no-op.
    #[tokio::test]
    async fn test_create_queue_twice() {
        let store = InMemoryMessageStore::new();
        assert!(store.create_queue(&queue("orders")).await.unwrap());
        assert!(!store.create_queue(&queue("orders")).await.unwrap());
        assert_eq!(store.list_queues(), vec![queue("orders")]);
    }

    /// Verify that deleting a queue drops its messages.
    #[tokio::test]
    async fn test_delete_queue() {
        let store = store_with_queue("orders").await;
        store
            .enqueue(&queue("orders"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert!(store.delete_queue(&queue("orders")).await.unwrap());
        assert!(!store.contains_queue(&queue("orders")));
        assert!(!store.delete_queue(&queue("orders")).await.unwrap());
        assert!(matches!(
            store.count(&queue("orders")),
            Err(BrokerError::QueueNotFound { .. })
        ));
    }

    /// Verify that operations on unknown queues fail with QueueNotFound.
    #[tokio::test]
    async fn test_unknown_queue() {
        let store = InMemoryMessageStore::new();
        let result = store
            .enqueue(&queue("missing"), Bytes::from_static(b"x"))
            .await;
        assert!(matches!(result, Err(BrokerError::QueueNotFound { .. })));
    }
}

// ============================================================================
// Message Tests
// ============================================================================

mod messages {
    use super::*;

    /// Verify that an enqueued message can be fetched by id.
    #[tokio::test]
    async fn test_enqueue_then_get() {
        let store = store_with_queue("orders").await;
        let id = store
            .enqueue(&queue("orders"), Bytes::from_static(b"{\"x\":1}"))
            .await
            .unwrap();

        let message = store.get(&queue("orders"), &id).unwrap().unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.body, Bytes::from_static(b"{\"x\":1}"));
        assert_eq!(store.count(&queue("orders")).unwrap(), 1);
    }

    /// Verify that removing twice is the same as removing once.
    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = store_with_queue("orders").await;
        let id = store
            .enqueue(&queue("orders"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert!(store.remove(&queue("orders"), &id).await.unwrap());
        assert!(!store.remove(&queue("orders"), &id).await.unwrap());
        assert!(store.get(&queue("orders"), &id).unwrap().is_none());
        assert_eq!(store.count(&queue("orders")).unwrap(), 0);
    }

    /// Verify that queues do not share messages.
    #[tokio::test]
    async fn test_queues_are_isolated() {
        let store = store_with_queue("orders").await;
        store.create_queue(&queue("invoices")).await.unwrap();

        let id = store
            .enqueue(&queue("orders"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert!(store.get(&queue("invoices"), &id).unwrap().is_none());
        assert_eq!(store.count(&queue("invoices")).unwrap(), 0);
    }

    /// Verify that oldest() returns messages in enqueue order.
    #[tokio::test]
    async fn test_oldest_first() {
        let store = store_with_queue("orders").await;
        let first = store
            .enqueue(&queue("orders"), Bytes::from_static(b"1"))
            .await
            .unwrap();
        let second = store
            .enqueue(&queue("orders"), Bytes::from_static(b"2"))
            .await
            .unwrap();

        let oldest = store.oldest(&queue("orders"), 10, &|_| false).unwrap();
        let ids: Vec<MessageId> = oldest.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    /// Verify that purge_before removes only messages older than the cutoff.
    #[tokio::test]
    async fn test_purge_before() {
        let store = store_with_queue("orders").await;
        let id = store
            .enqueue(&queue("orders"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let past = Timestamp::now().plus(chrono::Duration::minutes(-1));
        assert!(store
            .purge_before(&queue("orders"), &past)
            .await
            .unwrap()
            .is_empty());

        let future = Timestamp::now().plus(chrono::Duration::minutes(1));
        let purged = store.purge_before(&queue("orders"), &future).await.unwrap();
        assert_eq!(purged, vec![id]);
        assert_eq!(store.count(&queue("orders")).unwrap(), 0);
    }
}
