use super::kv::{FileKv, KvStore, MemoryKv};
use super::*;
use crate::protocol::BasicProperties;
use std::sync::atomic::{AtomicBool, AtomicUsize};

fn message(store: &MessageStore, body: &'static str) -> Arc<Message> {
    Arc::new(Message {
        id: store.next_id(),
        exchange: "amq.fanout".into(),
        routing_key: String::new(),
        header: ContentHeader::new(body.len() as u64, BasicProperties::default()),
        body: Bytes::from_static(body.as_bytes()),
    })
}

fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn content_keys(kv: &dyn KvStore) -> Vec<u64> {
    let mut ids = Vec::new();
    kv.view(&mut |view| {
        ids = view
            .scan(CONTENT_BUCKET)
            .map(|(k, _)| u64::from_le_bytes(k.try_into().unwrap()))
            .collect();
        Ok(())
    })
    .unwrap();
    ids
}

/// Holder that accepts until switched off and counts what it holds.
#[derive(Default)]
struct Gate {
    closed: AtomicBool,
    held: AtomicUsize,
}

impl ResourceHolder for Gate {
    fn acquire_resources(&self, _: &QueueMessage) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.held.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn release_resources(&self, _: &QueueMessage) {
        self.held.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn test_refcount_follows_queue_references() {
    let kv = Arc::new(MemoryKv::new());
    let store = MessageStore::new(kv.clone());
    let msg = message(&store, "hello");
    let refs = store.add(Arc::clone(&msg), &queues(&["a", "b", "c"]));
    assert_eq!(refs.len(), 3);
    assert_eq!(store.refs(msg.id), Some(3));
    store.flush().unwrap();
    assert_eq!(content_keys(kv.as_ref()), vec![msg.id]);

    store.remove_ref(&refs[0], "a", &[]);
    store.remove_ref(&refs[1], "b", &[]);
    assert_eq!(store.refs(msg.id), Some(1));
    assert_eq!(store.get(&refs[2], &[]).unwrap().body, msg.body);

    store.remove_ref(&refs[2], "c", &[]);
    assert_eq!(store.refs(msg.id), None);
    assert!(matches!(
        store.get(&refs[2], &[]),
        Err(StoreError::MessageNotFound(id)) if id == msg.id
    ));
    assert!(store.is_empty());

    store.flush().unwrap();
    assert!(content_keys(kv.as_ref()).is_empty());
}

#[test]
fn test_get_is_all_or_nothing() {
    let store = MessageStore::new(Arc::new(MemoryKv::new()));
    let msg = message(&store, "payload");
    let qm = store.add(msg, &queues(&["q"]))[0];

    let open = Gate::default();
    let closed = Gate::default();
    closed.closed.store(true, Ordering::SeqCst);

    let result = store.get(&qm, &[&open, &closed]);
    assert!(matches!(result, Err(StoreError::ResourcesUnavailable)));
    assert_eq!(open.held.load(Ordering::SeqCst), 0);

    closed.closed.store(false, Ordering::SeqCst);
    assert!(store.get(&qm, &[&open, &closed]).is_ok());
    assert_eq!(open.held.load(Ordering::SeqCst), 1);
    assert_eq!(closed.held.load(Ordering::SeqCst), 1);

    // removing the reference always releases the holders
    store.remove_ref(&qm, "q", &[&open, &closed]);
    assert_eq!(open.held.load(Ordering::SeqCst), 0);
    assert_eq!(closed.held.load(Ordering::SeqCst), 0);
}

#[test]
fn test_add_and_delete_in_one_window_never_persist() {
    let kv = Arc::new(MemoryKv::new());
    let store = MessageStore::new(kv.clone());
    let msg = message(&store, "short-lived");
    let qm = store.add(msg, &queues(&["q"]))[0];
    store.remove_ref(&qm, "q", &[]);
    store.flush().unwrap();

    let mut buckets = 0;
    kv.view(&mut |view| {
        buckets = view.buckets().count();
        Ok(())
    })
    .unwrap();
    assert_eq!(buckets, 0);
}

#[test]
fn test_partial_cancel_keeps_other_queue() {
    let kv = Arc::new(MemoryKv::new());
    let store = MessageStore::new(kv.clone());
    let msg = message(&store, "fan");
    let refs = store.add(Arc::clone(&msg), &queues(&["a", "b"]));
    store.remove_ref(&refs[0], "a", &[]);
    store.flush().unwrap();

    kv.view(&mut |view| {
        assert!(view.get(&queue_bucket("a"), &msg.id.to_le_bytes()).is_none());
        assert!(view.get(&queue_bucket("b"), &msg.id.to_le_bytes()).is_some());
        let raw = view.get(CONTENT_BUCKET, &msg.id.to_le_bytes()).unwrap();
        let stored: StoredMessage = serde_json::from_slice(raw).unwrap();
        assert_eq!(stored.index.refs, 1);
        Ok(())
    })
    .unwrap();
    assert!(store.index(msg.id).unwrap().persisted);
}

#[test]
fn test_recovery_rebuilds_queues_and_counter() {
    let dir = tempfile::tempdir().unwrap();
    let first_id;
    {
        let kv = Arc::new(FileKv::open(dir.path()).unwrap());
        let store = MessageStore::new(kv);
        for name in ["orders", "audit"] {
            store.queue_declared(QueueRecord {
                name: name.into(),
                durable: true,
                auto_delete: false,
            });
        }
        let m1 = message(&store, "one");
        let m2 = message(&store, "two");
        first_id = m1.id;
        let r1 = store.add(m1, &queues(&["orders", "audit"]));
        store.add(m2, &queues(&["orders"]));
        store.flush().unwrap();

        // consumed from audit, delivered once from orders
        store.remove_ref(&r1[1], "audit", &[]);
        let delivered = QueueMessage {
            delivery_count: 1,
            ..r1[0]
        };
        store.mark_delivered(&delivered, "orders");
        store.flush().unwrap();
    }

    let kv = Arc::new(FileKv::open(dir.path()).unwrap());
    let store = MessageStore::new(kv);
    let mut recovered = store.recover().unwrap();
    recovered.sort_by(|a, b| a.record.name.cmp(&b.record.name));

    assert_eq!(recovered.len(), 2);
    assert_eq!(recovered[0].record.name, "audit");
    assert!(recovered[0].messages.is_empty());
    let orders = &recovered[1].messages;
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].id, first_id);
    assert!(orders[0].redelivered());
    assert!(!orders[1].redelivered());

    assert_eq!(store.refs(first_id), Some(1));
    assert_eq!(store.get(&orders[1], &[]).unwrap().body, Bytes::from_static(b"two"));
    assert!(store.next_id() > orders[1].id);
}

#[test]
fn test_recovery_drops_orphans_and_deleted_queues() {
    let kv = Arc::new(MemoryKv::new());
    {
        let store = MessageStore::new(kv.clone());
        store.queue_declared(QueueRecord {
            name: "gone".into(),
            durable: true,
            auto_delete: false,
        });
        let msg = message(&store, "lost");
        store.add(msg, &queues(&["gone"]));
        store.flush().unwrap();
        store.queue_deleted("gone");
        store.flush().unwrap();
    }

    let store = MessageStore::new(kv.clone());
    let recovered = store.recover().unwrap();
    assert!(recovered.is_empty());
    assert!(store.is_empty());
    assert!(content_keys(kv.as_ref()).is_empty());
}

fn stored_refs(kv: &dyn KvStore, id: u64) -> Option<i32> {
    let mut refs = None;
    kv.view(&mut |view| {
        refs = view
            .get(CONTENT_BUCKET, &id.to_le_bytes())
            .map(|raw| serde_json::from_slice::<StoredMessage>(raw).unwrap().index.refs);
        Ok(())
    })
    .unwrap();
    refs
}

#[test]
fn test_deleted_queue_releases_stored_refs() {
    let kv = Arc::new(MemoryKv::new());
    let store = MessageStore::new(kv.clone());
    let msg = message(&store, "fanned");
    let refs = store.add(Arc::clone(&msg), &queues(&["a", "b"]));
    store.flush().unwrap();
    assert_eq!(stored_refs(kv.as_ref(), msg.id), Some(2));

    // purge then drop "a" in the same window
    store.remove_ref(&refs[0], "a", &[]);
    store.queue_deleted("a");
    store.flush().unwrap();
    assert_eq!(store.refs(msg.id), Some(1));
    assert_eq!(stored_refs(kv.as_ref(), msg.id), Some(1));

    store.remove_ref(&refs[1], "b", &[]);
    store.flush().unwrap();
    assert!(content_keys(kv.as_ref()).is_empty());
}

#[test]
fn test_dropping_unpurged_queue_releases_content() {
    let kv = Arc::new(MemoryKv::new());
    let store = MessageStore::new(kv.clone());
    let msg = message(&store, "left behind");
    store.add(Arc::clone(&msg), &queues(&["a", "b"]));
    store.flush().unwrap();

    store.queue_deleted("a");
    store.queue_deleted("b");
    store.flush().unwrap();
    assert!(content_keys(kv.as_ref()).is_empty());
}

#[tokio::test]
async fn test_final_flush_on_shutdown() {
    let kv = Arc::new(MemoryKv::new());
    let store = Arc::new(MessageStore::new(kv.clone()));
    let (tx, rx) = broadcast::channel(1);
    let handle = Arc::clone(&store).start_persistence(Duration::from_secs(3600), rx);

    // let the first immediate tick pass
    tokio::time::sleep(Duration::from_millis(20)).await;
    let msg = message(&store, "late");
    store.add(Arc::clone(&msg), &queues(&["q"]));
    tx.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(content_keys(kv.as_ref()), vec![msg.id]);
}
