//! Exchange and queue registry shared by every connection.
//!
//! Exchanges and queues sit behind two independent locks. Neither lock is
//! held across an await point or while the other is taken, except in
//! [`Registry::delete_queue`], which always takes the queue map first.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::exchange::{Exchange, ExchangeKind, AMQ_DIRECT, AMQ_FANOUT, DEFAULT_EXCHANGE};
use crate::metrics::MetricsRegistry;
use crate::protocol::{ExchangeDeclare, ProtocolError, QueueDeclare, QueueDeclareOk};
use crate::queue::{Queue, QueueOptions};
use crate::storage::{MessageStore, QueueRecord, RecoveredQueue};

type Result<T> = std::result::Result<T, ProtocolError>;

const RESERVED_PREFIX: &str = "amq.";

#[derive(Debug)]
pub struct Registry {
    exchanges: Mutex<HashMap<String, Exchange>>,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    store: Arc<MessageStore>,
    metrics: Arc<MetricsRegistry>,
    generated: AtomicU64,
}

impl Registry {
    pub fn new(store: Arc<MessageStore>, metrics: Arc<MetricsRegistry>) -> Self {
        let mut exchanges = HashMap::new();
        for (name, kind) in [
            (DEFAULT_EXCHANGE, ExchangeKind::Direct),
            (AMQ_DIRECT, ExchangeKind::Direct),
            (AMQ_FANOUT, ExchangeKind::Fanout),
        ] {
            exchanges.insert(name.to_string(), Exchange::new(name, kind).durable(true));
        }
        Self {
            exchanges: Mutex::new(exchanges),
            queues: Mutex::new(HashMap::new()),
            store,
            metrics,
            generated: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.lock().contains_key(name)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.lock().get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Create an exchange or confirm an existing one has the same kind.
    pub fn declare_exchange(&self, args: &ExchangeDeclare) -> Result<()> {
        let mut exchanges = self.exchanges.lock();
        if args.passive {
            return match exchanges.contains_key(&args.exchange) {
                true => Ok(()),
                false => Err(ProtocolError::not_found(format!(
                    "no exchange '{}'",
                    args.exchange
                ))),
            };
        }

        let kind: ExchangeKind = args.kind.parse()?;
        if let Some(existing) = exchanges.get(&args.exchange) {
            if existing.kind != kind {
                return Err(ProtocolError::not_allowed(format!(
                    "exchange '{}' exists with type {}, not {}",
                    args.exchange, existing.kind, kind
                )));
            }
            return Ok(());
        }
        if kind == ExchangeKind::Headers {
            return Err(ProtocolError::not_implemented("headers exchanges"));
        }
        if args.exchange.starts_with(RESERVED_PREFIX) {
            return Err(ProtocolError::access_refused(format!(
                "exchange name '{}' is reserved",
                args.exchange
            )));
        }

        let mut exchange = Exchange::new(args.exchange.clone(), kind).durable(args.durable);
        exchange.auto_delete = args.auto_delete;
        exchange.internal = args.internal;
        exchanges.insert(args.exchange.clone(), exchange);
        info!(exchange = %args.exchange, %kind, "Exchange declared");
        Ok(())
    }

    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        if name == DEFAULT_EXCHANGE {
            return Err(ProtocolError::access_refused(
                "the default exchange cannot be deleted",
            ));
        }
        let mut exchanges = self.exchanges.lock();
        let Some(exchange) = exchanges.get_mut(name) else {
            return Err(ProtocolError::not_found(format!("no exchange '{name}'")));
        };
        if if_unused && !exchange.bindings().is_empty() {
            return Err(ProtocolError::precondition_failed(format!(
                "exchange '{name}' in use"
            )));
        }
        exchange.close();
        exchanges.remove(name);
        info!(exchange = %name, "Exchange deleted");
        Ok(())
    }

    /// Declare a queue, or report the counts of an existing one.
    pub fn declare_queue(&self, args: &QueueDeclare, connection_id: u64) -> Result<QueueDeclareOk> {
        let name = if args.queue.is_empty() {
            let n = self.generated.fetch_add(1, Ordering::Relaxed) + 1;
            format!("amq.gen-{connection_id}-{n}")
        } else {
            args.queue.clone()
        };

        let queue = {
            let mut queues = self.queues.lock();
            if let Some(existing) = queues.get(&name) {
                existing.check_access(connection_id)?;
                return Ok(QueueDeclareOk {
                    queue: name,
                    message_count: existing.message_count() as u32,
                    consumer_count: existing.consumer_count() as u32,
                });
            }
            if args.passive {
                return Err(ProtocolError::not_found(format!("no queue '{name}'")));
            }

            let options = QueueOptions {
                durable: args.durable,
                exclusive: args.exclusive,
                auto_delete: args.auto_delete,
                owner: Some(connection_id),
            };
            let queue = Queue::new(
                name.clone(),
                options,
                Arc::clone(&self.store),
                Arc::clone(&self.metrics),
            );
            queue.start();
            queues.insert(name.clone(), Arc::clone(&queue));
            queue
        };

        if let Some(default) = self.exchanges.lock().get_mut(DEFAULT_EXCHANGE) {
            default.bind(&name, &name);
        }
        if !queue.options.exclusive {
            self.store.queue_declared(QueueRecord {
                name: name.clone(),
                durable: queue.options.durable,
                auto_delete: queue.options.auto_delete,
            });
        }
        info!(queue = %name, connection_id, exclusive = args.exclusive, "Queue declared");

        Ok(QueueDeclareOk {
            queue: name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    pub fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        connection_id: u64,
    ) -> Result<()> {
        self.accessible_queue(queue, connection_id)?;
        if exchange == DEFAULT_EXCHANGE {
            return Err(ProtocolError::access_refused(
                "the default exchange cannot be bound explicitly",
            ));
        }
        let mut exchanges = self.exchanges.lock();
        let Some(target) = exchanges.get_mut(exchange) else {
            return Err(ProtocolError::not_found(format!("no exchange '{exchange}'")));
        };
        if target.bind(queue, routing_key) {
            debug!(queue, exchange, routing_key, "Queue bound");
        }
        Ok(())
    }

    pub fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        connection_id: u64,
    ) -> Result<()> {
        self.accessible_queue(queue, connection_id)?;
        if exchange == DEFAULT_EXCHANGE {
            return Err(ProtocolError::access_refused(
                "the default exchange cannot be unbound explicitly",
            ));
        }
        let mut exchanges = self.exchanges.lock();
        let Some(target) = exchanges.get_mut(exchange) else {
            return Err(ProtocolError::not_found(format!("no exchange '{exchange}'")));
        };
        if target.unbind(queue, routing_key) {
            debug!(queue, exchange, routing_key, "Queue unbound");
        }
        Ok(())
    }

    /// Close and remove a queue. Its consumers are cancelled, its references
    /// released and its bindings dropped. Returns the number of messages it
    /// still held.
    pub fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
        connection_id: u64,
    ) -> Result<u32> {
        let queue = {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get(name) else {
                return Err(ProtocolError::not_found(format!("no queue '{name}'")));
            };
            queue.check_access(connection_id)?;
            queue.check_delete(if_unused, if_empty)?;
            let queue = Arc::clone(queue);
            queues.remove(name);
            queue
        };
        Ok(self.discard(&queue))
    }

    fn discard(&self, queue: &Arc<Queue>) -> u32 {
        queue.close();
        for exchange in self.exchanges.lock().values_mut() {
            exchange.remove_queue(&queue.name);
        }
        let purged = queue.purge();
        self.store.queue_deleted(&queue.name);
        info!(queue = %queue.name, purged, "Queue deleted");
        purged as u32
    }

    /// Resolve an exchange to its destination queues for `routing_key`.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<Queue>>> {
        let names = {
            let exchanges = self.exchanges.lock();
            let Some(target) = exchanges.get(exchange) else {
                return Err(ProtocolError::not_found(format!("no exchange '{exchange}'")));
            };
            if target.internal {
                return Err(ProtocolError::access_refused(format!(
                    "cannot publish to internal exchange '{exchange}'"
                )));
            }
            target.route(routing_key)
        };
        let queues = self.queues.lock();
        Ok(names
            .iter()
            .filter_map(|name| queues.get(name).cloned())
            .collect())
    }

    /// Called after a consumer left `queue`. Auto-delete queues go away with
    /// their last consumer.
    pub fn consumer_removed(&self, queue: &Arc<Queue>, remaining: usize) {
        if remaining > 0 || !queue.options.auto_delete {
            return;
        }
        let removed = {
            let mut queues = self.queues.lock();
            match queues.get(&queue.name) {
                Some(current) if Arc::ptr_eq(current, queue) && current.consumer_count() == 0 => {
                    queues.remove(&queue.name)
                }
                _ => None,
            }
        };
        if let Some(queue) = removed {
            debug!(queue = %queue.name, "Auto-deleting queue after last consumer");
            self.discard(&queue);
        }
    }

    /// Delete every exclusive queue owned by a closed connection.
    pub fn connection_closed(&self, connection_id: u64) {
        let owned: Vec<Arc<Queue>> = {
            let mut queues = self.queues.lock();
            let names: Vec<String> = queues
                .values()
                .filter(|q| q.options.exclusive && q.owner() == Some(connection_id))
                .map(|q| q.name.clone())
                .collect();
            names.iter().filter_map(|n| queues.remove(n)).collect()
        };
        for queue in owned {
            self.discard(&queue);
        }
    }

    /// Re-create queues rebuilt by the message store, unowned.
    pub fn recover(&self, recovered: Vec<RecoveredQueue>) {
        for RecoveredQueue { record, messages } in recovered {
            let options = QueueOptions {
                durable: record.durable,
                exclusive: false,
                auto_delete: record.auto_delete,
                owner: None,
            };
            let queue = Queue::new(
                record.name.clone(),
                options,
                Arc::clone(&self.store),
                Arc::clone(&self.metrics),
            );
            let count = messages.len();
            for qm in messages {
                queue.push(qm);
            }
            queue.start();
            self.queues.lock().insert(record.name.clone(), queue);
            if let Some(default) = self.exchanges.lock().get_mut(DEFAULT_EXCHANGE) {
                default.bind(&record.name, &record.name);
            }
            info!(queue = %record.name, messages = count, "Queue recovered");
        }
    }

    /// Stop every queue's dispatcher.
    pub fn close_all(&self) {
        for queue in self.queues.lock().values() {
            queue.close();
        }
    }

    fn accessible_queue(&self, name: &str, connection_id: u64) -> Result<Arc<Queue>> {
        let queue = self
            .queue(name)
            .ok_or_else(|| ProtocolError::not_found(format!("no queue '{name}'")))?;
        queue.check_access(connection_id)?;
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;
    use crate::storage::kv::MemoryKv;

    fn registry() -> Registry {
        let store = Arc::new(MessageStore::new(Arc::new(MemoryKv::new())));
        Registry::new(store, Arc::new(MetricsRegistry::new()))
    }

    fn declare(name: &str, exclusive: bool) -> QueueDeclare {
        QueueDeclare {
            queue: name.to_string(),
            exclusive,
            ..Default::default()
        }
    }

    fn exchange(name: &str, kind: &str) -> ExchangeDeclare {
        ExchangeDeclare {
            exchange: name.to_string(),
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let reg = registry();
        reg.declare_queue(&declare("orders", false), 1).unwrap();
        let queues = reg.route("", "orders").unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].name, "orders");
        assert!(reg.route("", "other").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let reg = registry();
        let first = reg.declare_queue(&declare("q", false), 1).unwrap();
        let second = reg.declare_queue(&declare("q", false), 2).unwrap();
        assert_eq!(first.queue, second.queue);
        assert_eq!(reg.queue_names(), vec!["q".to_string()]);

        reg.declare_exchange(&exchange("logs", "fanout")).unwrap();
        reg.declare_exchange(&exchange("logs", "fanout")).unwrap();
        let err = reg.declare_exchange(&exchange("logs", "direct")).unwrap_err();
        assert!(err.is_hard());
    }

    #[tokio::test]
    async fn test_generated_queue_names() {
        let reg = registry();
        let a = reg.declare_queue(&declare("", true), 4).unwrap();
        let b = reg.declare_queue(&declare("", true), 4).unwrap();
        assert!(a.queue.starts_with("amq.gen-4-"));
        assert_ne!(a.queue, b.queue);
    }

    #[tokio::test]
    async fn test_passive_and_missing() {
        let reg = registry();
        let passive = QueueDeclare {
            queue: "nope".into(),
            passive: true,
            ..Default::default()
        };
        assert_eq!(reg.declare_queue(&passive, 1).unwrap_err().code, NOT_FOUND);

        let mut ex = exchange("nope", "direct");
        ex.passive = true;
        assert_eq!(reg.declare_exchange(&ex).unwrap_err().code, NOT_FOUND);
        assert_eq!(reg.route("nope", "k").unwrap_err().code, NOT_FOUND);
        assert_eq!(
            reg.bind_queue("nope", "amq.direct", "k", 1).unwrap_err().code,
            NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_headers_and_reserved_names() {
        let reg = registry();
        let err = reg.declare_exchange(&exchange("h", "headers")).unwrap_err();
        assert!(err.is_hard());
        assert_eq!(err.code, NOT_IMPLEMENTED);

        let err = reg.declare_exchange(&exchange("amq.mine", "direct")).unwrap_err();
        assert_eq!(err.code, ACCESS_REFUSED);
        assert_eq!(reg.delete_exchange("", false).unwrap_err().code, ACCESS_REFUSED);
    }

    #[tokio::test]
    async fn test_direct_and_fanout_routing() {
        let reg = registry();
        for q in ["a", "b", "c"] {
            reg.declare_queue(&declare(q, false), 1).unwrap();
        }
        reg.bind_queue("a", "amq.direct", "k", 1).unwrap();
        reg.bind_queue("b", "amq.direct", "other", 1).unwrap();
        for q in ["a", "b", "c"] {
            reg.bind_queue(q, "amq.fanout", "", 1).unwrap();
        }

        let direct: Vec<String> = reg
            .route("amq.direct", "k")
            .unwrap()
            .iter()
            .map(|q| q.name.clone())
            .collect();
        assert_eq!(direct, vec!["a".to_string()]);
        assert_eq!(reg.route("amq.fanout", "ignored").unwrap().len(), 3);

        reg.delete_queue("b", false, false, 1).unwrap();
        assert_eq!(reg.route("amq.fanout", "").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_exclusive_queue_locked_to_owner() {
        let reg = registry();
        reg.declare_queue(&declare("mine", true), 1).unwrap();

        let err = reg.declare_queue(&declare("mine", false), 2).unwrap_err();
        assert_eq!(err.code, RESOURCE_LOCKED);
        assert_eq!(
            reg.bind_queue("mine", "amq.direct", "k", 2).unwrap_err().code,
            RESOURCE_LOCKED
        );
        assert_eq!(
            reg.delete_queue("mine", false, false, 2).unwrap_err().code,
            RESOURCE_LOCKED
        );

        reg.connection_closed(1);
        assert!(reg.queue("mine").is_none());
    }

    #[tokio::test]
    async fn test_delete_exchange_if_unused() {
        let reg = registry();
        reg.declare_exchange(&exchange("events", "direct")).unwrap();
        reg.declare_queue(&declare("q", false), 1).unwrap();
        reg.bind_queue("q", "events", "k", 1).unwrap();

        let err = reg.delete_exchange("events", true).unwrap_err();
        assert_eq!(err.code, PRECONDITION_FAILED);
        reg.delete_exchange("events", false).unwrap();
        assert!(!reg.has_exchange("events"));
    }
}
