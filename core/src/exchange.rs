//! Exchange routing.
//!
//! An exchange maps a published routing key to an ordered, de-duplicated list
//! of queue names. `direct` matches the binding key exactly, `fanout` ignores
//! it. `headers` is recognised on the wire but has no routing.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::protocol::ProtocolError;

pub const DEFAULT_EXCHANGE: &str = "";
pub const AMQ_DIRECT: &str = "amq.direct";
pub const AMQ_FANOUT: &str = "amq.fanout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(ProtocolError::command_invalid(format!(
                "unknown exchange type '{other}'"
            ))),
        }
    }
}

/// A `(queue, exchange, routing key)` association. `id` is a hash of the three
/// so duplicates are detected without a keyed lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub id: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> Self {
        Self {
            id: Self::hash(queue, exchange, routing_key),
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    pub fn hash(queue: &str, exchange: &str, routing_key: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        (queue, exchange, routing_key).hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    bindings: Vec<Binding>,
    closed: bool,
}

impl Exchange {
    pub fn new<S: Into<String>>(name: S, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            internal: false,
            bindings: Vec::new(),
            closed: false,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_EXCHANGE
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop routing and drop every binding.
    pub fn close(&mut self) {
        self.closed = true;
        self.bindings.clear();
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Returns `false` if an identical binding already exists.
    pub fn bind(&mut self, queue: &str, routing_key: &str) -> bool {
        let binding = Binding::new(queue, &self.name, routing_key);
        if self.bindings.iter().any(|b| b.id == binding.id) {
            return false;
        }
        self.bindings.push(binding);
        true
    }

    /// Returns `false` if no such binding existed.
    pub fn unbind(&mut self, queue: &str, routing_key: &str) -> bool {
        let id = Binding::hash(queue, &self.name, routing_key);
        let before = self.bindings.len();
        self.bindings.retain(|b| b.id != id);
        self.bindings.len() != before
    }

    /// Remove every binding pointing at `queue`.
    pub fn remove_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    /// Destination queues for `routing_key`, in binding order.
    pub fn route(&self, routing_key: &str) -> Vec<String> {
        if self.closed {
            return Vec::new();
        }
        let mut queues: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let matched = match self.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Headers => false,
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_matches_exact_key() {
        let mut ex = Exchange::new("logs", ExchangeKind::Direct);
        assert!(ex.bind("errors", "error"));
        assert!(ex.bind("infos", "info"));
        assert!(ex.bind("all", "error"));
        assert!(ex.bind("all", "info"));

        assert_eq!(ex.route("error"), vec!["errors", "all"]);
        assert_eq!(ex.route("info"), vec!["infos", "all"]);
        assert!(ex.route("warn").is_empty());
        assert!(ex.route("").is_empty());
    }

    #[test]
    fn test_fanout_ignores_key() {
        let mut ex = Exchange::new("events", ExchangeKind::Fanout);
        ex.bind("a", "");
        ex.bind("b", "whatever");
        ex.bind("c", "x");
        ex.bind("c", "y");
        assert_eq!(ex.route("anything"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_binding_identity() {
        let mut ex = Exchange::new("x", ExchangeKind::Direct);
        assert!(ex.bind("q", "k"));
        assert!(!ex.bind("q", "k"));
        assert_eq!(ex.bindings().len(), 1);
        assert_eq!(
            Binding::new("q", "x", "k").id,
            Binding::hash("q", "x", "k")
        );
        assert_ne!(Binding::hash("q", "x", "k"), Binding::hash("q", "x", "j"));

        assert!(ex.unbind("q", "k"));
        assert!(!ex.unbind("q", "k"));
        assert!(ex.route("k").is_empty());
    }

    #[test]
    fn test_remove_queue_and_close() {
        let mut ex = Exchange::new("events", ExchangeKind::Fanout);
        ex.bind("a", "");
        ex.bind("b", "");
        ex.remove_queue("a");
        assert_eq!(ex.route(""), vec!["b"]);

        ex.close();
        assert!(ex.is_closed());
        assert!(ex.route("").is_empty());
        assert!(ex.bindings().is_empty());
    }

    #[test]
    fn test_headers_routes_nowhere() {
        let mut ex = Exchange::new("h", ExchangeKind::Headers);
        ex.bind("q", "");
        assert!(ex.route("").is_empty());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("fanout".parse::<ExchangeKind>().unwrap(), ExchangeKind::Fanout);
        assert_eq!(ExchangeKind::Direct.to_string(), "direct");
        let err = "topic".parse::<ExchangeKind>().unwrap_err();
        assert!(err.is_hard());
    }
}
