//! Correlation table: outstanding request id -> waiting continuation.
//!
//! Knows nothing about request semantics. Each entry is resolved at most once; a
//! response whose id is not in the table is dropped.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

use super::protocol::{ErrorShape, WsResponse};

/// What a waiting request eventually receives.
pub type Reply = Result<Value, ErrorShape>;

#[derive(Debug, Default)]
pub struct PendingRequests {
    waiting: HashMap<String, oneshot::Sender<Reply>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a continuation for `id`. Must be called before the frame is written.
    pub fn register(&mut self, id: impl Into<String>) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id.into(), tx);
        rx
    }

    /// Drop the continuation for `id` without resolving it (e.g. the write failed).
    pub fn forget(&mut self, id: &str) {
        self.waiting.remove(id);
    }

    /// Match a response against the table. Returns false when the id is unknown.
    pub fn resolve(&mut self, response: WsResponse) -> bool {
        let Some(tx) = self.waiting.remove(&response.id) else {
            log::debug!("dropping response for unknown request id {}", response.id);
            return false;
        };
        // The caller may have stopped waiting; that is not an error here.
        let _ = tx.send(response.into_result());
        true
    }

    /// Abandon every outstanding continuation. Waiters observe a closed channel.
    pub fn abandon_all(&mut self) -> usize {
        let n = self.waiting.len();
        self.waiting.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_matching_response_once() {
        let mut table = PendingRequests::new();
        let rx = table.register("r1");
        assert!(table.resolve(WsResponse::ok("r1", json!({ "ok": 1 }))));
        assert_eq!(rx.await.unwrap(), Ok(json!({ "ok": 1 })));
        assert!(!table.resolve(WsResponse::ok("r1", json!(null))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn error_response_rejects_continuation() {
        let mut table = PendingRequests::new();
        let rx = table.register("r2");
        table.resolve(WsResponse::err("r2", "NOT_FOUND", "no such session"));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code, "NOT_FOUND");
        assert_eq!(err.message, "no such session");
    }

    #[test]
    fn unmatched_response_is_dropped() {
        let mut table = PendingRequests::new();
        let _rx = table.register("known");
        assert!(!table.resolve(WsResponse::ok("stranger", json!(1))));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn abandon_all_never_resolves_waiters() {
        let mut table = PendingRequests::new();
        let a = table.register("a");
        let b = table.register("b");
        assert_eq!(table.abandon_all(), 2);
        assert!(a.await.is_err());
        assert!(b.await.is_err());
        assert!(table.is_empty());
    }
}
