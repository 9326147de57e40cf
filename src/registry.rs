//! Per-keyspace session registry.
//!
//! Sessions are created lazily, the first time any client touches a
//! keyspace, and shared by every client thereafter. Creation is guarded by
//! a dedicated mutex (double-checked against the map) so concurrent first
//! touches build exactly one session. While a session is still connecting,
//! requests for its keyspace are buffered in a bounded FIFO and replayed in
//! order once the session resolves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::cluster::{Session, SessionEvent};
use crate::proxy::Request;
use crate::worker::WorkerPool;

/// Requests buffered per keyspace while its session connects.
pub const MAX_PENDING: usize = 1024;

/// A registered keyspace session plus the machinery for requests that
/// arrived before it finished connecting.
pub struct SessionEntry {
    pub session: Arc<Session>,
    pending_tx: Sender<Request>,
    pending_rx: Receiver<Request>,
    pool: WorkerPool<Request>,
}

impl SessionEntry {
    /// Wrap a session and hook its connected/failed transition: connecting
    /// resolves to connected by draining the pending queue into the worker
    /// pool, and to failed by answering every buffered request with an
    /// error.
    pub fn new(session: Arc<Session>, pool: WorkerPool<Request>) -> Arc<SessionEntry> {
        let (pending_tx, pending_rx) = bounded(MAX_PENDING);
        let entry = Arc::new(SessionEntry {
            session: Arc::clone(&session),
            pending_tx,
            pending_rx,
            pool,
        });

        let weak: Weak<SessionEntry> = Arc::downgrade(&entry);
        session.subscribe(Box::new(move |event| {
            let Some(entry) = weak.upgrade() else { return };
            match event {
                SessionEvent::Connected => entry.drain_now(),
                SessionEvent::Failed(msg) => entry.fail_pending(msg),
            }
        }));

        entry
    }

    /// Buffer a request until the session resolves. Hands the request back
    /// when the queue is already full.
    pub fn push_pending(&self, request: Request) -> Result<(), Request> {
        self.pending_tx.try_send(request).map_err(|e| e.into_inner())
    }

    /// Move every buffered request into the worker pool, preserving arrival
    /// order. Safe to call more than once; callers race the subscription
    /// callback to close the buffered-after-connected window.
    pub fn drain_now(&self) {
        let mut drained = 0usize;
        while let Ok(request) = self.pending_rx.try_recv() {
            drained += 1;
            if let Err(rejected) = self.pool.submit(request) {
                rejected.reject_overloaded("Proxy: Too many requests");
            }
        }
        if drained > 0 {
            debug!(keyspace = %self.session.keyspace(), drained, "pending requests released");
        }
    }

    /// Answer every buffered request with an error. Like `drain_now`, also
    /// called directly to close the buffered-after-resolution window.
    pub fn fail_pending(&self, reason: &str) {
        let mut failed = 0usize;
        while let Ok(request) = self.pending_rx.try_recv() {
            failed += 1;
            request.reject_server_error(&format!(
                "Proxy: keyspace session unavailable: {}",
                reason
            ));
        }
        if failed > 0 {
            warn!(keyspace = %self.session.keyspace(), failed, reason, "pending requests failed");
        }
    }
}

pub struct SessionRegistry {
    entries: RwLock<HashMap<String, Arc<SessionEntry>>>,
    // Serializes session creation only; lookups go through the RwLock.
    create_lock: Mutex<()>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            entries: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, keyspace: &str) -> Option<Arc<SessionEntry>> {
        self.entries.read().unwrap().get(keyspace).cloned()
    }

    /// Fetch the entry for a keyspace, creating it at most once across
    /// concurrent callers. `create` runs outside the map lock but inside
    /// the creation lock.
    pub fn get_or_create<F>(&self, keyspace: &str, create: F) -> Arc<SessionEntry>
    where
        F: FnOnce() -> Arc<SessionEntry>,
    {
        if let Some(entry) = self.get(keyspace) {
            return entry;
        }

        let _guard = self.create_lock.lock().unwrap();
        // Double check: another caller may have created it while we waited.
        if let Some(entry) = self.get(keyspace) {
            return entry;
        }

        let entry = create();
        self.entries
            .write()
            .unwrap()
            .insert(keyspace.to_string(), Arc::clone(&entry));
        entry
    }

    pub fn insert(&self, keyspace: &str, entry: Arc<SessionEntry>) {
        self.entries
            .write()
            .unwrap()
            .insert(keyspace.to_string(), entry);
    }

    /// Drop a failed entry so the next touch of the keyspace retries from
    /// scratch.
    pub fn remove(&self, keyspace: &str) {
        self.entries.write().unwrap().remove(keyspace);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod registry_tests {
    use super::*;
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use crate::frame::{decode_response, error_code, RawFrame, Response};
    use crate::proxy::stub_writer_pair;

    fn stub_entry(keyspace: &str) -> Arc<SessionEntry> {
        let pool = WorkerPool::new(4, |req: Request| req.run());
        SessionEntry::new(Session::stub(keyspace), pool)
    }

    fn read_error_reply(read_side: &mut TcpStream) -> (i32, String) {
        let reply = RawFrame::read_from(read_side).unwrap().unwrap();
        assert_eq!(reply.header.stream, 1);
        match decode_response(&reply).unwrap() {
            Response::Error { code, message } => (code, message),
            other => panic!("expected error reply, got {:?}", other),
        }
    }

    #[test]
    fn test_get_or_create_creates_once() {
        let registry = Arc::new(SessionRegistry::new());
        let created = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let created = Arc::clone(&created);
            handles.push(thread::spawn(move || {
                registry.get_or_create("ks1", || {
                    created.fetch_add(1, Ordering::SeqCst);
                    stub_entry("ks1")
                })
            }));
        }
        let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        for entry in &entries {
            assert!(Arc::ptr_eq(entry, &entries[0]));
        }
    }

    #[test]
    fn test_entries_are_independent_per_keyspace() {
        let registry = SessionRegistry::new();
        let a = registry.get_or_create("ks_a", || stub_entry("ks_a"));
        let b = registry.get_or_create("ks_b", || stub_entry("ks_b"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(registry.get("ks_a").is_some());

        registry.remove("ks_a");
        assert!(registry.get("ks_a").is_none());
        assert!(registry.get("ks_b").is_some());
    }

    #[test]
    fn test_connected_transition_drains_buffered_request() {
        use crate::cluster::SessionEvent;

        let session = Session::stub("ks1");
        let pool = WorkerPool::new(4, |req: Request| req.run());
        let entry = SessionEntry::new(Arc::clone(&session), pool);

        let (writer, mut read_side) = stub_writer_pair();
        entry
            .push_pending(Request::stub_with_writer(writer))
            .ok()
            .unwrap();

        // Connecting resolves; the subscription callback drains the queue
        // into the pool, a worker runs the request, and the stub session
        // (no backend connections) turns it into a server error reply.
        session.resolve_for_tests(SessionEvent::Connected);

        let (code, message) = read_error_reply(&mut read_side);
        assert_eq!(code, error_code::SERVER_ERROR);
        assert!(message.starts_with("Proxy: "));

        // Exactly one reply: nothing else arrives on this connection.
        read_side
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(!matches!(RawFrame::read_from(&mut read_side), Ok(Some(_))));
    }

    #[test]
    fn test_failed_resolution_answers_buffered_request() {
        use crate::cluster::SessionEvent;

        let session = Session::stub("ks1");
        let pool = WorkerPool::new(4, |req: Request| req.run());
        let entry = SessionEntry::new(Arc::clone(&session), pool);

        let (writer, mut read_side) = stub_writer_pair();
        entry
            .push_pending(Request::stub_with_writer(writer))
            .ok()
            .unwrap();

        session.resolve_for_tests(SessionEvent::Failed("refused".to_string()));

        let (code, message) = read_error_reply(&mut read_side);
        assert_eq!(code, error_code::SERVER_ERROR);
        assert_eq!(message, "Proxy: keyspace session unavailable: refused");
    }

    #[test]
    fn test_pending_queue_bounded() {
        let entry = stub_entry("ks1");
        let writer = crate::proxy::stub_writer();
        for _ in 0..MAX_PENDING {
            let request = Request::stub_with_writer(writer.clone());
            assert!(entry.push_pending(request).is_ok());
        }
        assert!(entry
            .push_pending(Request::stub_with_writer(writer))
            .is_err());
    }
}
