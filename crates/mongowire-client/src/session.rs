//! Logical sessions and transactions
//!
//! Server sessions are identified by a random 16-byte UUID and carry a
//! strictly increasing transaction counter. Released sessions return to a
//! LIFO store so the most recently used identifier is handed out first.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Document};
use chrono::{DateTime, Utc};
use mongowire_common::metrics;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// A server session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The `lsid` document sent with commands
    pub fn to_document(&self) -> Document {
        doc! {
            "id": Binary {
                subtype: BinarySubtype::Uuid,
                bytes: self.0.as_bytes().to_vec(),
            }
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A server-side session
#[derive(Debug)]
pub struct ServerSession {
    id: SessionId,
    last_use: Mutex<DateTime<Utc>>,
    transaction_counter: AtomicI64,
}

impl ServerSession {
    pub fn new() -> Self {
        Self {
            id: SessionId::random(),
            last_use: Mutex::new(Utc::now()),
            transaction_counter: AtomicI64::new(1),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn last_use(&self) -> DateTime<Utc> {
        *self.last_use.lock()
    }

    pub fn touch(&self) {
        *self.last_use.lock() = Utc::now();
    }

    /// Allocate the next transaction number. Never returns the same number twice.
    pub fn next_transaction_number(&self) -> i64 {
        self.transaction_counter.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for ServerSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOptions {
    /// Sent with the first command of the transaction
    pub read_concern: Option<Document>,
    /// Sent with `commitTransaction`/`abortTransaction`
    pub write_concern: Option<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub causal_consistency: bool,
    pub default_transaction_options: Option<TransactionOptions>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            causal_consistency: true,
            default_transaction_options: None,
        }
    }
}

/// A transaction in progress on a session
#[derive(Debug)]
pub struct Transaction {
    number: i64,
    autocommit: bool,
    started: AtomicBool,
    options: TransactionOptions,
}

impl Transaction {
    pub fn number(&self) -> i64 {
        self.number
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// Whether a command has been sent as part of this transaction
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Add the transaction fields to `command`. Only the first command gets `startTransaction`.
    pub fn decorate(&self, command: &mut Document) {
        command.insert("txnNumber", self.number);
        if !self.autocommit {
            command.insert("autocommit", false);
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            command.insert("startTransaction", true);
            if let Some(read_concern) = &self.options.read_concern {
                command.insert("readConcern", read_concern.clone());
            }
        }
    }
}

/// A caller-facing session handle.
///
/// Dropping the handle returns its server session to the manager it came from.
pub struct ClientSession {
    server_session: Arc<ServerSession>,
    options: SessionOptions,
    manager: Weak<SessionManager>,
    transaction: Mutex<Option<Arc<Transaction>>>,
}

impl ClientSession {
    fn new(server_session: Arc<ServerSession>, options: SessionOptions, manager: Weak<SessionManager>) -> Self {
        Self {
            server_session,
            options,
            manager,
            transaction: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.server_session.id()
    }

    pub fn server_session(&self) -> &ServerSession {
        &self.server_session
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Whether dropping this handle returns the server session for reuse.
    /// False for the implicit session and for handles that outlived their manager.
    pub fn returns_to_pool(&self) -> bool {
        self.manager.strong_count() > 0
    }

    pub fn next_transaction_number(&self) -> i64 {
        self.server_session.next_transaction_number()
    }

    /// Begin a transaction with `options`, or the session defaults
    pub fn start_transaction(&self, options: Option<TransactionOptions>) -> Arc<Transaction> {
        let options = options
            .or_else(|| self.options.default_transaction_options.clone())
            .unwrap_or_default();

        let transaction = Arc::new(Transaction {
            number: self.next_transaction_number(),
            autocommit: false,
            started: AtomicBool::new(false),
            options,
        });

        debug!("Session {} started transaction {}", self.id(), transaction.number);
        *self.transaction.lock() = Some(Arc::clone(&transaction));
        transaction
    }

    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.lock().clone()
    }

    pub(crate) fn clear_transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.lock().take()
    }

    /// Add `lsid`, and the transaction fields when a transaction is active
    pub fn decorate(&self, command: &mut Document) {
        self.server_session.touch();
        command.insert("lsid", self.id().to_document());
        if let Some(transaction) = self.transaction() {
            transaction.decorate(command);
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.release_session(Arc::clone(&self.server_session));
        }
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Hands out server sessions, reusing released ones most-recent first
#[derive(Debug, Default)]
pub struct SessionManager {
    store: Mutex<Vec<Arc<ServerSession>>>,
    implicit: OnceCell<ClientSession>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Check out a session, reusing the most recently released one if any
    pub fn retain_session(self: &Arc<Self>, options: SessionOptions) -> ClientSession {
        let reused = self.store.lock().pop();
        let server_session = match reused {
            Some(session) => {
                metrics::record_session_reused();
                session
            }
            None => {
                let session = Arc::new(ServerSession::new());
                debug!("Allocated server session {}", session.id());
                metrics::record_session_allocated();
                session
            }
        };

        ClientSession::new(server_session, options, Arc::downgrade(self))
    }

    pub(crate) fn release_session(&self, session: Arc<ServerSession>) {
        debug!("Server session {} released", session.id());
        self.store.lock().push(session);
    }

    /// The session used by operations issued without one
    pub fn implicit_session(&self) -> &ClientSession {
        self.implicit.get_or_init(|| {
            metrics::record_session_allocated();
            ClientSession::new(Arc::new(ServerSession::new()), SessionOptions::default(), Weak::new())
        })
    }

    /// Sessions waiting for reuse
    pub fn pooled_sessions(&self) -> usize {
        self.store.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_session_is_reused_lifo() {
        let manager = SessionManager::new();

        let first = manager.retain_session(SessionOptions::default());
        let second = manager.retain_session(SessionOptions::default());
        let (first_id, second_id) = (first.id(), second.id());
        assert_ne!(first_id, second_id);

        drop(first);
        drop(second);
        assert_eq!(manager.pooled_sessions(), 2);

        assert_eq!(manager.retain_session(SessionOptions::default()).id(), second_id);
        // The handle above was dropped immediately and is on top again
        let again = manager.retain_session(SessionOptions::default());
        assert_eq!(again.id(), second_id);
        let next = manager.retain_session(SessionOptions::default());
        assert_eq!(next.id(), first_id);
        assert_eq!(manager.pooled_sessions(), 0);
    }

    #[test]
    fn test_transaction_numbers_increase() {
        let manager = SessionManager::new();
        let session = manager.retain_session(SessionOptions::default());

        let a = session.next_transaction_number();
        let b = session.next_transaction_number();
        assert_eq!(a, 1);
        assert!(b > a);

        let id = session.id();
        drop(session);
        let session = manager.retain_session(SessionOptions::default());
        assert_eq!(session.id(), id);
        assert!(session.next_transaction_number() > b);
    }

    #[test]
    fn test_concurrent_transaction_numbers_are_unique() {
        let session = Arc::new(ServerSession::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || (0..100).map(|_| session.next_transaction_number()).collect::<Vec<_>>())
            })
            .collect();

        let mut numbers: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        numbers.sort_unstable();
        numbers.dedup();
        assert_eq!(numbers.len(), 800);
    }

    #[test]
    fn test_implicit_session_is_never_released() {
        let manager = SessionManager::new();
        let implicit_id = manager.implicit_session().id();
        assert!(!manager.implicit_session().returns_to_pool());
        assert_eq!(manager.implicit_session().id(), implicit_id);
        assert_eq!(manager.pooled_sessions(), 0);

        drop(manager);
    }

    #[test]
    fn test_session_outliving_manager() {
        let manager = SessionManager::new();
        let session = manager.retain_session(SessionOptions::default());
        assert!(session.returns_to_pool());
        drop(manager);
        assert!(!session.returns_to_pool());
        drop(session);
    }

    #[test]
    fn test_lsid_document() {
        let id = SessionId::random();
        let lsid = id.to_document();
        match lsid.get("id") {
            Some(bson::Bson::Binary(binary)) => {
                assert_eq!(binary.subtype, BinarySubtype::Uuid);
                assert_eq!(binary.bytes.as_slice(), id.as_bytes());
            }
            other => panic!("unexpected lsid {other:?}"),
        }
    }

    #[test]
    fn test_transaction_decoration() {
        let manager = SessionManager::new();
        let session = manager.retain_session(SessionOptions::default());
        let transaction = session.start_transaction(Some(TransactionOptions {
            read_concern: Some(doc! { "level": "snapshot" }),
            write_concern: None,
        }));

        let mut first = doc! { "insert": "users" };
        session.decorate(&mut first);
        assert_eq!(first.get_i64("txnNumber").unwrap(), transaction.number());
        assert!(!first.get_bool("autocommit").unwrap());
        assert!(first.get_bool("startTransaction").unwrap());
        assert!(first.contains_key("readConcern"));
        assert!(first.contains_key("lsid"));

        let mut second = doc! { "update": "users" };
        session.decorate(&mut second);
        assert!(!second.contains_key("startTransaction"));
        assert!(!second.contains_key("readConcern"));
        assert_eq!(second.get_i64("txnNumber").unwrap(), transaction.number());
    }
}
