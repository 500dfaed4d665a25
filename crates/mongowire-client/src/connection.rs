//! Connection management for MongoWire
//!
//! Each connection owns a background receive task that frames replies with
//! [`ReplyCodec`] and hands each one to the waiter registered under its
//! `responseTo`. Foreground callers write requests concurrently; only the
//! write phase is serialized.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::StreamExt;
use mongowire_common::{
    metrics, ConnectionError, ConnectionErrorKind, ConnectionErrorReason, Host, Result, ServerErrorReply,
};
use mongowire_protocol::{OpQuery, ReplyCodec, RequestMessage, ServerReply};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use crate::handshake::{is_master_command, ServerHandshake, WireVersion};
use crate::transport::BoxedStream;

pub type ConnectionId = u64;

type Waiter = oneshot::Sender<Result<ServerReply>>;
type CloseCallback = Box<dyn FnOnce(ConnectionId) + Send>;

/// State shared between the connection handle and its receive task
struct Shared {
    id: ConnectionId,
    host: Host,
    pending: DashMap<i32, Waiter>,
    alive: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
}

impl Shared {
    /// Mark the connection dead, run the close callback once, then fail every waiter
    fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(on_close) = self.on_close.lock().take() {
            on_close(self.id);
        }

        let ids: Vec<i32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for request_id in ids {
            if let Some((_, waiter)) = self.pending.remove(&request_id) {
                let _ = waiter.send(Err(ConnectionError::connection_closed().into()));
            }
        }

        metrics::record_connection_closed(&self.host.to_string());
    }
}

/// Removes a waiter that was abandoned by timeout or cancellation
struct PendingGuard<'a> {
    pending: &'a DashMap<i32, Waiter>,
    request_id: i32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

/// A connection to a MongoDB server
pub struct Connection {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    next_request_id: AtomicI32,
    handshake: RwLock<Option<ServerHandshake>>,
    authenticated: Mutex<HashSet<String>>,
    leases: AtomicUsize,
    receiver: JoinHandle<()>,
}

impl Connection {
    /// Wrap an established transport and start its receive task.
    ///
    /// `on_close` runs once, when the connection dies or is closed.
    pub fn open(id: ConnectionId, host: Host, stream: BoxedStream, on_close: Option<CloseCallback>) -> Self {
        let (reader, writer) = tokio::io::split(stream);

        let shared = Arc::new(Shared {
            id,
            host,
            pending: DashMap::new(),
            alive: AtomicBool::new(true),
            on_close: Mutex::new(on_close),
        });

        let receiver = tokio::spawn(receive_loop(Arc::clone(&shared), reader));

        info!("Connection {} opened to {}", id, shared.host);
        metrics::record_connection_opened(&shared.host.to_string());

        Self {
            shared,
            writer: tokio::sync::Mutex::new(writer),
            next_request_id: AtomicI32::new(1),
            handshake: RwLock::new(None),
            authenticated: Mutex::new(HashSet::new()),
            leases: AtomicUsize::new(0),
            receiver,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn host(&self) -> &Host {
        &self.shared.host
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Requests currently awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    fn next_request_id(&self) -> i32 {
        // fetch_add wraps on overflow
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `message` and wait for the reply whose `responseTo` matches.
    ///
    /// On timeout the waiter is evicted and the connection stays usable.
    pub async fn send_request(&self, message: &RequestMessage, timeout: Option<Duration>) -> Result<ServerReply> {
        if !self.is_alive() {
            return Err(ConnectionError::connection_closed().into());
        }

        let request_id = self.next_request_id();
        let bytes = message.encode(request_id)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(request_id, tx);
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            request_id,
        };

        // The receive task may have shut down between the liveness check and registration
        if !self.is_alive() {
            return Err(ConnectionError::connection_closed().into());
        }

        self.write(&bytes).await?;
        metrics::record_message_sent(message.op_code().as_str(), bytes.len());

        let started = Instant::now();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        "Request {} on connection {} timed out after {:?}",
                        request_id, self.shared.id, limit
                    );
                    metrics::record_query_timeout();
                    return Err(ConnectionError::timeout().into());
                }
            },
            None => rx.await,
        };

        let reply = outcome.map_err(|_| ConnectionError::connection_closed())??;
        metrics::record_query_latency(message.op_code().as_str(), started.elapsed().as_secs_f64() * 1000.0);
        Ok(reply)
    }

    /// Send a message the server does not answer (legacy writes, OP_KILL_CURSORS)
    pub async fn send_without_reply(&self, message: &RequestMessage) -> Result<()> {
        if !self.is_alive() {
            return Err(ConnectionError::connection_closed().into());
        }

        let bytes = message.encode(self.next_request_id())?;
        self.write(&bytes).await?;
        metrics::record_message_sent(message.op_code().as_str(), bytes.len());
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let written = match writer.write_all(bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            error!("Write to connection {} failed: {}", self.shared.id, e);
            self.shared.shutdown();
            return Err(e.into());
        }
        Ok(())
    }

    /// Run the `isMaster` handshake and record the server's capabilities
    pub async fn handshake(&self, app_name: Option<&str>, timeout: Option<Duration>) -> Result<ServerHandshake> {
        let query = OpQuery {
            number_to_return: 1,
            ..OpQuery::command("admin", is_master_command(app_name))
        };

        let handshake_failed = || ConnectionError::new(ConnectionErrorKind::CannotConnect, Some(ConnectionErrorReason::HandshakeFailed));

        let reply = self
            .send_request(&RequestMessage::Query(query), timeout)
            .await?
            .into_command_document()
            .map_err(|_| handshake_failed())?;

        if crate::execute::assert_ok(&reply).is_err() {
            let server = ServerErrorReply::from_document(&reply);
            warn!("Handshake with {} rejected: {}", self.shared.host, server);
            return Err(handshake_failed().into());
        }

        let handshake: ServerHandshake = bson::from_document(reply).map_err(|e| {
            warn!("Handshake reply from {} is malformed: {}", self.shared.host, e);
            handshake_failed()
        })?;

        debug!(
            "Connection {} handshake: ismaster={} maxWireVersion={}",
            self.shared.id, handshake.is_master, handshake.max_wire_version
        );
        *self.handshake.write() = Some(handshake.clone());
        Ok(handshake)
    }

    pub fn server_handshake(&self) -> Option<ServerHandshake> {
        self.handshake.read().clone()
    }

    /// Wire version from the handshake; 0 before it completes
    pub fn wire_version(&self) -> WireVersion {
        self.handshake
            .read()
            .as_ref()
            .map_or(WireVersion(0), ServerHandshake::wire_version)
    }

    pub fn is_writable(&self) -> bool {
        self.handshake.read().as_ref().map_or(false, ServerHandshake::is_writable)
    }

    pub fn is_readable(&self, slave_ok: bool) -> bool {
        self.handshake
            .read()
            .as_ref()
            .map_or(false, |handshake| handshake.is_readable(slave_ok))
    }

    pub fn is_authenticated_for(&self, database: &str) -> bool {
        self.authenticated.lock().contains(database)
    }

    pub fn mark_authenticated(&self, database: &str) {
        self.authenticated.lock().insert(database.to_string());
    }

    /// Number of outstanding leases on this connection
    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire_lease(&self) {
        self.leases.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_lease(&self) {
        let _ = self
            .leases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Close the transport and fail outstanding waiters
    pub async fn close(&self) {
        debug!("Closing connection {}", self.shared.id);
        self.receiver.abort();
        self.shared.shutdown();
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("host", &self.shared.host)
            .field("alive", &self.is_alive())
            .field("pending", &self.shared.pending.len())
            .finish_non_exhaustive()
    }
}

async fn receive_loop(shared: Arc<Shared>, reader: ReadHalf<BoxedStream>) {
    let mut frames = FramedRead::new(reader, ReplyCodec::new());

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(reply) => {
                let response_to = reply.response_to();
                match shared.pending.remove(&response_to) {
                    Some((_, waiter)) => {
                        metrics::record_reply_received();
                        // The caller may have given up in the meantime
                        let _ = waiter.send(Ok(reply));
                    }
                    None => {
                        warn!(
                            "Dropping reply to unknown request {} on connection {}",
                            response_to, shared.id
                        );
                        metrics::record_unmatched_reply();
                    }
                }
            }
            Err(e) => {
                error!("Connection {} receive error: {}", shared.id, e);
                break;
            }
        }
    }

    debug!("Receive loop for connection {} ended", shared.id);
    shared.shutdown();
}
