//! In-process scripted server for tests
//!
//! [`MockServer`] implements [`Connector`] over `tokio::io::duplex` pipes.
//! The `isMaster` handshake is answered automatically; every other request
//! is recorded and passed to the handler.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongowire_common::{ConnectionError, ConnectionErrorKind, Host, Result};
use mongowire_protocol::{MessageHeader, OpMsg, OpReply, RequestMessage, WireMessage, HEADER_SIZE};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::transport::{BoxedStream, Connector};

type Handler = Box<dyn Fn(&RequestMessage) -> MockReply + Send + Sync>;

/// What the server does with a request
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer in the request's own framing (OP_MSG or OP_REPLY)
    Document(Document),
    /// Answer with a raw OP_REPLY
    Legacy(OpReply),
    /// Never answer
    Silent,
    /// Drop the connection
    Hangup,
    /// Write these bytes verbatim
    Raw(Vec<u8>),
}

impl MockReply {
    pub fn ok() -> Self {
        MockReply::Document(doc! { "ok": 1.0 })
    }

    /// A `find`-style reply opening a cursor
    pub fn first_batch(cursor_id: i64, namespace: &str, documents: Vec<Document>) -> Self {
        Self::batch("firstBatch", cursor_id, namespace, documents)
    }

    /// A `getMore` reply
    pub fn next_batch(cursor_id: i64, namespace: &str, documents: Vec<Document>) -> Self {
        Self::batch("nextBatch", cursor_id, namespace, documents)
    }

    fn batch(key: &str, cursor_id: i64, namespace: &str, documents: Vec<Document>) -> Self {
        let batch: Vec<Bson> = documents.into_iter().map(Bson::Document).collect();
        let mut cursor = doc! { "id": cursor_id, "ns": namespace };
        cursor.insert(key, batch);
        MockReply::Document(doc! { "cursor": cursor, "ok": 1.0 })
    }
}

struct MockState {
    handler: Handler,
    max_wire_version: AtomicI32,
    next_reply_id: AtomicI32,
    connections: AtomicUsize,
    refuse_all: AtomicBool,
    refused: Mutex<HashSet<Host>>,
    secondaries: Mutex<HashSet<Host>>,
    requests: Mutex<Vec<RequestMessage>>,
}

/// A scripted MongoDB server reachable through [`Connector`]
#[derive(Clone)]
pub struct MockServer {
    state: Arc<MockState>,
}

impl MockServer {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&RequestMessage) -> MockReply + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(MockState {
                handler: Box::new(handler),
                max_wire_version: AtomicI32::new(7),
                next_reply_id: AtomicI32::new(1),
                connections: AtomicUsize::new(0),
                refuse_all: AtomicBool::new(false),
                refused: Mutex::new(HashSet::new()),
                secondaries: Mutex::new(HashSet::new()),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Answers every request with `{ok: 1}`
    pub fn ok() -> Self {
        Self::new(|_| MockReply::ok())
    }

    pub fn with_max_wire_version(self, version: i32) -> Self {
        self.state.max_wire_version.store(version, Ordering::SeqCst);
        self
    }

    /// Refuse new connections to `host`
    pub fn refuse(&self, host: &Host) {
        self.state.refused.lock().insert(host.clone());
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.state.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Report `host` as a secondary in its handshake
    pub fn make_secondary(&self, host: &Host) {
        self.state.secondaries.lock().insert(host.clone());
    }

    /// Requests received, handshakes excluded
    pub fn requests(&self) -> Vec<RequestMessage> {
        self.state.requests.lock().clone()
    }

    /// Command documents of the OP_MSG and OP_QUERY requests received
    pub fn commands(&self) -> Vec<Document> {
        self.state
            .requests
            .lock()
            .iter()
            .filter_map(|request| request.command_document().cloned())
            .collect()
    }

    /// Connections accepted so far
    pub fn connections_opened(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockServer {
    async fn connect(&self, host: &Host) -> Result<BoxedStream> {
        if self.state.refuse_all.load(Ordering::SeqCst) || self.state.refused.lock().contains(host) {
            return Err(ConnectionError::new(ConnectionErrorKind::CannotConnect, None).into());
        }

        let (client, server) = tokio::io::duplex(256 * 1024);
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(Arc::clone(&self.state), host.clone(), server));
        Ok(Box::new(client))
    }
}

fn is_handshake(request: &RequestMessage) -> bool {
    match request {
        RequestMessage::Query(query) => {
            query.full_collection_name == "admin.$cmd"
                && (query.query.contains_key("isMaster") || query.query.contains_key("ismaster"))
        }
        _ => false,
    }
}

fn handshake_reply(state: &MockState, host: &Host) -> Document {
    let max_wire_version = state.max_wire_version.load(Ordering::SeqCst);
    let mut reply = doc! {
        "ismaster": !state.secondaries.lock().contains(host),
        "maxWireVersion": max_wire_version,
        "minWireVersion": 0,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "ok": 1.0,
    };
    if max_wire_version >= 6 {
        reply.insert("logicalSessionTimeoutMinutes", 30);
    }
    reply
}

async fn serve(state: Arc<MockState>, host: Host, mut stream: DuplexStream) {
    loop {
        let mut header_bytes = [0u8; HEADER_SIZE];
        if stream.read_exact(&mut header_bytes).await.is_err() {
            return;
        }
        let Ok(header) = MessageHeader::decode(&mut &header_bytes[..]) else {
            return;
        };
        let mut body = vec![0u8; header.body_length()];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let Ok(request) = RequestMessage::decode(&header, &body) else {
            return;
        };

        let reply_id = state.next_reply_id.fetch_add(1, Ordering::SeqCst);

        let reply = if is_handshake(&request) {
            MockReply::Legacy(OpReply::new(0, 0, vec![handshake_reply(&state, &host)]))
        } else {
            state.requests.lock().push(request.clone());
            (state.handler)(&request)
        };

        if matches!(reply, MockReply::Hangup) {
            return;
        }
        if !request.expects_reply() {
            continue;
        }

        let encoded = match reply {
            MockReply::Document(document) => match request {
                RequestMessage::Msg(_) => OpMsg::command(document).encode(reply_id, header.request_id),
                _ => OpReply::new(0, 0, vec![document]).encode(reply_id, header.request_id),
            }
            .map(|bytes| bytes.to_vec()),
            MockReply::Legacy(reply) => reply.encode(reply_id, header.request_id).map(|bytes| bytes.to_vec()),
            MockReply::Raw(bytes) => Ok(bytes),
            MockReply::Silent | MockReply::Hangup => continue,
        };

        let Ok(bytes) = encoded else {
            return;
        };
        if stream.write_all(&bytes).await.is_err() {
            return;
        }
    }
}
