//! Server-side cursors
//!
//! A cursor buffers one batch at a time and fetches the next with `getMore`
//! (or OP_GET_MORE on servers without cursor commands). Once the server
//! reports cursor id 0 the cursor is drained and its connection lease is
//! returned. Closing an open cursor sends `killCursors`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson, Document};
use futures::stream::{self, Stream};
use mongowire_common::{
    metrics, ConnectionError, ConnectionErrorKind, ConnectionErrorReason, Error, Result, ServerErrorReply,
};
use mongowire_protocol::{OpGetMore, OpKillCursors, OpReply, RequestMessage};
use tracing::{debug, warn};

use crate::execute::ExecuteOptions;
use crate::namespace::Namespace;
use crate::pool::ConnectionLease;
use crate::session::{ClientSession, Transaction};

const CURSOR_NOT_FOUND_CODE: i32 = 43;

/// How the cursor talks to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorProtocol {
    /// `getMore`/`killCursors` commands
    Command,
    /// OP_GET_MORE/OP_KILL_CURSORS
    Legacy,
}

#[derive(Debug, Clone, Default)]
pub struct CursorOptions {
    /// Documents per `getMore`; 0 lets the server decide
    pub batch_size: i32,
    /// Stop after this many documents
    pub limit: Option<usize>,
    pub timeout: Option<Duration>,
}

/// Session fields repeated on every `getMore` and `killCursors`
#[derive(Debug, Clone)]
struct CursorSession {
    lsid: Document,
    transaction: Option<Arc<Transaction>>,
}

impl CursorSession {
    fn capture(session: &ClientSession) -> Self {
        Self {
            lsid: session.id().to_document(),
            transaction: session.transaction(),
        }
    }

    fn decorate(&self, command: &mut Document) {
        command.insert("lsid", self.lsid.clone());
        if let Some(transaction) = &self.transaction {
            transaction.decorate(command);
        }
    }
}

struct CursorState {
    namespace: Namespace,
    id: i64,
    buffer: VecDeque<Document>,
    batch_size: i32,
    limit: Option<usize>,
    returned: usize,
    drained: bool,
    closed: bool,
    protocol: CursorProtocol,
    session: Option<CursorSession>,
    timeout: Option<Duration>,
    connection: Option<ConnectionLease>,
}

impl CursorState {
    fn limit_reached(&self) -> bool {
        self.limit.map_or(false, |limit| self.returned >= limit)
    }

    fn next_batch_size(&self) -> i32 {
        let Some(limit) = self.limit else {
            return self.batch_size;
        };

        let remaining = limit.saturating_sub(self.returned + self.buffer.len());
        let remaining = i32::try_from(remaining).unwrap_or(i32::MAX);
        if self.batch_size > 0 {
            remaining.min(self.batch_size)
        } else {
            remaining
        }
    }

    /// Finish the cursor once it is drained by id or exhausted by limit
    fn finish(&mut self) {
        self.drained = true;
        if self.id == 0 {
            self.connection = None;
        }
    }

    async fn get_more(&mut self) -> Result<usize> {
        if self.closed {
            return Err(cannot_get_more(ConnectionErrorReason::AlreadyClosed));
        }
        if self.drained || self.id == 0 {
            return Err(cannot_get_more(ConnectionErrorReason::CursorDrained));
        }
        let Some(connection) = self.connection.as_ref() else {
            return Err(cannot_get_more(ConnectionErrorReason::AlreadyClosed));
        };

        let batch_size = self.next_batch_size();
        let result = match self.protocol {
            CursorProtocol::Command => {
                command_get_more(
                    connection,
                    &self.namespace,
                    self.id,
                    batch_size,
                    self.session.as_ref(),
                    self.timeout,
                )
                .await
            }
            CursorProtocol::Legacy => {
                legacy_get_more(connection, &self.namespace, self.id, batch_size, self.timeout).await
            }
        };

        let (id, batch) = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("getMore on {} cursor {} failed: {}", self.namespace, self.id, e);
                // The server cursor is unusable; do not try to kill it
                self.closed = true;
                self.id = 0;
                self.buffer.clear();
                self.connection = None;
                return Err(e);
            }
        };

        let count = batch.len();
        metrics::record_get_more(count);
        debug!("getMore on {} cursor {} returned {} documents", self.namespace, self.id, count);

        self.buffer.extend(batch);
        self.id = id;
        if id == 0 {
            self.finish();
        }
        Ok(count)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();

        let id = std::mem::replace(&mut self.id, 0);
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        if id == 0 {
            return Ok(());
        }

        kill_cursor(&connection, &self.namespace, id, self.protocol, self.session.as_ref(), self.timeout).await
    }

    /// The limit was reached: nothing more will be returned, so the cursor
    /// counts as drained and the server cursor is released.
    async fn exhaust(&mut self) -> Result<()> {
        self.drained = true;
        self.buffer.clear();

        let id = std::mem::replace(&mut self.id, 0);
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        if id == 0 {
            return Ok(());
        }

        kill_cursor(&connection, &self.namespace, id, self.protocol, self.session.as_ref(), self.timeout).await
    }
}

impl Drop for CursorState {
    fn drop(&mut self) {
        if self.closed || self.id == 0 {
            return;
        }
        let Some(connection) = self.connection.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime to kill cursor {} on {}", self.id, self.namespace);
            return;
        };

        let namespace = self.namespace.clone();
        let (id, protocol, session, timeout) = (self.id, self.protocol, self.session.take(), self.timeout);
        runtime.spawn(async move {
            if let Err(e) = kill_cursor(&connection, &namespace, id, protocol, session.as_ref(), timeout).await {
                debug!("Background kill of cursor {} on {} failed: {}", id, namespace, e);
            }
        });
    }
}

/// A server cursor yielding `T`
pub struct Cursor<T> {
    state: CursorState,
    transform: Box<dyn FnMut(Document) -> Option<T> + Send>,
    terminated: bool,
}

impl Cursor<Document> {
    /// Wrap the `cursor` sub-document of a `find`/`aggregate` style reply
    pub fn from_command_reply(
        reply: &Document,
        connection: ConnectionLease,
        session: Option<&ClientSession>,
        options: CursorOptions,
    ) -> Result<Self> {
        let cursor = reply.get_document("cursor")?;
        let id = cursor_id(cursor)?;
        let namespace = Namespace::parse(cursor.get_str("ns")?)?;
        let batch = batch_documents(cursor, "firstBatch")?;

        let wire_version = connection.wire_version();
        let protocol = if wire_version.supports_cursor_commands() {
            CursorProtocol::Command
        } else {
            CursorProtocol::Legacy
        };
        let session = session
            .filter(|_| wire_version.supports_sessions())
            .map(CursorSession::capture);

        Ok(Self::with_state(namespace, id, batch, protocol, session, connection, options))
    }

    /// Wrap the OP_REPLY answering an OP_QUERY
    pub fn from_legacy_reply(
        namespace: Namespace,
        reply: OpReply,
        connection: ConnectionLease,
        options: CursorOptions,
    ) -> Result<Self> {
        check_legacy_reply(&reply, reply.cursor_id)?;
        Ok(Self::with_state(
            namespace,
            reply.cursor_id,
            reply.documents,
            CursorProtocol::Legacy,
            None,
            connection,
            options,
        ))
    }

    fn with_state(
        namespace: Namespace,
        id: i64,
        first_batch: Vec<Document>,
        protocol: CursorProtocol,
        session: Option<CursorSession>,
        connection: ConnectionLease,
        options: CursorOptions,
    ) -> Self {
        debug!(
            "Opened cursor {} on {} with {} buffered documents",
            id,
            namespace,
            first_batch.len()
        );

        let mut state = CursorState {
            namespace,
            id,
            buffer: first_batch.into(),
            batch_size: options.batch_size,
            limit: options.limit,
            returned: 0,
            drained: false,
            closed: false,
            protocol,
            session,
            timeout: options.timeout,
            connection: Some(connection),
        };
        if id == 0 {
            state.finish();
        }

        Self {
            state,
            transform: Box::new(Some),
            terminated: false,
        }
    }
}

impl<T: 'static> Cursor<T> {
    /// Next result, fetching a new batch when the buffer is empty.
    ///
    /// Returns `None` once the cursor is drained, the limit is reached, or a
    /// transform ends the iteration.
    pub async fn next(&mut self) -> Result<Option<T>> {
        loop {
            if self.terminated || self.state.limit_reached() {
                return Ok(None);
            }

            if let Some(document) = self.state.buffer.pop_front() {
                let Some(value) = (self.transform)(document) else {
                    self.terminated = true;
                    return Ok(None);
                };

                self.state.returned += 1;
                if self.state.limit_reached() {
                    if let Err(e) = self.state.exhaust().await {
                        warn!("Could not release cursor on {} after limit: {}", self.state.namespace, e);
                    }
                }
                return Ok(Some(value));
            }

            if self.state.drained || self.state.closed {
                return Ok(None);
            }
            self.state.get_more().await?;
        }
    }

    /// Fetch the next batch into the buffer; returns the number of documents received
    pub async fn get_more(&mut self) -> Result<usize> {
        self.state.get_more().await
    }

    /// Release the server cursor. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        self.state.close().await
    }

    pub fn id(&self) -> i64 {
        self.state.id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.state.namespace
    }

    pub fn protocol(&self) -> CursorProtocol {
        self.state.protocol
    }

    /// The server has no further results for this cursor
    pub fn is_drained(&self) -> bool {
        self.state.drained
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed
    }

    /// Documents buffered and not yet returned
    pub fn buffered(&self) -> usize {
        self.state.buffer.len()
    }

    /// Documents returned so far
    pub fn returned(&self) -> usize {
        self.state.returned
    }

    pub fn batch_size(&self) -> i32 {
        self.state.batch_size
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: i32) -> Self {
        self.state.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.state.limit = Some(limit);
        self
    }

    /// Transform every result
    pub fn map<U, F>(self, mut f: F) -> Cursor<U>
    where
        U: 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.map_while(move |value| Some(f(value)))
    }

    /// Transform results until `f` returns `None`, which ends the iteration
    pub fn map_while<U, F>(self, mut f: F) -> Cursor<U>
    where
        U: 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        let mut transform = self.transform;
        Cursor {
            state: self.state,
            transform: Box::new(move |document| transform(document).and_then(&mut f)),
            terminated: self.terminated,
        }
    }

    /// Read every remaining result
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.state.buffer.len());
        while let Some(value) = self.next().await? {
            results.push(value);
        }
        Ok(results)
    }

    /// Adapt into a [`Stream`]; the stream ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send
    where
        T: Send,
    {
        stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next().await {
                Ok(Some(value)) => Some((Ok(value), Some(cursor))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl<T> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("namespace", &self.state.namespace)
            .field("id", &self.state.id)
            .field("buffered", &self.state.buffer.len())
            .field("drained", &self.state.drained)
            .field("closed", &self.state.closed)
            .finish_non_exhaustive()
    }
}

fn cannot_get_more(reason: ConnectionErrorReason) -> Error {
    ConnectionError::new(ConnectionErrorKind::CannotGetMore, Some(reason)).into()
}

fn invalid_reply() -> Error {
    ConnectionError::new(
        ConnectionErrorKind::InvalidResponse,
        Some(ConnectionErrorReason::InvalidReplyType),
    )
    .into()
}

fn cursor_id(cursor: &Document) -> Result<i64> {
    match cursor.get("id") {
        Some(Bson::Int64(id)) => Ok(*id),
        Some(Bson::Int32(id)) => Ok(i64::from(*id)),
        _ => Err(invalid_reply()),
    }
}

fn batch_documents(cursor: &Document, key: &str) -> Result<Vec<Document>> {
    cursor
        .get_array(key)?
        .iter()
        .map(|value| match value {
            Bson::Document(document) => Ok(document.clone()),
            _ => Err(invalid_reply()),
        })
        .collect()
}

/// Surface the OP_REPLY failure flags as query failures
fn check_legacy_reply(reply: &OpReply, cursor_id: i64) -> Result<()> {
    if reply.cursor_not_found() {
        return Err(ConnectionError::server_failure(
            ConnectionErrorKind::QueryFailure,
            ServerErrorReply {
                code: Some(CURSOR_NOT_FOUND_CODE),
                code_name: Some("CursorNotFound".to_string()),
                message: format!("cursor id {cursor_id} not found"),
            },
        )
        .into());
    }

    if reply.query_failure() {
        let server = reply
            .documents
            .first()
            .map_or_else(|| ServerErrorReply::from_document(&Document::new()), ServerErrorReply::from_document);
        return Err(ConnectionError::server_failure(ConnectionErrorKind::QueryFailure, server).into());
    }
    Ok(())
}

async fn command_get_more(
    connection: &ConnectionLease,
    namespace: &Namespace,
    id: i64,
    batch_size: i32,
    session: Option<&CursorSession>,
    timeout: Option<Duration>,
) -> Result<(i64, Vec<Document>)> {
    let mut command = doc! { "getMore": id, "collection": namespace.collection.as_str() };
    if batch_size > 0 {
        command.insert("batchSize", batch_size);
    }
    if let Some(session) = session {
        session.decorate(&mut command);
    }

    let reply = connection
        .execute(&namespace.database, command, ExecuteOptions { session: None, timeout })
        .await?;
    let cursor = reply.get_document("cursor")?;
    Ok((cursor_id(cursor)?, batch_documents(cursor, "nextBatch")?))
}

async fn legacy_get_more(
    connection: &ConnectionLease,
    namespace: &Namespace,
    id: i64,
    batch_size: i32,
    timeout: Option<Duration>,
) -> Result<(i64, Vec<Document>)> {
    let message = RequestMessage::GetMore(OpGetMore {
        full_collection_name: namespace.full_name(),
        number_to_return: batch_size,
        cursor_id: id,
    });

    let reply = connection.send_request(&message, timeout).await?.into_legacy()?;
    check_legacy_reply(&reply, id)?;
    Ok((reply.cursor_id, reply.documents))
}

async fn kill_cursor(
    connection: &ConnectionLease,
    namespace: &Namespace,
    id: i64,
    protocol: CursorProtocol,
    session: Option<&CursorSession>,
    timeout: Option<Duration>,
) -> Result<()> {
    let outcome = match protocol {
        CursorProtocol::Command => {
            let mut command = doc! { "killCursors": namespace.collection.as_str(), "cursors": [id] };
            if let Some(session) = session {
                session.decorate(&mut command);
            }
            connection
                .execute(&namespace.database, command, ExecuteOptions { session: None, timeout })
                .await
                .map(|_| ())
        }
        CursorProtocol::Legacy => {
            connection
                .send_without_reply(&RequestMessage::KillCursors(OpKillCursors { cursor_ids: vec![id] }))
                .await
        }
    };

    match outcome {
        Ok(()) => {
            debug!("Killed cursor {} on {}", id, namespace);
            metrics::record_cursor_killed();
            Ok(())
        }
        Err(e) => {
            warn!("Could not kill cursor {} on {}: {}", id, namespace, e);
            let server = match e {
                Error::Connection(ConnectionError { server, .. }) => server,
                _ => None,
            };
            Err(ConnectionError {
                kind: ConnectionErrorKind::CannotCloseCursor,
                reason: None,
                server,
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoAuthenticator;
    use crate::pool::ConnectionPool;
    use crate::testing::{MockReply, MockServer};
    use mongowire_common::{ClientConfig, Host};
    use mongowire_protocol::ReplyFlags;
    use std::sync::Arc;

    const NS: &str = "app.users";

    fn docs(range: std::ops::Range<i32>) -> Vec<Document> {
        range.map(|i| doc! { "_id": i }).collect()
    }

    async fn lease(server: &MockServer) -> ConnectionLease {
        let config = ClientConfig {
            hosts: vec![Host::new("mock", 27017)],
            ..ClientConfig::default()
        };
        let pool = ConnectionPool::new(&config, Arc::new(server.clone()), Arc::new(NoAuthenticator));
        pool.reserve(true, None).await.unwrap()
    }

    fn first_reply(id: i64, batch: Vec<Document>) -> Document {
        match MockReply::first_batch(id, NS, batch) {
            MockReply::Document(document) => document,
            _ => unreachable!(),
        }
    }

    /// Serves `total` documents in batches, counting from `first`
    fn paging_server(first: i32, total: i32) -> MockServer {
        let next = Arc::new(parking_lot::Mutex::new(first));
        MockServer::new(move |request| {
            let Some(command) = request.command_document() else {
                return MockReply::ok();
            };
            if command.contains_key("getMore") {
                let batch = command.get_i32("batchSize").unwrap_or(2);
                let mut next = next.lock();
                let end = (*next + batch).min(total);
                let documents = docs(*next..end);
                *next = end;
                let id = if end >= total { 0 } else { 42 };
                MockReply::next_batch(id, NS, documents)
            } else {
                MockReply::ok()
            }
        })
    }

    #[tokio::test]
    async fn test_iterates_across_batches() {
        let server = paging_server(2, 5);
        let lease = lease(&server).await;
        let options = CursorOptions {
            batch_size: 2,
            ..CursorOptions::default()
        };
        let mut cursor = Cursor::from_command_reply(&first_reply(42, docs(0..2)), lease, None, options).unwrap();
        assert!(!cursor.is_drained());

        let mut ids = Vec::new();
        let mut drained = Vec::new();
        while let Some(document) = cursor.next().await.unwrap() {
            ids.push(document.get_i32("_id").unwrap());
            drained.push(cursor.is_drained());
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        // Only the batch carrying id 0 drains the cursor
        assert_eq!(drained, vec![false, false, false, false, true]);
        assert!(cursor.is_drained());
        assert!(!cursor.is_closed());

        let get_mores: Vec<_> = server
            .commands()
            .into_iter()
            .filter(|command| command.contains_key("getMore"))
            .collect();
        assert_eq!(get_mores.len(), 2);
        assert_eq!(get_mores[0].get_i64("getMore").unwrap(), 42);
        assert_eq!(get_mores[0].get_str("collection").unwrap(), "users");
        assert_eq!(get_mores[0].get_str("$db").unwrap(), "app");
    }

    #[tokio::test]
    async fn test_drained_cursor_rejects_get_more() {
        let server = MockServer::ok();
        let lease = lease(&server).await;
        let mut cursor =
            Cursor::from_command_reply(&first_reply(0, docs(0..1)), lease, None, CursorOptions::default()).unwrap();

        assert!(cursor.is_drained());
        let err = cursor.get_more().await.unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::CannotGetMore));
        assert_eq!(err.connection_reason(), Some(ConnectionErrorReason::CursorDrained));

        assert!(cursor.next().await.unwrap().is_some());
        assert!(cursor.next().await.unwrap().is_none());
        // No getMore was sent and nothing needs killing
        cursor.close().await.unwrap();
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_close_kills_once_then_rejects_get_more() {
        let server = MockServer::ok();
        let lease = lease(&server).await;
        let mut cursor =
            Cursor::from_command_reply(&first_reply(42, docs(0..2)), lease, None, CursorOptions::default()).unwrap();

        cursor.close().await.unwrap();
        cursor.close().await.unwrap();

        let commands = server.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].get_str("killCursors").unwrap(), "users");
        assert_eq!(commands[0].get_array("cursors").unwrap(), &vec![Bson::Int64(42)]);

        let err = cursor.get_more().await.unwrap_err();
        assert_eq!(err.connection_reason(), Some(ConnectionErrorReason::AlreadyClosed));
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_limit_caps_batches_and_kills_cursor() {
        let server = paging_server(2, 100);
        let lease = lease(&server).await;
        let options = CursorOptions {
            batch_size: 10,
            limit: Some(3),
            timeout: None,
        };
        let cursor = Cursor::from_command_reply(&first_reply(42, docs(0..2)), lease, None, options).unwrap();

        let results = cursor.collect_all().await.unwrap();
        assert_eq!(results.len(), 3);

        let commands = server.commands();
        assert_eq!(commands[0].get_i32("batchSize").unwrap(), 1);
        assert!(commands[1].contains_key("killCursors"));
        assert_eq!(commands.len(), 2);
    }

    #[tokio::test]
    async fn test_limit_inside_first_batch_drains_cursor() {
        let server = MockServer::ok();
        let lease = lease(&server).await;
        let options = CursorOptions {
            limit: Some(2),
            ..CursorOptions::default()
        };
        let mut cursor = Cursor::from_command_reply(&first_reply(42, docs(0..5)), lease, None, options).unwrap();

        assert!(cursor.next().await.unwrap().is_some());
        assert!(!cursor.is_drained());
        assert!(cursor.next().await.unwrap().is_some());
        assert!(cursor.is_drained());
        assert!(!cursor.is_closed());
        assert_eq!(cursor.returned(), 2);
        assert_eq!(cursor.buffered(), 0);
        assert!(cursor.next().await.unwrap().is_none());

        let err = cursor.get_more().await.unwrap_err();
        assert_eq!(err.connection_reason(), Some(ConnectionErrorReason::CursorDrained));

        let commands = server.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].get_array("cursors").unwrap(), &vec![Bson::Int64(42)]);

        // Nothing left to kill
        cursor.close().await.unwrap();
        assert_eq!(server.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_in_transaction_repeats_transaction_fields() {
        let server = MockServer::new(|request| match request.command_document() {
            Some(command) if command.contains_key("find") => MockReply::first_batch(42, NS, docs(0..1)),
            Some(command) if command.contains_key("getMore") => MockReply::next_batch(42, NS, docs(1..2)),
            _ => MockReply::ok(),
        });
        let lease = lease(&server).await;
        let sessions = crate::session::SessionManager::new();
        let session = sessions.retain_session(crate::session::SessionOptions::default());
        let transaction = session.start_transaction(None);

        let reply = lease
            .execute(
                "app",
                doc! { "find": "users" },
                ExecuteOptions {
                    session: Some(&session),
                    timeout: None,
                },
            )
            .await
            .unwrap();
        let mut cursor = Cursor::from_command_reply(&reply, lease, Some(&session), CursorOptions::default()).unwrap();

        assert!(cursor.next().await.unwrap().is_some());
        assert!(cursor.next().await.unwrap().is_some());
        cursor.close().await.unwrap();

        let commands = server.commands();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].get_bool("startTransaction").unwrap());
        for command in &commands[1..] {
            assert_eq!(command.get_document("lsid").unwrap(), &session.id().to_document());
            assert_eq!(command.get_i64("txnNumber").unwrap(), transaction.number());
            assert!(!command.get_bool("autocommit").unwrap());
            assert!(!command.contains_key("startTransaction"));
        }
        assert!(commands[1].contains_key("getMore"));
        assert!(commands[2].contains_key("killCursors"));
    }

    #[tokio::test]
    async fn test_map_while_terminates() {
        let server = MockServer::ok();
        let lease = lease(&server).await;
        let cursor =
            Cursor::from_command_reply(&first_reply(0, docs(0..5)), lease, None, CursorOptions::default()).unwrap();

        let below_three = cursor
            .map(|document| document.get_i32("_id").unwrap())
            .map_while(|id| (id < 3).then_some(id))
            .collect_all()
            .await
            .unwrap();
        assert_eq!(below_three, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_server_error_surfaces_and_closes() {
        let server = MockServer::new(|request| match request.command_document() {
            Some(command) if command.contains_key("getMore") => MockReply::Document(doc! {
                "ok": 0.0,
                "errmsg": "cursor id 42 not found",
                "code": 43,
                "codeName": "CursorNotFound",
            }),
            _ => MockReply::ok(),
        });
        let lease = lease(&server).await;
        let mut cursor =
            Cursor::from_command_reply(&first_reply(42, Vec::new()), lease, None, CursorOptions::default()).unwrap();

        let err = cursor.next().await.unwrap_err();
        match err {
            Error::Connection(e) => {
                assert_eq!(e.kind, ConnectionErrorKind::QueryFailure);
                assert_eq!(e.server.unwrap().code, Some(43));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(cursor.is_closed());
        cursor.close().await.unwrap();
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_legacy_get_more_and_kill() {
        let server = MockServer::new(|request| match request {
            RequestMessage::GetMore(get_more) => {
                assert_eq!(get_more.full_collection_name, NS);
                assert_eq!(get_more.cursor_id, 7);
                MockReply::Legacy(OpReply::new(7, 2, docs(2..4)))
            }
            _ => MockReply::Silent,
        })
        .with_max_wire_version(3);
        let lease = lease(&server).await;
        let mut cursor = Cursor::from_legacy_reply(
            Namespace::parse(NS).unwrap(),
            OpReply::new(7, 0, docs(0..2)),
            lease,
            CursorOptions {
                batch_size: 2,
                ..CursorOptions::default()
            },
        )
        .unwrap();
        assert_eq!(cursor.protocol(), CursorProtocol::Legacy);

        for _ in 0..4 {
            assert!(cursor.next().await.unwrap().is_some());
        }
        cursor.close().await.unwrap();

        // Fire-and-forget kill; wait for the server to record it
        for _ in 0..100 {
            if server.requests().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        match &server.requests()[1] {
            RequestMessage::KillCursors(kill) => assert_eq!(kill.cursor_ids, vec![7]),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_legacy_cursor_not_found() {
        let server = MockServer::new(|_| {
            let mut reply = OpReply::new(0, 0, Vec::new());
            reply.flags = ReplyFlags::CURSOR_NOT_FOUND;
            MockReply::Legacy(reply)
        })
        .with_max_wire_version(3);
        let lease = lease(&server).await;
        let mut cursor = Cursor::from_legacy_reply(
            Namespace::parse(NS).unwrap(),
            OpReply::new(7, 0, Vec::new()),
            lease,
            CursorOptions::default(),
        )
        .unwrap();

        let err = cursor.get_more().await.unwrap_err();
        match err {
            Error::Connection(e) => assert_eq!(e.server.unwrap().code_name.as_deref(), Some("CursorNotFound")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropping_open_cursor_kills_it() {
        let server = MockServer::ok();
        let lease = lease(&server).await;
        let cursor =
            Cursor::from_command_reply(&first_reply(42, docs(0..1)), lease, None, CursorOptions::default()).unwrap();
        drop(cursor);

        for _ in 0..100 {
            if !server.commands().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(server.commands()[0].contains_key("killCursors"));
    }

    #[tokio::test]
    async fn test_stream_adapter() {
        use futures::StreamExt;

        let server = paging_server(1, 3);
        let lease = lease(&server).await;
        let cursor =
            Cursor::from_command_reply(&first_reply(42, docs(0..1)), lease, None, CursorOptions::default()).unwrap();

        let results: Vec<Result<Document>> = cursor.into_stream().collect().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(Result::is_ok));
    }
}
