//! Command execution on a single connection

use std::time::Duration;

use bson::{Bson, Document};
use mongowire_common::{ConnectionError, ConnectionErrorKind, Result, ServerErrorReply};
use mongowire_protocol::{OpCode, RequestMessage};
use tracing::debug;

use crate::connection::Connection;
use crate::session::ClientSession;

/// Per-command execution settings
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions<'a> {
    /// Session whose `lsid` (and transaction fields) are attached
    pub session: Option<&'a ClientSession>,
    pub timeout: Option<Duration>,
}

/// Fail with the server's error unless the reply reports `ok: 1`
pub fn assert_ok(reply: &Document) -> Result<()> {
    let ok = match reply.get("ok") {
        Some(Bson::Double(v)) => (*v - 1.0).abs() < f64::EPSILON,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(ConnectionError::server_failure(ConnectionErrorKind::QueryFailure, ServerErrorReply::from_document(reply)).into())
    }
}

impl Connection {
    /// Frame `command` for this server: OP_MSG with `$db` when supported, otherwise OP_QUERY on `$cmd`
    pub fn prepare_command(
        &self,
        database: &str,
        mut command: Document,
        session: Option<&ClientSession>,
    ) -> Result<RequestMessage> {
        let wire_version = self.wire_version();

        if let Some(session) = session {
            if wire_version.supports_sessions() {
                session.decorate(&mut command);
            }
        }

        if wire_version.supports_op_msg() {
            command.insert("$db", database);
            RequestMessage::command(OpCode::Msg, database, command)
        } else {
            RequestMessage::command(OpCode::Query, database, command)
        }
    }

    /// Run `command` against `database` and return the reply document
    pub async fn execute(&self, database: &str, command: Document, options: ExecuteOptions<'_>) -> Result<Document> {
        let name = command.keys().next().cloned().unwrap_or_default();
        let message = self.prepare_command(database, command, options.session)?;

        debug!("Executing '{}' on {} via connection {}", name, database, self.id());

        let reply = self
            .send_request(&message, options.timeout)
            .await?
            .into_command_document()?;

        if let Err(e) = assert_ok(&reply) {
            debug!("Command '{}' failed: {}", name, e);
            return Err(e);
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionManager, SessionOptions};
    use crate::testing::{MockReply, MockServer};
    use crate::transport::Connector;
    use bson::doc;
    use mongowire_common::{ConnectionErrorReason, Host};
    use rstest::rstest;

    async fn connect(server: &MockServer) -> Connection {
        let host = Host::new("mock", 27017);
        let stream = server.connect(&host).await.unwrap();
        let connection = Connection::open(1, host, stream, None);
        connection.handshake(None, Some(Duration::from_secs(5))).await.unwrap();
        connection
    }

    #[rstest]
    #[case(doc! { "ok": 1.0 }, true)]
    #[case(doc! { "ok": 1 }, true)]
    #[case(doc! { "ok": 1_i64 }, true)]
    #[case(doc! { "ok": true }, true)]
    #[case(doc! { "ok": 0.0, "errmsg": "nope" }, false)]
    #[case(doc! { "$err": "legacy" }, false)]
    fn test_assert_ok(#[case] reply: Document, #[case] ok: bool) {
        assert_eq!(assert_ok(&reply).is_ok(), ok);
    }

    #[test]
    fn test_failure_carries_server_reply() {
        let err = assert_ok(&doc! { "ok": 0.0, "errmsg": "ns not found", "code": 26, "codeName": "NamespaceNotFound" })
            .unwrap_err();
        match err {
            mongowire_common::Error::Connection(e) => {
                assert_eq!(e.kind, ConnectionErrorKind::QueryFailure);
                assert_eq!(e.server.unwrap().code, Some(26));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_modern_server_gets_op_msg_with_db_and_lsid() {
        let server = MockServer::new(|_| MockReply::Document(doc! { "ok": 1.0, "n": 3 }));
        let connection = connect(&server).await;
        let manager = SessionManager::new();
        let session = manager.retain_session(SessionOptions::default());

        let reply = connection
            .execute(
                "app",
                doc! { "count": "users" },
                ExecuteOptions {
                    session: Some(&session),
                    timeout: Some(Duration::from_secs(5)),
                },
            )
            .await
            .unwrap();
        assert_eq!(reply.get_i32("n").unwrap(), 3);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].op_code(), OpCode::Msg);
        let command = requests[0].command_document().unwrap();
        assert_eq!(command.get_str("$db").unwrap(), "app");
        assert_eq!(command.get_document("lsid").unwrap(), &session.id().to_document());
    }

    #[tokio::test]
    async fn test_old_server_gets_op_query() {
        let server = MockServer::new(|_| MockReply::ok()).with_max_wire_version(3);
        let connection = connect(&server).await;
        let manager = SessionManager::new();
        let session = manager.retain_session(SessionOptions::default());

        connection
            .execute("app", doc! { "ping": 1 }, ExecuteOptions { session: Some(&session), timeout: None })
            .await
            .unwrap();

        match &server.requests()[0] {
            RequestMessage::Query(query) => {
                assert_eq!(query.full_collection_name, "app.$cmd");
                assert!(!query.query.contains_key("$db"));
                assert!(!query.query.contains_key("lsid"));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection_usable() {
        let server = MockServer::new(|request| match request.command_document() {
            Some(command) if command.contains_key("drop") => {
                MockReply::Document(doc! { "ok": 0.0, "errmsg": "ns not found", "code": 26 })
            }
            _ => MockReply::ok(),
        });
        let connection = connect(&server).await;

        let err = connection
            .execute("app", doc! { "drop": "missing" }, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::QueryFailure));
        assert!(connection.is_alive());

        connection
            .execute("app", doc! { "ping": 1 }, ExecuteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_timeout_then_reuse() {
        let server = MockServer::new(|request| match request.command_document() {
            Some(command) if command.contains_key("sleep") => MockReply::Silent,
            _ => MockReply::ok(),
        });
        let connection = connect(&server).await;

        let err = connection
            .execute(
                "app",
                doc! { "sleep": 1 },
                ExecuteOptions {
                    session: None,
                    timeout: Some(Duration::from_millis(30)),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::QueryTimeout));
        assert_eq!(connection.pending_requests(), 0);

        connection
            .execute("app", doc! { "ping": 1 }, ExecuteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_garbage_reply_tears_down_connection() {
        let server = MockServer::new(|_| {
            // A header declaring an unknown opcode
            let mut raw = Vec::new();
            raw.extend_from_slice(&16i32.to_le_bytes());
            raw.extend_from_slice(&1i32.to_le_bytes());
            raw.extend_from_slice(&0i32.to_le_bytes());
            raw.extend_from_slice(&9999i32.to_le_bytes());
            MockReply::Raw(raw)
        });
        let connection = connect(&server).await;

        let err = connection
            .execute("app", doc! { "ping": 1 }, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.connection_reason(), Some(ConnectionErrorReason::ConnectionClosed));
        assert!(!connection.is_alive());
    }
}
