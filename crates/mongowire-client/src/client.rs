//! Client entry point
//!
//! Ties the pool, the session manager and cursors together. Operations
//! issued without an explicit session run on the manager's implicit session.

use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use mongowire_common::{ClientConfig, ConnectionError, ConnectionErrorKind, ConnectionErrorReason, Result};
use mongowire_protocol::{OpQuery, QueryFlags, RequestMessage};
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, NoAuthenticator};
use crate::cursor::{Cursor, CursorOptions};
use crate::execute::ExecuteOptions;
use crate::namespace::Namespace;
use crate::pool::{ConnectionLease, ConnectionPool};
use crate::session::{ClientSession, SessionManager, SessionOptions};
use crate::transport::{Connector, TcpConnector};

/// Per-call settings for commands
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandOptions<'a> {
    /// Run on this session instead of the implicit one
    pub session: Option<&'a ClientSession>,
    /// Allow a readable (possibly secondary) connection
    pub read_only: bool,
    /// Overrides the configured query timeout
    pub timeout: Option<Duration>,
}

/// Settings for legacy OP_QUERY reads
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub skip: i32,
    pub limit: Option<usize>,
    pub batch_size: Option<i32>,
    pub projection: Option<Document>,
    pub flags: QueryFlags,
}

struct ClientInner {
    config: ClientConfig,
    pool: ConnectionPool,
    sessions: Arc<SessionManager>,
}

/// A MongoDB client. Cheap to clone; clones share the pool and sessions.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connector: None,
            authenticator: None,
        }
    }

    /// Transport used for new connections; TCP by default
    #[must_use]
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Credential exchange for new connections
    #[must_use]
    pub fn authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn build(self) -> Client {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(self.config.connect_timeout())));
        let authenticator = self.authenticator.unwrap_or_else(|| Arc::new(NoAuthenticator));
        let pool = ConnectionPool::new(&self.config, connector, authenticator);

        info!(
            "MongoWire client created for {} host(s), max {} connections",
            self.config.hosts.len(),
            self.config.max_connections
        );

        Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                pool,
                sessions: SessionManager::new(),
            }),
        }
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Parse a `mongodb://` connection string and build a TCP client
    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(Self::new(ClientConfig::from_uri(uri)?))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    /// Check out an explicit session; dropping it returns the server session for reuse
    pub fn start_session(&self, options: SessionOptions) -> ClientSession {
        self.inner.sessions.retain_session(options)
    }

    /// Reserve a connection, bounded by the call's query timeout
    async fn reserve(&self, read_only: bool, timeout: Option<Duration>) -> Result<ConnectionLease> {
        let auth_database = self
            .inner
            .config
            .credentials
            .as_ref()
            .map(|_| self.inner.config.auth_database());
        let reservation = self.inner.pool.reserve(!read_only, auth_database);

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, reservation).await.map_err(|_| {
                warn!("No connection could be reserved within {:?}", timeout);
                mongowire_common::Error::from(ConnectionError::timeout())
            })?,
            None => reservation.await,
        }
    }

    fn timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        requested.or_else(|| self.inner.config.query_timeout())
    }

    pub async fn run_command(&self, database: &str, command: Document) -> Result<Document> {
        self.run_command_with(database, command, CommandOptions::default()).await
    }

    /// Run `command` against `database` and return the `ok` reply
    pub async fn run_command_with(
        &self,
        database: &str,
        command: Document,
        options: CommandOptions<'_>,
    ) -> Result<Document> {
        let timeout = self.timeout(options.timeout);
        let connection = self.reserve(options.read_only, timeout).await?;
        let session = options
            .session
            .unwrap_or_else(|| self.inner.sessions.implicit_session());

        connection
            .execute(
                database,
                command,
                ExecuteOptions {
                    session: Some(session),
                    timeout,
                },
            )
            .await
    }

    /// Run a cursor-returning command (`find`, `aggregate`, `listCollections`)
    pub async fn open_cursor(
        &self,
        database: &str,
        command: Document,
        options: CommandOptions<'_>,
    ) -> Result<Cursor<Document>> {
        let timeout = self.timeout(options.timeout);
        let connection = self.reserve(options.read_only, timeout).await?;
        let session = options
            .session
            .unwrap_or_else(|| self.inner.sessions.implicit_session());

        let reply = connection
            .execute(
                database,
                command,
                ExecuteOptions {
                    session: Some(session),
                    timeout,
                },
            )
            .await?;

        Cursor::from_command_reply(
            &reply,
            connection,
            Some(session),
            CursorOptions {
                batch_size: self.inner.config.batch_size,
                limit: None,
                timeout,
            },
        )
    }

    /// Query a collection with OP_QUERY, for servers without the `find` command
    pub async fn query_legacy(
        &self,
        namespace: &Namespace,
        filter: Document,
        options: QueryOptions,
    ) -> Result<Cursor<Document>> {
        let timeout = self.timeout(None);
        let connection = self.reserve(true, timeout).await?;

        let batch_size = options.batch_size.unwrap_or(self.inner.config.batch_size);
        let number_to_return = match options.limit {
            Some(limit) => {
                let limit = i32::try_from(limit).unwrap_or(i32::MAX);
                if batch_size > 0 {
                    limit.min(batch_size)
                } else {
                    limit
                }
            }
            None => batch_size,
        };

        let mut flags = options.flags;
        if self.inner.config.slave_ok {
            flags.insert(QueryFlags::SLAVE_OK);
        }

        let query = OpQuery {
            flags,
            full_collection_name: namespace.full_name(),
            number_to_skip: options.skip,
            number_to_return,
            query: filter,
            return_fields_selector: options.projection,
        };

        debug!("Legacy query on {} (numberToReturn={})", namespace, number_to_return);
        let reply = connection
            .send_request(&RequestMessage::Query(query), timeout)
            .await?
            .into_legacy()?;

        Cursor::from_legacy_reply(
            namespace.clone(),
            reply,
            connection,
            CursorOptions {
                batch_size,
                limit: options.limit,
                timeout,
            },
        )
    }

    pub async fn commit_transaction(&self, session: &ClientSession) -> Result<()> {
        self.end_transaction(session, "commitTransaction").await
    }

    pub async fn abort_transaction(&self, session: &ClientSession) -> Result<()> {
        self.end_transaction(session, "abortTransaction").await
    }

    async fn end_transaction(&self, session: &ClientSession, command_name: &str) -> Result<()> {
        let Some(transaction) = session.clear_transaction() else {
            return Err(ConnectionError::new(
                ConnectionErrorKind::QueryFailure,
                Some(ConnectionErrorReason::InternalError),
            )
            .into());
        };

        // Nothing reached the server, so there is nothing to end
        if !transaction.is_started() {
            debug!("{} of unstarted transaction {} skipped", command_name, transaction.number());
            return Ok(());
        }

        let mut command = Document::new();
        command.insert(command_name, 1);
        command.insert("lsid", session.id().to_document());
        command.insert("txnNumber", transaction.number());
        command.insert("autocommit", false);
        if let Some(write_concern) = &transaction.options().write_concern {
            command.insert("writeConcern", write_concern.clone());
        }

        let timeout = self.timeout(None);
        let connection = self.reserve(false, timeout).await?;
        connection
            .execute(
                "admin",
                command,
                ExecuteOptions {
                    session: None,
                    timeout,
                },
            )
            .await
            .map(|_| ())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("hosts", &self.inner.config.hosts)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}
