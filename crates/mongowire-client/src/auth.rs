//! Authentication seam
//!
//! Credential exchange is opaque to the pool: it calls an [`Authenticator`]
//! once per new connection and database, and records success on the connection.

use async_trait::async_trait;
use mongowire_common::{ConnectionError, ConnectionErrorKind, ConnectionErrorReason, Credentials, Result};
use tracing::warn;

use crate::connection::Connection;

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Authenticate `connection` against `database`. Success is recorded by the caller.
    async fn authenticate(&self, connection: &Connection, credentials: &Credentials, database: &str) -> Result<()>;
}

/// Rejects every credential; used when no mechanism has been plugged in
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthenticator;

#[async_trait]
impl Authenticator for NoAuthenticator {
    async fn authenticate(&self, connection: &Connection, credentials: &Credentials, database: &str) -> Result<()> {
        warn!(
            "No authentication mechanism available for user '{}' on {} (connection {})",
            credentials.username,
            database,
            connection.id()
        );
        Err(ConnectionError::new(
            ConnectionErrorKind::AuthenticationFailure,
            Some(ConnectionErrorReason::ScramFailure),
        )
        .into())
    }
}
