//! MongoWire Client - MongoDB driver core
//!
//! Everything between a caller's command document and the wire:
//! - Pooled, multiplexed connections with `responseTo` correlation
//! - The `isMaster` handshake and wire-version gating
//! - Logical sessions and transaction numbering
//! - Cursors over `getMore`/`killCursors` and their legacy opcodes
//!
//! ```no_run
//! # async fn run() -> mongowire_common::Result<()> {
//! use bson::doc;
//! use mongowire_client::Client;
//!
//! let client = Client::from_uri("mongodb://localhost:27017/app")?;
//! let reply = client.run_command("admin", doc! { "ping": 1 }).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod auth;
pub mod client;
pub mod connection;
pub mod cursor;
pub mod execute;
pub mod handshake;
pub mod namespace;
pub mod pool;
pub mod session;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;

pub use auth::{Authenticator, NoAuthenticator};
pub use client::{Client, ClientBuilder, CommandOptions, QueryOptions};
pub use connection::{Connection, ConnectionId};
pub use cursor::{Cursor, CursorOptions, CursorProtocol};
pub use execute::{assert_ok, ExecuteOptions};
pub use handshake::{ServerHandshake, WireVersion};
pub use namespace::Namespace;
pub use pool::{ConnectionLease, ConnectionPool};
pub use session::{
    ClientSession, ServerSession, SessionId, SessionManager, SessionOptions, Transaction, TransactionOptions,
};
pub use transport::{AsyncStream, BoxedStream, Connector, TcpConnector};
