//! MongoWire Common - Shared utilities and types
//!
//! This crate provides common functionality used across all MongoWire components:
//! - Error types and handling
//! - Client configuration (files and connection strings)
//! - Tracing initialisation
//! - Metrics

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use config::{AuthMechanism, ClientConfig, Credentials, Host};
pub use error::{
    ConnectionError, ConnectionErrorKind, ConnectionErrorReason, Error, InvalidUriError, ParsingReason,
    ProtocolParsingError, ProtocolSerializationError, Result, SerializationReason, ServerErrorReply, UriReason,
};
