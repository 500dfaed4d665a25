//! Error types for MongoWire
//!
//! Provides a unified error type hierarchy for the driver. Every error carries a
//! machine-readable kind/reason pair and a human-readable remediation hint.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using MongoWire's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for MongoWire
#[derive(Error, Debug)]
pub enum Error {
    // Inbound bytes that cannot be framed or decoded
    #[error("Protocol parsing error: {0}")]
    Parsing(#[from] ProtocolParsingError),

    // Outbound messages the protocol cannot express
    #[error("Protocol serialization error: {0}")]
    Serialization(#[from] ProtocolSerializationError),

    // Connection, cursor and command errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    // Connection string errors
    #[error("Invalid connection string: {0}")]
    InvalidUri(#[from] InvalidUriError),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // BSON encode/decode failures
    #[error("Document error: {0}")]
    Document(String),
}

impl Error {
    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Parsing(_) => "protocolParsingError",
            Error::Serialization(_) => "protocolSerializationError",
            Error::Connection(e) => e.kind.as_str(),
            Error::InvalidUri(_) => "invalidUri",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Document(_) => "document",
        }
    }

    /// Machine-readable secondary reason, if any
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Error::Parsing(e) => Some(e.reason.as_str()),
            Error::Serialization(e) => Some(e.reason.as_str()),
            Error::Connection(e) => e.reason.map(|r| r.as_str()),
            Error::InvalidUri(e) => Some(e.reason.as_str()),
            Error::Config(_) | Error::Io(_) | Error::Document(_) => None,
        }
    }

    /// Human-readable remediation hint
    pub fn hint(&self) -> &'static str {
        match self {
            Error::Parsing(_) => {
                "The byte stream from the server could not be framed; the connection was discarded. Retry on a new connection."
            }
            Error::Serialization(e) => e.reason.hint(),
            Error::Connection(e) => e.hint(),
            Error::InvalidUri(_) => {
                "Check the connection string against the mongodb://[user:pass@]host[:port][/db][?options] format."
            }
            Error::Config(_) => "Check the configuration file syntax and field names.",
            Error::Io(_) => "The transport failed; check that the server is reachable and retry.",
            Error::Document(_) => "A document could not be encoded or decoded; check the document contents.",
        }
    }

    /// Whether the connection this error occurred on can no longer be trusted
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Error::Parsing(_) | Error::Io(_))
    }

    /// The connection error kind, if this is a connection error
    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Error::Connection(e) => Some(e.kind),
            _ => None,
        }
    }

    /// The connection error reason, if this is a connection error carrying one
    pub fn connection_reason(&self) -> Option<ConnectionErrorReason> {
        match self {
            Error::Connection(e) => e.reason,
            _ => None,
        }
    }
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        Error::Document(e.to_string())
    }
}

impl From<bson::ser::Error> for Error {
    fn from(e: bson::ser::Error) -> Self {
        Error::Document(e.to_string())
    }
}

// A reply document lacking an expected field is a malformed response
impl From<bson::document::ValueAccessError> for Error {
    fn from(_: bson::document::ValueAccessError) -> Self {
        Error::Connection(ConnectionError::new(
            ConnectionErrorKind::InvalidResponse,
            Some(ConnectionErrorReason::InvalidReplyType),
        ))
    }
}

// ============================================================================
// Protocol Errors
// ============================================================================

/// Malformed or unrecognized inbound bytes. Always fatal to the connection.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{reason}")]
pub struct ProtocolParsingError {
    pub reason: ParsingReason,
}

impl ProtocolParsingError {
    pub fn new(reason: ParsingReason) -> Self {
        Self { reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParsingReason {
    UnsupportedOpCode,
    UnexpectedValue,
    MissingDocumentBody,
}

impl ParsingReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ParsingReason::UnsupportedOpCode => "unsupportedOpCode",
            ParsingReason::UnexpectedValue => "unexpectedValue",
            ParsingReason::MissingDocumentBody => "missingDocumentBody",
        }
    }
}

impl fmt::Display for ParsingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            ParsingReason::UnsupportedOpCode => "the server replied with an opcode that is not supported",
            ParsingReason::UnexpectedValue => "a value in the message did not match the expectation",
            ParsingReason::MissingDocumentBody => "a partial document was received but its body could not be read",
        };
        f.write_str(description)
    }
}

/// A request the protocol cannot express. Fatal to the request, not the connection.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{reason}")]
pub struct ProtocolSerializationError {
    pub reason: SerializationReason,
}

impl ProtocolSerializationError {
    pub fn new(reason: SerializationReason) -> Self {
        Self { reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SerializationReason {
    CommandSizeTooLarge,
    UnexpectedOpCode,
    UnsupportedOpCode,
    MissingCommandSection,
}

impl SerializationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SerializationReason::CommandSizeTooLarge => "commandSizeTooLarge",
            SerializationReason::UnexpectedOpCode => "unexpectedOpCode",
            SerializationReason::UnsupportedOpCode => "unsupportedOpCode",
            SerializationReason::MissingCommandSection => "missingCommandSection",
        }
    }

    fn hint(self) -> &'static str {
        match self {
            SerializationReason::CommandSizeTooLarge => {
                "Split the operation; a single document may not exceed 16 MiB."
            }
            SerializationReason::UnexpectedOpCode | SerializationReason::UnsupportedOpCode => {
                "Only request opcodes can be sent to the server."
            }
            SerializationReason::MissingCommandSection => {
                "An OP_MSG request needs exactly one body section holding the command."
            }
        }
    }
}

impl fmt::Display for SerializationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            SerializationReason::CommandSizeTooLarge => "the operation exceeded the 16MB command limit",
            SerializationReason::UnexpectedOpCode => "the opcode does not match the serialization function",
            SerializationReason::UnsupportedOpCode => "the opcode cannot be sent as a request",
            SerializationReason::MissingCommandSection => "an OP_MSG was built without a command",
        };
        f.write_str(description)
    }
}

// ============================================================================
// Connection Errors
// ============================================================================

/// Connection, cursor and command errors
#[derive(Error, Debug, Clone, PartialEq)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub reason: Option<ConnectionErrorReason>,
    /// The error document reported by the server, for command failures
    pub server: Option<ServerErrorReply>,
}

impl ConnectionError {
    pub fn new(kind: ConnectionErrorKind, reason: Option<ConnectionErrorReason>) -> Self {
        Self {
            kind,
            reason,
            server: None,
        }
    }

    /// A command failure reported by the server
    pub fn server_failure(kind: ConnectionErrorKind, reply: ServerErrorReply) -> Self {
        Self {
            kind,
            reason: None,
            server: Some(reply),
        }
    }

    /// The connection went away while a request was in flight
    pub fn connection_closed() -> Self {
        Self::new(
            ConnectionErrorKind::QueryFailure,
            Some(ConnectionErrorReason::ConnectionClosed),
        )
    }

    pub fn timeout() -> Self {
        Self::new(ConnectionErrorKind::QueryTimeout, None)
    }

    fn hint(&self) -> &'static str {
        if let Some(reason) = self.reason {
            match reason {
                ConnectionErrorReason::CursorDrained | ConnectionErrorReason::AlreadyClosed => {
                    return "The cursor holds no further results; no cleanup is required.";
                }
                ConnectionErrorReason::NoHostSpecified => {
                    return "Add at least one host to the client configuration.";
                }
                ConnectionErrorReason::NoAvailableHosts => {
                    return "None of the configured hosts matched the request (writable/readable); check the replica set state or enable slave_ok.";
                }
                ConnectionErrorReason::ConnectionClosed => {
                    return "The connection was closed; retry the operation on a new connection.";
                }
                _ => {}
            }
        }

        match self.kind {
            ConnectionErrorKind::CannotConnect => "Check that the server is running and reachable from this host.",
            ConnectionErrorKind::CannotGetMore => "The cursor could not be advanced; re-run the query.",
            ConnectionErrorKind::CannotCloseCursor => "The cursor may already have been released by the server.",
            ConnectionErrorKind::QueryFailure => "The server rejected the command; inspect the server error for details.",
            ConnectionErrorKind::QueryTimeout => "The server did not reply in time; raise the query timeout or check server load.",
            ConnectionErrorKind::AuthenticationFailure => "Check the credentials, mechanism and authentication database.",
            ConnectionErrorKind::InvalidResponse => "The server replied with an unexpected document shape.",
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(reason) = self.reason {
            write!(f, " ({reason})")?;
        }
        if let Some(server) = &self.server {
            write!(f, ": {server}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionErrorKind {
    CannotConnect,
    CannotGetMore,
    CannotCloseCursor,
    QueryFailure,
    QueryTimeout,
    AuthenticationFailure,
    InvalidResponse,
}

impl ConnectionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionErrorKind::CannotConnect => "cannotConnect",
            ConnectionErrorKind::CannotGetMore => "cannotGetMore",
            ConnectionErrorKind::CannotCloseCursor => "cannotCloseCursor",
            ConnectionErrorKind::QueryFailure => "queryFailure",
            ConnectionErrorKind::QueryTimeout => "queryTimeout",
            ConnectionErrorKind::AuthenticationFailure => "authenticationFailure",
            ConnectionErrorKind::InvalidResponse => "invalidResponse",
        }
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            ConnectionErrorKind::CannotConnect => "unable to connect to MongoDB",
            ConnectionErrorKind::CannotGetMore => "unable to get more results from the cursor",
            ConnectionErrorKind::CannotCloseCursor => "unable to close the cursor",
            ConnectionErrorKind::QueryFailure => "the query failed",
            ConnectionErrorKind::QueryTimeout => "the query timed out",
            ConnectionErrorKind::AuthenticationFailure => "authentication to MongoDB failed",
            ConnectionErrorKind::InvalidResponse => "the response contained unexpected or no data",
        };
        f.write_str(description)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionErrorReason {
    HandshakeFailed,
    ConnectionClosed,
    CursorDrained,
    AlreadyClosed,
    NoHostSpecified,
    NoAvailableHosts,
    ScramFailure,
    InternalError,
    InvalidReplyType,
    MissingReplyDocument,
}

impl ConnectionErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionErrorReason::HandshakeFailed => "handshakeFailed",
            ConnectionErrorReason::ConnectionClosed => "connectionClosed",
            ConnectionErrorReason::CursorDrained => "cursorDrained",
            ConnectionErrorReason::AlreadyClosed => "alreadyClosed",
            ConnectionErrorReason::NoHostSpecified => "noHostSpecified",
            ConnectionErrorReason::NoAvailableHosts => "noAvailableHosts",
            ConnectionErrorReason::ScramFailure => "scramFailure",
            ConnectionErrorReason::InternalError => "internalError",
            ConnectionErrorReason::InvalidReplyType => "invalidReplyType",
            ConnectionErrorReason::MissingReplyDocument => "missingReplyDocument",
        }
    }
}

impl fmt::Display for ConnectionErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error document of a failed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorReply {
    pub code: Option<i32>,
    pub code_name: Option<String>,
    pub message: String,
}

impl ServerErrorReply {
    /// Extract the error fields from a reply document (`errmsg`, or `$err` for legacy replies)
    pub fn from_document(doc: &bson::Document) -> Self {
        let code = match doc.get("code") {
            Some(bson::Bson::Int32(c)) => Some(*c),
            Some(bson::Bson::Int64(c)) => i32::try_from(*c).ok(),
            #[allow(clippy::cast_possible_truncation)]
            Some(bson::Bson::Double(c)) => Some(*c as i32),
            _ => None,
        };

        let message = doc
            .get_str("errmsg")
            .or_else(|_| doc.get_str("$err"))
            .unwrap_or("unknown server error")
            .to_string();

        Self {
            code,
            code_name: doc.get_str("codeName").ok().map(str::to_string),
            message,
        }
    }
}

impl fmt::Display for ServerErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code_name, self.code) {
            (Some(name), Some(code)) => write!(f, "{} ({name}, code {code})", self.message),
            (None, Some(code)) => write!(f, "{} (code {code})", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

// ============================================================================
// Connection String Errors
// ============================================================================

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{}", reason.as_str())]
pub struct InvalidUriError {
    pub reason: UriReason,
}

impl InvalidUriError {
    pub fn new(reason: UriReason) -> Self {
        Self { reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UriReason {
    MissingMongoDBScheme,
    UriIsMalformed,
    MalformedAuthenticationDetails,
    UnsupportedAuthenticationMechanism,
    InvalidPort,
    SrvNotSupported,
}

impl UriReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UriReason::MissingMongoDBScheme => "missingMongoDBScheme",
            UriReason::UriIsMalformed => "uriIsMalformed",
            UriReason::MalformedAuthenticationDetails => "malformedAuthenticationDetails",
            UriReason::UnsupportedAuthenticationMechanism => "unsupportedAuthenticationMechanism",
            UriReason::InvalidPort => "invalidPort",
            UriReason::SrvNotSupported => "srvNotSupported",
        }
    }
}
