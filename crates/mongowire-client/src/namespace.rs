//! Database/collection namespaces

use std::fmt;

use mongowire_common::{ConnectionError, ConnectionErrorKind, ConnectionErrorReason, Result};

/// A `database.collection` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Split a full name at the first dot; collection names may contain dots
    pub fn parse(full_name: &str) -> Result<Self> {
        match full_name.split_once('.') {
            Some((database, collection)) if !database.is_empty() && !collection.is_empty() => {
                Ok(Self::new(database, collection))
            }
            _ => Err(ConnectionError::new(
                ConnectionErrorKind::InvalidResponse,
                Some(ConnectionErrorReason::InvalidReplyType),
            )
            .into()),
        }
    }

    /// The `$cmd` pseudo-collection of `database`
    pub fn command(database: &str) -> Self {
        Self::new(database, "$cmd")
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}
