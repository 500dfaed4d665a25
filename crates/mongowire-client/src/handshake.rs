//! Initial `isMaster` handshake

use bson::{doc, Document};
use once_cell::sync::Lazy;
use serde::Deserialize;

/// Driver metadata reported to the server on every new connection
static CLIENT_METADATA: Lazy<Document> = Lazy::new(|| {
    doc! {
        "driver": {
            "name": "mongowire",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "os": {
            "type": std::env::consts::OS,
            "architecture": std::env::consts::ARCH,
        },
        "platform": "rust",
    }
});

/// The `isMaster` command, with client metadata
pub fn is_master_command(app_name: Option<&str>) -> Document {
    let mut metadata = CLIENT_METADATA.clone();
    if let Some(name) = app_name {
        metadata.insert("application", doc! { "name": name });
    }
    doc! { "isMaster": 1, "client": metadata }
}

/// Server capabilities negotiated by the handshake
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHandshake {
    #[serde(rename = "ismaster", default)]
    pub is_master: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub min_wire_version: i32,
    #[serde(default)]
    pub max_wire_version: i32,
    #[serde(default = "default_max_bson_object_size")]
    pub max_bson_object_size: i32,
    #[serde(default = "default_max_message_size_bytes")]
    pub max_message_size_bytes: i32,
    #[serde(default = "default_max_write_batch_size")]
    pub max_write_batch_size: i32,
    #[serde(default)]
    pub sasl_supported_mechs: Option<Vec<String>>,
    #[serde(default)]
    pub set_name: Option<String>,
    #[serde(default)]
    pub logical_session_timeout_minutes: Option<i32>,
}

fn default_max_bson_object_size() -> i32 {
    16 * 1024 * 1024
}

fn default_max_message_size_bytes() -> i32 {
    48_000_000
}

fn default_max_write_batch_size() -> i32 {
    100_000
}

impl ServerHandshake {
    pub fn wire_version(&self) -> WireVersion {
        WireVersion(self.max_wire_version)
    }

    /// Primaries that are not read-only accept writes
    pub fn is_writable(&self) -> bool {
        self.is_master && !self.read_only
    }

    pub fn is_readable(&self, slave_ok: bool) -> bool {
        self.is_writable() || slave_ok
    }
}

/// The highest wire version a server speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WireVersion(pub i32);

impl WireVersion {
    /// MongoDB 3.6
    pub fn supports_op_msg(self) -> bool {
        self.0 >= 6
    }

    /// MongoDB 3.2: `find`/`getMore`/`killCursors` commands
    pub fn supports_cursor_commands(self) -> bool {
        self.0 >= 4
    }

    pub fn supports_sessions(self) -> bool {
        self.0 >= 6
    }

    /// MongoDB 4.0
    pub fn supports_transactions(self) -> bool {
        self.0 >= 7
    }
}
