//! Client configuration for MongoWire
//!
//! A [`ClientConfig`] can be built in code, loaded from a TOML/JSON file or
//! parsed from a `mongodb://` connection string.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, InvalidUriError, Result, UriReason};

/// Default MongoDB port
pub const DEFAULT_PORT: u16 = 27017;

const SCHEME: &str = "mongodb://";
const SRV_SCHEME: &str = "mongodb+srv://";

/// Main configuration structure for a MongoWire client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Seed hosts, tried in order when a new connection is needed
    #[serde(default)]
    pub hosts: Vec<Host>,

    /// Credentials applied to every new connection
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Database the credentials are defined in
    #[serde(default)]
    pub auth_source: Option<String>,

    /// Default database from the connection string path
    #[serde(default)]
    pub database: Option<String>,

    /// Upper bound on pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request reply timeout; `None` waits indefinitely
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: Option<u64>,

    /// Allow reads from non-primary members
    #[serde(default)]
    pub slave_ok: bool,

    /// Application name reported in the handshake metadata
    #[serde(default)]
    pub app_name: Option<String>,

    /// Default cursor batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,
}

fn default_max_connections() -> usize {
    16
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

#[allow(clippy::unnecessary_wraps)]
fn default_query_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_batch_size() -> i32 {
    101
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            credentials: None,
            auth_source: None,
            database: None,
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            slave_ok: false,
            app_name: None,
            batch_size: default_batch_size(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML or JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: ClientConfig = if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        Ok(config)
    }

    /// Parse a `mongodb://[user:pass@]host[:port][,host...][/database][?options]` string
    pub fn from_uri(uri: &str) -> Result<Self> {
        if uri.starts_with(SRV_SCHEME) {
            return Err(invalid(UriReason::SrvNotSupported));
        }
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid(UriReason::MissingMongoDBScheme))?;

        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);

        let mut config = ClientConfig::default();

        let hosts = match authority.rsplit_once('@') {
            Some((user_info, hosts)) => {
                config.credentials = Some(parse_user_info(user_info)?);
                hosts
            }
            None => authority,
        };

        if hosts.is_empty() {
            return Err(invalid(UriReason::UriIsMalformed));
        }
        config.hosts = hosts.split(',').map(Host::parse).collect::<Result<_>>()?;

        let (path, query) = match tail.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (tail, None),
        };

        let database = path.trim_start_matches('/');
        if !database.is_empty() {
            config.database = Some(decode(database)?);
        }

        let mut mechanism = None;
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| invalid(UriReason::UriIsMalformed))?;
                let value = decode(value)?;

                match key.to_ascii_lowercase().as_str() {
                    "authsource" => config.auth_source = Some(value),
                    "authmechanism" => mechanism = Some(value.parse::<AuthMechanism>()?),
                    "maxconnections" | "maxpoolsize" => config.max_connections = parse_number(&value)?,
                    "connecttimeoutms" => config.connect_timeout_ms = parse_number(&value)?,
                    "sockettimeoutms" => {
                        let timeout: u64 = parse_number(&value)?;
                        config.query_timeout_ms = (timeout > 0).then_some(timeout);
                    }
                    "appname" => config.app_name = Some(value),
                    "slaveok" => config.slave_ok = parse_bool(&value)?,
                    other => debug!("Ignoring unsupported connection string option '{}'", other),
                }
            }
        }

        if let (Some(credentials), Some(mechanism)) = (config.credentials.as_mut(), mechanism) {
            credentials.mechanism = Some(mechanism);
        }

        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    /// The database credentials are authenticated against
    pub fn auth_database(&self) -> &str {
        self.auth_source
            .as_deref()
            .or(self.database.as_deref())
            .unwrap_or("admin")
    }
}

/// A server address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Host {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    fn parse(input: &str) -> Result<Self> {
        // [ipv6]:port
        if let Some(rest) = input.strip_prefix('[') {
            let (address, after) = rest
                .split_once(']')
                .ok_or_else(|| invalid(UriReason::UriIsMalformed))?;
            let port = match after.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if after.is_empty() => DEFAULT_PORT,
                None => return Err(invalid(UriReason::UriIsMalformed)),
            };
            return Ok(Host::new(address, port));
        }

        let (hostname, port) = match input.rsplit_once(':') {
            Some((hostname, port)) => (hostname, parse_port(port)?),
            None => (input, DEFAULT_PORT),
        };

        if hostname.is_empty() {
            return Err(invalid(UriReason::UriIsMalformed));
        }

        Ok(Host::new(decode(hostname)?, port))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

/// Username/password credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub mechanism: Option<AuthMechanism>,
}

// Keeps the password out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMechanism {
    #[serde(rename = "SCRAM-SHA-1")]
    ScramSha1,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "MONGODB-CR")]
    MongoDbCr,
}

impl AuthMechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => "SCRAM-SHA-1",
            AuthMechanism::ScramSha256 => "SCRAM-SHA-256",
            AuthMechanism::MongoDbCr => "MONGODB-CR",
        }
    }
}

impl std::str::FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('_', "-").as_str() {
            "SCRAM-SHA-1" => Ok(AuthMechanism::ScramSha1),
            "SCRAM-SHA-256" => Ok(AuthMechanism::ScramSha256),
            "MONGODB-CR" => Ok(AuthMechanism::MongoDbCr),
            _ => Err(invalid(UriReason::UnsupportedAuthenticationMechanism)),
        }
    }
}

fn invalid(reason: UriReason) -> Error {
    Error::InvalidUri(InvalidUriError::new(reason))
}

fn decode(input: &str) -> Result<String> {
    percent_decode_str(input)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| invalid(UriReason::UriIsMalformed))
}

fn parse_user_info(user_info: &str) -> Result<Credentials> {
    let (username, password) = user_info
        .split_once(':')
        .ok_or_else(|| invalid(UriReason::MalformedAuthenticationDetails))?;

    if username.is_empty() {
        return Err(invalid(UriReason::MalformedAuthenticationDetails));
    }

    let decode_part = |part: &str| {
        percent_decode_str(part)
            .decode_utf8()
            .map(|s| s.into_owned())
            .map_err(|_| invalid(UriReason::MalformedAuthenticationDetails))
    };

    Ok(Credentials {
        username: decode_part(username)?,
        password: decode_part(password)?,
        mechanism: None,
    })
}

fn parse_port(port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid(UriReason::InvalidPort)),
        Ok(port) => Ok(port),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T> {
    value.parse().map_err(|_| invalid(UriReason::UriIsMalformed))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(invalid(UriReason::UriIsMalformed)),
    }
}
