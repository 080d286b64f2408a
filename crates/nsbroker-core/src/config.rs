//! Centralized configuration for the broker.
//!
//! Protocol constants live in unit structs with associated consts; per-server
//! behaviour lives in [`BrokerConfig`].

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;

/// Wire protocol parameters.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const DEFAULT_PORT: u16 = 8089;
    pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024; // 256MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    // Optimized sending of large values
    pub const SEND_OPT_MESSAGE_MIN: usize = 128 * 1024;
    pub const SEND_OPT_BLOCK_SIZE: usize = 64 * 1024;
    pub const SEND_OPT_COMPRESS_TRIAL: usize = 128 * 1024;
    pub const SEND_OPT_COMPRESS_MIN: f64 = 0.8;
    pub const SEND_OPT_COMPRESSION_LEVEL: u32 = 3;

    /// Environment variable holding a JSON object of host spec aliases.
    pub const HOSTSPECS_ENV: &'static str = "NSBROKER_HOSTSPECS";
}

/// Server-side limits.
pub struct ServerConfig;

impl ServerConfig {
    pub const MAX_CONNECTIONS: usize = 512;
    pub const DEFAULT_DEBUG_LIMIT: usize = 240;
    pub const DEFAULT_NAMESPACE: &'static str = "default";
}

/// Shared secret a server requires on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Password {
    /// Compared byte-for-byte against what the client sends.
    Plaintext(String),
    /// Lowercase hex SHA-256 digest of the secret.
    Sha256(String),
}

impl Password {
    /// Check a secret received from a client.
    pub fn verify(&self, received: &str) -> bool {
        match self {
            Password::Plaintext(expected) => expected == received,
            Password::Sha256(digest) => {
                let actual = hex::encode(Sha256::digest(received.as_bytes()));
                actual.eq_ignore_ascii_case(digest)
            }
        }
    }
}

/// Runtime configuration of one broker instance.
///
/// # Example
///
/// ```rust,ignore
/// let config = BrokerConfig::default()
///     .allow_new_namespaces(false)
///     .with_password(Password::Plaintext("xyz".into()));
/// ```
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub allow_new_namespaces: bool,
    pub password: Option<Password>,
    pub local_whitelist: Option<HashSet<String>>,
    pub debug_limit: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            allow_new_namespaces: true,
            password: None,
            local_whitelist: None,
            debug_limit: ServerConfig::DEFAULT_DEBUG_LIMIT,
        }
    }
}

impl BrokerConfig {
    /// Let Exec traffic create namespaces on first reference.
    ///
    /// Default: `true`
    pub fn allow_new_namespaces(mut self, allow: bool) -> Self {
        self.allow_new_namespaces = allow;
        self
    }

    /// Require every connection to authenticate first.
    pub fn with_password(mut self, password: Password) -> Self {
        self.password = Some(password);
        self
    }

    /// Restrict auto-creation to the given names.
    pub fn with_local_whitelist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local_whitelist = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Truncate logged messages to this many characters (0 disables previews).
    pub fn with_debug_limit(mut self, limit: usize) -> Self {
        self.debug_limit = limit;
        self
    }

    /// Whether Exec traffic may create `name`.
    pub fn may_create(&self, name: &str) -> bool {
        if !self.allow_new_namespaces {
            return false;
        }
        match &self.local_whitelist {
            Some(names) => names.contains(name),
            None => true,
        }
    }

    /// Shorten `msg` for a log line.
    pub fn preview(&self, msg: &str) -> String {
        if self.debug_limit == 0 || msg.len() <= self.debug_limit {
            return msg.to_string();
        }
        let mut cut = self.debug_limit;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}... [{} B]", &msg[..cut], msg.len())
    }
}
