use std::borrow::Cow;

use async_ssh2_tokio::ServerCheckMethod;
use russh::Preferred;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config;

/// Algorithm policy for SSH sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SecurityLevel {
    /// Modern algorithms only.
    Secure,
    /// Adds SHA-1 and CBC variants still common on switches.
    Balanced,
    /// Everything russh can negotiate.
    LegacyCompatible,
}

/// SSH negotiation settings handed to [`SshSession`](super::SshSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSecurityOptions {
    pub level: SecurityLevel,
    /// Host key verification method.
    pub server_check: ServerCheckMethod,
}

impl Default for ConnectionSecurityOptions {
    fn default() -> Self {
        Self::from_level(SecurityLevel::Secure)
    }
}

impl ConnectionSecurityOptions {
    /// Known-hosts verification for `Secure` and `Balanced`; legacy devices
    /// rarely have stable host keys so they skip the check.
    pub fn from_level(level: SecurityLevel) -> Self {
        let server_check = match level {
            SecurityLevel::Secure | SecurityLevel::Balanced => {
                ServerCheckMethod::DefaultKnownHostsFile
            }
            SecurityLevel::LegacyCompatible => ServerCheckMethod::NoCheck,
        };
        Self {
            level,
            server_check,
        }
    }

    pub fn with_server_check(mut self, server_check: ServerCheckMethod) -> Self {
        self.server_check = server_check;
        self
    }

    pub(crate) fn preferred(&self) -> Preferred {
        let (kex, key, cipher, mac) = match self.level {
            SecurityLevel::Secure => (
                config::SECURE_KEX_ORDER,
                config::SECURE_KEY_TYPES,
                config::SECURE_CIPHERS,
                config::SECURE_MAC_ALGORITHMS,
            ),
            SecurityLevel::Balanced => (
                config::BALANCED_KEX_ORDER,
                config::BALANCED_KEY_TYPES,
                config::BALANCED_CIPHERS,
                config::BALANCED_MAC_ALGORITHMS,
            ),
            SecurityLevel::LegacyCompatible => (
                config::LEGACY_KEX_ORDER,
                config::LEGACY_KEY_TYPES,
                config::LEGACY_CIPHERS,
                config::LEGACY_MAC_ALGORITHMS,
            ),
        };
        Preferred {
            kex: Cow::Borrowed(kex),
            key: Cow::Borrowed(key),
            cipher: Cow::Borrowed(cipher),
            mac: Cow::Borrowed(mac),
            compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
        }
    }
}
