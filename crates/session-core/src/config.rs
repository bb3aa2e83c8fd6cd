//! Typed configuration for nodes and listeners.
//!
//! File loading is left to the operator; everything here derives
//! `serde::Deserialize` so a TOML or JSON document maps straight onto it.

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use switchgen_esl_transport::{Connection, DEFAULT_PORT};

/// Connection triple for one server node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_password")]
    pub password: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_password() -> String {
    "ClueCon".to_string()
}

impl NodeConfig {
    pub fn new(host: impl Into<String>) -> NodeConfig {
        NodeConfig {
            host: host.into(),
            port: default_port(),
            password: default_password(),
        }
    }

    pub fn connection(&self) -> Connection {
        Connection::new(self.host.clone(), self.port, self.password.clone())
    }
}

/// Reconnect policy after loss of a server connection.
///
/// Deserializes from a bool (`true` polls indefinitely, `false` never) or an
/// integer retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Autorecon {
    Never,
    Always,
    Retries(u32),
}

impl Default for Autorecon {
    fn default() -> Autorecon {
        Autorecon::Retries(30)
    }
}

impl Autorecon {
    pub fn enabled(&self) -> bool {
        !matches!(self, Autorecon::Never)
    }

    /// Retry budget; `None` means poll until the server comes back.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Autorecon::Never => Some(0),
            Autorecon::Always => None,
            Autorecon::Retries(n) => Some(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Autorecon {
    fn deserialize<D>(deserializer: D) -> Result<Autorecon, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AutoreconVisitor;

        impl<'de> Visitor<'de> for AutoreconVisitor {
            type Value = Autorecon;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a bool or a non-negative retry count")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Autorecon, E> {
                Ok(if v { Autorecon::Always } else { Autorecon::Never })
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Autorecon, E> {
                Ok(match v {
                    0 => Autorecon::Never,
                    n => Autorecon::Retries(n.min(u32::MAX as u64) as u32),
                })
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Autorecon, E> {
                if v < 0 {
                    return Err(E::custom("retry count cannot be negative"));
                }
                self.visit_u64(v as u64)
            }
        }

        deserializer.deserialize_any(AutoreconVisitor)
    }
}

/// Tunables for one [`crate::EventListener`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Channel variable used to group sessions into calls. Commonly set to a
    /// forwarded x-header variable when tracking calls through a B2BUA.
    pub call_tracking_header: String,
    /// Header names consulted in order to resolve an event's application id.
    pub app_id_headers: Vec<String>,
    pub autorecon: Autorecon,
    /// Seconds between reconnection attempts.
    pub reconnect_delay: f64,
    /// Per-node active call ceiling used by pool admission.
    pub max_limit: u64,
    /// Failed sessions retained per hangup cause.
    pub failed_history: usize,
}

impl Default for ListenerConfig {
    fn default() -> ListenerConfig {
        ListenerConfig {
            call_tracking_header: "variable_call_uuid".to_string(),
            app_id_headers: Vec::new(),
            autorecon: Autorecon::default(),
            reconnect_delay: 1.0,
            max_limit: u64::MAX,
            failed_history: 1000,
        }
    }
}
