use std::net::{IpAddr, SocketAddr};

use serde::Deserialize;

pub const DEFAULT_REMOTE_PORT: u16 = 61440;
pub const DEFAULT_KEEP_ALIVE1_FLAG: u8 = 0xdc;

/// Configuration of one keep-alive session. A zero port or flag means
/// "unset" and is replaced by the protocol default, mirroring the config
/// file format this client is compatible with.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_tag")]
    pub tag: String,
    pub remote_ip: IpAddr,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub keep_alive1_flag: u8,
    #[serde(default)]
    pub enable_crypt: bool,
    #[serde(default)]
    pub bind_device: Option<String>,
    /// accepted for config compatibility; the handshake does not consume it
    #[serde(default)]
    pub bind_to_addr: bool,
}

impl SessionConfig {
    pub fn remote_port(&self) -> u16 {
        if self.remote_port == 0 {
            DEFAULT_REMOTE_PORT
        } else {
            self.remote_port
        }
    }

    pub fn keep_alive1_flag(&self) -> u8 {
        if self.keep_alive1_flag == 0 {
            DEFAULT_KEEP_ALIVE1_FLAG
        } else {
            self.keep_alive1_flag
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_ip, self.remote_port())
    }

    pub fn bind_device(&self) -> Option<&str> {
        self.bind_device.as_deref().filter(|d| !d.is_empty())
    }
}

fn default_tag() -> String {
    "core".to_string()
}

/// Multi-session config file: a shared log file and debug flag, plus one or
/// more session records.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub debug: bool,
    pub core: Listable<SessionConfig>,
}

/// A field that accepts either a single record or a list of records.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Listable<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Listable<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Listable::One(item) => vec![item],
            Listable::Many(items) => items,
        }
    }
}
