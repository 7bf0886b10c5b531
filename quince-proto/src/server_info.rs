use alloc::{string::String, vec::Vec};
use core::num::NonZeroU32;

use serde::Deserialize;

use crate::ServerAddr;

/// The JSON document sent by the server with `INFO`
///
/// The server sends it right after the connection is accepted and again,
/// asynchronously, whenever the cluster topology changes or the server
/// enters lame duck mode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ServerInfo {
    #[serde(rename = "server_id", default)]
    pub id: String,
    #[serde(rename = "server_name", default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(rename = "headers", default)]
    pub supports_headers: bool,
    #[serde(default = "default_max_payload")]
    pub max_payload: NonZeroU32,
    #[serde(rename = "proto", default)]
    pub protocol_version: u32,
    #[serde(default)]
    pub client_id: Option<u64>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub tls_available: bool,
    /// Other servers of the cluster clients may connect to
    #[serde(default)]
    pub connect_urls: Vec<ServerAddr>,
    /// The server is shutting down and asks clients to move elsewhere
    #[serde(rename = "ldm", default)]
    pub lame_duck_mode: bool,
    #[serde(rename = "jetstream", default)]
    pub supports_jetstream: bool,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(rename = "cluster", default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

fn default_max_payload() -> NonZeroU32 {
    NonZeroU32::new(1024 * 1024).unwrap_or(NonZeroU32::MIN)
}
