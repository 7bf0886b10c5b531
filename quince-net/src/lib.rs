//! Transport layer of the quince NATS client
//!
//! [`Connection`] pairs a socket with the sans-IO codec of `quince-proto`,
//! [`Connector`] opens a socket to a server, optionally secures it with TLS
//! and performs the `INFO`/`CONNECT`/`PING` handshake.

pub use self::auth::AuthenticationMethod;
pub use self::connection::Connection;
pub use self::connector::{handshake, read_info, ConnectOptions, Connector};
pub use self::security::ConnectionSecurity;
pub use self::tcp::connect_tcp;

mod auth;
mod connection;
mod connector;
mod security;
mod tcp;

pub mod error {
    pub use super::connection::ReadError;
    pub use super::connector::{ConnectError, TlsConfigError};
}
