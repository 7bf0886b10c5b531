//! Client and server protocol operations and their wire codec

pub use self::client::ClientOp;
pub use self::decoder::{decode_header_block, StreamDecoder};
pub use self::encoder::StreamEncoder;
pub use self::server::ServerOp;

mod client;
mod decoder;
mod encoder;
mod server;

pub mod error {
    pub use super::decoder::DecoderError;
}
