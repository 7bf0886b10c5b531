use alloc::boxed::Box;

use crate::{error::ServerError, ServerInfo, ServerMessage};

/// An operation sent from the server to the client
#[derive(Debug, PartialEq, Eq)]
pub enum ServerOp {
    Info { info: Box<ServerInfo> },
    Message { message: ServerMessage },
    /// `+OK`, only sent in verbose mode
    Success,
    Error { error: ServerError },
    Ping,
    Pong,
}
