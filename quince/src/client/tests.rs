use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{client::ClientShared, handler::HandlerCommand};

/// The other end of a [`Client::test`] client
///
/// [`Client::test`]: crate::core::Client::test
#[derive(Debug)]
pub(crate) struct TestHandler {
    pub(crate) receiver: mpsc::Receiver<HandlerCommand>,
    pub(crate) shared: Arc<ClientShared>,
}
