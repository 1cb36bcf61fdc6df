use tokio::sync::mpsc;

use crate::{error::DeliveryError, message::Message};

/// Write-only handle to a user's inbound channel.
///
/// The registering caller keeps the receiving half and is responsible for
/// draining it. The broker only pushes into the channel; it never reads from
/// it and never closes it.
#[derive(Debug, Clone)]
pub enum Mailbox {
    Bounded(mpsc::Sender<Message>),
    Unbounded(mpsc::UnboundedSender<Message>),
}

impl Mailbox {
    /// Pushes `message` into the channel, waiting for room if it is bounded
    /// and full.
    pub async fn deliver(&self, message: Message) -> Result<(), DeliveryError> {
        match self {
            Mailbox::Bounded(tx) => tx.send(message).await.map_err(|_| DeliveryError::Closed),
            Mailbox::Unbounded(tx) => tx.send(message).map_err(|_| DeliveryError::Closed),
        }
    }
}

impl From<mpsc::Sender<Message>> for Mailbox {
    fn from(tx: mpsc::Sender<Message>) -> Self {
        Mailbox::Bounded(tx)
    }
}

impl From<mpsc::UnboundedSender<Message>> for Mailbox {
    fn from(tx: mpsc::UnboundedSender<Message>) -> Self {
        Mailbox::Unbounded(tx)
    }
}
