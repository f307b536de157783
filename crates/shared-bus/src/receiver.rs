//! # Inbound Delivery
//!
//! The bus hands every accepted inbound envelope to one [`MessageReceiver`].
//! `deliver` runs on a transport's background task; moving the message to
//! another thread or executor is the receiver's job.

use std::fmt;

use shared_types::MessageEnvelope;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Sink for accepted inbound messages.
pub trait MessageReceiver: Send + Sync {
    /// Handle one message. Must not block.
    fn deliver(&self, envelope: MessageEnvelope);
}

/// Errors from the inbox side of a [`ChannelReceiver`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InboxError {
    /// Every sender is gone.
    #[error("Receiver closed")]
    Closed,
}

/// Receiver that queues messages into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelReceiver {
    sender: mpsc::UnboundedSender<MessageEnvelope>,
}

/// Reading end of a [`ChannelReceiver`].
#[derive(Debug)]
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<MessageEnvelope>,
}

impl ChannelReceiver {
    /// A connected receiver/inbox pair.
    #[must_use]
    pub fn new() -> (Self, Inbox) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, Inbox { receiver })
    }
}

impl MessageReceiver for ChannelReceiver {
    fn deliver(&self, envelope: MessageEnvelope) {
        if let Err(e) = self.sender.send(envelope) {
            debug!(id = %e.0.id(), "Inbox dropped, discarding message");
        }
    }
}

impl Inbox {
    /// Wait for the next message. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<MessageEnvelope> {
        self.receiver.recv().await
    }

    /// Take a queued message without waiting.
    ///
    /// # Errors
    ///
    /// `InboxError::Closed` when empty and every sender is gone.
    pub fn try_recv(&mut self) -> Result<Option<MessageEnvelope>, InboxError> {
        match self.receiver.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(InboxError::Closed),
        }
    }

    /// Consume as a `Stream`.
    #[must_use]
    pub fn into_stream(self) -> UnboundedReceiverStream<MessageEnvelope> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

/// Receiver backed by a closure.
pub struct FnReceiver<F>(F);

impl<F> FnReceiver<F>
where
    F: Fn(MessageEnvelope) + Send + Sync,
{
    #[must_use]
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> MessageReceiver for FnReceiver<F>
where
    F: Fn(MessageEnvelope) + Send + Sync,
{
    fn deliver(&self, envelope: MessageEnvelope) {
        (self.0)(envelope);
    }
}

impl<F> fmt::Debug for FnReceiver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnReceiver")
    }
}
