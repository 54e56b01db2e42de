use crate::error::{ConnectorError, Result};
use crate::messages::Message;
use tokio::sync::mpsc;

/// Create the inbound message queue
///
/// The queue is unbounded and strictly FIFO; producers hold clones of the
/// [`QueueSender`], a single consumer loop owns the [`QueueReceiver`].
pub fn queue() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Producer side of the inbound queue
#[derive(Clone, Debug)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl QueueSender {
    /// Append a message; returns false when the consumer is gone
    pub fn append(&self, message: Message) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Queue closed, dropping message for {}", e.0.device());
                false
            }
        }
    }
}

/// Consumer side of the inbound queue
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl QueueReceiver {
    /// Receive the next message
    ///
    /// Returns `ConnectionClosed` once every producer has been dropped.
    pub async fn recv(&mut self) -> Result<Message> {
        self.rx.recv().await.ok_or(ConnectorError::ConnectionClosed)
    }

    /// Try to receive a message without waiting
    ///
    /// Returns `None` if no message is available.
    pub fn try_recv(&mut self) -> Result<Option<Message>> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(ConnectorError::ConnectionClosed),
        }
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(Some(message)) = self.try_recv() {
            messages.push(message);
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DeviceStateMessage;
    use crate::types::ConnectionState;

    fn state(device: &str) -> Message {
        Message::DeviceState(DeviceStateMessage {
            device: device.into(),
            state: ConnectionState::Connected,
        })
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = queue();
        tx.append(state("a"));
        tx.append(state("b"));
        tx.append(state("c"));

        assert_eq!(rx.recv().await.unwrap().device(), "a");
        assert_eq!(rx.recv().await.unwrap().device(), "b");
        assert_eq!(rx.try_recv().unwrap().unwrap().device(), "c");
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_after_senders_dropped() {
        let (tx, mut rx) = queue();
        tx.append(state("a"));
        drop(tx);
        assert!(rx.recv().await.is_ok());
        assert!(matches!(rx.recv().await, Err(ConnectorError::ConnectionClosed)));
    }
}
