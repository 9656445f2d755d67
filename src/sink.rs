//! Bounded queue from polling sessions to the downstream consumer
//!
//! Sessions enqueue retrieved messages; the controller sends a final
//! `Complete` marker once polling has finished.

use crate::constants::{ENQUEUE_WAIT_SECS, MAX_QUEUED_MESSAGES};
use crate::protocol::RetrievedMessage;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug)]
pub enum PollEvent {
    Message(RetrievedMessage),
    /// No more messages will follow
    Complete,
}

/// Create a connected sink/stream pair
pub fn message_queue() -> (MessageSink, MessageStream) {
    let (tx, rx) = mpsc::channel(MAX_QUEUED_MESSAGES);
    (
        MessageSink {
            tx,
            wait: Duration::from_secs(ENQUEUE_WAIT_SECS),
        },
        MessageStream { rx, done: false },
    )
}

#[derive(Clone)]
pub struct MessageSink {
    tx: mpsc::Sender<PollEvent>,
    wait: Duration,
}

impl MessageSink {
    /// Queue a message, waiting up to the enqueue bound for room
    ///
    /// Returns false if the message was dropped.
    pub async fn enqueue(&self, msg: RetrievedMessage) -> bool {
        let station = msg.station.clone();
        match self.tx.send_timeout(PollEvent::Message(msg), self.wait).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(station = %station, "message queue full for {:?}, message dropped", self.wait);
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                warn!(station = %station, "message consumer gone, message dropped");
                false
            }
        }
    }

    /// Signal end of polling
    pub async fn complete(&self) {
        let _ = self.tx.send_timeout(PollEvent::Complete, self.wait).await;
    }
}

pub struct MessageStream {
    rx: mpsc::Receiver<PollEvent>,
    done: bool,
}

impl MessageStream {
    /// Next message; `None` once polling is complete or every sink is gone
    pub async fn next(&mut self) -> Option<RetrievedMessage> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(PollEvent::Message(msg)) => Some(msg),
            Some(PollEvent::Complete) | None => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{MediumType, StationTarget};
    use chrono::Utc;

    fn message(name: &str) -> RetrievedMessage {
        let target = StationTarget::new(name, MediumType::PolledTcp, "h:1", "x");
        RetrievedMessage::assemble(&target, Utc::now(), Utc::now(), b"data")
    }

    #[tokio::test]
    async fn test_messages_then_complete() {
        let (sink, mut stream) = message_queue();
        assert!(sink.enqueue(message("A")).await);
        assert!(sink.enqueue(message("B")).await);
        sink.complete().await;
        // Late messages after the marker are never seen
        sink.enqueue(message("C")).await;

        assert_eq!(stream.next().await.unwrap().station, "A");
        assert_eq!(stream.next().await.unwrap().station, "B");
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_after_wait() {
        let (sink, _stream) = message_queue();
        for i in 0..MAX_QUEUED_MESSAGES {
            assert!(sink.enqueue(message(&i.to_string())).await);
        }
        assert!(!sink.enqueue(message("overflow")).await);
    }

    #[tokio::test]
    async fn test_closed_consumer() {
        let (sink, stream) = message_queue();
        drop(stream);
        assert!(!sink.enqueue(message("A")).await);
    }
}
