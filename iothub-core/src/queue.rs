//! Outbound telemetry queue shared between the application and the transport
//!
//! The application owns the queue and enqueues messages at any time; the
//! transport drains it from `do_work`. A message taken off the queue is held in
//! the device's in-flight list until its send completes, or is put back at the
//! front when the send fails.

use crate::message::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Outcome reported for every message the transport takes ownership of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResult {
    Ok,
    Error,
}

/// Per-message completion callback
pub type SendCallback = Box<dyn FnOnce(ConfirmationResult) + Send>;

/// A message waiting to be sent, with its completion callback
pub struct OutboundMessage {
    message: Message,
    callback: Option<SendCallback>,
}

impl OutboundMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            callback: None,
        }
    }

    pub fn with_callback(message: Message, callback: SendCallback) -> Self {
        Self {
            message,
            callback: Some(callback),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Fire the completion callback, consuming the message
    pub fn complete(self, result: ConfirmationResult) {
        if let Some(callback) = self.callback {
            callback(result);
        }
    }
}

impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("message", &self.message)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Thread-safe FIFO of outbound messages
///
/// Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct MessageQueue {
    inner: Arc<Mutex<QueueInner>>,
}

#[derive(Default)]
struct QueueInner {
    entries: VecDeque<OutboundMessage>,
    stats: QueueStats,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_requeued: u64,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message at the tail
    pub fn enqueue(&self, message: OutboundMessage) {
        let mut inner = self.inner.lock();
        inner.entries.push_back(message);
        inner.stats.total_enqueued += 1;
    }

    /// Take the oldest message
    pub fn pop_front(&self) -> Option<OutboundMessage> {
        let mut inner = self.inner.lock();
        let popped = inner.entries.pop_front();
        if popped.is_some() {
            inner.stats.total_dequeued += 1;
        }
        popped
    }

    /// Inspect the oldest message without removing it
    pub fn peek_with<R>(&self, f: impl FnOnce(&OutboundMessage) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.entries.front().map(f)
    }

    /// Put messages back at the head, preserving their relative order
    pub fn requeue_front(&self, messages: impl DoubleEndedIterator<Item = OutboundMessage>) {
        let mut inner = self.inner.lock();
        for message in messages.rev() {
            inner.entries.push_front(message);
            inner.stats.total_requeued += 1;
            inner.stats.total_dequeued = inner.stats.total_dequeued.saturating_sub(1);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats.clone()
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn text(s: &str) -> OutboundMessage {
        OutboundMessage::new(Message::from_text(s))
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new();
        queue.enqueue(text("a"));
        queue.enqueue(text("b"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().message().payload(), b"a");
        assert_eq!(queue.pop_front().unwrap().message().payload(), b"b");
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let queue = MessageQueue::new();
        for s in ["a", "b", "c"] {
            queue.enqueue(text(s));
        }
        let taken: VecDeque<_> = (0..2).filter_map(|_| queue.pop_front()).collect();
        queue.requeue_front(taken.into_iter());

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_front())
            .map(|m| m.message().payload().to_vec())
            .collect();
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(queue.stats().total_requeued, 2);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let queue = MessageQueue::new();
        queue.enqueue(text("head"));
        let len = queue.peek_with(|m| m.message().payload().len());
        assert_eq!(len, Some(4));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_complete_fires_callback_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let message = OutboundMessage::with_callback(
            Message::from_text("x"),
            Box::new(move |result| {
                assert_eq!(result, ConfirmationResult::Ok);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        message.complete(ConfirmationResult::Ok);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
