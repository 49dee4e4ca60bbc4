//! Event fabric shared by every component
//!
//! Each component owns one or more [`EventEmitter`]s and publishes immutable
//! snapshots on them. Observers (UI, logging collaborator, tests) subscribe and
//! receive every value published after they subscribed, in publication order.
//!
//! ```rust
//! use dialtone_core::events::EventEmitter;
//! use tokio_stream::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let emitter = EventEmitter::<u32>::new(16);
//! let mut stream = emitter.subscribe();
//!
//! emitter.emit(1);
//! emitter.emit(2);
//!
//! assert_eq!(stream.next().await.unwrap().unwrap(), 1);
//! assert_eq!(stream.next().await.unwrap().unwrap(), 2);
//! # }
//! ```

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

/// Default channel capacity for component emitters
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Event stream type
pub type EventStream<T> = BroadcastStream<T>;

/// Typed broadcast emitter
#[derive(Debug)]
pub struct EventEmitter<T> {
    sender: broadcast::Sender<T>,
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> EventEmitter<T> {
    /// Create a new event emitter with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event
    pub fn emit(&self, event: T) {
        // No receivers is not an error: nobody is watching yet
        if self.sender.send(event).is_err() {
            trace!("event emitted with no subscribers");
        }
    }

    /// Subscribe to events as a stream
    pub fn subscribe(&self) -> EventStream<T> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Subscribe to events with a raw receiver
    pub fn receiver(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Get the number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let emitter = EventEmitter::<&'static str>::new(4);
        emitter.emit("nobody listens");
        assert_eq!(emitter.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_receivers_see_order() {
        let emitter = EventEmitter::<u8>::new(8);
        let mut rx = emitter.receiver();
        for i in 0..5 {
            emitter.emit(i);
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), i);
        }
    }
}
