//! In-memory intake buffer and the logger task
//!
//! The intake buffer decouples event-producing callers from disk I/O: `push`
//! is a plain non-blocking append on an unbounded channel, so the public
//! tracking call can never stall on storage or network state. Unbounded
//! memory growth is the accepted tradeoff.
//!
//! The logger task is the buffer's single consumer. Its sole job is to drain
//! each accepted record into the durable queue, in arrival order, for the
//! lifetime of the process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::event::EventRecord;
use crate::queue::DurableQueue;

/// How long the logger task waits before re-attempting a failed durable
/// append. The record is held, not dropped; persistence stalls until the
/// store recovers.
const ADD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Producer half of the intake buffer.
///
/// Cheap to clone; every public tracking call goes through `push`.
#[derive(Clone)]
pub struct IntakeBuffer {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl IntakeBuffer {
    /// Create the buffer and its single consumer half.
    pub fn channel() -> (IntakeBuffer, IntakeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (IntakeBuffer { tx }, IntakeReceiver { rx })
    }

    /// Append a record. Never blocks and never fails for a well-formed
    /// record; a send after shutdown (receiver gone) is logged and dropped.
    pub fn push(&self, record: EventRecord) {
        if self.tx.send(record).is_err() {
            tracing::debug!("Intake buffer closed; dropping record");
        }
    }
}

/// Consumer half of the intake buffer, owned by the logger task.
pub struct IntakeReceiver {
    rx: mpsc::UnboundedReceiver<EventRecord>,
}

/// Drain the intake buffer into the durable queue, one record at a time, in
/// arrival order.
///
/// Runs until every `IntakeBuffer` clone has been dropped. A storage error
/// does not lose the in-flight record: the append is retried until the queue
/// accepts it.
pub async fn run_logger(mut receiver: IntakeReceiver, queue: Arc<DurableQueue>) {
    tracing::debug!("Logger task started");

    while let Some(record) = receiver.rx.recv().await {
        loop {
            match queue.add(&record) {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Durable append failed; retrying");
                    tokio::time::sleep(ADD_RETRY_DELAY).await;
                }
            }
        }
    }

    tracing::debug!("Logger task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorruptionPolicy;

    fn record(event_type: &str, creation: i64) -> EventRecord {
        EventRecord::new(event_type, None, "k", "u", creation)
    }

    #[test]
    fn test_push_never_fails_after_receiver_dropped() {
        let (buffer, receiver) = IntakeBuffer::channel();
        drop(receiver);
        // Must not panic or block
        buffer.push(record("orphan", 1));
    }

    #[tokio::test]
    async fn test_logger_drains_in_arrival_order() {
        let (buffer, receiver) = IntakeBuffer::channel();
        let queue = Arc::new(DurableQueue::open_in_memory("events", CorruptionPolicy::Skip).unwrap());

        for i in 0..5 {
            buffer.push(record(&format!("event_{}", i), i));
        }
        drop(buffer); // lets the logger loop terminate

        run_logger(receiver, Arc::clone(&queue)).await;

        assert_eq!(queue.len().unwrap(), 5);
        for i in 0..5 {
            let head = queue.try_peek().unwrap().unwrap();
            assert_eq!(head.event_type(), Some(format!("event_{}", i).as_str()));
            queue.take().await.unwrap();
        }
    }
}
