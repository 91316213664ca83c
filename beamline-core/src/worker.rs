//! Background delivery worker
//!
//! Single consumer of the durable queue. The worker runs forever once
//! started, processing the queue strictly in FIFO order: the oldest record
//! must reach a terminal outcome (accepted or discarded) before any later
//! record is attempted. Head-of-line blocking is intentional; it preserves
//! the timestamp ordering the server relies on.
//!
//! The loop is an explicit state machine so the connectivity wait, the send
//! path, and the backoff sleep are each testable on their own:
//!
//! ```text
//! CheckingConnectivity ── unreachable ──▶ IdleRetryConnectivity ─┐
//!   ▲      │ reachable                                           │
//!   │      ▼                                                     │
//!   │   Sending ── retryable failure ──▶ Backoff                 │
//!   │      │ terminal outcome              │                     │
//!   └──────┴───────────────────────────────┴─────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::DeliveryConfig;
use crate::net::{Clock, Connectivity, Delivery, Transport};
use crate::queue::DurableQueue;

/// Shift cap keeping `base << retries` inside u64.
const MAX_BACKOFF_SHIFT: u32 = 32;

/// Delivery worker states. See the module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Query network reachability before touching the queue.
    CheckingConnectivity,
    /// Network is down; sleep the connectivity-retry interval and re-check.
    IdleRetryConnectivity,
    /// Peek the head record, space it out, transform it, and send it.
    Sending,
    /// A retryable failure happened; sleep the capped exponential backoff.
    Backoff,
}

/// The background delivery worker.
pub struct DeliveryWorker {
    queue: Arc<DurableQueue>,
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn Connectivity>,
    clock: Arc<dyn Clock>,
    tuning: DeliveryConfig,
    /// Consecutive retryable failures for the current head record. Owned
    /// exclusively by this worker.
    retries: u32,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<DurableQueue>,
        transport: Arc<dyn Transport>,
        connectivity: Arc<dyn Connectivity>,
        clock: Arc<dyn Clock>,
        tuning: DeliveryConfig,
    ) -> Self {
        Self {
            queue,
            transport,
            connectivity,
            clock,
            tuning,
            retries: 0,
        }
    }

    /// Run the worker forever, starting from `CheckingConnectivity`.
    pub async fn run(mut self) {
        tracing::debug!("Delivery worker started");
        let mut state = WorkerState::CheckingConnectivity;
        loop {
            state = self.step(state).await;
        }
    }

    /// Advance the state machine by one transition.
    pub async fn step(&mut self, state: WorkerState) -> WorkerState {
        match state {
            WorkerState::CheckingConnectivity => {
                if self.connectivity.is_reachable().await {
                    WorkerState::Sending
                } else {
                    tracing::debug!("Network unreachable");
                    WorkerState::IdleRetryConnectivity
                }
            }
            WorkerState::IdleRetryConnectivity => {
                tokio::time::sleep(self.tuning.connectivity_retry()).await;
                WorkerState::CheckingConnectivity
            }
            WorkerState::Sending => self.send_head().await,
            WorkerState::Backoff => {
                let delay = self.backoff_delay();
                tracing::info!(?delay, retries = self.retries, "Retrying after backoff");
                tokio::time::sleep(delay).await;
                WorkerState::CheckingConnectivity
            }
        }
    }

    /// Peek the head record, enforce the minimum inter-event spacing, and
    /// attempt one delivery.
    async fn send_head(&mut self) -> WorkerState {
        let entered = Instant::now();

        let record = match self.queue.peek().await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read queue head");
                tokio::time::sleep(Duration::from_secs(1)).await;
                return WorkerState::CheckingConnectivity;
            }
        };

        // The server stores events at one second precision; spacing sends
        // out guarantees consecutive events carry strictly increasing
        // timestamps and sort stably.
        let elapsed = entered.elapsed();
        let min_interval = self.tuning.min_event_interval();
        if elapsed < min_interval {
            tokio::time::sleep(min_interval - elapsed).await;
        }

        let outgoing = record.for_transmission(self.clock.now_ms());
        let outcome = self.transport.deliver(&outgoing).await;

        if outcome.is_terminal() {
            if outcome == Delivery::Rejected {
                tracing::warn!(
                    event_type = record.event_type().unwrap_or("<unknown>"),
                    "Endpoint rejected record; discarding"
                );
            }
            self.retries = 0;
            if let Err(e) = self.queue.take().await {
                // The record may be resent on recovery; delivery is
                // at-least-once.
                tracing::error!(error = %e, "Failed to remove delivered record");
            }
            WorkerState::CheckingConnectivity
        } else {
            self.retries += 1;
            WorkerState::Backoff
        }
    }

    /// Backoff for the current failure streak: `base << (retries - 1)`
    /// seconds, capped at the configured maximum. The first retry waits the
    /// base interval, then 2x, 4x, and so on.
    fn backoff_delay(&self) -> Duration {
        let shift = self.retries.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let secs =
            (self.tuning.base_backoff_secs << shift).min(self.tuning.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorruptionPolicy;
    use crate::event::{EventRecord, KEY_CREATION_TIME, KEY_DELTA};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Mutex;

    struct MockTransport {
        /// Scripted outcomes; once exhausted, everything is accepted.
        outcomes: Mutex<VecDeque<Delivery>>,
        /// Records as they appeared on the wire.
        attempts: Mutex<Vec<EventRecord>>,
    }

    impl MockTransport {
        fn scripted(outcomes: Vec<Delivery>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn deliver(&self, record: &EventRecord) -> Delivery {
            self.attempts.lock().unwrap().push(record.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Delivery::Accepted)
        }
    }

    struct MockConnectivity {
        reachable: AtomicBool,
    }

    impl MockConnectivity {
        fn up() -> Arc<Self> {
            Arc::new(Self {
                reachable: AtomicBool::new(true),
            })
        }

        fn down() -> Arc<Self> {
            Arc::new(Self {
                reachable: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Connectivity for MockConnectivity {
        async fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }
    }

    struct MockClock {
        now: AtomicI64,
    }

    impl MockClock {
        fn at(ms: i64) -> Arc<Self> {
            Arc::new(Self {
                now: AtomicI64::new(ms),
            })
        }
    }

    impl Clock for MockClock {
        fn now_ms(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn worker_with(
        transport: Arc<MockTransport>,
        connectivity: Arc<MockConnectivity>,
        clock: Arc<MockClock>,
    ) -> (DeliveryWorker, Arc<DurableQueue>) {
        let queue =
            Arc::new(DurableQueue::open_in_memory("events", CorruptionPolicy::Skip).unwrap());
        let tuning = DeliveryConfig {
            // No spacing in unit tests; timing behavior is covered in the
            // integration suite.
            min_event_interval_ms: 0,
            ..DeliveryConfig::default()
        };
        let worker = DeliveryWorker::new(
            Arc::clone(&queue),
            transport,
            connectivity,
            clock,
            tuning,
        );
        (worker, queue)
    }

    fn record(event_type: &str, creation: i64) -> EventRecord {
        EventRecord::new(event_type, None, "k", "u", creation)
    }

    #[tokio::test]
    async fn test_connectivity_gate() {
        let transport = MockTransport::scripted(vec![]);
        let (mut worker, _queue) =
            worker_with(Arc::clone(&transport), MockConnectivity::up(), MockClock::at(0));
        assert_eq!(
            worker.step(WorkerState::CheckingConnectivity).await,
            WorkerState::Sending
        );

        let (mut worker, _queue) =
            worker_with(transport, MockConnectivity::down(), MockClock::at(0));
        assert_eq!(
            worker.step(WorkerState::CheckingConnectivity).await,
            WorkerState::IdleRetryConnectivity
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_retry_sleeps_connectivity_interval() {
        let transport = MockTransport::scripted(vec![]);
        let (mut worker, _queue) =
            worker_with(transport, MockConnectivity::down(), MockClock::at(0));

        let before = Instant::now();
        let next = worker.step(WorkerState::IdleRetryConnectivity).await;
        assert_eq!(next, WorkerState::CheckingConnectivity);
        assert_eq!(before.elapsed(), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_accepted_record_is_taken_and_retries_reset() {
        let transport = MockTransport::scripted(vec![Delivery::Accepted]);
        let (mut worker, queue) =
            worker_with(Arc::clone(&transport), MockConnectivity::up(), MockClock::at(10_000));
        queue.add(&record("e", 4_000)).unwrap();
        worker.retries = 3;

        let next = worker.step(WorkerState::Sending).await;
        assert_eq!(next, WorkerState::CheckingConnectivity);
        assert_eq!(worker.retries, 0);
        assert!(queue.is_empty().unwrap());
        assert_eq!(transport.attempt_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_record_is_discarded_after_one_attempt() {
        let transport = MockTransport::scripted(vec![Delivery::Rejected]);
        let (mut worker, queue) =
            worker_with(Arc::clone(&transport), MockConnectivity::up(), MockClock::at(0));
        queue.add(&record("e", 0)).unwrap();

        let next = worker.step(WorkerState::Sending).await;
        assert_eq!(next, WorkerState::CheckingConnectivity);
        assert!(queue.is_empty().unwrap());
        assert_eq!(transport.attempt_count(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_keeps_head_and_increments_retries() {
        let transport = MockTransport::scripted(vec![Delivery::Retry]);
        let (mut worker, queue) =
            worker_with(Arc::clone(&transport), MockConnectivity::up(), MockClock::at(0));
        let original = record("e", 0);
        queue.add(&original).unwrap();

        let next = worker.step(WorkerState::Sending).await;
        assert_eq!(next, WorkerState::Backoff);
        assert_eq!(worker.retries, 1);
        // Record remains the head for the next attempt
        assert_eq!(queue.try_peek().unwrap().unwrap(), original);
    }

    #[tokio::test]
    async fn test_outgoing_record_carries_delta_not_creation_time() {
        let transport = MockTransport::scripted(vec![Delivery::Accepted]);
        let (mut worker, queue) =
            worker_with(Arc::clone(&transport), MockConnectivity::up(), MockClock::at(9_500));
        queue.add(&record("e", 2_000)).unwrap();

        worker.step(WorkerState::Sending).await;

        let attempts = transport.attempts.lock().unwrap();
        let sent = &attempts[0];
        // floor((9500 - 2000) / 1000) = 7
        assert_eq!(sent.get(KEY_DELTA), Some(&serde_json::Value::from(7)));
        assert!(sent.get(KEY_CREATION_TIME).is_none());
    }

    #[tokio::test]
    async fn test_backoff_ladder_capped() {
        let transport = MockTransport::scripted(vec![]);
        let (mut worker, _queue) =
            worker_with(transport, MockConnectivity::up(), MockClock::at(0));

        // retries → seconds: 1, 2, 4, ..., capped at 64
        let expected = [
            (1u32, 1u64),
            (2, 2),
            (3, 4),
            (4, 8),
            (5, 16),
            (6, 32),
            (7, 64),
            (8, 64),
            (40, 64),
        ];
        for (retries, secs) in expected {
            worker.retries = retries;
            assert_eq!(worker.backoff_delay(), Duration::from_secs(secs));
        }
    }
}
