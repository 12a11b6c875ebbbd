// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry and timeout engine for the coordinator.
//!
//! A single min-heap timer wheel carries every transaction's PREPARE
//! deadline plus the periodic decision heartbeat, serviced by one sweeper
//! thread. Timers are best-effort; terminal transactions are excluded by
//! the handlers themselves, so a stale event is a no-op.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::coordinator::Coordinator;
use crate::message::TxnId;

/// Events the timer wheel delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// A transaction's PREPARE deadline elapsed.
    PrepareDeadline {
        /// Transaction to check.
        txn_id: TxnId,
    },
    /// Periodic re-send of outstanding decisions.
    DecisionSweep,
}

#[derive(Debug)]
struct Entry {
    at: Instant,
    seq: u64,
    event: TimerEvent,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
struct WheelState {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
    shutdown: bool,
}

/// Min-heap timer wheel shared by all transactions.
#[derive(Debug, Default)]
pub struct TimerWheel {
    inner: Mutex<WheelState>,
    cond: Condvar,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an event after a delay.
    pub fn schedule_in(&self, delay: Duration, event: TimerEvent) {
        let mut state = self.inner.lock();
        state.seq += 1;
        let entry = Entry {
            at: Instant::now() + delay,
            seq: state.seq,
            event,
        };
        state.heap.push(Reverse(entry));
        self.cond.notify_one();
    }

    /// Block until the next event is due. Returns `None` after `shutdown`.
    pub fn wait_next(&self) -> Option<TimerEvent> {
        let mut state = self.inner.lock();
        loop {
            if state.shutdown {
                return None;
            }

            let now = Instant::now();
            if state.heap.peek().is_some_and(|Reverse(entry)| entry.at <= now) {
                if let Some(Reverse(entry)) = state.heap.pop() {
                    return Some(entry.event);
                }
                continue;
            }

            match state.heap.peek().map(|Reverse(entry)| entry.at - now) {
                Some(timeout) => {
                    let _ = self.cond.wait_for(&mut state, timeout);
                },
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Wake the sweeper and make `wait_next` return `None`.
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Number of scheduled events.
    pub fn pending(&self) -> usize {
        self.inner.lock().heap.len()
    }
}

/// Sweeper thread driving a coordinator's timers. Shuts down on drop.
pub struct RetryEngine {
    wheel: Arc<TimerWheel>,
    handle: Option<JoinHandle<()>>,
}

impl RetryEngine {
    /// Start the sweeper. Arms the first decision heartbeat immediately;
    /// deadlines are armed by `start_commit` as transactions arrive.
    pub fn start(coordinator: Arc<Coordinator>) -> Self {
        let wheel = coordinator.timers();
        let interval = coordinator.config().resend_interval;
        wheel.schedule_in(interval, TimerEvent::DecisionSweep);

        let thread_wheel = Arc::clone(&wheel);
        let handle = thread::spawn(move || {
            while let Some(event) = thread_wheel.wait_next() {
                match event {
                    TimerEvent::PrepareDeadline { txn_id } => {
                        if let Err(e) = coordinator.expire_prepare(&txn_id) {
                            tracing::error!(
                                txn_id = %txn_id,
                                error = %e,
                                "prepare deadline handling failed"
                            );
                        }
                    },
                    TimerEvent::DecisionSweep => {
                        coordinator.sweep_decisions();
                        thread_wheel.schedule_in(interval, TimerEvent::DecisionSweep);
                    },
                }
            }
        });

        Self {
            wheel,
            handle: Some(handle),
        }
    }
}

impl Drop for RetryEngine {
    fn drop(&mut self) {
        self.wheel.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_fire_in_deadline_order() {
        let wheel = TimerWheel::new();
        wheel.schedule_in(
            Duration::from_millis(30),
            TimerEvent::PrepareDeadline {
                txn_id: "late".to_string(),
            },
        );
        wheel.schedule_in(
            Duration::from_millis(5),
            TimerEvent::PrepareDeadline {
                txn_id: "early".to_string(),
            },
        );

        let first = wheel.wait_next().unwrap();
        let second = wheel.wait_next().unwrap();

        assert_eq!(
            first,
            TimerEvent::PrepareDeadline {
                txn_id: "early".to_string()
            }
        );
        assert_eq!(
            second,
            TimerEvent::PrepareDeadline {
                txn_id: "late".to_string()
            }
        );
    }

    #[test]
    fn test_equal_deadlines_fire_in_schedule_order() {
        let wheel = TimerWheel::new();
        let at = Duration::from_millis(1);
        wheel.schedule_in(
            at,
            TimerEvent::PrepareDeadline {
                txn_id: "first".to_string(),
            },
        );
        wheel.schedule_in(
            at,
            TimerEvent::PrepareDeadline {
                txn_id: "second".to_string(),
            },
        );

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            wheel.wait_next().unwrap(),
            TimerEvent::PrepareDeadline {
                txn_id: "first".to_string()
            }
        );
    }

    #[test]
    fn test_shutdown_unblocks_waiter() {
        let wheel = Arc::new(TimerWheel::new());
        let waiter_wheel = Arc::clone(&wheel);
        let handle = thread::spawn(move || waiter_wheel.wait_next());

        std::thread::sleep(Duration::from_millis(20));
        wheel.shutdown();

        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn test_pending_counts_scheduled_events() {
        let wheel = TimerWheel::new();
        assert_eq!(wheel.pending(), 0);

        wheel.schedule_in(Duration::from_secs(10), TimerEvent::DecisionSweep);
        assert_eq!(wheel.pending(), 1);
    }
}
