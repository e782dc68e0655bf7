//! Backpressure queue.
//!
//! # Responsibilities
//! - Hold requests that arrived while no backend was eligible
//! - Hand each one a backend, oldest first, when capacity returns
//!
//! # Design Decisions
//! - FIFO: a failed dispatch goes back to the head and the drain stops
//! - No capacity bound and no timeout here; callers may impose a wait limit
//! - The waiting handler holds a [`Ticket`]; dropping it (client gone)
//!   lets the drain skip the entry instead of dispatching into the void

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::load_balancer::{SelectionContext, SelectionError};

struct QueuedRequest<T> {
    context: SelectionContext,
    enqueued_at: Instant,
    responder: oneshot::Sender<T>,
}

/// The waiting side of a queued request.
#[derive(Debug)]
pub struct Ticket<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Ticket<T> {
    /// Wait for dispatch. `None` if the queue was dropped.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }

    /// Non-blocking check, mostly for tests.
    pub fn try_take(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Result of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub dispatched: usize,
    pub abandoned: usize,
    pub remaining: usize,
}

/// FIFO of pending requests.
pub struct BackpressureQueue<T> {
    pending: Mutex<VecDeque<QueuedRequest<T>>>,
}

impl<T> Default for BackpressureQueue<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> std::fmt::Debug for BackpressureQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureQueue").field("len", &self.len()).finish()
    }
}

impl<T> BackpressureQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request at the tail.
    pub fn enqueue(&self, context: SelectionContext) -> Ticket<T> {
        let (responder, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.push_back(QueuedRequest {
            context,
            enqueued_at: Instant::now(),
            responder,
        });
        Ticket { rx }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop the oldest entry and try `dispatch`, until it fails or the queue is empty.
    /// A failed entry is reinserted at the head.
    pub fn drain<F>(&self, mut dispatch: F) -> DrainOutcome
    where
        F: FnMut(&SelectionContext) -> Result<T, SelectionError>,
    {
        let mut outcome = DrainOutcome::default();
        loop {
            let next = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(entry) = next else {
                break;
            };

            if entry.responder.is_closed() {
                outcome.abandoned += 1;
                continue;
            }

            match dispatch(&entry.context) {
                Ok(value) => {
                    let waited = entry.enqueued_at.elapsed();
                    if entry.responder.send(value).is_ok() {
                        tracing::debug!(client = %entry.context.client_ip, waited_ms = waited.as_millis() as u64, "Dispatched queued request");
                        outcome.dispatched += 1;
                    } else {
                        outcome.abandoned += 1;
                    }
                }
                Err(_) => {
                    self.pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_front(entry);
                    break;
                }
            }
        }
        outcome.remaining = self.len();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(n: u8) -> SelectionContext {
        SelectionContext::from_ip(format!("10.0.0.{}", n).parse().unwrap())
    }

    #[test]
    fn drains_in_arrival_order() {
        let queue: BackpressureQueue<u8> = BackpressureQueue::new();
        let mut tickets: Vec<_> = (1..=3).map(|n| queue.enqueue(ctx(n))).collect();

        let mut order = Vec::new();
        let outcome = queue.drain(|c| {
            let octet = match c.client_ip {
                std::net::IpAddr::V4(v4) => v4.octets()[3],
                _ => 0,
            };
            order.push(octet);
            Ok(octet)
        });

        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(outcome.dispatched, 3);
        assert_eq!(outcome.remaining, 0);
        for (i, ticket) in tickets.iter_mut().enumerate() {
            assert_eq!(ticket.try_take(), Some(i as u8 + 1));
        }
    }

    #[test]
    fn failure_reinserts_at_head_and_stops() {
        let queue: BackpressureQueue<u8> = BackpressureQueue::new();
        let mut first = queue.enqueue(ctx(1));
        let _second = queue.enqueue(ctx(2));

        let mut attempts = 0;
        let outcome = queue.drain(|_| {
            attempts += 1;
            Err(SelectionError::NoServersAvailable)
        });
        assert_eq!(attempts, 1);
        assert_eq!(outcome.remaining, 2);

        let outcome = queue.drain(|_| Ok(7));
        assert_eq!(outcome.dispatched, 2);
        assert_eq!(first.try_take(), Some(7));
    }

    #[test]
    fn abandoned_tickets_are_skipped() {
        let queue: BackpressureQueue<u8> = BackpressureQueue::new();
        drop(queue.enqueue(ctx(1)));
        let mut live = queue.enqueue(ctx(2));

        let mut calls = 0;
        let outcome = queue.drain(|_| {
            calls += 1;
            Ok(9)
        });
        assert_eq!(calls, 1);
        assert_eq!(outcome.abandoned, 1);
        assert_eq!(live.try_take(), Some(9));
    }

    #[tokio::test]
    async fn ticket_resolves_after_drain() {
        let queue: std::sync::Arc<BackpressureQueue<&'static str>> = Default::default();
        let ticket = queue.enqueue(ctx(1));
        let q = queue.clone();
        tokio::spawn(async move {
            q.drain(|_| Ok("backend"));
        });
        assert_eq!(ticket.wait().await, Some("backend"));
    }
}
