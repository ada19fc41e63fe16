//! # Work Queue
//!
//! Per-identity deduplicating queue with single-flight processing.
//!
//! - An identity is queued at most once; enqueuing it again only records the
//!   latest reason.
//! - While an identity is being processed it is never handed out again;
//!   enqueues during processing collapse into one follow-up delivered after
//!   [`WorkQueue::mark_done`].
//! - [`WorkQueue::requeue`] schedules a delayed enqueue on a timer task.

use crate::types::{EventKind, Identity};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Longest delay [`WorkQueue::requeue`] honours; longer ones are clamped
pub const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Why an identity was put on the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueReason {
    Event(EventKind),
    Requeue,
}

/// Unit of work handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub identity: Identity,
    /// Latest reason recorded before the item was dequeued
    pub reason: EnqueueReason,
    /// When the item first entered the queue
    pub enqueued_at: Instant,
    /// Requeues since the identity was last forgotten
    pub requeue_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    reason: EnqueueReason,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<Identity>,
    queued: HashMap<Identity, Pending>,
    processing: HashSet<Identity>,
    dirty: HashMap<Identity, Pending>,
    requeues: HashMap<Identity, u32>,
    scheduled: HashMap<Identity, Instant>,
    shutting_down: bool,
}

impl QueueState {
    fn push(&mut self, identity: Identity, pending: Pending) {
        self.order.push_back(identity.clone());
        self.queued.insert(identity, pending);
    }

    fn pop(&mut self) -> Option<WorkItem> {
        while let Some(identity) = self.order.pop_front() {
            if let Some(pending) = self.queued.remove(&identity) {
                self.processing.insert(identity.clone());
                let requeue_count = self.requeues.get(&identity).copied().unwrap_or(0);
                return Some(WorkItem {
                    identity,
                    reason: pending.reason,
                    enqueued_at: pending.enqueued_at,
                    requeue_count,
                });
            }
        }
        None
    }
}

/// Shared queue between the event pump, the requeue timers and the workers
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `identity`; returns true when a new item was queued
    pub fn enqueue(&self, identity: Identity, reason: EnqueueReason) -> bool {
        let mut state = self.lock();
        if state.shutting_down {
            return false;
        }

        if state.processing.contains(&identity) {
            trace!(identity = %identity, ?reason, "in flight; follow-up scheduled");
            state
                .dirty
                .entry(identity)
                .and_modify(|p| p.reason = reason)
                .or_insert(Pending {
                    reason,
                    enqueued_at: Instant::now(),
                });
            return false;
        }

        if let Some(pending) = state.queued.get_mut(&identity) {
            trace!(identity = %identity, ?reason, "already queued; coalesced");
            pending.reason = reason;
            return false;
        }

        state.push(
            identity,
            Pending {
                reason,
                enqueued_at: Instant::now(),
            },
        );
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Wait for the next item; `None` once the queue is shut down
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.pop() {
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `identity`, releasing any follow-up recorded meanwhile
    pub fn mark_done(&self, identity: &Identity) {
        let mut state = self.lock();
        state.processing.remove(identity);

        let Some(pending) = state.dirty.remove(identity) else {
            return;
        };
        if state.shutting_down {
            return;
        }
        state.push(identity.clone(), pending);
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueue `identity` again after `after`, without blocking the caller.
    ///
    /// Only the earliest pending requeue of an identity fires; a timer
    /// replaced by an earlier one does nothing when it wakes.
    pub fn requeue(self: &Arc<Self>, identity: &Identity, after: Duration) {
        let after = after.min(MAX_REQUEUE_DELAY);
        let deadline = Instant::now() + after;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            let count = state.requeues.entry(identity.clone()).or_insert(0);
            *count = count.saturating_add(1);

            if let Some(existing) = state.scheduled.get(identity) {
                if *existing <= deadline {
                    trace!(identity = %identity, "earlier requeue already scheduled");
                    return;
                }
            }
            state.scheduled.insert(identity.clone(), deadline);
        }

        debug!(identity = %identity, delay_ms = after.as_millis() as u64, "requeue scheduled");
        let queue = Arc::clone(self);
        let identity = identity.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut state = queue.lock();
                if state.scheduled.get(&identity) != Some(&deadline) {
                    trace!(identity = %identity, "requeue superseded");
                    return;
                }
                state.scheduled.remove(&identity);
            }
            queue.enqueue(identity, EnqueueReason::Requeue);
        });
    }

    /// Reset the requeue counter of `identity`
    pub fn forget(&self, identity: &Identity) {
        self.lock().requeues.remove(identity);
    }

    /// Stop handing out items and wake every waiting worker
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Items waiting to be dequeued
    pub fn len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items currently being processed
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    /// Requeue timers that have not fired yet
    pub fn scheduled(&self) -> usize {
        self.lock().scheduled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> Identity {
        Identity::new("sso", name)
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_fifo() {
        let queue = WorkQueue::new();
        assert!(queue.enqueue(id("a"), EnqueueReason::Event(EventKind::Created)));
        assert!(queue.enqueue(id("b"), EnqueueReason::Event(EventKind::Created)));

        let first = queue.dequeue().await.unwrap();
        let second = queue.dequeue().await.unwrap();
        assert_eq!(first.identity, id("a"));
        assert_eq!(second.identity, id("b"));
        assert_eq!(queue.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_records_latest_reason() {
        let queue = WorkQueue::new();
        assert!(queue.enqueue(id("a"), EnqueueReason::Event(EventKind::Created)));
        assert!(!queue.enqueue(id("a"), EnqueueReason::Event(EventKind::Updated)));
        assert!(!queue.enqueue(id("a"), EnqueueReason::Event(EventKind::Resynced)));
        assert_eq!(queue.len(), 1);

        let item = queue.dequeue().await.unwrap();
        assert_eq!(item.reason, EnqueueReason::Event(EventKind::Resynced));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_while_processing_yields_one_follow_up() {
        let queue = WorkQueue::new();
        queue.enqueue(id("a"), EnqueueReason::Event(EventKind::Created));
        let item = queue.dequeue().await.unwrap();

        queue.enqueue(id("a"), EnqueueReason::Event(EventKind::Updated));
        queue.enqueue(id("a"), EnqueueReason::Event(EventKind::Updated));
        assert_eq!(queue.len(), 0, "in-flight identity must not be handed out twice");

        queue.mark_done(&item.identity);
        assert_eq!(queue.len(), 1);

        let follow_up = queue.dequeue().await.unwrap();
        assert_eq!(follow_up.identity, id("a"));
        queue.mark_done(&follow_up.identity);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(id("late"), EnqueueReason::Event(EventKind::Created));

        let item = waiter.await.unwrap().unwrap();
        assert_eq!(item.identity, id("late"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();

        assert!(waiter.await.unwrap().is_none());
        assert!(!queue.enqueue(id("a"), EnqueueReason::Requeue));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_delivers_after_delay() {
        let queue = Arc::new(WorkQueue::new());
        queue.requeue(&id("a"), Duration::from_secs(5));
        assert_eq!(queue.scheduled(), 1);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let item = queue.dequeue().await.unwrap();
        assert_eq!(item.reason, EnqueueReason::Requeue);
        assert_eq!(item.requeue_count, 1);
        assert_eq!(queue.scheduled(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_requeue_subsumes_later() {
        let queue = Arc::new(WorkQueue::new());
        queue.requeue(&id("a"), Duration::from_secs(2));
        queue.requeue(&id("a"), Duration::from_secs(60));
        assert_eq!(queue.scheduled(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_requeue_does_not_fire() {
        let queue = Arc::new(WorkQueue::new());
        queue.requeue(&id("a"), Duration::from_secs(60));
        queue.requeue(&id("a"), Duration::from_secs(2));
        assert_eq!(queue.scheduled(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let item = queue.dequeue().await.unwrap();
        queue.mark_done(&item.identity);
        assert_eq!(queue.scheduled(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(queue.is_empty(), "replaced timer enqueued a second pass");
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_requeue_delay_is_clamped() {
        let queue = Arc::new(WorkQueue::new());
        queue.requeue(&id("a"), Duration::from_secs(u64::MAX));
        queue.requeue(&id("b"), Duration::MAX);
        assert_eq!(queue.scheduled(), 2);

        tokio::time::sleep(MAX_REQUEUE_DELAY + Duration::from_secs(1)).await;
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_forget_resets_requeue_count() {
        let queue = Arc::new(WorkQueue::new());
        queue.requeue(&id("a"), Duration::ZERO);
        queue.forget(&id("a"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let item = queue.dequeue().await.unwrap();
        assert_eq!(item.requeue_count, 0);
    }
}
