//! Shared Dispatch State
//!
//! The working queue, the in-flight set, the sent ledger and the abandoned set
//! live behind one mutex so that every transition between them is atomic:
//! - two dispatch loops can never claim the same id
//! - an id moves from in-flight to the ledger in one step, never sitting in both
//!
//! The lock is never held across an `.await`.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use wd_common::{MessageId, QueuedMessage};

/// Why a dequeued or fetched message was dropped without dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    AlreadySent,
    Abandoned,
}

/// Result of merging one fetched batch into the working queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: usize,
    pub evicted: usize,
    pub skipped: usize,
}

/// Outcome of [`DispatchState::claim_next`]
#[derive(Debug)]
pub enum Claim {
    Claimed(InFlightGuard, QueuedMessage),
    Skipped { id: MessageId, reason: SkipReason },
    Empty,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub ledger_size: usize,
    pub abandoned: usize,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<QueuedMessage>,
    in_flight: HashSet<MessageId>,
    sent: BTreeSet<MessageId>,
    abandoned: HashSet<MessageId>,
}

impl Inner {
    fn skip_reason(&self, id: MessageId) -> Option<SkipReason> {
        if self.in_flight.contains(&id) {
            Some(SkipReason::InFlight)
        } else if self.sent.contains(&id) {
            Some(SkipReason::AlreadySent)
        } else if self.abandoned.contains(&id) {
            Some(SkipReason::Abandoned)
        } else {
            None
        }
    }
}

/// State shared by the queue fetcher and every dispatch loop
#[derive(Default)]
pub struct DispatchState {
    inner: Mutex<Inner>,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the ledger set with ids loaded from disk
    pub fn load_ledger<I: IntoIterator<Item = MessageId>>(&self, ids: I) {
        self.inner.lock().sent.extend(ids);
    }

    /// Merge validated messages from one upstream response.
    ///
    /// `upstream_ids` holds every valid id of the response, including ones that
    /// are in-flight or already sent. Queued entries outside that set were
    /// retracted upstream and are evicted.
    pub fn merge_batch(
        &self,
        messages: Vec<QueuedMessage>,
        upstream_ids: &HashSet<MessageId>,
    ) -> MergeReport {
        let mut inner = self.inner.lock();
        let mut report = MergeReport::default();
        let mut queued: HashSet<MessageId> = inner.queue.iter().map(|m| m.id).collect();

        for message in messages {
            if let Some(reason) = inner.skip_reason(message.id) {
                debug!(message_id = message.id, ?reason, "Ignoring fetched message");
                report.skipped += 1;
                continue;
            }
            if !queued.insert(message.id) {
                continue;
            }
            inner.queue.push_back(message);
            report.added += 1;
        }

        let before = inner.queue.len();
        inner.queue.retain(|m| upstream_ids.contains(&m.id));
        report.evicted = before - inner.queue.len();

        report
    }

    /// Drop everything staged in the working queue. Returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.queue.len();
        inner.queue.clear();
        dropped
    }

    /// Pop the head of the queue and mark it in-flight in one step.
    pub fn claim_next(self: &Arc<Self>) -> Claim {
        let mut inner = self.inner.lock();
        let message = match inner.queue.pop_front() {
            Some(m) => m,
            None => return Claim::Empty,
        };

        if let Some(reason) = inner.skip_reason(message.id) {
            return Claim::Skipped { id: message.id, reason };
        }

        inner.in_flight.insert(message.id);
        let guard = InFlightGuard {
            state: Arc::clone(self),
            id: message.id,
        };
        Claim::Claimed(guard, message)
    }

    /// Put an unsent message back at the head of the queue.
    ///
    /// Used when a loop is stopped after claiming but before sending. Returns
    /// false if the id is in-flight, sent, abandoned or already queued.
    pub fn requeue_front(&self, message: QueuedMessage) -> bool {
        let mut inner = self.inner.lock();
        if inner.skip_reason(message.id).is_some()
            || inner.queue.iter().any(|m| m.id == message.id)
        {
            return false;
        }
        inner.queue.push_front(message);
        true
    }

    /// Move an id from in-flight into the ledger. Returns false if it was
    /// already recorded.
    pub fn mark_sent(&self, id: MessageId) -> bool {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(&id);
        inner.sent.insert(id)
    }

    /// Remember a terminally failed id so it is not fetched again
    pub fn mark_abandoned(&self, id: MessageId) {
        self.inner.lock().abandoned.insert(id);
    }

    fn release(&self, id: MessageId) {
        self.inner.lock().in_flight.remove(&id);
    }

    pub fn is_in_flight(&self, id: MessageId) -> bool {
        self.inner.lock().in_flight.contains(&id)
    }

    pub fn is_sent(&self, id: MessageId) -> bool {
        self.inner.lock().sent.contains(&id)
    }

    pub fn is_abandoned(&self, id: MessageId) -> bool {
        self.inner.lock().abandoned.contains(&id)
    }

    /// Ledger ids in ascending order
    pub fn ledger_ids(&self) -> Vec<MessageId> {
        self.inner.lock().sent.iter().copied().collect()
    }

    /// Ids in the working queue, head first
    pub fn queued_ids(&self) -> Vec<MessageId> {
        self.inner.lock().queue.iter().map(|m| m.id).collect()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            queue_depth: inner.queue.len(),
            in_flight: inner.in_flight.len(),
            ledger_size: inner.sent.len(),
            abandoned: inner.abandoned.len(),
        }
    }
}

/// Marks one id in-flight for as long as it lives.
///
/// Dropping the guard removes the id from the in-flight set, whichever way the
/// dispatch iteration ended.
#[derive(Debug)]
pub struct InFlightGuard {
    state: Arc<DispatchState>,
    id: MessageId,
}

impl InFlightGuard {
    pub fn id(&self) -> MessageId {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.release(self.id);
    }
}

impl std::fmt::Debug for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchState")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wd_common::MessageKind;

    fn msg(id: MessageId) -> QueuedMessage {
        QueuedMessage {
            id,
            destination: "51999999999".to_string(),
            body: format!("message {}", id),
            kind: MessageKind::Text,
            media_url: None,
            title: None,
        }
    }

    fn merge(state: &DispatchState, ids: &[MessageId]) -> MergeReport {
        let upstream: HashSet<MessageId> = ids.iter().copied().collect();
        state.merge_batch(ids.iter().map(|&id| msg(id)).collect(), &upstream)
    }

    #[test]
    fn test_merge_preserves_arrival_order() {
        let state = DispatchState::new();
        let report = merge(&state, &[3, 1, 2]);

        assert_eq!(report.added, 3);
        assert_eq!(state.queued_ids(), vec![3, 1, 2]);
    }

    #[test]
    fn test_merge_does_not_duplicate_queued_ids() {
        let state = DispatchState::new();
        merge(&state, &[1, 2]);
        let report = merge(&state, &[1, 2, 3]);

        assert_eq!(report.added, 1);
        assert_eq!(state.queued_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_retracted_ids_are_evicted() {
        let state = DispatchState::new();
        merge(&state, &[1, 2, 3]);
        let report = merge(&state, &[1, 3]);

        assert_eq!(report.evicted, 1);
        assert_eq!(state.queued_ids(), vec![1, 3]);
    }

    #[test]
    fn test_merge_skips_sent_in_flight_and_abandoned() {
        let state = Arc::new(DispatchState::new());
        state.load_ledger([10]);
        state.mark_abandoned(11);
        merge(&state, &[12]);
        let guard = match state.claim_next() {
            Claim::Claimed(guard, _) => guard,
            other => panic!("expected claim, got {:?}", other),
        };

        let report = merge(&state, &[10, 11, 12, 13]);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.added, 1);
        assert_eq!(state.queued_ids(), vec![13]);
        drop(guard);
    }

    #[test]
    fn test_clear_queue() {
        let state = DispatchState::new();
        merge(&state, &[1, 2]);
        assert_eq!(state.clear_queue(), 2);
        assert!(state.queued_ids().is_empty());
    }

    #[test]
    fn test_claim_marks_in_flight_until_guard_drops() {
        let state = Arc::new(DispatchState::new());
        merge(&state, &[1]);

        match state.claim_next() {
            Claim::Claimed(guard, message) => {
                assert_eq!(message.id, 1);
                assert_eq!(guard.id(), 1);
                assert!(state.is_in_flight(1));
            }
            other => panic!("expected claim, got {:?}", other),
        }

        assert!(!state.is_in_flight(1));
        assert!(matches!(state.claim_next(), Claim::Empty));
    }

    #[test]
    fn test_claim_skips_sent_ids_without_requeue() {
        let state = Arc::new(DispatchState::new());
        merge(&state, &[5, 6]);
        state.load_ledger([5]);

        match state.claim_next() {
            Claim::Skipped { id, reason } => {
                assert_eq!(id, 5);
                assert_eq!(reason, SkipReason::AlreadySent);
            }
            other => panic!("expected skip, got {:?}", other),
        }
        assert_eq!(state.queued_ids(), vec![6]);
    }

    #[test]
    fn test_requeue_front_after_release() {
        let state = Arc::new(DispatchState::new());
        merge(&state, &[1, 2]);

        let Claim::Claimed(guard, message) = state.claim_next() else {
            panic!("expected claim");
        };
        assert!(!state.requeue_front(message.clone()));

        drop(guard);
        assert!(state.requeue_front(message.clone()));
        assert!(!state.requeue_front(message));
        assert_eq!(state.queued_ids(), vec![1, 2]);
    }

    #[test]
    fn test_mark_sent_never_leaves_id_in_both_sets() {
        let state = Arc::new(DispatchState::new());
        merge(&state, &[1]);

        let Claim::Claimed(guard, _) = state.claim_next() else {
            panic!("expected claim");
        };
        assert!(state.mark_sent(1));
        assert!(state.is_sent(1));
        assert!(!state.is_in_flight(1));

        drop(guard);
        assert!(state.is_sent(1));
        assert!(!state.is_in_flight(1));
        assert!(!state.mark_sent(1));
    }

    #[test]
    fn test_concurrent_claims_never_share_an_id() {
        let state = Arc::new(DispatchState::new());
        let ids: Vec<MessageId> = (0..200).collect();
        merge(&state, &ids);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    let mut claimed = Vec::new();
                    loop {
                        match state.claim_next() {
                            Claim::Claimed(guard, m) => {
                                state.mark_sent(m.id);
                                drop(guard);
                                claimed.push(m.id);
                            }
                            Claim::Skipped { .. } => continue,
                            Claim::Empty => break,
                        }
                    }
                    claimed
                })
            })
            .collect();

        let mut all: Vec<MessageId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, ids);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.ledger_size, 200);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.queue_depth, 0);
    }
}
