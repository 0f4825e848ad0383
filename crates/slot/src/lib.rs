#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! `ExpiringResponseSlot`: a one-shot, single-producer/single-consumer response
//! cell with a bound timeout. A slot starts `Pending` and is driven to exactly
//! one terminal state — a value, or a typed failure — either by whoever holds
//! it (`complete`/`fail`) or by its own deadline timer, whichever happens
//! first.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::Notify;

/// All the failure kinds a slot can produce unassisted. Higher layers (the
/// processor, the correlator) attach their own failure kinds on top of these
/// two; see `rf_processor::Error`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FailureKind {
    /// The slot's deadline elapsed while it was still pending.
    #[error("timeout (tag: {tag})")]
    Timeout {
        /// Opaque diagnostic text supplied when the slot was created.
        tag: String,
    },
    /// The slot was still pending when the owning pipeline finished draining.
    #[error("shutdown")]
    Shutdown,
}

/// The terminal outcome observed by whoever awaits a slot.
#[derive(Debug)]
#[non_exhaustive]
pub enum SlotOutcome<S> {
    /// The slot was completed with a value.
    Value(S),
    /// The slot failed before a value arrived.
    Failure(FailureKind),
}

impl<S: fmt::Debug> fmt::Display for SlotOutcome<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotOutcome::Value(v) => write!(f, "value({:?})", v),
            SlotOutcome::Failure(kind) => write!(f, "failure({})", kind),
        }
    }
}

struct Inner<S> {
    terminal: AtomicBool,
    outcome: Mutex<Option<SlotOutcome<S>>>,
    notify: Notify,
    tag: String,
}

impl<S> Inner<S> {
    /// Attempts the single allowed Pending -> terminal transition. Returns
    /// `true` if this call won the race.
    fn try_terminate(&self, outcome: SlotOutcome<S>) -> bool {
        if self.terminal.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.outcome.lock().expect("slot outcome lock poisoned") = Some(outcome);
        self.notify.notify_waiters();
        true
    }
}

/// A write-once, read-once response cell. `complete`, `fail`, and the
/// deadline timer race to drive the cell to a terminal state via a single
/// atomic compare-and-set; only the winner's outcome is observed.
#[derive(Clone)]
pub struct Slot<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Slot<S>
where
    S: Send + 'static,
{
    /// Creates a fresh pending slot. `timeout = None` means the slot never
    /// times out on its own (used by callers that pair the slot with their
    /// own cancellation, or in tests exercising the identity round-trip
    /// law). `tag` is opaque diagnostic text carried into `FailureKind::Timeout`.
    pub fn new(timeout: Option<Duration>, tag: impl Into<String>) -> Self {
        let inner = Arc::new(Inner {
            terminal: AtomicBool::new(false),
            outcome: Mutex::new(None),
            notify: Notify::new(),
            tag: tag.into(),
        });
        let slot = Slot { inner };

        if let Some(timeout) = timeout {
            let timer_slot = slot.clone();
            let _join_handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let tag = timer_slot.inner.tag.clone();
                if timer_slot.fail(FailureKind::Timeout { tag: tag.clone() }) {
                    tracing::trace!(%tag, "slot timed out");
                }
            });
        }

        slot
    }

    /// Returns the opaque diagnostic tag this slot was created with.
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Transitions Pending -> Completed(value). Returns `true` on success,
    /// `false` if the slot had already reached a terminal state.
    pub fn complete(&self, value: S) -> bool {
        self.inner.try_terminate(SlotOutcome::Value(value))
    }

    /// Transitions Pending -> Failed(kind). Returns `true` on success, `false`
    /// if the slot had already reached a terminal state.
    pub fn fail(&self, kind: FailureKind) -> bool {
        self.inner.try_terminate(SlotOutcome::Failure(kind))
    }

    /// Returns whether the slot has already reached a terminal state, without
    /// consuming it. Used by the correlator's sweeper to decide whether a
    /// table entry can be reclaimed.
    pub fn is_terminal(&self) -> bool {
        self.inner.terminal.load(Ordering::Acquire)
    }

    /// Observes the terminal state of this slot. Must be called at most once
    /// per slot by the submitter; consumes the slot to make that contract
    /// hard to violate by accident.
    pub async fn await_outcome(self) -> SlotOutcome<S> {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.terminal.load(Ordering::Acquire) {
                return self
                    .inner
                    .outcome
                    .lock()
                    .expect("slot outcome lock poisoned")
                    .take()
                    .expect("terminal flag implies an outcome was stored");
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn complete_resolves_the_await() {
        let slot: Slot<u32> = Slot::new(None, "t1");
        assert!(slot.complete(42));
        match slot.await_outcome().await {
            SlotOutcome::Value(v) => assert_eq!(v, 42),
            SlotOutcome::Failure(kind) => panic!("unexpected failure: {kind}"),
        }
    }

    #[tokio::test]
    async fn only_the_first_terminal_transition_wins() {
        let slot: Slot<u32> = Slot::new(None, "t2");
        assert!(slot.complete(1));
        assert!(!slot.complete(2));
        assert!(!slot.fail(FailureKind::Shutdown));
        match slot.await_outcome().await {
            SlotOutcome::Value(v) => assert_eq!(v, 1),
            SlotOutcome::Failure(kind) => panic!("unexpected failure: {kind}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out_a_still_pending_slot() {
        let slot: Slot<u32> = Slot::new(Some(Duration::from_millis(50)), "abc");
        tokio::time::advance(Duration::from_millis(60)).await;
        match slot.await_outcome().await {
            SlotOutcome::Failure(FailureKind::Timeout { tag }) => assert_eq!(tag, "abc"),
            other => panic!("expected Timeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completing_before_the_deadline_beats_the_timer() {
        let slot: Slot<u32> = Slot::new(Some(Duration::from_millis(50)), "abc");
        assert!(slot.complete(7));
        tokio::time::advance(Duration::from_millis(60)).await;
        match slot.await_outcome().await {
            SlotOutcome::Value(v) => assert_eq!(v, 7),
            SlotOutcome::Failure(kind) => panic!("unexpected failure: {kind}"),
        }
    }

    #[test]
    fn is_terminal_reflects_state_without_consuming() {
        let slot: Slot<u32> = Slot::new(None, "t3");
        assert!(!slot.is_terminal());
        assert!(slot.complete(9));
        assert!(slot.is_terminal());
    }
}
