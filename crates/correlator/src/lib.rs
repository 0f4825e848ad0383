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

//! Matches pipeline outputs back to their pending slots when a `process`
//! stage may reorder, drop, or fail-and-resume instead of emitting one
//! output per input in order.
//!
//! A [`Correlator`] owns a `Map<K, (R, Slot<S>)>`. Requests are admitted with
//! a key derived from the request (`admit`); outputs are resolved with a key
//! derived from the response (`resolve`). All three operations — admit,
//! resolve, sweep — run on a single task driven by
//! [`rf_signal::SignalReceiver::with_receiver_timer`], so the table needs no
//! locking beyond what a rare external diagnostic read would need.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use rf_signal::{Signal, SignalReceiver};
use rf_slot::{FailureKind, Slot};
use rf_task::{labels::TaskLabels, JoinHandleTask, TaskCleaner, TaskManager};
use tokio::sync::watch;

/// What a correlated slot is ultimately completed with.
#[derive(Debug)]
#[non_exhaustive]
pub enum Resolution<S> {
    /// A response matched the admission under this key (and, if a
    /// `correlated` predicate was configured, passed it).
    Matched(S),
    /// A response matched the admission's key, but the caller's `correlated`
    /// predicate rejected the pairing. Carries diagnostic text rather than
    /// the original key/request types, which are not known to this crate's
    /// public failure surface — see `rf_processor::Error::NotCorrelated`,
    /// which is built from this.
    Rejected {
        /// Debug rendering of the correlation key.
        key: String,
        /// Debug rendering of the originally admitted request.
        request: String,
        /// The response that failed to correlate.
        response: S,
    },
}

/// A predicate deciding whether an admitted request and a candidate response
/// are really a pair, beyond matching on `K`. Mirrors the `correlated(c, r)`
/// hook from the "non-correlated variant" in the component design.
pub type Validate<K, R, S> = Arc<dyn Fn(&K, &R, &S) -> bool + Send + Sync>;

enum Event<K, R, S> {
    Admit { key: K, request: R, slot: Slot<Resolution<S>> },
    Resolve { key: K, response: S },
}

/// The stateful bookkeeping that matches pipeline outputs to pending slots by
/// correlation key, and periodically sweeps entries whose slot has already
/// terminated (by timeout, or by a resolved/rejected completion the sweeper
/// hasn't caught up to yet).
pub struct Correlator<K, R, S> {
    name: String,
    sender: flume::Sender<Vec<Event<K, R, S>>>,
    unmatched_responses: Arc<AtomicU64>,
    stopped: watch::Receiver<bool>,
}

impl<K, R, S> Clone for Correlator<K, R, S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
            unmatched_responses: self.unmatched_responses.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

/// A lightweight handle that resolves once the correlator's driving task has
/// observed `Signal::Stop`, force-failed every still-pending entry with
/// `FailureKind::Shutdown`, and exited. Holds only a `watch::Receiver`, not
/// the correlator's admit/resolve channel, so waiting on it never keeps that
/// channel open.
pub struct ShutdownSignal {
    stopped: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Waits until the correlator's driving task has stopped.
    pub async fn wait(mut self) {
        while !*self.stopped.borrow() {
            if self.stopped.changed().await.is_err() {
                break;
            }
        }
    }
}

#[derive(Debug)]
struct CorrelatorCleaner {
    name: String,
}

#[async_trait]
impl TaskCleaner for CorrelatorCleaner {
    async fn cleanup(&self) {
        tracing::trace!(correlator = %self.name, "correlator task joined");
    }
}

impl<K, R, S> Correlator<K, R, S>
where
    K: Eq + Hash + Clone + Send + fmt::Debug + 'static,
    R: Send + fmt::Debug + 'static,
    S: Send + 'static,
{
    /// Spawns the correlator's driving task and registers it with
    /// `task_manager`. `sweep_interval` is the cadence at which terminal
    /// entries are reclaimed from the table; `validate`, when present,
    /// implements the "non-correlated variant" predicate — when absent every
    /// keyed match resolves as `Resolution::Matched`.
    pub fn spawn(
        name: impl Into<String>,
        sweep_interval: Duration,
        validate: Option<Validate<K, R, S>>,
        task_manager: &mut TaskManager,
    ) -> Self {
        let name = name.into();
        let (sender, receiver) = flume::unbounded();
        let task_name = name.clone();
        let unmatched_responses = Arc::new(AtomicU64::new(0));
        let task_unmatched_responses = unmatched_responses.clone();
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let join_handle: JoinHandleTask = tokio::spawn(async move {
            let mut table: HashMap<K, (R, Slot<Resolution<S>>)> = HashMap::new();
            let mut signals = SignalReceiver::with_receiver_timer(receiver, sweep_interval, 0);

            loop {
                match signals.recv().await {
                    Signal::Messages { messages } => {
                        for event in messages {
                            match event {
                                Event::Admit { key, request, slot } => {
                                    // Duplicate keys: last-write-wins. The earlier slot, if
                                    // still pending, is reclaimed by timeout and swept later.
                                    let _ = table.insert(key, (request, slot));
                                }
                                Event::Resolve { key, response } => match table.get(&key) {
                                    Some((request, slot)) => {
                                        let accepted = validate
                                            .as_ref()
                                            .map(|predicate| predicate(&key, request, &response))
                                            .unwrap_or(true);
                                        let resolution = if accepted {
                                            Resolution::Matched(response)
                                        } else {
                                            Resolution::Rejected {
                                                key: format!("{key:?}"),
                                                request: format!("{request:?}"),
                                                response,
                                            }
                                        };
                                        let _ = slot.complete(resolution);
                                    }
                                    None => {
                                        let _ = task_unmatched_responses.fetch_add(1, Ordering::Relaxed);
                                        tracing::trace!(
                                            correlator = %task_name,
                                            key = ?key,
                                            unmatched = task_unmatched_responses.load(Ordering::Relaxed),
                                            "response did not match any pending admission"
                                        );
                                    }
                                },
                            }
                        }
                    }
                    Signal::TimerTick { .. } => {
                        let before = table.len();
                        table.retain(|_, (_, slot)| !slot.is_terminal());
                        let swept = before - table.len();
                        if swept > 0 {
                            tracing::trace!(correlator = %task_name, swept, remaining = table.len(), "swept correlation table");
                        }
                    }
                    Signal::Stop => {
                        for (_, slot) in table.drain() {
                            let _ = slot.fail(FailureKind::Shutdown);
                        }
                        break;
                    }
                }
            }

            let _ = stopped_tx.send(true);
            Box::new(CorrelatorCleaner { name: task_name }) as Box<dyn TaskCleaner>
        });

        task_manager.register(
            join_handle,
            &TaskLabels::new("correlator", &name, "admit|resolve|sweep"),
        );

        Self {
            name,
            sender,
            unmatched_responses,
            stopped: stopped_rx,
        }
    }

    /// The running count of `resolve()` calls whose key matched no pending
    /// admission. Shared with the driving task via the same `Arc` cloned
    /// into every handle, so this reflects the task's count as of the last
    /// increment it has processed.
    pub fn unmatched_responses(&self) -> u64 {
        self.unmatched_responses.load(Ordering::Relaxed)
    }

    /// Returns a handle that resolves once this correlator's channel has
    /// closed and its driving task has force-failed every still-pending
    /// entry with `FailureKind::Shutdown`. Intended for a caller that wants
    /// to wait out the correlator's own drain without holding a `Correlator`
    /// clone (and thus its sender) alive itself.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            stopped: self.stopped.clone(),
        }
    }

    /// Records a fresh admission: `key` is `keyOfRequest(request)`, `slot` is
    /// the envelope's freshly-minted slot. Fire-and-forget; the correlator
    /// task owns ordering.
    pub fn admit(&self, key: K, request: R, slot: Slot<Resolution<S>>) {
        if self.sender.send(vec![Event::Admit { key, request, slot }]).is_err() {
            tracing::warn!(correlator = %self.name, "admit after correlator task stopped");
        }
    }

    /// Records a pipeline output: `key` is `keyOfResponse(response)`. If no
    /// admission is pending under `key`, the response is dropped and
    /// [`Correlator::unmatched_responses`] is incremented.
    pub fn resolve(&self, key: K, response: S) {
        if self.sender.send(vec![Event::Resolve { key, response }]).is_err() {
            tracing::warn!(correlator = %self.name, "resolve after correlator task stopped");
        }
    }
}
