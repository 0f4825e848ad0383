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

//! `IntoableProcessor`: a long-running in-process pipeline instance.
//!
//! Owns a bounded input queue and a materialized stream that runs a
//! user-supplied [`Process`] end-to-end, pairing each admitted request with
//! a [`rf_slot::Slot`] and completing that slot from the emitted output.
//! Construction spawns exactly two cooperating tasks — an admission loop
//! that reads the bounded input queue and forwards envelopes, and a
//! completion loop that drives `process` with bounded concurrency and
//! resolves slots (directly, or through a [`rf_correlator::Correlator`] when
//! the pipeline may reorder or drop elements) — both registered with the
//! caller's [`rf_task::TaskManager`].

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use rf_correlator::{Correlator, Validate};
use rf_slot::{FailureKind, Slot, SlotOutcome};
use rf_task::{labels::TaskLabels, shutdown::CoordinatedShutdown, JoinHandleTask, TaskCleaner, TaskManager};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use validator::Validate as ValidatorValidate;

pub use rf_correlator::Resolution;

/// A single outcome that can be produced by the pipeline for a response
/// slot, re-exported from `rf_correlator` because the same envelope type is
/// used whether or not correlation is enabled: in the passthrough case every
/// envelope resolves as [`Resolution::Matched`].
pub type EnvelopeSlot<S> = Slot<Resolution<S>>;

/// All the failure kinds this crate's public API can surface. Mirrors the
/// taxonomy in the component design: `InvalidArgument` is construction-time,
/// the rest are per-request.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error<S> {
    /// Construction-time validation failure (`buffer_size`/`max_in_flight` <= 0).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was invalid.
        message: String,
    },
    /// Backpressure drop: the input queue was full when `submit`/`offer` was called.
    #[error("processor '{name}' is unavailable (input queue full)")]
    Unavailable {
        /// The processor's diagnostic name.
        name: String,
    },
    /// The slot's deadline elapsed while still pending.
    #[error("timeout (tag: {tag})")]
    Timeout {
        /// Opaque diagnostic tag carried from the request.
        tag: String,
    },
    /// The slot was still pending when the processor finished draining after `shutdown()`.
    #[error("processor shut down")]
    Shutdown,
    /// A queue-offer outcome outside the {Enqueued, Dropped} pair was observed.
    #[error("unexpected offer result: {kind}")]
    UnexpectedOfferResult {
        /// Diagnostic description of the unexpected outcome.
        kind: String,
    },
    /// The correlator's `correlated` predicate rejected a key-matched pairing.
    #[error("response did not correlate with the pending request (key: {key})")]
    NotCorrelated {
        /// Debug rendering of the correlation key.
        key: String,
        /// Debug rendering of the originally admitted request.
        request: String,
        /// The response that failed to correlate.
        response: S,
    },
}

impl<S> From<SlotOutcome<Resolution<S>>> for Error<S> {
    fn from(outcome: SlotOutcome<Resolution<S>>) -> Self {
        match outcome {
            SlotOutcome::Value(Resolution::Matched(_)) => {
                unreachable!("interpret() must special-case the Matched value before converting to Error")
            }
            SlotOutcome::Value(Resolution::Rejected { key, request, response }) => {
                Error::NotCorrelated { key, request, response }
            }
            SlotOutcome::Failure(FailureKind::Timeout { tag }) => Error::Timeout { tag },
            SlotOutcome::Failure(FailureKind::Shutdown) => Error::Shutdown,
            // `SlotOutcome`, `Resolution`, and `FailureKind` are all `#[non_exhaustive]`;
            // this arm future-proofs against variants added upstream later.
            _ => Error::Shutdown,
        }
    }
}

/// Converts a slot's terminal outcome into the public `submit()` result.
/// Exposed for the `into` splice operator, which allocates and awaits its
/// own slots rather than going through `submit()`.
pub fn interpret<S>(outcome: SlotOutcome<Resolution<S>>) -> Result<S, Error<S>> {
    match outcome {
        SlotOutcome::Value(Resolution::Matched(value)) => Ok(value),
        other => Err(other.into()),
    }
}

/// A failure raised by a user-supplied [`Process`]. Carried as diagnostic
/// text; the element is dropped under the `Resume` supervision directive and
/// its slot is left pending (it is reclaimed by its own deadline timer).
#[derive(thiserror::Error, Debug)]
#[error("{message}")]
pub struct ProcessFailure {
    /// Diagnostic description of the failure.
    pub message: String,
}

impl ProcessFailure {
    /// Builds a failure from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// The opaque transformation from a request element to a response element.
/// Must emit exactly one `S` per admitted `R`, in order, when correlation is
/// not enabled (see the "Resume contract" in the data model); free to
/// reorder, drop, or batch when correlation is enabled.
#[async_trait]
pub trait Process<R, S>: Send + Sync
where
    R: Send + 'static,
    S: Send + 'static,
{
    /// Runs the transformation for a single admitted request.
    async fn run(&self, request: R) -> Result<S, ProcessFailure>;
}

/// Adapts a plain async closure into a [`Process`].
pub struct FnProcess<F> {
    f: F,
}

impl<F> FnProcess<F> {
    /// Wraps `f` as a [`Process`].
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<R, S, F, Fut> Process<R, S> for FnProcess<F>
where
    R: Send + 'static,
    S: Send + 'static,
    F: Fn(R) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<S, ProcessFailure>> + Send,
{
    async fn run(&self, request: R) -> Result<S, ProcessFailure> {
        (self.f)(request).await
    }
}

/// Construction-time configuration for an [`IntoableProcessor`]. Validated
/// with `validator::Validate` before anything is spawned.
#[derive(Debug, Clone, ValidatorValidate)]
pub struct ProcessorConfig {
    /// Diagnostic identifier; appears in failure payloads and logs.
    pub name: String,
    /// Hard requirement: construction fails with `InvalidArgument` when <= 0.
    #[validate(range(min = 1))]
    pub buffer_size: usize,
    /// Bounds the internal pipeline concurrency (the auxiliary zipped
    /// buffer). Defaults to `buffer_size` when built via [`ProcessorConfig::new`].
    #[validate(range(min = 1))]
    pub max_in_flight: usize,
    /// Per-request deadline applied to each slot at admission.
    pub timeout: Duration,
}

impl ProcessorConfig {
    /// Creates a configuration with `max_in_flight` defaulted to `buffer_size`.
    pub fn new(name: impl Into<String>, buffer_size: usize, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            buffer_size,
            max_in_flight: buffer_size,
            timeout,
        }
    }

    /// Overrides `max_in_flight` independently of `buffer_size`.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }
}

/// Correlation wiring: when present, `IntoableProcessor` matches pipeline
/// outputs back to pending slots via these two key functions instead of
/// assuming the pipeline is order-preserving and 1:1.
pub struct CorrelationConfig<K, R, S> {
    /// Derives the correlation key from an admitted request.
    pub key_of_request: Arc<dyn Fn(&R) -> K + Send + Sync>,
    /// Derives the correlation key from an emitted response.
    pub key_of_response: Arc<dyn Fn(&S) -> K + Send + Sync>,
    /// Cadence at which the correlation table sweeps terminal entries.
    pub sweep_interval: Duration,
    /// Optional predicate rejecting key-matched pairs that aren't really a match.
    pub validate: Option<Validate<K, R, S>>,
}

impl<K, R, S> CorrelationConfig<K, R, S> {
    /// Builds a correlation config without the `correlated(c, r)` predicate.
    pub fn new(
        key_of_request: impl Fn(&R) -> K + Send + Sync + 'static,
        key_of_response: impl Fn(&S) -> K + Send + Sync + 'static,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            key_of_request: Arc::new(key_of_request),
            key_of_response: Arc::new(key_of_response),
            sweep_interval,
            validate: None,
        }
    }

    /// Attaches the "non-correlated variant" predicate.
    pub fn with_validate(mut self, validate: Validate<K, R, S>) -> Self {
        self.validate = Some(validate);
        self
    }
}

/// The outcome of offering an envelope to the bounded input queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OfferOutcome {
    /// The envelope was accepted into the queue.
    Enqueued,
    /// The queue was full; the envelope was dropped (drop-newest policy).
    Dropped,
}

enum Command<R, S> {
    Submit(R, EnvelopeSlot<S>),
    Stop,
}

/// The write-end of an [`IntoableProcessor`]'s bounded input, usable by the
/// `into` splice operator without going through `submit()`.
#[derive(Clone)]
pub struct IntoableSink<R, S> {
    name: String,
    timeout: Duration,
    accepting: Arc<std::sync::atomic::AtomicBool>,
    sender: flume::Sender<Command<R, S>>,
}

impl<R, S> IntoableSink<R, S>
where
    R: Send + 'static,
    S: Send + 'static,
{
    /// The diagnostic name of the processor this sink feeds.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The per-request deadline the owning processor applies to slots
    /// created through `submit()`. Exposed so a splice operator that builds
    /// its own slots (bypassing `submit()`) can apply the same deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Offers a pre-built envelope directly, skipping `submit()`'s own slot
    /// allocation. Used by the splice operator, which allocates its own slot
    /// so it can keep advancing the upstream sequence while awaiting it.
    pub fn offer(&self, request: R, slot: EnvelopeSlot<S>) -> Result<OfferOutcome, Error<S>> {
        if !self.accepting.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        match self.sender.try_send(Command::Submit(request, slot)) {
            Ok(()) => Ok(OfferOutcome::Enqueued),
            Err(flume::TrySendError::Full(_)) => Ok(OfferOutcome::Dropped),
            Err(flume::TrySendError::Disconnected(_)) => Err(Error::UnexpectedOfferResult {
                kind: "input channel disconnected".to_string(),
            }),
        }
    }
}

#[derive(Debug)]
struct ProcessorCleaner {
    name: String,
    role: &'static str,
}

#[async_trait]
impl TaskCleaner for ProcessorCleaner {
    async fn cleanup(&self) {
        tracing::trace!(processor = %self.name, role = %self.role, "processor task joined");
    }
}

/// A long-running in-process pipeline instance: owns a bounded input queue
/// and a materialized stream that runs `process` end-to-end, pairing each
/// admitted request with its slot and completing the slot from the emitted
/// output.
pub struct IntoableProcessor<R, S> {
    name: String,
    timeout: Duration,
    accepting: Arc<std::sync::atomic::AtomicBool>,
    sender: flume::Sender<Command<R, S>>,
    stop_sent: Arc<tokio::sync::Mutex<bool>>,
    done_rx: watch::Receiver<bool>,
    _phantom: PhantomData<S>,
}

impl<R, S> Clone for IntoableProcessor<R, S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            timeout: self.timeout,
            accepting: self.accepting.clone(),
            sender: self.sender.clone(),
            stop_sent: self.stop_sent.clone(),
            done_rx: self.done_rx.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<R, S> IntoableProcessor<R, S>
where
    R: Send + fmt::Debug + 'static,
    S: Send + fmt::Debug + 'static,
{
    /// Validates `config`, then spawns the admission loop and a completion
    /// loop that drives `process` with bounded concurrency (`buffered`,
    /// preserving input order) and completes each slot directly with
    /// `Resolution::Matched`.
    pub fn new<P>(process: P, config: ProcessorConfig, task_manager: &mut TaskManager) -> Result<Self, Error<S>>
    where
        P: Process<R, S> + 'static,
    {
        config
            .validate()
            .map_err(|err| Error::InvalidArgument { message: err.to_string() })?;

        let (sender, receiver) = flume::bounded(config.buffer_size);
        let (to_process_tx, to_process_rx) = mpsc::channel(config.max_in_flight);
        let accepting = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (done_tx, done_rx) = watch::channel(false);
        let process = Arc::new(process);

        spawn_admission_loop(config.name.clone(), receiver, to_process_tx, task_manager);

        let name = config.name.clone();
        let max_in_flight = config.max_in_flight;
        // Keyed rather than a plain `Vec` so a terminated slot can be erased as
        // soon as it resolves instead of only at the end of the stream — the
        // processor is long-running, so this map's size tracks in-flight
        // requests, not lifetime admissions.
        let outstanding: Arc<std::sync::Mutex<HashMap<u64, EnvelopeSlot<S>>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));
        let next_id = Arc::new(AtomicU64::new(0));
        let join_handle: JoinHandleTask = tokio::spawn(async move {
            let admitted = outstanding.clone();
            let stream = ReceiverStream::new(to_process_rx).map(move |(request, slot): (R, EnvelopeSlot<S>)| {
                let process = process.clone();
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let _ = admitted
                    .lock()
                    .expect("outstanding slots lock poisoned")
                    .insert(id, slot.clone());
                let admitted = admitted.clone();
                async move {
                    let outcome = process.run(request).await;
                    let _ = admitted.lock().expect("outstanding slots lock poisoned").remove(&id);
                    (outcome, slot)
                }
            });
            tokio::pin!(stream);
            let mut stream = stream.buffered(max_in_flight.max(1));

            while let Some((outcome, slot)) = stream.next().await {
                match outcome {
                    Ok(value) => {
                        let _ = slot.complete(Resolution::Matched(value));
                    }
                    Err(failure) => {
                        tracing::error!(processor = %name, error = %failure, "process failed for element, dropping under resume supervision");
                    }
                }
            }

            // Every admitted envelope has now passed through `process` once and
            // been erased from `outstanding` above, but one dropped under Resume
            // supervision (the `Err` arm above) left its slot pending. Force
            // those to a terminal Shutdown failure instead of leaving them to
            // their own deadline timer — `whenDone` must not resolve while any
            // admitted slot is still outstanding.
            for (_, slot) in outstanding.lock().expect("outstanding slots lock poisoned").drain() {
                let _ = slot.fail(FailureKind::Shutdown);
            }

            tracing::info!(processor = %name, "processor drained, resolving whenDone");
            let _ = done_tx.send(true);
            Box::new(ProcessorCleaner { name, role: "completion" }) as Box<dyn TaskCleaner>
        });
        task_manager.register(
            join_handle,
            &TaskLabels::new("processor", &config.name, "completion"),
        );

        Ok(Self {
            name: config.name,
            timeout: config.timeout,
            accepting,
            sender,
            stop_sent: Arc::new(tokio::sync::Mutex::new(false)),
            done_rx,
            _phantom: PhantomData,
        })
    }

    /// Validates `config`, then spawns the admission loop and a completion
    /// loop that drives `process` with bounded concurrency (`buffer_unordered`,
    /// order not preserved) and resolves each admitted slot through a
    /// [`Correlator`] keyed by `correlation`.
    pub fn with_correlation<P, K>(
        process: P,
        config: ProcessorConfig,
        correlation: CorrelationConfig<K, R, S>,
        task_manager: &mut TaskManager,
    ) -> Result<Self, Error<S>>
    where
        P: Process<R, S> + 'static,
        K: Eq + Hash + Clone + Send + fmt::Debug + 'static,
        R: Clone,
    {
        config
            .validate()
            .map_err(|err| Error::InvalidArgument { message: err.to_string() })?;

        let (sender, receiver) = flume::bounded(config.buffer_size);
        let (to_process_tx, to_process_rx) = mpsc::channel(config.max_in_flight);
        let accepting = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (done_tx, done_rx) = watch::channel(false);
        let process = Arc::new(process);

        spawn_admission_loop(config.name.clone(), receiver, to_process_tx, task_manager);

        let correlator: Correlator<K, R, S> = Correlator::spawn(
            format!("{}-correlator", config.name),
            correlation.sweep_interval,
            correlation.validate,
            task_manager,
        );
        let correlator_shutdown = correlator.shutdown_signal();

        let name = config.name.clone();
        let outer_name = config.name.clone();
        let timeout = config.timeout;
        let max_in_flight = config.max_in_flight;
        let key_of_request = correlation.key_of_request;
        let key_of_response = correlation.key_of_response;
        let join_handle: JoinHandleTask = tokio::spawn(async move {
            let elem_name = outer_name.clone();
            let stream = ReceiverStream::new(to_process_rx).map(move |(request, slot): (R, EnvelopeSlot<S>)| {
                let process = process.clone();
                let correlator = correlator.clone();
                let key_of_request = key_of_request.clone();
                let key_of_response = key_of_response.clone();
                let elem_name = elem_name.clone();
                async move {
                    let admission_key = (key_of_request)(&request);
                    let request_for_table = request.clone();
                    correlator.admit(admission_key, request_for_table, slot);

                    match process.run(request).await {
                        Ok(value) => {
                            let response_key = (key_of_response)(&value);
                            correlator.resolve(response_key, value);
                        }
                        Err(failure) => {
                            tracing::error!(processor = %elem_name, error = %failure, "process failed for element under correlation, dropping under resume supervision");
                        }
                    }
                }
            });
            // Not pinned: the whole chain is consumed as a temporary of this one
            // statement, so the `Map` closure's correlator handle — and with it the
            // correlator's admit/resolve channel — drops as soon as the stream
            // drains, rather than lingering for the rest of this task.
            stream.buffer_unordered(max_in_flight.max(1)).for_each(|_| async {}).await;

            // The correlator's channel is now closed; wait for its driving task to
            // observe `Signal::Stop` and force-fail every still-pending entry with
            // `FailureKind::Shutdown` before resolving `whenDone`.
            correlator_shutdown.wait().await;

            tracing::info!(processor = %outer_name, "processor drained, resolving whenDone");
            let _ = done_tx.send(true);
            Box::new(ProcessorCleaner {
                name: outer_name,
                role: "completion",
            }) as Box<dyn TaskCleaner>
        });
        task_manager.register(
            join_handle,
            &TaskLabels::new("processor", &name, "completion"),
        );

        Ok(Self {
            name,
            timeout,
            accepting,
            sender,
            stop_sent: Arc::new(tokio::sync::Mutex::new(false)),
            done_rx,
            _phantom: PhantomData,
        })
    }

    /// Returns the write-end for use by the `into` splice operator.
    pub fn sink(&self) -> IntoableSink<R, S> {
        IntoableSink {
            name: self.name.clone(),
            timeout: self.timeout,
            accepting: self.accepting.clone(),
            sender: self.sender.clone(),
        }
    }

    /// Creates an envelope `(r, new_slot)`, offers it to the bounded queue,
    /// and awaits its terminal state. On `Dropped`, returns `Unavailable`
    /// without ever entering the pipeline.
    pub async fn submit(&self, request: R) -> Result<S, Error<S>> {
        let tag = format!("{request:?}");
        let slot: EnvelopeSlot<S> = Slot::new(Some(self.timeout), tag);
        let sink = self.sink();
        match sink.offer(request, slot.clone()) {
            Ok(OfferOutcome::Enqueued) => interpret(slot.await_outcome().await),
            Ok(OfferOutcome::Dropped) => Err(Error::Unavailable { name: self.name.clone() }),
            Err(error) => Err(error),
        }
    }

    /// Closes the input queue (monotonic: idempotent, safe to call more than
    /// once) and returns the same `whenDone` future every time.
    pub async fn shutdown(&self) {
        self.accepting.store(false, std::sync::atomic::Ordering::Release);
        let mut stop_sent = self.stop_sent.lock().await;
        if !*stop_sent {
            *stop_sent = true;
            if self.sender.send_async(Command::Stop).await.is_err() {
                tracing::trace!(processor = %self.name, "stop sent after admission loop already gone");
            }
        }
    }

    /// Resolves when the stream has fully drained after `shutdown()`.
    pub async fn when_done(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// The phase name this processor registers itself under when attached to
    /// a [`CoordinatedShutdown`] coordinator.
    pub const SERVICE_REQUESTS_DONE_PHASE: &'static str = "service-requests-done";

    /// Registers this processor's `shutdown()`-then-drain as a phase on
    /// `coordinator`, so a process-wide shutdown sequence closes this
    /// processor's queue and awaits its drain before moving on to later
    /// phases (e.g. releasing a network listener).
    pub fn register_with(&self, coordinator: &mut CoordinatedShutdown)
    where
        R: 'static,
        S: 'static,
    {
        let processor = self.clone();
        coordinator.register_phase(Self::SERVICE_REQUESTS_DONE_PHASE, async move {
            processor.shutdown().await;
            processor.when_done().await;
        });
    }
}

fn spawn_admission_loop<R, S>(
    name: String,
    receiver: flume::Receiver<Command<R, S>>,
    to_process: mpsc::Sender<(R, EnvelopeSlot<S>)>,
    task_manager: &mut TaskManager,
) where
    R: Send + 'static,
    S: Send + 'static,
{
    let task_name = name.clone();
    let join_handle: JoinHandleTask = tokio::spawn(async move {
        while let Ok(command) = receiver.recv_async().await {
            match command {
                Command::Submit(request, slot) => {
                    if to_process.send((request, slot)).await.is_err() {
                        tracing::error!(processor = %task_name, "completion stage gone, stopping admission loop");
                        break;
                    }
                }
                Command::Stop => break,
            }
        }
        tracing::trace!(processor = %task_name, "admission loop stopped");
        Box::new(ProcessorCleaner { name: task_name, role: "admission" }) as Box<dyn TaskCleaner>
    });
    task_manager.register(join_handle, &TaskLabels::new("processor", &name, "admission"));
}
