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

//! `SubmitterAdapter`: the two caller-facing shapes for attaching to a
//! shared [`rf_processor::IntoableProcessor`].
//!
//! `IntoableProcessor::submit` already covers the front-style shape — a
//! direct `submit(request) -> future<response>` handle. This crate covers
//! the second shape: splicing an upstream `futures::Stream` into the shared
//! pipeline and emitting responses downstream, in upstream order, with a
//! configurable concurrency. Exposed as free functions rather than new
//! trait methods bolted onto `Stream`.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rf_processor::{interpret, Error, IntoableSink};
use rf_remote::{Respondee, RespondeeFactory};
use rf_slot::{Slot, SlotOutcome};
use rf_task::TaskManager;

/// Splices `upstream` into `sink`: for each element, allocates a fresh slot
/// (tagged with the element's `Debug` rendering, deadline taken from
/// `sink.timeout()`), offers `(element, slot)` directly to the processor's
/// bounded input, and emits the resolved response downstream. `parallelism`
/// bounds the number of outstanding awaits; `buffered` keeps the downstream
/// order equal to the upstream order regardless of which slot resolves
/// first.
pub fn into_pipeline<A, S>(
    upstream: impl Stream<Item = A> + Send,
    sink: IntoableSink<A, S>,
    parallelism: usize,
) -> impl Stream<Item = Result<S, Error<S>>>
where
    A: Send + fmt::Debug + 'static,
    S: Send + fmt::Debug + 'static,
{
    upstream
        .map(move |request| {
            let sink = sink.clone();
            async move {
                let tag = format!("{request:?}");
                let slot = Slot::new(Some(sink.timeout()), tag);
                match sink.offer(request, slot.clone()) {
                    Ok(rf_processor::OfferOutcome::Enqueued) => interpret(slot.await_outcome().await),
                    Ok(rf_processor::OfferOutcome::Dropped) => Err(Error::Unavailable { name: sink.name().to_string() }),
                    Err(error) => Err(error),
                }
            }
        })
        .buffered(parallelism.max(1))
}

/// What the remote splice variant needs from a caller-supplied transport:
/// a way to hand `(request, respondee)` to whatever carries it to the
/// remote pipeline. The transport itself — the network layer, the cluster
/// sharding that picks which node owns a given request — is a caller
/// concern; this crate only defines the shape of the handoff.
#[async_trait]
pub trait RemoteSink<A, S>: Send + Sync {
    /// Hands `request`, paired with its addressable `respondee`, to the
    /// remote transport. Returning `Err` means the request never reached
    /// the remote pipeline; the respondee, already spawned, will simply
    /// time out.
    async fn offer(&self, request: A, respondee: Respondee<S>) -> Result<(), RemoteOfferError>;
}

/// Raised by a [`RemoteSink`] when it cannot hand a request to the remote
/// transport (e.g. the transport itself is down or backpressured).
#[derive(thiserror::Error, Debug)]
#[error("remote offer failed: {message}")]
pub struct RemoteOfferError {
    /// Diagnostic description of the transport failure.
    pub message: String,
}

impl RemoteOfferError {
    /// Builds a failure from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Failures surfaced by [`into_pipeline_remote`]. Distinct from
/// `rf_processor::Error` because there is no local queue to be `Unavailable`
/// or `Shutdown` — the only local decision is the transport handoff; the
/// response itself is always resolved (or timed out) by the respondee.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum RemoteError {
    /// The transport rejected or failed to deliver the request.
    #[error(transparent)]
    Offer(#[from] RemoteOfferError),
    /// The respondee's deadline elapsed before a response arrived.
    #[error("timeout (tag: {tag})")]
    Timeout {
        /// Opaque diagnostic tag carried from the request.
        tag: String,
    },
    /// The respondee was stopped without resolving (the local promise was
    /// otherwise failed before a response arrived).
    #[error("respondee stopped without a response")]
    Stopped,
}

/// Splices `upstream` into a remote pipeline via `remote_sink`: for each
/// element, requests a fresh [`Respondee`] from `factory` (deadline
/// `response_timeout`), hands `(element, respondee)` to `remote_sink`, and
/// emits the resolved response downstream in upstream order. The respondee
/// enforces its own deadline — `into_pipeline_remote` never races a local
/// timer against the remote one.
pub fn into_pipeline_remote<A, S>(
    upstream: impl Stream<Item = A> + Send,
    remote_sink: impl RemoteSink<A, S> + Clone + 'static,
    factory: RespondeeFactory<S>,
    response_timeout: Duration,
    parallelism: usize,
    task_manager: TaskManager,
) -> impl Stream<Item = Result<S, RemoteError>>
where
    A: Send + fmt::Debug + 'static,
    S: Send + 'static,
{
    upstream
        .map(move |request| {
            let remote_sink = remote_sink.clone();
            let factory = factory.clone();
            let mut task_manager = task_manager.clone();
            async move {
                let tag = format!("{request:?}");
                let slot: Slot<S> = Slot::new(None, tag.clone());
                let respondee = factory.create(slot.clone(), response_timeout, tag, &mut task_manager);

                remote_sink.offer(request, respondee).await?;

                match slot.await_outcome().await {
                    SlotOutcome::Value(value) => Ok(value),
                    SlotOutcome::Failure(rf_slot::FailureKind::Timeout { tag }) => Err(RemoteError::Timeout { tag }),
                    SlotOutcome::Failure(rf_slot::FailureKind::Shutdown) => Err(RemoteError::Stopped),
                    // `FailureKind` is `#[non_exhaustive]`; future-proofs against variants added later.
                    SlotOutcome::Failure(_) => Err(RemoteError::Stopped),
                }
            }
        })
        .buffered(parallelism.max(1))
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use futures::stream;
    use rf_processor::{FnProcess, IntoableProcessor, ProcessorConfig};

    use super::*;

    fn manager() -> TaskManager {
        TaskManager::new()
    }

    #[tokio::test]
    async fn splice_preserves_upstream_order_with_parallelism_one() {
        let mut tm = manager();
        let config = ProcessorConfig::new("len", 8, Duration::from_secs(5));
        let processor = IntoableProcessor::<String, usize>::new(
            FnProcess::new(|r: String| async move { Ok(r.len()) }),
            config,
            &mut tm,
        )
        .unwrap();

        let upstream = stream::iter(vec!["x".to_string(), "yy".to_string(), "zzz".to_string()]);
        let results: Vec<_> = into_pipeline(upstream, processor.sink(), 1).collect().await;

        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn splice_bounds_outstanding_awaits_by_parallelism() {
        let mut tm = manager();
        let config = ProcessorConfig::new("track", 16, Duration::from_secs(5));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let in_flight_proc = in_flight.clone();
        let max_observed_proc = max_observed.clone();

        let processor = IntoableProcessor::<u32, u32>::new(
            FnProcess::new(move |r: u32| {
                let in_flight = in_flight_proc.clone();
                let max_observed = max_observed_proc.clone();
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_observed.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(r)
                }
            }),
            config,
            &mut tm,
        )
        .unwrap();

        let upstream = stream::iter(0..10u32);
        let results: Vec<_> = into_pipeline(upstream, processor.sink(), 3).collect().await;
        assert_eq!(results.len(), 10);
        assert!(max_observed.load(Ordering::SeqCst) <= 3);
    }

    struct EchoRemote {
        registry: rf_remote::RespondeeRegistry<u32>,
    }

    impl Clone for EchoRemote {
        fn clone(&self) -> Self {
            Self {
                registry: self.registry.clone(),
            }
        }
    }

    #[async_trait]
    impl RemoteSink<u32, u32> for EchoRemote {
        async fn offer(&self, request: u32, respondee: Respondee<u32>) -> Result<(), RemoteOfferError> {
            assert!(self
                .registry
                .deliver(respondee.address(), rf_remote::RespondeeMessage::Response(request)));
            Ok(())
        }
    }

    #[tokio::test]
    async fn remote_splice_resolves_via_the_respondee() {
        let tm = manager();
        let factory: RespondeeFactory<u32> = RespondeeFactory::new("remote-echo");
        let remote_sink = EchoRemote {
            registry: factory.registry(),
        };

        let upstream = stream::iter(vec![1u32, 2, 3]);
        let results: Vec<_> = into_pipeline_remote(upstream, remote_sink, factory, Duration::from_secs(5), 2, tm)
            .collect()
            .await;

        let values: Vec<u32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }
}
