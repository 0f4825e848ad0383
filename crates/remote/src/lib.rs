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

//! `RemoteRespondeeBridge`: the cross-node analogue of `rf_slot::Slot`.
//!
//! A [`Respondee`] is an addressable mailbox rather than an in-process cell:
//! its identity (a [`RespondeeAddress`]) is `serde`-serializable and can be
//! embedded in an envelope routed to a pipeline running on another node. That
//! remote pipeline resolves the request by sending a [`RespondeeMessage`]
//! back to the address; a [`RespondeeRegistry`] on the owning node looks the
//! address up and delivers the message to the short-lived task a
//! [`RespondeeFactory`] spawned for it, which completes (or fails) a local
//! `rf_slot::Slot` on the asker's behalf.
//!
//! The transport that actually carries a `RespondeeMessage` across the wire
//! is a caller concern (out of scope, same as cluster sharding in general);
//! this crate only defines the addressable identity, the mailbox, and the
//! Fresh/Stopped state machine that decides what happens when a message
//! arrives for a given address.

use std::{collections::HashMap, fmt, marker::PhantomData, sync::Arc, time::Duration};

use std::sync::Mutex;

use async_trait::async_trait;
use rf_task::{labels::TaskLabels, JoinHandleTask, TaskCleaner, TaskManager};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// The wire-serializable identity of a [`Respondee`]. A remote peer only ever
/// carries this — never the in-process mailbox sender — and routes
/// [`RespondeeMessage`]s back to it through its own transport and the owning
/// node's [`RespondeeRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RespondeeAddress {
    id: Uuid,
}

impl fmt::Display for RespondeeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "respondee:{}", self.id)
    }
}

/// The exact wire message set a remote pipeline can send to a [`Respondee`]'s
/// address: a resolved value, or an explicit stop with no resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RespondeeMessage<S> {
    /// The remote pipeline resolved the request.
    Response(S),
    /// The remote pipeline is terminating; the respondee will never resolve
    /// via this mailbox. Local resolution is left to the deadline timer.
    Stop,
}

/// An addressable mailbox passed to a remote pipeline in place of a local
/// [`rf_slot::Slot`]. Carries only its address — the completion machinery
/// lives in the task the owning [`RespondeeFactory`] spawned.
#[derive(Debug, Clone)]
pub struct Respondee<S> {
    address: RespondeeAddress,
    _phantom: PhantomData<fn() -> S>,
}

impl<S> Respondee<S> {
    /// The wire-serializable address a remote pipeline resolves against.
    pub fn address(&self) -> RespondeeAddress {
        self.address
    }
}

/// Registry of live mailboxes on the owning node, keyed by
/// [`RespondeeAddress`]. A remote transport bridge looks an address up here
/// and forwards the [`RespondeeMessage`] it received over the wire.
pub struct RespondeeRegistry<S> {
    mailboxes: Arc<Mutex<HashMap<RespondeeAddress, mpsc::UnboundedSender<RespondeeMessage<S>>>>>,
}

impl<S> Clone for RespondeeRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            mailboxes: self.mailboxes.clone(),
        }
    }
}

impl<S> Default for RespondeeRegistry<S> {
    fn default() -> Self {
        Self {
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<S> RespondeeRegistry<S>
where
    S: Send + 'static,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, address: RespondeeAddress, sender: mpsc::UnboundedSender<RespondeeMessage<S>>) {
        let _ = self
            .mailboxes
            .lock()
            .expect("respondee registry lock poisoned")
            .insert(address, sender);
    }

    fn unregister(&self, address: &RespondeeAddress) {
        let _ = self
            .mailboxes
            .lock()
            .expect("respondee registry lock poisoned")
            .remove(address);
    }

    /// Delivers `message` to the mailbox at `address`, as a remote transport
    /// bridge would after receiving it over the wire. Returns `true` if a
    /// live mailbox accepted the message, `false` if the address was already
    /// stopped or unknown (the response simply has nowhere left to go — the
    /// asker, if still pending, is reclaimed by its own deadline timer).
    pub fn deliver(&self, address: RespondeeAddress, message: RespondeeMessage<S>) -> bool {
        let sender = self
            .mailboxes
            .lock()
            .expect("respondee registry lock poisoned")
            .get(&address)
            .cloned();
        match sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }
}

/// What the factory hands to an asker: the local slot it will complete, now
/// wrapped as an addressable [`Respondee`] ready to embed in an envelope
/// routed to a remote pipeline.
pub trait LocalPromise<S>: Send + 'static {
    /// Transitions the local promise to a resolved value. Mirrors
    /// `rf_slot::Slot::complete`.
    fn resolve(&self, value: S);
    /// Transitions the local promise to a timeout failure. Mirrors
    /// `rf_slot::Slot::fail(FailureKind::Timeout { .. })`.
    fn expire(&self, tag: String);
}

impl<S> LocalPromise<S> for rf_slot::Slot<S>
where
    S: Send + 'static,
{
    fn resolve(&self, value: S) {
        let _ = self.complete(value);
    }

    fn expire(&self, tag: String) {
        let _ = self.fail(rf_slot::FailureKind::Timeout { tag });
    }
}

#[derive(Debug)]
struct RespondeeCleaner {
    address: RespondeeAddress,
}

#[async_trait]
impl TaskCleaner for RespondeeCleaner {
    async fn cleanup(&self) {
        tracing::trace!(respondee = %self.address, "respondee mailbox task joined");
    }
}

/// Spawns the short-lived mailbox task for a [`Respondee`] and registers it
/// with a [`TaskManager`], the same way every other background task in this
/// library family is supervised.
///
/// `name` is a diagnostic identifier (the owning processor's name, typically)
/// included in log lines; it is not part of the wire address.
pub struct RespondeeFactory<S> {
    name: String,
    registry: RespondeeRegistry<S>,
}

impl<S> Clone for RespondeeFactory<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<S> RespondeeFactory<S>
where
    S: Send + 'static,
{
    /// Creates a factory backed by a fresh [`RespondeeRegistry`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: RespondeeRegistry::new(),
        }
    }

    /// Creates a factory sharing an existing registry, e.g. so a test can
    /// call [`RespondeeRegistry::deliver`] directly without a real transport.
    pub fn with_registry(name: impl Into<String>, registry: RespondeeRegistry<S>) -> Self {
        Self { name: name.into(), registry }
    }

    /// The registry backing this factory's mailboxes, for wiring to a
    /// transport bridge.
    pub fn registry(&self) -> RespondeeRegistry<S> {
        self.registry.clone()
    }

    /// Implements `Create(deadline, tag) -> Created(address)`: allocates a
    /// fresh address, spawns its Fresh/Stopped mailbox task (registered with
    /// `task_manager`), and returns the resulting [`Respondee`].
    ///
    /// `local` is the asker's own pending promise (typically a freshly
    /// created `rf_slot::Slot<S>`); it is completed or failed from inside the
    /// mailbox task exactly once, mirroring the slot's own single-transition
    /// contract.
    pub fn create(
        &self,
        local: impl LocalPromise<S>,
        timeout: Duration,
        tag: impl Into<String>,
        task_manager: &mut TaskManager,
    ) -> Respondee<S> {
        let address = RespondeeAddress { id: Uuid::new_v4() };
        let tag = tag.into();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let registry = self.registry.clone();
        let name = self.name.clone();

        registry.register(address, sender);

        let join_handle: JoinHandleTask = tokio::spawn(async move {
            tokio::select! {
                biased;
                message = receiver.recv() => match message {
                    Some(RespondeeMessage::Response(value)) => {
                        local.resolve(value);
                        tracing::trace!(respondee = %address, respondee_name = %name, "respondee resolved");
                    }
                    Some(RespondeeMessage::Stop) | None => {
                        tracing::trace!(respondee = %address, respondee_name = %name, "respondee stopped without a response");
                    }
                },
                _ = tokio::time::sleep(timeout) => {
                    local.expire(tag);
                    tracing::trace!(respondee = %address, respondee_name = %name, "respondee timed out");
                }
            }
            registry.unregister(&address);
            Box::new(RespondeeCleaner { address }) as Box<dyn TaskCleaner>
        });
        task_manager.register(join_handle, &TaskLabels::new("respondee", &self.name, "mailbox"));

        Respondee {
            address,
            _phantom: PhantomData,
        }
    }
}
