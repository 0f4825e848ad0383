//! Sequential shutdown-phase coordination.
//!
//! A small reusable primitive for running a fixed sequence of named,
//! asynchronous shutdown steps — e.g. stop accepting work, join outstanding
//! tasks, notify observers — each awaited fully before the next begins.

use std::{future::Future, pin::Pin};

type PhaseFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Phase {
    name: String,
    task: PhaseFuture,
}

/// Registers named shutdown phases and runs them in registration order,
/// awaiting each before starting the next.
#[derive(Default)]
#[must_use]
pub struct CoordinatedShutdown {
    phases: Vec<Phase>,
}

impl CoordinatedShutdown {
    /// Creates an empty coordinator. No phases: sufficient for unit tests
    /// that drive `shutdown()`/`when_done` directly without a surrounding
    /// process lifecycle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a phase to run after every phase registered before it.
    pub fn register_phase<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.phases.push(Phase {
            name: name.into(),
            task: Box::pin(task),
        });
    }

    /// Runs every registered phase in registration order, awaiting each
    /// before starting the next.
    pub async fn run(self) {
        for phase in self.phases {
            tracing::info!(phase = %phase.name, "running shutdown phase");
            phase.task.await;
            tracing::info!(phase = %phase.name, "shutdown phase complete");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test]
    async fn phases_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut shutdown = CoordinatedShutdown::new();

        let first = order.clone();
        shutdown.register_phase("first", async move {
            first.lock().expect("lock").push("first");
        });
        let second = order.clone();
        shutdown.register_phase("second", async move {
            second.lock().expect("lock").push("second");
        });

        shutdown.run().await;
        assert_eq!(*order.lock().expect("lock"), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn an_empty_coordinator_resolves_immediately() {
        CoordinatedShutdown::new().run().await;
    }
}
