//! Demonstrates the remote splice variant: requests are handed to a
//! simulated remote transport that resolves them via a
//! `RespondeeRegistry`, as a real transport bridge would after receiving a
//! `RespondeeMessage` over the wire from another node.

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqflow::{
    adapter::{into_pipeline_remote, RemoteOfferError, RemoteSink},
    remote::{Respondee, RespondeeFactory, RespondeeMessage, RespondeeRegistry},
    task::TaskManager,
};
use tracing::info;
use tracing_subscriber::FmtSubscriber;

/// A toy transport standing in for a real network bridge: it resolves every
/// request immediately against the owning node's registry instead of
/// actually crossing any process boundary.
#[derive(Clone)]
struct LoopbackTransport {
    registry: RespondeeRegistry<usize>,
}

#[async_trait]
impl RemoteSink<String, usize> for LoopbackTransport {
    async fn offer(&self, request: String, respondee: Respondee<usize>) -> Result<(), RemoteOfferError> {
        let response = request.len();
        if self.registry.deliver(respondee.address(), RespondeeMessage::Response(response)) {
            Ok(())
        } else {
            Err(RemoteOfferError::new("respondee mailbox already gone"))
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = tracing::subscriber::set_global_default(FmtSubscriber::new());

    let mut task_manager = TaskManager::new();
    let factory: RespondeeFactory<usize> = RespondeeFactory::new("remote-length");
    let transport = LoopbackTransport {
        registry: factory.registry(),
    };

    let upstream = stream::iter(vec!["x".to_string(), "yy".to_string(), "zzz".to_string()]);
    let responses: Vec<_> = into_pipeline_remote(
        upstream,
        transport,
        factory,
        Duration::from_secs(1),
        2,
        task_manager.clone(),
    )
    .collect()
    .await;

    for response in responses {
        info!(?response, "remote response");
    }

    task_manager.join().await;
}
