//! Demonstrates the two caller-facing shapes of `reqflow`: a direct
//! `submit()` handle, and splicing an upstream `futures::Stream` into the
//! same shared pipeline via `into_pipeline`.

use std::time::Duration;

use futures::{stream, StreamExt};
use reqflow::{
    adapter::into_pipeline,
    processor::{FnProcess, IntoableProcessor, ProcessorConfig},
    task::TaskManager,
};
use tracing::info;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let _ = tracing::subscriber::set_global_default(FmtSubscriber::new());

    let mut task_manager = TaskManager::new();
    let config = ProcessorConfig::new("uppercase", 16, Duration::from_secs(1));
    let processor = IntoableProcessor::<String, String>::new(
        FnProcess::new(|request: String| async move { Ok(request.to_uppercase()) }),
        config,
        &mut task_manager,
    )
    .expect("valid processor configuration");

    // Front-style: a direct submit() per caller.
    let response = processor.submit("hello".to_string()).await.expect("submit resolves");
    info!(%response, "direct submit resolved");

    // Splice-style: an upstream sequence routed through the same pipeline.
    let upstream = stream::iter(vec!["x".to_string(), "yy".to_string(), "zzz".to_string()]);
    let responses: Vec<_> = into_pipeline(upstream, processor.sink(), 2).collect().await;
    for response in responses {
        info!(?response, "spliced response");
    }

    processor.shutdown().await;
    processor.when_done().await;
    task_manager.join().await;
}
