//! End-to-end scenarios exercising a full pipeline through the public
//! `reqflow` surface, mirroring the literal scenarios and round-trip laws
//! enumerated for the request/response correlator.

use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::{stream, StreamExt};
use reqflow::{
    adapter::into_pipeline,
    processor::{
        CorrelationConfig, EnvelopeSlot, Error, FnProcess, IntoableProcessor, OfferOutcome, ProcessFailure,
        ProcessorConfig,
    },
    slot::Slot,
    task::TaskManager,
};

fn manager() -> TaskManager {
    TaskManager::new()
}

/// Scenario 1: `process = map(_.length)`, submit `"abc"` -> resolves `3`.
#[tokio::test]
async fn length_mapping_resolves_to_the_string_length() {
    let mut tm = manager();
    let config = ProcessorConfig::new("length", 8, Duration::from_secs(5));
    let processor = IntoableProcessor::<String, usize>::new(
        FnProcess::new(|request: String| async move { Ok(request.len()) }),
        config,
        &mut tm,
    )
    .unwrap();

    assert_eq!(processor.submit("abc".to_string()).await.unwrap(), 3);
}

/// Scenario 2: `process = delay(1s, passthrough)`, `timeout = 100ms`,
/// submit `"abc"` -> fails with `Timeout("abc")`.
#[tokio::test(start_paused = true)]
async fn a_process_slower_than_the_deadline_times_out() {
    let mut tm = manager();
    let config = ProcessorConfig::new("slow-echo", 8, Duration::from_millis(100));
    let processor = IntoableProcessor::<String, String>::new(
        FnProcess::new(|request: String| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(request)
        }),
        config,
        &mut tm,
    )
    .unwrap();

    let submitted = tokio::spawn({
        let processor = processor.clone();
        async move { processor.submit("abc".to_string()).await }
    });
    tokio::time::advance(Duration::from_millis(150)).await;
    match submitted.await.unwrap() {
        Err(Error::Timeout { tag }) => assert_eq!(tag, "\"abc\""),
        other => panic!("expected Timeout, got {other:?}"),
    }
}

/// Scenario 3: `process = map((n, m) => n / m)`, resume directive on, submit
/// `(4, 0)` then `(4, 2)` -> first times out, second resolves `2`.
#[tokio::test]
async fn a_per_element_failure_is_dropped_and_the_stream_keeps_serving() {
    let mut tm = manager();
    let config = ProcessorConfig::new("division", 8, Duration::from_millis(200));
    let processor = IntoableProcessor::<(i32, i32), i32>::new(
        FnProcess::new(|(n, d): (i32, i32)| async move {
            if d == 0 {
                Err(ProcessFailure::new("division by zero"))
            } else {
                Ok(n / d)
            }
        }),
        config,
        &mut tm,
    )
    .unwrap();

    assert!(matches!(processor.submit((4, 0)).await, Err(Error::Timeout { .. })));
    assert_eq!(processor.submit((4, 2)).await.unwrap(), 2);
}

/// Scenario 4: `bufferSize = 2`, submit 10 values, trigger `shutdown()` once
/// the 7th has been offered -> at least 5 values are observed; the remainder
/// fail with `Unavailable` (dropped for backpressure) or `Shutdown` (offered,
/// or still pending, once the queue closed) rather than silently hanging.
#[tokio::test]
async fn throttled_submissions_drain_before_shutdown_and_are_rejected_after() {
    let mut tm = manager();
    let config = ProcessorConfig::new("throttle", 2, Duration::from_secs(5));
    let released: Arc<std::sync::Mutex<HashSet<u32>>> = Arc::new(std::sync::Mutex::new(HashSet::new()));
    let released_in_process = released.clone();
    let processor = IntoableProcessor::<u32, u32>::new(
        FnProcess::new(move |value: u32| {
            let released = released_in_process.clone();
            async move {
                while !released.lock().expect("lock").contains(&value) {
                    tokio::task::yield_now().await;
                }
                Ok(value)
            }
        }),
        config,
        &mut tm,
    )
    .unwrap();

    let sink = processor.sink();
    let mut awaiting = Vec::new();
    let mut rejected = 0;
    for i in 0..10u32 {
        // The first five release as soon as they're picked up, so the queue
        // keeps draining instead of saturating on the first couple of offers.
        if i < 5 {
            let _ = released.lock().expect("lock").insert(i);
        }

        let slot: EnvelopeSlot<u32> = Slot::new(Some(Duration::from_secs(5)), format!("{i}"));
        match sink.offer(i, slot.clone()) {
            Ok(OfferOutcome::Enqueued) => awaiting.push(slot),
            Ok(OfferOutcome::Dropped) => rejected += 1,
            Err(_) => rejected += 1,
        }

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        if i == 6 {
            // Trigger shutdown once the 7th value has been offered: some of the
            // earlier admissions are still unresolved at this point.
            processor.shutdown().await;
        }
    }

    // Release whatever is left blocked so the stream can finish draining.
    for i in 0..10u32 {
        let _ = released.lock().expect("lock").insert(i);
    }

    let mut resolved = 0;
    let mut shutdown_failed = 0;
    for slot in awaiting {
        match reqflow::processor::interpret(slot.await_outcome().await) {
            Ok(_) => resolved += 1,
            Err(Error::Shutdown) => shutdown_failed += 1,
            Err(other) => panic!("unexpected failure: {other:?}"),
        }
    }

    assert!(
        resolved >= 5,
        "expected at least 5 values to resolve before shutdown, got {resolved}"
    );
    assert_eq!(resolved + shutdown_failed + rejected, 10);

    processor.when_done().await;
}

/// Scenario 5: a correlated process that shuffles completion order;
/// `keyOfRequest = id`, `keyOfResponse = id`; submit 100 integers -> each
/// resolves to its matching integer regardless of stream order.
#[tokio::test]
async fn correlation_matches_responses_to_requests_despite_reordering() {
    let mut tm = manager();
    let config = ProcessorConfig::new("shuffled", 32, Duration::from_millis(500));
    let correlation = CorrelationConfig::new(|r: &u32| *r, |s: &u32| *s, Duration::from_secs(60));
    let processor = IntoableProcessor::<u32, u32>::with_correlation(
        FnProcess::new(|value: u32| async move {
            if value % 3 == 0 {
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
            Ok(value)
        }),
        config,
        correlation,
        &mut tm,
    )
    .unwrap();

    let mut handles = Vec::new();
    for i in 0..100u32 {
        let processor = processor.clone();
        handles.push(tokio::spawn(async move { (i, processor.submit(i).await) }));
    }
    for handle in handles {
        let (i, result) = handle.await.unwrap();
        assert_eq!(result.unwrap(), i);
    }
}

/// Scenario 6: `source(["x", "yy", "zzz"]).into(lenSink, parallelism = 1)`
/// -> `[1, 2, 3]` in order.
#[tokio::test]
async fn splice_emits_responses_in_upstream_order() {
    let mut tm = manager();
    let config = ProcessorConfig::new("len-sink", 8, Duration::from_secs(5));
    let processor = IntoableProcessor::<String, usize>::new(
        FnProcess::new(|request: String| async move { Ok(request.len()) }),
        config,
        &mut tm,
    )
    .unwrap();

    let upstream = stream::iter(vec!["x".to_string(), "yy".to_string(), "zzz".to_string()]);
    let results: Vec<usize> = into_pipeline(upstream, processor.sink(), 1)
        .map(|r| r.unwrap())
        .collect()
        .await;

    assert_eq!(results, vec![1, 2, 3]);
}

/// Identity law: with `process = identity` and an effectively infinite
/// timeout, `submit(r)` resolves to `r` for every `r`.
#[tokio::test]
async fn identity_process_round_trips_every_request() {
    let mut tm = manager();
    let config = ProcessorConfig::new("identity", 8, Duration::from_secs(3600));
    let processor =
        IntoableProcessor::<String, String>::new(FnProcess::new(|r: String| async move { Ok(r) }), config, &mut tm)
            .unwrap();

    for value in ["a", "bb", "ccc"] {
        assert_eq!(processor.submit(value.to_string()).await.unwrap(), value);
    }
}

/// Drain law: after `shutdown()`, `when_done()` resolves, and every
/// submission made before shutdown resolves with a value.
#[tokio::test]
async fn shutdown_drains_in_flight_submissions_before_resolving() {
    let mut tm = manager();
    let config = ProcessorConfig::new("drain", 8, Duration::from_secs(5));
    let processor =
        IntoableProcessor::<u32, u32>::new(FnProcess::new(|r: u32| async move { Ok(r) }), config, &mut tm).unwrap();

    let mut handles = Vec::new();
    for i in 0..5u32 {
        let processor = processor.clone();
        handles.push(tokio::spawn(async move { processor.submit(i).await }));
    }

    processor.shutdown().await;
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    processor.when_done().await;
}

/// Idempotent shutdown: calling `shutdown()` a second time does not panic
/// and `when_done()` still resolves.
#[tokio::test]
async fn shutdown_is_idempotent() {
    let mut tm = manager();
    let config = ProcessorConfig::new("idempotent", 4, Duration::from_secs(5));
    let processor =
        IntoableProcessor::<u32, u32>::new(FnProcess::new(|r: u32| async move { Ok(r) }), config, &mut tm).unwrap();

    processor.shutdown().await;
    processor.shutdown().await;
    processor.when_done().await;
}

/// Boundary: construction with `buffer_size == 0` fails synchronously with
/// `InvalidArgument`.
#[tokio::test]
async fn zero_buffer_size_is_rejected_at_construction() {
    let mut tm = manager();
    let config = ProcessorConfig::new("invalid", 0, Duration::from_secs(1));
    let result = IntoableProcessor::<u32, u32>::new(FnProcess::new(|r: u32| async move { Ok(r) }), config, &mut tm);
    assert!(matches!(result, Err(Error::InvalidArgument { .. })));
}
