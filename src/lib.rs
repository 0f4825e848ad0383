#![doc = include_str!("../README.md")]
#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! `reqflow` adapts a request/response programming model onto a streaming
//! dataflow pipeline: a caller `submit`s a request, the request flows
//! through a long-running pipeline shared by every caller, and when the
//! pipeline emits the corresponding result the caller's pending response is
//! completed.
//!
//! [`processor::IntoableProcessor`] is the crate's main entry point: it owns
//! a bounded input queue and a materialized stream that runs a caller's
//! [`processor::Process`] end to end, pairing each admitted request with a
//! [`slot::Slot`] and completing that slot from the emitted output.
//! [`correlator::Correlator`] is used instead of positional pairing when the
//! process may reorder or drop elements. [`remote::Respondee`] is the
//! addressable, cross-node analogue of `Slot`. [`adapter::into_pipeline`]
//! and [`adapter::into_pipeline_remote`] splice an upstream
//! `futures::Stream` into a shared pipeline.

pub use rf_adapter as adapter;
pub use rf_correlator as correlator;
pub use rf_processor as processor;
pub use rf_remote as remote;
pub use rf_signal as signal;
pub use rf_slot as slot;
pub use rf_task as task;
