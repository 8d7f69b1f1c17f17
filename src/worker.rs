//! Enrichment worker split across focused submodules:
//! - `types`: retry policy plus outcome types shared across the loop
//! - `backoff`: bounded exponential retry used for provider calls
//! - `shared`: state shared across workers (queue, store, tracker, telemetry)
//! - `process`: worker struct plus run/process logic
//! - `pool`: spawning, panic capture, and shutdown fan-in

pub(crate) mod backoff;
pub(crate) mod pool;
mod process;
mod shared;
mod types;


pub use process::Worker;
pub use shared::{WorkerShared, WorkerSharedParams};
pub use types::{BatchTally, RetryPolicy};
