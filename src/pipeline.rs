//! Pipeline orchestration covering catalog submission, the worker pool run
//! loop, lifecycle management, and dead-letter reconciliation.

pub mod engine;
pub(crate) mod lifecycle;
