//! A Tokio-based fan-out executor that runs a queue of requests redundantly
//! under a concurrency limit, and completes once every request has succeeded
//! at least once or a deadline or cancellation fires first.

mod dispatcher;
mod error;
mod gate;
mod merger;
mod notifier;
mod request;
mod tracker;

pub use error::MergeError;
pub use merger::Merger;
pub use notifier::{ExecutionInfo, MergeEvent, RunStatus};
pub use request::{request, ExecutionStatus, RequestFn, RequestFuture, TaskError};
