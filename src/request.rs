use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// The error a request reports when one of its executions fails.
pub type TaskError = Box<dyn Error + Send + Sync + 'static>;

/// The future produced by one invocation of a request.
pub type RequestFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'static>>;

/// A unit of async work. It is invoked once per replica with the run's
/// cancellation token and must be safe to call concurrently.
pub type RequestFn = Arc<dyn Fn(CancellationToken) -> RequestFuture + Send + Sync + 'static>;

/// Wraps a closure returning a future into a `RequestFn`.
///
/// Any error type convertible into a `TaskError` is accepted, so requests can
/// return `std::io::Error`, `String`, or their own `thiserror` types.
pub fn request<F, Fut, E>(f: F) -> RequestFn
where
  F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), E>> + Send + 'static,
  E: Into<TaskError> + 'static,
{
  Arc::new(move |token: CancellationToken| -> RequestFuture {
    let fut = f(token);
    Box::pin(async move { fut.await.map_err(Into::into) })
  })
}

/// Outcome of a single execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
  Success,
  Failed,
  Panicked,
}

/// Message sent from one execution to the completion tracker.
#[derive(Debug)]
pub(crate) struct ExecutionResult {
  pub(crate) task_id: usize,
  pub(crate) replica: usize,
  pub(crate) status: ExecutionStatus,
  pub(crate) error: Option<String>,
}

impl ExecutionResult {
  pub(crate) fn is_success(&self) -> bool {
    self.status == ExecutionStatus::Success
  }
}
