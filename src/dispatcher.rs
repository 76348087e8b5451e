use crate::gate::{ConcurrencyGate, GatePermit};
use crate::notifier::{MergeEvent, RunEvents};
use crate::request::{ExecutionResult, ExecutionStatus, RequestFn};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use fibre::mpsc::AsyncSender;
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, Instrument};

/// Launches `redundancy` executions of every request, one gate permit each.
pub(crate) struct Dispatcher {
  pub(crate) run_id: u64,
  pub(crate) merger_name: Arc<str>,
  pub(crate) requests: Arc<[RequestFn]>,
  pub(crate) redundancy: usize,
  pub(crate) gate: ConcurrencyGate,
  pub(crate) results_tx: AsyncSender<ExecutionResult>,
  pub(crate) events: RunEvents,
  pub(crate) tokio_handle: TokioHandle,
}

impl Dispatcher {
  /// Number of distinct tasks that must succeed for the run to complete.
  pub(crate) fn distinct_tasks(&self) -> usize {
    self.requests.len()
  }

  /// Replays the whole queue once per redundancy pass, in queue order.
  ///
  /// Stops as soon as `done` is cancelled or the gate closes. Returns the number
  /// of executions launched.
  pub(crate) async fn run(self, done: CancellationToken) -> usize {
    let mut launched = 0usize;

    'passes: for replica in 0..self.redundancy {
      for (task_id, request) in self.requests.iter().enumerate() {
        let permit = match self.gate.acquire(&done).await {
          Some(permit) => permit,
          None => {
            debug!(
              run_id = self.run_id,
              task_id,
              replica,
              launched,
              "Run concluded while waiting for capacity. Dispatch stopped."
            );
            break 'passes;
          }
        };
        trace!(
          run_id = self.run_id,
          task_id,
          replica,
          available = ?self.gate.available_permits(),
          "Acquired gate permit."
        );

        self.spawn_execution(task_id, replica, request.clone(), permit, done.clone());
        launched += 1;
      }
    }

    debug!(run_id = self.run_id, launched, "Dispatcher finished.");
    launched
  }

  fn spawn_execution(
    &self,
    task_id: usize,
    replica: usize,
    request: RequestFn,
    permit: GatePermit,
    token: CancellationToken,
  ) {
    let run_id = self.run_id;
    let results_tx = self.results_tx.clone();
    let events = self.events.clone();

    let execution = async move {
      // Held for the whole execution, released on every exit path.
      let _permit = permit;

      events.emit(MergeEvent::ExecutionStarted { run_id, task_id, replica }).await;

      let outcome = AssertUnwindSafe(async move { request(token).await }).catch_unwind().await;
      let result = match outcome {
        Ok(Ok(())) => ExecutionResult {
          task_id,
          replica,
          status: ExecutionStatus::Success,
          error: None,
        },
        Ok(Err(task_error)) => ExecutionResult {
          task_id,
          replica,
          status: ExecutionStatus::Failed,
          error: Some(task_error.to_string()),
        },
        Err(_panic_payload) => {
          error!(run_id, task_id, replica, "Request panicked during execution.");
          ExecutionResult {
            task_id,
            replica,
            status: ExecutionStatus::Panicked,
            error: Some("request panicked".to_string()),
          }
        }
      };

      trace!(run_id, task_id, replica, status = ?result.status, "Execution finished.");
      if results_tx.send(result).await.is_err() {
        trace!(run_id, task_id, replica, "Tracker already returned. Result discarded.");
      }
    };

    self.tokio_handle.spawn(execution.instrument(info_span!(
      "merge_execution",
      merger = %self.merger_name,
      run_id,
      task_id,
      replica
    )));
  }
}
