use crate::error::MergeError;
use crate::notifier::{MergeEvent, RunEvents};
use crate::request::ExecutionResult;

use std::collections::HashSet;
use std::time::Duration;

use fibre::mpsc::AsyncReceiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Record of which distinct tasks have succeeded at least once.
#[derive(Debug)]
pub(crate) struct OutcomeSet {
  expected: usize,
  satisfied: HashSet<usize>,
}

impl OutcomeSet {
  pub(crate) fn new(expected: usize) -> Self {
    Self {
      expected,
      satisfied: HashSet::with_capacity(expected),
    }
  }

  /// Marks `task_id` as satisfied. Returns `false` if it already was.
  pub(crate) fn record_success(&mut self, task_id: usize) -> bool {
    self.satisfied.insert(task_id)
  }

  pub(crate) fn len(&self) -> usize {
    self.satisfied.len()
  }

  pub(crate) fn is_complete(&self) -> bool {
    self.satisfied.len() >= self.expected
  }

  /// Ids in `0..expected` without a success, ascending.
  pub(crate) fn incomplete(&self) -> Vec<usize> {
    (0..self.expected).filter(|id| !self.satisfied.contains(id)).collect()
  }
}

/// Consumes execution results for one run and decides how the run ends.
pub(crate) struct CompletionTracker {
  run_id: u64,
  outcomes: OutcomeSet,
  results_rx: AsyncReceiver<ExecutionResult>,
  events: RunEvents,
}

impl CompletionTracker {
  pub(crate) fn new(
    run_id: u64,
    distinct_tasks: usize,
    results_rx: AsyncReceiver<ExecutionResult>,
    events: RunEvents,
  ) -> Self {
    Self {
      run_id,
      outcomes: OutcomeSet::new(distinct_tasks),
      results_rx,
      events,
    }
  }

  /// Blocks until every distinct task has succeeded, the deadline passes, or
  /// `cancellation` fires.
  ///
  /// The receiver is dropped on return, so executions still running afterwards
  /// see a closed channel instead of blocking.
  pub(crate) async fn wait(
    mut self,
    timeout: Duration,
    deadline: Instant,
    cancellation: &CancellationToken,
  ) -> Result<(), MergeError> {
    let mut senders_gone = false;

    while !self.outcomes.is_complete() {
      tokio::select! {
        biased;

        recv_result = self.results_rx.recv(), if !senders_gone => {
          match recv_result {
            Ok(result) => self.observe(result).await,
            Err(_) => {
              warn!(
                run_id = self.run_id,
                incomplete = ?self.outcomes.incomplete(),
                "All executions finished without satisfying every task. Waiting for deadline or cancellation."
              );
              senders_gone = true;
            }
          }
        }

        _ = cancellation.cancelled() => {
          debug!(run_id = self.run_id, satisfied = self.outcomes.len(), "Run cancelled before completion.");
          return Err(MergeError::Cancelled {
            incomplete: self.outcomes.incomplete(),
          });
        }

        _ = tokio::time::sleep_until(deadline) => {
          debug!(run_id = self.run_id, satisfied = self.outcomes.len(), "Run deadline elapsed before completion.");
          return Err(MergeError::TimedOut {
            timeout,
            incomplete: self.outcomes.incomplete(),
          });
        }
      }
    }

    debug!(run_id = self.run_id, tasks = self.outcomes.len(), "Every task recorded a success.");
    Ok(())
  }

  async fn observe(&mut self, result: ExecutionResult) {
    self.events.execution_finished(&result).await;

    if !result.is_success() {
      trace!(
        run_id = self.run_id,
        task_id = result.task_id,
        replica = result.replica,
        status = ?result.status,
        error = ?result.error,
        "Execution did not succeed."
      );
      return;
    }

    if self.outcomes.record_success(result.task_id) {
      trace!(run_id = self.run_id, task_id = result.task_id, replica = result.replica, "Task satisfied.");
      self
        .events
        .emit(MergeEvent::TaskSatisfied {
          run_id: self.run_id,
          task_id: result.task_id,
        })
        .await;
    } else {
      trace!(
        run_id = self.run_id,
        task_id = result.task_id,
        replica = result.replica,
        "Duplicate success ignored."
      );
    }
  }
}
