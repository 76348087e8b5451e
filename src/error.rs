use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when configuring or running a `Merger`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
  #[error("Redundancy must be at least 1, got {0}")]
  InvalidRedundancy(usize),

  #[error("Merge timed out after {timeout:?} with {} task(s) never succeeding", incomplete.len())]
  TimedOut { timeout: Duration, incomplete: Vec<usize> },

  #[error("Merge was cancelled with {} task(s) never succeeding", incomplete.len())]
  Cancelled { incomplete: Vec<usize> },
}

impl MergeError {
  /// Ids of the tasks that had not recorded a success when the run ended.
  ///
  /// Empty for configuration errors.
  pub fn incomplete_tasks(&self) -> &[usize] {
    match self {
      MergeError::TimedOut { incomplete, .. } | MergeError::Cancelled { incomplete } => incomplete,
      MergeError::InvalidRedundancy(_) => &[],
    }
  }
}
