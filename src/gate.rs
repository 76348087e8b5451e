use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Limits how many executions of a run may be in flight at once.
///
/// A concurrency of `0` disables gating entirely: every acquire succeeds
/// immediately until the run is done.
#[derive(Debug, Clone)]
pub(crate) enum ConcurrencyGate {
  Unbounded,
  Bounded { semaphore: Arc<Semaphore>, capacity: usize },
}

/// A capacity unit held by one execution. Dropping it returns the unit to the gate.
#[derive(Debug)]
pub(crate) struct GatePermit {
  _permit: Option<OwnedSemaphorePermit>,
}

impl ConcurrencyGate {
  pub(crate) fn new(concurrency: usize) -> Self {
    if concurrency == 0 {
      ConcurrencyGate::Unbounded
    } else {
      ConcurrencyGate::Bounded {
        semaphore: Arc::new(Semaphore::new(concurrency)),
        capacity: concurrency,
      }
    }
  }

  /// Waits for a free unit.
  ///
  /// Returns `None` once `done` is cancelled or the gate is closed, whichever
  /// happens first; a caller that gets `None` must stop scheduling work.
  pub(crate) async fn acquire(&self, done: &CancellationToken) -> Option<GatePermit> {
    if done.is_cancelled() {
      return None;
    }
    match self {
      ConcurrencyGate::Unbounded => Some(GatePermit { _permit: None }),
      ConcurrencyGate::Bounded { semaphore, .. } => {
        tokio::select! {
          biased;
          _ = done.cancelled() => None,
          acquired = semaphore.clone().acquire_owned() => {
            acquired.ok().map(|permit| GatePermit { _permit: Some(permit) })
          }
        }
      }
    }
  }

  /// Closes the gate. Pending and future acquires return `None`; permits that
  /// are still held can be dropped safely afterwards.
  pub(crate) fn close(&self) {
    if let ConcurrencyGate::Bounded { semaphore, .. } = self {
      semaphore.close();
    }
  }

  /// Configured capacity, `None` when unbounded.
  pub(crate) fn capacity(&self) -> Option<usize> {
    match self {
      ConcurrencyGate::Unbounded => None,
      ConcurrencyGate::Bounded { capacity, .. } => Some(*capacity),
    }
  }

  /// Units currently free, `None` when unbounded.
  pub(crate) fn available_permits(&self) -> Option<usize> {
    match self {
      ConcurrencyGate::Unbounded => None,
      ConcurrencyGate::Bounded { semaphore, .. } => Some(semaphore.available_permits()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn test_bounded_gate_releases_on_drop() {
    let gate = ConcurrencyGate::new(2);
    let done = CancellationToken::new();
    assert_eq!(gate.capacity(), Some(2));

    let first = gate.acquire(&done).await.unwrap();
    let second = gate.acquire(&done).await.unwrap();
    assert_eq!(gate.available_permits(), Some(0));

    drop(first);
    assert_eq!(gate.available_permits(), Some(1));
    drop(second);
    assert_eq!(gate.available_permits(), Some(2));
  }

  #[tokio::test]
  async fn test_bounded_gate_blocks_when_full() {
    let gate = ConcurrencyGate::new(1);
    let done = CancellationToken::new();
    let held = gate.acquire(&done).await.unwrap();

    let waiting = gate.acquire(&done);
    tokio::pin!(waiting);

    tokio::select! {
      _ = &mut waiting => panic!("Acquire should have blocked while the only permit is held."),
      _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    drop(held);
    let permit = tokio::time::timeout(Duration::from_millis(50), waiting)
      .await
      .expect("Acquire did not complete after the permit was released.");
    assert!(permit.is_some());
  }

  #[tokio::test]
  async fn test_acquire_aborts_when_done() {
    let gate = ConcurrencyGate::new(1);
    let done = CancellationToken::new();
    let _held = gate.acquire(&done).await.unwrap();

    let done_for_cancel = done.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      done_for_cancel.cancel();
    });

    let result = tokio::time::timeout(Duration::from_millis(500), gate.acquire(&done))
      .await
      .expect("Acquire should observe the done signal instead of blocking.");
    assert!(result.is_none());
  }

  #[tokio::test]
  async fn test_closed_gate_never_blocks_and_release_is_safe() {
    let gate = ConcurrencyGate::new(1);
    let done = CancellationToken::new();
    let held = gate.acquire(&done).await.unwrap();

    gate.close();
    let result = tokio::time::timeout(Duration::from_millis(100), gate.acquire(&done))
      .await
      .expect("Acquire on a closed gate must not block.");
    assert!(result.is_none());

    // Releasing after close must not panic.
    drop(held);
  }

  #[tokio::test]
  async fn test_unbounded_gate_never_gates() {
    let gate = ConcurrencyGate::new(0);
    let done = CancellationToken::new();
    assert_eq!(gate.capacity(), None);

    let mut permits = Vec::new();
    for _ in 0..10_000 {
      permits.push(gate.acquire(&done).await.unwrap());
    }
    assert_eq!(gate.available_permits(), None);

    done.cancel();
    assert!(gate.acquire(&done).await.is_none());
  }
}
