use crate::request::{ExecutionResult, ExecutionStatus};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender};
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info_span, trace, Instrument};

// --- Public Event Types for Handlers ---

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
  Completed,
  TimedOut,
  Cancelled,
}

/// Details about one finished execution.
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
  pub run_id: u64,
  pub task_id: usize,
  pub replica: usize,
  pub status: ExecutionStatus,
  /// Rendered task error, set when `status` is `Failed` or `Panicked`.
  pub error: Option<String>,
  pub completion_time: SystemTime,
}

/// Structured events emitted during a run.
#[derive(Debug, Clone)]
pub enum MergeEvent {
  ExecutionStarted { run_id: u64, task_id: usize, replica: usize },
  ExecutionFinished(ExecutionInfo),
  /// First success for a task id. Emitted at most once per id per run.
  TaskSatisfied { run_id: u64, task_id: usize },
  RunFinished { run_id: u64, status: RunStatus },
}

impl MergeEvent {
  pub fn run_id(&self) -> u64 {
    match self {
      MergeEvent::ExecutionStarted { run_id, .. }
      | MergeEvent::TaskSatisfied { run_id, .. }
      | MergeEvent::RunFinished { run_id, .. } => *run_id,
      MergeEvent::ExecutionFinished(info) => info.run_id,
    }
  }
}

pub(crate) type EventHandler = Arc<dyn Fn(MergeEvent) + Send + Sync + 'static>;

// --- Internal Message ---
enum NotifierMessage {
  Event(MergeEvent),
  /// Acknowledged once every message queued before it has been handled.
  Flush(oneshot::Sender<()>),
}

/// Immutable list of event handlers attached to a `Merger`.
///
/// Adding a handler produces a new notifier, so a notifier can be shared by
/// concurrent runs without locking.
#[derive(Clone, Default)]
pub(crate) struct EventNotifier {
  handlers: Arc<[EventHandler]>,
}

impl fmt::Debug for EventNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventNotifier")
      .field("handler_count", &self.handler_count())
      .finish()
  }
}

impl EventNotifier {
  pub(crate) fn with_handler(&self, handler: impl Fn(MergeEvent) + Send + Sync + 'static) -> Self {
    let mut handlers: Vec<EventHandler> = self.handlers.iter().cloned().collect();
    handlers.push(Arc::new(handler));
    Self {
      handlers: handlers.into(),
    }
  }

  pub(crate) fn handler_count(&self) -> usize {
    self.handlers.len()
  }

  /// Spawns the notification worker for one run.
  ///
  /// Handlers are called on that worker, never on the tracker, so a slow
  /// handler cannot hold back the run's deadline. The worker stops once every
  /// `RunEvents` clone has been dropped.
  pub(crate) fn start_run(&self, run_id: u64, tokio_handle: &TokioHandle) -> RunEvents {
    if self.handlers.is_empty() {
      return RunEvents::disabled(run_id);
    }
    let (tx, rx) = mpsc::unbounded_async();
    tokio_handle.spawn(
      Self::run_notification_worker_loop(rx, self.handlers.clone())
        .instrument(info_span!("merge_notification_worker", run_id)),
    );
    RunEvents { run_id, tx: Some(tx) }
  }

  async fn run_notification_worker_loop(queue_rx: AsyncReceiver<NotifierMessage>, handlers: Arc<[EventHandler]>) {
    debug!(handlers = handlers.len(), "Notification worker started.");
    while let Ok(message) = queue_rx.recv().await {
      match message {
        NotifierMessage::Event(event) => {
          for handler in handlers.iter() {
            let event_for_handler = event.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(event_for_handler))).is_err() {
              error!(run_id = event.run_id(), "An event handler panicked while handling {:?}.", event);
            }
          }
        }
        NotifierMessage::Flush(ack) => {
          let _ = ack.send(());
        }
      }
    }
    // Every sender is gone, including those held by straggling executions.
    debug!("Notification worker stopped (input queue fully closed and processed).");
  }
}

/// Event sink for a single run. Cheap to clone into executions.
#[derive(Clone)]
pub(crate) struct RunEvents {
  run_id: u64,
  tx: Option<AsyncSender<NotifierMessage>>,
}

impl RunEvents {
  /// A sink that drops every event. Used when no handler is registered.
  pub(crate) fn disabled(run_id: u64) -> Self {
    Self { run_id, tx: None }
  }

  pub(crate) async fn emit(&self, event: MergeEvent) {
    if let Some(tx) = &self.tx {
      if tx.send(NotifierMessage::Event(event)).await.is_err() {
        trace!(run_id = self.run_id, "Notification worker gone. Event dropped.");
      }
    }
  }

  pub(crate) async fn execution_finished(&self, result: &ExecutionResult) {
    if self.tx.is_none() {
      return;
    }
    self
      .emit(MergeEvent::ExecutionFinished(ExecutionInfo {
        run_id: self.run_id,
        task_id: result.task_id,
        replica: result.replica,
        status: result.status.clone(),
        error: result.error.clone(),
        completion_time: SystemTime::now(),
      }))
      .await;
  }

  /// Waits until handlers have seen every event emitted before this call.
  pub(crate) async fn flush(&self) {
    if let Some(tx) = &self.tx {
      let (ack_tx, ack_rx) = oneshot::channel();
      if tx.send(NotifierMessage::Flush(ack_tx)).await.is_ok() {
        let _ = ack_rx.await;
      }
    }
  }
}
