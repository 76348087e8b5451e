use crate::dispatcher::Dispatcher;
use crate::error::MergeError;
use crate::gate::ConcurrencyGate;
use crate::notifier::{EventNotifier, MergeEvent, RunStatus};
use crate::request::RequestFn;
use crate::tracker::CompletionTracker;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use fibre::mpsc::{self, AsyncReceiver};
use tokio::runtime::Handle as TokioHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Upper bound used when `Instant + timeout` would overflow.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Runs a fixed queue of requests until each has succeeded at least once.
///
/// A `Merger` is an immutable value. Every `with_*` method returns a new
/// `Merger` and leaves the original untouched, so one instance can be cloned
/// and run concurrently from several places.
///
/// ```no_run
/// # async fn demo() -> Result<(), futures_merge::MergeError> {
/// use futures_merge::{request, Merger, TaskError};
/// use std::time::Duration;
///
/// let requests = (0..5).map(|i| request(move |_token| async move {
///   println!("fetching {i}");
///   Ok::<(), TaskError>(())
/// }));
///
/// Merger::new(requests, Duration::from_secs(1))
///   .with_redundancy(2)?
///   .with_concurrency(3)
///   .run()
///   .await
/// # }
/// ```
#[derive(Clone)]
pub struct Merger {
  name: Arc<str>,
  requests: Arc<[RequestFn]>,
  timeout: Duration,
  redundancy: usize,
  concurrency: usize,
  cancellation: Option<CancellationToken>,
  notifier: EventNotifier,
  tokio_handle: Option<TokioHandle>,
}

impl fmt::Debug for Merger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Merger")
      .field("name", &self.name)
      .field("task_count", &self.requests.len())
      .field("timeout", &self.timeout)
      .field("redundancy", &self.redundancy)
      .field("concurrency", &self.concurrency)
      .field("has_cancellation", &self.cancellation.is_some())
      .field("notifier", &self.notifier)
      .finish()
  }
}

impl Merger {
  /// Creates a merger over `requests` with redundancy 1 and no concurrency limit.
  ///
  /// Task ids are assigned in iteration order starting at 0.
  pub fn new(requests: impl IntoIterator<Item = RequestFn>, timeout: Duration) -> Self {
    Self {
      name: Arc::from("merger"),
      requests: requests.into_iter().collect::<Vec<_>>().into(),
      timeout,
      redundancy: 1,
      concurrency: 0,
      cancellation: None,
      notifier: EventNotifier::default(),
      tokio_handle: None,
    }
  }

  /// Drains a request channel until every sender has been dropped, then builds
  /// a merger over what was received.
  pub async fn from_receiver(requests_rx: AsyncReceiver<RequestFn>, timeout: Duration) -> Self {
    let mut requests = Vec::new();
    while let Ok(request) = requests_rx.recv().await {
      requests.push(request);
    }
    debug!(task_count = requests.len(), "Request queue closed and drained.");
    Self::new(requests, timeout)
  }

  /// Number of concurrent attempts made per request. Must be at least 1.
  ///
  /// # Errors
  /// Returns `MergeError::InvalidRedundancy` for `0`.
  pub fn with_redundancy(&self, redundancy: usize) -> Result<Self, MergeError> {
    if redundancy == 0 {
      return Err(MergeError::InvalidRedundancy(redundancy));
    }
    Ok(Self {
      redundancy,
      ..self.clone()
    })
  }

  /// Maximum executions in flight at once. `0` removes the limit.
  pub fn with_concurrency(&self, concurrency: usize) -> Self {
    Self {
      concurrency,
      ..self.clone()
    }
  }

  /// Overall deadline for a run, measured from the start of `run`.
  pub fn with_timeout(&self, timeout: Duration) -> Self {
    Self {
      timeout,
      ..self.clone()
    }
  }

  /// Ties every run to an externally owned cancellation token.
  ///
  /// The merger only ever cancels child tokens derived from it.
  pub fn with_cancellation(&self, cancellation: &CancellationToken) -> Self {
    Self {
      cancellation: Some(cancellation.clone()),
      ..self.clone()
    }
  }

  /// Name used in log spans.
  pub fn with_name(&self, name: &str) -> Self {
    Self {
      name: Arc::from(name),
      ..self.clone()
    }
  }

  /// Adds a handler that receives every `MergeEvent` of every run.
  ///
  /// Handlers run on a per-run notification task, in emission order, so a slow
  /// handler never delays the deadline. `run` returns only after handlers have
  /// seen the `RunFinished` event.
  pub fn with_event_handler(&self, handler: impl Fn(MergeEvent) + Send + Sync + 'static) -> Self {
    Self {
      notifier: self.notifier.with_handler(handler),
      ..self.clone()
    }
  }

  /// Runtime used to spawn the dispatcher and executions. Defaults to the
  /// runtime `run` is awaited on.
  pub fn with_tokio_handle(&self, tokio_handle: TokioHandle) -> Self {
    Self {
      tokio_handle: Some(tokio_handle),
      ..self.clone()
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn task_count(&self) -> usize {
    self.requests.len()
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  pub fn redundancy(&self) -> usize {
    self.redundancy
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency
  }

  /// Runs every request and waits until each has succeeded once.
  ///
  /// Uses the token given to `with_cancellation`, if any.
  ///
  /// # Errors
  /// Returns `MergeError::TimedOut` when the timeout elapses first and
  /// `MergeError::Cancelled` when the cancellation token fires first. Both list
  /// the ids of tasks that never succeeded.
  pub async fn run(&self) -> Result<(), MergeError> {
    let cancellation = self.cancellation.clone().unwrap_or_default();
    self.run_with_cancellation(&cancellation).await
  }

  /// Same as `run`, but governed by `cancellation` instead of any token
  /// configured on the merger.
  pub async fn run_with_cancellation(&self, cancellation: &CancellationToken) -> Result<(), MergeError> {
    let run_id = NEXT_RUN_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let span = info_span!("merge_run", merger = %self.name, run_id);
    self.execute(run_id, cancellation.child_token()).instrument(span).await
  }

  async fn execute(&self, run_id: u64, run_token: CancellationToken) -> Result<(), MergeError> {
    // Fires on every exit, including when the caller drops this future early.
    let _cancel_on_drop = run_token.clone().drop_guard();
    let tokio_handle = self.tokio_handle.clone().unwrap_or_else(TokioHandle::current);
    let events = self.notifier.start_run(run_id, &tokio_handle);

    if self.requests.is_empty() {
      debug!(run_id, "Empty request queue. Nothing to run.");
      events
        .emit(MergeEvent::RunFinished {
          run_id,
          status: RunStatus::Completed,
        })
        .await;
      events.flush().await;
      return Ok(());
    }

    let started = Instant::now();
    let deadline = started
      .checked_add(self.timeout)
      .unwrap_or_else(|| started + FAR_FUTURE);

    let (results_tx, results_rx) = mpsc::unbounded_async();
    let gate = ConcurrencyGate::new(self.concurrency);

    info!(
      run_id,
      tasks = self.requests.len(),
      redundancy = self.redundancy,
      capacity = ?gate.capacity(),
      timeout = ?self.timeout,
      "Starting run."
    );
    let dispatcher = Dispatcher {
      run_id,
      merger_name: self.name.clone(),
      requests: self.requests.clone(),
      redundancy: self.redundancy,
      gate: gate.clone(),
      results_tx,
      events: events.clone(),
      tokio_handle: tokio_handle.clone(),
    };
    let tracker = CompletionTracker::new(run_id, dispatcher.distinct_tasks(), results_rx, events.clone());

    let dispatch_handle = tokio_handle.spawn(dispatcher.run(run_token.clone()).in_current_span());
    let outcome = tracker.wait(self.timeout, deadline, &run_token).await;

    // Stop new executions and tell running ones the run is over.
    run_token.cancel();
    gate.close();

    match dispatch_handle.await {
      Ok(launched) => debug!(run_id, launched, "Dispatcher joined."),
      Err(join_error) => error!(run_id, "Error joining dispatcher: {:?}", join_error),
    }

    let status = match &outcome {
      Ok(()) => RunStatus::Completed,
      Err(MergeError::Cancelled { .. }) => RunStatus::Cancelled,
      Err(_) => RunStatus::TimedOut,
    };
    match &outcome {
      Ok(()) => info!(run_id, elapsed = ?started.elapsed(), "Run completed."),
      Err(merge_error) => warn!(
        run_id,
        elapsed = ?started.elapsed(),
        incomplete = ?merge_error.incomplete_tasks(),
        "Run ended without completing: {}",
        merge_error
      ),
    }
    events.emit(MergeEvent::RunFinished { run_id, status }).await;
    events.flush().await;

    outcome
  }
}
