use futures_merge::{request, MergeEvent, Merger, RequestFn, TaskError};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug)]
struct Weather {
  city: String,
  report: String,
}

// Simulated lookup with random latency and an occasional failure.
fn find_weather(city: &str, results: mpsc::UnboundedSender<Weather>) -> RequestFn {
  let city = Arc::new(city.to_string());
  request(move |token: CancellationToken| {
    let city = city.clone();
    let results = results.clone();
    async move {
      let (latency_ms, flaky) = {
        let mut rng = rand::rng();
        (rng.random_range(20..200), rng.random_bool(0.2))
      };

      tokio::select! {
        _ = token.cancelled() => return Err::<(), TaskError>(format!("lookup for {} cancelled", city).into()),
        _ = tokio::time::sleep(Duration::from_millis(latency_ms)) => {}
      }
      if flaky {
        return Err(format!("lookup for {} failed after {}ms", city, latency_ms).into());
      }

      let _ = results.send(Weather {
        city: city.to_string(),
        report: format!("sunny, answered in {}ms", latency_ms),
      });
      Ok(())
    }
  })
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Weather Fan-out Demo (redundancy 2, concurrency 3) ---");

  let cities = ["San Francisco", "Oakland", "Berkeley", "Palo Alto", "San Jose"];
  let (results_tx, mut results_rx) = mpsc::unbounded_channel();
  let requests: Vec<RequestFn> = cities
    .iter()
    .map(|city| find_weather(city, results_tx.clone()))
    .collect();
  drop(results_tx);

  let merger = match Merger::new(requests, Duration::from_secs(2)).with_redundancy(2) {
    Ok(merger) => merger
      .with_concurrency(3)
      .with_name("weather")
      .with_event_handler(|event| {
        if let MergeEvent::RunFinished { run_id, status } = event {
          info!("Run {} finished with status {:?}", run_id, status);
        }
      }),
    Err(e) => {
      tracing::error!("Invalid merger configuration: {}", e);
      return;
    }
  };

  match merger.run().await {
    Ok(()) => info!("Every city answered at least once."),
    Err(e) => info!("Merge failed: {} (incomplete: {:?})", e, e.incomplete_tasks()),
  }

  // Collect the values through our own side channel. Replicas may answer
  // twice for the same city; the last answer wins.
  drop(merger);
  let mut reports = HashMap::new();
  while let Ok(weather) = results_rx.try_recv() {
    reports.insert(weather.city, weather.report);
  }
  for (city, report) in &reports {
    info!("{}: {}", city, report);
  }
  info!("--- Weather Fan-out Demo End ---");
}
