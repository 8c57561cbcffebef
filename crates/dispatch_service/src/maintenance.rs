use std::sync::Arc;
use std::time::Duration;

use dispatch_core::DispatchEngine;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, warn};

/// Runs offer expiry, search timeouts and settlement reconciliation on a
/// fixed cadence until the task is dropped.
pub async fn run(engine: Arc<DispatchEngine>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let engine = engine.clone();
        match tokio::task::spawn_blocking(move || engine.run_maintenance()).await {
            // The engine logs what each pass did.
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, code = err.code(), "maintenance pass failed"),
            Err(err) => error!(error = %err, "maintenance task panicked"),
        }
    }
}
