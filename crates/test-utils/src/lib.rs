pub mod builders;
pub mod fake_executor;
pub mod file_server;

use std::sync::Once;
use std::time::Duration;

use taskforge::registry::TaskRegistry;
use taskforge::task::Task;
use taskforge::types::TaskId;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .try_init();
    });
}

/// Run a future with a 10-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("Test timed out after 10 seconds")
}

/// Poll the registry until `pred` holds for the task, then return it.
///
/// Panics after 10 seconds.
pub async fn wait_for<P>(registry: &TaskRegistry, id: &TaskId, pred: P) -> Task
where
    P: Fn(&Task) -> bool,
{
    with_timeout(async {
        loop {
            let task = registry.get(id).expect("task exists");
            if pred(&task) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

/// Wait until the task reaches a terminal status.
pub async fn wait_terminal(registry: &TaskRegistry, id: &TaskId) -> Task {
    wait_for(registry, id, |t| t.is_terminal()).await
}
