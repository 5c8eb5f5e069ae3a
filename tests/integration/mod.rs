//! Integration tests for the lifecycle harness.
//!
//! These tests drive complete lifecycle scripts through the orchestrator against
//! the in-memory simulated service. They require the `test-harness` feature:
//!
//! ```bash
//! cargo test --features test-harness
//! ```
//!
//! ## Test Organization
//!
//! - **lifecycle_scenarios**: the shipped scenarios, pass and fail paths
//! - **cleanup_guarantees**: teardown, sweeps, and orphan reclamation
//! - **concurrency**: independent scripts sharing one registry
//! - **cancellation**: interrupted runs and hung service calls
//!
//! Most tests run with tokio's clock paused, so multi-minute waits finish instantly.

pub mod cancellation;
pub mod cleanup_guarantees;
pub mod concurrency;
pub mod lifecycle_scenarios;

use tokio::time::Instant;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub async fn poll_until<T, F, Fut>(
    timeout: std::time::Duration,
    interval: std::time::Duration,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }

        if Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(interval).await;
    }
}
