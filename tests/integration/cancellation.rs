//! # Cancellation Integration Tests
//!
//! A cancelled run must stop waiting promptly, report cancellation rather than
//! a timeout, and still issue deletes for what it created.

#![cfg(feature = "test-harness")]

use std::time::Duration;

use lifecycle_harness::scenarios::{self, ScenarioKind};
use lifecycle_harness::simulator::SimulationProfile;
use lifecycle_harness::test_harness::{HarnessTestConfig, HarnessTestEnvironment, TestSpecs};
use lifecycle_harness::{HarnessError, ProviderErrorClass};

use crate::integration::init_logging;

/// **Test: Cancelling Mid-Provision**
///
/// # Expected Behavior
/// - The scenario fails with a cancellation, not a timeout
/// - Teardown still issues the delete
/// - The guest stays registered because its absence could not be confirmed
#[tokio::test(start_paused = true)]
async fn test_cancel_during_provisioning() {
    init_logging();
    let env = HarnessTestEnvironment::with_config(HarnessTestConfig::with_profile(
        SimulationProfile {
            provisioning_polls: 100_000,
            ..Default::default()
        },
    ))
    .unwrap();

    let task = tokio::spawn({
        let orchestrator = env.orchestrator.clone();
        async move { scenarios::run(&orchestrator, ScenarioKind::ComputePrimaryAddress).await }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    let started = tokio::time::Instant::now();
    env.cancel.cancel();
    let report = task.await.unwrap();

    assert!(started.elapsed() < env.config().poll_interval() * 2);
    let err = report.result.as_ref().unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(!err.is_timeout());

    assert_eq!(env.provider.delete_calls(), 1);
    assert_eq!(report.cleanup_errors.len(), 1);
    assert!(report.cleanup_errors[0].is_cancelled());
    assert_eq!(env.registry.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_fetches_exhaust_instead_of_hanging() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();
    env.provider.faults().hang_fetches(true);

    let err = env
        .orchestrator
        .provision_and_stabilize(TestSpecs::credential())
        .await
        .unwrap_err();

    match &err {
        HarnessError::StabilizeTimeout { cause, .. } => match cause.as_ref() {
            HarnessError::FetchExhausted { last_error, attempts, .. } => {
                assert_eq!(last_error.class, ProviderErrorClass::Transport);
                assert!(*attempts > 1);
            }
            other => panic!("expected fetch exhaustion, got {other:?}"),
        },
        other => panic!("expected stabilize timeout, got {other:?}"),
    }

    env.provider.faults().hang_fetches(false);
    assert_eq!(env.shutdown().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_fetch_errors_do_not_fail_waits() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();
    env.provider
        .faults()
        .fail_next_fetches(5, ProviderErrorClass::Throttled);

    let vm = env
        .orchestrator
        .provision_and_stabilize(TestSpecs::compute())
        .await
        .unwrap();

    assert!(env.provider.fetch_calls() > 5);
    env.orchestrator.reclaim(&vm).await.unwrap();
}
