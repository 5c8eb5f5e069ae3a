//! # Cleanup Guarantee Integration Tests
//!
//! Validates that resources created by a run are reclaimed no matter how the
//! run ends: script teardown after failures, registry sweeps that keep going
//! past individual failures, and orphan reclamation for runs that crashed.

#![cfg(feature = "test-harness")]

use std::sync::Arc;

use lifecycle_harness::condition::Expectation;
use lifecycle_harness::simulator::SimulatedProvider;
use lifecycle_harness::test_harness::{HarnessTestConfig, HarnessTestEnvironment, TestSpecs};
use lifecycle_harness::{HarnessError, LifecycleState, ResourceKind, TestMarker};

use crate::integration::init_logging;

/// **Test: Sweep Reports Every Failure and Keeps Going**
///
/// # Test Scenario
/// 1. Provision five guests
/// 2. Make the service refuse to delete two of them
/// 3. Sweep: the other three must be reclaimed, both failures reported
/// 4. Lift the fault and sweep again: the registry must drain
#[tokio::test(start_paused = true)]
async fn test_sweep_collects_failures_and_retries_later() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        let handle = env
            .orchestrator
            .provision_and_stabilize(TestSpecs::compute_named(&format!("vm{i}")))
            .await
            .unwrap();
        handles.push(handle);
    }
    env.provider.faults().reject_delete(handles[1].id());
    env.provider.faults().reject_delete(handles[3].id());

    let failures = env.orchestrator.sweep().await;
    assert_eq!(failures.len(), 2);
    for failure in &failures {
        assert!(matches!(failure, HarnessError::MutationFailed { .. }), "{failure}");
    }
    assert_eq!(env.registry.len(), 2);
    assert!(env.registry.contains(&handles[1]));
    assert!(env.registry.contains(&handles[3]));
    assert_eq!(env.provider.live_count(), 2);

    env.provider.faults().release(handles[1].id());
    env.provider.faults().release(handles[3].id());
    assert!(env.orchestrator.sweep().await.is_empty());
    assert!(env.registry.is_empty());
    assert_eq!(env.provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_reclaim_is_not_discoverable() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();

    let vm = env
        .orchestrator
        .provision_and_stabilize(TestSpecs::compute())
        .await
        .unwrap();
    assert_eq!(env.remote_leftovers().await.unwrap(), vec![vm.clone()]);

    env.orchestrator.reclaim(&vm).await.unwrap();
    assert!(!env.registry.contains(&vm));
    assert!(env.remote_leftovers().await.unwrap().is_empty());
    assert_eq!(env.provider.history(vm.id()).last(), Some(&LifecycleState::Absent));
}

/// **Test: Script Teardown Respects Attachment Order**
///
/// The script creates a credential, then a guest using it, then fails. The
/// service refuses to delete a credential still attached to a live guest, so
/// teardown only succeeds if it removes the guest first and waits for its
/// absence before deleting the credential.
#[tokio::test(start_paused = true)]
async fn test_script_teardown_runs_in_reverse_creation_order() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();

    let report = env
        .orchestrator
        .run_script("attach-then-fail", |script| async move {
            let key = script.provision_and_stabilize(TestSpecs::credential()).await?;
            let vm = script
                .provision_and_stabilize(TestSpecs::compute_with_credential(key.id()))
                .await?;
            script.expect(&vm, &Expectation::CredentialAttached(key.id())).await?;
            script.expect(&vm, &Expectation::NetworkVlansAtLeast(50)).await?;
            Ok::<_, HarnessError>(())
        })
        .await;

    match &report.result {
        Err(HarnessError::ExpectationUnmet { mismatch, .. }) => {
            assert!(mismatch.contains("found 2"), "{mismatch}");
        }
        other => panic!("expected unmet expectation, got {other:?}"),
    }
    assert!(report.cleanup_errors.is_empty(), "{}", report.summary());
    assert!(env.registry.is_empty());
    assert_eq!(env.provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_delete_stays_registered() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();

    let report = env
        .orchestrator
        .run_script("stuck-delete", |script| {
            let provider = env.provider.clone();
            async move {
                let vm = script.provision_and_stabilize(TestSpecs::compute()).await?;
                provider.faults().stick_in_deleting(vm.id());
                Ok::<_, HarnessError>(vm)
            }
        })
        .await;

    let vm = report.result.as_ref().unwrap().clone();
    assert_eq!(report.cleanup_errors.len(), 1);
    let failure = &report.cleanup_errors[0];
    assert!(matches!(failure, HarnessError::ReclaimFailed { .. }), "{failure}");
    assert_eq!(failure.last_state(), Some(LifecycleState::Deleting));
    assert!(!failure.is_fatal());
    assert!(!report.is_success());

    // Still tracked, so a later sweep can finish the job
    assert!(env.registry.contains(&vm));
    env.provider.faults().release(vm.id());
    assert_eq!(env.shutdown().await, 0);
    assert!(!env.provider.exists(vm.id()));
}

/// **Test: Leftovers of a Crashed Run Are Reclaimed by the Next One**
///
/// A first environment creates resources and "crashes" without teardown. A
/// second environment against the same service finds them through the marker
/// prefix and reclaims them, while leaving its own tracked resources alone.
#[tokio::test(start_paused = true)]
async fn test_orphans_from_crashed_run_are_reclaimed() {
    init_logging();
    let provider = Arc::new(SimulatedProvider::default());
    let prefix = "orphan-test".to_string();

    let crashed = HarnessTestEnvironment::with_provider(
        HarnessTestConfig {
            marker_prefix: prefix.clone(),
            run_label: "crashed".to_string(),
            ..Default::default()
        },
        provider.clone(),
    )
    .unwrap();
    let lost_vm = crashed
        .orchestrator
        .provision_and_stabilize(TestSpecs::compute())
        .await
        .unwrap();
    let lost_key = crashed
        .orchestrator
        .provision_and_stabilize(TestSpecs::credential())
        .await
        .unwrap();
    drop(crashed);

    let env = HarnessTestEnvironment::with_provider(
        HarnessTestConfig {
            marker_prefix: prefix,
            run_label: "rerun".to_string(),
            ..Default::default()
        },
        provider,
    )
    .unwrap();
    let own_vm = env
        .orchestrator
        .provision_and_stabilize(TestSpecs::compute())
        .await
        .unwrap();

    let report = env
        .orchestrator
        .reclaim_orphans(&env.marker().widen(), None)
        .await
        .unwrap();

    assert_eq!(report.discovered.len(), 3);
    assert_eq!(report.skipped, vec![own_vm.clone()]);
    assert_eq!(report.reclaimed.len(), 2);
    assert!(report.failures.is_empty());
    // Compute before credentials
    assert_eq!(report.reclaimed[0], lost_vm);
    assert_eq!(report.reclaimed[1], lost_key);

    assert!(env.provider.exists(own_vm.id()));
    assert!(env.registry.contains(&own_vm));
    assert_eq!(env.shutdown().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_orphan_sweep_can_be_narrowed_by_kind() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();
    let other_run = TestMarker::new(env.marker().prefix(), "other");
    let vm = env.provider.seed_orphan(TestSpecs::compute(), &other_run);
    let key = env.provider.seed_orphan(TestSpecs::credential(), &other_run);

    let report = env
        .orchestrator
        .reclaim_orphans(&env.marker().widen(), Some(ResourceKind::Credential))
        .await
        .unwrap();

    assert_eq!(report.reclaimed, vec![key.clone()]);
    assert_eq!(report.skipped, vec![vm.clone()]);
    assert!(env.provider.exists(vm.id()));
    assert!(!env.provider.exists(key.id()));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failure_is_not_fatal() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();
    env.provider.faults().fail_listing(true);

    let err = env
        .orchestrator
        .reclaim_orphans(&env.marker().widen(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::DiscoveryFailed { .. }));
    assert!(!err.is_fatal());
}

/// **Test: An Unacknowledged Delete Keeps the Handle Registered**
///
/// # Test Scenario
/// 1. The service answers the delete with `false`
/// 2. Reclaim fails with `MutationFailed` and the guest stays tracked
/// 3. Once the service behaves, a sweep reclaims it
#[tokio::test(start_paused = true)]
async fn test_unacknowledged_delete_is_retried_by_sweep() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();

    let vm = env
        .orchestrator
        .provision_and_stabilize(TestSpecs::compute())
        .await
        .unwrap();
    env.provider.faults().drop_delete(vm.id());

    let err = env.orchestrator.reclaim(&vm).await.unwrap_err();
    match &err {
        HarnessError::MutationFailed { mutation, reason, .. } => {
            assert_eq!(mutation, "delete");
            assert!(reason.contains("did not acknowledge"), "{reason}");
        }
        other => panic!("expected mutation failure, got {other:?}"),
    }
    assert!(env.registry.contains(&vm));
    assert!(env.provider.exists(vm.id()));
    assert_eq!(env.current_state(&vm).await.unwrap(), LifecycleState::Stable);

    env.provider.faults().release(vm.id());
    assert!(env.orchestrator.sweep().await.is_empty());
    assert!(env.registry.is_empty());
    assert!(!env.provider.exists(vm.id()));
}
