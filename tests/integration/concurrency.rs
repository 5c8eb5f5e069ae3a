//! # Concurrency Integration Tests
//!
//! Independent scripts may run concurrently against one orchestrator. They
//! share the registry and nothing else, so teardown of one must never touch
//! resources of another.

#![cfg(feature = "test-harness")]

use std::collections::HashSet;
use std::time::Duration;

use lifecycle_harness::scenarios::{self, ScenarioKind};
use lifecycle_harness::simulator::SimulationProfile;
use lifecycle_harness::test_harness::{HarnessTestConfig, HarnessTestEnvironment, TestSpecs};
use lifecycle_harness::HarnessError;

use crate::integration::{init_logging, poll_until};

#[tokio::test(start_paused = true)]
async fn test_all_scenarios_run_concurrently() {
    init_logging();
    let env = HarnessTestEnvironment::with_config(HarnessTestConfig::with_profile(
        SimulationProfile {
            jitter_polls: 2,
            seed: 7,
            ..Default::default()
        },
    ))
    .unwrap();

    let reports = scenarios::run_concurrently(&env.orchestrator, &ScenarioKind::ALL).await;

    for report in &reports {
        assert!(report.is_success(), "{}", report.summary());
    }
    assert!(env.registry.is_empty());
    assert_eq!(env.provider.live_count(), 0);
}

/// **Test: Spawned Scripts Share One Registry**
///
/// # Test Scenario
/// 1. Spawn sixteen scripts on separate tasks, each provisioning one guest
/// 2. Every script fails after provisioning
/// 3. Each teardown must reclaim exactly its own guest
#[tokio::test(start_paused = true)]
async fn test_spawned_scripts_tear_down_only_their_own_resources() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let orchestrator = env.orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator
                .run_script(&format!("worker-{i}"), |script| async move {
                    let vm = script
                        .provision_and_stabilize(TestSpecs::compute_named(&format!("vm{i}")))
                        .await?;
                    Err::<(), _>(HarnessError::ExpectationUnmet {
                        kind: vm.kind(),
                        id: vm.id(),
                        expectation: "nothing".to_string(),
                        mismatch: "forced failure".to_string(),
                    })
                })
                .await
        }));
    }

    let mut reclaimed = HashSet::new();
    for task in tasks {
        let report = task.await.unwrap();
        assert!(report.result.is_err());
        assert!(report.cleanup_errors.is_empty(), "{}", report.summary());
        if let Err(HarnessError::ExpectationUnmet { id, .. }) = report.result {
            assert!(reclaimed.insert(id), "{id} torn down twice");
        }
    }

    assert_eq!(reclaimed.len(), 16);
    assert_eq!(env.provider.create_calls(), 16);
    assert_eq!(env.provider.delete_calls(), 16);
    assert!(env.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_registry_tracks_resources_while_scripts_run() {
    init_logging();
    let env = HarnessTestEnvironment::with_config(HarnessTestConfig::with_profile(
        SimulationProfile {
            provisioning_polls: 20,
            ..Default::default()
        },
    ))
    .unwrap();

    let task = tokio::spawn({
        let orchestrator = env.orchestrator.clone();
        async move {
            let reports = scenarios::run_concurrently(
                &orchestrator,
                &[ScenarioKind::ComputeHostDisk, ScenarioKind::ComputeNetworkVlans],
            )
            .await;
            reports.iter().all(|r| r.is_success())
        }
    });

    // Both guests are registered while they are still provisioning
    let registry = env.registry.clone();
    let seen = poll_until(Duration::from_secs(10), Duration::from_millis(10), || {
        let registry = registry.clone();
        async move { (registry.len() == 2).then_some(()) }
    })
    .await;
    assert!(seen.is_some());

    assert!(task.await.unwrap());
    assert!(env.registry.is_empty());
}
