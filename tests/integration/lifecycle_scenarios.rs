//! # Lifecycle Scenario Integration Tests
//!
//! Runs the shipped scenarios end to end against the simulated service and
//! checks both the verdicts and what the service saw.

#![cfg(feature = "test-harness")]

use lifecycle_harness::condition::{Condition, Expectation};
use lifecycle_harness::config::WaitStep;
use lifecycle_harness::scenarios::{self, ScenarioKind, SCENARIO_TAGS};
use lifecycle_harness::simulator::SimulationProfile;
use lifecycle_harness::test_harness::{HarnessTestConfig, HarnessTestEnvironment, TestSpecs};
use lifecycle_harness::{HarnessError, LifecycleState, Mutation};

use crate::integration::init_logging;

/// **Test: Every Scenario Passes Against a Well-Behaved Service**
///
/// Runs all scenarios in sequence with the default progression. Each one must
/// pass, and nothing may be left registered or alive on the service afterwards.
#[tokio::test(start_paused = true)]
async fn test_all_scenarios_pass_and_leave_nothing_behind() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();

    let reports = scenarios::run_all(&env.orchestrator, &ScenarioKind::ALL).await;

    assert_eq!(reports.len(), ScenarioKind::ALL.len());
    for report in &reports {
        assert!(report.is_success(), "{}", report.summary());
    }
    assert!(env.registry.is_empty());
    assert_eq!(env.provider.live_count(), 0);
    assert!(env.remote_leftovers().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scenarios_tolerate_jittered_progressions() {
    init_logging();
    let env = HarnessTestEnvironment::with_config(HarnessTestConfig::with_profile(
        SimulationProfile {
            jitter_polls: 4,
            seed: 42,
            ..Default::default()
        },
    ))
    .unwrap();

    let kinds = [
        ScenarioKind::ComputeRebootSoft,
        ScenarioKind::ComputeRebootHard,
        ScenarioKind::ComputeSetTags,
    ];
    for report in scenarios::run_all(&env.orchestrator, &kinds).await {
        assert!(report.is_success(), "{}", report.summary());
    }
    assert_eq!(env.provider.live_count(), 0);
}

/// **Test: A Reboot That Never Leaves Stable Is Reported**
///
/// The service acknowledges the reboot but never changes state. The settle
/// waits succeed immediately, so the scenario must catch the masked reboot from
/// the observed states and still tear the guest down.
#[tokio::test(start_paused = true)]
async fn test_masked_reboot_fails_scenario() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();
    env.provider.faults().ignore_reboots(true);

    let report = scenarios::run(&env.orchestrator, ScenarioKind::ComputeRebootSoft).await;

    match &report.result {
        Err(HarnessError::ExpectationUnmet { expectation, .. }) => {
            assert!(expectation.contains("soft reboot"), "{expectation}");
        }
        other => panic!("expected unmet expectation, got {other:?}"),
    }
    assert!(report.cleanup_errors.is_empty());
    assert_eq!(env.provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reboot_history_shows_transition() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();

    let vm = env
        .orchestrator
        .provision_and_stabilize(TestSpecs::compute())
        .await
        .unwrap();
    let report = env
        .orchestrator
        .reboot_and_settle(&vm, lifecycle_harness::RebootKind::Hard)
        .await
        .unwrap();

    assert!(report.left_stable());
    let departed = report.departed.as_ref().unwrap();
    assert_eq!(departed.snapshot.state, LifecycleState::Rebooting);

    let history = env.provider.history(vm.id());
    let stable_then_reboot = history
        .windows(2)
        .any(|w| w[0] == LifecycleState::Stable && w[1] == LifecycleState::Rebooting);
    assert!(stable_then_reboot, "{history:?}");
    assert_eq!(history.last(), Some(&LifecycleState::Stable));

    env.orchestrator.reclaim(&vm).await.unwrap();
}

/// **Test: Slow Provisioning Surfaces As a Stabilize Timeout**
///
/// The guest never leaves provisioning. The error must name the state last
/// seen, and the script's teardown must still remove the guest.
#[tokio::test(start_paused = true)]
async fn test_stuck_provisioning_times_out_and_is_reclaimed() {
    init_logging();
    let env = HarnessTestEnvironment::with_config(HarnessTestConfig::with_profile(
        SimulationProfile {
            provisioning_polls: 100_000,
            ..Default::default()
        },
    ))
    .unwrap();

    let report = scenarios::run(&env.orchestrator, ScenarioKind::ComputePrimaryAddress).await;

    let err = report.result.as_ref().unwrap_err();
    assert!(matches!(err, HarnessError::StabilizeTimeout { .. }), "{err}");
    assert!(err.is_timeout());
    assert_eq!(err.last_state(), Some(LifecycleState::Provisioning));
    assert!(err.to_string().contains("provisioning"), "{err}");

    assert!(report.cleanup_errors.is_empty());
    assert!(env.registry.is_empty());
    assert_eq!(env.provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_tag_comparison_ignores_order_and_duplicates() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();
    let marker_tag = env.marker().tag().to_string();

    let vm = env
        .orchestrator
        .provision_and_stabilize(TestSpecs::compute())
        .await
        .unwrap();
    env.orchestrator
        .mutate(
            &vm,
            Mutation::SetTags(vec![
                "b".to_string(),
                "a".to_string(),
                "a".to_string(),
                marker_tag.clone(),
            ]),
        )
        .await
        .unwrap();

    let expected = Expectation::tags_exactly(["a", "b", marker_tag.as_str()]);
    env.orchestrator
        .wait_for(&vm, &expected.as_condition(), WaitStep::Mutation)
        .await
        .unwrap();

    let mutations = env.provider.mutate_calls();
    assert!(env.orchestrator.verify_observable(&vm, &expected).await.unwrap());
    assert!(!env
        .orchestrator
        .verify_observable(&vm, &Expectation::tags_exactly(["a"]))
        .await
        .unwrap());
    // Verification is read-only
    assert_eq!(env.provider.mutate_calls(), mutations);

    env.orchestrator.reclaim(&vm).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_credential_scenario_clears_stale_keys_first() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();
    let crashed = lifecycle_harness::TestMarker::new(env.marker().prefix(), "crashed");
    let stale = env.provider.seed_orphan(TestSpecs::credential(), &crashed);

    let report = scenarios::run(&env.orchestrator, ScenarioKind::ComputeWithCredential).await;

    assert!(report.is_success(), "{}", report.summary());
    let outcome = report.result.unwrap();
    assert!(outcome.notes.iter().any(|n| n.contains("1 stale credential")));
    assert!(!env.provider.exists(stale.id()));
    assert_eq!(env.provider.live_count(), 0);
}

/// **Test: Reads That Lag a Reboot Do Not Mask It**
///
/// The service keeps reporting the pre-reboot `Stable` snapshot for a few
/// reads after acknowledging the reboot. The scenario must wait until the
/// reboot shows up, then for the guest to settle, and only then tear it down.
#[tokio::test(start_paused = true)]
async fn test_reboot_scenario_survives_stale_reads() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();
    env.provider.faults().serve_stale_reads_after_reboot(2);

    let report = scenarios::run(&env.orchestrator, ScenarioKind::ComputeRebootSoft).await;
    assert!(report.is_success(), "{}", report.summary());

    let outcome = report.result.as_ref().unwrap();
    let vm = &outcome.resources[0];
    let history = env.provider.history(vm.id());
    let settled_before_delete = history
        .windows(2)
        .any(|w| w[0] == LifecycleState::Stable && w[1] == LifecycleState::Deleting);
    assert!(history.contains(&LifecycleState::Rebooting), "{history:?}");
    assert!(settled_before_delete, "{history:?}");
    assert_eq!(env.provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_tags_replace_marker_tag_but_stay_discoverable() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();

    let vm = env
        .orchestrator
        .provision_and_stabilize(TestSpecs::compute())
        .await
        .unwrap();
    let tags = SCENARIO_TAGS.iter().map(|t| t.to_string()).collect();
    env.orchestrator.mutate(&vm, Mutation::SetTags(tags)).await.unwrap();
    env.orchestrator
        .wait_for(&vm, &Condition::has_tags(SCENARIO_TAGS), WaitStep::Mutation)
        .await
        .unwrap();

    let verification = env
        .orchestrator
        .observe(&vm, &Expectation::tags_exactly(SCENARIO_TAGS))
        .await
        .unwrap();
    assert!(verification.satisfied, "{:?}", verification.mismatch);
    assert_eq!(verification.snapshot.distinct_tags().len(), 3);

    // Found through the name prefix alone
    assert_eq!(env.remote_leftovers().await.unwrap(), vec![vm.clone()]);
    env.orchestrator.reclaim(&vm).await.unwrap();
}

/// **Test: A Refused Mutation Aborts the Script, Teardown Still Runs**
#[tokio::test(start_paused = true)]
async fn test_rejected_tag_write_fails_scenario_and_reclaims() {
    init_logging();
    let env = HarnessTestEnvironment::new().unwrap();
    env.provider.faults().reject_mutations(true);

    let report = scenarios::run(&env.orchestrator, ScenarioKind::ComputeSetTags).await;

    match &report.result {
        Err(HarnessError::MutationFailed { mutation, reason, .. }) => {
            assert_eq!(mutation, "set_tags");
            assert!(reason.contains("refused"), "{reason}");
        }
        other => panic!("expected mutation failure, got {other:?}"),
    }
    assert!(report.result.as_ref().unwrap_err().is_fatal());
    assert!(report.cleanup_errors.is_empty(), "{}", report.summary());
    assert!(env.registry.is_empty());
    assert_eq!(env.provider.live_count(), 0);
}
