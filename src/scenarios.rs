//! The lifecycle scenarios the harness ships with.
//!
//! Each scenario is one script: it creates what it needs through its
//! [`Script`], checks what it set out to check, and leaves teardown to the
//! orchestrator.

use futures::future::join_all;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::condition::{Condition, Expectation};
use crate::config::WaitStep;
use crate::error::{HarnessError, HarnessResult};
use crate::orchestrator::{LifecycleOrchestrator, Script, ScriptReport};
use crate::resource::{
    ComputeSpec, CredentialSpec, Mutation, RebootKind, ResourceHandle, ResourceKind,
    ResourceSpec,
};

/// Smallest amount of host disk a fresh guest must report as available.
pub const MIN_HOST_DISK_MB: u64 = 1024;

/// Tags written by the tagging scenario. They replace every existing tag.
pub const SCENARIO_TAGS: [&str; 3] = ["tag0", "tag1", "tag2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    CredentialRoundtrip,
    ComputePrimaryAddress,
    ComputeNetworkVlans,
    ComputeHostDisk,
    ComputeRebootSoft,
    ComputeRebootHard,
    ComputeWithCredential,
    ComputeSetTags,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 8] = [
        ScenarioKind::CredentialRoundtrip,
        ScenarioKind::ComputePrimaryAddress,
        ScenarioKind::ComputeNetworkVlans,
        ScenarioKind::ComputeHostDisk,
        ScenarioKind::ComputeRebootSoft,
        ScenarioKind::ComputeRebootHard,
        ScenarioKind::ComputeWithCredential,
        ScenarioKind::ComputeSetTags,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::CredentialRoundtrip => "credential_roundtrip",
            Self::ComputePrimaryAddress => "compute_primary_address",
            Self::ComputeNetworkVlans => "compute_network_vlans",
            Self::ComputeHostDisk => "compute_host_disk",
            Self::ComputeRebootSoft => "compute_reboot_soft",
            Self::ComputeRebootHard => "compute_reboot_hard",
            Self::ComputeWithCredential => "compute_with_credential",
            Self::ComputeSetTags => "compute_set_tags",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScenarioKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(ScenarioKind::name).collect();
                HarnessError::Config(format!(
                    "unknown scenario `{s}`, expected one of: {}",
                    known.join(", ")
                ))
            })
    }
}

/// What a passing scenario touched and noticed.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub scenario: ScenarioKind,
    pub resources: Vec<ResourceHandle>,
    pub notes: Vec<String>,
}

impl ScenarioOutcome {
    fn new(scenario: ScenarioKind) -> Self {
        Self {
            scenario,
            resources: Vec::new(),
            notes: Vec::new(),
        }
    }
}

pub async fn run(orchestrator: &LifecycleOrchestrator, kind: ScenarioKind) -> ScriptReport<ScenarioOutcome> {
    let name = kind.name();
    match kind {
        ScenarioKind::CredentialRoundtrip => orchestrator.run_script(name, credential_roundtrip).await,
        ScenarioKind::ComputePrimaryAddress => {
            orchestrator.run_script(name, compute_primary_address).await
        }
        ScenarioKind::ComputeNetworkVlans => orchestrator.run_script(name, compute_network_vlans).await,
        ScenarioKind::ComputeHostDisk => orchestrator.run_script(name, compute_host_disk).await,
        ScenarioKind::ComputeRebootSoft => {
            orchestrator
                .run_script(name, |script| compute_reboot(script, RebootKind::Soft))
                .await
        }
        ScenarioKind::ComputeRebootHard => {
            orchestrator
                .run_script(name, |script| compute_reboot(script, RebootKind::Hard))
                .await
        }
        ScenarioKind::ComputeWithCredential => {
            orchestrator.run_script(name, compute_with_credential).await
        }
        ScenarioKind::ComputeSetTags => orchestrator.run_script(name, compute_set_tags).await,
    }
}

/// Run `kinds` one after another.
pub async fn run_all(
    orchestrator: &LifecycleOrchestrator,
    kinds: &[ScenarioKind],
) -> Vec<ScriptReport<ScenarioOutcome>> {
    let mut reports = Vec::with_capacity(kinds.len());
    for kind in kinds {
        reports.push(run(orchestrator, *kind).await);
    }
    reports
}

/// Run `kinds` as concurrent scripts sharing one registry.
pub async fn run_concurrently(
    orchestrator: &LifecycleOrchestrator,
    kinds: &[ScenarioKind],
) -> Vec<ScriptReport<ScenarioOutcome>> {
    info!("Running {} scenario(s) concurrently", kinds.len());
    join_all(kinds.iter().map(|kind| run(orchestrator, *kind))).await
}

fn compute_spec() -> ResourceSpec {
    ResourceSpec::Compute(ComputeSpec::default())
}

async fn credential_roundtrip(script: Script) -> HarnessResult<ScenarioOutcome> {
    let mut outcome = ScenarioOutcome::new(ScenarioKind::CredentialRoundtrip);

    let key = script
        .provision_and_stabilize(ResourceSpec::Credential(CredentialSpec::generated("key")))
        .await?;
    outcome.resources.push(key.clone());

    script.reclaim(&key).await?;
    outcome.notes.push(format!("{key} created, visible, and deleted"));
    Ok(outcome)
}

async fn compute_primary_address(script: Script) -> HarnessResult<ScenarioOutcome> {
    let mut outcome = ScenarioOutcome::new(ScenarioKind::ComputePrimaryAddress);

    let vm = script.provision_and_stabilize(compute_spec()).await?;
    outcome.resources.push(vm.clone());

    script.expect(&vm, &Expectation::PrimaryAddressPresent).await?;
    Ok(outcome)
}

async fn compute_network_vlans(script: Script) -> HarnessResult<ScenarioOutcome> {
    let mut outcome = ScenarioOutcome::new(ScenarioKind::ComputeNetworkVlans);

    let vm = script.provision_and_await_running(compute_spec()).await?;
    outcome.resources.push(vm.clone());

    script.expect(&vm, &Expectation::NetworkVlansAtLeast(1)).await?;
    Ok(outcome)
}

async fn compute_host_disk(script: Script) -> HarnessResult<ScenarioOutcome> {
    let mut outcome = ScenarioOutcome::new(ScenarioKind::ComputeHostDisk);

    let vm = script.provision_and_await_running(compute_spec()).await?;
    outcome.resources.push(vm.clone());

    script
        .expect(&vm, &Expectation::HostDiskAvailable(MIN_HOST_DISK_MB))
        .await?;
    Ok(outcome)
}

async fn compute_reboot(script: Script, kind: RebootKind) -> HarnessResult<ScenarioOutcome> {
    let scenario = match kind {
        RebootKind::Soft => ScenarioKind::ComputeRebootSoft,
        RebootKind::Hard => ScenarioKind::ComputeRebootHard,
    };
    let mut outcome = ScenarioOutcome::new(scenario);

    let vm = script.provision_and_stabilize(compute_spec()).await?;
    outcome.resources.push(vm.clone());

    let report = script.reboot_and_settle(&vm, kind).await?;
    if !report.left_stable() {
        return Err(HarnessError::ExpectationUnmet {
            kind: vm.kind(),
            id: vm.id(),
            expectation: format!("{kind} reboot to leave the stable state"),
            mismatch: "only the stable state was observed after the reboot was acknowledged"
                .to_string(),
        });
    }

    outcome.notes.push(format!(
        "{kind} reboot settled after {:?} ({} polls)",
        report.elapsed(),
        report.polls()
    ));
    Ok(outcome)
}

async fn compute_with_credential(script: Script) -> HarnessResult<ScenarioOutcome> {
    let mut outcome = ScenarioOutcome::new(ScenarioKind::ComputeWithCredential);
    let orchestrator = script.orchestrator();

    // Credential quotas are small; clear leftovers of earlier runs first
    let stale = orchestrator
        .reclaim_orphans(&orchestrator.marker().widen(), Some(ResourceKind::Credential))
        .await?;
    if !stale.reclaimed.is_empty() {
        outcome
            .notes
            .push(format!("reclaimed {} stale credential(s)", stale.reclaimed.len()));
    }

    let key = script
        .provision_and_stabilize(ResourceSpec::Credential(CredentialSpec::generated("key")))
        .await?;
    outcome.resources.push(key.clone());

    let vm = script
        .provision_and_stabilize(ResourceSpec::Compute(ComputeSpec {
            credential_ids: vec![key.id()],
            ..Default::default()
        }))
        .await?;
    outcome.resources.push(vm.clone());

    script
        .expect(&vm, &Expectation::CredentialAttached(key.id()))
        .await?;
    Ok(outcome)
}

async fn compute_set_tags(script: Script) -> HarnessResult<ScenarioOutcome> {
    let mut outcome = ScenarioOutcome::new(ScenarioKind::ComputeSetTags);

    let vm = script.provision_and_stabilize(compute_spec()).await?;
    outcome.resources.push(vm.clone());

    // The marker tag goes away; the name prefix still identifies the guest
    let tags: Vec<String> = SCENARIO_TAGS.iter().map(|t| t.to_string()).collect();
    script.mutate(&vm, Mutation::SetTags(tags)).await?;

    let visible = script
        .wait_for(&vm, &Condition::has_tags(SCENARIO_TAGS), WaitStep::Mutation)
        .await?;
    outcome.notes.push(format!(
        "tags visible after {:?} ({} polls)",
        visible.elapsed, visible.polls
    ));

    script
        .expect(&vm, &Expectation::tags_exactly(SCENARIO_TAGS))
        .await?;

    // Tag writes must not disturb the guest
    script
        .wait_for(&vm, &Condition::no_pending_transactions(), WaitStep::Mutation)
        .await?;
    Ok(outcome)
}
