use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::provider::{ProviderError, ProviderErrorClass, ProviderFuture, ProvisioningService};
use crate::resource::{
    LifecycleState, Mutation, ResourceHandle, ResourceId, ResourceKind, ResourceSnapshot,
    ResourceSpec, TestMarker,
};

const FIRST_RESOURCE_ID: u64 = 1000;
const HOST_DISK_AVAILABLE_MB: u64 = 100 * 1024;
const PENDING_TRANSACTIONS: u32 = 2;

/// How many fetches a simulated resource spends in each transitional state.
///
/// State advances once per `fetch_state` call, not per unit of time, so test
/// outcomes depend only on the number of polls a wait performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationProfile {
    pub provisioning_polls: u32,
    pub pending_transaction_polls: u32,
    pub reboot_polls: u32,
    pub deleting_polls: u32,
    pub credential_visibility_polls: u32,
    pub tag_visibility_polls: u32,
    /// Up to this many extra polls are added to every phase.
    pub jitter_polls: u32,
    pub seed: u64,
    /// Applied to every call before it is served.
    #[serde(with = "duration_millis")]
    pub latency: Duration,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            provisioning_polls: 2,
            pending_transaction_polls: 2,
            reboot_polls: 2,
            deleting_polls: 1,
            credential_visibility_polls: 1,
            tag_visibility_polls: 1,
            jitter_polls: 0,
            seed: 0,
            latency: Duration::ZERO,
        }
    }
}

impl SimulationProfile {
    /// Every resource settles on its first observation.
    pub fn instant() -> Self {
        Self {
            provisioning_polls: 0,
            pending_transaction_polls: 0,
            reboot_polls: 0,
            deleting_polls: 0,
            credential_visibility_polls: 0,
            tag_visibility_polls: 0,
            ..Default::default()
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Default)]
struct FaultState {
    fail_next_fetches: u32,
    fail_next_class: Option<ProviderErrorClass>,
    fail_all_fetches: Option<ProviderErrorClass>,
    hang_fetches: bool,
    reject_creates: bool,
    reject_mutations: bool,
    ignore_reboots: bool,
    stale_reads_after_reboot: u32,
    fail_listing: bool,
    rejected_deletes: HashSet<u64>,
    unacknowledged_deletes: HashSet<u64>,
    stuck_deleting: HashSet<u64>,
}

/// Failure injection for a [`SimulatedProvider`].
#[derive(Debug, Default)]
pub struct SimulatedFaults {
    state: Mutex<FaultState>,
}

impl SimulatedFaults {
    fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` fetches fail with `class`, then fetches recover.
    pub fn fail_next_fetches(&self, count: u32, class: ProviderErrorClass) {
        let mut state = self.lock();
        state.fail_next_fetches = count;
        state.fail_next_class = Some(class);
    }

    pub fn fail_all_fetches(&self, class: ProviderErrorClass) {
        self.lock().fail_all_fetches = Some(class);
    }

    pub fn clear_fetch_failures(&self) {
        let mut state = self.lock();
        state.fail_next_fetches = 0;
        state.fail_next_class = None;
        state.fail_all_fetches = None;
    }

    /// Fetches never complete.
    pub fn hang_fetches(&self, hang: bool) {
        self.lock().hang_fetches = hang;
    }

    pub fn reject_creates(&self, reject: bool) {
        self.lock().reject_creates = reject;
    }

    pub fn reject_mutations(&self, reject: bool) {
        self.lock().reject_mutations = reject;
    }

    /// Reboots are acknowledged but never change state.
    pub fn ignore_reboots(&self, ignore: bool) {
        self.lock().ignore_reboots = ignore;
    }

    /// After each acknowledged reboot, the next `reads` fetches of that
    /// resource still return its pre-reboot snapshot.
    pub fn serve_stale_reads_after_reboot(&self, reads: u32) {
        self.lock().stale_reads_after_reboot = reads;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.lock().fail_listing = fail;
    }

    pub fn reject_delete(&self, id: ResourceId) {
        self.lock().rejected_deletes.insert(id.0);
    }

    /// Deletes of `id` return `false` instead of an error.
    pub fn drop_delete(&self, id: ResourceId) {
        self.lock().unacknowledged_deletes.insert(id.0);
    }

    /// A delete of `id` is accepted but the resource never leaves `Deleting`.
    pub fn stick_in_deleting(&self, id: ResourceId) {
        self.lock().stuck_deleting.insert(id.0);
    }

    pub fn release(&self, id: ResourceId) {
        let mut state = self.lock();
        state.rejected_deletes.remove(&id.0);
        state.unacknowledged_deletes.remove(&id.0);
        state.stuck_deleting.remove(&id.0);
    }

    fn fetch_fault(&self) -> Option<FetchFault> {
        let mut state = self.lock();
        if state.hang_fetches {
            return Some(FetchFault::Hang);
        }
        if let Some(class) = state.fail_all_fetches {
            return Some(FetchFault::Fail(class));
        }
        if state.fail_next_fetches > 0 {
            state.fail_next_fetches -= 1;
            let class = state.fail_next_class.unwrap_or(ProviderErrorClass::Transport);
            return Some(FetchFault::Fail(class));
        }
        None
    }
}

enum FetchFault {
    Hang,
    Fail(ProviderErrorClass),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Provisioning,
    Pending,
    Stable,
    Rebooting,
    Deleting,
    Gone,
}

#[derive(Debug, Clone)]
struct SimulatedResource {
    handle: ResourceHandle,
    phase: Phase,
    // Fetches left in `phase`; `None` means the phase never ends on its own
    remaining: Option<u32>,
    tags: Vec<String>,
    pending_tags: Option<(Vec<String>, u32)>,
    primary_address: String,
    network_vlans: Vec<u32>,
    attached_credentials: Vec<ResourceId>,
    // Snapshot served in place of the real state, and for how many more reads
    stale: Option<(ResourceSnapshot, u32)>,
    history: Vec<LifecycleState>,
}

impl SimulatedResource {
    fn state(&self) -> LifecycleState {
        match self.phase {
            Phase::Provisioning => LifecycleState::Provisioning,
            Phase::Pending => LifecycleState::ActiveWithPendingTransactions {
                count: self.remaining.unwrap_or(PENDING_TRANSACTIONS).max(1),
            },
            Phase::Stable => LifecycleState::Stable,
            Phase::Rebooting => LifecycleState::Rebooting,
            Phase::Deleting => LifecycleState::Deleting,
            Phase::Gone => LifecycleState::Absent,
        }
    }

    fn snapshot(&self) -> ResourceSnapshot {
        let state = self.state();
        let mut snapshot = ResourceSnapshot::new(self.handle.clone(), state);
        snapshot.tags = self.tags.clone();
        snapshot.observed_at = Utc::now();

        if self.handle.kind() == ResourceKind::Compute && state.is_running() {
            snapshot.primary_address = Some(self.primary_address.clone());
            snapshot.network_vlans = self.network_vlans.clone();
            snapshot.attached_credentials = self.attached_credentials.clone();
            snapshot.host_disk_available_mb = Some(HOST_DISK_AVAILABLE_MB);
        }
        snapshot
    }

    fn enter(&mut self, phase: Phase, polls: Option<u32>) {
        self.phase = phase;
        self.remaining = polls;
        let state = self.state();
        if self.history.last() != Some(&state) {
            self.history.push(state);
        }
    }
}

/// In-memory [`ProvisioningService`] with scripted lifecycle progressions and
/// failure injection.
pub struct SimulatedProvider {
    profile: SimulationProfile,
    resources: DashMap<u64, SimulatedResource>,
    histories: DashMap<u64, Vec<LifecycleState>>,
    next_id: AtomicU64,
    rng: Mutex<StdRng>,
    faults: SimulatedFaults,
    create_calls: AtomicU32,
    delete_calls: AtomicU32,
    mutate_calls: AtomicU32,
    fetch_calls: AtomicU32,
}

impl SimulatedProvider {
    pub fn new(profile: SimulationProfile) -> Self {
        let rng = StdRng::seed_from_u64(profile.seed);
        Self {
            profile,
            resources: DashMap::new(),
            histories: DashMap::new(),
            next_id: AtomicU64::new(FIRST_RESOURCE_ID),
            rng: Mutex::new(rng),
            faults: SimulatedFaults::default(),
            create_calls: AtomicU32::new(0),
            delete_calls: AtomicU32::new(0),
            mutate_calls: AtomicU32::new(0),
            fetch_calls: AtomicU32::new(0),
        }
    }

    pub fn profile(&self) -> &SimulationProfile {
        &self.profile
    }

    pub fn faults(&self) -> &SimulatedFaults {
        &self.faults
    }

    /// Whether the service still knows `id` (including while deleting).
    pub fn exists(&self, id: ResourceId) -> bool {
        self.resources.contains_key(&id.0)
    }

    pub fn live_count(&self) -> usize {
        self.resources.len()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn mutate_calls(&self) -> u32 {
        self.mutate_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Every state `id` has entered, in order, including after deletion.
    pub fn history(&self, id: ResourceId) -> Vec<LifecycleState> {
        if let Some(resource) = self.resources.get(&id.0) {
            return resource.history.clone();
        }
        self.histories
            .get(&id.0)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Plant a settled resource stamped with `marker`, as a crashed run would
    /// have left it. Not counted as a create call.
    pub fn seed_orphan(&self, spec: ResourceSpec, marker: &TestMarker) -> ResourceHandle {
        let mut spec = spec;
        marker.apply(&mut spec);
        let handle = self.insert(&spec);
        if let Some(mut resource) = self.resources.get_mut(&handle.id().0) {
            resource.enter(Phase::Stable, None);
        }
        info!("Seeded orphan {handle}");
        handle
    }

    fn insert(&self, spec: &ResourceSpec) -> ResourceHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = ResourceHandle::new(spec.kind(), ResourceId(id), spec.name());
        let attached_credentials = match spec {
            ResourceSpec::Compute(compute) => compute.credential_ids.clone(),
            ResourceSpec::Credential(_) => Vec::new(),
        };

        let mut resource = SimulatedResource {
            handle: handle.clone(),
            phase: Phase::Provisioning,
            remaining: None,
            tags: spec.tags().to_vec(),
            pending_tags: None,
            primary_address: format!("10.{}.{}.{}", (id >> 16) & 0xff, (id >> 8) & 0xff, id & 0xff),
            network_vlans: vec![1100 + (id % 7) as u32, 1200 + (id % 5) as u32],
            attached_credentials,
            stale: None,
            history: Vec::new(),
        };

        let polls = match spec.kind() {
            ResourceKind::Compute => self.profile.provisioning_polls,
            ResourceKind::Credential => self.profile.credential_visibility_polls,
        };
        resource.enter(Phase::Provisioning, Some(self.with_jitter(polls)));
        self.resources.insert(id, resource);
        handle
    }

    fn with_jitter(&self, polls: u32) -> u32 {
        if self.profile.jitter_polls == 0 {
            return polls;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        polls + rng.gen_range(0..=self.profile.jitter_polls)
    }

    /// Follow-up phase once `phase` has run its course.
    fn successor(&self, kind: ResourceKind, phase: Phase) -> (Phase, Option<u32>) {
        match (kind, phase) {
            (ResourceKind::Compute, Phase::Provisioning | Phase::Rebooting) => (
                Phase::Pending,
                Some(self.with_jitter(self.profile.pending_transaction_polls)),
            ),
            (_, Phase::Deleting) => (Phase::Gone, None),
            _ => (Phase::Stable, None),
        }
    }

    /// Report the current state, then count this observation against it.
    fn observe(&self, handle: &ResourceHandle) -> ResourceSnapshot {
        let Some(mut resource) = self.resources.get_mut(&handle.id().0) else {
            return ResourceSnapshot::absent(handle.clone());
        };
        if resource.handle.kind() != handle.kind() {
            return ResourceSnapshot::absent(handle.clone());
        }

        if let Some((snapshot, reads)) = resource.stale.take() {
            if reads > 0 {
                resource.stale = Some((snapshot.clone(), reads - 1));
                return snapshot;
            }
        }

        // Zero-length phases are never observed
        while resource.remaining == Some(0) {
            let (next, polls) = self.successor(handle.kind(), resource.phase);
            resource.enter(next, polls);
        }
        if let Some((_, 0)) = resource.pending_tags {
            if let Some((tags, _)) = resource.pending_tags.take() {
                resource.tags = tags;
            }
        }

        let snapshot = resource.snapshot();

        if let Some(remaining) = resource.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        if let Some((_, remaining)) = resource.pending_tags.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }

        let gone = resource.phase == Phase::Gone
            || (resource.phase == Phase::Deleting && resource.remaining == Some(0));
        let history = resource.history.clone();
        drop(resource);

        if gone {
            self.resources.remove(&handle.id().0);
            let mut history = history;
            if history.last() != Some(&LifecycleState::Absent) {
                history.push(LifecycleState::Absent);
            }
            self.histories.insert(handle.id().0, history);
            debug!("{handle} removed");
        }
        snapshot
    }

    fn is_credential_in_use(&self, id: ResourceId) -> bool {
        self.resources.iter().any(|entry| {
            entry.handle.kind() == ResourceKind::Compute && entry.attached_credentials.contains(&id)
        })
    }

    async fn simulate_latency(&self) {
        if !self.profile.latency.is_zero() {
            tokio::time::sleep(self.profile.latency).await;
        }
    }

    fn apply_mutation(
        &self,
        handle: &ResourceHandle,
        mutation: &Mutation,
    ) -> Result<bool, ProviderError> {
        if self.faults.lock().reject_mutations {
            return Err(ProviderError::rejected(format!(
                "{} refused by simulated fault",
                mutation.name()
            )));
        }

        if let Mutation::AttachCredential(credential) = mutation {
            let known = self
                .resources
                .get(&credential.0)
                .is_some_and(|c| c.handle.kind() == ResourceKind::Credential);
            if !known {
                return Err(ProviderError::not_found(format!("credential {credential}")));
            }
        }

        let tag_visibility = self.with_jitter(self.profile.tag_visibility_polls);
        let reboot_polls = self.with_jitter(self.profile.reboot_polls);
        let (ignore_reboots, stale_reads) = {
            let faults = self.faults.lock();
            (faults.ignore_reboots, faults.stale_reads_after_reboot)
        };

        let mut resource = self
            .resources
            .get_mut(&handle.id().0)
            .filter(|r| r.handle.kind() == handle.kind())
            .ok_or_else(|| ProviderError::not_found(format!("{handle}")))?;

        if matches!(resource.phase, Phase::Deleting | Phase::Gone) {
            return Err(ProviderError::not_found(format!("{handle} is being deleted")));
        }

        match mutation {
            Mutation::RebootSoft | Mutation::RebootHard => {
                if !resource.state().is_running() {
                    return Err(ProviderError::rejected(format!(
                        "{handle} is {} and cannot be rebooted",
                        resource.state()
                    )));
                }
                if stale_reads > 0 {
                    let stale = resource.snapshot();
                    resource.stale = Some((stale, stale_reads));
                }
                if !ignore_reboots {
                    resource.enter(Phase::Rebooting, Some(reboot_polls));
                }
            }
            Mutation::SetTags(tags) => {
                resource.pending_tags = Some((tags.clone(), tag_visibility));
            }
            Mutation::AttachCredential(credential) => {
                if !resource.attached_credentials.contains(credential) {
                    resource.attached_credentials.push(*credential);
                }
            }
        }
        Ok(true)
    }

    fn apply_delete(&self, handle: &ResourceHandle) -> Result<bool, ProviderError> {
        let (rejected, unacknowledged, stuck) = {
            let faults = self.faults.lock();
            let id = handle.id().0;
            (
                faults.rejected_deletes.contains(&id),
                faults.unacknowledged_deletes.contains(&id),
                faults.stuck_deleting.contains(&id),
            )
        };

        if rejected {
            return Err(ProviderError::rejected(format!("delete of {handle} refused")));
        }
        if unacknowledged {
            return Ok(false);
        }

        if handle.kind() == ResourceKind::Credential && self.is_credential_in_use(handle.id()) {
            return Err(ProviderError::rejected(format!(
                "{handle} is still attached to a compute resource"
            )));
        }

        let deleting_polls = if stuck {
            None
        } else {
            Some(self.with_jitter(self.profile.deleting_polls))
        };

        let mut resource = self
            .resources
            .get_mut(&handle.id().0)
            .filter(|r| r.handle.kind() == handle.kind())
            .ok_or_else(|| ProviderError::not_found(format!("{handle}")))?;

        resource.stale = None;
        // A repeated delete restarts a stalled deletion
        if resource.phase != Phase::Deleting || resource.remaining.is_none() {
            resource.enter(Phase::Deleting, deleting_polls);
        }
        Ok(true)
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(SimulationProfile::default())
    }
}

impl ProvisioningService for SimulatedProvider {
    fn create_resource<'a>(&'a self, spec: &'a ResourceSpec) -> ProviderFuture<'a, ResourceHandle> {
        Box::pin(async move {
            self.simulate_latency().await;
            self.create_calls.fetch_add(1, Ordering::SeqCst);

            if self.faults.lock().reject_creates {
                return Err(ProviderError::rejected(format!(
                    "create of `{}` refused by simulated fault",
                    spec.name()
                )));
            }

            if let ResourceSpec::Compute(compute) = spec {
                for credential in &compute.credential_ids {
                    let known = self
                        .resources
                        .get(&credential.0)
                        .is_some_and(|c| c.handle.kind() == ResourceKind::Credential);
                    if !known {
                        return Err(ProviderError::rejected(format!(
                            "unknown credential {credential}"
                        )));
                    }
                }
            }

            Ok(self.insert(spec))
        })
    }

    fn delete_resource<'a>(&'a self, handle: &'a ResourceHandle) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            self.simulate_latency().await;
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            self.apply_delete(handle)
        })
    }

    fn fetch_state<'a>(&'a self, handle: &'a ResourceHandle) -> ProviderFuture<'a, ResourceSnapshot> {
        Box::pin(async move {
            self.simulate_latency().await;
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);

            match self.faults.fetch_fault() {
                Some(FetchFault::Hang) => futures::future::pending::<()>().await,
                Some(FetchFault::Fail(class)) => {
                    return Err(ProviderError::new(
                        class,
                        format!("simulated {class} failure reading {handle}"),
                    ));
                }
                None => {}
            }

            Ok(self.observe(handle))
        })
    }

    fn mutate<'a>(
        &'a self,
        handle: &'a ResourceHandle,
        mutation: &'a Mutation,
    ) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            self.simulate_latency().await;
            self.mutate_calls.fetch_add(1, Ordering::SeqCst);
            self.apply_mutation(handle, mutation)
        })
    }

    fn list_by_marker<'a>(
        &'a self,
        marker: &'a TestMarker,
    ) -> ProviderFuture<'a, Vec<ResourceHandle>> {
        Box::pin(async move {
            self.simulate_latency().await;

            if self.faults.lock().fail_listing {
                return Err(ProviderError::transport("listing refused by simulated fault"));
            }

            Ok(self
                .resources
                .iter()
                .filter(|entry| marker.matches(entry.handle.name(), &entry.tags))
                .map(|entry| entry.handle.clone())
                .collect())
        })
    }
}
