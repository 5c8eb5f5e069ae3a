use chrono::Utc;
use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::condition::{Condition, Expectation};
use crate::config::{HarnessConfig, WaitStep};
use crate::error::{HarnessError, HarnessResult};
use crate::provider::{ProviderErrorClass, ProvisioningService};
use crate::registry::TestResourceRegistry;
use crate::resource::{
    Mutation, MutationAck, RebootKind, ResourceHandle, ResourceKind, ResourceSnapshot,
    ResourceSpec, TestMarker,
};
use crate::waiter::{PollingWaiter, WaitOutcome, WaitSpec};

/// Drives lifecycle steps against the provisioning service.
///
/// Every operation is one step of a lifecycle script: it either issues exactly
/// one state-changing call, or waits, or reads. Steps never run concurrently
/// within a script; independent scripts may share one orchestrator (it is cheap
/// to clone) and coordinate only through the registry.
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    provider: Arc<dyn ProvisioningService>,
    registry: Arc<TestResourceRegistry>,
    config: Arc<HarnessConfig>,
    marker: TestMarker,
    waiter: PollingWaiter,
}

/// Result of a single read-only verification.
#[derive(Debug, Clone)]
pub struct Verification {
    pub expectation: Expectation,
    pub satisfied: bool,
    pub mismatch: Option<String>,
    pub snapshot: ResourceSnapshot,
}

#[derive(Debug, Clone)]
pub struct RebootReport {
    pub kind: RebootKind,
    pub ack: MutationAck,
    /// The wait for the first non-stable read; `None` if only `Stable` was
    /// read for the whole reboot timeout.
    pub departed: Option<WaitOutcome>,
    pub running: WaitOutcome,
    pub settled: WaitOutcome,
}

impl RebootReport {
    /// Whether any non-stable state was observed after the reboot was
    /// acknowledged. False means the reboot may have been masked: the resource
    /// reported stable throughout.
    pub fn left_stable(&self) -> bool {
        self.departed.is_some()
            || self
                .running
                .observed_states
                .iter()
                .chain(self.settled.observed_states.iter())
                .any(|state| !state.is_stable())
    }

    pub fn elapsed(&self) -> Duration {
        self.departed.as_ref().map_or(Duration::ZERO, |d| d.elapsed)
            + self.running.elapsed
            + self.settled.elapsed
    }

    pub fn polls(&self) -> u32 {
        self.departed.as_ref().map_or(0, |d| d.polls) + self.running.polls + self.settled.polls
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrphanSweepReport {
    pub discovered: Vec<ResourceHandle>,
    pub reclaimed: Vec<ResourceHandle>,
    pub skipped: Vec<ResourceHandle>,
    pub failures: Vec<HarnessError>,
}

impl LifecycleOrchestrator {
    pub fn new(
        provider: Arc<dyn ProvisioningService>,
        registry: Arc<TestResourceRegistry>,
        config: HarnessConfig,
        cancel: CancelToken,
    ) -> HarnessResult<Self> {
        config.validate()?;
        let waiter = PollingWaiter::new(cancel, config.fetch_timeout());
        Ok(Self {
            provider,
            registry,
            marker: config.marker(),
            config: Arc::new(config),
            waiter,
        })
    }

    pub fn registry(&self) -> &Arc<TestResourceRegistry> {
        &self.registry
    }

    pub fn provider(&self) -> &Arc<dyn ProvisioningService> {
        &self.provider
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn marker(&self) -> &TestMarker {
        &self.marker
    }

    /// Stamp the run marker, create the resource, and register it before any
    /// wait so it is tracked even if stabilization never completes.
    pub async fn create_and_register(&self, spec: ResourceSpec) -> HarnessResult<ResourceHandle> {
        let mut spec = spec;
        self.marker.apply(&mut spec);

        info!("Creating {} `{}`", spec.kind(), spec.name());
        let handle = self
            .provider
            .create_resource(&spec)
            .await
            .map_err(|source| {
                error!("Creating {} `{}` failed: {source}", spec.kind(), spec.name());
                HarnessError::ProvisionFailed {
                    kind: spec.kind(),
                    name: spec.name().to_string(),
                    source,
                }
            })?;

        self.registry.register(handle.clone());
        info!("Created {handle}");
        Ok(handle)
    }

    /// Wait until a freshly created resource is usable: compute must first be
    /// running and then have no pending transactions; credentials must be
    /// visible. Timeouts and fetch exhaustion surface as `StabilizeTimeout`.
    pub async fn stabilize(&self, handle: &ResourceHandle) -> HarnessResult<()> {
        let result = match handle.kind() {
            ResourceKind::Compute => self.await_settled(handle, WaitStep::Provision).await.map(|_| ()),
            ResourceKind::Credential => self
                .wait_for(handle, &Condition::present(), WaitStep::Credential)
                .await
                .map(|_| ()),
        };

        result.map_err(|cause| stabilize_failure(handle, cause))
    }

    pub async fn provision_and_stabilize(&self, spec: ResourceSpec) -> HarnessResult<ResourceHandle> {
        let handle = self.create_and_register(spec).await?;
        self.stabilize(&handle).await?;
        Ok(handle)
    }

    /// Create and wait only for `running`, leaving background transactions
    /// unsettled.
    pub async fn provision_and_await_running(
        &self,
        spec: ResourceSpec,
    ) -> HarnessResult<ResourceHandle> {
        let handle = self.create_and_register(spec).await?;
        self.wait_for(&handle, &Condition::running(), WaitStep::Provision)
            .await
            .map_err(|cause| stabilize_failure(&handle, cause))?;
        Ok(handle)
    }

    pub async fn wait_for(
        &self,
        handle: &ResourceHandle,
        condition: &Condition,
        step: WaitStep,
    ) -> HarnessResult<WaitOutcome> {
        let spec = self.config.wait_spec(step)?;
        self.wait_with_spec(handle, condition, &spec).await
    }

    pub async fn wait_with_spec(
        &self,
        handle: &ResourceHandle,
        condition: &Condition,
        spec: &WaitSpec,
    ) -> HarnessResult<WaitOutcome> {
        let provider: &dyn ProvisioningService = self.provider.as_ref();
        self.waiter
            .await_condition(handle, move || provider.fetch_state(handle), condition, spec)
            .await
    }

    /// `running`, then `no pending transactions`, as two sequential waits.
    /// A single combined condition could be satisfied by a snapshot taken
    /// before a reboot ever started.
    pub async fn await_settled(
        &self,
        handle: &ResourceHandle,
        step: WaitStep,
    ) -> HarnessResult<(WaitOutcome, WaitOutcome)> {
        let running = self.wait_for(handle, &Condition::running(), step).await?;
        let settled = self
            .wait_for(handle, &Condition::no_pending_transactions(), step)
            .await?;
        Ok((running, settled))
    }

    /// Issue one state-changing call and return its acknowledgement. Does not
    /// wait for convergence and never retries.
    pub async fn mutate(
        &self,
        handle: &ResourceHandle,
        mutation: Mutation,
    ) -> HarnessResult<MutationAck> {
        let failed = |reason: String| HarnessError::MutationFailed {
            kind: handle.kind(),
            id: handle.id(),
            mutation: mutation.name().to_string(),
            reason,
        };

        if !mutation.applies_to(handle.kind()) {
            return Err(failed(format!("not supported for {}", handle.kind())));
        }

        info!("Issuing {} on {handle}", mutation.name());
        match self.provider.mutate(handle, &mutation).await {
            Ok(true) => {
                info!("{} on {handle} acknowledged", mutation.name());
                Ok(MutationAck {
                    handle: handle.clone(),
                    mutation: mutation.name(),
                    acknowledged_at: Utc::now(),
                })
            }
            Ok(false) => {
                warn!("{} on {handle} was not acknowledged", mutation.name());
                Err(failed("service did not acknowledge the call".to_string()))
            }
            Err(e) => {
                warn!("{} on {handle} failed: {e}", mutation.name());
                Err(failed(e.to_string()))
            }
        }
    }

    pub async fn reboot_and_settle(
        &self,
        handle: &ResourceHandle,
        kind: RebootKind,
    ) -> HarnessResult<RebootReport> {
        let ack = self.mutate(handle, kind.into()).await?;

        // Reads may lag the acknowledgement; stale `Stable` reads must not
        // satisfy the settle waits
        let departed = match self
            .wait_for(handle, &Condition::left_stable(), WaitStep::Reboot)
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(HarnessError::Timeout { elapsed, polls, .. }) => {
                warn!("{handle} still read as stable {elapsed:?} ({polls} polls) after {kind} reboot");
                None
            }
            Err(e) => return Err(e),
        };
        let (running, settled) = self.await_settled(handle, WaitStep::Reboot).await?;

        let report = RebootReport {
            kind,
            ack,
            departed,
            running,
            settled,
        };
        if !report.left_stable() {
            warn!("{kind} reboot of {handle} settled without any non-stable state being observed");
        }
        Ok(report)
    }

    /// One read-only fetch compared against `expectation`. Never mutates.
    pub async fn observe(
        &self,
        handle: &ResourceHandle,
        expectation: &Expectation,
    ) -> HarnessResult<Verification> {
        let snapshot = self
            .provider
            .fetch_state(handle)
            .await
            .map_err(|source| {
                warn!("Reading {handle} for {expectation} failed: {source}");
                HarnessError::ReadFailed {
                    kind: handle.kind(),
                    id: handle.id(),
                    expectation: expectation.to_string(),
                    source,
                }
            })?;

        let mismatch = expectation.check(&snapshot).err();
        match &mismatch {
            None => info!("{handle}: {expectation} holds"),
            Some(reason) => warn!("{handle}: expected {expectation}, but {reason}"),
        }

        Ok(Verification {
            expectation: expectation.clone(),
            satisfied: mismatch.is_none(),
            mismatch,
            snapshot,
        })
    }

    pub async fn verify_observable(
        &self,
        handle: &ResourceHandle,
        expectation: &Expectation,
    ) -> HarnessResult<bool> {
        Ok(self.observe(handle, expectation).await?.satisfied)
    }

    /// Like [`verify_observable`](Self::verify_observable), but an unmet
    /// expectation is an error.
    pub async fn expect(&self, handle: &ResourceHandle, expectation: &Expectation) -> HarnessResult<()> {
        let verification = self.observe(handle, expectation).await?;
        match verification.mismatch {
            None => Ok(()),
            Some(mismatch) => Err(HarnessError::ExpectationUnmet {
                kind: handle.kind(),
                id: handle.id(),
                expectation: expectation.to_string(),
                mismatch,
            }),
        }
    }

    /// Delete, then wait for absence. The handle leaves the registry only once
    /// absence is confirmed; any failure keeps it for a later sweep.
    pub async fn reclaim(&self, handle: &ResourceHandle) -> HarnessResult<()> {
        info!("Reclaiming {handle}");
        match self.provider.delete_resource(handle).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Delete of {handle} was not acknowledged");
                return Err(HarnessError::MutationFailed {
                    kind: handle.kind(),
                    id: handle.id(),
                    mutation: "delete".to_string(),
                    reason: "service did not acknowledge the call".to_string(),
                });
            }
            Err(e) if e.class == ProviderErrorClass::NotFound => {
                info!("{handle} already gone on delete: {e}");
            }
            Err(e) => {
                warn!("Delete of {handle} failed: {e}");
                return Err(HarnessError::MutationFailed {
                    kind: handle.kind(),
                    id: handle.id(),
                    mutation: "delete".to_string(),
                    reason: e.to_string(),
                });
            }
        }

        match self.wait_for(handle, &Condition::absent(), WaitStep::Delete).await {
            Ok(_) => {
                self.registry.unregister(handle);
                info!("Reclaimed {handle}");
                Ok(())
            }
            Err(cause) => {
                warn!("Absence of {handle} not confirmed: {cause}");
                Err(HarnessError::ReclaimFailed {
                    kind: handle.kind(),
                    id: handle.id(),
                    cause: Box::new(cause),
                })
            }
        }
    }

    /// Reclaim everything still registered. Returns every failure.
    pub async fn sweep(&self) -> Vec<HarnessError> {
        self.registry
            .sweep(|handle| {
                let orchestrator = self.clone();
                async move { orchestrator.reclaim(&handle).await }
            })
            .await
    }

    /// Find resources carrying `marker` that this run does not track (left
    /// behind by a crashed run) and reclaim them. `kind` narrows the sweep.
    pub async fn reclaim_orphans(
        &self,
        marker: &TestMarker,
        kind: Option<ResourceKind>,
    ) -> HarnessResult<OrphanSweepReport> {
        let discovered = self
            .registry
            .discover_orphans(self.provider.as_ref(), marker)
            .await?;

        let mut report = OrphanSweepReport {
            discovered: discovered.clone(),
            ..Default::default()
        };

        for handle in discovered {
            if kind.is_some_and(|k| k != handle.kind()) || self.registry.contains(&handle) {
                report.skipped.push(handle);
                continue;
            }

            self.registry.register(handle.clone());
            match self.reclaim(&handle).await {
                Ok(()) => report.reclaimed.push(handle),
                Err(e) => report.failures.push(e),
            }
        }

        info!(
            "Orphan sweep for {marker}: {} reclaimed, {} skipped, {} failed",
            report.reclaimed.len(),
            report.skipped.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Run `body` as one lifecycle script. Whatever the body returns, every
    /// resource created through its [`Script`] that is still registered is
    /// reclaimed afterwards.
    pub async fn run_script<T, F, Fut>(&self, name: &str, body: F) -> ScriptReport<T>
    where
        F: FnOnce(Script) -> Fut,
        Fut: Future<Output = HarnessResult<T>>,
    {
        let script = Script {
            name: Arc::from(name),
            orchestrator: self.clone(),
            owned: Arc::new(Mutex::new(Vec::new())),
        };

        info!("Script `{name}` started");
        let started = Instant::now();
        let result = body(script.clone()).await;
        if let Err(e) = &result {
            error!("Script `{name}` aborted: {e}");
        }

        let cleanup_errors = script.teardown().await;
        let elapsed = started.elapsed();
        info!(
            "Script `{name}` finished in {elapsed:?} ({}, {} cleanup failure(s))",
            if result.is_ok() { "passed" } else { "failed" },
            cleanup_errors.len()
        );

        ScriptReport {
            name: name.to_string(),
            result,
            cleanup_errors,
            elapsed,
        }
    }
}

fn stabilize_failure(handle: &ResourceHandle, cause: HarnessError) -> HarnessError {
    match cause {
        HarnessError::Timeout { .. } | HarnessError::FetchExhausted { .. } => {
            HarnessError::StabilizeTimeout {
                kind: handle.kind(),
                id: handle.id(),
                cause: Box::new(cause),
            }
        }
        other => other,
    }
}

/// Scope of one running script. Resources created through it are reclaimed
/// when the script ends, in reverse creation order.
#[derive(Clone)]
pub struct Script {
    name: Arc<str>,
    orchestrator: LifecycleOrchestrator,
    owned: Arc<Mutex<Vec<ResourceHandle>>>,
}

impl Script {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn orchestrator(&self) -> &LifecycleOrchestrator {
        &self.orchestrator
    }

    pub async fn create(&self, spec: ResourceSpec) -> HarnessResult<ResourceHandle> {
        let handle = self.orchestrator.create_and_register(spec).await?;
        self.owned.lock().await.push(handle.clone());
        Ok(handle)
    }

    pub async fn provision_and_stabilize(&self, spec: ResourceSpec) -> HarnessResult<ResourceHandle> {
        let handle = self.create(spec).await?;
        self.orchestrator.stabilize(&handle).await?;
        Ok(handle)
    }

    pub async fn provision_and_await_running(
        &self,
        spec: ResourceSpec,
    ) -> HarnessResult<ResourceHandle> {
        let handle = self.create(spec).await?;
        self.orchestrator
            .wait_for(&handle, &Condition::running(), WaitStep::Provision)
            .await
            .map_err(|cause| stabilize_failure(&handle, cause))?;
        Ok(handle)
    }

    pub async fn wait_for(
        &self,
        handle: &ResourceHandle,
        condition: &Condition,
        step: WaitStep,
    ) -> HarnessResult<WaitOutcome> {
        self.orchestrator.wait_for(handle, condition, step).await
    }

    pub async fn mutate(
        &self,
        handle: &ResourceHandle,
        mutation: Mutation,
    ) -> HarnessResult<MutationAck> {
        self.orchestrator.mutate(handle, mutation).await
    }

    pub async fn reboot_and_settle(
        &self,
        handle: &ResourceHandle,
        kind: RebootKind,
    ) -> HarnessResult<RebootReport> {
        self.orchestrator.reboot_and_settle(handle, kind).await
    }

    pub async fn verify_observable(
        &self,
        handle: &ResourceHandle,
        expectation: &Expectation,
    ) -> HarnessResult<bool> {
        self.orchestrator.verify_observable(handle, expectation).await
    }

    pub async fn expect(&self, handle: &ResourceHandle, expectation: &Expectation) -> HarnessResult<()> {
        self.orchestrator.expect(handle, expectation).await
    }

    pub async fn reclaim(&self, handle: &ResourceHandle) -> HarnessResult<()> {
        self.orchestrator.reclaim(handle).await
    }

    /// Handles created through this script so far.
    pub async fn owned(&self) -> Vec<ResourceHandle> {
        self.owned.lock().await.clone()
    }

    async fn teardown(&self) -> Vec<HarnessError> {
        let owned = self.owned.lock().await.clone();
        let mut errors = Vec::new();

        for handle in owned.iter().rev() {
            if !self.orchestrator.registry.contains(handle) {
                continue;
            }
            warn!("Script `{}` left {handle} behind, reclaiming", self.name);
            if let Err(e) = self.orchestrator.reclaim(handle).await {
                errors.push(e);
            }
        }

        errors
    }
}

/// Outcome of one script: the body's result plus any teardown failures.
#[derive(Debug)]
pub struct ScriptReport<T> {
    pub name: String,
    pub result: HarnessResult<T>,
    pub cleanup_errors: Vec<HarnessError>,
    pub elapsed: Duration,
}

impl<T> ScriptReport<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok() && self.cleanup_errors.is_empty()
    }

    pub fn summary(&self) -> String {
        let status = match (&self.result, self.cleanup_errors.is_empty()) {
            (Ok(_), true) => "PASS".to_string(),
            (Ok(_), false) => "FAIL (cleanup)".to_string(),
            (Err(e), _) => format!("FAIL: {e}"),
        };
        let mut line = format!("{:<28} {:>10.1?}  {status}", self.name, self.elapsed);
        for e in &self.cleanup_errors {
            line.push_str(&format!("\n    cleanup: {e}"));
        }
        line
    }
}
