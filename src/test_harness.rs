use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

// Default configuration constants
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 50;
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MARKER_PREFIX: &str = "harness-test";

use crate::cancel::CancelHandle;
use crate::config::HarnessConfig;
use crate::orchestrator::LifecycleOrchestrator;
use crate::registry::TestResourceRegistry;
use crate::resource::{
    ComputeSpec, CredentialSpec, LifecycleState, ResourceHandle, ResourceId, ResourceSpec,
    TestMarker,
};
use crate::simulator::{SimulatedProvider, SimulationProfile};

/// Orchestrator wired to an in-memory provider, for exercising lifecycle
/// scripts without a real provisioning service.
pub struct HarnessTestEnvironment {
    pub provider: Arc<SimulatedProvider>,
    pub registry: Arc<TestResourceRegistry>,
    pub orchestrator: LifecycleOrchestrator,
    pub cancel: CancelHandle,
    config: HarnessTestConfig,
}

impl HarnessTestEnvironment {
    /// Creates a new test environment with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(HarnessTestConfig::default())
    }

    /// Creates a new test environment with custom configuration.
    ///
    /// This allows you to override timeouts, the poll cadence, and the
    /// simulated service's behavior.
    pub fn with_config(config: HarnessTestConfig) -> Result<Self> {
        let provider = Arc::new(SimulatedProvider::new(config.profile.clone()));
        Self::with_provider(config, provider)
    }

    /// Builds an environment around an existing provider, e.g. to simulate a
    /// second run against the same service.
    pub fn with_provider(config: HarnessTestConfig, provider: Arc<SimulatedProvider>) -> Result<Self> {
        let registry = Arc::new(TestResourceRegistry::new());
        let cancel = CancelHandle::new();
        let orchestrator = LifecycleOrchestrator::new(
            provider.clone(),
            registry.clone(),
            config.harness_config(),
            cancel.token(),
        )?;

        log::info!(
            "Test environment ready (marker {}, poll every {}ms)",
            orchestrator.marker(),
            config.poll_interval_ms
        );

        Ok(Self {
            provider,
            registry,
            orchestrator,
            cancel,
            config,
        })
    }

    pub fn config(&self) -> &HarnessTestConfig {
        &self.config
    }

    pub fn marker(&self) -> &TestMarker {
        self.orchestrator.marker()
    }

    /// Reads the current simulated state without going through a waiter.
    pub async fn current_state(&self, handle: &ResourceHandle) -> Result<LifecycleState> {
        use crate::provider::ProvisioningService;
        Ok(self.provider.fetch_state(handle).await?.state)
    }

    /// Resources the simulated service still knows about under this run's marker.
    pub async fn remote_leftovers(&self) -> Result<Vec<ResourceHandle>> {
        let found = self
            .registry
            .discover_orphans(self.provider.as_ref(), &self.marker().widen())
            .await?;
        Ok(found)
    }

    /// Reclaims everything still registered and returns how many failures remained.
    pub async fn shutdown(&self) -> usize {
        log::info!("Test environment shutdown initiated");
        let failures = self.orchestrator.sweep().await;
        for failure in &failures {
            log::warn!("Teardown left a resource behind: {failure}");
        }
        failures.len()
    }
}

/// Configuration for a [`HarnessTestEnvironment`].
#[derive(Debug, Clone)]
pub struct HarnessTestConfig {
    pub poll_interval_ms: u64,
    pub fetch_timeout_ms: u64,
    pub wait_timeout_secs: u64,
    pub marker_prefix: String,
    pub run_label: String,
    pub profile: SimulationProfile,
}

impl Default for HarnessTestConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
            marker_prefix: DEFAULT_MARKER_PREFIX.to_string(),
            run_label: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            profile: SimulationProfile::default(),
        }
    }
}

impl HarnessTestConfig {
    pub fn with_profile(profile: SimulationProfile) -> Self {
        Self {
            profile,
            ..Default::default()
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Every step shares one short timeout.
    pub fn harness_config(&self) -> HarnessConfig {
        HarnessConfig {
            provision_timeout_secs: self.wait_timeout_secs,
            reboot_timeout_secs: self.wait_timeout_secs,
            mutation_timeout_secs: self.wait_timeout_secs,
            delete_timeout_secs: self.wait_timeout_secs,
            credential_timeout_secs: self.wait_timeout_secs,
            poll_interval_ms: Some(self.poll_interval_ms),
            fetch_timeout_ms: Some(self.fetch_timeout_ms),
            marker_prefix: self.marker_prefix.clone(),
            run_label: self.run_label.clone(),
            ..Default::default()
        }
    }
}

/// Helper functions to build creation requests.
pub struct TestSpecs;

impl TestSpecs {
    pub fn compute() -> ResourceSpec {
        ResourceSpec::Compute(ComputeSpec::default())
    }

    pub fn compute_named(hostname: &str) -> ResourceSpec {
        ResourceSpec::Compute(ComputeSpec {
            hostname: hostname.to_string(),
            ..Default::default()
        })
    }

    pub fn compute_with_credential(credential: ResourceId) -> ResourceSpec {
        ResourceSpec::Compute(ComputeSpec {
            credential_ids: vec![credential],
            ..Default::default()
        })
    }

    pub fn credential() -> ResourceSpec {
        ResourceSpec::Credential(CredentialSpec::generated("key"))
    }

    pub fn credential_named(label: &str) -> ResourceSpec {
        ResourceSpec::Credential(CredentialSpec::generated(label))
    }
}
