pub mod cancel;
pub mod condition;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod resource;
pub mod scenarios;
pub mod simulator;
pub mod waiter;

#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use cancel::{CancelHandle, CancelToken};
pub use condition::{Condition, Expectation};
pub use config::{HarnessConfig, WaitStep};
pub use error::{HarnessError, HarnessResult};
pub use orchestrator::{
    LifecycleOrchestrator, OrphanSweepReport, RebootReport, Script, ScriptReport, Verification,
};
pub use provider::{ProviderError, ProviderErrorClass, ProvisioningService};
pub use registry::TestResourceRegistry;
pub use resource::{
    LifecycleState, Mutation, RebootKind, ResourceHandle, ResourceId, ResourceKind,
    ResourceSnapshot, ResourceSpec, TestMarker,
};
pub use waiter::{PollingWaiter, WaitOutcome, WaitSpec};

// Default timeouts, in seconds
pub const DEFAULT_PROVISION_TIMEOUT_SECS: u64 = 35 * 60;
pub const DEFAULT_REBOOT_TIMEOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_CREDENTIAL_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_MUTATION_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 5;

// Marker convention
pub const DEFAULT_MARKER_PREFIX: &str = "lifecycle-harness";
pub const MARKER_SEPARATOR: char = '-';
