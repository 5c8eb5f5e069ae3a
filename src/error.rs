use std::time::Duration;
use thiserror::Error;

use crate::provider::ProviderError;
use crate::resource::{LifecycleState, ResourceId, ResourceKind, ResourceSnapshot};

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Failures of lifecycle steps. Every resource-scoped variant names the
/// resource, the condition or call involved, and what was last seen, so a
/// failure can be diagnosed from the message alone.
#[derive(Debug, Clone, Error)]
pub enum HarnessError {
    #[error("creating {kind} `{name}` failed: {source}")]
    ProvisionFailed {
        kind: ResourceKind,
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("{kind} {id} never stabilized: {cause}")]
    StabilizeTimeout {
        kind: ResourceKind,
        id: ResourceId,
        cause: Box<HarnessError>,
    },

    #[error(
        "{kind} {id}: no successful read while waiting for `{condition}` \
         ({attempts} attempts over {elapsed:?}); last error: {last_error}"
    )]
    FetchExhausted {
        kind: ResourceKind,
        id: ResourceId,
        condition: String,
        elapsed: Duration,
        attempts: u32,
        last_error: ProviderError,
    },

    #[error(
        "{kind} {id}: timed out after {elapsed:?} waiting for `{condition}` \
         ({polls} polls); last observed state: {}{}",
        describe_state(.last_snapshot.as_deref()),
        describe_error(.last_error.as_ref())
    )]
    Timeout {
        kind: ResourceKind,
        id: ResourceId,
        condition: String,
        elapsed: Duration,
        polls: u32,
        last_snapshot: Option<Box<ResourceSnapshot>>,
        last_error: Option<ProviderError>,
    },

    #[error(
        "{kind} {id}: wait for `{condition}` cancelled after {elapsed:?}; last observed state: {}",
        describe_state(.last_snapshot.as_deref())
    )]
    Cancelled {
        kind: ResourceKind,
        id: ResourceId,
        condition: String,
        elapsed: Duration,
        last_snapshot: Option<Box<ResourceSnapshot>>,
    },

    #[error("{kind} {id}: read for `{expectation}` failed: {source}")]
    ReadFailed {
        kind: ResourceKind,
        id: ResourceId,
        expectation: String,
        #[source]
        source: ProviderError,
    },

    #[error("{kind} {id}: {mutation} failed: {reason}")]
    MutationFailed {
        kind: ResourceKind,
        id: ResourceId,
        mutation: String,
        reason: String,
    },

    #[error("{kind} {id}: delete issued but absence not confirmed: {cause}")]
    ReclaimFailed {
        kind: ResourceKind,
        id: ResourceId,
        cause: Box<HarnessError>,
    },

    #[error("{kind} {id}: expected {expectation}, but {mismatch}")]
    ExpectationUnmet {
        kind: ResourceKind,
        id: ResourceId,
        expectation: String,
        mismatch: String,
    },

    #[error("listing resources marked `{marker}` failed: {source}")]
    DiscoveryFailed {
        marker: String,
        #[source]
        source: ProviderError,
    },

    #[error("invalid wait spec: {0}")]
    InvalidWaitSpec(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl HarnessError {
    /// Whether this failure aborts the remaining steps of a script.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ReclaimFailed { .. } | Self::DiscoveryFailed { .. })
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::StabilizeTimeout { cause, .. } | Self::ReclaimFailed { cause, .. } => {
                cause.is_timeout()
            }
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::StabilizeTimeout { cause, .. } | Self::ReclaimFailed { cause, .. } => {
                cause.is_cancelled()
            }
            _ => false,
        }
    }

    /// The resource this failure concerns, when one exists yet.
    pub fn resource(&self) -> Option<(ResourceKind, ResourceId)> {
        match self {
            Self::StabilizeTimeout { kind, id, .. }
            | Self::FetchExhausted { kind, id, .. }
            | Self::Timeout { kind, id, .. }
            | Self::Cancelled { kind, id, .. }
            | Self::ReadFailed { kind, id, .. }
            | Self::MutationFailed { kind, id, .. }
            | Self::ReclaimFailed { kind, id, .. }
            | Self::ExpectationUnmet { kind, id, .. } => Some((*kind, *id)),
            Self::ProvisionFailed { .. }
            | Self::DiscoveryFailed { .. }
            | Self::InvalidWaitSpec(_)
            | Self::Config(_) => None,
        }
    }

    /// Last state seen by the wait that produced this error.
    pub fn last_state(&self) -> Option<LifecycleState> {
        match self {
            Self::Timeout { last_snapshot, .. } | Self::Cancelled { last_snapshot, .. } => {
                last_snapshot.as_ref().map(|s| s.state)
            }
            Self::StabilizeTimeout { cause, .. } | Self::ReclaimFailed { cause, .. } => {
                cause.last_state()
            }
            _ => None,
        }
    }
}

fn describe_state(snapshot: Option<&ResourceSnapshot>) -> String {
    match snapshot {
        Some(snapshot) => snapshot.state.to_string(),
        None => "none".to_string(),
    }
}

fn describe_error(error: Option<&ProviderError>) -> String {
    match error {
        Some(error) => format!("; last fetch error: {error}"),
        None => String::new(),
    }
}
