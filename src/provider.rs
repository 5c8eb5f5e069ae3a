use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::resource::{Mutation, ResourceHandle, ResourceSnapshot, ResourceSpec, TestMarker};

pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Coarse classification of provider failures. The waiter counts fetch errors
/// per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorClass {
    Transport,
    Throttled,
    NotFound,
    Rejected,
    Internal,
}

impl ProviderErrorClass {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport | Self::Throttled | Self::Internal)
    }
}

impl fmt::Display for ProviderErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Throttled => write!(f, "throttled"),
            Self::NotFound => write!(f, "not found"),
            Self::Rejected => write!(f, "rejected"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{class} error: {message}")]
pub struct ProviderError {
    pub class: ProviderErrorClass,
    pub message: String,
}

impl ProviderError {
    pub fn new(class: ProviderErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorClass::Transport, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorClass::NotFound, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorClass::Rejected, message)
    }
}

/// Capability set of the remote provisioning service.
///
/// Implementations must be safe for concurrent use. `fetch_state` reports a
/// resource the service no longer knows about as [`LifecycleState::Absent`]
/// rather than as an error.
///
/// [`LifecycleState::Absent`]: crate::resource::LifecycleState::Absent
pub trait ProvisioningService: Send + Sync {
    fn create_resource<'a>(&'a self, spec: &'a ResourceSpec) -> ProviderFuture<'a, ResourceHandle>;

    /// Returns whether the service accepted the delete.
    fn delete_resource<'a>(&'a self, handle: &'a ResourceHandle) -> ProviderFuture<'a, bool>;

    fn fetch_state<'a>(&'a self, handle: &'a ResourceHandle) -> ProviderFuture<'a, ResourceSnapshot>;

    /// Returns whether the service accepted the mutation.
    fn mutate<'a>(
        &'a self,
        handle: &'a ResourceHandle,
        mutation: &'a Mutation,
    ) -> ProviderFuture<'a, bool>;

    fn list_by_marker<'a>(&'a self, marker: &'a TestMarker)
        -> ProviderFuture<'a, Vec<ResourceHandle>>;
}
