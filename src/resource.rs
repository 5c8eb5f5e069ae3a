use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{DEFAULT_MARKER_PREFIX, MARKER_SEPARATOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Compute,
    Credential,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Credential => write!(f, "credential"),
        }
    }
}

/// Opaque identifier assigned by the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One remote resource instance. Identity is the `(kind, id)` pair; the name and
/// creation time are carried along for diagnostics and orphan discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHandle {
    kind: ResourceKind,
    id: ResourceId,
    name: String,
    created_at: DateTime<Utc>,
}

impl ResourceHandle {
    pub fn new(kind: ResourceKind, id: ResourceId, name: impl Into<String>) -> Self {
        Self::with_created_at(kind, id, name, Utc::now())
    }

    pub fn with_created_at(
        kind: ResourceKind,
        id: ResourceId,
        name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
            created_at,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn key(&self) -> (ResourceKind, ResourceId) {
        (self.kind, self.id)
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ResourceHandle {}

impl Hash for ResourceHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.id, self.name)
    }
}

/// Observable lifecycle state of a remote resource.
///
/// Compute resources move through `Provisioning -> ActiveWithPendingTransactions
/// -> Stable`, re-enter `Rebooting` on a reboot, and finish with `Deleting ->
/// Absent`. Credentials only use `Provisioning`, `Stable` (visible) and `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Provisioning,
    Active,
    ActiveWithPendingTransactions { count: u32 },
    Stable,
    Rebooting,
    Deleting,
    Absent,
}

impl LifecycleState {
    /// Powered on and reachable, whether or not background work is still pending.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::ActiveWithPendingTransactions { .. } | Self::Stable
        )
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Stable)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn pending_transactions(&self) -> u32 {
        match self {
            Self::ActiveWithPendingTransactions { count } => *count,
            _ => 0,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Active => write!(f, "active"),
            Self::ActiveWithPendingTransactions { count } => {
                write!(f, "active with {count} pending transaction(s)")
            }
            Self::Stable => write!(f, "stable"),
            Self::Rebooting => write!(f, "rebooting"),
            Self::Deleting => write!(f, "deleting"),
            Self::Absent => write!(f, "absent"),
        }
    }
}

/// A single read of a resource's remote state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub handle: ResourceHandle,
    pub state: LifecycleState,
    pub name: String,
    pub tags: Vec<String>,
    pub primary_address: Option<String>,
    pub network_vlans: Vec<u32>,
    pub attached_credentials: Vec<ResourceId>,
    pub host_disk_available_mb: Option<u64>,
    pub observed_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn new(handle: ResourceHandle, state: LifecycleState) -> Self {
        let name = handle.name().to_string();
        Self {
            handle,
            state,
            name,
            tags: Vec::new(),
            primary_address: None,
            network_vlans: Vec::new(),
            attached_credentials: Vec::new(),
            host_disk_available_mb: None,
            observed_at: Utc::now(),
        }
    }

    pub fn absent(handle: ResourceHandle) -> Self {
        Self::new(handle, LifecycleState::Absent)
    }

    /// Tag names with duplicates collapsed.
    pub fn distinct_tags(&self) -> BTreeSet<&str> {
        self.tags.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeSpec {
    pub hostname: String,
    pub domain: String,
    pub start_cpus: u32,
    pub max_memory_mb: u64,
    pub datacenter: String,
    pub hourly_billing: bool,
    pub local_disk: bool,
    pub credential_ids: Vec<ResourceId>,
    pub tags: Vec<String>,
}

impl Default for ComputeSpec {
    fn default() -> Self {
        Self {
            hostname: "test".to_string(),
            domain: "harness.example".to_string(),
            start_cpus: 1,
            max_memory_mb: 1024,
            datacenter: "dc01".to_string(),
            hourly_billing: true,
            local_disk: false,
            credential_ids: Vec::new(),
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSpec {
    pub label: String,
    pub public_key: String,
    pub notes: String,
    pub tags: Vec<String>,
}

impl CredentialSpec {
    /// A credential with a freshly generated placeholder public key.
    pub fn generated(label: impl Into<String>) -> Self {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        let body: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(64)
            .map(char::from)
            .collect();

        Self {
            label: label.into(),
            public_key: format!("ssh-rsa AAAA{body} harness@localhost"),
            notes: "created by lifecycle-harness".to_string(),
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Compute(ComputeSpec),
    Credential(CredentialSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Compute(_) => ResourceKind::Compute,
            Self::Credential(_) => ResourceKind::Credential,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Compute(spec) => &spec.hostname,
            Self::Credential(spec) => &spec.label,
        }
    }

    fn name_mut(&mut self) -> &mut String {
        match self {
            Self::Compute(spec) => &mut spec.hostname,
            Self::Credential(spec) => &mut spec.label,
        }
    }

    pub fn tags(&self) -> &[String] {
        match self {
            Self::Compute(spec) => &spec.tags,
            Self::Credential(spec) => &spec.tags,
        }
    }

    fn tags_mut(&mut self) -> &mut Vec<String> {
        match self {
            Self::Compute(spec) => &mut spec.tags,
            Self::Credential(spec) => &mut spec.tags,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootKind {
    Soft,
    Hard,
}

impl fmt::Display for RebootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// State-changing calls issued against an existing resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mutation", content = "params", rename_all = "snake_case")]
pub enum Mutation {
    RebootSoft,
    RebootHard,
    SetTags(Vec<String>),
    AttachCredential(ResourceId),
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RebootSoft => "reboot_soft",
            Self::RebootHard => "reboot_hard",
            Self::SetTags(_) => "set_tags",
            Self::AttachCredential(_) => "attach_credential",
        }
    }

    pub fn applies_to(&self, kind: ResourceKind) -> bool {
        // Every supported mutation targets compute resources
        kind == ResourceKind::Compute
    }
}

impl From<RebootKind> for Mutation {
    fn from(kind: RebootKind) -> Self {
        match kind {
            RebootKind::Soft => Mutation::RebootSoft,
            RebootKind::Hard => Mutation::RebootHard,
        }
    }
}

/// Acknowledgement of a mutation call. Carries no convergence guarantee.
#[derive(Debug, Clone, Serialize)]
pub struct MutationAck {
    pub handle: ResourceHandle,
    pub mutation: &'static str,
    pub acknowledged_at: DateTime<Utc>,
}

/// Naming/tag convention stamped on every harness-created resource.
///
/// A marker scoped to a run matches names starting with `{prefix}-{run}-`; a
/// marker built with [`TestMarker::any_run`] matches anything named with the
/// prefix or carrying the prefix tag, which is how leftovers of crashed runs are
/// found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMarker {
    prefix: String,
    run_label: Option<String>,
}

impl TestMarker {
    pub fn new(prefix: impl Into<String>, run_label: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            run_label: Some(run_label.into()),
        }
    }

    pub fn any_run(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            run_label: None,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn run_label(&self) -> Option<&str> {
        self.run_label.as_deref()
    }

    /// The same convention without the run scope.
    pub fn widen(&self) -> Self {
        Self::any_run(self.prefix.clone())
    }

    pub fn name_prefix(&self) -> String {
        match &self.run_label {
            Some(run) => format!("{}{MARKER_SEPARATOR}{run}{MARKER_SEPARATOR}", self.prefix),
            None => format!("{}{MARKER_SEPARATOR}", self.prefix),
        }
    }

    pub fn tag(&self) -> &str {
        &self.prefix
    }

    /// Stamp the marker into a creation request. Idempotent.
    pub fn apply(&self, spec: &mut ResourceSpec) {
        let name_prefix = self.name_prefix();
        let name = spec.name_mut();
        if !name.starts_with(&name_prefix) {
            *name = format!("{name_prefix}{name}");
        }

        let tag = self.tag().to_string();
        let tags = spec.tags_mut();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    pub fn matches(&self, name: &str, tags: &[String]) -> bool {
        if name.starts_with(&self.name_prefix()) {
            return true;
        }
        self.run_label.is_none() && tags.iter().any(|t| t == self.tag())
    }
}

impl Default for TestMarker {
    fn default() -> Self {
        Self::any_run(DEFAULT_MARKER_PREFIX)
    }
}

impl fmt::Display for TestMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*", self.name_prefix())
    }
}
