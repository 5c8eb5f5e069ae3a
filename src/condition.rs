use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::resource::{ResourceId, ResourceSnapshot};

type Predicate = dyn Fn(&ResourceSnapshot) -> bool + Send + Sync;

/// A named, side-effect-free predicate over a snapshot.
///
/// Conditions carry no memory between evaluations; the waiter re-evaluates them
/// from scratch on every tick.
#[derive(Clone)]
pub struct Condition {
    description: String,
    predicate: Arc<Predicate>,
}

impl Condition {
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ResourceSnapshot) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn evaluate(&self, snapshot: &ResourceSnapshot) -> bool {
        (self.predicate)(snapshot)
    }

    pub fn running() -> Self {
        Self::new("running", |s| s.state.is_running())
    }

    pub fn no_pending_transactions() -> Self {
        Self::new("no pending transactions", |s| {
            s.state.is_running() && s.state.pending_transactions() == 0
        })
    }

    pub fn stable() -> Self {
        Self::new("stable", |s| s.state.is_stable())
    }

    /// Any state other than `Stable`, e.g. a reboot that has started.
    pub fn left_stable() -> Self {
        Self::new("left stable", |s| !s.state.is_stable())
    }

    /// Visible on the remote side (credentials report `Stable` once listed).
    pub fn present() -> Self {
        Self::new("present", |s| s.state.is_stable())
    }

    pub fn absent() -> Self {
        Self::new("absent", |s| s.state.is_absent())
    }

    pub fn has_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        let description = format!("has tags {}", join(&wanted));
        Self::new(description, move |s| {
            let seen = s.distinct_tags();
            wanted.iter().all(|t| seen.contains(t.as_str()))
        })
    }

    pub fn negate(self) -> Self {
        let description = format!("not ({})", self.description);
        Self::new(description, move |s| !self.evaluate(s))
    }

    pub fn and(self, other: Condition) -> Self {
        Self::all_of(vec![self, other])
    }

    pub fn or(self, other: Condition) -> Self {
        Self::any_of(vec![self, other])
    }

    pub fn all_of(conditions: Vec<Condition>) -> Self {
        let description = conditions
            .iter()
            .map(Condition::description)
            .collect::<Vec<_>>()
            .join(" and ");
        Self::new(description, move |s| conditions.iter().all(|c| c.evaluate(s)))
    }

    pub fn any_of(conditions: Vec<Condition>) -> Self {
        let description = conditions
            .iter()
            .map(Condition::description)
            .collect::<Vec<_>>()
            .join(" or ");
        Self::new(description, move |s| conditions.iter().any(|c| c.evaluate(s)))
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("description", &self.description)
            .finish()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Structural expectation checked by a single read-only fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// The distinct tag names equal this set, ignoring order and duplicates.
    TagsExactly(BTreeSet<String>),
    TagsInclude(BTreeSet<String>),
    PrimaryAddressPresent,
    NetworkVlansAtLeast(usize),
    CredentialAttached(ResourceId),
    HostDiskAvailable(u64),
}

impl Expectation {
    pub fn tags_exactly<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::TagsExactly(tags.into_iter().map(Into::into).collect())
    }

    pub fn tags_include<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::TagsInclude(tags.into_iter().map(Into::into).collect())
    }

    /// Returns a description of the mismatch, or `Ok(())` when satisfied.
    pub fn check(&self, snapshot: &ResourceSnapshot) -> Result<(), String> {
        match self {
            Self::TagsExactly(wanted) => {
                let seen: BTreeSet<String> =
                    snapshot.distinct_tags().into_iter().map(String::from).collect();
                if &seen == wanted {
                    Ok(())
                } else {
                    let missing: BTreeSet<_> = wanted.difference(&seen).cloned().collect();
                    let extra: BTreeSet<_> = seen.difference(wanted).cloned().collect();
                    Err(format!(
                        "tags differ: missing {}, unexpected {}",
                        join(&missing),
                        join(&extra)
                    ))
                }
            }
            Self::TagsInclude(wanted) => {
                let seen = snapshot.distinct_tags();
                let missing: BTreeSet<String> = wanted
                    .iter()
                    .filter(|t| !seen.contains(t.as_str()))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("missing tags {}", join(&missing)))
                }
            }
            Self::PrimaryAddressPresent => match snapshot.primary_address.as_deref() {
                Some(address) if !address.is_empty() => Ok(()),
                _ => Err("primary address is empty".to_string()),
            },
            Self::NetworkVlansAtLeast(n) => {
                if snapshot.network_vlans.len() >= *n {
                    Ok(())
                } else {
                    Err(format!(
                        "expected at least {n} network VLANs, found {}",
                        snapshot.network_vlans.len()
                    ))
                }
            }
            Self::CredentialAttached(id) => {
                if snapshot.attached_credentials.contains(id) {
                    Ok(())
                } else {
                    Err(format!("credential {id} is not attached"))
                }
            }
            Self::HostDiskAvailable(mb) => match snapshot.host_disk_available_mb {
                Some(available) if available >= *mb => Ok(()),
                Some(available) => Err(format!(
                    "host disk has {available} MB available, need {mb} MB"
                )),
                None => Err("host disk availability not reported".to_string()),
            },
        }
    }

    /// The same check as a pollable condition, for waiting until a mutation
    /// becomes visible.
    pub fn as_condition(&self) -> Condition {
        let expectation = self.clone();
        Condition::new(self.to_string(), move |s| expectation.check(s).is_ok())
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TagsExactly(tags) => write!(f, "tags exactly {}", join(tags)),
            Self::TagsInclude(tags) => write!(f, "tags include {}", join(tags)),
            Self::PrimaryAddressPresent => write!(f, "primary address present"),
            Self::NetworkVlansAtLeast(n) => write!(f, "at least {n} network VLANs"),
            Self::CredentialAttached(id) => write!(f, "credential {id} attached"),
            Self::HostDiskAvailable(mb) => write!(f, "host can allocate {mb} MB disk"),
        }
    }
}

fn join(set: &BTreeSet<String>) -> String {
    format!("[{}]", set.iter().cloned().collect::<Vec<_>>().join(", "))
}
