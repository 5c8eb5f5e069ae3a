use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::condition::Condition;
use crate::error::{HarnessError, HarnessResult};
use crate::provider::{ProviderError, ProviderErrorClass};
use crate::resource::{LifecycleState, ResourceHandle, ResourceSnapshot};

/// Timeout and cadence of one wait. `poll_interval < timeout`, both non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSpec {
    timeout: Duration,
    poll_interval: Duration,
}

impl WaitSpec {
    pub fn new(timeout: Duration, poll_interval: Duration) -> HarnessResult<Self> {
        if timeout.is_zero() {
            return Err(HarnessError::InvalidWaitSpec(
                "timeout must be greater than 0".to_string(),
            ));
        }
        if poll_interval.is_zero() {
            return Err(HarnessError::InvalidWaitSpec(
                "poll interval must be greater than 0".to_string(),
            ));
        }
        if poll_interval >= timeout {
            return Err(HarnessError::InvalidWaitSpec(format!(
                "poll interval {poll_interval:?} must be shorter than timeout {timeout:?}"
            )));
        }

        Ok(Self {
            timeout,
            poll_interval,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Result of a satisfied wait.
#[derive(Debug, Clone)]
pub struct WaitOutcome {
    /// The snapshot for which the condition held.
    pub snapshot: ResourceSnapshot,
    pub elapsed: Duration,
    pub polls: u32,
    pub fetch_errors: u32,
    /// States seen during the wait, consecutive repeats collapsed.
    pub observed_states: Vec<LifecycleState>,
}

#[derive(Default)]
struct PollProgress {
    polls: u32,
    successes: u32,
    fetch_errors: u32,
    errors_by_class: BTreeMap<ProviderErrorClass, u32>,
    last_snapshot: Option<ResourceSnapshot>,
    last_error: Option<ProviderError>,
    observed_states: Vec<LifecycleState>,
}

impl PollProgress {
    fn record_snapshot(&mut self, snapshot: &ResourceSnapshot) {
        self.successes += 1;
        if self.observed_states.last() != Some(&snapshot.state) {
            self.observed_states.push(snapshot.state);
        }
    }

    fn record_error(&mut self, error: ProviderError) {
        self.fetch_errors += 1;
        *self.errors_by_class.entry(error.class).or_insert(0) += 1;
        self.last_error = Some(error);
    }
}

/// Repeatedly fetches a resource and evaluates a [`Condition`] until it holds,
/// the deadline passes, or the wait is cancelled.
///
/// The first fetch fires immediately. Fetch errors are counted and polling
/// continues; if no fetch succeeds during the whole window the wait fails with
/// `FetchExhausted` rather than `Timeout`. Each fetch is bounded by the fetch
/// timeout, clipped to the time left before the deadline, and raced against
/// cancellation, so a hung remote call can neither keep a cancelled wait alive
/// nor push a timeout past the deadline.
#[derive(Debug, Clone)]
pub struct PollingWaiter {
    cancel: CancelToken,
    fetch_timeout: Duration,
}

impl PollingWaiter {
    pub fn new(cancel: CancelToken, fetch_timeout: Duration) -> Self {
        Self {
            cancel,
            fetch_timeout,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub async fn await_condition<F, Fut>(
        &self,
        handle: &ResourceHandle,
        mut fetch: F,
        condition: &Condition,
        spec: &WaitSpec,
    ) -> HarnessResult<WaitOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ResourceSnapshot, ProviderError>>,
    {
        let started = Instant::now();
        let deadline = started + spec.timeout();
        let mut progress = PollProgress::default();

        debug!(
            "Waiting up to {:?} for {handle} to be {condition} (every {:?})",
            spec.timeout(),
            spec.poll_interval()
        );

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(handle, condition, started, progress));
            }

            progress.polls += 1;
            let budget = self.fetch_budget(deadline, spec);
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(self.cancelled(handle, condition, started, progress));
                }
                result = tokio::time::timeout(budget, fetch()) => result,
            };

            match attempt {
                Ok(Ok(snapshot)) => {
                    progress.record_snapshot(&snapshot);
                    debug!(
                        "Poll {} of {handle}: {} ({condition}: {})",
                        progress.polls,
                        snapshot.state,
                        condition.evaluate(&snapshot)
                    );
                    if condition.evaluate(&snapshot) {
                        let elapsed = started.elapsed();
                        info!(
                            "{handle} is {condition} after {elapsed:?} ({} polls)",
                            progress.polls
                        );
                        return Ok(WaitOutcome {
                            snapshot,
                            elapsed,
                            polls: progress.polls,
                            fetch_errors: progress.fetch_errors,
                            observed_states: progress.observed_states,
                        });
                    }
                    progress.last_snapshot = Some(snapshot);
                }
                Ok(Err(error)) => {
                    warn!(
                        "Fetching {handle} failed ({} {} error(s) so far): {error}",
                        progress.errors_by_class.get(&error.class).copied().unwrap_or(0) + 1,
                        error.class
                    );
                    progress.record_error(error);
                }
                Err(_) => {
                    let error = ProviderError::transport(format!(
                        "fetch did not complete within {budget:?}"
                    ));
                    warn!("Fetching {handle} failed: {error}");
                    progress.record_error(error);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Self::expired(handle, condition, started, progress));
            }

            // Clamp the final sleep so the last fetch lands on the deadline
            let pause = spec.poll_interval().min(deadline - now);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(self.cancelled(handle, condition, started, progress));
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// A single fetch may not outlive the deadline by more than one poll
    /// interval, whatever the configured fetch timeout.
    fn fetch_budget(&self, deadline: Instant, spec: &WaitSpec) -> Duration {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.fetch_timeout.min(remaining.max(spec.poll_interval()))
    }

    fn cancelled(
        &self,
        handle: &ResourceHandle,
        condition: &Condition,
        started: Instant,
        progress: PollProgress,
    ) -> HarnessError {
        let elapsed = started.elapsed();
        info!("Wait for {handle} to be {condition} cancelled after {elapsed:?}");
        HarnessError::Cancelled {
            kind: handle.kind(),
            id: handle.id(),
            condition: condition.description().to_string(),
            elapsed,
            last_snapshot: progress.last_snapshot.map(Box::new),
        }
    }

    fn expired(
        handle: &ResourceHandle,
        condition: &Condition,
        started: Instant,
        progress: PollProgress,
    ) -> HarnessError {
        let elapsed = started.elapsed();
        match (progress.successes, progress.last_error) {
            (0, Some(last_error)) => {
                warn!(
                    "No successful read of {handle} in {elapsed:?}; errors by class: {:?}",
                    progress.errors_by_class
                );
                HarnessError::FetchExhausted {
                    kind: handle.kind(),
                    id: handle.id(),
                    condition: condition.description().to_string(),
                    elapsed,
                    attempts: progress.polls,
                    last_error,
                }
            }
            (_, last_error) => {
                warn!("{handle} was not {condition} within {elapsed:?}");
                HarnessError::Timeout {
                    kind: handle.kind(),
                    id: handle.id(),
                    condition: condition.description().to_string(),
                    elapsed,
                    polls: progress.polls,
                    last_snapshot: progress.last_snapshot.map(Box::new),
                    last_error,
                }
            }
        }
    }
}
