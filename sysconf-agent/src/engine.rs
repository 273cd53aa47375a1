//! The reconciliation engine: turns one [`ChangeSet`] into OS side effects
//! and a single [`Verdict`].
//!
//! Every change is validated before anything is applied, so a malformed
//! transaction never reaches the OS. Once applying has started, all changes
//! are attempted even if an earlier one failed, and nothing is undone: the
//! leaves are independent OS facilities without a shared rollback, so an
//! aborted transaction may leave some of its values in place. The store
//! rolls back its own copy and is expected to resubmit.

use std::{sync::Arc, time::Duration};

use sysconf_core::model::{ApplyResult, Change, ChangeSet, LeafFailure, Verdict};

use crate::handlers::Handlers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Validating,
    Applying,
    Committing,
    Aborting,
}

/// How often a leaf with a transient (I/O) failure is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per leaf, at least 1.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

pub struct Engine {
    handlers: Arc<Handlers>,
    retry: RetryPolicy,
    phase: Phase,
}

impl Engine {
    pub fn new(handlers: Arc<Handlers>, retry: RetryPolicy) -> Self {
        Engine {
            handlers,
            retry,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "engine phase");
        self.phase = phase;
    }

    /// Validate and apply a change set. Blocks on OS calls; run it off the
    /// async executor.
    pub fn process(&mut self, changes: &ChangeSet) -> Verdict {
        let verdict = self.process_phases(changes);
        self.enter(Phase::Idle);
        match &verdict {
            Verdict::Accept => tracing::info!(leaves = changes.len(), "accepted"),
            Verdict::Abort { reason, failures } => {
                tracing::warn!(failed = failures.len(), "aborted: {}", reason)
            }
        }
        verdict
    }

    fn process_phases(&mut self, changes: &ChangeSet) -> Verdict {
        self.enter(Phase::Validating);
        let invalid: Vec<LeafFailure> = changes
            .in_apply_order()
            .into_iter()
            .filter_map(|change| {
                self.handlers
                    .validate(change)
                    .err()
                    .map(|failure| LeafFailure {
                        leaf: change.leaf,
                        failure,
                    })
            })
            .collect();
        if !invalid.is_empty() {
            self.enter(Phase::Aborting);
            return Verdict::from_failures(invalid);
        }

        self.enter(Phase::Applying);
        let mut failures = Vec::new();
        for change in changes.in_apply_order() {
            let result = self.apply_with_retry(change);
            if let Some(failure) = result.failure() {
                tracing::warn!(leaf = %change.leaf, "{}", failure);
                failures.push(LeafFailure {
                    leaf: change.leaf,
                    failure: failure.clone(),
                });
            } else {
                tracing::debug!(leaf = %change.leaf, operation = %change.operation, "applied");
            }
        }

        if failures.is_empty() {
            self.enter(Phase::Committing);
        } else {
            self.enter(Phase::Aborting);
        }
        Verdict::from_failures(failures)
    }

    fn apply_with_retry(&self, change: &Change) -> ApplyResult {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self.handlers.apply(change);
            let transient = matches!(
                result,
                ApplyResult::Rejected(ref f) if f.kind.is_transient()
            );
            if !transient || attempt >= attempts {
                return result;
            }
            tracing::info!(
                leaf = %change.leaf,
                attempt,
                attempts,
                "transient failure, retrying"
            );
            attempt += 1;
            if !self.retry.delay.is_zero() {
                std::thread::sleep(self.retry.delay);
            }
        }
    }
}
