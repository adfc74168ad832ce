use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use photoshift_contracts::errors::ProviderError;
use photoshift_contracts::jobs::{FailureKind, ImageRef, JobHandle};

use crate::provider::{RemoteStatus, TransformationProvider};

/// Time source and tick scheduler for the poller.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Shared cancellation signal for one job.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Processing,
    Completed(ImageRef),
    Failed { kind: FailureKind, message: String },
    TimedOut,
    Cancelled,
}

/// Bounded-attempt state machine over one processing job.
///
/// Each observation consumes one attempt. Transient query errors (rate limits,
/// outages) count as "still processing"; any other query error fails the job.
/// Once `max_attempts` observations pass without resolution the machine moves
/// to `TimedOut`. Resolved states absorb further input.
#[derive(Debug, Clone)]
pub struct PollMachine {
    max_attempts: u32,
    attempts: u32,
    state: PollState,
}

impl PollMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: 0,
            state: PollState::Processing,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn is_resolved(&self) -> bool {
        self.state != PollState::Processing
    }

    pub fn observe(&mut self, observation: Result<RemoteStatus, ProviderError>) -> &PollState {
        if self.is_resolved() {
            return &self.state;
        }
        self.attempts += 1;
        self.state = match observation {
            Ok(RemoteStatus::Completed(result)) => PollState::Completed(result),
            Ok(RemoteStatus::Failed(message)) => PollState::Failed {
                kind: FailureKind::RemoteFailure,
                message,
            },
            Err(err) if !err.kind.is_retryable() => PollState::Failed {
                kind: err.kind.into(),
                message: err.to_string(),
            },
            Ok(RemoteStatus::Processing) | Err(_) if self.attempts >= self.max_attempts => {
                PollState::TimedOut
            }
            Ok(RemoteStatus::Processing) | Err(_) => PollState::Processing,
        };
        &self.state
    }

    pub fn cancel(&mut self) {
        if !self.is_resolved() {
            self.state = PollState::Cancelled;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub state: PollState,
    pub attempts: u32,
}

/// Drives a [`PollMachine`] against a provider: wait one interval, query,
/// repeat until resolved, cancelled or out of attempts.
pub struct JobStatusPoller<'a> {
    provider: &'a dyn TransformationProvider,
    clock: &'a dyn Clock,
    interval: Duration,
    max_attempts: u32,
}

impl<'a> JobStatusPoller<'a> {
    pub fn new(
        provider: &'a dyn TransformationProvider,
        clock: &'a dyn Clock,
        interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            provider,
            clock,
            interval,
            max_attempts,
        }
    }

    pub fn run<E>(
        &self,
        handle: &JobHandle,
        cancel: &CancelFlag,
        mut on_tick: impl FnMut(u32, &PollState) -> Result<(), E>,
    ) -> Result<PollReport, E> {
        let mut machine = PollMachine::new(self.max_attempts);
        while !machine.is_resolved() {
            if cancel.is_cancelled() {
                machine.cancel();
                break;
            }
            self.clock.sleep(self.interval);
            if cancel.is_cancelled() {
                machine.cancel();
                break;
            }
            machine.observe(self.provider.query_status(handle));
            on_tick(machine.attempts(), machine.state())?;
        }
        Ok(PollReport {
            attempts: machine.attempts(),
            state: machine.state,
        })
    }
}
