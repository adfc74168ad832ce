use std::sync::{Arc, Mutex, MutexGuard};

use photoshift_contracts::errors::OrchestrationError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u64, available: u64 },
    #[error("top-up amount must be positive, got {0}")]
    InvalidAmount(u64),
}

impl From<LedgerError> for OrchestrationError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => OrchestrationError::InsufficientCredits {
                required,
                available,
            },
            LedgerError::InvalidAmount(amount) => OrchestrationError::InvalidAmount(amount),
        }
    }
}

/// Spendable credit balance for one consumer.
///
/// Clones share the same balance. Every mutation goes through one mutex, so
/// concurrent commits can never over-spend and the balance is never observed
/// below zero.
#[derive(Debug, Clone, Default)]
pub struct CreditLedger {
    inner: Arc<Mutex<LedgerState>>,
}

#[derive(Debug, Default)]
struct LedgerState {
    available: u64,
    spent: u64,
}

impl CreditLedger {
    pub fn new(initial_credits: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerState {
                available: initial_credits,
                spent: 0,
            })),
        }
    }

    pub fn available(&self) -> u64 {
        self.state().available
    }

    /// Total credits committed over the lifetime of this ledger.
    pub fn spent(&self) -> u64 {
        self.state().spent
    }

    pub fn check_sufficient(&self, cost: u64) -> bool {
        cost <= self.state().available
    }

    /// Debits `cost` and returns the remaining balance.
    pub fn commit(&self, cost: u64) -> Result<u64, LedgerError> {
        let mut state = self.state();
        if cost > state.available {
            return Err(LedgerError::InsufficientCredits {
                required: cost,
                available: state.available,
            });
        }
        state.available -= cost;
        state.spent = state.spent.saturating_add(cost);
        Ok(state.available)
    }

    /// Credits `amount` and returns the new balance.
    pub fn top_up(&self, amount: u64) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut state = self.state();
        state.available = state.available.saturating_add(amount);
        Ok(state.available)
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        // A panic while holding the guard cannot leave the counters half
        // written, so a poisoned lock is still safe to read.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
