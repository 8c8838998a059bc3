//! Per-run cost guardrail.
//!
//! Tracks cumulative spend against the ceiling from `RunConfig`. The running
//! total never decreases and once the ceiling is crossed `exceeded()` stays
//! true for the life of the guardrail.

use std::sync::Mutex;

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Raised when a run's spend crosses its ceiling
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Cost ceiling exceeded: ${spent_usd:.4} > ${ceiling_usd:.4}")]
pub struct CostExceeded {
    pub spent_usd: f64,
    pub ceiling_usd: f64,
}

#[derive(Debug)]
struct Ledger {
    spent_usd: f64,
    tripped: bool,
}

/// Running spend for a single run
#[derive(Debug)]
pub struct CostGuardrail {
    run_id: Uuid,
    ceiling_usd: f64,
    ledger: Mutex<Ledger>,
}

impl CostGuardrail {
    /// Create a guardrail with nothing spent yet
    pub fn new(run_id: Uuid, ceiling_usd: f64) -> Self {
        Self::with_spent(run_id, ceiling_usd, 0.0)
    }

    /// Create a guardrail seeded with spend from earlier in the run
    pub fn with_spent(run_id: Uuid, ceiling_usd: f64, spent_usd: f64) -> Self {
        let spent_usd = spent_usd.max(0.0);
        Self {
            run_id,
            ceiling_usd,
            ledger: Mutex::new(Ledger {
                spent_usd,
                tripped: spent_usd > ceiling_usd,
            }),
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        // The ledger holds two plain numbers; a poisoned lock still has valid data
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record consumed spend.
    ///
    /// Negative amounts are ignored. Returns true only for the call that
    /// first crosses the ceiling.
    pub fn record(&self, units: f64) -> bool {
        let mut ledger = self.ledger();
        if units > 0.0 {
            ledger.spent_usd += units;
        }

        if !ledger.tripped && ledger.spent_usd > self.ceiling_usd {
            ledger.tripped = true;
            warn!(
                run_id = %self.run_id,
                spent_usd = ledger.spent_usd,
                ceiling_usd = self.ceiling_usd,
                "Cost ceiling exceeded"
            );
            return true;
        }

        false
    }

    /// Spend left before the ceiling (zero once exceeded)
    pub fn remaining(&self) -> f64 {
        (self.ceiling_usd - self.ledger().spent_usd).max(0.0)
    }

    pub fn exceeded(&self) -> bool {
        self.ledger().tripped
    }

    pub fn spent(&self) -> f64 {
        self.ledger().spent_usd
    }

    /// Ok while under the ceiling
    pub fn check(&self) -> Result<(), CostExceeded> {
        let ledger = self.ledger();
        if ledger.tripped {
            return Err(CostExceeded {
                spent_usd: ledger.spent_usd,
                ceiling_usd: self.ceiling_usd,
            });
        }
        Ok(())
    }
}
