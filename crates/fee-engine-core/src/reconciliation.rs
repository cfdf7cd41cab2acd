//! Compare freshly calculated fees against stored fee records.
//!
//! Every stored record yields exactly one [`ValidationEntry`]. Inputs are
//! only read; nothing here writes back to storage.

use std::collections::{BTreeSet, HashMap};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::decimal::round_money;
use crate::schedule::{CalculationResult, FeeComponentType};
use crate::types::*;

const HUNDRED: Decimal = dec!(100);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A calculation produced for one stored transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionCalculation {
    pub transaction_id: TransactionId,
    pub result: CalculationResult,
}

/// A fee application as previously persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFeeRecord {
    pub transaction_id: TransactionId,
    pub component: FeeComponentType,
    /// Legacy records store discounts as negative amounts
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Largest percent difference still reported as WARN rather than FAIL
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold_pct: Percent,
    /// Floor for the denominator when the stored amount is near zero
    #[serde(default = "default_epsilon")]
    pub epsilon: Money,
    /// Decimal places fresh amounts are rounded to before comparison
    #[serde(default = "default_precision")]
    pub amount_precision: u32,
}

fn default_warn_threshold() -> Percent {
    dec!(5)
}

fn default_epsilon() -> Money {
    dec!(0.01)
}

fn default_precision() -> u32 {
    2
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        ReconciliationConfig {
            warn_threshold_pct: default_warn_threshold(),
            epsilon: default_epsilon(),
            amount_precision: default_precision(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEntry {
    pub transaction_id: TransactionId,
    pub component: FeeComponentType,
    pub status: ValidationStatus,
    /// `None` when there was nothing to compare against
    pub percent_diff: Option<Percent>,
    pub stored_amount: Money,
    pub fresh_amount: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub total: usize,
    pub passed: usize,
    pub warned: usize,
    pub failed: usize,
    /// Mean over entries that had a fresh counterpart
    pub mean_percent_diff: Option<Percent>,
    pub max_percent_diff: Option<Percent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub entries: Vec<ValidationEntry>,
    pub summary: ReconciliationSummary,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.summary.warned == 0 && self.summary.failed == 0
    }

    /// Transactions with a WARN or FAIL entry, i.e. those whose stored
    /// figures should be recalculated.
    pub fn recalculation_candidates(&self) -> Vec<TransactionId> {
        self.entries
            .iter()
            .filter(|e| e.status != ValidationStatus::Pass)
            .map(|e| e.transaction_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Everything a reconciliation run needs, as read from a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationInput {
    #[serde(default)]
    pub fresh: Vec<TransactionCalculation>,
    pub stored: Vec<StoredFeeRecord>,
    #[serde(default)]
    pub config: ReconciliationConfig,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Classify each stored record against the fresh calculation for its
/// transaction.
///
/// Amounts are compared by absolute value, the fresh side rounded to
/// `amount_precision` places. `percent_diff = |stored - fresh| /
/// max(|stored|, epsilon) * 100`; zero is PASS, up to the warn threshold is
/// WARN, anything larger is FAIL. A record whose transaction or component
/// has no fresh counterpart is FAIL.
pub fn validate(
    fresh: &[TransactionCalculation],
    stored: &[StoredFeeRecord],
    config: &ReconciliationConfig,
) -> ReconciliationReport {
    let mut by_transaction: HashMap<TransactionId, &CalculationResult> = HashMap::new();
    for calc in fresh {
        by_transaction
            .entry(calc.transaction_id)
            .or_insert(&calc.result);
    }

    let entries: Vec<ValidationEntry> = stored
        .iter()
        .map(|record| {
            let entry = match by_transaction.get(&record.transaction_id) {
                None => missing(record, "no fresh calculation for transaction"),
                Some(result) => match result.amount_for(&record.component) {
                    None => missing(record, "component not applied in fresh calculation"),
                    Some(amount) => compare(record, amount, config),
                },
            };
            match entry.status {
                ValidationStatus::Fail => warn!(
                    transaction_id = entry.transaction_id,
                    component = %entry.component,
                    percent_diff = ?entry.percent_diff,
                    "fee record failed reconciliation"
                ),
                _ => debug!(
                    transaction_id = entry.transaction_id,
                    component = %entry.component,
                    status = ?entry.status,
                    "reconciled fee record"
                ),
            }
            entry
        })
        .collect();

    let summary = summarize(&entries);
    ReconciliationReport { entries, summary }
}

fn missing(record: &StoredFeeRecord, message: &str) -> ValidationEntry {
    ValidationEntry {
        transaction_id: record.transaction_id,
        component: record.component.clone(),
        status: ValidationStatus::Fail,
        percent_diff: None,
        stored_amount: record.amount,
        fresh_amount: None,
        message: Some(message.to_string()),
    }
}

fn compare(record: &StoredFeeRecord, fresh: Money, config: &ReconciliationConfig) -> ValidationEntry {
    let fresh = round_money(fresh, config.amount_precision);
    let stored_abs = record.amount.abs();
    let difference = (stored_abs - fresh.abs()).abs();
    let denominator = stored_abs.max(config.epsilon);

    let (status, percent_diff, message) = if difference.is_zero() {
        (ValidationStatus::Pass, Some(Decimal::ZERO), None)
    } else if denominator <= Decimal::ZERO {
        (
            ValidationStatus::Fail,
            None,
            Some(format!("stored amount is zero, fresh amount is {fresh}")),
        )
    } else {
        let pct = difference
            .checked_div(denominator)
            .and_then(|ratio| ratio.checked_mul(HUNDRED));
        match pct {
            Some(pct) => {
                let status = if pct <= config.warn_threshold_pct {
                    ValidationStatus::Warn
                } else {
                    ValidationStatus::Fail
                };
                (
                    status,
                    Some(pct),
                    Some(format!("stored {} vs fresh {fresh}", record.amount)),
                )
            }
            None => (
                ValidationStatus::Fail,
                None,
                Some(format!(
                    "difference between stored {} and fresh {fresh} is out of range",
                    record.amount
                )),
            ),
        }
    };

    ValidationEntry {
        transaction_id: record.transaction_id,
        component: record.component.clone(),
        status,
        percent_diff,
        stored_amount: record.amount,
        fresh_amount: Some(fresh),
        message,
    }
}

fn summarize(entries: &[ValidationEntry]) -> ReconciliationSummary {
    let count = |status: ValidationStatus| entries.iter().filter(|e| e.status == status).count();
    let diffs: Vec<Decimal> = entries.iter().filter_map(|e| e.percent_diff).collect();
    let mean_percent_diff = mean(&diffs);

    ReconciliationSummary {
        total: entries.len(),
        passed: count(ValidationStatus::Pass),
        warned: count(ValidationStatus::Warn),
        failed: count(ValidationStatus::Fail),
        mean_percent_diff,
        max_percent_diff: diffs.iter().copied().max(),
    }
}

/// Exact mean when the sum fits, otherwise the sum of per-entry shares.
fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let count = Decimal::from(values.len());
    let exact = values
        .iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(*v))
        .and_then(|total| total.checked_div(count));
    exact.or_else(|| {
        values
            .iter()
            .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v.checked_div(count)?))
    })
}
