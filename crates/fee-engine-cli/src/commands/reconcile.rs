use std::time::Instant;

use clap::Args;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use fee_engine_core::config::deal_config_from_value;
use fee_engine_core::reconciliation::{self, ReconciliationInput, TransactionCalculation};
use fee_engine_core::schedule::calculator::calculate_batch;
use fee_engine_core::schedule::CalculationInput;
use fee_engine_core::{with_metadata, TransactionId};

use crate::input;

/// Arguments for reconciling stored fee records
#[derive(Args)]
pub struct ReconcileArgs {
    /// Path to JSON `{fresh?, transactions?, stored, config?}` input
    #[arg(long)]
    pub input: Option<String>,

    /// Deal fee schedule used to recalculate `transactions`
    #[arg(long)]
    pub schedule: Option<String>,
}

/// A stored transaction to recalculate before comparing.
#[derive(Deserialize)]
struct TransactionRequest {
    transaction_id: TransactionId,
    #[serde(flatten)]
    input: CalculationInput,
}

#[derive(Deserialize)]
struct ReconcileDocument {
    #[serde(flatten)]
    base: ReconciliationInput,
    #[serde(default)]
    transactions: Vec<TransactionRequest>,
}

pub fn run_reconcile(args: ReconcileArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let data = input::read_document(args.input.as_deref())?
        .ok_or("--input <file.json> or stdin required for reconcile")?;
    let doc: ReconcileDocument = serde_json::from_value(data)?;
    let mut fresh = doc.base.fresh;

    if !doc.transactions.is_empty() {
        let path = args
            .schedule
            .as_deref()
            .ok_or("--schedule is required to recalculate transactions")?;
        let config = deal_config_from_value(input::file::read_json_value(path)?)?;
        let (ids, inputs): (Vec<TransactionId>, Vec<CalculationInput>) = doc
            .transactions
            .into_iter()
            .map(|t| (t.transaction_id, config.prepare_input(t.input)))
            .unzip();
        let results = calculate_batch(&config.schedule, &inputs)?;
        fresh.extend(
            ids.into_iter()
                .zip(results)
                .map(|(transaction_id, result)| TransactionCalculation {
                    transaction_id,
                    result,
                }),
        );
    }

    let report = reconciliation::validate(&fresh, &doc.base.stored, &doc.base.config);
    info!(
        total = report.summary.total,
        failed = report.summary.failed,
        "reconciled stored fees"
    );

    let mut warnings = Vec::new();
    if !report.is_clean() {
        warnings.push(format!(
            "{} of {} records differ; recalculate transactions {:?}",
            report.summary.warned + report.summary.failed,
            report.summary.total,
            report.recalculation_candidates()
        ));
    }

    let output = with_metadata(
        "Stored vs recalculated fee comparison",
        &json!({
            "config": doc.base.config,
            "fresh_calculations": fresh.len(),
        }),
        warnings,
        start.elapsed().as_micros() as u64,
        report,
    );
    Ok(serde_json::to_value(output)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_document_with_transactions() {
        let doc: ReconcileDocument = serde_json::from_str(
            r#"{
                "transactions": [{"transaction_id": 7, "gross_capital": "75000", "unit_price": "1000"}],
                "stored": [{"transaction_id": 7, "component": "PREMIUM", "amount": "2830.19"}],
                "config": {"warn_threshold_pct": "1"}
            }"#,
        )
        .unwrap();
        assert_eq!(doc.transactions[0].transaction_id, 7);
        assert_eq!(doc.transactions[0].input.gross_capital, dec!(75000));
        assert!(doc.base.fresh.is_empty());
        assert_eq!(doc.base.config.warn_threshold_pct, dec!(1));
        assert_eq!(doc.base.config.amount_precision, 2);
    }
}
