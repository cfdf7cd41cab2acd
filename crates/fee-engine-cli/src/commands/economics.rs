use std::time::Instant;

use clap::Args;
use serde_json::Value;

use fee_engine_core::formula::cache::FormulaCache;
use fee_engine_core::formula::economics::{self, DealEconomicsInput};
use fee_engine_core::with_metadata;

use crate::input;

/// Arguments for evaluating a deal's formula template
#[derive(Args)]
pub struct EconomicsArgs {
    /// Path to JSON `{template, variables}` input
    #[arg(long)]
    pub input: Option<String>,
}

pub fn run_economics(args: EconomicsArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let econ_input: DealEconomicsInput = input::read_document(args.input.as_deref())?
        .map(serde_json::from_value::<DealEconomicsInput>)
        .transpose()?
        .ok_or("--input <file.json> or stdin required for deal economics")?;

    let cache = FormulaCache::new();
    let result = economics::calculate_deal_economics(&econ_input, &cache)?;

    let mut warnings = Vec::new();
    if econ_input.template.eq_proceeds_formula.is_some() && result.eq_proceeds.is_none() {
        warnings.push("Partner proceeds skipped: NCP is not bound".to_string());
    }
    if result.irr_pct.is_none() {
        warnings.push("IRR not computed (needs positive MOIC and T)".to_string());
    }

    let output = with_metadata(
        &format!("Deal economics ({})", econ_input.template.code),
        &econ_input.variables,
        warnings,
        start.elapsed().as_micros() as u64,
        result,
    );
    Ok(serde_json::to_value(output)?)
}
