use std::sync::OnceLock;

use napi::Result as NapiResult;
use napi_derive::napi;
use serde::Deserialize;
use serde_json::Value;

use fee_engine_core::config::deal_config_from_value;
use fee_engine_core::formula::cache::FormulaCache;
use fee_engine_core::formula::{self, economics, FormulaTestInput};
use fee_engine_core::reconciliation::{self, ReconciliationInput};
use fee_engine_core::schedule::calculator::calculate_with_cache;
use fee_engine_core::schedule::{CalculationRequest, CalculationResult};
use fee_engine_core::FeeEngineError;

/// Bounded LRU of compiled formulas shared by every call in the Node process.
fn formula_cache() -> &'static FormulaCache {
    static CACHE: OnceLock<FormulaCache> = OnceLock::new();
    CACHE.get_or_init(FormulaCache::new)
}

/// Convert any Display error into a napi::Error.
fn to_napi_error(e: impl std::fmt::Display) -> napi::Error {
    napi::Error::from_reason(e.to_string())
}

/// Engine errors carry their category so the portal can branch on it.
fn engine_error(e: FeeEngineError) -> napi::Error {
    napi::Error::from_reason(format!("{}: {}", e.category(), e))
}

fn default_round() -> u32 {
    2
}

#[derive(Deserialize)]
struct FeeCalculationInput {
    schedule: Value,
    request: CalculationRequest,
    #[serde(default = "default_round")]
    round: u32,
}

#[derive(Deserialize)]
struct FeeBatchInput {
    schedule: Value,
    requests: Vec<CalculationRequest>,
    #[serde(default = "default_round")]
    round: u32,
}

// ---------------------------------------------------------------------------
// Fee schedules
// ---------------------------------------------------------------------------

#[napi]
pub fn calculate_fees(input_json: String) -> NapiResult<String> {
    let input: FeeCalculationInput = serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let config = deal_config_from_value(input.schedule).map_err(engine_error)?;
    let calc_input = config.prepare_input(input.request.input);
    let result = calculate_with_cache(&config.schedule, &calc_input, formula_cache())
        .map_err(engine_error)?
        .rounded(input.round);
    serde_json::to_string(&result).map_err(to_napi_error)
}

#[napi]
pub fn calculate_fees_batch(input_json: String) -> NapiResult<String> {
    let input: FeeBatchInput = serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let config = deal_config_from_value(input.schedule).map_err(engine_error)?;
    let results = input
        .requests
        .into_iter()
        .map(|r| {
            let calc_input = config.prepare_input(r.input);
            calculate_with_cache(&config.schedule, &calc_input, formula_cache())
                .map(|result| result.rounded(input.round))
        })
        .collect::<Result<Vec<CalculationResult>, _>>()
        .map_err(engine_error)?;
    serde_json::to_string(&results).map_err(to_napi_error)
}

// ---------------------------------------------------------------------------
// Formulas
// ---------------------------------------------------------------------------

#[napi]
pub fn test_formula(input_json: String) -> NapiResult<String> {
    let input: FormulaTestInput = serde_json::from_str(&input_json).map_err(to_napi_error)?;
    serde_json::to_string(&formula::test_formula(&input)).map_err(to_napi_error)
}

#[napi]
pub fn validate_formula(expression: String) -> NapiResult<String> {
    serde_json::to_string(&formula::validate_formula(&expression)).map_err(to_napi_error)
}

#[napi]
pub fn calculate_deal_economics(input_json: String) -> NapiResult<String> {
    let input: economics::DealEconomicsInput =
        serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let output =
        economics::calculate_deal_economics(&input, formula_cache()).map_err(engine_error)?;
    serde_json::to_string(&output).map_err(to_napi_error)
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[napi]
pub fn reconcile_fees(input_json: String) -> NapiResult<String> {
    let input: ReconciliationInput = serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let report = reconciliation::validate(&input.fresh, &input.stored, &input.config);
    serde_json::to_string(&report).map_err(to_napi_error)
}
