use std::str::FromStr;
use std::time::Instant;

use clap::Args;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use fee_engine_core::config::{deal_config_from_value, DealFeeConfig};
use fee_engine_core::decimal::round_money;
use fee_engine_core::schedule::calculator::{calculate, calculate_batch};
use fee_engine_core::schedule::{CalculationInput, CalculationRequest, DiscountInput};
use fee_engine_core::{with_metadata, DealId};

use crate::input;

/// Arguments for a single investor calculation
#[derive(Args)]
pub struct CalculateArgs {
    /// Deal fee schedule: configuration document or serialized schedule (JSON or YAML)
    #[arg(long)]
    pub schedule: String,

    /// Path to JSON calculation request (overrides individual flags)
    #[arg(long)]
    pub input: Option<String>,

    /// Gross capital committed by the investor
    #[arg(long)]
    pub gross: Option<Decimal>,

    /// Price per unit
    #[arg(long)]
    pub unit_price: Option<Decimal>,

    /// Investor discount as COMPONENT:PERCENT (repeatable), e.g. STRUCTURING_DISCOUNT:50
    #[arg(long = "discount")]
    pub discounts: Vec<String>,

    /// Decimal places for presented amounts
    #[arg(long, default_value_t = 2)]
    pub round: u32,
}

pub fn run_calculate(args: CalculateArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let config = load_schedule(&args.schedule)?;

    let request: CalculationRequest = match input::read_document(args.input.as_deref())? {
        Some(data) => serde_json::from_value(data)?,
        None => {
            let gross = args
                .gross
                .ok_or("--gross is required (or provide --input)")?;
            let unit_price = args
                .unit_price
                .ok_or("--unit-price is required (or provide --input)")?;
            let mut calc_input = CalculationInput::new(gross, unit_price);
            calc_input.discounts = args
                .discounts
                .iter()
                .map(|d| parse_discount(d))
                .collect::<Result<_, _>>()?;
            CalculationRequest {
                deal_id: None,
                input: calc_input,
            }
        }
    };

    check_deal(&config, request.deal_id);
    let calc_input = config.prepare_input(request.input);
    let result = calculate(&config.schedule, &calc_input)?.rounded(args.round);
    info!(
        deal_id = ?config.schedule.deal_id,
        units = result.units,
        "calculated fee schedule"
    );

    let warnings = result.metadata.warnings.clone();
    let output = with_metadata(
        "Precedence-ordered fee schedule",
        &json!({
            "deal_id": config.schedule.deal_id,
            "rounding_dp": args.round,
            "components": config.schedule.components.len(),
        }),
        warnings,
        start.elapsed().as_micros() as u64,
        result,
    );
    Ok(serde_json::to_value(output)?)
}

/// Arguments for a batch of investors on one deal
#[derive(Args)]
pub struct BatchArgs {
    /// Deal fee schedule: configuration document or serialized schedule (JSON or YAML)
    #[arg(long)]
    pub schedule: String,

    /// Path to a JSON array of calculation requests (or `{"requests": [...]}`)
    #[arg(long)]
    pub input: Option<String>,

    /// Decimal places for presented amounts
    #[arg(long, default_value_t = 2)]
    pub round: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchDocument {
    Requests(Vec<CalculationRequest>),
    Wrapped { requests: Vec<CalculationRequest> },
}

pub fn run_batch(args: BatchArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let config = load_schedule(&args.schedule)?;

    let data = input::read_document(args.input.as_deref())?
        .ok_or("--input <requests.json> or stdin required for batch")?;
    let requests = match serde_json::from_value::<BatchDocument>(data)? {
        BatchDocument::Requests(requests) | BatchDocument::Wrapped { requests } => requests,
    };

    let inputs: Vec<CalculationInput> = requests
        .into_iter()
        .map(|r| {
            check_deal(&config, r.deal_id);
            config.prepare_input(r.input)
        })
        .collect();
    let results = calculate_batch(&config.schedule, &inputs)?;

    let total_transfer: Decimal = results.iter().map(|r| r.transfer_post_discount).sum();
    let total_units: u64 = results.iter().map(|r| r.units).sum();
    let warnings: Vec<String> = results
        .iter()
        .enumerate()
        .flat_map(|(i, r)| {
            r.metadata
                .warnings
                .iter()
                .map(move |w| format!("inputs[{i}]: {w}"))
        })
        .collect();
    let rounded: Vec<_> = results.iter().map(|r| r.rounded(args.round)).collect();
    info!(count = rounded.len(), "calculated batch");

    let output = with_metadata(
        "Precedence-ordered fee schedule, batch",
        &json!({
            "deal_id": config.schedule.deal_id,
            "rounding_dp": args.round,
            "inputs": inputs.len(),
        }),
        warnings,
        start.elapsed().as_micros() as u64,
        json!({
            "total_transfer_post_discount": round_money(total_transfer, args.round),
            "total_units": total_units,
            "results": rounded,
        }),
    );
    Ok(serde_json::to_value(output)?)
}

fn load_schedule(path: &str) -> Result<DealFeeConfig, Box<dyn std::error::Error>> {
    let value = input::file::read_json_value(path)?;
    Ok(deal_config_from_value(value)?)
}

fn check_deal(config: &DealFeeConfig, requested: Option<DealId>) {
    if let (Some(requested), Some(configured)) = (requested, config.schedule.deal_id) {
        if requested != configured {
            warn!(requested, configured, "request deal id differs from schedule deal id");
        }
    }
}

/// `STRUCTURING_DISCOUNT:50` -> 50% off the structuring fee.
fn parse_discount(raw: &str) -> Result<DiscountInput, Box<dyn std::error::Error>> {
    let (component, percent) = raw
        .split_once(':')
        .ok_or_else(|| format!("discount '{raw}' must look like COMPONENT:PERCENT"))?;
    Ok(DiscountInput {
        component: component.parse()?,
        percent: Some(
            Decimal::from_str(percent.trim())
                .map_err(|e| format!("discount '{raw}': {e}"))?,
        ),
        amount: None,
    })
}
