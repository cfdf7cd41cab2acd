use std::str::FromStr;
use std::time::Instant;

use clap::Args;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use fee_engine_core::formula::{self, FormulaTestInput, Variables};
use fee_engine_core::with_metadata;

use crate::input;

/// Arguments for evaluating a formula against sample variables
#[derive(Args)]
pub struct FormulaTestArgs {
    /// Path to JSON `{formula, variables}` (overrides individual flags)
    #[arg(long)]
    pub input: Option<String>,

    /// Formula text, e.g. "GC * (PMSP/ISP)"
    #[arg(long, allow_hyphen_values = true)]
    pub formula: Option<String>,

    /// Variable binding as NAME=VALUE (repeatable)
    #[arg(long = "var", allow_hyphen_values = true)]
    pub vars: Vec<String>,
}

pub fn run_formula_test(args: FormulaTestArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let test_input: FormulaTestInput = match input::read_document(args.input.as_deref())? {
        Some(data) => serde_json::from_value(data)?,
        None => FormulaTestInput {
            formula: args
                .formula
                .ok_or("--formula is required (or provide --input)")?,
            variables: parse_vars(&args.vars)?,
        },
    };

    let outcome = formula::test_formula(&test_input);
    let warnings = outcome.error.iter().cloned().collect();
    let output = with_metadata(
        "Decimal formula evaluation",
        &json!({
            "formula": test_input.formula,
            "variables": test_input.variables,
        }),
        warnings,
        start.elapsed().as_micros() as u64,
        outcome,
    );
    Ok(serde_json::to_value(output)?)
}

/// Arguments for checking formula syntax
#[derive(Args)]
pub struct FormulaValidateArgs {
    /// Formula text
    #[arg(long, allow_hyphen_values = true)]
    pub formula: String,
}

pub fn run_formula_validate(args: FormulaValidateArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let validation = formula::validate_formula(&args.formula);
    let output = with_metadata(
        "Formula syntax check",
        &json!({ "formula": args.formula }),
        Vec::new(),
        start.elapsed().as_micros() as u64,
        validation,
    );
    Ok(serde_json::to_value(output)?)
}

fn parse_vars(raw: &[String]) -> Result<Variables, Box<dyn std::error::Error>> {
    let mut vars = Variables::new();
    for binding in raw {
        let (name, value) = binding
            .split_once('=')
            .ok_or_else(|| format!("variable '{binding}' must look like NAME=VALUE"))?;
        let value = Decimal::from_str(value.trim())
            .map_err(|e| format!("variable '{binding}': {e}"))?;
        vars.insert(name.trim().to_string(), value);
    }
    Ok(vars)
}
