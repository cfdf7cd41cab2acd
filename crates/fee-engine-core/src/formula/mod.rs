//! Deal formula language: arithmetic over named variables with `MIN`/`MAX`.
//!
//! Formulas are compiled once (`parse`) and evaluated many times with
//! different bindings (`evaluate`). Syntax errors surface at parse time so a
//! deal template can be rejected before it is ever used.

pub mod cache;
#[cfg(feature = "economics")]
pub mod economics;
pub mod eval;
pub mod lexer;
pub mod parser;

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FeeEngineError;
use crate::FeeEngineResult;
use parser::{Expr, Parser};

/// Variable bindings for one evaluation, keyed by variable code (`GC`, `NC`, ...).
pub type Variables = BTreeMap<String, Decimal>;

/// A parsed formula. Immutable once built and safe to share across threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFormula {
    expression: String,
    root: Expr,
    variables: Vec<String>,
}

impl CompiledFormula {
    /// Source text the formula was compiled from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Variable codes the formula references, sorted and de-duplicated.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Evaluate against `variables`. See [`evaluate`].
    pub fn evaluate(&self, variables: &Variables) -> FeeEngineResult<Decimal> {
        evaluate(self, variables)
    }
}

impl fmt::Display for CompiledFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

pub fn parse(expression: &str) -> FeeEngineResult<CompiledFormula> {
    let tokens = lexer::tokenize(expression)?;
    let root = Parser::new(tokens).parse_formula()?;

    let mut names = Vec::new();
    root.collect_variables(&mut names);
    let mut variables: Vec<String> = names.into_iter().map(str::to_string).collect();
    variables.sort();
    variables.dedup();

    Ok(CompiledFormula {
        expression: expression.to_string(),
        root,
        variables,
    })
}

pub fn evaluate(formula: &CompiledFormula, variables: &Variables) -> FeeEngineResult<Decimal> {
    eval::evaluate_expr(&formula.root, variables).map_err(FeeEngineError::from)
}

// ---------------------------------------------------------------------------
// Formula test / validation interface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaTestInput {
    pub formula: String,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaTestOutput {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Variables a caller must bind before evaluating
    pub required_variables: Vec<String>,
}

/// Check syntax without evaluating.
pub fn validate_formula(expression: &str) -> FormulaValidation {
    match parse(expression) {
        Ok(compiled) => FormulaValidation {
            valid: true,
            error: None,
            required_variables: compiled.variables,
        },
        Err(e) => FormulaValidation {
            valid: false,
            error: Some(e.to_string()),
            required_variables: Vec::new(),
        },
    }
}

/// Run a formula against sample variables, folding every failure into the
/// response instead of returning an error.
pub fn test_formula(input: &FormulaTestInput) -> FormulaTestOutput {
    let outcome = parse(&input.formula).and_then(|compiled| compiled.evaluate(&input.variables));
    match outcome {
        Ok(result) => FormulaTestOutput {
            success: true,
            result: Some(result),
            error: None,
        },
        Err(e) => FormulaTestOutput {
            success: false,
            result: None,
            error: Some(e.to_string()),
        },
    }
}
