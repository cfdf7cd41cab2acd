use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal::MathematicalOps;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cache::FormulaCache;
use super::{CompiledFormula, Variables};
use crate::error::{EvaluationError, FeeEngineError};
use crate::types::{Money, Percent};
use crate::FeeEngineResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A deal's formula set: how its net capital and proceeds are computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaTemplate {
    pub code: String,
    pub name: String,
    pub nc_formula: String,
    pub investor_proceeds_formula: String,
    pub investor_proceeds_discount_formula: String,
    /// Partner ("eq") proceeds, evaluated only when `NCP` is bound
    #[serde(default)]
    pub eq_proceeds_formula: Option<String>,
    #[serde(default)]
    pub eq_proceeds_discount_formula: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealEconomicsInput {
    pub template: FormulaTemplate,
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealEconomicsOutput {
    pub net_capital: Money,
    pub investor_proceeds: Money,
    pub investor_proceeds_discounted: Money,
    pub eq_proceeds: Option<Money>,
    pub eq_proceeds_discounted: Option<Money>,
    /// `NC * EUP / IUP`
    pub gross_proceeds: Money,
    pub total_fees: Money,
    pub total_fees_discounted: Money,
    pub moic: Decimal,
    /// Annualised, as a percent figure
    pub irr_pct: Option<Percent>,
}

/// Compiled form of a [`FormulaTemplate`]; building one validates every formula.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub nc: Arc<CompiledFormula>,
    pub investor_proceeds: Arc<CompiledFormula>,
    pub investor_proceeds_discount: Arc<CompiledFormula>,
    pub eq_proceeds: Option<Arc<CompiledFormula>>,
    pub eq_proceeds_discount: Option<Arc<CompiledFormula>>,
}

impl CompiledTemplate {
    pub fn compile(template: &FormulaTemplate, cache: &FormulaCache) -> FeeEngineResult<Self> {
        let compile = |field: &str, expression: &str| {
            cache.get_or_compile(expression).map_err(|e| match e {
                FeeEngineError::FormulaSyntax { position, reason } => FeeEngineError::FormulaSyntax {
                    position,
                    reason: format!("{field}: {reason}"),
                },
                other => other,
            })
        };

        Ok(CompiledTemplate {
            nc: compile("nc_formula", &template.nc_formula)?,
            investor_proceeds: compile(
                "investor_proceeds_formula",
                &template.investor_proceeds_formula,
            )?,
            investor_proceeds_discount: compile(
                "investor_proceeds_discount_formula",
                &template.investor_proceeds_discount_formula,
            )?,
            eq_proceeds: template
                .eq_proceeds_formula
                .as_deref()
                .map(|f| compile("eq_proceeds_formula", f))
                .transpose()?,
            eq_proceeds_discount: template
                .eq_proceeds_discount_formula
                .as_deref()
                .map(|f| compile("eq_proceeds_discount_formula", f))
                .transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Calculation
// ---------------------------------------------------------------------------

/// Evaluate a deal's formula template.
///
/// Net capital is computed first and bound as `NC` for every later formula.
/// Partner proceeds are only produced when the template defines them and the
/// caller bound `NCP`. Fees are the gap between gross proceeds
/// (`NC * EUP / IUP`) and what the investor actually receives; `T` (years)
/// defaults to 1 for the IRR.
pub fn calculate_deal_economics(
    input: &DealEconomicsInput,
    cache: &FormulaCache,
) -> FeeEngineResult<DealEconomicsOutput> {
    let compiled = CompiledTemplate::compile(&input.template, cache)?;

    let net_capital = compiled.nc.evaluate(&input.variables)?;
    let mut vars = input.variables.clone();
    vars.insert("NC".into(), net_capital);

    let investor_proceeds = compiled.investor_proceeds.evaluate(&vars)?;
    let investor_proceeds_discounted = compiled.investor_proceeds_discount.evaluate(&vars)?;

    let (eq_proceeds, eq_proceeds_discounted) = if vars.contains_key("NCP") {
        let plain = compiled
            .eq_proceeds
            .as_ref()
            .map(|f| f.evaluate(&vars))
            .transpose()?;
        let discounted = compiled
            .eq_proceeds_discount
            .as_ref()
            .map(|f| f.evaluate(&vars))
            .transpose()?;
        (plain, discounted)
    } else {
        (None, None)
    };

    let eup = require(&vars, "EUP")?;
    let iup = require(&vars, "IUP")?;
    if iup.is_zero() {
        return Err(FeeEngineError::DivisionByZero {
            context: "gross proceeds (IUP is zero)".into(),
        });
    }
    let gross_proceeds = checked(
        net_capital.checked_mul(eup).and_then(|v| v.checked_div(iup)),
        "gross proceeds (NC * EUP / IUP)",
    )?;
    let total_fees = checked(
        gross_proceeds.checked_sub(investor_proceeds),
        "total fees",
    )?;
    let total_fees_discounted = checked(
        gross_proceeds.checked_sub(investor_proceeds_discounted),
        "discounted total fees",
    )?;

    if net_capital.is_zero() {
        return Err(FeeEngineError::DivisionByZero {
            context: "MOIC (net capital is zero)".into(),
        });
    }
    let moic = checked(investor_proceeds.checked_div(net_capital), "MOIC")?;

    let years = vars.get("T").copied().unwrap_or(Decimal::ONE);
    let irr_pct = if years > Decimal::ZERO && moic > Decimal::ZERO {
        Decimal::ONE
            .checked_div(years)
            .and_then(|exponent| moic.checked_powd(exponent))
            .and_then(|growth| growth.checked_sub(Decimal::ONE)?.checked_mul(dec!(100)))
    } else {
        None
    };

    debug!(
        template = %input.template.code,
        %net_capital,
        %investor_proceeds,
        "evaluated deal economics"
    );

    Ok(DealEconomicsOutput {
        net_capital,
        investor_proceeds,
        investor_proceeds_discounted,
        eq_proceeds,
        eq_proceeds_discounted,
        gross_proceeds,
        total_fees,
        total_fees_discounted,
        moic,
        irr_pct,
    })
}

fn checked(value: Option<Decimal>, operation: &str) -> FeeEngineResult<Decimal> {
    value.ok_or_else(|| {
        EvaluationError::Overflow {
            operation: operation.to_string(),
        }
        .into()
    })
}

fn require(vars: &Variables, name: &str) -> FeeEngineResult<Decimal> {
    vars.get(name).copied().ok_or_else(|| {
        FeeEngineError::from(EvaluationError::MissingVariable {
            name: name.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> FormulaTemplate {
        FormulaTemplate {
            code: "STANDARD_PREMIUM".into(),
            name: "Standard premium deal".into(),
            nc_formula: "GC * (PMSP/ISP)".into(),
            investor_proceeds_formula: "NC * (EUP/IUP) - NC * MFR * T - MAX(NC * (EUP/IUP) - NC, 0) * PFR".into(),
            investor_proceeds_discount_formula: "NC * (EUP/IUP) - NC * MFR * T * (1 - MFD) - MAX(NC * (EUP/IUP) - NC, 0) * PFR".into(),
            eq_proceeds_formula: Some("NCP * (EUP/IUP)".into()),
            eq_proceeds_discount_formula: Some("NCP * (EUP/IUP)".into()),
        }
    }

    fn variables() -> Variables {
        [
            ("GC", dec!(125000)),
            ("PMSP", dec!(100)),
            ("ISP", dec!(125)),
            ("EUP", dec!(2)),
            ("IUP", dec!(1)),
            ("MFR", dec!(0.02)),
            ("MFD", dec!(0.5)),
            ("PFR", dec!(0.2)),
            ("T", dec!(4)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn test_net_capital_feeds_proceeds() {
        let cache = FormulaCache::new();
        let out = calculate_deal_economics(
            &DealEconomicsInput {
                template: template(),
                variables: variables(),
            },
            &cache,
        )
        .unwrap();

        // 125000 * 100 / 125
        assert_eq!(out.net_capital, dec!(100000));
        assert_eq!(out.gross_proceeds, dec!(200000));
        // 200000 - 8000 - 20000
        assert_eq!(out.investor_proceeds, dec!(172000));
        // 200000 - 4000 - 20000
        assert_eq!(out.investor_proceeds_discounted, dec!(176000));
        assert_eq!(out.total_fees, dec!(28000));
        assert_eq!(out.total_fees_discounted, dec!(24000));
        assert_eq!(out.moic, dec!(1.72));
        assert!(out.irr_pct.is_some());
        assert_eq!(out.eq_proceeds, None);
    }

    #[test]
    fn test_partner_proceeds_need_ncp() {
        let cache = FormulaCache::new();
        let mut vars = variables();
        vars.insert("NCP".into(), dec!(5000));
        let out = calculate_deal_economics(
            &DealEconomicsInput {
                template: template(),
                variables: vars,
            },
            &cache,
        )
        .unwrap();
        assert_eq!(out.eq_proceeds, Some(dec!(10000)));
        assert_eq!(out.eq_proceeds_discounted, Some(dec!(10000)));
    }

    #[test]
    fn test_invalid_template_rejected_before_evaluation() {
        let cache = FormulaCache::new();
        let mut bad = template();
        bad.investor_proceeds_formula = "NC * (EUP/IUP".into();
        let err = calculate_deal_economics(
            &DealEconomicsInput {
                template: bad,
                variables: variables(),
            },
            &cache,
        )
        .unwrap_err();
        assert_eq!(err.category(), "FormulaSyntaxError");
        assert!(err.to_string().contains("investor_proceeds_formula"));
    }

    #[test]
    fn test_gross_proceeds_overflow_is_an_evaluation_error() {
        let cache = FormulaCache::new();
        let mut bad = template();
        bad.nc_formula = "GC".into();
        bad.investor_proceeds_formula = "NC".into();
        bad.investor_proceeds_discount_formula = "NC".into();
        let mut vars = variables();
        vars.insert("GC".into(), Decimal::from_i128_with_scale(10_i128.pow(19), 0));
        vars.insert("EUP".into(), Decimal::from(100_000_000_000_u64));
        vars.insert("IUP".into(), Decimal::ONE);

        let err = calculate_deal_economics(
            &DealEconomicsInput {
                template: bad,
                variables: vars,
            },
            &cache,
        )
        .unwrap_err();
        assert_eq!(err.category(), "EvaluationError");
        assert!(err.to_string().contains("gross proceeds"));
    }

    #[test]
    fn test_fee_gap_overflow_is_an_evaluation_error() {
        let cache = FormulaCache::new();
        let mut bad = template();
        bad.nc_formula = "GC".into();
        bad.investor_proceeds_formula = "0 - BIG".into();
        bad.investor_proceeds_discount_formula = "NC".into();
        let mut vars = variables();
        vars.insert("GC".into(), dec!(1));
        vars.insert("EUP".into(), Decimal::MAX);
        vars.insert("IUP".into(), Decimal::ONE);
        vars.insert("BIG".into(), Decimal::MAX);

        let err = calculate_deal_economics(
            &DealEconomicsInput {
                template: bad,
                variables: vars,
            },
            &cache,
        )
        .unwrap_err();
        assert_eq!(
            err,
            FeeEngineError::Evaluation(EvaluationError::Overflow {
                operation: "total fees".into()
            })
        );
    }

    #[test]
    fn test_templates_share_cached_formulas() {
        let cache = FormulaCache::new();
        let input = DealEconomicsInput {
            template: template(),
            variables: variables(),
        };
        calculate_deal_economics(&input, &cache).unwrap();
        let compiled = cache.len();
        calculate_deal_economics(&input, &cache).unwrap();
        assert_eq!(cache.len(), compiled);
    }
}
