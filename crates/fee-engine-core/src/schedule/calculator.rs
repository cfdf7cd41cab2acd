use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use super::basis::{resolve_basis, RunningState};
use super::*;
use crate::decimal::{add, divide_truncating, floor_to_integer, multiply, percent_of, subtract};
use crate::error::FeeEngineError;
use crate::formula::cache::FormulaCache;
use crate::formula::CompiledFormula;
use crate::FeeEngineResult;

/// Slack allowed when re-deriving totals from rounded-at-28-digits rows.
const INVARIANT_TOLERANCE: Decimal = dec!(0.0000001);

// ---------------------------------------------------------------------------
// Calculation
// ---------------------------------------------------------------------------

/// Apply a deal's fee schedule to one investor's commitment.
///
/// Components run in ascending precedence. Each resolves its basis against
/// the running state, so `NET` sees the premium and `CAPITAL` sees every
/// deduction made before it. Investor discounts are applied once the
/// schedule is done, against the fee they name. The transfer is clamped at
/// zero when discounts exceed fees, and units are floored from the
/// unrounded net capital.
///
/// Either the whole result is returned or an error is; there is no partial
/// state.
pub fn calculate(
    schedule: &FeeSchedule,
    input: &CalculationInput,
) -> FeeEngineResult<CalculationResult> {
    calculate_with_cache(
        schedule,
        input,
        &FormulaCache::with_capacity(schedule.components.len()),
    )
}

/// [`calculate`] with formula components compiled through a shared cache.
pub fn calculate_with_cache(
    schedule: &FeeSchedule,
    input: &CalculationInput,
    cache: &FormulaCache,
) -> FeeEngineResult<CalculationResult> {
    validate_input(schedule, input)?;

    let mut ordered: Vec<&FeeComponent> = schedule.components.iter().collect();
    // stable: equal precedence keeps declaration order
    ordered.sort_by_key(|c| c.precedence);

    let formulas = ordered
        .iter()
        .map(|c| c.formula.as_deref().map(|f| cache.get_or_compile(f)).transpose())
        .collect::<FeeEngineResult<Vec<Option<Arc<CompiledFormula>>>>>()?;

    let mut state = RunningState::new(input.gross_capital, input.valuation);
    let mut transfer_pre_discount = Decimal::ZERO;
    let mut total_discounts = Decimal::ZERO;
    let mut applied: Vec<AppliedFee> = Vec::with_capacity(ordered.len() + input.discounts.len());
    let mut warnings: Vec<String> = Vec::new();

    // --- Schedule components ---
    for (component, formula) in ordered.iter().zip(&formulas) {
        let basis_amount = resolve_basis(component.basis, &state)?;
        let (raw, rate, mut notes) =
            component_amount(component, basis_amount, formula.as_deref(), &state, input)?;

        let amount = match component.years {
            Some(years) => {
                notes.push_str(&format!(" x {years} years"));
                multiply(raw, Decimal::from(years))?
            }
            None => raw,
        };

        let direction = component.effective_direction();
        let amount = if component.component.is_discount() {
            let amount = amount.abs();
            total_discounts = add(total_discounts, amount)?;
            amount
        } else {
            transfer_pre_discount = add(transfer_pre_discount, amount)?;
            if component.component.is_premium() {
                state.premium_so_far = add(state.premium_so_far, amount)?;
            }
            if direction == FeeDirection::DeductsNet {
                state.net_capital_so_far = subtract(state.net_capital_so_far, amount)?;
            }
            amount
        };

        debug!(
            component = %component.component,
            basis = %component.basis,
            precedence = component.precedence,
            %amount,
            "applied fee component"
        );

        applied.push(AppliedFee {
            component: component.component.clone(),
            basis: component.basis,
            amount,
            rate,
            precedence: Some(component.precedence),
            direction,
            notes,
        });
    }

    // --- Investor discounts ---
    for discount in &input.discounts {
        let target = discount.component.discounted_component();
        let base = target.as_ref().and_then(|t| applied_base_fee(&applied, t));
        let Some((base_amount, basis)) = base else {
            let message = format!(
                "Base fee not found for {}; discount ignored",
                discount.component
            );
            warn!(component = %discount.component, "{message}");
            warnings.push(message);
            continue;
        };

        let (amount, rate, notes) = match (discount.percent, discount.amount) {
            (Some(percent), None) => (
                percent_of(base_amount, percent)?,
                Some(percent),
                format!("{percent}% of {base_amount}"),
            ),
            (None, Some(flat)) if flat > base_amount => (
                base_amount,
                None,
                format!("flat {flat} capped at base fee {base_amount}"),
            ),
            (None, Some(flat)) => (flat, None, format!("flat {flat}")),
            _ => {
                return Err(FeeEngineError::config(
                    "discounts",
                    format!("{} needs exactly one of percent or amount", discount.component),
                ))
            }
        };

        total_discounts = add(total_discounts, amount)?;
        debug!(component = %discount.component, %amount, "applied investor discount");
        applied.push(AppliedFee {
            component: discount.component.clone(),
            basis,
            amount,
            rate,
            precedence: None,
            direction: FeeDirection::AddsTransfer,
            notes,
        });
    }

    // --- Totals ---
    let discount_capped = total_discounts > transfer_pre_discount;
    let transfer_post_discount = if discount_capped {
        let message = format!(
            "Discounts ({total_discounts}) exceed fees ({transfer_pre_discount}); transfer clamped to zero"
        );
        warn!(%total_discounts, %transfer_pre_discount, "discounts exceed fees");
        warnings.push(message);
        Decimal::ZERO
    } else {
        subtract(transfer_pre_discount, total_discounts)?
    };

    let net_capital = state.net_capital_so_far;
    if net_capital.is_sign_negative() && !net_capital.is_zero() {
        return Err(FeeEngineError::config(
            "components",
            format!("Deductions exceed gross capital (net capital {net_capital})"),
        ));
    }
    let units = floor_to_integer(divide_truncating(net_capital, input.unit_price)?)?;

    let precedence_order = ordered
        .iter()
        .map(|c| c.component.as_str())
        .collect::<Vec<_>>()
        .join(" -> ");

    let mut result = CalculationResult {
        gross_capital: input.gross_capital,
        premium_amount: state.premium_so_far,
        net_capital,
        transfer_pre_discount,
        total_discounts,
        transfer_post_discount,
        unit_price: input.unit_price,
        units,
        applied_fees: applied,
        metadata: CalculationMetadata {
            deal_id: schedule.deal_id,
            precedence_order,
            discount_capped,
            warnings,
            invariants: InvariantCheck::default(),
        },
    };
    result.metadata.invariants = check_invariants(&result);
    Ok(result)
}

/// Run one schedule against many investors, sharing compiled formulas.
/// Stops at the first failing input.
pub fn calculate_batch(
    schedule: &FeeSchedule,
    inputs: &[CalculationInput],
) -> FeeEngineResult<Vec<CalculationResult>> {
    let cache = FormulaCache::with_capacity(schedule.components.len());
    inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            calculate_with_cache(schedule, input, &cache).map_err(|e| match e {
                FeeEngineError::Config { field, reason } => FeeEngineError::Config {
                    field: format!("inputs[{index}].{field}"),
                    reason,
                },
                other => other,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_input(schedule: &FeeSchedule, input: &CalculationInput) -> FeeEngineResult<()> {
    if input.gross_capital <= Decimal::ZERO {
        return Err(FeeEngineError::config(
            "gross_capital",
            "Gross capital must be positive",
        ));
    }
    if input.unit_price <= Decimal::ZERO {
        return Err(FeeEngineError::config(
            "unit_price",
            "Unit price must be positive",
        ));
    }
    if schedule.components.is_empty() {
        return Err(FeeEngineError::config(
            "components",
            "Fee schedule has no components",
        ));
    }

    let mut seen = HashSet::new();
    for c in &schedule.components {
        let field = format!("components.{}", c.component);
        let is_discount = c.component.is_discount();

        if c.precedence == 0 {
            return Err(FeeEngineError::config(field, "Precedence starts at 1"));
        }
        if c.component.is_premium() {
            if c.precedence != 1 {
                return Err(FeeEngineError::config(
                    field,
                    format!("PREMIUM must have precedence 1, got {}", c.precedence),
                ));
            }
            if c.years.is_some() {
                return Err(FeeEngineError::config(field, "PREMIUM cannot be annual"));
            }
        }
        if c.years == Some(0) {
            return Err(FeeEngineError::config(field, "years must be at least 1"));
        }

        match &c.formula {
            Some(formula) if formula.trim().is_empty() => {
                return Err(FeeEngineError::config(field, "formula is empty"));
            }
            Some(_) => {}
            None if c.is_percent => {
                if c.basis == FeeBasis::Fixed {
                    return Err(FeeEngineError::config(
                        field,
                        "Percent component cannot use FIXED basis",
                    ));
                }
                if c.rate.is_sign_negative() && !c.rate.is_zero() && !is_discount {
                    return Err(FeeEngineError::config(field, "Rate cannot be negative"));
                }
            }
            None => match c.fixed_amount {
                None => {
                    return Err(FeeEngineError::config(
                        field,
                        "fixed_amount is required when is_percent is false",
                    ));
                }
                Some(amount) if amount < Decimal::ZERO && !is_discount => {
                    return Err(FeeEngineError::config(
                        field,
                        "Fixed amount cannot be negative",
                    ));
                }
                Some(_) => {}
            },
        }

        validate_gains_terms(c, &field)?;

        if !seen.insert(c.precedence) && !schedule.allow_precedence_ties {
            return Err(FeeEngineError::config(
                field,
                format!("Duplicate precedence {}", c.precedence),
            ));
        }
    }

    let has_premium = schedule.components.iter().any(|c| c.component.is_premium());
    let at_first = schedule
        .components
        .iter()
        .filter(|c| c.precedence == 1)
        .count();
    if has_premium && at_first > 1 {
        return Err(FeeEngineError::config(
            "components.PREMIUM",
            "PREMIUM must be the only component at precedence 1",
        ));
    }

    for d in &input.discounts {
        let field = format!("discounts.{}", d.component);
        if !d.component.is_discount() {
            return Err(FeeEngineError::config(field, "Not a discount component"));
        }
        match (d.percent, d.amount) {
            (Some(v), None) | (None, Some(v)) if v >= Decimal::ZERO => {}
            (Some(_), None) | (None, Some(_)) => {
                return Err(FeeEngineError::config(field, "Discount cannot be negative"));
            }
            _ => {
                return Err(FeeEngineError::config(
                    field,
                    "Exactly one of percent or amount is required",
                ));
            }
        }
    }

    Ok(())
}

/// Hurdle and tier settings only make sense on a percent row.
fn validate_gains_terms(c: &FeeComponent, field: &str) -> FeeEngineResult<()> {
    let percent_row = c.is_percent && c.formula.is_none();
    if let Some(hurdle) = c.hurdle_rate {
        if !percent_row || c.basis != FeeBasis::Gains {
            return Err(FeeEngineError::config(
                field,
                "hurdle_rate needs a percent component on GAINS basis",
            ));
        }
        if hurdle < Decimal::ZERO || hurdle > dec!(100) {
            return Err(FeeEngineError::config(
                field,
                format!("hurdle_rate must be between 0 and 100, got {hurdle}"),
            ));
        }
    }
    if c.catch_up && c.hurdle_rate.is_none() {
        return Err(FeeEngineError::config(field, "catch_up needs a hurdle_rate"));
    }

    if !c.tiers.is_empty() && !percent_row {
        return Err(FeeEngineError::config(field, "tiers need a percent component"));
    }
    let mut thresholds = HashSet::new();
    for tier in &c.tiers {
        if tier.threshold < Decimal::ZERO || tier.rate < Decimal::ZERO {
            return Err(FeeEngineError::config(
                field,
                "Tier threshold and rate cannot be negative",
            ));
        }
        if !thresholds.insert(tier.threshold) {
            return Err(FeeEngineError::config(
                field,
                format!("Duplicate tier threshold {}", tier.threshold),
            ));
        }
    }
    Ok(())
}

/// Performance fee on `gains` above a hurdle.
///
/// The hurdle keeps `hurdle` percent of the gains back from the fee. With
/// catch-up the rate is also charged on the hurdle amount, limited to the
/// gains above the hurdle.
fn hurdle_fee(
    gains: Money,
    rate: Percent,
    hurdle: Percent,
    catch_up: bool,
) -> FeeEngineResult<(Money, String)> {
    if gains <= Decimal::ZERO {
        return Ok((Decimal::ZERO, "no gains".into()));
    }
    if hurdle.is_zero() {
        return Ok((percent_of(gains, rate)?, format!("{rate}% of gains ({gains})")));
    }

    let hurdle_amount = percent_of(gains, hurdle)?;
    let excess = subtract(gains, hurdle_amount)?;
    if excess <= Decimal::ZERO {
        return Ok((Decimal::ZERO, format!("gains ({gains}) within {hurdle}% hurdle")));
    }
    if !catch_up {
        return Ok((
            percent_of(excess, rate)?,
            format!("{rate}% of gains above {hurdle}% hurdle ({excess})"),
        ));
    }

    let catch_up_amount = percent_of(hurdle_amount, rate)?;
    let remaining = subtract(excess, catch_up_amount)?;
    if remaining > Decimal::ZERO {
        Ok((
            add(catch_up_amount, percent_of(remaining, rate)?)?,
            format!("{rate}% with catch-up of {catch_up_amount} over {hurdle}% hurdle"),
        ))
    } else {
        Ok((excess, format!("catch-up takes all gains above {hurdle}% hurdle ({excess})")))
    }
}

/// Raw amount of one schedule row with its effective rate and audit note.
fn component_amount(
    component: &FeeComponent,
    basis_amount: Option<Money>,
    formula: Option<&CompiledFormula>,
    state: &RunningState,
    input: &CalculationInput,
) -> FeeEngineResult<(Money, Option<Percent>, String)> {
    if let Some(formula) = formula {
        let mut vars = input.variables.clone();
        vars.insert("GC".into(), state.gross_capital);
        vars.insert("NC".into(), state.net_capital_so_far);
        vars.insert("PA".into(), state.premium_so_far);
        vars.insert("UP".into(), input.unit_price);
        vars.insert("BASIS".into(), basis_amount.unwrap_or(Decimal::ZERO));
        vars.insert("RATE".into(), component.rate);
        let amount = formula.evaluate(&vars)?;
        if amount < Decimal::ZERO && !component.component.is_discount() {
            return Err(FeeEngineError::config(
                format!("components.{}", component.component),
                format!("formula {formula} produced a negative fee ({amount})"),
            ));
        }
        return Ok((amount, None, format!("formula {formula}")));
    }

    match (component.is_percent, basis_amount) {
        (true, Some(base)) => {
            let (rate, tier_note) = match component.tier_for(state.gross_capital) {
                Some(tier) => (tier.rate, format!(", tier from {}", tier.threshold)),
                None => (component.rate, String::new()),
            };
            let (amount, note) = match component.hurdle_rate {
                Some(hurdle) => hurdle_fee(base, rate, hurdle, component.catch_up)?,
                None => (
                    percent_of(base, rate)?,
                    format!("{rate}% of {} ({base})", component.basis),
                ),
            };
            Ok((amount, Some(rate), note + &tier_note))
        }
        _ => {
            let amount = component.fixed_amount.ok_or_else(|| {
                FeeEngineError::config(
                    format!("components.{}", component.component),
                    "fixed_amount is required when is_percent is false",
                )
            })?;
            Ok((amount, None, format!("fixed {amount}")))
        }
    }
}

/// Total already applied for `target` and the basis of its first row.
fn applied_base_fee(applied: &[AppliedFee], target: &FeeComponentType) -> Option<(Money, FeeBasis)> {
    let mut rows = applied.iter().filter(|fee| &fee.component == target);
    let first = rows.next()?;
    let total = rows.fold(first.amount, |acc, fee| acc.saturating_add(fee.amount));
    Some((total, first.basis))
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

fn saturating_total<'a>(rows: impl Iterator<Item = &'a AppliedFee>) -> Money {
    rows.fold(Decimal::ZERO, |acc, fee| acc.saturating_add(fee.amount))
}

/// Re-derive a result's totals from its applied rows.
///
/// Runs on every calculated result and is also usable on results read back
/// from storage.
pub fn check_invariants(result: &CalculationResult) -> InvariantCheck {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let differs = |a: Decimal, b: Decimal| a.saturating_sub(b).abs() > INVARIANT_TOLERANCE;

    let fees = result.applied_fees.iter().filter(|f| !f.is_discount());
    let premium = saturating_total(fees.clone().filter(|f| f.component.is_premium()));
    let deducted =
        saturating_total(fees.clone().filter(|f| f.direction == FeeDirection::DeductsNet));
    let pre = saturating_total(fees);
    let discounts = saturating_total(result.applied_fees.iter().filter(|f| f.is_discount()));

    if differs(premium, result.premium_amount) {
        errors.push(format!(
            "Premium {} does not match applied premium {premium}",
            result.premium_amount
        ));
    }
    if differs(result.gross_capital.saturating_sub(deducted), result.net_capital) {
        errors.push(format!(
            "Net capital {} does not equal gross {} less deductions {deducted}",
            result.net_capital, result.gross_capital
        ));
    }
    if differs(pre, result.transfer_pre_discount) {
        errors.push(format!(
            "Transfer before discounts {} does not equal applied fees {pre}",
            result.transfer_pre_discount
        ));
    }
    if differs(discounts, result.total_discounts) {
        errors.push(format!(
            "Total discounts {} does not equal applied discounts {discounts}",
            result.total_discounts
        ));
    }

    let expected_post = result
        .transfer_pre_discount
        .saturating_sub(result.total_discounts)
        .max(Decimal::ZERO);
    if differs(expected_post, result.transfer_post_discount) {
        errors.push(format!(
            "Transfer after discounts {} should be {expected_post}",
            result.transfer_post_discount
        ));
    }
    if result.transfer_post_discount < Decimal::ZERO {
        errors.push("Transfer after discounts is negative".into());
    }

    if let Some(position) = result.applied_fees.iter().position(|f| f.component.is_premium()) {
        if position != 0 {
            errors.push(format!("PREMIUM applied at position {}, not first", position + 1));
        }
    }

    if result.unit_price > Decimal::ZERO {
        match result.net_capital.checked_div(result.unit_price) {
            Some(exact) if exact.floor() != Decimal::from(result.units) => errors.push(format!(
                "Units {} should be {}",
                result.units,
                exact.floor()
            )),
            Some(_) => {}
            None => errors.push("Units could not be re-derived".into()),
        }
    }

    if result.units == 0 {
        warnings.push("No units allocated".into());
    }
    if result.transfer_post_discount.is_zero() && result.transfer_pre_discount > Decimal::ZERO {
        warnings.push("Discounts cover the full transfer".into());
    }

    InvariantCheck {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn premium(rate: Decimal) -> FeeComponent {
        FeeComponent::percent(FeeComponentType::Premium, FeeBasis::Gross, rate, 1)
    }

    fn standard_schedule() -> FeeSchedule {
        FeeSchedule::new(
            Some(28),
            vec![
                premium(dec!(2)),
                FeeComponent::percent(FeeComponentType::Structuring, FeeBasis::Net, dec!(4), 2),
                FeeComponent::fixed(FeeComponentType::Admin, dec!(350), 4),
            ],
        )
    }

    fn discount(component: FeeComponentType, percent: Decimal) -> DiscountInput {
        DiscountInput {
            component,
            percent: Some(percent),
            amount: None,
        }
    }

    #[test]
    fn test_premium_reduces_net_capital_and_units() {
        let schedule = FeeSchedule::new(Some(1), vec![premium(dec!(3.77358))]);
        let result = calculate(&schedule, &CalculationInput::new(dec!(100000), dec!(1000))).unwrap();

        assert_eq!(result.premium_amount, dec!(3773.58));
        assert_eq!(result.net_capital, dec!(96226.42));
        assert_eq!(result.units, 96);
        assert_eq!(result.transfer_pre_discount, dec!(3773.58));
        assert_eq!(result.transfer_post_discount, dec!(3773.58));
        assert!(result.metadata.invariants.valid);
    }

    #[test]
    fn test_fractional_premium_rounds_only_for_presentation() {
        let schedule = FeeSchedule::new(Some(1), vec![premium(dec!(3.77358))]);
        let result = calculate(&schedule, &CalculationInput::new(dec!(75000), dec!(1000))).unwrap();

        assert_eq!(result.premium_amount, dec!(2830.185));
        assert_eq!(result.units, 72);

        let shown = result.rounded(2);
        assert!((shown.premium_amount - dec!(2830.19)).abs() <= dec!(0.01));
        assert!((shown.net_capital - dec!(72169.81)).abs() <= dec!(0.01));
        assert_eq!(shown.units, 72);
    }

    #[test]
    fn test_structuring_and_admin_discounts() {
        let mut input = CalculationInput::new(dec!(100000), dec!(1000));
        let before = calculate(&standard_schedule(), &input).unwrap();

        input.discounts = vec![
            discount(FeeComponentType::StructuringDiscount, dec!(50)),
            discount(FeeComponentType::AdminDiscount, dec!(100)),
        ];
        let after = calculate(&standard_schedule(), &input).unwrap();

        // 2000 premium + 3920 structuring + 350 admin
        assert_eq!(after.transfer_pre_discount, dec!(6270));
        // 1960 + 350
        assert_eq!(after.total_discounts, dec!(2310));
        assert_eq!(after.transfer_post_discount, dec!(3960));
        assert!(after.transfer_post_discount < before.transfer_post_discount);
        assert_eq!(after.net_capital, before.net_capital);
        assert!(!after.metadata.discount_capped);

        let structuring_discount = after
            .amount_for(&FeeComponentType::StructuringDiscount)
            .unwrap();
        assert_eq!(structuring_discount, dec!(1960));
        assert_eq!(
            after.applied_fees.last().unwrap().signed_amount(),
            dec!(-350)
        );
    }

    #[test]
    fn test_discounts_exceeding_fees_clamp_to_zero() {
        let schedule = FeeSchedule::new(
            None,
            vec![
                FeeComponent::fixed(FeeComponentType::Admin, dec!(100), 4),
                FeeComponent::fixed(FeeComponentType::AdminDiscount, dec!(500), 5),
            ],
        );
        let result = calculate(&schedule, &CalculationInput::new(dec!(10000), dec!(10))).unwrap();

        assert_eq!(result.transfer_pre_discount, dec!(100));
        assert_eq!(result.total_discounts, dec!(500));
        assert_eq!(result.transfer_post_discount, Decimal::ZERO);
        assert!(result.metadata.discount_capped);
        assert_eq!(result.metadata.warnings.len(), 1);
        assert!(result.metadata.invariants.valid);
    }

    #[test]
    fn test_flat_discount_capped_at_base_fee() {
        let mut input = CalculationInput::new(dec!(100000), dec!(1000));
        input.discounts = vec![DiscountInput {
            component: FeeComponentType::AdminDiscount,
            percent: None,
            amount: Some(dec!(500)),
        }];
        let result = calculate(&standard_schedule(), &input).unwrap();
        assert_eq!(result.total_discounts, dec!(350));
    }

    #[test]
    fn test_discount_without_base_fee_is_warned_and_skipped() {
        let mut input = CalculationInput::new(dec!(100000), dec!(1000));
        input.discounts = vec![discount(FeeComponentType::ManagementDiscount, dec!(50))];
        let result = calculate(&standard_schedule(), &input).unwrap();

        assert_eq!(result.total_discounts, Decimal::ZERO);
        assert_eq!(result.applied_fees.len(), 3);
        assert!(result.metadata.warnings[0].contains("MANAGEMENT_DISCOUNT"));
    }

    #[test]
    fn test_deducting_components_reduce_capital_basis() {
        let mut structuring =
            FeeComponent::percent(FeeComponentType::Structuring, FeeBasis::Gross, dec!(1), 2);
        structuring.direction = Some(FeeDirection::DeductsNet);
        let schedule = FeeSchedule::new(
            None,
            vec![
                premium(dec!(2)),
                structuring,
                FeeComponent::percent(FeeComponentType::Admin, FeeBasis::Capital, dec!(1), 3),
            ],
        );
        let result = calculate(&schedule, &CalculationInput::new(dec!(100000), dec!(1000))).unwrap();

        assert_eq!(result.net_capital, dec!(97000));
        assert_eq!(result.units, 97);
        assert_eq!(result.amount_for(&FeeComponentType::Admin), Some(dec!(970)));
        assert!(result.metadata.invariants.valid);
    }

    #[test]
    fn test_performance_fee_on_gains() {
        let schedule = FeeSchedule::new(
            None,
            vec![FeeComponent::percent(
                FeeComponentType::Performance,
                FeeBasis::Gains,
                dec!(20),
                5,
            )],
        );
        let mut input = CalculationInput::new(dec!(100000), dec!(1000));
        input.valuation = Some(ValuationDelta {
            purchase: dec!(100000),
            current: dec!(150000),
        });
        let result = calculate(&schedule, &input).unwrap();
        assert_eq!(result.transfer_pre_discount, dec!(10000));

        input.valuation = None;
        let flat = calculate(&schedule, &input).unwrap();
        assert_eq!(flat.transfer_pre_discount, Decimal::ZERO);
    }

    #[test]
    fn test_annual_fee_multiplied_by_years() {
        let mut management =
            FeeComponent::percent(FeeComponentType::Management, FeeBasis::Gross, dec!(2), 3);
        management.years = Some(3);
        let schedule = FeeSchedule::new(None, vec![management]);
        let result = calculate(&schedule, &CalculationInput::new(dec!(100000), dec!(1000))).unwrap();
        assert_eq!(result.transfer_pre_discount, dec!(6000));
        assert!(result.applied_fees[0].notes.contains("3 years"));
    }

    #[test]
    fn test_formula_component() {
        let advisory = FeeComponent {
            formula: Some("MIN(GC * 0.01, 500) + MAX(NC - GC, 0)".into()),
            ..FeeComponent::fixed(FeeComponentType::Custom("ADVISORY".into()), Decimal::ZERO, 6)
        };
        let schedule = FeeSchedule::new(None, vec![premium(dec!(1)), advisory]);
        let result = calculate(&schedule, &CalculationInput::new(dec!(100000), dec!(1000))).unwrap();
        assert_eq!(
            result.amount_for(&FeeComponentType::Custom("ADVISORY".into())),
            Some(dec!(500))
        );
    }

    #[test]
    fn test_formula_component_syntax_error() {
        let broken = FeeComponent {
            formula: Some("GC * (0.01".into()),
            ..FeeComponent::fixed(FeeComponentType::Admin, Decimal::ZERO, 4)
        };
        let err = calculate(
            &FeeSchedule::new(None, vec![broken]),
            &CalculationInput::new(dec!(100), dec!(1)),
        )
        .unwrap_err();
        assert_eq!(err.category(), "FormulaSyntaxError");
    }

    #[test]
    fn test_duplicate_precedence_rejected() {
        let schedule = FeeSchedule::new(
            None,
            vec![
                FeeComponent::percent(FeeComponentType::Management, FeeBasis::Gross, dec!(1), 2),
                FeeComponent::percent(FeeComponentType::Structuring, FeeBasis::Gross, dec!(1), 2),
            ],
        );
        let err = calculate(&schedule, &CalculationInput::new(dec!(100), dec!(1))).unwrap_err();
        assert_eq!(err.category(), "ConfigError");
        assert!(err.to_string().contains("Duplicate precedence"));
    }

    #[test]
    fn test_precedence_ties_keep_declaration_order() {
        let mut schedule = FeeSchedule::new(
            None,
            vec![
                FeeComponent::fixed(FeeComponentType::Admin, dec!(10), 4),
                FeeComponent::percent(FeeComponentType::Management, FeeBasis::Gross, dec!(1), 2),
                FeeComponent::percent(FeeComponentType::Structuring, FeeBasis::Gross, dec!(1), 2),
                premium(dec!(1)),
            ],
        );
        schedule.allow_precedence_ties = true;
        let result = calculate(&schedule, &CalculationInput::new(dec!(1000), dec!(1))).unwrap();
        assert_eq!(
            result.metadata.precedence_order,
            "PREMIUM -> MANAGEMENT -> STRUCTURING -> ADMIN"
        );
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let schedule = standard_schedule();
        for (gross, price) in [(dec!(0), dec!(1)), (dec!(-5), dec!(1)), (dec!(100), dec!(0))] {
            let err = calculate(&schedule, &CalculationInput::new(gross, price)).unwrap_err();
            assert_eq!(err.category(), "ConfigError");
        }

        let empty = FeeSchedule::new(None, vec![]);
        assert!(calculate(&empty, &CalculationInput::new(dec!(1), dec!(1))).is_err());
    }

    #[test]
    fn test_invalid_components_rejected() {
        let input = CalculationInput::new(dec!(1000), dec!(1));
        let cases = vec![
            FeeComponent::percent(FeeComponentType::Premium, FeeBasis::Gross, dec!(1), 2),
            FeeComponent::percent(FeeComponentType::Admin, FeeBasis::Fixed, dec!(1), 4),
            FeeComponent::percent(FeeComponentType::Admin, FeeBasis::Gross, dec!(-1), 4),
            FeeComponent {
                fixed_amount: None,
                ..FeeComponent::fixed(FeeComponentType::Admin, dec!(1), 4)
            },
        ];
        for component in cases {
            let err = calculate(&FeeSchedule::new(None, vec![component]), &input).unwrap_err();
            assert_eq!(err.category(), "ConfigError");
        }
    }

    #[test]
    fn test_premium_above_gross_rejected() {
        let schedule = FeeSchedule::new(None, vec![premium(dec!(150))]);
        let err = calculate(&schedule, &CalculationInput::new(dec!(1000), dec!(1))).unwrap_err();
        assert_eq!(err.category(), "ConfigError");
    }

    fn discount_heavy_schedule() -> FeeSchedule {
        FeeSchedule::new(
            None,
            vec![
                FeeComponent::percent(FeeComponentType::Structuring, FeeBasis::Net, dec!(1), 2),
                FeeComponent::fixed(FeeComponentType::Admin, dec!(100), 4),
                FeeComponent::fixed(FeeComponentType::AdminDiscount, dec!(500), 5),
            ],
        )
    }

    fn capital_schedule() -> FeeSchedule {
        let mut structuring =
            FeeComponent::percent(FeeComponentType::Structuring, FeeBasis::Gross, dec!(1), 2);
        structuring.direction = Some(FeeDirection::DeductsNet);
        let mut management =
            FeeComponent::percent(FeeComponentType::Management, FeeBasis::Capital, dec!(0.5), 3);
        management.direction = Some(FeeDirection::DeductsNet);
        management.years = Some(2);
        FeeSchedule::new(
            Some(3),
            vec![
                premium(dec!(2)),
                structuring,
                management,
                FeeComponent::percent(FeeComponentType::Admin, FeeBasis::Capital, dec!(1), 4),
            ],
        )
    }

    fn formula_schedule() -> FeeSchedule {
        let advisory = FeeComponent {
            formula: Some("MIN(GC * 0.01, 500) + MAX(NC - GC, 0)".into()),
            ..FeeComponent::fixed(FeeComponentType::Custom("ADVISORY".into()), Decimal::ZERO, 3)
        };
        let mut performance =
            FeeComponent::percent(FeeComponentType::Performance, FeeBasis::Gains, dec!(20), 5);
        performance.hurdle_rate = Some(dec!(8));
        performance.catch_up = true;
        let mut management =
            FeeComponent::percent(FeeComponentType::Management, FeeBasis::Gross, dec!(2), 4);
        management.tiers = vec![
            RateTier::new(Decimal::ZERO, dec!(2)),
            RateTier::new(dec!(100000), dec!(1.5)),
        ];
        FeeSchedule::new(None, vec![premium(dec!(3.77358)), advisory, management, performance])
    }

    #[test]
    fn test_fee_rows_sum_to_totals() {
        let schedules = [
            standard_schedule(),
            discount_heavy_schedule(),
            capital_schedule(),
            formula_schedule(),
        ];
        let discounts = vec![
            discount(FeeComponentType::StructuringDiscount, dec!(25)),
            discount(FeeComponentType::AdminDiscount, dec!(100)),
        ];

        for schedule in &schedules {
            for i in 1..=40_i64 {
                let gross = Decimal::from(i * i * 7919) * dec!(0.37) + dec!(0.01);
                let mut input = CalculationInput::new(gross, dec!(7.5));
                if i % 2 == 0 {
                    input.discounts = discounts.clone();
                }
                if i % 3 == 0 {
                    input.valuation = Some(ValuationDelta {
                        purchase: gross,
                        current: gross * dec!(1.25),
                    });
                }
                let result = calculate(schedule, &input).unwrap();

                let sum: Money = result.applied_fees.iter().map(|f| f.amount).sum();
                assert_eq!(sum, result.transfer_pre_discount + result.total_discounts);
                assert!(result.transfer_post_discount >= Decimal::ZERO);
                assert!(result.net_capital <= result.gross_capital);
                assert_eq!(
                    Decimal::from(result.units),
                    (result.net_capital / result.unit_price).floor()
                );
                assert_eq!(
                    result.metadata.discount_capped,
                    result.total_discounts > result.transfer_pre_discount
                );
                assert!(result.metadata.invariants.valid, "{:?}", result.metadata.invariants);
            }
        }
    }

    #[test]
    fn test_calculation_is_idempotent() {
        let mut input = CalculationInput::new(dec!(75000), dec!(1000));
        input.discounts = vec![discount(FeeComponentType::AdminDiscount, dec!(100))];
        let a = calculate(&standard_schedule(), &input).unwrap();
        let b = calculate(&standard_schedule(), &input).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_batch_shares_schedule() {
        let inputs = vec![
            CalculationInput::new(dec!(100000), dec!(1000)),
            CalculationInput::new(dec!(50000), dec!(1000)),
        ];
        let results = calculate_batch(&standard_schedule(), &inputs).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].units, 49);

        let bad = vec![
            CalculationInput::new(dec!(100000), dec!(1000)),
            CalculationInput::new(dec!(0), dec!(1000)),
        ];
        let err = calculate_batch(&standard_schedule(), &bad).unwrap_err();
        assert!(err.to_string().contains("inputs[1]"));
    }

    fn performance(hurdle: Decimal, catch_up: bool) -> FeeSchedule {
        let mut fee =
            FeeComponent::percent(FeeComponentType::Performance, FeeBasis::Gains, dec!(20), 5);
        fee.hurdle_rate = Some(hurdle);
        fee.catch_up = catch_up;
        FeeSchedule::new(None, vec![fee])
    }

    fn revalued(current: Decimal) -> CalculationInput {
        let mut input = CalculationInput::new(dec!(100000), dec!(1000));
        input.valuation = Some(ValuationDelta {
            purchase: dec!(100000),
            current,
        });
        input
    }

    #[test]
    fn test_performance_fee_above_hurdle() {
        // gains 50000, hurdle keeps 4000 back
        let result = calculate(&performance(dec!(8), false), &revalued(dec!(150000))).unwrap();
        assert_eq!(result.transfer_pre_discount, dec!(9200));
        assert!(result.applied_fees[0].notes.contains("hurdle"));

        let none = calculate(&performance(dec!(100), false), &revalued(dec!(150000))).unwrap();
        assert_eq!(none.transfer_pre_discount, Decimal::ZERO);

        let no_gains = calculate(&performance(dec!(8), false), &revalued(dec!(90000))).unwrap();
        assert_eq!(no_gains.transfer_pre_discount, Decimal::ZERO);
    }

    #[test]
    fn test_performance_fee_catch_up() {
        // 800 catch-up on the 4000 hurdle + 20% of the remaining 45200
        let result = calculate(&performance(dec!(8), true), &revalued(dec!(150000))).unwrap();
        assert_eq!(result.transfer_pre_discount, dec!(9840));

        // hurdle 45000, catch-up 9000 exceeds the 5000 above it
        let capped = calculate(&performance(dec!(90), true), &revalued(dec!(150000))).unwrap();
        assert_eq!(capped.transfer_pre_discount, dec!(5000));

        let zero_hurdle =
            calculate(&performance(Decimal::ZERO, true), &revalued(dec!(150000))).unwrap();
        assert_eq!(zero_hurdle.transfer_pre_discount, dec!(10000));
    }

    #[test]
    fn test_invalid_hurdle_settings_rejected() {
        let input = revalued(dec!(150000));
        for hurdle in [dec!(-1), dec!(101)] {
            assert!(calculate(&performance(hurdle, false), &input).is_err());
        }

        let mut on_gross =
            FeeComponent::percent(FeeComponentType::Management, FeeBasis::Gross, dec!(2), 3);
        on_gross.hurdle_rate = Some(dec!(8));
        let err = calculate(&FeeSchedule::new(None, vec![on_gross]), &input).unwrap_err();
        assert!(err.to_string().contains("hurdle_rate"));

        let mut catch_up_only =
            FeeComponent::percent(FeeComponentType::Performance, FeeBasis::Gains, dec!(20), 5);
        catch_up_only.catch_up = true;
        assert!(calculate(&FeeSchedule::new(None, vec![catch_up_only]), &input).is_err());
    }

    #[test]
    fn test_tiered_rate_follows_commitment() {
        let mut management =
            FeeComponent::percent(FeeComponentType::Management, FeeBasis::Gross, dec!(2), 3);
        management.tiers = vec![
            RateTier::new(Decimal::ZERO, dec!(2)),
            RateTier::new(dec!(100000), dec!(1.5)),
            RateTier::new(dec!(1000000), dec!(1)),
        ];
        let schedule = FeeSchedule::new(None, vec![management]);

        let small = calculate(&schedule, &CalculationInput::new(dec!(50000), dec!(1000))).unwrap();
        assert_eq!(small.transfer_pre_discount, dec!(1000));
        let mid = calculate(&schedule, &CalculationInput::new(dec!(250000), dec!(1000))).unwrap();
        assert_eq!(mid.transfer_pre_discount, dec!(3750));
        assert_eq!(mid.applied_fees[0].rate, Some(dec!(1.5)));
        assert!(mid.applied_fees[0].notes.contains("tier from 100000"));
    }

    #[test]
    fn test_invalid_tiers_rejected() {
        let input = CalculationInput::new(dec!(1000), dec!(1));
        let mut duplicate =
            FeeComponent::percent(FeeComponentType::Management, FeeBasis::Gross, dec!(2), 3);
        duplicate.tiers = vec![RateTier::new(dec!(10), dec!(1)), RateTier::new(dec!(10), dec!(2))];
        let mut on_fixed = FeeComponent::fixed(FeeComponentType::Admin, dec!(5), 4);
        on_fixed.tiers = vec![RateTier::new(dec!(10), dec!(1))];
        let mut negative =
            FeeComponent::percent(FeeComponentType::Management, FeeBasis::Gross, dec!(2), 3);
        negative.tiers = vec![RateTier::new(dec!(10), dec!(-1))];

        for component in [duplicate, on_fixed, negative] {
            let err = calculate(&FeeSchedule::new(None, vec![component]), &input).unwrap_err();
            assert_eq!(err.category(), "ConfigError");
        }
    }

    #[test]
    fn test_negative_formula_fee_rejected() {
        let rebate = FeeComponent {
            formula: Some("0 - GC * 0.01".into()),
            direction: Some(FeeDirection::DeductsNet),
            ..FeeComponent::fixed(FeeComponentType::Custom("REBATE".into()), Decimal::ZERO, 6)
        };
        let err = calculate(
            &FeeSchedule::new(None, vec![rebate]),
            &CalculationInput::new(dec!(1000), dec!(1)),
        )
        .unwrap_err();
        assert_eq!(err.category(), "ConfigError");
        assert!(err.to_string().contains("negative fee"));

        // discounts may come out of a formula as negative figures
        let discount_formula = FeeComponent {
            formula: Some("0 - 50".into()),
            ..FeeComponent::fixed(FeeComponentType::AdminDiscount, Decimal::ZERO, 6)
        };
        let schedule = FeeSchedule::new(
            None,
            vec![FeeComponent::fixed(FeeComponentType::Admin, dec!(350), 4), discount_formula],
        );
        let result = calculate(&schedule, &CalculationInput::new(dec!(1000), dec!(1))).unwrap();
        assert_eq!(result.total_discounts, dec!(50));
    }

    #[test]
    fn test_tampered_result_fails_invariants() {
        let mut result =
            calculate(&standard_schedule(), &CalculationInput::new(dec!(100000), dec!(1000))).unwrap();
        result.net_capital = dec!(100000);
        result.units = 100;
        let check = check_invariants(&result);
        assert!(!check.valid);
        assert_eq!(check.errors.len(), 1);
    }
}
