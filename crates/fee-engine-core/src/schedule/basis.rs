use rust_decimal::Decimal;

use super::{FeeBasis, ValuationDelta};
use crate::decimal::subtract;
use crate::types::Money;
use crate::FeeEngineResult;

/// Amounts accumulated while a schedule is being applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningState {
    pub gross_capital: Money,
    pub premium_so_far: Money,
    pub net_capital_so_far: Money,
    pub valuation: Option<ValuationDelta>,
}

impl RunningState {
    pub fn new(gross_capital: Money, valuation: Option<ValuationDelta>) -> Self {
        RunningState {
            gross_capital,
            premium_so_far: Decimal::ZERO,
            net_capital_so_far: gross_capital,
            valuation,
        }
    }
}

/// The amount a component's rate applies to, or `None` for `FIXED`.
///
/// `GAINS` without a valuation resolves to zero rather than failing, so a
/// performance fee on a deal that has not been revalued charges nothing.
pub fn resolve_basis(basis: FeeBasis, state: &RunningState) -> FeeEngineResult<Option<Money>> {
    let amount = match basis {
        FeeBasis::Gross => state.gross_capital,
        FeeBasis::Net | FeeBasis::NetAfterPremium => {
            subtract(state.gross_capital, state.premium_so_far)?
        }
        FeeBasis::Capital => state.net_capital_so_far,
        FeeBasis::Gains => match state.valuation {
            Some(v) => subtract(v.current, v.purchase)?.max(Decimal::ZERO),
            None => Decimal::ZERO,
        },
        FeeBasis::Fixed => return Ok(None),
    };
    Ok(Some(amount))
}
