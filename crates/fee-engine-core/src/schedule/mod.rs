//! Fee schedules and the precedence-ordered calculator that applies them.

pub mod basis;
pub mod calculator;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::decimal::round_money;
use crate::error::FeeEngineError;
use crate::formula::Variables;
use crate::types::*;

// ---------------------------------------------------------------------------
// Component and basis tags
// ---------------------------------------------------------------------------

/// What a schedule row charges for. Discounts are negative fees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FeeComponentType {
    Premium,
    Structuring,
    Management,
    Admin,
    Performance,
    StructuringDiscount,
    ManagementDiscount,
    AdminDiscount,
    /// Deal-specific name, upper-case `[A-Z0-9_]+`. A `_DISCOUNT` suffix marks a discount.
    Custom(String),
}

const DISCOUNT_SUFFIX: &str = "_DISCOUNT";

impl FeeComponentType {
    pub fn as_str(&self) -> &str {
        match self {
            FeeComponentType::Premium => "PREMIUM",
            FeeComponentType::Structuring => "STRUCTURING",
            FeeComponentType::Management => "MANAGEMENT",
            FeeComponentType::Admin => "ADMIN",
            FeeComponentType::Performance => "PERFORMANCE",
            FeeComponentType::StructuringDiscount => "STRUCTURING_DISCOUNT",
            FeeComponentType::ManagementDiscount => "MANAGEMENT_DISCOUNT",
            FeeComponentType::AdminDiscount => "ADMIN_DISCOUNT",
            FeeComponentType::Custom(name) => name,
        }
    }

    pub fn is_premium(&self) -> bool {
        matches!(self, FeeComponentType::Premium)
    }

    pub fn is_discount(&self) -> bool {
        match self {
            FeeComponentType::StructuringDiscount
            | FeeComponentType::ManagementDiscount
            | FeeComponentType::AdminDiscount => true,
            FeeComponentType::Custom(name) => name.ends_with(DISCOUNT_SUFFIX),
            _ => false,
        }
    }

    /// The fee a discount reduces: `STRUCTURING_DISCOUNT` -> `STRUCTURING`.
    pub fn discounted_component(&self) -> Option<FeeComponentType> {
        if !self.is_discount() {
            return None;
        }
        let base = self.as_str().strip_suffix(DISCOUNT_SUFFIX)?;
        base.parse().ok()
    }

    /// Conventional application order for the named components.
    pub fn default_precedence(&self) -> Option<u32> {
        match self {
            FeeComponentType::Premium => Some(1),
            FeeComponentType::Structuring => Some(2),
            FeeComponentType::Management => Some(3),
            FeeComponentType::Admin => Some(4),
            FeeComponentType::Performance => Some(5),
            _ => None,
        }
    }
}

impl FromStr for FeeComponentType {
    type Err = FeeEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_uppercase();
        Ok(match name.as_str() {
            "PREMIUM" => FeeComponentType::Premium,
            "STRUCTURING" => FeeComponentType::Structuring,
            "MANAGEMENT" => FeeComponentType::Management,
            "ADMIN" => FeeComponentType::Admin,
            "PERFORMANCE" => FeeComponentType::Performance,
            "STRUCTURING_DISCOUNT" => FeeComponentType::StructuringDiscount,
            "MANAGEMENT_DISCOUNT" => FeeComponentType::ManagementDiscount,
            "ADMIN_DISCOUNT" => FeeComponentType::AdminDiscount,
            _ => {
                let valid = !name.is_empty()
                    && name.starts_with(|c: char| c.is_ascii_alphabetic())
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if !valid {
                    return Err(FeeEngineError::config(
                        "component",
                        format!("'{s}' is not a valid fee component name"),
                    ));
                }
                FeeComponentType::Custom(name)
            }
        })
    }
}

impl TryFrom<String> for FeeComponentType {
    type Error = FeeEngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FeeComponentType> for String {
    fn from(value: FeeComponentType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FeeComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The monetary quantity a percent-based component is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeBasis {
    /// Original gross capital
    Gross,
    /// Gross capital after premium
    Net,
    /// Alias of `Net` used by components after the premium
    NetAfterPremium,
    /// Flat amount; the basis amount is ignored
    Fixed,
    /// Valuation uplift, `max(0, current - purchase)`
    Gains,
    /// Running net capital after every component applied so far
    Capital,
}

impl fmt::Display for FeeBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeeBasis::Gross => "GROSS",
            FeeBasis::Net => "NET",
            FeeBasis::NetAfterPremium => "NET_AFTER_PREMIUM",
            FeeBasis::Fixed => "FIXED",
            FeeBasis::Gains => "GAINS",
            FeeBasis::Capital => "CAPITAL",
        };
        f.write_str(s)
    }
}

/// Whether a component's amount is owed on top of the investment or carved
/// out of the capital that buys units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeDirection {
    AddsTransfer,
    DeductsNet,
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// One row of a deal's fee schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeComponent {
    pub component: FeeComponentType,
    pub basis: FeeBasis,
    #[serde(default = "default_true")]
    pub is_percent: bool,
    /// Percent figure (2 = 2%), authoritative when `is_percent`
    #[serde(default)]
    pub rate: Percent,
    /// Flat amount, authoritative when not `is_percent`
    #[serde(default)]
    pub fixed_amount: Option<Money>,
    pub precedence: u32,
    /// Defaults to `DEDUCTS_NET` for the premium and `ADDS_TRANSFER` otherwise
    #[serde(default)]
    pub direction: Option<FeeDirection>,
    /// Annual fee charged up front for this many years
    #[serde(default)]
    pub years: Option<u32>,
    /// Deal-specific formula replacing rate/fixed amount
    #[serde(default)]
    pub formula: Option<String>,
    /// Share of gains (percent) kept back before a `GAINS` fee is charged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hurdle_rate: Option<Percent>,
    /// Once gains clear the hurdle, charge the rate on the hurdle amount too
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub catch_up: bool,
    /// Commitment-size tiers overriding `rate`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<RateTier>,
}

/// Rate that applies once an investor's gross capital reaches `threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTier {
    pub threshold: Money,
    pub rate: Percent,
}

impl RateTier {
    pub fn new(threshold: Money, rate: Percent) -> Self {
        RateTier { threshold, rate }
    }
}

fn default_true() -> bool {
    true
}

impl FeeComponent {
    /// Percent-of-basis row.
    pub fn percent(component: FeeComponentType, basis: FeeBasis, rate: Percent, precedence: u32) -> Self {
        FeeComponent {
            component,
            basis,
            is_percent: true,
            rate,
            fixed_amount: None,
            precedence,
            direction: None,
            years: None,
            formula: None,
            hurdle_rate: None,
            catch_up: false,
            tiers: Vec::new(),
        }
    }

    /// Flat-amount row.
    pub fn fixed(component: FeeComponentType, amount: Money, precedence: u32) -> Self {
        FeeComponent {
            component,
            basis: FeeBasis::Fixed,
            is_percent: false,
            rate: Percent::ZERO,
            fixed_amount: Some(amount),
            precedence,
            direction: None,
            years: None,
            formula: None,
            hurdle_rate: None,
            catch_up: false,
            tiers: Vec::new(),
        }
    }

    /// Tier for a commitment: the highest threshold not above it, or the
    /// lowest tier when the commitment is below every threshold.
    pub fn tier_for(&self, gross_capital: Money) -> Option<&RateTier> {
        self.tiers
            .iter()
            .filter(|tier| tier.threshold <= gross_capital)
            .max_by_key(|tier| tier.threshold)
            .or_else(|| self.tiers.iter().min_by_key(|tier| tier.threshold))
    }

    pub fn effective_direction(&self) -> FeeDirection {
        if self.component.is_premium() {
            return FeeDirection::DeductsNet;
        }
        self.direction.unwrap_or(FeeDirection::AddsTransfer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    #[serde(default)]
    pub deal_id: Option<DealId>,
    pub components: Vec<FeeComponent>,
    /// Permit equal precedence values; ties keep declaration order
    #[serde(default)]
    pub allow_precedence_ties: bool,
}

impl FeeSchedule {
    pub fn new(deal_id: Option<DealId>, components: Vec<FeeComponent>) -> Self {
        FeeSchedule {
            deal_id,
            components,
            allow_precedence_ties: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Investor-specific discount on a fee already in the schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountInput {
    /// Discount component, e.g. `STRUCTURING_DISCOUNT`
    pub component: FeeComponentType,
    /// Percent of the discounted fee (50 = half the fee)
    #[serde(default)]
    pub percent: Option<Percent>,
    /// Flat discount, capped at the discounted fee
    #[serde(default)]
    pub amount: Option<Money>,
}

/// Deal valuations for `GAINS`-basis components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValuationDelta {
    pub purchase: Money,
    pub current: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationInput {
    #[serde(alias = "grossCapital")]
    pub gross_capital: Money,
    #[serde(alias = "unitPrice")]
    pub unit_price: Money,
    #[serde(default)]
    pub discounts: Vec<DiscountInput>,
    #[serde(default)]
    pub valuation: Option<ValuationDelta>,
    /// Extra bindings for formula-driven components
    #[serde(default)]
    pub variables: Variables,
}

impl CalculationInput {
    pub fn new(gross_capital: Money, unit_price: Money) -> Self {
        CalculationInput {
            gross_capital,
            unit_price,
            discounts: Vec::new(),
            valuation: None,
            variables: Variables::new(),
        }
    }
}

/// Calculation request as sent by the portal: an input tagged with its deal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationRequest {
    #[serde(alias = "dealId", default)]
    pub deal_id: Option<DealId>,
    #[serde(flatten)]
    pub input: CalculationInput,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// One applied schedule row, in application order. Discounts carry their
/// absolute value; see [`AppliedFee::signed_amount`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedFee {
    pub component: FeeComponentType,
    pub basis: FeeBasis,
    pub amount: Money,
    pub rate: Option<Percent>,
    /// `None` for investor discounts applied after the schedule
    pub precedence: Option<u32>,
    pub direction: FeeDirection,
    pub notes: String,
}

impl AppliedFee {
    pub fn is_discount(&self) -> bool {
        self.component.is_discount()
    }

    /// Amount as stored in fee application records: negative for discounts.
    pub fn signed_amount(&self) -> Money {
        if self.is_discount() {
            -self.amount
        } else {
            self.amount
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InvariantCheck {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationMetadata {
    pub deal_id: Option<DealId>,
    /// e.g. `PREMIUM -> STRUCTURING -> ADMIN`
    pub precedence_order: String,
    /// Discounts exceeded fees and the transfer was clamped at zero
    pub discount_capped: bool,
    pub warnings: Vec<String>,
    pub invariants: InvariantCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub gross_capital: Money,
    pub premium_amount: Money,
    pub net_capital: Money,
    pub transfer_pre_discount: Money,
    pub total_discounts: Money,
    pub transfer_post_discount: Money,
    pub unit_price: Money,
    pub units: Units,
    #[serde(alias = "appliedFees")]
    pub applied_fees: Vec<AppliedFee>,
    pub metadata: CalculationMetadata,
}

impl CalculationResult {
    /// Copy with every money figure rounded to `dp` places for presentation.
    /// Units are untouched: they were floored from the unrounded net capital.
    pub fn rounded(&self, dp: u32) -> CalculationResult {
        CalculationResult {
            gross_capital: round_money(self.gross_capital, dp),
            premium_amount: round_money(self.premium_amount, dp),
            net_capital: round_money(self.net_capital, dp),
            transfer_pre_discount: round_money(self.transfer_pre_discount, dp),
            total_discounts: round_money(self.total_discounts, dp),
            transfer_post_discount: round_money(self.transfer_post_discount, dp),
            unit_price: self.unit_price,
            units: self.units,
            applied_fees: self
                .applied_fees
                .iter()
                .map(|fee| AppliedFee {
                    amount: round_money(fee.amount, dp),
                    ..fee.clone()
                })
                .collect(),
            metadata: self.metadata.clone(),
        }
    }

    /// Applied amount for a component, summed over its rows.
    pub fn amount_for(&self, component: &FeeComponentType) -> Option<Money> {
        let mut rows = self
            .applied_fees
            .iter()
            .filter(|fee| &fee.component == component)
            .peekable();
        rows.peek()?;
        Some(rows.fold(Money::ZERO, |acc, fee| acc.saturating_add(fee.amount)))
    }
}
