//! Adapter from the portal's per-deal fee configuration documents to a
//! [`FeeSchedule`].
//!
//! Two shapes are accepted:
//!
//! ```json
//! {"deal_id": 28, "ordering": ["PREMIUM", "ADMIN"],
//!  "components": {"PREMIUM": {"method": "PCT_OF_GROSS", "percent": "3.77358"},
//!                 "ADMIN": {"method": "FLAT_PER_TX", "amount": "350"}}}
//! ```
//!
//! and the legacy flat form, where component objects sit next to `ordering`.
//! A document whose `components` is already an array is read as a
//! `FeeSchedule` directly.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FeeEngineError;
use crate::schedule::{
    CalculationInput, FeeBasis, FeeComponent, FeeComponentType, FeeDirection, FeeSchedule,
    RateTier, ValuationDelta,
};
use crate::types::*;
use crate::FeeEngineResult;

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

/// How a configured component is charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeMethod {
    PctOfGross,
    PctOfNet,
    PctOfCapital,
    FlatPerTx,
    ValuationDelta,
    Formula,
}

impl FeeMethod {
    pub fn basis(self) -> FeeBasis {
        match self {
            FeeMethod::PctOfGross => FeeBasis::Gross,
            FeeMethod::PctOfNet => FeeBasis::Net,
            FeeMethod::PctOfCapital => FeeBasis::Capital,
            FeeMethod::FlatPerTx | FeeMethod::Formula => FeeBasis::Fixed,
            FeeMethod::ValuationDelta => FeeBasis::Gains,
        }
    }

    pub fn is_percent(self) -> bool {
        !matches!(self, FeeMethod::FlatPerTx | FeeMethod::Formula)
    }
}

impl FromStr for FeeMethod {
    type Err = FeeEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PCT_OF_GROSS" => Ok(FeeMethod::PctOfGross),
            "PCT_OF_NET" => Ok(FeeMethod::PctOfNet),
            "PCT_OF_CAPITAL" => Ok(FeeMethod::PctOfCapital),
            "FLAT_PER_TX" => Ok(FeeMethod::FlatPerTx),
            "VALUATION_DELTA" => Ok(FeeMethod::ValuationDelta),
            "FORMULA" => Ok(FeeMethod::Formula),
            other => Err(FeeEngineError::config(
                "method",
                format!("unknown fee method '{other}'"),
            )),
        }
    }
}

fn parse_direction(s: &str) -> FeeEngineResult<FeeDirection> {
    match s.trim().to_ascii_uppercase().as_str() {
        "ADDS_TRANSFER" => Ok(FeeDirection::AddsTransfer),
        "DEDUCTS_NET" => Ok(FeeDirection::DeductsNet),
        other => Err(FeeEngineError::config(
            "direction",
            format!("unknown fee direction '{other}'"),
        )),
    }
}

/// One component object in a configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub method: String,
    #[serde(default)]
    pub percent: Option<Percent>,
    #[serde(default)]
    pub amount: Option<Money>,
    #[serde(default)]
    pub direction: Option<String>,
    /// Charged once per year of the deal term, up front
    #[serde(default)]
    pub annual: bool,
    #[serde(default)]
    pub years: Option<u32>,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub hurdle_rate: Option<Percent>,
    #[serde(default)]
    pub catch_up: bool,
    #[serde(default)]
    pub tiers: Vec<RateTier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeScheduleConfig {
    #[serde(default)]
    pub deal_id: Option<DealId>,
    #[serde(default)]
    pub ordering: Vec<String>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentConfig>,
    #[serde(default)]
    pub valuations: Option<ValuationDelta>,
    /// Legacy flat shape: component objects at the top level
    #[serde(flatten)]
    pub legacy: BTreeMap<String, Value>,
}

/// A deal's schedule plus the valuation its configuration carries.
#[derive(Debug, Clone, PartialEq)]
pub struct DealFeeConfig {
    pub schedule: FeeSchedule,
    pub valuation: Option<ValuationDelta>,
}

impl DealFeeConfig {
    /// Fill in the configured valuation when the input has none.
    pub fn prepare_input(&self, mut input: CalculationInput) -> CalculationInput {
        if input.valuation.is_none() {
            input.valuation = self.valuation;
        }
        input
    }
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

impl FeeScheduleConfig {
    /// Component objects from both the nested and the flat shape, keyed by
    /// their upper-cased name.
    fn component_configs(&self) -> FeeEngineResult<HashMap<String, ComponentConfig>> {
        let mut configs: HashMap<String, ComponentConfig> = HashMap::new();
        for (name, config) in &self.components {
            configs.insert(name.trim().to_ascii_uppercase(), config.clone());
        }
        for (name, value) in &self.legacy {
            if !value.is_object() {
                continue;
            }
            let config: ComponentConfig = serde_json::from_value(value.clone()).map_err(|e| {
                FeeEngineError::config(format!("components.{name}"), e.to_string())
            })?;
            let key = name.trim().to_ascii_uppercase();
            if configs.insert(key.clone(), config).is_some() {
                return Err(FeeEngineError::config(
                    format!("components.{key}"),
                    "component configured twice",
                ));
            }
        }
        Ok(configs)
    }

    pub fn to_deal_config(&self) -> FeeEngineResult<DealFeeConfig> {
        let configs = self.component_configs()?;
        if configs.is_empty() {
            return Err(FeeEngineError::config(
                "components",
                "configuration declares no fee components",
            ));
        }

        let ordering: Vec<String> = self
            .ordering
            .iter()
            .map(|name| name.trim().to_ascii_uppercase())
            .collect();
        for (index, name) in ordering.iter().enumerate() {
            if !configs.contains_key(name) {
                return Err(FeeEngineError::config(
                    "ordering",
                    format!("'{name}' has no component configuration"),
                ));
            }
            if ordering[..index].contains(name) {
                return Err(FeeEngineError::config(
                    "ordering",
                    format!("'{name}' is listed twice"),
                ));
            }
        }

        let mut components = Vec::with_capacity(configs.len());
        for name in &ordering {
            let precedence = position_precedence(&ordering, name)?;
            components.push(build_component(name, &configs[name], precedence)?);
        }

        // components outside `ordering` fall back to their conventional slot
        let mut unordered: Vec<&String> = configs
            .keys()
            .filter(|name| !ordering.contains(*name))
            .collect();
        unordered.sort();
        for name in unordered {
            let kind: FeeComponentType = name.parse()?;
            let precedence = kind.default_precedence().ok_or_else(|| {
                FeeEngineError::config(
                    "ordering",
                    format!("'{name}' is not listed and has no default position"),
                )
            })?;
            if components.iter().any(|c: &FeeComponent| c.precedence == precedence) {
                return Err(FeeEngineError::config(
                    "ordering",
                    format!("'{name}' default position {precedence} is already taken"),
                ));
            }
            components.push(build_component(name, &configs[name], precedence)?);
        }
        components.sort_by_key(|c| c.precedence);

        Ok(DealFeeConfig {
            schedule: FeeSchedule::new(self.deal_id, components),
            valuation: self.valuations,
        })
    }

    pub fn to_schedule(&self) -> FeeEngineResult<FeeSchedule> {
        Ok(self.to_deal_config()?.schedule)
    }
}

fn position_precedence(ordering: &[String], name: &str) -> FeeEngineResult<u32> {
    let index = ordering
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| FeeEngineError::config("ordering", format!("'{name}' is not listed")))?;
    u32::try_from(index + 1)
        .map_err(|_| FeeEngineError::config("ordering", "too many components"))
}

fn build_component(
    name: &str,
    config: &ComponentConfig,
    precedence: u32,
) -> FeeEngineResult<FeeComponent> {
    let field = format!("components.{name}");
    let component: FeeComponentType = name.parse()?;
    let method: FeeMethod = config.method.parse().map_err(|e: FeeEngineError| match e {
        FeeEngineError::Config { reason, .. } => FeeEngineError::config(field.clone(), reason),
        other => other,
    })?;
    let direction = config
        .direction
        .as_deref()
        .map(parse_direction)
        .transpose()
        .map_err(|e| match e {
            FeeEngineError::Config { reason, .. } => FeeEngineError::config(field.clone(), reason),
            other => other,
        })?;

    let years = match (config.annual, config.years) {
        (true, Some(years)) => Some(years),
        (true, None) => {
            return Err(FeeEngineError::config(field, "annual fee needs years"));
        }
        (false, _) => None,
    };

    let mut built = match method {
        FeeMethod::Formula => {
            let formula = config
                .formula
                .clone()
                .ok_or_else(|| FeeEngineError::config(field.clone(), "FORMULA method needs a formula"))?;
            FeeComponent {
                formula: Some(formula),
                ..FeeComponent::fixed(component, Money::ZERO, precedence)
            }
        }
        FeeMethod::FlatPerTx => {
            let amount = config
                .amount
                .ok_or_else(|| FeeEngineError::config(field.clone(), "FLAT_PER_TX needs an amount"))?;
            FeeComponent::fixed(component, amount, precedence)
        }
        _ => {
            let percent = config.percent.ok_or_else(|| {
                FeeEngineError::config(field.clone(), format!("{} needs a percent", config.method))
            })?;
            FeeComponent::percent(component, method.basis(), percent, precedence)
        }
    };
    built.direction = direction;
    built.years = years;
    built.hurdle_rate = config.hurdle_rate;
    built.catch_up = config.catch_up;
    built.tiers = config.tiers.clone();
    Ok(built)
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Read a schedule from either a configuration document or a serialized
/// `FeeSchedule` (recognised by its `components` array).
pub fn deal_config_from_value(value: Value) -> FeeEngineResult<DealFeeConfig> {
    let is_schedule = value
        .get("components")
        .map(Value::is_array)
        .unwrap_or(false);
    if is_schedule {
        let schedule: FeeSchedule = serde_json::from_value(value)?;
        return Ok(DealFeeConfig {
            schedule,
            valuation: None,
        });
    }
    let config: FeeScheduleConfig = serde_json::from_value(value)?;
    config.to_deal_config()
}

pub fn deal_config_from_json(json: &str) -> FeeEngineResult<DealFeeConfig> {
    let value: Value = serde_json::from_str(json)?;
    deal_config_from_value(value)
}
