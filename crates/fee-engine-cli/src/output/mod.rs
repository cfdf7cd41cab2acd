pub mod csv_out;
pub mod json;
pub mod minimal;
pub mod table;

use crate::OutputFormat;
use serde_json::{Map, Value};

/// Record arrays a fee response can carry, in lookup order: calculation fee
/// lines, reconciliation entries, batch results.
pub const RECORD_KEYS: [&str; 3] = ["applied_fees", "entries", "results"];

/// Print a command response in the `--output` format.
pub fn format_output(format: &OutputFormat, value: &Value) {
    match format {
        OutputFormat::Json => json::print_json(value),
        OutputFormat::Table => table::print_table(value),
        OutputFormat::Csv => csv_out::print_csv(value),
        OutputFormat::Minimal => minimal::print_minimal(value),
    }
}

/// The `result` inside an enveloped response, or the value itself.
pub fn unwrap_result(value: &Value) -> &Value {
    value
        .as_object()
        .and_then(|m| m.get("result"))
        .unwrap_or(value)
}

/// First record array in a result object.
pub fn record_rows(result: &Map<String, Value>) -> Option<&[Value]> {
    RECORD_KEYS
        .iter()
        .find_map(|k| result.get(*k).and_then(Value::as_array))
        .map(Vec::as_slice)
}
