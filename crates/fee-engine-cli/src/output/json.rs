use serde_json::Value;
use std::io::{self, Write};

/// Pretty-print JSON to stdout.
pub fn print_json(value: &Value) {
    let stdout = io::stdout();
    if let Err(e) = write_json(&mut stdout.lock(), value) {
        eprintln!("JSON output error: {}", e);
    }
}

fn write_json<W: Write>(out: &mut W, value: &Value) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decimal_strings_survive_output() {
        let mut buf = Vec::new();
        write_json(&mut buf, &json!({"premium_amount": "2830.19", "units": 72})).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("\"premium_amount\": \"2830.19\""));
        assert!(text.ends_with("}\n"));
    }
}
