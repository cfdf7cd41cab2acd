use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Read a JSON or YAML file and deserialise into a typed struct.
pub fn read_json<T: DeserializeOwned>(path: &str) -> Result<T, Box<dyn std::error::Error>> {
    let value = read_json_value(path)?;
    let typed: T = serde_json::from_value(value)
        .map_err(|e| format!("Failed to parse '{}': {}", path, e))?;
    Ok(typed)
}

/// Read a document as a generic serde_json::Value.
///
/// Files ending in `.yaml` / `.yml` are parsed as YAML; anything else as
/// JSON. Deal schedules are often kept in YAML next to deal notes.
pub fn read_json_value(path: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let canonical = resolve_path(path)?;
    let contents = fs::read_to_string(&canonical)
        .map_err(|e| format!("Failed to read '{}': {}", canonical.display(), e))?;
    parse_document(&canonical, &contents)
        .map_err(|e| format!("Failed to parse '{}': {}", canonical.display(), e).into())
}

fn parse_document(path: &Path, contents: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);
    if is_yaml {
        Ok(serde_yaml::from_str(contents)?)
    } else {
        Ok(serde_json::from_str(contents)?)
    }
}

/// Resolve and validate the path, preventing directory traversal.
fn resolve_path(path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let p = Path::new(path);
    let canonical = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()?.join(p)
    };

    if !canonical.exists() {
        return Err(format!("File not found: {}", canonical.display()).into());
    }

    if !canonical.is_file() {
        return Err(format!("Not a file: {}", canonical.display()).into());
    }

    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_schedule_parses_to_json_value() {
        let yaml = "deal_id: 28\nordering: [PREMIUM]\ncomponents:\n  PREMIUM:\n    method: PCT_OF_GROSS\n    percent: \"3.77358\"\n";
        let value = parse_document(Path::new("deal.yaml"), yaml).unwrap();
        assert_eq!(value["deal_id"], 28);
        assert_eq!(value["components"]["PREMIUM"]["percent"], "3.77358");
    }

    #[test]
    fn test_json_by_default() {
        let value = parse_document(Path::new("deal.json"), r#"{"deal_id": 1}"#).unwrap();
        assert_eq!(value["deal_id"], 1);
        assert!(parse_document(Path::new("deal.json"), "deal_id: 1").is_err());
    }

    #[test]
    fn test_missing_file_reported() {
        let err = read_json_value("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }
}
