pub mod file;
pub mod stdin;

use serde_json::Value;

/// The command's document: `--input <file>` if given, else piped stdin.
pub fn read_document(path: Option<&str>) -> Result<Option<Value>, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Some(file::read_json_value(path)?)),
        None => stdin::read_stdin(),
    }
}
