//! Secrets file parsing.
//!
//! One `KEY=VALUE` pair per line. Blank lines and lines starting with `#`
//! are ignored. Values may be wrapped in single or double quotes.

use crate::ConfigResult;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// Parse secrets from file content.
pub fn parse_secrets(content: &str) -> HashMap<String, String> {
    let mut secrets = HashMap::new();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            warn!(line = number + 1, "Skipping secrets line without '='");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            warn!(line = number + 1, "Skipping secrets line with empty key");
            continue;
        }

        secrets.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    secrets
}

/// Read and parse a secrets file.
pub fn load_secrets(path: &Path) -> ConfigResult<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_secrets(&content))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
