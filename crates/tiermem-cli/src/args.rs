//! Argument parsers shared by several commands

use tiermem::{EntryKey, UnifiedMemoryManager};

/// Parse a `key=value` tag
pub fn parse_tag(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid tag '{s}', expected key=value"))?;
    if key.is_empty() {
        return Err(format!("Invalid tag '{s}', key is empty"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Parse a comma-separated vector such as `0.1,0.2,0.3`
pub fn parse_vector(s: &str) -> Result<Vec<f32>, String> {
    let values = s
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<f32>()
                .map_err(|e| format!("Invalid vector component '{p}': {e}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if values.is_empty() {
        return Err("Vector must have at least one component".to_string());
    }
    Ok(values)
}

/// Key in `namespace`, or in the manager's configured namespace
pub fn resolve_key(manager: &UnifiedMemoryManager, namespace: Option<&str>, key: &str) -> EntryKey {
    match namespace {
        Some(ns) => EntryKey::new(ns, key),
        None => manager.key(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod tags {
        use super::*;

        #[test]
        fn test_splits_on_first_equals() {
            assert_eq!(
                parse_tag("source=a=b").unwrap(),
                ("source".to_string(), "a=b".to_string())
            );
        }

        #[test]
        fn test_empty_value_allowed() {
            assert_eq!(parse_tag("flag=").unwrap(), ("flag".to_string(), String::new()));
        }

        #[test]
        fn test_rejects_missing_separator_or_key() {
            assert!(parse_tag("novalue").is_err());
            assert!(parse_tag("=x").is_err());
        }
    }

    mod vectors {
        use super::*;

        #[test]
        fn test_parses_components() {
            assert_eq!(parse_vector("1, 0.5,-2").unwrap(), vec![1.0, 0.5, -2.0]);
        }

        #[test]
        fn test_rejects_garbage() {
            assert!(parse_vector("1,abc").is_err());
            assert!(parse_vector(" , ").is_err());
        }
    }
}
