//! Free-text field normalization

use crate::{Error, Result};

/// Trim a required field; empty after trimming is `InvalidInput`
pub fn required(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

/// Trim an optional field; empty after trimming becomes `None`
pub fn optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required() {
        assert_eq!(required("  Valerie ", "title").unwrap(), "Valerie");
        let err = required("   ", "title").unwrap_err();
        assert_eq!(err.to_string(), "Invalid input: title is required");
    }

    #[test]
    fn test_optional() {
        assert_eq!(optional(Some(" Amy ")), Some("Amy".to_string()));
        assert_eq!(optional(Some("  ")), None);
        assert_eq!(optional(None), None);
    }
}
