use std::env;

pub(crate) const OPTIMIZE: &str = "LAYERWISE_OPTIMIZE";
pub(crate) const ROUND_DENORMALS: &str = "LAYERWISE_ROUND_DENORMALS";
pub(crate) const PASS_STATS: &str = "LAYERWISE_PASS_STATS";
pub(crate) const PRE_ITERS: &str = "LAYERWISE_PRE_ITERS";
pub(crate) const POST_ITERS: &str = "LAYERWISE_POST_ITERS";

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Boolean flag; unset or blank variables yield `None`.
pub(crate) fn flag(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

/// Positive integer; unparsable or zero values are ignored.
pub(crate) fn positive_usize(name: &str) -> Option<usize> {
    let value = env::var(name).ok()?;
    match value.trim().parse::<usize>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        _ => {
            tracing::warn!(variable = name, value = %value, "ignoring invalid iteration bound");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "nope"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
