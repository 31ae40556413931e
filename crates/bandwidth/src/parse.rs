use std::fmt;

/// Error produced when a textual rate argument cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateParseError {
    /// The argument was empty or all whitespace.
    #[error("rate limit argument is empty")]
    Empty,
    /// Negative rates are rejected at the contract boundary.
    #[error("rate limit cannot be negative: {0:?}")]
    Negative(String),
    /// The numeric portion did not parse as a decimal number.
    #[error("invalid rate limit number: {0:?}")]
    InvalidNumber(String),
    /// The unit suffix is not one of `B|K|KB|M|MB|G|GB|T|TB`.
    #[error("unknown rate limit unit: {0:?}")]
    UnknownUnit(String),
    /// The computed rate overflows a 64-bit byte count.
    #[error("rate limit out of range: {0:?}")]
    OutOfRange(String),
}

/// Multiplier for a recognised unit suffix.
///
/// Units are binary (1024-based) and case-insensitive; a bare number is
/// bytes per second.
fn unit_multiplier(suffix: &str) -> Option<u64> {
    match suffix.to_ascii_uppercase().as_str() {
        "" | "B" => Some(1),
        "K" | "KB" => Some(1 << 10),
        "M" | "MB" => Some(1 << 20),
        "G" | "GB" => Some(1 << 30),
        "T" | "TB" => Some(1 << 40),
        _ => None,
    }
}

/// Parses a `<number>[unit]` rate argument into bytes per second.
///
/// Decimals are accepted (`1.5GB`), units are binary and case-insensitive,
/// and `0` denotes an unlimited rate. Negative values are rejected.
///
/// # Examples
///
/// ```
/// use bandwidth::parse_rate_limit;
///
/// assert_eq!(parse_rate_limit("1MB").unwrap(), 1_048_576);
/// assert_eq!(parse_rate_limit("100").unwrap(), 100);
/// assert_eq!(parse_rate_limit("0").unwrap(), 0);
/// ```
pub fn parse_rate_limit(text: &str) -> Result<u64, RateParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RateParseError::Empty);
    }
    if trimmed.starts_with('-') {
        return Err(RateParseError::Negative(trimmed.to_string()));
    }

    let numeric_end = trimmed
        .find(|ch: char| !ch.is_ascii_digit() && ch != '.')
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(numeric_end);

    if number.is_empty() || number == "." {
        return Err(RateParseError::InvalidNumber(trimmed.to_string()));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| RateParseError::InvalidNumber(trimmed.to_string()))?;

    let multiplier =
        unit_multiplier(suffix).ok_or_else(|| RateParseError::UnknownUnit(trimmed.to_string()))?;

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(RateParseError::OutOfRange(trimmed.to_string()));
    }
    Ok(bytes.round() as u64)
}

/// Formats a byte-per-second rate with the largest exact binary unit.
///
/// Used for run summaries and log lines; parsing the output yields the
/// original rate.
#[must_use]
pub fn format_rate(bytes_per_second: u64) -> String {
    struct Display(u64);
    impl fmt::Display for Display {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            const UNITS: [(&str, u64); 4] =
                [("TB", 1 << 40), ("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];
            for (unit, multiplier) in UNITS {
                if self.0 >= multiplier && self.0 % multiplier == 0 {
                    return write!(f, "{}{unit}", self.0 / multiplier);
                }
            }
            write!(f, "{}B", self.0)
        }
    }
    Display(bytes_per_second).to_string()
}
