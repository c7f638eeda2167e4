use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

use crate::error::ValidationError;

// Optional sign, then digits with at most one decimal separator.
static AMOUNT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[+-]?[0-9]+(?:[.,][0-9]+)?$").ok());

/// Parse a user-typed amount. Both `.` and `,` are accepted as the decimal
/// separator; the result must be strictly positive.
pub(crate) fn parse_amount(input: &str) -> Result<Decimal, ValidationError> {
    let trimmed = input.trim();
    let well_formed = AMOUNT.as_ref().is_some_and(|re| re.is_match(trimmed));
    if !well_formed {
        return Err(ValidationError::MalformedAmount);
    }

    let normalized = trimmed.trim_start_matches('+').replace(',', ".");
    let value = Decimal::from_str(&normalized).map_err(|_| ValidationError::MalformedAmount)?;
    if value <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount);
    }
    Ok(value)
}

/// Trimmed, non-empty free text (budget names, expense descriptions).
pub(crate) fn non_empty(input: &str) -> Option<String> {
    let trimmed = input.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
