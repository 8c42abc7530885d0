//! Primitive encodings of EFD/SPED ledger files
//!
//! Ledger files are produced by the tax authority's validator in a
//! single-byte legacy encoding (ISO-8859-1). Every line has the shape
//! `|TAG|f1|f2|...|`: splitting on `|` yields an empty leading field, the
//! record tag at index 1, the payload, and an empty trailing field.
//!
//! Numbers use a comma as the decimal separator and may carry `.` thousands
//! separators. Dates are `DDMMYYYY`. Legal-entity documents (CNPJ) are
//! 14-digit numbers and are normalised by stripping everything that is not a
//! digit.

use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use chrono::{Datelike, NaiveDate};

use crate::error::{EfdError, Result};

/// Field separator of ledger lines
pub const FIELD_SEPARATOR: char = '|';

/// Length of a CNPJ once normalised to digits
pub const CNPJ_LEN: usize = 14;

/// Decode a raw ISO-8859-1 line, dropping the line terminator.
///
/// Every byte maps to the Unicode code point of the same value, so decoding
/// never fails and byte offsets stay exact on the raw side.
pub fn decode_latin1(raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    raw[..end].iter().map(|&b| char::from(b)).collect()
}

/// Split a ledger line into its fields.
///
/// Returns `None` when the line does not start with the field separator or
/// has no tag, which callers treat as "not a record".
pub fn split_fields(line: &str) -> Option<Vec<&str>> {
    if !line.starts_with(FIELD_SEPARATOR) {
        return None;
    }
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    match fields.get(1) {
        Some(tag) if !tag.is_empty() => Some(fields),
        _ => None,
    }
}

/// Parse a ledger amount (`1.234,56`, `1500,00`, `10`). Empty means zero.
pub fn parse_amount(raw: &str) -> Result<BigDecimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(BigDecimal::zero());
    }

    let normalised = if trimmed.contains(',') {
        trimmed.replace('.', "").replace(',', ".")
    } else {
        trimmed.to_string()
    };

    let valid = normalised
        .chars()
        .enumerate()
        .all(|(i, c)| c.is_ascii_digit() || c == '.' || (c == '-' && i == 0))
        && normalised.chars().filter(|c| *c == '.').count() <= 1
        && normalised.chars().any(|c| c.is_ascii_digit());

    if !valid {
        return Err(EfdError::InvalidAmount(raw.to_string()));
    }

    BigDecimal::from_str(&normalised).map_err(|_| EfdError::InvalidAmount(raw.to_string()))
}

/// Whether a field looks like a `DDMMYYYY` date
pub fn is_date(raw: &str) -> bool {
    raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) && parse_date(raw).is_ok()
}

/// Parse a `DDMMYYYY` date
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.len() != 8 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EfdError::InvalidDate(raw.to_string()));
    }
    NaiveDate::parse_from_str(trimmed, "%d%m%Y").map_err(|_| EfdError::InvalidDate(raw.to_string()))
}

/// Parse an optional `DDMMYYYY` date; empty or malformed values yield `None`
pub fn parse_optional_date(raw: &str) -> Option<NaiveDate> {
    if raw.trim().is_empty() {
        None
    } else {
        parse_date(raw).ok()
    }
}

/// First day of the month containing `date`
pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Keep only the ASCII digits of a document number
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Normalise a CNPJ, rejecting anything that is not 14 digits afterwards
pub fn normalize_cnpj(raw: &str) -> Result<String> {
    let digits = digits_only(raw);
    if digits.len() == CNPJ_LEN {
        Ok(digits)
    } else {
        Err(EfdError::InvalidDocument(raw.to_string()))
    }
}

/// Whether a raw field is already a bare 14-digit CNPJ
pub fn is_cnpj(raw: &str) -> bool {
    raw.len() == CNPJ_LEN && raw.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_latin1_strips_terminators() {
        let raw = b"|0150|F1|A\xc7\xdaCAR LTDA|\r\n";
        assert_eq!(decode_latin1(raw), "|0150|F1|AÇÚCAR LTDA|");
    }

    #[test]
    fn test_split_fields() {
        let fields = split_fields("|C100|0|1|F1|").unwrap();
        assert_eq!(fields, vec!["", "C100", "0", "1", "F1", ""]);

        assert!(split_fields("C100|0|1").is_none());
        assert!(split_fields("||").is_none());
        assert!(split_fields("").is_none());
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1500,00").unwrap(), BigDecimal::from(1500));
        assert_eq!(parse_amount("1.234,56").unwrap(), BigDecimal::from_str("1234.56").unwrap());
        assert_eq!(parse_amount("").unwrap(), BigDecimal::zero());
        assert_eq!(parse_amount("  ").unwrap(), BigDecimal::zero());
        assert_eq!(parse_amount("-10,5").unwrap(), BigDecimal::from_str("-10.5").unwrap());
        assert_eq!(parse_amount("42").unwrap(), BigDecimal::from(42));
    }

    #[test]
    fn test_parse_amount_rejects_garbage() {
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount("1,2,3").is_err());
        assert!(parse_amount("12-3").is_err());
        assert!(parse_amount(",").is_err());
    }

    #[test]
    fn test_parse_date() {
        let date = parse_date("01012024").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());

        assert!(parse_date("32012024").is_err());
        assert!(parse_date("2024-01-01").is_err());
        assert!(parse_date("").is_err());
        assert!(parse_optional_date("").is_none());
    }

    #[test]
    fn test_is_date() {
        assert!(is_date("31012024"));
        assert!(!is_date("EMPRESA X"));
        assert!(!is_date("0"));
        assert!(!is_date("99999999"));
    }

    #[test]
    fn test_first_of_month() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(first_of_month(date), NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
    }

    #[test]
    fn test_cnpj_normalisation() {
        assert_eq!(normalize_cnpj("12.345.678/0001-90").unwrap(), "12345678000190");
        assert_eq!(
            normalize_cnpj("123"),
            Err(EfdError::InvalidDocument("123".to_string()))
        );
        assert!(is_cnpj("12345678000190"));
        assert!(!is_cnpj("12.345.678/0001-90"));
    }

    proptest! {
        #[test]
        fn prop_decode_latin1_preserves_char_count(bytes in proptest::collection::vec(1u8..=255, 0..64)) {
            let body: Vec<u8> = bytes.into_iter().filter(|b| *b != b'\n' && *b != b'\r').collect();
            let decoded = decode_latin1(&body);
            prop_assert_eq!(decoded.chars().count(), body.len());
        }

        #[test]
        fn prop_parse_amount_accepts_formatted_cents(units in 0u64..10_000_000, cents in 0u64..100) {
            let raw = format!("{},{:02}", units, cents);
            let parsed = parse_amount(&raw).unwrap();
            let expected = BigDecimal::from_str(&format!("{}.{:02}", units, cents)).unwrap();
            prop_assert_eq!(parsed, expected);
        }
    }
}
