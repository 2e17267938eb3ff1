//! Locale-aware parsing primitives shared by every adapter and the statement extractor.
//!
//! Amounts come in French (`1 234,56 €`), German (`1.234,56`), English
//! (`1,234.56`) and Swiss (`1'234.56`) shapes, with currency markers and
//! signs in front, behind or as accounting parentheses.

use chrono::{Datelike, Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::errors::{IngestError, Result};

// =============================================================================
// Amounts
// =============================================================================

static AMOUNT_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{1,3}(?:[ \x{a0}\x{202f}']\d{3})+(?:[.,]\d+)?|\d[\d.,]*").unwrap()
});

const CURRENCY_MARKERS: [&str; 5] = ["€", "EUR", "eur", "$", "£"];

fn strip_currency_end(mut s: &str) -> &str {
    loop {
        let trimmed = s.trim_end();
        match CURRENCY_MARKERS.iter().find(|m| trimmed.ends_with(*m)) {
            Some(m) => s = &trimmed[..trimmed.len() - m.len()],
            None => return trimmed,
        }
    }
}

fn strip_currency_start(mut s: &str) -> &str {
    loop {
        let trimmed = s.trim_start();
        match CURRENCY_MARKERS.iter().find(|m| trimmed.starts_with(*m)) {
            Some(m) => s = &trimmed[m.len()..],
            None => return trimmed,
        }
    }
}

/// Parse a monetary amount.
///
/// When both `.` and `,` occur, the rightmost is the decimal separator. A
/// separator that occurs more than once groups thousands; a single lone one
/// is the decimal separator.
pub fn parse_amount(text: &str) -> Result<Decimal> {
    let m = AMOUNT_TOKEN
        .find(text)
        .ok_or_else(|| IngestError::AmountParse(text.to_string()))?;

    let prefix = strip_currency_end(&text[..m.start()]);
    let suffix = strip_currency_start(&text[m.end()..]);
    let negative = prefix.ends_with('-')
        || prefix.ends_with('\u{2212}')
        || suffix.starts_with('-')
        || (prefix.ends_with('(') && suffix.starts_with(')'));

    let token: String = m
        .as_str()
        .trim_end_matches(['.', ','])
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '\''))
        .collect();

    let dots = token.matches('.').count();
    let commas = token.matches(',').count();
    let normalized = match (dots, commas) {
        (0, 0) => token,
        (_, 0) if dots > 1 => token.replace('.', ""),
        (0, _) if commas > 1 => token.replace(',', ""),
        (_, 0) => token,
        (0, _) => token.replace(',', "."),
        _ => {
            let last_dot = token.rfind('.').unwrap_or(0);
            let last_comma = token.rfind(',').unwrap_or(0);
            if last_comma > last_dot {
                token.replace('.', "").replace(',', ".")
            } else {
                token.replace(',', "")
            }
        }
    };

    let value = Decimal::from_str(&normalized)
        .map_err(|_| IngestError::AmountParse(text.to_string()))?;
    Ok(if negative { -value } else { value })
}

/// Like [`parse_amount`], but blank cells and placeholders read as zero.
pub fn parse_amount_or_zero(text: &str) -> Result<Decimal> {
    let trimmed = text.trim();
    if trimmed.is_empty() || matches!(trimmed, "-" | "--" | "nan" | "NaN" | "N/A") {
        return Ok(Decimal::ZERO);
    }
    parse_amount(trimmed)
}

/// Canonical form: plain decimal point, two decimals, no grouping.
pub fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", amount.round_dp(2))
}

// =============================================================================
// Dates
// =============================================================================

static TIME_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:à|a|T|\s)\s*\d{1,2}[:h]\d{2}(?::\d{2}(?:\.\d+)?)?\s*$").unwrap()
});
static DMY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{4}|\d{2})$").unwrap());
static YMD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[/.\-](\d{1,2})[/.\-](\d{1,2})$").unwrap());
static MONTH_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:(\d{1,2})(?:er)?\s+)?([a-z]+)\.?\s+(\d{4})$").unwrap());
static EXCEL_SERIAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{5}(?:\.\d+)?$").unwrap());

const MONTHS: [(&str, u32); 39] = [
    ("janvier", 1), ("january", 1), ("jan", 1),
    ("fevrier", 2), ("february", 2), ("fev", 2), ("feb", 2),
    ("mars", 3), ("march", 3), ("mar", 3),
    ("avril", 4), ("april", 4), ("avr", 4), ("apr", 4),
    ("mai", 5), ("may", 5),
    ("juin", 6), ("june", 6), ("jun", 6),
    ("juillet", 7), ("july", 7), ("juil", 7), ("jul", 7),
    ("aout", 8), ("august", 8), ("aug", 8),
    ("septembre", 9), ("september", 9), ("sept", 9), ("sep", 9),
    ("octobre", 10), ("october", 10), ("oct", 10),
    ("novembre", 11), ("november", 11), ("nov", 11),
    ("decembre", 12), ("december", 12), ("dec", 12),
];

/// Month number from a French or English month name or abbreviation.
pub fn month_from_name(name: &str) -> Option<u32> {
    let folded = fold_key(name);
    let folded = folded.trim_end_matches('.');
    MONTHS.iter().find(|(n, _)| *n == folded).map(|(_, m)| *m)
}

fn expand_year(raw: &str) -> Option<i32> {
    let year: i32 = raw.parse().ok()?;
    Some(match raw.len() {
        2 if year < 69 => 2000 + year,
        2 => 1900 + year,
        _ => year,
    })
}

/// Excel serial day number (1900 date system, epoch 1899-12-30).
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !(1.0..100_000.0).contains(&serial) {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(Duration::days(serial.floor() as i64))
}

/// Parse a calendar date. Month-precision inputs resolve to the first day.
pub fn parse_date(text: &str) -> Result<NaiveDate> {
    let err = || IngestError::DateParse(text.to_string());
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(err());
    }

    if EXCEL_SERIAL.is_match(trimmed) {
        let serial: f64 = trimmed.parse().map_err(|_| err())?;
        return excel_serial_to_date(serial).ok_or_else(err);
    }

    let s = TIME_SUFFIX.replace(trimmed, "");
    let s = s.trim();

    if let Some(c) = DMY.captures(s) {
        let day: u32 = c[1].parse().map_err(|_| err())?;
        let month: u32 = c[2].parse().map_err(|_| err())?;
        let year = expand_year(&c[3]).ok_or_else(err)?;
        return NaiveDate::from_ymd_opt(year, month, day).ok_or_else(err);
    }

    if let Some(c) = YMD.captures(s) {
        let year: i32 = c[1].parse().map_err(|_| err())?;
        let month: u32 = c[2].parse().map_err(|_| err())?;
        let day: u32 = c[3].parse().map_err(|_| err())?;
        return NaiveDate::from_ymd_opt(year, month, day).ok_or_else(err);
    }

    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(s, "%Y%m%d").map_err(|_| err());
    }
    if s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit()) {
        let year: i32 = s[..4].parse().map_err(|_| err())?;
        let month: u32 = s[4..].parse().map_err(|_| err())?;
        return NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(err);
    }

    let folded = fold_key(s);
    if let Some(c) = MONTH_NAME.captures(&folded) {
        let month = month_from_name(&c[2]).ok_or_else(err)?;
        let year: i32 = c[3].parse().map_err(|_| err())?;
        let day: u32 = match c.get(1) {
            Some(d) => d.as_str().parse().map_err(|_| err())?,
            None => 1,
        };
        return NaiveDate::from_ymd_opt(year, month, day).ok_or_else(err);
    }

    Err(err())
}

/// Last calendar day of the month containing `date`.
pub fn end_of_month(date: NaiveDate) -> NaiveDate {
    let (y, m) = if date.month() == 12 { (date.year() + 1, 1) } else { (date.year(), date.month() + 1) };
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|d| d.pred_opt())
        .unwrap_or(date)
}

/// Whole months between two dates, not counting a partial last month.
pub fn months_between(start: NaiveDate, end: NaiveDate) -> i64 {
    let mut months = (end.year() - start.year()) as i64 * 12 + end.month() as i64 - start.month() as i64;
    if end.day() < start.day() {
        months -= 1;
    }
    months
}

// =============================================================================
// Text keys
// =============================================================================

fn strip_diacritic(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'a',
        'ç' | 'Ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => 'i',
        'ñ' | 'Ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => 'u',
        'ý' | 'ÿ' | 'Ý' => 'y',
        '’' | '‘' => '\'',
        '\u{a0}' | '\u{202f}' => ' ',
        other => other,
    }
}

/// Diacritic-stripped, lower-cased, whitespace-collapsed key.
pub fn fold_key(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace().map(|w| w.chars().map(strip_diacritic)) {
        if !out.is_empty() {
            out.push(' ');
        }
        for c in word {
            match c {
                'œ' | 'Œ' => out.push_str("oe"),
                'æ' | 'Æ' => out.push_str("ae"),
                c => out.extend(c.to_lowercase()),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_amount_locales() {
        assert_eq!(parse_amount("1 234,56 €").unwrap(), dec!(1234.56));
        assert_eq!(parse_amount("1\u{a0}234,56").unwrap(), dec!(1234.56));
        assert_eq!(parse_amount("1.234,56").unwrap(), dec!(1234.56));
        assert_eq!(parse_amount("1,234.56").unwrap(), dec!(1234.56));
        assert_eq!(parse_amount("1'234.56 CHF").unwrap(), dec!(1234.56));
        assert_eq!(parse_amount("1.234.567").unwrap(), dec!(1234567));
        assert_eq!(parse_amount("12,5").unwrap(), dec!(12.5));
        assert_eq!(parse_amount("EUR 300").unwrap(), dec!(300));
    }

    #[test]
    fn test_parse_amount_signs() {
        assert_eq!(parse_amount("-1 000,00 €").unwrap(), dec!(-1000.00));
        assert_eq!(parse_amount("€ -45,10").unwrap(), dec!(-45.10));
        assert_eq!(parse_amount("(250.00)").unwrap(), dec!(-250.00));
        assert_eq!(parse_amount("99,90-").unwrap(), dec!(-99.90));
        assert_eq!(parse_amount("+ 12,00").unwrap(), dec!(12.00));
        // a hyphen inside a label is not a sign
        assert_eq!(parse_amount("Projet A-B : 150,00").unwrap(), dec!(150.00));
    }

    #[test]
    fn test_parse_amount_rejects_garbage() {
        assert!(matches!(parse_amount("n/a"), Err(IngestError::AmountParse(_))));
        assert!(parse_amount("").is_err());
        assert_eq!(parse_amount_or_zero("  ").unwrap(), Decimal::ZERO);
        assert!(parse_amount_or_zero("abc").is_err());
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(dec!(1234.5)), "1234.50");
        assert_eq!(format_amount(dec!(10)), "10.00");
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("15/01/2023").unwrap(), date(2023, 1, 15));
        assert_eq!(parse_date("15-01-2023").unwrap(), date(2023, 1, 15));
        assert_eq!(parse_date("15.01.23").unwrap(), date(2023, 1, 15));
        assert_eq!(parse_date("2023-01-15").unwrap(), date(2023, 1, 15));
        assert_eq!(parse_date("2023-01-15 00:00:00").unwrap(), date(2023, 1, 15));
        assert_eq!(parse_date("2023-01-15T10:30:00").unwrap(), date(2023, 1, 15));
        assert_eq!(parse_date("03/02/2024 à 14:05").unwrap(), date(2024, 2, 3));
        assert_eq!(parse_date("20230115").unwrap(), date(2023, 1, 15));
        assert_eq!(parse_date("202403").unwrap(), date(2024, 3, 1));
        assert_eq!(parse_date("15 janvier 2024").unwrap(), date(2024, 1, 15));
        assert_eq!(parse_date("1er Août 2024").unwrap(), date(2024, 8, 1));
        assert_eq!(parse_date("Décembre 2023").unwrap(), date(2023, 12, 1));
        assert_eq!(parse_date("Jan 2024").unwrap(), date(2024, 1, 1));
        assert_eq!(parse_date("45000").unwrap(), date(2023, 3, 15));
    }

    #[test]
    fn test_parse_date_never_defaults() {
        assert!(matches!(parse_date("31/02/2023"), Err(IngestError::DateParse(_))));
        assert!(parse_date("bientôt").is_err());
        assert!(parse_date("").is_err());
    }

    #[test]
    fn test_month_helpers() {
        assert_eq!(end_of_month(date(2024, 2, 10)), date(2024, 2, 29));
        assert_eq!(end_of_month(date(2023, 12, 1)), date(2023, 12, 31));
        assert_eq!(months_between(date(2023, 1, 15), date(2023, 7, 15)), 6);
        assert_eq!(months_between(date(2023, 1, 15), date(2023, 7, 14)), 5);
        assert_eq!(month_from_name("Févr."), None);
        assert_eq!(month_from_name("fév"), Some(2));
    }

    #[test]
    fn test_fold_key() {
        assert_eq!(fold_key("  Résidence  Les Pins "), "residence les pins");
        assert_eq!(fold_key("CRÉDIT DU COMPTE"), "credit du compte");
        assert_eq!(fold_key("Cœur de Ville"), "coeur de ville");
    }

    fn group(int_part: &str, sep: &str) -> String {
        let digits: Vec<char> = int_part.chars().collect();
        let mut out = String::new();
        for (i, c) in digits.iter().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                out.push_str(sep);
            }
            out.push(*c);
        }
        out
    }

    proptest! {
        #[test]
        fn prop_amount_round_trips_across_locales(cents in -99_999_999_999i64..99_999_999_999i64, style in 0usize..6) {
            let value = Decimal::new(cents, 2);
            let int_part = (cents.abs() / 100).to_string();
            let frac = format!("{:02}", (cents.abs() % 100));
            let body = match style {
                0 => format!("{},{} €", group(&int_part, " "), frac),
                1 => format!("{},{}", group(&int_part, "\u{a0}"), frac),
                2 => format!("{},{}", group(&int_part, "."), frac),
                3 => format!("{}.{}", group(&int_part, ","), frac),
                4 => format!("{}.{}", group(&int_part, "'"), frac),
                _ => format!("EUR {}.{}", int_part, frac),
            };
            let text = if value.is_sign_negative() && !value.is_zero() { format!("-{}", body) } else { body };
            let parsed = parse_amount(&text).unwrap();
            let canonical = Decimal::from_str(&format_amount(parsed)).unwrap();
            prop_assert!((canonical - value).abs() <= dec!(0.01), "{} -> {}", text, canonical);
        }
    }
}
