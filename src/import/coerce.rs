use crate::models::{format_number, CellValue, FieldValue};
use crate::schema::{fold, FieldType};
use chrono::{Datelike, Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;

/// Days between the spreadsheet serial epoch (1899-12-30) and 1970-01-01.
const SERIAL_EPOCH_OFFSET_DAYS: i64 = 25_569;
const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 2100;

const TRUE_WORDS: &[&str] = &["true", "yes", "是", "1"];
const FALSE_WORDS: &[&str] = &["false", "no", "否", "0"];

static SEPARATED_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,4})[/\-.](\d{1,2})[/\-.](\d{1,4})$").expect("valid date regex"));
static CJK_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})年(\d{1,2})月(\d{1,2})日?$").expect("valid cjk date regex"));

/// Converts a raw cell to the target type. Blank input and anything that
/// cannot be converted both come back as `FieldValue::Null`; callers tell
/// them apart by looking at the raw cell.
pub fn coerce(raw: &CellValue, target: FieldType) -> FieldValue {
    if raw.is_blank() {
        return FieldValue::Null;
    }
    let coerced = match target {
        FieldType::Number => coerce_number(raw).map(FieldValue::Number),
        FieldType::String => Some(FieldValue::Text(stringify(raw))),
        FieldType::Boolean => Some(FieldValue::Bool(coerce_bool(raw))),
        FieldType::Date => coerce_date(raw).map(FieldValue::Date),
    };
    coerced.unwrap_or(FieldValue::Null)
}

fn stringify(raw: &CellValue) -> String {
    match raw {
        CellValue::Empty => String::new(),
        CellValue::Bool(value) => value.to_string(),
        CellValue::Number(value) => format_number(*value),
        CellValue::Text(text) => text.clone(),
    }
}

fn coerce_number(raw: &CellValue) -> Option<f64> {
    let value = match raw {
        CellValue::Number(value) => *value,
        CellValue::Bool(value) => f64::from(u8::from(*value)),
        CellValue::Text(text) => {
            let trimmed = text.trim();
            let trimmed = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
            trimmed.replace(',', "").parse::<f64>().ok()?
        }
        CellValue::Empty => return None,
    };
    value.is_finite().then_some(value)
}

fn coerce_bool(raw: &CellValue) -> bool {
    match raw {
        CellValue::Bool(value) => *value,
        CellValue::Number(value) => *value != 0.0,
        CellValue::Text(text) => {
            let folded = fold(text);
            if TRUE_WORDS.contains(&folded.as_str()) {
                true
            } else if FALSE_WORDS.contains(&folded.as_str()) {
                false
            } else {
                !folded.is_empty()
            }
        }
        CellValue::Empty => false,
    }
}

fn coerce_date(raw: &CellValue) -> Option<NaiveDate> {
    let date = match raw {
        CellValue::Number(serial) => from_serial(*serial)?,
        CellValue::Text(text) => parse_date_text(text.trim())?,
        CellValue::Bool(_) | CellValue::Empty => return None,
    };
    (MIN_YEAR..=MAX_YEAR).contains(&date.year()).then_some(date)
}

fn from_serial(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() {
        return None;
    }
    let days = serial.floor() as i64 - SERIAL_EPOCH_OFFSET_DAYS;
    NaiveDate::from_ymd_opt(1970, 1, 1)?.checked_add_signed(Duration::try_days(days)?)
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let date_part = text
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()
        .unwrap_or_default();

    if let Some(caps) = CJK_DATE.captures(date_part) {
        return ymd(&caps[1], &caps[2], &caps[3]);
    }

    if !date_part.is_empty() && date_part.chars().all(|c| c.is_ascii_digit()) {
        if date_part.len() == 8 {
            return ymd(&date_part[0..4], &date_part[4..6], &date_part[6..8]);
        }
        return from_serial(date_part.parse::<i64>().ok()? as f64);
    }

    let caps = SEPARATED_DATE.captures(date_part)?;
    let (first, second, third) = (&caps[1], &caps[2], &caps[3]);
    if first.len() == 4 {
        ymd(first, second, third)
    } else if third.len() == 4 {
        ymd(third, first, second)
    } else {
        None
    }
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}
