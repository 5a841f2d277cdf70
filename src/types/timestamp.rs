//! Date and timestamp text parsing.
//!
//! Accepts the server's ISO output style:
//! `YYYY-MM-DD[ HH:MM:SS[.fraction]][(+|-)HH[:MM[:SS]]][ BC]`, plus the
//! literals `infinity` and `-infinity`. Calendar fields are interpreted in UTC
//! and may overflow (an offset can push the hour below zero); overflow
//! normalizes into the neighbouring fields.

use chrono::{DateTime, NaiveDate, Utc};

use super::{lossy, Timestamp, Value};

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

const YEAR: usize = 0;
const MONTH: usize = 1;
const DAY: usize = 2;
const HOUR: usize = 3;
const MINUTE: usize = 4;
const SECOND: usize = 5;

/// Decode to [`Value::Timestamp`], or the raw text when the value cannot be
/// represented.
pub fn decode(text: &[u8]) -> Value {
    match parse(text) {
        Some(ts) => Value::Timestamp(ts),
        None => Value::Text(lossy(text)),
    }
}

pub fn parse(text: &[u8]) -> Option<Timestamp> {
    match text {
        b"infinity" => return Some(Timestamp::Infinity),
        b"-infinity" => return Some(Timestamp::NegInfinity),
        _ => {}
    }
    if !text.first().is_some_and(u8::is_ascii_digit) {
        return None;
    }

    let len = text.len();
    // year, month, day, hour, minute, second
    let mut parts = [0i64; 6];
    let mut millis = 0i64;
    let mut pos = 0;
    let mut complete = false;

    for (i, part) in parts.iter_mut().enumerate() {
        let (value, end) = read_number(text, pos)?;
        *part = value;
        if end == pos || end == len {
            pos = end;
            break;
        }
        pos = end + 1;
        complete = i == SECOND;
    }

    if complete && pos < len && text[pos - 1] == b'.' {
        let (fraction, end) = read_fraction(text, pos);
        millis = fraction;
        pos = end;
    } else {
        pos = pos.saturating_sub(1);
    }

    if text.last() == Some(&b'C') {
        parts[YEAR] = 1 - parts[YEAR];
    }

    if pos < len {
        let sign = match text[pos] {
            b'-' => Some(1),
            b'+' => Some(-1),
            _ => None,
        };
        if let Some(sign) = sign {
            pos += 1;
            for part in &mut parts[HOUR..] {
                let (value, end) = read_number(text, pos)?;
                if end == pos {
                    break;
                }
                *part += sign * value;
                if end == len || text[end] != b':' {
                    break;
                }
                pos = end + 1;
            }
        }
    }

    to_utc(&parts, millis).map(Timestamp::At)
}

/// Read a run of decimal digits; returns the value and the index after it.
/// Fails only on overflow.
fn read_number(text: &[u8], start: usize) -> Option<(i64, usize)> {
    let mut value = 0i64;
    let mut end = start;
    while let Some(c) = text.get(end).filter(|c| c.is_ascii_digit()) {
        value = value.checked_mul(10)?.checked_add(i64::from(c - b'0'))?;
        end += 1;
    }
    Some((value, end))
}

/// Read fractional-second digits as milliseconds: `.5` is 500ms, `.12` 120ms,
/// digits past the third are dropped.
fn read_fraction(text: &[u8], start: usize) -> (i64, usize) {
    let mut millis = 0i64;
    let mut digits = 0;
    let mut end = start;
    while let Some(c) = text.get(end).filter(|c| c.is_ascii_digit()) {
        if digits < 3 {
            millis = millis * 10 + i64::from(c - b'0');
            digits += 1;
        }
        end += 1;
    }
    for _ in digits..3 {
        millis *= 10;
    }
    (millis, end)
}

/// Combine possibly out-of-range calendar fields into a UTC instant.
fn to_utc(parts: &[i64; 6], millis: i64) -> Option<DateTime<Utc>> {
    let month0 = parts[MONTH] - 1;
    let year = i32::try_from(parts[YEAR].checked_add(month0.div_euclid(12))?).ok()?;
    let month = u32::try_from(month0.rem_euclid(12) + 1).ok()?;

    let base = NaiveDate::from_ymd_opt(year, month, 1)?
        .and_hms_opt(0, 0, 0)?
        .and_utc()
        .timestamp_millis();

    let offset = (parts[DAY] - 1)
        .checked_mul(MS_PER_DAY)?
        .checked_add(parts[HOUR].checked_mul(MS_PER_HOUR)?)?
        .checked_add(parts[MINUTE].checked_mul(MS_PER_MINUTE)?)?
        .checked_add(parts[SECOND].checked_mul(MS_PER_SECOND)?)?
        .checked_add(millis)?;

    DateTime::from_timestamp_millis(base.checked_add(offset)?)
}
