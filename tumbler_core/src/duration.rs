use std::time::Duration;
use thiserror::Error;

/// Errors produced while parsing a compact `[Nh][Nm][Ns]` duration expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("duration expression is empty")]
    Empty,
    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("missing number before unit '{0}'")]
    MissingNumber(char),
    #[error("number {0:?} is not followed by a unit (h, m or s)")]
    MissingUnit(String),
    #[error("unit '{0}' appears out of order or more than once")]
    UnitOrder(char),
    #[error("malformed number {0:?}: expected digits with at most nine fraction digits")]
    MalformedNumber(String),
    #[error("only seconds may carry a fraction, got {0:?}")]
    FractionalUnit(String),
    #[error("component {0:?} is out of range")]
    Overflow(String),
}

/// Parses durations such as `"60s"`, `"2h30m"` or `"1m0.5s"`.
///
/// Units are case-insensitive and must appear in hour, minute, second order, each at
/// most once. Signs are not accepted, so the result is never negative.
pub fn parse_duration(expr: &str) -> Result<Duration, DurationParseError> {
    if expr.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let mut total = Duration::ZERO;
    // 0 = nothing seen, 1 = hours, 2 = minutes, 3 = seconds
    let mut last_rank = 0u8;
    let mut number = String::new();

    for (offset, ch) in expr.char_indices() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
            continue;
        }

        let unit = ch.to_ascii_lowercase();
        let (rank, unit_secs) = match unit {
            'h' => (1u8, 3600u64),
            'm' => (2, 60),
            's' => (3, 1),
            _ => return Err(DurationParseError::UnexpectedChar { found: ch, offset }),
        };
        if number.is_empty() {
            return Err(DurationParseError::MissingNumber(unit));
        }
        if rank <= last_rank {
            return Err(DurationParseError::UnitOrder(unit));
        }
        last_rank = rank;

        let component = if unit == 's' {
            parse_seconds(&number)?
        } else {
            if number.contains('.') {
                return Err(DurationParseError::FractionalUnit(format!("{number}{unit}")));
            }
            let value: u64 = number
                .parse()
                .map_err(|_| DurationParseError::Overflow(format!("{number}{unit}")))?;
            let secs = value
                .checked_mul(unit_secs)
                .ok_or_else(|| DurationParseError::Overflow(format!("{number}{unit}")))?;
            Duration::from_secs(secs)
        };
        total = total
            .checked_add(component)
            .ok_or_else(|| DurationParseError::Overflow(expr.to_string()))?;
        number.clear();
    }

    if !number.is_empty() {
        return Err(DurationParseError::MissingUnit(number));
    }
    Ok(total)
}

fn parse_seconds(number: &str) -> Result<Duration, DurationParseError> {
    let malformed = || DurationParseError::MalformedNumber(format!("{number}s"));
    let (whole, fraction) = match number.split_once('.') {
        Some((_, f)) if f.is_empty() || f.len() > 9 || f.contains('.') => {
            return Err(malformed());
        }
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() {
        return Err(malformed());
    }
    let secs: u64 = whole
        .parse()
        .map_err(|_| DurationParseError::Overflow(format!("{number}s")))?;
    let mut nanos = 0u32;
    if !fraction.is_empty() {
        let scale = 10u32.pow(9 - fraction.len() as u32);
        nanos = fraction.parse::<u32>().map_err(|_| malformed())? * scale;
    }
    Ok(Duration::new(secs, nanos))
}
