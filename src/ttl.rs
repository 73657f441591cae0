use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;

/// Shortest lifetime an entry may be given.
pub const MIN_TTL: Duration = Duration::from_secs(60);
/// Longest lifetime an entry may be given.
pub const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Lifetime used when the uploader does not ask for one.
pub const DEFAULT_TTL: &str = "3 days";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TtlError {
    #[error("duration is empty")]
    Empty,
    #[error("unrecognized duration: {0:?}")]
    Unrecognized(String),
}

/// Parse a human-entered lifetime into a [`Duration`].
///
/// Accepts short phrases ("3 days", "1 min", "90 seconds", "2h 30m") and an
/// ISO-8601 duration subset ("PT1H30M", "P2D"). Parsing says nothing about
/// allowed bounds; see [`clamp_expiry`].
pub fn parse_ttl(input: &str) -> Result<Duration, TtlError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TtlError::Empty);
    }

    let seconds = if trimmed.starts_with('P') || trimmed.starts_with('p') {
        parse_iso(trimmed)
    } else {
        parse_phrase(trimmed)
    }
    .ok_or_else(|| TtlError::Unrecognized(input.to_string()))?;

    if seconds == 0 {
        return Err(TtlError::Unrecognized(input.to_string()));
    }

    Ok(Duration::from_secs(seconds))
}

/// Turn a requested lifetime into an absolute expiry, pinned into the
/// `[now + MIN_TTL, now + max]` window.
pub fn clamp_expiry(
    now: OffsetDateTime,
    requested: Duration,
    min: Duration,
    max: Duration,
) -> OffsetDateTime {
    let clamped = requested.clamp(min, max);
    now + time::Duration::try_from(clamped).unwrap_or(time::Duration::MAX)
}

fn unit_seconds(unit: &str) -> Option<u64> {
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Some(1),
        "m" | "min" | "mins" | "minute" | "minutes" => Some(60),
        "h" | "hr" | "hrs" | "hour" | "hours" => Some(3_600),
        "d" | "day" | "days" => Some(86_400),
        "w" | "week" | "weeks" => Some(604_800),
        _ => None,
    }
}

/// "3 days", "2h30m", "1 min" — pairs of a number and a unit word.
fn parse_phrase(input: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut chars = input.chars().peekable();
    let mut saw_pair = false;

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut digits = String::new();
        while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
            digits.push(chars.next()?);
        }
        if digits.is_empty() {
            return None;
        }
        let value: u64 = digits.parse().ok()?;

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut unit = String::new();
        while matches!(chars.peek(), Some(c) if c.is_ascii_alphabetic()) {
            unit.push(chars.next()?.to_ascii_lowercase());
        }
        if unit.is_empty() {
            return None;
        }

        total = total.checked_add(value.checked_mul(unit_seconds(&unit)?)?)?;
        saw_pair = true;
    }

    saw_pair.then_some(total)
}

/// ISO-8601 durations: P[nW][nD][T[nH][nM][nS]].
fn parse_iso(input: &str) -> Option<u64> {
    let body = &input[1..];
    let mut total: u64 = 0;
    let mut in_time = false;
    let mut digits = String::new();
    let mut saw_component = false;

    for ch in body.chars() {
        match ch {
            'T' | 't' => {
                if in_time || !digits.is_empty() {
                    return None;
                }
                in_time = true;
            }
            c if c.is_ascii_digit() => digits.push(c),
            c => {
                let value: u64 = digits.parse().ok()?;
                digits.clear();
                let unit = match (c.to_ascii_uppercase(), in_time) {
                    ('W', false) => 604_800,
                    ('D', false) => 86_400,
                    ('H', true) => 3_600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return None,
                };
                total = total.checked_add(value.checked_mul(unit)?)?;
                saw_component = true;
            }
        }
    }

    if !digits.is_empty() {
        return None;
    }
    saw_component.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_phrases() {
        assert_eq!(parse_ttl("3 days").unwrap(), Duration::from_secs(3 * 86_400));
        assert_eq!(parse_ttl("1 min").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_ttl("90 seconds").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_ttl("2 weeks").unwrap(), Duration::from_secs(2 * 604_800));
    }

    #[test]
    fn parses_compact_and_compound_phrases() {
        assert_eq!(parse_ttl("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(
            parse_ttl("2h 30m").unwrap(),
            Duration::from_secs(2 * 3_600 + 30 * 60)
        );
        assert_eq!(
            parse_ttl("1 day, 6 hours").unwrap(),
            Duration::from_secs(86_400 + 6 * 3_600)
        );
    }

    #[test]
    fn parses_iso_durations() {
        assert_eq!(
            parse_ttl("PT1H30M").unwrap(),
            Duration::from_secs(3_600 + 30 * 60)
        );
        assert_eq!(parse_ttl("P2D").unwrap(), Duration::from_secs(2 * 86_400));
        assert_eq!(
            parse_ttl("P1DT12H").unwrap(),
            Duration::from_secs(86_400 + 12 * 3_600)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_ttl(""), Err(TtlError::Empty));
        assert!(parse_ttl("soon").is_err());
        assert!(parse_ttl("3 fortnights").is_err());
        assert!(parse_ttl("days 3").is_err());
        assert!(parse_ttl("P").is_err());
        assert!(parse_ttl("PT").is_err());
        assert!(parse_ttl("0 seconds").is_err());
    }

    #[test]
    fn clamps_into_the_allowed_window() {
        let now = OffsetDateTime::UNIX_EPOCH;

        let short = clamp_expiry(now, Duration::from_secs(1), MIN_TTL, MAX_TTL);
        assert_eq!(short - now, time::Duration::seconds(60));

        let long = clamp_expiry(now, Duration::from_secs(30 * 86_400), MIN_TTL, MAX_TTL);
        assert_eq!(long - now, time::Duration::days(7));

        let mid = clamp_expiry(now, Duration::from_secs(3 * 86_400), MIN_TTL, MAX_TTL);
        assert_eq!(mid - now, time::Duration::days(3));
    }
}
