//! Time-range parsing for query/re-index surfaces.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeParseError {
    #[error("invalid time expression '{0}': expected RFC3339 or 'now'/'now-<N><unit>'")]
    Malformed(String),
    #[error("time '{0}' is in the future")]
    Future(String),
    #[error("requested window of {got} exceeds the maximum of {max} for this surface")]
    WindowTooLarge { got: String, max: String },
    #[error("endTime must be strictly after startTime")]
    InvalidRange,
}

/// Which surface a window is being validated for — each has its own
/// retention bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Audit,
    Event,
    Activity,
}

impl Surface {
    pub fn max_window(self) -> ChronoDuration {
        match self {
            Surface::Audit => ChronoDuration::days(30),
            Surface::Event | Surface::Activity => ChronoDuration::days(60),
        }
    }
}

/// Parse one RFC3339 timestamp or a `now`/`now-<N><unit>` relative
/// expression against a single shared reference time, so `now-7d` and `now`
/// in the same request never drift against each other.
pub fn parse_one(expr: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>, TimeParseError> {
    let expr = expr.trim();
    if expr == "now" {
        return Ok(reference);
    }
    if let Some(rest) = expr.strip_prefix("now-") {
        return parse_relative(rest, reference)
            .ok_or_else(|| TimeParseError::Malformed(expr.to_string()));
    }
    DateTime::parse_from_rfc3339(expr)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimeParseError::Malformed(expr.to_string()))
}

fn parse_relative(rest: &str, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let unit = rest.chars().last()?;
    let digits = &rest[..rest.len() - 1];
    let n: i64 = digits.parse().ok()?;
    let delta = match unit {
        's' => ChronoDuration::seconds(n),
        'm' => ChronoDuration::minutes(n),
        'h' => ChronoDuration::hours(n),
        'd' => ChronoDuration::days(n),
        'w' => ChronoDuration::weeks(n),
        _ => return None,
    };
    Some(reference - delta)
}

/// The effective, validated `(start, end)` window for one request.
#[derive(Clone)]
pub struct EffectiveWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Parse and validate `startTime`/`endTime` against a single reference time
/// and the surface's maximum window.
pub fn resolve_window(
    start_expr: &str,
    end_expr: Option<&str>,
    surface: Surface,
    reference: DateTime<Utc>,
) -> Result<EffectiveWindow, TimeParseError> {
    let start = parse_one(start_expr, reference)?;
    let end = match end_expr {
        Some(e) => parse_one(e, reference)?,
        None => reference,
    };
    if start > reference {
        return Err(TimeParseError::Future(start.to_rfc3339()));
    }
    if end > reference {
        return Err(TimeParseError::Future(end.to_rfc3339()));
    }
    if end <= start {
        return Err(TimeParseError::InvalidRange);
    }
    let window = end - start;
    let max = surface.max_window();
    if window > max {
        return Err(TimeParseError::WindowTooLarge {
            got: format!("{}s", window.num_seconds()),
            max: format!("{}d", max.num_days()),
        });
    }
    Ok(EffectiveWindow { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_now_to_reference() {
        assert_eq!(parse_one("now", reference()).unwrap(), reference());
    }

    #[test]
    fn parses_relative_days() {
        let got = parse_one("now-7d", reference()).unwrap();
        assert_eq!(got, reference() - ChronoDuration::days(7));
    }

    #[test]
    fn parses_rfc3339() {
        let got = parse_one("2026-07-01T00:00:00Z", reference()).unwrap();
        assert_eq!(got.to_rfc3339(), "2026-07-01T00:00:00+00:00");
    }

    #[test]
    fn rejects_malformed_expression() {
        assert!(parse_one("yesterday", reference()).is_err());
    }

    #[test]
    fn rejects_start_after_end() {
        let err = resolve_window("now", Some("now-1d"), Surface::Audit, reference()).unwrap_err();
        assert_eq!(err, TimeParseError::InvalidRange);
    }

    #[test]
    fn rejects_start_equal_to_end() {
        let err = resolve_window("now-1d", Some("now-1d"), Surface::Audit, reference()).unwrap_err();
        assert_eq!(err, TimeParseError::InvalidRange);
    }

    #[test]
    fn enforces_audit_thirty_day_max() {
        let err = resolve_window("now-31d", None, Surface::Audit, reference()).unwrap_err();
        assert!(matches!(err, TimeParseError::WindowTooLarge { .. }));
    }

    #[test]
    fn event_window_allows_sixty_days() {
        let window = resolve_window("now-60d", None, Surface::Event, reference()).unwrap();
        assert_eq!(window.end, reference());
    }
}
