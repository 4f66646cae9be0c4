use chrono::{DateTime, Duration, Utc};

/// Timestamp format used everywhere in the database: ISO 8601 with
/// millisecond precision and a literal Z suffix.
const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Current UTC time as a database timestamp string.
pub fn now_iso() -> String {
    format_iso(Utc::now())
}

pub fn format_iso(dt: DateTime<Utc>) -> String {
    dt.format(ISO_FORMAT).to_string()
}

/// Parse a database timestamp. Tolerates both the Z suffix and an explicit
/// +00:00 offset, and any sub-second precision.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Human-readable duration: "X seconds", "X minutes", or "X hours Y minutes".
pub fn format_duration(delta: Duration) -> String {
    let total_seconds = delta.num_seconds().max(0);
    if total_seconds < 60 {
        return format!("{} second{}", total_seconds, plural(total_seconds));
    }
    let minutes = total_seconds / 60;
    if minutes < 60 {
        return format!("{} minute{}", minutes, plural(minutes));
    }
    let hours = minutes / 60;
    let remaining = minutes % 60;
    if remaining == 0 {
        return format!("{} hour{}", hours, plural(hours));
    }
    format!(
        "{} hour{} {} minute{}",
        hours,
        plural(hours),
        remaining,
        plural(remaining)
    )
}

fn plural(n: i64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let now = Utc::now();
        let s = format_iso(now);
        let parsed = parse_iso(&s).unwrap();
        assert!((now - parsed).num_milliseconds().abs() < 2);
    }

    #[test]
    fn test_parse_offset_form() {
        assert!(parse_iso("2025-06-01T12:00:00.000+00:00").is_some());
        assert!(parse_iso("2025-06-01T12:00:00Z").is_some());
        assert!(parse_iso("not a timestamp").is_none());
    }

    #[test]
    fn test_format_duration_seconds() {
        assert_eq!(format_duration(Duration::seconds(1)), "1 second");
        assert_eq!(format_duration(Duration::seconds(45)), "45 seconds");
    }

    #[test]
    fn test_format_duration_minutes() {
        assert_eq!(format_duration(Duration::seconds(60)), "1 minute");
        assert_eq!(format_duration(Duration::seconds(300)), "5 minutes");
    }

    #[test]
    fn test_format_duration_hours() {
        assert_eq!(format_duration(Duration::seconds(3600)), "1 hour");
        assert_eq!(
            format_duration(Duration::seconds(3600 + 120)),
            "1 hour 2 minutes"
        );
        assert_eq!(format_duration(Duration::seconds(7200)), "2 hours");
    }
}
