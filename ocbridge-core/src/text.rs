//! Text extraction and timestamp parsing for backend payloads.
//!
//! Backend message bodies carry either a top-level text field or a `parts[]`
//! array; session timestamps arrive as RFC3339, bare integers of varying
//! magnitude, or the CLI's human-readable clock format. Session sorting
//! depends on these heuristics, so they are pinned down by tests.

use chrono::{Local, NaiveDate, NaiveTime, TimeZone};
use serde_json::Value;

/// Top-level keys probed for message text, in preference order.
const TEXT_KEYS: &[&str] = &["text", "content", "message"];

/// Extract the human-readable text from a backend message object.
///
/// Prefers a non-blank top-level `text`/`content`/`message` string; otherwise
/// joins the `parts[]` entries' `text`/`content` strings with newlines.
/// Returns an empty string when neither shape is present.
pub fn extract_text(value: &Value) -> String {
    for key in TEXT_KEYS {
        if let Some(s) = value.get(key).and_then(Value::as_str)
            && !s.trim().is_empty()
        {
            return s.to_string();
        }
    }

    let Some(parts) = value.get("parts").and_then(Value::as_array) else {
        return String::new();
    };

    let mut pieces: Vec<&str> = Vec::new();
    for part in parts {
        for key in ["text", "content"] {
            if let Some(s) = part.get(key).and_then(Value::as_str)
                && !s.trim().is_empty()
            {
                pieces.push(s);
                break;
            }
        }
    }
    pieces.join("\n")
}

/// Parse a timestamp in any of the accepted forms into Unix milliseconds.
///
/// Accepted forms:
/// - RFC3339 (`2025-02-16T14:00:00Z`)
/// - bare integers, auto-scaled by magnitude: up to 10 digits are seconds,
///   up to 13 milliseconds, up to 16 microseconds, beyond that nanoseconds
/// - the CLI clock format `H:MM AM|PM`, optionally followed by
///   ` · M/D/YYYY`; a missing date means today (local time)
///
/// Returns 0 for anything unparseable.
pub fn parse_timestamp(raw: &str) -> i64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0;
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt.timestamp_millis();
    }

    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return scale_integer_timestamp(raw);
    }

    parse_cli_timestamp(raw).unwrap_or(0)
}

/// Scale a digits-only timestamp to milliseconds by magnitude bucket.
fn scale_integer_timestamp(digits: &str) -> i64 {
    let Ok(n) = digits.parse::<i64>() else {
        return 0;
    };
    match digits.len() {
        0..=10 => n.saturating_mul(1000), // seconds
        11..=13 => n,                     // milliseconds
        14..=16 => n / 1_000,             // microseconds
        _ => n / 1_000_000,               // nanoseconds
    }
}

/// Parse `H:MM AM|PM` with an optional ` · M/D/YYYY` suffix, local time.
fn parse_cli_timestamp(raw: &str) -> Option<i64> {
    let (time_part, date_part) = match raw.split_once(" · ") {
        Some((t, d)) => (t.trim(), Some(d.trim())),
        None => (raw, None),
    };

    let time = NaiveTime::parse_from_str(time_part, "%I:%M %p").ok()?;
    let date = match date_part {
        Some(d) => NaiveDate::parse_from_str(d, "%m/%d/%Y").ok()?,
        None => Local::now().date_naive(),
    };

    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Truncate a string to `max_chars` Unicode characters, appending `...`
/// when something was cut. Multi-byte safe.
pub fn truncate(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        s.to_string()
    } else if max_chars <= 3 {
        ".".repeat(max_chars)
    } else {
        let kept: String = s.chars().take(max_chars - 3).collect();
        format!("{}...", kept)
    }
}
