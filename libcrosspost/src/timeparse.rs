//! Human-readable schedule time parsing
//!
//! Accepts relative durations ("1h", "30m", "2 days") and natural language
//! ("tomorrow", "next friday 10am") from the CLI and turns them into UTC
//! timestamps.

use chrono::{DateTime, Duration, Utc};

use crate::error::{CrosspostError, Result};

/// Parse a schedule string into a UTC time.
pub fn parse_schedule(input: &str) -> Result<DateTime<Utc>> {
    if input.is_empty() {
        return Err(CrosspostError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if let Ok(duration) = parse_duration(input) {
        return Ok(Utc::now() + duration);
    }

    if let Ok(dt) = parse_natural_language(input) {
        return Ok(dt);
    }

    Err(CrosspostError::InvalidInput(format!(
        "Could not parse schedule string: {}",
        input
    )))
}

fn parse_duration(input: &str) -> Result<Duration> {
    if let Ok(std_duration) = humantime::parse_duration(input) {
        let seconds = std_duration.as_secs() as i64;
        return Duration::try_seconds(seconds)
            .ok_or_else(|| CrosspostError::InvalidInput("Duration out of range".to_string()));
    }

    Err(CrosspostError::InvalidInput(format!(
        "Could not parse duration: {}",
        input
    )))
}

fn parse_natural_language(input: &str) -> Result<DateTime<Utc>> {
    chrono_english::parse_date_string(input, Utc::now(), chrono_english::Dialect::Us)
        .map_err(|e| CrosspostError::InvalidInput(format!("Could not parse time: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_minutes() {
        let scheduled = parse_schedule("30m").unwrap();
        let diff = (scheduled - Utc::now()).num_minutes();
        assert!((29..=31).contains(&diff), "Expected ~30 minutes, got {}", diff);
    }

    #[test]
    fn test_parse_duration_hours() {
        let scheduled = parse_schedule("2h").unwrap();
        let diff = (scheduled - Utc::now()).num_minutes();
        assert!((119..=121).contains(&diff), "Expected ~120 minutes, got {}", diff);
    }

    #[test]
    fn test_parse_duration_with_space() {
        let scheduled = parse_schedule("1 hour").unwrap();
        let diff = (scheduled - Utc::now()).num_minutes();
        assert!((59..=61).contains(&diff), "Expected ~60 minutes, got {}", diff);
    }

    #[test]
    fn test_parse_tomorrow() {
        let scheduled = parse_schedule("tomorrow").unwrap();
        let diff = (scheduled - Utc::now()).num_hours();
        assert!((20..=28).contains(&diff), "Expected ~24 hours, got {}", diff);
    }

    #[test]
    fn test_parse_empty_string() {
        assert!(parse_schedule("").is_err());
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(parse_schedule("not a time").is_err());
    }
}
