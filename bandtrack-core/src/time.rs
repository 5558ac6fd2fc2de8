//! Timestamp utilities

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse a calendar date in `YYYY-MM-DD` form
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| Error::InvalidInput(format!("Invalid date '{}': {}", value, e)))
}

/// Parse `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM`; the time part is optional
pub fn parse_date_time(value: &str) -> Result<(NaiveDate, Option<NaiveTime>)> {
    let trimmed = value.trim();
    match trimmed.split_once('T') {
        Some((date, clock)) => {
            let time = NaiveTime::parse_from_str(clock, "%H:%M")
                .map_err(|e| Error::InvalidInput(format!("Invalid time '{}': {}", value, e)))?;
            Ok((parse_date(date)?, Some(time)))
        }
        None => Ok((parse_date(trimmed)?, None)),
    }
}

/// Inverse of [`parse_date_time`]
pub fn format_date_time(date: NaiveDate, time: Option<NaiveTime>) -> String {
    match time {
        Some(t) => format!("{}T{}", date.format("%F"), t.format("%H:%M")),
        None => date.format("%F").to_string(),
    }
}
