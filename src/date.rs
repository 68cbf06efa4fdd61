//! Day keys and date-range filters.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::PipelineError;

/// Text form of [`DateKey::Meta`].
pub const META_KEY: &str = "#";

/// Format of a day key in keys, tags and record text.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// The join key shared by every stage.
///
/// `Meta` marks type-registry and tag records. It orders before every day
/// and always routes to the first reduce bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DateKey {
    Meta,
    Day(NaiveDate),
}

impl DateKey {
    pub fn day(&self) -> Option<NaiveDate> {
        match self {
            DateKey::Meta => None,
            DateKey::Day(day) => Some(*day),
        }
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, DateKey::Meta)
    }

    pub fn to_bytes(self) -> Bytes {
        Bytes::from(self.to_string())
    }

    pub fn from_bytes(key: &[u8]) -> Result<Self, PipelineError> {
        let text = std::str::from_utf8(key)
            .map_err(|_| PipelineError::parse("date key", String::from_utf8_lossy(key)))?;
        text.parse()
    }
}

impl From<NaiveDate> for DateKey {
    fn from(day: NaiveDate) -> Self {
        DateKey::Day(day)
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateKey::Meta => f.write_str(META_KEY),
            DateKey::Day(day) => write!(f, "{}", day.format(DAY_FORMAT)),
        }
    }
}

impl FromStr for DateKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == META_KEY {
            return Ok(DateKey::Meta);
        }
        parse_day(s).map(DateKey::Day)
    }
}

/// Parses a `YYYY-MM-DD` day.
pub fn parse_day(s: &str) -> Result<NaiveDate, PipelineError> {
    NaiveDate::parse_from_str(s.trim(), DAY_FORMAT).map_err(|_| PipelineError::parse("date", s))
}

/// Parses `text` with a chrono `format`, accepting date-times, plain dates
/// (at midnight) and date-times carrying an offset (converted to UTC).
pub fn parse_datetime(text: &str, format: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    // naive parsing accepts `%z` but drops the offset
    if format.contains("%z") || format.contains("%:z") {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.naive_utc());
        }
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
        return Some(dt);
    }
    if let Ok(day) = NaiveDate::parse_from_str(text, format) {
        return day.and_hms_opt(0, 0, 0);
    }
    DateTime::parse_from_str(text, format)
        .ok()
        .map(|dt| dt.naive_utc())
}

/// An inclusive-start, exclusive-end window of days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Parses both bounds, reporting every problem found.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self, Vec<String>> {
        let mut problems = Vec::new();
        let start = match start {
            Some(s) => parse_day(s).map_err(|e| problems.push(e.to_string())).ok(),
            None => {
                problems.push("missing start date".to_string());
                None
            }
        };
        let end = match end {
            Some(s) => parse_day(s).map_err(|e| problems.push(e.to_string())).ok(),
            None => {
                problems.push("missing end date".to_string());
                None
            }
        };
        if let (Some(start), Some(end)) = (start, end) {
            if end < start {
                problems.push(format!("date range ends ({end}) before it starts ({start})"));
            } else {
                return Ok(Self::new(start, end));
            }
        }
        Err(problems)
    }

    #[inline]
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {}",
            self.start.format(DAY_FORMAT),
            self.end.format(DAY_FORMAT)
        )
    }
}

impl FromStr for DateRange {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once(" to ")
            .ok_or_else(|| PipelineError::parse("date range", s))?;
        Ok(Self::new(parse_day(start)?, parse_day(end)?))
    }
}
