//! The journal entry record.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Mood score on a 1 (worst) to 5 (best) scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Mood(u8);

impl Mood {
  pub const MIN: u8 = 1;
  pub const MAX: u8 = 5;

  pub fn new(value: i64) -> Result<Self, StoreError> {
    if (Self::MIN as i64..=Self::MAX as i64).contains(&value) {
      Ok(Self(value as u8))
    } else {
      Err(StoreError::InvalidMood(value))
    }
  }

  pub fn value(self) -> u8 {
    self.0
  }
}

impl TryFrom<i64> for Mood {
  type Error = StoreError;

  fn try_from(value: i64) -> Result<Self, Self::Error> {
    Self::new(value)
  }
}

impl From<Mood> for i64 {
  fn from(mood: Mood) -> Self {
    mood.0 as i64
  }
}

impl fmt::Display for Mood {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// One mood record. Keyed by `date`; there is at most one per calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
  pub date: NaiveDate,
  pub mood: Mood,
  #[serde(default)]
  pub note: String,
  /// Creation or last write instant, epoch milliseconds
  pub timestamp: i64,
  /// Whether the remote holds an authoritative copy of this exact write
  #[serde(default)]
  pub synced: bool,
}

impl Entry {
  /// A freshly written entry. New writes are always unsynced.
  pub fn new(date: NaiveDate, mood: Mood, note: impl Into<String>, timestamp: i64) -> Self {
    Self {
      date,
      mood,
      note: note.into(),
      timestamp,
      synced: false,
    }
  }

  /// Store key for this entry.
  pub fn key(&self) -> String {
    format_date(self.date)
  }

  pub fn in_month(&self, year: i32, month: u32) -> bool {
    self.date.year() == year && self.date.month() == month
  }
}

/// Parse a `YYYY-MM-DD` date key.
pub fn parse_date(s: &str) -> Result<NaiveDate, StoreError> {
  NaiveDate::from_str(s.trim()).map_err(|_| StoreError::InvalidDate(s.to_string()))
}

/// Format a date as its `YYYY-MM-DD` store key.
pub fn format_date(date: NaiveDate) -> String {
  date.format("%Y-%m-%d").to_string()
}

/// Half-open `[first day, first day of next month)` range for a month.
/// Returns `None` if the month does not exist.
pub fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
  let start = NaiveDate::from_ymd_opt(year, month, 1)?;
  let end = if month == 12 {
    NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?
  } else {
    NaiveDate::from_ymd_opt(year, month + 1, 1)?
  };
  Some((start, end))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mood_range() {
    assert!(Mood::new(0).is_err());
    assert!(Mood::new(6).is_err());
    assert_eq!(Mood::new(1).unwrap().value(), 1);
    assert_eq!(Mood::new(5).unwrap().value(), 5);
  }

  #[test]
  fn test_entry_serializes_persisted_schema() {
    let entry = Entry::new(
      parse_date("2024-05-01").unwrap(),
      Mood::new(4).unwrap(),
      "ok",
      1_714_521_600_000,
    );
    let json = serde_json::to_value(&entry).unwrap();
    assert_eq!(
      json,
      serde_json::json!({
        "date": "2024-05-01",
        "mood": 4,
        "note": "ok",
        "timestamp": 1_714_521_600_000i64,
        "synced": false,
      })
    );
  }

  #[test]
  fn test_deserialize_rejects_out_of_range_mood() {
    let result: Result<Entry, _> = serde_json::from_str(
      r#"{"date":"2024-05-01","mood":9,"note":"","timestamp":0,"synced":false}"#,
    );
    assert!(result.is_err());
  }

  #[test]
  fn test_parse_date_rejects_garbage() {
    assert!(matches!(
      parse_date("2024-13-01"),
      Err(StoreError::InvalidDate(_))
    ));
    assert!(parse_date("yesterday").is_err());
  }

  #[test]
  fn test_month_bounds_december_rolls_year() {
    let (start, end) = month_bounds(2024, 12).unwrap();
    assert_eq!(format_date(start), "2024-12-01");
    assert_eq!(format_date(end), "2025-01-01");
    assert!(month_bounds(2024, 13).is_none());
    assert!(month_bounds(2024, 0).is_none());
  }
}
