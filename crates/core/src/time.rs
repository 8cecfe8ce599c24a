//! Wall-clock timestamps with explicit precision.
//!
//! A [`Timestamp`] is a UTC instant that serializes canonically as ISO-8601
//! at millisecond precision with the `Z` zone. Parsing is tolerant (zoned or
//! naive datetimes, date-only and year-only forms) but output is always
//! canonical. [`TimePrecision`] records how much of the instant is meaningful.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Canonical render format: millisecond precision, `Z` zone.
const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// How much of a timestamp is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePrecision {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Millisecond,
}

/// Error returned when a string cannot be read as a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized timestamp {0:?}")]
pub struct TimestampError(pub String);

/// A UTC instant with canonical ISO-8601 serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn new(value: DateTime<Utc>) -> Self {
        Timestamp(value)
    }

    pub fn now() -> Self {
        Timestamp(Utc::now())
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Seconds since the Unix epoch. Used for whole-second histogram widths.
    pub fn unix_seconds(&self) -> i64 {
        self.0.timestamp()
    }

    pub fn from_unix_seconds(secs: i64) -> Option<Self> {
        Utc.timestamp_opt(secs, 0).single().map(Timestamp)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(CANONICAL_FORMAT))
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    /// Accepts RFC 3339 (any zone, any sub-second width), naive datetimes,
    /// dates, year-months, and bare years. Everything normalizes to UTC.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Timestamp(dt.with_timezone(&Utc)));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                return Ok(Timestamp(Utc.from_utc_datetime(&naive)));
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            let naive = date.and_hms_opt(0, 0, 0).ok_or_else(|| TimestampError(s.to_string()))?;
            return Ok(Timestamp(Utc.from_utc_datetime(&naive)));
        }
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d") {
            let naive = date.and_hms_opt(0, 0, 0).ok_or_else(|| TimestampError(s.to_string()))?;
            return Ok(Timestamp(Utc.from_utc_datetime(&naive)));
        }
        if let Ok(year) = s.parse::<i32>() {
            if let Some(date) = NaiveDate::from_ymd_opt(year, 1, 1) {
                let naive = date.and_hms_opt(0, 0, 0).ok_or_else(|| TimestampError(s.to_string()))?;
                return Ok(Timestamp(Utc.from_utc_datetime(&naive)));
            }
        }
        Err(TimestampError(s.to_string()))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_output_is_millisecond_z() {
        let ts: Timestamp = "1999-03-17T00:00:00Z".parse().unwrap();
        assert_eq!(ts.to_string(), "1999-03-17T00:00:00.000Z");
    }

    #[test]
    fn tolerant_input_forms() {
        let canonical: Timestamp = "2021-06-01T12:30:45.500Z".parse().unwrap();
        assert_eq!(canonical.to_string(), "2021-06-01T12:30:45.500Z");

        let offset: Timestamp = "2021-06-01T14:30:45.5+02:00".parse().unwrap();
        assert_eq!(offset, canonical);

        let naive: Timestamp = "2021-06-01T12:30:45".parse().unwrap();
        assert_eq!(naive.to_string(), "2021-06-01T12:30:45.000Z");

        let date: Timestamp = "2021-06-01".parse().unwrap();
        assert_eq!(date.to_string(), "2021-06-01T00:00:00.000Z");

        let month: Timestamp = "2021-06".parse().unwrap();
        assert_eq!(month.to_string(), "2021-06-01T00:00:00.000Z");

        let year: Timestamp = "2021".parse().unwrap();
        assert_eq!(year.to_string(), "2021-01-01T00:00:00.000Z");

        assert!("yesterday".parse::<Timestamp>().is_err());
    }

    #[test]
    fn serde_emits_canonical_string() {
        let ts: Timestamp = "1999-03-17".parse().unwrap();
        assert_eq!(serde_json::to_string(&ts).unwrap(), "\"1999-03-17T00:00:00.000Z\"");
        let back: Timestamp = serde_json::from_str("\"1999-03-17T00:00:00.000Z\"").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn precision_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TimePrecision::Day).unwrap(), "\"day\"");
        assert_eq!(
            serde_json::from_str::<TimePrecision>("\"millisecond\"").unwrap(),
            TimePrecision::Millisecond
        );
    }
}
