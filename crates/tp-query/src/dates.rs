//! # Date Predicates
//!
//! Conditions on the reserved `date` field. A date-only literal
//! (`'2020-01-01'`) compares by calendar day, a time-bearing literal
//! (`'2020-01-01T10:30:00'`) compares by instant. All times are naive UTC.

use crate::error::CompileError;
use crate::plan::Operator;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;

/// Name of the reserved date field in queries.
pub const DATE_FIELD: &str = "date";

const DATE_FORMAT: &str = "%Y-%m-%d";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Which end of a range a predicate bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatePredicate {
    pub raw: String,
    pub timestamp: NaiveDateTime,
    pub operator: Operator,
    pub date_only: bool,
    pub boundary: Boundary,
}

impl DatePredicate {
    pub fn parse(raw: &str, operator: Operator) -> Result<Self, CompileError> {
        match operator {
            Operator::In | Operator::Like | Operator::ILike => {
                return Err(CompileError::Unsupported(format!(
                    "{} {} '{}'",
                    DATE_FIELD,
                    operator.as_str(),
                    raw
                )))
            }
            _ => {}
        }

        let boundary = match operator {
            Operator::Lt | Operator::LtEq => Boundary::End,
            _ => Boundary::Start,
        };

        let trimmed = raw.trim();
        let (timestamp, date_only) = if let Ok(day) = NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
        {
            let time = if operator == Operator::LtEq {
                end_of_day()
            } else {
                NaiveTime::MIN
            };
            (day.and_time(time), true)
        } else {
            let ts = parse_timestamp(trimmed)
                .ok_or_else(|| CompileError::InvalidDate(raw.to_string()))?;
            (ts, false)
        };

        Ok(Self {
            raw: raw.to_string(),
            timestamp,
            operator,
            date_only,
            boundary,
        })
    }

    pub fn day(&self) -> NaiveDate {
        self.timestamp.date()
    }

    /// Full-instant check, used for log lines and log file names.
    pub fn matches_instant(&self, t: NaiveDateTime) -> bool {
        if self.date_only {
            return self.compare_days(t.date());
        }
        match self.operator {
            Operator::Exists => true,
            Operator::Eq => t == self.timestamp,
            Operator::NotEq => t != self.timestamp,
            Operator::Gt => t > self.timestamp,
            Operator::GtEq => t >= self.timestamp,
            Operator::Lt => t < self.timestamp,
            Operator::LtEq => t <= self.timestamp,
            _ => false,
        }
    }

    /// Day-granularity check, used for date-bucket directories. A time-bearing
    /// predicate keeps every day that could contain a matching instant.
    pub fn matches_day(&self, day: NaiveDate) -> bool {
        if self.date_only {
            return self.compare_days(day);
        }
        let d = self.day();
        match self.operator {
            Operator::Exists | Operator::NotEq => true,
            Operator::Eq => day == d,
            Operator::Gt | Operator::GtEq => day >= d,
            Operator::Lt | Operator::LtEq => day <= d,
            _ => false,
        }
    }

    fn compare_days(&self, day: NaiveDate) -> bool {
        let d = self.day();
        match self.operator {
            Operator::Exists => true,
            Operator::Eq => day == d,
            Operator::NotEq => day != d,
            Operator::Gt => day > d,
            Operator::GtEq => day >= d,
            Operator::Lt => day < d,
            Operator::LtEq => day <= d,
            _ => false,
        }
    }
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

/// Parses a timestamp as found in log records: RFC 3339 (normalised to UTC)
/// or a naive `YYYY-MM-DD[T ]HH:MM:SS`. A bare date resolves to midnight.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

/// True when every predicate accepts the instant.
pub fn all_match_instant(predicates: &[DatePredicate], t: NaiveDateTime) -> bool {
    predicates.iter().all(|p| p.matches_instant(t))
}

/// True when every predicate accepts the day.
pub fn all_match_day(predicates: &[DatePredicate], day: NaiveDate) -> bool {
    predicates.iter().all(|p| p.matches_day(day))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        parse_timestamp(s).unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[test]
    fn test_date_only_equality_covers_whole_day() {
        let p = DatePredicate::parse("2020-01-01", Operator::Eq).unwrap();
        assert!(p.date_only);
        assert!(p.matches_instant(ts("2020-01-01T00:00:00")));
        assert!(p.matches_instant(ts("2020-01-01T12:34:56")));
        assert!(p.matches_instant(ts("2020-01-01T23:59:59")));
        assert!(!p.matches_instant(ts("2019-12-31T23:59:59")));
        assert!(!p.matches_instant(ts("2020-01-02T00:00:00")));
    }

    #[test]
    fn test_date_only_not_equal_excludes_day() {
        let p = DatePredicate::parse("2020-01-01", Operator::NotEq).unwrap();
        assert!(!p.matches_instant(ts("2020-01-01T08:00:00")));
        assert!(p.matches_instant(ts("2020-01-02T08:00:00")));
    }

    #[test]
    fn test_date_only_ranges_compare_by_day() {
        let gt = DatePredicate::parse("2020-01-01", Operator::Gt).unwrap();
        assert!(!gt.matches_instant(ts("2020-01-01T23:00:00")));
        assert!(gt.matches_instant(ts("2020-01-02T00:00:00")));

        let gte = DatePredicate::parse("2020-01-01", Operator::GtEq).unwrap();
        assert!(gte.matches_instant(ts("2020-01-01T00:00:00")));
        assert!(!gte.matches_instant(ts("2019-12-31T23:59:59")));

        let lt = DatePredicate::parse("2020-01-01", Operator::Lt).unwrap();
        assert!(lt.matches_instant(ts("2019-12-31T23:59:59")));
        assert!(!lt.matches_instant(ts("2020-01-01T00:00:00")));

        let lte = DatePredicate::parse("2020-01-01", Operator::LtEq).unwrap();
        assert!(lte.matches_instant(ts("2020-01-01T23:59:59")));
        assert!(!lte.matches_instant(ts("2020-01-02T00:00:00")));
    }

    #[test]
    fn test_time_bearing_compares_instants() {
        let p = DatePredicate::parse("2020-01-01T12:00:00", Operator::Gt).unwrap();
        assert!(!p.date_only);
        assert!(!p.matches_instant(ts("2020-01-01T12:00:00")));
        assert!(p.matches_instant(ts("2020-01-01T12:00:01")));

        let eq = DatePredicate::parse("2020-01-01T12:00:00", Operator::Eq).unwrap();
        assert!(eq.matches_instant(ts("2020-01-01T12:00:00")));
        assert!(!eq.matches_instant(ts("2020-01-01T12:00:01")));
    }

    #[test]
    fn test_time_bearing_keeps_containing_day() {
        let p = DatePredicate::parse("2020-01-01T12:00:00", Operator::Gt).unwrap();
        assert!(p.matches_day(day("2020-01-01")));
        assert!(p.matches_day(day("2020-01-05")));
        assert!(!p.matches_day(day("2019-12-31")));

        let lt = DatePredicate::parse("2020-01-01T12:00:00", Operator::Lt).unwrap();
        assert!(lt.matches_day(day("2020-01-01")));
        assert!(!lt.matches_day(day("2020-01-02")));
    }

    #[test]
    fn test_boundary_and_end_of_day() {
        let lte = DatePredicate::parse("2020-01-01", Operator::LtEq).unwrap();
        assert_eq!(lte.boundary, Boundary::End);
        assert_eq!(lte.timestamp, ts("2020-01-01T23:59:59"));

        let gte = DatePredicate::parse("2020-01-01", Operator::GtEq).unwrap();
        assert_eq!(gte.boundary, Boundary::Start);
        assert_eq!(gte.timestamp, ts("2020-01-01T00:00:00"));
    }

    #[test]
    fn test_range_is_conjunction_of_bounds() {
        let preds = vec![
            DatePredicate::parse("2020-01-01", Operator::GtEq).unwrap(),
            DatePredicate::parse("2020-01-03", Operator::LtEq).unwrap(),
        ];
        assert!(all_match_day(&preds, day("2020-01-02")));
        assert!(all_match_day(&preds, day("2020-01-03")));
        assert!(!all_match_day(&preds, day("2020-01-04")));
        assert!(all_match_instant(&preds, ts("2020-01-03T23:00:00")));
    }

    #[test]
    fn test_rfc3339_is_normalised_to_utc() {
        assert_eq!(
            ts("2020-01-01T10:00:00+02:00"),
            ts("2020-01-01T08:00:00")
        );
    }

    #[test]
    fn test_invalid_date_is_rejected() {
        let err = DatePredicate::parse("yesterday", Operator::Gt).unwrap_err();
        assert_eq!(err, CompileError::InvalidDate("yesterday".into()));
        assert!(DatePredicate::parse("2020-01-01", Operator::Like).is_err());
    }
}
