//! Recurring calendar windows rendered as STAC `datetime` intervals.
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A closed interval `start/end`, e.g. `2024-06-01T00:00:00Z/2024-07-31T23:59:59Z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(Error::InvalidRange(format!(
                "end {} is not after start {}",
                end.format(TIMESTAMP_FORMAT),
                start.format(TIMESTAMP_FORMAT)
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// First day of `start_month` 00:00:00 to last day of `end_month`
    /// 23:59:59, the end month falling in `end_year`.
    fn month_window(
        start_year: i32,
        start_month: u32,
        end_year: i32,
        end_month: u32,
    ) -> Result<Self> {
        let invalid = |year: i32, month: u32| {
            Error::InvalidRange(format!("{year}-{month} is not a valid month"))
        };
        let start = Utc
            .with_ymd_and_hms(start_year, start_month, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| invalid(start_year, start_month))?;
        let last_day = last_day_of_month(end_year, end_month)?;
        let end = Utc
            .with_ymd_and_hms(end_year, end_month, last_day, 23, 59, 59)
            .single()
            .ok_or_else(|| invalid(end_year, end_month))?;
        Self::new(start, end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.start.format(TIMESTAMP_FORMAT),
            self.end.format(TIMESTAMP_FORMAT)
        )
    }
}

impl FromStr for DateRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidRange(format!("'{s}' is not a start/end interval")))?;
        let parse = |value: &str| {
            DateTime::parse_from_rfc3339(value.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::InvalidRange(format!("'{value}': {e}")))
        };
        Self::new(parse(start)?, parse(end)?)
    }
}

impl Serialize for DateRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DateRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One window per year in `start_year..=end_year`, covering `start_month`
/// through `end_month` of that same year.
pub fn build(
    start_year: i32,
    end_year: i32,
    start_month: u32,
    end_month: u32,
) -> Result<Vec<DateRange>> {
    check_months(start_month, end_month)?;
    if end_year < start_year {
        return Err(Error::InvalidRange(format!(
            "end year {end_year} is before start year {start_year}"
        )));
    }
    if end_month < start_month {
        return Err(Error::InvalidRange(format!(
            "end month {end_month} is before start month {start_month}"
        )));
    }

    (start_year..=end_year)
        .map(|year| DateRange::month_window(year, start_month, year, end_month))
        .collect()
}

/// Like [`build`], but a window whose end month precedes its start month
/// runs into the following year (November to January, say). Such windows
/// start in `start_year..end_year`, so the last one ends in `end_year`.
pub fn build_wrapping(
    start_year: i32,
    end_year: i32,
    start_month: u32,
    end_month: u32,
) -> Result<Vec<DateRange>> {
    check_months(start_month, end_month)?;
    if start_month <= end_month {
        return build(start_year, end_year, start_month, end_month);
    }
    if end_year <= start_year {
        return Err(Error::InvalidRange(format!(
            "window {start_month}..{end_month} crosses the year boundary, \
             so end year {end_year} must be after start year {start_year}"
        )));
    }

    (start_year..end_year)
        .map(|year| DateRange::month_window(year, start_month, year + 1, end_month))
        .collect()
}

fn check_months(start_month: u32, end_month: u32) -> Result<()> {
    for month in [start_month, end_month] {
        if !(1..=12).contains(&month) {
            return Err(Error::InvalidRange(format!("month {month} is not in 1..=12")));
        }
    }
    Ok(())
}

fn last_day_of_month(year: i32, month: u32) -> Result<u32> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .ok_or_else(|| Error::InvalidRange(format!("{year}-{month} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(ranges: &[DateRange]) -> Vec<String> {
        ranges.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_single_year_handles_leap_february() {
        let ranges = build(2020, 2020, 1, 2).unwrap();
        assert_eq!(rendered(&ranges), vec!["2020-01-01T00:00:00Z/2020-02-29T23:59:59Z"]);
    }

    #[test]
    fn test_one_range_per_year() {
        let ranges = build(2020, 2024, 3, 4).unwrap();
        assert_eq!(
            rendered(&ranges),
            vec![
                "2020-03-01T00:00:00Z/2020-04-30T23:59:59Z",
                "2021-03-01T00:00:00Z/2021-04-30T23:59:59Z",
                "2022-03-01T00:00:00Z/2022-04-30T23:59:59Z",
                "2023-03-01T00:00:00Z/2023-04-30T23:59:59Z",
                "2024-03-01T00:00:00Z/2024-04-30T23:59:59Z",
            ]
        );
    }

    #[test]
    fn test_length_and_ordering_hold_for_all_valid_inputs() {
        for start_year in 2015..2020 {
            for end_year in start_year..2022 {
                for start_month in 1..=12 {
                    for end_month in start_month..=12 {
                        let ranges = build(start_year, end_year, start_month, end_month).unwrap();
                        assert_eq!(ranges.len(), (end_year - start_year + 1) as usize);
                        assert!(ranges.iter().all(|r| r.end() > r.start()));
                    }
                }
            }
        }
    }

    #[test]
    fn test_december_window_ends_on_new_years_eve() {
        let ranges = build(2023, 2023, 12, 12).unwrap();
        assert_eq!(rendered(&ranges), vec!["2023-12-01T00:00:00Z/2023-12-31T23:59:59Z"]);
    }

    #[test]
    fn test_rejects_inverted_months_and_years() {
        assert!(matches!(build(2020, 2021, 7, 6), Err(Error::InvalidRange(_))));
        assert!(matches!(build(2021, 2020, 6, 7), Err(Error::InvalidRange(_))));
        assert!(matches!(build(2020, 2020, 0, 7), Err(Error::InvalidRange(_))));
        assert!(matches!(build(2020, 2020, 6, 13), Err(Error::InvalidRange(_))));
    }

    #[test]
    fn test_wrapping_window_crosses_year_boundary() {
        let ranges = build_wrapping(2020, 2023, 11, 1).unwrap();
        assert_eq!(
            rendered(&ranges),
            vec![
                "2020-11-01T00:00:00Z/2021-01-31T23:59:59Z",
                "2021-11-01T00:00:00Z/2022-01-31T23:59:59Z",
                "2022-11-01T00:00:00Z/2023-01-31T23:59:59Z",
            ]
        );

        let ranges = build_wrapping(2020, 2021, 9, 2).unwrap();
        assert_eq!(rendered(&ranges), vec!["2020-09-01T00:00:00Z/2021-02-28T23:59:59Z"]);
    }

    #[test]
    fn test_wrapping_window_needs_two_years() {
        assert!(matches!(build_wrapping(2020, 2020, 11, 1), Err(Error::InvalidRange(_))));
    }

    #[test]
    fn test_parse_round_trips_display() {
        let text = "2024-06-01T00:00:00Z/2024-07-31T23:59:59Z";
        let range: DateRange = text.parse().unwrap();
        assert_eq!(range.to_string(), text);
        assert!("2024-06-01T00:00:00Z".parse::<DateRange>().is_err());
        assert!("2024-07-01T00:00:00Z/2024-06-01T00:00:00Z".parse::<DateRange>().is_err());
    }
}
