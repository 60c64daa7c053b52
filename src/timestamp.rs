use jiff::civil::Date;
use jiff::tz::TimeZone;
use jiff::{Span, Timestamp};
use serde::{Deserialize, Deserializer, Serializer};
use snafu::{ResultExt, Snafu};
use std::fmt::Display;
use std::str::FromStr;

/// Serde helpers for jiff values stored as their ISO 8601 string form.
pub(crate) mod required {
    use super::*;

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        // owned, not every deserializer can lend a &str
        let string = String::deserialize(deserializer)?;
        T::from_str(&string).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Snafu)]
/// Error while doing calendar arithmetic
pub enum DateError {
    #[snafu(display("Failed to add {days} days to {date}"))]
    Overflow {
        date: Date,
        days: i64,
        source: jiff::Error,
    },
}

/// Calendar date (UTC) of a timestamp.
pub(crate) fn utc_date(timestamp: Timestamp) -> Date {
    timestamp.to_zoned(TimeZone::UTC).date()
}

/// Current calendar date in UTC.
pub fn today() -> Date {
    utc_date(Timestamp::now())
}

pub(crate) fn add_days(date: Date, days: i64) -> Result<Date, DateError> {
    let span = Span::new()
        .try_days(days)
        .context(OverflowSnafu { date, days })?;
    date.checked_add(span).context(OverflowSnafu { date, days })
}
