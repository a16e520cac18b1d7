//! Calendar arithmetic shared by both schedulers.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone};

/// Number of days in a month, leap-aware.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = next_month(year, month);
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// The month after `(year, month)`, rolling December into January.
pub fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Last day of the month on which purchases may still run: the configured
/// `max_day`, or the day before the calendar month ends.
pub fn month_end_day(max_day: Option<u32>, year: i32, month: u32) -> u32 {
    max_day.unwrap_or_else(|| days_in_month(year, month) - 1)
}

/// Local midnight on `day` of the given month. `None` only for dates that do
/// not exist (or fall inside a DST gap with no earliest mapping).
pub fn local_midnight(year: i32, month: u32, day: u32) -> Option<DateTime<Local>> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
}

/// Seconds from `now` until midnight on the last schedulable day of the
/// current month; zero once that point has passed.
pub fn remaining_secs_in_month(now: DateTime<Local>, max_day: Option<u32>) -> u64 {
    let end_day = month_end_day(max_day, now.year(), now.month());
    match local_midnight(now.year(), now.month(), end_day) {
        Some(end) => (end - now).num_seconds().max(0) as u64,
        None => 0,
    }
}

/// Local time for a Unix timestamp.
pub fn local_from_unix(unix_time: i64) -> DateTime<Local> {
    DateTime::<Local>::from(std::time::SystemTime::UNIX_EPOCH) + Duration::seconds(unix_time)
}

/// `now + offset_secs` formatted for schedule announcements.
pub fn formatted_offset(now: DateTime<Local>, offset_secs: u64) -> String {
    (now + Duration::seconds(offset_secs as i64))
        .format("%Y-%m-%d %I:%M%p")
        .to_string()
}
