//! Pure calendar-date helpers.
//!
//! Every function here works on `NaiveDate` fields (year, month, day) taken
//! from the local calendar. Nothing converts through epoch milliseconds, so a
//! date never drifts across a UTC day boundary or a DST transition.

use chrono::{Datelike, Days, Local, Months, NaiveDate};

/// Number of cells in a month grid: six full Monday-first weeks.
pub const GRID_CELLS: usize = 42;

pub const WEEKDAY_HEADINGS: [&str; 7] = ["Mo", "Tu", "We", "Th", "Fr", "Sa", "Su"];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DateError {
    #[error("invalid date (use YYYY-MM-DD): {0}")]
    InvalidShortKey(String),
    #[error("date out of range: {0}")]
    OutOfRange(String),
}

/// Contiguous run of 42 days covering a whole month plus lead-in/lead-out days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthGrid {
    reference: NaiveDate,
    cells: Vec<NaiveDate>,
}

impl MonthGrid {
    pub fn reference(&self) -> NaiveDate {
        self.reference
    }

    pub fn cells(&self) -> &[NaiveDate] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn first(&self) -> Option<NaiveDate> {
        self.cells.first().copied()
    }

    pub fn last(&self) -> Option<NaiveDate> {
        self.cells.last().copied()
    }

    pub fn position(&self, date: NaiveDate) -> Option<usize> {
        self.cells.iter().position(|d| *d == date)
    }

    /// True when `date` falls in the reference month (not a lead-in/lead-out day).
    pub fn in_reference_month(&self, date: NaiveDate) -> bool {
        date.year() == self.reference.year() && date.month() == self.reference.month()
    }
}

/// Builds the grid for the month containing `reference`.
///
/// The first cell is the Monday on or before the 1st of that month.
pub fn month_grid(reference: NaiveDate) -> MonthGrid {
    let first = first_of_month(reference);
    // Sunday=0 indexing remapped so Monday leads the week.
    let offset = (first.weekday().num_days_from_sunday() + 6) % 7;
    let start = first
        .checked_sub_days(Days::new(u64::from(offset)))
        .unwrap_or(first);
    MonthGrid {
        reference,
        cells: start.iter_days().take(GRID_CELLS).collect(),
    }
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Builds a date from possibly out-of-range fields, rolling over the way a
/// calendar library does: month 13 is January of the next year, day 0 is the
/// last day of the previous month, day 32 of January is February 1st.
pub fn rollover(year: i32, month: i64, day: i64) -> Result<NaiveDate, DateError> {
    let out_of_range = || DateError::OutOfRange(format!("{year}/{month}/{day}"));
    let total_months = i64::from(year)
        .checked_mul(12)
        .and_then(|months| months.checked_add(month.checked_sub(1)?))
        .ok_or_else(out_of_range)?;
    let y = i32::try_from(total_months.div_euclid(12)).map_err(|_| out_of_range())?;
    let m = (total_months.rem_euclid(12) + 1) as u32;
    let first = NaiveDate::from_ymd_opt(y, m, 1).ok_or_else(out_of_range)?;
    let shift = day.checked_sub(1).ok_or_else(out_of_range)?;
    let shifted = if shift >= 0 {
        first.checked_add_days(Days::new(shift as u64))
    } else {
        first.checked_sub_days(Days::new(shift.unsigned_abs()))
    };
    shifted.ok_or_else(out_of_range)
}

/// Copy of `date` with any of its fields replaced, normalized by rollover.
pub fn with_fields(
    date: NaiveDate,
    year: Option<i32>,
    month: Option<i64>,
    day: Option<i64>,
) -> Result<NaiveDate, DateError> {
    rollover(
        year.unwrap_or(date.year()),
        month.unwrap_or(i64::from(date.month())),
        day.unwrap_or(i64::from(date.day())),
    )
}

pub fn add_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    if days >= 0 {
        date.checked_add_days(Days::new(days as u64))
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs()))
    }
}

/// Month arithmetic that clamps to the last day of the target month
/// (January 31st plus one month is the last day of February).
pub fn add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let magnitude = u32::try_from(months.unsigned_abs()).ok()?;
    if months >= 0 {
        date.checked_add_months(Months::new(magnitude))
    } else {
        date.checked_sub_months(Months::new(magnitude))
    }
}

/// `YYYY-MM-DD` built from the calendar fields.
pub fn short_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), date.month(), date.day())
}

pub fn parse_short_key(key: &str) -> Result<NaiveDate, DateError> {
    NaiveDate::parse_from_str(key.trim(), "%Y-%m-%d")
        .map_err(|_| DateError::InvalidShortKey(key.to_string()))
}

pub fn ordinal_suffix(day: u32) -> &'static str {
    match (day % 10, day % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    }
}

/// "3rd", "22nd", "11th".
pub fn ordinal_label(date: NaiveDate) -> String {
    format!("{}{}", date.day(), ordinal_suffix(date.day()))
}

pub fn month_name(date: NaiveDate) -> String {
    date.format("%B").to_string()
}

pub fn day_name(date: NaiveDate) -> String {
    date.format("%A").to_string()
}

pub fn year(date: NaiveDate) -> i32 {
    date.year()
}

/// "Monday 3rd July 2025".
pub fn pretty_label(date: NaiveDate) -> String {
    format!(
        "{} {} {} {}",
        day_name(date),
        ordinal_label(date),
        month_name(date),
        date.year()
    )
}

pub fn same_day(a: NaiveDate, b: NaiveDate) -> bool {
    a == b
}

/// Current local calendar date, read at call time.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn is_today(date: NaiveDate) -> bool {
    same_day(date, today())
}
