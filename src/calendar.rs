//! Month-grid state machine behind the calendar pane.
//!
//! `CalendarGrid` owns the displayed month, the chosen date and the set of
//! starred short-keys. Every render recomputes a pure [`GridView`]; drawing it
//! to the terminal is the UI's job.

use crate::dates;
use crate::events::Subscribers;
use chrono::{Datelike, NaiveDate};
use std::collections::BTreeSet;
use tokio::sync::mpsc::UnboundedReceiver;

/// Independent facts about one grid cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellFlags {
    pub in_month: bool,
    pub today: bool,
    pub selected: bool,
    pub starred: bool,
}

/// Visual classification of a cell. Exactly one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellClass {
    OutOfMonth,
    Today,
    Selected,
    Starred,
    Plain,
}

/// Out-of-month dimming wins over everything, then today, then the chosen
/// date, then starred.
pub fn classify(flags: CellFlags) -> CellClass {
    if !flags.in_month {
        CellClass::OutOfMonth
    } else if flags.today {
        CellClass::Today
    } else if flags.selected {
        CellClass::Selected
    } else if flags.starred {
        CellClass::Starred
    } else {
        CellClass::Plain
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayCell {
    pub date: NaiveDate,
    pub key: String,
    pub label: String,
    pub class: CellClass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridView {
    pub title: String,
    pub reference: NaiveDate,
    pub cells: Vec<DayCell>,
}

impl GridView {
    pub fn weeks(&self) -> impl Iterator<Item = &[DayCell]> {
        self.cells.chunks(7)
    }

    pub fn cell_for(&self, date: NaiveDate) -> Option<&DayCell> {
        self.cells.iter().find(|c| c.date == date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaySelected {
    pub date: NaiveDate,
    /// Grid index of the clicked cell, when the selection came from a cell.
    pub cell: Option<usize>,
}

type Clock = Box<dyn Fn() -> NaiveDate + Send>;

pub struct CalendarGrid {
    displayed_month: NaiveDate,
    chosen_date: NaiveDate,
    starred: BTreeSet<String>,
    view: GridView,
    clock: Clock,
    subscribers: Subscribers<DaySelected>,
}

impl CalendarGrid {
    pub fn new(reference: NaiveDate) -> Self {
        Self::with_clock(reference, Box::new(dates::today))
    }

    /// Grid whose notion of "today" comes from `clock`, read on every render.
    pub fn with_clock(reference: NaiveDate, clock: Clock) -> Self {
        let view = build_view(reference, reference, &BTreeSet::new(), clock());
        CalendarGrid {
            displayed_month: reference,
            chosen_date: reference,
            starred: BTreeSet::new(),
            view,
            clock,
            subscribers: Subscribers::new(),
        }
    }

    pub fn displayed_month(&self) -> NaiveDate {
        self.displayed_month
    }

    pub fn chosen_date(&self) -> NaiveDate {
        self.chosen_date
    }

    pub fn view(&self) -> &GridView {
        &self.view
    }

    pub fn starred(&self) -> &BTreeSet<String> {
        &self.starred
    }

    pub fn is_starred(&self, key: &str) -> bool {
        self.starred.contains(key)
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<DaySelected> {
        self.subscribers.subscribe()
    }

    pub fn render(&mut self, reference: NaiveDate) {
        self.displayed_month = reference;
        self.view = build_view(reference, self.chosen_date, &self.starred, (self.clock)());
    }

    pub fn navigate(&mut self, delta_months: i64) {
        match dates::add_months(self.displayed_month, delta_months) {
            Some(month) => self.render(month),
            None => tracing::warn!(
                event = "calendar_navigate_out_of_range",
                delta_months,
                "month navigation left the supported date range"
            ),
        }
    }

    /// Jump back to the month containing today.
    pub fn reset_to_today(&mut self) {
        let today = (self.clock)();
        self.render(today);
    }

    pub fn select_day(&mut self, date: NaiveDate, cell: Option<usize>) {
        self.chosen_date = date;
        self.subscribers.publish(DaySelected { date, cell });
        self.render(date);
    }

    pub fn select_cell(&mut self, index: usize) -> Option<NaiveDate> {
        let date = self.view.cells.get(index)?.date;
        self.select_day(date, Some(index));
        Some(date)
    }

    /// Move the chosen date by `days`, following it into other months.
    pub fn move_chosen(&mut self, days: i64) {
        if let Some(date) = dates::add_days(self.chosen_date, days) {
            let cell = self.view.cells.iter().position(|c| c.date == date);
            self.select_day(date, cell);
        }
    }

    /// Adds keys to the starred set. Takes effect on the next render.
    pub fn mark_starred<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.starred.extend(keys);
    }

    /// Replaces the starred set. Takes effect on the next render.
    pub fn set_starred<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.starred = keys.into_iter().collect();
    }

    pub fn refresh(&mut self) {
        self.render(self.displayed_month);
    }
}

fn build_view(
    reference: NaiveDate,
    chosen: NaiveDate,
    starred: &BTreeSet<String>,
    today: NaiveDate,
) -> GridView {
    let grid = dates::month_grid(reference);
    let cells = grid
        .cells()
        .iter()
        .map(|&date| {
            let key = dates::short_key(date);
            let flags = CellFlags {
                in_month: grid.in_reference_month(date),
                today: date == today,
                selected: date == chosen,
                starred: starred.contains(&key),
            };
            DayCell {
                date,
                label: date.day().to_string(),
                class: classify(flags),
                key,
            }
        })
        .collect();
    GridView {
        title: format!("{} {}", dates::month_name(reference), reference.year()),
        reference,
        cells,
    }
}
