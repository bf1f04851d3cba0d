//! Calendar day notes: a month-grid date picker paired with per-day notes,
//! kept in a per-user document store with a local cache.

pub mod app;
pub mod auth;
pub mod calendar;
pub mod commands;
pub mod config;
pub mod dates;
pub mod events;
pub mod logging;
pub mod notes;
pub mod prefs;
pub mod store;
pub mod sync;
pub mod ui;
