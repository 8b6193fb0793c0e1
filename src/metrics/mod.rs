//! Session statistics.

mod calculator;

pub use calculator::{SessionSummary, SummaryCalculator};
