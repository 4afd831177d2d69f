// =============================================================================
// Trading Calendar — weekday + holiday-list trading-day queries
// =============================================================================

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Weekday};
use tracing::info;

/// US-equity trading calendar backed by the reference holiday list.
/// Read-only after startup.
pub struct TradingCalendar {
    holidays: HashSet<NaiveDate>,
}

impl TradingCalendar {
    /// Load `reference/holidays.json` (a JSON array of `YYYY-MM-DD` strings)
    /// from under `data_dir`.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("reference").join("holidays.json");

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read holiday list from {}", path.display()))?;
        let dates: Vec<NaiveDate> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse holiday list from {}", path.display()))?;

        info!(path = %path.display(), holidays = dates.len(), "trading calendar loaded");
        Ok(Self::from_holidays(dates))
    }

    pub fn from_holidays(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: dates.into_iter().collect(),
        }
    }

    /// A date is a trading day when it is a weekday and not a listed holiday.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// The latest trading day strictly before `date`.
    pub fn previous_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date.pred_opt().expect("date within calendar range");
        while !self.is_trading_day(d) {
            d = d.pred_opt().expect("date within calendar range");
        }
        d
    }

    /// The latest trading day at or before `date`.
    pub fn most_recent_trading_day(&self, date: NaiveDate) -> NaiveDate {
        if self.is_trading_day(date) {
            date
        } else {
            self.previous_trading_day(date)
        }
    }

    /// The earliest trading day strictly after `date`.
    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date.succ_opt().expect("date within calendar range");
        while !self.is_trading_day(d) {
            d = d.succ_opt().expect("date within calendar range");
        }
        d
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn calendar() -> TradingCalendar {
        // July 4th 2024 fell on a Thursday.
        TradingCalendar::from_holidays([d(2024, 7, 4)])
    }

    #[test]
    fn weekends_are_not_trading_days() {
        let cal = calendar();
        assert!(cal.is_trading_day(d(2024, 7, 1))); // Monday
        assert!(!cal.is_trading_day(d(2024, 7, 6))); // Saturday
        assert!(!cal.is_trading_day(d(2024, 7, 7))); // Sunday
    }

    #[test]
    fn holidays_are_not_trading_days() {
        let cal = calendar();
        assert!(!cal.is_trading_day(d(2024, 7, 4)));
        assert!(cal.is_trading_day(d(2024, 7, 5)));
    }

    #[test]
    fn previous_trading_day_skips_holiday_and_weekend() {
        let cal = calendar();
        // Friday the 5th looks back over the holiday Thursday to Wednesday.
        assert_eq!(cal.previous_trading_day(d(2024, 7, 5)), d(2024, 7, 3));
        // Monday looks back over the weekend.
        assert_eq!(cal.previous_trading_day(d(2024, 7, 8)), d(2024, 7, 5));
    }

    #[test]
    fn most_recent_trading_day_is_identity_on_trading_days() {
        let cal = calendar();
        assert_eq!(cal.most_recent_trading_day(d(2024, 7, 5)), d(2024, 7, 5));
        assert_eq!(cal.most_recent_trading_day(d(2024, 7, 7)), d(2024, 7, 5));
    }

    #[test]
    fn next_trading_day_skips_holiday_and_weekend() {
        let cal = calendar();
        assert_eq!(cal.next_trading_day(d(2024, 7, 3)), d(2024, 7, 5));
        assert_eq!(cal.next_trading_day(d(2024, 7, 5)), d(2024, 7, 8));
    }
}
