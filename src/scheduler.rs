// =============================================================================
// Day-Switch Scheduler — daily 03:50 ET model rotation
// =============================================================================
//
// One firing per day at 03:50 Eastern wall clock. On trading days the
// scheduler computes the new today-cutoff (new date 16:00 in the shifted
// frame), switches the Live Model, rotates its own date fields, and deletes
// the retired date's backfill cache directory. Non-trading days skip so the
// "next" bucket keeps accumulating weekend/holiday post-market activity.
//
// The scheduler is single-threaded with respect to itself; the date fields
// are read-locked by the backfill pool.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::America::New_York;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::backfill::BackfillCache;
use crate::calendar::TradingCalendar;
use crate::live_model::LiveModel;
use crate::timeframe;

/// The trading dates the rest of the system keys off: `current` is the
/// backfill target date and the date whose 16:00 is the model cutoff;
/// `previous` bounds the backfill window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingDates {
    pub current: NaiveDate,
    pub previous: NaiveDate,
}

pub type SharedDates = Arc<RwLock<TradingDates>>;

/// Daily switch instant, Eastern wall clock.
fn switch_time() -> NaiveTime {
    NaiveTime::from_hms_opt(3, 50, 0).expect("valid wall-clock time")
}

/// Derive the trading dates at startup. Before 03:50 ET the switch has not
/// happened yet, so the current trading date is the most recent trading day
/// strictly before today; from 03:50 onward today itself counts when it is
/// a trading day.
pub fn initial_dates(now_wall_et: NaiveDateTime, calendar: &TradingCalendar) -> TradingDates {
    let today = now_wall_et.date();
    let current = if now_wall_et.time() >= switch_time() {
        calendar.most_recent_trading_day(today)
    } else {
        let yesterday = today.pred_opt().expect("date within calendar range");
        calendar.most_recent_trading_day(yesterday)
    };
    let previous = calendar.previous_trading_day(current);
    TradingDates { current, previous }
}

/// Time until the next 03:50 ET firing, DST-aware.
fn sleep_until_next_switch(now_wall_et: NaiveDateTime) -> Duration {
    let target_date = if now_wall_et.time() < switch_time() {
        now_wall_et.date()
    } else {
        now_wall_et.date().succ_opt().expect("date within calendar range")
    };
    let target = target_date.and_time(switch_time());

    // 03:50 sits outside both the DST gap and the ambiguous hour, so the
    // local->UTC conversion is always single-valued.
    let now_utc = New_York
        .from_local_datetime(&now_wall_et)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_default();
    let target_utc = New_York
        .from_local_datetime(&target)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_default();

    Duration::from_millis(target_utc.saturating_sub(now_utc).max(0) as u64)
}

/// Run the scheduler loop until shutdown.
pub async fn run_scheduler(
    model: Arc<LiveModel>,
    cache: Arc<BackfillCache>,
    calendar: Arc<TradingCalendar>,
    dates: SharedDates,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let sleep = sleep_until_next_switch(timeframe::now_et().naive_local());
        info!(in_secs = sleep.as_secs(), "next day-switch check scheduled");

        tokio::select! {
            _ = shutdown.recv() => {
                info!("scheduler stopping on shutdown");
                return;
            }
            _ = tokio::time::sleep(sleep) => {}
        }

        let today = timeframe::now_et().date_naive();
        if !calendar.is_trading_day(today) {
            info!(date = %today, "not a trading day; day switch skipped");
            continue;
        }

        let new_cutoff = timeframe::today_cutoff_ms(today);
        model.switch_day(new_cutoff);

        let retired = {
            let mut d = dates.write();
            let retired = d.current;
            d.previous = d.current;
            d.current = today;
            retired
        };

        info!(
            new_date = %today,
            retired_date = %retired,
            cutoff = new_cutoff,
            "day switched"
        );

        if let Err(e) = cache.remove_date(retired) {
            warn!(date = %retired, error = %e, "failed to remove retired cache directory");
        }
    }
}
