// =============================================================================
// ET-Shifted Millisecond Frame — time & session utilities
// =============================================================================
//
// Every timestamp held in memory is "ET-shifted": UTC milliseconds plus the
// America/New_York UTC offset in effect *at that instant*. Reading a shifted
// value as if it were UTC yields Eastern wall-clock time, which turns every
// session comparison in the system into a plain i64 compare.
//
// Converting back to UTC is the explicit job of any component that crosses
// the process boundary (REST range queries). Crossing twice is the classic
// bug here; keep all conversions in this module.
// =============================================================================

use chrono::{DateTime, Duration, LocalResult, NaiveDate, Offset, TimeZone, Utc};
use chrono_tz::America::New_York;

/// Shift a real UTC instant into the ET-shifted millisecond frame.
///
/// The offset applied is the one valid at `utc` itself, so instants on either
/// side of a DST transition shift by different amounts.
pub fn shifted_ms_from_utc(utc: DateTime<Utc>) -> i64 {
    let offset_secs = utc
        .with_timezone(&New_York)
        .offset()
        .fix()
        .local_minus_utc() as i64;
    utc.timestamp_millis() + offset_secs * 1000
}

/// Inverse of [`shifted_ms_from_utc`]: recover the real UTC instant for a
/// shifted value. Ambiguous wall-clock times (the repeated fall-back hour)
/// resolve to the earlier offset.
pub fn utc_from_shifted_ms(ms: i64) -> DateTime<Utc> {
    let naive = DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default();

    match New_York.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // The spring-forward gap never occurs in the shifted frame; a value
        // landing there is malformed input, mapped through the next hour.
        LocalResult::None => New_York
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc) - Duration::hours(1))
            .unwrap_or_default(),
    }
}

/// Current instant in the shifted frame.
pub fn now_shifted_ms() -> i64 {
    shifted_ms_from_utc(Utc::now())
}

/// Current Eastern wall-clock time (real timezone-aware value, for the
/// scheduler's wall-clock arithmetic).
pub fn now_et() -> DateTime<chrono_tz::Tz> {
    Utc::now().with_timezone(&New_York)
}

/// Calendar date a shifted timestamp falls on (Eastern wall-clock date).
pub fn shifted_date(ms: i64) -> NaiveDate {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Session cutoffs
// ---------------------------------------------------------------------------
//
// All cutoffs are expressed directly in the shifted frame: "date D at
// HH:MM Eastern" is simply D HH:MM read as UTC.

fn shifted_wall_ms(date: NaiveDate, hour: u32, minute: u32) -> i64 {
    date.and_hms_opt(hour, minute, 0)
        .expect("valid wall-clock time")
        .and_utc()
        .timestamp_millis()
}

/// Pre-market start: D 04:00 ET.
pub fn pre_market_start_ms(date: NaiveDate) -> i64 {
    shifted_wall_ms(date, 4, 0)
}

/// Regular-session open: D 09:30 ET.
pub fn regular_open_ms(date: NaiveDate) -> i64 {
    shifted_wall_ms(date, 9, 30)
}

/// Regular-session close, which doubles as the today/next cutoff: D 16:00 ET.
pub fn today_cutoff_ms(date: NaiveDate) -> i64 {
    shifted_wall_ms(date, 16, 0)
}

/// Post-market end: D 20:00 ET.
pub fn post_market_end_ms(date: NaiveDate) -> i64 {
    shifted_wall_ms(date, 20, 0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn winter_shift_is_minus_five_hours() {
        // 2024-01-15 17:00 UTC is 12:00 EST.
        let t = utc(2024, 1, 15, 17, 0, 0);
        let shifted = shifted_ms_from_utc(t);
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        assert_eq!(shifted, expected);
    }

    #[test]
    fn summer_shift_is_minus_four_hours() {
        // 2024-07-15 16:00 UTC is 12:00 EDT.
        let t = utc(2024, 7, 15, 16, 0, 0);
        let shifted = shifted_ms_from_utc(t);
        let expected = NaiveDate::from_ymd_opt(2024, 7, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        assert_eq!(shifted, expected);
    }

    #[test]
    fn offset_taken_at_the_instant_not_now() {
        // One minute before the 2024 spring-forward (2024-03-10 07:00 UTC)
        // the offset is -5h; one minute after it is -4h.
        let before = utc(2024, 3, 10, 6, 59, 0);
        let after = utc(2024, 3, 10, 7, 1, 0);

        let shifted_before = shifted_ms_from_utc(before);
        let shifted_after = shifted_ms_from_utc(after);

        assert_eq!(shifted_before - before.timestamp_millis(), -5 * 3_600_000);
        assert_eq!(shifted_after - after.timestamp_millis(), -4 * 3_600_000);
    }

    #[test]
    fn utc_round_trip() {
        for t in [
            utc(2024, 1, 15, 17, 0, 0),
            utc(2024, 7, 15, 16, 0, 0),
            utc(2024, 3, 10, 6, 59, 59),
            utc(2024, 11, 3, 9, 30, 0),
        ] {
            let shifted = shifted_ms_from_utc(t);
            assert_eq!(utc_from_shifted_ms(shifted), t, "round trip for {t}");
        }
    }

    #[test]
    fn ambiguous_fall_back_hour_resolves_to_earlier_offset() {
        // 2024-11-03 01:30 Eastern occurs twice; the earlier occurrence is
        // still EDT (05:30 UTC).
        let shifted = NaiveDate::from_ymd_opt(2024, 11, 3)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        assert_eq!(utc_from_shifted_ms(shifted), utc(2024, 11, 3, 5, 30, 0));
    }

    #[test]
    fn session_cutoffs_are_ordered() {
        let d = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let pre = pre_market_start_ms(d);
        let open = regular_open_ms(d);
        let close = today_cutoff_ms(d);
        let post = post_market_end_ms(d);

        assert!(pre < open && open < close && close < post);
        assert_eq!(open - pre, 5 * 3_600_000 + 30 * 60_000);
        assert_eq!(close - open, 6 * 3_600_000 + 30 * 60_000);
        assert_eq!(post - close, 4 * 3_600_000);
    }

    #[test]
    fn shifted_date_reads_eastern_wall_clock() {
        // 2024-01-16 01:00 UTC is still 2024-01-15 20:00 Eastern.
        let shifted = shifted_ms_from_utc(utc(2024, 1, 16, 1, 0, 0));
        assert_eq!(
            shifted_date(shifted),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
    }
}
