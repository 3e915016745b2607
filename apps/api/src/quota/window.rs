//! Reset-boundary arithmetic for rolling and calendar windows.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use crate::quota::policy::WindowKind;
use crate::quota::store::QuotaCounter;

/// A missing counter is always expired so the first action starts a window.
pub fn is_expired(counter: Option<&QuotaCounter>, window: WindowKind, now: DateTime<Utc>) -> bool {
    let Some(counter) = counter else {
        return true;
    };
    match window {
        WindowKind::Rolling(duration) => now - counter.window_start >= duration,
        WindowKind::CalendarMonth => {
            (now.year(), now.month())
                != (counter.window_start.year(), counter.window_start.month())
        }
    }
}

/// Where the window that `now` falls in begins. An expired window is renewed
/// at `now`, never at a multiple of the duration.
pub fn current_window_start(
    counter: Option<&QuotaCounter>,
    window: WindowKind,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match counter {
        Some(c) if !is_expired(Some(c), window, now) => c.window_start,
        _ => now,
    }
}

/// The instant the window beginning at `window_start` stops counting.
pub fn window_end(window_start: DateTime<Utc>, window: WindowKind) -> DateTime<Utc> {
    match window {
        WindowKind::Rolling(duration) => window_start + duration,
        WindowKind::CalendarMonth => next_month_start(window_start),
    }
}

/// Time until a denied subject may try again.
pub fn retry_after(window_start: DateTime<Utc>, window: WindowKind, now: DateTime<Utc>) -> Duration {
    let wait = match window {
        WindowKind::Rolling(duration) => (duration - (now - window_start)).min(duration),
        WindowKind::CalendarMonth => next_month_start(now) - now,
    };
    wait.max(Duration::zero())
}

/// How long the store should keep a record for a window starting at `now`.
pub fn retention(window: WindowKind, now: DateTime<Utc>) -> Duration {
    window_end(now, window) - now
}

/// Midnight UTC on the first day of the month after `at`.
pub fn next_month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|| at + Duration::days(31))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn counter(count: u64, window_start: DateTime<Utc>) -> QuotaCounter {
        QuotaCounter {
            count,
            window_start,
        }
    }

    #[test]
    fn test_missing_counter_is_expired() {
        let now = at(2024, 3, 10, 12);
        assert!(is_expired(None, WindowKind::CalendarMonth, now));
        assert!(is_expired(None, WindowKind::Rolling(Duration::hours(1)), now));
        assert_eq!(
            current_window_start(None, WindowKind::CalendarMonth, now),
            now
        );
    }

    #[test]
    fn test_rolling_expires_at_exact_duration() {
        let start = at(2024, 3, 10, 0);
        let c = counter(3, start);
        let window = WindowKind::Rolling(Duration::hours(24));
        assert!(!is_expired(Some(&c), window, start + Duration::hours(24) - Duration::milliseconds(1)));
        assert!(is_expired(Some(&c), window, start + Duration::hours(24)));
    }

    #[test]
    fn test_rolling_renews_at_now() {
        let start = at(2024, 3, 10, 0);
        let c = counter(3, start);
        let window = WindowKind::Rolling(Duration::hours(1));
        let later = start + Duration::minutes(150);
        assert_eq!(current_window_start(Some(&c), window, later), later);
        let inside = start + Duration::minutes(30);
        assert_eq!(current_window_start(Some(&c), window, inside), start);
    }

    #[test]
    fn test_calendar_month_change_expires_regardless_of_elapsed() {
        let c = counter(10, at(2024, 3, 31, 23));
        assert!(is_expired(Some(&c), WindowKind::CalendarMonth, at(2024, 4, 1, 0)));
    }

    #[test]
    fn test_calendar_same_month_not_expired() {
        let c = counter(10, at(2024, 3, 1, 0));
        assert!(!is_expired(Some(&c), WindowKind::CalendarMonth, at(2024, 3, 31, 23)));
    }

    #[test]
    fn test_calendar_same_month_next_year_expires() {
        let c = counter(1, at(2023, 3, 15, 0));
        assert!(is_expired(Some(&c), WindowKind::CalendarMonth, at(2024, 3, 15, 0)));
    }

    #[test]
    fn test_next_month_start_wraps_year() {
        assert_eq!(next_month_start(at(2024, 12, 31, 23)), at(2025, 1, 1, 0));
        assert_eq!(next_month_start(at(2024, 2, 29, 5)), at(2024, 3, 1, 0));
    }

    #[test]
    fn test_rolling_retry_after() {
        let start = at(2024, 3, 10, 0);
        let window = WindowKind::Rolling(Duration::hours(24));
        let wait = retry_after(start, window, start + Duration::hours(6));
        assert_eq!(wait, Duration::hours(18));
    }

    #[test]
    fn test_retry_after_never_exceeds_window_on_clock_skew() {
        let start = at(2024, 3, 10, 0);
        let window = WindowKind::Rolling(Duration::hours(1));
        let wait = retry_after(start, window, start - Duration::minutes(10));
        assert_eq!(wait, Duration::hours(1));
    }

    #[test]
    fn test_calendar_retry_after_until_first_of_month() {
        let now = at(2024, 3, 31, 22);
        let wait = retry_after(at(2024, 3, 2, 0), WindowKind::CalendarMonth, now);
        assert_eq!(wait, Duration::hours(2));
    }

    #[test]
    fn test_retention() {
        let now = at(2024, 3, 31, 0);
        assert_eq!(retention(WindowKind::CalendarMonth, now), Duration::days(1));
        assert_eq!(
            retention(WindowKind::Rolling(Duration::minutes(15)), now),
            Duration::minutes(15)
        );
    }
}
