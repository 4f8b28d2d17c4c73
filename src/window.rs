use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{AnalysisError, AnalysisResult};
use crate::models::Window;

/// Largest DST gap searched when local midnight does not exist.
const MAX_GAP_MINUTES: i64 = 180;
const GAP_STEP_MINUTES: i64 = 15;

pub fn parse_timezone(timezone_id: &str) -> AnalysisResult<Tz> {
    timezone_id
        .trim()
        .parse::<Tz>()
        .map_err(|_| AnalysisError::configuration(format!("unknown timezone '{timezone_id}'")))
}

/// Returns `explicit` unchanged, otherwise the previous full Sunday-to-Sunday
/// week in `timezone_id`, as of now.
pub fn resolve(explicit: Option<Window>, timezone_id: &str) -> AnalysisResult<Window> {
    resolve_at(explicit, timezone_id, Utc::now())
}

pub fn resolve_at(
    explicit: Option<Window>,
    timezone_id: &str,
    now_utc: DateTime<Utc>,
) -> AnalysisResult<Window> {
    match explicit {
        Some(window) => Ok(window),
        None => previous_week(parse_timezone(timezone_id)?, now_utc),
    }
}

pub fn previous_week(tz: Tz, now_utc: DateTime<Utc>) -> AnalysisResult<Window> {
    let today = now_utc.with_timezone(&tz).date_naive();
    let days_since_sunday = i64::from(today.weekday().num_days_from_sunday());
    let this_sunday = today - Duration::days(days_since_sunday);
    let previous_sunday = this_sunday - Duration::days(7);

    // Each boundary converts on its own so a DST shift inside the week is honoured.
    let start = local_midnight_utc(tz, previous_sunday)?;
    let end = local_midnight_utc(tz, this_sunday)?;
    Window::new(start, end)
}

/// Instant at which `date` begins in `tz`. Ambiguous midnights take the earlier
/// instant; skipped midnights take the first local time that exists.
fn local_midnight_utc(tz: Tz, date: NaiveDate) -> AnalysisResult<DateTime<Utc>> {
    let midnight = date.and_time(NaiveTime::MIN);
    let mut offset = 0;
    while offset <= MAX_GAP_MINUTES {
        match tz.from_local_datetime(&(midnight + Duration::minutes(offset))) {
            LocalResult::Single(instant) => return Ok(instant.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Ok(earliest.with_timezone(&Utc)),
            LocalResult::None => offset += GAP_STEP_MINUTES,
        }
    }
    Err(AnalysisError::configuration(format!(
        "no valid local start of day for {date} in {}",
        tz.name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn explicit_window_is_returned_unchanged() {
        let explicit = Window::new(utc(2023, 5, 2, 13), utc(2023, 5, 4, 1)).unwrap();
        let resolved = resolve_at(Some(explicit), "America/Bogota", utc(2024, 1, 17, 12)).unwrap();
        assert_eq!(resolved, explicit);
    }

    #[test]
    fn explicit_window_ignores_the_timezone() {
        let explicit = Window::new(utc(2023, 5, 2, 13), utc(2023, 5, 4, 1)).unwrap();
        let resolved = resolve_at(Some(explicit), "Mars/Olympus_Mons", utc(2024, 1, 17, 12));
        assert_eq!(resolved.unwrap(), explicit);
    }

    #[test]
    fn midweek_resolves_previous_sunday_to_sunday() {
        let window = resolve_at(None, "America/Bogota", utc(2024, 1, 17, 12)).unwrap();
        assert_eq!(window.start(), utc(2024, 1, 7, 5));
        assert_eq!(window.end(), utc(2024, 1, 14, 5));
    }

    #[test]
    fn sunday_uses_local_date_not_utc_date() {
        // Sunday 01:00 in Bogota: the week that just ended is returned.
        let window = resolve_at(None, "America/Bogota", utc(2024, 1, 14, 6)).unwrap();
        assert_eq!(window.start(), utc(2024, 1, 7, 5));
        assert_eq!(window.end(), utc(2024, 1, 14, 5));

        // Saturday 23:00 in Bogota, already Sunday in UTC.
        let window = resolve_at(None, "America/Bogota", utc(2024, 1, 14, 4)).unwrap();
        assert_eq!(window.start(), utc(2023, 12, 31, 5));
        assert_eq!(window.end(), utc(2024, 1, 7, 5));
    }

    #[test]
    fn spring_forward_week_is_one_hour_short() {
        let window = resolve_at(None, "America/New_York", utc(2024, 3, 20, 12)).unwrap();
        assert_eq!(window.start(), utc(2024, 3, 10, 5));
        assert_eq!(window.end(), utc(2024, 3, 17, 4));
        assert_eq!(window.end() - window.start(), Duration::hours(167));
    }

    #[test]
    fn fall_back_week_is_one_hour_long() {
        let window = resolve_at(None, "America/New_York", utc(2024, 11, 13, 12)).unwrap();
        assert_eq!(window.start(), utc(2024, 11, 3, 4));
        assert_eq!(window.end(), utc(2024, 11, 10, 5));
        assert_eq!(window.end() - window.start(), Duration::hours(169));
    }

    #[test]
    fn skipped_midnight_moves_to_first_valid_instant() {
        // Chile jumps from Saturday 24:00 to Sunday 01:00.
        let window = resolve_at(None, "America/Santiago", utc(2024, 9, 11, 12)).unwrap();
        assert_eq!(window.start(), utc(2024, 9, 1, 4));
        assert_eq!(window.end(), utc(2024, 9, 8, 4));
    }

    #[test]
    fn unknown_timezone_is_a_configuration_error() {
        let err = resolve_at(None, "Mars/Olympus_Mons", utc(2024, 1, 17, 12)).unwrap_err();
        assert!(matches!(err, AnalysisError::Configuration(_)));
    }
}
