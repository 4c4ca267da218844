use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use pharmcall_core::config::{CallingConfig, DEFAULT_CLOSE_HOUR, DEFAULT_OPEN_HOUR};

use crate::error::{Result, SchedulerError};

/// Weekday business hours during which pharmacies may be called.
///
/// Hours are interpreted in `tz`, so daylight-saving shifts move the UTC
/// opening time rather than the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallingWindow {
    tz: Tz,
    open_hour: u32,
    /// Exclusive: 19 means the last callable minute is 18:59.
    close_hour: u32,
}

impl Default for CallingWindow {
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::New_York,
            open_hour: DEFAULT_OPEN_HOUR,
            close_hour: DEFAULT_CLOSE_HOUR,
        }
    }
}

impl CallingWindow {
    pub fn new(tz: &str, open_hour: u32, close_hour: u32) -> Result<Self> {
        let tz = tz
            .parse::<Tz>()
            .map_err(|_| SchedulerError::InvalidTimezone(tz.to_string()))?;
        if open_hour >= close_hour || close_hour > 24 {
            return Err(SchedulerError::InvalidWindow(format!(
                "{open_hour}..{close_hour} is empty or out of range"
            )));
        }
        Ok(Self {
            tz,
            open_hour,
            close_hour,
        })
    }

    pub fn from_config(cfg: &CallingConfig) -> Result<Self> {
        Self::new(&cfg.timezone, cfg.open_hour, cfg.close_hour)
    }

    /// Monday–Friday, `open_hour <= local hour < close_hour`.
    pub fn is_within(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        is_weekday(local.weekday())
            && local.hour() >= self.open_hour
            && local.hour() < self.close_hour
    }

    /// Start of the next window strictly after the current one. Today counts
    /// only if it is a weekday and the window has not opened yet.
    pub fn next_opening(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let local = now.with_timezone(&self.tz);
        let mut day = local.date_naive();
        if !(is_weekday(day.weekday()) && local.hour() < self.open_hour) {
            day = next_day(day);
            while !is_weekday(day.weekday()) {
                day = next_day(day);
            }
        }
        self.opening_on(day)
    }

    /// Whole seconds until calling is allowed, rounded up; 0 inside the window.
    ///
    /// For whole-second `now` the result lands exactly on the opening.
    pub fn delay_until_next_window(&self, now: DateTime<Utc>) -> Result<u64> {
        if self.is_within(now) {
            return Ok(0);
        }
        let ms = (self.next_opening(now)? - now).num_milliseconds().max(0) as u64;
        Ok(ms.div_ceil(1000))
    }

    fn opening_on(&self, day: NaiveDate) -> Result<DateTime<Utc>> {
        let unresolvable = || {
            SchedulerError::InvalidWindow(format!(
                "no local {:02}:00 on {day} in {}",
                self.open_hour, self.tz
            ))
        };
        let naive = day.and_hms_opt(self.open_hour, 0, 0).ok_or_else(unresolvable)?;
        // Spring-forward gap: the local hour does not exist, use the next one.
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.tz
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest()
            })
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(unresolvable)
    }
}

fn is_weekday(day: Weekday) -> bool {
    !matches!(day, Weekday::Sat | Weekday::Sun)
}

fn next_day(day: NaiveDate) -> NaiveDate {
    day.succ_opt().unwrap_or(day)
}
