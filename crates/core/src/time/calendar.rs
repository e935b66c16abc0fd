use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;
use crate::domain::Market;

// Upper bound for any day-by-day calendar walk. A valid mask has at least one trading weekday, so
// only an absurd holiday list can exhaust this.
const MAX_CALENDAR_SCAN_DAYS: i64 = 31;

const ALL_WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

const BUILTIN_HOLIDAY_YEARS: std::ops::RangeInclusive<i32> = 2024..=2030;

/// Set of weekdays, parsed from `mon-fri`, `tue-sat`, `mon,wed,fri` or `*`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeekdayMask(u8);

impl WeekdayMask {
    pub const WEEKDAYS: WeekdayMask = WeekdayMask(0b0001_1111);

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    fn from_days(days: impl IntoIterator<Item = Weekday>) -> Self {
        WeekdayMask(
            days.into_iter()
                .fold(0u8, |acc, d| acc | (1 << d.num_days_from_monday())),
        )
    }
}

impl fmt::Debug for WeekdayMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeekdayMask({self})")
    }
}

impl fmt::Display for WeekdayMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days: Vec<String> = ALL_WEEKDAYS
            .iter()
            .filter(|d| self.contains(**d))
            .map(|d| d.to_string().to_ascii_lowercase())
            .collect();
        f.write_str(&days.join(","))
    }
}

impl FromStr for WeekdayMask {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidWeekdayMask(s.to_string());
        let t = s.trim();
        if t == "*" {
            return Ok(WeekdayMask::from_days(ALL_WEEKDAYS));
        }

        let mut days = Vec::new();
        for part in t.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(invalid());
            }
            match part.split_once('-') {
                Some((from, to)) => {
                    let from = from.trim().parse::<Weekday>().map_err(|_| invalid())?;
                    let to = to.trim().parse::<Weekday>().map_err(|_| invalid())?;
                    let mut d = from;
                    loop {
                        days.push(d);
                        if d == to {
                            break;
                        }
                        d = d.succ();
                    }
                }
                None => days.push(part.parse::<Weekday>().map_err(|_| invalid())?),
            }
        }

        let mask = WeekdayMask::from_days(days);
        if mask.0 == 0 {
            return Err(invalid());
        }
        Ok(mask)
    }
}

/// Per-market trading calendar: which days trade, in which timezone, and when the daily run fires.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    pub market: Market,
    pub timezone: Tz,
    pub trading_weekdays: WeekdayMask,
    /// Local time of the daily pipeline run.
    pub scheduled_time: NaiveTime,
    /// Local time after which today's session counts as closed.
    pub close_time: NaiveTime,
    pub holidays: BTreeSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn default_for(market: Market) -> Self {
        let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();
        let (timezone, scheduled_time, close_time) = match market {
            Market::AShare => (chrono_tz::Asia::Shanghai, hm(15, 5), hm(15, 0)),
            Market::Us => (chrono_tz::America::New_York, hm(16, 30), hm(16, 0)),
            Market::Hk => (chrono_tz::Asia::Hong_Kong, hm(16, 10), hm(16, 0)),
        };

        Self {
            market,
            timezone,
            trading_weekdays: WeekdayMask::WEEKDAYS,
            scheduled_time,
            close_time,
            holidays: builtin_holidays(market),
        }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.trading_weekdays.contains(date.weekday()) && !self.holidays.contains(&date)
    }

    /// The closest trading day strictly before `date`, by calendar rules alone.
    pub fn previous_trading_day(&self, date: NaiveDate) -> Option<NaiveDate> {
        (1..=MAX_CALENDAR_SCAN_DAYS)
            .map(|i| date - Duration::days(i))
            .find(|d| self.is_trading_day(*d))
    }

    /// The most recent session that has closed as of `now_utc`.
    pub fn latest_session(&self, now_utc: DateTime<Utc>) -> Option<NaiveDate> {
        let local = now_utc.with_timezone(&self.timezone);
        let mut date = local.date_naive();
        if local.time() < self.close_time {
            date -= Duration::days(1);
        }
        (0..=MAX_CALENDAR_SCAN_DAYS)
            .map(|i| date - Duration::days(i))
            .find(|d| self.is_trading_day(*d))
    }

    /// Today's local date while that day's session has not closed yet. Data read from a live
    /// source in this window belongs to the unfinished session, not to `latest_session`.
    pub fn open_session(&self, now_utc: DateTime<Utc>) -> Option<NaiveDate> {
        let local = now_utc.with_timezone(&self.timezone);
        let today = local.date_naive();
        (self.is_trading_day(today) && local.time() < self.close_time).then_some(today)
    }

    /// Next firing instant strictly after `now_utc`: `scheduled_time` local, on a trading day.
    pub fn next_trigger_after(&self, now_utc: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now_utc.with_timezone(&self.timezone).date_naive();
        (0..=MAX_CALENDAR_SCAN_DAYS)
            .map(|i| today + Duration::days(i))
            .filter(|d| self.is_trading_day(*d))
            .filter_map(|d| {
                // A scheduled time that falls in a DST gap has no local instant that day.
                self.timezone
                    .from_local_datetime(&d.and_time(self.scheduled_time))
                    .earliest()
            })
            .map(|dt| dt.with_timezone(&Utc))
            .find(|dt| *dt > now_utc)
    }
}

/// Parses a `HH:MM` schedule time.
pub fn parse_schedule_time(s: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| ConfigError::InvalidScheduleTime(s.to_string()))
}

pub fn parse_timezone(s: &str) -> Result<Tz, ConfigError> {
    s.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::InvalidTimezone(s.to_string()))
}

pub fn parse_holidays(s: &str) -> Result<BTreeSet<NaiveDate>, ConfigError> {
    let mut out = BTreeSet::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let d = NaiveDate::parse_from_str(part, "%Y-%m-%d")
            .map_err(|_| ConfigError::InvalidHoliday(part.to_string()))?;
        out.insert(d);
    }
    Ok(out)
}

fn builtin_holidays(market: Market) -> BTreeSet<NaiveDate> {
    // Fixed-date closures only; moving holidays come from <MARKET>_HOLIDAYS.
    let fixed: &[(u32, u32)] = match market {
        Market::AShare => &[(1, 1)],
        Market::Us => &[(1, 1), (7, 4), (12, 25)],
        Market::Hk => &[(1, 1), (12, 25)],
    };

    let mut out = BTreeSet::new();
    for y in BUILTIN_HOLIDAY_YEARS {
        for (m, d) in fixed {
            if let Some(date) = NaiveDate::from_ymd_opt(y, *m, *d) {
                out.insert(date);
            }
        }
    }
    out
}
