//! Market calendar: local dates, trading days and session windows.
//!
//! The pure `*_at` methods on [`Market`] answer calendar questions for an
//! explicit instant. [`MarketCalendar`] binds them to an injected [`Clock`].
//! Exchange holidays are not modelled; only weekends close the equity markets.

use chrono::{
    DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Timelike, Utc,
    Weekday,
};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;

use crate::asset::Market;
use crate::clock::{Clock, SystemClock};
use crate::types::DateRange;

/// Regular trading session in market-local time, as seconds from midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Session {
    /// Session open.
    pub open_secs: u32,
    /// Session close (exclusive).
    pub close_secs: u32,
}

impl Session {
    const fn hm(open: (u32, u32), close: (u32, u32)) -> Self {
        Self {
            open_secs: open.0 * 3600 + open.1 * 60,
            close_secs: close.0 * 3600 + close.1 * 60,
        }
    }

    /// Returns true if `secs` from local midnight falls inside the session.
    #[must_use]
    pub const fn contains(&self, secs: u32) -> bool {
        secs >= self.open_secs && secs < self.close_secs
    }
}

impl Market {
    /// Returns the canonical timezone of the market.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        match self {
            Self::Psx => chrono_tz::Asia::Karachi,
            Self::Us => chrono_tz::America::New_York,
            Self::Crypto => chrono_tz::UTC,
        }
    }

    /// Returns the regular session, or `None` for always-open markets.
    #[must_use]
    pub const fn session(&self) -> Option<Session> {
        match self {
            Self::Psx => Some(Session::hm((9, 30), (15, 30))),
            Self::Us => Some(Session::hm((9, 30), (16, 0))),
            Self::Crypto => None,
        }
    }

    /// Returns the market-local calendar date at `now`.
    #[must_use]
    pub fn today_at(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone()).date_naive()
    }

    /// Returns true if `date` is a trading day for this market.
    #[must_use]
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        match self {
            Self::Crypto => true,
            Self::Psx | Self::Us => !matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
        }
    }

    /// Returns true if the market is outside its session at `now`.
    #[must_use]
    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        let local = now.with_timezone(&self.timezone());
        !self.is_trading_day(local.date_naive())
            || !session.contains(local.num_seconds_from_midnight())
    }

    /// Returns the start of the next session at or after `now`.
    ///
    /// While the market is open (and always for crypto) this is `now`.
    #[must_use]
    pub fn next_open_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let Some(session) = self.session() else {
            return now;
        };
        if !self.is_closed_at(now) {
            return now;
        }

        let local = now.with_timezone(&self.timezone());
        let mut date = local.date_naive();
        if !(self.is_trading_day(date) && local.num_seconds_from_midnight() < session.open_secs) {
            date = self.next_trading_day_after(date);
        }
        self.local_to_utc(local_time(date, session.open_secs))
    }

    /// Returns the next market-local midnight strictly after `now`.
    #[must_use]
    pub fn local_midnight_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let tomorrow = self.today_at(now) + TimeDelta::days(1);
        self.local_to_utc(local_time(tomorrow, 0))
    }

    /// Returns the latest trading day on or before `date`.
    #[must_use]
    pub fn last_trading_day_on_or_before(&self, date: NaiveDate) -> NaiveDate {
        let mut day = date;
        while !self.is_trading_day(day) {
            day -= TimeDelta::days(1);
        }
        day
    }

    /// Returns the trading days inside `range`, ascending.
    #[must_use]
    pub fn trading_days(&self, range: DateRange) -> Vec<NaiveDate> {
        range.days().filter(|d| self.is_trading_day(*d)).collect()
    }

    fn next_trading_day_after(&self, date: NaiveDate) -> NaiveDate {
        let mut day = date + TimeDelta::days(1);
        while !self.is_trading_day(day) {
            day += TimeDelta::days(1);
        }
        day
    }

    fn local_to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        self.timezone()
            .from_local_datetime(&local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&local))
    }
}

fn local_time(date: NaiveDate, secs: u32) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN) + TimeDelta::seconds(i64::from(secs))
}

/// Market calendar bound to a clock.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    clock: Arc<dyn Clock>,
}

impl Default for MarketCalendar {
    fn default() -> Self {
        Self::system()
    }
}

impl MarketCalendar {
    /// Creates a calendar reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Creates a calendar backed by the system clock.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Returns the clock this calendar reads.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the current instant.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns today's date in the market's timezone.
    #[must_use]
    pub fn today(&self, market: Market) -> NaiveDate {
        market.today_at(self.now())
    }

    /// Returns true outside the market's session window and on weekends.
    #[must_use]
    pub fn is_market_closed(&self, market: Market) -> bool {
        market.is_closed_at(self.now())
    }

    /// Returns true if `date` is a trading day for `market`.
    #[must_use]
    pub fn is_trading_day(&self, market: Market, date: NaiveDate) -> bool {
        market.is_trading_day(date)
    }

    /// Returns the trading days of `market` inside `range`, ascending.
    #[must_use]
    pub fn trading_days(&self, market: Market, range: DateRange) -> Vec<NaiveDate> {
        market.trading_days(range)
    }

    /// Returns the latest trading day on or before today.
    #[must_use]
    pub fn last_trading_day(&self, market: Market) -> NaiveDate {
        market.last_trading_day_on_or_before(self.today(market))
    }

    /// Returns the start of the next session.
    #[must_use]
    pub fn next_open(&self, market: Market) -> DateTime<Utc> {
        market.next_open_at(self.now())
    }

    /// Returns the time left until the next session opens.
    #[must_use]
    pub fn until_next_open(&self, market: Market) -> Duration {
        let now = self.now();
        (market.next_open_at(now) - now).to_std().unwrap_or_default()
    }

    /// Returns the time left until midnight in the market's timezone.
    #[must_use]
    pub fn until_local_midnight(&self, market: Market) -> Duration {
        let now = self.now();
        (market.local_midnight_after(now) - now)
            .to_std()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_psx_session() {
        // 2024-01-08 is a Monday; Karachi is UTC+5.
        assert!(!Market::Psx.is_closed_at(utc(2024, 1, 8, 5, 0)));
        assert!(Market::Psx.is_closed_at(utc(2024, 1, 8, 4, 29)));
        assert!(Market::Psx.is_closed_at(utc(2024, 1, 8, 10, 30)));
        assert!(Market::Psx.is_closed_at(utc(2024, 1, 13, 6, 0)));
    }

    #[test]
    fn test_us_session_follows_daylight_saving() {
        // Winter: EST (UTC-5), open 14:30 UTC.
        assert!(Market::Us.is_closed_at(utc(2024, 1, 8, 14, 0)));
        assert!(!Market::Us.is_closed_at(utc(2024, 1, 8, 15, 0)));
        // Summer: EDT (UTC-4), open 13:30 UTC.
        assert!(!Market::Us.is_closed_at(utc(2024, 7, 8, 14, 0)));
        assert_eq!(
            Market::Us.next_open_at(utc(2024, 7, 8, 13, 0)),
            utc(2024, 7, 8, 13, 30)
        );
    }

    #[test]
    fn test_crypto_is_always_open() {
        let saturday = utc(2024, 1, 13, 3, 0);
        assert!(!Market::Crypto.is_closed_at(saturday));
        assert_eq!(Market::Crypto.next_open_at(saturday), saturday);
        assert!(Market::Crypto.is_trading_day(date(2024, 1, 13)));
    }

    #[test]
    fn test_today_uses_market_timezone() {
        let now = utc(2024, 1, 8, 20, 0);
        assert_eq!(Market::Psx.today_at(now), date(2024, 1, 9));
        assert_eq!(Market::Us.today_at(now), date(2024, 1, 8));
        assert_eq!(Market::Crypto.today_at(now), date(2024, 1, 8));
    }

    #[test]
    fn test_next_open_skips_weekend() {
        // Friday after the close.
        let friday_evening = utc(2024, 1, 12, 11, 0);
        assert_eq!(
            Market::Psx.next_open_at(friday_evening),
            utc(2024, 1, 15, 4, 30)
        );
        // Early Monday before the open.
        assert_eq!(
            Market::Psx.next_open_at(utc(2024, 1, 15, 1, 0)),
            utc(2024, 1, 15, 4, 30)
        );
    }

    #[test]
    fn test_trading_days_and_last_trading_day() {
        let range = DateRange::new(date(2024, 1, 5), date(2024, 1, 9)).unwrap();
        assert_eq!(
            Market::Psx.trading_days(range),
            vec![date(2024, 1, 5), date(2024, 1, 8), date(2024, 1, 9)]
        );
        assert_eq!(Market::Crypto.trading_days(range).len(), 5);
        assert_eq!(
            Market::Us.last_trading_day_on_or_before(date(2024, 1, 7)),
            date(2024, 1, 5)
        );
    }

    #[test]
    fn test_calendar_reads_injected_clock() {
        let clock = Arc::new(ManualClock::new(utc(2024, 1, 8, 18, 0)));
        let calendar = MarketCalendar::new(clock.clone());

        // 23:00 in Karachi.
        assert_eq!(calendar.today(Market::Psx), date(2024, 1, 8));
        assert_eq!(
            calendar.until_local_midnight(Market::Psx),
            Duration::from_secs(3600)
        );
        assert!(calendar.is_market_closed(Market::Psx));

        clock.set(utc(2024, 1, 9, 5, 0));
        assert!(!calendar.is_market_closed(Market::Psx));
        assert_eq!(calendar.until_next_open(Market::Psx), Duration::ZERO);
        assert_eq!(calendar.last_trading_day(Market::Psx), date(2024, 1, 9));
    }
}
