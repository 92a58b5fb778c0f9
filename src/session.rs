//! Trading session calendar
//!
//! Weekday sessions in the exchange's local timezone. Holidays are not
//! modelled; a holiday looks like a session with no price movement.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketSession {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

impl Default for MarketSession {
    fn default() -> Self {
        MarketSession {
            tz: chrono_tz::America::New_York,
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl MarketSession {
    /// Build from validated configuration; anything unparseable keeps the default.
    pub fn from_config(cfg: &SessionConfig) -> Self {
        let default = MarketSession::default();
        let tz = cfg.timezone.parse::<Tz>().unwrap_or(default.tz);
        let open = NaiveTime::parse_from_str(&cfg.open, "%H:%M").ok();
        let close = NaiveTime::parse_from_str(&cfg.close, "%H:%M").ok();
        match (open, close) {
            (Some(open), Some(close)) if open < close => MarketSession { tz, open, close },
            _ => MarketSession { tz, ..default },
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    fn is_trading_day(date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Calendar date of the session in exchange-local time
    pub fn session_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        let time = local.time();
        Self::is_trading_day(local.date_naive()) && time >= self.open && time < self.close
    }

    fn local_instant(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Next open or close strictly after `now`.
    pub fn next_boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut date = self.session_date(now);
        // A week always contains a trading day
        for _ in 0..8 {
            if Self::is_trading_day(date) {
                for time in [self.open, self.close] {
                    if let Some(instant) = self.local_instant(date, time) {
                        if instant > now {
                            return Some(instant);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    pub fn time_until_boundary(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.next_boundary(now)
            .map(|b| (b - now).max(Duration::zero()))
            .and_then(|d| d.to_std().ok())
    }
}
