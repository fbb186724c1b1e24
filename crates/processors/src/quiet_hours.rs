use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid quiet hours `{0}`, expected HH:MM-HH:MM")]
pub struct QuietHoursParseError(String);

/// A daily window in local time during which notifications are held back.
///
/// Windows may wrap midnight (`22:00-07:00`). Start is inclusive, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub utc_offset: FixedOffset,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime, utc_offset: FixedOffset) -> Self {
        Self {
            start,
            end,
            utc_offset,
        }
    }

    /// Sets the local time zone as minutes east of UTC. Out-of-range offsets
    /// are ignored.
    pub fn with_offset_minutes(mut self, minutes: i32) -> Self {
        if let Some(offset) = FixedOffset::east_opt(minutes * 60) {
            self.utc_offset = offset;
        }
        self
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.utc_offset).time();
        if self.start <= self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

impl FromStr for QuietHours {
    type Err = QuietHoursParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || QuietHoursParseError(s.to_string());
        let (start, end) = s.split_once('-').ok_or_else(err)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| err())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| err())?;
        Ok(Self::new(start, end, FixedOffset::east_opt(0).ok_or_else(err)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    #[test]
    fn parses_window() {
        let q: QuietHours = "22:00-07:30".parse().unwrap();
        assert_eq!(q.start, NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        assert_eq!(q.end, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert!("22-07".parse::<QuietHours>().is_err());
        assert!("nonsense".parse::<QuietHours>().is_err());
    }

    #[test]
    fn same_day_window() {
        let q: QuietHours = "12:00-14:00".parse().unwrap();
        assert!(!q.contains(at(11, 59)));
        assert!(q.contains(at(12, 0)));
        assert!(q.contains(at(13, 59)));
        assert!(!q.contains(at(14, 0)));
    }

    #[test]
    fn window_wrapping_midnight() {
        let q: QuietHours = "22:00-07:00".parse().unwrap();
        assert!(q.contains(at(23, 0)));
        assert!(q.contains(at(3, 0)));
        assert!(!q.contains(at(7, 0)));
        assert!(!q.contains(at(12, 0)));
    }

    #[test]
    fn offset_shifts_local_time() {
        // 20:00 UTC is 23:00 at UTC+3.
        let q = "22:00-07:00"
            .parse::<QuietHours>()
            .unwrap()
            .with_offset_minutes(180);
        assert!(q.contains(at(20, 0)));
        assert!(!q.contains(at(12, 0)));
    }
}
