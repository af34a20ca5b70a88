use std::fmt;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};

use crate::error::{Result, SchedulerError};

const ALL_DAYS: u8 = 0b0111_1111;
const DAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// Set of weekdays a daily trigger is allowed to fire on.
///
/// Bit `n` is `Weekday::num_days_from_monday() == n`, so numeric masks
/// follow the same 0 = Monday … 6 = Sunday convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayMask(u8);

impl DayMask {
    pub const EVERY_DAY: DayMask = DayMask(ALL_DAYS);

    /// Parse `*`, an empty string, or a comma list of day names (`mon`),
    /// numbers (`0`) and ranges (`mon-fri`, `0-4`).
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() || spec == "*" {
            return Ok(Self::EVERY_DAY);
        }

        let mut bits = 0u8;
        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token == "*" {
                return Ok(Self::EVERY_DAY);
            }
            match token.split_once('-') {
                Some((from, to)) => {
                    let (from, to) = (parse_day(from)?, parse_day(to)?);
                    if from > to {
                        return Err(SchedulerError::InvalidSchedule(format!(
                            "descending day range '{token}'"
                        )));
                    }
                    for day in from..=to {
                        bits |= 1 << day;
                    }
                }
                None => bits |= 1 << parse_day(token)?,
            }
        }

        if bits == 0 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "empty day mask '{spec}'"
            )));
        }
        Ok(Self(bits))
    }

    /// Build a mask from form-style selections. Nothing selected or all seven
    /// selected both mean "every day".
    pub fn from_selection<S: AsRef<str>>(days: &[S]) -> Result<Self> {
        if days.is_empty() {
            return Ok(Self::EVERY_DAY);
        }
        let joined = days.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
        Self::parse(&joined)
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_every_day(&self) -> bool {
        self.0 == ALL_DAYS
    }
}

impl fmt::Display for DayMask {
    /// Canonical storage form: `*` or `mon,wed,fri`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_every_day() {
            return write!(f, "*");
        }
        let names: Vec<&str> = (0..7)
            .filter(|n| self.0 & (1 << n) != 0)
            .map(|n| DAY_NAMES[n])
            .collect();
        write!(f, "{}", names.join(","))
    }
}

fn parse_day(token: &str) -> Result<u8> {
    let token = token.trim().to_ascii_lowercase();
    if let Ok(n) = token.parse::<u8>() {
        if n < 7 {
            return Ok(n);
        }
    } else if let Some(pos) = DAY_NAMES
        .iter()
        .position(|name| token.get(..3).is_some_and(|prefix| *name == prefix))
    {
        return Ok(pos as u8);
    }
    Err(SchedulerError::InvalidSchedule(format!(
        "unknown day of week '{token}'"
    )))
}

/// When a registered job fires. All times are local wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Fire at HH:MM on every day contained in `days`.
    Daily { at: NaiveTime, days: DayMask },
    /// Fire every `every`, first fire one period after registration.
    Interval { every: Duration },
}

impl Trigger {
    /// Every day at `hour:minute`.
    pub fn daily(hour: u32, minute: u32) -> Result<Self> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("invalid time of day {hour}:{minute:02}"))
        })?;
        Ok(Trigger::Daily {
            at,
            days: DayMask::EVERY_DAY,
        })
    }

    pub fn every(every: Duration) -> Self {
        Trigger::Interval { every }
    }

    /// Compute the next fire time strictly *after* `from`.
    ///
    /// Returns `None` only for a zero interval, which would otherwise spin.
    pub fn next_fire(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Trigger::Daily { at, days } => {
                // Eight candidates cover "later today" through "same weekday next week".
                (0..8)
                    .filter_map(|offset| from.date().checked_add_days(chrono::Days::new(offset)))
                    .map(|date| date.and_time(*at))
                    .find(|candidate| *candidate > from && days.contains(candidate.weekday()))
            }
            Trigger::Interval { every } => {
                if every.is_zero() {
                    return None;
                }
                let step = chrono::Duration::from_std(*every).ok()?;
                from.checked_add_signed(step)
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Daily { at, days } => write!(
                f,
                "cron[day_of_week='{}', hour='{}', minute='{}']",
                days,
                at.format("%-H"),
                at.format("%-M")
            ),
            Trigger::Interval { every } => write!(f, "interval[{}s]", every.as_secs()),
        }
    }
}
