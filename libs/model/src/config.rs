//! Config entities and desired-amount schedules.

use chrono::{
    DateTime, Datelike, Days, Duration, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::attributes::VmAttributes;
use crate::error::ModelError;

/// One kind of machine to maintain.
///
/// The id doubles as the naming prefix for the VMs it owns. Configuration
/// sync owns every field except `current_amount`, which only the controller
/// recomputes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub id: String,
    pub prefix: String,
    pub amount: Amount,
    /// Most recently computed desired count.
    pub current_amount: i32,
    pub attributes: VmAttributes,
    /// Seconds a VM may run before forced replacement (0 disables).
    pub lifetime: i64,
    /// Seconds a new VM has to register a bot (0 disables).
    pub timeout: i64,
    /// Bot server hostname.
    pub swarming: String,
    pub revision: String,
}

impl Config {
    /// Recompute the desired amount at `now`, starting from the current one.
    pub fn compute_amount(&self, now: DateTime<Utc>) -> Result<i32, ModelError> {
        self.amount.compute(self.current_amount, now)
    }
}

/// Desired-amount specification: default bounds plus time-windowed overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Amount {
    pub min: i32,
    pub max: i32,
    pub change: Vec<Schedule>,
}

impl Amount {
    /// A fixed amount with no schedule.
    #[must_use]
    pub fn fixed(n: i32) -> Self {
        Self {
            min: n,
            max: n,
            change: Vec::new(),
        }
    }

    /// Check bounds on the default range and on every schedule.
    pub fn validate(&self) -> Result<(), ModelError> {
        check_bounds(self.min, self.max)?;
        for s in &self.change {
            check_bounds(s.min, s.max)?;
            if s.length <= 0 {
                return Err(ModelError::InvalidAmount(format!(
                    "schedule length must be positive, got {}",
                    s.length
                )));
            }
            s.start.parse_time()?;
            s.start.time_zone()?;
        }
        Ok(())
    }

    /// Clamp `proposed` into the bounds in force at `now`.
    ///
    /// Schedules are checked in declaration order and the first one whose
    /// window contains `now` wins. Outside every window the default bounds
    /// apply.
    pub fn compute(&self, proposed: i32, now: DateTime<Utc>) -> Result<i32, ModelError> {
        for s in &self.change {
            if s.is_active(now)? {
                return Ok(clamp(proposed, s.min, s.max));
            }
        }
        Ok(clamp(proposed, self.min, self.max))
    }
}

fn check_bounds(min: i32, max: i32) -> Result<(), ModelError> {
    if min < 0 || max < 0 {
        return Err(ModelError::InvalidAmount(format!(
            "bounds must be non-negative, got min {min} max {max}"
        )));
    }
    if min > max {
        return Err(ModelError::InvalidBounds { min, max });
    }
    Ok(())
}

fn clamp(proposed: i32, min: i32, max: i32) -> i32 {
    let mut amount = proposed;
    if amount < min {
        amount = min;
    }
    if amount > max {
        amount = max;
    }
    amount.max(0)
}

/// A weekly window during which different bounds apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub min: i32,
    pub max: i32,
    /// Window length in seconds.
    pub length: i64,
    pub start: TimeOfDay,
}

impl Schedule {
    /// Whether `now` falls inside the most recent occurrence of this window.
    pub fn is_active(&self, now: DateTime<Utc>) -> Result<bool, ModelError> {
        let start = self.start.most_recent_start(now)?;
        let end = start + Duration::seconds(self.length);
        Ok(start <= now && now < end)
    }
}

/// Weekly recurring start point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub day: DayOfWeek,
    /// IANA time zone name; empty means UTC.
    #[serde(default)]
    pub location: String,
    /// Local wall-clock time, `HH:MM`.
    pub time: String,
}

impl TimeOfDay {
    fn parse_time(&self) -> Result<NaiveTime, ModelError> {
        NaiveTime::parse_from_str(&self.time, "%H:%M")
            .map_err(|_| ModelError::InvalidTime(self.time.clone()))
    }

    fn time_zone(&self) -> Result<Tz, ModelError> {
        if self.location.is_empty() {
            return Ok(chrono_tz::UTC);
        }
        self.location
            .parse::<Tz>()
            .map_err(|_| ModelError::InvalidLocation(self.location.clone()))
    }

    /// The latest instant at or before `now` matching this day and time.
    pub fn most_recent_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ModelError> {
        let time = self.parse_time()?;
        let tz = self.time_zone()?;
        let local_now = now.with_timezone(&tz);

        let today = local_now.weekday().num_days_from_monday();
        let target = self.day.weekday().num_days_from_monday();
        let days_back = u64::from((today + 7 - target) % 7);

        let resolve = |date: chrono::NaiveDate| {
            let local = date.and_time(time);
            tz.from_local_datetime(&local)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|| skip_gap(&tz, local))
                .ok_or_else(|| ModelError::NonexistentStart {
                    time: self.time.clone(),
                    location: self.location.clone(),
                })
        };

        let date = local_now.date_naive() - Days::new(days_back);
        let start = resolve(date)?;
        if start <= now {
            return Ok(start);
        }
        resolve(date - Days::new(7))
    }
}

/// Resolve a wall-clock time skipped by a forward transition.
///
/// The offset in force just before the gap is applied, so the instant lands
/// the gap's length later on the wall clock (02:30 becomes 03:30 across a
/// one-hour spring-forward).
fn skip_gap(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    let offset = (1..=48).find_map(|step| {
        tz.offset_from_local_datetime(&(local - Duration::minutes(30 * step)))
            .earliest()
    })?;
    offset
        .fix()
        .from_local_datetime(&local)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Day of the week for schedule starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    /// The equivalent chrono weekday.
    pub fn weekday(self) -> Weekday {
        match self {
            Self::Monday => Weekday::Mon,
            Self::Tuesday => Weekday::Tue,
            Self::Wednesday => Weekday::Wed,
            Self::Thursday => Weekday::Thu,
            Self::Friday => Weekday::Fri,
            Self::Saturday => Weekday::Sat,
            Self::Sunday => Weekday::Sun,
        }
    }
}
