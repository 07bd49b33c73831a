use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, LocalResult, Months, NaiveDateTime, TimeDelta, TimeZone};

use super::{Error, Result};

const PERIOD_MESSAGE: &str = "Archive period must be a positive whole number value";
const UNITS_MESSAGE: &str =
    "Archive period units must be M (months), d (days), w (weeks), h (hours), m (minutes)";

/// Rotation granularity. Weeks are folded into days when parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeriodUnit {
    Minute,
    Hour,
    Day,
    Month,
}

impl PeriodUnit {
    /// strftime pattern used for the archive file suffix
    pub fn timestamp_format(&self) -> &'static str {
        match self {
            PeriodUnit::Month => "%m-%Y",
            PeriodUnit::Day => "%m-%d-%Y",
            PeriodUnit::Hour => "%m-%d-%Y_%H",
            PeriodUnit::Minute => "%m-%d-%Y_%H_%M",
        }
    }

    pub fn letter(&self) -> char {
        match self {
            PeriodUnit::Minute => 'm',
            PeriodUnit::Hour => 'h',
            PeriodUnit::Day => 'd',
            PeriodUnit::Month => 'M',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchivePeriod {
    length: u32,
    unit: PeriodUnit,
}

impl ArchivePeriod {
    /// Validates a period length and unit letter (`m`, `h`, `d`, `w`, `M`).
    ///
    /// Unit letters are case-sensitive: `m` is minutes, `M` is months.
    pub fn new(period: i64, unit: &str) -> Result<Self> {
        if period < 1 {
            return Err(Error::InvalidConfiguration(PERIOD_MESSAGE.to_string()));
        }

        let (unit, multiplier) = match unit {
            "m" => (PeriodUnit::Minute, 1),
            "h" => (PeriodUnit::Hour, 1),
            "d" => (PeriodUnit::Day, 1),
            "w" => (PeriodUnit::Day, 7),
            "M" => (PeriodUnit::Month, 1),
            _ => return Err(Error::InvalidConfiguration(UNITS_MESSAGE.to_string())),
        };

        let length = period
            .checked_mul(multiplier)
            .and_then(|length| u32::try_from(length).ok())
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!("Archive period is too large: {}", period))
            })?;

        Ok(Self { length, unit })
    }

    /// Parses the `<integer><unit-letter>` form, e.g. `"7d"` or `"5M"`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let mut chars = text.chars();
        let unit = chars
            .next_back()
            .ok_or_else(|| Error::InvalidConfiguration(UNITS_MESSAGE.to_string()))?;
        let period = chars
            .as_str()
            .parse::<i64>()
            .map_err(|_| Error::InvalidConfiguration(PERIOD_MESSAGE.to_string()))?;

        let mut buf = [0; 4];
        Self::new(period, unit.encode_utf8(&mut buf))
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn unit(&self) -> PeriodUnit {
        self.unit
    }

    /// Instant one period after `from`. Months follow calendar lengths.
    ///
    /// Month steps are taken on the wall clock. A result that falls in a
    /// daylight saving gap moves forward an hour; one that is repeated takes
    /// the earlier instant.
    pub fn after<Tz: TimeZone>(&self, from: DateTime<Tz>) -> Result<DateTime<Tz>> {
        let length = i64::from(self.length);
        let next = match self.unit {
            PeriodUnit::Month => from
                .naive_local()
                .checked_add_months(Months::new(self.length))
                .and_then(|naive| resolve_local(&from.timezone(), naive)),
            PeriodUnit::Day => TimeDelta::try_days(length).and_then(|d| from.clone().checked_add_signed(d)),
            PeriodUnit::Hour => TimeDelta::try_hours(length).and_then(|d| from.clone().checked_add_signed(d)),
            PeriodUnit::Minute => {
                TimeDelta::try_minutes(length).and_then(|d| from.clone().checked_add_signed(d))
            }
        };

        next.ok_or_else(|| {
            Error::InvalidTimestamp(format!("{} + {} is out of range", from.naive_local(), self))
        })
    }
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) => Some(at),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => {
            let shifted = naive.checked_add_signed(TimeDelta::try_hours(1)?)?;
            tz.from_local_datetime(&shifted).earliest()
        }
    }
}

impl fmt::Display for ArchivePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.length, self.unit.letter())
    }
}

/// When the active file is next due to be archived.
#[derive(Clone, Debug)]
pub struct ArchiveSchedule {
    period: ArchivePeriod,
    next_rotation: DateTime<Local>,
}

impl ArchiveSchedule {
    /// First rotation is one period after `base`: the creation time of an
    /// existing file, or now for a new one.
    pub fn starting_at(period: ArchivePeriod, base: DateTime<Local>) -> Result<Self> {
        let next_rotation = period.after(base)?;
        log::info!("Next archive time: {}", next_rotation);
        Ok(Self { period, next_rotation })
    }

    pub fn period(&self) -> ArchivePeriod {
        self.period
    }

    pub fn next_rotation(&self) -> DateTime<Local> {
        self.next_rotation
    }

    pub fn set_next_rotation(&mut self, at: DateTime<Local>) {
        self.next_rotation = at;
    }

    pub fn is_due(&self, now: DateTime<Local>) -> bool {
        now >= self.next_rotation
    }

    /// Next rotation for a file created at `now`.
    pub fn following(&self, now: DateTime<Local>) -> Result<DateTime<Local>> {
        self.period.after(now)
    }

    /// Called after a rotation with the instant from [`Self::following`].
    pub fn reschedule(&mut self, next: DateTime<Local>) {
        self.next_rotation = next;
        log::info!("Next archive time: {}", self.next_rotation);
    }

    pub fn format_stamp(&self, at: DateTime<Local>) -> String {
        at.format(self.period.unit.timestamp_format()).to_string()
    }
}

/// `<dir>/<stem>.<stamp>.<ext>` for `<dir>/<stem>.<ext>`.
///
/// A file name without an extension becomes `<name>.<stamp>`.
pub fn archive_path(database: &Path, stamp: &str) -> PathBuf {
    let file_name = database
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let archived = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}.{}.{}", stem, stamp, ext),
        _ => format!("{}.{}", file_name, stamp),
    };

    database.with_file_name(archived)
}
