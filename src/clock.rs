use std::sync::Mutex;

use time::{
    format_description::FormatItem, macros::format_description, Date, Duration, OffsetDateTime, UtcOffset,
};

use crate::error::PipelineError;

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const OFFSET_FORMAT: &[FormatItem<'static>] = format_description!("[offset_hour sign:mandatory]:[offset_minute]");

/// Source of "now" in the business time zone.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    fn today(&self) -> Date {
        self.now().date()
    }

    fn yesterday(&self) -> Date {
        self.today().previous_day().unwrap_or(Date::MIN)
    }
}

pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// A clock that only moves when told to.
pub struct FixedClock {
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

/// Parses `+HH:MM` / `-HH:MM`, or `UTC`.
pub fn parse_offset(text: &str) -> Result<UtcOffset, PipelineError> {
    if text.eq_ignore_ascii_case("utc") || text == "Z" {
        return Ok(UtcOffset::UTC);
    }
    UtcOffset::parse(text, OFFSET_FORMAT)
        .map_err(|e| PipelineError::Validation(format!("invalid UTC offset '{}': {}", text, e)))
}

/// Parses a `YYYY-MM-DD` date.
pub fn parse_date(text: &str) -> Result<Date, PipelineError> {
    Date::parse(text, DATE_FORMAT).map_err(|e| PipelineError::Validation(format!("invalid date '{}': {}", text, e)))
}
