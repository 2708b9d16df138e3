use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use runledger_common::{Error, Result};

/// A parsed cron expression bound to the timezone it is evaluated in.
#[derive(Debug, Clone)]
pub struct CronSpec {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronSpec {
    /// Accepts classic 5-field expressions (`min hour dom month dow`) as well
    /// as the 6/7-field form with seconds (and year).
    pub fn parse(expression: &str, timezone: Option<&str>) -> Result<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(Error::Schedule(format!(
                    "cron expression {expression:?} has {n} fields, expected 5, 6 or 7"
                )));
            }
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            Error::Schedule(format!("invalid cron expression {expression:?}: {e}"))
        })?;

        let timezone = match timezone {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| Error::Schedule(format!("invalid timezone: {name}")))?,
            None => Tz::UTC,
        };

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}
