use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TaskQueueError};

/// Where a schedule entry was declared.
///
/// External entries take precedence over label entries for the same
/// handler name, so operators can re-time a job at runtime without a
/// redeploy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOrigin {
    /// Declared statically alongside a handler registration.
    Label,
    /// Stored in the external schedule store, mutable at runtime.
    External,
}

/// Recurrence rule of a schedule entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Standard cron expression (seconds field included).
    Cron(String),
    /// Fixed interval anchored at a reference instant. The first fire
    /// is the anchor itself.
    Every {
        interval_seconds: u64,
        anchor: DateTime<Utc>,
    },
}

impl ScheduleSpec {
    pub fn every(interval_seconds: u64, anchor: DateTime<Utc>) -> Self {
        Self::Every {
            interval_seconds,
            anchor,
        }
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Self::Cron(expr.into())
    }

    /// Validates the rule without evaluating it.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Cron(expr) => {
                Schedule::from_str(expr).map_err(|e| TaskQueueError::InvalidCron {
                    expr: expr.clone(),
                    message: e.to_string(),
                })?;
                Ok(())
            }
            Self::Every {
                interval_seconds, ..
            } => {
                if *interval_seconds == 0 {
                    return Err(TaskQueueError::Configuration(
                        "schedule interval must be greater than zero".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// A rule producing tasks on a cadence.
///
/// Resolves deterministically to zero-or-one next fire timestamp for
/// any reference time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    /// Target handler name; also the identity used when sources are merged.
    pub handler: String,
    pub spec: ScheduleSpec,
    /// Default arguments for tasks produced from this entry.
    pub args: serde_json::Value,
    pub origin: ScheduleOrigin,
}

impl ScheduleEntry {
    pub fn new(
        handler: impl Into<String>,
        spec: ScheduleSpec,
        args: serde_json::Value,
        origin: ScheduleOrigin,
    ) -> Self {
        Self {
            handler: handler.into(),
            spec,
            args,
            origin,
        }
    }

    /// Next fire strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match &self.spec {
            ScheduleSpec::Cron(expr) => {
                let schedule =
                    Schedule::from_str(expr).map_err(|e| TaskQueueError::InvalidCron {
                        expr: expr.clone(),
                        message: e.to_string(),
                    })?;
                Ok(schedule.after(&after).next())
            }
            ScheduleSpec::Every {
                interval_seconds,
                anchor,
            } => {
                // Entries can be built without passing validate().
                if *interval_seconds == 0 {
                    return Err(TaskQueueError::Configuration(format!(
                        "schedule {} has a zero-second interval",
                        self.handler
                    )));
                }
                if after < *anchor {
                    return Ok(Some(*anchor));
                }
                let elapsed = (after - *anchor).num_seconds();
                let periods = elapsed / *interval_seconds as i64 + 1;
                Ok(Some(
                    *anchor + Duration::seconds(periods * *interval_seconds as i64),
                ))
            }
        }
    }

    /// The fire time an entry with no recorded firing starts from.
    ///
    /// Cron entries look back one minute so a slot matching the
    /// current instant still triggers; interval entries start at
    /// their anchor.
    fn first_fire(&self, reference: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match &self.spec {
            ScheduleSpec::Cron(_) => self.next_fire_after(reference - Duration::minutes(1)),
            ScheduleSpec::Every { anchor, .. } => Ok(Some(*anchor)),
        }
    }

    /// The single fire time due at `reference`, given the last fire
    /// already recorded for this entry. Returns `None` when nothing
    /// is due yet. A fire time at or before `last_fired` is never
    /// reported again.
    pub fn due_fire(
        &self,
        last_fired: Option<DateTime<Utc>>,
        reference: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let candidate = match last_fired {
            Some(last) => self.next_fire_after(last)?,
            None => self.first_fire(reference)?,
        };
        Ok(candidate.filter(|fire| *fire <= reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn every_60(anchor: DateTime<Utc>) -> ScheduleEntry {
        ScheduleEntry::new(
            "send_digest",
            ScheduleSpec::every(60, anchor),
            json!({}),
            ScheduleOrigin::Label,
        )
    }

    #[test]
    fn test_interval_first_fire_is_anchor() {
        let entry = every_60(at(0));
        assert_eq!(entry.due_fire(None, at(0)).unwrap(), Some(at(0)));
    }

    #[test]
    fn test_interval_advances_by_interval() {
        let entry = every_60(at(0));
        assert_eq!(entry.next_fire_after(at(0)).unwrap(), Some(at(60)));
        assert_eq!(entry.next_fire_after(at(59)).unwrap(), Some(at(60)));
        assert_eq!(entry.next_fire_after(at(60)).unwrap(), Some(at(120)));
    }

    #[test]
    fn test_due_fire_never_reports_recorded_fire_again() {
        let entry = every_60(at(0));
        // fired at t=60; nothing more is due until t=120
        assert_eq!(entry.due_fire(Some(at(60)), at(60)).unwrap(), None);
        assert_eq!(entry.due_fire(Some(at(60)), at(119)).unwrap(), None);
        assert_eq!(entry.due_fire(Some(at(60)), at(120)).unwrap(), Some(at(120)));
    }

    #[test]
    fn test_sixty_second_cadence_over_three_minutes() {
        // t=0, t=60 and t=120 fire once each; the t=180 slot is not
        // due while observation stops short of it.
        let entry = every_60(at(0));
        let mut last_fired: Option<DateTime<Utc>> = None;
        let mut fires = Vec::new();

        let mut t = 0;
        while t < 180 {
            if let Some(fire) = entry.due_fire(last_fired, at(t)).unwrap() {
                fires.push(fire);
                last_fired = Some(fire);
            }
            t += 5;
        }

        assert_eq!(fires, vec![at(0), at(60), at(120)]);
    }

    #[test]
    fn test_cron_entry_next_fire() {
        let entry = ScheduleEntry::new(
            "send_digest",
            ScheduleSpec::cron("0 * * * * *"),
            json!({}),
            ScheduleOrigin::External,
        );
        let reference = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap();
        let next = entry.next_fire_after(reference).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let spec = ScheduleSpec::cron("not a cron expr");
        assert!(matches!(
            spec.validate(),
            Err(TaskQueueError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let spec = ScheduleSpec::every(0, Utc::now());
        assert!(matches!(
            spec.validate(),
            Err(TaskQueueError::Configuration(_))
        ));
    }

    #[test]
    fn test_unvalidated_zero_interval_entry_errors_instead_of_dividing() {
        // ScheduleEntry::new takes any spec; a zero interval must
        // surface as an error from evaluation, not a panic.
        let entry = ScheduleEntry::new(
            "send_digest",
            ScheduleSpec::every(0, at(0)),
            json!({}),
            ScheduleOrigin::Label,
        );
        assert!(matches!(
            entry.next_fire_after(at(90)),
            Err(TaskQueueError::Configuration(_))
        ));
        assert!(matches!(
            entry.due_fire(Some(at(60)), at(90)),
            Err(TaskQueueError::Configuration(_))
        ));
    }
}
