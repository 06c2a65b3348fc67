//! A workflow's armed schedule and how it advances after each fire.
//!
//! Interval triggers first fire one interval after their start delay and
//! then stay on a fixed grid anchored at that first fire, so a late fire
//! does not shift later ones. Cron triggers follow their
//! expression. A trigger found overdue fires once; its next slot is the
//! first one strictly after the fire time, which coalesces every missed
//! slot into that single fire.

use chrono::{DateTime, Duration, Utc};
use nbgrid_core::{ScheduleSpec, WorkflowRecord};
use serde::{Deserialize, Serialize};

use crate::cron::CronExpr;
use crate::error::SchedulerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Armed,
    /// Exhausted its repeat count.
    Fired,
    Cancelled,
}

/// The persisted form of an armed trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub workflow_id: String,
    pub project_id: String,
    pub schedule: ScheduleSpec,
    /// Workflow revision the trigger was armed for.
    pub revision: u64,
    pub state: TriggerState,
    pub next_fire: DateTime<Utc>,
    /// First slot of an interval grid.
    pub anchor: DateTime<Utc>,
    /// Successful fires so far; counted against `repeat`.
    pub fired: u32,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl Trigger {
    /// Arm a fresh trigger for `record`. `None` when the schedule never
    /// fires: no schedule, `repeat = 0`, or a cron expression without a
    /// future match.
    pub fn arm(record: &WorkflowRecord, now: DateTime<Utc>) -> SchedulerResult<Option<Self>> {
        let schedule = &record.def.schedule;
        if schedule.repeat() == Some(0) {
            return Ok(None);
        }
        let first = match schedule {
            ScheduleSpec::None => return Ok(None),
            ScheduleSpec::Interval {
                every_seconds,
                start_delay_min,
                ..
            } => {
                now + Duration::minutes(i64::from(*start_delay_min))
                    + Duration::seconds(i64::try_from(*every_seconds).unwrap_or(i64::MAX))
            }
            ScheduleSpec::Cron { expr, .. } => match CronExpr::parse(expr)?.next_after(now) {
                Some(at) => at,
                None => return Ok(None),
            },
        };
        Ok(Some(Self {
            workflow_id: record.workflow_id.clone(),
            project_id: record.project_id.clone(),
            schedule: schedule.clone(),
            revision: record.revision,
            state: TriggerState::Armed,
            next_fire: first,
            anchor: first,
            fired: 0,
            last_fired_at: None,
        }))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == TriggerState::Armed && self.next_fire <= now
    }

    /// Record a successful fire at `now` and move to the next slot.
    /// Returns false once the trigger is exhausted.
    pub fn advance(&mut self, now: DateTime<Utc>) -> SchedulerResult<bool> {
        self.fired += 1;
        self.last_fired_at = Some(now);
        if self.schedule.repeat().is_some_and(|max| self.fired >= max) {
            self.state = TriggerState::Fired;
            return Ok(false);
        }
        let next = match &self.schedule {
            ScheduleSpec::None => None,
            ScheduleSpec::Interval { every_seconds, .. } => {
                Some(next_grid_slot(self.anchor, *every_seconds, now))
            }
            ScheduleSpec::Cron { expr, .. } => CronExpr::parse(expr)?.next_after(now),
        };
        match next {
            Some(at) => {
                self.next_fire = at;
                Ok(true)
            }
            None => {
                self.state = TriggerState::Fired;
                Ok(false)
            }
        }
    }

    /// Push the next fire back after a failed enqueue without consuming a
    /// repeat.
    pub fn retry_at(&mut self, at: DateTime<Utc>) {
        self.next_fire = at;
    }
}

/// First slot `anchor + k * every` strictly after `now`.
fn next_grid_slot(anchor: DateTime<Utc>, every_seconds: u64, now: DateTime<Utc>) -> DateTime<Utc> {
    let every = i64::try_from(every_seconds).unwrap_or(i64::MAX).max(1);
    let elapsed = (now - anchor).num_seconds();
    if elapsed < 0 {
        return anchor;
    }
    let k = elapsed / every + 1;
    anchor + Duration::seconds(k.saturating_mul(every))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbgrid_core::{Clock, ManualClock, WorkflowDef};

    fn record(schedule: ScheduleSpec, now: DateTime<Utc>) -> WorkflowRecord {
        WorkflowRecord {
            workflow_id: "w".repeat(16),
            project_id: "p".repeat(10),
            def: WorkflowDef {
                nb_name: "hello".to_string(),
                params: Default::default(),
                schedule,
                queue: "cpu.default".to_string(),
                timeout_secs: 60,
                enabled: true,
                alias: None,
                runtime: None,
                description: None,
            },
            revision: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn interval(every_seconds: u64, repeat: Option<u32>, start_delay_min: u32) -> ScheduleSpec {
        ScheduleSpec::Interval {
            every_seconds,
            repeat,
            start_delay_min,
        }
    }

    #[test]
    fn interval_first_fire_honors_start_delay() {
        let now = ManualClock::at_epoch().now();
        let trigger = Trigger::arm(&record(interval(60, None, 2), now), now)
            .unwrap()
            .unwrap();
        assert_eq!(trigger.next_fire, now + Duration::minutes(3));
    }

    #[test]
    fn interval_stays_on_its_grid() {
        let clock = ManualClock::at_epoch();
        let start = clock.now();
        let mut trigger = Trigger::arm(&record(interval(60, None, 0), start), start)
            .unwrap()
            .unwrap();

        assert_eq!(trigger.next_fire, start + Duration::seconds(60));

        // Fired 7s late: the next slot is still start + 120s.
        clock.advance_secs(67);
        assert!(trigger.advance(clock.now()).unwrap());
        assert_eq!(trigger.next_fire, start + Duration::seconds(120));
    }

    #[test]
    fn overdue_trigger_coalesces_missed_slots() {
        let clock = ManualClock::at_epoch();
        let start = clock.now();
        let mut trigger = Trigger::arm(&record(interval(60, None, 0), start), start)
            .unwrap()
            .unwrap();

        // Down for ~5 slots: one fire now, next slot strictly after now.
        clock.advance_secs(290);
        assert!(trigger.is_due(clock.now()));
        assert!(trigger.advance(clock.now()).unwrap());
        assert_eq!(trigger.fired, 1);
        assert_eq!(trigger.next_fire, start + Duration::seconds(300));
    }

    #[test]
    fn repeat_bounds_the_fire_count() {
        let now = ManualClock::at_epoch().now();
        let mut trigger = Trigger::arm(&record(interval(10, Some(2), 0), now), now)
            .unwrap()
            .unwrap();
        assert!(trigger.advance(now).unwrap());
        assert!(!trigger.advance(now + Duration::seconds(10)).unwrap());
        assert_eq!(trigger.state, TriggerState::Fired);
    }

    #[test]
    fn repeat_zero_never_arms() {
        let now = ManualClock::at_epoch().now();
        assert!(Trigger::arm(&record(interval(10, Some(0), 0), now), now)
            .unwrap()
            .is_none());
        let cron = ScheduleSpec::Cron {
            expr: "* * * * *".to_string(),
            repeat: Some(0),
        };
        assert!(Trigger::arm(&record(cron, now), now).unwrap().is_none());
    }

    #[test]
    fn cron_trigger_follows_expression() {
        let clock = ManualClock::at_epoch();
        let now = clock.now();
        let cron = ScheduleSpec::Cron {
            expr: "0 * * * *".to_string(),
            repeat: None,
        };
        let mut trigger = Trigger::arm(&record(cron, now), now).unwrap().unwrap();
        assert_eq!(trigger.next_fire, now + Duration::hours(1));

        clock.advance_secs(3600);
        assert!(trigger.advance(clock.now()).unwrap());
        assert_eq!(trigger.next_fire, now + Duration::hours(2));
    }

    #[test]
    fn invalid_cron_fails_to_arm() {
        let now = ManualClock::at_epoch().now();
        let cron = ScheduleSpec::Cron {
            expr: "not cron".to_string(),
            repeat: None,
        };
        assert!(Trigger::arm(&record(cron, now), now).is_err());
    }

    #[test]
    fn retry_does_not_consume_a_repeat() {
        let now = ManualClock::at_epoch().now();
        let mut trigger = Trigger::arm(&record(interval(10, Some(1), 0), now), now)
            .unwrap()
            .unwrap();
        trigger.retry_at(now + Duration::seconds(5));
        assert_eq!(trigger.fired, 0);
        assert_eq!(trigger.state, TriggerState::Armed);
        assert!(!trigger.advance(now + Duration::seconds(5)).unwrap());
    }
}
