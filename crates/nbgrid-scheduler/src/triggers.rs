//! The in-memory set of armed triggers, ordered by next fire time.
//!
//! A min-heap of `(next_fire, seq)` entries plus a map from workflow id to
//! its live trigger. Re-arming or cancelling leaves the old heap entry in
//! place; it is skipped when popped because its `seq` no longer matches.
//! Once stale entries outnumber live ones the heap is rebuilt from the map.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};

use crate::trigger::Trigger;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    next_fire: DateTime<Utc>,
    seq: u64,
    workflow_id: String,
}

#[derive(Debug)]
struct Slot {
    trigger: Trigger,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct TriggerSet {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    slots: HashMap<String, Slot>,
    next_seq: u64,
}

impl TriggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `trigger`, replacing any trigger of the same workflow.
    pub fn arm(&mut self, trigger: Trigger) -> Option<Trigger> {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.heap.push(Reverse(HeapEntry {
            next_fire: trigger.next_fire,
            seq,
            workflow_id: trigger.workflow_id.clone(),
        }));
        let replaced = self
            .slots
            .insert(trigger.workflow_id.clone(), Slot { trigger, seq })
            .map(|slot| slot.trigger);
        self.compact();
        replaced
    }

    pub fn cancel(&mut self, workflow_id: &str) -> Option<Trigger> {
        let removed = self.slots.remove(workflow_id).map(|slot| slot.trigger);
        self.compact();
        removed
    }

    pub fn get(&self, workflow_id: &str) -> Option<&Trigger> {
        self.slots.get(workflow_id).map(|slot| &slot.trigger)
    }

    pub fn contains(&self, workflow_id: &str) -> bool {
        self.slots.contains_key(workflow_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn workflow_ids(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Earliest fire time among live triggers.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        self.discard_stale();
        self.heap.peek().map(|Reverse(entry)| entry.next_fire)
    }

    /// Remove and return every trigger due at `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Trigger> {
        let mut due = Vec::new();
        loop {
            self.discard_stale();
            match self.heap.peek() {
                Some(Reverse(entry)) if entry.next_fire <= now => {}
                _ => break,
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&entry.workflow_id) {
                due.push(slot.trigger);
            }
        }
        due
    }

    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.slots.len() {
            return;
        }
        self.heap = self
            .slots
            .iter()
            .map(|(workflow_id, slot)| {
                Reverse(HeapEntry {
                    next_fire: slot.trigger.next_fire,
                    seq: slot.seq,
                    workflow_id: workflow_id.clone(),
                })
            })
            .collect();
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            let live = self
                .slots
                .get(&entry.workflow_id)
                .is_some_and(|slot| slot.seq == entry.seq);
            if live {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::TriggerState;
    use chrono::Duration;
    use nbgrid_core::{Clock, ManualClock, ScheduleSpec};

    fn trigger(workflow_id: &str, next_fire: DateTime<Utc>) -> Trigger {
        Trigger {
            workflow_id: workflow_id.to_string(),
            project_id: "p".repeat(10),
            schedule: ScheduleSpec::Interval {
                every_seconds: 60,
                repeat: None,
                start_delay_min: 0,
            },
            revision: 1,
            state: TriggerState::Armed,
            next_fire,
            anchor: next_fire,
            fired: 0,
            last_fired_at: None,
        }
    }

    #[test]
    fn pops_in_fire_order() {
        let now = ManualClock::at_epoch().now();
        let mut set = TriggerSet::new();
        set.arm(trigger("b", now + Duration::seconds(20)));
        set.arm(trigger("a", now + Duration::seconds(10)));
        set.arm(trigger("c", now + Duration::seconds(99)));

        assert_eq!(set.next_deadline(), Some(now + Duration::seconds(10)));
        let due: Vec<_> = set
            .pop_due(now + Duration::seconds(30))
            .into_iter()
            .map(|t| t.workflow_id)
            .collect();
        assert_eq!(due, vec!["a", "b"]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn ties_break_by_arm_order() {
        let now = ManualClock::at_epoch().now();
        let mut set = TriggerSet::new();
        set.arm(trigger("z", now));
        set.arm(trigger("a", now));
        let due: Vec<_> = set.pop_due(now).into_iter().map(|t| t.workflow_id).collect();
        assert_eq!(due, vec!["z", "a"]);
    }

    #[test]
    fn rearming_replaces_previous_trigger() {
        let now = ManualClock::at_epoch().now();
        let mut set = TriggerSet::new();
        set.arm(trigger("a", now + Duration::seconds(10)));
        let old = set.arm(trigger("a", now + Duration::seconds(50)));
        assert!(old.is_some());
        assert_eq!(set.len(), 1);

        // The stale heap entry at +10s never surfaces.
        assert_eq!(set.next_deadline(), Some(now + Duration::seconds(50)));
        assert!(set.pop_due(now + Duration::seconds(30)).is_empty());
        assert_eq!(set.pop_due(now + Duration::seconds(50)).len(), 1);
    }

    #[test]
    fn cancelled_triggers_never_fire() {
        let now = ManualClock::at_epoch().now();
        let mut set = TriggerSet::new();
        set.arm(trigger("a", now));
        set.arm(trigger("b", now + Duration::seconds(5)));
        assert!(set.cancel("a").is_some());
        assert!(set.cancel("a").is_none());

        let due = set.pop_due(now + Duration::seconds(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].workflow_id, "b");
        assert!(set.is_empty());
        assert_eq!(set.next_deadline(), None);
    }

    #[test]
    fn repeated_rearms_do_not_grow_the_heap() {
        let now = ManualClock::at_epoch().now();
        let mut set = TriggerSet::new();
        set.arm(trigger("b", now + Duration::days(1)));
        for i in 0..100 {
            set.arm(trigger("a", now + Duration::days(365 + i)));
        }
        assert!(set.heap.len() <= 4, "heap holds {} entries", set.heap.len());
        assert_eq!(set.next_deadline(), Some(now + Duration::days(1)));

        set.cancel("b");
        assert!(set.heap.len() <= 2);
        assert_eq!(set.next_deadline(), Some(now + Duration::days(365 + 99)));
    }
}
