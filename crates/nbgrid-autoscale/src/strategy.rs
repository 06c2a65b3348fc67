//! Scaling strategies folded into a signed node delta.
//!
//! Each strategy votes independently and the votes are summed:
//!
//! ```text
//! Items{queue, gt, lt?, increase_by, decrease_by}
//!     depth > gt            → +increase_by
//!     lt set, depth < lt    → -decrease_by
//!
//! Idle{idle_time_gt, idle_time_lt?}   (minutes)
//!     -1 per agent idle longer than idle_time_gt
//!     +1 if lt set and every agent was idle less than idle_time_lt
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nbgrid_cluster::{AgentHeartbeat, ClusterPolicy, ScaleStrategy};

/// What the strategies look at on one tick.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    /// Pending depth per queue.
    pub depths: &'a BTreeMap<String, u64>,
    /// Heartbeats of the cluster's live agents.
    pub agents: &'a [AgentHeartbeat],
    pub now: DateTime<Utc>,
}

pub fn vote(strategy: &ScaleStrategy, obs: &Observation<'_>) -> i64 {
    match strategy {
        ScaleStrategy::Items {
            queue,
            gt,
            lt,
            increase_by,
            decrease_by,
        } => {
            let depth = obs.depths.get(queue).copied().unwrap_or(0);
            if depth > *gt {
                i64::from(*increase_by)
            } else if lt.is_some_and(|lt| depth < lt) {
                -i64::from(*decrease_by)
            } else {
                0
            }
        }
        ScaleStrategy::Idle {
            idle_time_gt,
            idle_time_lt,
        } => {
            let gt = minutes(*idle_time_gt);
            let idle = obs
                .agents
                .iter()
                .filter(|a| a.idle_for(obs.now) > gt)
                .count() as i64;
            // An empty cluster has no idle time to judge.
            let all_busy_enough = !obs.agents.is_empty()
                && idle_time_lt.is_some_and(|lt| {
                    obs.agents
                        .iter()
                        .all(|a| a.idle_for(obs.now) < minutes(lt))
                });
            -idle + i64::from(all_busy_enough)
        }
    }
}

/// Sum of every strategy's vote.
pub fn fold(strategies: &[ScaleStrategy], obs: &Observation<'_>) -> i64 {
    strategies.iter().map(|s| vote(s, obs)).sum()
}

/// Target size for a cluster currently at `current` nodes. On the first
/// tick an empty cluster starts from the policy's bootstrap size.
pub fn desired_size(policy: &ClusterPolicy, current: u32, delta: i64, first_tick: bool) -> u32 {
    let base = if first_tick && current == 0 {
        policy.bootstrap_nodes()
    } else {
        current
    };
    policy.clamp(i64::from(base) + delta)
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TimeDelta;
    use nbgrid_core::{Clock, ManualClock};

    fn items(gt: u64, lt: Option<u64>) -> ScaleStrategy {
        ScaleStrategy::Items {
            queue: "cpu.default".to_string(),
            gt,
            lt,
            increase_by: 2,
            decrease_by: 1,
        }
    }

    fn agent(name: &str, idle_minutes: i64, now: DateTime<Utc>) -> AgentHeartbeat {
        AgentHeartbeat {
            agent_id: name.to_string(),
            cluster: "dev".to_string(),
            machine: name.to_string(),
            last_seen: now,
            queues: vec!["cpu.default".to_string()],
            workers: 1,
            busy_workers: 0,
            last_job_at: None,
            started_at: now - TimeDelta::minutes(idle_minutes),
        }
    }

    fn policy(min: u32, max: u32) -> ClusterPolicy {
        ClusterPolicy {
            min_nodes: min,
            max_nodes: max,
            default_nodes: None,
            scale_down_step: 1,
            strategies: vec![],
        }
    }

    #[test]
    fn items_votes_on_queue_depth() {
        let now = ManualClock::at_epoch().now();
        let vote_at = |depth: u64, strategy: &ScaleStrategy| {
            let depths = BTreeMap::from([("cpu.default".to_string(), depth)]);
            vote(strategy, &Observation { depths: &depths, agents: &[], now })
        };
        assert_eq!(vote_at(5, &items(2, None)), 2);
        assert_eq!(vote_at(2, &items(2, None)), 0);
        assert_eq!(vote_at(0, &items(2, None)), 0);
        assert_eq!(vote_at(0, &items(2, Some(1))), -1);
    }

    #[test]
    fn missing_queue_counts_as_empty() {
        let now = ManualClock::at_epoch().now();
        let depths = BTreeMap::new();
        let obs = Observation { depths: &depths, agents: &[], now };
        assert_eq!(vote(&items(0, Some(1)), &obs), -1);
    }

    #[test]
    fn idle_votes_per_agent() {
        let now = ManualClock::at_epoch().now();
        let depths = BTreeMap::new();
        let agents = [agent("a", 10, now), agent("b", 10, now), agent("c", 1, now)];
        let obs = Observation { depths: &depths, agents: &agents, now };
        let idle = ScaleStrategy::Idle {
            idle_time_gt: 5,
            idle_time_lt: None,
        };
        assert_eq!(vote(&idle, &obs), -2);
    }

    #[test]
    fn idle_lt_grows_a_fully_active_cluster() {
        let now = ManualClock::at_epoch().now();
        let depths = BTreeMap::new();
        let idle = ScaleStrategy::Idle {
            idle_time_gt: 30,
            idle_time_lt: Some(2),
        };

        let mut busy = agent("a", 50, now);
        busy.busy_workers = 1;
        let agents = [busy, agent("b", 1, now)];
        let obs = Observation { depths: &depths, agents: &agents, now };
        assert_eq!(vote(&idle, &obs), 1);

        let obs = Observation { depths: &depths, agents: &[], now };
        assert_eq!(vote(&idle, &obs), 0);
    }

    #[test]
    fn strategies_sum() {
        let now = ManualClock::at_epoch().now();
        let depths = BTreeMap::from([("cpu.default".to_string(), 9)]);
        let agents = [agent("a", 10, now)];
        let obs = Observation { depths: &depths, agents: &agents, now };
        let strategies = [
            items(2, None),
            ScaleStrategy::Idle {
                idle_time_gt: 5,
                idle_time_lt: None,
            },
        ];
        assert_eq!(fold(&strategies, &obs), 1);
    }

    #[test]
    fn desired_is_clamped() {
        assert_eq!(desired_size(&policy(0, 4), 3, 5, false), 4);
        assert_eq!(desired_size(&policy(1, 4), 2, -5, false), 1);
        assert_eq!(desired_size(&policy(2, 2), 0, 0, false), 2);
    }

    #[test]
    fn first_tick_starts_from_default_nodes() {
        let mut p = policy(0, 10);
        p.default_nodes = Some(3);
        assert_eq!(desired_size(&p, 0, 1, true), 4);
        assert_eq!(desired_size(&p, 0, 1, false), 1);
        // A cluster that already has machines keeps its size.
        assert_eq!(desired_size(&p, 5, 0, true), 5);
    }
}
