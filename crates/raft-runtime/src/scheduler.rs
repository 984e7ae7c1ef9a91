//! # scheduler
//!
//! why: own the two protocol clocks (randomized election timeout, leader heartbeat)
//! relations: read and re-armed by engine.rs under the engine lock
//! what: ElectionScheduler, Tick

use raft_core::{NodeState, RaftConfig};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Which timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Election,
    Heartbeat,
}

/// Election and heartbeat deadlines for one node.
///
/// Followers and candidates only look at the election deadline, leaders only at the
/// heartbeat deadline, so the engine never has to cancel a timer when the role changes.
#[derive(Debug)]
pub struct ElectionScheduler {
    timeout_min_ms: u64,
    timeout_max_ms: u64,
    heartbeat: Duration,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
}

impl ElectionScheduler {
    pub fn new(config: &RaftConfig) -> Self {
        let now = Instant::now();
        let mut scheduler = Self {
            timeout_min_ms: config.election_timeout_min,
            timeout_max_ms: config.election_timeout_max,
            heartbeat: config.heartbeat(),
            election_deadline: now,
            heartbeat_deadline: now,
        };
        scheduler.reset_election(now);
        scheduler
    }

    /// fresh timeout, uniform in [min, max)
    pub fn random_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.timeout_min_ms..self.timeout_max_ms);
        Duration::from_millis(ms)
    }

    pub fn reset_election(&mut self, now: Instant) {
        self.election_deadline = now + self.random_timeout();
    }

    pub fn schedule_heartbeat(&mut self, now: Instant) {
        self.heartbeat_deadline = now + self.heartbeat;
    }

    /// make the next wake-up send heartbeats immediately (new leader)
    pub fn heartbeat_now(&mut self, now: Instant) {
        self.heartbeat_deadline = now;
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_deadline
    }

    pub fn next_wakeup(&self, role: NodeState) -> Instant {
        match role {
            NodeState::Leader => self.heartbeat_deadline,
            NodeState::Follower | NodeState::Candidate => self.election_deadline,
        }
    }

    pub fn due(&self, role: NodeState, now: Instant) -> Option<Tick> {
        if now < self.next_wakeup(role) {
            return None;
        }
        Some(match role {
            NodeState::Leader => Tick::Heartbeat,
            NodeState::Follower | NodeState::Candidate => Tick::Election,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_stays_inside_configured_window() {
        let scheduler = ElectionScheduler::new(&RaftConfig::default());
        for _ in 0..500 {
            let t = scheduler.random_timeout();
            assert!(t >= Duration::from_millis(150) && t < Duration::from_millis(300));
        }
    }

    #[test]
    fn role_selects_which_timer_fires() {
        let mut scheduler = ElectionScheduler::new(&RaftConfig::default());
        let now = Instant::now();
        scheduler.schedule_heartbeat(now);

        assert_eq!(scheduler.due(NodeState::Follower, now), None);
        assert_eq!(scheduler.due(NodeState::Leader, now), None);

        let later = now + Duration::from_millis(60);
        assert_eq!(scheduler.due(NodeState::Leader, later), Some(Tick::Heartbeat));
        assert_eq!(scheduler.due(NodeState::Candidate, later), None);

        let much_later = now + Duration::from_millis(400);
        assert_eq!(scheduler.due(NodeState::Candidate, much_later), Some(Tick::Election));
    }

    #[test]
    fn heartbeat_now_is_due_immediately() {
        let mut scheduler = ElectionScheduler::new(&RaftConfig::default());
        let now = Instant::now();
        scheduler.heartbeat_now(now);
        assert_eq!(scheduler.due(NodeState::Leader, now), Some(Tick::Heartbeat));
    }

    #[test]
    fn reset_pushes_election_forward() {
        let mut scheduler = ElectionScheduler::new(&RaftConfig::default());
        let later = Instant::now() + Duration::from_secs(10);
        scheduler.reset_election(later);
        assert!(scheduler.election_deadline() >= later + Duration::from_millis(150));
    }
}
