//! Replication priority.
//!
//! `priority = recency(last commit) + min(reads / reads_per_point, max_boost)`,
//! capped at `max_priority`. Recently written, heavily read repositories
//! replicate first.

use gitgrid_core::PriorityConfig;

const HOUR_MS: u64 = 60 * 60 * 1_000;
const DAY_MS: u64 = 24 * HOUR_MS;
const WEEK_MS: u64 = 7 * DAY_MS;

#[derive(Debug, Clone)]
pub struct PriorityPolicy {
    max_priority: u8,
    reads_per_point: u64,
    max_traffic_boost: u8,
}

impl PriorityPolicy {
    pub fn new(max_priority: u8, reads_per_point: u64, max_traffic_boost: u8) -> Self {
        Self {
            max_priority,
            reads_per_point: reads_per_point.max(1),
            max_traffic_boost,
        }
    }

    pub fn from_config(config: &PriorityConfig) -> Self {
        Self::new(
            config.max_priority,
            config.reads_per_point,
            config.max_traffic_boost,
        )
    }

    /// Base score from the age of the newest default-branch commit.
    pub fn recency_score(last_commit_at: Option<u64>, now: u64) -> u8 {
        let Some(at) = last_commit_at else {
            return 1;
        };
        match now.saturating_sub(at) {
            age if age < HOUR_MS => 10,
            age if age < DAY_MS => 7,
            age if age < WEEK_MS => 4,
            _ => 1,
        }
    }

    pub fn traffic_boost(&self, reads: u64) -> u8 {
        let points = reads / self.reads_per_point;
        points.min(u64::from(self.max_traffic_boost)) as u8
    }

    pub fn compute(&self, last_commit_at: Option<u64>, reads: u64, now: u64) -> u8 {
        let raw = Self::recency_score(last_commit_at, now).saturating_add(self.traffic_boost(reads));
        raw.min(self.max_priority)
    }
}
