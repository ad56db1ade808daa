//! Deterministic failure injection for the store, the change feed and the pipelines.

use crate::core::{Result, TallyError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// A place where an injected failure can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPoint {
    /// Persisting or removing a detail record.
    DetailWrite,
    /// After the detail write and before the aggregate write of an unprotected dual write.
    BetweenWrites,
    /// Adjusting or overwriting a materialized aggregate.
    AggregateWrite,
    /// Before a transaction's changes are applied.
    Commit,
    /// After a transaction's changes are applied, before the caller hears about it.
    CommitAckLost,
    /// Publishing a change event; the event is lost but its sequence number is consumed.
    FeedPublish,
}

impl FaultPoint {
    pub const ALL: [FaultPoint; 6] = [
        FaultPoint::DetailWrite,
        FaultPoint::BetweenWrites,
        FaultPoint::AggregateWrite,
        FaultPoint::Commit,
        FaultPoint::CommitAckLost,
        FaultPoint::FeedPublish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultPoint::DetailWrite => "detail-write",
            FaultPoint::BetweenWrites => "between-writes",
            FaultPoint::AggregateWrite => "aggregate-write",
            FaultPoint::Commit => "commit",
            FaultPoint::CommitAckLost => "commit-ack-lost",
            FaultPoint::FeedPublish => "feed-publish",
        }
    }
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultPoint {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        FaultPoint::ALL
            .iter()
            .copied()
            .find(|point| point.as_str() == s)
            .ok_or_else(|| TallyError::Parse(format!("unknown fault point '{}'", s)))
    }
}

#[derive(Debug, Default)]
struct FaultSlot {
    /// Number of upcoming hits that fail.
    fail_next: usize,
    /// Absolute hit numbers (1-based) that fail.
    fail_on: Vec<u64>,
    hits: u64,
    triggered: u64,
}

/// Shared, thread-safe fault plan.
///
/// Each [`FaultPoint`] counts how often it is reached; a hit fails when it was armed with
/// [`fail_next`](Self::fail_next) or [`fail_nth`](Self::fail_nth).
#[derive(Debug, Default)]
pub struct FaultInjector {
    slots: Mutex<HashMap<FaultPoint, FaultSlot>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` hits of `point`.
    pub fn fail_next(&self, point: FaultPoint, count: usize) -> Result<()> {
        let mut slots = self.slots.lock()?;
        let slot = slots.entry(point).or_default();
        slot.fail_next = slot.fail_next.saturating_add(count);
        Ok(())
    }

    /// Fail the `nth` hit of `point`, counted from the injector's creation.
    pub fn fail_nth(&self, point: FaultPoint, nth: u64) -> Result<()> {
        let mut slots = self.slots.lock()?;
        slots.entry(point).or_default().fail_on.push(nth);
        Ok(())
    }

    /// Disarm every point. Hit counters are kept.
    pub fn clear(&self) -> Result<()> {
        let mut slots = self.slots.lock()?;
        for slot in slots.values_mut() {
            slot.fail_next = 0;
            slot.fail_on.clear();
        }
        Ok(())
    }

    /// Record a hit of `point`; returns true when the hit must fail.
    pub fn should_fail(&self, point: FaultPoint) -> Result<bool> {
        let mut slots = self.slots.lock()?;
        let slot = slots.entry(point).or_default();
        slot.hits += 1;
        let hit = slot.hits;
        let fire = if slot.fail_next > 0 {
            slot.fail_next -= 1;
            true
        } else if let Some(pos) = slot.fail_on.iter().position(|n| *n == hit) {
            slot.fail_on.swap_remove(pos);
            true
        } else {
            false
        };
        if fire {
            slot.triggered += 1;
        }
        Ok(fire)
    }

    pub fn hits(&self, point: FaultPoint) -> u64 {
        self.slots
            .lock()
            .map(|slots| slots.get(&point).map(|s| s.hits).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn triggered(&self, point: FaultPoint) -> u64 {
        self.slots
            .lock()
            .map(|slots| slots.get(&point).map(|s| s.triggered).unwrap_or(0))
            .unwrap_or(0)
    }

    /// True when any point still has armed failures.
    pub fn is_armed(&self) -> bool {
        self.slots
            .lock()
            .map(|slots| {
                slots
                    .values()
                    .any(|slot| slot.fail_next > 0 || !slot.fail_on.is_empty())
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_next_fires_once_per_arm() {
        let faults = FaultInjector::new();
        faults.fail_next(FaultPoint::AggregateWrite, 2).unwrap();

        assert!(faults.should_fail(FaultPoint::AggregateWrite).unwrap());
        assert!(faults.should_fail(FaultPoint::AggregateWrite).unwrap());
        assert!(!faults.should_fail(FaultPoint::AggregateWrite).unwrap());
        assert_eq!(faults.hits(FaultPoint::AggregateWrite), 3);
        assert_eq!(faults.triggered(FaultPoint::AggregateWrite), 2);
        assert!(!faults.is_armed());
    }

    #[test]
    fn test_fail_nth_counts_hits() {
        let faults = FaultInjector::new();
        faults.fail_nth(FaultPoint::DetailWrite, 3).unwrap();

        assert!(!faults.should_fail(FaultPoint::DetailWrite).unwrap());
        assert!(!faults.should_fail(FaultPoint::DetailWrite).unwrap());
        assert!(faults.should_fail(FaultPoint::DetailWrite).unwrap());
        assert!(!faults.should_fail(FaultPoint::DetailWrite).unwrap());
    }

    #[test]
    fn test_repeated_huge_arm_saturates() {
        let faults = FaultInjector::new();
        faults.fail_next(FaultPoint::Commit, usize::MAX).unwrap();
        faults.fail_next(FaultPoint::Commit, usize::MAX).unwrap();

        assert!(faults.should_fail(FaultPoint::Commit).unwrap());
        assert!(faults.is_armed());
    }

    #[test]
    fn test_points_are_independent() {
        let faults = FaultInjector::new();
        faults.fail_next(FaultPoint::Commit, 1).unwrap();
        assert!(!faults.should_fail(FaultPoint::AggregateWrite).unwrap());
        faults.clear().unwrap();
        assert!(!faults.should_fail(FaultPoint::Commit).unwrap());
    }

    #[test]
    fn test_parse_point_names() {
        for point in FaultPoint::ALL {
            assert_eq!(point.as_str().parse::<FaultPoint>().unwrap(), point);
        }
        assert!("disk-full".parse::<FaultPoint>().is_err());
    }
}
