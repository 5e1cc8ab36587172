use std::cmp::Ordering;

use crate::core::types::SubstationSnapshot;

/// Orders healthy candidates for reservation attempts.
///
/// Ranking only decides the order in which `try_reserve` is attempted. It may
/// look at stale snapshots; admission correctness never depends on it.
pub trait RankingStrategy: Send + Sync {
    fn rank(&self, candidates: Vec<SubstationSnapshot>) -> Vec<SubstationSnapshot>;

    fn name(&self) -> &'static str;
}

/// Ascending `reserved / max`, ties broken by identifier.
///
/// Ratios are compared as exact fractions (`a.reserved * b.max` against
/// `b.reserved * a.max`) so identical snapshots always rank identically.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastLoaded;

impl LeastLoaded {
    pub fn new() -> Self {
        Self
    }

    fn compare(a: &SubstationSnapshot, b: &SubstationSnapshot) -> Ordering {
        let left = a.reserved as u128 * b.max_capacity as u128;
        let right = b.reserved as u128 * a.max_capacity as u128;
        left.cmp(&right).then_with(|| a.id.cmp(&b.id))
    }
}

impl RankingStrategy for LeastLoaded {
    fn rank(&self, mut candidates: Vec<SubstationSnapshot>) -> Vec<SubstationSnapshot> {
        candidates.sort_by(Self::compare);
        candidates
    }

    fn name(&self) -> &'static str {
        "least_loaded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::HealthState;

    fn snapshot(id: &str, reserved: u64, max: u64) -> SubstationSnapshot {
        SubstationSnapshot {
            id: id.to_string(),
            max_capacity: max,
            reserved,
            health: HealthState::Healthy,
            last_probe: None,
            url: None,
            consecutive_failures: 0,
        }
    }

    fn ids(ranked: &[SubstationSnapshot]) -> Vec<&str> {
        ranked.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_ranks_by_ratio_not_absolute_load() {
        let ranked = LeastLoaded.rank(vec![
            snapshot("a", 50, 100),
            snapshot("b", 60, 150),
            snapshot("c", 10, 120),
        ]);
        assert_eq!(ids(&ranked), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_equal_ratios_break_ties_by_id() {
        let ranked = LeastLoaded.rank(vec![
            snapshot("substation3", 10, 100),
            snapshot("substation1", 15, 150),
            snapshot("substation2", 12, 120),
        ]);
        assert_eq!(ids(&ranked), vec!["substation1", "substation2", "substation3"]);
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let input = vec![
            snapshot("x", 3, 7),
            snapshot("y", 6, 14),
            snapshot("z", 1, 9),
        ];
        let mut reversed = input.clone();
        reversed.reverse();

        assert_eq!(LeastLoaded.rank(input), LeastLoaded.rank(reversed));
    }
}
