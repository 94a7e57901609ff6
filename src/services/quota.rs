//! 配额分配
//!
//! 把百分比区间换算成整数题数，采用确定性的最大余数法：
//! 1. 每个类别按区间中点计算份额（中点之和不为 100 时按比例归一）
//! 2. 先取整数部分
//! 3. 剩余题数依次分给小数部分最大的类别，小数部分相同时按类别顺序
//!
//! 任意 N 下结果之和都严格等于 N。

use std::collections::BTreeMap;

use crate::models::protocol::PercentRange;

/// 分配配额
pub fn allocate_quotas<K>(ranges: &BTreeMap<K, PercentRange>, n: usize) -> BTreeMap<K, usize>
where
    K: Ord + Clone,
{
    if ranges.is_empty() {
        return BTreeMap::new();
    }

    let weights: Vec<f64> = ranges.values().map(|r| r.midpoint().max(0.0)).collect();
    let weight_sum: f64 = weights.iter().sum();

    // 所有中点都为 0 时平均分配
    let shares: Vec<f64> = if weight_sum > 0.0 {
        weights.iter().map(|w| w / weight_sum * n as f64).collect()
    } else {
        vec![n as f64 / ranges.len() as f64; ranges.len()]
    };

    let mut counts: Vec<usize> = shares.iter().map(|s| s.floor() as usize).collect();
    let assigned: usize = counts.iter().sum();
    let mut remaining = n.saturating_sub(assigned);

    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.sort_by(|&a, &b| {
        let frac_a = shares[a] - shares[a].floor();
        let frac_b = shares[b] - shares[b].floor();
        frac_b
            .partial_cmp(&frac_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    for idx in order.into_iter().cycle() {
        if remaining == 0 {
            break;
        }
        counts[idx] += 1;
        remaining -= 1;
    }

    ranges.keys().cloned().zip(counts).collect()
}

/// 某一类别在批次中的实际占比
pub fn observed_percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::protocol::{Archetype, CognitiveLoad};

    fn archetype_ranges() -> BTreeMap<Archetype, PercentRange> {
        let mut ranges = BTreeMap::new();
        ranges.insert(Archetype::Recall, PercentRange::new(25.0, 35.0));
        ranges.insert(Archetype::Application, PercentRange::new(20.0, 30.0));
        ranges.insert(Archetype::Integrative, PercentRange::new(15.0, 25.0));
        ranges.insert(Archetype::Discriminator, PercentRange::new(10.0, 20.0));
        ranges.insert(Archetype::Exception, PercentRange::new(5.0, 10.0));
        ranges
    }

    #[test]
    fn test_allocation_sums_to_n() {
        let mut skewed = BTreeMap::new();
        skewed.insert(CognitiveLoad::High, PercentRange::new(0.0, 100.0));
        skewed.insert(CognitiveLoad::Medium, PercentRange::new(33.3, 33.4));
        skewed.insert(CognitiveLoad::Low, PercentRange::new(1.0, 1.0));

        for n in [1usize, 7, 13, 30, 91] {
            let counts = allocate_quotas(&archetype_ranges(), n);
            assert_eq!(counts.values().sum::<usize>(), n, "archetypes, N={}", n);
            assert_eq!(counts.len(), 5);

            let counts = allocate_quotas(&skewed, n);
            assert_eq!(counts.values().sum::<usize>(), n, "skewed, N={}", n);
        }
    }

    #[test]
    fn test_largest_remainder_is_deterministic() {
        // 中点：30 / 25 / 20 / 15 / 7.5，归一后 N=10：
        // 3.077 / 2.564 / 2.051 / 1.538 / 0.769
        // 取整 3+2+2+1+0 = 8，剩余 2 给 exception(0.769) 和 application(0.564)
        let counts = allocate_quotas(&archetype_ranges(), 10);
        assert_eq!(counts[&Archetype::Recall], 3);
        assert_eq!(counts[&Archetype::Application], 3);
        assert_eq!(counts[&Archetype::Integrative], 2);
        assert_eq!(counts[&Archetype::Discriminator], 1);
        assert_eq!(counts[&Archetype::Exception], 1);

        assert_eq!(allocate_quotas(&archetype_ranges(), 10), counts);
    }

    #[test]
    fn test_midpoints_summing_to_100_use_exact_floor() {
        let mut ranges = BTreeMap::new();
        ranges.insert(CognitiveLoad::High, PercentRange::new(20.0, 30.0));
        ranges.insert(CognitiveLoad::Medium, PercentRange::new(40.0, 50.0));
        ranges.insert(CognitiveLoad::Low, PercentRange::new(25.0, 35.0));
        // 中点 25 / 45 / 30，N=20 → 5 / 9 / 6
        let counts = allocate_quotas(&ranges, 20);
        assert_eq!(counts[&CognitiveLoad::High], 5);
        assert_eq!(counts[&CognitiveLoad::Medium], 9);
        assert_eq!(counts[&CognitiveLoad::Low], 6);
    }

    #[test]
    fn test_zero_weights_and_zero_n() {
        let mut ranges = BTreeMap::new();
        ranges.insert(CognitiveLoad::High, PercentRange::new(0.0, 0.0));
        ranges.insert(CognitiveLoad::Low, PercentRange::new(0.0, 0.0));
        let counts = allocate_quotas(&ranges, 5);
        assert_eq!(counts.values().sum::<usize>(), 5);

        let counts = allocate_quotas(&archetype_ranges(), 0);
        assert!(counts.values().all(|c| *c == 0));
        assert!(allocate_quotas::<Archetype>(&BTreeMap::new(), 5).is_empty());
    }

    #[test]
    fn test_observed_percent() {
        assert_eq!(observed_percent(3, 12), 25.0);
        assert_eq!(observed_percent(0, 0), 0.0);
    }
}
