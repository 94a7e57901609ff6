//! 重试与批量规划
//!
//! 纯函数，不做 I/O：退避时间、超额生成目标、按调用上限拆分批次

use std::time::Duration;

/// 默认基础延迟（毫秒）
pub const RETRY_BASE_DELAY_MS: u64 = 2000;

/// 默认最大退避（毫秒）
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// 每次重试的退避倍数
pub const BACKOFF_MULTIPLIER: u32 = 2;

/// 生成调用的重试策略
///
/// 只对传输类失败（网络、限流、超时）生效
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（包含第一次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// 不等待的策略（测试用）
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// 第 `attempt` 次尝试失败后的等待时间
    ///
    /// base × 2^(attempt-1)，不超过 max_delay
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = BACKOFF_MULTIPLIER.saturating_pow(exponent);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

/// 超额生成目标
///
/// 生成 `requested × factor` 道（向上取整，至少等于 `requested`），给人工挑选留余量
pub fn over_generation_target(requested: usize, factor: f64) -> usize {
    if requested == 0 {
        return 0;
    }
    let scaled = (requested as f64 * factor.max(1.0)).ceil() as usize;
    scaled.max(requested)
}

/// 按单次调用上限拆分题数
///
/// 例如 38 道、每次最多 25 道 → [19, 19]：调用次数取最少，题数尽量平均
pub fn split_into_calls(total: usize, max_per_call: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    let max_per_call = max_per_call.max(1);
    let calls = total.div_ceil(max_per_call);
    let base = total / calls;
    let extra = total % calls;
    (0..calls)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(8000));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.backoff_delay(2), Duration::ZERO);
    }

    #[test]
    fn test_over_generation_target() {
        assert_eq!(over_generation_target(10, 1.5), 15);
        assert_eq!(over_generation_target(7, 1.5), 11);
        assert_eq!(over_generation_target(1, 1.5), 2);
        assert_eq!(over_generation_target(10, 0.5), 10);
        assert_eq!(over_generation_target(0, 1.5), 0);
    }

    #[test]
    fn test_split_into_calls() {
        assert_eq!(split_into_calls(15, 25), vec![15]);
        assert_eq!(split_into_calls(38, 25), vec![19, 19]);
        assert_eq!(split_into_calls(51, 25), vec![17, 17, 17]);
        assert_eq!(split_into_calls(26, 25), vec![13, 13]);
        assert_eq!(split_into_calls(3, 0), vec![1, 1, 1]);
        assert!(split_into_calls(0, 25).is_empty());

        for total in [1usize, 24, 25, 26, 99] {
            let calls = split_into_calls(total, 25);
            assert_eq!(calls.iter().sum::<usize>(), total);
            assert!(calls.iter().all(|c| *c <= 25));
        }
    }
}
