use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;

/// 生成服务返回的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// prompt_tokens 中命中上下文缓存的部分
    #[serde(default)]
    pub cached_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cached_tokens: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.cached_tokens += rhs.cached_tokens;
    }
}

/// 计价模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    #[default]
    Standard,
    Batch,
}

impl PricingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Some(PricingMode::Standard),
            "batch" => Some(PricingMode::Batch),
            _ => None,
        }
    }
}

impl fmt::Display for PricingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PricingMode::Standard => write!(f, "standard"),
            PricingMode::Batch => write!(f, "batch"),
        }
    }
}

/// 费用明细（美元 + 本币）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_cost: f64,
    pub total: f64,
    pub local_currency_total: f64,
}

impl AddAssign for CostBreakdown {
    fn add_assign(&mut self, rhs: Self) {
        self.input_cost += rhs.input_cost;
        self.output_cost += rhs.output_cost;
        self.cache_cost += rhs.cache_cost;
        self.total += rhs.total;
        self.local_currency_total += rhs.local_currency_total;
    }
}

/// 一条用量记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub run_id: String,
    pub unit_id: String,
    pub usage: TokenUsage,
    pub cost: CostBreakdown,
    pub model: String,
    /// 实际使用的价格档（未知模型会落到 default 档）
    pub pricing_tier: String,
    pub pricing_mode: PricingMode,
    pub recorded_at: String,
}
