//! 费用记账 - 业务能力层
//!
//! 按模型价格表把 token 用量换算为美元和本币，并以 JSON Lines 追加到用量日志。
//! 记账失败只记录警告，从不影响生成流程。

use chrono::Local;
use phf::phf_map;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::usage::{CostBreakdown, PricingMode, TokenUsage, UsageRecord};

/// 单个模型的价格（美元 / 百万 token）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache: f64,
    pub batch_input: f64,
    pub batch_output: f64,
}

const GEMINI_3_PRO: ModelPricing = ModelPricing {
    input: 2.0,
    output: 12.0,
    cache: 0.20,
    batch_input: 1.0,
    batch_output: 6.0,
};

/// 未知模型使用的价格档名
pub const DEFAULT_TIER: &str = "default";

static PRICE_TABLE: phf::Map<&'static str, ModelPricing> = phf_map! {
    "gemini-3-pro-preview" => GEMINI_3_PRO,
    "gemini-3.0-pro-preview" => GEMINI_3_PRO,
    "gemini-2.5-pro" => ModelPricing { input: 1.25, output: 10.0, cache: 0.125, batch_input: 0.625, batch_output: 5.0 },
    "gemini-2.5-flash" => ModelPricing { input: 0.30, output: 2.50, cache: 0.03, batch_input: 0.15, batch_output: 1.25 },
    "gpt-4o" => ModelPricing { input: 2.50, output: 10.0, cache: 1.25, batch_input: 1.25, batch_output: 5.0 },
    "gpt-4o-mini" => ModelPricing { input: 0.15, output: 0.60, cache: 0.075, batch_input: 0.075, batch_output: 0.30 },
    "default" => GEMINI_3_PRO,
};

/// 查找模型价格，返回 (价格档名, 价格)
///
/// 模型名不区分大小写，允许带 `models/` 前缀；找不到时落到 `default` 档
pub fn pricing_for(model: &str) -> (&'static str, ModelPricing) {
    let key = model.trim().to_lowercase();
    let key = key.strip_prefix("models/").unwrap_or(&key);
    match PRICE_TABLE.get_entry(key) {
        Some((tier, pricing)) => (*tier, *pricing),
        None => {
            debug!("模型 {} 不在价格表中，使用 default 档", model);
            (DEFAULT_TIER, GEMINI_3_PRO)
        }
    }
}

/// 计算一次调用的费用
///
/// 命中缓存的输入 token 按缓存价计费，其余输入按输入价计费
pub fn compute_cost(
    usage: &TokenUsage,
    model: &str,
    mode: PricingMode,
    usd_to_local: f64,
) -> CostBreakdown {
    let (_, pricing) = pricing_for(model);
    let (input_rate, output_rate) = match mode {
        PricingMode::Standard => (pricing.input, pricing.output),
        PricingMode::Batch => (pricing.batch_input, pricing.batch_output),
    };

    let cached = usage.cached_tokens.min(usage.prompt_tokens);
    let uncached = usage.prompt_tokens - cached;

    let input_cost = uncached as f64 * input_rate / 1_000_000.0;
    let cache_cost = cached as f64 * pricing.cache / 1_000_000.0;
    let output_cost = usage.completion_tokens as f64 * output_rate / 1_000_000.0;
    let total = input_cost + cache_cost + output_cost;

    CostBreakdown {
        input_cost,
        output_cost,
        cache_cost,
        total,
        local_currency_total: total * usd_to_local,
    }
}

/// 构建一条用量记录
pub fn usage_record(
    run_id: &str,
    unit_id: &str,
    usage: TokenUsage,
    model: &str,
    mode: PricingMode,
    usd_to_local: f64,
) -> UsageRecord {
    let (tier, _) = pricing_for(model);
    UsageRecord {
        run_id: run_id.to_string(),
        unit_id: unit_id.to_string(),
        cost: compute_cost(&usage, model, mode, usd_to_local),
        usage,
        model: model.to_string(),
        pricing_tier: tier.to_string(),
        pricing_mode: mode,
        recorded_at: Local::now().to_rfc3339(),
    }
}

/// 用量日志
///
/// 只追加；并发单元共用一个实例，写入由互斥锁串行化
pub struct UsageLedger {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl UsageLedger {
    /// 写入指定文件
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    /// 不落盘（测试或关闭记账时使用）
    pub fn disabled() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// 追加一条记录，失败时只打警告
    pub async fn record(&self, record: &UsageRecord) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = self.append(path, record).await {
            warn!(
                "[单元 {}] ⚠️ 用量记录写入失败（已忽略）: {}",
                record.unit_id, e
            );
        }
    }

    async fn append(&self, path: &PathBuf, record: &UsageRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(
            "[单元 {}] 用量已记录: {} tokens, ${:.6}",
            record.unit_id,
            record.usage.total(),
            record.cost.total
        );
        Ok(())
    }
}
