//! 单元处理上下文
//!
//! 封装"我正在为哪个单元、按哪份协议、生成多少道题"这一信息，
//! 并累计本单元产生的 token 用量和费用（单元失败时也需要上报）

use std::fmt::Display;
use std::sync::Arc;

use crate::models::protocol::Protocol;
use crate::models::unit::GenerationUnit;
use crate::models::usage::{CostBreakdown, TokenUsage};
use crate::services::prompt_builder::ResolvedConfig;

#[derive(Debug, Clone)]
pub struct UnitCtx {
    pub run_id: String,
    pub unit: GenerationUnit,
    pub protocol: Arc<Protocol>,
    pub resolved: ResolvedConfig,
    /// 本次需要交付的题数（断点续跑时已扣除已保存的题）
    pub requested: usize,
    pub usage: TokenUsage,
    pub cost: CostBreakdown,
}

impl UnitCtx {
    pub fn new(
        run_id: impl Into<String>,
        unit: GenerationUnit,
        protocol: Arc<Protocol>,
        resolved: ResolvedConfig,
        requested: usize,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            unit,
            protocol,
            resolved,
            requested,
            usage: TokenUsage::default(),
            cost: CostBreakdown::default(),
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.unit.id
    }
}

impl Display for UnitCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[单元 {}]", self.unit.id)
    }
}
