//! 业务能力层
//!
//! 纯能力，不关心流程顺序：
//! - 协议注册表、配额分配、提示词构建
//! - 响应归一化、协议校验
//! - 费用记账

pub mod cost_ledger;
pub mod normalizer;
pub mod prompt_builder;
pub mod protocol_registry;
pub mod quota;
pub mod validator;

pub use cost_ledger::{compute_cost, pricing_for, UsageLedger};
pub use normalizer::{normalize, repair_json, NormalizationFailure, NormalizedBatch};
pub use prompt_builder::{build_prompt, ResolvedConfig, SYSTEM_PROMPT};
pub use protocol_registry::ProtocolRegistry;
pub use quota::allocate_quotas;
pub use validator::{
    aggregate_distribution_warnings, enforce_load_runs, validate, validate_by_id,
};
