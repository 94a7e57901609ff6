//! # Question Forge
//!
//! 一个协议驱动的出题流水线：把参考材料、出题协议和目标题数，
//! 变成经过校验、可持久化的题目集
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有带 I/O 的资源，只暴露能力
//! - `GenerationBoundary` - 生成服务（上传材料、生成文本），`OpenAiGenerator` 为默认实现
//! - `MaterialSource` - 单元参考材料
//! - `QuestionStore` - 单元状态与题目持久化（`MemoryStore` / `FileStore`）
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，不关心流程顺序
//! - `ProtocolRegistry` - 出题协议，启动时加载一次，之后只读
//! - `allocate_quotas` / `build_prompt` - 配额分配与提示词构建
//! - `normalize` - 修复并解析模型输出
//! - `validate` - 按协议校验题目
//! - `compute_cost` / `UsageLedger` - 费用计算与用量记录
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个单元"的完整处理流程
//! - `UnitCtx` - 上下文封装（run_id + 单元 + 协议）
//! - `UnitFlow` - 流程编排（材料 → 上传 → 生成 → 归一化 → 校验 → 持久化 → 记账）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 应用入口，装配资源
//! - `orchestrator/unit_processor` - 单元状态机、有界并发和运行汇总
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, ConfigError, GenerationError, UnitError};
pub use infrastructure::{
    FileStore, GenerationBoundary, GenerationOutput, MaterialSource, MemoryStore,
    OpenAiGenerator, QuestionStore,
};
pub use models::{GenerationReport, GenerationRun, GenerationUnit, RawQuestion, UnitStatus};
pub use orchestrator::{App, Orchestrator};
pub use services::ProtocolRegistry;
pub use workflow::{FlowSettings, RetryPolicy, UnitFlow};
