//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责单元调度和运行汇总，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 应用入口
//! - 管理应用生命周期（初始化、运行）
//! - 加载协议和单元计划（Vec<UnitPlan>）
//! - 装配文件存储、生成服务客户端和费用账本
//! - 输出全局统计信息
//!
//! ### `unit_processor` - 单元编排器
//! - 驱动单元状态机（pending → generating → completed / failed）
//! - 控制并发数量（Semaphore）
//! - 隔离单元失败，汇总运行结果和运行级分布警告
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<UnitPlan>)
//!     ↓
//! unit_processor (处理 Vec<GenerationUnit>)
//!     ↓
//! workflow::UnitFlow (处理单个 GenerationUnit)
//!     ↓
//! services (能力层：registry / prompt / normalize / validate / cost)
//!     ↓
//! infrastructure (基础设施：GenerationBoundary / MaterialSource / QuestionStore)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：batch_processor 管装配，unit_processor 管调度
//! 2. **资源隔离**：只有编排层创建生成服务客户端和存储
//! 3. **向下依赖**：编排层 → workflow → services → infrastructure
//! 4. **无业务逻辑**：只做调度和统计，不做具体校验判断

pub mod batch_processor;
pub mod unit_processor;

// 重新导出主要类型
pub use batch_processor::App;
pub use unit_processor::Orchestrator;
