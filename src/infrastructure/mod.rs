//! 基础设施层
//!
//! 带 I/O 的资源，通过 trait 暴露给上层：
//! - `GenerationBoundary`：生成服务（上传材料、生成）
//! - `MaterialSource`：单元参考材料
//! - `QuestionStore`：单元状态与题目持久化

pub mod file_store;
pub mod generator;
pub mod materials;
pub mod store;

pub use file_store::FileStore;
pub use generator::{GenerationBoundary, GenerationOutput, OpenAiGenerator};
pub use materials::{MaterialSource, PlanMaterialSource};
pub use store::{MemoryStore, QuestionStore, UnitRecord};
