//! 生成单元
//!
//! 一个单元是一次独立生成的范围：一个章节，或某试卷分区中的一个章节

use serde::{Deserialize, Serialize};
use std::fmt;

/// 单元范围
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitScope {
    pub chapter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl fmt::Display for UnitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.section {
            Some(section) => write!(f, "{} / {}", section, self.chapter),
            None => write!(f, "{}", self.chapter),
        }
    }
}

/// 单元状态
///
/// pending → generating → {completed, failed}；completed / failed 可重新进入 generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Ready,
    Generating,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Ready => "ready",
            UnitStatus::Generating => "generating",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
        }
    }

    /// 状态迁移是否合法
    pub fn can_transition_to(self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Generating)
                | (Ready, Generating)
                | (Generating, Completed)
                | (Generating, Failed)
                | (Completed, Generating)
                | (Failed, Generating)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_status() -> UnitStatus {
    UnitStatus::Pending
}

fn default_difficulty() -> String {
    "balanced".to_string()
}

/// 生成单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationUnit {
    pub id: String,
    pub exam: String,
    pub subject: String,
    pub scope: UnitScope,
    /// 题目主题（通常是章节名）
    pub topic: String,
    /// 需要交付的题目数量
    pub target_count: usize,
    /// 难度预设名，对应协议中的 difficulty_presets
    #[serde(default = "default_difficulty")]
    pub difficulty: String,
    #[serde(default = "default_status")]
    pub status: UnitStatus,
}

/// 参考材料
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceMaterial {
    pub title: String,
    /// 本地路径或 http(s) 地址
    pub file_ref: String,
}

/// 上传到生成服务后得到的不透明句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentHandle {
    pub id: String,
    pub title: String,
}

/// 单元计划文件（每个单元一个 TOML）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitPlan {
    pub unit: GenerationUnit,
    #[serde(default)]
    pub materials: Vec<ReferenceMaterial>,
    #[serde(skip_serializing, skip_deserializing)]
    pub file_path: Option<String>,
}
