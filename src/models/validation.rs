use serde::{Deserialize, Serialize};
use std::fmt;

/// 稳定的、机器可读的校验原因码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    // --- 硬错误 ---
    BannedOption,
    SubsetInclusionOption,
    BannedStemPhrase,
    DoubleNegative,
    CognitiveLoadRun,
    MandatoryPairing,
    MetaReference,
    InvalidAnswerKey,
    InsufficientOptions,
    // --- 警告 ---
    ArchetypeDistribution,
    StructuralFormDistribution,
    DensityDistribution,
    FidelityDistribution,
    StrongPairing,
    AnswerKeyRun,
    StemLengthOutOfBounds,
    LoadRunTrimmed,
    RunArchetypeDistribution,
    RunStructuralFormDistribution,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::BannedOption => "BANNED_OPTION",
            ReasonCode::SubsetInclusionOption => "SUBSET_INCLUSION_OPTION",
            ReasonCode::BannedStemPhrase => "BANNED_STEM_PHRASE",
            ReasonCode::DoubleNegative => "DOUBLE_NEGATIVE",
            ReasonCode::CognitiveLoadRun => "COGNITIVE_LOAD_RUN",
            ReasonCode::MandatoryPairing => "MANDATORY_PAIRING",
            ReasonCode::MetaReference => "META_REFERENCE",
            ReasonCode::InvalidAnswerKey => "INVALID_ANSWER_KEY",
            ReasonCode::InsufficientOptions => "INSUFFICIENT_OPTIONS",
            ReasonCode::ArchetypeDistribution => "ARCHETYPE_DISTRIBUTION",
            ReasonCode::StructuralFormDistribution => "STRUCTURAL_FORM_DISTRIBUTION",
            ReasonCode::DensityDistribution => "DENSITY_DISTRIBUTION",
            ReasonCode::FidelityDistribution => "FIDELITY_DISTRIBUTION",
            ReasonCode::StrongPairing => "STRONG_PAIRING",
            ReasonCode::AnswerKeyRun => "ANSWER_KEY_RUN",
            ReasonCode::StemLengthOutOfBounds => "STEM_LENGTH_OUT_OF_BOUNDS",
            ReasonCode::LoadRunTrimmed => "LOAD_RUN_TRIMMED",
            ReasonCode::RunArchetypeDistribution => "RUN_ARCHETYPE_DISTRIBUTION",
            ReasonCode::RunStructuralFormDistribution => "RUN_STRUCTURAL_FORM_DISTRIBUTION",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条校验问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub code: ReasonCode,
    /// 针对单题的问题（0-based）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_index: Option<usize>,
    /// 针对一段连续题目的问题（闭区间，0-based）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_range: Option<(usize, usize)>,
    pub message: String,
}

impl Issue {
    pub fn question(code: ReasonCode, index: usize, message: impl Into<String>) -> Self {
        Self {
            code,
            question_index: Some(index),
            index_range: None,
            message: message.into(),
        }
    }

    pub fn range(code: ReasonCode, start: usize, end: usize, message: impl Into<String>) -> Self {
        Self {
            code,
            question_index: None,
            index_range: Some((start, end)),
            message: message.into(),
        }
    }

    pub fn batch(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            question_index: None,
            index_range: None,
            message: message.into(),
        }
    }

    /// 问题是否作用于整个批次（而不是某一道题）
    pub fn is_batch_level(&self) -> bool {
        self.question_index.is_none()
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.question_index, self.index_range) {
            (Some(idx), _) => write!(f, "[{}] 第 {} 题: {}", self.code, idx, self.message),
            (None, Some((start, end))) => {
                write!(f, "[{}] 第 {}-{} 题: {}", self.code, start, end, self.message)
            }
            (None, None) => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// 校验结果
///
/// errors 阻止持久化；warnings 只上报
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl ValidationResult {
    pub fn from_issues(errors: Vec<Issue>, warnings: Vec<Issue>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// 存在批次级硬错误时，整批拒绝
    pub fn has_batch_level_errors(&self) -> bool {
        self.errors.iter().any(Issue::is_batch_level)
    }

    /// 存在硬错误的题目下标
    pub fn rejected_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.errors.iter().filter_map(|e| e.question_index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    pub fn errors_with(&self, code: ReasonCode) -> impl Iterator<Item = &Issue> {
        self.errors.iter().filter(move |e| e.code == code)
    }

    pub fn warnings_with(&self, code: ReasonCode) -> impl Iterator<Item = &Issue> {
        self.warnings.iter().filter(move |w| w.code == code)
    }
}
