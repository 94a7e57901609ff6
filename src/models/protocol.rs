//! 出题协议数据结构
//!
//! 协议描述某一考试 + 科目下生成题目的全部约束：
//! 题型原型分布、结构形式分布、认知负荷规则、NCERT 贴合度、搭配规则、绝对禁止项。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 标签归一化：小写并只保留字母数字
///
/// "Integrative/Multi-concept" → "integrativemulticoncept"
pub(crate) fn label_key(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn starts_with_any(key: &str, prefixes: &[&str]) -> bool {
    !key.is_empty() && prefixes.iter().any(|p| key.starts_with(p))
}

/// 题型原型（题目考查的认知角色）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    /// 记忆
    Recall,
    /// 应用
    Application,
    /// 综合（多概念）
    Integrative,
    /// 区分题（误区陷阱）
    Discriminator,
    /// 例外 / 反常
    Exception,
}

impl Archetype {
    pub const ALL: [Archetype; 5] = [
        Archetype::Recall,
        Archetype::Application,
        Archetype::Integrative,
        Archetype::Discriminator,
        Archetype::Exception,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Archetype::Recall => "Recall",
            Archetype::Application => "Application",
            Archetype::Integrative => "Integrative/Multi-concept",
            Archetype::Discriminator => "Discriminator",
            Archetype::Exception => "Exception/Outlier",
        }
    }

    /// 宽松解析模型输出的标签
    pub fn from_label(label: &str) -> Option<Self> {
        let key = label_key(label);
        if starts_with_any(&key, &["recall", "factual", "memory"]) {
            Some(Archetype::Recall)
        } else if starts_with_any(&key, &["application", "applied", "apply"]) {
            Some(Archetype::Application)
        } else if starts_with_any(&key, &["integrative", "multiconcept", "integration"]) {
            Some(Archetype::Integrative)
        } else if starts_with_any(&key, &["discriminator", "discriminating", "misconception"]) {
            Some(Archetype::Discriminator)
        } else if starts_with_any(&key, &["exception", "outlier"]) {
            Some(Archetype::Exception)
        } else {
            None
        }
    }
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// 结构形式（题目的呈现格式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralForm {
    StandardMcq,
    MatchTheFollowing,
    AssertionReason,
    MultiStatement,
    NegativePhrasing,
}

impl StructuralForm {
    pub fn label(self) -> &'static str {
        match self {
            StructuralForm::StandardMcq => "Standard MCQ",
            StructuralForm::MatchTheFollowing => "Match the Following",
            StructuralForm::AssertionReason => "Assertion-Reason",
            StructuralForm::MultiStatement => "Multi-statement",
            StructuralForm::NegativePhrasing => "Negative phrasing",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let key = label_key(label);
        if starts_with_any(&key, &["standard", "mcq", "singlecorrect", "single"]) {
            Some(StructuralForm::StandardMcq)
        } else if starts_with_any(&key, &["match", "matching", "columnmatch"]) {
            Some(StructuralForm::MatchTheFollowing)
        } else if starts_with_any(&key, &["assertion", "ar"]) {
            Some(StructuralForm::AssertionReason)
        } else if starts_with_any(&key, &["multistatement", "multiplestatement", "statement"]) {
            Some(StructuralForm::MultiStatement)
        } else if starts_with_any(&key, &["negative", "not", "except"]) {
            Some(StructuralForm::NegativePhrasing)
        } else {
            None
        }
    }
}

impl fmt::Display for StructuralForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// 认知负荷（密度）等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CognitiveLoad {
    Low,
    Medium,
    High,
}

impl CognitiveLoad {
    pub fn label(self) -> &'static str {
        match self {
            CognitiveLoad::Low => "low",
            CognitiveLoad::Medium => "medium",
            CognitiveLoad::High => "high",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let key = label_key(label);
        if starts_with_any(&key, &["high", "heavy", "dense"]) {
            Some(CognitiveLoad::High)
        } else if starts_with_any(&key, &["medium", "moderate", "mid"]) {
            Some(CognitiveLoad::Medium)
        } else if starts_with_any(&key, &["low", "light"]) {
            Some(CognitiveLoad::Low)
        } else {
            None
        }
    }
}

impl fmt::Display for CognitiveLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// 难度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn label(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let key = label_key(label);
        if starts_with_any(&key, &["easy", "simple", "basic"]) {
            Some(Difficulty::Easy)
        } else if starts_with_any(&key, &["medium", "moderate", "average"]) {
            Some(Difficulty::Medium)
        } else if starts_with_any(&key, &["hard", "difficult", "tough", "challenging"]) {
            Some(Difficulty::Hard)
        } else {
            None
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// NCERT 贴合度标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FidelityTag {
    /// 原文措辞
    Verbatim,
    /// 轻度改写
    Adapted,
    /// 意译
    Paraphrased,
}

impl FidelityTag {
    pub fn label(self) -> &'static str {
        match self {
            FidelityTag::Verbatim => "verbatim",
            FidelityTag::Adapted => "adapted",
            FidelityTag::Paraphrased => "paraphrased",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let key = label_key(label);
        if starts_with_any(&key, &["verbatim", "direct", "exact"]) {
            Some(FidelityTag::Verbatim)
        } else if starts_with_any(&key, &["adapted", "modified", "lightly"]) {
            Some(FidelityTag::Adapted)
        } else if starts_with_any(&key, &["paraphrase", "reworded", "inferred"]) {
            Some(FidelityTag::Paraphrased)
        } else {
            None
        }
    }
}

impl fmt::Display for FidelityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// 百分比区间
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentRange {
    pub min: f64,
    pub max: f64,
}

impl PercentRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    pub fn contains(&self, pct: f64) -> bool {
        pct >= self.min && pct <= self.max
    }
}

impl fmt::Display for PercentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%–{}%", self.min, self.max)
    }
}

/// 按类别的百分比分布
pub type Distribution<K> = BTreeMap<K, PercentRange>;

/// 整数上下界
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: usize,
    pub max: usize,
}

impl Bounds {
    pub fn contains(&self, value: usize) -> bool {
        value >= self.min && value <= self.max
    }
}

fn default_max_consecutive_high() -> usize {
    2
}

/// 认知负荷规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognitiveLoadRules {
    /// 题干词数上下界
    pub word_bounds: Bounds,
    /// 决策点数量上下界
    pub decision_bounds: Bounds,
    /// 高 / 中 / 低密度占比
    pub density_mix: Distribution<CognitiveLoad>,
    /// 最多允许连续出现的高负荷题数
    #[serde(default = "default_max_consecutive_high")]
    pub max_consecutive_high: usize,
}

/// 搭配强度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStrength {
    /// 必须满足，违反即硬错误
    Mandatory,
    /// 强烈建议，违反只警告
    Strong,
}

/// 原型 → 结构形式 的搭配规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pairing {
    pub archetype: Archetype,
    pub forms: Vec<StructuralForm>,
    pub strength: PairingStrength,
}

impl Pairing {
    pub fn allows(&self, form: StructuralForm) -> bool {
        self.forms.contains(&form)
    }
}

/// 编译后的绝对禁止项
///
/// 正则在注册表加载时编译一次，之后只读
#[derive(Debug, Clone)]
pub struct Prohibitions {
    /// 禁用选项（原文，用于提示词逐字列出）
    pub banned_options: Vec<String>,
    /// 禁用题干措辞（原文 + 按整词匹配的正则）
    pub banned_stem_phrases: Vec<(String, Regex)>,
    /// 额外的禁用选项正则（原文 + 编译结果）
    pub option_patterns: Vec<(String, Regex)>,
    /// 额外的禁用题干正则
    pub stem_patterns: Vec<(String, Regex)>,
    /// 题干中禁止的引用来源措辞
    pub meta_reference_patterns: Vec<(String, Regex)>,
    /// 是否检查双重否定
    pub forbid_double_negatives: bool,
    /// 是否检查子集包含选项（"Both A and B"）
    pub forbid_subset_options: bool,
}

/// 难度预设 → 难度权重
pub type DifficultyPresets = BTreeMap<String, Distribution<Difficulty>>;

/// 出题协议
///
/// 由 [`crate::services::ProtocolRegistry`] 在启动时构建，之后不可变
#[derive(Debug, Clone)]
pub struct Protocol {
    pub id: String,
    pub exam: String,
    pub subject: String,
    pub archetypes: Distribution<Archetype>,
    pub structural_forms: Distribution<StructuralForm>,
    pub cognitive_load: CognitiveLoadRules,
    pub fidelity: Distribution<FidelityTag>,
    pub pairings: Vec<Pairing>,
    pub difficulty_presets: DifficultyPresets,
    pub prohibitions: Prohibitions,
}

impl Protocol {
    /// 查找某原型的搭配规则
    pub fn pairing_for(&self, archetype: Archetype) -> Option<&Pairing> {
        self.pairings.iter().find(|p| p.archetype == archetype)
    }

    pub fn key(&self) -> (String, String) {
        (self.exam.clone(), self.subject.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archetype_from_model_labels() {
        assert_eq!(
            Archetype::from_label("Integrative/Multi-concept"),
            Some(Archetype::Integrative)
        );
        assert_eq!(Archetype::from_label("multi-concept"), Some(Archetype::Integrative));
        assert_eq!(Archetype::from_label("Exception / Outlier"), Some(Archetype::Exception));
        assert_eq!(Archetype::from_label("RECALL"), Some(Archetype::Recall));
        assert_eq!(Archetype::from_label("creative"), None);
        assert_eq!(Archetype::from_label(""), None);
    }

    #[test]
    fn test_structural_form_from_model_labels() {
        assert_eq!(StructuralForm::from_label("Standard MCQ"), Some(StructuralForm::StandardMcq));
        assert_eq!(
            StructuralForm::from_label("Assertion-Reason"),
            Some(StructuralForm::AssertionReason)
        );
        assert_eq!(
            StructuralForm::from_label("multi_statement"),
            Some(StructuralForm::MultiStatement)
        );
        assert_eq!(
            StructuralForm::from_label("Match the following"),
            Some(StructuralForm::MatchTheFollowing)
        );
        assert_eq!(
            StructuralForm::from_label("Negative phrasing"),
            Some(StructuralForm::NegativePhrasing)
        );
    }

    #[test]
    fn test_load_and_fidelity_labels() {
        assert_eq!(CognitiveLoad::from_label("High-density"), Some(CognitiveLoad::High));
        assert_eq!(CognitiveLoad::from_label("low"), Some(CognitiveLoad::Low));
        assert_eq!(FidelityTag::from_label("NCERT verbatim"), None);
        assert_eq!(FidelityTag::from_label("Verbatim"), Some(FidelityTag::Verbatim));
        assert_eq!(Difficulty::from_label("Hard"), Some(Difficulty::Hard));
    }

    #[test]
    fn test_percent_range() {
        let range = PercentRange::new(20.0, 30.0);
        assert_eq!(range.midpoint(), 25.0);
        assert!(range.contains(20.0));
        assert!(range.contains(30.0));
        assert!(!range.contains(31.0));
    }
}
