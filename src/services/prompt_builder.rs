//! 提示词构建 - 业务能力层
//!
//! 把协议 + 目标题数 + 主题转成一次生成调用的指令：
//! 精确的分类配额、逐字列出的禁止项、输出格式说明。

use std::collections::BTreeMap;
use std::fmt::{Display, Write};

use crate::error::ConfigError;
use crate::models::protocol::{
    Difficulty, Distribution, PairingStrength, PercentRange, Protocol,
};
use crate::services::quota::allocate_quotas;

/// 系统消息
pub const SYSTEM_PROMPT: &str = "You are a senior examination setter for competitive entrance exams. \
You write original, self-contained multiple-choice questions grounded strictly in the attached \
curriculum documents, and you follow quantitative blueprints exactly. \
You reply with a single JSON object and nothing else.";

/// 已解析的生成参数
///
/// 难度预设已经映射为协议中的难度权重
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub difficulty_preset: String,
    pub difficulty: Distribution<Difficulty>,
}

impl ResolvedConfig {
    /// 从协议的难度预设表解析
    pub fn resolve(protocol: &Protocol, preset: &str) -> Result<Self, ConfigError> {
        let difficulty = protocol
            .difficulty_presets
            .get(preset)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDifficultyPreset {
                protocol: protocol.id.clone(),
                preset: preset.to_string(),
            })?;
        Ok(Self {
            difficulty_preset: preset.to_string(),
            difficulty,
        })
    }
}

fn write_quota_block<K>(
    out: &mut String,
    title: &str,
    ranges: &BTreeMap<K, PercentRange>,
    n: usize,
) where
    K: Ord + Clone + Display,
{
    if ranges.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n## {} (exactly {} in total)", title, n);
    for (category, count) in allocate_quotas(ranges, n) {
        let _ = writeln!(out, "- {}: {}", category, count);
    }
}

/// 构建生成指令
///
/// # 参数
/// - `protocol`: 当前考试科目的协议
/// - `resolved`: 已解析的难度权重
/// - `topic`: 主题（章节名）
/// - `batch_target`: 本次调用要生成的题数
/// - `total_target`: 本单元总共要生成的题数
pub fn build_prompt(
    protocol: &Protocol,
    resolved: &ResolvedConfig,
    topic: &str,
    batch_target: usize,
    total_target: usize,
) -> String {
    let mut out = String::new();
    let rules = &protocol.cognitive_load;

    let _ = writeln!(
        out,
        "# Task\nWrite exactly {} multiple-choice questions for the {} {} exam on the topic \"{}\".",
        batch_target, protocol.exam, protocol.subject, topic
    );
    let _ = writeln!(
        out,
        "This call is part of a set of {} questions for this topic; make every question in this call distinct.",
        total_target
    );
    let _ = writeln!(
        out,
        "Base every question only on the attached reference documents."
    );

    write_quota_block(&mut out, "Archetype counts", &protocol.archetypes, batch_target);
    write_quota_block(
        &mut out,
        "Structural form counts",
        &protocol.structural_forms,
        batch_target,
    );
    write_quota_block(
        &mut out,
        "Cognitive load counts",
        &rules.density_mix,
        batch_target,
    );
    write_quota_block(
        &mut out,
        &format!("Difficulty counts ({} preset)", resolved.difficulty_preset),
        &resolved.difficulty,
        batch_target,
    );
    write_quota_block(
        &mut out,
        "NCERT fidelity counts",
        &protocol.fidelity,
        batch_target,
    );

    let _ = writeln!(out, "\n## Cognitive load rules");
    let _ = writeln!(
        out,
        "- Stems must be between {} and {} words.",
        rules.word_bounds.min, rules.word_bounds.max
    );
    let _ = writeln!(
        out,
        "- Each question requires between {} and {} decision steps.",
        rules.decision_bounds.min, rules.decision_bounds.max
    );
    let _ = writeln!(
        out,
        "- Never place more than {} high-load questions consecutively.",
        rules.max_consecutive_high
    );

    if !protocol.pairings.is_empty() {
        let _ = writeln!(out, "\n## Archetype / form pairings");
        for pairing in &protocol.pairings {
            let forms: Vec<&str> = pairing.forms.iter().map(|f| f.label()).collect();
            let strength = match pairing.strength {
                PairingStrength::Mandatory => "MUST",
                PairingStrength::Strong => "SHOULD",
            };
            let _ = writeln!(
                out,
                "- {} questions {} use: {}",
                pairing.archetype,
                strength,
                forms.join(" or ")
            );
        }
    }

    let prohibitions = &protocol.prohibitions;
    let _ = writeln!(out, "\n## Absolute prohibitions");
    for option in &prohibitions.banned_options {
        let _ = writeln!(out, "- Never use the option \"{}\"", option);
    }
    for (phrase, _) in &prohibitions.banned_stem_phrases {
        let _ = writeln!(out, "- Never use the word \"{}\" in a question stem", phrase);
    }
    for (pattern, _) in &prohibitions.option_patterns {
        let _ = writeln!(out, "- No option may match the pattern: {}", pattern);
    }
    for (pattern, _) in &prohibitions.stem_patterns {
        let _ = writeln!(out, "- No stem may match the pattern: {}", pattern);
    }
    if prohibitions.forbid_double_negatives {
        let _ = writeln!(out, "- No double negatives in a stem");
    }
    if prohibitions.forbid_subset_options {
        let _ = writeln!(
            out,
            "- No option may combine other options (e.g. \"Both A and B\")"
        );
    }
    let _ = writeln!(
        out,
        "- Never refer to the source (no \"according to the notes\", \"as per the provided material\", \"according to NCERT\"); state facts directly"
    );
    let _ = writeln!(
        out,
        "- Do not use the same correct option letter for more than 3 consecutive questions"
    );

    let _ = writeln!(out, "\n## Output format");
    let _ = writeln!(
        out,
        "Return one JSON object, no code fences, no commentary:\n{}",
        OUTPUT_SCHEMA
    );
    let _ = writeln!(
        out,
        "archetype ∈ [{}]; structural_form ∈ [{}]; cognitive_load ∈ [high, medium, low]; difficulty ∈ [easy, medium, hard]; fidelity ∈ [verbatim, adapted, paraphrased].",
        crate::models::protocol::Archetype::ALL
            .iter()
            .map(|a| a.label())
            .collect::<Vec<_>>()
            .join(", "),
        protocol
            .structural_forms
            .keys()
            .map(|f| f.label())
            .collect::<Vec<_>>()
            .join(", ")
    );

    out
}

const OUTPUT_SCHEMA: &str = r#"{
  "questions": [
    {
      "question_text": "...",
      "options": ["...", "...", "...", "..."],
      "correct_answer": "A",
      "archetype": "Recall",
      "structural_form": "Standard MCQ",
      "cognitive_load": "low",
      "difficulty": "easy",
      "fidelity": "verbatim",
      "explanation": "..."
    }
  ]
}"#;
