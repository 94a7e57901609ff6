//! 协议校验 - 业务能力层
//!
//! 对一批已归一化的题目按协议逐项检查：
//! - 硬错误（阻止持久化）：禁用选项、子集包含选项、禁用题干措辞、双重否定、
//!   高负荷连续、强制搭配、引用来源措辞、答案无效、选项不足
//! - 警告（照常持久化）：分布偏离、强搭配不符、同一答案字母连续过多、题干长度越界
//!
//! 高负荷连续错误作用于一段区间，属于批次级错误，其余硬错误均定位到单题。

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::LazyLock;

use crate::error::ConfigError;
use crate::models::protocol::{
    Archetype, CognitiveLoad, Distribution, PairingStrength, Protocol, Prohibitions,
    StructuralForm,
};
use crate::models::question::RawQuestion;
use crate::models::validation::{Issue, ReasonCode, ValidationResult};
use crate::services::protocol_registry::ProtocolRegistry;
use crate::services::quota::observed_percent;

/// 同一答案字母最多允许连续出现的次数
pub const MAX_SAME_ANSWER_RUN: usize = 3;

/// 否定词（用于双重否定检查）
const NEGATION_TOKENS: &[&str] = &["not", "never", "none", "cannot", "nor", "neither"];

/// "Both A and B are correct"、"A, B and C"、"(a) & (b) only" 之类的组合选项
static SUBSET_OPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    const LABEL: &str = r"\(?(?:[a-h]|i{1,3}|iv)\)?";
    Regex::new(&format!(
        r"(?i)^\s*(?:both\s+|only\s+)?{LABEL}(?:\s*(?:,\s*and|,|&|\band\b)\s*{LABEL})+(?:\s+(?:only|both|(?:are|is)\s+(?:both\s+|all\s+)?(?:correct|true|right)))?\s*\.?\s*$"
    ))
    .expect("valid regex")
});

fn normalize_option(text: &str) -> String {
    text.trim()
        .trim_end_matches('.')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn check_options(index: usize, q: &RawQuestion, prohibitions: &Prohibitions, errors: &mut Vec<Issue>) {
    if q.options.len() < 2 {
        errors.push(Issue::question(
            ReasonCode::InsufficientOptions,
            index,
            format!("只有 {} 个选项", q.options.len()),
        ));
    }
    if q.answer_index().is_none() {
        errors.push(Issue::question(
            ReasonCode::InvalidAnswerKey,
            index,
            format!("答案 '{}' 不对应任何选项", q.correct_answer),
        ));
    }

    for option in &q.options {
        let normalized = normalize_option(option);
        if let Some(banned) = prohibitions
            .banned_options
            .iter()
            .find(|b| normalize_option(b) == normalized)
        {
            errors.push(Issue::question(
                ReasonCode::BannedOption,
                index,
                format!("禁用选项 \"{}\"", banned),
            ));
        }
        for (pattern, re) in &prohibitions.option_patterns {
            if re.is_match(option) {
                errors.push(Issue::question(
                    ReasonCode::BannedOption,
                    index,
                    format!("选项 \"{}\" 命中禁用模式 {}", option, pattern),
                ));
            }
        }
        if prohibitions.forbid_subset_options && SUBSET_OPTION_RE.is_match(option) {
            errors.push(Issue::question(
                ReasonCode::SubsetInclusionOption,
                index,
                format!("组合选项 \"{}\"", option),
            ));
        }
    }
}

/// 一句话中否定词的个数
fn negation_count(sentence: &str) -> usize {
    sentence
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| NEGATION_TOKENS.contains(&w.as_str()) || w.ends_with("n't"))
        .count()
}

fn has_double_negative(text: &str) -> bool {
    text.split(|c| matches!(c, '.' | '?' | '!' | ';'))
        .any(|sentence| negation_count(sentence) >= 2)
}

fn check_stem(index: usize, q: &RawQuestion, prohibitions: &Prohibitions, errors: &mut Vec<Issue>) {
    for (phrase, re) in &prohibitions.banned_stem_phrases {
        if re.is_match(&q.text) {
            errors.push(Issue::question(
                ReasonCode::BannedStemPhrase,
                index,
                format!("题干含禁用措辞 \"{}\"", phrase),
            ));
        }
    }
    for (pattern, re) in &prohibitions.stem_patterns {
        if re.is_match(&q.text) {
            errors.push(Issue::question(
                ReasonCode::BannedStemPhrase,
                index,
                format!("题干命中禁用模式 {}", pattern),
            ));
        }
    }
    if prohibitions.forbid_double_negatives && has_double_negative(&q.text) {
        errors.push(Issue::question(
            ReasonCode::DoubleNegative,
            index,
            "题干含双重否定",
        ));
    }
    if let Some(found) = prohibitions
        .meta_reference_patterns
        .iter()
        .find_map(|(_, re)| re.find(&q.text))
    {
        errors.push(Issue::question(
            ReasonCode::MetaReference,
            index,
            format!("题干引用了来源: \"{}\"", found.as_str()),
        ));
    }
}

fn check_pairing(
    index: usize,
    q: &RawQuestion,
    protocol: &Protocol,
    errors: &mut Vec<Issue>,
    warnings: &mut Vec<Issue>,
) {
    let Some(pairing) = protocol.pairing_for(q.archetype) else {
        return;
    };
    if pairing.allows(q.structural_form) {
        return;
    }
    let expected: Vec<&str> = pairing.forms.iter().map(|f| f.label()).collect();
    let message = format!(
        "{} 题应使用 {}，实际为 {}",
        q.archetype,
        expected.join(" / "),
        q.structural_form
    );
    match pairing.strength {
        PairingStrength::Mandatory => {
            errors.push(Issue::question(ReasonCode::MandatoryPairing, index, message))
        }
        PairingStrength::Strong => {
            warnings.push(Issue::question(ReasonCode::StrongPairing, index, message))
        }
    }
}

/// 找出长度超过 `max` 的高负荷连续段（闭区间）
pub fn high_load_runs(questions: &[RawQuestion], max: usize) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for (idx, q) in questions.iter().enumerate() {
        match (q.cognitive_load == CognitiveLoad::High, start) {
            (true, None) => start = Some(idx),
            (false, Some(s)) => {
                if idx - s > max {
                    runs.push((s, idx - 1));
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        if questions.len() - s > max {
            runs.push((s, questions.len() - 1));
        }
    }
    runs
}

fn check_load_runs(questions: &[RawQuestion], max: usize, errors: &mut Vec<Issue>) {
    for (start, end) in high_load_runs(questions, max) {
        errors.push(Issue::range(
            ReasonCode::CognitiveLoadRun,
            start,
            end,
            format!(
                "连续 {} 道高负荷题（上限 {}）",
                end - start + 1,
                max
            ),
        ));
    }
}

fn check_answer_key_runs(questions: &[RawQuestion], warnings: &mut Vec<Issue>) {
    let mut start = 0;
    for idx in 1..=questions.len() {
        let same = idx < questions.len()
            && questions[idx].correct_answer == questions[start].correct_answer;
        if same {
            continue;
        }
        let len = idx - start;
        if len > MAX_SAME_ANSWER_RUN {
            warnings.push(Issue::range(
                ReasonCode::AnswerKeyRun,
                start,
                idx - 1,
                format!(
                    "答案 {} 连续出现 {} 次",
                    questions[start].correct_answer, len
                ),
            ));
        }
        start = idx;
    }
}

fn distribution_warnings<K>(
    code: ReasonCode,
    dimension: &str,
    counts: &BTreeMap<K, usize>,
    ranges: &Distribution<K>,
) -> Vec<Issue>
where
    K: Ord + Display,
{
    let total: usize = counts.values().sum();
    if total == 0 || ranges.is_empty() {
        return Vec::new();
    }

    let mut warnings = Vec::new();
    for (category, range) in ranges {
        let pct = observed_percent(counts.get(category).copied().unwrap_or(0), total);
        if !range.contains(pct) {
            warnings.push(Issue::batch(
                code,
                format!(
                    "{} {} 占比 {:.1}%，协议要求 {}",
                    dimension, category, pct, range
                ),
            ));
        }
    }
    for (category, count) in counts {
        if *count > 0 && !ranges.contains_key(category) {
            warnings.push(Issue::batch(
                code,
                format!("{} {} 不在协议范围内（{} 道）", dimension, category, count),
            ));
        }
    }
    warnings
}

fn batch_distribution_warnings(questions: &[RawQuestion], protocol: &Protocol) -> Vec<Issue> {
    let mut archetypes = BTreeMap::new();
    let mut forms = BTreeMap::new();
    let mut loads = BTreeMap::new();
    let mut fidelity = BTreeMap::new();
    for q in questions {
        *archetypes.entry(q.archetype).or_insert(0usize) += 1;
        *forms.entry(q.structural_form).or_insert(0usize) += 1;
        *loads.entry(q.cognitive_load).or_insert(0usize) += 1;
        if let Some(tag) = q.fidelity {
            *fidelity.entry(tag).or_insert(0usize) += 1;
        }
    }

    let mut warnings = distribution_warnings(
        ReasonCode::ArchetypeDistribution,
        "原型",
        &archetypes,
        &protocol.archetypes,
    );
    warnings.extend(distribution_warnings(
        ReasonCode::StructuralFormDistribution,
        "结构形式",
        &forms,
        &protocol.structural_forms,
    ));
    warnings.extend(distribution_warnings(
        ReasonCode::DensityDistribution,
        "认知负荷",
        &loads,
        &protocol.cognitive_load.density_mix,
    ));
    warnings.extend(distribution_warnings(
        ReasonCode::FidelityDistribution,
        "忠实度",
        &fidelity,
        &protocol.fidelity,
    ));
    warnings
}

/// 按协议校验一批题目
pub fn validate(questions: &[RawQuestion], protocol: &Protocol) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let word_bounds = protocol.cognitive_load.word_bounds;

    for (index, q) in questions.iter().enumerate() {
        check_options(index, q, &protocol.prohibitions, &mut errors);
        check_stem(index, q, &protocol.prohibitions, &mut errors);
        check_pairing(index, q, protocol, &mut errors, &mut warnings);

        let words = q.word_count();
        if !word_bounds.contains(words) {
            warnings.push(Issue::question(
                ReasonCode::StemLengthOutOfBounds,
                index,
                format!(
                    "题干 {} 词，要求 {}-{}",
                    words, word_bounds.min, word_bounds.max
                ),
            ));
        }
    }

    check_load_runs(
        questions,
        protocol.cognitive_load.max_consecutive_high,
        &mut errors,
    );
    check_answer_key_runs(questions, &mut warnings);
    warnings.extend(batch_distribution_warnings(questions, protocol));

    ValidationResult::from_issues(errors, warnings)
}

/// 按协议 id 校验
pub fn validate_by_id(
    registry: &ProtocolRegistry,
    questions: &[RawQuestion],
    protocol_id: &str,
) -> Result<ValidationResult, ConfigError> {
    let protocol = registry.get(protocol_id)?;
    Ok(validate(questions, &protocol))
}

/// 去掉会构成高负荷超长连续段的多余题目
///
/// 逐题剔除硬错误题目之后，原本被隔开的高负荷题可能连成一段。
/// `trailing_high` 是单元已保存题目末尾连续的高负荷题数，新题接在它们后面计数。
/// 每段只保留前 `max` 道，返回保留的题目和被剔除的题目数
pub fn enforce_load_runs(
    questions: Vec<RawQuestion>,
    max: usize,
    trailing_high: usize,
) -> (Vec<RawQuestion>, usize) {
    let mut kept = Vec::with_capacity(questions.len());
    let mut run = trailing_high;
    let mut trimmed = 0usize;
    for q in questions {
        if q.cognitive_load == CognitiveLoad::High {
            if run >= max {
                trimmed += 1;
                continue;
            }
            run += 1;
        } else {
            run = 0;
        }
        kept.push(q);
    }
    (kept, trimmed)
}

/// 末尾连续的高负荷题数
pub fn trailing_high_load<'a>(questions: impl DoubleEndedIterator<Item = &'a RawQuestion>) -> usize {
    questions
        .rev()
        .take_while(|q| q.cognitive_load == CognitiveLoad::High)
        .count()
}

/// 运行级分布检查
///
/// 单批题目太少，分布检查噪声大；运行结束后按协议汇总全部已接受题目再检查一次
pub fn aggregate_distribution_warnings(
    archetype_counts: &BTreeMap<Archetype, usize>,
    form_counts: &BTreeMap<StructuralForm, usize>,
    protocol: &Protocol,
) -> Vec<Issue> {
    let mut warnings = distribution_warnings(
        ReasonCode::RunArchetypeDistribution,
        &format!("[{}] 原型", protocol.id),
        archetype_counts,
        &protocol.archetypes,
    );
    warnings.extend(distribution_warnings(
        ReasonCode::RunStructuralFormDistribution,
        &format!("[{}] 结构形式", protocol.id),
        form_counts,
        &protocol.structural_forms,
    ));
    warnings
}
