//! 响应归一化 - 业务能力层
//!
//! 生成服务返回的文本一律视为不可信输入。修复流程固定为：
//! 1. 去掉代码围栏
//! 2. 截取第一个开始分隔符到最后一个匹配的结束分隔符，丢弃前后的说明文字
//! 3. 针对模型常见的 JSON 问题做修复：字符串内未转义的控制字符、
//!    截断导致的未闭合字符串 / 括号、结束分隔符前的多余逗号
//! 4. 结构化解析
//!
//! 任何阶段失败都返回诊断信息（长度、首尾片段、出错偏移），不向上抛出底层解析异常。

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::fmt::Write;
use tracing::{debug, warn};

use crate::models::protocol::{Archetype, CognitiveLoad, Difficulty, FidelityTag, StructuralForm};
use crate::models::question::{RawQuestion, OPTION_LETTERS};

/// 诊断信息中保留的首尾字符数
pub const DIAGNOSTIC_PREVIEW_CHARS: usize = 200;

/// 失败所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeStage {
    /// 找不到任何 JSON 结构
    NoStructure,
    /// 修复后仍无法解析
    Parse,
    /// 解析成功但没有题目列表
    MissingQuestions,
    /// 题目列表为空
    EmptyQuestions,
    /// 所有候选题目都无法识别
    NoUsableQuestions,
}

impl fmt::Display for NormalizeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NormalizeStage::NoStructure => "no_structure",
            NormalizeStage::Parse => "parse",
            NormalizeStage::MissingQuestions => "missing_questions",
            NormalizeStage::EmptyQuestions => "empty_questions",
            NormalizeStage::NoUsableQuestions => "no_usable_questions",
        };
        f.write_str(s)
    }
}

/// 归一化失败的诊断信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizationFailure {
    pub stage: NormalizeStage,
    /// 原始响应长度（字符数）
    pub response_len: usize,
    pub head: String,
    pub tail: String,
    /// 修复后文本中的出错位置（字符偏移）
    pub error_offset: Option<usize>,
    pub detail: String,
}

impl NormalizationFailure {
    fn new(raw: &str, stage: NormalizeStage, detail: impl Into<String>) -> Self {
        let chars: Vec<char> = raw.chars().collect();
        let head: String = chars.iter().take(DIAGNOSTIC_PREVIEW_CHARS).collect();
        let tail_start = chars.len().saturating_sub(DIAGNOSTIC_PREVIEW_CHARS);
        let tail: String = chars[tail_start..].iter().collect();
        Self {
            stage,
            response_len: chars.len(),
            head,
            tail,
            error_offset: None,
            detail: detail.into(),
        }
    }

    fn with_offset(mut self, offset: usize) -> Self {
        self.error_offset = Some(offset);
        self
    }
}

impl fmt::Display for NormalizationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (响应长度 {}",
            self.stage, self.detail, self.response_len
        )?;
        if let Some(offset) = self.error_offset {
            write!(f, ", 出错偏移 {}", offset)?;
        }
        write!(f, ")")
    }
}

/// 归一化结果
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub questions: Vec<RawQuestion>,
    /// 被丢弃的候选题目及原因
    pub dropped: Vec<String>,
}

// ========== 修复步骤 ==========

/// 步骤 1：去掉代码围栏
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    // 跳过语言标记（```json）
    let body = trimmed[start + 3..].trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    match body.rfind("```") {
        Some(end) => &body[..end],
        None => body,
    }
}

/// 步骤 2：截取结构化内容
///
/// 返回候选片段：先是"第一个开始符 → 最后一个同类结束符"，
/// 再是"第一个开始符 → 与之配对的结束符"（两者不同时）
fn extract_structures(text: &str) -> Vec<&str> {
    let Some(start) = text.find(|c| c == '{' || c == '[') else {
        return Vec::new();
    };
    let opener = text[start..].chars().next().unwrap_or('{');
    let closer = if opener == '{' { '}' } else { ']' };

    let mut candidates = Vec::new();
    match text.rfind(closer) {
        Some(end) if end > start => candidates.push(&text[start..=end]),
        _ => candidates.push(&text[start..]),
    }

    if let Some(end) = balanced_end(&text[start..]) {
        let balanced = &text[start..start + end + 1];
        if !candidates.contains(&balanced) {
            candidates.push(balanced);
        }
    }
    candidates
}

/// 与开头分隔符配对的结束位置（字节偏移）
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// 转义字符串字面量内部的控制字符
pub fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = false;
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// 尽力闭合被截断的字符串和括号
pub fn close_truncated(text: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = text.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    if stack.is_empty() {
        return out;
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// 去掉结束分隔符前的多余逗号
pub fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &ch) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        }
        if ch == ',' {
            let next = chars[idx + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, None | Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

fn char_offset(text: &str, line: usize, column: usize) -> usize {
    let before: usize = text
        .split('\n')
        .take(line.saturating_sub(1))
        .map(|l| l.chars().count() + 1)
        .sum();
    before + column.saturating_sub(1)
}

fn repair_candidate(candidate: &str) -> String {
    let escaped = escape_control_chars(candidate);
    let closed = close_truncated(&escaped);
    remove_trailing_commas(&closed)
}

/// 修复并解析为 JSON
pub fn repair_json(raw: &str) -> Result<Value, NormalizationFailure> {
    let unfenced = strip_code_fences(raw);
    let candidates = extract_structures(unfenced);
    if candidates.is_empty() {
        return Err(NormalizationFailure::new(
            raw,
            NormalizeStage::NoStructure,
            "响应中没有 JSON 对象或数组",
        ));
    }

    let mut first_failure = None;
    for candidate in candidates {
        let repaired = repair_candidate(candidate);
        match serde_json::from_str::<Value>(&repaired) {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!("候选片段解析失败: {}", e);
                if first_failure.is_none() {
                    let offset = char_offset(&repaired, e.line(), e.column());
                    first_failure = Some(
                        NormalizationFailure::new(raw, NormalizeStage::Parse, e.to_string())
                            .with_offset(offset),
                    );
                }
            }
        }
    }

    Err(first_failure.unwrap_or_else(|| {
        NormalizationFailure::new(raw, NormalizeStage::Parse, "无法解析")
    }))
}

// ========== 候选题目转换 ==========

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| obj.get(*n)).filter(|v| !v.is_null())
}

fn text_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    field(obj, names).and_then(|v| match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// 去掉选项前的标号："(a) ", "B) ", "C. "
fn strip_option_label(text: &str) -> &str {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('(').unwrap_or(trimmed);
    let mut chars = rest.char_indices();
    let (Some((_, label)), Some((_, sep)), Some((ws_idx, ws))) =
        (chars.next(), chars.next(), chars.next())
    else {
        return trimmed;
    };
    let is_label = matches!(label.to_ascii_uppercase(), 'A'..='H') || matches!(label, '1'..='8');
    if !(is_label && matches!(sep, ')' | '.' | ':') && ws.is_whitespace()) {
        return trimmed;
    }
    let body = rest[ws_idx..].trim_start();
    // "A. thaliana"、"E. coli" 是缩写学名，不是选项标号
    if sep == '.' && body.starts_with(|c: char| c.is_lowercase()) {
        return trimmed;
    }
    body
}

fn parse_options(value: &Value) -> Option<Vec<String>> {
    let options: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| strip_option_label(s).to_string())
            .collect(),
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));
            entries
                .into_iter()
                .filter_map(|(_, v)| v.as_str())
                .map(|s| strip_option_label(s).to_string())
                .collect()
        }
        _ => return None,
    };
    if options.is_empty() {
        None
    } else {
        Some(options)
    }
}

/// 把各种写法的答案统一成选项字母
fn normalize_answer(raw: &str, options: &[String]) -> String {
    let trimmed = raw.trim();
    let lowered = trimmed.to_lowercase();
    let core = lowered
        .strip_prefix("option")
        .unwrap_or(&lowered)
        .trim()
        .trim_matches(|c: char| c == '(' || c == ')' || c == '.' || c == ':')
        .trim();

    let mut chars = core.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        let upper = c.to_ascii_uppercase();
        if OPTION_LETTERS.contains(&upper) {
            return upper.to_string();
        }
        if let Some(digit) = c.to_digit(10) {
            if (1..=OPTION_LETTERS.len() as u32).contains(&digit) {
                return OPTION_LETTERS[digit as usize - 1].to_string();
            }
        }
    }

    let stripped = strip_option_label(trimmed);
    if let Some(idx) = options
        .iter()
        .position(|o| o.eq_ignore_ascii_case(stripped))
        .filter(|idx| *idx < OPTION_LETTERS.len())
    {
        return OPTION_LETTERS[idx].to_string();
    }

    trimmed.to_string()
}

fn convert_candidate(value: &Value) -> Result<RawQuestion, String> {
    let obj = value.as_object().ok_or("不是 JSON 对象")?;

    let text = text_field(obj, &["question_text", "question", "stem", "text"])
        .filter(|t| !t.is_empty())
        .ok_or("缺少题干")?;
    let options = field(obj, &["options", "choices"])
        .and_then(parse_options)
        .ok_or("缺少选项")?;
    let answer = text_field(obj, &["correct_answer", "answer", "correct_option"])
        .ok_or("缺少答案")?;

    let archetype_label = text_field(obj, &["archetype", "question_archetype"]).unwrap_or_default();
    let archetype = Archetype::from_label(&archetype_label)
        .ok_or_else(|| format!("无法识别的原型 '{}'", archetype_label))?;

    let form_label =
        text_field(obj, &["structural_form", "form", "format", "question_type"]).unwrap_or_default();
    let structural_form = StructuralForm::from_label(&form_label)
        .ok_or_else(|| format!("无法识别的结构形式 '{}'", form_label))?;

    let load_label = text_field(obj, &["cognitive_load", "density", "load"]).unwrap_or_default();
    let cognitive_load = CognitiveLoad::from_label(&load_label)
        .ok_or_else(|| format!("无法识别的认知负荷 '{}'", load_label))?;

    let difficulty = text_field(obj, &["difficulty"]).and_then(|d| Difficulty::from_label(&d));
    let fidelity = text_field(obj, &["fidelity", "ncert_fidelity", "fidelity_tag"])
        .and_then(|f| FidelityTag::from_label(&f));
    let explanation = text_field(obj, &["explanation", "rationale"]).unwrap_or_default();

    Ok(RawQuestion {
        correct_answer: normalize_answer(&answer, &options),
        text,
        options,
        archetype,
        structural_form,
        cognitive_load,
        difficulty,
        fidelity,
        explanation,
    })
}

/// 归一化：原始文本 → 类型化题目批次
pub fn normalize(raw: &str) -> Result<NormalizedBatch, NormalizationFailure> {
    let value = repair_json(raw)?;

    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("questions") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(NormalizationFailure::new(
                    raw,
                    NormalizeStage::MissingQuestions,
                    "缺少 questions 列表",
                ))
            }
        },
        _ => {
            return Err(NormalizationFailure::new(
                raw,
                NormalizeStage::MissingQuestions,
                "顶层既不是对象也不是数组",
            ))
        }
    };

    if items.is_empty() {
        return Err(NormalizationFailure::new(
            raw,
            NormalizeStage::EmptyQuestions,
            "questions 列表为空",
        ));
    }

    let mut questions = Vec::with_capacity(items.len());
    let mut dropped = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        match convert_candidate(item) {
            Ok(q) => questions.push(q),
            Err(reason) => {
                warn!("丢弃第 {} 个候选题目: {}", idx, reason);
                dropped.push(format!("第 {} 个候选题目: {}", idx, reason));
            }
        }
    }

    if questions.is_empty() {
        return Err(NormalizationFailure::new(
            raw,
            NormalizeStage::NoUsableQuestions,
            format!("{} 个候选题目全部无法识别", items.len()),
        ));
    }

    Ok(NormalizedBatch { questions, dropped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn well_formed() -> Value {
        json!({
            "questions": [
                {
                    "question_text": "Which organelle is known as the powerhouse of the cell?\nChoose one.",
                    "options": ["Mitochondrion", "Ribosome", "Nucleus", "Vacuole"],
                    "correct_answer": "A",
                    "archetype": "Recall",
                    "structural_form": "Standard MCQ",
                    "cognitive_load": "low",
                    "difficulty": "easy",
                    "fidelity": "verbatim",
                    "explanation": "ATP synthesis."
                }
            ]
        })
    }

    #[test]
    fn test_round_trip_with_fence_trailing_comma_and_raw_newline() {
        let original = well_formed();
        let pretty = serde_json::to_string_pretty(&original).unwrap();
        // 注入一个多余逗号和一个字符串内的真实换行
        let damaged = pretty
            .replace("\"Vacuole\"", "\"Vacuole\",")
            .replace("cell?\\nChoose", "cell?\nChoose");
        assert!(serde_json::from_str::<Value>(&damaged).is_err());

        let raw = format!("Here are your questions:\n```json\n{}\n```\nGood luck!", damaged);
        let repaired = repair_json(&raw).unwrap();
        assert_eq!(repaired, original);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```").trim(), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
        // 截断：没有结束围栏
        assert_eq!(strip_code_fences("```json\n{\"a\":1").trim(), "{\"a\":1");
    }

    #[test]
    fn test_discards_surrounding_prose() {
        let raw = "Sure! {\"questions\": []} Let me know if you need {more}.";
        let value = repair_json(raw).unwrap();
        assert_eq!(value, json!({"questions": []}));
    }

    #[test]
    fn test_closes_truncated_output() {
        let raw = r#"{"questions": [{"question_text": "What is ATP?", "options": ["a", "b"], "explanation": "Adenosine tri"#;
        let value = repair_json(raw).unwrap();
        assert_eq!(value["questions"][0]["question_text"], "What is ATP?");

        let closed = close_truncated(r#"{"a": [1, 2, {"b":"#);
        assert_eq!(closed, r#"{"a": [1, 2, {"b": null}]}"#);
    }

    #[test]
    fn test_escape_control_chars_only_inside_strings() {
        let input = "{\n\"a\": \"x\ty\"\n}";
        assert_eq!(escape_control_chars(input), "{\n\"a\": \"x\\ty\"\n}");
    }

    #[test]
    fn test_remove_trailing_commas_respects_strings() {
        assert_eq!(remove_trailing_commas("[1, 2, ]"), "[1, 2 ]");
        assert_eq!(remove_trailing_commas("{\"a\": \",}\",}"), "{\"a\": \",}\"}");
    }

    #[test]
    fn test_parse_failure_diagnostic() {
        let raw = format!("{{\"questions\": [{{\"a\" 1}}]}}{}", "x".repeat(500));
        let failure = repair_json(&raw).unwrap_err();
        assert_eq!(failure.stage, NormalizeStage::Parse);
        assert_eq!(failure.response_len, raw.chars().count());
        assert_eq!(failure.head.chars().count(), DIAGNOSTIC_PREVIEW_CHARS);
        assert_eq!(failure.tail, "x".repeat(DIAGNOSTIC_PREVIEW_CHARS));
        assert!(failure.error_offset.is_some());
    }

    #[test]
    fn test_no_structure() {
        let failure = repair_json("I cannot help with that.").unwrap_err();
        assert_eq!(failure.stage, NormalizeStage::NoStructure);
        assert_eq!(failure.error_offset, None);
    }

    #[test]
    fn test_empty_or_missing_question_list_is_failure() {
        let failure = normalize("{\"questions\": []}").unwrap_err();
        assert_eq!(failure.stage, NormalizeStage::EmptyQuestions);

        let failure = normalize("{\"items\": [1]}").unwrap_err();
        assert_eq!(failure.stage, NormalizeStage::MissingQuestions);
    }

    #[test]
    fn test_normalize_converts_labels_and_answers() {
        let raw = r#"```json
{"questions": [
  {"question": "Assertion (A): Mitochondria have their own DNA. Reason (R): They arose by endosymbiosis.",
   "options": {"B": "(b) A is true, R is false", "A": "(a) Both A and R are true and R explains A", "C": "(c) A is false", "D": "(d) Both false"},
   "answer": "(a)",
   "archetype": "Integrative/Multi-concept",
   "structural_form": "Assertion-Reason",
   "cognitive_load": "High-density",
   "difficulty": "Hard",
   "fidelity": "Adapted"},
  {"question_text": "Unknown", "options": ["x", "y"], "correct_answer": "A",
   "archetype": "Creative", "structural_form": "Standard MCQ", "cognitive_load": "low"},
]}
```"#;
        let batch = normalize(raw).unwrap();
        assert_eq!(batch.questions.len(), 1);
        assert_eq!(batch.dropped.len(), 1);

        let q = &batch.questions[0];
        assert_eq!(q.archetype, Archetype::Integrative);
        assert_eq!(q.structural_form, StructuralForm::AssertionReason);
        assert_eq!(q.cognitive_load, CognitiveLoad::High);
        assert_eq!(q.difficulty, Some(Difficulty::Hard));
        assert_eq!(q.fidelity, Some(FidelityTag::Adapted));
        assert_eq!(q.correct_answer, "A");
        assert_eq!(q.options[0], "Both A and R are true and R explains A");
        assert_eq!(q.options.len(), 4);
    }

    #[test]
    fn test_all_candidates_unusable() {
        let raw = r#"[{"question_text": "x"}]"#;
        let failure = normalize(raw).unwrap_err();
        assert_eq!(failure.stage, NormalizeStage::NoUsableQuestions);
    }

    #[test]
    fn test_normalize_answer_variants() {
        let options: Vec<String> = ["Golgi", "Ribosome"].iter().map(|s| s.to_string()).collect();
        assert_eq!(normalize_answer("b", &options), "B");
        assert_eq!(normalize_answer("Option B", &options), "B");
        assert_eq!(normalize_answer("2", &options), "B");
        assert_eq!(normalize_answer("ribosome", &options), "B");
        assert_eq!(normalize_answer("Lysosome", &options), "Lysosome");
    }

    #[test]
    fn test_strip_option_label() {
        assert_eq!(strip_option_label("(a) Mitochondria"), "Mitochondria");
        assert_eq!(strip_option_label("B) Ribosome"), "Ribosome");
        assert_eq!(strip_option_label("C. Golgi"), "Golgi");
        assert_eq!(strip_option_label("A. thaliana"), "A. thaliana");
        assert_eq!(strip_option_label("E. coli"), "E. coli");
        assert_eq!(strip_option_label("(b) thylakoid"), "thylakoid");
        assert_eq!(strip_option_label("D. Lysosome"), "Lysosome");
        assert_eq!(strip_option_label("Both"), "Both");
        assert_eq!(strip_option_label("(unclosed"), "(unclosed");
    }
}
