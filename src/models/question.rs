use serde::{Deserialize, Serialize};

use crate::models::protocol::{Archetype, CognitiveLoad, Difficulty, FidelityTag, StructuralForm};

/// 选项字母
pub const OPTION_LETTERS: [char; 8] = ['A', 'B', 'C', 'D', 'E', 'F', 'G', 'H'];

/// 经过归一化的候选题目
///
/// 只能由 [`crate::services::normalizer`] 从生成服务的输出中构建，
/// 持久化前必须经过校验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawQuestion {
    pub text: String,
    pub options: Vec<String>,
    /// 正确答案字母（"A"、"B"……）
    pub correct_answer: String,
    pub archetype: Archetype,
    pub structural_form: StructuralForm,
    pub cognitive_load: CognitiveLoad,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fidelity: Option<FidelityTag>,
    #[serde(default)]
    pub explanation: String,
}

impl RawQuestion {
    /// 正确答案对应的选项下标
    pub fn answer_index(&self) -> Option<usize> {
        let mut chars = self.correct_answer.chars();
        let letter = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        OPTION_LETTERS
            .iter()
            .position(|l| *l == letter)
            .filter(|idx| *idx < self.options.len())
    }

    /// 题干词数
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// 已通过校验、带有单元内序号的题目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedQuestion {
    pub unit_id: String,
    /// 单元内序号，从 1 开始严格递增
    pub question_order: usize,
    pub question: RawQuestion,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// 测试用题目构造器
    pub fn question(
        archetype: Archetype,
        form: StructuralForm,
        load: CognitiveLoad,
        answer: &str,
    ) -> RawQuestion {
        RawQuestion {
            text: "Which organelle is the site of aerobic respiration in eukaryotic cells?"
                .to_string(),
            options: vec![
                "Mitochondrion".to_string(),
                "Ribosome".to_string(),
                "Golgi apparatus".to_string(),
                "Lysosome".to_string(),
            ],
            correct_answer: answer.to_string(),
            archetype,
            structural_form: form,
            cognitive_load: load,
            difficulty: Some(Difficulty::Medium),
            fidelity: Some(FidelityTag::Adapted),
            explanation: "Krebs cycle and ETC occur in the mitochondrion.".to_string(),
        }
    }

    pub fn recall(load: CognitiveLoad, answer: &str) -> RawQuestion {
        question(Archetype::Recall, StructuralForm::StandardMcq, load, answer)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::recall;
    use super::*;

    #[test]
    fn test_answer_index() {
        let mut q = recall(CognitiveLoad::Low, "C");
        assert_eq!(q.answer_index(), Some(2));

        q.correct_answer = "E".to_string();
        assert_eq!(q.answer_index(), None);

        q.correct_answer = "AB".to_string();
        assert_eq!(q.answer_index(), None);
    }

    #[test]
    fn test_word_count() {
        let q = recall(CognitiveLoad::Low, "A");
        assert_eq!(q.word_count(), 11);
    }
}
