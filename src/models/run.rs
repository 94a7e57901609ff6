//! 一次生成运行的汇总数据

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::protocol::{Archetype, StructuralForm};
use crate::models::unit::UnitStatus;
use crate::models::usage::{CostBreakdown, TokenUsage};
use crate::models::validation::Issue;
use crate::models::question::AcceptedQuestion;

/// 单个单元的处理结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit_id: String,
    pub status: Option<UnitStatus>,
    pub questions_generated: usize,
    pub warnings: Vec<Issue>,
    /// 失败原因码（见 [`crate::error::UnitError::code`]）
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub elapsed_ms: u128,
    pub usage: TokenUsage,
    pub cost: CostBreakdown,
    pub archetype_counts: BTreeMap<Archetype, usize>,
    pub form_counts: BTreeMap<StructuralForm, usize>,
}

impl UnitOutcome {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            ..Default::default()
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == Some(UnitStatus::Completed)
    }

    /// 记录本单元接受的题目
    pub fn count_accepted(&mut self, accepted: &[AcceptedQuestion]) {
        self.questions_generated += accepted.len();
        for q in accepted {
            *self.archetype_counts.entry(q.question.archetype).or_default() += 1;
            *self.form_counts.entry(q.question.structural_form).or_default() += 1;
        }
    }
}

/// 单元耗时
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitTiming {
    pub unit_id: String,
    pub status: Option<UnitStatus>,
    pub elapsed_ms: u128,
}

/// 一次运行（跨多个单元）的汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRun {
    pub run_id: String,
    pub total_generated: usize,
    pub units_completed: usize,
    pub units_failed: usize,
    /// 全部警告（内部记录）
    pub all_warnings: Vec<Issue>,
    /// 对外返回时保留的警告条数上限
    pub warning_cap: usize,
    pub unit_timings: Vec<UnitTiming>,
    pub usage: TokenUsage,
    pub cost: CostBreakdown,
    pub archetype_counts: BTreeMap<Archetype, usize>,
    pub form_counts: BTreeMap<StructuralForm, usize>,
    pub failures: Vec<(String, String)>,
}

impl GenerationRun {
    pub fn new(run_id: impl Into<String>, warning_cap: usize) -> Self {
        Self {
            run_id: run_id.into(),
            total_generated: 0,
            units_completed: 0,
            units_failed: 0,
            all_warnings: Vec::new(),
            warning_cap,
            unit_timings: Vec::new(),
            usage: TokenUsage::default(),
            cost: CostBreakdown::default(),
            archetype_counts: BTreeMap::new(),
            form_counts: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    /// 合并一个单元的结果
    ///
    /// 失败单元的题目数不计入 total_generated
    pub fn absorb(&mut self, outcome: UnitOutcome) {
        self.unit_timings.push(UnitTiming {
            unit_id: outcome.unit_id.clone(),
            status: outcome.status,
            elapsed_ms: outcome.elapsed_ms,
        });
        self.usage += outcome.usage;
        self.cost += outcome.cost;
        let completed = outcome.is_completed();
        self.all_warnings.extend(outcome.warnings);

        if completed {
            self.units_completed += 1;
            self.total_generated += outcome.questions_generated;
            for (k, v) in outcome.archetype_counts {
                *self.archetype_counts.entry(k).or_default() += v;
            }
            for (k, v) in outcome.form_counts {
                *self.form_counts.entry(k).or_default() += v;
            }
        } else {
            self.units_failed += 1;
            self.failures.push((
                outcome.unit_id,
                outcome.failure_reason.unwrap_or_else(|| "unknown".to_string()),
            ));
        }
    }

    /// 截断后的警告列表
    pub fn capped_warnings(&self) -> Vec<Issue> {
        self.all_warnings.iter().take(self.warning_cap).cloned().collect()
    }

    pub fn status_of(&self, unit_id: &str) -> Option<UnitStatus> {
        self.unit_timings
            .iter()
            .find(|t| t.unit_id == unit_id)
            .and_then(|t| t.status)
    }
}

/// `run_generation` 的对外结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationReport {
    pub success: bool,
    pub questions_generated: usize,
    pub warnings: Vec<Issue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl GenerationReport {
    pub fn from_outcome(outcome: &UnitOutcome, warning_cap: usize) -> Self {
        Self {
            success: outcome.is_completed(),
            questions_generated: outcome.questions_generated,
            warnings: outcome.warnings.iter().take(warning_cap).cloned().collect(),
            failure_reason: outcome.failure_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::validation::ReasonCode;

    fn completed(id: &str, generated: usize) -> UnitOutcome {
        UnitOutcome {
            status: Some(UnitStatus::Completed),
            questions_generated: generated,
            ..UnitOutcome::new(id)
        }
    }

    #[test]
    fn test_run_excludes_failed_units_from_total() {
        let mut run = GenerationRun::new("run-1", 10);
        run.absorb(completed("a", 15));
        run.absorb(UnitOutcome {
            status: Some(UnitStatus::Failed),
            questions_generated: 0,
            failure_reason: Some("transport".to_string()),
            ..UnitOutcome::new("b")
        });
        run.absorb(completed("c", 12));

        assert_eq!(run.total_generated, 27);
        assert_eq!(run.units_completed, 2);
        assert_eq!(run.units_failed, 1);
        assert_eq!(run.status_of("b"), Some(UnitStatus::Failed));
        assert_eq!(run.failures, vec![("b".to_string(), "transport".to_string())]);
    }

    #[test]
    fn test_failed_unit_warnings_are_kept() {
        let mut run = GenerationRun::new("run-3", 10);
        run.absorb(UnitOutcome {
            status: Some(UnitStatus::Failed),
            failure_reason: Some("validation".to_string()),
            warnings: vec![Issue::question(ReasonCode::AnswerKeyRun, 0, "run")],
            ..UnitOutcome::new("a")
        });

        assert_eq!(run.units_failed, 1);
        assert_eq!(run.all_warnings.len(), 1);
        assert_eq!(run.failures[0].1, "validation");
    }

    #[test]
    fn test_warning_cap() {
        let mut run = GenerationRun::new("run-2", 10);
        let mut outcome = completed("a", 1);
        outcome.warnings = (0..25)
            .map(|i| Issue::question(ReasonCode::AnswerKeyRun, i, "run"))
            .collect();
        run.absorb(outcome);

        assert_eq!(run.all_warnings.len(), 25);
        assert_eq!(run.capped_warnings().len(), 10);
        assert_eq!(run.capped_warnings()[0].question_index, Some(0));
    }
}
