//! 题目持久化 - 基础设施层
//!
//! `QuestionStore` 以单元为粒度保存单元状态和已接受的题目。
//! 每个单元一把锁，不同单元的写入互不等待。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::models::question::AcceptedQuestion;
use crate::models::unit::{GenerationUnit, UnitStatus};

/// 一个单元的持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub unit: GenerationUnit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub questions: Vec<AcceptedQuestion>,
}

impl UnitRecord {
    pub fn new(unit: GenerationUnit) -> Self {
        Self {
            unit,
            failure_reason: None,
            questions: Vec::new(),
        }
    }

    /// 按状态机迁移
    pub fn transition(&mut self, next: UnitStatus) -> StoreResult<()> {
        let current = self.unit.status;
        if !current.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                unit_id: self.unit.id.clone(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.unit.status = next;
        if next == UnitStatus::Completed {
            self.failure_reason = None;
        }
        Ok(())
    }

    /// 追加题目；序号必须紧接在已有题目之后
    pub fn append(&mut self, questions: &[AcceptedQuestion]) -> StoreResult<()> {
        let mut expected = self.questions.len() + 1;
        for q in questions {
            if q.unit_id != self.unit.id || q.question_order != expected {
                return Err(StoreError::WriteFailed {
                    unit_id: self.unit.id.clone(),
                    message: format!(
                        "题目序号冲突: 期望 {}，实际 {} ({})",
                        expected, q.question_order, q.unit_id
                    ),
                });
            }
            expected += 1;
        }
        self.questions.extend_from_slice(questions);
        Ok(())
    }
}

/// 题目存储
#[async_trait]
pub trait QuestionStore: Send + Sync {
    /// 全部单元 id（按 id 排序）
    async fn unit_ids(&self) -> Vec<String>;

    async fn unit(&self, unit_id: &str) -> StoreResult<GenerationUnit>;

    /// 状态迁移，非法迁移返回 `InvalidTransition`
    async fn transition(&self, unit_id: &str, next: UnitStatus) -> StoreResult<()>;

    /// 迁移到 failed 并记录原因
    async fn mark_failed(&self, unit_id: &str, reason: &str) -> StoreResult<()>;

    /// 已持久化的题目数，是序号的唯一来源
    async fn persisted_count(&self, unit_id: &str) -> StoreResult<usize>;

    async fn append_questions(
        &self,
        unit_id: &str,
        questions: &[AcceptedQuestion],
    ) -> StoreResult<()>;

    async fn questions(&self, unit_id: &str) -> StoreResult<Vec<AcceptedQuestion>>;

    async fn failure_reason(&self, unit_id: &str) -> StoreResult<Option<String>>;
}

/// 内存存储
pub struct MemoryStore {
    records: HashMap<String, Mutex<UnitRecord>>,
}

impl MemoryStore {
    pub fn new(units: impl IntoIterator<Item = GenerationUnit>) -> Self {
        let records = units
            .into_iter()
            .map(|unit| (unit.id.clone(), Mutex::new(UnitRecord::new(unit))))
            .collect();
        Self { records }
    }

    fn record(&self, unit_id: &str) -> StoreResult<&Mutex<UnitRecord>> {
        self.records
            .get(unit_id)
            .ok_or_else(|| StoreError::UnitNotFound {
                unit_id: unit_id.to_string(),
            })
    }
}

#[async_trait]
impl QuestionStore for MemoryStore {
    async fn unit_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn unit(&self, unit_id: &str) -> StoreResult<GenerationUnit> {
        Ok(self.record(unit_id)?.lock().await.unit.clone())
    }

    async fn transition(&self, unit_id: &str, next: UnitStatus) -> StoreResult<()> {
        self.record(unit_id)?.lock().await.transition(next)
    }

    async fn mark_failed(&self, unit_id: &str, reason: &str) -> StoreResult<()> {
        let mut record = self.record(unit_id)?.lock().await;
        record.transition(UnitStatus::Failed)?;
        record.failure_reason = Some(reason.to_string());
        Ok(())
    }

    async fn persisted_count(&self, unit_id: &str) -> StoreResult<usize> {
        Ok(self.record(unit_id)?.lock().await.questions.len())
    }

    async fn append_questions(
        &self,
        unit_id: &str,
        questions: &[AcceptedQuestion],
    ) -> StoreResult<()> {
        self.record(unit_id)?.lock().await.append(questions)
    }

    async fn questions(&self, unit_id: &str) -> StoreResult<Vec<AcceptedQuestion>> {
        Ok(self.record(unit_id)?.lock().await.questions.clone())
    }

    async fn failure_reason(&self, unit_id: &str) -> StoreResult<Option<String>> {
        Ok(self.record(unit_id)?.lock().await.failure_reason.clone())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::models::unit::{GenerationUnit, UnitScope, UnitStatus};

    pub fn unit(id: &str, target_count: usize) -> GenerationUnit {
        GenerationUnit {
            id: id.to_string(),
            exam: "NEET".to_string(),
            subject: "Biology".to_string(),
            scope: UnitScope {
                chapter: format!("Chapter {}", id),
                section: None,
            },
            topic: "Cell: The Unit of Life".to_string(),
            target_count,
            difficulty: "balanced".to_string(),
            status: UnitStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::unit;
    use super::*;
    use crate::models::protocol::CognitiveLoad;
    use crate::models::question::fixtures::recall;

    fn accepted(unit_id: &str, order: usize) -> AcceptedQuestion {
        AcceptedQuestion {
            unit_id: unit_id.to_string(),
            question_order: order,
            question: recall(CognitiveLoad::Low, "A"),
        }
    }

    #[tokio::test]
    async fn test_transitions_follow_state_machine() {
        let store = MemoryStore::new(vec![unit("u1", 5)]);
        assert!(matches!(
            store.transition("u1", UnitStatus::Completed).await,
            Err(StoreError::InvalidTransition { .. })
        ));
        store.transition("u1", UnitStatus::Generating).await.unwrap();
        store.mark_failed("u1", "TRANSPORT_ERROR").await.unwrap();
        assert_eq!(store.unit("u1").await.unwrap().status, UnitStatus::Failed);
        assert_eq!(
            store.failure_reason("u1").await.unwrap().as_deref(),
            Some("TRANSPORT_ERROR")
        );

        store.transition("u1", UnitStatus::Generating).await.unwrap();
        store.transition("u1", UnitStatus::Completed).await.unwrap();
        assert_eq!(store.failure_reason("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_append_requires_contiguous_ordinals() {
        let store = MemoryStore::new(vec![unit("u1", 5)]);
        store
            .append_questions("u1", &[accepted("u1", 1), accepted("u1", 2)])
            .await
            .unwrap();
        assert_eq!(store.persisted_count("u1").await.unwrap(), 2);

        // 重复的序号被拒绝，已有数据不变
        let err = store.append_questions("u1", &[accepted("u1", 2)]).await;
        assert!(matches!(err, Err(StoreError::WriteFailed { .. })));
        assert_eq!(store.persisted_count("u1").await.unwrap(), 2);

        store.append_questions("u1", &[accepted("u1", 3)]).await.unwrap();
        assert_eq!(store.questions("u1").await.unwrap()[2].question_order, 3);
    }

    #[tokio::test]
    async fn test_unknown_unit() {
        let store = MemoryStore::new(Vec::new());
        assert!(matches!(
            store.unit("ghost").await,
            Err(StoreError::UnitNotFound { .. })
        ));
    }
}
