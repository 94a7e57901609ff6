//! 文件存储 - 基础设施层
//!
//! 每个单元一个 TOML 文件（`<输出目录>/<单元 id>.toml`），
//! 每次写入都把该单元的完整记录落盘。

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{FileError, StoreError, StoreResult};
use crate::infrastructure::store::{QuestionStore, UnitRecord};
use crate::models::question::AcceptedQuestion;
use crate::models::unit::{GenerationUnit, UnitStatus};

/// 中断时的失败原因
const INTERRUPTED_REASON: &str = "INTERRUPTED";

pub struct FileStore {
    folder: PathBuf,
    records: HashMap<String, Mutex<UnitRecord>>,
}

impl FileStore {
    /// 打开输出目录
    ///
    /// 已有记录文件的单元沿用文件中的状态和题目；停留在 generating 的单元视为
    /// 上次运行被中断，标记为 failed 以便重新进入
    pub async fn open(
        folder: impl AsRef<Path>,
        units: impl IntoIterator<Item = GenerationUnit>,
    ) -> StoreResult<Self> {
        let folder = folder.as_ref().to_path_buf();
        fs::create_dir_all(&folder)
            .await
            .map_err(|source| FileError::WriteFailed {
                path: folder.display().to_string(),
                source,
            })?;

        let mut records = HashMap::new();
        for unit in units {
            let path = record_path(&folder, &unit.id);
            let mut record = if fs::try_exists(&path).await.unwrap_or(false) {
                read_record(&path).await?
            } else {
                UnitRecord::new(unit.clone())
            };

            if record.unit.status == UnitStatus::Generating {
                warn!(
                    "[单元 {}] ⚠️ 上次运行中断（已保存 {} 道题），标记为 failed",
                    unit.id,
                    record.questions.len()
                );
                record.unit.status = UnitStatus::Failed;
                record.failure_reason = Some(INTERRUPTED_REASON.to_string());
            }
            // 计划文件中的目标、难度等以最新计划为准，状态和题目以记录为准
            record.unit = GenerationUnit {
                status: record.unit.status,
                ..unit
            };
            write_record(&path, &record).await?;
            records.insert(record.unit.id.clone(), Mutex::new(record));
        }

        info!(
            "✓ 输出目录 {} 已就绪，共 {} 个单元",
            folder.display(),
            records.len()
        );
        Ok(Self { folder, records })
    }

    fn record(&self, unit_id: &str) -> StoreResult<&Mutex<UnitRecord>> {
        self.records
            .get(unit_id)
            .ok_or_else(|| StoreError::UnitNotFound {
                unit_id: unit_id.to_string(),
            })
    }

    /// 在单元锁内修改记录并落盘；落盘失败时内存记录保持不变
    async fn update<F>(&self, unit_id: &str, change: F) -> StoreResult<()>
    where
        F: FnOnce(&mut UnitRecord) -> StoreResult<()> + Send,
    {
        let mut guard = self.record(unit_id)?.lock().await;
        let mut next = guard.clone();
        change(&mut next)?;
        write_record(&record_path(&self.folder, unit_id), &next).await?;
        *guard = next;
        Ok(())
    }
}

fn record_path(folder: &Path, unit_id: &str) -> PathBuf {
    folder.join(format!("{}.toml", unit_id))
}

async fn read_record(path: &Path) -> StoreResult<UnitRecord> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|source| FileError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
    let record = toml::from_str(&content).map_err(|source| FileError::TomlParseFailed {
        path: path.display().to_string(),
        source,
    })?;
    Ok(record)
}

async fn write_record(path: &Path, record: &UnitRecord) -> StoreResult<()> {
    let content = toml::to_string(record).map_err(|source| FileError::TomlSerializeFailed {
        path: path.display().to_string(),
        source,
    })?;
    // 先写临时文件再改名，避免中断时留下半个文件
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, content)
        .await
        .map_err(|source| FileError::WriteFailed {
            path: tmp.display().to_string(),
            source,
        })?;
    fs::rename(&tmp, path)
        .await
        .map_err(|source| FileError::WriteFailed {
            path: path.display().to_string(),
            source,
        })?;
    Ok(())
}

#[async_trait]
impl QuestionStore for FileStore {
    async fn unit_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn unit(&self, unit_id: &str) -> StoreResult<GenerationUnit> {
        Ok(self.record(unit_id)?.lock().await.unit.clone())
    }

    async fn transition(&self, unit_id: &str, next: UnitStatus) -> StoreResult<()> {
        self.update(unit_id, |record| record.transition(next)).await
    }

    async fn mark_failed(&self, unit_id: &str, reason: &str) -> StoreResult<()> {
        let reason = reason.to_string();
        self.update(unit_id, move |record| {
            record.transition(UnitStatus::Failed)?;
            record.failure_reason = Some(reason);
            Ok(())
        })
        .await
    }

    async fn persisted_count(&self, unit_id: &str) -> StoreResult<usize> {
        Ok(self.record(unit_id)?.lock().await.questions.len())
    }

    async fn append_questions(
        &self,
        unit_id: &str,
        questions: &[AcceptedQuestion],
    ) -> StoreResult<()> {
        self.update(unit_id, |record| record.append(questions)).await
    }

    async fn questions(&self, unit_id: &str) -> StoreResult<Vec<AcceptedQuestion>> {
        Ok(self.record(unit_id)?.lock().await.questions.clone())
    }

    async fn failure_reason(&self, unit_id: &str) -> StoreResult<Option<String>> {
        Ok(self.record(unit_id)?.lock().await.failure_reason.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::fixtures::unit;
    use crate::models::protocol::CognitiveLoad;
    use crate::models::question::fixtures::recall;

    fn temp_folder(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "question_forge_store_{}_{}",
            name,
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let folder = temp_folder("reopen");
        let _ = fs::remove_dir_all(&folder).await;

        let store = FileStore::open(&folder, vec![unit("u1", 5)]).await.unwrap();
        store.transition("u1", UnitStatus::Generating).await.unwrap();
        store
            .append_questions(
                "u1",
                &[AcceptedQuestion {
                    unit_id: "u1".to_string(),
                    question_order: 1,
                    question: recall(CognitiveLoad::Low, "A"),
                }],
            )
            .await
            .unwrap();
        drop(store);

        // 停在 generating 的单元重新打开后为 failed，题目保留
        let store = FileStore::open(&folder, vec![unit("u1", 8)]).await.unwrap();
        let reopened = store.unit("u1").await.unwrap();
        assert_eq!(reopened.status, UnitStatus::Failed);
        assert_eq!(reopened.target_count, 8);
        assert_eq!(store.persisted_count("u1").await.unwrap(), 1);
        assert_eq!(
            store.failure_reason("u1").await.unwrap().as_deref(),
            Some(INTERRUPTED_REASON)
        );
        assert_eq!(
            store.questions("u1").await.unwrap()[0].question.correct_answer,
            "A"
        );

        let _ = fs::remove_dir_all(&folder).await;
    }

    #[tokio::test]
    async fn test_rejected_change_is_not_written() {
        let folder = temp_folder("reject");
        let _ = fs::remove_dir_all(&folder).await;

        let store = FileStore::open(&folder, vec![unit("u1", 5)]).await.unwrap();
        assert!(store.transition("u1", UnitStatus::Completed).await.is_err());
        let on_disk = read_record(&record_path(&folder, "u1")).await.unwrap();
        assert_eq!(on_disk.unit.status, UnitStatus::Pending);

        let _ = fs::remove_dir_all(&folder).await;
    }
}
