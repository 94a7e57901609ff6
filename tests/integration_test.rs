use async_trait::async_trait;
use question_forge::error::GenerationError;
use question_forge::infrastructure::{
    FileStore, GenerationBoundary, GenerationOutput, MaterialSource, MemoryStore, QuestionStore,
};
use question_forge::models::unit::{DocumentHandle, ReferenceMaterial, UnitScope};
use question_forge::models::usage::TokenUsage;
use question_forge::models::{GenerationUnit, UnitStatus};
use question_forge::services::cost_ledger::UsageLedger;
use question_forge::services::ProtocolRegistry;
use question_forge::utils::logging;
use question_forge::workflow::{FlowSettings, RetryPolicy, UnitFlow};
use question_forge::Orchestrator;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

const PROTOCOLS: &str = include_str!("../config/protocols.toml");

/// 按题目主题决定成败的生成服务：主题在 `failing_topics` 中时总是网络失败
struct TopicBoundary {
    failing_topics: Vec<&'static str>,
    calls: AtomicUsize,
}

impl TopicBoundary {
    fn new(failing_topics: Vec<&'static str>) -> Self {
        Self {
            failing_topics,
            calls: AtomicUsize::new(0),
        }
    }
}

fn questions_json(n: usize) -> String {
    let letters = ["A", "B", "C", "D"];
    let loads = ["low", "medium", "high"];
    let questions: Vec<_> = (0..n)
        .map(|i| {
            json!({
                "question": format!("Which structure is responsible for function number {} in a typical eukaryotic cell?", i + 1),
                "options": ["A) Mitochondrion", "B) Ribosome", "C) Golgi apparatus", "D) Lysosome"],
                "answer": letters[i % 4],
                "archetype": "Recall",
                "structural_form": "Standard MCQ",
                "cognitive_load": loads[i % 3],
                "explanation": "Each organelle carries out a distinct function."
            })
        })
        .collect();
    format!("```json\n{}\n```", json!({ "questions": questions }))
}

#[async_trait]
impl GenerationBoundary for TopicBoundary {
    fn model_name(&self) -> &str {
        "gemini-3-pro-preview"
    }

    async fn upload(&self, material: &ReferenceMaterial) -> Result<DocumentHandle, GenerationError> {
        Ok(DocumentHandle {
            id: format!("doc-{}", material.title),
            title: material.title.clone(),
        })
    }

    async fn generate(
        &self,
        prompt: &str,
        _documents: &[DocumentHandle],
    ) -> Result<GenerationOutput, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_topics.iter().any(|t| prompt.contains(t)) {
            return Err(GenerationError::Transport {
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(GenerationOutput {
            raw_text: questions_json(25),
            usage: TokenUsage::new(1000, 500),
        })
    }
}

struct NotesMaterials;

#[async_trait]
impl MaterialSource for NotesMaterials {
    async fn materials_for(&self, unit: &GenerationUnit) -> anyhow::Result<Vec<ReferenceMaterial>> {
        Ok(vec![ReferenceMaterial {
            title: format!("{} notes", unit.topic),
            file_ref: format!("{}.txt", unit.id),
        }])
    }
}

fn unit(id: &str, topic: &str, target_count: usize) -> GenerationUnit {
    GenerationUnit {
        id: id.to_string(),
        exam: "NEET".to_string(),
        subject: "Biology".to_string(),
        scope: UnitScope {
            chapter: topic.to_string(),
            section: None,
        },
        topic: topic.to_string(),
        target_count,
        difficulty: "balanced".to_string(),
        status: UnitStatus::Pending,
    }
}

fn orchestrator(
    boundary: Arc<TopicBoundary>,
    store: Arc<dyn QuestionStore>,
    ledger: UsageLedger,
) -> Orchestrator {
    let registry = assert_ok!(ProtocolRegistry::from_toml_str(PROTOCOLS));
    let flow = UnitFlow::new(
        boundary,
        Arc::new(NotesMaterials),
        store.clone(),
        Arc::new(ledger),
        FlowSettings {
            retry: RetryPolicy::immediate(3),
            ..FlowSettings::default()
        },
    );
    Orchestrator::new(registry, store, flow, 2, 10)
}

#[tokio::test]
async fn test_failed_unit_does_not_abort_run() {
    logging::init(false);

    let store = Arc::new(MemoryStore::new(vec![
        unit("a", "Cell: The Unit of Life", 10),
        unit("b", "Plant Kingdom", 10),
        unit("c", "Biomolecules", 8),
    ]));
    let boundary = Arc::new(TopicBoundary::new(vec!["Plant Kingdom"]));
    let orch = orchestrator(boundary.clone(), store.clone(), UsageLedger::disabled());

    let run = assert_ok!(orch.run_all().await);

    // a: 10 × 1.5 = 15, c: 8 × 1.5 = 12；b 不计入
    assert_eq!(run.units_completed, 2);
    assert_eq!(run.units_failed, 1);
    assert_eq!(run.total_generated, 27);
    assert_eq!(run.status_of("a"), Some(UnitStatus::Completed));
    assert_eq!(run.status_of("b"), Some(UnitStatus::Failed));
    assert_eq!(run.status_of("c"), Some(UnitStatus::Completed));
    assert!(run.capped_warnings().len() <= 10);

    // b 的传输失败重试了 3 次
    assert_eq!(boundary.calls.load(Ordering::SeqCst), 1 + 3 + 1);

    let b = assert_ok!(store.unit("b").await);
    assert_eq!(b.status, UnitStatus::Failed);
    assert_eq!(
        assert_ok!(store.failure_reason("b").await).as_deref(),
        Some("TRANSPORT_ERROR")
    );
    assert_eq!(assert_ok!(store.persisted_count("b").await), 0);

    let orders: Vec<usize> = assert_ok!(store.questions("a").await)
        .iter()
        .map(|q| q.question_order)
        .collect();
    assert_eq!(orders, (1..=15).collect::<Vec<_>>());

    // 只有成功的两次调用计费
    assert_eq!(run.usage.prompt_tokens, 2000);
    assert!(run.cost.total > 0.0);
}

#[tokio::test]
async fn test_failed_unit_recovers_on_next_run() {
    let store = Arc::new(MemoryStore::new(vec![unit("b", "Plant Kingdom", 4)]));

    let failing = Arc::new(TopicBoundary::new(vec!["Plant Kingdom"]));
    let report = assert_ok!(
        orchestrator(failing, store.clone(), UsageLedger::disabled())
            .run_generation("b")
            .await
    );
    assert!(!report.success);
    assert!(report.failure_reason.is_some());

    let healthy = Arc::new(TopicBoundary::new(Vec::new()));
    let report = assert_ok!(
        orchestrator(healthy, store.clone(), UsageLedger::disabled())
            .run_generation("b")
            .await
    );
    assert!(report.success);
    assert_eq!(report.questions_generated, 6);
    assert_eq!(assert_ok!(store.unit("b").await).status, UnitStatus::Completed);
    assert_eq!(assert_ok!(store.failure_reason("b").await), None);
}

#[tokio::test]
async fn test_unknown_unit_is_error() {
    let store = Arc::new(MemoryStore::new(Vec::new()));
    let orch = orchestrator(
        Arc::new(TopicBoundary::new(Vec::new())),
        store,
        UsageLedger::disabled(),
    );
    assert_err!(orch.run_generation("missing").await);
}

#[tokio::test]
async fn test_file_store_resume_and_usage_ledger() {
    let dir = std::env::temp_dir().join(format!("qf-it-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let ledger_path = dir.join("usage_log.jsonl");

    {
        let store = Arc::new(assert_ok!(
            FileStore::open(&dir, vec![unit("a", "Cell: The Unit of Life", 4)]).await
        ));
        let boundary = Arc::new(TopicBoundary::new(Vec::new()));
        let orch = orchestrator(boundary, store, UsageLedger::new(&ledger_path));
        let report = assert_ok!(orch.run_generation("a").await);
        assert!(report.success);
        assert_eq!(report.questions_generated, 6);
    }

    // 重新打开：已完成的单元不会再次生成
    let store = Arc::new(assert_ok!(
        FileStore::open(&dir, vec![unit("a", "Cell: The Unit of Life", 4)]).await
    ));
    assert_eq!(assert_ok!(store.persisted_count("a").await), 6);
    let boundary = Arc::new(TopicBoundary::new(Vec::new()));
    let orch = orchestrator(boundary.clone(), store.clone(), UsageLedger::new(&ledger_path));
    let report = assert_ok!(orch.run_generation("a").await);
    assert!(report.success);
    assert_eq!(report.questions_generated, 0);
    assert_eq!(boundary.calls.load(Ordering::SeqCst), 0);

    let ledger = assert_ok!(std::fs::read_to_string(&ledger_path));
    let lines: Vec<_> = ledger.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: serde_json::Value = assert_ok!(serde_json::from_str(lines[0]));
    assert_eq!(record["unit_id"], "a");

    let _ = std::fs::remove_dir_all(&dir);
}
