//! 单元编排器 - 编排层
//!
//! ## 职责
//!
//! 驱动单元状态机，并把多个单元的结果汇总为一次运行：
//!
//! ```text
//! pending ──▶ generating ──▶ completed
//!                  │
//!                  └────────▶ failed
//! completed / failed ──(regenerate / 续跑)──▶ generating
//! ```
//!
//! 1. **配置前置**：协议和难度预设在任何单元开始前解析，配置错误直接终止
//! 2. **失败隔离**：一个单元失败只记录原因，不中断也不回滚其他单元
//! 3. **有界并发**：Semaphore + tokio::spawn，单元之间没有共享的可变状态
//! 4. **断点续跑**：已完成的单元跳过；未完成的单元只补足差额，序号接在已保存的题目之后

use chrono::Local;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::AppResult;
use crate::infrastructure::QuestionStore;
use crate::models::protocol::Protocol;
use crate::models::run::{GenerationReport, GenerationRun, UnitOutcome};
use crate::models::unit::UnitStatus;
use crate::services::prompt_builder::ResolvedConfig;
use crate::services::protocol_registry::ProtocolRegistry;
use crate::services::validator::aggregate_distribution_warnings;
use crate::workflow::{UnitCtx, UnitFlow};

/// 生成目标的计算方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// 补足到目标题数；已完成的单元跳过
    Resume,
    /// 重新生成一整套，追加在已有题目之后
    Regenerate,
}

/// 准备好的单元任务
enum Job {
    Skip(String),
    Run(UnitCtx),
}

pub fn new_run_id() -> String {
    format!("run-{}", Local::now().format("%Y%m%d-%H%M%S-%3f"))
}

/// 单元编排器
pub struct Orchestrator {
    registry: ProtocolRegistry,
    store: Arc<dyn QuestionStore>,
    flow: Arc<UnitFlow>,
    max_concurrent_units: usize,
    warning_cap: usize,
}

impl Orchestrator {
    pub fn new(
        registry: ProtocolRegistry,
        store: Arc<dyn QuestionStore>,
        flow: UnitFlow,
        max_concurrent_units: usize,
        warning_cap: usize,
    ) -> Self {
        Self {
            registry,
            store,
            flow: Arc::new(flow),
            max_concurrent_units: max_concurrent_units.max(1),
            warning_cap,
        }
    }

    /// 为单个单元生成题目（补足到目标题数）
    pub async fn run_generation(&self, unit_id: &str) -> AppResult<GenerationReport> {
        self.run_single(unit_id, Mode::Resume).await
    }

    /// 重新生成：已完成或已失败的单元重新进入 generating，新题追加在已有序号之后
    pub async fn regenerate(&self, unit_id: &str) -> AppResult<GenerationReport> {
        self.run_single(unit_id, Mode::Regenerate).await
    }

    /// 处理存储中的全部单元
    pub async fn run_all(&self) -> AppResult<GenerationRun> {
        let unit_ids = self.store.unit_ids().await;
        self.run_units(&unit_ids).await
    }

    /// 处理一组单元
    ///
    /// 先为每个单元解析协议（配置错误直接返回），再有界并发地处理，
    /// 单元失败只体现在结果中。重复的 id 只处理第一次出现
    pub async fn run_units(&self, unit_ids: &[String]) -> AppResult<GenerationRun> {
        let run_id = new_run_id();
        let mut seen = BTreeSet::new();
        let unit_ids: Vec<&String> = unit_ids
            .iter()
            .filter(|id| {
                let first = seen.insert(id.as_str());
                if !first {
                    warn!("[{}] ⚠️ 单元 {} 重复出现，忽略", run_id, id);
                }
                first
            })
            .collect();
        info!("[{}] 📋 准备 {} 个单元...", run_id, unit_ids.len());

        let mut jobs = Vec::with_capacity(unit_ids.len());
        let mut protocols: BTreeMap<String, Arc<Protocol>> = BTreeMap::new();
        let mut unit_protocol: BTreeMap<String, String> = BTreeMap::new();
        for unit_id in unit_ids {
            let job = self.prepare(&run_id, unit_id, Mode::Resume).await?;
            if let Job::Run(ctx) = &job {
                unit_protocol.insert(ctx.unit.id.clone(), ctx.protocol.id.clone());
                protocols.insert(ctx.protocol.id.clone(), ctx.protocol.clone());
            }
            jobs.push(job);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_units));
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let unit_id = match &job {
                Job::Skip(id) => id.clone(),
                Job::Run(ctx) => ctx.unit.id.clone(),
            };
            let semaphore = semaphore.clone();
            let flow = self.flow.clone();
            let store = self.store.clone();

            let handle = tokio::spawn(async move {
                // 信号量从不关闭
                let _permit = semaphore.acquire_owned().await.ok();
                execute(flow, store, job).await
            });
            handles.push((unit_id, handle));
        }

        let (unit_ids, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        let results = join_all(handles).await;

        let mut run = GenerationRun::new(run_id, self.warning_cap);
        let mut counts_by_protocol: BTreeMap<String, UnitOutcome> = BTreeMap::new();
        for (unit_id, result) in unit_ids.into_iter().zip(results) {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("[单元 {}] 任务执行失败: {}", unit_id, e);
                    UnitOutcome {
                        status: Some(UnitStatus::Failed),
                        failure_code: Some("TASK_PANICKED".to_string()),
                        failure_reason: Some(e.to_string()),
                        ..UnitOutcome::new(unit_id)
                    }
                }
            };

            if outcome.is_completed() {
                if let Some(protocol_id) = unit_protocol.get(&outcome.unit_id) {
                    let totals = counts_by_protocol
                        .entry(protocol_id.clone())
                        .or_insert_with(|| UnitOutcome::new(protocol_id.clone()));
                    for (k, v) in &outcome.archetype_counts {
                        *totals.archetype_counts.entry(*k).or_default() += v;
                    }
                    for (k, v) in &outcome.form_counts {
                        *totals.form_counts.entry(*k).or_default() += v;
                    }
                }
            }
            run.absorb(outcome);
        }

        // ========== 运行级分布检查 ==========
        // 运行级警告排在单元警告之前，截断时不会被挤掉
        let run_warnings: Vec<_> = counts_by_protocol
            .iter()
            .filter_map(|(protocol_id, totals)| {
                protocols.get(protocol_id).map(|protocol| {
                    aggregate_distribution_warnings(
                        &totals.archetype_counts,
                        &totals.form_counts,
                        protocol,
                    )
                })
            })
            .flatten()
            .collect();
        run.all_warnings.splice(0..0, run_warnings);

        log_run_summary(&run);
        Ok(run)
    }

    async fn run_single(&self, unit_id: &str, mode: Mode) -> AppResult<GenerationReport> {
        let run_id = new_run_id();
        let job = self.prepare(&run_id, unit_id, mode).await?;
        let outcome = execute(self.flow.clone(), self.store.clone(), job).await;
        for warning in &outcome.warnings {
            warn!("[单元 {}] {}", unit_id, warning);
        }
        Ok(GenerationReport::from_outcome(&outcome, self.warning_cap))
    }

    /// 解析协议、难度预设和本次需要生成的题数
    async fn prepare(&self, run_id: &str, unit_id: &str, mode: Mode) -> AppResult<Job> {
        let unit = self.store.unit(unit_id).await?;
        let protocol = self.registry.lookup(&unit.exam, &unit.subject)?;
        let resolved = ResolvedConfig::resolve(&protocol, &unit.difficulty)?;

        if mode == Mode::Resume && unit.status == UnitStatus::Completed {
            info!("[单元 {}] ⏭️ 已完成，跳过", unit_id);
            return Ok(Job::Skip(unit_id.to_string()));
        }

        let persisted = self.store.persisted_count(unit_id).await?;
        let requested = match mode {
            Mode::Resume => unit.target_count.saturating_sub(persisted),
            Mode::Regenerate => unit.target_count,
        };
        if persisted > 0 {
            info!(
                "[单元 {}] 已保存 {} 道题，本次生成 {} 道",
                unit_id, persisted, requested
            );
        }

        Ok(Job::Run(UnitCtx::new(
            run_id, unit, protocol, resolved, requested,
        )))
    }
}

/// 执行一个单元：状态迁移 + 流程 + 结果汇总
///
/// 从不返回错误，失败记录在 outcome 中
async fn execute(flow: Arc<UnitFlow>, store: Arc<dyn QuestionStore>, job: Job) -> UnitOutcome {
    let mut ctx = match job {
        Job::Skip(unit_id) => {
            return UnitOutcome {
                status: Some(UnitStatus::Completed),
                ..UnitOutcome::new(unit_id)
            }
        }
        Job::Run(ctx) => ctx,
    };

    let started = Instant::now();
    let unit_id = ctx.unit.id.clone();
    let mut outcome = UnitOutcome::new(unit_id.clone());
    info!("{} 🚀 开始生成: {} ({})", ctx, ctx.unit.topic, ctx.unit.scope);

    // 进不了 generating 说明单元正被别处处理或状态不允许，不改动它的状态
    if let Err(e) = store.transition(&unit_id, UnitStatus::Generating).await {
        error!("{} ❌ 无法开始生成: {}", ctx, e);
        outcome.status = Some(UnitStatus::Failed);
        outcome.failure_code = Some("STORE_ERROR".to_string());
        outcome.failure_reason = Some(e.to_string());
        outcome.elapsed_ms = started.elapsed().as_millis();
        return outcome;
    }

    match flow.run(&mut ctx).await {
        Ok(output) => match store.transition(&unit_id, UnitStatus::Completed).await {
            Ok(()) => {
                outcome.status = Some(UnitStatus::Completed);
                outcome.count_accepted(&output.accepted);
                outcome.warnings = output.warnings;
                info!(
                    "{} ✅ 完成: 保存 {} 道题, 剔除 {} 道, 丢弃候选 {} 个, 警告 {} 条",
                    ctx,
                    outcome.questions_generated,
                    output.rejected_questions,
                    output.dropped_candidates,
                    outcome.warnings.len()
                );
            }
            Err(e) => {
                error!("{} ❌ 状态更新失败: {}", ctx, e);
                outcome.status = Some(UnitStatus::Failed);
                outcome.failure_code = Some("STORE_ERROR".to_string());
                outcome.failure_reason = Some(e.to_string());
            }
        },
        Err(e) => {
            error!("{} ❌ 单元失败 [{}]: {}", ctx, e.code(), e);
            if let crate::error::UnitError::ValidationRejected { errors } = &e {
                for issue in errors {
                    warn!("{}   {}", ctx, issue);
                }
            }
            if let Err(store_err) = store.mark_failed(&unit_id, e.code()).await {
                error!("{} ❌ 无法记录失败状态: {}", ctx, store_err);
            }
            outcome.status = Some(UnitStatus::Failed);
            outcome.failure_code = Some(e.code().to_string());
            outcome.failure_reason = Some(e.to_string());
        }
    }

    outcome.usage = ctx.usage;
    outcome.cost = ctx.cost;
    outcome.elapsed_ms = started.elapsed().as_millis();
    outcome
}

fn log_run_summary(run: &GenerationRun) {
    info!("\n{}", "─".repeat(60));
    info!(
        "[{}] ✓ 运行结束: 完成 {} 个单元, 失败 {} 个, 共生成 {} 道题",
        run.run_id, run.units_completed, run.units_failed, run.total_generated
    );
    info!(
        "[{}] 💰 tokens: {} (缓存 {}), 费用: ${:.4} / ₹{:.2}",
        run.run_id,
        run.usage.total(),
        run.usage.cached_tokens,
        run.cost.total,
        run.cost.local_currency_total
    );
    for (unit_id, reason) in &run.failures {
        warn!("[{}] ❌ 单元 {} 失败: {}", run.run_id, unit_id, reason);
    }
    for warning in &run.all_warnings {
        warn!("[{}] {}", run.run_id, warning);
    }
    info!("{}", "─".repeat(60));
}
