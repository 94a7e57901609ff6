//! 单元处理流程 - 流程层
//!
//! 核心职责：定义"一个生成单元"的完整处理流程
//!
//! 流程顺序：
//! 1. 获取参考材料 → 逐个上传（失败跳过，全部失败则单元失败）
//! 2. 计算超额生成目标，按单次调用上限拆分
//! 3. 每次调用：构建提示词 → 生成（仅传输类失败重试）→ 归一化 → 校验
//! 4. 剔除有硬错误的题目，按单元序号持久化，记账

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{GenerationError, UnitError};
use crate::infrastructure::{GenerationBoundary, GenerationOutput, MaterialSource, QuestionStore};
use crate::models::question::{AcceptedQuestion, RawQuestion};
use crate::models::unit::DocumentHandle;
use crate::models::usage::PricingMode;
use crate::models::validation::{Issue, ReasonCode};
use crate::services::cost_ledger::{usage_record, UsageLedger};
use crate::services::normalizer::normalize;
use crate::services::prompt_builder::build_prompt;
use crate::services::validator::{enforce_load_runs, trailing_high_load, validate};
use crate::utils::logging::truncate_text;
use crate::workflow::retry::{over_generation_target, split_into_calls, RetryPolicy};
use crate::workflow::unit_ctx::UnitCtx;

/// 流程参数
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub over_generation_factor: f64,
    pub max_questions_per_call: usize,
    pub retry: RetryPolicy,
    pub pricing_mode: PricingMode,
    pub usd_to_local_rate: f64,
    pub verbose_logging: bool,
}

impl FlowSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            over_generation_factor: config.over_generation_factor,
            max_questions_per_call: config.max_questions_per_call,
            retry: config.retry_policy(),
            pricing_mode: config.pricing_mode,
            usd_to_local_rate: config.usd_to_local_rate,
            verbose_logging: config.verbose_logging,
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// 单元处理结果
#[derive(Debug, Clone, Default)]
pub struct UnitFlowOutput {
    pub accepted: Vec<AcceptedQuestion>,
    pub warnings: Vec<Issue>,
    /// 归一化阶段丢弃的候选题目数
    pub dropped_candidates: usize,
    /// 因硬错误或高负荷连续被剔除的题目数
    pub rejected_questions: usize,
}

/// 单元处理流程
///
/// - 编排一个单元从材料到持久化的完整流程
/// - 不持有单元状态，状态迁移由编排层负责
/// - 通过 trait 依赖基础设施
pub struct UnitFlow {
    boundary: Arc<dyn GenerationBoundary>,
    materials: Arc<dyn MaterialSource>,
    store: Arc<dyn QuestionStore>,
    ledger: Arc<UsageLedger>,
    settings: FlowSettings,
}

impl UnitFlow {
    pub fn new(
        boundary: Arc<dyn GenerationBoundary>,
        materials: Arc<dyn MaterialSource>,
        store: Arc<dyn QuestionStore>,
        ledger: Arc<UsageLedger>,
        settings: FlowSettings,
    ) -> Self {
        Self {
            boundary,
            materials,
            store,
            ledger,
            settings,
        }
    }

    pub async fn run(&self, ctx: &mut UnitCtx) -> Result<UnitFlowOutput, UnitError> {
        let mut output = UnitFlowOutput::default();
        if ctx.requested == 0 {
            info!("{} ✓ 已达到目标题数，无需生成", ctx);
            return Ok(output);
        }

        // ========== 步骤 1: 参考材料 ==========
        let documents = self.upload_materials(ctx).await?;

        // ========== 步骤 2: 生成规划 ==========
        let over_target = over_generation_target(ctx.requested, self.settings.over_generation_factor);
        let calls = split_into_calls(over_target, self.settings.max_questions_per_call);
        info!(
            "{} 📋 需要 {} 道，超额生成 {} 道，分 {} 次调用",
            ctx,
            ctx.requested,
            over_target,
            calls.len()
        );

        // ========== 步骤 3: 逐次生成 ==========
        for (call_index, batch_target) in calls.into_iter().enumerate() {
            info!(
                "{} 🤖 第 {} 次调用，请求 {} 道题...",
                ctx,
                call_index + 1,
                batch_target
            );
            let accepted = self
                .generate_batch(ctx, &documents, batch_target, over_target, &mut output)
                .await?;
            info!(
                "{} ✓ 第 {} 次调用完成，保存 {} 道题",
                ctx,
                call_index + 1,
                accepted.len()
            );
            output.accepted.extend(accepted);
        }

        Ok(output)
    }

    async fn upload_materials(&self, ctx: &UnitCtx) -> Result<Vec<DocumentHandle>, UnitError> {
        let materials = self
            .materials
            .materials_for(&ctx.unit)
            .await
            .map_err(|e| UnitError::MaterialFetch {
                message: e.to_string(),
            })?;

        let mut documents = Vec::with_capacity(materials.len());
        for material in &materials {
            match self.boundary.upload(material).await {
                Ok(handle) => {
                    debug!("{} 材料 {} 上传成功 → {}", ctx, material.title, handle.id);
                    documents.push(handle);
                }
                Err(e) => {
                    warn!("{} ⚠️ 材料 {} 上传失败，跳过: {}", ctx, material.title, e);
                }
            }
        }

        if documents.is_empty() {
            return Err(UnitError::NoUsableMaterials {
                attempted: materials.len(),
            });
        }
        info!(
            "{} ✓ 已上传 {}/{} 份参考材料",
            ctx,
            documents.len(),
            materials.len()
        );
        Ok(documents)
    }

    async fn generate_batch(
        &self,
        ctx: &mut UnitCtx,
        documents: &[DocumentHandle],
        batch_target: usize,
        over_target: usize,
        output: &mut UnitFlowOutput,
    ) -> Result<Vec<AcceptedQuestion>, UnitError> {
        let prompt = build_prompt(
            &ctx.protocol,
            &ctx.resolved,
            &ctx.unit.topic,
            batch_target,
            over_target,
        );
        if self.settings.verbose_logging {
            debug!("{} 提示词: {}", ctx, truncate_text(&prompt, 300));
        }

        let generated = self.generate_with_retry(ctx, &prompt, documents).await?;
        self.record_usage(ctx, &generated).await;

        // ========== 归一化 ==========
        let normalized = normalize(&generated.raw_text).map_err(|failure| {
            warn!("{} ❌ 模型输出无法解析: {}", ctx, failure);
            debug!("{} 响应开头: {}", ctx, failure.head);
            debug!("{} 响应结尾: {}", ctx, failure.tail);
            UnitError::MalformedOutput(failure)
        })?;
        output.dropped_candidates += normalized.dropped.len();

        let mut questions = normalized.questions;
        if questions.len() > batch_target {
            debug!(
                "{} 模型返回 {} 道，超出请求的 {} 道，截断",
                ctx,
                questions.len(),
                batch_target
            );
            questions.truncate(batch_target);
        }

        // ========== 校验 ==========
        let result = validate(&questions, &ctx.protocol);
        output.warnings.extend(result.warnings.iter().cloned());
        if result.has_batch_level_errors() {
            warn!(
                "{} ❌ 批次级硬错误 {} 个，整批拒绝",
                ctx,
                result.errors.iter().filter(|e| e.is_batch_level()).count()
            );
            return Err(UnitError::ValidationRejected {
                errors: result.errors,
            });
        }

        let rejected = result.rejected_indices();
        for error in &result.errors {
            debug!("{} 剔除: {}", ctx, error);
        }
        let survivors: Vec<RawQuestion> = questions
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| rejected.binary_search(idx).is_err())
            .map(|(_, q)| q)
            .collect();

        // 高负荷连续段按单元计算，接在已保存题目的末尾
        let existing = self.store.questions(ctx.unit_id()).await?;
        let trailing_high = trailing_high_load(existing.iter().map(|q| &q.question));
        let max_high = ctx.protocol.cognitive_load.max_consecutive_high;
        let (survivors, trimmed) = enforce_load_runs(survivors, max_high, trailing_high);
        if trimmed > 0 {
            output.warnings.push(Issue::batch(
                ReasonCode::LoadRunTrimmed,
                format!("剔除题目后出现高负荷连续段，额外去掉 {} 道高负荷题", trimmed),
            ));
        }
        output.rejected_questions += rejected.len() + trimmed;

        if survivors.is_empty() {
            warn!("{} ❌ 本批题目全部存在硬错误", ctx);
            return Err(UnitError::ValidationRejected {
                errors: result.errors,
            });
        }
        if !rejected.is_empty() {
            info!(
                "{} ⚠️ {} 道题存在硬错误被剔除，保留 {} 道",
                ctx,
                rejected.len(),
                survivors.len()
            );
        }

        // ========== 持久化 ==========
        let persisted = existing.len();
        let accepted: Vec<AcceptedQuestion> = survivors
            .into_iter()
            .enumerate()
            .map(|(offset, question)| AcceptedQuestion {
                unit_id: ctx.unit.id.clone(),
                question_order: persisted + offset + 1,
                question,
            })
            .collect();
        self.store
            .append_questions(ctx.unit_id(), &accepted)
            .await?;

        Ok(accepted)
    }

    /// 生成调用，只对传输类失败按退避重试
    async fn generate_with_retry(
        &self,
        ctx: &UnitCtx,
        prompt: &str,
        documents: &[DocumentHandle],
    ) -> Result<GenerationOutput, UnitError> {
        let policy = self.settings.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.boundary.generate(prompt, documents).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff_delay(attempt);
                    warn!(
                        "{} ⚠️ 生成失败（第 {}/{} 次）: {}，{:?} 后重试",
                        ctx, attempt, policy.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e @ GenerationError::EmptyResponse { .. }) => {
                    warn!("{} ❌ 生成服务返回空内容", ctx);
                    return Err(UnitError::EmptyResponse(e));
                }
                Err(e) => {
                    warn!("{} ❌ 生成失败（共尝试 {} 次）: {}", ctx, attempt, e);
                    return Err(UnitError::TransportExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
            }
        }
    }

    async fn record_usage(&self, ctx: &mut UnitCtx, generated: &GenerationOutput) {
        let record = usage_record(
            &ctx.run_id,
            ctx.unit_id(),
            generated.usage,
            self.boundary.model_name(),
            self.settings.pricing_mode,
            self.settings.usd_to_local_rate,
        );
        ctx.usage += generated.usage;
        ctx.cost += record.cost;
        self.ledger.record(&record).await;
    }
}
