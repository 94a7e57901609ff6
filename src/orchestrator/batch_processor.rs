//! 应用入口 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责装配基础设施并启动一次运行。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：日志文件、协议注册表、单元计划、文件存储、生成服务、费用账本
//! 2. **单元选择**：处理全部单元，或只处理命令行指定的单元
//! 3. **全局统计**：运行结束后输出汇总
//!
//! ## 设计特点
//!
//! - **顶层编排**：不处理单个单元的细节，委托 `Orchestrator`
//! - **资源所有者**：唯一创建生成服务客户端和存储的模块

use crate::config::Config;
use crate::infrastructure::{FileStore, OpenAiGenerator, PlanMaterialSource};
use crate::models::loaders::{load_all_unit_plans, load_protocol_registry};
use crate::models::run::GenerationRun;
use crate::orchestrator::unit_processor::Orchestrator;
use crate::services::cost_ledger::UsageLedger;
use crate::services::prompt_builder::SYSTEM_PROMPT;
use crate::utils::logging::{init_log_file, log_startup, log_units_loaded, print_final_stats};
use crate::workflow::unit_flow::{FlowSettings, UnitFlow};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// 应用主结构
pub struct App {
    config: Config,
    orchestrator: Orchestrator,
    unit_ids: Vec<String>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        // 初始化日志文件
        init_log_file(&config.output_log_file)?;

        log_startup(&config);

        if config.llm_api_key.is_empty() {
            warn!("⚠️ 未设置 LLM_API_KEY，生成请求可能被拒绝");
        }

        // 协议在任何单元开始前加载，配置错误直接终止
        let registry = load_protocol_registry(Path::new(&config.protocol_file)).await?;

        info!("\n📁 正在扫描单元计划...");
        let plans = load_all_unit_plans(&config.units_folder).await?;
        let unit_ids = plans.iter().map(|p| p.unit.id.clone()).collect();

        let store = FileStore::open(
            &config.output_folder,
            plans.iter().map(|p| p.unit.clone()),
        )
        .await
        .with_context(|| format!("无法打开输出目录: {}", config.output_folder))?;
        let store = Arc::new(store);

        let flow = UnitFlow::new(
            Arc::new(OpenAiGenerator::new(&config, SYSTEM_PROMPT)),
            Arc::new(PlanMaterialSource::from_plans(&plans)),
            store.clone(),
            Arc::new(UsageLedger::new(&config.usage_log_file)),
            FlowSettings::from_config(&config),
        );

        let orchestrator = Orchestrator::new(
            registry,
            store,
            flow,
            config.max_concurrent_units,
            config.warning_cap,
        );

        Ok(Self {
            config,
            orchestrator,
            unit_ids,
        })
    }

    /// 运行应用主逻辑
    ///
    /// `only` 非空时只处理其中列出的单元
    pub async fn run(&self, only: &[String]) -> Result<GenerationRun> {
        let selected: Vec<String> = if only.is_empty() {
            self.unit_ids.clone()
        } else {
            for id in only {
                if !self.unit_ids.contains(id) {
                    warn!("⚠️ 单元 {} 不存在，已忽略", id);
                }
            }
            only.iter()
                .filter(|id| self.unit_ids.contains(id))
                .cloned()
                .collect()
        };

        if selected.is_empty() {
            warn!("⚠️ 没有找到待处理的单元，程序结束");
            return Ok(GenerationRun::new("empty", self.config.warning_cap));
        }

        log_units_loaded(selected.len(), self.config.max_concurrent_units);

        let run = self.orchestrator.run_units(&selected).await?;

        // 输出最终统计
        print_final_stats(&run, &self.config.output_log_file);

        Ok(run)
    }
}
