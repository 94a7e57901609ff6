use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;
use crate::models::usage::PricingMode;
use crate::workflow::retry::RetryPolicy;

/// 程序配置文件
#[derive(Clone, Debug)]
pub struct Config {
    /// 同时处理的单元数量
    pub max_concurrent_units: usize,
    /// 出题协议文件
    pub protocol_file: String,
    /// 单元计划（TOML）存放目录
    pub units_folder: String,
    /// 已接受题目的输出目录
    pub output_folder: String,
    /// 用量日志（JSON Lines）
    pub usage_log_file: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    /// 单次生成调用的超时（秒）
    pub generation_timeout_secs: u64,
    // --- 计费配置 ---
    pub pricing_mode: PricingMode,
    /// 美元 → 本币汇率
    pub usd_to_local_rate: f64,
    // --- 生成流程配置 ---
    /// 传输类失败的最大尝试次数
    pub max_generation_attempts: u32,
    /// 重试基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
    /// 超额生成倍数
    pub over_generation_factor: f64,
    /// 单次调用最多请求的题数
    pub max_questions_per_call: usize,
    /// 运行汇总中返回的警告条数上限
    pub warning_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_units: 4,
            protocol_file: "config/protocols.toml".to_string(),
            units_folder: "units".to_string(),
            output_folder: "output_questions".to_string(),
            usage_log_file: "usage_log.jsonl".to_string(),
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
            llm_api_key: String::new(),
            llm_api_base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            llm_model_name: "gemini-3-pro-preview".to_string(),
            generation_timeout_secs: 300,
            pricing_mode: PricingMode::Standard,
            usd_to_local_rate: 83.0,
            max_generation_attempts: 3,
            retry_base_delay_ms: 2000,
            over_generation_factor: 1.5,
            max_questions_per_call: 25,
            warning_cap: 10,
        }
    }
}

/// 读取并解析环境变量，缺失或无法解析时使用默认值
fn env_or<T: FromStr>(var_name: &str, default: T) -> T {
    match std::env::var(var_name) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                let err = ConfigError::EnvVarParseFailed {
                    var_name: var_name.to_string(),
                    value,
                    expected_type: std::any::type_name::<T>().to_string(),
                };
                warn!("{}，使用默认值", err);
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_concurrent_units: env_or("MAX_CONCURRENT_UNITS", default.max_concurrent_units).max(1),
            protocol_file: std::env::var("PROTOCOL_FILE").unwrap_or(default.protocol_file),
            units_folder: std::env::var("UNITS_FOLDER").unwrap_or(default.units_folder),
            output_folder: std::env::var("OUTPUT_FOLDER").unwrap_or(default.output_folder),
            usage_log_file: std::env::var("USAGE_LOG_FILE").unwrap_or(default.usage_log_file),
            verbose_logging: env_or("VERBOSE_LOGGING", default.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
            generation_timeout_secs: env_or("GENERATION_TIMEOUT_SECS", default.generation_timeout_secs),
            pricing_mode: std::env::var("PRICING_MODE").ok().and_then(|v| PricingMode::parse(&v)).unwrap_or(default.pricing_mode),
            usd_to_local_rate: env_or("USD_TO_LOCAL_RATE", default.usd_to_local_rate),
            max_generation_attempts: env_or("MAX_GENERATION_ATTEMPTS", default.max_generation_attempts).max(1),
            retry_base_delay_ms: env_or("RETRY_BASE_DELAY_MS", default.retry_base_delay_ms),
            over_generation_factor: env_or("OVER_GENERATION_FACTOR", default.over_generation_factor).max(1.0),
            max_questions_per_call: env_or("MAX_QUESTIONS_PER_CALL", default.max_questions_per_call).max(1),
            warning_cap: env_or("WARNING_CAP", default.warning_cap),
        }
    }

    /// 生成调用的重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_generation_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }
}
