//! 错误类型
//!
//! 分层：
//! - `ConfigError`：协议缺失、协议数据不合法、环境变量错误（致命，不重试）
//! - `GenerationError`：生成服务边界上的失败（传输 / 限流 / 超时可重试）
//! - `StoreError` / `FileError`：持久化与文件读写
//! - `UnitError`：单个单元失败的原因，只影响该单元，不中断整次运行

use thiserror::Error;

use crate::models::validation::Issue;
use crate::services::normalizer::NormalizationFailure;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    #[error("生成服务错误: {0}")]
    Generation(#[from] GenerationError),
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    #[error("单元失败: {0}")]
    Unit(#[from] UnitError),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("没有匹配的出题协议 (考试: {exam}, 科目: {subject})")]
    ProtocolNotFound { exam: String, subject: String },

    #[error("协议不存在: {id}")]
    ProtocolIdNotFound { id: String },

    #[error("协议重复定义: {key}")]
    DuplicateProtocol { key: String },

    #[error("协议 {protocol} 的分布 {dimension} 不合法: {reason}")]
    InvalidDistribution {
        protocol: String,
        dimension: String,
        reason: String,
    },

    #[error("协议 {protocol} 的难度预设 {preset} 不存在")]
    UnknownDifficultyPreset { protocol: String, preset: String },

    #[error("正则表达式无效 ({pattern}): {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("协议文件解析失败: {0}")]
    ProtocolParse(#[from] toml::de::Error),

    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
}

/// 生成服务错误
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("网络请求失败: {message}")]
    Transport { message: String },

    #[error("请求频率限制: {message}")]
    RateLimited { message: String },

    #[error("生成超时 ({seconds} 秒)")]
    Timeout { seconds: u64 },

    #[error("生成服务返回空内容 (模型: {model})")]
    EmptyResponse { model: String },

    #[error("上传参考材料失败 ({file_ref}): {message}")]
    UploadFailed { file_ref: String, message: String },
}

impl GenerationError {
    /// 传输类失败才值得重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::Transport { .. }
                | GenerationError::RateLimited { .. }
                | GenerationError::Timeout { .. }
        )
    }
}

/// 持久化错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("单元不存在: {unit_id}")]
    UnitNotFound { unit_id: String },

    #[error("非法的状态迁移 ({unit_id}): {from} → {to}")]
    InvalidTransition {
        unit_id: String,
        from: String,
        to: String,
    },

    #[error("写入失败 ({unit_id}): {message}")]
    WriteFailed { unit_id: String, message: String },

    #[error(transparent)]
    File(#[from] FileError),
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML 解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("TOML 序列化失败 ({path}): {source}")]
    TomlSerializeFailed {
        path: String,
        #[source]
        source: toml::ser::Error,
    },

    #[error("目录不存在: {path}")]
    DirectoryNotFound { path: String },
}

/// 单元失败原因
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("没有可用的参考材料 (共 {attempted} 个, 全部上传失败)")]
    NoUsableMaterials { attempted: usize },

    #[error("获取参考材料失败: {message}")]
    MaterialFetch { message: String },

    #[error("生成服务重试 {attempts} 次后仍然失败: {last}")]
    TransportExhausted { attempts: u32, last: GenerationError },

    #[error("生成服务返回空内容: {0}")]
    EmptyResponse(GenerationError),

    #[error("模型输出无法解析: {0}")]
    MalformedOutput(NormalizationFailure),

    #[error("校验未通过 ({} 个硬错误)", errors.len())]
    ValidationRejected { errors: Vec<Issue> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UnitError {
    /// 机器可读的失败原因码
    pub fn code(&self) -> &'static str {
        match self {
            UnitError::Configuration(_) => "CONFIGURATION_ERROR",
            UnitError::NoUsableMaterials { .. } => "NO_USABLE_MATERIALS",
            UnitError::MaterialFetch { .. } => "MATERIAL_FETCH_FAILED",
            UnitError::TransportExhausted { .. } => "TRANSPORT_ERROR",
            UnitError::EmptyResponse(_) => "EMPTY_RESPONSE",
            UnitError::MalformedOutput(_) => "MALFORMED_OUTPUT",
            UnitError::ValidationRejected { .. } => "VALIDATION_ERROR",
            UnitError::Store(_) => "STORE_ERROR",
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

pub type StoreResult<T> = Result<T, StoreError>;
