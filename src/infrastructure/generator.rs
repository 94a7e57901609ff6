//! 生成服务边界 - 基础设施层
//!
//! `GenerationBoundary` 是核心流程与外部生成服务之间唯一的接缝：
//! - `upload`：把一份参考材料交给生成服务，换回文档句柄
//! - `generate`：带着文档句柄发起一次生成调用，返回原始文本和 token 用量
//!
//! `OpenAiGenerator` 基于 `async-openai` 实现，兼容任意 OpenAI 风格的端点。

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::GenerationError;
use crate::models::unit::{DocumentHandle, ReferenceMaterial};
use crate::models::usage::TokenUsage;

/// 单次生成允许的最大输出 token 数
const MAX_OUTPUT_TOKENS: u32 = 16_384;

/// 一次生成调用的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutput {
    pub raw_text: String,
    pub usage: TokenUsage,
}

/// 生成服务边界
#[async_trait]
pub trait GenerationBoundary: Send + Sync {
    /// 计费使用的模型名
    fn model_name(&self) -> &str;

    /// 上传一份参考材料
    async fn upload(&self, material: &ReferenceMaterial) -> Result<DocumentHandle, GenerationError>;

    /// 发起一次生成调用
    ///
    /// 空响应返回 `GenerationError::EmptyResponse`；输出被截断不在这里判断
    async fn generate(
        &self,
        prompt: &str,
        documents: &[DocumentHandle],
    ) -> Result<GenerationOutput, GenerationError>;
}

struct UploadedDocument {
    title: String,
    text: String,
}

/// 基于 OpenAI 兼容接口的生成服务
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    model_name: String,
    system_prompt: String,
    timeout_secs: u64,
    documents: RwLock<HashMap<String, UploadedDocument>>,
    next_document: AtomicU64,
}

impl OpenAiGenerator {
    pub fn new(config: &Config, system_prompt: impl Into<String>) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            http: reqwest::Client::new(),
            model_name: config.llm_model_name.clone(),
            system_prompt: system_prompt.into(),
            timeout_secs: config.generation_timeout_secs,
            documents: RwLock::new(HashMap::new()),
            next_document: AtomicU64::new(1),
        }
    }

    async fn fetch_text(&self, file_ref: &str) -> Result<String, String> {
        if file_ref.starts_with("http://") || file_ref.starts_with("https://") {
            let response = self
                .http
                .get(file_ref)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| e.to_string())?;
            response.text().await.map_err(|e| e.to_string())
        } else {
            let bytes = tokio::fs::read(file_ref).await.map_err(|e| e.to_string())?;
            String::from_utf8(bytes).map_err(|_| "文件不是 UTF-8 文本".to_string())
        }
    }

    async fn compose_user_message(
        &self,
        prompt: &str,
        documents: &[DocumentHandle],
    ) -> Result<String, GenerationError> {
        let store = self.documents.read().await;
        let mut message = String::new();
        for handle in documents {
            let doc = store
                .get(&handle.id)
                .ok_or_else(|| GenerationError::UploadFailed {
                    file_ref: handle.id.clone(),
                    message: "文档句柄不存在".to_string(),
                })?;
            let _ = writeln!(
                message,
                "<reference_document title=\"{}\">\n{}\n</reference_document>\n",
                doc.title, doc.text
            );
        }
        message.push_str(prompt);
        Ok(message)
    }
}

/// 按错误信息区分限流和一般传输失败
fn classify_api_error(message: String) -> GenerationError {
    let lowered = message.to_lowercase();
    if lowered.contains("429") || lowered.contains("rate limit") || lowered.contains("quota") {
        GenerationError::RateLimited { message }
    } else {
        GenerationError::Transport { message }
    }
}

#[async_trait]
impl GenerationBoundary for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn upload(&self, material: &ReferenceMaterial) -> Result<DocumentHandle, GenerationError> {
        let text = self
            .fetch_text(&material.file_ref)
            .await
            .map_err(|message| GenerationError::UploadFailed {
                file_ref: material.file_ref.clone(),
                message,
            })?;
        if text.trim().is_empty() {
            return Err(GenerationError::UploadFailed {
                file_ref: material.file_ref.clone(),
                message: "文件内容为空".to_string(),
            });
        }

        let id = format!("doc-{}", self.next_document.fetch_add(1, Ordering::Relaxed));
        debug!(
            "上传参考材料: {} ({} 字符) → {}",
            material.title,
            text.chars().count(),
            id
        );
        self.documents.write().await.insert(
            id.clone(),
            UploadedDocument {
                title: material.title.clone(),
                text,
            },
        );
        Ok(DocumentHandle {
            id,
            title: material.title.clone(),
        })
    }

    async fn generate(
        &self,
        prompt: &str,
        documents: &[DocumentHandle],
    ) -> Result<GenerationOutput, GenerationError> {
        debug!(
            "调用生成服务，模型: {}，文档 {} 份，提示词 {} 字符",
            self.model_name,
            documents.len(),
            prompt.len()
        );

        let user_message = self.compose_user_message(prompt, documents).await?;
        let build_error = |e: async_openai::error::OpenAIError| GenerationError::Transport {
            message: format!("请求构建失败: {}", e),
        };

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(self.system_prompt.as_str())
            .build()
            .map_err(build_error)?;
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()
            .map_err(build_error)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(0.7)
            .max_tokens(MAX_OUTPUT_TOKENS)
            .build()
            .map_err(build_error)?;

        let response = tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            self.client.chat().create(request),
        )
        .await
        .map_err(|_| GenerationError::Timeout {
            seconds: self.timeout_secs,
        })?
        .map_err(|e| {
            warn!("生成服务调用失败: {}", e);
            classify_api_error(e.to_string())
        })?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage {
                prompt_tokens: u64::from(u.prompt_tokens),
                completion_tokens: u64::from(u.completion_tokens),
                cached_tokens: u
                    .prompt_tokens_details
                    .as_ref()
                    .and_then(|d| d.cached_tokens)
                    .map(u64::from)
                    .unwrap_or(0),
            })
            .unwrap_or_default();

        let raw_text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| GenerationError::EmptyResponse {
                model: self.model_name.clone(),
            })?;

        debug!(
            "生成服务调用成功: {} 字符, {} tokens",
            raw_text.len(),
            usage.total()
        );
        Ok(GenerationOutput { raw_text, usage })
    }
}
