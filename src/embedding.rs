//! 嵌入 API：供话题表示与向量检索使用，调用 OpenAI 兼容的 /embeddings 端点
//!
//! 交互路径要求有界超时：请求超时与失败同等对待，由调用方降级（检索走关键词、话题判定 Ignore）。

use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;

use crate::config::EmbeddingSection;

/// 可从 sync 上下文调用的嵌入提供方（内部用 block_on 执行 async 调用）
pub trait EmbeddingProvider: Send + Sync {
    /// 将文本编码为向量；失败或超时返回错误字符串
    fn embed_sync(&self, text: &str) -> Result<Vec<f32>, String>;
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API，每次请求带超时
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiEmbedder {
    /// 从环境变量与可选 base_url 创建（与宿主共用 OPENAI_API_KEY / base_url）
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        timeout_ms: u64,
    ) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub async fn embed_async(&self, text: &str) -> Result<Vec<f32>, String> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| e.to_string())?;

        let response = tokio::time::timeout(self.timeout, self.client.embeddings().create(request))
            .await
            .map_err(|_| format!("embedding request timed out after {:?}", self.timeout))?
            .map_err(|e| e.to_string())?;

        let vec = response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .unwrap_or_default();
        Ok(vec)
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    fn embed_sync(&self, text: &str) -> Result<Vec<f32>, String> {
        // block_in_place 只在多线程运行时里合法；其余环境返回错误走降级路径，不 panic
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| "no tokio runtime available for embedding call".to_string())?;
        if handle.runtime_flavor() != tokio::runtime::RuntimeFlavor::MultiThread {
            return Err("embedding requires the multi-thread tokio runtime".to_string());
        }
        let text = text.to_string();
        let this = self.clone();
        tokio::task::block_in_place(move || handle.block_on(this.embed_async(&text)))
    }
}

impl Clone for OpenAiEmbedder {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            model: self.model.clone(),
            timeout: self.timeout,
        }
    }
}

/// 从应用配置创建嵌入提供方；未配置 API Key 时返回 None（检索与话题判定进入降级模式）
pub fn create_embedder_from_config(section: &EmbeddingSection) -> Option<Arc<dyn EmbeddingProvider>> {
    let key = section
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    if key.as_deref().unwrap_or("").is_empty() || key.as_deref() == Some("sk-placeholder") {
        tracing::debug!("embedding skipped: no OPENAI_API_KEY");
        return None;
    }
    Some(Arc::new(OpenAiEmbedder::new(
        section.base_url.as_deref(),
        &section.model,
        key.as_deref(),
        section.timeout_ms,
    )))
}

/// 余弦相似度；维度不符或零向量时返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 余弦相似度压到 [0,1]：负相关按 0 处理
pub fn cosine_score(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);
    }

    #[test]
    fn test_cosine_score_clamps_negative() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert_eq!(cosine_score(&a, &b), 0.0);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_embed_sync_outside_runtime_errors_instead_of_panicking() {
        let embedder = OpenAiEmbedder::new(None, "m", Some("sk-test"), 10);
        let err = embedder.embed_sync("hello").unwrap_err();
        assert!(err.contains("runtime"));
    }

    #[tokio::test]
    async fn test_embed_sync_on_current_thread_runtime_errors() {
        // 单线程运行时下 block_in_place 不可用，应返回错误而非 panic
        let embedder = OpenAiEmbedder::new(None, "m", Some("sk-test"), 10);
        let err = embedder.embed_sync("hello").unwrap_err();
        assert!(err.contains("multi-thread"));
    }
}
