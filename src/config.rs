//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ENGRAM__*` 覆盖（双下划线表示嵌套，
//! 如 `ENGRAM__CONTINUITY__T_HIGH=0.8`）。所有可调参数均有默认值，
//! `validate()` 在启动时检查阈值与权重的合法区间，非法配置直接中止初始化。

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::MemoryError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MemoryConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub buffer: BufferSection,
    #[serde(default)]
    pub continuity: ContinuitySection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub embedding: EmbeddingSection,
}

/// [store] 段：数据库文件路径，未设置时用内存库（仅适合测试）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub db_path: Option<PathBuf>,
}

/// [buffer] 段：观测事件的检查点间隔
#[derive(Debug, Clone, Deserialize)]
pub struct BufferSection {
    /// 待写观测数达到该值时自动 flush
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

fn default_checkpoint_interval() -> usize {
    20
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

/// [continuity] 段：话题切换判定阈值与质心更新系数
#[derive(Debug, Clone, Deserialize)]
pub struct ContinuitySection {
    /// 相似度低于该值视为高置信新话题（Trust 分支）
    #[serde(default = "default_t_low")]
    pub t_low: f32,
    /// 相似度不低于该值视为同一话题（Ignore 分支）；区间内为 Ask
    #[serde(default = "default_t_high")]
    pub t_high: f32,
    /// 质心 EMA 混合系数：c' = normalize(alpha*v + (1-alpha)*c)
    #[serde(default = "default_centroid_alpha")]
    pub centroid_alpha: f32,
}

fn default_t_low() -> f32 {
    0.4
}

fn default_t_high() -> f32 {
    0.75
}

fn default_centroid_alpha() -> f32 {
    0.3
}

impl Default for ContinuitySection {
    fn default() -> Self {
        Self {
            t_low: default_t_low(),
            t_high: default_t_high(),
            centroid_alpha: default_centroid_alpha(),
        }
    }
}

/// [retrieval] 段：混合检索的融合权重与覆盖惩罚
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSection {
    /// 关键词分支权重
    #[serde(default = "default_branch_weight")]
    pub keyword_weight: f32,
    /// 向量分支权重
    #[serde(default = "default_branch_weight")]
    pub vector_weight: f32,
    /// 仅命中单一分支时的惩罚系数（<1，保证双命中优先）
    #[serde(default = "default_coverage_penalty")]
    pub coverage_penalty: f32,
    /// 未显式指定时的返回条数上限
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
}

fn default_branch_weight() -> f32 {
    0.5
}

fn default_coverage_penalty() -> f32 {
    0.8
}

fn default_search_limit() -> usize {
    10
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            keyword_weight: default_branch_weight(),
            vector_weight: default_branch_weight(),
            coverage_penalty: default_coverage_penalty(),
            default_limit: default_search_limit(),
        }
    }
}

/// [embedding] 段：模型、端点与单次请求超时
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSection {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时回退到环境变量 OPENAI_API_KEY；两者皆空则进入降级模式
    pub api_key: Option<String>,
    /// 单次嵌入请求超时（毫秒），超时与失败同等降级
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_timeout_ms() -> u64 {
    3000
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            base_url: None,
            api_key: None,
            timeout_ms: default_embedding_timeout_ms(),
        }
    }
}

impl MemoryConfig {
    /// 启动时校验；非法配置没有安全降级路径，直接返回 Configuration 错误
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.buffer.checkpoint_interval == 0 {
            return Err(MemoryError::Configuration(
                "buffer.checkpoint_interval must be >= 1".into(),
            ));
        }
        let c = &self.continuity;
        if !(0.0..=1.0).contains(&c.t_low)
            || !(0.0..=1.0).contains(&c.t_high)
            || c.t_low >= c.t_high
        {
            return Err(MemoryError::Configuration(format!(
                "continuity thresholds must satisfy 0 <= t_low < t_high <= 1, got {} / {}",
                c.t_low, c.t_high
            )));
        }
        if !(0.0..=1.0).contains(&c.centroid_alpha) {
            return Err(MemoryError::Configuration(
                "continuity.centroid_alpha must be in [0,1]".into(),
            ));
        }
        let r = &self.retrieval;
        if r.keyword_weight < 0.0 || r.vector_weight < 0.0 {
            return Err(MemoryError::Configuration(
                "retrieval weights must be non-negative".into(),
            ));
        }
        if r.coverage_penalty <= 0.0 || r.coverage_penalty > 1.0 {
            return Err(MemoryError::Configuration(
                "retrieval.coverage_penalty must be in (0,1]".into(),
            ));
        }
        if r.default_limit == 0 {
            return Err(MemoryError::Configuration(
                "retrieval.default_limit must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 ENGRAM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ENGRAM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<MemoryConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ENGRAM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.buffer.checkpoint_interval, 20);
        assert_eq!(cfg.continuity.t_low, 0.4);
        assert_eq!(cfg.continuity.t_high, 0.75);
        assert_eq!(cfg.retrieval.coverage_penalty, 0.8);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut cfg = MemoryConfig::default();
        cfg.continuity.t_low = 0.9;
        cfg.continuity.t_high = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut cfg = MemoryConfig::default();
        cfg.buffer.checkpoint_interval = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_penalty() {
        let mut cfg = MemoryConfig::default();
        cfg.retrieval.coverage_penalty = 1.5;
        assert!(cfg.validate().is_err());
    }
}
