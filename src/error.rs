//! 记忆引擎错误类型
//!
//! 分类与降级策略配合：TransientStorage 下次 flush/恢复时重试；CorruptIndex 降级对应检索分支；
//! SemanticUnavailable 回退为关键词检索 / 话题判定 Ignore；Configuration 启动即中止。

use thiserror::Error;

/// 记忆引擎错误（交互路径就地捕获降级，启动路径向上传播）
#[derive(Error, Debug)]
pub enum MemoryError {
    /// 存储层瞬时错误（事务失败等），保留待写数据，下次触发时重试
    #[error("Transient storage error: {0}")]
    TransientStorage(#[from] rusqlite::Error),

    /// 索引损坏：降级受影响的检索模式，记录日志后继续
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// 语义后端不可用（嵌入 API 失败或超时）：检索退化为关键词，话题判定退化为 Ignore
    #[error("Semantic backend unavailable: {0}")]
    SemanticUnavailable(String),

    /// 配置错误：存储初始化之前无安全降级路径，直接中止启动
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 事件引用了不存在或已结束的会话，宿主侧调用顺序有误
    #[error("Unknown session: {0}")]
    UnknownSession(String),
}

impl From<config::ConfigError> for MemoryError {
    fn from(e: config::ConfigError) -> Self {
        MemoryError::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
