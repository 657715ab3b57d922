//! Engram - 编码助手的跨会话持久记忆引擎
//!
//! 以库形式嵌入宿主进程，通过生命周期钩子接收事件，不对外起服务。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **store**: SQLite 持久化与关键词 / 向量双索引
//! - **buffer**: 观测暂存缓冲与检查点落库
//! - **recovery**: 启动恢复（崩溃会话收敛、检查点对齐）
//! - **continuity**: 对话连续性与话题切换判定
//! - **retrieval**: 关键词 + 向量混合检索
//! - **hooks**: 宿主事件分发与运行时门面
//! - **tools**: 面向 agent 的 memory_search / memory_get 工具
//! - **embedding**: OpenAI 兼容嵌入客户端
//! - **shutdown**: 优雅关闭协调

pub mod buffer;
pub mod config;
pub mod continuity;
pub mod embedding;
pub mod error;
pub mod hooks;
pub mod observability;
pub mod recovery;
pub mod retrieval;
pub mod shutdown;
pub mod store;
pub mod tokenizer;
pub mod tools;

pub use config::{load_config, MemoryConfig};
pub use error::{MemoryError, Result};
pub use hooks::{HookEvent, HookResponse, MemoryRuntime};
