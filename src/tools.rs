//! 面向 agent 的记忆工具
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），
//! 由 ToolRegistry 按名注册与查找。memory_search 返回按实体类别分组的文本，
//! 降级时在结果里注明，供模型据此调整措辞。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::hooks::MemoryRuntime;
use crate::retrieval::SearchOptions;
use crate::store::EntityKind;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册全部记忆工具
    pub fn with_memory_tools(runtime: Arc<MemoryRuntime>) -> Self {
        let mut registry = Self::new();
        registry.register(MemorySearchTool::new(runtime.clone()));
        registry.register(MemoryGetTool::new(runtime));
        registry
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 返回 (name, description) 列表，用于生成 prompt 中的 Available tools 段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect()
    }
}

/// memory_search：跨会话混合检索
pub struct MemorySearchTool {
    runtime: Arc<MemoryRuntime>,
}

impl MemorySearchTool {
    pub fn new(runtime: Arc<MemoryRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "搜索跨会话的长期记忆（知识条目、历史观测、会话与对话）。\
         查询支持 type:<knowledge|observation|session|conversation> 与 project:<路径> 限定词。"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "检索文本，可带 type: 与 project: 限定词"
                },
                "limit": {
                    "type": "integer",
                    "description": "返回条数上限，缺省用配置默认值"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required argument: query".to_string())?;
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);

        // 检索失败不向交互循环抛错，降级为可读的提示
        let response = match self.runtime.search(query, &SearchOptions { limit }) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "memory search failed, degrading");
                return Ok("记忆检索暂时不可用，请稍后再试。".to_string());
            }
        };

        if response.hits.is_empty() {
            return Ok(if response.degraded {
                "没有找到相关记忆（语义检索暂不可用，仅做了关键词匹配）。".to_string()
            } else {
                "没有找到相关记忆。".to_string()
            });
        }

        // 按实体类别分组输出
        let mut grouped: Vec<(EntityKind, Vec<String>)> = Vec::new();
        for hit in &response.hits {
            let line = format!("- [{}] {} (score {:.2})", hit.id, hit.snippet, hit.score);
            match grouped.iter_mut().find(|(kind, _)| *kind == hit.kind) {
                Some((_, lines)) => lines.push(line),
                None => grouped.push((hit.kind, vec![line])),
            }
        }

        let mut out = String::new();
        for (kind, lines) in grouped {
            out.push_str(&format!("## {}\n", kind.as_str()));
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
        if response.degraded {
            out.push_str("\n（语义检索暂不可用，以上为纯关键词结果。）\n");
        }
        Ok(out)
    }
}

/// memory_get：按 id 取回完整实体
pub struct MemoryGetTool {
    runtime: Arc<MemoryRuntime>,
}

impl MemoryGetTool {
    pub fn new(runtime: Arc<MemoryRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Tool for MemoryGetTool {
    fn name(&self) -> &str {
        "memory_get"
    }

    fn description(&self) -> &str {
        "按 id 取回一条完整的记忆实体（memory_search 结果中的 id）。"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "实体 id：观测为整数，其余为 uuid"
                }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let id = args
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required argument: id".to_string())?;

        match self.runtime.get(id).map_err(|e| e.to_string())? {
            Some(entity) => serde_json::to_string_pretty(&entity).map_err(|e| e.to_string()),
            None => Ok(format!("没有 id 为 {} 的记忆实体。", id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::store::KnowledgeKind;

    fn registry() -> (ToolRegistry, Arc<MemoryRuntime>) {
        let runtime = Arc::new(MemoryRuntime::init(MemoryConfig::default()).unwrap());
        (ToolRegistry::with_memory_tools(runtime.clone()), runtime)
    }

    #[tokio::test]
    async fn test_registry_lists_memory_tools() {
        let (registry, _) = registry();
        let mut names = registry.tool_names();
        names.sort();
        assert_eq!(names, vec!["memory_get", "memory_search"]);
        assert!(registry.get("memory_search").is_some());
    }

    #[tokio::test]
    async fn test_search_tool_requires_query() {
        let (registry, _) = registry();
        let err = registry
            .execute("memory_search", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.contains("query"));
    }

    #[tokio::test]
    async fn test_search_tool_groups_by_kind() {
        let (registry, runtime) = registry();
        runtime
            .save_knowledge("/tmp/p", KnowledgeKind::Fact, "sqlite powers persistence", &[])
            .unwrap();

        let out = registry
            .execute("memory_search", serde_json::json!({"query": "sqlite"}))
            .await
            .unwrap();
        assert!(out.contains("## knowledge"));
        assert!(out.contains("sqlite"));
        // 无嵌入后端，输出应注明降级
        assert!(out.contains("语义检索暂不可用"));
    }

    #[tokio::test]
    async fn test_search_tool_degrades_on_storage_failure() {
        let (registry, runtime) = registry();
        runtime
            .store()
            .execute_raw("ALTER TABLE keyword_index RENAME TO keyword_index_hidden")
            .unwrap();

        let out = registry
            .execute("memory_search", serde_json::json!({"query": "oauth"}))
            .await
            .unwrap();
        assert!(out.contains("暂时不可用"));
    }

    #[tokio::test]
    async fn test_get_tool_roundtrip() {
        let (registry, runtime) = registry();
        let item = runtime
            .save_knowledge("/tmp/p", KnowledgeKind::Fact, "a saved fact", &[])
            .unwrap();

        let out = registry
            .execute("memory_get", serde_json::json!({"id": item.id}))
            .await
            .unwrap();
        assert!(out.contains("a saved fact"));
        assert!(out.contains("knowledge"));

        let missing = registry
            .execute("memory_get", serde_json::json!({"id": "nope"}))
            .await
            .unwrap();
        assert!(missing.contains("没有"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (registry, _) = registry();
        let err = registry
            .execute("bogus", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.contains("Unknown tool"));
    }
}
