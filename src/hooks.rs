//! 钩子入口：宿主事件的统一分发与运行时装配
//!
//! MemoryRuntime 是嵌入宿主的唯一门面：init 按顺序完成配置校验、
//! 打开存储、启动恢复，之后才接受事件。宿主在生命周期钩子处把事件
//! 转成 HookEvent 投递进来，交互路径的失败在这里降级，不向用户冒泡。

use std::sync::Arc;

use serde::Deserialize;

use crate::buffer::StagingBuffer;
use crate::config::MemoryConfig;
use crate::continuity::{ConversationContinuity, TopicShiftOutcome};
use crate::embedding::{create_embedder_from_config, EmbeddingProvider};
use crate::error::{MemoryError, Result};
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::retrieval::{HybridRetriever, SearchOptions, SearchResponse};
use crate::store::{
    Conversation, KnowledgeItem, KnowledgeKind, MemoryEntity, MemoryStore, Observation, Session,
    StoreStats,
};

/// 宿主生命周期事件（JSON 经 `event` 字段区分）
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HookEvent {
    SessionStart {
        session_ref: String,
        project_root: String,
        #[serde(default)]
        project_name: Option<String>,
    },
    SessionEnd {
        session_ref: String,
    },
    ToolUse {
        session_ref: String,
        tool: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Prompt {
        session_ref: String,
        text: String,
    },
}

/// 事件处理结果，宿主据此决定是否向用户展示确认文案
#[derive(Clone, Debug)]
pub enum HookResponse {
    /// 无需宿主动作
    Ack,
    /// 会话已建立
    SessionStarted(Session),
    /// 观测已入缓冲；附带本次触发落库的条数（0 表示尚未攒满）
    Buffered { flushed: usize },
    /// 话题判定结果（Ask 时宿主应展示 suggestion）
    Topic(TopicShiftOutcome),
}

pub struct MemoryRuntime {
    config: MemoryConfig,
    store: Arc<MemoryStore>,
    buffer: StagingBuffer,
    continuity: ConversationContinuity,
    retriever: HybridRetriever,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    recovery_report: RecoveryReport,
}

impl MemoryRuntime {
    /// 装配运行时。顺序固定：校验配置 → 打开存储 → 启动恢复 → 建各组件。
    /// 恢复先于一切写入，保证新会话看不到上次运行的残留状态。
    pub fn init(config: MemoryConfig) -> Result<Self> {
        config.validate()?;

        let store = match &config.store.db_path {
            Some(path) => Arc::new(MemoryStore::open(path)?),
            None => Arc::new(MemoryStore::open_in_memory()?),
        };

        let recovery_report = RecoveryManager::new(store.clone()).run()?;

        let embedder = create_embedder_from_config(&config.embedding);
        if embedder.is_none() {
            tracing::info!("no embedding backend configured, semantic features degraded");
        }

        let buffer = StagingBuffer::new(store.clone(), config.buffer.checkpoint_interval);
        let continuity = ConversationContinuity::new(
            store.clone(),
            embedder.clone(),
            config.embedding.model.clone(),
            config.continuity.t_low,
            config.continuity.t_high,
            config.continuity.centroid_alpha,
        );
        let retriever = HybridRetriever::new(
            store.clone(),
            embedder.clone(),
            config.retrieval.keyword_weight,
            config.retrieval.vector_weight,
            config.retrieval.coverage_penalty,
            config.retrieval.default_limit,
        );

        Ok(Self {
            config,
            store,
            buffer,
            continuity,
            retriever,
            embedder,
            recovery_report,
        })
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery_report
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// 处理一条宿主事件
    pub fn dispatch(&self, event: HookEvent) -> Result<HookResponse> {
        match event {
            HookEvent::SessionStart {
                session_ref,
                project_root,
                project_name,
            } => {
                let session = self.start_session(&session_ref, &project_root, project_name.as_deref())?;
                Ok(HookResponse::SessionStarted(session))
            }
            HookEvent::SessionEnd { session_ref } => {
                self.end_session(&session_ref)?;
                Ok(HookResponse::Ack)
            }
            // 交互路径：存储故障就地降级，不向宿主的交互循环冒泡；
            // UnknownSession 是宿主调用顺序错误，仍然上抛
            HookEvent::ToolUse {
                session_ref,
                tool,
                payload,
            } => match self.record_tool_use(&session_ref, &tool, payload) {
                Ok(flushed) => Ok(HookResponse::Buffered { flushed }),
                Err(e @ MemoryError::UnknownSession(_)) => Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, tool = %tool, "tool_use degraded, observation dropped");
                    Ok(HookResponse::Buffered { flushed: 0 })
                }
            },
            HookEvent::Prompt { session_ref, text } => {
                match self.handle_prompt(&session_ref, &text) {
                    Ok(outcome) => Ok(HookResponse::Topic(outcome)),
                    Err(e @ MemoryError::UnknownSession(_)) => Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "topic check degraded, continuing current conversation");
                        Ok(HookResponse::Ack)
                    }
                }
            }
        }
    }

    /// 会话开始：项目建档（首次出现时创建）并建立 active 会话。
    /// 同一 session_ref 重复 start 是幂等的，返回已有会话。
    pub fn start_session(
        &self,
        session_ref: &str,
        project_root: &str,
        project_name: Option<&str>,
    ) -> Result<Session> {
        if let Some(existing) = self.store.active_session_by_external_ref(session_ref)? {
            tracing::debug!(session_ref, "session already active, reusing");
            return Ok(existing);
        }
        let project = self.store.upsert_project(project_root, project_name)?;
        let session = self.store.create_session(session_ref, &project.id)?;
        tracing::info!(
            session_id = %session.id,
            session_ref,
            project = %project.name,
            "session started"
        );
        Ok(session)
    }

    /// 会话结束：先 flush 残余观测，再置 ended 并关闭 open 对话
    pub fn end_session(&self, session_ref: &str) -> Result<()> {
        let session = self.resolve_session(session_ref)?;
        self.buffer.flush()?;
        self.store.end_session(&session.id, chrono::Utc::now())?;
        tracing::info!(session_id = %session.id, "session ended");
        Ok(())
    }

    /// 记录一次工具调用；返回本次触发落库的条数
    pub fn record_tool_use(
        &self,
        session_ref: &str,
        tool: &str,
        payload: serde_json::Value,
    ) -> Result<usize> {
        let session = self.resolve_session(session_ref)?;
        let conversation_id = self
            .store
            .open_conversation(&session.id)?
            .map(|c| c.id);
        let mut body = serde_json::Map::new();
        body.insert("tool".to_string(), serde_json::Value::String(tool.to_string()));
        if !payload.is_null() {
            body.insert("payload".to_string(), payload);
        }
        let observation = Observation::new(
            session.id,
            conversation_id,
            "tool_use",
            serde_json::Value::Object(body),
        );
        Ok(self.buffer.append(observation))
    }

    /// 处理用户 prompt 的话题连续性判定
    pub fn handle_prompt(&self, session_ref: &str, text: &str) -> Result<TopicShiftOutcome> {
        let session = self.resolve_session(session_ref)?;
        self.continuity.handle_prompt(&session, text)
    }

    /// 用户确认了 Ask 分支的话题切换
    pub fn confirm_topic_shift(
        &self,
        session_ref: &str,
        closing_conversation_id: &str,
        prompt: &str,
    ) -> Result<Conversation> {
        let session = self.resolve_session(session_ref)?;
        self.continuity
            .confirm_topic_shift(&session, closing_conversation_id, prompt)
    }

    /// 用户否认了 Ask 分支的话题切换
    pub fn continue_topic(&self, conversation_id: &str, prompt: &str) -> Result<()> {
        self.continuity.continue_topic(conversation_id, prompt)
    }

    /// 显式保存知识条目；有嵌入后端时同步写向量索引
    pub fn save_knowledge(
        &self,
        project_root: &str,
        kind: KnowledgeKind,
        content: &str,
        tags: &[String],
    ) -> Result<KnowledgeItem> {
        let project = self.store.upsert_project(project_root, None)?;
        let embedding = self.embed_content(content);
        self.store.insert_knowledge(
            &project.id,
            kind,
            content,
            tags,
            embedding.as_deref(),
            &self.config.embedding.model,
        )
    }

    /// 修订知识条目：新行落库，旧行经 superseded_by 指向新行
    pub fn revise_knowledge(
        &self,
        old_id: &str,
        kind: KnowledgeKind,
        content: &str,
        tags: &[String],
    ) -> Result<KnowledgeItem> {
        let embedding = self.embed_content(content);
        self.store.supersede_knowledge(
            old_id,
            kind,
            content,
            tags,
            embedding.as_deref(),
            &self.config.embedding.model,
        )
    }

    pub fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        self.retriever.search(query, options)
    }

    pub fn get(&self, id: &str) -> Result<Option<MemoryEntity>> {
        self.store.find_entity(id)
    }

    pub fn flush(&self) -> Result<usize> {
        self.buffer.flush()
    }

    pub fn pending_observations(&self) -> usize {
        self.buffer.pending_len()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// 关停前调用：落库残余观测并做存储收尾
    pub fn shutdown(&self) -> Result<()> {
        let flushed = self.buffer.flush()?;
        if flushed > 0 {
            tracing::info!(flushed, "final flush on shutdown");
        }
        self.store.close();
        Ok(())
    }

    fn resolve_session(&self, session_ref: &str) -> Result<Session> {
        self.store
            .active_session_by_external_ref(session_ref)?
            .ok_or_else(|| MemoryError::UnknownSession(session_ref.to_string()))
    }

    fn embed_content(&self, content: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed_sync(content) {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "content embedding failed, keyword index only");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStatus;

    fn runtime() -> MemoryRuntime {
        // 默认配置：内存库、无嵌入后端
        MemoryRuntime::init(MemoryConfig::default()).unwrap()
    }

    #[test]
    fn test_hook_event_json_shape() {
        let event: HookEvent = serde_json::from_str(
            r#"{"event":"tool_use","session_ref":"s1","tool":"grep","payload":{"pattern":"foo"}}"#,
        )
        .unwrap();
        match event {
            HookEvent::ToolUse { tool, .. } => assert_eq!(tool, "grep"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_session_start_idempotent() {
        let rt = runtime();
        let first = rt.start_session("s1", "/tmp/p", None).unwrap();
        let second = rt.start_session("s1", "/tmp/p", None).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_tool_use_requires_active_session() {
        let rt = runtime();
        let err = rt
            .record_tool_use("ghost", "grep", serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, MemoryError::UnknownSession(_)));
    }

    #[test]
    fn test_session_end_flushes_pending() {
        let rt = runtime();
        rt.start_session("s1", "/tmp/p", None).unwrap();
        rt.record_tool_use("s1", "grep", serde_json::json!({"q": "a"}))
            .unwrap();
        rt.record_tool_use("s1", "edit", serde_json::json!({"f": "b"}))
            .unwrap();
        assert_eq!(rt.store().observation_count().unwrap(), 0);

        rt.end_session("s1").unwrap();
        assert_eq!(rt.store().observation_count().unwrap(), 2);
        assert_eq!(rt.pending_observations(), 0);

        let session = rt
            .store()
            .stale_active_sessions()
            .unwrap();
        assert!(session.is_empty());
    }

    #[test]
    fn test_dispatch_full_cycle() {
        let rt = runtime();
        let response = rt
            .dispatch(HookEvent::SessionStart {
                session_ref: "s1".into(),
                project_root: "/tmp/p".into(),
                project_name: None,
            })
            .unwrap();
        let session = match response {
            HookResponse::SessionStarted(s) => s,
            other => panic!("unexpected response: {:?}", other),
        };
        assert_eq!(session.status, SessionStatus::Active);

        // 无嵌入后端时 prompt 判定降级为 Ignore
        let response = rt
            .dispatch(HookEvent::Prompt {
                session_ref: "s1".into(),
                text: "refactor the auth flow".into(),
            })
            .unwrap();
        match response {
            HookResponse::Topic(outcome) => assert!(outcome.degraded),
            other => panic!("unexpected response: {:?}", other),
        }

        rt.dispatch(HookEvent::SessionEnd {
            session_ref: "s1".into(),
        })
        .unwrap();
    }

    #[test]
    fn test_dispatch_degrades_on_storage_failure() {
        let rt = runtime();
        rt.start_session("s1", "/tmp/p", None).unwrap();
        // 模拟存储故障：对话表不可用
        rt.store()
            .execute_raw("ALTER TABLE conversations RENAME TO conversations_hidden")
            .unwrap();

        // prompt 路径降级为 Ack，不向宿主抛错
        let response = rt
            .dispatch(HookEvent::Prompt {
                session_ref: "s1".into(),
                text: "hello".into(),
            })
            .unwrap();
        assert!(matches!(response, HookResponse::Ack));

        // tool_use 路径同样止于日志
        let response = rt
            .dispatch(HookEvent::ToolUse {
                session_ref: "s1".into(),
                tool: "grep".into(),
                payload: serde_json::json!({}),
            })
            .unwrap();
        assert!(matches!(response, HookResponse::Buffered { flushed: 0 }));

        // 未知会话仍是调用方错误
        let err = rt
            .dispatch(HookEvent::ToolUse {
                session_ref: "ghost".into(),
                tool: "grep".into(),
                payload: serde_json::json!({}),
            })
            .unwrap_err();
        assert!(matches!(err, MemoryError::UnknownSession(_)));
    }

    #[test]
    fn test_save_and_search_knowledge() {
        let rt = runtime();
        let item = rt
            .save_knowledge(
                "/tmp/p",
                KnowledgeKind::Decision,
                "use sqlite for persistence",
                &["storage".to_string()],
            )
            .unwrap();

        let response = rt.search("sqlite", &SearchOptions::default()).unwrap();
        assert!(response.degraded);
        assert!(response.hits.iter().any(|h| h.id == item.id));

        let fetched = rt.get(&item.id).unwrap().unwrap();
        match fetched {
            MemoryEntity::Knowledge(k) => assert_eq!(k.id, item.id),
            other => panic!("unexpected entity: {:?}", other.kind()),
        }
    }

    #[test]
    fn test_revise_knowledge_links_supersession() {
        let rt = runtime();
        let item = rt
            .save_knowledge("/tmp/p", KnowledgeKind::Fact, "old fact", &[])
            .unwrap();
        let revised = rt
            .revise_knowledge(&item.id, KnowledgeKind::Fact, "new fact", &[])
            .unwrap();
        let old = rt.store().get_knowledge(&item.id).unwrap().unwrap();
        assert_eq!(old.superseded_by, Some(revised.id));
    }
}
