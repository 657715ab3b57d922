//! 存储实体：Project / Session / Conversation / Observation / KnowledgeItem
//!
//! Observation 使用 SQLite rowid（单调整数）作为 id，供检查点标记做整数比较；
//! 其余实体用 uuid v4 字符串。

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 可被索引与检索的实体类别（同时用于 type: 限定词）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Knowledge,
    Observation,
    Session,
    Conversation,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Knowledge => "knowledge",
            EntityKind::Observation => "observation",
            EntityKind::Session => "session",
            EntityKind::Conversation => "conversation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "knowledge" => Some(EntityKind::Knowledge),
            "observation" => Some(EntityKind::Observation),
            "session" => Some(EntityKind::Session),
            "conversation" => Some(EntityKind::Conversation),
            _ => None,
        }
    }
}

/// 项目：每个代码库根目录一条，首次出现时创建，不自动删除
#[derive(Clone, Debug, Serialize)]
pub struct Project {
    pub id: String,
    pub root_path: String,
    pub name: String,
}

/// 会话状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
    Crashed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Crashed => "crashed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => SessionStatus::Active,
            "crashed" => SessionStatus::Crashed,
            _ => SessionStatus::Ended,
        }
    }
}

/// 会话：助手的一次运行
#[derive(Clone, Debug, Serialize)]
pub struct Session {
    pub id: String,
    pub external_session_ref: String,
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

/// 对话状态：closed 为终态，不会重新打开
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "open" {
            ConversationStatus::Open
        } else {
            ConversationStatus::Closed
        }
    }
}

/// 对话：会话内一段话题连贯的线程；一个会话同时至多一个 open 对话
#[derive(Clone, Debug, Serialize)]
pub struct Conversation {
    pub id: String,
    pub session_id: String,
    pub topic_label: String,
    /// 话题表示：近期 prompt 向量的滑动质心，仅在 open 状态下更新
    #[serde(skip_serializing)]
    pub topic_representation: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub status: ConversationStatus,
}

/// 观测：一条工具调用事件，落库后不可变
#[derive(Clone, Debug, Serialize)]
pub struct Observation {
    /// 落库前为 None，由 SQLite rowid 分配
    pub id: Option<i64>,
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        session_id: impl Into<String>,
        conversation_id: Option<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            conversation_id,
            kind: kind.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// 供关键词索引使用的文本：kind 加 payload 中的字符串值
    pub fn index_text(&self) -> String {
        let mut parts = vec![self.kind.clone()];
        collect_strings(&self.payload, &mut parts);
        parts.join(" ")
    }
}

fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

/// 知识条目类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    Fact,
    Decision,
    Preference,
    Pattern,
}

impl KnowledgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeKind::Fact => "fact",
            KnowledgeKind::Decision => "decision",
            KnowledgeKind::Preference => "preference",
            KnowledgeKind::Pattern => "pattern",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(KnowledgeKind::Fact),
            "decision" => Some(KnowledgeKind::Decision),
            "preference" => Some(KnowledgeKind::Preference),
            "pattern" => Some(KnowledgeKind::Pattern),
            _ => None,
        }
    }
}

/// 知识条目：显式保存的事实/决策/偏好/模式；内容不可变，修订通过 superseded_by 链接新行
#[derive(Clone, Debug, Serialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub project_id: String,
    pub kind: KnowledgeKind,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub superseded_by: Option<String>,
}

/// 检索与 memory_get 返回的实体联合
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryEntity {
    Knowledge(KnowledgeItem),
    Observation(Observation),
    Session(Session),
    Conversation(Conversation),
}

impl MemoryEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            MemoryEntity::Knowledge(_) => EntityKind::Knowledge,
            MemoryEntity::Observation(_) => EntityKind::Observation,
            MemoryEntity::Session(_) => EntityKind::Session,
            MemoryEntity::Conversation(_) => EntityKind::Conversation,
        }
    }

    pub fn id(&self) -> String {
        match self {
            MemoryEntity::Knowledge(k) => k.id.clone(),
            MemoryEntity::Observation(o) => o.id.map(|i| i.to_string()).unwrap_or_default(),
            MemoryEntity::Session(s) => s.id.clone(),
            MemoryEntity::Conversation(c) => c.id.clone(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            MemoryEntity::Knowledge(k) => k.created_at,
            MemoryEntity::Observation(o) => o.created_at,
            MemoryEntity::Session(s) => s.started_at,
            MemoryEntity::Conversation(c) => c.created_at,
        }
    }

    /// 摘要片段的原始文本
    pub fn display_text(&self) -> String {
        match self {
            MemoryEntity::Knowledge(k) => k.content.clone(),
            MemoryEntity::Observation(o) => o.index_text(),
            MemoryEntity::Session(s) => s.external_session_ref.clone(),
            MemoryEntity::Conversation(c) => c.topic_label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_roundtrip() {
        for kind in [
            EntityKind::Knowledge,
            EntityKind::Observation,
            EntityKind::Session,
            EntityKind::Conversation,
        ] {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("bogus"), None);
    }

    #[test]
    fn test_observation_index_text() {
        let obs = Observation::new(
            "s1",
            None,
            "tool_use",
            serde_json::json!({"tool": "cargo", "args": {"cmd": "test"}, "exit": 0}),
        );
        let text = obs.index_text();
        assert!(text.contains("tool_use"));
        assert!(text.contains("cargo"));
        assert!(text.contains("test"));
    }

    #[test]
    fn test_knowledge_kind_parse() {
        assert_eq!(KnowledgeKind::parse("decision"), Some(KnowledgeKind::Decision));
        assert_eq!(KnowledgeKind::parse("nope"), None);
    }
}
