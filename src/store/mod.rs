//! 持久层：实体定义与 SQLite 存储

pub mod entities;
pub mod sqlite;

pub use entities::{
    Conversation, ConversationStatus, EntityKind, KnowledgeItem, KnowledgeKind, MemoryEntity,
    Observation, Project, Session, SessionStatus,
};
pub use sqlite::{MemoryStore, ScoredRef, StoreStats};
