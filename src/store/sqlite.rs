//! MemoryStore：SQLite 持久化与双索引
//!
//! 所有写操作在单个事务内同时更新实体行、倒排关键词索引与向量索引，
//! 保证检索方永远不会看到行与索引不一致的状态。连接由 Mutex 保护，
//! 宿主将来并行投递事件时语义不变。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::store::entities::{
    Conversation, ConversationStatus, EntityKind, KnowledgeItem, KnowledgeKind, MemoryEntity,
    Observation, Project, Session, SessionStatus,
};
use crate::tokenizer;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id          TEXT PRIMARY KEY,
    root_path   TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    id                    TEXT PRIMARY KEY,
    external_session_ref  TEXT NOT NULL,
    project_id            TEXT NOT NULL REFERENCES projects(id),
    started_at            TEXT NOT NULL,
    ended_at              TEXT,
    status                TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_external ON sessions(external_session_ref, status);
CREATE TABLE IF NOT EXISTS conversations (
    id                    TEXT PRIMARY KEY,
    session_id            TEXT NOT NULL REFERENCES sessions(id),
    topic_label           TEXT NOT NULL,
    topic_representation  BLOB,
    created_at            TEXT NOT NULL,
    last_active_at        TEXT NOT NULL,
    status                TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id, status);
CREATE TABLE IF NOT EXISTS observations (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id      TEXT NOT NULL,
    conversation_id TEXT,
    kind            TEXT NOT NULL,
    payload_json    TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS knowledge_items (
    id             TEXT PRIMARY KEY,
    project_id     TEXT NOT NULL REFERENCES projects(id),
    kind           TEXT NOT NULL,
    content        TEXT NOT NULL,
    tags_json      TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    superseded_by  TEXT
);
CREATE TABLE IF NOT EXISTS keyword_index (
    token        TEXT NOT NULL,
    entity_kind  TEXT NOT NULL,
    entity_id    TEXT NOT NULL,
    tf           REAL NOT NULL,
    PRIMARY KEY (token, entity_kind, entity_id)
);
CREATE INDEX IF NOT EXISTS idx_keyword_token ON keyword_index(token);
CREATE TABLE IF NOT EXISTS vector_index (
    entity_kind  TEXT NOT NULL,
    entity_id    TEXT NOT NULL,
    model_id     TEXT NOT NULL,
    vector       BLOB NOT NULL,
    PRIMARY KEY (entity_kind, entity_id)
);
CREATE TABLE IF NOT EXISTS meta (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
INSERT OR IGNORE INTO meta (key, value) VALUES ('last_flushed_observation_id', '0');
";

const CHECKPOINT_KEY: &str = "last_flushed_observation_id";

/// 关键词/向量分支返回的候选引用
#[derive(Clone, Debug)]
pub struct ScoredRef {
    pub kind: EntityKind,
    pub id: String,
    pub score: f32,
}

/// 各表行数统计，供宿主状态面板使用
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreStats {
    pub projects: u64,
    pub sessions: u64,
    pub conversations: u64,
    pub observations: u64,
    pub knowledge_items: u64,
}

pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > SCHEMA_VERSION {
            return Err(MemoryError::Configuration(format!(
                "database schema version {} newer than supported {}",
                current, SCHEMA_VERSION
            )));
        }
        if current < 1 {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.pragma_update(None, "user_version", 1)?;
        }
        Ok(())
    }

    /// 连接随 Drop 关闭；这里只做收尾优化，失败可忽略
    pub fn close(&self) {
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute_batch("PRAGMA optimize;") {
            tracing::debug!("PRAGMA optimize failed on close: {}", e);
        }
    }

    // ---- Project ----

    /// 按 root_path 查找项目，不存在时创建（首次检测到即建档，不自动删除）
    pub fn upsert_project(&self, root_path: &str, name: Option<&str>) -> Result<Project> {
        let conn = self.conn.lock().unwrap();
        if let Some(project) = query_project_by_root(&conn, root_path)? {
            return Ok(project);
        }
        let project = Project {
            id: Uuid::new_v4().to_string(),
            root_path: root_path.to_string(),
            name: name
                .map(String::from)
                .unwrap_or_else(|| derive_project_name(root_path)),
        };
        conn.execute(
            "INSERT INTO projects (id, root_path, name) VALUES (?1, ?2, ?3)",
            params![project.id, project.root_path, project.name],
        )?;
        Ok(project)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, root_path, name FROM projects WHERE id = ?1",
                [id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        root_path: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ---- Session ----

    pub fn create_session(&self, external_ref: &str, project_id: &str) -> Result<Session> {
        let mut conn = self.conn.lock().unwrap();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            external_session_ref: external_ref.to_string(),
            project_id: project_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Active,
        };
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sessions (id, external_session_ref, project_id, started_at, ended_at, status)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![
                session.id,
                session.external_session_ref,
                session.project_id,
                session.started_at.to_rfc3339(),
                session.status.as_str(),
            ],
        )?;
        write_keyword_entries(&tx, EntityKind::Session, &session.id, external_ref)?;
        tx.commit()?;
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        query_session(&conn, "WHERE id = ?1", &[&id])
    }

    /// 按宿主侧会话标识查找当前 active 会话
    pub fn active_session_by_external_ref(&self, external_ref: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        query_session(
            &conn,
            "WHERE external_session_ref = ?1 AND status = 'active' ORDER BY started_at DESC LIMIT 1",
            &[&external_ref],
        )
    }

    /// 结束会话：置 ended 并在同一事务内关闭其 open 对话
    pub fn end_session(&self, session_id: &str, when: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE sessions SET status = 'ended', ended_at = ?1 WHERE id = ?2 AND status = 'active'",
            params![when.to_rfc3339(), session_id],
        )?;
        tx.execute(
            "UPDATE conversations SET status = 'closed', last_active_at = ?1
             WHERE session_id = ?2 AND status = 'open'",
            params![when.to_rfc3339(), session_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn mark_session_crashed(&self, session_id: &str, when: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE sessions SET status = 'crashed', ended_at = ?1 WHERE id = ?2",
            params![when.to_rfc3339(), session_id],
        )?;
        tx.execute(
            "UPDATE conversations SET status = 'closed', last_active_at = ?1
             WHERE session_id = ?2 AND status = 'open'",
            params![when.to_rfc3339(), session_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// 所有仍为 active 的会话（启动恢复用：除当前运行外不应存在）
    pub fn stale_active_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, external_session_ref, project_id, started_at, ended_at, status
             FROM sessions WHERE status = 'active' ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map([], session_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- Conversation ----

    pub fn create_conversation(
        &self,
        session_id: &str,
        topic_label: &str,
        representation: Option<&[f32]>,
        model_id: &str,
    ) -> Result<Conversation> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let conversation = insert_conversation(&tx, session_id, topic_label, representation, model_id)?;
        tx.commit()?;
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock().unwrap();
        query_conversation(&conn, "WHERE id = ?1", &[&id])
    }

    /// 会话当前的 open 对话（至多一个）
    pub fn open_conversation(&self, session_id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock().unwrap();
        query_conversation(
            &conn,
            "WHERE session_id = ?1 AND status = 'open' ORDER BY created_at DESC LIMIT 1",
            &[&session_id],
        )
    }

    /// 话题切换：同一事务内关闭旧对话（topic_label 随之冻结）并创建新 open 对话
    pub fn switch_conversation(
        &self,
        session_id: &str,
        closing_id: Option<&str>,
        topic_label: &str,
        representation: Option<&[f32]>,
        model_id: &str,
    ) -> Result<Conversation> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        if let Some(id) = closing_id {
            tx.execute(
                "UPDATE conversations SET status = 'closed', last_active_at = ?1
                 WHERE id = ?2 AND status = 'open'",
                params![now, id],
            )?;
        }
        let conversation = insert_conversation(&tx, session_id, topic_label, representation, model_id)?;
        tx.commit()?;
        Ok(conversation)
    }

    /// 更新话题质心；closed 为终态，WHERE 条件保证只有 open 对话会被改写
    pub fn update_topic_representation(
        &self,
        conversation_id: &str,
        representation: &[f32],
        model_id: &str,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let changed = tx.execute(
            "UPDATE conversations SET topic_representation = ?1, last_active_at = ?2
             WHERE id = ?3 AND status = 'open'",
            params![vector_to_blob(representation), now, conversation_id],
        )?;
        if changed > 0 {
            write_vector_entry(&tx, EntityKind::Conversation, conversation_id, model_id, representation)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn touch_conversation(&self, conversation_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE conversations SET last_active_at = ?1 WHERE id = ?2 AND status = 'open'",
            params![Utc::now().to_rfc3339(), conversation_id],
        )?;
        Ok(())
    }

    // ---- Observation ----

    /// 批量落库：一个事务写入全部观测、更新关键词索引并推进检查点标记。
    /// 返回本批最后一条的 id。
    pub fn insert_observations(&self, batch: &[Observation]) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut last_id = 0i64;
        for obs in batch {
            let payload_json = obs.payload.to_string();
            tx.execute(
                "INSERT INTO observations (session_id, conversation_id, kind, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    obs.session_id,
                    obs.conversation_id,
                    obs.kind,
                    payload_json,
                    obs.created_at.to_rfc3339(),
                ],
            )?;
            last_id = tx.last_insert_rowid();
            write_keyword_entries(
                &tx,
                EntityKind::Observation,
                &last_id.to_string(),
                &obs.index_text(),
            )?;
        }
        if last_id > 0 {
            tx.execute(
                "UPDATE meta SET value = ?1 WHERE key = ?2",
                params![last_id.to_string(), CHECKPOINT_KEY],
            )?;
        }
        tx.commit()?;
        Ok(last_id)
    }

    pub fn get_observation(&self, id: i64) -> Result<Option<Observation>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, session_id, conversation_id, kind, payload_json, created_at
                 FROM observations WHERE id = ?1",
                [id],
                observation_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn observation_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn max_observation_id(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id: i64 = conn.query_row(
            "SELECT IFNULL(MAX(id), 0) FROM observations",
            [],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    // ---- Checkpoint marker ----

    pub fn checkpoint_marker(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let value: String = conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            [CHECKPOINT_KEY],
            |row| row.get(0),
        )?;
        value
            .parse::<i64>()
            .map_err(|e| MemoryError::CorruptIndex(format!("bad checkpoint marker '{}': {}", value, e)))
    }

    pub fn set_checkpoint_marker(&self, value: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE meta SET value = ?1 WHERE key = ?2",
            params![value.to_string(), CHECKPOINT_KEY],
        )?;
        Ok(())
    }

    // ---- KnowledgeItem ----

    /// 保存知识条目：行、关键词索引、向量索引在同一事务内写入
    pub fn insert_knowledge(
        &self,
        project_id: &str,
        kind: KnowledgeKind,
        content: &str,
        tags: &[String],
        embedding: Option<&[f32]>,
        model_id: &str,
    ) -> Result<KnowledgeItem> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let item = insert_knowledge_row(&tx, project_id, kind, content, tags, embedding, model_id)?;
        tx.commit()?;
        Ok(item)
    }

    /// 修订：内容不可变，新行落库并把旧行的 superseded_by 指向它
    pub fn supersede_knowledge(
        &self,
        old_id: &str,
        kind: KnowledgeKind,
        content: &str,
        tags: &[String],
        embedding: Option<&[f32]>,
        model_id: &str,
    ) -> Result<KnowledgeItem> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let project_id: String = tx
            .query_row(
                "SELECT project_id FROM knowledge_items WHERE id = ?1",
                [old_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| MemoryError::CorruptIndex(format!("knowledge item {} not found", old_id)))?;
        let item = insert_knowledge_row(&tx, &project_id, kind, content, tags, embedding, model_id)?;
        tx.execute(
            "UPDATE knowledge_items SET superseded_by = ?1 WHERE id = ?2",
            params![item.id, old_id],
        )?;
        tx.commit()?;
        Ok(item)
    }

    pub fn get_knowledge(&self, id: &str) -> Result<Option<KnowledgeItem>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, project_id, kind, content, tags_json, created_at, superseded_by
                 FROM knowledge_items WHERE id = ?1",
                [id],
                knowledge_from_row,
            )
            .optional()?;
        Ok(row)
    }

    // ---- 实体查找 ----

    pub fn get_entity(&self, kind: EntityKind, id: &str) -> Result<Option<MemoryEntity>> {
        match kind {
            EntityKind::Knowledge => Ok(self.get_knowledge(id)?.map(MemoryEntity::Knowledge)),
            EntityKind::Observation => match id.parse::<i64>() {
                Ok(rowid) => Ok(self.get_observation(rowid)?.map(MemoryEntity::Observation)),
                Err(_) => Ok(None),
            },
            EntityKind::Session => Ok(self.get_session(id)?.map(MemoryEntity::Session)),
            EntityKind::Conversation => Ok(self.get_conversation(id)?.map(MemoryEntity::Conversation)),
        }
    }

    /// 按 id 原样取回实体：整数视为观测 rowid，其余按知识/对话/会话依次尝试
    pub fn find_entity(&self, id: &str) -> Result<Option<MemoryEntity>> {
        if let Ok(rowid) = id.parse::<i64>() {
            return Ok(self.get_observation(rowid)?.map(MemoryEntity::Observation));
        }
        if let Some(item) = self.get_knowledge(id)? {
            return Ok(Some(MemoryEntity::Knowledge(item)));
        }
        if let Some(conv) = self.get_conversation(id)? {
            return Ok(Some(MemoryEntity::Conversation(conv)));
        }
        Ok(self.get_session(id)?.map(MemoryEntity::Session))
    }

    /// 实体所属项目的 root_path（project: 过滤用）；会话/对话/观测经会话归属
    pub fn entity_project_root(&self, kind: EntityKind, id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let sql = match kind {
            EntityKind::Knowledge => {
                "SELECT p.root_path FROM knowledge_items k
                 JOIN projects p ON p.id = k.project_id WHERE k.id = ?1"
            }
            EntityKind::Session => {
                "SELECT p.root_path FROM sessions s
                 JOIN projects p ON p.id = s.project_id WHERE s.id = ?1"
            }
            EntityKind::Conversation => {
                "SELECT p.root_path FROM conversations c
                 JOIN sessions s ON s.id = c.session_id
                 JOIN projects p ON p.id = s.project_id WHERE c.id = ?1"
            }
            EntityKind::Observation => {
                "SELECT p.root_path FROM observations o
                 JOIN sessions s ON s.id = o.session_id
                 JOIN projects p ON p.id = s.project_id WHERE o.id = ?1"
            }
        };
        let row = conn.query_row(sql, [id], |row| row.get(0)).optional()?;
        Ok(row)
    }

    // ---- 检索分支 ----

    /// 关键词分支：TF-IDF 累加，按候选中的最大分归一化到 [0,1]
    pub fn keyword_search(
        &self,
        tokens: &[String],
        kind: Option<EntityKind>,
    ) -> Result<Vec<ScoredRef>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let total_docs: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT entity_kind || ':' || entity_id) FROM keyword_index",
            [],
            |row| row.get(0),
        )?;
        if total_docs == 0 {
            return Ok(Vec::new());
        }

        let mut scores: HashMap<(String, String), f64> = HashMap::new();
        for token in tokens {
            let df: i64 = conn.query_row(
                "SELECT COUNT(*) FROM keyword_index WHERE token = ?1",
                [token],
                |row| row.get(0),
            )?;
            if df == 0 {
                continue;
            }
            let idf = (1.0 + total_docs as f64 / df as f64).ln();
            let mut accumulate = |kind_str: String, id: String, tf: f64| {
                *scores.entry((kind_str, id)).or_insert(0.0) += tf * idf;
            };
            match kind {
                Some(k) => {
                    let mut stmt = conn.prepare(
                        "SELECT entity_kind, entity_id, tf FROM keyword_index
                         WHERE token = ?1 AND entity_kind = ?2",
                    )?;
                    let rows = stmt.query_map(params![token, k.as_str()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
                    })?;
                    for row in rows {
                        let (kind_str, id, tf) = row?;
                        accumulate(kind_str, id, tf);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT entity_kind, entity_id, tf FROM keyword_index WHERE token = ?1",
                    )?;
                    let rows = stmt.query_map([token], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
                    })?;
                    for row in rows {
                        let (kind_str, id, tf) = row?;
                        accumulate(kind_str, id, tf);
                    }
                }
            }
        }

        let max_score = scores.values().cloned().fold(0.0f64, f64::max);
        if max_score <= 0.0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(scores.len());
        for ((kind_str, id), score) in scores {
            let Some(entity_kind) = EntityKind::parse(&kind_str) else {
                return Err(MemoryError::CorruptIndex(format!(
                    "unknown entity kind '{}' in keyword index",
                    kind_str
                )));
            };
            out.push(ScoredRef {
                kind: entity_kind,
                id,
                score: (score / max_score) as f32,
            });
        }
        Ok(out)
    }

    /// 向量分支：全量扫描 vector_index 计算余弦相似度（中等数据量足够）
    pub fn vector_search(&self, query: &[f32], kind: Option<EntityKind>) -> Result<Vec<ScoredRef>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let (sql, kind_param): (&str, Option<&str>) = match kind {
            Some(k) => (
                "SELECT entity_kind, entity_id, vector FROM vector_index WHERE entity_kind = ?1",
                Some(k.as_str()),
            ),
            None => ("SELECT entity_kind, entity_id, vector FROM vector_index", None),
        };
        let mut stmt = conn.prepare(sql)?;
        let mut collect = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, Vec<u8>)> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        };
        let mut out = Vec::new();
        let rows: Vec<(String, String, Vec<u8>)> = match kind_param {
            Some(p) => {
                let mapped = stmt.query_map([p], &mut collect)?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mapped = stmt.query_map([], &mut collect)?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        for (kind_str, id, blob) in rows {
            let Some(entity_kind) = EntityKind::parse(&kind_str) else {
                return Err(MemoryError::CorruptIndex(format!(
                    "unknown entity kind '{}' in vector index",
                    kind_str
                )));
            };
            let score = crate::embedding::cosine_score(query, &blob_to_vector(&blob));
            if score > 0.0 {
                out.push(ScoredRef {
                    kind: entity_kind,
                    id,
                    score,
                });
            }
        }
        Ok(out)
    }

    /// 测试用：直接执行 SQL 制造故障注入（如重命名表模拟写失败）
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> rusqlite::Result<u64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get::<_, i64>(0).map(|n| n as u64)
            })
        };
        Ok(StoreStats {
            projects: count("projects")?,
            sessions: count("sessions")?,
            conversations: count("conversations")?,
            observations: count("observations")?,
            knowledge_items: count("knowledge_items")?,
        })
    }
}

// ---- 行映射与事务内写入辅助 ----

fn query_project_by_root(conn: &Connection, root_path: &str) -> Result<Option<Project>> {
    let row = conn
        .query_row(
            "SELECT id, root_path, name FROM projects WHERE root_path = ?1",
            [root_path],
            |row| {
                Ok(Project {
                    id: row.get(0)?,
                    root_path: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn derive_project_name(root_path: &str) -> String {
    Path::new(root_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root_path.to_string())
}

fn parse_ts(col: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(err))
        })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let started_at: String = row.get(3)?;
    let ended_at: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(Session {
        id: row.get(0)?,
        external_session_ref: row.get(1)?,
        project_id: row.get(2)?,
        started_at: parse_ts(3, started_at)?,
        ended_at: ended_at.map(|s| parse_ts(4, s)).transpose()?,
        status: SessionStatus::parse(&status),
    })
}

fn query_session(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Option<Session>> {
    let sql = format!(
        "SELECT id, external_session_ref, project_id, started_at, ended_at, status FROM sessions {}",
        where_clause
    );
    let row = conn.query_row(&sql, params, session_from_row).optional()?;
    Ok(row)
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let repr: Option<Vec<u8>> = row.get(3)?;
    let created_at: String = row.get(4)?;
    let last_active_at: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(Conversation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        topic_label: row.get(2)?,
        topic_representation: repr.map(|b| blob_to_vector(&b)),
        created_at: parse_ts(4, created_at)?,
        last_active_at: parse_ts(5, last_active_at)?,
        status: ConversationStatus::parse(&status),
    })
}

fn query_conversation(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT id, session_id, topic_label, topic_representation, created_at, last_active_at, status
         FROM conversations {}",
        where_clause
    );
    let row = conn.query_row(&sql, params, conversation_from_row).optional()?;
    Ok(row)
}

fn observation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Observation> {
    let payload_json: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let payload = serde_json::from_str(&payload_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Observation {
        id: Some(row.get(0)?),
        session_id: row.get(1)?,
        conversation_id: row.get(2)?,
        kind: row.get(3)?,
        payload,
        created_at: parse_ts(5, created_at)?,
    })
}

fn knowledge_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeItem> {
    let kind: String = row.get(2)?;
    let tags_json: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(KnowledgeItem {
        id: row.get(0)?,
        project_id: row.get(1)?,
        kind: KnowledgeKind::parse(&kind).unwrap_or(KnowledgeKind::Fact),
        content: row.get(3)?,
        tags,
        created_at: parse_ts(5, created_at)?,
        superseded_by: row.get(6)?,
    })
}

fn insert_conversation(
    tx: &Transaction<'_>,
    session_id: &str,
    topic_label: &str,
    representation: Option<&[f32]>,
    model_id: &str,
) -> Result<Conversation> {
    let now = Utc::now();
    let conversation = Conversation {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        topic_label: topic_label.to_string(),
        topic_representation: representation.map(|v| v.to_vec()),
        created_at: now,
        last_active_at: now,
        status: ConversationStatus::Open,
    };
    tx.execute(
        "INSERT INTO conversations (id, session_id, topic_label, topic_representation, created_at, last_active_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            conversation.id,
            conversation.session_id,
            conversation.topic_label,
            representation.map(vector_to_blob),
            now.to_rfc3339(),
            now.to_rfc3339(),
            conversation.status.as_str(),
        ],
    )?;
    write_keyword_entries(tx, EntityKind::Conversation, &conversation.id, topic_label)?;
    if let Some(repr) = representation {
        write_vector_entry(tx, EntityKind::Conversation, &conversation.id, model_id, repr)?;
    }
    Ok(conversation)
}

fn insert_knowledge_row(
    tx: &Transaction<'_>,
    project_id: &str,
    kind: KnowledgeKind,
    content: &str,
    tags: &[String],
    embedding: Option<&[f32]>,
    model_id: &str,
) -> Result<KnowledgeItem> {
    let item = KnowledgeItem {
        id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        kind,
        content: content.to_string(),
        tags: tags.to_vec(),
        created_at: Utc::now(),
        superseded_by: None,
    };
    let tags_json = serde_json::to_string(&item.tags)
        .map_err(|e| MemoryError::CorruptIndex(format!("tags serialization: {}", e)))?;
    tx.execute(
        "INSERT INTO knowledge_items (id, project_id, kind, content, tags_json, created_at, superseded_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
        params![
            item.id,
            item.project_id,
            item.kind.as_str(),
            item.content,
            tags_json,
            item.created_at.to_rfc3339(),
        ],
    )?;
    let index_text = format!("{} {}", item.content, item.tags.join(" "));
    write_keyword_entries(tx, EntityKind::Knowledge, &item.id, &index_text)?;
    if let Some(vec) = embedding {
        write_vector_entry(tx, EntityKind::Knowledge, &item.id, model_id, vec)?;
    }
    Ok(item)
}

/// 重写实体的倒排索引条目（同一事务内调用）
fn write_keyword_entries(
    tx: &Transaction<'_>,
    kind: EntityKind,
    entity_id: &str,
    text: &str,
) -> Result<()> {
    tx.execute(
        "DELETE FROM keyword_index WHERE entity_kind = ?1 AND entity_id = ?2",
        params![kind.as_str(), entity_id],
    )?;
    for (token, tf) in tokenizer::term_frequencies(text) {
        tx.execute(
            "INSERT INTO keyword_index (token, entity_kind, entity_id, tf) VALUES (?1, ?2, ?3, ?4)",
            params![token, kind.as_str(), entity_id, tf],
        )?;
    }
    Ok(())
}

fn write_vector_entry(
    tx: &Transaction<'_>,
    kind: EntityKind,
    entity_id: &str,
    model_id: &str,
    vector: &[f32],
) -> Result<()> {
    tx.execute(
        "INSERT INTO vector_index (entity_kind, entity_id, model_id, vector) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(entity_kind, entity_id) DO UPDATE SET
             model_id = excluded.model_id,
             vector = excluded.vector",
        params![kind.as_str(), entity_id, model_id, vector_to_blob(vector)],
    )?;
    Ok(())
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
