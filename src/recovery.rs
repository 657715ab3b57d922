//! 启动恢复：收敛上次非正常退出留下的状态
//!
//! 崩溃检测不依赖独立的脏标志：观测落库与检查点标记在同一事务内推进，
//! 因此启动时仍为 active 的会话即是未正常结束的会话。最大损失有界，
//! 为缓冲中未满一个检查点间隔的观测。

use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::store::MemoryStore;

/// 一次恢复的结果，宿主可据此打日志或上报
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryReport {
    /// 被判定为 crashed 的遗留会话数
    pub crashed_sessions: usize,
    /// 检查点标记是否被重新对齐
    pub marker_realigned: bool,
    pub marker_before: i64,
    pub marker_after: i64,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.crashed_sessions == 0 && !self.marker_realigned
    }
}

pub struct RecoveryManager {
    store: Arc<MemoryStore>,
}

impl RecoveryManager {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// 在任何新写入发生之前运行。幂等：干净库上是 no-op。
    pub fn run(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        // 1. 上次运行遗留的 active 会话 → crashed，其 open 对话一并关闭
        let stale = self.store.stale_active_sessions()?;
        for session in &stale {
            tracing::warn!(
                session_id = %session.id,
                external_ref = %session.external_session_ref,
                "stale active session marked crashed; at most one checkpoint interval of observations lost"
            );
            self.store.mark_session_crashed(&session.id, now)?;
        }
        report.crashed_sessions = stale.len();

        // 2. 检查点标记与实际最大观测 id 对齐（撕裂状态的兜底）
        report.marker_before = self.store.checkpoint_marker()?;
        let max_id = self.store.max_observation_id()?;
        if report.marker_before != max_id {
            tracing::warn!(
                marker = report.marker_before,
                max_observation_id = max_id,
                "checkpoint marker out of sync, realigning"
            );
            self.store.set_checkpoint_marker(max_id)?;
            report.marker_realigned = true;
        }
        report.marker_after = max_id;

        if report.is_clean() {
            tracing::debug!("recovery: store is clean");
        } else {
            tracing::info!(
                crashed_sessions = report.crashed_sessions,
                marker_realigned = report.marker_realigned,
                "recovery complete"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConversationStatus, Observation, SessionStatus};

    #[test]
    fn test_clean_store_is_noop() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let report = RecoveryManager::new(store).run().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.crashed_sessions, 0);
    }

    #[test]
    fn test_stale_session_marked_crashed() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        let session = store.create_session("ext", &project.id).unwrap();
        let conv = store
            .create_conversation(&session.id, "topic", None, "m")
            .unwrap();

        let report = RecoveryManager::new(store.clone()).run().unwrap();
        assert_eq!(report.crashed_sessions, 1);

        let recovered = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(recovered.status, SessionStatus::Crashed);
        assert!(recovered.ended_at.is_some());
        let closed = store.get_conversation(&conv.id).unwrap().unwrap();
        assert_eq!(closed.status, ConversationStatus::Closed);
    }

    #[test]
    fn test_marker_realignment() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        let session = store.create_session("ext", &project.id).unwrap();
        store
            .insert_observations(&[Observation::new(
                session.id.clone(),
                None,
                "tool_use",
                serde_json::json!({}),
            )])
            .unwrap();
        // 人为制造撕裂状态
        store.set_checkpoint_marker(99).unwrap();

        let report = RecoveryManager::new(store.clone()).run().unwrap();
        assert!(report.marker_realigned);
        assert_eq!(report.marker_before, 99);
        assert_eq!(report.marker_after, 1);
        assert_eq!(store.checkpoint_marker().unwrap(), 1);
    }

    #[test]
    fn test_recovery_idempotent() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        store.create_session("ext", &project.id).unwrap();

        let manager = RecoveryManager::new(store);
        let first = manager.run().unwrap();
        assert_eq!(first.crashed_sessions, 1);
        let second = manager.run().unwrap();
        assert!(second.is_clean());
    }
}
