//! 观测暂存缓冲：O(1) 追加，按检查点间隔批量落库
//!
//! flush 采用段交换：先在锁内取走整段待写观测并释放锁，再做落库 IO，
//! 新事件在落库期间照常进入缓冲。落库失败时整段按原顺序放回队首，
//! 下次 flush 重试，不丢事件也不打乱顺序。

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::store::{MemoryStore, Observation};

pub struct StagingBuffer {
    store: Arc<MemoryStore>,
    pending: Mutex<Vec<Observation>>,
    checkpoint_interval: usize,
}

impl StagingBuffer {
    pub fn new(store: Arc<MemoryStore>, checkpoint_interval: usize) -> Self {
        Self {
            store,
            pending: Mutex::new(Vec::new()),
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    /// 追加一条观测；攒满一个检查点间隔时自动 flush。
    /// 返回本次触发落库的条数（未触发为 0）。
    ///
    /// 对调用方永不失败：自动 flush 出错时观测已放回队首等待重试，
    /// 错误止于日志。只有显式 [`flush`](Self::flush) 才向调用方报告错误。
    pub fn append(&self, observation: Observation) -> usize {
        let should_flush = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(observation);
            pending.len() >= self.checkpoint_interval
        };
        if should_flush {
            self.flush().unwrap_or(0)
        } else {
            0
        }
    }

    /// 将当前全部待写观测落库，返回写入条数；空缓冲是 no-op。
    ///
    /// 落库与检查点标记推进在存储层同一事务内完成，失败时该段观测
    /// 放回队首等待重试。
    pub fn flush(&self) -> Result<usize> {
        let segment = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *pending)
        };

        let count = segment.len();
        match self.store.insert_observations(&segment) {
            Ok(last_id) => {
                tracing::debug!(count, last_id, "observation segment flushed");
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(count, error = %e, "flush failed, re-queueing segment");
                let mut pending = self.pending.lock().unwrap();
                let newer = std::mem::take(&mut *pending);
                let mut restored = segment;
                restored.extend(newer);
                *pending = restored;
                Err(e)
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
