//! 对话连续性：基于话题表示的切换判定
//!
//! 每条用户 prompt 与当前 open 对话的话题质心比较余弦相似度，
//! 按双阈值分三档：高于 t_high 视为同一话题（质心 EMA 吸收该 prompt），
//! 低于 t_low 高置信切换（直接开新对话），区间内返回 Ask 请宿主向用户确认。
//! 嵌入失败或超时一律降级为 Ignore，绝不因此打断用户。

use std::sync::Arc;

use crate::embedding::{cosine_score, EmbeddingProvider};
use crate::error::Result;
use crate::store::{Conversation, MemoryStore, Session};

/// 话题切换判定结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicAction {
    /// 同一话题，继续当前对话
    Ignore,
    /// 不确定，请用户确认
    Ask,
    /// 高置信新话题，已自动切换
    Trust,
}

/// 一次 prompt 处理的完整结果
#[derive(Clone, Debug)]
pub struct TopicShiftOutcome {
    pub action: TopicAction,
    /// 当前生效的对话 id（Trust 时为新对话）
    pub conversation_id: String,
    /// 与旧质心的相似度；降级或无质心时为 None
    pub similarity: Option<f32>,
    /// Ask 时给用户的确认文案
    pub suggestion: Option<String>,
    /// 嵌入不可用或失败，判定退化为 Ignore
    pub degraded: bool,
}

pub struct ConversationContinuity {
    store: Arc<MemoryStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    model_id: String,
    t_low: f32,
    t_high: f32,
    centroid_alpha: f32,
}

impl ConversationContinuity {
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        model_id: String,
        t_low: f32,
        t_high: f32,
        centroid_alpha: f32,
    ) -> Self {
        Self {
            store,
            embedder,
            model_id,
            t_low,
            t_high,
            centroid_alpha,
        }
    }

    /// 相似度 → 动作。相似度越低动作越激进，分档单调。
    pub fn classify(&self, similarity: f32) -> TopicAction {
        if similarity >= self.t_high {
            TopicAction::Ignore
        } else if similarity < self.t_low {
            TopicAction::Trust
        } else {
            TopicAction::Ask
        }
    }

    /// 处理一条用户 prompt，返回判定结果。
    /// Ask 分支不写任何状态，由宿主拿到用户答复后调用
    /// [`confirm_topic_shift`](Self::confirm_topic_shift) 或
    /// [`continue_topic`](Self::continue_topic)。
    pub fn handle_prompt(&self, session: &Session, prompt: &str) -> Result<TopicShiftOutcome> {
        let open = self.store.open_conversation(&session.id)?;

        let vector = match self.embed(prompt) {
            Some(v) => v,
            None => return self.degrade(session, open, prompt),
        };

        let Some(conversation) = open else {
            // 会话首条 prompt：开新对话，质心即该 prompt 向量
            let repr = normalize(&vector);
            let conv = self.store.create_conversation(
                &session.id,
                &derive_topic_label(prompt),
                Some(&repr),
                &self.model_id,
            )?;
            return Ok(TopicShiftOutcome {
                action: TopicAction::Ignore,
                conversation_id: conv.id,
                similarity: None,
                suggestion: None,
                degraded: false,
            });
        };

        let Some(centroid) = conversation.topic_representation.as_deref() else {
            // 降级期间创建的对话没有质心，用当前 prompt 补上
            let repr = normalize(&vector);
            self.store
                .update_topic_representation(&conversation.id, &repr, &self.model_id)?;
            return Ok(TopicShiftOutcome {
                action: TopicAction::Ignore,
                conversation_id: conversation.id,
                similarity: None,
                suggestion: None,
                degraded: false,
            });
        };

        let similarity = cosine_score(&vector, centroid);
        let action = self.classify(similarity);
        tracing::debug!(
            conversation_id = %conversation.id,
            similarity,
            ?action,
            "topic shift check"
        );

        match action {
            TopicAction::Ignore => {
                let updated = blend_centroid(centroid, &vector, self.centroid_alpha);
                self.store
                    .update_topic_representation(&conversation.id, &updated, &self.model_id)?;
                Ok(TopicShiftOutcome {
                    action,
                    conversation_id: conversation.id,
                    similarity: Some(similarity),
                    suggestion: None,
                    degraded: false,
                })
            }
            TopicAction::Trust => {
                let repr = normalize(&vector);
                let next = self.store.switch_conversation(
                    &session.id,
                    Some(&conversation.id),
                    &derive_topic_label(prompt),
                    Some(&repr),
                    &self.model_id,
                )?;
                tracing::info!(
                    from = %conversation.id,
                    to = %next.id,
                    similarity,
                    "high-confidence topic shift, switched conversation"
                );
                Ok(TopicShiftOutcome {
                    action,
                    conversation_id: next.id,
                    similarity: Some(similarity),
                    suggestion: None,
                    degraded: false,
                })
            }
            TopicAction::Ask => Ok(TopicShiftOutcome {
                action,
                conversation_id: conversation.id.clone(),
                similarity: Some(similarity),
                suggestion: Some(format!(
                    "这条消息看起来换了话题（当前话题：{}）。要开始新对话吗？",
                    conversation.topic_label
                )),
                degraded: false,
            }),
        }
    }

    /// 用户确认切换：关闭旧对话并以该 prompt 开新对话
    pub fn confirm_topic_shift(
        &self,
        session: &Session,
        closing_conversation_id: &str,
        prompt: &str,
    ) -> Result<Conversation> {
        let repr = self.embed(prompt).map(|v| normalize(&v));
        self.store.switch_conversation(
            &session.id,
            Some(closing_conversation_id),
            &derive_topic_label(prompt),
            repr.as_deref(),
            &self.model_id,
        )
    }

    /// 用户否认切换：留在当前对话，把该 prompt 吸收进质心
    pub fn continue_topic(&self, conversation_id: &str, prompt: &str) -> Result<()> {
        let Some(vector) = self.embed(prompt) else {
            return self.store.touch_conversation(conversation_id);
        };
        let Some(conversation) = self.store.get_conversation(conversation_id)? else {
            return Ok(());
        };
        let updated = match conversation.topic_representation.as_deref() {
            Some(centroid) => blend_centroid(centroid, &vector, self.centroid_alpha),
            None => normalize(&vector),
        };
        self.store
            .update_topic_representation(conversation_id, &updated, &self.model_id)
    }

    fn embed(&self, prompt: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed_sync(prompt) {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "prompt embedding failed, degrading to Ignore");
                None
            }
        }
    }

    /// 嵌入不可用：保证有 open 对话可挂观测，判定恒为 Ignore
    fn degrade(
        &self,
        session: &Session,
        open: Option<Conversation>,
        prompt: &str,
    ) -> Result<TopicShiftOutcome> {
        let conversation_id = match open {
            Some(conv) => {
                self.store.touch_conversation(&conv.id)?;
                conv.id
            }
            None => {
                self.store
                    .create_conversation(&session.id, &derive_topic_label(prompt), None, &self.model_id)?
                    .id
            }
        };
        Ok(TopicShiftOutcome {
            action: TopicAction::Ignore,
            conversation_id,
            similarity: None,
            suggestion: None,
            degraded: true,
        })
    }
}

/// 质心 EMA：c' = normalize(alpha * v + (1 - alpha) * c)
fn blend_centroid(centroid: &[f32], vector: &[f32], alpha: f32) -> Vec<f32> {
    if centroid.len() != vector.len() {
        return normalize(vector);
    }
    let blended: Vec<f32> = centroid
        .iter()
        .zip(vector.iter())
        .map(|(c, v)| alpha * v + (1.0 - alpha) * c)
        .collect();
    normalize(&blended)
}

fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        vector.to_vec()
    } else {
        vector.iter().map(|x| x / norm).collect()
    }
}

/// 从 prompt 开头截取话题标签（至多 60 字符，按字符边界）
fn derive_topic_label(prompt: &str) -> String {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return "untitled".to_string();
    }
    let label: String = trimmed.chars().take(60).collect();
    label
}
