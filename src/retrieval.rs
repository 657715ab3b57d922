//! 混合检索：关键词分支 + 向量分支加权融合
//!
//! 查询支持 `type:` 与 `project:` 限定词，剩余文本同时走 TF-IDF 倒排
//! 与余弦向量两条分支。双分支都命中的条目不打折，单分支命中乘覆盖惩罚，
//! 保证双信号条目排在前面。嵌入不可用时退化为纯关键词检索并置 degraded。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::store::{EntityKind, MemoryEntity, MemoryStore};
use crate::tokenizer;

const SNIPPET_RADIUS: usize = 60;

/// 检索参数；limit 为 None 时用配置的默认值
#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
}

/// 单条命中
#[derive(Clone, Debug, Serialize)]
pub struct SearchHit {
    pub kind: EntityKind,
    pub id: String,
    pub score: f32,
    pub snippet: String,
}

/// 检索结果；degraded 表示向量分支未参与
#[derive(Clone, Debug, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub degraded: bool,
}

/// 解析后的查询：限定词 + 自由文本
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ParsedQuery {
    pub kind: Option<EntityKind>,
    pub project_root: Option<String>,
    pub text: String,
}

pub(crate) fn parse_query(raw: &str) -> ParsedQuery {
    let mut kind = None;
    let mut project_root = None;
    let mut rest = Vec::new();
    for token in raw.split_whitespace() {
        if let Some(value) = token.strip_prefix("type:") {
            // 非法类别按普通词处理，不静默吞掉
            match EntityKind::parse(value) {
                Some(k) => kind = Some(k),
                None => rest.push(token),
            }
        } else if let Some(value) = token.strip_prefix("project:") {
            if value.is_empty() {
                rest.push(token);
            } else {
                project_root = Some(value.to_string());
            }
        } else {
            rest.push(token);
        }
    }
    ParsedQuery {
        kind,
        project_root,
        text: rest.join(" "),
    }
}

pub struct HybridRetriever {
    store: Arc<MemoryStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    keyword_weight: f32,
    vector_weight: f32,
    coverage_penalty: f32,
    default_limit: usize,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        keyword_weight: f32,
        vector_weight: f32,
        coverage_penalty: f32,
        default_limit: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            keyword_weight,
            vector_weight,
            coverage_penalty,
            default_limit,
        }
    }

    pub fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        let parsed = parse_query(query);
        let limit = options.limit.unwrap_or(self.default_limit);

        // 限定词抽掉后没有检索文本：空结果，不算降级
        if parsed.text.trim().is_empty() {
            return Ok(SearchResponse {
                hits: Vec::new(),
                degraded: false,
            });
        }
        let tokens = tokenizer::tokenize(&parsed.text);

        let keyword_hits = self.store.keyword_search(&tokens, parsed.kind)?;

        let (vector_hits, degraded) = match self.embed_query(&parsed.text) {
            Some(vector) => (self.store.vector_search(&vector, parsed.kind)?, false),
            None => (Vec::new(), true),
        };

        // (kind, id) -> (关键词分, 向量分)
        let mut merged: HashMap<(EntityKind, String), (f32, f32)> = HashMap::new();
        for hit in keyword_hits {
            merged.entry((hit.kind, hit.id)).or_insert((0.0, 0.0)).0 = hit.score;
        }
        for hit in vector_hits {
            merged.entry((hit.kind, hit.id)).or_insert((0.0, 0.0)).1 = hit.score;
        }

        let mut candidates = Vec::new();
        for ((kind, id), (kw, vec)) in merged {
            // 双分支命中取加权和；单分支命中用原始分乘覆盖惩罚；
            // 向量分支未运行（降级）时保持纯关键词排序
            let score = if kw > 0.0 && vec > 0.0 {
                self.keyword_weight * kw + self.vector_weight * vec
            } else if degraded {
                kw
            } else {
                kw.max(vec) * self.coverage_penalty
            };
            if score <= 0.0 {
                continue;
            }
            if let Some(ref root) = parsed.project_root {
                match self.store.entity_project_root(kind, &id)? {
                    Some(entity_root) if &entity_root == root => {}
                    _ => continue,
                }
            }
            let Some(entity) = self.store.get_entity(kind, &id)? else {
                // 索引指向已消失的行，跳过而不是失败
                tracing::warn!(kind = kind.as_str(), id = %id, "index entry without backing row");
                continue;
            };
            let created_at = entity.created_at();
            candidates.push((
                score,
                created_at,
                SearchHit {
                    kind,
                    id,
                    score,
                    snippet: make_snippet(&entity, &tokens),
                },
            ));
        }

        // 分数降序，同分按 created_at 降序（新的在前）
        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });
        let hits: Vec<SearchHit> = candidates
            .into_iter()
            .take(limit)
            .map(|(_, _, hit)| hit)
            .collect();

        tracing::debug!(
            query,
            hit_count = hits.len(),
            degraded,
            "hybrid search complete"
        );
        Ok(SearchResponse { hits, degraded })
    }

    fn embed_query(&self, text: &str) -> Option<Vec<f32>> {
        if text.trim().is_empty() {
            return None;
        }
        let embedder = self.embedder.as_ref()?;
        match embedder.embed_sync(text) {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, keyword-only search");
                None
            }
        }
    }
}

/// 围绕首个命中词截取摘要片段；没有命中词时取文本开头
fn make_snippet(entity: &MemoryEntity, tokens: &[String]) -> String {
    let text = entity.display_text();
    let lower = text.to_lowercase();
    let match_pos = tokens
        .iter()
        .filter_map(|t| lower.find(t.as_str()))
        .min()
        .unwrap_or(0);

    let chars: Vec<char> = text.chars().collect();
    // 命中偏移来自小写副本，按它折算字符位置
    let char_pos = lower[..match_pos].chars().count().min(chars.len());
    let start = char_pos.saturating_sub(SNIPPET_RADIUS);
    let end = (char_pos + SNIPPET_RADIUS).min(chars.len());

    let mut snippet = String::new();
    if start > 0 {
        snippet.push('…');
    }
    snippet.extend(&chars[start..end]);
    if end < chars.len() {
        snippet.push('…');
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KnowledgeKind;

    struct FixedEmbedder {
        vector: Vec<f32>,
    }

    impl EmbeddingProvider for FixedEmbedder {
        fn embed_sync(&self, _text: &str) -> std::result::Result<Vec<f32>, String> {
            Ok(self.vector.clone())
        }
    }

    fn retriever(
        store: Arc<MemoryStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> HybridRetriever {
        HybridRetriever::new(store, embedder, 0.5, 0.5, 0.8, 10)
    }

    #[test]
    fn test_parse_query_qualifiers() {
        let parsed = parse_query("type:knowledge project:/home/dev/acme oauth tokens");
        assert_eq!(parsed.kind, Some(EntityKind::Knowledge));
        assert_eq!(parsed.project_root.as_deref(), Some("/home/dev/acme"));
        assert_eq!(parsed.text, "oauth tokens");
    }

    #[test]
    fn test_parse_query_invalid_type_kept_as_text() {
        let parsed = parse_query("type:bogus oauth");
        assert_eq!(parsed.kind, None);
        assert_eq!(parsed.text, "type:bogus oauth");
    }

    #[test]
    fn test_dual_signal_outranks_single_signal() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        // 双信号条目：关键词命中 + 向量接近
        let dual = store
            .insert_knowledge(
                &project.id,
                KnowledgeKind::Fact,
                "oauth token rotation policy",
                &[],
                Some(&[1.0, 0.0]),
                "m",
            )
            .unwrap();
        // 仅关键词：向量远离
        let single = store
            .insert_knowledge(
                &project.id,
                KnowledgeKind::Fact,
                "oauth client setup notes",
                &[],
                Some(&[0.0, 1.0]),
                "m",
            )
            .unwrap();

        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(FixedEmbedder {
            vector: vec![1.0, 0.0],
        });
        let r = retriever(store, Some(embedder));
        let response = r.search("oauth", &SearchOptions::default()).unwrap();
        assert!(!response.degraded);
        assert!(response.hits.len() >= 2);
        assert_eq!(response.hits[0].id, dual.id);
        assert!(response.hits.iter().any(|h| h.id == single.id));
    }

    #[test]
    fn test_degraded_without_embedder() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        store
            .insert_knowledge(&project.id, KnowledgeKind::Fact, "database uses sqlite", &[], None, "m")
            .unwrap();

        let r = retriever(store, None);
        let response = r.search("sqlite", &SearchOptions::default()).unwrap();
        assert!(response.degraded);
        assert_eq!(response.hits.len(), 1);
        // 降级时保持纯关键词分数，不加权也不惩罚
        assert!((response.hits[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_single_branch_penalty_uses_raw_score() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        // 仅关键词命中（无向量条目）
        store
            .insert_knowledge(&project.id, KnowledgeKind::Fact, "oauth notes", &[], None, "m")
            .unwrap();

        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(FixedEmbedder {
            vector: vec![1.0, 0.0],
        });
        let r = retriever(store, Some(embedder));
        let response = r.search("oauth", &SearchOptions::default()).unwrap();
        assert!(!response.degraded);
        // 单分支：原始分 1.0 × 惩罚 0.8，而不是加权后再打折
        assert!((response.hits[0].score - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_equal_scores_break_ties_by_recency() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        let older = store
            .insert_knowledge(&project.id, KnowledgeKind::Fact, "oauth rotation", &[], None, "m")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = store
            .insert_knowledge(&project.id, KnowledgeKind::Fact, "oauth rotation", &[], None, "m")
            .unwrap();

        let r = retriever(store, None);
        // 同分条目稳定地按 created_at 降序
        for _ in 0..10 {
            let response = r.search("oauth rotation", &SearchOptions::default()).unwrap();
            assert_eq!(response.hits.len(), 2);
            assert_eq!(response.hits[0].id, newer.id);
            assert_eq!(response.hits[1].id, older.id);
        }
    }

    #[test]
    fn test_qualifier_only_query_is_empty_not_degraded() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        store
            .insert_knowledge(&project.id, KnowledgeKind::Fact, "some fact", &[], None, "m")
            .unwrap();

        let r = retriever(store, None);
        let response = r.search("type:knowledge", &SearchOptions::default()).unwrap();
        assert!(response.hits.is_empty());
        assert!(!response.degraded);

        let blank = r.search("   ", &SearchOptions::default()).unwrap();
        assert!(blank.hits.is_empty());
        assert!(!blank.degraded);
    }

    #[test]
    fn test_type_filter_restricts_results() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        let session = store.create_session("oauth-session", &project.id).unwrap();
        store
            .insert_knowledge(&project.id, KnowledgeKind::Fact, "oauth notes", &[], None, "m")
            .unwrap();

        let r = retriever(store, None);
        let response = r.search("type:knowledge oauth", &SearchOptions::default()).unwrap();
        assert!(response.hits.iter().all(|h| h.kind == EntityKind::Knowledge));
        assert!(!response.hits.is_empty());

        let sessions = r.search("type:session oauth", &SearchOptions::default()).unwrap();
        assert!(sessions.hits.iter().all(|h| h.kind == EntityKind::Session));
        assert!(sessions.hits.iter().any(|h| h.id == session.id));
    }

    #[test]
    fn test_project_filter() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let p1 = store.upsert_project("/home/dev/alpha", None).unwrap();
        let p2 = store.upsert_project("/home/dev/beta", None).unwrap();
        let in_alpha = store
            .insert_knowledge(&p1.id, KnowledgeKind::Fact, "oauth in alpha", &[], None, "m")
            .unwrap();
        store
            .insert_knowledge(&p2.id, KnowledgeKind::Fact, "oauth in beta", &[], None, "m")
            .unwrap();

        let r = retriever(store, None);
        let response = r
            .search("project:/home/dev/alpha oauth", &SearchOptions::default())
            .unwrap();
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].id, in_alpha.id);
    }

    #[test]
    fn test_limit_respected() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        for i in 0..5 {
            store
                .insert_knowledge(
                    &project.id,
                    KnowledgeKind::Fact,
                    &format!("oauth note number {}", i),
                    &[],
                    None,
                    "m",
                )
                .unwrap();
        }
        let r = retriever(store, None);
        let response = r
            .search("oauth", &SearchOptions { limit: Some(2) })
            .unwrap();
        assert_eq!(response.hits.len(), 2);
    }

    #[test]
    fn test_snippet_contains_match() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let project = store.upsert_project("/tmp/p", None).unwrap();
        let long = format!("{} oauth appears here {}", "x".repeat(200), "y".repeat(200));
        store
            .insert_knowledge(&project.id, KnowledgeKind::Fact, &long, &[], None, "m")
            .unwrap();
        let r = retriever(store, None);
        let response = r.search("oauth", &SearchOptions::default()).unwrap();
        assert!(response.hits[0].snippet.contains("oauth"));
        assert!(response.hits[0].snippet.chars().count() <= 2 * SNIPPET_RADIUS + 2);
    }
}
