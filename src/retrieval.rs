//! Retrieval Engine (C7): describe / grep / expand, all gated by the
//! expansion authorization registry when a delegate session key is present.

use std::collections::{HashSet, VecDeque};

use regex::Regex;
use sqlx::Row;
use unicode_segmentation::UnicodeSegmentation;

use crate::auth::{AuthorizeRequest, ExpansionGrantRegistry};
use crate::error::LcmResult;
use crate::ids::{ConversationId, ItemId};
use crate::model::{Artifact, ContextItem, ContextItemType, Message};
use crate::observability::Recorder;
use crate::store::Store;

const SNIPPET_MAX_GRAPHEMES: usize = 200;

#[derive(Debug, Clone)]
pub enum Describe {
    Summary {
        id: ItemId,
        conversation_id: ConversationId,
        item_type: ContextItemType,
        title: Option<String>,
        token_estimate: i64,
        created_at_ms: i64,
        metadata: serde_json::Value,
        parent_ids: Vec<ItemId>,
        child_ids: Vec<ItemId>,
    },
    File {
        id: ItemId,
        conversation_id: ConversationId,
        artifact: Artifact,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrepMode {
    Regex,
    FullText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrepScope {
    Messages,
    Summaries,
    Both,
}

#[derive(Debug, Clone)]
pub struct GrepRequest {
    pub query: String,
    pub mode: GrepMode,
    pub scope: GrepScope,
    pub conversation_id: Option<ConversationId>,
    pub limit: usize,
    pub session_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GrepMatch {
    pub id: String,
    pub conversation_id: ConversationId,
    pub snippet: String,
    pub score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct GrepResult {
    pub matches: Vec<GrepMatch>,
    pub scanned_count: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ExpandRequest {
    pub summary_id: ItemId,
    pub depth: i64,
    pub include_messages: bool,
    pub token_cap: i64,
    pub limit: usize,
    pub session_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExpandResult {
    pub root_summary_id: ItemId,
    pub conversation_id: ConversationId,
    pub summaries: Vec<ContextItem>,
    pub messages: Vec<Message>,
    pub estimated_tokens: i64,
    pub truncated: bool,
    pub next_summary_ids: Vec<ItemId>,
}

pub struct RetrievalEngine {
    store: Store,
    auth: std::sync::Arc<ExpansionGrantRegistry>,
    recorder: std::sync::Arc<Recorder>,
    scan_cap: usize,
}

impl RetrievalEngine {
    pub fn new(store: Store, auth: std::sync::Arc<ExpansionGrantRegistry>, recorder: std::sync::Arc<Recorder>, scan_cap: usize) -> Self {
        Self { store, auth, recorder, scan_cap }
    }

    fn check_auth(&self, session_key: &Option<String>, conversation_id: &ConversationId, depth: i64, token_cap: i64, now_ms: i64) -> LcmResult<()> {
        self.auth.authorize(
            &AuthorizeRequest { session_key: session_key.clone(), conversation_id: conversation_id.clone(), depth, token_cap },
            now_ms,
        )?;
        Ok(())
    }

    /// Resolves an item's lineage/metadata, same as `expand()` resolves a
    /// traversal: existence is checked first, then the item's conversation
    /// is authorized against `session_key` before anything about it is
    /// returned. A delegate session with no (or an out-of-scope) grant for
    /// that conversation gets an `Authorization` error, not a quiet peek.
    pub async fn describe(&self, id: &ItemId, session_key: &Option<String>, now_ms: i64) -> LcmResult<Option<Describe>> {
        let Some(item) = self.store.get_context_item(id).await? else {
            if let Some(artifact) = self.store.get_artifact(&crate::ids::ArtifactId::new(id.as_str())).await? {
                self.check_auth(session_key, &artifact.conversation_id, 0, 1, now_ms)?;
                return Ok(Some(Describe::File { id: id.clone(), conversation_id: artifact.conversation_id.clone(), artifact }));
            }
            return Ok(None);
        };

        self.check_auth(session_key, &item.conversation_id, 0, 1, now_ms)?;

        let lineage = self.store.lineage_of(id).await?;
        Ok(Some(Describe::Summary {
            id: item.item_id.clone(),
            conversation_id: item.conversation_id.clone(),
            item_type: item.item_type,
            title: item.title.clone(),
            token_estimate: item.token_estimate(),
            created_at_ms: item.created_at_ms,
            metadata: item.metadata_json.clone(),
            parent_ids: lineage.parent_ids,
            child_ids: lineage.child_ids,
        }))
    }

    /// A global search (no `conversation_id`) scans every conversation's
    /// rows, which a delegate session's grant can never cover — it's always
    /// scoped to specific conversations. Such a session must narrow the
    /// search to one of its granted conversations instead.
    pub async fn grep(&self, request: &GrepRequest, now_ms: i64) -> LcmResult<GrepResult> {
        match &request.conversation_id {
            Some(conversation_id) => self.check_auth(&request.session_key, conversation_id, 0, 1, now_ms)?,
            None if request.session_key.is_some() => {
                return Err(crate::error::LcmError::Authorization(crate::error::AuthCode::MissingConversationScope));
            }
            None => {}
        }

        let started = now_ms;
        let result = match request.mode {
            GrepMode::FullText => self.grep_full_text(request).await?,
            GrepMode::Regex => self.grep_regex(request).await?,
        };
        self.recorder.record_search_latency(
            scope_label(request.scope),
            mode_label(request.mode),
            (now_ms - started).max(0),
            result.scanned_count as i64,
            result.matches.len() as i64,
        );
        Ok(result)
    }

    async fn grep_full_text(&self, request: &GrepRequest) -> LcmResult<GrepResult> {
        let tokenized = tokenize_as_phrases(&request.query);
        let match_expr = if tokenized.is_empty() { "\"\"".to_string() } else { tokenized };

        let limit = request.limit.max(1) as i64;
        let rows = if let Some(conversation_id) = &request.conversation_id {
            sqlx::query(
                "SELECT c.item_id, c.conversation_id, c.title, c.body, fts.rank AS rank
                 FROM context_items_fts fts
                 JOIN context_items c ON c.item_id = fts.item_id
                 WHERE context_items_fts MATCH ?1 AND c.tombstoned = 0 AND c.conversation_id = ?2
                 ORDER BY rank LIMIT ?3",
            )
            .bind(&match_expr)
            .bind(conversation_id.as_str())
            .bind(limit)
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query(
                "SELECT c.item_id, c.conversation_id, c.title, c.body, fts.rank AS rank
                 FROM context_items_fts fts
                 JOIN context_items c ON c.item_id = fts.item_id
                 WHERE context_items_fts MATCH ?1 AND c.tombstoned = 0
                 ORDER BY rank LIMIT ?2",
            )
            .bind(&match_expr)
            .bind(limit)
            .fetch_all(self.store.pool())
            .await?
        };

        let scanned_count = rows.len();
        let matches = rows
            .iter()
            .filter_map(|row| {
                let item_id: String = row.try_get("item_id").ok()?;
                let conversation_id: String = row.try_get("conversation_id").ok()?;
                let body: String = row.try_get("body").ok()?;
                let rank: f64 = row.try_get("rank").ok().unwrap_or(0.0);
                Some(GrepMatch { id: item_id, conversation_id: ConversationId::new(conversation_id), snippet: snippet_of(&body), score: Some(rank) })
            })
            .collect::<Vec<_>>();

        Ok(GrepResult { truncated: scanned_count >= request.limit, matches, scanned_count })
    }

    async fn grep_regex(&self, request: &GrepRequest) -> LcmResult<GrepResult> {
        let re = Regex::new(&request.query).map_err(|e| crate::error::LcmError::validation(format!("invalid regex: {e}")))?;
        let mut matches = Vec::new();
        let mut scanned_count = 0usize;
        let mut truncated = false;

        if matches!(request.scope, GrepScope::Messages | GrepScope::Both) {
            let messages = self.scan_messages(&request.conversation_id).await?;
            for message in messages {
                scanned_count += 1;
                if scanned_count > self.scan_cap {
                    truncated = true;
                    break;
                }
                if re.is_match(&message.content_text) {
                    matches.push(GrepMatch {
                        id: message.message_id.as_str().to_string(),
                        conversation_id: message.conversation_id.clone(),
                        snippet: snippet_of(&message.content_text),
                        score: None,
                    });
                }
                if matches.len() >= request.limit {
                    truncated = true;
                    break;
                }
            }
        }

        if matches!(request.scope, GrepScope::Summaries | GrepScope::Both) && matches.len() < request.limit {
            let summaries = self.scan_summaries(&request.conversation_id).await?;
            for item in summaries {
                scanned_count += 1;
                if scanned_count > self.scan_cap {
                    truncated = true;
                    break;
                }
                if re.is_match(&item.body) {
                    matches.push(GrepMatch { id: item.item_id.as_str().to_string(), conversation_id: item.conversation_id.clone(), snippet: snippet_of(&item.body), score: None });
                }
                if matches.len() >= request.limit {
                    truncated = true;
                    break;
                }
            }
        }

        Ok(GrepResult { matches, scanned_count, truncated })
    }

    async fn scan_messages(&self, conversation_id: &Option<ConversationId>) -> LcmResult<Vec<Message>> {
        match conversation_id {
            Some(conv) => self.store.list_messages(conv, None, Some(self.scan_cap as i64)).await,
            None => {
                let rows = sqlx::query(
                    "SELECT message_id, conversation_id, ordinal, role, author_id, content_text, payload_json, created_at_ms
                     FROM messages ORDER BY ordinal LIMIT ?1",
                )
                .bind(self.scan_cap as i64)
                .fetch_all(self.store.pool())
                .await?;
                rows.iter()
                    .map(|row| {
                        Ok(Message {
                            message_id: crate::ids::MessageId::new(row.try_get::<String, _>("message_id")?),
                            conversation_id: ConversationId::new(row.try_get::<String, _>("conversation_id")?),
                            ordinal: row.try_get("ordinal")?,
                            role: crate::model::Role::parse(&row.try_get::<String, _>("role")?).unwrap_or(crate::model::Role::User),
                            author_id: row.try_get("author_id")?,
                            content_text: row.try_get("content_text")?,
                            payload_json: serde_json::from_str(&row.try_get::<String, _>("payload_json")?).unwrap_or(serde_json::json!({})),
                            created_at_ms: row.try_get("created_at_ms")?,
                        })
                    })
                    .collect()
            }
        }
    }

    async fn scan_summaries(&self, conversation_id: &Option<ConversationId>) -> LcmResult<Vec<ContextItem>> {
        match conversation_id {
            Some(conv) => {
                self.store
                    .get_context_items(
                        conv,
                        &crate::store::GetContextItemsFilter { include_tombstoned: false, item_types: vec![ContextItemType::Summary], limit: Some(self.scan_cap as i64) },
                    )
                    .await
            }
            None => {
                let rows = sqlx::query(
                    "SELECT item_id, conversation_id, source_message_id, item_type, depth, title, body, metadata_json, tombstoned, created_at_ms, updated_at_ms
                     FROM context_items WHERE item_type = 'summary' AND tombstoned = 0 ORDER BY created_at_ms, item_id LIMIT ?1",
                )
                .bind(self.scan_cap as i64)
                .fetch_all(self.store.pool())
                .await?;
                rows.iter()
                    .map(|row| {
                        let source_message_id: Option<String> = row.try_get("source_message_id")?;
                        Ok(ContextItem {
                            item_id: ItemId::new(row.try_get::<String, _>("item_id")?),
                            conversation_id: ConversationId::new(row.try_get::<String, _>("conversation_id")?),
                            source_message_id: source_message_id.map(crate::ids::MessageId::new),
                            item_type: ContextItemType::Summary,
                            depth: row.try_get("depth")?,
                            title: row.try_get("title")?,
                            body: row.try_get("body")?,
                            metadata_json: serde_json::from_str(&row.try_get::<String, _>("metadata_json")?).unwrap_or(serde_json::json!({})),
                            tombstoned: row.try_get::<i64, _>("tombstoned")? != 0,
                            created_at_ms: row.try_get("created_at_ms")?,
                            updated_at_ms: row.try_get("updated_at_ms")?,
                        })
                    })
                    .collect()
            }
        }
    }

    pub async fn expand(&self, request: &ExpandRequest, now_ms: i64) -> LcmResult<ExpandResult> {
        let root = self
            .store
            .get_context_item(&request.summary_id)
            .await?
            .ok_or_else(|| crate::error::LcmError::not_found(format!("summary {} not found", request.summary_id)))?;

        self.check_auth(&request.session_key, &root.conversation_id, request.depth, request.token_cap, now_ms)?;

        let started = now_ms;
        let mut visited = HashSet::new();
        visited.insert(root.item_id.clone());
        let mut frontier: VecDeque<(ItemId, i64)> = VecDeque::new();
        frontier.push_back((root.item_id.clone(), 0));

        let mut summaries = Vec::new();
        let mut estimated_tokens = 0i64;
        let mut truncated = false;
        let mut next_summary_ids = Vec::new();

        while let Some((current_id, current_depth)) = frontier.pop_front() {
            if summaries.len() >= request.limit {
                next_summary_ids.push(current_id);
                truncated = true;
                continue;
            }

            let Some(item) = self.store.get_context_item(&current_id).await? else { continue };
            let item_tokens = item.token_estimate();
            if estimated_tokens + item_tokens > request.token_cap {
                next_summary_ids.push(current_id);
                truncated = true;
                continue;
            }
            estimated_tokens += item_tokens;
            let is_root = current_id == root.item_id;
            if !is_root {
                summaries.push(item.clone());
            }

            if current_depth >= request.depth {
                continue;
            }

            let edges = self.store.edges_from(&current_id).await?;
            for edge in edges {
                if visited.insert(edge.child_item_id.clone()) {
                    frontier.push_back((edge.child_item_id, current_depth + 1));
                }
            }
        }

        let mut messages = Vec::new();
        if request.include_messages {
            for summary in summaries.iter().chain(std::iter::once(&root)) {
                let mut reachable = self.store.get_summary_messages(&summary.item_id, None).await?;
                messages.append(&mut reachable);
            }
            messages.sort_by_key(|m| m.ordinal);
            messages.dedup_by_key(|m| m.message_id.clone());
        }

        self.recorder.record_expand_latency(&root.conversation_id, (now_ms - started).max(0), summaries.len() as i64, truncated);

        Ok(ExpandResult {
            root_summary_id: root.item_id.clone(),
            conversation_id: root.conversation_id.clone(),
            summaries,
            messages,
            estimated_tokens,
            truncated,
            next_summary_ids,
        })
    }
}

fn scope_label(scope: GrepScope) -> &'static str {
    match scope {
        GrepScope::Messages => "messages",
        GrepScope::Summaries => "summaries",
        GrepScope::Both => "both",
    }
}

fn mode_label(mode: GrepMode) -> &'static str {
    match mode {
        GrepMode::Regex => "regex",
        GrepMode::FullText => "full_text",
    }
}

/// Each whitespace-delimited token is wrapped as a literal FTS phrase with
/// inner quotes stripped, so boolean-operator words in user input (`AND`,
/// `OR`, `NOT`) never get interpreted as FTS5 query syntax.
fn tokenize_as_phrases(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| token.replace('"', ""))
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

fn snippet_of(text: &str) -> String {
    let single_line: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let graphemes: Vec<&str> = single_line.graphemes(true).collect();
    if graphemes.len() <= SNIPPET_MAX_GRAPHEMES {
        single_line
    } else {
        let mut snippet: String = graphemes[..SNIPPET_MAX_GRAPHEMES].concat();
        snippet.push('…');
        snippet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use crate::model::Role;
    use crate::storage;
    use std::sync::Arc;

    async fn engine_with_store() -> (RetrievalEngine, Store, ConversationId) {
        let pool = storage::connect_in_memory().await.unwrap();
        let store = Store::new(pool, crate::storage::busy_ceiling_default());
        let conv = ConversationId::new("conv_retrieval");
        store.create_conversation(&conv, "s1", None, 0).await.unwrap();
        let engine = RetrievalEngine::new(store.clone(), Arc::new(ExpansionGrantRegistry::new()), Arc::new(Recorder::new(200)), 5000);
        (engine, store, conv)
    }

    #[test]
    fn tokenize_as_phrases_wraps_each_token() {
        let result = tokenize_as_phrases("sub-agent restrict");
        assert_eq!(result, "\"sub-agent\" \"restrict\"");
    }

    #[test]
    fn tokenize_as_phrases_empty_query_is_literal_empty() {
        assert_eq!(tokenize_as_phrases("   "), "");
    }

    #[test]
    fn snippet_is_single_line_and_capped() {
        let long = "word ".repeat(100);
        let snippet = snippet_of(&long);
        assert!(snippet.ends_with('…'));
        assert!(!snippet.contains('\n'));
    }

    #[tokio::test]
    async fn describe_unknown_id_returns_none() {
        let (engine, _store, _conv) = engine_with_store().await;
        let result = engine.describe(&ItemId::new("item_missing"), &None, 2_000).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn describe_denies_a_delegate_session_without_a_grant() {
        let (engine, store, conv) = engine_with_store().await;
        let item_id = ItemId::derive(conv.as_str(), "ctx-0", 1_000);
        store.append_context_message(&item_id, &conv, &MessageId::derive(conv.as_str(), "0", 1_000), "hello".into(), 1_000).await.unwrap();

        let err = engine.describe(&item_id, &Some("delegate".into()), 2_000).await.unwrap_err();
        assert!(matches!(err, crate::error::LcmError::Authorization(_)));
    }

    #[tokio::test]
    async fn grep_rejects_a_global_search_from_a_delegate_session() {
        let (engine, _store, _conv) = engine_with_store().await;
        let err = engine
            .grep(
                &GrepRequest { query: "restrict".into(), mode: GrepMode::Regex, scope: GrepScope::Both, conversation_id: None, limit: 10, session_key: Some("delegate".into()) },
                2_000,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::LcmError::Authorization(crate::error::AuthCode::MissingConversationScope)));
    }

    #[tokio::test]
    async fn grep_regex_scans_messages() {
        let (engine, store, conv) = engine_with_store().await;
        let message_id = MessageId::derive(conv.as_str(), "0", 1_000);
        let message = Message {
            message_id: message_id.clone(),
            conversation_id: conv.clone(),
            ordinal: 0,
            role: Role::User,
            author_id: None,
            content_text: "please restrict the sub-agent".into(),
            payload_json: serde_json::json!({}),
            created_at_ms: 1_000,
        };
        store.create_message(&message).await.unwrap();
        let item_id = ItemId::derive(conv.as_str(), "ctx-0", 1_000);
        store.append_context_message(&item_id, &conv, &message_id, message.content_text.clone(), 1_000).await.unwrap();

        let result = engine
            .grep(
                &GrepRequest { query: "restrict".into(), mode: GrepMode::Regex, scope: GrepScope::Messages, conversation_id: Some(conv.clone()), limit: 10, session_key: None },
                2_000,
            )
            .await
            .unwrap();
        assert_eq!(result.matches.len(), 1);
    }
}
