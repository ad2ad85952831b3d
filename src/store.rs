//! Conversation Store (C3): a thin typed API over the storage backend.
//! Every mutating method either is itself a single statement or composes
//! several inside one transaction — callers never see partial writes.
//! Every one of them also runs inside [`storage::with_busy_retry`], so a
//! transient `SQLITE_BUSY` under concurrent writers is retried in place.

use sqlx::Row;

use crate::error::{LcmError, LcmResult};
use crate::ids::{ArtifactId, ConversationId, EdgeRelation, ItemId, MessageId, PartId, RunId};
use crate::model::{
    Artifact, CompactionRun, CompactionStatus, ContextItem, ContextItemType, LineageEdge, Message,
    MessagePart, Role,
};
use crate::storage::{self, Pool};

#[derive(Debug, Clone, Default)]
pub struct GetContextItemsFilter {
    pub include_tombstoned: bool,
    pub item_types: Vec<ContextItemType>,
    pub limit: Option<i64>,
}

#[derive(Clone)]
pub struct Store {
    pool: Pool,
    busy_retry_ceiling: u32,
}

impl Store {
    pub fn new(pool: Pool, busy_retry_ceiling: u32) -> Self {
        Self { pool, busy_retry_ceiling }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn create_conversation(&self, conversation_id: &ConversationId, session_id: &str, channel: Option<&str>, now_ms: i64) -> LcmResult<()> {
        storage::with_busy_retry(self.busy_retry_ceiling, || async {
            sqlx::query(
                "INSERT INTO conversations (conversation_id, session_id, channel, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(conversation_id) DO NOTHING",
            )
            .bind(conversation_id.as_str())
            .bind(session_id)
            .bind(channel)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn create_message(&self, message: &Message) -> LcmResult<()> {
        storage::with_busy_retry(self.busy_retry_ceiling, || async {
            sqlx::query(
                "INSERT INTO messages (message_id, conversation_id, ordinal, role, author_id, content_text, payload_json, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(message.message_id.as_str())
            .bind(message.conversation_id.as_str())
            .bind(message.ordinal)
            .bind(message.role.as_str())
            .bind(message.author_id.as_deref())
            .bind(&message.content_text)
            .bind(message.payload_json.to_string())
            .bind(message.created_at_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Inserted inside one transaction so a busy-retry on part 3 of 5 can
    /// never re-attempt an INSERT for a part already committed by a
    /// previous partial run.
    pub async fn create_message_parts(&self, parts: &[MessagePart]) -> LcmResult<()> {
        storage::with_busy_retry(self.busy_retry_ceiling, || async {
            let mut tx = self.pool.begin().await?;
            for part in parts {
                sqlx::query(
                    "INSERT INTO message_parts (part_id, message_id, part_index, kind, mime_type, text_content, blob_path, token_count, payload_json, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .bind(part.part_id.as_str())
                .bind(part.message_id.as_str())
                .bind(part.part_index)
                .bind(part.kind.as_str())
                .bind(part.mime_type.as_deref())
                .bind(part.text_content.as_deref())
                .bind(part.blob_path.as_deref())
                .bind(part.token_count)
                .bind(part.payload_json.to_string())
                .bind(part.created_at_ms)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Appends a `ContextItem{type=message, depth=0}` pointing at an
    /// already-persisted canonical message.
    pub async fn append_context_message(&self, item_id: &ItemId, conversation_id: &ConversationId, message_id: &MessageId, body: String, now_ms: i64) -> LcmResult<()> {
        storage::with_busy_retry(self.busy_retry_ceiling, || async {
            sqlx::query(
                "INSERT INTO context_items (item_id, conversation_id, source_message_id, item_type, depth, title, body, metadata_json, tombstoned, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, 'message', 0, NULL, ?4, '{}', 0, ?5, ?5)",
            )
            .bind(item_id.as_str())
            .bind(conversation_id.as_str())
            .bind(message_id.as_str())
            .bind(body.clone())
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn insert_summary(&self, item: &ContextItem) -> LcmResult<()> {
        storage::with_busy_retry(self.busy_retry_ceiling, || async {
            sqlx::query(
                "INSERT INTO context_items (item_id, conversation_id, source_message_id, item_type, depth, title, body, metadata_json, tombstoned, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, 'summary', ?4, ?5, ?6, ?7, 0, ?8, ?8)",
            )
            .bind(item.item_id.as_str())
            .bind(item.conversation_id.as_str())
            .bind(item.source_message_id.as_ref().map(|m| m.as_str()))
            .bind(item.depth)
            .bind(item.title.as_deref())
            .bind(&item.body)
            .bind(item.metadata_json.to_string())
            .bind(item.created_at_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn insert_edge(&self, parent: &ItemId, child: &ItemId, relation: EdgeRelation, now_ms: i64) -> LcmResult<()> {
        storage::with_busy_retry(self.busy_retry_ceiling, || async {
            sqlx::query(
                "INSERT INTO lineage_edges (parent_item_id, child_item_id, relation, metadata_json, created_at_ms)
                 VALUES (?1, ?2, ?3, '{}', ?4)
                 ON CONFLICT(parent_item_id, child_item_id, relation) DO NOTHING",
            )
            .bind(parent.as_str())
            .bind(child.as_str())
            .bind(relation.as_str())
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn link_summary_to_messages(&self, summary_id: &ItemId, message_item_ids: &[ItemId], now_ms: i64) -> LcmResult<()> {
        for child in message_item_ids {
            self.insert_edge(summary_id, child, EdgeRelation::Summarizes, now_ms).await?;
        }
        Ok(())
    }

    pub async fn link_summary_to_parents(&self, condensed_id: &ItemId, leaf_ids: &[ItemId], now_ms: i64) -> LcmResult<()> {
        for child in leaf_ids {
            self.insert_edge(condensed_id, child, EdgeRelation::Condenses, now_ms).await?;
        }
        Ok(())
    }

    /// Atomically tombstones `[start_item_id..end_item_id]` (by
    /// `created_at_ms` order), inserts the new summary, and links it to every
    /// tombstoned item with `relation`.
    pub async fn replace_context_range_with_summary(
        &self,
        conversation_id: &ConversationId,
        summary: &ContextItem,
        start_item_id: &ItemId,
        end_item_id: &ItemId,
        relation: EdgeRelation,
        now_ms: i64,
    ) -> LcmResult<Vec<ItemId>> {
        storage::with_busy_retry(self.busy_retry_ceiling, || async {
            let mut tx = self.pool.begin().await?;

            let bounds: Vec<(String, i64)> = sqlx::query_as(
                "SELECT item_id, created_at_ms FROM context_items WHERE conversation_id = ?1 AND item_id IN (?2, ?3)",
            )
            .bind(conversation_id.as_str())
            .bind(start_item_id.as_str())
            .bind(end_item_id.as_str())
            .fetch_all(&mut *tx)
            .await?;
            let start_ts = bounds
                .iter()
                .find(|(id, _)| id == start_item_id.as_str())
                .map(|(_, ts)| *ts)
                .ok_or_else(|| LcmError::not_found(format!("start item {start_item_id} not found")))?;
            let end_ts = bounds
                .iter()
                .find(|(id, _)| id == end_item_id.as_str())
                .map(|(_, ts)| *ts)
                .ok_or_else(|| LcmError::not_found(format!("end item {end_item_id} not found")))?;

            let replaced: Vec<(String,)> = sqlx::query_as(
                "SELECT item_id FROM context_items
                 WHERE conversation_id = ?1 AND tombstoned = 0
                   AND created_at_ms >= ?2 AND created_at_ms <= ?3
                 ORDER BY created_at_ms, item_id",
            )
            .bind(conversation_id.as_str())
            .bind(start_ts)
            .bind(end_ts)
            .fetch_all(&mut *tx)
            .await?;
            let replaced_ids: Vec<ItemId> = replaced.into_iter().map(|(id,)| ItemId::new(id)).collect();

            sqlx::query(
                "UPDATE context_items SET tombstoned = 1, updated_at_ms = ?1
                 WHERE conversation_id = ?2 AND created_at_ms >= ?3 AND created_at_ms <= ?4",
            )
            .bind(now_ms)
            .bind(conversation_id.as_str())
            .bind(start_ts)
            .bind(end_ts)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO context_items (item_id, conversation_id, source_message_id, item_type, depth, title, body, metadata_json, tombstoned, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, 'summary', ?4, ?5, ?6, ?7, 0, ?8, ?8)",
            )
            .bind(summary.item_id.as_str())
            .bind(conversation_id.as_str())
            .bind(summary.source_message_id.as_ref().map(|m| m.as_str()))
            .bind(summary.depth)
            .bind(summary.title.as_deref())
            .bind(&summary.body)
            .bind(summary.metadata_json.to_string())
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

            for child in &replaced_ids {
                sqlx::query(
                    "INSERT INTO lineage_edges (parent_item_id, child_item_id, relation, metadata_json, created_at_ms)
                     VALUES (?1, ?2, ?3, '{}', ?4)
                     ON CONFLICT(parent_item_id, child_item_id, relation) DO NOTHING",
                )
                .bind(summary.item_id.as_str())
                .bind(child.as_str())
                .bind(relation.as_str())
                .bind(now_ms)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(replaced_ids)
        })
        .await
    }

    pub async fn get_context_items(&self, conversation_id: &ConversationId, filter: &GetContextItemsFilter) -> LcmResult<Vec<ContextItem>> {
        let mut sql = String::from(
            "SELECT item_id, conversation_id, source_message_id, item_type, depth, title, body, metadata_json, tombstoned, created_at_ms, updated_at_ms
             FROM context_items WHERE conversation_id = ?1",
        );
        if !filter.include_tombstoned {
            sql.push_str(" AND tombstoned = 0");
        }
        if !filter.item_types.is_empty() {
            let kinds: Vec<String> = filter.item_types.iter().map(|t| format!("'{}'", t.as_str())).collect();
            sql.push_str(&format!(" AND item_type IN ({})", kinds.join(",")));
        }
        sql.push_str(" ORDER BY created_at_ms, item_id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = sqlx::query(&sql).bind(conversation_id.as_str()).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_context_item).collect()
    }

    pub async fn get_context_item(&self, item_id: &ItemId) -> LcmResult<Option<ContextItem>> {
        let row = sqlx::query(
            "SELECT item_id, conversation_id, source_message_id, item_type, depth, title, body, metadata_json, tombstoned, created_at_ms, updated_at_ms
             FROM context_items WHERE item_id = ?1",
        )
        .bind(item_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_context_item).transpose()
    }

    pub async fn list_messages(&self, conversation_id: &ConversationId, message_ids: Option<&[MessageId]>, limit: Option<i64>) -> LcmResult<Vec<Message>> {
        let rows = if let Some(ids) = message_ids {
            if ids.is_empty() {
                return Ok(vec![]);
            }
            let placeholders: Vec<String> = ids.iter().map(|id| format!("'{}'", id.as_str().replace('\'', "''"))).collect();
            let sql = format!(
                "SELECT message_id, conversation_id, ordinal, role, author_id, content_text, payload_json, created_at_ms
                 FROM messages WHERE conversation_id = ?1 AND message_id IN ({}) ORDER BY ordinal",
                placeholders.join(",")
            );
            sqlx::query(&sql).bind(conversation_id.as_str()).fetch_all(&self.pool).await?
        } else {
            let mut sql = String::from(
                "SELECT message_id, conversation_id, ordinal, role, author_id, content_text, payload_json, created_at_ms
                 FROM messages WHERE conversation_id = ?1 ORDER BY ordinal",
            );
            if let Some(limit) = limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            sqlx::query(&sql).bind(conversation_id.as_str()).fetch_all(&self.pool).await?
        };
        rows.iter().map(row_to_message).collect()
    }

    /// Canonical messages reachable from `summary_id` via any-length
    /// `summarizes|condenses` chain, ordered by `ordinal`.
    pub async fn get_summary_messages(&self, summary_id: &ItemId, limit: Option<i64>) -> LcmResult<Vec<Message>> {
        let mut frontier = vec![summary_id.clone()];
        let mut message_item_ids = Vec::new();
        let mut visited = std::collections::HashSet::new();
        visited.insert(summary_id.clone());

        while let Some(current) = frontier.pop() {
            let children: Vec<(String, String)> = sqlx::query_as(
                "SELECT child_item_id, (SELECT item_type FROM context_items WHERE item_id = child_item_id) AS child_type
                 FROM lineage_edges WHERE parent_item_id = ?1",
            )
            .bind(current.as_str())
            .fetch_all(&self.pool)
            .await?;

            for (child_id, child_type) in children {
                let child = ItemId::new(child_id);
                if !visited.insert(child.clone()) {
                    continue;
                }
                if child_type == "message" {
                    message_item_ids.push(child);
                } else {
                    frontier.push(child);
                }
            }
        }

        if message_item_ids.is_empty() {
            return Ok(vec![]);
        }
        let placeholders: Vec<String> = message_item_ids.iter().map(|id| format!("'{}'", id.as_str().replace('\'', "''"))).collect();
        let sql = format!(
            "SELECT m.message_id, m.conversation_id, m.ordinal, m.role, m.author_id, m.content_text, m.payload_json, m.created_at_ms
             FROM messages m
             JOIN context_items c ON c.source_message_id = m.message_id
             WHERE c.item_id IN ({})
             ORDER BY m.ordinal",
            placeholders.join(",")
        );
        let mut rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        if let Some(limit) = limit {
            rows.truncate(limit as usize);
        }
        rows.iter().map(row_to_message).collect()
    }

    pub async fn lineage_of(&self, item_id: &ItemId) -> LcmResult<LineageSummary> {
        let parents: Vec<(String,)> = sqlx::query_as("SELECT parent_item_id FROM lineage_edges WHERE child_item_id = ?1")
            .bind(item_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        let children: Vec<(String,)> = sqlx::query_as("SELECT child_item_id FROM lineage_edges WHERE parent_item_id = ?1")
            .bind(item_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(LineageSummary {
            parent_ids: parents.into_iter().map(|(id,)| ItemId::new(id)).collect(),
            child_ids: children.into_iter().map(|(id,)| ItemId::new(id)).collect(),
        })
    }

    pub async fn edges_from(&self, parent_id: &ItemId) -> LcmResult<Vec<LineageEdge>> {
        let rows = sqlx::query(
            "SELECT parent_item_id, child_item_id, relation, metadata_json, created_at_ms FROM lineage_edges WHERE parent_item_id = ?1",
        )
        .bind(parent_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_edge).collect()
    }

    pub async fn record_artifact(&self, artifact: &Artifact) -> LcmResult<()> {
        storage::with_busy_retry(self.busy_retry_ceiling, || async {
            sqlx::query(
                "INSERT INTO artifacts (artifact_id, conversation_id, message_id, part_id, path, mime_type, bytes, sha256, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(artifact.artifact_id.as_str())
            .bind(artifact.conversation_id.as_str())
            .bind(artifact.message_id.as_ref().map(|m| m.as_str()))
            .bind(artifact.part_id.as_ref().map(|p| p.as_str()))
            .bind(&artifact.path)
            .bind(artifact.mime_type.as_deref())
            .bind(artifact.bytes)
            .bind(artifact.sha256.as_deref())
            .bind(artifact.created_at_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_artifact(&self, artifact_id: &ArtifactId) -> LcmResult<Option<Artifact>> {
        let row = sqlx::query(
            "SELECT artifact_id, conversation_id, message_id, part_id, path, mime_type, bytes, sha256, created_at_ms
             FROM artifacts WHERE artifact_id = ?1",
        )
        .bind(artifact_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_artifact).transpose()
    }

    pub async fn create_compaction_run(&self, run_id: &RunId, conversation_id: &ConversationId, strategy: &str, started_at_ms: i64) -> LcmResult<()> {
        storage::with_busy_retry(self.busy_retry_ceiling, || async {
            sqlx::query(
                "INSERT INTO compaction_runs (run_id, conversation_id, strategy, status, input_item_count, output_item_count, started_at_ms)
                 VALUES (?1, ?2, ?3, 'running', 0, 0, ?4)",
            )
            .bind(run_id.as_str())
            .bind(conversation_id.as_str())
            .bind(strategy)
            .bind(started_at_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn finish_compaction_run(
        &self,
        run_id: &RunId,
        status: CompactionStatus,
        summary_item_id: Option<&ItemId>,
        input_item_count: i64,
        output_item_count: i64,
        error_text: Option<&str>,
        finished_at_ms: i64,
    ) -> LcmResult<()> {
        storage::with_busy_retry(self.busy_retry_ceiling, || async {
            sqlx::query(
                "UPDATE compaction_runs SET status = ?1, summary_item_id = ?2, input_item_count = ?3, output_item_count = ?4, error_text = ?5, finished_at_ms = ?6
                 WHERE run_id = ?7",
            )
            .bind(status.as_str())
            .bind(summary_item_id.map(|id| id.as_str()))
            .bind(input_item_count)
            .bind(output_item_count)
            .bind(error_text)
            .bind(finished_at_ms)
            .bind(run_id.as_str())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_compaction_run(&self, run_id: &RunId) -> LcmResult<Option<CompactionRun>> {
        let row = sqlx::query(
            "SELECT run_id, conversation_id, strategy, status, summary_item_id, input_item_count, output_item_count, error_text, started_at_ms, finished_at_ms
             FROM compaction_runs WHERE run_id = ?1",
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_run).transpose()
    }
}

pub struct LineageSummary {
    pub parent_ids: Vec<ItemId>,
    pub child_ids: Vec<ItemId>,
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> LcmResult<Message> {
    let role_raw: String = row.try_get("role")?;
    let payload_raw: String = row.try_get("payload_json")?;
    Ok(Message {
        message_id: MessageId::new(row.try_get::<String, _>("message_id")?),
        conversation_id: ConversationId::new(row.try_get::<String, _>("conversation_id")?),
        ordinal: row.try_get("ordinal")?,
        role: Role::parse(&role_raw).ok_or_else(|| LcmError::StorageCorruption(format!("bad role {role_raw}")))?,
        author_id: row.try_get("author_id")?,
        content_text: row.try_get("content_text")?,
        payload_json: serde_json::from_str(&payload_raw).unwrap_or(serde_json::json!({})),
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

fn row_to_context_item(row: &sqlx::sqlite::SqliteRow) -> LcmResult<ContextItem> {
    let item_type_raw: String = row.try_get("item_type")?;
    let metadata_raw: String = row.try_get("metadata_json")?;
    let source_message_id: Option<String> = row.try_get("source_message_id")?;
    Ok(ContextItem {
        item_id: ItemId::new(row.try_get::<String, _>("item_id")?),
        conversation_id: ConversationId::new(row.try_get::<String, _>("conversation_id")?),
        source_message_id: source_message_id.map(MessageId::new),
        item_type: ContextItemType::parse(&item_type_raw)
            .ok_or_else(|| LcmError::StorageCorruption(format!("bad item_type {item_type_raw}")))?,
        depth: row.try_get("depth")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        metadata_json: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::json!({})),
        tombstoned: row.try_get::<i64, _>("tombstoned")? != 0,
        created_at_ms: row.try_get("created_at_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

fn row_to_edge(row: &sqlx::sqlite::SqliteRow) -> LcmResult<LineageEdge> {
    let relation_raw: String = row.try_get("relation")?;
    let metadata_raw: String = row.try_get("metadata_json")?;
    Ok(LineageEdge {
        parent_item_id: ItemId::new(row.try_get::<String, _>("parent_item_id")?),
        child_item_id: ItemId::new(row.try_get::<String, _>("child_item_id")?),
        relation: EdgeRelation::parse(&relation_raw).ok_or_else(|| LcmError::StorageCorruption(format!("bad relation {relation_raw}")))?,
        metadata_json: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::json!({})),
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

fn row_to_artifact(row: &sqlx::sqlite::SqliteRow) -> LcmResult<Artifact> {
    let message_id: Option<String> = row.try_get("message_id")?;
    let part_id: Option<String> = row.try_get("part_id")?;
    Ok(Artifact {
        artifact_id: ArtifactId::new(row.try_get::<String, _>("artifact_id")?),
        conversation_id: ConversationId::new(row.try_get::<String, _>("conversation_id")?),
        message_id: message_id.map(MessageId::new),
        part_id: part_id.map(PartId::new),
        path: row.try_get("path")?,
        mime_type: row.try_get("mime_type")?,
        bytes: row.try_get("bytes")?,
        sha256: row.try_get("sha256")?,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> LcmResult<CompactionRun> {
    let status_raw: String = row.try_get("status")?;
    let summary_item_id: Option<String> = row.try_get("summary_item_id")?;
    Ok(CompactionRun {
        run_id: RunId::new(row.try_get::<String, _>("run_id")?),
        conversation_id: ConversationId::new(row.try_get::<String, _>("conversation_id")?),
        strategy: row.try_get("strategy")?,
        status: CompactionStatus::parse(&status_raw).ok_or_else(|| LcmError::StorageCorruption(format!("bad status {status_raw}")))?,
        summary_item_id: summary_item_id.map(ItemId::new),
        input_item_count: row.try_get("input_item_count")?,
        output_item_count: row.try_get("output_item_count")?,
        error_text: row.try_get("error_text")?,
        started_at_ms: row.try_get("started_at_ms")?,
        finished_at_ms: row.try_get("finished_at_ms")?,
    })
}
