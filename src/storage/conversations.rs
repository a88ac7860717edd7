//! Conversation Storage
//!
//! SQLite implementation of `ConversationRepository`.

use rusqlite::{params, params_from_iter, OptionalExtension, ToSql, Transaction};

use super::database::{json_column, json_param, now_timestamp, parse_column, Database};
use super::repository::{placeholders, ConversationRepository};
use crate::models::conversation::{
    Conversation, ConversationMessage, ConversationNode, NewConversation, NewMessage,
};
use crate::utils::error::{AppError, AppResult};

const CONVERSATION_COLUMNS: &str = "c.id, c.project_id, c.title, c.parent_conversation_id,
     c.fork_point_message_id, c.is_compacted, c.compacted_at, c.version, c.created_at,
     c.updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sequence, role, content, metadata,
     token_estimate, is_compaction_summary, is_deleted, deleted_at, compacted_into, created_at";

impl ConversationRepository for Database {
    fn create_conversation(&self, input: &NewConversation) -> AppResult<Conversation> {
        let (conversation, _) = self.create_conversation_with_messages(input, &[])?;
        Ok(conversation)
    }

    fn create_conversation_with_messages(
        &self,
        input: &NewConversation,
        messages: &[NewMessage],
    ) -> AppResult<(Conversation, Vec<ConversationMessage>)> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let now = now_timestamp();

        tx.execute(
            "INSERT INTO conversations (project_id, title, parent_conversation_id,
                 fork_point_message_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                input.project_id,
                input.title,
                input.parent_conversation_id,
                input.fork_point_message_id,
                now,
            ],
        )?;
        let conversation_id = tx.last_insert_rowid();

        let mut inserted = Vec::with_capacity(messages.len());
        for message in messages {
            inserted.push(append_message(&tx, conversation_id, message, None)?);
        }

        let conversation = query_conversation(&tx, conversation_id)?
            .ok_or_else(|| AppError::database("Inserted conversation vanished"))?;
        tx.commit()?;

        Ok((conversation, inserted))
    }

    fn find_conversation(&self, id: i64) -> AppResult<Option<Conversation>> {
        let conn = self.get_connection()?;
        query_conversation(&conn, id)
    }

    fn list_conversations(&self, project_id: i64) -> AppResult<Vec<ConversationNode>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, (SELECT COUNT(*) FROM conversations k
                         WHERE k.parent_conversation_id = c.id)
             FROM conversations c WHERE c.project_id = ?1
             ORDER BY c.updated_at DESC, c.id DESC",
            CONVERSATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![project_id], row_to_node)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    fn list_children(&self, parent_id: i64) -> AppResult<Vec<ConversationNode>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, (SELECT COUNT(*) FROM conversations k
                         WHERE k.parent_conversation_id = c.id)
             FROM conversations c WHERE c.parent_conversation_id = ?1
             ORDER BY c.id",
            CONVERSATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![parent_id], row_to_node)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    fn update_title(&self, id: i64, title: &str) -> AppResult<Conversation> {
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "UPDATE conversations SET title = ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3",
            params![title, now_timestamp(), id],
        )?;
        if changed == 0 {
            return Err(AppError::not_found(format!("Conversation {}", id)));
        }
        query_conversation(&conn, id)?
            .ok_or_else(|| AppError::not_found(format!("Conversation {}", id)))
    }

    fn delete_conversation(&self, id: i64) -> AppResult<bool> {
        let conn = self.get_connection()?;
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn insert_message(
        &self,
        conversation_id: i64,
        message: &NewMessage,
    ) -> AppResult<ConversationMessage> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        if query_conversation(&tx, conversation_id)?.is_none() {
            return Err(AppError::not_found(format!("Conversation {}", conversation_id)));
        }
        let inserted = append_message(&tx, conversation_id, message, None)?;
        touch_conversation(&tx, conversation_id)?;

        tx.commit()?;
        Ok(inserted)
    }

    fn find_message(&self, id: i64) -> AppResult<Option<ConversationMessage>> {
        let conn = self.get_connection()?;
        query_message(&conn, id)
    }

    fn list_messages(
        &self,
        conversation_id: i64,
        active_only: bool,
    ) -> AppResult<Vec<ConversationMessage>> {
        let conn = self.get_connection()?;
        let filter = if active_only { "AND is_deleted = 0" } else { "" };
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversation_messages
             WHERE conversation_id = ?1 {}
             ORDER BY sequence, id",
            MESSAGE_COLUMNS, filter
        ))?;
        let rows = stmt.query_map(params![conversation_id], row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    fn soft_delete_messages(&self, conversation_id: i64, ids: &[i64]) -> AppResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let mut values: Vec<Box<dyn ToSql>> = Vec::with_capacity(ids.len() + 2);
        values.push(Box::new(now_timestamp()));
        values.push(Box::new(conversation_id));
        values.extend(ids.iter().map(|id| Box::new(*id) as Box<dyn ToSql>));

        let changed = tx.execute(
            &format!(
                "UPDATE conversation_messages SET is_deleted = 1, deleted_at = ?
                 WHERE conversation_id = ? AND is_deleted = 0 AND id IN ({})",
                placeholders(ids.len())
            ),
            params_from_iter(values.iter()),
        )?;
        if changed > 0 {
            touch_conversation(&tx, conversation_id)?;
        }

        tx.commit()?;
        Ok(changed)
    }

    fn restore_message(&self, id: i64) -> AppResult<Option<ConversationMessage>> {
        let conn = self.get_connection()?;
        let changed = conn.execute(
            "UPDATE conversation_messages SET is_deleted = 0, deleted_at = NULL WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        query_message(&conn, id)
    }

    fn apply_compaction(
        &self,
        conversation_id: i64,
        ids: &[i64],
        summary: &NewMessage,
    ) -> AppResult<ConversationMessage> {
        if ids.is_empty() {
            return Err(AppError::invalid_transition("Nothing to compact"));
        }

        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let now = now_timestamp();

        let id_values: Vec<Box<dyn ToSql>> =
            ids.iter().map(|id| Box::new(*id) as Box<dyn ToSql>).collect();
        let mut values: Vec<Box<dyn ToSql>> = Vec::with_capacity(ids.len() + 1);
        values.push(Box::new(conversation_id));
        values.extend(ids.iter().map(|id| Box::new(*id) as Box<dyn ToSql>));

        let (active, first_sequence): (i64, Option<i64>) = tx.query_row(
            &format!(
                "SELECT COUNT(*), MIN(sequence) FROM conversation_messages
                 WHERE conversation_id = ? AND is_deleted = 0 AND id IN ({})",
                placeholders(ids.len())
            ),
            params_from_iter(values.iter()),
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let first_sequence = match first_sequence {
            Some(sequence) if active as usize == ids.len() => sequence,
            _ => {
                return Err(AppError::concurrent_modification(format!(
                    "Conversation {} changed while compacting",
                    conversation_id
                )))
            }
        };

        let inserted = append_message(&tx, conversation_id, summary, Some(first_sequence))?;

        let mut update_values: Vec<Box<dyn ToSql>> = Vec::with_capacity(ids.len() + 2);
        update_values.push(Box::new(now.clone()));
        update_values.push(Box::new(inserted.id));
        update_values.extend(id_values);
        tx.execute(
            &format!(
                "UPDATE conversation_messages
                 SET is_deleted = 1, deleted_at = ?, compacted_into = ?
                 WHERE id IN ({})",
                placeholders(ids.len())
            ),
            params_from_iter(update_values.iter()),
        )?;

        tx.execute(
            "UPDATE conversations
             SET is_compacted = 1, compacted_at = ?1, version = version + 1, updated_at = ?1
             WHERE id = ?2",
            params![now, conversation_id],
        )?;

        tx.commit()?;
        Ok(inserted)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Insert a message. Without an explicit `sequence` it goes after the last one.
fn append_message(
    tx: &Transaction,
    conversation_id: i64,
    message: &NewMessage,
    sequence: Option<i64>,
) -> AppResult<ConversationMessage> {
    let sequence = match sequence {
        Some(sequence) => sequence,
        None => tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM conversation_messages
             WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?,
    };

    tx.execute(
        "INSERT INTO conversation_messages (conversation_id, sequence, role, content,
             metadata, token_estimate, is_compaction_summary, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            conversation_id,
            sequence,
            message.role.as_str(),
            message.content,
            json_param(&message.metadata)?,
            message.token_estimate.max(0),
            message.is_compaction_summary,
            now_timestamp(),
        ],
    )?;

    let id = tx.last_insert_rowid();
    query_message(tx, id)?.ok_or_else(|| AppError::database("Inserted message vanished"))
}

fn touch_conversation(conn: &rusqlite::Connection, id: i64) -> AppResult<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![now_timestamp(), id],
    )?;
    Ok(())
}

fn query_conversation(conn: &rusqlite::Connection, id: i64) -> AppResult<Option<Conversation>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM conversations c WHERE c.id = ?1",
            CONVERSATION_COLUMNS
        ),
        params![id],
        row_to_conversation,
    )
    .optional()
    .map_err(AppError::from)
}

fn query_message(conn: &rusqlite::Connection, id: i64) -> AppResult<Option<ConversationMessage>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM conversation_messages WHERE id = ?1",
            MESSAGE_COLUMNS
        ),
        params![id],
        row_to_message,
    )
    .optional()
    .map_err(AppError::from)
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        parent_conversation_id: row.get(3)?,
        fork_point_message_id: row.get(4)?,
        is_compacted: row.get(5)?,
        compacted_at: row.get(6)?,
        version: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<ConversationNode> {
    let conversation = row_to_conversation(row)?;
    let child_count: i64 = row.get(10)?;
    Ok(ConversationNode {
        conversation,
        child_count: child_count as usize,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<ConversationMessage> {
    Ok(ConversationMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence: row.get(2)?,
        role: parse_column(row, 3)?,
        content: row.get(4)?,
        metadata: json_column(row, 5)?,
        token_estimate: row.get(6)?,
        is_compaction_summary: row.get(7)?,
        is_deleted: row.get(8)?,
        deleted_at: row.get(9)?,
        compacted_into: row.get(10)?,
        created_at: row.get(11)?,
    })
}
