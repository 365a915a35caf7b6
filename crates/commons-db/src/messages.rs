use std::collections::HashMap;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use commons_types::models::{Attachment, Message, ReactionEntry, ReadReceipt};

use crate::Database;
use crate::models::{
    NewMessage, OptionalExt, from_micros, opt_time_col, time_col, to_micros, uuid_col,
};
use crate::reactions::query_reactions_for_messages;

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, created_at, is_deleted, is_edited, edited_at";

impl Database {
    /// Persist a message and do the conversation bookkeeping in one
    /// transaction: bump `last_activity_at` and increment every other
    /// participant's unread count. Either all of it lands or none of it does.
    ///
    /// `created_at` is forced strictly past the conversation's newest message
    /// so history cursors never straddle two messages with equal timestamps.
    pub fn insert_message(&self, new: NewMessage<'_>) -> Result<Message> {
        let conversation_id = new.conversation_id.to_string();
        self.with_tx(|tx| {
            let newest: Option<i64> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                [&conversation_id],
                |row| row.get(0),
            )?;
            let created_micros = match newest {
                Some(newest) => to_micros(new.now).max(newest + 1),
                None => to_micros(new.now),
            };

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, created_at, is_deleted, is_edited, edited_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, NULL)",
                params![
                    new.id.to_string(),
                    conversation_id,
                    new.sender_id.to_string(),
                    new.content,
                    created_micros
                ],
            )?;

            for (position, attachment) in new.attachments.iter().enumerate() {
                tx.execute(
                    "INSERT INTO message_attachments (message_id, position, locator, file_name, content_type)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        new.id.to_string(),
                        position as i64,
                        attachment.locator,
                        attachment.file_name,
                        attachment.content_type
                    ],
                )?;
            }

            let touched = tx.execute(
                "UPDATE conversations SET last_activity_at = MAX(last_activity_at, ?2) WHERE id = ?1",
                params![conversation_id, created_micros],
            )?;
            if touched != 1 {
                return Err(anyhow!("Conversation not found: {}", conversation_id));
            }

            tx.execute(
                "UPDATE participants SET unread_count = unread_count + 1
                 WHERE conversation_id = ?1 AND user_id != ?2",
                params![conversation_id, new.sender_id.to_string()],
            )?;

            Ok(Message {
                id: new.id,
                conversation_id: new.conversation_id,
                sender_id: new.sender_id,
                content: new.content.to_string(),
                attachments: new.attachments.to_vec(),
                created_at: from_micros(4, created_micros)?,
                is_deleted: false,
                is_edited: false,
                edited_at: None,
                read_by: vec![],
                reactions: vec![],
            })
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let Some(message) = query_message(conn, id)? else {
                return Ok(None);
            };
            Ok(hydrate(conn, vec![message])?.pop())
        })
    }

    /// Replace the content and stamp the edit. Returns the updated record, or
    /// `None` if the message does not exist or is deleted.
    pub fn edit_message(&self, id: Uuid, content: &str, edited_at: DateTime<Utc>) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?2, is_edited = 1, edited_at = ?3 WHERE id = ?1 AND is_deleted = 0",
                params![id.to_string(), content, to_micros(edited_at)],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let Some(message) = query_message(conn, id)? else {
                return Ok(None);
            };
            Ok(hydrate(conn, vec![message])?.pop())
        })
    }

    /// Flag a message as deleted. Returns false if it was already deleted or
    /// does not exist. Receipts and reactions are left in place.
    pub fn soft_delete_message(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_deleted = 1 WHERE id = ?1 AND is_deleted = 0",
                [id.to_string()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Up to `limit` non-deleted messages older than `before`, newest first.
    pub fn fetch_history(
        &self,
        conversation_id: Uuid,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let before = before.map(to_micros).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND is_deleted = 0 AND created_at < ?2
                 ORDER BY created_at DESC
                 LIMIT ?3"
            ))?;

            let rows = stmt
                .query_map(
                    params![conversation_id.to_string(), before, limit],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            hydrate(conn, rows)
        })
    }

    /// Newest non-deleted message, used for conversation list previews.
    pub fn last_visible_message(&self, conversation_id: Uuid) -> Result<Option<Message>> {
        Ok(self.fetch_history(conversation_id, 1, None)?.pop())
    }

    /// Of `ids`, those that exist in `conversation_id`, as (id, sender_id).
    pub fn message_senders_in_conversation(
        &self,
        conversation_id: Uuid,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Uuid>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, sender_id FROM messages WHERE conversation_id = ?1 AND id IN ({})",
                placeholders(2, ids.len())
            );
            let mut params: Vec<String> = Vec::with_capacity(ids.len() + 1);
            params.push(conversation_id.to_string());
            params.extend(ids.iter().map(Uuid::to_string));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    Ok((uuid_col(row, 0)?, uuid_col(row, 1)?))
                })?
                .collect::<std::result::Result<HashMap<_, _>, _>>()?;

            Ok(rows)
        })
    }

    /// Record a receipt for every id `reader` has not read yet, then reset the
    /// reader's unread count. Returns the ids that were newly read.
    pub fn mark_read(
        &self,
        conversation_id: Uuid,
        reader: Uuid,
        ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        self.with_tx(|tx| {
            let mut newly_read = Vec::new();
            for id in ids {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                    params![id.to_string(), reader.to_string(), to_micros(now)],
                )?;
                if inserted == 1 {
                    newly_read.push(*id);
                }
            }

            tx.execute(
                "UPDATE participants SET unread_count = 0, last_read_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), reader.to_string(), to_micros(now)],
            )?;

            Ok(newly_read)
        })
    }
}

fn query_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        [id.to_string()],
        message_from_row,
    )
    .optional()
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_col(row, 0)?,
        conversation_id: uuid_col(row, 1)?,
        sender_id: uuid_col(row, 2)?,
        content: row.get(3)?,
        attachments: vec![],
        created_at: time_col(row, 4)?,
        is_deleted: row.get(5)?,
        is_edited: row.get(6)?,
        edited_at: opt_time_col(row, 7)?,
        read_by: vec![],
        reactions: vec![],
    })
}

/// `?start, ?start+1, ...` for `count` parameters.
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Batch-load attachments, receipts and reactions for `messages` (eliminates N+1).
fn hydrate(conn: &Connection, mut messages: Vec<Message>) -> Result<Vec<Message>> {
    if messages.is_empty() {
        return Ok(messages);
    }

    let ids: Vec<String> = messages.iter().map(|m| m.id.to_string()).collect();
    let in_list = placeholders(1, ids.len());

    let mut attachments: HashMap<Uuid, Vec<Attachment>> = HashMap::new();
    {
        let mut stmt = conn.prepare(&format!(
            "SELECT message_id, locator, file_name, content_type FROM message_attachments
             WHERE message_id IN ({in_list}) ORDER BY message_id, position"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok((
                uuid_col(row, 0)?,
                Attachment {
                    locator: row.get(1)?,
                    file_name: row.get(2)?,
                    content_type: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (message_id, attachment) = row?;
            attachments.entry(message_id).or_default().push(attachment);
        }
    }

    let mut receipts: HashMap<Uuid, Vec<ReadReceipt>> = HashMap::new();
    {
        let mut stmt = conn.prepare(&format!(
            "SELECT message_id, user_id, read_at FROM read_receipts
             WHERE message_id IN ({in_list}) ORDER BY read_at, user_id"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok((
                uuid_col(row, 0)?,
                ReadReceipt {
                    user_id: uuid_col(row, 1)?,
                    read_at: time_col(row, 2)?,
                },
            ))
        })?;
        for row in rows {
            let (message_id, receipt) = row?;
            receipts.entry(message_id).or_default().push(receipt);
        }
    }

    let mut reactions: HashMap<Uuid, Vec<ReactionEntry>> = HashMap::new();
    for (message_id, entry) in query_reactions_for_messages(conn, &ids)? {
        reactions.entry(message_id).or_default().push(entry);
    }

    for message in &mut messages {
        message.attachments = attachments.remove(&message.id).unwrap_or_default();
        message.read_by = receipts.remove(&message.id).unwrap_or_default();
        message.reactions = reactions.remove(&message.id).unwrap_or_default();
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn setup() -> (Database, Uuid, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (conversation, _) = db.find_or_create_direct(Uuid::new_v4(), a, b, Utc::now()).unwrap();
        (db, conversation.id, a, b)
    }

    fn send(db: &Database, conversation_id: Uuid, sender: Uuid, content: &str, now: DateTime<Utc>) -> Message {
        db.insert_message(NewMessage {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: sender,
            content,
            attachments: &[],
            now,
        })
        .unwrap()
    }

    #[test]
    fn insert_updates_bookkeeping() {
        let (db, cid, a, b) = setup();
        let message = send(&db, cid, a, "hello", Utc::now());

        assert_eq!(db.get_participant(cid, a).unwrap().unwrap().unread_count, 0);
        assert_eq!(db.get_participant(cid, b).unwrap().unwrap().unread_count, 1);
        let conversation = db.get_conversation(cid).unwrap().unwrap();
        assert_eq!(conversation.last_activity_at, message.created_at);
    }

    #[test]
    fn edit_leaves_deleted_messages_alone() {
        let (db, cid, a, _) = setup();
        let message = send(&db, cid, a, "draft", Utc::now());
        assert!(db.soft_delete_message(message.id).unwrap());

        assert!(db.edit_message(message.id, "sneaky", Utc::now()).unwrap().is_none());
        let stored = db.get_message(message.id).unwrap().unwrap();
        assert_eq!(stored.content, "draft");
        assert!(!stored.is_edited);
    }

    #[test]
    fn same_instant_messages_get_distinct_timestamps() {
        let (db, cid, a, _) = setup();
        let now = Utc::now();
        let first = send(&db, cid, a, "one", now);
        let second = send(&db, cid, a, "two", now);
        // Clock went backwards: still ordered after the newest.
        let third = send(&db, cid, a, "three", now - Duration::seconds(5));

        assert!(first.created_at < second.created_at);
        assert!(second.created_at < third.created_at);
    }

    #[test]
    fn attachments_keep_their_order() {
        let (db, cid, a, _) = setup();
        let attachments = vec![
            Attachment { locator: "store://2".into(), file_name: Some("b.png".into()), content_type: None },
            Attachment { locator: "store://1".into(), file_name: None, content_type: Some("application/pdf".into()) },
        ];
        let sent = db
            .insert_message(NewMessage {
                id: Uuid::new_v4(),
                conversation_id: cid,
                sender_id: a,
                content: "",
                attachments: &attachments,
                now: Utc::now(),
            })
            .unwrap();

        let loaded = db.get_message(sent.id).unwrap().unwrap();
        assert_eq!(loaded.attachments, attachments);
    }

    #[test]
    fn history_skips_deleted_and_respects_cursor() {
        let (db, cid, a, _) = setup();
        let start = Utc::now();
        let messages: Vec<Message> = (0..5)
            .map(|i| send(&db, cid, a, &format!("m{i}"), start + Duration::milliseconds(i)))
            .collect();
        assert!(db.soft_delete_message(messages[3].id).unwrap());
        assert!(!db.soft_delete_message(messages[3].id).unwrap());

        let page = db.fetch_history(cid, 10, None).unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m2", "m1", "m0"]);

        let older = db.fetch_history(cid, 10, Some(messages[2].created_at)).unwrap();
        let contents: Vec<&str> = older.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m0"]);
    }

    #[test]
    fn mark_read_is_append_only() {
        let (db, cid, a, b) = setup();
        let m1 = send(&db, cid, a, "one", Utc::now());
        let m2 = send(&db, cid, a, "two", Utc::now());

        let newly = db.mark_read(cid, b, &[m1.id], Utc::now()).unwrap();
        assert_eq!(newly, vec![m1.id]);
        assert_eq!(db.get_participant(cid, b).unwrap().unwrap().unread_count, 0);

        let newly = db.mark_read(cid, b, &[m1.id, m2.id], Utc::now()).unwrap();
        assert_eq!(newly, vec![m2.id]);

        let loaded = db.get_message(m1.id).unwrap().unwrap();
        assert_eq!(loaded.read_by.len(), 1);
        assert!(loaded.is_read_by(b));
    }

    #[test]
    fn senders_lookup_filters_foreign_ids() {
        let (db, cid, a, _) = setup();
        let m = send(&db, cid, a, "mine", Utc::now());
        let stray = Uuid::new_v4();

        let found = db.message_senders_in_conversation(cid, &[m.id, stray]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get(&m.id), Some(&a));
    }

    #[test]
    fn edit_marks_message() {
        let (db, cid, a, _) = setup();
        let m = send(&db, cid, a, "draft", Utc::now());
        let edited = db.edit_message(m.id, "final", Utc::now()).unwrap().unwrap();
        assert_eq!(edited.content, "final");
        assert!(edited.is_edited);
        assert!(edited.edited_at.is_some());
        assert!(db.edit_message(Uuid::new_v4(), "x", Utc::now()).unwrap().is_none());
    }
}
