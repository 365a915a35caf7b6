use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use commons_types::models::ReactionEntry;

use crate::Database;
use crate::messages::placeholders;
use crate::models::{OptionalExt, ReactionToggle, to_micros, uuid_col};

impl Database {
    /// Toggle a reaction with single-active-reaction-per-user semantics:
    /// - the same emoji again removes it;
    /// - a different emoji replaces whatever the user had on the message.
    ///
    /// The delete always precedes the insert, and both run in one
    /// transaction, so no interleaving can leave two rows for (message, user).
    pub fn toggle_reaction(
        &self,
        id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
        now: DateTime<Utc>,
    ) -> Result<ReactionToggle> {
        let mid = message_id.to_string();
        let uid = user_id.to_string();
        self.with_tx(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    params![mid, uid, emoji],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                tx.execute("DELETE FROM reactions WHERE id = ?1", [&existing_id])?;
                return Ok(ReactionToggle::Removed);
            }

            tx.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2",
                params![mid, uid],
            )?;
            tx.execute(
                "INSERT INTO reactions (id, message_id, user_id, emoji, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), mid, uid, emoji, to_micros(now)],
            )?;
            Ok(ReactionToggle::Added)
        })
    }

    /// Reactions currently on a message.
    pub fn get_reactions(&self, message_id: Uuid) -> Result<Vec<ReactionEntry>> {
        self.with_conn(|conn| {
            let rows = query_reactions_for_messages(conn, &[message_id.to_string()])?;
            Ok(rows.into_iter().map(|(_, entry)| entry).collect())
        })
    }
}

/// Batch-fetch reactions for a set of message IDs.
pub(crate) fn query_reactions_for_messages(
    conn: &Connection,
    message_ids: &[String],
) -> Result<Vec<(Uuid, ReactionEntry)>> {
    if message_ids.is_empty() {
        return Ok(vec![]);
    }

    let sql = format!(
        "SELECT message_id, user_id, emoji FROM reactions WHERE message_id IN ({}) ORDER BY created_at, user_id",
        placeholders(1, message_ids.len())
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(message_ids.iter()), |row| {
            Ok((
                uuid_col(row, 0)?,
                ReactionEntry {
                    user_id: uuid_col(row, 1)?,
                    emoji: row.get(2)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}
