use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use commons_types::models::{Conversation, ConversationKind, Participant, ParticipantRole};

use crate::Database;
use crate::models::{OptionalExt, Removal, enum_col, opt_time_col, time_col, to_micros, uuid_col};

const CONVERSATION_COLUMNS: &str = "id, kind, name, created_by, created_at, last_activity_at";
const PARTICIPANT_COLUMNS: &str = "conversation_id, user_id, role, unread_count, last_read_at";

/// Key identifying the unordered pair {a, b}.
pub fn direct_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

impl Database {
    // -- Conversations --

    /// Returns the direct conversation between `a` and `b`, creating it if it
    /// does not exist yet. The `bool` is true when this call created it.
    ///
    /// The UNIQUE constraint on `direct_key` is the serialization point: a
    /// racing insert for the same pair becomes a no-op and both callers read
    /// back the single surviving row.
    pub fn find_or_create_direct(
        &self,
        id: Uuid,
        a: Uuid,
        b: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        let key = direct_key(a, b);
        self.with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT INTO conversations (id, kind, name, created_by, direct_key, created_at, last_activity_at)
                 VALUES (?1, 'direct', NULL, ?2, ?3, ?4, ?4)
                 ON CONFLICT(direct_key) DO NOTHING",
                params![id.to_string(), a.to_string(), key, to_micros(now)],
            )?;

            if inserted == 1 {
                for user in [a, b] {
                    insert_participant(tx, id, user, ParticipantRole::Member, now)?;
                }
            }

            let conversation = tx.query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE direct_key = ?1"),
                [&key],
                conversation_from_row,
            )?;

            Ok((conversation, inserted == 1))
        })
    }

    /// Insert a group conversation. `members` must already be deduplicated
    /// and contain `creator`.
    pub fn create_group(
        &self,
        id: Uuid,
        name: Option<&str>,
        creator: Uuid,
        members: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO conversations (id, kind, name, created_by, direct_key, created_at, last_activity_at)
                 VALUES (?1, 'group', ?2, ?3, NULL, ?4, ?4)",
                params![id.to_string(), name, creator.to_string(), to_micros(now)],
            )?;

            for &user in members {
                let role = if user == creator {
                    ParticipantRole::Admin
                } else {
                    ParticipantRole::Member
                };
                insert_participant(tx, id, user, role, now)?;
            }

            query_conversation(tx, id)?
                .ok_or_else(|| anyhow::anyhow!("Group {} vanished after insert", id))
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// Conversations `user_id` participates in, most recently active first.
    pub fn list_conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.kind, c.name, c.created_by, c.created_at, c.last_activity_at
                 FROM conversations c
                 JOIN participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.last_activity_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id.to_string()], conversation_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Participants --

    pub fn get_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Option<Participant>> {
        self.with_conn(|conn| query_participant(conn, conversation_id, user_id))
    }

    pub fn list_participants(&self, conversation_id: Uuid) -> Result<Vec<Participant>> {
        self.with_conn(|conn| query_participants(conn, conversation_id))
    }

    /// Returns false if the user was already a participant.
    pub fn add_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_tx(|tx| {
            if query_participant(tx, conversation_id, user_id)?.is_some() {
                return Ok(false);
            }
            insert_participant(tx, conversation_id, user_id, role, now)?;
            Ok(true)
        })
    }

    /// Remove `user_id` unless that would leave fewer than `min` participants.
    /// The count and the delete share one transaction, so concurrent removals
    /// cannot both pass the check.
    pub fn remove_participant_keeping(&self, conversation_id: Uuid, user_id: Uuid, min: usize) -> Result<Removal> {
        self.with_tx(|tx| {
            if query_participant(tx, conversation_id, user_id)?.is_none() {
                return Ok(Removal::NotParticipant);
            }

            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1",
                [conversation_id.to_string()],
                |row| row.get(0),
            )?;
            if (count as usize) <= min {
                return Ok(Removal::TooFew);
            }

            tx.execute(
                "DELETE FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), user_id.to_string()],
            )?;
            Ok(Removal::Removed)
        })
    }
}

pub(crate) fn insert_participant(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
    role: ParticipantRole,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO participants (conversation_id, user_id, role, unread_count, last_read_at, joined_at)
         VALUES (?1, ?2, ?3, 0, NULL, ?4)",
        params![
            conversation_id.to_string(),
            user_id.to_string(),
            role.as_str(),
            to_micros(now)
        ],
    )?;
    Ok(())
}

pub(crate) fn query_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
        [id.to_string()],
        conversation_from_row,
    )
    .optional()
}

pub(crate) fn query_participant(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<Option<Participant>> {
    conn.query_row(
        &format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE conversation_id = ?1 AND user_id = ?2"
        ),
        params![conversation_id.to_string(), user_id.to_string()],
        participant_from_row,
    )
    .optional()
}

pub(crate) fn query_participants(conn: &Connection, conversation_id: Uuid) -> Result<Vec<Participant>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE conversation_id = ?1 ORDER BY joined_at, user_id"
    ))?;

    let rows = stmt
        .query_map([conversation_id.to_string()], participant_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_col(row, 0)?,
        kind: enum_col::<ConversationKind>(row, 1)?,
        name: row.get(2)?,
        created_by: uuid_col(row, 3)?,
        created_at: time_col(row, 4)?,
        last_activity_at: time_col(row, 5)?,
    })
}

fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        conversation_id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        role: enum_col::<ParticipantRole>(row, 2)?,
        unread_count: row.get(3)?,
        last_read_at: opt_time_col(row, 4)?,
    })
}
