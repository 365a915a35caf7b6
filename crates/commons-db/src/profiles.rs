use anyhow::Result;
use rusqlite::params;
use uuid::Uuid;

use crate::Database;
use crate::models::{OptionalExt, ProfileRow};

impl Database {
    /// Insert or refresh a display profile pushed by the identity service.
    pub fn upsert_profile(
        &self,
        user_id: Uuid,
        display_name: &str,
        avatar_url: Option<&str>,
        role: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (user_id, display_name, avatar_url, role) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    avatar_url = excluded.avatar_url,
                    role = excluded.role",
                params![user_id.to_string(), display_name, avatar_url, role],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, user_id: Uuid) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, display_name, avatar_url, role FROM profiles WHERE user_id = ?1",
                [user_id.to_string()],
                |row| {
                    Ok(ProfileRow {
                        user_id: row.get(0)?,
                        display_name: row.get(1)?,
                        avatar_url: row.get(2)?,
                        role: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }
}
