use std::sync::Arc;

use anyhow::Result;
use tracing::warn;
use uuid::Uuid;

use commons_db::Database;
use commons_types::models::{SenderProfile, UserRole};

/// Looks up display profiles in the identity service. Read-only.
pub trait ProfileResolver: Send + Sync {
    fn resolve(&self, user_id: Uuid) -> Result<Option<SenderProfile>>;
}

/// Resolver backed by the profile mirror table in the local store.
pub struct DirectoryProfiles {
    db: Arc<Database>,
}

impl DirectoryProfiles {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl ProfileResolver for DirectoryProfiles {
    fn resolve(&self, user_id: Uuid) -> Result<Option<SenderProfile>> {
        let Some(row) = self.db.get_profile(user_id)? else {
            return Ok(None);
        };

        let role = match row.role.parse::<UserRole>() {
            Ok(role) => Some(role),
            Err(e) => {
                warn!("Profile {} has {}", row.user_id, e);
                None
            }
        };

        Ok(Some(SenderProfile {
            user_id,
            display_name: row.display_name,
            avatar_url: row.avatar_url,
            role,
        }))
    }
}

/// Resolve a profile for event decoration. Never fails: a missing or broken
/// profile degrades to a placeholder rather than holding back the event.
pub fn resolve_or_placeholder(resolver: &dyn ProfileResolver, user_id: Uuid) -> SenderProfile {
    match resolver.resolve(user_id) {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            warn!("No profile for {}, using placeholder", user_id);
            SenderProfile::unknown(user_id)
        }
        Err(e) => {
            warn!("Profile lookup for {} failed: {}", user_id, e);
            SenderProfile::unknown(user_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_resolves_known_profile() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = Uuid::new_v4();
        db.upsert_profile(user, "Mr. Haddad", Some("https://cdn/h.png"), "teacher").unwrap();

        let profiles = DirectoryProfiles::new(db);
        let profile = profiles.resolve(user).unwrap().unwrap();
        assert_eq!(profile.display_name, "Mr. Haddad");
        assert_eq!(profile.role, Some(UserRole::Teacher));
    }

    #[test]
    fn unknown_role_keeps_profile() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = Uuid::new_v4();
        db.upsert_profile(user, "Visitor", None, "janitor").unwrap();

        let profile = DirectoryProfiles::new(db).resolve(user).unwrap().unwrap();
        assert_eq!(profile.role, None);
    }

    #[test]
    fn missing_profile_degrades_to_placeholder() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let profiles = DirectoryProfiles::new(db);
        let user = Uuid::new_v4();
        assert_eq!(resolve_or_placeholder(&profiles, user), SenderProfile::unknown(user));
    }
}
