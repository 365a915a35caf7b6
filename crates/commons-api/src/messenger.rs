use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use commons_db::Database;
use commons_gateway::dispatcher::{Broker, Presence};
use commons_types::error::{MessagingError, MessagingResult};
use commons_types::events::{Channel, ChannelEvent};
use commons_types::models::{Conversation, Participant};

use crate::profiles::ProfileResolver;

pub const DEFAULT_PAGE_LIMIT: u32 = 30;
pub const DEFAULT_PAGE_LIMIT_MAX: u32 = 100;

/// The conversation messaging engine. Every operation is synchronous and
/// touches the store directly; HTTP handlers run them on the blocking pool.
///
/// The store is authoritative. Events published after a commit are hints for
/// connected clients: a failed publish is logged and never undoes the write.
pub struct Messenger {
    db: Arc<Database>,
    broker: Arc<dyn Broker>,
    presence: Arc<dyn Presence>,
    profiles: Arc<dyn ProfileResolver>,
    page_limit_max: u32,
}

impl Messenger {
    pub fn new(
        db: Arc<Database>,
        broker: Arc<dyn Broker>,
        presence: Arc<dyn Presence>,
        profiles: Arc<dyn ProfileResolver>,
    ) -> Self {
        Self {
            db,
            broker,
            presence,
            profiles,
            page_limit_max: DEFAULT_PAGE_LIMIT_MAX,
        }
    }

    pub fn with_page_limit_max(mut self, page_limit_max: u32) -> Self {
        self.page_limit_max = page_limit_max.max(1);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn broker(&self) -> &dyn Broker {
        self.broker.as_ref()
    }

    pub(crate) fn presence(&self) -> &dyn Presence {
        self.presence.as_ref()
    }

    pub(crate) fn profiles(&self) -> &dyn ProfileResolver {
        self.profiles.as_ref()
    }

    pub(crate) fn page_limit_max(&self) -> u32 {
        self.page_limit_max
    }

    /// Best-effort publish. Failures are logged, not retried.
    pub(crate) fn publish(&self, channel: Channel, event: ChannelEvent) {
        let name = event.name();
        if let Err(e) = self.broker.publish(channel, event) {
            warn!("{} on {} not published: {}", name, channel, e);
        }
    }

    /// Publish the same event on several personal channels.
    pub(crate) fn publish_to_users<I>(&self, users: I, event: &ChannelEvent)
    where
        I: IntoIterator<Item = Uuid>,
    {
        for user_id in users {
            self.publish(Channel::User(user_id), event.clone());
        }
    }

    pub(crate) fn require_conversation(&self, conversation_id: Uuid) -> MessagingResult<Conversation> {
        self.db
            .get_conversation(conversation_id)?
            .ok_or(MessagingError::NotFound("conversation"))
    }

    /// The caller's participant row, or the appropriate rejection.
    pub(crate) fn require_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> MessagingResult<Participant> {
        if let Some(participant) = self.db.get_participant(conversation_id, user_id)? {
            return Ok(participant);
        }
        // Distinguish "no such conversation" from "not yours"
        self.require_conversation(conversation_id)?;
        Err(MessagingError::Authorization)
    }
}
