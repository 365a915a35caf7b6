//! Typing signals. Never persisted; a lost "stopped typing" is healed by the
//! receiver's own expiry window.

use tracing::warn;
use uuid::Uuid;

use commons_db::Database;
use commons_types::error::{MessagingError, MessagingResult};
use commons_types::events::{Channel, ChannelEvent};

use crate::dispatcher::Broker;

/// Publish a typing signal on the conversation channel. Only participants may
/// signal; publish failures are logged and swallowed.
pub fn set_typing(
    db: &Database,
    broker: &dyn Broker,
    conversation_id: Uuid,
    user_id: Uuid,
    user_name: &str,
    is_typing: bool,
) -> MessagingResult<()> {
    if db.get_participant(conversation_id, user_id)?.is_none() {
        return Err(MessagingError::Authorization);
    }

    let channel = Channel::Conversation(conversation_id);
    let event = ChannelEvent::Typing {
        user_id,
        user_name: user_name.to_string(),
        is_typing,
    };
    if let Err(e) = broker.publish(channel, event) {
        warn!("typing on {} not published: {}", channel, e);
    }

    Ok(())
}
