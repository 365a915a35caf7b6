use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use commons_db::models::ReactionToggle;
use commons_types::api::{Claims, ReactionOutcome, ToggleReactionRequest, ToggleReactionResponse};
use commons_types::error::{MessagingError, MessagingResult};
use commons_types::events::{Channel, ChannelEvent};
use commons_types::models::ReactionEntry;

use crate::error::ApiError;
use crate::messenger::Messenger;
use crate::state::{AppState, blocking};

pub const MAX_EMOJI_BYTES: usize = 32;

impl Messenger {
    /// Three-state toggle: none -> E, E -> none, E -> F. A user holds at most
    /// one reaction per message.
    pub fn react(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> MessagingResult<ReactionOutcome> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(MessagingError::validation("emoji is empty"));
        }
        if emoji.len() > MAX_EMOJI_BYTES {
            return Err(MessagingError::validation(format!(
                "emoji longer than {} bytes",
                MAX_EMOJI_BYTES
            )));
        }

        let message = self
            .db()
            .get_message(message_id)?
            .filter(|m| !m.is_deleted)
            .ok_or(MessagingError::NotFound("message"))?;
        self.require_participant(message.conversation_id, user_id)?;

        let toggle = self
            .db()
            .toggle_reaction(Uuid::new_v4(), message_id, user_id, emoji, Utc::now())?;

        let channel = Channel::Conversation(message.conversation_id);
        let outcome = match toggle {
            ReactionToggle::Added => {
                self.publish(
                    channel,
                    ChannelEvent::ReactionAdded {
                        message_id,
                        reaction: ReactionEntry {
                            emoji: emoji.to_string(),
                            user_id,
                        },
                    },
                );
                ReactionOutcome::Added
            }
            ReactionToggle::Removed => {
                self.publish(
                    channel,
                    ChannelEvent::ReactionRemoved {
                        message_id,
                        user_id,
                        emoji: emoji.to_string(),
                    },
                );
                ReactionOutcome::Removed
            }
        };

        Ok(outcome)
    }
}

pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = blocking(&state, move |m| m.react(message_id, claims.sub, &req.emoji)).await?;
    Ok(Json(ToggleReactionResponse { result }))
}
