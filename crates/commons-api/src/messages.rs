use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use commons_db::models::NewMessage;
use commons_types::api::{
    Claims, EditMessageRequest, HistoryMessage, HistoryPage, HistoryQuery, SendMessageRequest,
};
use commons_types::error::{MessagingError, MessagingResult};
use commons_types::events::{Channel, ChannelEvent};
use commons_types::models::{Attachment, Message};

use crate::error::ApiError;
use crate::messenger::{DEFAULT_PAGE_LIMIT, Messenger};
use crate::profiles::resolve_or_placeholder;
use crate::state::{AppState, blocking};

pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MAX_ATTACHMENTS: usize = 10;

fn validate_content(content: &str, attachments: &[Attachment]) -> MessagingResult<()> {
    if content.trim().is_empty() && attachments.is_empty() {
        return Err(MessagingError::validation("message has no content"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(MessagingError::validation(format!(
            "message longer than {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    if attachments.len() > MAX_ATTACHMENTS {
        return Err(MessagingError::validation(format!(
            "more than {} attachments",
            MAX_ATTACHMENTS
        )));
    }
    if attachments.iter().any(|a| a.locator.trim().is_empty()) {
        return Err(MessagingError::validation("attachment locator is empty"));
    }
    Ok(())
}

impl Messenger {
    /// Persist a message and fan it out.
    ///
    /// Persistence, the activity bump and the unread increments commit
    /// together or not at all. Everything after the commit is best-effort.
    pub fn send(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        attachments: &[Attachment],
    ) -> MessagingResult<Message> {
        let content = content.trim();
        validate_content(content, attachments)?;
        self.require_participant(conversation_id, sender_id)?;

        let message = self.db().insert_message(NewMessage {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content,
            attachments,
            now: Utc::now(),
        })?;

        debug!("Message {} stored in {}", message.id, conversation_id);

        let sender = resolve_or_placeholder(self.profiles(), sender_id);
        self.publish(
            Channel::Conversation(conversation_id),
            ChannelEvent::NewMessage {
                message: message.clone(),
                sender,
            },
        );
        self.announce_update(conversation_id);

        Ok(message)
    }

    /// Replace a message's content. Only its sender may, and only while
    /// still a participant.
    pub fn edit(&self, message_id: Uuid, editor_id: Uuid, content: &str) -> MessagingResult<Message> {
        let content = content.trim();
        validate_content(content, &[])?;

        let message = self.require_own_message(message_id, editor_id)?;

        let updated = self
            .db()
            .edit_message(message_id, content, Utc::now())?
            .ok_or(MessagingError::NotFound("message"))?;

        info!("Message {} edited by {}", message_id, editor_id);
        self.publish(
            Channel::Conversation(message.conversation_id),
            ChannelEvent::MessageEdited {
                message_id,
                message: updated.clone(),
            },
        );
        self.announce_update(message.conversation_id);

        Ok(updated)
    }

    /// Flag a message as deleted. Deleting twice succeeds without a second event.
    pub fn soft_delete(&self, message_id: Uuid, requester_id: Uuid) -> MessagingResult<()> {
        let message = self
            .db()
            .get_message(message_id)?
            .ok_or(MessagingError::NotFound("message"))?;
        if message.sender_id != requester_id {
            return Err(MessagingError::Authorization);
        }
        self.require_participant(message.conversation_id, requester_id)?;

        if !self.db().soft_delete_message(message_id)? {
            return Ok(());
        }

        info!("Message {} deleted by {}", message_id, requester_id);
        self.publish(
            Channel::Conversation(message.conversation_id),
            ChannelEvent::MessageDeleted { message_id },
        );
        self.announce_update(message.conversation_id);

        Ok(())
    }

    /// One page of history walking backwards from `cursor`, returned oldest
    /// first. The requester's own messages carry their aggregate status.
    pub fn fetch_page(
        &self,
        conversation_id: Uuid,
        requester_id: Uuid,
        query: &HistoryQuery,
    ) -> MessagingResult<HistoryPage> {
        let limit = match query.limit {
            Some(0) => return Err(MessagingError::validation("limit must be at least 1")),
            Some(limit) => limit.min(self.page_limit_max()),
            None => DEFAULT_PAGE_LIMIT.min(self.page_limit_max()),
        };

        self.require_participant(conversation_id, requester_id)?;

        let mut messages = self.db().fetch_history(conversation_id, limit, query.cursor)?;
        let has_more = messages.len() == limit as usize;
        let next_cursor = if has_more {
            messages.last().map(|m| m.created_at)
        } else {
            None
        };
        messages.reverse();

        let viewers = self.viewers_of(conversation_id, requester_id)?;
        let messages = messages
            .into_iter()
            .map(|message| {
                let status = (message.sender_id == requester_id)
                    .then(|| self.aggregate_status(&message, &viewers));
                HistoryMessage { message, status }
            })
            .collect();

        Ok(HistoryPage {
            messages,
            has_more,
            next_cursor,
        })
    }

    /// The message, if it exists, is not deleted, and was sent by `user_id`
    /// who is still a participant.
    fn require_own_message(&self, message_id: Uuid, user_id: Uuid) -> MessagingResult<Message> {
        let message = self
            .db()
            .get_message(message_id)?
            .filter(|m| !m.is_deleted)
            .ok_or(MessagingError::NotFound("message"))?;
        if message.sender_id != user_id {
            return Err(MessagingError::Authorization);
        }
        self.require_participant(message.conversation_id, user_id)?;
        Ok(message)
    }
}

// -- Handlers --

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = blocking(&state, move |m| {
        m.send(conversation_id, claims.sub, &req.content, &req.attachments)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let page = blocking(&state, move |m| m.fetch_page(conversation_id, claims.sub, &query)).await?;
    Ok(Json(page))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = blocking(&state, move |m| m.edit(message_id, claims.sub, &req.content)).await?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    blocking(&state, move |m| m.soft_delete(message_id, claims.sub)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(locator: &str) -> Attachment {
        Attachment {
            locator: locator.into(),
            file_name: None,
            content_type: None,
        }
    }

    #[test]
    fn blank_content_needs_an_attachment() {
        assert!(validate_content("", &[]).is_err());
        assert!(validate_content("   ", &[]).is_err());
        assert!(validate_content("", &[attachment("files/abc")]).is_ok());
        assert!(validate_content("hi", &[]).is_ok());
    }

    #[test]
    fn attachment_limits() {
        assert!(validate_content("x", &[attachment(" ")]).is_err());
        let many: Vec<_> = (0..=MAX_ATTACHMENTS).map(|i| attachment(&format!("f/{i}"))).collect();
        assert!(validate_content("x", &many).is_err());
        assert!(validate_content("x", &many[..MAX_ATTACHMENTS]).is_ok());
    }

    #[test]
    fn content_length_counts_chars() {
        let at_limit = "é".repeat(MAX_CONTENT_CHARS);
        assert!(validate_content(&at_limit, &[]).is_ok());
        let over = "a".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(validate_content(&over, &[]), Err(MessagingError::Validation(_))));
    }
}
