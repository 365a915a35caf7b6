//! Read receipts and delivery status.
//!
//! Receipts are append-only, which is what makes `seen` final: nothing here
//! ever removes one.

use std::collections::HashSet;

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use commons_types::api::{Claims, DeliveryStatusResponse, MarkReadRequest, MarkReadResponse};
use commons_types::delivery::DeliveryStatus;
use commons_types::error::{MessagingError, MessagingResult};
use commons_types::events::{Channel, ChannelEvent};
use commons_types::models::Message;

use crate::error::ApiError;
use crate::messenger::Messenger;
use crate::state::{AppState, blocking};

/// Upper bound on ids per read request; keeps the lookup under SQLite's
/// bound-parameter limit.
pub const MAX_READ_IDS: usize = 500;

impl Messenger {
    /// Record that `reader` has read `message_ids` and reset their unread
    /// count. Every id must belong to the conversation; the reader's own
    /// messages are skipped.
    pub fn mark_read(
        &self,
        conversation_id: Uuid,
        reader: Uuid,
        message_ids: &[Uuid],
    ) -> MessagingResult<MarkReadResponse> {
        self.require_participant(conversation_id, reader)?;

        let mut seen = HashSet::new();
        let ids: Vec<Uuid> = message_ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        if ids.len() > MAX_READ_IDS {
            return Err(MessagingError::validation(format!(
                "at most {} message ids per read request",
                MAX_READ_IDS
            )));
        }

        let senders = self.db().message_senders_in_conversation(conversation_id, &ids)?;
        if senders.len() != ids.len() {
            return Err(MessagingError::NotFound("message"));
        }
        let readable: Vec<Uuid> = ids
            .into_iter()
            .filter(|id| senders.get(id) != Some(&reader))
            .collect();

        let now = Utc::now();
        let newly_read = self.db().mark_read(conversation_id, reader, &readable, now)?;
        debug!("{} read {} new message(s) in {}", reader, newly_read.len(), conversation_id);

        let channel = Channel::Conversation(conversation_id);
        for &message_id in &newly_read {
            self.publish(
                channel,
                ChannelEvent::MessageRead {
                    message_id,
                    user_id: reader,
                    read_at: now,
                },
            );
        }
        self.publish(
            Channel::User(reader),
            ChannelEvent::UnreadCountUpdated {
                conversation_id,
                unread_count: 0,
            },
        );

        Ok(MarkReadResponse {
            newly_read,
            unread_count: 0,
        })
    }

    /// Status of a message as observed from `viewer`'s side.
    pub fn delivery_status(&self, message_id: Uuid, viewer: Uuid) -> MessagingResult<DeliveryStatus> {
        let message = self
            .db()
            .get_message(message_id)?
            .ok_or(MessagingError::NotFound("message"))?;
        Ok(DeliveryStatus::resolve(
            &message.read_by,
            viewer,
            self.presence().is_online(viewer),
        ))
    }

    /// Aggregate status of the requester's own message across every other
    /// participant.
    pub fn message_status(&self, message_id: Uuid, requester: Uuid) -> MessagingResult<DeliveryStatus> {
        let message = self
            .db()
            .get_message(message_id)?
            .ok_or(MessagingError::NotFound("message"))?;
        self.require_participant(message.conversation_id, requester)?;
        if message.sender_id != requester {
            return Err(MessagingError::Authorization);
        }

        let viewers = self.viewers_of(message.conversation_id, requester)?;
        Ok(self.aggregate_status(&message, &viewers))
    }

    /// Every participant other than `user_id`.
    pub(crate) fn viewers_of(&self, conversation_id: Uuid, user_id: Uuid) -> MessagingResult<Vec<Uuid>> {
        Ok(self
            .db()
            .list_participants(conversation_id)?
            .into_iter()
            .map(|p| p.user_id)
            .filter(|id| *id != user_id)
            .collect())
    }

    pub(crate) fn aggregate_status(&self, message: &Message, viewers: &[Uuid]) -> DeliveryStatus {
        DeliveryStatus::aggregate(viewers.iter().map(|&viewer| {
            DeliveryStatus::resolve(&message.read_by, viewer, self.presence().is_online(viewer))
        }))
    }
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = blocking(&state, move |m| {
        m.mark_read(conversation_id, claims.sub, &req.message_ids)
    })
    .await?;
    Ok(Json(response))
}

pub async fn message_status(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let status = blocking(&state, move |m| m.message_status(message_id, claims.sub)).await?;
    Ok(Json(DeliveryStatusResponse { message_id, status }))
}
