use std::collections::HashSet;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use commons_db::models::Removal;
use commons_types::api::{
    AddMemberRequest, Claims, ConversationDetail, ConversationSummary, CreateDirectRequest,
    CreateGroupRequest,
};
use commons_types::error::{MessagingError, MessagingResult};
use commons_types::events::{Channel, ChannelEvent};
use commons_types::models::{
    Capabilities, Conversation, ConversationKind, ParticipantRole, UserRole,
};

use crate::error::ApiError;
use crate::messenger::Messenger;
use crate::state::{AppState, blocking};

const MAX_GROUP_NAME_CHARS: usize = 100;
const MIN_GROUP_MEMBERS: usize = 2;

impl Messenger {
    /// The direct conversation between `a` and `b`, created on first use.
    /// Repeated or concurrent calls for the same pair all return one row.
    pub fn get_or_create_direct(&self, a: Uuid, b: Uuid) -> MessagingResult<Conversation> {
        if a == b {
            return Err(MessagingError::validation("cannot start a direct conversation with yourself"));
        }

        let (conversation, created) = self.db().find_or_create_direct(Uuid::new_v4(), a, b, Utc::now())?;

        if created {
            info!("Direct conversation {} created between {} and {}", conversation.id, a, b);
            let event = ChannelEvent::NewConversation { conversation_id: conversation.id };
            self.publish_to_users([a, b], &event);
        }

        Ok(conversation)
    }

    /// Create a group. The creator is always a member and its admin.
    pub fn create_group(
        &self,
        name: Option<&str>,
        creator: Uuid,
        member_ids: &[Uuid],
    ) -> MessagingResult<Conversation> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        if let Some(name) = name {
            if name.chars().count() > MAX_GROUP_NAME_CHARS {
                return Err(MessagingError::validation(format!(
                    "group name longer than {} characters",
                    MAX_GROUP_NAME_CHARS
                )));
            }
        }

        let mut seen = HashSet::new();
        let members: Vec<Uuid> = std::iter::once(creator)
            .chain(member_ids.iter().copied())
            .filter(|id| seen.insert(*id))
            .collect();
        if members.len() < MIN_GROUP_MEMBERS {
            return Err(MessagingError::validation("a group needs at least 2 distinct members"));
        }

        let conversation = self.db().create_group(
            Uuid::new_v4(),
            name,
            creator,
            &members,
            Utc::now(),
        )?;

        info!("Group {} created by {} with {} members", conversation.id, creator, members.len());
        let event = ChannelEvent::NewConversation { conversation_id: conversation.id };
        self.publish_to_users(members, &event);

        Ok(conversation)
    }

    pub fn get_conversation(&self, conversation_id: Uuid, requester: Uuid) -> MessagingResult<ConversationDetail> {
        self.require_participant(conversation_id, requester)?;
        let conversation = self.require_conversation(conversation_id)?;
        let participants = self.db().list_participants(conversation_id)?;
        Ok(ConversationDetail { conversation, participants })
    }

    /// Every conversation `user_id` is in, most recently active first.
    pub fn list_conversations(&self, user_id: Uuid) -> MessagingResult<Vec<ConversationSummary>> {
        let conversations = self.db().list_conversations_for_user(user_id)?;

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let participants = self.db().list_participants(conversation.id)?;
            let unread_count = participants
                .iter()
                .find(|p| p.user_id == user_id)
                .map_or(0, |p| p.unread_count);
            let last_message = self.db().last_visible_message(conversation.id)?;

            summaries.push(ConversationSummary {
                conversation,
                participants,
                unread_count,
                last_message,
            });
        }

        Ok(summaries)
    }

    /// Add `user_id` to a group. Group admins may do this, as may identities
    /// whose role can manage any group. Adding an existing member is a no-op.
    pub fn add_member(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
        actor_role: UserRole,
        user_id: Uuid,
    ) -> MessagingResult<()> {
        let conversation = self.require_group(conversation_id)?;
        self.require_group_admin(conversation.id, actor, actor_role)?;

        if !self.db().add_participant(conversation_id, user_id, ParticipantRole::Member, Utc::now())? {
            return Ok(());
        }

        info!("{} added {} to group {}", actor, user_id, conversation_id);
        self.publish(Channel::User(user_id), ChannelEvent::NewConversation { conversation_id });
        self.announce_update(conversation_id);
        Ok(())
    }

    /// Remove `user_id` from a group. Admins may remove anyone; members may
    /// remove themselves. A group never drops below 2 participants.
    pub fn remove_member(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
        actor_role: UserRole,
        user_id: Uuid,
    ) -> MessagingResult<()> {
        let conversation = self.require_group(conversation_id)?;
        if actor == user_id {
            self.require_participant(conversation.id, actor)?;
        } else {
            self.require_group_admin(conversation.id, actor, actor_role)?;
        }

        match self.db().remove_participant_keeping(conversation_id, user_id, MIN_GROUP_MEMBERS)? {
            Removal::Removed => {}
            Removal::NotParticipant => return Err(MessagingError::NotFound("participant")),
            Removal::TooFew => return Err(MessagingError::validation("a group needs at least 2 members")),
        }

        info!("{} removed {} from group {}", actor, user_id, conversation_id);
        self.publish(
            Channel::User(user_id),
            ChannelEvent::MemberRemoved { conversation_id, user_id },
        );
        self.announce_update(conversation_id);
        Ok(())
    }

    fn require_group(&self, conversation_id: Uuid) -> MessagingResult<Conversation> {
        let conversation = self.require_conversation(conversation_id)?;
        if conversation.kind != ConversationKind::Group {
            return Err(MessagingError::validation("direct conversations have a fixed membership"));
        }
        Ok(conversation)
    }

    fn require_group_admin(&self, conversation_id: Uuid, actor: Uuid, actor_role: UserRole) -> MessagingResult<()> {
        if actor_role.can_manage_any_group() {
            return Ok(());
        }
        let participant = self.require_participant(conversation_id, actor)?;
        if participant.role != ParticipantRole::Admin {
            return Err(MessagingError::Authorization);
        }
        Ok(())
    }

    /// Tell every participant's conversation list to refresh.
    pub(crate) fn announce_update(&self, conversation_id: Uuid) {
        let participants = match self.db().list_participants(conversation_id) {
            Ok(participants) => participants,
            Err(e) => {
                warn!("participants of {} unavailable for fan-out: {}", conversation_id, e);
                return;
            }
        };
        let last_message = match self.db().last_visible_message(conversation_id) {
            Ok(last_message) => last_message,
            Err(e) => {
                warn!("last message of {} unavailable for fan-out: {}", conversation_id, e);
                None
            }
        };

        let event = ChannelEvent::ConversationUpdated { conversation_id, last_message };
        self.publish_to_users(participants.into_iter().map(|p| p.user_id), &event);
    }
}

// -- Handlers --

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let summaries = blocking(&state, move |m| m.list_conversations(claims.sub)).await?;
    Ok(Json(summaries))
}

pub async fn create_direct(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateDirectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = blocking(&state, move |m| m.get_or_create_direct(claims.sub, req.user_id)).await?;
    Ok(Json(conversation))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !claims.role.can_create_groups() {
        return Err(ApiError(MessagingError::Authorization));
    }

    let conversation = blocking(&state, move |m| {
        m.create_group(req.name.as_deref(), claims.sub, &req.member_ids)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = blocking(&state, move |m| m.get_conversation(conversation_id, claims.sub)).await?;
    Ok(Json(detail))
}

pub async fn add_member(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    blocking(&state, move |m| {
        m.add_member(conversation_id, claims.sub, claims.role, req.user_id)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_member(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    blocking(&state, move |m| {
        m.remove_member(conversation_id, claims.sub, claims.role, user_id)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}
