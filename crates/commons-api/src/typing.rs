use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use commons_gateway::typing;
use commons_types::api::{Claims, TypingRequest};
use commons_types::error::MessagingResult;

use crate::error::ApiError;
use crate::messenger::Messenger;
use crate::state::{AppState, blocking};

impl Messenger {
    /// Broadcast a typing signal under the user's display name, falling
    /// back to `fallback_name` when no profile is on file.
    pub fn set_typing(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        fallback_name: &str,
        is_typing: bool,
    ) -> MessagingResult<()> {
        self.require_conversation(conversation_id)?;

        let user_name = match self.profiles().resolve(user_id) {
            Ok(Some(profile)) => profile.display_name,
            _ => fallback_name.to_string(),
        };

        typing::set_typing(
            self.db(),
            self.broker(),
            conversation_id,
            user_id,
            &user_name,
            is_typing,
        )
    }
}

pub async fn set_typing(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<TypingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    blocking(&state, move |m| {
        m.set_typing(conversation_id, claims.sub, &claims.username, req.is_typing)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}
