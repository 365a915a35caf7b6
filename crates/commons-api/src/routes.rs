use axum::{
    Json, Router,
    middleware,
    routing::{delete, get, post},
};
use serde_json::{Value, json};

use crate::middleware::require_auth;
use crate::state::AppState;
use crate::{conversations, messages, reactions, receipts, typing};

/// The REST surface. Everything except `/health` requires a bearer token.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/direct", post(conversations::create_direct))
        .route("/conversations/group", post(conversations::create_group))
        .route("/conversations/{conversation_id}", get(conversations::get_conversation))
        .route(
            "/conversations/{conversation_id}/members",
            post(conversations::add_member),
        )
        .route(
            "/conversations/{conversation_id}/members/{user_id}",
            delete(conversations::remove_member),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/conversations/{conversation_id}/read", post(receipts::mark_read))
        .route("/conversations/{conversation_id}/typing", post(typing::set_typing))
        .route(
            "/messages/{message_id}",
            delete(messages::delete_message).patch(messages::edit_message),
        )
        .route("/messages/{message_id}/reactions", post(reactions::toggle_reaction))
        .route("/messages/{message_id}/status", get(receipts::message_status))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new().route("/health", get(health)).merge(protected)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
