use std::collections::HashSet;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Deserialize;
use uuid::Uuid;

use commons_api::middleware::decode_claims;
use commons_api::profiles::DirectoryProfiles;
use commons_api::{AppStateInner, Messenger, router};
use commons_client::{ApiClient, ClientError, Reconciler};
use commons_db::Database;
use commons_gateway::connection::{GatewayContext, handle_connection};
use commons_gateway::dispatcher::Dispatcher;
use commons_types::api::{Claims, HistoryQuery, ReactionOutcome};
use commons_types::delivery::DeliveryStatus;
use commons_types::events::{ChannelEvent, GatewayFrame};
use commons_types::models::UserRole;

const SECRET: &str = "client-test-secret";

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

async fn upgrade(
    State(ctx): State<GatewayContext>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(claims) = decode_claims(SECRET, &query.token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_connection(socket, ctx, claims.sub, claims.username))
}

/// The REST router and the gateway on one ephemeral port.
async fn serve() -> String {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let dispatcher = Dispatcher::default();
    let messenger = Messenger::new(
        db.clone(),
        Arc::new(dispatcher.clone()),
        Arc::new(dispatcher.clone()),
        Arc::new(DirectoryProfiles::new(db.clone())),
    );

    let app = Router::new()
        .route("/gateway", get(upgrade))
        .with_state(GatewayContext { dispatcher, db })
        .merge(router(Arc::new(AppStateInner {
            messenger,
            jwt_secret: SECRET.into(),
        })));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base_url: &str, user_id: Uuid, role: UserRole) -> ApiClient {
    let claims = Claims {
        sub: user_id,
        username: format!("user-{}", &user_id.to_string()[..8]),
        role,
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
    ApiClient::new(base_url, token)
}

#[tokio::test]
async fn rest_round_trip_through_the_client() {
    let base_url = serve().await;
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let (alice, bola, outsider) = (
        client(&base_url, a, UserRole::Teacher),
        client(&base_url, b, UserRole::Parent),
        client(&base_url, c, UserRole::Student),
    );

    let direct = alice.create_direct(b).await.unwrap();
    let mut sent = Vec::new();
    for i in 1..=5 {
        sent.push(alice.send(direct.id, &format!("note {i}"), vec![]).await.unwrap());
    }

    // Walk history backwards following the cursor
    let newest = bola
        .fetch_page(direct.id, &HistoryQuery { limit: Some(3), cursor: None })
        .await
        .unwrap();
    assert!(newest.has_more);
    let older = bola
        .fetch_page(direct.id, &HistoryQuery { limit: Some(3), cursor: newest.next_cursor })
        .await
        .unwrap();
    assert!(!older.has_more);
    assert_eq!(older.next_cursor, None);

    let walked: Vec<Uuid> = older
        .messages
        .iter()
        .chain(newest.messages.iter())
        .map(|m| m.message.id)
        .collect();
    assert_eq!(walked, sent.iter().map(|m| m.id).collect::<Vec<_>>());

    let mut view = Reconciler::new(direct.id);
    view.load_page(&older);
    view.load_page(&newest);
    assert_eq!(view.len(), 5);

    let target = sent[0].id;
    assert_eq!(bola.react(target, "👍").await.unwrap(), ReactionOutcome::Added);
    assert_eq!(bola.react(target, "👍").await.unwrap(), ReactionOutcome::Removed);

    let read = bola.mark_read(direct.id, walked.clone()).await.unwrap();
    assert_eq!(read.newly_read.iter().copied().collect::<HashSet<_>>(), walked.iter().copied().collect());
    assert_eq!(read.unread_count, 0);

    let summaries = bola.list_conversations().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].unread_count, 0);

    let own = alice
        .fetch_page(direct.id, &HistoryQuery::default())
        .await
        .unwrap();
    assert!(own.messages.iter().all(|m| m.status == Some(DeliveryStatus::Seen)));

    // Rejections come back with the server's status and message
    match outsider.send(direct.id, "let me in", vec![]).await {
        Err(ClientError::Api { status, .. }) => assert_eq!(status, 403),
        other => panic!("expected a 403, got {other:?}"),
    }
    match alice.send(direct.id, "   ", vec![]).await {
        Err(ClientError::Api { status, message }) => {
            assert_eq!(status, 400);
            assert!(!message.is_empty());
        }
        other => panic!("expected a 400, got {other:?}"),
    }
}

#[tokio::test]
async fn gateway_opened_from_the_client_sees_new_messages() {
    let base_url = serve().await;
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let (alice, bola) = (client(&base_url, a, UserRole::Teacher), client(&base_url, b, UserRole::Parent));
    let direct = alice.create_direct(b).await.unwrap();

    let mut conn = bola.open_gateway().await.unwrap();
    assert_eq!(conn.user_id(), b);

    // The denial for the unknown id marks the subscription as applied
    let unknown = Uuid::new_v4();
    conn.subscribe(vec![direct.id, unknown]).await.unwrap();
    loop {
        match conn.next_event().await.unwrap() {
            Some(GatewayFrame::SubscribeDenied { conversation_ids }) => {
                assert_eq!(conversation_ids, vec![unknown]);
                break;
            }
            Some(_) => continue,
            None => panic!("gateway closed early"),
        }
    }

    let message = alice.send(direct.id, "see you at pickup", vec![]).await.unwrap();
    loop {
        match conn.next_event().await.unwrap() {
            Some(GatewayFrame::Event(envelope)) => {
                if let ChannelEvent::NewMessage { message: received, .. } = &envelope.event {
                    assert_eq!(received.id, message.id);
                    break;
                }
            }
            Some(_) => continue,
            None => panic!("gateway closed early"),
        }
    }

    conn.close().await.unwrap();
}
