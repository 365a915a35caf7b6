use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use commons_client::{GatewayConnection, Reconciler};
use commons_db::Database;
use commons_gateway::connection::{GatewayContext, handle_connection};
use commons_gateway::dispatcher::{Broker, Dispatcher, Presence};
use commons_types::events::{Channel, ChannelEvent, GatewayFrame};
use commons_types::models::{Message, SenderProfile};

#[derive(Deserialize)]
struct TokenQuery {
    token: Uuid,
}

/// Gateway whose "token" is the user id itself.
async fn upgrade(
    State(ctx): State<GatewayContext>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, ctx, query.token, "tester".into()))
}

async fn serve(ctx: GatewayContext) -> String {
    let app = Router::new().route("/gateway", get(upgrade)).with_state(ctx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn message(conversation_id: Uuid, sender_id: Uuid) -> Message {
    Message {
        id: Uuid::new_v4(),
        conversation_id,
        sender_id,
        content: "hello over the wire".into(),
        attachments: vec![],
        created_at: Utc::now(),
        is_deleted: false,
        is_edited: false,
        edited_at: None,
        read_by: vec![],
        reactions: vec![],
    }
}

#[tokio::test]
async fn connection_receives_subscribed_events_and_tracks_presence() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let dispatcher = Dispatcher::default();
    let (me, peer) = (Uuid::new_v4(), Uuid::new_v4());
    let (conversation, _) = db.find_or_create_direct(Uuid::new_v4(), me, peer, Utc::now()).unwrap();
    let base_url = serve(GatewayContext {
        dispatcher: dispatcher.clone(),
        db,
    })
    .await;

    let mut conn = GatewayConnection::open(&base_url, &me.to_string()).await.unwrap();
    assert_eq!(conn.user_id(), me);
    assert!(dispatcher.is_online(me));

    // The denial arrives after the whole subscribe command is applied
    let foreign = Uuid::new_v4();
    conn.subscribe(vec![conversation.id, foreign]).await.unwrap();
    assert_eq!(
        conn.next_event().await.unwrap(),
        Some(GatewayFrame::SubscribeDenied { conversation_ids: vec![foreign] })
    );

    let sent = message(conversation.id, peer);
    let event = ChannelEvent::NewMessage {
        message: sent.clone(),
        sender: SenderProfile::unknown(peer),
    };
    dispatcher.publish(Channel::Conversation(foreign), event.clone()).unwrap();
    dispatcher.publish(Channel::Conversation(conversation.id), event.clone()).unwrap();
    dispatcher.publish(Channel::Conversation(conversation.id), event).unwrap();

    let mut view = Reconciler::new(conversation.id);
    for _ in 0..2 {
        let Some(GatewayFrame::Event(envelope)) = conn.next_event().await.unwrap() else {
            panic!("expected an event frame");
        };
        assert_eq!(envelope.channel, Channel::Conversation(conversation.id));
        view.apply(&envelope);
    }
    assert_eq!(view.len(), 1);
    assert_eq!(view.get(sent.id).map(|m| m.content.as_str()), Some("hello over the wire"));

    conn.close().await.unwrap();
    for _ in 0..50 {
        if !dispatcher.is_online(me) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(!dispatcher.is_online(me));
}

#[tokio::test]
async fn removed_member_stops_receiving_conversation_events() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let dispatcher = Dispatcher::default();
    let (me, admin, other) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let group = db
        .create_group(Uuid::new_v4(), Some("Choir"), admin, &[admin, me, other], Utc::now())
        .unwrap();
    let base_url = serve(GatewayContext {
        dispatcher: dispatcher.clone(),
        db: db.clone(),
    })
    .await;

    let mut conn = GatewayConnection::open(&base_url, &me.to_string()).await.unwrap();
    let foreign = Uuid::new_v4();
    conn.subscribe(vec![group.id, foreign]).await.unwrap();
    assert_eq!(
        conn.next_event().await.unwrap(),
        Some(GatewayFrame::SubscribeDenied { conversation_ids: vec![foreign] })
    );

    db.remove_participant_keeping(group.id, me, 2).unwrap();
    let removed = ChannelEvent::MemberRemoved { conversation_id: group.id, user_id: me };
    let marker = ChannelEvent::UnreadCountUpdated { conversation_id: group.id, unread_count: 0 };
    dispatcher.publish(Channel::User(me), removed.clone()).unwrap();
    dispatcher
        .publish(Channel::Conversation(group.id), ChannelEvent::MessageDeleted { message_id: Uuid::new_v4() })
        .unwrap();
    dispatcher.publish(Channel::User(me), marker.clone()).unwrap();

    let mut received = Vec::new();
    for _ in 0..2 {
        let Some(GatewayFrame::Event(envelope)) = conn.next_event().await.unwrap() else {
            panic!("expected an event frame");
        };
        received.push(envelope.event);
    }
    assert_eq!(received, vec![removed, marker]);

    conn.close().await.unwrap();
}
