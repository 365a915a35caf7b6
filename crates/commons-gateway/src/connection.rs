use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use commons_db::Database;
use commons_types::events::{Channel, ChannelEvent, GatewayCommand, GatewayFrame};

use crate::dispatcher::Dispatcher;
use crate::typing;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type Subscriptions = Arc<RwLock<HashSet<Channel>>>;

/// Everything a connection needs besides its socket.
#[derive(Clone)]
pub struct GatewayContext {
    pub dispatcher: Dispatcher,
    pub db: Arc<Database>,
}

/// Handle a WebSocket connection whose JWT was validated at the HTTP upgrade.
/// The personal channel `user-{id}` is subscribed before `ready` is sent.
pub async fn handle_connection(socket: WebSocket, ctx: GatewayContext, user_id: Uuid, username: String) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);

    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::from([Channel::User(user_id)])));

    // Subscribe before announcing readiness so nothing published after `ready` is missed
    let mut broadcast_rx = ctx.dispatcher.subscribe();
    let conn_id = ctx.dispatcher.user_online(user_id);

    let ready = GatewayFrame::Ready { user_id };
    let Some(ready) = encode(&ready) else {
        ctx.dispatcher.user_offline(user_id, conn_id);
        return;
    };
    if sender.send(ready).await.is_err() {
        ctx.dispatcher.user_offline(user_id, conn_id);
        return;
    }

    // Replies to commands (e.g. subscribe-denied) go out through the send task
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<GatewayFrame>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let send_subscriptions = subscriptions.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let envelope = match result {
                        Ok(envelope) => envelope,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // Events are hints; the client recovers from the next page load
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    let subscribed = send_subscriptions
                        .read()
                        .map(|subs| subs.contains(&envelope.channel))
                        .unwrap_or(false);
                    if !subscribed {
                        continue;
                    }

                    // A removed member stops hearing the conversation from here on
                    if let ChannelEvent::MemberRemoved { conversation_id, user_id: removed } = &envelope.event {
                        if *removed == user_id && envelope.channel == Channel::User(user_id) {
                            if let Ok(mut subs) = send_subscriptions.write() {
                                subs.remove(&Channel::Conversation(*conversation_id));
                            }
                            debug!("{} dropped from conversation-{} after removal", user_id, conversation_id);
                        }
                    }

                    let Some(msg) = encode(&GatewayFrame::Event((*envelope).clone())) else {
                        continue;
                    };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(frame) = reply else { break };
                    let Some(msg) = encode(&frame) else { continue };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_ctx = ctx.clone();
    let recv_username = username.clone();
    let recv_subscriptions = subscriptions.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&recv_ctx, user_id, &recv_username, cmd, &recv_subscriptions, &reply_tx)
                            .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_username,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    ctx.dispatcher.user_offline(user_id, conn_id);
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn handle_command(
    ctx: &GatewayContext,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
    subscriptions: &Subscriptions,
    reply_tx: &mpsc::UnboundedSender<GatewayFrame>,
) {
    match cmd {
        GatewayCommand::Subscribe { conversation_ids } => {
            let db = ctx.db.clone();
            let requested = conversation_ids.clone();
            let partition = tokio::task::spawn_blocking(move || {
                let mut granted = Vec::new();
                let mut denied = Vec::new();
                for id in requested {
                    match db.get_participant(id, user_id) {
                        Ok(Some(_)) => granted.push(id),
                        Ok(None) => denied.push(id),
                        Err(e) => {
                            warn!("participant lookup for {} failed: {}", id, e);
                            denied.push(id);
                        }
                    }
                }
                (granted, denied)
            })
            .await;

            let (granted, denied) = match partition {
                Ok(partition) => partition,
                Err(e) => {
                    warn!("spawn_blocking join error: {}", e);
                    (vec![], conversation_ids)
                }
            };

            info!(
                "{} ({}) subscribing to {} conversations ({} denied)",
                username,
                user_id,
                granted.len(),
                denied.len()
            );
            if let Ok(mut subs) = subscriptions.write() {
                subs.extend(granted.into_iter().map(Channel::Conversation));
            }
            if !denied.is_empty() {
                let _ = reply_tx.send(GatewayFrame::SubscribeDenied { conversation_ids: denied });
            }
        }

        GatewayCommand::Unsubscribe { conversation_ids } => {
            if let Ok(mut subs) = subscriptions.write() {
                for id in conversation_ids {
                    subs.remove(&Channel::Conversation(id));
                }
            }
        }

        GatewayCommand::Typing { conversation_id, is_typing } => {
            let db = ctx.db.clone();
            let dispatcher = ctx.dispatcher.clone();
            let name = username.to_string();
            let result = tokio::task::spawn_blocking(move || {
                typing::set_typing(&db, &dispatcher, conversation_id, user_id, &name, is_typing)
            })
            .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("{} ({}) typing rejected: {}", username, user_id, e),
                Err(e) => warn!("spawn_blocking join error: {}", e),
            }
        }
    }
}

fn encode(frame: &GatewayFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("failed to encode gateway frame: {}", e);
            None
        }
    }
}
