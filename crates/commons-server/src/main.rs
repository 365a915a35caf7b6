mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use commons_api::middleware::decode_claims;
use commons_api::profiles::DirectoryProfiles;
use commons_api::{AppState, AppStateInner, Messenger, router};
use commons_db::Database;
use commons_gateway::connection::{self, GatewayContext};
use commons_gateway::dispatcher::Dispatcher;

use crate::config::Config;

#[derive(Clone)]
struct GatewayState {
    ctx: GatewayContext,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "commons=debug,commons_api=debug,commons_gateway=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    // Shared state
    let dispatcher = Dispatcher::new(config.broadcast_capacity);
    let messenger = Messenger::new(
        db.clone(),
        Arc::new(dispatcher.clone()),
        Arc::new(dispatcher.clone()),
        Arc::new(DirectoryProfiles::new(db.clone())),
    )
    .with_page_limit_max(config.page_limit_max);

    let app_state: AppState = Arc::new(AppStateInner {
        messenger,
        jwt_secret: config.jwt_secret.clone(),
    });

    let gateway_state = GatewayState {
        ctx: GatewayContext {
            dispatcher: dispatcher.clone(),
            db,
        },
        jwt_secret: config.jwt_secret.clone(),
    };

    // Routes
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway_state);

    let app = Router::new()
        .merge(router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("Commons messaging server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(dispatcher))
        .await?;

    Ok(())
}

/// Upgrade to the gateway. The token comes from the Authorization header or,
/// for browsers that cannot set headers on a WebSocket, `?token=`.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match (&auth, &query.token) {
        (Some(TypedHeader(Authorization(bearer))), _) => bearer.token(),
        (None, Some(token)) => token.as_str(),
        (None, None) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let Some(claims) = decode_claims(&state.jwt_secret, token) else {
        warn!("Gateway upgrade rejected: invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.ctx, claims.sub, claims.username)
    })
}

async fn shutdown_signal(dispatcher: Dispatcher) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
    dispatcher.close();
}
