use std::sync::Arc;

use anyhow::anyhow;
use tracing::error;

use commons_types::error::{MessagingError, MessagingResult};

use crate::error::ApiError;
use crate::messenger::Messenger;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub messenger: Messenger,
    pub jwt_secret: String,
}

/// Run an engine operation off the async runtime.
pub async fn blocking<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Messenger) -> MessagingResult<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state.messenger))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError(MessagingError::Storage(anyhow!("worker failed: {}", e)))
        })?
        .map_err(ApiError::from)
}
