use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use commons_types::events::{Channel, ChannelEvent, Envelope};

/// Default ring size for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A publish that did not go out. The write it describes is already
/// committed; callers log and move on.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,

    #[error("publish on {channel} failed: {reason}")]
    Transient { channel: Channel, reason: String },
}

/// Fan-out publishing. Delivery is at-least-once and ordered per channel;
/// nothing is promised across channels.
pub trait Broker: Send + Sync {
    fn publish(&self, channel: Channel, event: ChannelEvent) -> Result<(), BrokerError>;
}

/// Whether an identity currently holds a live connection.
pub trait Presence: Send + Sync {
    fn is_online(&self, user_id: Uuid) -> bool;
}

/// In-process broker: one broadcast ring shared by every connection, each
/// connection filtering by the channels it subscribed to. A single ring keeps
/// publish order intact within every channel.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    broadcast_tx: broadcast::Sender<Arc<Envelope>>,

    /// Online users: user_id -> conn_id of the connection that owns the slot
    online_users: RwLock<HashMap<Uuid, Uuid>>,

    closed: AtomicBool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                online_users: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to every published envelope. Callers filter by channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Stop accepting publishes. Used on shutdown.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        info!("Dispatcher closed");
    }

    /// Mark a user online. The returned conn_id must be handed back to
    /// `user_offline`; a newer connection for the same user takes over the slot.
    pub fn user_online(&self, user_id: Uuid) -> Uuid {
        let conn_id = Uuid::new_v4();
        if let Ok(mut online) = self.inner.online_users.write() {
            online.insert(user_id, conn_id);
        }
        conn_id
    }

    /// Mark a user offline, but only if `conn_id` still owns the slot.
    pub fn user_offline(&self, user_id: Uuid, conn_id: Uuid) {
        if let Ok(mut online) = self.inner.online_users.write() {
            if online.get(&user_id) == Some(&conn_id) {
                online.remove(&user_id);
            }
        }
    }
}

impl Broker for Dispatcher {
    fn publish(&self, channel: Channel, event: ChannelEvent) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }

        let name = event.name();
        // No receivers just means nobody is connected right now.
        match self.inner.broadcast_tx.send(Arc::new(Envelope { channel, event })) {
            Ok(receivers) => debug!("{} on {} -> {} connections", name, channel, receivers),
            Err(_) => debug!("{} on {} with no connections", name, channel),
        }
        Ok(())
    }
}

impl Presence for Dispatcher {
    fn is_online(&self, user_id: Uuid) -> bool {
        self.inner
            .online_users
            .read()
            .map(|online| online.contains_key(&user_id))
            .unwrap_or(false)
    }
}
