#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use commons_api::Messenger;
use commons_api::profiles::DirectoryProfiles;
use commons_db::Database;
use commons_gateway::dispatcher::{Broker, BrokerError, Presence};
use commons_types::events::{Channel, ChannelEvent, Envelope};

/// Broker that keeps every published envelope in order.
#[derive(Default)]
pub struct RecordingBroker {
    published: Mutex<Vec<Envelope>>,
}

impl RecordingBroker {
    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.published.lock().unwrap())
    }

    pub fn on(&self, channel: Channel) -> Vec<ChannelEvent> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.channel == channel)
            .map(|e| e.event.clone())
            .collect()
    }
}

impl Broker for RecordingBroker {
    fn publish(&self, channel: Channel, event: ChannelEvent) -> Result<(), BrokerError> {
        self.published.lock().unwrap().push(Envelope { channel, event });
        Ok(())
    }
}

/// Broker that refuses everything.
pub struct FailingBroker;

impl Broker for FailingBroker {
    fn publish(&self, channel: Channel, _event: ChannelEvent) -> Result<(), BrokerError> {
        Err(BrokerError::Transient {
            channel,
            reason: "link down".into(),
        })
    }
}

/// Presence switched by hand.
#[derive(Default)]
pub struct StaticPresence {
    online: Mutex<HashSet<Uuid>>,
}

impl StaticPresence {
    pub fn set(&self, user_id: Uuid, online: bool) {
        let mut set = self.online.lock().unwrap();
        if online {
            set.insert(user_id);
        } else {
            set.remove(&user_id);
        }
    }
}

impl Presence for StaticPresence {
    fn is_online(&self, user_id: Uuid) -> bool {
        self.online.lock().unwrap().contains(&user_id)
    }
}

pub struct Harness {
    pub messenger: Messenger,
    pub db: Arc<Database>,
    pub broker: Arc<RecordingBroker>,
    pub presence: Arc<StaticPresence>,
}

pub fn harness() -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let broker = Arc::new(RecordingBroker::default());
    let presence = Arc::new(StaticPresence::default());
    let profiles = Arc::new(DirectoryProfiles::new(db.clone()));
    let messenger = Messenger::new(db.clone(), broker.clone(), presence.clone(), profiles);
    Harness {
        messenger,
        db,
        broker,
        presence,
    }
}

/// Messenger whose every publish fails.
pub fn failing_harness() -> (Messenger, Arc<Database>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let profiles = Arc::new(DirectoryProfiles::new(db.clone()));
    let messenger = Messenger::new(
        db.clone(),
        Arc::new(FailingBroker),
        Arc::new(StaticPresence::default()),
        profiles,
    );
    (messenger, db)
}

pub fn users<const N: usize>() -> [Uuid; N] {
    std::array::from_fn(|_| Uuid::new_v4())
}
