//! Local, id-keyed view of one open conversation.
//!
//! Every merge is idempotent: the broker may redeliver, and a page load may
//! overlap events already applied. The store is the authority; this view only
//! converges toward it.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use commons_types::api::HistoryPage;
use commons_types::delivery::DeliveryStatus;
use commons_types::events::{Channel, ChannelEvent, Envelope};
use commons_types::models::{Message, ReadReceipt};

type Key = (DateTime<Utc>, Uuid);

pub struct Reconciler {
    conversation_id: Uuid,
    /// Ordered by (createdAt, id); the store makes createdAt unique per
    /// conversation, the id only breaks ties in foreign data.
    messages: BTreeMap<Key, Message>,
    index: HashMap<Uuid, DateTime<Utc>>,
}

impl Reconciler {
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            messages: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Apply an envelope if it belongs to this conversation's channel.
    /// Returns whether the view changed.
    pub fn apply(&mut self, envelope: &Envelope) -> bool {
        if envelope.channel != Channel::Conversation(self.conversation_id) {
            return false;
        }
        self.apply_event(&envelope.event)
    }

    pub fn apply_event(&mut self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::NewMessage { message, .. } => {
                if message.conversation_id != self.conversation_id || self.index.contains_key(&message.id) {
                    return false;
                }
                self.insert(message.clone());
                true
            }

            ChannelEvent::ReactionAdded { message_id, reaction } => {
                let Some(message) = self.get_mut(*message_id) else {
                    return false;
                };
                if message.reactions.contains(reaction) {
                    return false;
                }
                // One active reaction per user: the new one replaces the old
                message.reactions.retain(|r| r.user_id != reaction.user_id);
                message.reactions.push(reaction.clone());
                true
            }

            ChannelEvent::ReactionRemoved { message_id, user_id, emoji } => {
                let Some(message) = self.get_mut(*message_id) else {
                    return false;
                };
                let before = message.reactions.len();
                message
                    .reactions
                    .retain(|r| !(r.user_id == *user_id && r.emoji == *emoji));
                message.reactions.len() != before
            }

            ChannelEvent::MessageEdited { message_id, message: edited } => {
                let Some(message) = self.get_mut(*message_id) else {
                    return false;
                };
                if message.is_edited && message.content == edited.content && message.edited_at == edited.edited_at {
                    return false;
                }
                message.content = edited.content.clone();
                message.is_edited = true;
                message.edited_at = edited.edited_at;
                true
            }

            ChannelEvent::MessageDeleted { message_id } => {
                let Some(message) = self.get_mut(*message_id) else {
                    return false;
                };
                !std::mem::replace(&mut message.is_deleted, true)
            }

            ChannelEvent::MessageRead { message_id, user_id, read_at } => {
                let Some(message) = self.get_mut(*message_id) else {
                    return false;
                };
                if message.is_read_by(*user_id) {
                    return false;
                }
                message.read_by.push(ReadReceipt {
                    user_id: *user_id,
                    read_at: *read_at,
                });
                true
            }

            _ => false,
        }
    }

    /// Merge a history page. Page records replace local ones; receipts are
    /// unioned since the store never removes them.
    pub fn load_page(&mut self, page: &HistoryPage) {
        for entry in &page.messages {
            let incoming = &entry.message;
            if incoming.conversation_id != self.conversation_id {
                continue;
            }

            let mut merged = incoming.clone();
            if let Some(local) = self.get_mut(incoming.id) {
                for receipt in &local.read_by {
                    if !merged.is_read_by(receipt.user_id) {
                        merged.read_by.push(receipt.clone());
                    }
                }
                *local = merged;
            } else {
                self.insert(merged);
            }
        }
    }

    /// Visible messages, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values().filter(|m| !m.is_deleted)
    }

    pub fn get(&self, message_id: Uuid) -> Option<&Message> {
        let created_at = self.index.get(&message_id)?;
        self.messages.get(&(*created_at, message_id))
    }

    pub fn len(&self) -> usize {
        self.messages().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cursor for loading the page before everything held locally.
    pub fn oldest_cursor(&self) -> Option<DateTime<Utc>> {
        self.messages.keys().next().map(|(created_at, _)| *created_at)
    }

    /// Status of a message from `viewer`'s side, by the same rule the server uses.
    pub fn delivery_status(&self, message_id: Uuid, viewer: Uuid, viewer_online: bool) -> Option<DeliveryStatus> {
        self.get(message_id)
            .map(|m| DeliveryStatus::resolve(&m.read_by, viewer, viewer_online))
    }

    fn insert(&mut self, message: Message) {
        self.index.insert(message.id, message.created_at);
        self.messages.insert((message.created_at, message.id), message);
    }

    fn get_mut(&mut self, message_id: Uuid) -> Option<&mut Message> {
        let created_at = self.index.get(&message_id)?;
        self.messages.get_mut(&(*created_at, message_id))
    }
}
