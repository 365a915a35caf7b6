use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ReadReceipt;

/// Observation state of a message from one viewer's side.
///
/// Ordered `Sent < Delivered < Seen`. `Seen` is derived from the append-only
/// read receipt set, so once reached it cannot regress; `Sent`/`Delivered`
/// follow the viewer's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Seen,
}

impl DeliveryStatus {
    /// Status of a message for `viewer`, given the message's receipts and
    /// whether the viewer currently holds a live connection.
    pub fn resolve(read_by: &[ReadReceipt], viewer: Uuid, viewer_online: bool) -> Self {
        if read_by.iter().any(|r| r.user_id == viewer) {
            Self::Seen
        } else if viewer_online {
            Self::Delivered
        } else {
            Self::Sent
        }
    }

    /// Collapse per-viewer statuses into what the sender sees: the least
    /// advanced viewer wins. No viewers at all counts as `Sent`.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        statuses.into_iter().min().unwrap_or(Self::Sent)
    }
}
