use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Ms, OwnerId, SlotKey, Span};

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out messages for watchers of a resource.
///
/// Expiry and explicit release both produce `Unlocked`; watchers cannot and
/// need not tell them apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Broadcast {
    #[serde(rename = "lock.broadcast")]
    Locked {
        resource_id: Ulid,
        date: NaiveDate,
        timeslot: Span,
        owner_id: OwnerId,
        expires_at: Ms,
    },
    #[serde(rename = "unlock.broadcast")]
    Unlocked {
        resource_id: Ulid,
        date: NaiveDate,
        timeslot: Span,
    },
    /// A lock was superseded by a hold booking.
    #[serde(rename = "hold.broadcast")]
    Held {
        resource_id: Ulid,
        date: NaiveDate,
        timeslot: Span,
    },
    #[serde(rename = "schedule.confirmed.broadcast")]
    ScheduleConfirmed {
        resource_id: Ulid,
        date: NaiveDate,
        timeslots: Vec<Span>,
    },
}

impl Broadcast {
    pub fn unlocked(key: &SlotKey) -> Self {
        Broadcast::Unlocked {
            resource_id: key.resource_id,
            date: key.date,
            timeslot: key.timeslot,
        }
    }

    pub fn resource_id(&self) -> Ulid {
        match self {
            Broadcast::Locked { resource_id, .. }
            | Broadcast::Unlocked { resource_id, .. }
            | Broadcast::Held { resource_id, .. }
            | Broadcast::ScheduleConfirmed { resource_id, .. } => *resource_id,
        }
    }
}

/// Broadcast hub: one channel per resource plus a firehose for transports.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Broadcast>>,
    all: broadcast::Sender<Broadcast>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Watch one resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Broadcast> {
        self.channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Watch every resource.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Broadcast> {
        self.all.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, message: Broadcast) {
        if let Some(sender) = self.channels.get(&message.resource_id()) {
            let _ = sender.send(message.clone());
        }
        let _ = self.all.send(message);
    }

    /// Drop a resource's channel once it has no receivers left.
    pub fn prune(&self, resource_id: &Ulid) {
        self.channels
            .remove_if(resource_id, |_, sender| sender.receiver_count() == 0);
    }
}
