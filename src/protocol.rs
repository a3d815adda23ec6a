use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{Ms, OwnerId, SlotKey, Span};

/// Request/reply wrapper. Replies echo the request's correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub correlation_id: Ulid,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(body: T) -> Self {
        Self {
            correlation_id: Ulid::new(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Request {
    #[serde(rename = "lock.request")]
    Lock {
        resource_id: Ulid,
        date: NaiveDate,
        timeslot: Span,
        owner_id: OwnerId,
    },
    #[serde(rename = "unlock.request")]
    Unlock {
        resource_id: Ulid,
        date: NaiveDate,
        timeslot: Span,
        owner_id: OwnerId,
    },
    /// Drop every lock of a departing client.
    #[serde(rename = "unlock_all.request")]
    UnlockAll { owner_id: OwnerId },
}

impl Request {
    pub fn lock(key: SlotKey, owner_id: impl Into<OwnerId>) -> Self {
        Request::Lock {
            resource_id: key.resource_id,
            date: key.date,
            timeslot: key.timeslot,
            owner_id: owner_id.into(),
        }
    }

    pub fn unlock(key: SlotKey, owner_id: impl Into<OwnerId>) -> Self {
        Request::Unlock {
            resource_id: key.resource_id,
            date: key.date,
            timeslot: key.timeslot,
            owner_id: owner_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Reply {
    #[serde(rename = "lock.granted")]
    Granted { expires_at: Ms },
    /// `reason` is human-readable and never names the current holder.
    #[serde(rename = "lock.denied")]
    Denied { reason: String },
    /// Releasing a lock the caller does not hold is acknowledged all the same.
    #[serde(rename = "unlock.ack")]
    UnlockAck { released: usize },
}

pub type Call = (Envelope<Request>, oneshot::Sender<Envelope<Reply>>);

async fn handle(engine: &Engine, request: Request) -> Reply {
    match request {
        Request::Lock {
            resource_id,
            date,
            timeslot,
            owner_id,
        } => match engine
            .acquire_slot(SlotKey::new(resource_id, date, timeslot), &owner_id)
            .await
        {
            Ok(grant) => Reply::Granted {
                expires_at: grant.expires_at,
            },
            Err(e) => Reply::Denied { reason: e.to_string() },
        },
        Request::Unlock {
            resource_id,
            date,
            timeslot,
            owner_id,
        } => {
            let key = SlotKey::new(resource_id, date, timeslot);
            let released = engine.release_slot(&key, &owner_id).map_or(0, |_| 1);
            Reply::UnlockAck { released }
        }
        Request::UnlockAll { owner_id } => Reply::UnlockAck {
            released: engine.release_all_slots(&owner_id).len(),
        },
    }
}

/// Answer lock traffic until every sender is gone. Each call runs on its
/// own task so a slow store read never stalls the queue.
pub async fn serve(engine: Arc<Engine>, mut rx: mpsc::Receiver<Call>) {
    while let Some((Envelope { correlation_id, body }, reply_to)) = rx.recv().await {
        let engine = engine.clone();
        tokio::spawn(async move {
            let body = handle(&engine, body).await;
            if reply_to.send(Envelope { correlation_id, body }).is_err() {
                debug!("caller for {correlation_id} went away before the reply");
            }
        });
    }
    debug!("lock protocol channel closed");
}

/// Caller side of the lock protocol.
#[derive(Clone)]
pub struct LockClient {
    tx: mpsc::Sender<Call>,
    timeout: Duration,
}

impl LockClient {
    pub fn new(tx: mpsc::Sender<Call>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }

    /// Send one request and wait for its reply. No reply within the deadline,
    /// or no server at all, is `Timeout`: the caller must treat the slot as
    /// not locked.
    pub async fn call(&self, body: Request) -> Result<Reply, EngineError> {
        let envelope = Envelope::new(body);
        let correlation_id = envelope.correlation_id;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((envelope, reply_tx))
            .await
            .map_err(|_| EngineError::Timeout)?;

        let reply = match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(EngineError::Timeout),
            Err(_) => {
                warn!("request {correlation_id} timed out after {:?}", self.timeout);
                return Err(EngineError::Timeout);
            }
        };
        if reply.correlation_id != correlation_id {
            return Err(EngineError::invalid(format!(
                "reply {} does not answer {correlation_id}",
                reply.correlation_id
            )));
        }
        Ok(reply.body)
    }

    pub async fn lock(&self, key: SlotKey, owner_id: &str) -> Result<Reply, EngineError> {
        self.call(Request::lock(key, owner_id)).await
    }

    pub async fn unlock(&self, key: SlotKey, owner_id: &str) -> Result<Reply, EngineError> {
        self.call(Request::unlock(key, owner_id)).await
    }

    pub async fn unlock_all(&self, owner_id: &str) -> Result<Reply, EngineError> {
        self.call(Request::UnlockAll {
            owner_id: owner_id.into(),
        })
        .await
    }
}

/// Start a server task for `engine` and return a client bound to it.
pub fn spawn(engine: Arc<Engine>, timeout: Duration) -> LockClient {
    let (tx, rx) = mpsc::channel(1024);
    tokio::spawn(serve(engine, rx));
    LockClient::new(tx, timeout)
}
