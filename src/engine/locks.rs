use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Broadcast, NotifyHub};
use crate::observability::{LOCKS_ACTIVE, LOCKS_DENIED_TOTAL, LOCKS_EXPIRED_TOTAL, LOCKS_GRANTED_TOTAL};

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockGrant {
    pub expires_at: Ms,
    /// The caller already held this slot; only the TTL moved.
    pub refreshed: bool,
}

/// Process-wide table of short-lived slot locks.
///
/// Every mutation goes through a single `DashMap` shard lock for its key, so
/// acquire is a compare-and-set: the first writer wins and everyone else
/// gets `LockConflict`.
pub struct SlotLockManager {
    locks: DashMap<SlotKey, TimeSlotLock>,
    ttl_ms: Ms,
    notify: Arc<NotifyHub>,
}

impl SlotLockManager {
    pub fn new(ttl_ms: Ms, notify: Arc<NotifyHub>) -> Self {
        Self {
            locks: DashMap::new(),
            ttl_ms,
            notify,
        }
    }

    pub fn ttl_ms(&self) -> Ms {
        self.ttl_ms
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn get(&self, key: &SlotKey) -> Option<TimeSlotLock> {
        self.locks.get(key).map(|e| e.value().clone())
    }

    pub fn acquire(&self, key: SlotKey, owner: &str, now: Ms) -> Result<LockGrant, EngineError> {
        let expires_at = now + self.ttl_ms;
        let fresh = TimeSlotLock {
            key,
            owner_id: owner.to_string(),
            acquired_at: now,
            expires_at,
            state: LockState::Active,
        };

        let mut stale = None;
        let refreshed = match self.locks.entry(key) {
            Entry::Occupied(mut entry) => {
                let current = entry.get_mut();
                if current.owner_id == owner {
                    current.expires_at = expires_at;
                    true
                } else if current.is_live(now) {
                    metrics::counter!(LOCKS_DENIED_TOTAL).increment(1);
                    return Err(EngineError::LockConflict {
                        key,
                        owner: current.owner_id.clone(),
                        expires_at: current.expires_at,
                    });
                } else {
                    // Expired but not yet swept: take it over.
                    stale = Some(std::mem::replace(current, fresh));
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                false
            }
        };

        if let Some(old) = stale {
            debug!("lock {key} taken over from expired owner {}", old.owner_id);
            metrics::counter!(LOCKS_EXPIRED_TOTAL).increment(1);
            self.notify.send(Broadcast::unlocked(&key));
        }
        metrics::counter!(LOCKS_GRANTED_TOTAL).increment(1);
        metrics::gauge!(LOCKS_ACTIVE).set(self.locks.len() as f64);
        self.notify.send(Broadcast::Locked {
            resource_id: key.resource_id,
            date: key.date,
            timeslot: key.timeslot,
            owner_id: owner.to_string(),
            expires_at,
        });
        Ok(LockGrant { expires_at, refreshed })
    }

    /// Owner-only. Missing or foreign locks are left alone and yield `None`.
    pub fn release(&self, key: &SlotKey, owner: &str) -> Option<TimeSlotLock> {
        let (_, mut lock) = self.locks.remove_if(key, |_, l| l.owner_id == owner)?;
        lock.state = LockState::Released;
        self.after_removal(&lock);
        Some(lock)
    }

    /// Release everything `owner` holds, e.g. when its session goes away.
    pub fn release_all(&self, owner: &str) -> Vec<TimeSlotLock> {
        let keys: Vec<SlotKey> = self
            .locks
            .iter()
            .filter(|e| e.value().owner_id == owner)
            .map(|e| *e.key())
            .collect();
        keys.iter().filter_map(|key| self.release(key, owner)).collect()
    }

    /// Remove every lock past its expiry. Watchers get the same unlock as a release.
    pub fn sweep(&self, now: Ms) -> Vec<TimeSlotLock> {
        let keys: Vec<SlotKey> = self
            .locks
            .iter()
            .filter(|e| !e.value().is_live(now))
            .map(|e| *e.key())
            .collect();
        let mut expired = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, mut lock)) = self.locks.remove_if(&key, |_, l| !l.is_live(now)) {
                lock.state = LockState::Expired;
                metrics::counter!(LOCKS_EXPIRED_TOTAL).increment(1);
                self.after_removal(&lock);
                expired.push(lock);
            }
        }
        expired
    }

    /// Ok if `owner` holds a live lock on `key`.
    pub fn ensure_held(&self, key: &SlotKey, owner: &str, now: Ms) -> Result<(), EngineError> {
        match self.locks.get(key) {
            Some(lock) if lock.owner_id == owner && lock.is_live(now) => Ok(()),
            Some(lock) if lock.is_live(now) => Err(EngineError::LockConflict {
                key: *key,
                owner: lock.owner_id.clone(),
                expires_at: lock.expires_at,
            }),
            _ => Err(EngineError::invalid(format!("no active lock on {key}"))),
        }
    }

    /// Drop the owner's lock because a booking now covers the slot. No unlock is sent.
    pub fn supersede(&self, key: &SlotKey, owner: &str) -> Option<TimeSlotLock> {
        let (_, mut lock) = self.locks.remove_if(key, |_, l| l.owner_id == owner)?;
        lock.state = LockState::Released;
        metrics::gauge!(LOCKS_ACTIVE).set(self.locks.len() as f64);
        Some(lock)
    }

    /// Live locks on one resource and date.
    pub fn active_on(&self, resource_id: Ulid, date: NaiveDate, now: Ms) -> Vec<TimeSlotLock> {
        self.locks
            .iter()
            .filter(|e| {
                let k = e.key();
                k.resource_id == resource_id && k.date == date && e.value().is_live(now)
            })
            .map(|e| e.value().clone())
            .collect()
    }

    fn after_removal(&self, lock: &TimeSlotLock) {
        metrics::gauge!(LOCKS_ACTIVE).set(self.locks.len() as f64);
        self.notify.send(Broadcast::unlocked(&lock.key));
    }
}
