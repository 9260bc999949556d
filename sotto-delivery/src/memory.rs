// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory implementations of the delivery layer's collaborator
//! interfaces, for tests and for embedders which wire up persistence and
//! networking elsewhere.
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use sotto_core::{GroupId, UserId};

use crate::queue::PendingMessage;
use crate::traits::{GroupDirectory, QueueStore, Transport};

/// An in-memory transport delivering into an outbox.
///
/// Can be switched offline to exercise failure and retry paths; every
/// attempt is counted, successful or not.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    inner: Arc<RwLock<TransportState>>,
}

#[derive(Debug)]
struct TransportState {
    online: bool,
    sent: Vec<(GroupId, Vec<u8>)>,
    attempts: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TransportState {
                online: true,
                sent: Vec::new(),
                attempts: 0,
            })),
        }
    }

    /// Makes every following transmit attempt fail (or succeed again).
    pub fn set_online(&self, online: bool) {
        self.inner
            .write()
            .expect("acquire exclusive write access on transport state")
            .online = online;
    }

    /// Everything successfully transmitted so far, in order.
    pub fn sent(&self) -> Vec<(GroupId, Vec<u8>)> {
        self.inner
            .read()
            .expect("acquire shared read access on transport state")
            .sent
            .clone()
    }

    /// Number of transmit attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.inner
            .read()
            .expect("acquire shared read access on transport state")
            .attempts
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
#[error("transport is offline")]
pub struct TransportOffline;

impl Transport for MemoryTransport {
    type Error = TransportOffline;

    async fn transmit(&self, group_id: &GroupId, payload: &[u8]) -> Result<(), Self::Error> {
        let mut state = self
            .inner
            .write()
            .expect("acquire exclusive write access on transport state");
        state.attempts += 1;
        if !state.online {
            return Err(TransportOffline);
        }
        state.sent.push((group_id.clone(), payload.to_vec()));
        Ok(())
    }
}

/// An in-memory stand-in for the local durable cache of pending queues.
#[derive(Clone, Debug, Default)]
pub struct MemoryQueueStore {
    inner: Arc<RwLock<HashMap<GroupId, Vec<PendingMessage>>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    type Error = Infallible;

    async fn read_queue(&self, group_id: &GroupId) -> Result<Vec<PendingMessage>, Self::Error> {
        Ok(self
            .inner
            .read()
            .expect("acquire shared read access on store")
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_queue(
        &mut self,
        group_id: &GroupId,
        queue: &[PendingMessage],
    ) -> Result<(), Self::Error> {
        self.inner
            .write()
            .expect("acquire exclusive write access on store")
            .insert(group_id.clone(), queue.to_vec());
        Ok(())
    }

    async fn group_ids(&self) -> Result<Vec<GroupId>, Self::Error> {
        Ok(self
            .inner
            .read()
            .expect("acquire shared read access on store")
            .keys()
            .cloned()
            .collect())
    }
}

/// An in-memory group membership table.
///
/// Unknown groups resolve to an empty member list; the sender is always
/// included as a recipient by the cipher regardless.
#[derive(Clone, Debug, Default)]
pub struct MemoryGroupDirectory {
    inner: Arc<RwLock<HashMap<GroupId, Vec<UserId>>>>,
}

impl MemoryGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, group_id: GroupId, members: Vec<UserId>) {
        self.inner
            .write()
            .expect("acquire exclusive write access on directory")
            .insert(group_id, members);
    }
}

impl GroupDirectory for MemoryGroupDirectory {
    type Error = Infallible;

    async fn members(&self, group_id: &GroupId) -> Result<Vec<UserId>, Self::Error> {
        Ok(self
            .inner
            .read()
            .expect("acquire shared read access on directory")
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }
}
