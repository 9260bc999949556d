// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces against the external collaborators of the delivery layer: the
//! network transport, the local durable cache and the relational store's
//! member lookup.
use std::fmt::{Debug, Display};

use sotto_core::{GroupId, UserId};

use crate::queue::PendingMessage;

/// Interface for handing a serialized message package to the network.
///
/// The transport is best-effort: no ordering and no exactly-once delivery is
/// assumed, only that an eventual failure is distinguishable from success.
///
/// Two variants of the trait are provided: one which is thread-safe
/// (implementing `Sync`) and one which is purely intended for
/// single-threaded execution contexts.
#[trait_variant::make(Transport: Send)]
pub trait LocalTransport {
    type Error: Display + Debug;

    /// Delivers one serialized package towards the group.
    ///
    /// Returning `Ok` means the transport acknowledged the message; any
    /// error is treated as a failed attempt and retried by the caller.
    async fn transmit(&self, group_id: &GroupId, payload: &[u8]) -> Result<(), Self::Error>;
}

/// Interface for the local durable cache holding per-group queues of unsent
/// messages, so retries survive a process restart.
#[trait_variant::make(QueueStore: Send)]
pub trait LocalQueueStore: Clone {
    type Error: Display + Debug;

    /// Reads the persisted queue of a group. An unknown group id yields an
    /// empty queue.
    async fn read_queue(&self, group_id: &GroupId) -> Result<Vec<PendingMessage>, Self::Error>;

    /// Overwrites the persisted queue of a group with a new snapshot.
    ///
    /// Writing an empty snapshot is how a drained queue is cleared.
    async fn write_queue(
        &mut self,
        group_id: &GroupId,
        queue: &[PendingMessage],
    ) -> Result<(), Self::Error>;

    /// All group ids with a persisted (possibly empty) queue.
    async fn group_ids(&self) -> Result<Vec<GroupId>, Self::Error>;
}

/// Interface for looking up the current members of a group (a view onto the
/// relational store, maintained outside of this core).
#[trait_variant::make(GroupDirectory: Send)]
pub trait LocalGroupDirectory {
    type Error: Display + Debug;

    /// Current member ids of the group, including the local user.
    async fn members(&self, group_id: &GroupId) -> Result<Vec<UserId>, Self::Error>;
}
