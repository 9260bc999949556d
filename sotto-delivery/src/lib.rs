// SPDX-License-Identifier: MIT OR Apache-2.0

//! `sotto-delivery` keeps messages moving when the network does not
//! cooperate, and destroys them when their time is up.
//!
//! ## Delivery
//!
//! [`DeliveryQueue`] encrypts outgoing messages (via `sotto-encryption`) and
//! hands them to a [`traits::Transport`]. Failed sends are parked in a
//! per-group FIFO queue that is persisted through a [`traits::QueueStore`]
//! after every mutation, so an app restart resumes retries without losing
//! composed messages. Retries are bounded (3 attempts, 10 s apart by
//! default); a message that exhausts its budget is dropped with a terminal
//! signal. Progress is observable through [`DeliveryEvent`]s on a broadcast
//! channel.
//!
//! Delivery is at-least-once: a message whose acknowledgement got lost will
//! be retried and can arrive twice. Receivers are expected to deduplicate on
//! the package's message id.
//!
//! ## Expiration
//!
//! [`TtlScheduler`] associates an expiration deadline and a destruction
//! callback with a message id. A single worker drives all deadlines; timers
//! fire exactly once, can be cancelled, and can be re-armed (which replaces
//! the previous timer). Conversations can carry a default TTL for new
//! messages, with a process-wide fallback.
mod events;
mod memory;
mod queue;
pub mod traits;
mod ttl;

pub use events::DeliveryEvent;
pub use memory::{MemoryGroupDirectory, MemoryQueueStore, MemoryTransport, TransportOffline};
pub use queue::{
    DeliveryConfig, DeliveryQueue, MAX_RETRIES, PendingMessage, PersistenceError, RETRY_INTERVAL,
    SendError, SendOutcome,
};
pub use ttl::{ExpireCallback, TtlScheduler};
