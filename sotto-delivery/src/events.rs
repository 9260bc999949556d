// SPDX-License-Identifier: MIT OR Apache-2.0

use sotto_core::{GroupId, MessageId};

/// User-visible signals emitted by the delivery queue.
///
/// These drive the "sending…" / "delivered" / "could not be sent" states in
/// a frontend. Emitted on a broadcast channel; missing a signal (lagging
/// receiver) has no effect on delivery itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A message did not reach the transport and was parked in the retry
    /// queue ("sending…").
    Queued { group_id: GroupId },

    /// A previously queued message went through after retrying
    /// ("delivered").
    Delivered {
        group_id: GroupId,
        message_id: MessageId,
    },

    /// A message exhausted its retry budget and was dropped ("message could
    /// not be sent"). Carries the composed plaintext so the user can
    /// re-compose it; the queue will not retry it again.
    Failed { group_id: GroupId, content: String },
}
