// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared identifiers and encoding for the sotto secure group messaging core.
//!
//! Group, user and conversation identifiers are opaque UTF-8 strings minted
//! outside of this core (account system, group management). Message
//! identifiers are UUIDs as the wire format requires them to be globally
//! unique without coordination.
pub mod cbor;
mod identifiers;

pub use identifiers::{ConversationId, GroupId, IdentifierError, MessageId, UserId};

/// UTC timestamp attached to messages and queue entries.
///
/// Serializes as an RFC 3339 string, which is what the wire format expects.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
