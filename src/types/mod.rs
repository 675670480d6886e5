//! This module contains the value types shared by the engine, its tasks and its collaborators.

/// From section [2.3.1.1 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-2.3.1.1).
///
/// A 32-bit value assigned to each message, which when used with the unique identifier validity
/// value forms a 64-bit value that will not refer to any other message in the mailbox or any
/// subsequent mailbox with the same name forever.  Unique identifiers are assigned in a strictly
/// ascending fashion in the mailbox.
///
/// Inside the mailbox tree a UID of `0` is a placeholder for a message whose existence is known
/// (through `EXISTS`) but whose UID has not been learned yet.
pub type Uid = u32;

/// From section [2.3.1.2 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-2.3.1.2).
///
/// A relative position from 1 to the number of messages in the mailbox.
/// This position is ordered by ascending unique identifier.  As
/// each new message is added, it is assigned a message sequence number
/// that is 1 higher than the number of messages in the mailbox before
/// that new message was added.
///
/// Message sequence numbers can be reassigned during the session.  For
/// example, when a message is permanently removed (expunged) from the
/// mailbox, the message sequence number for all subsequent messages is
/// decremented.
pub type Seq = u32;

mod capabilities;
pub use self::capabilities::Capabilities;
pub(crate) use self::capabilities::capability_name;

mod connection_state;
pub use self::connection_state::ConnectionState;

mod flag;
pub use self::flag::Flag;

mod response;
pub use self::response::*;

mod sequence;
pub use self::sequence::Sequence;

mod sync_state;
pub use self::sync_state::SyncState;

mod event;
pub use self::event::{Event, NetworkPolicy, TaskState, TreeIndex};

mod ids;
pub use self::ids::{ConnId, MailboxId, TaskId};
