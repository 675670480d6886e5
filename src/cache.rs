//! Persistent storage of what the engine learned about the server.
//!
//! The engine only talks to the cache through the [`Cache`] trait; [`MemoryCache`] is a complete
//! implementation which forgets everything when dropped.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset};

use crate::types::{BodyStructure, Envelope, Flag, SyncState, Uid};

/// What `FETCH ENVELOPE RFC822.SIZE INTERNALDATE BODYSTRUCTURE` tells us about a message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    /// The envelope.
    pub envelope: Option<Envelope>,
    /// Size of the whole message in octets.
    pub size: Option<u32>,
    /// When the server received the message.
    pub internal_date: Option<DateTime<FixedOffset>>,
    /// The MIME structure.
    pub body_structure: Option<BodyStructure>,
}

/// A child mailbox as learned from `LIST`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxMetadata {
    /// Full name of the mailbox.
    pub name: String,
    /// Hierarchy separator.
    pub separator: Option<String>,
    /// Name attributes such as `\Noselect`.
    pub attributes: Vec<String>,
}

/// Storage for mailbox and message data, keyed by mailbox name and UID.
///
/// All operations are infallible from the engine's point of view; an implementation which hits
/// a storage error should log it and behave as if the data was not cached.
pub trait Cache {
    /// Children of `mailbox`, if they were ever stored.
    fn child_mailboxes(&self, mailbox: &str) -> Option<Vec<MailboxMetadata>>;
    /// Remember the children of `mailbox`.
    fn set_child_mailboxes(&mut self, mailbox: &str, data: &[MailboxMetadata]);
    /// Forget the children of `mailbox`.
    fn forget_child_mailboxes(&mut self, mailbox: &str);

    /// The state of `mailbox` at the end of its last synchronization.
    fn mailbox_sync_state(&self, mailbox: &str) -> SyncState;
    /// Remember the synchronization state of `mailbox`.
    fn set_mailbox_sync_state(&mut self, mailbox: &str, state: &SyncState);

    /// UIDs of `mailbox` in sequence order.
    fn uid_mapping(&self, mailbox: &str) -> Vec<Uid>;
    /// Remember the UIDs of `mailbox` in sequence order.
    fn set_uid_mapping(&mut self, mailbox: &str, uids: &[Uid]);
    /// Forget the UIDs of `mailbox`.
    fn clear_uid_mapping(&mut self, mailbox: &str);

    /// Forget everything stored about the messages of `mailbox`, UID mapping included.
    fn clear_all_messages(&mut self, mailbox: &str);
    /// Forget everything stored about one message.
    fn clear_message(&mut self, mailbox: &str, uid: Uid);

    /// Flags of a message.
    fn msg_flags(&self, mailbox: &str, uid: Uid) -> Option<Vec<Flag<'static>>>;
    /// Remember the flags of a message.
    fn set_msg_flags(&mut self, mailbox: &str, uid: Uid, flags: &[Flag<'static>]);

    /// Metadata of a message.
    fn message_metadata(&self, mailbox: &str, uid: Uid) -> Option<MessageMetadata>;
    /// Remember the metadata of a message.
    fn set_message_metadata(&mut self, mailbox: &str, uid: Uid, data: &MessageMetadata);

    /// A body part of a message.
    fn message_part(&self, mailbox: &str, uid: Uid, part_id: &str) -> Option<Vec<u8>>;
    /// Remember a body part of a message.
    fn set_message_part(&mut self, mailbox: &str, uid: Uid, part_id: &str, data: &[u8]);
}

#[derive(Debug, Default)]
struct CachedMessage {
    flags: Option<Vec<Flag<'static>>>,
    metadata: Option<MessageMetadata>,
    parts: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct CachedMailbox {
    children: Option<Vec<MailboxMetadata>>,
    sync_state: SyncState,
    uids: Vec<Uid>,
    messages: BTreeMap<Uid, CachedMessage>,
}

/// A [`Cache`] living in memory.
#[derive(Debug, Default)]
pub struct MemoryCache {
    mailboxes: HashMap<String, CachedMailbox>,
}

impl MemoryCache {
    /// An empty cache.
    pub fn new() -> Self {
        MemoryCache::default()
    }

    fn mailbox(&self, mailbox: &str) -> Option<&CachedMailbox> {
        self.mailboxes.get(mailbox)
    }

    fn mailbox_mut(&mut self, mailbox: &str) -> &mut CachedMailbox {
        self.mailboxes.entry(mailbox.to_owned()).or_default()
    }

    fn message(&self, mailbox: &str, uid: Uid) -> Option<&CachedMessage> {
        self.mailbox(mailbox).and_then(|m| m.messages.get(&uid))
    }

    fn message_mut(&mut self, mailbox: &str, uid: Uid) -> &mut CachedMessage {
        self.mailbox_mut(mailbox).messages.entry(uid).or_default()
    }
}

impl Cache for MemoryCache {
    fn child_mailboxes(&self, mailbox: &str) -> Option<Vec<MailboxMetadata>> {
        self.mailbox(mailbox).and_then(|m| m.children.clone())
    }

    fn set_child_mailboxes(&mut self, mailbox: &str, data: &[MailboxMetadata]) {
        self.mailbox_mut(mailbox).children = Some(data.to_vec());
    }

    fn forget_child_mailboxes(&mut self, mailbox: &str) {
        if let Some(m) = self.mailboxes.get_mut(mailbox) {
            m.children = None;
        }
    }

    fn mailbox_sync_state(&self, mailbox: &str) -> SyncState {
        self.mailbox(mailbox)
            .map(|m| m.sync_state.clone())
            .unwrap_or_default()
    }

    fn set_mailbox_sync_state(&mut self, mailbox: &str, state: &SyncState) {
        self.mailbox_mut(mailbox).sync_state = state.clone();
    }

    fn uid_mapping(&self, mailbox: &str) -> Vec<Uid> {
        self.mailbox(mailbox)
            .map(|m| m.uids.clone())
            .unwrap_or_default()
    }

    fn set_uid_mapping(&mut self, mailbox: &str, uids: &[Uid]) {
        self.mailbox_mut(mailbox).uids = uids.to_vec();
    }

    fn clear_uid_mapping(&mut self, mailbox: &str) {
        if let Some(m) = self.mailboxes.get_mut(mailbox) {
            m.uids.clear();
        }
    }

    fn clear_all_messages(&mut self, mailbox: &str) {
        if let Some(m) = self.mailboxes.get_mut(mailbox) {
            m.uids.clear();
            m.messages.clear();
        }
    }

    fn clear_message(&mut self, mailbox: &str, uid: Uid) {
        if let Some(m) = self.mailboxes.get_mut(mailbox) {
            m.messages.remove(&uid);
        }
    }

    fn msg_flags(&self, mailbox: &str, uid: Uid) -> Option<Vec<Flag<'static>>> {
        self.message(mailbox, uid).and_then(|m| m.flags.clone())
    }

    fn set_msg_flags(&mut self, mailbox: &str, uid: Uid, flags: &[Flag<'static>]) {
        self.message_mut(mailbox, uid).flags = Some(flags.to_vec());
    }

    fn message_metadata(&self, mailbox: &str, uid: Uid) -> Option<MessageMetadata> {
        self.message(mailbox, uid).and_then(|m| m.metadata.clone())
    }

    fn set_message_metadata(&mut self, mailbox: &str, uid: Uid, data: &MessageMetadata) {
        self.message_mut(mailbox, uid).metadata = Some(data.clone());
    }

    fn message_part(&self, mailbox: &str, uid: Uid, part_id: &str) -> Option<Vec<u8>> {
        self.message(mailbox, uid)
            .and_then(|m| m.parts.get(part_id).cloned())
    }

    fn set_message_part(&mut self, mailbox: &str, uid: Uid, part_id: &str, data: &[u8]) {
        self.message_mut(mailbox, uid)
            .parts
            .insert(part_id.to_owned(), data.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clearing_messages_keeps_sync_state() {
        let mut c = MemoryCache::new();
        let state = SyncState {
            exists: Some(2),
            uid_next: Some(3),
            uid_validity: Some(1),
            ..Default::default()
        };
        c.set_mailbox_sync_state("INBOX", &state);
        c.set_uid_mapping("INBOX", &[1, 2]);
        c.set_msg_flags("INBOX", 1, &[Flag::Seen]);
        c.set_message_part("INBOX", 2, "1", b"body");

        c.clear_message("INBOX", 1);
        assert_eq!(c.msg_flags("INBOX", 1), None);
        assert_eq!(c.message_part("INBOX", 2, "1"), Some(b"body".to_vec()));

        c.clear_all_messages("INBOX");
        assert!(c.uid_mapping("INBOX").is_empty());
        assert_eq!(c.message_part("INBOX", 2, "1"), None);
        assert_eq!(c.mailbox_sync_state("INBOX"), state);
    }

    #[test]
    fn unknown_mailbox_is_empty() {
        let c = MemoryCache::new();
        assert!(!c.mailbox_sync_state("nope").is_usable_for_syncing());
        assert!(c.child_mailboxes("nope").is_none());
    }
}
