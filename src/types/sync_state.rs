use super::{Flag, Uid};

/// A snapshot of what the server reported about a mailbox.
///
/// Comparing the snapshot taken at the last successful synchronization with the one the server
/// reports after a fresh `SELECT` decides how much work a resynchronization has to do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Number of messages, from `EXISTS`.
    pub exists: Option<u32>,
    /// Number of messages with the `\Recent` flag, from `RECENT`.
    pub recent: Option<u32>,
    /// Sequence number of the first unseen message, from `[UNSEEN n]`.
    pub unseen_offset: Option<u32>,
    /// Predicted UID of the next message, from `[UIDNEXT n]`.
    pub uid_next: Option<Uid>,
    /// UID epoch, from `[UIDVALIDITY n]`.
    pub uid_validity: Option<u32>,
    /// Flags applicable in the mailbox, from `FLAGS`.
    pub flags: Vec<Flag<'static>>,
    /// Flags that can be changed permanently, from `[PERMANENTFLAGS (...)]`.
    pub permanent_flags: Vec<Flag<'static>>,
    /// Highest modification sequence, from `[HIGHESTMODSEQ n]`.
    pub highest_mod_seq: Option<u64>,
    /// The server reported `[NOMODSEQ]`.
    pub no_mod_seq: bool,
}

impl SyncState {
    /// Whether the snapshot carries enough to compare against a later one.
    pub fn is_usable_for_syncing(&self) -> bool {
        self.exists.is_some() && self.uid_next.is_some() && self.uid_validity.is_some()
    }

    /// `EXISTS`, treating an unknown value as an empty mailbox.
    pub fn exists_or_zero(&self) -> u32 {
        self.exists.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usability_needs_all_three_counters() {
        let mut s = SyncState {
            exists: Some(3),
            uid_next: Some(4),
            ..Default::default()
        };
        assert!(!s.is_usable_for_syncing());
        s.uid_validity = Some(1);
        assert!(s.is_usable_for_syncing());
    }
}
