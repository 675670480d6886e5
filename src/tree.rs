//! The cached picture of the server: mailboxes, their messages and the parts of those messages.
//!
//! Every structural change is announced through the event channel as an
//! `RowsAboutToBe*`/`Rows*` pair bracketing the mutation, and every in-place change of a node
//! as [`Event::DataChanged`].

use std::collections::{BTreeMap, BTreeSet};

use crate::cache::{Cache, MailboxMetadata, MessageMetadata};
use crate::error::{Error, Result};
use crate::events::EventSender;
use crate::types::{
    Event, FetchResponse, Flag, MailboxId, StatusResponse, SyncState, TaskId, TreeIndex, Uid,
};

/// How far the loading of some piece of data got.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FetchState {
    /// Nobody asked for it yet.
    #[default]
    NotRequested,
    /// A request is in flight.
    Loading,
    /// Available.
    Done,
    /// The request failed or the data does not exist.
    Unavailable,
}

/// One message of a mailbox.
#[derive(Clone, Debug, Default)]
pub struct MessageNode {
    uid: Uid,
    flags: Vec<Flag<'static>>,
    flags_known: bool,
    metadata: Option<MessageMetadata>,
    metadata_state: FetchState,
    parts: BTreeMap<String, Vec<u8>>,
    loading_parts: BTreeSet<String>,
}

impl MessageNode {
    fn with_uid(uid: Uid) -> Self {
        MessageNode {
            uid,
            ..Default::default()
        }
    }

    /// The UID, or `0` when it has not been learned yet.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Flags of the message.
    pub fn flags(&self) -> &[Flag<'static>] {
        &self.flags
    }

    /// Whether the flags were ever reported.
    pub fn flags_known(&self) -> bool {
        self.flags_known
    }

    /// Envelope, size and structure, once fetched.
    pub fn metadata(&self) -> Option<&MessageMetadata> {
        self.metadata.as_ref()
    }

    /// Where loading the metadata stands.
    pub fn metadata_state(&self) -> FetchState {
        self.metadata_state
    }

    /// A downloaded body part.
    pub fn part(&self, part_id: &str) -> Option<&[u8]> {
        self.parts.get(part_id).map(|p| &p[..])
    }

    /// Whether a download of the part is in flight.
    pub fn is_part_loading(&self, part_id: &str) -> bool {
        self.loading_parts.contains(part_id)
    }
}

/// One mailbox.
#[derive(Clone, Debug)]
pub struct MailboxNode {
    name: String,
    separator: Option<String>,
    attributes: Vec<String>,
    parent: Option<MailboxId>,
    children: Vec<MailboxId>,
    children_state: FetchState,
    alive: bool,
    sync_state: SyncState,
    messages: Vec<MessageNode>,
    messages_state: FetchState,
    maintaining: Option<TaskId>,
    status: Option<StatusResponse>,
}

impl MailboxNode {
    fn new(meta: MailboxMetadata, parent: Option<MailboxId>) -> Self {
        MailboxNode {
            name: meta.name,
            separator: meta.separator,
            attributes: meta.attributes,
            parent,
            children: Vec::new(),
            children_state: FetchState::NotRequested,
            alive: true,
            sync_state: SyncState::default(),
            messages: Vec::new(),
            messages_state: FetchState::NotRequested,
            maintaining: None,
            status: None,
        }
    }

    /// Full name of the mailbox; empty for the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hierarchy separator.
    pub fn separator(&self) -> Option<&str> {
        self.separator.as_deref()
    }

    /// Name attributes from `LIST`.
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    /// Whether the mailbox can be selected.
    pub fn is_selectable(&self) -> bool {
        !self
            .attributes
            .iter()
            .any(|a| a.eq_ignore_ascii_case("\\Noselect") || a.eq_ignore_ascii_case("\\NonExistent"))
    }

    /// The parent mailbox, `None` for the root.
    pub fn parent(&self) -> Option<MailboxId> {
        self.parent
    }

    /// Child mailboxes.
    pub fn children(&self) -> &[MailboxId] {
        &self.children
    }

    /// Where loading the child mailboxes stands.
    pub fn children_state(&self) -> FetchState {
        self.children_state
    }

    /// The last known state of the mailbox on the server.
    pub fn sync_state(&self) -> &SyncState {
        &self.sync_state
    }

    /// Messages in sequence order.
    pub fn messages(&self) -> &[MessageNode] {
        &self.messages
    }

    /// Where loading the message list stands.
    pub fn messages_state(&self) -> FetchState {
        self.messages_state
    }

    /// The task keeping this mailbox selected, if any.
    pub fn maintaining_task(&self) -> Option<TaskId> {
        self.maintaining
    }

    /// The last `STATUS` reported for the mailbox.
    pub fn status(&self) -> Option<&StatusResponse> {
        self.status.as_ref()
    }
}

/// The tree of mailboxes with their messages.
#[derive(Debug)]
pub struct MailboxTree {
    nodes: Vec<MailboxNode>,
    events: EventSender,
}

impl MailboxTree {
    pub(crate) fn new(events: EventSender) -> Self {
        let root = MailboxNode::new(
            MailboxMetadata {
                name: String::new(),
                separator: None,
                attributes: vec!["\\Noselect".to_string()],
            },
            None,
        );
        MailboxTree {
            nodes: vec![root],
            events,
        }
    }

    /// The invisible root of the hierarchy.
    pub fn root(&self) -> MailboxId {
        MailboxId(0)
    }

    /// Whether `id` still refers to a mailbox in the tree.
    pub fn is_valid(&self, id: MailboxId) -> bool {
        self.nodes.get(id.0).map(|n| n.alive).unwrap_or(false)
    }

    /// Look a mailbox up.
    pub fn mailbox(&self, id: MailboxId) -> Option<&MailboxNode> {
        self.nodes.get(id.0).filter(|n| n.alive)
    }

    /// Find a live mailbox by its full name.
    pub fn find(&self, name: &str) -> Option<MailboxId> {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, n)| n.alive && n.name == name)
            .map(|(i, _)| MailboxId(i))
    }

    /// Messages of a mailbox; empty for an invalid id.
    pub fn messages(&self, id: MailboxId) -> &[MessageNode] {
        self.mailbox(id).map(|m| &m.messages[..]).unwrap_or(&[])
    }

    /// Position and node of the message with the given UID.
    pub fn message_by_uid(&self, id: MailboxId, uid: Uid) -> Option<(usize, &MessageNode)> {
        if uid == 0 {
            return None;
        }
        self.messages(id).iter().enumerate().find(|(_, m)| m.uid == uid)
    }

    /// UIDs of all messages in sequence order.
    pub fn uids(&self, id: MailboxId) -> Vec<Uid> {
        self.messages(id).iter().map(|m| m.uid).collect()
    }

    pub(crate) fn name(&self, id: MailboxId) -> Option<String> {
        self.mailbox(id).map(|m| m.name.clone())
    }

    fn node_mut(&mut self, id: MailboxId) -> Option<&mut MailboxNode> {
        self.nodes.get_mut(id.0).filter(|n| n.alive)
    }

    fn emit(&self, e: Event) {
        self.events.send(e);
    }

    fn insert_child(&mut self, parent: MailboxId, meta: MailboxMetadata) -> MailboxId {
        let id = MailboxId(self.nodes.len());
        let row = self.nodes[parent.0].children.len();
        let at = TreeIndex::Mailboxes(parent);
        self.emit(Event::RowsAboutToBeInserted {
            parent: at,
            first: row,
            last: row,
        });
        self.nodes.push(MailboxNode::new(meta, Some(parent)));
        self.nodes[parent.0].children.push(id);
        self.emit(Event::RowsInserted {
            parent: at,
            first: row,
            last: row,
        });
        id
    }

    /// The mailbox called `name`, created as a child of the root when it is not known yet.
    pub(crate) fn ensure_mailbox(&mut self, name: &str) -> MailboxId {
        if let Some(id) = self.find(name) {
            return id;
        }
        let root = self.root();
        self.insert_child(
            root,
            MailboxMetadata {
                name: name.to_owned(),
                separator: None,
                attributes: Vec::new(),
            },
        )
    }

    fn kill_subtree(&mut self, id: MailboxId) {
        let children = std::mem::take(&mut self.nodes[id.0].children);
        for child in children {
            self.kill_subtree(child);
        }
        let node = &mut self.nodes[id.0];
        node.alive = false;
        node.messages.clear();
        node.maintaining = None;
    }

    /// Replace the children of `parent` with `metadata`, keeping the nodes of mailboxes which
    /// are still there.
    pub(crate) fn set_children(&mut self, parent: MailboxId, metadata: Vec<MailboxMetadata>) {
        if !self.is_valid(parent) {
            return;
        }
        let at = TreeIndex::Mailboxes(parent);

        // Drop the children which disappeared, one contiguous run at a time.
        let mut row = 0;
        while row < self.nodes[parent.0].children.len() {
            let child = self.nodes[parent.0].children[row];
            if metadata.iter().any(|m| m.name == self.nodes[child.0].name) {
                row += 1;
                continue;
            }
            let mut last = row;
            while last + 1 < self.nodes[parent.0].children.len() {
                let next = self.nodes[parent.0].children[last + 1];
                if metadata.iter().any(|m| m.name == self.nodes[next.0].name) {
                    break;
                }
                last += 1;
            }
            self.emit(Event::RowsAboutToBeRemoved {
                parent: at,
                first: row,
                last,
            });
            let removed: Vec<_> = self.nodes[parent.0].children.drain(row..=last).collect();
            for child in removed {
                self.kill_subtree(child);
            }
            self.emit(Event::RowsRemoved {
                parent: at,
                first: row,
                last,
            });
        }

        for meta in metadata {
            let existing = self.nodes[parent.0]
                .children
                .iter()
                .position(|c| self.nodes[c.0].name == meta.name);
            match existing {
                Some(row) => {
                    let child = self.nodes[parent.0].children[row];
                    let node = &mut self.nodes[child.0];
                    if node.attributes != meta.attributes || node.separator != meta.separator {
                        node.attributes = meta.attributes;
                        node.separator = meta.separator;
                        self.emit(Event::DataChanged(TreeIndex::Mailbox(child)));
                    }
                }
                None => {
                    self.insert_child(parent, meta);
                }
            }
        }
        self.nodes[parent.0].children_state = FetchState::Done;
    }

    /// Add one child to `parent`, or refresh it when a child of that name exists.
    pub(crate) fn add_child(&mut self, parent: MailboxId, meta: MailboxMetadata) -> Option<MailboxId> {
        if !self.is_valid(parent) {
            return None;
        }
        let existing = self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|c| self.nodes[c.0].name == meta.name);
        match existing {
            Some(child) => {
                let node = &mut self.nodes[child.0];
                node.attributes = meta.attributes;
                node.separator = meta.separator;
                self.emit(Event::DataChanged(TreeIndex::Mailbox(child)));
                Some(child)
            }
            None => Some(self.insert_child(parent, meta)),
        }
    }

    /// Add or drop one name attribute of a mailbox.
    pub(crate) fn set_attribute(&mut self, id: MailboxId, attr: &str, present: bool) {
        let node = match self.node_mut(id) {
            Some(node) => node,
            None => return,
        };
        let had = node.attributes.iter().any(|a| a.eq_ignore_ascii_case(attr));
        if had == present {
            return;
        }
        if present {
            node.attributes.push(attr.to_owned());
        } else {
            node.attributes.retain(|a| !a.eq_ignore_ascii_case(attr));
        }
        self.emit(Event::DataChanged(TreeIndex::Mailbox(id)));
    }

    /// The children of `parent` in the form the cache stores them.
    pub(crate) fn children_metadata(&self, parent: MailboxId) -> Vec<MailboxMetadata> {
        self.mailbox(parent)
            .map(|p| {
                p.children
                    .iter()
                    .map(|c| {
                        let n = &self.nodes[c.0];
                        MailboxMetadata {
                            name: n.name.clone(),
                            separator: n.separator.clone(),
                            attributes: n.attributes.clone(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn set_children_state(&mut self, id: MailboxId, state: FetchState) {
        if let Some(n) = self.node_mut(id) {
            n.children_state = state;
        }
    }

    /// Remove a mailbox and everything below it.
    pub(crate) fn remove_mailbox(&mut self, id: MailboxId) {
        let parent = match self.mailbox(id).and_then(|m| m.parent) {
            Some(p) => p,
            None => return,
        };
        let row = match self.nodes[parent.0].children.iter().position(|&c| c == id) {
            Some(row) => row,
            None => return,
        };
        let at = TreeIndex::Mailboxes(parent);
        self.emit(Event::RowsAboutToBeRemoved {
            parent: at,
            first: row,
            last: row,
        });
        self.nodes[parent.0].children.remove(row);
        self.kill_subtree(id);
        self.emit(Event::RowsRemoved {
            parent: at,
            first: row,
            last: row,
        });
    }

    pub(crate) fn maintaining(&self, id: MailboxId) -> Option<TaskId> {
        self.mailbox(id).and_then(|m| m.maintaining)
    }

    pub(crate) fn set_maintaining(&mut self, id: MailboxId, task: Option<TaskId>) {
        if let Some(n) = self.node_mut(id) {
            n.maintaining = task;
        }
    }

    pub(crate) fn sync_state_mut(&mut self, id: MailboxId) -> Option<&mut SyncState> {
        self.node_mut(id).map(|n| &mut n.sync_state)
    }

    pub(crate) fn set_messages_state(&mut self, id: MailboxId, state: FetchState) {
        if let Some(n) = self.node_mut(id) {
            n.messages_state = state;
        }
    }

    /// Append messages with the given UIDs (`0` for not-yet-known ones).
    pub(crate) fn append_messages(&mut self, id: MailboxId, uids: &[Uid]) {
        if uids.is_empty() || !self.is_valid(id) {
            return;
        }
        let first = self.nodes[id.0].messages.len();
        let last = first + uids.len() - 1;
        let at = TreeIndex::Messages(id);
        self.emit(Event::RowsAboutToBeInserted {
            parent: at,
            first,
            last,
        });
        self.nodes[id.0]
            .messages
            .extend(uids.iter().map(|&uid| MessageNode::with_uid(uid)));
        self.emit(Event::RowsInserted {
            parent: at,
            first,
            last,
        });
    }

    /// Append `count` messages whose UIDs are not known yet.
    pub(crate) fn append_placeholders(&mut self, id: MailboxId, count: usize) {
        self.append_messages(id, &vec![0; count]);
    }

    /// Remove messages `first..=last`, returning their UIDs.
    pub(crate) fn remove_messages(&mut self, id: MailboxId, first: usize, last: usize) -> Vec<Uid> {
        if !self.is_valid(id) || first > last || last >= self.nodes[id.0].messages.len() {
            return Vec::new();
        }
        let at = TreeIndex::Messages(id);
        self.emit(Event::RowsAboutToBeRemoved {
            parent: at,
            first,
            last,
        });
        let removed = self.nodes[id.0]
            .messages
            .drain(first..=last)
            .map(|m| m.uid)
            .collect();
        self.emit(Event::RowsRemoved {
            parent: at,
            first,
            last,
        });
        removed
    }

    /// Remove every message of the mailbox.
    pub(crate) fn clear_messages(&mut self, id: MailboxId) {
        let len = self.messages(id).len();
        if len > 0 {
            self.remove_messages(id, 0, len - 1);
        }
    }

    pub(crate) fn set_uid(&mut self, id: MailboxId, offset: usize, uid: Uid) {
        if let Some(m) = self.node_mut(id).and_then(|n| n.messages.get_mut(offset)) {
            m.uid = uid;
        }
    }

    pub(crate) fn set_flags(&mut self, id: MailboxId, offset: usize, flags: Vec<Flag<'static>>) {
        if let Some(m) = self.node_mut(id).and_then(|n| n.messages.get_mut(offset)) {
            m.flags = flags;
            m.flags_known = true;
            self.emit(Event::DataChanged(TreeIndex::Message {
                mailbox: id,
                offset,
            }));
        }
    }

    pub(crate) fn set_metadata_state(&mut self, id: MailboxId, offset: usize, state: FetchState) {
        if let Some(m) = self.node_mut(id).and_then(|n| n.messages.get_mut(offset)) {
            m.metadata_state = state;
        }
    }

    pub(crate) fn set_part_loading(
        &mut self,
        id: MailboxId,
        offset: usize,
        part_id: &str,
        loading: bool,
    ) {
        if let Some(m) = self.node_mut(id).and_then(|n| n.messages.get_mut(offset)) {
            if loading {
                m.loading_parts.insert(part_id.to_owned());
            } else {
                m.loading_parts.remove(part_id);
            }
        }
    }

    pub(crate) fn set_status(&mut self, id: MailboxId, status: StatusResponse) {
        if let Some(n) = self.node_mut(id) {
            n.status = Some(status);
            self.emit(Event::DataChanged(TreeIndex::Mailbox(id)));
        }
    }

    pub(crate) fn message_count_changed(&self, id: MailboxId) {
        if self.is_valid(id) {
            self.emit(Event::MessageCountChanged(id));
        }
    }

    /// Copy whatever the cache knows about the messages of `id` into the tree.
    pub(crate) fn load_from_cache(&mut self, id: MailboxId, cache: &dyn Cache) {
        let name = match self.name(id) {
            Some(name) => name,
            None => return,
        };
        if !self.messages(id).is_empty() {
            return;
        }
        let uids = cache.uid_mapping(&name);
        self.append_messages(id, &uids);
        for (offset, uid) in uids.into_iter().enumerate() {
            let node = &mut self.nodes[id.0].messages[offset];
            if let Some(flags) = cache.msg_flags(&name, uid) {
                node.flags = flags;
                node.flags_known = true;
            }
            if let Some(md) = cache.message_metadata(&name, uid) {
                node.metadata = Some(md);
                node.metadata_state = FetchState::Done;
            }
        }
        self.nodes[id.0].sync_state = cache.mailbox_sync_state(&name);
    }

    /// Store the current sync state and UID list of the mailbox.
    pub(crate) fn save_sync_state_and_uids(&self, id: MailboxId, cache: &mut dyn Cache) {
        if let Some(node) = self.mailbox(id) {
            let uids = self.uids(id);
            log::debug!(
                "Saving sync state of {:?}: {} messages, {:?}",
                node.name,
                uids.len(),
                node.sync_state
            );
            cache.set_mailbox_sync_state(&node.name, &node.sync_state);
            cache.set_uid_mapping(&node.name, &uids);
        }
    }

    /// Grow the message list of a synchronized mailbox to `exists` messages with unknown UIDs.
    pub(crate) fn handle_exists(&mut self, id: MailboxId, exists: u32) -> Result<()> {
        let len = self.messages(id).len();
        if (exists as usize) < len {
            return Err(Error::ProtocolViolation(format!(
                "EXISTS response attempted to decrease number of messages from {} to {}",
                len, exists
            )));
        }
        if let Some(state) = self.sync_state_mut(id) {
            state.exists = Some(exists);
        }
        if exists as usize > len {
            self.append_placeholders(id, exists as usize - len);
            self.message_count_changed(id);
        }
        Ok(())
    }

    /// Remove the message with sequence number `seq` and forget it in the cache.
    pub(crate) fn handle_expunge(
        &mut self,
        id: MailboxId,
        seq: u32,
        cache: &mut dyn Cache,
    ) -> Result<()> {
        let name = match self.name(id) {
            Some(name) => name,
            None => return Ok(()),
        };
        let len = self.messages(id).len();
        if seq == 0 || seq as usize > len {
            return Err(Error::ProtocolViolation(
                "EXPUNGE references message number which is out-of-bounds".to_string(),
            ));
        }
        let offset = seq as usize - 1;
        for uid in self.remove_messages(id, offset, offset) {
            if uid != 0 {
                cache.clear_message(&name, uid);
            }
        }
        cache.set_uid_mapping(&name, &self.uids(id));
        self.message_count_changed(id);
        Ok(())
    }

    /// Remove the messages reported by a `VANISHED` response.
    pub(crate) fn handle_vanished(&mut self, id: MailboxId, uids: &[Uid], cache: &mut dyn Cache) {
        let name = match self.name(id) {
            Some(name) => name,
            None => return,
        };
        let mut removed = false;
        for &uid in uids {
            let offset = match self.message_by_uid(id, uid) {
                Some((offset, _)) => offset,
                None => continue,
            };
            self.remove_messages(id, offset, offset);
            cache.clear_message(&name, uid);
            removed = true;
        }
        if removed {
            let len = self.messages(id).len() as u32;
            if let Some(state) = self.sync_state_mut(id) {
                state.exists = Some(len);
            }
            cache.set_uid_mapping(&name, &self.uids(id));
            self.message_count_changed(id);
        }
    }

    /// The largest UID present in the message list.
    pub(crate) fn highest_known_uid(&self, id: MailboxId) -> Option<Uid> {
        self.messages(id).iter().map(|m| m.uid).filter(|&u| u != 0).max()
    }

    /// Reconcile the message list with the UIDs the server reported for the positions starting
    /// at `first`.
    ///
    /// Messages whose UID disagrees with the reported one at their position are dropped (UIDs
    /// only ever grow, so the reported message must come later), placeholders get their UID
    /// filled in, missing positions are appended and anything left over at the end is removed.
    pub(crate) fn apply_uids(
        &mut self,
        id: MailboxId,
        first: usize,
        uid_map: &[Uid],
        cache: &mut dyn Cache,
    ) {
        let name = match self.name(id) {
            Some(name) => name,
            None => return,
        };
        let first = first.min(self.messages(id).len());
        let end = first + uid_map.len();
        let mut i = first;
        while i < end {
            let wanted = uid_map[i - first];
            let len = self.nodes[id.0].messages.len();
            if i == len {
                self.append_messages(id, &uid_map[i - first..]);
                i = end;
                continue;
            }
            let current = self.nodes[id.0].messages[i].uid;
            if current == wanted {
                i += 1;
            } else if current == 0 {
                self.nodes[id.0].messages[i].uid = wanted;
                self.emit(Event::DataChanged(TreeIndex::Message {
                    mailbox: id,
                    offset: i,
                }));
                i += 1;
            } else {
                let mut pos = i;
                while pos < len {
                    let other = self.nodes[id.0].messages[pos].uid;
                    if other == 0 || other == wanted {
                        break;
                    }
                    cache.clear_message(&name, other);
                    pos += 1;
                }
                self.remove_messages(id, i, pos - 1);
            }
        }
        let len = self.nodes[id.0].messages.len();
        if i < len {
            self.remove_messages(id, i, len - 1);
        }
        self.nodes[id.0].messages_state = FetchState::Done;
    }

    /// Apply a `FETCH` response to the message at its sequence number.
    pub(crate) fn handle_fetch(
        &mut self,
        id: MailboxId,
        resp: &FetchResponse,
        cache: &mut dyn Cache,
    ) -> Result<()> {
        let name = match self.name(id) {
            Some(name) => name,
            None => return Ok(()),
        };
        let len = self.nodes[id.0].messages.len();
        if resp.seq == 0 || resp.seq as usize > len {
            return Err(Error::ProtocolViolation(format!(
                "Got FETCH for message #{} in a mailbox with {} messages",
                resp.seq, len
            )));
        }
        let offset = resp.seq as usize - 1;
        let changed = TreeIndex::Message {
            mailbox: id,
            offset,
        };

        if let Some(uid) = resp.uid {
            let known = self.nodes[id.0].messages[offset].uid;
            if known == 0 {
                self.nodes[id.0].messages[offset].uid = uid;
            } else if known != uid {
                return Err(Error::ProtocolViolation(format!(
                    "UID mismatch for message #{} in {:?}: expected {}, got {}",
                    resp.seq, name, known, uid
                )));
            }
        }
        let uid = self.nodes[id.0].messages[offset].uid;

        if let Some(ref flags) = resp.flags {
            let node = &mut self.nodes[id.0].messages[offset];
            node.flags = flags.clone();
            node.flags_known = true;
            if uid != 0 {
                cache.set_msg_flags(&name, uid, flags);
            }
            self.emit(Event::DataChanged(changed));
        }

        if resp.envelope.is_some() || resp.body_structure.is_some() || resp.size.is_some() {
            let node = &mut self.nodes[id.0].messages[offset];
            let md = node.metadata.get_or_insert_with(MessageMetadata::default);
            if resp.envelope.is_some() {
                md.envelope = resp.envelope.clone();
            }
            if resp.size.is_some() {
                md.size = resp.size;
            }
            if resp.internal_date.is_some() {
                md.internal_date = resp.internal_date;
            }
            if resp.body_structure.is_some() {
                md.body_structure = resp.body_structure.clone();
            }
            if md.envelope.is_some() && md.body_structure.is_some() {
                node.metadata_state = FetchState::Done;
                if uid != 0 {
                    let md = md.clone();
                    cache.set_message_metadata(&name, uid, &md);
                }
            }
            self.emit(Event::DataChanged(changed));
        }

        for (part_id, data) in &resp.parts {
            let node = &mut self.nodes[id.0].messages[offset];
            node.parts.insert(part_id.clone(), data.clone());
            node.loading_parts.remove(part_id);
            if uid != 0 {
                cache.set_message_part(&name, uid, part_id, data);
            }
            self.emit(Event::DataChanged(changed));
        }
        Ok(())
    }
}
