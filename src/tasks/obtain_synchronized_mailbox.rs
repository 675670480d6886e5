use super::{completes, ImapTask, TaskKind, UnSelectTask};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::parser::Command;
use crate::tree::FetchState;
use crate::types::{
    ConnectionState, ESearchResponse, FetchResponse, Flag, MailboxId, NumberResponse, RespCode,
    Sequence, StateKind, StateResponse, SyncState, Tag, TaskId, Uid,
};

/// How much work a resynchronization has to do, decided from the state cached at the end of
/// the previous synchronization and the state reported by a fresh `SELECT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncStrategy {
    /// The mailbox is empty now.
    Empty,
    /// Nothing arrived and nothing vanished; only flags may have changed.
    FlagsOnly,
    /// Messages arrived, none vanished.
    OnlyAdditions,
    /// Messages arrived and vanished; the whole UID list is downloaded again and reconciled
    /// with the cached one.
    Generic,
    /// The cached messages are useless; forget them and start from scratch.
    Full(&'static str),
}

impl SyncStrategy {
    /// Pick the strategy for the given snapshots.
    ///
    /// `cached_uids` is the length of the cached UID list and `tree_len` the number of
    /// messages already present in the tree.
    pub(crate) fn choose(
        old: &SyncState,
        new: &SyncState,
        cached_uids: usize,
        tree_len: usize,
    ) -> SyncStrategy {
        if cached_uids != old.exists_or_zero() as usize
            || (tree_len > 0 && tree_len != cached_uids)
        {
            return SyncStrategy::Full("Inconsistent cache data, falling back to full sync");
        }
        if !old.is_usable_for_syncing() || !new.is_usable_for_syncing() {
            if new.exists == Some(0) {
                return SyncStrategy::Empty;
            }
            return SyncStrategy::Full("No usable synchronization state");
        }
        if old.uid_validity != new.uid_validity {
            return SyncStrategy::Full("UIDVALIDITY has changed");
        }

        let new_exists = new.exists_or_zero();
        let old_exists = old.exists_or_zero();
        // both are usable, so UIDNEXT is known on both sides
        let new_next = new.uid_next.unwrap_or(0);
        let old_next = old.uid_next.unwrap_or(0);

        if new_exists == 0 {
            SyncStrategy::Empty
        } else if new_next == old_next {
            if new_exists == old_exists {
                SyncStrategy::FlagsOnly
            } else {
                // deletions only
                SyncStrategy::Generic
            }
        } else if new_next > old_next {
            if new_exists > old_exists && new_exists - old_exists == new_next - old_next {
                SyncStrategy::OnlyAdditions
            } else {
                SyncStrategy::Generic
            }
        } else {
            SyncStrategy::Full("UIDVALIDITY remains same but UIDNEXT decreased")
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    WaitForConn,
    Selecting,
    SyncingUids,
    SyncingFlags,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UidSyncMode {
    /// `UID SEARCH ALL`, replacing everything from `first_unknown` on.
    Search,
    /// `UID FETCH n:* (FLAGS)` filling in the placeholders of new arrivals.
    TailFetch,
}

/// Selects a mailbox and brings the tree and the cache in line with what the server has.
///
/// The mailbox owner created along with this task is its only dependent; it gets started once
/// the mailbox is synchronized.
#[derive(Debug)]
pub(crate) struct ObtainSynchronizedMailboxTask {
    mailbox: MailboxId,
    phase: Phase,
    select_cmd: Option<Tag>,
    uid_sync_cmd: Option<Tag>,
    uid_sync_mode: UidSyncMode,
    flags_cmd: Option<Tag>,
    new_arrivals: Vec<Tag>,
    uid_map: Vec<Uid>,
    /// Position of the first message whose UID the running UID sync reports.
    first_unknown: usize,
    /// `EXISTS` when the UID list arrived. Arrivals announced after it are not in the list
    /// and get fetched separately.
    exists_when_listed: Option<u32>,
    /// Messages vanished while UIDs were synced; the result is stale.
    restart_uid_sync: bool,
    unselect: Option<TaskId>,
}

impl ObtainSynchronizedMailboxTask {
    pub(crate) fn new(mailbox: MailboxId) -> Self {
        ObtainSynchronizedMailboxTask {
            mailbox,
            phase: Phase::WaitForConn,
            select_cmd: None,
            uid_sync_cmd: None,
            uid_sync_mode: UidSyncMode::Search,
            flags_cmd: None,
            new_arrivals: Vec::new(),
            uid_map: Vec::new(),
            first_unknown: 0,
            exists_when_listed: None,
            restart_uid_sync: false,
            unselect: None,
        }
    }

    fn name(&self, model: &Model) -> Result<String> {
        model
            .tree
            .name(self.mailbox)
            .ok_or_else(|| Error::Mailbox("The mailbox went missing".to_string()))
    }

    fn sync_state<'a>(&self, model: &'a mut Model) -> Option<&'a mut SyncState> {
        model.tree.sync_state_mut(self.mailbox)
    }

    fn exists(&self, model: &Model) -> u32 {
        model
            .tree
            .mailbox(self.mailbox)
            .map(|m| m.sync_state().exists_or_zero())
            .unwrap_or(0)
    }

    fn uid_next(&self, model: &Model) -> Uid {
        model
            .tree
            .mailbox(self.mailbox)
            .and_then(|m| m.sync_state().uid_next)
            .unwrap_or(0)
    }

    /// Leave the mailbox if it was deleted meanwhile.
    ///
    /// Returns `true` while the task is on its way out.
    fn escape_if_gone(&mut self, model: &mut Model, me: TaskId) -> Result<bool> {
        if self.unselect.is_some() {
            return Ok(true);
        }
        if model.tree.is_valid(self.mailbox) || self.phase == Phase::WaitForConn {
            return Ok(false);
        }
        log::info!("{}: Mailbox disappeared", me);
        let conn = model.conn_of(me)?;
        let unselect = model.create_task(TaskKind::UnSelect, Box::new(UnSelectTask::new()));
        model.core_mut(unselect).owner = Some(me);
        self.unselect = Some(unselect);
        model.activate_first(unselect, conn);
        Ok(true)
    }

    fn finalize_select(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let conn = model.conn_of(me)?;
        model.set_conn_state(conn, ConnectionState::Syncing);
        let name = self.name(model)?;
        let old = model.cache.mailbox_sync_state(&name);
        let cached_uids = model.cache.uid_mapping(&name).len();
        let tree_len = model.tree.messages(self.mailbox).len();
        let new = model
            .tree
            .mailbox(self.mailbox)
            .map(|m| m.sync_state().clone())
            .unwrap_or_default();

        let strategy = SyncStrategy::choose(&old, &new, cached_uids, tree_len);
        log::debug!("{}: synchronizing {:?} using {:?}", me, name, strategy);
        match strategy {
            SyncStrategy::Empty => {
                model.tree.clear_messages(self.mailbox);
                model.cache.clear_all_messages(&name);
                self.finish(model, me)
            }
            SyncStrategy::FlagsOnly => {
                log::debug!("{}: No arrivals or deletions since the last time", me);
                model.tree.set_messages_state(self.mailbox, FetchState::Done);
                self.sync_flags(model, me)
            }
            SyncStrategy::OnlyAdditions => {
                log::debug!("{}: Syncing new arrivals", me);
                let old_exists = old.exists_or_zero() as usize;
                let new_exists = new.exists_or_zero() as usize;
                model
                    .tree
                    .append_placeholders(self.mailbox, new_exists - old_exists);
                model.tree.message_count_changed(self.mailbox);
                self.first_unknown = old_exists;
                self.uid_sync_mode = UidSyncMode::TailFetch;
                self.phase = Phase::SyncingUids;
                self.uid_sync_cmd = Some(model.send(
                    conn,
                    Command::UidFetch {
                        sequence: Sequence::starting_at(old.uid_next.unwrap_or(1).max(1)),
                        items: vec!["FLAGS".to_string()],
                    },
                )?);
                Ok(())
            }
            SyncStrategy::Generic => {
                log::debug!("{}: generic synchronization from previous state", me);
                self.first_unknown = 0;
                self.sync_uids(model, me)
            }
            SyncStrategy::Full(reason) => {
                log::info!("{}: {}; full synchronization of {:?}", me, reason, name);
                self.full_sync(model, me, &name)
            }
        }
    }

    fn full_sync(&mut self, model: &mut Model, me: TaskId, name: &str) -> Result<()> {
        model.tree.clear_messages(self.mailbox);
        model.cache.clear_all_messages(name);
        let exists = self.exists(model);
        if exists == 0 {
            return self.finish(model, me);
        }
        model.tree.append_placeholders(self.mailbox, exists as usize);
        model.tree.message_count_changed(self.mailbox);
        self.first_unknown = 0;
        self.sync_uids(model, me)
    }

    fn sync_uids(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let conn = model.conn_of(me)?;
        log::debug!("{}: Syncing UIDs", me);
        self.phase = Phase::SyncingUids;
        self.uid_sync_mode = UidSyncMode::Search;
        self.uid_map.clear();
        self.restart_uid_sync = false;
        self.exists_when_listed = None;
        let command = if model.has_capability(conn, "ESEARCH") {
            Command::UidESearch {
                criteria: "ALL".to_string(),
                return_options: vec!["ALL".to_string()],
            }
        } else {
            Command::UidSearch("ALL".to_string())
        };
        self.uid_sync_cmd = Some(model.send(conn, command)?);
        Ok(())
    }

    fn finalize_uid_search(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let exists = self
            .exists_when_listed
            .take()
            .unwrap_or_else(|| self.exists(model));
        if self.uid_map.len() != exists as usize {
            return Err(Error::Mailbox(format!(
                "Error when synchronizing all messages: server said that there are {} messages, \
                 but UID (E)SEARCH ALL response contains {} entries",
                exists,
                self.uid_map.len()
            )));
        }
        self.uid_map.sort_unstable();
        if self.uid_map.first() == Some(&0) {
            return Err(Error::Mailbox(
                "UID (E)SEARCH response contains invalid UID zero".to_string(),
            ));
        }
        let uids = std::mem::take(&mut self.uid_map);
        model
            .tree
            .apply_uids(self.mailbox, self.first_unknown, &uids, model.cache.as_mut());
        model.tree.message_count_changed(self.mailbox);
        self.uids_synchronized(model, me)
    }

    fn finalize_tail_fetch(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        // arrivals announced meanwhile are not in the list yet
        let unknown = model
            .tree
            .messages(self.mailbox)
            .iter()
            .any(|m| m.uid() == 0);
        if unknown {
            log::info!("{}: new arrivals did not all get their UIDs, syncing all UIDs", me);
            self.first_unknown = 0;
            return self.sync_uids(model, me);
        }
        model.tree.set_messages_state(self.mailbox, FetchState::Done);
        self.uids_synchronized(model, me)
    }

    fn uids_synchronized(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        log::debug!("{}: UIDs synchronized", me);
        self.bump_uid_next(model);
        let exists = self.exists(model);
        if exists as usize > model.tree.messages(self.mailbox).len() {
            // arrivals announced while the UIDs were being synced
            model.tree.handle_exists(self.mailbox, exists)?;
            self.fetch_new_arrivals(model, me)?;
        }
        self.sync_flags(model, me)
    }

    fn sync_flags(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let len = model.tree.messages(self.mailbox).len() as u32;
        if len == 0 {
            self.phase = Phase::Done;
            return self.finish_unless_waiting(model, me);
        }
        log::debug!("{}: Syncing flags", me);
        let conn = model.conn_of(me)?;
        let mut items = vec!["FLAGS".to_string()];
        if model.tree.messages(self.mailbox).iter().any(|m| m.uid() == 0) {
            log::debug!("{}: some UIDs are still unknown, asking for them too", me);
            items.insert(0, "UID".to_string());
        }
        self.phase = Phase::SyncingFlags;
        self.flags_cmd = Some(model.send(
            conn,
            Command::Fetch {
                sequence: Sequence::range(1, len),
                items,
            },
        )?);
        Ok(())
    }

    fn fetch_new_arrivals(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let conn = model.conn_of(me)?;
        let highest = model.tree.highest_known_uid(self.mailbox).unwrap_or(0);
        let start = self.uid_next(model).max(highest + 1).max(1);
        let tag = model.send(
            conn,
            Command::UidFetch {
                sequence: Sequence::starting_at(start),
                items: vec!["FLAGS".to_string()],
            },
        )?;
        self.new_arrivals.push(tag);
        Ok(())
    }

    /// Keep `UIDNEXT` above every UID we know about.
    fn bump_uid_next(&self, model: &mut Model) {
        if let Some(highest) = model.tree.highest_known_uid(self.mailbox) {
            if let Some(state) = model.tree.sync_state_mut(self.mailbox) {
                if state.uid_next.map(|n| n <= highest).unwrap_or(true) {
                    state.uid_next = Some(highest + 1);
                }
            }
        }
    }

    fn finish_unless_waiting(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if self.new_arrivals.is_empty() {
            self.finish(model, me)
        } else {
            log::debug!("{}: Pending new arrival fetching, not terminating yet", me);
            Ok(())
        }
    }

    fn finish(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let conn = model.conn_of(me)?;
        if model.tree.messages(self.mailbox).iter().any(|m| m.uid() == 0) {
            return Err(Error::Mailbox(
                "Synchronization finished, yet some messages have no UID".to_string(),
            ));
        }
        self.phase = Phase::Done;
        self.bump_uid_next(model);
        let len = model.tree.messages(self.mailbox).len() as u32;
        if let Some(state) = self.sync_state(model) {
            state.exists = Some(len);
        }
        model.tree.set_messages_state(self.mailbox, FetchState::Done);
        model
            .tree
            .save_sync_state_and_uids(self.mailbox, model.cache.as_mut());
        model.set_conn_state(conn, ConnectionState::Selected);
        model.tree.message_count_changed(self.mailbox);
        log::info!("{}: mailbox synchronized, {} messages", me, len);
        model.task_completed(me);
        Ok(())
    }

    fn handle_resp_code(&mut self, model: &mut Model, code: &RespCode) -> bool {
        let state = match model.tree.sync_state_mut(self.mailbox) {
            Some(state) => state,
            None => return false,
        };
        match code {
            RespCode::Unseen(n) => state.unseen_offset = Some(*n),
            RespCode::PermanentFlags(flags) => state.permanent_flags = flags.clone(),
            RespCode::UidNext(n) => state.uid_next = Some(*n),
            RespCode::UidValidity(n) => state.uid_validity = Some(*n),
            RespCode::NoModSeq => {
                state.highest_mod_seq = None;
                state.no_mod_seq = true;
            }
            RespCode::HighestModSeq(n) => state.highest_mod_seq = Some(*n),
            RespCode::Closed => {}
            _ => return false,
        }
        true
    }
}

impl ImapTask for ObtainSynchronizedMailboxTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        {
            let core = model.core(me);
            if core.dead || core.aborted {
                model.task_failed(me, "Asked to abort or die");
                return Ok(());
            }
        }
        let conn = model.conn_of(me)?;
        let name = match model.tree.name(self.mailbox) {
            Some(name) => name,
            None => {
                model.task_failed(me, "The mailbox went missing");
                return Ok(());
            }
        };
        log::info!("{}: Synchronizing mailbox {:?}", me, name);

        model.tree.set_messages_state(self.mailbox, FetchState::Loading);
        model.tree.load_from_cache(self.mailbox, model.cache.as_ref());
        let condstore = model.has_capability(conn, "CONDSTORE");
        self.select_cmd = Some(model.send(
            conn,
            Command::Select {
                mailbox: name,
                condstore,
            },
        )?);
        if let Some(state) = self.sync_state(model) {
            *state = SyncState::default();
        }
        model.set_conn_state(conn, ConnectionState::Selecting);
        if let Some(c) = model.conn_mut(conn) {
            c.selected_mailbox = Some(self.mailbox);
        }
        self.phase = Phase::Selecting;
        Ok(())
    }

    fn run_ready(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if let Some(unselect) = self.unselect {
            if model.core(unselect).finished {
                model.task_failed(me, "Escaped from mailbox");
            }
        }
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if self.phase == Phase::WaitForConn {
            return Ok(false);
        }
        if self.escape_if_gone(model, me)? {
            let ours = [&self.select_cmd, &self.uid_sync_cmd, &self.flags_cmd]
                .iter()
                .any(|t| completes(resp, t))
                || resp
                    .tag
                    .as_ref()
                    .map(|t| self.new_arrivals.contains(t))
                    .unwrap_or(false);
            return Ok(ours);
        }

        if resp.tag.is_none() {
            return Ok(match resp.code {
                Some(ref code) => self.handle_resp_code(model, code),
                None => false,
            });
        }

        if completes(resp, &self.select_cmd) {
            self.select_cmd = None;
            if resp.kind == StateKind::Ok {
                self.finalize_select(model, me)?;
            } else {
                let conn = model.conn_of(me)?;
                model.set_conn_state(conn, ConnectionState::Authenticated);
                if let Some(c) = model.conn_mut(conn) {
                    c.selected_mailbox = None;
                }
                model
                    .tree
                    .set_messages_state(self.mailbox, FetchState::Unavailable);
                model.task_failed(me, &format!("SELECT failed: {}", resp.message));
            }
            Ok(true)
        } else if completes(resp, &self.uid_sync_cmd) {
            self.uid_sync_cmd = None;
            if resp.kind != StateKind::Ok {
                model.task_failed(me, "UID syncing failed");
            } else if self.restart_uid_sync {
                log::debug!("{}: messages vanished during UID sync, starting over", me);
                self.first_unknown = 0;
                self.sync_uids(model, me)?;
            } else {
                match self.uid_sync_mode {
                    UidSyncMode::Search => self.finalize_uid_search(model, me)?,
                    UidSyncMode::TailFetch => self.finalize_tail_fetch(model, me)?,
                }
            }
            Ok(true)
        } else if completes(resp, &self.flags_cmd) {
            self.flags_cmd = None;
            if resp.kind == StateKind::Ok {
                log::debug!("{}: Flags synchronized", me);
                self.phase = Phase::Done;
                self.finish_unless_waiting(model, me)?;
            } else {
                model.task_failed(me, "Flags synchronization failed");
            }
            Ok(true)
        } else if let Some(pos) = resp
            .tag
            .as_ref()
            .and_then(|t| self.new_arrivals.iter().position(|a| a == t))
        {
            self.new_arrivals.remove(pos);
            if resp.kind != StateKind::Ok {
                model.task_failed(
                    me,
                    "UID discovery of new arrivals after initial UID sync has failed",
                );
            } else if self.new_arrivals.is_empty() && self.phase == Phase::Done {
                self.finish(model, me)?;
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn handle_number(&mut self, model: &mut Model, me: TaskId, resp: NumberResponse) -> Result<bool> {
        if self.phase == Phase::WaitForConn {
            return Ok(false);
        }
        if self.escape_if_gone(model, me)? {
            return Ok(false);
        }
        match resp {
            NumberResponse::Exists(n) => match self.phase {
                Phase::Selecting | Phase::SyncingUids => {
                    // applied to the message list once the UIDs are known
                    if let Some(state) = self.sync_state(model) {
                        state.exists = Some(n);
                    }
                }
                _ => {
                    if n as usize != model.tree.messages(self.mailbox).len() {
                        model.tree.handle_exists(self.mailbox, n)?;
                        self.fetch_new_arrivals(model, me)?;
                    }
                }
            },
            NumberResponse::Expunge(seq) => match self.phase {
                Phase::Selecting => {
                    log::warn!("{}: EXPUNGE #{} while selecting, ignored", me, seq);
                }
                Phase::SyncingUids => {
                    if let Some(state) = self.sync_state(model) {
                        state.exists = Some(state.exists_or_zero().saturating_sub(1));
                    }
                    self.restart_uid_sync = true;
                }
                Phase::SyncingFlags | Phase::Done => {
                    model
                        .tree
                        .handle_expunge(self.mailbox, seq, model.cache.as_mut())?;
                    if let Some(state) = self.sync_state(model) {
                        state.exists = Some(state.exists_or_zero().saturating_sub(1));
                    }
                }
                Phase::WaitForConn => return Ok(false),
            },
            NumberResponse::Recent(n) => {
                if let Some(state) = self.sync_state(model) {
                    state.recent = Some(n);
                }
            }
        }
        Ok(true)
    }

    fn handle_vanished(
        &mut self,
        model: &mut Model,
        me: TaskId,
        earlier: bool,
        uids: &[Uid],
    ) -> Result<bool> {
        if self.phase == Phase::WaitForConn || self.escape_if_gone(model, me)? {
            return Ok(false);
        }
        if earlier {
            log::debug!("{}: ignoring VANISHED (EARLIER)", me);
            return Ok(true);
        }
        match self.phase {
            Phase::Selecting | Phase::SyncingUids => {
                if let Some(state) = self.sync_state(model) {
                    let exists = state.exists_or_zero();
                    state.exists = Some(exists.saturating_sub(uids.len() as u32));
                }
                self.restart_uid_sync = self.phase == Phase::SyncingUids;
            }
            _ => {
                model
                    .tree
                    .handle_vanished(self.mailbox, uids, model.cache.as_mut());
            }
        }
        Ok(true)
    }

    fn handle_flags(&mut self, model: &mut Model, _me: TaskId, flags: &[Flag<'static>]) -> Result<bool> {
        if self.phase == Phase::WaitForConn {
            return Ok(false);
        }
        if let Some(state) = self.sync_state(model) {
            state.flags = flags.to_vec();
        }
        Ok(true)
    }

    fn handle_search(&mut self, model: &mut Model, _me: TaskId, items: &[u32]) -> Result<bool> {
        if self.uid_sync_cmd.is_some()
            && self.phase == Phase::SyncingUids
            && self.uid_sync_mode == UidSyncMode::Search
        {
            self.uid_map.extend_from_slice(items);
            self.exists_when_listed = Some(self.exists(model));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn handle_esearch(&mut self, model: &mut Model, _me: TaskId, resp: &ESearchResponse) -> Result<bool> {
        if self.phase != Phase::SyncingUids || self.uid_sync_mode != UidSyncMode::Search {
            return Ok(false);
        }
        match (&resp.tag, &self.uid_sync_cmd) {
            (Some(got), Some(want)) if got == want => {}
            _ => return Ok(false),
        }
        if !resp.uid {
            return Err(Error::ProtocolViolation(
                "ESEARCH response with matching tag uses sequence numbers instead of UIDs"
                    .to_string(),
            ));
        }
        if let Some(ref all) = resp.all {
            self.uid_map.extend_from_slice(all);
        }
        self.exists_when_listed = Some(self.exists(model));
        Ok(true)
    }

    fn handle_fetch(&mut self, model: &mut Model, me: TaskId, resp: &FetchResponse) -> Result<bool> {
        if self.phase == Phase::WaitForConn {
            return Ok(false);
        }
        if self.escape_if_gone(model, me)? {
            return Ok(false);
        }
        if self.phase == Phase::Selecting {
            log::debug!("{}: ignoring FETCH of #{} while selecting", me, resp.seq);
            return Ok(true);
        }
        if self.phase == Phase::SyncingUids
            && self.uid_sync_mode == UidSyncMode::Search
            && resp.seq as usize > model.tree.messages(self.mailbox).len()
        {
            // refers to an arrival which is not in the list yet
            return Ok(true);
        }
        model
            .tree
            .handle_fetch(self.mailbox, resp, model.cache.as_mut())?;
        if let Some(uid) = resp.uid {
            if let Some(state) = self.sync_state(model) {
                if state.uid_next.map(|n| uid >= n).unwrap_or(true) {
                    state.uid_next = Some(uid + 1);
                }
            }
        }
        Ok(true)
    }

    fn die(&mut self, model: &mut Model, me: TaskId, reason: &str) {
        if model
            .tree
            .mailbox(self.mailbox)
            .map(|m| m.messages_state() == FetchState::Loading)
            .unwrap_or(false)
        {
            model
                .tree
                .set_messages_state(self.mailbox, FetchState::Unavailable);
        }
        model.task_failed(me, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use crate::config::EngineConfig;
    use crate::testing::{ScriptHandle, ScriptedConnector};
    use crate::types::{Event, NetworkPolicy};

    fn selecting(cache: MemoryCache) -> (ScriptHandle, Model) {
        let connector =
            ScriptedConnector::new().with_greeting("* PREAUTH [CAPABILITY IMAP4rev1] hi\r\n");
        let mut m = Model::new(EngineConfig::default(), cache, connector.clone());
        m.open_mailbox("INBOX").unwrap();
        m.poll();
        (connector.connection(0), m)
    }

    fn select_ok(h: &ScriptHandle, exists: u32, uid_next: Uid) {
        h.server(&format!(
            "* {} EXISTS\r\n* OK [UIDVALIDITY 1] ok\r\n* OK [UIDNEXT {}] ok\r\n\
             {} OK [READ-WRITE] in\r\n",
            exists,
            uid_next,
            h.tag_of("SELECT")
        ));
    }

    fn last_lines(h: &ScriptHandle, n: usize) -> Vec<String> {
        let lines = h.sent_lines();
        lines[lines.len().saturating_sub(n)..].to_vec()
    }

    fn no_connection_errors(m: &Model) -> bool {
        m.events()
            .try_iter()
            .all(|e| !matches!(e, Event::ConnectionError { .. }))
    }

    fn state(exists: u32, uid_next: Uid, uid_validity: u32) -> SyncState {
        SyncState {
            exists: Some(exists),
            uid_next: Some(uid_next),
            uid_validity: Some(uid_validity),
            ..Default::default()
        }
    }

    #[test]
    fn first_sync_is_full() {
        let old = SyncState::default();
        let new = state(3, 4, 1);
        assert!(matches!(
            SyncStrategy::choose(&old, &new, 0, 0),
            SyncStrategy::Full(_)
        ));
    }

    #[test]
    fn first_sync_of_empty_mailbox() {
        let old = SyncState::default();
        let new = state(0, 1, 1);
        assert_eq!(SyncStrategy::choose(&old, &new, 0, 0), SyncStrategy::Empty);
    }

    #[test]
    fn changed_uidvalidity_resets() {
        let old = state(3, 4, 1);
        let new = state(3, 4, 2);
        assert_eq!(
            SyncStrategy::choose(&old, &new, 3, 3),
            SyncStrategy::Full("UIDVALIDITY has changed")
        );
    }

    #[test]
    fn unchanged_mailbox_syncs_flags_only() {
        let old = state(3, 4, 1);
        assert_eq!(
            SyncStrategy::choose(&old, &old.clone(), 3, 3),
            SyncStrategy::FlagsOnly
        );
    }

    #[test]
    fn emptied_mailbox() {
        let old = state(3, 4, 1);
        let new = state(0, 4, 1);
        assert_eq!(SyncStrategy::choose(&old, &new, 3, 3), SyncStrategy::Empty);
    }

    #[test]
    fn deletions_only_resync_uids() {
        let old = state(3, 4, 1);
        let new = state(2, 4, 1);
        assert_eq!(SyncStrategy::choose(&old, &new, 3, 3), SyncStrategy::Generic);
    }

    #[test]
    fn pure_arrivals() {
        let old = state(3, 4, 1);
        let new = state(5, 6, 1);
        assert_eq!(
            SyncStrategy::choose(&old, &new, 3, 3),
            SyncStrategy::OnlyAdditions
        );
    }

    #[test]
    fn arrivals_and_deletions() {
        let old = state(3, 4, 1);
        let new = state(4, 6, 1);
        assert_eq!(SyncStrategy::choose(&old, &new, 3, 3), SyncStrategy::Generic);
        let shrunk = state(2, 6, 1);
        assert_eq!(SyncStrategy::choose(&old, &shrunk, 3, 3), SyncStrategy::Generic);
    }

    #[test]
    fn decreasing_uidnext_resets() {
        let old = state(3, 10, 1);
        let new = state(3, 8, 1);
        assert!(matches!(
            SyncStrategy::choose(&old, &new, 3, 3),
            SyncStrategy::Full(_)
        ));
    }

    #[test]
    fn inconsistent_cache_resets() {
        let old = state(3, 4, 1);
        assert_eq!(
            SyncStrategy::choose(&old, &old.clone(), 2, 2),
            SyncStrategy::Full("Inconsistent cache data, falling back to full sync")
        );
        assert_eq!(
            SyncStrategy::choose(&old, &old.clone(), 3, 5),
            SyncStrategy::Full("Inconsistent cache data, falling back to full sync")
        );
    }

    #[test]
    fn inconsistent_cache_is_reported_first() {
        let old = state(3, 4, 1);
        let new = state(3, 4, 2);
        assert_eq!(
            SyncStrategy::choose(&old, &new, 2, 0),
            SyncStrategy::Full("Inconsistent cache data, falling back to full sync")
        );
        assert_eq!(
            SyncStrategy::choose(&SyncState::default(), &new, 5, 5),
            SyncStrategy::Full("Inconsistent cache data, falling back to full sync")
        );
    }

    #[test]
    fn arrival_announced_before_the_uid_list() {
        let (h, mut m) = selecting(MemoryCache::new());
        select_ok(&h, 3, 4);
        m.poll();
        assert_eq!(last_lines(&h, 1), vec!["UID SEARCH ALL"]);
        h.server(&format!(
            "* 4 EXISTS\r\n* SEARCH 1 2 3 4\r\n{} OK done\r\n",
            h.tag_of("UID SEARCH")
        ));
        m.poll();
        assert_eq!(m.network_policy(), NetworkPolicy::Online);
        assert_eq!(last_lines(&h, 1), vec!["FETCH 1:4 (FLAGS)"]);

        let mut flags = String::new();
        for seq in 1..=4 {
            flags.push_str(&format!("* {} FETCH (FLAGS ())\r\n", seq));
        }
        h.server(&format!("{}{} OK done\r\n", flags, h.tag_of("FETCH 1:4")));
        m.poll();
        let inbox = m.tree().find("INBOX").unwrap();
        assert_eq!(m.tree().uids(inbox), vec![1, 2, 3, 4]);
        assert!(m.maintaining_task("INBOX").is_some());
        assert!(no_connection_errors(&m));
    }

    #[test]
    fn arrival_announced_after_the_uid_list() {
        let (h, mut m) = selecting(MemoryCache::new());
        select_ok(&h, 3, 4);
        m.poll();
        h.server(&format!(
            "* SEARCH 1 2 3\r\n* 4 EXISTS\r\n{} OK done\r\n",
            h.tag_of("UID SEARCH")
        ));
        m.poll();
        assert_eq!(m.network_policy(), NetworkPolicy::Online);
        assert_eq!(
            last_lines(&h, 2),
            vec!["UID FETCH 4:* (FLAGS)", "FETCH 1:4 (UID FLAGS)"]
        );

        h.server(&format!(
            "* 4 FETCH (UID 4 FLAGS ())\r\n{} OK done\r\n",
            h.tag_of("UID FETCH 4:*")
        ));
        let mut flags = String::new();
        for seq in 1..=4 {
            flags.push_str(&format!("* {} FETCH (UID {} FLAGS ())\r\n", seq, seq));
        }
        h.server(&format!("{}{} OK done\r\n", flags, h.tag_of("FETCH 1:4")));
        m.poll();
        let inbox = m.tree().find("INBOX").unwrap();
        assert_eq!(m.tree().uids(inbox), vec![1, 2, 3, 4]);
        assert!(m.maintaining_task("INBOX").is_some());
        assert!(no_connection_errors(&m));
    }

    #[test]
    fn flags_only_resync_asks_for_missing_uids() {
        let mut cache = MemoryCache::new();
        cache.set_mailbox_sync_state("INBOX", &state(3, 4, 1));
        cache.set_uid_mapping("INBOX", &[1, 0, 3]);
        let (h, mut m) = selecting(cache);
        select_ok(&h, 3, 4);
        m.poll();
        assert_eq!(last_lines(&h, 1), vec!["FETCH 1:3 (UID FLAGS)"]);

        h.server(&format!(
            "* 1 FETCH (UID 1 FLAGS ())\r\n* 2 FETCH (UID 2 FLAGS (\\Seen))\r\n\
             * 3 FETCH (UID 3 FLAGS ())\r\n{} OK done\r\n",
            h.tag_of("FETCH 1:3")
        ));
        m.poll();
        let inbox = m.tree().find("INBOX").unwrap();
        assert_eq!(m.tree().uids(inbox), vec![1, 2, 3]);
        assert_eq!(m.tree().messages(inbox)[1].flags(), &[Flag::Seen][..]);
        assert!(m.maintaining_task("INBOX").is_some());
    }

    #[test]
    fn complete_list_asks_for_flags_only() {
        let (h, mut m) = selecting(MemoryCache::new());
        select_ok(&h, 2, 3);
        m.poll();
        h.server(&format!("* SEARCH 1 2\r\n{} OK done\r\n", h.tag_of("UID SEARCH")));
        m.poll();
        assert_eq!(last_lines(&h, 1), vec!["FETCH 1:2 (FLAGS)"]);
    }

    #[test]
    fn every_combination_has_a_strategy() {
        for old_exists in 0..4 {
            for new_exists in 0..4 {
                for old_next in 1..5 {
                    for new_next in 1..5 {
                        let old = state(old_exists, old_next, 7);
                        let new = state(new_exists, new_next, 7);
                        let s = SyncStrategy::choose(&old, &new, old_exists as usize, 0);
                        if new_exists == 0 {
                            assert_eq!(s, SyncStrategy::Empty);
                        }
                        if s == SyncStrategy::OnlyAdditions {
                            assert!(new_exists > old_exists);
                        }
                    }
                }
            }
        }
    }
}
