use std::collections::{BTreeMap, BTreeSet};

use super::idle::IdleLauncher;
use super::{
    FetchMsgMetadataTask, FetchMsgPartTask, ImapTask, NoopTask, TaskKind, TimerKind, UnSelectTask,
};
use crate::error::Result;
use crate::model::Model;
use crate::parser::Command;
use crate::types::{
    ConnId, Event, FetchResponse, Flag, MailboxId, NumberResponse, RespCode, Sequence, StateKind,
    StateResponse, Tag, TaskId, Uid,
};

/// Leave `IDLE` on `conn`, if the owner of its mailbox is idling there.
///
/// Tasks call this before sending anything on a connection they did not get from the mailbox
/// owner.
pub(crate) fn break_possible_idle(model: &mut Model, conn: ConnId) {
    let kmo = match model.conn(conn).and_then(|c| c.maintaining_task) {
        Some(kmo) => kmo,
        None => return,
    };
    let r = model.with_task(kmo, |t, m| match t.as_keep_mailbox_open() {
        Some(k) => k.break_idle(m, kmo),
        None => Ok(()),
    });
    if let Some(Err(e)) = r {
        model.task_error(kmo, e);
    }
}

/// Owns a selected mailbox: keeps it in sync with server pushes and schedules every task that
/// needs it.
///
/// The task is created as the dependent of the `ObtainSynchronizedMailbox` which selects the
/// mailbox, and starts once the mailbox is synchronized. Afterwards it never finishes on its own.
/// When another mailbox wants the connection, the `ObtainSynchronizedMailbox` of that mailbox is
/// added as a dependent here; this task then stops accepting work, waits until everything it
/// started is done and hands the connection over.
///
/// Downloads of envelopes and body parts are requested through
/// [`request_envelope_download`](Self::request_envelope_download) and
/// [`request_part_download`](Self::request_part_download). Requests arriving within a short
/// window are merged into as few `FETCH` commands as the configured limits allow.
#[derive(Debug)]
pub(crate) struct KeepMailboxOpenTask {
    mailbox: MailboxId,
    running: bool,
    should_exit: bool,
    terminated: bool,
    /// Mailbox owners-to-be waiting for this one to leave.
    waiting_obtains: Vec<TaskId>,
    /// Queued tasks which need the mailbox selected.
    for_mailbox: Vec<TaskId>,
    /// Queued tasks which only need the connection.
    no_mailbox: Vec<TaskId>,
    running_tasks: Vec<TaskId>,
    fetch_part_tasks: Vec<TaskId>,
    fetch_metadata_tasks: Vec<TaskId>,
    requested_parts: BTreeMap<Uid, BTreeSet<String>>,
    requested_part_sizes: BTreeMap<Uid, u64>,
    requested_envelopes: Vec<Uid>,
    new_arrivals: Vec<Tag>,
    idle: Option<IdleLauncher>,
    should_run_noop: bool,
    unselect: Option<TaskId>,
}

impl KeepMailboxOpenTask {
    pub(crate) fn new(mailbox: MailboxId) -> Self {
        KeepMailboxOpenTask {
            mailbox,
            running: false,
            should_exit: false,
            terminated: false,
            waiting_obtains: Vec::new(),
            for_mailbox: Vec::new(),
            no_mailbox: Vec::new(),
            running_tasks: Vec::new(),
            fetch_part_tasks: Vec::new(),
            fetch_metadata_tasks: Vec::new(),
            requested_parts: BTreeMap::new(),
            requested_part_sizes: BTreeMap::new(),
            requested_envelopes: Vec::new(),
            new_arrivals: Vec::new(),
            idle: None,
            should_run_noop: false,
            unselect: None,
        }
    }

    /// The task is winding down and takes no more work.
    pub(crate) fn should_exit(&self) -> bool {
        self.should_exit
    }

    /// Queue the download of the envelope of `uid`.
    pub(crate) fn request_envelope_download(&mut self, model: &mut Model, me: TaskId, uid: Uid) {
        if !self.requested_envelopes.contains(&uid) {
            self.requested_envelopes.push(uid);
        }
        if !model.timer_active(me, TimerKind::FetchEnvelopes) {
            let delay = model.config().delayed_envelope_fetch;
            model.start_timer(me, TimerKind::FetchEnvelopes, delay);
        }
    }

    /// Queue the download of one body part of `uid`.
    pub(crate) fn request_part_download(
        &mut self,
        model: &mut Model,
        me: TaskId,
        uid: Uid,
        part_id: String,
        estimated_size: u64,
    ) {
        if let Some(offset) = model.tree.message_by_uid(self.mailbox, uid).map(|(o, _)| o) {
            model.tree.set_part_loading(self.mailbox, offset, &part_id, true);
        }
        if self.requested_parts.entry(uid).or_default().insert(part_id) {
            *self.requested_part_sizes.entry(uid).or_insert(0) += estimated_size;
        }
        if !model.timer_active(me, TimerKind::FetchParts) {
            let delay = model.config().delayed_part_fetch;
            model.start_timer(me, TimerKind::FetchParts, delay);
        }
    }

    pub(crate) fn break_idle(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if let Some(ref mut idle) = self.idle {
            let conn = model.conn_of(me)?;
            idle.finish(model, me, conn)?;
        }
        Ok(())
    }

    fn is_known(&self, task: TaskId) -> bool {
        self.waiting_obtains.contains(&task)
            || self.for_mailbox.contains(&task)
            || self.no_mailbox.contains(&task)
            || self.running_tasks.contains(&task)
    }

    /// Sort dependents added since the last look into the queues.
    fn adopt_dependents(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let mut obtain_arrived = false;
        for task in model.core(me).dependents.clone() {
            if self.is_known(task) {
                continue;
            }
            match model.core(task).kind {
                TaskKind::ObtainSynchronizedMailbox => {
                    log::debug!("{}: {} wants the connection", me, task);
                    self.waiting_obtains.push(task);
                    obtain_arrived = true;
                }
                kind if kind.needs_mailbox() => self.for_mailbox.push(task),
                _ => self.no_mailbox.push(task),
            }
        }
        if obtain_arrived && self.running {
            self.should_exit = true;
            self.break_idle(model, me)?;
            self.flush_envelopes(model, me);
            self.flush_parts(model, me);
            let abortable: Vec<TaskId> = self
                .fetch_metadata_tasks
                .iter()
                .chain(self.running_tasks.iter())
                .copied()
                .filter(|&t| {
                    let kind = model.core(t).kind;
                    kind == TaskKind::FetchMsgMetadata || model.core(t).idle_compatible
                })
                .collect();
            for task in abortable {
                model.abort_task(task);
            }
        } else if obtain_arrived {
            self.should_exit = true;
        }
        Ok(())
    }

    fn prune(&mut self, model: &Model) {
        let alive = |t: &TaskId| !model.core(*t).finished;
        self.waiting_obtains.retain(alive);
        self.for_mailbox.retain(alive);
        self.no_mailbox.retain(alive);
        self.running_tasks.retain(alive);
        self.fetch_part_tasks.retain(alive);
        self.fetch_metadata_tasks.retain(alive);
    }

    fn queue(&mut self, model: &mut Model, me: TaskId, task: TaskId) {
        self.for_mailbox.push(task);
        model.add_dependent(me, task);
    }

    fn flush_envelopes(&mut self, model: &mut Model, me: TaskId) {
        model.stop_timer(me, TimerKind::FetchEnvelopes);
        let limit = model.config().max_messages_per_fetch.max(1);
        while !self.requested_envelopes.is_empty() {
            let n = if self.should_exit {
                self.requested_envelopes.len()
            } else {
                self.requested_envelopes.len().min(limit)
            };
            let uids: Vec<Uid> = self.requested_envelopes.drain(..n).collect();
            log::debug!("{}: fetching envelopes of {} messages", me, uids.len());
            let task = model.create_task(
                TaskKind::FetchMsgMetadata,
                Box::new(FetchMsgMetadataTask::new(self.mailbox, uids)),
            );
            self.fetch_metadata_tasks.push(task);
            self.queue(model, me, task);
            if !self.should_exit {
                break;
            }
        }
        if !self.requested_envelopes.is_empty() {
            let delay = model.config().delayed_envelope_fetch;
            model.start_timer(me, TimerKind::FetchEnvelopes, delay);
        }
    }

    /// Merge consecutive messages asking for the same parts into one `FETCH`, within the
    /// configured message and byte limits.
    fn flush_parts(&mut self, model: &mut Model, me: TaskId) {
        model.stop_timer(me, TimerKind::FetchParts);
        let limit_messages = model.config().max_messages_per_fetch.max(1);
        let limit_bytes = model.config().max_bytes_per_fetch;
        let max_parallel = model.config().max_parallel_part_fetches.max(1);

        while !self.requested_parts.is_empty()
            && (self.should_exit || self.fetch_part_tasks.len() < max_parallel)
        {
            let mut uids = Vec::new();
            let mut parts: Option<BTreeSet<String>> = None;
            let mut size = 0u64;
            while let Some((&uid, wanted)) = self.requested_parts.iter().next() {
                if parts.as_ref().map(|p| p != wanted).unwrap_or(false) {
                    break;
                }
                let part_size = self.requested_part_sizes.get(&uid).copied().unwrap_or(0);
                if !uids.is_empty()
                    && (uids.len() >= limit_messages || size.saturating_add(part_size) > limit_bytes)
                {
                    break;
                }
                let wanted = wanted.clone();
                self.requested_parts.remove(&uid);
                self.requested_part_sizes.remove(&uid);
                uids.push(uid);
                size = size.saturating_add(part_size);
                parts = Some(wanted);
            }
            let parts: Vec<String> = parts.unwrap_or_default().into_iter().collect();
            log::debug!(
                "{}: fetching parts {:?} of {} messages, about {} bytes",
                me,
                parts,
                uids.len(),
                size
            );
            let task = model.create_task(
                TaskKind::FetchMsgPart,
                Box::new(FetchMsgPartTask::new(self.mailbox, uids, parts)),
            );
            self.fetch_part_tasks.push(task);
            self.queue(model, me, task);
        }
    }

    /// Start queued tasks while the connection has room for them.
    fn activate_tasks(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if self.for_mailbox.is_empty() && self.no_mailbox.is_empty() {
            return Ok(());
        }
        let conn = model.conn_of(me)?;
        self.break_idle(model, me)?;
        let limit = model.config().max_active_tasks.max(1);
        let room = |model: &Model| {
            model
                .conn(conn)
                .map(|c| c.active_tasks.len() < limit)
                .unwrap_or(false)
        };
        while !self.for_mailbox.is_empty() && room(model) {
            let task = self.for_mailbox.remove(0);
            self.running_tasks.push(task);
            start_dependent(model, me, task, conn);
        }
        while !self.no_mailbox.is_empty() && room(model) {
            let task = self.no_mailbox.remove(0);
            start_dependent(model, me, task, conn);
        }
        Ok(())
    }

    fn has_pending_internal_actions(&self) -> bool {
        !self.for_mailbox.is_empty()
            || !self.no_mailbox.is_empty()
            || !self.running_tasks.is_empty()
            || !self.requested_parts.is_empty()
            || !self.requested_envelopes.is_empty()
            || !self.new_arrivals.is_empty()
            || self
                .idle
                .as_ref()
                .map(|i| i.waiting_for_termination())
                .unwrap_or(false)
    }

    fn is_ready_to_terminate(&self) -> bool {
        self.should_exit && !self.has_pending_internal_actions()
    }

    fn can_run_idle(&self, model: &Model, me: TaskId) -> bool {
        if self.idle.is_none()
            || self.should_exit
            || !self.for_mailbox.is_empty()
            || !self.no_mailbox.is_empty()
            || !self.new_arrivals.is_empty()
        {
            return false;
        }
        let conn = match model.core(me).conn.and_then(|c| model.conn(c)) {
            Some(c) => c,
            None => return false,
        };
        conn.active_tasks
            .iter()
            .all(|&t| t == me || model.core(t).idle_compatible)
    }

    /// Re-check everything after some change.
    fn reconcile(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if !self.running || self.terminated || model.core(me).finished {
            return Ok(());
        }
        self.adopt_dependents(model, me)?;
        self.prune(model);
        if self.is_ready_to_terminate() {
            return self.terminate(model, me);
        }
        self.activate_tasks(model, me)?;

        let config = model.config().clone();
        if !self.requested_parts.is_empty()
            && self.fetch_part_tasks.len() < config.max_parallel_part_fetches.max(1)
            && !model.timer_active(me, TimerKind::FetchParts)
        {
            model.start_timer(me, TimerKind::FetchParts, config.delayed_part_fetch);
        }
        if !self.requested_envelopes.is_empty() && !model.timer_active(me, TimerKind::FetchEnvelopes)
        {
            model.start_timer(me, TimerKind::FetchEnvelopes, config.delayed_envelope_fetch);
        }
        // armed once per interval; activity of other tasks must not postpone the poll
        if self.should_run_noop && !self.should_exit && !model.timer_active(me, TimerKind::Noop) {
            model.start_timer(me, TimerKind::Noop, config.noop_interval);
        }
        if self.can_run_idle(model, me) {
            if let Some(ref mut idle) = self.idle {
                idle.enter_later(model, me);
            }
        }
        Ok(())
    }

    /// Hand the connection over to the first waiting mailbox and finish.
    fn terminate(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        self.terminated = true;
        self.running = false;
        if let Some(mut idle) = self.idle.take() {
            idle.die(model, me);
        }
        for kind in [TimerKind::Noop, TimerKind::FetchParts, TimerKind::FetchEnvelopes] {
            model.stop_timer(me, kind);
        }
        self.detach(model, me);
        let conn = model.conn_of(me)?;

        if !self.waiting_obtains.is_empty() {
            let first = self.waiting_obtains.remove(0);
            model.core_mut(me).dependents.retain(|&d| d != first);
            model.core_mut(first).parent = None;
            let next = model.kmo_of_obtain(first);
            if let Some(next) = next {
                for other in self.waiting_obtains.drain(..) {
                    model.move_dependent(other, next);
                }
            }
            if let Some(c) = model.conn_mut(conn) {
                c.maintaining_task = next;
            }
            log::debug!("{}: handing {} over to {}", me, conn, first);
            model.activate(first, conn);
        }
        model.task_completed(me);
        Ok(())
    }

    fn detach(&self, model: &mut Model, me: TaskId) {
        if model.tree.maintaining(self.mailbox) == Some(me) {
            model.tree.set_maintaining(self.mailbox, None);
        }
    }

    /// Leave a mailbox which was deleted meanwhile.
    ///
    /// Returns `true` when the mailbox is gone.
    fn die_if_invalid_mailbox(&mut self, model: &mut Model, me: TaskId) -> Result<bool> {
        if model.tree.is_valid(self.mailbox) {
            return Ok(false);
        }
        if self.unselect.is_none() {
            log::info!("{}: the mailbox is gone, leaving it", me);
            let conn = model.conn_of(me)?;
            self.break_idle(model, me)?;
            let unselect = model.create_task(TaskKind::UnSelect, Box::new(UnSelectTask::new()));
            model.core_mut(unselect).owner = Some(me);
            self.unselect = Some(unselect);
            model.activate_first(unselect, conn);
        }
        Ok(true)
    }

    fn fetch_new_arrivals(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let conn = model.conn_of(me)?;
        let uid_next = model
            .tree
            .mailbox(self.mailbox)
            .and_then(|m| m.sync_state().uid_next)
            .unwrap_or(0);
        let highest = model.tree.highest_known_uid(self.mailbox).unwrap_or(0);
        let start = uid_next.max(highest + 1).max(1);
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

    /// Persist the sync state unless some messages still wait for their UIDs.
    fn save_sync_state(&self, model: &mut Model) {
        if model.tree.messages(self.mailbox).iter().any(|m| m.uid() == 0) {
            return;
        }
        model
            .tree
            .save_sync_state_and_uids(self.mailbox, model.cache.as_mut());
    }
}

fn start_dependent(model: &mut Model, me: TaskId, task: TaskId, conn: ConnId) {
    model.core_mut(me).dependents.retain(|&d| d != task);
    let core = model.core_mut(task);
    core.parent = None;
    core.owner = Some(me);
    model.activate(task, conn);
}

impl ImapTask for KeepMailboxOpenTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let conn = model.conn_of(me)?;
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "The mailbox went missing");
            return Ok(());
        }
        self.running = true;
        if let Some(c) = model.conn_mut(conn) {
            c.maintaining_task = Some(me);
        }
        if model.tree.maintaining(self.mailbox).is_none() {
            model.tree.set_maintaining(self.mailbox, Some(me));
        }
        if model.has_capability(conn, "IDLE") {
            self.idle = Some(IdleLauncher::new());
        } else {
            self.should_run_noop = true;
        }
        self.reconcile(model, me)
    }

    fn run_ready(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if let Some(unselect) = self.unselect {
            if model.core(unselect).finished {
                self.unselect = None;
                if self.waiting_obtains.is_empty() {
                    model.task_failed(me, "Mailbox disappeared");
                } else {
                    self.should_exit = true;
                    self.for_mailbox.clear();
                    self.requested_parts.clear();
                    self.requested_envelopes.clear();
                    self.new_arrivals.clear();
                    self.terminate(model, me)?;
                }
                return Ok(());
            }
        }
        self.reconcile(model, me)
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !self.running {
            return Ok(false);
        }
        let tag = match resp.tag {
            Some(ref tag) => tag,
            None => {
                let code = match resp.code {
                    Some(ref code) => code,
                    None => return Ok(false),
                };
                let state = match model.tree.sync_state_mut(self.mailbox) {
                    Some(state) => state,
                    None => return Ok(false),
                };
                match code {
                    RespCode::UidNext(n) => {
                        state.uid_next = Some(*n);
                        self.save_sync_state(model);
                    }
                    RespCode::PermanentFlags(flags) => state.permanent_flags = flags.clone(),
                    RespCode::HighestModSeq(n) => {
                        state.highest_mod_seq = Some(*n);
                        self.save_sync_state(model);
                    }
                    RespCode::Unseen(n) => state.unseen_offset = Some(*n),
                    RespCode::UidValidity(n) => {
                        if state.uid_validity != Some(*n) {
                            let conn = model.conn_of(me)?;
                            log::error!("{}: UIDVALIDITY changed to {} while open", me, n);
                            model.emit(Event::ConnectionError {
                                conn,
                                message: "The UIDVALIDITY has changed while mailbox is open. \
                                          Please reconnect."
                                    .to_string(),
                            });
                            model.go_offline();
                        }
                    }
                    _ => return Ok(false),
                }
                return Ok(true);
            }
        };

        if self.idle.as_ref().map(|i| i.is_idle_tag(tag)).unwrap_or(false) {
            if resp.kind == StateKind::Ok {
                if let Some(ref mut idle) = self.idle {
                    idle.completed(model, me);
                }
            } else {
                log::warn!("{}: The IDLE command has failed, polling instead", me);
                if let Some(mut idle) = self.idle.take() {
                    idle.completed(model, me);
                    idle.die(model, me);
                }
                self.should_run_noop = true;
            }
            self.reconcile(model, me)?;
            Ok(true)
        } else if let Some(pos) = self.new_arrivals.iter().position(|t| t == tag) {
            self.new_arrivals.remove(pos);
            if resp.kind != StateKind::Ok {
                log::warn!("{}: UID discovery of new arrivals has failed: {}", me, resp.message);
            }
            if self.new_arrivals.is_empty() {
                self.save_sync_state(model);
            }
            self.reconcile(model, me)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn handle_number(&mut self, model: &mut Model, me: TaskId, resp: NumberResponse) -> Result<bool> {
        if !self.running {
            return Ok(false);
        }
        if self.die_if_invalid_mailbox(model, me)? {
            return Ok(true);
        }
        match resp {
            NumberResponse::Exists(n) => {
                if n as usize == model.tree.messages(self.mailbox).len() {
                    return Ok(true);
                }
                model.tree.handle_exists(self.mailbox, n)?;
                self.break_idle(model, me)?;
                self.fetch_new_arrivals(model, me)?;
            }
            NumberResponse::Expunge(seq) => {
                model
                    .tree
                    .handle_expunge(self.mailbox, seq, model.cache.as_mut())?;
                if let Some(state) = model.tree.sync_state_mut(self.mailbox) {
                    state.exists = Some(state.exists_or_zero().saturating_sub(1));
                }
                self.save_sync_state(model);
            }
            NumberResponse::Recent(n) => {
                if let Some(state) = model.tree.sync_state_mut(self.mailbox) {
                    state.recent = Some(n);
                }
                model.tree.message_count_changed(self.mailbox);
                self.save_sync_state(model);
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
        if !self.running {
            return Ok(false);
        }
        if self.die_if_invalid_mailbox(model, me)? {
            return Ok(true);
        }
        if !earlier {
            model
                .tree
                .handle_vanished(self.mailbox, uids, model.cache.as_mut());
            self.save_sync_state(model);
        }
        Ok(true)
    }

    fn handle_fetch(&mut self, model: &mut Model, me: TaskId, resp: &FetchResponse) -> Result<bool> {
        if !self.running {
            return Ok(false);
        }
        if self.die_if_invalid_mailbox(model, me)? {
            return Ok(true);
        }
        model
            .tree
            .handle_fetch(self.mailbox, resp, model.cache.as_mut())?;
        if let Some(uid) = resp.uid {
            if let Some(state) = model.tree.sync_state_mut(self.mailbox) {
                if state.uid_next.map(|n| uid >= n).unwrap_or(true) {
                    state.uid_next = Some(uid + 1);
                }
            }
        }
        Ok(true)
    }

    fn handle_flags(&mut self, model: &mut Model, _me: TaskId, flags: &[Flag<'static>]) -> Result<bool> {
        if !self.running {
            return Ok(false);
        }
        if let Some(state) = model.tree.sync_state_mut(self.mailbox) {
            state.flags = flags.to_vec();
        }
        Ok(true)
    }

    fn on_timer(&mut self, model: &mut Model, me: TaskId, kind: TimerKind) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        match kind {
            TimerKind::FetchParts => self.flush_parts(model, me),
            TimerKind::FetchEnvelopes => self.flush_envelopes(model, me),
            TimerKind::Noop => {
                if self.running && !self.should_exit {
                    let task = model.create_task(
                        TaskKind::Noop,
                        Box::new(NoopTask::new(Some(self.mailbox))),
                    );
                    self.queue(model, me, task);
                }
            }
            TimerKind::IdleEnter => {
                if self.running && self.can_run_idle(model, me) {
                    let conn = model.conn_of(me)?;
                    if let Some(ref mut idle) = self.idle {
                        idle.enter_now(model, me, conn)?;
                    }
                }
            }
            TimerKind::IdleRenewal => {
                log::debug!("{}: renewing IDLE", me);
                self.break_idle(model, me)?;
            }
        }
        self.reconcile(model, me)
    }

    fn die(&mut self, model: &mut Model, me: TaskId, reason: &str) {
        if let Some(mut idle) = self.idle.take() {
            idle.die(model, me);
        }
        self.detach(model, me);
        model.task_failed(me, reason);
    }

    fn as_keep_mailbox_open(&mut self) -> Option<&mut KeepMailboxOpenTask> {
        Some(self)
    }

    fn as_keep_mailbox_open_ref(&self) -> Option<&KeepMailboxOpenTask> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::cache::{Cache, MemoryCache};
    use crate::config::EngineConfig;
    use crate::model::Model;
    use crate::tasks::TaskKind;
    use crate::testing::{synchronize, ScriptHandle, ScriptedConnector};
    use crate::types::{Event, NetworkPolicy, TaskState, Uid};

    fn opened(caps: &str, config: EngineConfig, uids: &[Uid]) -> (ScriptHandle, Model) {
        let connector = ScriptedConnector::new()
            .with_greeting(&format!("* PREAUTH [CAPABILITY IMAP4rev1{}] hi\r\n", caps));
        let mut m = Model::new(config, MemoryCache::new(), connector.clone());
        m.open_mailbox("INBOX").unwrap();
        m.poll();
        let h = connector.connection(0);
        synchronize(&mut m, &h, uids);
        (h, m)
    }

    fn after(m: &mut Model, delay: Duration) {
        let at = m.now() + delay;
        m.tick(at);
    }

    fn last(h: &ScriptHandle) -> Option<String> {
        h.sent_lines().last().cloned()
    }

    fn count(h: &ScriptHandle, prefix: &str) -> usize {
        h.sent_lines()
            .iter()
            .filter(|l| l.starts_with(prefix))
            .count()
    }

    fn inbox_uids(m: &Model) -> Vec<Uid> {
        m.tree().uids(m.tree().find("INBOX").unwrap())
    }

    #[test]
    fn idle_once_quiet() {
        let (h, mut m) = opened(" IDLE", EngineConfig::default(), &[1, 2]);
        assert_eq!(count(&h, "IDLE"), 0);
        after(&mut m, Duration::from_secs(3));
        assert_eq!(count(&h, "IDLE"), 0);
        after(&mut m, Duration::from_secs(4));
        assert_eq!(last(&h).as_deref(), Some("IDLE"));
    }

    #[test]
    fn new_work_ends_idle() {
        let (h, mut m) = opened(" IDLE", EngineConfig::default(), &[1, 2]);
        after(&mut m, Duration::from_secs(7));
        assert_eq!(last(&h).as_deref(), Some("IDLE"));

        let noop = m.noop("INBOX").unwrap();
        let lines = h.sent_lines();
        assert_eq!(&lines[lines.len() - 3..], &["IDLE", "DONE", "NOOP"]);

        h.server(&format!(
            "{} OK IDLE terminated\r\n{} OK noop\r\n",
            h.tag_of("IDLE"),
            h.tag_of("NOOP")
        ));
        m.poll();
        assert_eq!(m.task_state(noop), Some(TaskState::Completed));
        after(&mut m, Duration::from_secs(7));
        assert_eq!(last(&h).as_deref(), Some("IDLE"));
        assert_eq!(count(&h, "IDLE"), 2);
    }

    #[test]
    fn idle_is_renewed() {
        let config = EngineConfig::default().with_idle_renewal(Duration::from_secs(600));
        let (h, mut m) = opened(" IDLE", config, &[1]);
        after(&mut m, Duration::from_secs(7));
        assert_eq!(count(&h, "IDLE"), 1);

        after(&mut m, Duration::from_secs(599));
        assert_eq!(count(&h, "DONE"), 0);
        after(&mut m, Duration::from_secs(2));
        assert_eq!(last(&h).as_deref(), Some("DONE"));

        h.server(&format!("{} OK IDLE terminated\r\n", h.tag_of("IDLE")));
        m.poll();
        after(&mut m, Duration::from_secs(7));
        assert_eq!(count(&h, "IDLE"), 2);
    }

    #[test]
    fn failed_idle_falls_back_to_polling() {
        let config = EngineConfig::default().with_noop_interval(Duration::from_secs(60));
        let (h, mut m) = opened(" IDLE", config, &[1]);
        after(&mut m, Duration::from_secs(7));
        h.server(&format!("{} BAD no idling here\r\n", h.tag_of("IDLE")));
        m.poll();
        after(&mut m, Duration::from_secs(61));
        assert_eq!(last(&h).as_deref(), Some("NOOP"));
        assert_eq!(count(&h, "IDLE"), 1);
    }

    #[test]
    fn polls_without_idle() {
        let config = EngineConfig::default().with_noop_interval(Duration::from_secs(60));
        let (h, mut m) = opened("", config, &[1]);
        after(&mut m, Duration::from_secs(7));
        assert_eq!(count(&h, "IDLE"), 0);
        assert_eq!(count(&h, "NOOP"), 0);
        after(&mut m, Duration::from_secs(54));
        assert_eq!(last(&h).as_deref(), Some("NOOP"));
        assert_eq!(m.tasks_of_kind(TaskKind::Noop).len(), 1);
    }

    #[test]
    fn activity_does_not_postpone_polling() {
        let config = EngineConfig::default().with_noop_interval(Duration::from_secs(60));
        let (h, mut m) = opened("", config, &[1, 2]);
        let start = m.now();

        m.tick(start + Duration::from_secs(40));
        let fetch = m.fetch_message_metadata("INBOX", vec![1]).unwrap();
        h.server(&format!("{} OK fetched\r\n", h.tag_of("UID FETCH 1 ")));
        m.tick(start + Duration::from_secs(41));
        assert_eq!(m.task_state(fetch), Some(TaskState::Completed));
        assert_eq!(count(&h, "NOOP"), 0);

        m.tick(start + Duration::from_secs(61));
        assert_eq!(last(&h).as_deref(), Some("NOOP"));
    }

    #[test]
    fn active_tasks_are_capped() {
        // the mailbox owner itself takes one of the two slots
        let config = EngineConfig::default().with_max_active_tasks(2);
        let (h, mut m) = opened("", config, &[1, 2, 3]);
        let tasks: Vec<_> = (1..=3)
            .map(|uid| m.fetch_message_metadata("INBOX", vec![uid]).unwrap())
            .collect();
        assert_eq!(count(&h, "UID FETCH"), 1);
        assert_eq!(m.task_state(tasks[1]), Some(TaskState::Pending));

        h.server(&format!("{} OK fetched\r\n", h.tag_of("UID FETCH 1 ")));
        m.poll();
        assert_eq!(m.task_state(tasks[0]), Some(TaskState::Completed));
        assert_eq!(count(&h, "UID FETCH"), 2);
        assert!(last(&h).unwrap().starts_with("UID FETCH 2 "));
    }

    #[test]
    fn envelope_requests_wait_for_the_batch_timer() {
        let config =
            EngineConfig::default().with_delayed_envelope_fetch(Duration::from_millis(200));
        let (h, mut m) = opened("", config, &[1, 2, 3]);
        m.request_envelope_download("INBOX", 1).unwrap();
        m.request_envelope_download("INBOX", 2).unwrap();
        m.request_envelope_download("INBOX", 1).unwrap();

        after(&mut m, Duration::from_millis(100));
        assert!(m.tasks_of_kind(TaskKind::FetchMsgMetadata).is_empty());
        after(&mut m, Duration::from_millis(150));
        assert_eq!(m.tasks_of_kind(TaskKind::FetchMsgMetadata).len(), 1);
        assert_eq!(
            last(&h).as_deref(),
            Some("UID FETCH 1:2 (ENVELOPE INTERNALDATE BODYSTRUCTURE RFC822.SIZE)")
        );
    }

    #[test]
    fn handover_flushes_pending_requests() {
        let (h, mut m) = opened("", EngineConfig::default(), &[1, 2]);
        m.request_part_download("INBOX", 1, "1", 10).unwrap();
        m.request_envelope_download("INBOX", 2).unwrap();
        assert!(m.tasks_of_kind(TaskKind::FetchMsgPart).is_empty());

        m.open_mailbox("Work").unwrap();
        assert_eq!(m.tasks_of_kind(TaskKind::FetchMsgPart).len(), 1);
        assert_eq!(m.tasks_of_kind(TaskKind::FetchMsgMetadata).len(), 1);
        assert!(h.sent_lines().contains(&"UID FETCH 1 (BODY.PEEK[1])".to_string()));
        assert_eq!(count(&h, "SELECT \"Work\""), 0);

        h.server(&format!(
            "* 1 FETCH (UID 1 BODY[1] \"hi\")\r\n{} OK done\r\n",
            h.tag_of("UID FETCH 1 (BODY")
        ));
        m.poll();
        assert_eq!(count(&h, "SELECT \"Work\""), 1);
        assert_eq!(m.maintaining_task("INBOX"), None);
    }

    #[test]
    fn arrivals_while_open_get_their_uids() {
        let (h, mut m) = opened("", EngineConfig::default(), &[1, 2, 3]);
        h.server("* 4 EXISTS\r\n");
        m.poll();
        assert_eq!(inbox_uids(&m), vec![1, 2, 3, 0]);
        assert_eq!(last(&h).as_deref(), Some("UID FETCH 4:* (FLAGS)"));

        h.server(&format!(
            "* 4 FETCH (UID 9 FLAGS ())\r\n{} OK done\r\n",
            h.tag_of("UID FETCH 4:*")
        ));
        m.poll();
        assert_eq!(inbox_uids(&m), vec![1, 2, 3, 9]);
        assert_eq!(m.cache().uid_mapping("INBOX"), vec![1, 2, 3, 9]);
    }

    #[test]
    fn expunge_while_open() {
        let (h, mut m) = opened("", EngineConfig::default(), &[1, 2, 3]);
        h.server("* 2 EXPUNGE\r\n");
        m.poll();
        assert_eq!(inbox_uids(&m), vec![1, 3]);
        assert_eq!(m.cache().uid_mapping("INBOX"), vec![1, 3]);
        let inbox = m.tree().find("INBOX").unwrap();
        assert_eq!(m.tree().mailbox(inbox).unwrap().sync_state().exists, Some(2));
    }

    #[test]
    fn vanished_while_open() {
        let (h, mut m) = opened("", EngineConfig::default(), &[4, 5, 6]);
        h.server("* VANISHED 4:5\r\n");
        m.poll();
        assert_eq!(inbox_uids(&m), vec![6]);
        assert_eq!(m.cache().uid_mapping("INBOX"), vec![6]);

        h.server("* VANISHED (EARLIER) 6\r\n");
        m.poll();
        assert_eq!(inbox_uids(&m), vec![6]);
    }

    #[test]
    fn changed_uidvalidity_while_open_goes_offline() {
        let (h, mut m) = opened("", EngineConfig::default(), &[1]);
        h.server("* OK [UIDVALIDITY 1] same\r\n");
        m.poll();
        assert_eq!(m.network_policy(), NetworkPolicy::Online);

        h.server("* OK [UIDVALIDITY 2] changed\r\n");
        m.poll();
        assert_eq!(m.network_policy(), NetworkPolicy::Offline);
        assert!(m
            .events()
            .try_iter()
            .any(|e| matches!(e, Event::ConnectionError { .. })));
    }
}
