use super::{check_abort_die, completes, ImapTask};
use crate::error::Result;
use crate::model::Model;
use crate::parser::Command;
use crate::types::{
    ConnectionState, FetchResponse, MailboxId, Sequence, StateKind, StateResponse, Tag, TaskId,
    Uid,
};

/// Downloads the same set of body parts of several messages with a single `UID FETCH`.
#[derive(Debug)]
pub(crate) struct FetchMsgPartTask {
    mailbox: MailboxId,
    uids: Vec<Uid>,
    parts: Vec<String>,
    tag: Option<Tag>,
}

impl FetchMsgPartTask {
    pub(crate) fn new(mailbox: MailboxId, uids: Vec<Uid>, parts: Vec<String>) -> Self {
        FetchMsgPartTask {
            mailbox,
            uids,
            parts,
            tag: None,
        }
    }

    /// Parts the server did not deliver are not loading anymore.
    fn finalize_parts(&self, model: &mut Model) {
        for &uid in &self.uids {
            let offset = match model.tree.message_by_uid(self.mailbox, uid) {
                Some((offset, _)) => offset,
                None => continue,
            };
            for part in &self.parts {
                log::trace!("Fetched part {} of UID {}", part, uid);
                model.tree.set_part_loading(self.mailbox, offset, part, false);
            }
        }
    }
}

impl ImapTask for FetchMsgPartTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            self.finalize_parts(model);
            return Ok(());
        }
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "Mailbox disappeared");
            return Ok(());
        }
        let sequence = match Sequence::from_list(self.uids.iter().copied()) {
            Some(sequence) if !self.parts.is_empty() => sequence,
            _ => {
                model.task_failed(me, "Nothing to fetch");
                return Ok(());
            }
        };
        let conn = model.conn_of(me)?;
        model.set_conn_state(conn, ConnectionState::FetchingPart);
        let items = self
            .parts
            .iter()
            .map(|p| format!("BODY.PEEK[{}]", p))
            .collect();
        self.tag = Some(model.send(conn, Command::UidFetch { sequence, items })?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "Mailbox disappeared");
            return Ok(true);
        }
        self.finalize_parts(model);
        if resp.kind == StateKind::Ok {
            log::debug!("{}: fetched parts {:?}", me, self.parts);
            let conn = model.conn_of(me)?;
            model.set_conn_state(conn, ConnectionState::Selected);
            model.task_completed(me);
        } else {
            model.task_failed(me, "Part fetch failed");
        }
        Ok(true)
    }

    fn handle_fetch(&mut self, model: &mut Model, me: TaskId, resp: &FetchResponse) -> Result<bool> {
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "Mailbox disappeared");
            return Ok(false);
        }
        model
            .tree
            .handle_fetch(self.mailbox, resp, model.cache.as_mut())?;
        Ok(true)
    }

    fn die(&mut self, model: &mut Model, me: TaskId, reason: &str) {
        self.finalize_parts(model);
        model.task_failed(me, reason);
    }
}
