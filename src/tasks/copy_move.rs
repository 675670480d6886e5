use super::{check_abort_die, completes, ExpungeMessagesTask, ImapTask, TaskKind, UpdateFlagsTask};
use crate::error::Result;
use crate::model::Model;
use crate::parser::{Command, StoreMode};
use crate::types::{Flag, MailboxId, Sequence, StateKind, StateResponse, Tag, TaskId, Uid};

/// Whether the source messages stay where they are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyMoveOperation {
    /// Leave the originals alone.
    Copy,
    /// Remove the originals once the copy exists.
    Move,
}

/// `UID COPY` or `UID MOVE` of some messages into another mailbox.
///
/// Without the `MOVE` extension a move is a `COPY`, followed by marking the originals
/// `\Deleted` and, with `UIDPLUS`, a `UID EXPUNGE` of exactly those messages.
#[derive(Debug)]
pub(crate) struct CopyMoveMessagesTask {
    mailbox: MailboxId,
    uids: Vec<Uid>,
    target: String,
    op: CopyMoveOperation,
    copy_tag: Option<Tag>,
    move_tag: Option<Tag>,
}

impl CopyMoveMessagesTask {
    pub(crate) fn new(
        mailbox: MailboxId,
        uids: Vec<Uid>,
        target: String,
        op: CopyMoveOperation,
    ) -> Self {
        CopyMoveMessagesTask {
            mailbox,
            uids,
            target,
            op,
            copy_tag: None,
            move_tag: None,
        }
    }

    /// Queue the removal of the originals after a successful `COPY`.
    fn chain_removal(&self, model: &mut Model, me: TaskId) -> Result<()> {
        let conn = model.conn_of(me)?;
        let owner = model.core(me).owner;
        let flags = model.create_task(
            TaskKind::UpdateFlags,
            Box::new(UpdateFlagsTask::new(
                self.mailbox,
                self.uids.clone(),
                StoreMode::Add,
                vec![Flag::Deleted],
            )),
        );
        if model.has_capability(conn, "UIDPLUS") {
            let expunge = model.create_task(
                TaskKind::ExpungeMessages,
                Box::new(ExpungeMessagesTask::new(self.mailbox, self.uids.clone())),
            );
            model.core_mut(expunge).owner = owner;
            model.add_dependent(flags, expunge);
        }
        // the owner of the mailbox runs the follow-up like any other queued request
        match owner {
            Some(kmo) if !model.core(kmo).finished => model.add_dependent(kmo, flags),
            _ => model.add_dependent(me, flags),
        }
        Ok(())
    }
}

impl ImapTask for CopyMoveMessagesTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        if !model.tree.is_valid(self.mailbox) {
            model.task_failed(me, "Mailbox disappeared");
            return Ok(());
        }
        let before = self.uids.len();
        self.uids
            .retain(|&uid| model.tree.message_by_uid(self.mailbox, uid).is_some());
        if self.uids.len() != before {
            log::debug!("{}: Some message got removed before we could copy them", me);
        }
        let sequence = match Sequence::from_list(self.uids.iter().copied()) {
            Some(sequence) => sequence,
            None => {
                model.task_failed(me, "All messages disappeared before we could have copied them");
                return Ok(());
            }
        };
        let conn = model.conn_of(me)?;
        let mailbox = self.target.clone();
        if self.op == CopyMoveOperation::Move && model.has_capability(conn, "MOVE") {
            self.move_tag = Some(model.send(conn, Command::UidMove { sequence, mailbox })?);
        } else {
            self.copy_tag = Some(model.send(conn, Command::UidCopy { sequence, mailbox })?);
        }
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if completes(resp, &self.copy_tag) {
            if resp.kind != StateKind::Ok {
                model.task_failed(me, "The COPY operation has failed");
                return Ok(true);
            }
            if self.op == CopyMoveOperation::Move {
                if model.core(me).dead {
                    model.task_failed(me, "COPY succeeded, but cannot update flags due to received die()");
                    return Ok(true);
                }
                // an abort is ignored, the copy is visible already
                self.chain_removal(model, me)?;
            }
            model.task_completed(me);
            Ok(true)
        } else if completes(resp, &self.move_tag) {
            if resp.kind == StateKind::Ok {
                model.task_completed(me);
            } else {
                model.task_failed(me, "The UID MOVE operation has failed");
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn abort(&mut self, model: &mut Model, me: TaskId) {
        // nothing to abort once the command is out
        if self.copy_tag.is_none() && self.move_tag.is_none() {
            model.core_mut(me).aborted = true;
        }
    }

    fn die(&mut self, model: &mut Model, me: TaskId, reason: &str) {
        if self.copy_tag.is_some() && self.op == CopyMoveOperation::Move {
            log::warn!("{}: the COPY of a move may have succeeded, the originals stay", me);
            model.task_failed(
                me,
                &format!("COPY outcome unknown, cannot update flags due to received die(): {}", reason),
            );
        } else {
            model.task_failed(me, reason);
        }
    }
}
