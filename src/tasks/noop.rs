use super::{check_abort_die, completes, ImapTask};
use crate::error::Result;
use crate::model::Model;
use crate::parser::Command;
use crate::types::{MailboxId, StateKind, StateResponse, Tag, TaskId};

/// `NOOP`, giving the server a chance to report what changed.
///
/// Whatever the server reports meanwhile is handled by the owner of the selected mailbox.
#[derive(Debug)]
pub(crate) struct NoopTask {
    mailbox: Option<MailboxId>,
    tag: Option<Tag>,
}

impl NoopTask {
    pub(crate) fn new(mailbox: Option<MailboxId>) -> Self {
        NoopTask { mailbox, tag: None }
    }
}

impl ImapTask for NoopTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        if let Some(mailbox) = self.mailbox {
            if !model.tree.is_valid(mailbox) {
                model.task_failed(me, "Mailbox disappeared");
                return Ok(());
            }
        }
        let conn = model.conn_of(me)?;
        self.tag = Some(model.send(conn, Command::Noop)?);
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if !completes(resp, &self.tag) {
            return Ok(false);
        }
        if resp.kind == StateKind::Ok {
            model.task_completed(me);
        } else {
            model.task_failed(me, &format!("NOOP failed: {}", resp.message));
        }
        Ok(true)
    }
}
