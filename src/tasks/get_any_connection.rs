use super::{check_abort_die, ImapTask};
use crate::error::Result;
use crate::model::Model;
use crate::types::TaskId;

/// Completes as soon as it gets to run on some connection.
///
/// Mailbox-independent commands depend on this task instead of a mailbox owner. The model
/// places it behind whatever already occupies the connection: the task keeping a mailbox open
/// there, or the login still in progress.
#[derive(Debug, Default)]
pub(crate) struct GetAnyConnectionTask;

impl GetAnyConnectionTask {
    pub(crate) fn new() -> Self {
        GetAnyConnectionTask
    }
}

impl ImapTask for GetAnyConnectionTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        model.task_completed(me);
        Ok(())
    }
}
