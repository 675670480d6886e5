use super::keep_mailbox_open::break_possible_idle;
use super::{completes, ImapTask};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::parser::Command;
use crate::types::{
    ConnectionState, FetchResponse, Flag, NumberResponse, RespCode, StateKind, StateResponse, Tag,
    TaskId,
};
use crate::utils::random_mailbox_name;

/// Leaves the selected state without expunging anything.
///
/// Servers without `UNSELECT` are tricked into it by `EXAMINE`-ing a mailbox which does not
/// exist: the failed `EXAMINE` drops the previous selection. Everything the server still says
/// about the old mailbox meanwhile is swallowed.
#[derive(Debug, Default)]
pub(crate) struct UnSelectTask {
    unselect_cmd: Option<Tag>,
    examine_cmd: Option<Tag>,
}

impl UnSelectTask {
    pub(crate) fn new() -> Self {
        UnSelectTask::default()
    }

    fn fake_select(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let conn = model.conn_of(me)?;
        break_possible_idle(model, conn);
        self.examine_cmd = Some(model.send(conn, Command::Examine(random_mailbox_name()))?);
        Ok(())
    }

    fn unselected(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let conn = model.conn_of(me)?;
        if let Some(c) = model.conn_mut(conn) {
            c.selected_mailbox = None;
        }
        model.set_conn_state(conn, ConnectionState::Authenticated);
        model.task_completed(me);
        Ok(())
    }
}

impl ImapTask for UnSelectTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        // aborting is ignored, leaving the mailbox is too important
        if model.core(me).dead {
            model.task_failed(me, "Asked to die");
            return Ok(());
        }
        let conn = model.conn_of(me)?;
        if model.has_capability(conn, "UNSELECT") {
            break_possible_idle(model, conn);
            self.unselect_cmd = Some(model.send(conn, Command::Unselect)?);
            Ok(())
        } else {
            self.fake_select(model, me)
        }
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if resp.tag.is_none() {
            return Ok(matches!(
                resp.code,
                Some(RespCode::Unseen(_))
                    | Some(RespCode::PermanentFlags(_))
                    | Some(RespCode::UidNext(_))
                    | Some(RespCode::UidValidity(_))
                    | Some(RespCode::NoModSeq)
                    | Some(RespCode::HighestModSeq(_))
                    | Some(RespCode::Closed)
            ));
        }
        if completes(resp, &self.unselect_cmd) {
            if resp.kind != StateKind::Ok {
                return Err(Error::Mailbox(
                    "Attempted to unselect current mailbox, but the server denied our request. \
                     Can't continue, to avoid possible data corruption."
                        .to_string(),
                ));
            }
            self.unselected(model, me)?;
            Ok(true)
        } else if completes(resp, &self.examine_cmd) {
            if resp.kind == StateKind::Ok {
                log::warn!(
                    "The emergency EXAMINE command has unexpectedly succeeded, trying to get out of here..."
                );
                self.fake_select(model, me)?;
            } else {
                self.unselected(model, me)?;
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn handle_number(&mut self, _model: &mut Model, me: TaskId, resp: NumberResponse) -> Result<bool> {
        log::debug!("{}: ignoring {:?} while leaving the mailbox", me, resp);
        Ok(true)
    }

    fn handle_flags(&mut self, _model: &mut Model, me: TaskId, _flags: &[Flag<'static>]) -> Result<bool> {
        log::debug!("{}: ignoring FLAGS while leaving the mailbox", me);
        Ok(true)
    }

    fn handle_search(&mut self, _model: &mut Model, me: TaskId, _items: &[u32]) -> Result<bool> {
        log::debug!("{}: ignoring SEARCH while leaving the mailbox", me);
        Ok(true)
    }

    fn handle_fetch(&mut self, _model: &mut Model, me: TaskId, resp: &FetchResponse) -> Result<bool> {
        log::debug!("{}: ignoring FETCH of #{} while leaving the mailbox", me, resp.seq);
        Ok(true)
    }
}
