//! Units of work the [`Model`](crate::Model) schedules onto connections.
//!
//! Every task lives in the model's task arena and is addressed by its [`TaskId`]. A task is
//! *pending* while it waits as a dependent of another task, *active* once it has been started
//! on a connection, and *finished* after it completed or failed. Finished tasks keep their
//! bookkeeping so that consumers can still ask how they ended.
//!
//! The protocol logic of a task is an [`ImapTask`] implementation. While one of its methods
//! runs, the behavior is taken out of the arena; the model is passed in by `&mut` so the task
//! can send commands, touch the mailbox tree and start or finish other tasks.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::Model;
use crate::types::{
    Capabilities, ConnId, ESearchResponse, FetchResponse, Flag, ListResponse, NamespaceResponse,
    NumberResponse, Response, StateResponse, StatusResponse, TaskId, ThreadNode, Uid,
};

mod append;
mod copy_move;
mod expunge;
mod fetch_msg_metadata;
mod fetch_msg_part;
mod get_any_connection;
mod idle;
mod keep_mailbox_open;
mod list_child_mailboxes;
mod mailbox_admin;
mod noop;
mod obtain_synchronized_mailbox;
mod open_connection;
mod session;
mod sort;
mod thread;
mod unselect;
mod update_flags;

pub(crate) use self::append::AppendTask;
pub use self::copy_move::CopyMoveOperation;
pub(crate) use self::copy_move::CopyMoveMessagesTask;
pub(crate) use self::expunge::{ExpungeMailboxTask, ExpungeMessagesTask};
pub(crate) use self::fetch_msg_metadata::FetchMsgMetadataTask;
pub(crate) use self::fetch_msg_part::FetchMsgPartTask;
pub(crate) use self::get_any_connection::GetAnyConnectionTask;
pub(crate) use self::keep_mailbox_open::KeepMailboxOpenTask;
pub(crate) use self::list_child_mailboxes::ListChildMailboxesTask;
pub use self::mailbox_admin::MailboxOperation;
pub(crate) use self::mailbox_admin::MailboxAdminTask;
pub(crate) use self::noop::NoopTask;
pub(crate) use self::obtain_synchronized_mailbox::ObtainSynchronizedMailboxTask;
pub(crate) use self::open_connection::OpenConnectionTask;
pub(crate) use self::session::{EnableTask, IdTask};
pub(crate) use self::sort::SortTask;
pub(crate) use self::thread::ThreadTask;
pub(crate) use self::unselect::UnSelectTask;
pub(crate) use self::update_flags::UpdateFlagsTask;

/// What a task does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TaskKind {
    /// Greeting, `STARTTLS`, capabilities and login on a fresh connection.
    OpenConnection,
    /// Waits until some connection is usable for a mailbox-independent command.
    GetAnyConnection,
    /// Owns a selected mailbox and schedules the work done in it.
    KeepMailboxOpen,
    /// `SELECT` and resynchronization of a mailbox.
    ObtainSynchronizedMailbox,
    /// Leaves the selected state without expunging.
    UnSelect,
    /// Downloads envelopes and body structures.
    FetchMsgMetadata,
    /// Downloads body parts.
    FetchMsgPart,
    /// `UID STORE`
    UpdateFlags,
    /// `UID COPY` or `UID MOVE`
    CopyMove,
    /// `EXPUNGE`
    Expunge,
    /// `UID EXPUNGE`
    ExpungeMessages,
    /// `LIST` of the children of a mailbox.
    ListChildMailboxes,
    /// `CREATE`
    CreateMailbox,
    /// `DELETE`
    DeleteMailbox,
    /// `SUBSCRIBE` or `UNSUBSCRIBE`
    SubscribeUnsubscribe,
    /// `UID SORT` or `UID SEARCH`
    Sort,
    /// `UID THREAD`
    Thread,
    /// `APPEND`
    Append,
    /// `ENABLE`
    Enable,
    /// `ID`
    Id,
    /// `NOOP`
    Noop,
}

impl TaskKind {
    /// Whether the task only makes sense with its mailbox selected.
    pub fn needs_mailbox(self) -> bool {
        matches!(
            self,
            TaskKind::FetchMsgMetadata
                | TaskKind::FetchMsgPart
                | TaskKind::UpdateFlags
                | TaskKind::CopyMove
                | TaskKind::Expunge
                | TaskKind::ExpungeMessages
                | TaskKind::Sort
                | TaskKind::Thread
                | TaskKind::Noop
        )
    }
}

/// The deadlines a task can ask the scheduler for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    FetchParts,
    FetchEnvelopes,
    Noop,
    IdleEnter,
    IdleRenewal,
}

/// Scheduler bookkeeping of one task, owned by the model.
#[derive(Debug)]
pub(crate) struct TaskCore {
    pub(crate) kind: TaskKind,
    /// The task this one waits for while pending.
    pub(crate) parent: Option<TaskId>,
    /// Tasks to start once this one completes.
    pub(crate) dependents: Vec<TaskId>,
    pub(crate) conn: Option<ConnId>,
    /// The mailbox owner which started this task; it hears about the task finishing.
    pub(crate) owner: Option<TaskId>,
    pub(crate) started: bool,
    pub(crate) finished: bool,
    pub(crate) dead: bool,
    pub(crate) aborted: bool,
    pub(crate) failure: Option<String>,
    /// Only waits for server pushes and does not keep the mailbox owner from idling.
    pub(crate) idle_compatible: bool,
}

impl TaskCore {
    pub(crate) fn new(kind: TaskKind) -> Self {
        TaskCore {
            kind,
            parent: None,
            dependents: Vec::new(),
            conn: None,
            owner: None,
            started: false,
            finished: false,
            dead: false,
            aborted: false,
            failure: None,
            idle_compatible: false,
        }
    }
}

/// The protocol logic of a task.
///
/// Response hooks return `Ok(true)` when they claimed the response; the first claimer among
/// the active tasks of a connection wins. An `Err` from any method is fatal for the
/// connection the task runs on.
pub(crate) trait ImapTask {
    /// Start talking to the server; called once, when the task becomes active.
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()>;

    /// Something this task waits for may have happened.
    fn run_ready(&mut self, _model: &mut Model, _me: TaskId) -> Result<()> {
        Ok(())
    }

    /// Route a response to the matching hook.
    fn handle_response(&mut self, model: &mut Model, me: TaskId, resp: &Response) -> Result<bool> {
        match resp {
            Response::State(s) => self.handle_state(model, me, s),
            Response::Capability(c) => self.handle_capability(model, me, c),
            Response::Number(n) => self.handle_number(model, me, *n),
            Response::Flags(f) => self.handle_flags(model, me, f),
            Response::List(l) => self.handle_list(model, me, l),
            Response::Fetch(f) => self.handle_fetch(model, me, f),
            Response::Search(s) => self.handle_search(model, me, s),
            Response::ESearch(e) => self.handle_esearch(model, me, e),
            Response::Sort(s) => self.handle_sort(model, me, s),
            Response::Thread(t) => self.handle_thread(model, me, t),
            Response::Namespace(n) => self.handle_namespace(model, me, n),
            Response::Status(s) => self.handle_status(model, me, s),
            Response::Id(i) => self.handle_id(model, me, i),
            Response::Enabled(e) => self.handle_enabled(model, me, e),
            Response::Vanished { earlier, uids } => {
                let uids: Vec<Uid> = uids.iter().flat_map(|r| r.clone()).collect();
                self.handle_vanished(model, me, *earlier, &uids)
            }
            Response::SocketEncrypted { chain, errors } => {
                self.handle_socket_encrypted(model, me, chain, errors)
            }
            Response::SocketDisconnected(_) | Response::ParseError { .. } => Ok(false),
        }
    }

    fn handle_state(&mut self, _model: &mut Model, _me: TaskId, _resp: &StateResponse) -> Result<bool> {
        Ok(false)
    }

    fn handle_capability(
        &mut self,
        _model: &mut Model,
        _me: TaskId,
        _caps: &Capabilities,
    ) -> Result<bool> {
        Ok(false)
    }

    fn handle_number(&mut self, _model: &mut Model, _me: TaskId, _resp: NumberResponse) -> Result<bool> {
        Ok(false)
    }

    fn handle_flags(&mut self, _model: &mut Model, _me: TaskId, _flags: &[Flag<'static>]) -> Result<bool> {
        Ok(false)
    }

    fn handle_list(&mut self, _model: &mut Model, _me: TaskId, _resp: &ListResponse) -> Result<bool> {
        Ok(false)
    }

    fn handle_fetch(&mut self, _model: &mut Model, _me: TaskId, _resp: &FetchResponse) -> Result<bool> {
        Ok(false)
    }

    fn handle_search(&mut self, _model: &mut Model, _me: TaskId, _items: &[u32]) -> Result<bool> {
        Ok(false)
    }

    fn handle_esearch(
        &mut self,
        _model: &mut Model,
        _me: TaskId,
        _resp: &ESearchResponse,
    ) -> Result<bool> {
        Ok(false)
    }

    fn handle_sort(&mut self, _model: &mut Model, _me: TaskId, _items: &[u32]) -> Result<bool> {
        Ok(false)
    }

    fn handle_thread(&mut self, _model: &mut Model, _me: TaskId, _threads: &[ThreadNode]) -> Result<bool> {
        Ok(false)
    }

    fn handle_namespace(
        &mut self,
        _model: &mut Model,
        _me: TaskId,
        _resp: &NamespaceResponse,
    ) -> Result<bool> {
        Ok(false)
    }

    fn handle_status(&mut self, _model: &mut Model, _me: TaskId, _resp: &StatusResponse) -> Result<bool> {
        Ok(false)
    }

    fn handle_id(
        &mut self,
        _model: &mut Model,
        _me: TaskId,
        _data: &Option<BTreeMap<String, String>>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn handle_enabled(&mut self, _model: &mut Model, _me: TaskId, _caps: &[String]) -> Result<bool> {
        Ok(false)
    }

    fn handle_vanished(
        &mut self,
        _model: &mut Model,
        _me: TaskId,
        _earlier: bool,
        _uids: &[Uid],
    ) -> Result<bool> {
        Ok(false)
    }

    fn handle_socket_encrypted(
        &mut self,
        _model: &mut Model,
        _me: TaskId,
        _chain: &[Vec<u8>],
        _errors: &[String],
    ) -> Result<bool> {
        Ok(false)
    }

    /// A deadline requested through [`Model::start_timer`] has passed.
    fn on_timer(&mut self, _model: &mut Model, _me: TaskId, _kind: TimerKind) -> Result<()> {
        Ok(())
    }

    /// The connection is gone; finish without any further I/O.
    fn die(&mut self, model: &mut Model, me: TaskId, reason: &str) {
        model.task_failed(me, reason);
    }

    /// Finish early when convenient.
    fn abort(&mut self, model: &mut Model, me: TaskId) {
        model.core_mut(me).aborted = true;
    }

    /// Stop a long-running task from producing further updates.
    fn cancel_updates(&mut self, _model: &mut Model, _me: TaskId) -> Result<()> {
        Ok(())
    }

    fn as_keep_mailbox_open(&mut self) -> Option<&mut KeepMailboxOpenTask> {
        None
    }

    fn as_keep_mailbox_open_ref(&self) -> Option<&KeepMailboxOpenTask> {
        None
    }
}

/// Fail the task if it was asked to stop before it got to do anything.
///
/// Returns `true` when the task is finished now.
pub(crate) fn check_abort_die(model: &mut Model, me: TaskId) -> bool {
    let core = model.core(me);
    if core.dead {
        model.task_failed(me, "Asked to die");
        true
    } else if core.aborted {
        model.task_failed(me, "Aborted");
        true
    } else {
        false
    }
}

/// Whether `resp` is the tagged completion of the command sent as `tag`.
pub(crate) fn completes(resp: &StateResponse, tag: &Option<crate::types::Tag>) -> bool {
    match (&resp.tag, tag) {
        (Some(got), Some(want)) => got == want,
        _ => false,
    }
}
