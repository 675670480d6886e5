use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset};

use crate::cache::{Cache, MailboxMetadata};
use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::events::EventSender;
use crate::extensions::sort::{SortCriterion, ThreadAlgorithm};
use crate::parser::{Command, Connector, StoreMode};
use crate::tasks::{
    AppendTask, CopyMoveMessagesTask, CopyMoveOperation, ExpungeMailboxTask, ExpungeMessagesTask,
    FetchMsgMetadataTask, GetAnyConnectionTask, ImapTask, KeepMailboxOpenTask,
    ListChildMailboxesTask, MailboxAdminTask, MailboxOperation, NoopTask,
    ObtainSynchronizedMailboxTask, OpenConnectionTask, SortTask, TaskCore, TaskKind, ThreadTask,
    TimerKind, UpdateFlagsTask, EnableTask, IdTask,
};
use crate::tree::{FetchState, MailboxTree};
use crate::types::{
    Capabilities, ConnId, ConnectionState, Event, Flag, MailboxId, NetworkPolicy, RespCode,
    Response, StateKind, Tag, TaskId, TaskState, Uid,
};

/// Upper bound of wakeups processed by one [`Model::settle`] before giving up on a task cycle.
const MAX_SETTLE_ROUNDS: usize = 10_000;

/// What the engine knows about the user's credentials.
#[derive(Clone, PartialEq, Eq)]
pub(crate) enum Credentials {
    Missing,
    Available { username: String, password: String },
    Cancelled,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Missing => f.write_str("Missing"),
            Credentials::Available { username, .. } => write!(f, "Available({:?})", username),
            Credentials::Cancelled => f.write_str("Cancelled"),
        }
    }
}

struct TaskEntry {
    core: TaskCore,
    behavior: Option<Box<dyn ImapTask>>,
}

#[derive(Debug)]
struct Timer {
    due: Instant,
    task: TaskId,
    kind: TimerKind,
}

/// The IMAP engine: connections, the tasks running on them and the mailbox tree they keep
/// up to date.
///
/// A `Model` does no I/O on its own. The consumer drives it by calling [`Model::poll`] (or
/// [`Model::tick`] with an explicit clock) whenever the transports may have something to say,
/// and listens to the [`Event`]s it emits. Requests such as [`Model::open_mailbox`] create
/// tasks and return their [`TaskId`] right away; whether a task worked out is reported through
/// [`Event::TaskCompleted`] and [`Event::TaskFailed`], and can be looked up with
/// [`Model::task_state`].
///
/// ```no_run
/// # use imap_engine::{EngineConfig, MemoryCache, Model, ConnectionBuilder};
/// # fn main() -> imap_engine::Result<()> {
/// let connector = ConnectionBuilder::new("imap.example.com", 993);
/// let config = EngineConfig::default().with_credentials("me", "secret");
/// let mut model = Model::new(config, MemoryCache::new(), connector);
/// let task = model.open_mailbox("INBOX")?;
/// loop {
///     model.poll();
///     for event in model.events().try_iter() {
///         println!("{:?}", event);
///     }
/// #   break;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Model {
    config: EngineConfig,
    pub(crate) tree: MailboxTree,
    pub(crate) cache: Box<dyn Cache>,
    connector: Box<dyn Connector>,
    connections: BTreeMap<ConnId, Connection>,
    next_conn: usize,
    tasks: Vec<TaskEntry>,
    timers: Vec<Timer>,
    wakeups: VecDeque<TaskId>,
    settling: bool,
    now: Instant,
    network_policy: NetworkPolicy,
    credentials: Credentials,
    ssl_decisions: HashMap<(Vec<Vec<u8>>, Vec<String>), bool>,
    events_tx: EventSender,
    events: mpsc::Receiver<Event>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("connections", &self.connections)
            .field("tasks", &self.tasks.len())
            .field("timers", &self.timers)
            .field("network_policy", &self.network_policy)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl Model {
    /// Create an engine which stores what it learns in `cache` and opens connections through
    /// `connector`.
    pub fn new<C, K>(config: EngineConfig, cache: C, connector: K) -> Model
    where
        C: Cache + 'static,
        K: Connector + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let events_tx = EventSender::new(tx);
        let credentials = match (&config.username, &config.password) {
            (Some(u), Some(p)) => Credentials::Available {
                username: u.clone(),
                password: p.clone(),
            },
            _ => Credentials::Missing,
        };
        Model {
            tree: MailboxTree::new(events_tx.clone()),
            cache: Box::new(cache),
            connector: Box::new(connector),
            connections: BTreeMap::new(),
            next_conn: 0,
            tasks: Vec::new(),
            timers: Vec::new(),
            wakeups: VecDeque::new(),
            settling: false,
            now: Instant::now(),
            network_policy: NetworkPolicy::Online,
            credentials,
            ssl_decisions: HashMap::new(),
            events_tx,
            events: rx,
            config,
        }
    }

    // ---- introspection -------------------------------------------------------------------

    /// Everything the engine has to say, in order.
    pub fn events(&self) -> &mpsc::Receiver<Event> {
        &self.events
    }

    /// The mailbox tree.
    pub fn tree(&self) -> &MailboxTree {
        &self.tree
    }

    /// The cache the engine writes to.
    pub fn cache(&self) -> &dyn Cache {
        self.cache.as_ref()
    }

    /// The configuration the engine runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Look a connection up.
    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Every connection ever opened, torn-down ones included.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// The current network policy.
    pub fn network_policy(&self) -> NetworkPolicy {
        self.network_policy
    }

    /// The scheduler clock.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Where a task is in its life, `None` for an unknown id.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(id.0).map(|t| {
            let core = &t.core;
            if core.finished {
                if core.failure.is_some() {
                    TaskState::Failed
                } else {
                    TaskState::Completed
                }
            } else if core.started {
                TaskState::Active
            } else {
                TaskState::Pending
            }
        })
    }

    /// Why a task failed.
    pub fn task_failure(&self, id: TaskId) -> Option<&str> {
        self.tasks.get(id.0).and_then(|t| t.core.failure.as_deref())
    }

    /// What a task does.
    pub fn task_kind(&self, id: TaskId) -> Option<TaskKind> {
        self.tasks.get(id.0).map(|t| t.core.kind)
    }

    /// Every task of the given kind, finished ones included, oldest first.
    pub fn tasks_of_kind(&self, kind: TaskKind) -> Vec<TaskId> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.core.kind == kind)
            .map(|(i, _)| TaskId(i))
            .collect()
    }

    /// The task keeping the named mailbox selected, if any.
    pub fn maintaining_task(&self, mailbox: &str) -> Option<TaskId> {
        self.tree
            .find(mailbox)
            .and_then(|m| self.tree.maintaining(m))
            .filter(|&t| !self.core(t).finished)
    }

    // ---- event loop ----------------------------------------------------------------------

    /// Run one turn of the event loop at the current wall-clock time.
    pub fn poll(&mut self) {
        let now = Instant::now().max(self.now);
        self.tick(now);
    }

    /// Run one turn of the event loop at `now`: fire due timers, then process up to
    /// [`EngineConfig::responses_per_poll`] responses of every connection.
    pub fn tick(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
        self.fire_timers();

        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for conn in ids {
            for _ in 0..self.config.responses_per_poll.max(1) {
                let resp = match self.connections.get_mut(&conn) {
                    Some(c) if !c.closed && !c.suspended => c.parser.next_response(),
                    _ => None,
                };
                match resp {
                    Some(resp) => self.dispatch(conn, resp),
                    None => break,
                }
            }
        }
        self.settle();
    }

    fn fire_timers(&mut self) {
        let now = self.now;
        let mut due: Vec<(Instant, TaskId, TimerKind)> = self
            .timers
            .iter()
            .filter(|t| t.due <= now)
            .map(|t| (t.due, t.task, t.kind))
            .collect();
        due.sort_by_key(|&(at, task, _)| (at, task));
        self.timers.retain(|t| t.due > now);
        for (_, task, kind) in due {
            if self.core(task).finished {
                continue;
            }
            log::trace!("{}: timer {:?} fired", task, kind);
            if let Some(Err(e)) = self.with_task(task, |t, m| t.on_timer(m, task, kind)) {
                self.task_error(task, e);
            }
            self.settle();
        }
    }

    /// Route one response of `conn` to the first active task claiming it, falling back to the
    /// connection-wide handling.
    pub(crate) fn dispatch(&mut self, conn: ConnId, resp: Response) {
        if let Response::State(ref s) = resp {
            if s.kind == StateKind::Bad {
                log::warn!(
                    "{}: BAD response{}: {}",
                    conn,
                    s.tag.as_ref().map(|t| format!(" to {}", t)).unwrap_or_default(),
                    s.message
                );
            }
            match s.code {
                Some(RespCode::Alert) => self.emit(Event::Alert {
                    conn,
                    message: s.message.clone(),
                }),
                Some(RespCode::Capabilities(ref caps)) => self.update_capabilities(conn, caps.clone()),
                _ => {}
            }
        }

        let snapshot = match self.connections.get(&conn) {
            Some(c) => c.active_tasks.clone(),
            None => return,
        };
        let mut claimed = false;
        for id in snapshot {
            let core = self.core(id);
            if core.finished || core.conn != Some(conn) {
                continue;
            }
            match self.with_task(id, |t, m| t.handle_response(m, id, &resp)) {
                Some(Ok(true)) => {
                    claimed = true;
                    break;
                }
                Some(Ok(false)) | None => {}
                Some(Err(e)) => {
                    self.task_error(id, e);
                    claimed = true;
                    break;
                }
            }
        }
        self.settle();

        if !claimed {
            if let Err(e) = self.handle_unclaimed(conn, &resp) {
                self.connection_failed(conn, &e.to_string());
            }
            self.settle();
        }
    }

    fn handle_unclaimed(&mut self, conn: ConnId, resp: &Response) -> Result<()> {
        match resp {
            Response::State(s) => {
                if let Some(RespCode::BadCharset(_)) | Some(RespCode::Parse) = s.code {
                    log::warn!("{}: {}", conn, s.message);
                }
                if s.kind == StateKind::Bye {
                    self.set_conn_state(conn, ConnectionState::Logout);
                } else if let Some(ref tag) = s.tag {
                    log::warn!("{}: nobody was waiting for the completion of {}", conn, tag);
                }
                Ok(())
            }
            Response::Capability(caps) => {
                self.update_capabilities(conn, caps.clone());
                Ok(())
            }
            Response::Number(n) => Err(Error::ProtocolViolation(format!(
                "Unhandled {:?} outside of a selected mailbox",
                n
            ))),
            Response::Flags(_) => Ok(()),
            Response::List(l) => {
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.list_responses.push(l.clone());
                }
                Ok(())
            }
            Response::Fetch(f) => {
                let selected = self.connections.get(&conn).and_then(|c| c.selected_mailbox);
                match selected {
                    Some(mailbox) => self.tree.handle_fetch(mailbox, f, self.cache.as_mut()),
                    None => Err(Error::ProtocolViolation(format!(
                        "FETCH for message #{} while no mailbox is selected",
                        f.seq
                    ))),
                }
            }
            Response::Status(s) => {
                if let Some(mailbox) = self.tree.find(&s.mailbox) {
                    self.tree.set_status(mailbox, s.clone());
                }
                Ok(())
            }
            Response::Namespace(n) => {
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.namespace = Some(n.clone());
                }
                Ok(())
            }
            Response::Id(id) => {
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.server_id = id.clone();
                }
                Ok(())
            }
            Response::Enabled(caps) => {
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.enabled.extend(caps.iter().cloned());
                }
                Ok(())
            }
            Response::Search(_) | Response::ESearch(_) | Response::Sort(_) | Response::Thread(_) => {
                Err(Error::ProtocolViolation(
                    "Search results arrived, but nobody asked for them".to_string(),
                ))
            }
            Response::Vanished { .. } => {
                log::warn!("{}: VANISHED outside of a selected mailbox", conn);
                Ok(())
            }
            Response::SocketEncrypted { .. } => {
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.encrypted = true;
                }
                Ok(())
            }
            Response::SocketDisconnected(reason) => {
                self.connection_failed(conn, reason);
                Ok(())
            }
            Response::ParseError { message, .. } => {
                self.connection_failed(conn, message);
                Ok(())
            }
        }
    }

    /// Process pending wakeups until none are left.
    pub(crate) fn settle(&mut self) {
        if self.settling {
            return;
        }
        self.settling = true;
        let mut rounds = 0;
        while let Some(id) = self.wakeups.pop_front() {
            rounds += 1;
            if rounds > MAX_SETTLE_ROUNDS {
                log::warn!(
                    "Tasks keep waking each other up; dropping {} wakeups",
                    self.wakeups.len()
                );
                self.wakeups.clear();
                break;
            }
            let core = self.core(id);
            if core.finished || !core.started {
                continue;
            }
            if let Some(Err(e)) = self.with_task(id, |t, m| t.run_ready(m, id)) {
                self.task_error(id, e);
            }
        }
        self.settling = false;
    }

    // ---- task plumbing -------------------------------------------------------------------

    pub(crate) fn core(&self, id: TaskId) -> &TaskCore {
        &self.tasks[id.0].core
    }

    pub(crate) fn core_mut(&mut self, id: TaskId) -> &mut TaskCore {
        &mut self.tasks[id.0].core
    }

    pub(crate) fn behavior(&self, id: TaskId) -> Option<&dyn ImapTask> {
        self.tasks.get(id.0).and_then(|t| t.behavior.as_deref())
    }

    /// Run `f` on the behavior of a task, which is out of the arena meanwhile.
    ///
    /// Returns `None` when the behavior is not available: the task is finished or already
    /// running further up the stack.
    pub(crate) fn with_task<R>(
        &mut self,
        id: TaskId,
        f: impl FnOnce(&mut dyn ImapTask, &mut Model) -> R,
    ) -> Option<R> {
        let mut behavior = self.tasks.get_mut(id.0)?.behavior.take()?;
        let r = f(behavior.as_mut(), self);
        if !self.tasks[id.0].core.finished {
            self.tasks[id.0].behavior = Some(behavior);
        }
        Some(r)
    }

    fn run_task(&mut self, id: TaskId, f: impl FnOnce(&mut dyn ImapTask, &mut Model) -> Result<()>) {
        if let Some(Err(e)) = self.with_task(id, f) {
            self.task_error(id, e);
        }
    }

    /// A task method returned an error.
    pub(crate) fn task_error(&mut self, id: TaskId, e: Error) {
        match self.core(id).conn {
            Some(conn) if e.is_fatal_for_connection() => {
                self.connection_failed(conn, &e.to_string())
            }
            _ => {}
        }
        if !self.core(id).finished {
            self.task_failed(id, &e.to_string());
        }
    }

    pub(crate) fn create_task(&mut self, kind: TaskKind, behavior: Box<dyn ImapTask>) -> TaskId {
        let id = TaskId(self.tasks.len());
        self.tasks.push(TaskEntry {
            core: TaskCore::new(kind),
            behavior: Some(behavior),
        });
        log::debug!("{}: created {:?}", id, kind);
        id
    }

    /// Start `dep` once `parent` completes.
    ///
    /// When `parent` is already finished, `dep` is started (or killed) right away.
    pub(crate) fn add_dependent(&mut self, parent: TaskId, dep: TaskId) {
        self.attach(parent, dep, false)
    }

    /// Like [`Model::add_dependent`], but ahead of all other dependents.
    pub(crate) fn add_dependent_first(&mut self, parent: TaskId, dep: TaskId) {
        self.attach(parent, dep, true)
    }

    fn attach(&mut self, parent: TaskId, dep: TaskId, front: bool) {
        let p = self.core(parent);
        if p.finished {
            if let Some(reason) = p.failure.clone() {
                self.die_task(dep, &reason);
                return;
            }
            match p.conn {
                Some(conn) if self.is_open(conn) => self.activate(dep, conn),
                _ => self.die_task(dep, "Connection is gone"),
            }
            return;
        }
        self.core_mut(dep).parent = Some(parent);
        let deps = &mut self.core_mut(parent).dependents;
        if front {
            deps.insert(0, dep);
        } else {
            deps.push(dep);
        }
        self.wake(parent);
    }

    /// Re-parent a pending task.
    pub(crate) fn move_dependent(&mut self, dep: TaskId, to: TaskId) {
        if let Some(old) = self.core(dep).parent {
            self.core_mut(old).dependents.retain(|&d| d != dep);
        }
        self.core_mut(dep).parent = None;
        self.add_dependent(to, dep);
    }

    /// Bind a task to `conn` and let it start talking.
    pub(crate) fn activate(&mut self, id: TaskId, conn: ConnId) {
        self.start_on(id, conn, false)
    }

    /// Like [`Model::activate`], but the task gets to see responses before every other task of
    /// the connection.
    pub(crate) fn activate_first(&mut self, id: TaskId, conn: ConnId) {
        self.start_on(id, conn, true)
    }

    fn start_on(&mut self, id: TaskId, conn: ConnId, front: bool) {
        let core = self.core(id);
        if core.finished || core.started {
            return;
        }
        let c = match self.connections.get_mut(&conn) {
            Some(c) if !c.closed => c,
            _ => {
                self.die_task(id, "Connection is gone");
                return;
            }
        };
        if front {
            c.active_tasks.insert(0, id);
        } else {
            c.active_tasks.push(id);
        }
        let core = self.core_mut(id);
        core.conn = Some(conn);
        core.started = true;
        log::debug!("{}: {:?} starts on {}", id, core.kind, conn);
        self.run_task(id, |t, m| t.perform(m, id));
    }

    /// Finish a task successfully and start whatever waited for it.
    pub(crate) fn task_completed(&mut self, id: TaskId) {
        if !self.core(id).finished {
            self.finish(id, None);
        }
    }

    /// Finish a task with a failure, taking everything that waited for it down as well.
    pub(crate) fn task_failed(&mut self, id: TaskId, reason: &str) {
        if !self.core(id).finished {
            self.finish(id, Some(reason.to_owned()));
        }
    }

    fn finish(&mut self, id: TaskId, failure: Option<String>) {
        let entry = &mut self.tasks[id.0];
        entry.behavior = None;
        let core = &mut entry.core;
        core.finished = true;
        core.failure = failure.clone();
        let kind = core.kind;
        let conn = core.conn;
        let parent = core.parent;
        let owner = core.owner;
        let dependents = std::mem::take(&mut core.dependents);

        self.timers.retain(|t| t.task != id);
        if let Some(c) = conn.and_then(|c| self.connections.get_mut(&c)) {
            c.active_tasks.retain(|&t| t != id);
        }
        // a mailbox owner may be registered before it ever started
        for c in self.connections.values_mut() {
            if c.maintaining_task == Some(id) {
                c.maintaining_task = None;
            }
        }
        if let Some(p) = parent {
            self.core_mut(p).dependents.retain(|&d| d != id);
        }

        match failure {
            None => {
                log::debug!("{}: {:?} completed", id, kind);
                self.emit(Event::TaskCompleted(id));
                for dep in dependents {
                    let core = self.core_mut(dep);
                    core.parent = None;
                    if core.finished || core.started {
                        continue;
                    }
                    match conn {
                        Some(c) if self.is_open(c) => self.activate(dep, c),
                        _ => self.die_task(dep, "Connection is gone"),
                    }
                }
            }
            Some(reason) => {
                log::warn!("{}: {:?} failed: {}", id, kind, reason);
                self.emit(Event::TaskFailed {
                    task: id,
                    reason: reason.clone(),
                });
                for dep in dependents {
                    self.core_mut(dep).parent = None;
                    self.die_task(dep, &reason);
                }
            }
        }

        if let Some(p) = parent {
            self.wake(p);
        }
        if let Some(o) = owner {
            self.wake(o);
        }
        if let Some(m) = conn
            .and_then(|c| self.connections.get(&c))
            .and_then(|c| c.maintaining_task)
        {
            self.wake(m);
        }
    }

    /// Terminate a task without any further I/O.
    pub(crate) fn die_task(&mut self, id: TaskId, reason: &str) {
        if self.core(id).finished {
            return;
        }
        self.core_mut(id).dead = true;
        let _ = self.with_task(id, |t, m| t.die(m, id, reason));
        if !self.core(id).finished {
            self.task_failed(id, reason);
        }
    }

    /// Ask a task to finish early when convenient.
    pub(crate) fn abort_task(&mut self, id: TaskId) {
        if self.core(id).finished {
            return;
        }
        if self.with_task(id, |t, m| t.abort(m, id)).is_none() {
            self.core_mut(id).aborted = true;
        }
    }

    /// Have `id` re-check its situation at the end of the current turn.
    pub(crate) fn wake(&mut self, id: TaskId) {
        if !self.wakeups.contains(&id) {
            self.wakeups.push_back(id);
        }
    }

    pub(crate) fn kmo_should_exit(&self, kmo: TaskId) -> bool {
        self.behavior(kmo)
            .and_then(|b| b.as_keep_mailbox_open_ref())
            .map(|k| k.should_exit())
            .unwrap_or(false)
    }

    /// The mailbox owner created along with an `ObtainSynchronizedMailbox` task.
    pub(crate) fn kmo_of_obtain(&self, obtain: TaskId) -> Option<TaskId> {
        self.core(obtain)
            .dependents
            .iter()
            .copied()
            .find(|&d| self.core(d).kind == TaskKind::KeepMailboxOpen)
    }

    // ---- timers --------------------------------------------------------------------------

    pub(crate) fn start_timer(&mut self, task: TaskId, kind: TimerKind, delay: Duration) {
        self.stop_timer(task, kind);
        self.timers.push(Timer {
            due: self.now + delay,
            task,
            kind,
        });
    }

    pub(crate) fn stop_timer(&mut self, task: TaskId, kind: TimerKind) {
        self.timers.retain(|t| !(t.task == task && t.kind == kind));
    }

    pub(crate) fn timer_active(&self, task: TaskId, kind: TimerKind) -> bool {
        self.timers.iter().any(|t| t.task == task && t.kind == kind)
    }

    // ---- connections ---------------------------------------------------------------------

    pub(crate) fn conn(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub(crate) fn conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    fn is_open(&self, conn: ConnId) -> bool {
        self.connections.get(&conn).map(|c| !c.closed).unwrap_or(false)
    }

    /// The connection a task runs on.
    pub(crate) fn conn_of(&self, task: TaskId) -> Result<ConnId> {
        self.core(task).conn.ok_or(Error::ConnectionLost)
    }

    /// Send a command over `conn`.
    pub(crate) fn send(&mut self, conn: ConnId, command: Command) -> Result<Tag> {
        match self.connections.get_mut(&conn) {
            Some(c) if !c.closed => c.parser.send(command),
            _ => Err(Error::ConnectionLost),
        }
    }

    pub(crate) fn has_capability(&self, conn: ConnId, cap: &str) -> bool {
        self.connections
            .get(&conn)
            .map(|c| c.has_capability(cap))
            .unwrap_or(false)
    }

    pub(crate) fn conn_state(&self, conn: ConnId) -> ConnectionState {
        self.connections
            .get(&conn)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Logout)
    }

    /// Move a connection to `state` if that is a legal transition.
    pub(crate) fn set_conn_state(&mut self, conn: ConnId, state: ConnectionState) {
        let c = match self.connections.get_mut(&conn) {
            Some(c) => c,
            None => return,
        };
        if c.state == state || !c.can_move_to(state) {
            return;
        }
        log::info!("{}: {} -> {}", conn, c.state, state);
        c.state = state;
        self.emit(Event::ConnectionStateChanged { conn, state });
    }

    pub(crate) fn update_capabilities(&mut self, conn: ConnId, caps: Capabilities) {
        if let Some(c) = self.connections.get_mut(&conn) {
            log::debug!("{}: capabilities {:?}", conn, caps);
            c.capabilities = caps.clone();
            c.capabilities_fresh = true;
            self.emit(Event::CapabilitiesUpdated {
                conn,
                capabilities: caps,
            });
        }
    }

    /// Open a new connection and start logging in.
    pub(crate) fn open_connection(&mut self) -> Result<(ConnId, TaskId)> {
        if self.network_policy == NetworkPolicy::Offline {
            return Err(Error::Offline);
        }
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        let parser = match self.connector.connect() {
            Ok(parser) => parser,
            Err(e) => {
                log::error!("{}: cannot connect: {}", id, e);
                self.emit(Event::ConnectionError {
                    conn: id,
                    message: e.to_string(),
                });
                self.go_offline();
                return Err(e);
            }
        };
        log::info!("{}: connected", id);
        self.connections.insert(id, Connection::new(id, parser));
        let task = self.create_task(TaskKind::OpenConnection, Box::new(OpenConnectionTask::new()));
        self.activate(task, id);
        Ok((id, task))
    }

    /// The task logging `conn` in, if it is still at it.
    fn opener_of(&self, conn: ConnId) -> Option<TaskId> {
        self.connections.get(&conn).and_then(|c| {
            c.active_tasks
                .iter()
                .copied()
                .find(|&t| self.core(t).kind == TaskKind::OpenConnection)
        })
    }

    /// A connection a new mailbox owner may use, or `None` when a new one should be opened.
    fn pick_connection(&self) -> Option<ConnId> {
        let live: Vec<&Connection> = self.connections.values().filter(|c| c.is_live()).collect();
        if let Some(c) = live
            .iter()
            .find(|c| c.state.is_authenticated() && c.maintaining_task.is_none())
        {
            return Some(c.id);
        }
        if live.len() < self.config.max_connections.max(1) {
            return None;
        }
        live.first().map(|c| c.id)
    }

    /// A connection was lost or can no longer be trusted.
    pub(crate) fn connection_failed(&mut self, conn: ConnId, message: &str) {
        if !self.is_open(conn) {
            return;
        }
        log::error!("{}: {}", conn, message);
        self.tear_down(conn, message);
        self.emit(Event::ConnectionError {
            conn,
            message: message.to_owned(),
        });
        self.go_offline();
    }

    /// Close `conn` and kill every task running on it.
    pub(crate) fn tear_down(&mut self, conn: ConnId, reason: &str) {
        self.set_conn_state(conn, ConnectionState::Logout);
        let tasks = match self.connections.get_mut(&conn) {
            Some(c) if !c.closed => {
                c.closed = true;
                c.suspended = false;
                c.maintaining_task = None;
                c.selected_mailbox = None;
                std::mem::take(&mut c.active_tasks)
            }
            _ => return,
        };
        for task in tasks {
            self.die_task(task, reason);
        }
    }

    /// Say goodbye on `conn` and take it down.
    pub(crate) fn logout_connection(&mut self, conn: ConnId, message: &str) {
        if let Some(c) = self.connections.get_mut(&conn) {
            if !c.closed {
                let _ = c.parser.send(Command::Logout);
            }
        }
        self.connection_failed(conn, message);
    }

    pub(crate) fn start_tls_required(&self) -> bool {
        self.config.start_tls_required || self.connector.start_tls_required()
    }

    pub(crate) fn go_offline(&mut self) {
        if self.network_policy != NetworkPolicy::Offline {
            log::info!("Going offline");
            self.network_policy = NetworkPolicy::Offline;
            self.emit(Event::NetworkPolicyChanged(NetworkPolicy::Offline));
        }
        let open: Vec<ConnId> = self
            .connections
            .values()
            .filter(|c| !c.closed)
            .map(|c| c.id)
            .collect();
        for conn in open {
            if let Some(c) = self.connections.get_mut(&conn) {
                let _ = c.parser.send(Command::Logout);
            }
            self.tear_down(conn, "Going offline");
        }
    }

    /// Allow or forbid network use. Going offline logs every connection out.
    pub fn set_network_policy(&mut self, policy: NetworkPolicy) {
        if policy == NetworkPolicy::Offline {
            self.go_offline();
        } else if self.network_policy != policy {
            log::info!("Network policy: {:?}", policy);
            self.network_policy = policy;
            self.emit(Event::NetworkPolicyChanged(policy));
        }
        self.settle();
    }

    // ---- collaborators -------------------------------------------------------------------

    pub(crate) fn emit(&self, e: Event) {
        self.events_tx.send(e);
    }

    pub(crate) fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub(crate) fn forget_credentials(&mut self) {
        self.credentials = Credentials::Missing;
    }

    pub(crate) fn request_credentials(&mut self, conn: ConnId, error: Option<String>) {
        self.emit(Event::AuthRequested { conn, error });
    }

    pub(crate) fn ssl_decision(&self, chain: &[Vec<u8>], errors: &[String]) -> Option<bool> {
        self.ssl_decisions
            .get(&(chain.to_vec(), errors.to_vec()))
            .copied()
    }

    fn wake_openers(&mut self) {
        let openers: Vec<TaskId> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.core.kind == TaskKind::OpenConnection && t.core.started && !t.core.finished
            })
            .map(|(i, _)| TaskId(i))
            .collect();
        for t in openers {
            self.wake(t);
        }
    }

    /// Provide the credentials asked for by [`Event::AuthRequested`].
    pub fn set_credentials<U: Into<String>, P: Into<String>>(&mut self, username: U, password: P) {
        self.credentials = Credentials::Available {
            username: username.into(),
            password: password.into(),
        };
        self.wake_openers();
        self.settle();
    }

    /// Refuse to provide credentials; connections waiting for them log out.
    pub fn cancel_authentication(&mut self) {
        self.credentials = Credentials::Cancelled;
        self.wake_openers();
        self.settle();
    }

    /// Accept or reject a TLS certificate chain with the given validation problems.
    ///
    /// The decision is remembered for this exact combination.
    pub fn set_ssl_policy(&mut self, chain: Vec<Vec<u8>>, errors: Vec<String>, accept: bool) {
        self.ssl_decisions.insert((chain, errors), accept);
        self.wake_openers();
        self.settle();
    }

    // ---- routing of requests -------------------------------------------------------------

    /// The mailbox owner of `mailbox`, created (along with its synchronization) when needed.
    pub(crate) fn find_task_responsible_for(&mut self, mailbox: MailboxId) -> Result<TaskId> {
        if !self.tree.is_valid(mailbox) || mailbox == self.tree.root() {
            return Err(Error::InvalidInput("No such mailbox".to_string()));
        }
        if let Some(kmo) = self.tree.maintaining(mailbox) {
            if !self.core(kmo).finished && !self.kmo_should_exit(kmo) {
                return Ok(kmo);
            }
        }
        if self.network_policy == NetworkPolicy::Offline {
            return Err(Error::Offline);
        }

        let conn = match self.pick_connection() {
            Some(conn) => conn,
            None => self.open_connection()?.0,
        };

        let kmo = self.create_task(
            TaskKind::KeepMailboxOpen,
            Box::new(KeepMailboxOpenTask::new(mailbox)),
        );
        let obtain = self.create_task(
            TaskKind::ObtainSynchronizedMailbox,
            Box::new(ObtainSynchronizedMailboxTask::new(mailbox)),
        );
        self.add_dependent(obtain, kmo);
        self.tree.set_maintaining(mailbox, Some(kmo));
        if self.tree.messages(mailbox).is_empty() {
            self.tree.set_messages_state(mailbox, FetchState::Loading);
        }

        let (maintainer, authenticated) = match self.connections.get(&conn) {
            Some(c) => (c.maintaining_task, c.state.is_authenticated()),
            None => (None, false),
        };
        if let Some(maintainer) = maintainer {
            self.add_dependent(maintainer, obtain);
        } else if authenticated {
            if let Some(c) = self.connections.get_mut(&conn) {
                c.maintaining_task = Some(kmo);
            }
            self.activate(obtain, conn);
        } else {
            if let Some(c) = self.connections.get_mut(&conn) {
                c.maintaining_task = Some(kmo);
            }
            match self.opener_of(conn) {
                Some(opener) => self.add_dependent(opener, obtain),
                None => self.activate(obtain, conn),
            }
        }
        Ok(kmo)
    }

    /// A task which completes as soon as some connection can take a mailbox-independent
    /// command.
    pub(crate) fn get_any_connection(&mut self) -> Result<TaskId> {
        let live = self
            .connections
            .values()
            .find(|c| c.is_live())
            .map(|c| (c.id, c.maintaining_task, c.state.is_authenticated()));
        let task = match live {
            Some((conn, maintainer, authenticated)) => {
                let task = self.create_task(
                    TaskKind::GetAnyConnection,
                    Box::new(GetAnyConnectionTask::new()),
                );
                if let Some(m) = maintainer {
                    self.add_dependent(m, task);
                } else if authenticated {
                    self.activate(task, conn);
                } else {
                    match self.opener_of(conn) {
                        Some(opener) => self.add_dependent(opener, task),
                        None => self.activate(task, conn),
                    }
                }
                task
            }
            None => {
                let (_, opener) = self.open_connection()?;
                let task = self.create_task(
                    TaskKind::GetAnyConnection,
                    Box::new(GetAnyConnectionTask::new()),
                );
                self.add_dependent(opener, task);
                task
            }
        };
        Ok(task)
    }

    fn mailbox_named(&mut self, name: &str) -> Result<MailboxId> {
        if name.is_empty() {
            return Err(Error::InvalidInput("Empty mailbox name".to_string()));
        }
        Ok(self.tree.ensure_mailbox(name))
    }

    fn non_empty(uids: Vec<Uid>) -> Result<Vec<Uid>> {
        if uids.is_empty() {
            Err(Error::InvalidInput("No messages given".to_string()))
        } else {
            Ok(uids)
        }
    }

    /// Create a task which runs in `mailbox` once it is synchronized.
    fn in_mailbox(&mut self, mailbox: &str, kind: TaskKind, behavior: Box<dyn ImapTask>) -> Result<TaskId> {
        let mailbox = self.mailbox_named(mailbox)?;
        let kmo = self.find_task_responsible_for(mailbox)?;
        let task = self.create_task(kind, behavior);
        self.add_dependent(kmo, task);
        self.settle();
        Ok(task)
    }

    /// Create a task which runs on whatever connection is available.
    fn anywhere(&mut self, kind: TaskKind, behavior: Box<dyn ImapTask>) -> Result<TaskId> {
        if self.network_policy == NetworkPolicy::Offline {
            return Err(Error::Offline);
        }
        let any = self.get_any_connection()?;
        let task = self.create_task(kind, behavior);
        self.add_dependent(any, task);
        self.settle();
        Ok(task)
    }

    fn with_kmo<R>(
        &mut self,
        mailbox: &str,
        f: impl FnOnce(&mut KeepMailboxOpenTask, &mut Model, TaskId) -> R,
    ) -> Result<TaskId> {
        let mailbox = self.mailbox_named(mailbox)?;
        let kmo = self.find_task_responsible_for(mailbox)?;
        self.with_task(kmo, |t, m| t.as_keep_mailbox_open().map(|k| f(k, m, kmo)));
        self.settle();
        Ok(kmo)
    }

    // ---- requests ------------------------------------------------------------------------

    /// Select and synchronize a mailbox, keeping it open afterwards.
    ///
    /// Returns the task owning the mailbox.
    pub fn open_mailbox(&mut self, mailbox: &str) -> Result<TaskId> {
        let mailbox = self.mailbox_named(mailbox)?;
        let kmo = self.find_task_responsible_for(mailbox)?;
        self.settle();
        Ok(kmo)
    }

    /// Queue the download of a message's envelope and structure.
    ///
    /// Requests arriving close together are batched into a single `FETCH`; the returned id is
    /// the owner of the mailbox, which creates the actual fetch tasks.
    pub fn request_envelope_download(&mut self, mailbox: &str, uid: Uid) -> Result<TaskId> {
        if uid == 0 {
            return Err(Error::InvalidInput("UID 0 is not a message".to_string()));
        }
        self.with_kmo(mailbox, |k, m, me| k.request_envelope_download(m, me, uid))
    }

    /// Queue the download of one body part, batched like
    /// [`Model::request_envelope_download`].
    pub fn request_part_download(
        &mut self,
        mailbox: &str,
        uid: Uid,
        part_id: &str,
        estimated_size: u64,
    ) -> Result<TaskId> {
        if uid == 0 {
            return Err(Error::InvalidInput("UID 0 is not a message".to_string()));
        }
        let part_id = part_id.to_owned();
        self.with_kmo(mailbox, move |k, m, me| {
            k.request_part_download(m, me, uid, part_id, estimated_size)
        })
    }

    /// Fetch envelopes and structures of the given messages right away.
    pub fn fetch_message_metadata(&mut self, mailbox: &str, uids: Vec<Uid>) -> Result<TaskId> {
        let uids = Self::non_empty(uids)?;
        let id = self.mailbox_named(mailbox)?;
        self.in_mailbox(
            mailbox,
            TaskKind::FetchMsgMetadata,
            Box::new(FetchMsgMetadataTask::new(id, uids)),
        )
    }

    /// Change the flags of messages.
    pub fn update_flags(
        &mut self,
        mailbox: &str,
        uids: Vec<Uid>,
        mode: StoreMode,
        flags: Vec<Flag<'static>>,
    ) -> Result<TaskId> {
        let uids = Self::non_empty(uids)?;
        let id = self.mailbox_named(mailbox)?;
        self.in_mailbox(
            mailbox,
            TaskKind::UpdateFlags,
            Box::new(UpdateFlagsTask::new(id, uids, mode, flags)),
        )
    }

    /// Copy or move messages to `target`.
    pub fn copy_move_messages(
        &mut self,
        mailbox: &str,
        uids: Vec<Uid>,
        target: &str,
        op: CopyMoveOperation,
    ) -> Result<TaskId> {
        let uids = Self::non_empty(uids)?;
        if target.is_empty() {
            return Err(Error::InvalidInput("Empty mailbox name".to_string()));
        }
        let id = self.mailbox_named(mailbox)?;
        self.in_mailbox(
            mailbox,
            TaskKind::CopyMove,
            Box::new(CopyMoveMessagesTask::new(id, uids, target.to_owned(), op)),
        )
    }

    /// Permanently remove every message flagged `\Deleted`.
    pub fn expunge_mailbox(&mut self, mailbox: &str) -> Result<TaskId> {
        let id = self.mailbox_named(mailbox)?;
        self.in_mailbox(
            mailbox,
            TaskKind::Expunge,
            Box::new(ExpungeMailboxTask::new(id)),
        )
    }

    /// Permanently remove the given messages, which must be flagged `\Deleted`.
    pub fn expunge_messages(&mut self, mailbox: &str, uids: Vec<Uid>) -> Result<TaskId> {
        let uids = Self::non_empty(uids)?;
        let id = self.mailbox_named(mailbox)?;
        self.in_mailbox(
            mailbox,
            TaskKind::ExpungeMessages,
            Box::new(ExpungeMessagesTask::new(id, uids)),
        )
    }

    /// Poke the server for news about an open mailbox.
    pub fn noop(&mut self, mailbox: &str) -> Result<TaskId> {
        let id = self.mailbox_named(mailbox)?;
        self.in_mailbox(mailbox, TaskKind::Noop, Box::new(NoopTask::new(Some(id))))
    }

    /// Sort the messages matching `search`.
    ///
    /// A `persistent` sort keeps reporting changes through [`Event::SortUpdate`] until the
    /// server or [`Model::cancel_sort_updates`] stops it. An empty `criteria` list only
    /// searches.
    pub fn sort(
        &mut self,
        mailbox: &str,
        criteria: Vec<SortCriterion>,
        search: &str,
        persistent: bool,
    ) -> Result<TaskId> {
        let id = self.mailbox_named(mailbox)?;
        self.in_mailbox(
            mailbox,
            TaskKind::Sort,
            Box::new(SortTask::new(id, criteria, search.to_owned(), persistent)),
        )
    }

    /// Stop the updates of a persistent sort.
    pub fn cancel_sort_updates(&mut self, task: TaskId) -> Result<()> {
        if self.task_kind(task) != Some(TaskKind::Sort) {
            return Err(Error::InvalidInput(format!("{} is not a sort", task)));
        }
        let r = self
            .with_task(task, |t, m| t.cancel_updates(m, task))
            .unwrap_or(Ok(()));
        if let Err(e) = r {
            self.task_error(task, e);
        }
        self.settle();
        Ok(())
    }

    /// Thread the messages matching `search`.
    pub fn thread(
        &mut self,
        mailbox: &str,
        algorithm: ThreadAlgorithm,
        search: &str,
        incremental: bool,
    ) -> Result<TaskId> {
        let id = self.mailbox_named(mailbox)?;
        self.in_mailbox(
            mailbox,
            TaskKind::Thread,
            Box::new(ThreadTask::new(id, algorithm, search.to_owned(), incremental)),
        )
    }

    /// List the children of `parent`; an empty name lists the top level.
    pub fn list_child_mailboxes(&mut self, parent: &str) -> Result<TaskId> {
        let id = if parent.is_empty() {
            self.tree.root()
        } else {
            self.tree.ensure_mailbox(parent)
        };
        if self.tree.mailbox(id).map(|m| m.children().is_empty()).unwrap_or(false) {
            if let Some(cached) = self.cache.child_mailboxes(parent) {
                self.tree.set_children(id, cached);
            }
        }
        self.tree.set_children_state(id, FetchState::Loading);
        self.anywhere(
            TaskKind::ListChildMailboxes,
            Box::new(ListChildMailboxesTask::new(id)),
        )
    }

    fn mailbox_admin(&mut self, op: MailboxOperation, name: &str) -> Result<TaskId> {
        if name.is_empty() {
            return Err(Error::InvalidInput("Empty mailbox name".to_string()));
        }
        self.anywhere(op.kind(), Box::new(MailboxAdminTask::new(op, name.to_owned())))
    }

    /// Create a mailbox.
    pub fn create_mailbox(&mut self, name: &str) -> Result<TaskId> {
        self.mailbox_admin(MailboxOperation::Create, name)
    }

    /// Delete a mailbox.
    pub fn delete_mailbox(&mut self, name: &str) -> Result<TaskId> {
        self.mailbox_admin(MailboxOperation::Delete, name)
    }

    /// Subscribe to a mailbox.
    pub fn subscribe_mailbox(&mut self, name: &str) -> Result<TaskId> {
        self.mailbox_admin(MailboxOperation::Subscribe, name)
    }

    /// Unsubscribe from a mailbox.
    pub fn unsubscribe_mailbox(&mut self, name: &str) -> Result<TaskId> {
        self.mailbox_admin(MailboxOperation::Unsubscribe, name)
    }

    /// Upload a message.
    pub fn append(
        &mut self,
        mailbox: &str,
        message: Vec<u8>,
        flags: Vec<Flag<'static>>,
        internal_date: Option<DateTime<FixedOffset>>,
    ) -> Result<TaskId> {
        if mailbox.is_empty() {
            return Err(Error::InvalidInput("Empty mailbox name".to_string()));
        }
        self.anywhere(
            TaskKind::Append,
            Box::new(AppendTask::new(mailbox.to_owned(), message, flags, internal_date)),
        )
    }

    /// Switch on extensions with `ENABLE`.
    pub fn enable(&mut self, capabilities: Vec<String>) -> Result<TaskId> {
        if capabilities.is_empty() {
            return Err(Error::InvalidInput("Nothing to enable".to_string()));
        }
        self.anywhere(TaskKind::Enable, Box::new(EnableTask::new(capabilities)))
    }

    /// Identify ourselves to the server with the configured `ID` fields.
    pub fn id(&mut self) -> Result<TaskId> {
        let fields = self.config.client_id.clone();
        self.anywhere(TaskKind::Id, Box::new(IdTask::new(fields)))
    }

    /// Children of `mailbox` as the cache knows them.
    pub fn cached_child_mailboxes(&self, mailbox: &str) -> Option<Vec<MailboxMetadata>> {
        self.cache.child_mailboxes(mailbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::testing::ScriptedConnector;

    fn model(connector: &ScriptedConnector) -> Model {
        Model::new(
            EngineConfig::default().with_credentials("user", "pass"),
            MemoryCache::new(),
            connector.clone(),
        )
    }

    #[test]
    fn refused_connection_goes_offline() {
        let connector = ScriptedConnector::new().refusing();
        let mut m = model(&connector);
        assert!(m.open_mailbox("INBOX").is_err());
        assert_eq!(m.network_policy(), NetworkPolicy::Offline);
        assert!(matches!(m.open_mailbox("INBOX"), Err(Error::Offline)));
        let events: Vec<_> = m.events().try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ConnectionError { .. })));
    }

    #[test]
    fn dependent_of_finished_task_starts_immediately() {
        let connector = ScriptedConnector::new().with_greeting("* PREAUTH [CAPABILITY IMAP4rev1] hi\r\n");
        let mut m = model(&connector);
        let any = m.get_any_connection().unwrap();
        m.poll();
        assert_eq!(m.task_state(any), Some(TaskState::Completed));

        let late = m.create_task(TaskKind::GetAnyConnection, Box::new(GetAnyConnectionTask::new()));
        m.add_dependent(any, late);
        assert_eq!(m.task_state(late), Some(TaskState::Completed));
    }

    #[test]
    fn failure_kills_dependents() {
        let connector = ScriptedConnector::new();
        let mut m = model(&connector);
        let (_, opener) = m.open_connection().unwrap();
        let dep = m.create_task(TaskKind::GetAnyConnection, Box::new(GetAnyConnectionTask::new()));
        m.add_dependent(opener, dep);
        assert_eq!(m.task_state(dep), Some(TaskState::Pending));
        m.task_failed(opener, "boom");
        assert_eq!(m.task_state(dep), Some(TaskState::Failed));
        assert_eq!(m.task_failure(dep), Some("boom"));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let connector = ScriptedConnector::new();
        let mut m = model(&connector);
        let t = m.create_task(TaskKind::GetAnyConnection, Box::new(GetAnyConnectionTask::new()));
        m.start_timer(t, TimerKind::Noop, Duration::from_secs(5));
        assert!(m.timer_active(t, TimerKind::Noop));
        let later = m.now() + Duration::from_secs(4);
        m.tick(later);
        assert!(m.timer_active(t, TimerKind::Noop));
        let later = m.now() + Duration::from_secs(2);
        m.tick(later);
        assert!(!m.timer_active(t, TimerKind::Noop));
    }
}
