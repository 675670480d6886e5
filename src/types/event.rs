use super::{
    Capabilities, ConnId, ConnectionState, IncrementalUpdate, MailboxId, TaskId, ThreadNode, Uid,
};

/// Whether the engine may use the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkPolicy {
    /// No connections are opened; requests that need one fail with
    /// [`Error::Offline`](crate::Error::Offline).
    Offline,
    /// Connections may be used, but the consumer should avoid unnecessary traffic.
    Expensive,
    /// No restrictions.
    Online,
}

/// Where a tree notification happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeIndex {
    /// The list of child mailboxes of a mailbox.
    Mailboxes(MailboxId),
    /// The message list of a mailbox.
    Messages(MailboxId),
    /// A single message, by its position in the message list.
    Message {
        /// The mailbox the message lives in.
        mailbox: MailboxId,
        /// Zero-based position of the message.
        offset: usize,
    },
    /// The mailbox node itself (its counters or attributes).
    Mailbox(MailboxId),
}

/// Where a task is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for the task it depends on.
    Pending,
    /// Running on a connection.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished with a failure; see [`Model::task_failure`](crate::Model::task_failure).
    Failed,
}

/// Everything the engine reports to its consumer.
///
/// Events are delivered through the receiver returned by [`Model::events`](crate::Model::events)
/// in the order they happened. Structural changes of the mailbox tree always come as a pair of
/// `...AboutToBe...` and the matching completion event around the actual mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// A connection moved to a new state.
    ConnectionStateChanged {
        /// The connection.
        conn: ConnId,
        /// Its new state.
        state: ConnectionState,
    },
    /// A connection failed and was torn down, or its mailbox can no longer be trusted.
    ConnectionError {
        /// The connection.
        conn: ConnId,
        /// What went wrong, for humans.
        message: String,
    },
    /// The server sent an `[ALERT]` which must be shown to the user.
    Alert {
        /// The connection.
        conn: ConnId,
        /// The alert text.
        message: String,
    },
    /// Credentials are needed for logging in; answer with
    /// [`Model::set_credentials`](crate::Model::set_credentials) or
    /// [`Model::cancel_authentication`](crate::Model::cancel_authentication).
    AuthRequested {
        /// The connection waiting for them.
        conn: ConnId,
        /// Why the previous attempt failed, if there was one.
        error: Option<String>,
    },
    /// A TLS chain needs a decision; answer with
    /// [`Model::set_ssl_policy`](crate::Model::set_ssl_policy).
    SslPolicyRequired {
        /// The connection waiting for it.
        conn: ConnId,
        /// DER-encoded certificates.
        chain: Vec<Vec<u8>>,
        /// Problems found while validating the chain.
        errors: Vec<String>,
    },
    /// The engine changed its network policy, typically to offline after a connection failure.
    NetworkPolicyChanged(NetworkPolicy),
    /// A connection learned a fresh capability set.
    CapabilitiesUpdated {
        /// The connection.
        conn: ConnId,
        /// The capabilities.
        capabilities: Capabilities,
    },
    /// Rows `first..=last` are about to be inserted under `parent`.
    RowsAboutToBeInserted {
        /// Where.
        parent: TreeIndex,
        /// First new row.
        first: usize,
        /// Last new row.
        last: usize,
    },
    /// The insertion announced by the previous `RowsAboutToBeInserted` has happened.
    RowsInserted {
        /// Where.
        parent: TreeIndex,
        /// First new row.
        first: usize,
        /// Last new row.
        last: usize,
    },
    /// Rows `first..=last` are about to be removed from `parent`.
    RowsAboutToBeRemoved {
        /// Where.
        parent: TreeIndex,
        /// First removed row.
        first: usize,
        /// Last removed row.
        last: usize,
    },
    /// The removal announced by the previous `RowsAboutToBeRemoved` has happened.
    RowsRemoved {
        /// Where.
        parent: TreeIndex,
        /// First removed row.
        first: usize,
        /// Last removed row.
        last: usize,
    },
    /// Attributes of a single node changed in place.
    DataChanged(TreeIndex),
    /// The message counters of a mailbox changed.
    MessageCountChanged(MailboxId),
    /// A task finished successfully.
    TaskCompleted(TaskId),
    /// A task failed.
    TaskFailed {
        /// The task.
        task: TaskId,
        /// Why, for humans.
        reason: String,
    },
    /// The initial result of a sort request, as UIDs.
    SortResult {
        /// The sort task.
        task: TaskId,
        /// Sorted UIDs.
        uids: Vec<Uid>,
    },
    /// An incremental change to the result of a persistent sort.
    SortUpdate {
        /// The sort task.
        task: TaskId,
        /// The change.
        update: IncrementalUpdate,
    },
    /// The server or the consumer stopped the updates of a persistent sort.
    SortUpdatesStopped(TaskId),
    /// The result of a thread request.
    ThreadResult {
        /// The thread task.
        task: TaskId,
        /// Thread roots.
        threads: Vec<ThreadNode>,
    },
    /// New threads to merge into a previous result, with the UID of the thread root they
    /// follow (`0` for "at the start").
    ThreadUpdate {
        /// The thread task.
        task: TaskId,
        /// `(previous root, threads)` pairs.
        updates: Vec<(Uid, Vec<ThreadNode>)>,
    },
}
