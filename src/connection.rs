use std::collections::BTreeMap;
use std::fmt;

use crate::parser::Parser;
use crate::types::{
    Capabilities, ConnId, ConnectionState, ListResponse, MailboxId, NamespaceResponse, TaskId,
};

/// Everything the engine tracks about one connection.
///
/// The connection exclusively owns its [`Parser`]; tasks reach the wire only through the
/// model, which looks the connection up by its [`ConnId`].
pub struct Connection {
    pub(crate) id: ConnId,
    pub(crate) parser: Box<dyn Parser>,
    pub(crate) state: ConnectionState,
    pub(crate) capabilities: Capabilities,
    pub(crate) capabilities_fresh: bool,
    pub(crate) encrypted: bool,
    /// Tasks running on this connection, in activation order.
    pub(crate) active_tasks: Vec<TaskId>,
    /// The task keeping a mailbox selected here.
    pub(crate) maintaining_task: Option<TaskId>,
    pub(crate) selected_mailbox: Option<MailboxId>,
    /// `LIST` responses nobody claimed, waiting for the task that asked for them.
    pub(crate) list_responses: Vec<ListResponse>,
    pub(crate) namespace: Option<NamespaceResponse>,
    pub(crate) server_id: Option<BTreeMap<String, String>>,
    pub(crate) enabled: Vec<String>,
    /// Waiting for a TLS policy decision; no responses are read meanwhile.
    pub(crate) suspended: bool,
    /// Torn down; nothing is sent or read any more.
    pub(crate) closed: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("active_tasks", &self.active_tasks)
            .field("maintaining_task", &self.maintaining_task)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(id: ConnId, parser: Box<dyn Parser>) -> Self {
        Connection {
            id,
            parser,
            state: ConnectionState::None,
            capabilities: Capabilities::default(),
            capabilities_fresh: false,
            encrypted: false,
            active_tasks: Vec::new(),
            maintaining_task: None,
            selected_mailbox: None,
            list_responses: Vec::new(),
            namespace: None,
            server_id: None,
            enabled: Vec::new(),
            suspended: false,
            closed: false,
        }
    }

    /// The connection's id.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Where the connection is in its life.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The last capability set the server reported.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Whether [`Connection::capabilities`] still apply.
    pub fn capabilities_fresh(&self) -> bool {
        self.capabilities_fresh
    }

    /// Whether the server advertises `cap`; stale capabilities count as not advertised.
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities_fresh && self.capabilities.has(cap)
    }

    /// Whether the connection is still usable.
    pub fn is_live(&self) -> bool {
        !self.closed && self.state != ConnectionState::Logout
    }

    /// Whether the transport is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Tasks running on the connection.
    pub fn active_tasks(&self) -> &[TaskId] {
        &self.active_tasks
    }

    /// The task keeping a mailbox selected on this connection.
    pub fn maintaining_task(&self) -> Option<TaskId> {
        self.maintaining_task
    }

    /// The mailbox selected on this connection.
    pub fn selected_mailbox(&self) -> Option<MailboxId> {
        self.selected_mailbox
    }

    /// The server's `NAMESPACE`.
    pub fn namespace(&self) -> Option<&NamespaceResponse> {
        self.namespace.as_ref()
    }

    /// What the server said about itself through `ID`.
    pub fn server_id(&self) -> Option<&BTreeMap<String, String>> {
        self.server_id.as_ref()
    }

    /// Extensions switched on through `ENABLE`.
    pub fn enabled(&self) -> &[String] {
        &self.enabled
    }

    /// Whether the engine may move the connection to `next`.
    ///
    /// `LOGOUT` is terminal. Until the connection is authenticated it only ever moves forward;
    /// afterwards it moves freely among the authenticated states.
    pub(crate) fn can_move_to(&self, next: ConnectionState) -> bool {
        if self.state == ConnectionState::Logout {
            return false;
        }
        if next == ConnectionState::Logout {
            return true;
        }
        if self.state.is_authenticated() {
            next.is_authenticated()
        } else {
            next >= self.state
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedParser;

    fn conn(state: ConnectionState) -> Connection {
        let mut c = Connection::new(ConnId(0), Box::new(ScriptedParser::new()));
        c.state = state;
        c
    }

    #[test]
    fn logout_is_terminal() {
        let c = conn(ConnectionState::Logout);
        assert!(!c.can_move_to(ConnectionState::Authenticated));
        assert!(!c.can_move_to(ConnectionState::Logout));
    }

    #[test]
    fn handshake_only_moves_forward() {
        let c = conn(ConnectionState::Login);
        assert!(c.can_move_to(ConnectionState::Authenticated));
        assert!(!c.can_move_to(ConnectionState::ConnectedPretlsPrecaps));
        assert!(c.can_move_to(ConnectionState::Logout));
    }

    #[test]
    fn authenticated_band_moves_freely() {
        let c = conn(ConnectionState::Selected);
        assert!(c.can_move_to(ConnectionState::Authenticated));
        assert!(c.can_move_to(ConnectionState::Selecting));
    }
}
