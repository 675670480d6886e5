//! Enable the test_helpers feature to drive an engine against a scripted server instead of a
//! real one.
//!
//! To use it add a dev-dependency on the crate with the feature "test_helpers", e.g.
//!
//! ```toml
//! [dependencies]
//! imap-engine = { version = "0.1" }
//!
//! [dev-dependencies]
//! # mirror the same configuration your dependencies and add test_helpers
//! imap-engine = { version = "0.1", features = ["test_helpers"] }
//! ```
//!
//! A [`ScriptedConnector`] hands out [`ScriptedParser`]s; keep a clone of the connector to get
//! at the [`ScriptHandle`] of every connection the engine opened, inspect the commands it sent
//! and feed it server responses.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::parse::{decode, Decoded};
use crate::parser::{Command, Connector, Parser};
use crate::types::{Response, Tag, Uid};

/// Methods to build [`Response`] objects from server text
pub mod responses {
    use crate::parse::{decode, Decoded};
    use crate::types::Response;

    /// Decodes every complete response in `input`.
    ///
    /// Example input.
    ///
    /// ```
    /// let input = "\
    /// * 24 FETCH (FLAGS (\\Seen) UID 4827943)\r\n\
    /// y0 OK done\r\n\
    /// ";
    /// let responses = imap_engine::testing::responses::parse(input);
    /// assert_eq!(responses.len(), 2);
    /// ```
    pub fn parse(input: impl Into<Vec<u8>>) -> Vec<Response> {
        let input = input.into();
        let mut rest = &input[..];
        let mut out = Vec::new();
        while let Ok(Decoded::Response(resp, used)) = decode(rest) {
            out.push(resp);
            rest = &rest[used..];
        }
        out
    }
}

#[derive(Debug, Default)]
struct Script {
    next_tag: u32,
    sent: Vec<(Tag, Command)>,
    pending: VecDeque<Response>,
    idle_tag: Option<Tag>,
    closed: bool,
}

/// A [`Parser`] without a wire: it records commands and returns responses pushed through its
/// [`ScriptHandle`].
#[derive(Debug, Default)]
pub struct ScriptedParser {
    script: Rc<RefCell<Script>>,
}

/// The test's end of a [`ScriptedParser`].
#[derive(Clone, Debug)]
pub struct ScriptHandle {
    script: Rc<RefCell<Script>>,
}

impl ScriptedParser {
    /// A parser with nothing to say.
    pub fn new() -> Self {
        ScriptedParser::default()
    }

    /// A handle for driving this parser.
    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle {
            script: Rc::clone(&self.script),
        }
    }
}

impl Parser for ScriptedParser {
    fn send(&mut self, command: Command) -> Result<Tag> {
        let mut script = self.script.borrow_mut();
        if script.closed {
            return Err(Error::ConnectionLost);
        }
        command.render()?;
        let tag = if command == Command::IdleDone {
            script.idle_tag.take().ok_or_else(|| {
                Error::InvalidInput("DONE sent while no IDLE is running".to_string())
            })?
        } else {
            let tag = Tag(format!("y{}", script.next_tag));
            script.next_tag += 1;
            if command == Command::Idle {
                script.idle_tag = Some(tag.clone());
            }
            tag
        };
        log::trace!("C: {} {}", tag, command.to_log_string());
        script.sent.push((tag.clone(), command));
        Ok(tag)
    }

    fn next_response(&mut self) -> Option<Response> {
        self.script.borrow_mut().pending.pop_front()
    }
}

impl ScriptHandle {
    /// Queue a decoded response.
    pub fn push(&self, resp: Response) {
        self.script.borrow_mut().pending.push_back(resp);
    }

    /// Queue every response in the given server text.
    ///
    /// # Panics
    ///
    /// When the text does not decode completely.
    pub fn server(&self, text: &str) {
        let mut rest = text.as_bytes();
        while !rest.is_empty() {
            match decode(rest) {
                Ok(Decoded::Response(resp, used)) => {
                    self.push(resp);
                    rest = &rest[used..];
                }
                Ok(Decoded::Continuation(_, used)) => rest = &rest[used..],
                other => panic!("cannot decode {:?}: {:?}", String::from_utf8_lossy(rest), other),
            }
        }
    }

    /// Make every further command fail as if the socket was gone.
    pub fn close(&self) {
        self.script.borrow_mut().closed = true;
    }

    /// Every command sent so far, with its tag.
    pub fn sent(&self) -> Vec<(Tag, Command)> {
        self.script.borrow().sent.clone()
    }

    /// Every command sent so far, rendered as on the wire without the tag.
    pub fn sent_lines(&self) -> Vec<String> {
        self.script
            .borrow()
            .sent
            .iter()
            .map(|(_, c)| c.to_log_string())
            .collect()
    }

    /// Forget the commands sent so far, returning them rendered.
    pub fn take_lines(&self) -> Vec<String> {
        let lines = self.sent_lines();
        self.script.borrow_mut().sent.clear();
        lines
    }

    /// Tag of the most recent command whose rendering starts with `prefix`.
    ///
    /// # Panics
    ///
    /// When no such command was sent.
    pub fn tag_of(&self, prefix: &str) -> Tag {
        self.script
            .borrow()
            .sent
            .iter()
            .rev()
            .find(|(_, c)| c.to_log_string().starts_with(prefix))
            .map(|(t, _)| t.clone())
            .unwrap_or_else(|| panic!("no command starting with {:?} was sent", prefix))
    }

    /// Whether there are responses the engine did not read yet.
    pub fn has_pending(&self) -> bool {
        !self.script.borrow().pending.is_empty()
    }
}

/// A [`Connector`] producing [`ScriptedParser`]s.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    connections: Rc<RefCell<Vec<ScriptHandle>>>,
    greeting: Option<String>,
    refuse: bool,
    starttls: bool,
}

impl ScriptedConnector {
    /// A connector whose connections start silent.
    pub fn new() -> Self {
        ScriptedConnector::default()
    }

    /// Pre-load every new connection with this server text, usually a greeting.
    pub fn with_greeting(mut self, text: &str) -> Self {
        self.greeting = Some(text.to_owned());
        self
    }

    /// Fail every connection attempt.
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Ask the engine to upgrade with `STARTTLS` before logging in.
    pub fn with_starttls(mut self) -> Self {
        self.starttls = true;
        self
    }

    /// The handle of the `n`-th connection opened through this connector.
    ///
    /// # Panics
    ///
    /// When fewer connections were opened.
    pub fn connection(&self, n: usize) -> ScriptHandle {
        self.connections.borrow()[n].clone()
    }

    /// How many connections were opened.
    pub fn count(&self) -> usize {
        self.connections.borrow().len()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&mut self) -> Result<Box<dyn Parser>> {
        if self.refuse {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        let parser = ScriptedParser::new();
        let handle = parser.handle();
        if let Some(ref greeting) = self.greeting {
            handle.server(greeting);
        }
        self.connections.borrow_mut().push(handle);
        Ok(Box::new(parser))
    }

    fn start_tls_required(&self) -> bool {
        self.starttls
    }
}

/// Play the server side of a first-time `SELECT` and the full synchronization which follows,
/// leaving the mailbox open with one message per entry of `uids` (ascending, no flags).
///
/// The engine must have sent `SELECT` on `handle` already, and the connection must not
/// advertise `ESEARCH`.
pub fn synchronize(model: &mut Model, handle: &ScriptHandle, uids: &[Uid]) {
    let uid_next = uids.iter().max().map(|u| u + 1).unwrap_or(1);
    handle.server(&format!(
        "* {} EXISTS\r\n* OK [UIDVALIDITY 1] uids valid\r\n* OK [UIDNEXT {}] next\r\n\
         {} OK [READ-WRITE] selected\r\n",
        uids.len(),
        uid_next,
        handle.tag_of("SELECT")
    ));
    model.poll();
    if uids.is_empty() {
        return;
    }
    let found = crate::utils::iter_join(uids, " ");
    handle.server(&format!(
        "* SEARCH {}\r\n{} OK searched\r\n",
        found,
        handle.tag_of("UID SEARCH")
    ));
    model.poll();
    let mut text = String::new();
    for seq in 1..=uids.len() {
        text.push_str(&format!("* {} FETCH (FLAGS ())\r\n", seq));
    }
    text.push_str(&format!("{} OK fetched\r\n", handle.tag_of("FETCH ")));
    handle.server(&text);
    model.poll();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_commands_and_replays_responses() {
        let mut p = ScriptedParser::new();
        let h = p.handle();
        let t = p.send(Command::Noop).unwrap();
        assert_eq!(t.as_str(), "y0");
        h.server("* 2 EXISTS\r\ny0 OK noop\r\n");
        assert!(p.next_response().is_some());
        assert!(p.next_response().is_some());
        assert!(p.next_response().is_none());
        assert_eq!(h.sent_lines(), vec!["NOOP"]);
        assert_eq!(h.tag_of("NOOP"), t);
    }

    #[test]
    fn done_returns_idle_tag() {
        let mut p = ScriptedParser::new();
        let idle = p.send(Command::Idle).unwrap();
        assert_eq!(p.send(Command::IdleDone).unwrap(), idle);
        assert!(p.send(Command::IdleDone).is_err());
    }
}
