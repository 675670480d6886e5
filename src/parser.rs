//! The boundary between the engine and the wire.
//!
//! Tasks talk to a server exclusively through the [`Parser`] trait: they hand it typed
//! [`Command`]s and get back the [`Tag`] the command was sent with, and the engine pulls decoded
//! [`Response`]s out of it. [`StreamParser`] is the implementation over a real byte stream.

use std::collections::VecDeque;
use std::io::{self, BufRead, Read, Write};

use bufstream::BufStream;
use chrono::{DateTime, FixedOffset};

use crate::conn::StartTls;
use crate::error::{Error, Result, ValidateError};
use crate::extensions::sort::{SortCriteria, SortCriterion, ThreadAlgorithm};
use crate::parse::{decode, Decoded};
use crate::types::{Flag, Response, Sequence, StateResponse, Tag};

static TAG_PREFIX: &str = "y";
const CR: u8 = 0x0d;
const LF: u8 = 0x0a;

macro_rules! quote {
    ($x:expr) => {
        format!("\"{}\"", $x.replace(r"\", r"\\").replace("\"", "\\\""))
    };
}

pub(crate) fn validate_str(synopsis: &str, arg_name: &str, value: &str) -> Result<String> {
    if let Some(c) = value.chars().find(|&c| c == '\r' || c == '\n') {
        return Err(Error::Validate(ValidateError {
            command_synopsis: synopsis.to_owned(),
            argument: arg_name.to_owned(),
            offending_char: c,
        }));
    }
    Ok(quote!(value))
}

/// How `STORE` combines the given flags with the existing ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    /// `+FLAGS`
    Add,
    /// `-FLAGS`
    Remove,
    /// `FLAGS`
    Replace,
}

/// A command the engine can ask a [`Parser`] to send.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Command {
    /// `CAPABILITY`
    Capability,
    /// `LOGIN user pass`
    Login {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// `STARTTLS`
    StartTls,
    /// `LOGOUT`
    Logout,
    /// `NOOP`
    Noop,
    /// `ID (...)`, [RFC 2971](https://tools.ietf.org/html/rfc2971).
    Id(Vec<(String, String)>),
    /// `ENABLE ...`, [RFC 5161](https://tools.ietf.org/html/rfc5161).
    Enable(Vec<String>),
    /// `SELECT mailbox`, optionally with the `CONDSTORE` parameter.
    Select {
        /// Mailbox to select.
        mailbox: String,
        /// Ask for `CONDSTORE`.
        condstore: bool,
    },
    /// `EXAMINE mailbox`
    Examine(String),
    /// `UNSELECT`, [RFC 3691](https://tools.ietf.org/html/rfc3691).
    Unselect,
    /// `LIST reference pattern`, optionally with `RETURN (...)`.
    List {
        /// Reference name.
        reference: String,
        /// Mailbox pattern.
        pattern: String,
        /// `RETURN` options of `LIST-EXTENDED`.
        return_options: Vec<String>,
    },
    /// `STATUS mailbox (items)`
    Status {
        /// Mailbox to ask about.
        mailbox: String,
        /// Status items.
        items: Vec<String>,
    },
    /// `NAMESPACE`
    Namespace,
    /// `CREATE mailbox`
    Create(String),
    /// `DELETE mailbox`
    Delete(String),
    /// `SUBSCRIBE mailbox`
    Subscribe(String),
    /// `UNSUBSCRIBE mailbox`
    Unsubscribe(String),
    /// `APPEND mailbox (flags) "date" {n}` followed by the message literal.
    Append {
        /// Target mailbox.
        mailbox: String,
        /// Flags to set on the new message.
        flags: Vec<Flag<'static>>,
        /// Internal date of the new message.
        internal_date: Option<DateTime<FixedOffset>>,
        /// The raw message.
        message: Vec<u8>,
    },
    /// `FETCH sequence (items)`
    Fetch {
        /// Message sequence numbers.
        sequence: Sequence,
        /// Data items.
        items: Vec<String>,
    },
    /// `UID FETCH uids (items)`
    UidFetch {
        /// Message UIDs.
        sequence: Sequence,
        /// Data items.
        items: Vec<String>,
    },
    /// `UID STORE uids [+-]FLAGS[.SILENT] (flags)`
    UidStore {
        /// Message UIDs.
        sequence: Sequence,
        /// How to combine the flags.
        mode: StoreMode,
        /// Suppress the untagged `FETCH` echo.
        silent: bool,
        /// The flags.
        flags: Vec<Flag<'static>>,
    },
    /// `UID SEARCH criteria`
    UidSearch(String),
    /// `UID SEARCH RETURN (options) criteria`, [RFC 4731](https://tools.ietf.org/html/rfc4731).
    UidESearch {
        /// Search criteria.
        criteria: String,
        /// `RETURN` options.
        return_options: Vec<String>,
    },
    /// `UID SORT (criteria) charset search`
    UidSort {
        /// Sort criteria.
        criteria: Vec<SortCriterion>,
        /// Charset of the search criteria.
        charset: String,
        /// Search criteria.
        search: String,
    },
    /// `UID SORT RETURN (options) (criteria) charset search`, [RFC 5267](https://tools.ietf.org/html/rfc5267).
    UidESort {
        /// Sort criteria.
        criteria: Vec<SortCriterion>,
        /// Charset of the search criteria.
        charset: String,
        /// Search criteria.
        search: String,
        /// `RETURN` options.
        return_options: Vec<String>,
    },
    /// `UID THREAD algorithm charset search`
    UidThread {
        /// Threading algorithm.
        algorithm: ThreadAlgorithm,
        /// Charset of the search criteria.
        charset: String,
        /// Search criteria.
        search: String,
    },
    /// `UID THREAD RETURN (options) algorithm charset search`
    UidEThread {
        /// Threading algorithm.
        algorithm: ThreadAlgorithm,
        /// Charset of the search criteria.
        charset: String,
        /// Search criteria.
        search: String,
        /// `RETURN` options.
        return_options: Vec<String>,
    },
    /// `CANCELUPDATE "tag" ...`, stopping persistent searches.
    CancelUpdate(Vec<Tag>),
    /// `UID COPY uids mailbox`
    UidCopy {
        /// Message UIDs.
        sequence: Sequence,
        /// Target mailbox.
        mailbox: String,
    },
    /// `UID MOVE uids mailbox`, [RFC 6851](https://tools.ietf.org/html/rfc6851).
    UidMove {
        /// Message UIDs.
        sequence: Sequence,
        /// Target mailbox.
        mailbox: String,
    },
    /// `EXPUNGE`
    Expunge,
    /// `UID EXPUNGE uids`, [RFC 4315](https://tools.ietf.org/html/rfc4315).
    UidExpunge(Sequence),
    /// `IDLE`, [RFC 2177](https://tools.ietf.org/html/rfc2177).
    Idle,
    /// `DONE`, which terminates a running `IDLE`. It has no tag of its own; the tag of the `IDLE`
    /// command is returned instead.
    IdleDone,
}

fn list(items: &[String]) -> String {
    format!("({})", items.join(" "))
}

fn flag_list(flags: &[Flag<'_>]) -> String {
    format!("({})", crate::utils::iter_join(flags, " "))
}

fn return_options(options: &[String]) -> String {
    if options.is_empty() {
        String::new()
    } else {
        format!(" RETURN {}", list(options))
    }
}

impl Command {
    /// Render the command (without its tag) and the literal which has to follow it, if any.
    pub(crate) fn render(&self) -> Result<(String, Option<Vec<u8>>)> {
        let line = match self {
            Command::Capability => "CAPABILITY".to_string(),
            Command::Login { username, password } => format!(
                "LOGIN {} {}",
                validate_str("LOGIN username password", "username", username)?,
                validate_str("LOGIN username password", "password", password)?
            ),
            Command::StartTls => "STARTTLS".to_string(),
            Command::Logout => "LOGOUT".to_string(),
            Command::Noop => "NOOP".to_string(),
            Command::Id(fields) => {
                if fields.is_empty() {
                    "ID NIL".to_string()
                } else {
                    let mut parts = Vec::with_capacity(fields.len() * 2);
                    for (k, v) in fields {
                        parts.push(validate_str("ID (field value)", "field", k)?);
                        parts.push(validate_str("ID (field value)", "value", v)?);
                    }
                    format!("ID ({})", parts.join(" "))
                }
            }
            Command::Enable(caps) => format!("ENABLE {}", caps.join(" ")),
            Command::Select { mailbox, condstore } => format!(
                "SELECT {}{}",
                validate_str("SELECT mailbox", "mailbox", mailbox)?,
                if *condstore { " (CONDSTORE)" } else { "" }
            ),
            Command::Examine(mailbox) => {
                format!("EXAMINE {}", validate_str("EXAMINE mailbox", "mailbox", mailbox)?)
            }
            Command::Unselect => "UNSELECT".to_string(),
            Command::List {
                reference,
                pattern,
                return_options: options,
            } => format!(
                "LIST {} {}{}",
                validate_str("LIST reference pattern", "reference", reference)?,
                validate_str("LIST reference pattern", "pattern", pattern)?,
                return_options(options)
            ),
            Command::Status { mailbox, items } => format!(
                "STATUS {} {}",
                validate_str("STATUS mailbox items", "mailbox", mailbox)?,
                list(items)
            ),
            Command::Namespace => "NAMESPACE".to_string(),
            Command::Create(mailbox) => {
                format!("CREATE {}", validate_str("CREATE mailbox", "mailbox", mailbox)?)
            }
            Command::Delete(mailbox) => {
                format!("DELETE {}", validate_str("DELETE mailbox", "mailbox", mailbox)?)
            }
            Command::Subscribe(mailbox) => format!(
                "SUBSCRIBE {}",
                validate_str("SUBSCRIBE mailbox", "mailbox", mailbox)?
            ),
            Command::Unsubscribe(mailbox) => format!(
                "UNSUBSCRIBE {}",
                validate_str("UNSUBSCRIBE mailbox", "mailbox", mailbox)?
            ),
            Command::Append {
                mailbox,
                flags,
                internal_date,
                message,
            } => {
                let mut line = format!(
                    "APPEND {}",
                    validate_str("APPEND mailbox", "mailbox", mailbox)?
                );
                if !flags.is_empty() {
                    line.push(' ');
                    line.push_str(&flag_list(flags));
                }
                if let Some(date) = internal_date {
                    line.push_str(&format!(" \"{}\"", date.format("%d-%b-%Y %H:%M:%S %z")));
                }
                line.push_str(&format!(" {{{}}}", message.len()));
                return Ok((line, Some(message.clone())));
            }
            Command::Fetch { sequence, items } => format!("FETCH {} {}", sequence, list(items)),
            Command::UidFetch { sequence, items } => {
                format!("UID FETCH {} {}", sequence, list(items))
            }
            Command::UidStore {
                sequence,
                mode,
                silent,
                flags,
            } => format!(
                "UID STORE {} {}FLAGS{} {}",
                sequence,
                match mode {
                    StoreMode::Add => "+",
                    StoreMode::Remove => "-",
                    StoreMode::Replace => "",
                },
                if *silent { ".SILENT" } else { "" },
                flag_list(flags)
            ),
            Command::UidSearch(criteria) => format!("UID SEARCH {}", criteria),
            Command::UidESearch {
                criteria,
                return_options: options,
            } => format!("UID SEARCH{} {}", return_options(options), criteria),
            Command::UidSort {
                criteria,
                charset,
                search,
            } => format!("UID SORT {} {} {}", SortCriteria(criteria), charset, search),
            Command::UidESort {
                criteria,
                charset,
                search,
                return_options: options,
            } => format!(
                "UID SORT{} {} {} {}",
                return_options(options),
                SortCriteria(criteria),
                charset,
                search
            ),
            Command::UidThread {
                algorithm,
                charset,
                search,
            } => format!("UID THREAD {} {} {}", algorithm, charset, search),
            Command::UidEThread {
                algorithm,
                charset,
                search,
                return_options: options,
            } => format!(
                "UID THREAD{} {} {} {}",
                return_options(options),
                algorithm,
                charset,
                search
            ),
            Command::CancelUpdate(tags) => format!(
                "CANCELUPDATE {}",
                crate::utils::iter_join(tags.iter().map(|t| quote!(t.as_str())), " ")
            ),
            Command::UidCopy { sequence, mailbox } => format!(
                "UID COPY {} {}",
                sequence,
                validate_str("UID COPY uids mailbox", "mailbox", mailbox)?
            ),
            Command::UidMove { sequence, mailbox } => format!(
                "UID MOVE {} {}",
                sequence,
                validate_str("UID MOVE uids mailbox", "mailbox", mailbox)?
            ),
            Command::Expunge => "EXPUNGE".to_string(),
            Command::UidExpunge(sequence) => format!("UID EXPUNGE {}", sequence),
            Command::Idle => "IDLE".to_string(),
            Command::IdleDone => "DONE".to_string(),
        };
        Ok((line, None))
    }

    /// The rendered command with credentials masked, for logs.
    pub fn to_log_string(&self) -> String {
        match self {
            Command::Login { .. } => "LOGIN <credentials hidden>".to_string(),
            Command::Append {
                mailbox, message, ..
            } => format!("APPEND {:?} <{} bytes>", mailbox, message.len()),
            other => match other.render() {
                Ok((line, _)) => line,
                Err(e) => format!("<invalid command: {}>", e),
            },
        }
    }
}

/// The engine's view of one IMAP protocol session.
///
/// Commands are sent immediately and answered with the tag they were sent with. Responses are
/// pulled with [`Parser::next_response`], which never blocks: `None` means that nothing has
/// arrived yet. Transport problems are delivered in-band as [`Response::SocketDisconnected`] and
/// [`Response::ParseError`].
pub trait Parser {
    /// Send `command`, returning its tag.
    fn send(&mut self, command: Command) -> Result<Tag>;

    /// The next decoded response, if one is available.
    fn next_response(&mut self) -> Option<Response>;
}

/// Creates fresh connections to the server.
pub trait Connector {
    /// Open a new transport and wrap it in a [`Parser`].
    fn connect(&mut self) -> Result<Box<dyn Parser>>;

    /// Whether connections must be upgraded with `STARTTLS` before logging in.
    fn start_tls_required(&self) -> bool {
        false
    }
}

struct Outgoing {
    tag: Option<Tag>,
    line: Vec<u8>,
    literal: Option<Vec<u8>>,
}

// The line may carry credentials in clear text.
impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Outgoing({:?})", self.tag)
    }
}

/// A [`Parser`] speaking IMAP over any `Read + Write` stream.
///
/// Tags are `y0`, `y1`, ... within one connection. `APPEND` literals are held back until the
/// server asks for them, and so are the commands queued after them. The `+ idling` continuation is
/// swallowed. After a successful `STARTTLS` the stream is upgraded in place and
/// [`Response::SocketEncrypted`] is delivered right after the tagged `OK`.
#[derive(Debug)]
pub struct StreamParser<T: Read + Write + StartTls> {
    stream: BufStream<T>,
    tag: u32,
    buffer: Vec<u8>,
    queue: VecDeque<Response>,
    starttls_tag: Option<Tag>,
    idle_tag: Option<Tag>,
    awaiting_literal: Option<(Tag, Vec<u8>)>,
    blocked: VecDeque<Outgoing>,
    disconnected: bool,
}

impl<T: Read + Write + StartTls> StreamParser<T> {
    /// Wrap an unencrypted stream.
    pub fn new(stream: T) -> Self {
        StreamParser {
            stream: BufStream::new(stream),
            tag: 0,
            buffer: Vec::new(),
            queue: VecDeque::new(),
            starttls_tag: None,
            idle_tag: None,
            awaiting_literal: None,
            blocked: VecDeque::new(),
            disconnected: false,
        }
    }

    /// Wrap a stream which has already finished its TLS handshake.
    ///
    /// The certificate chain and its validation problems are reported as the very first
    /// response, ahead of the server greeting.
    pub fn new_encrypted(stream: T, chain: Vec<Vec<u8>>, errors: Vec<String>) -> Self {
        let mut parser = Self::new(stream);
        parser
            .queue
            .push_back(Response::SocketEncrypted { chain, errors });
        parser
    }

    /// Access the underlying stream.
    pub fn get_ref(&self) -> &T {
        self.stream.get_ref()
    }

    fn next_tag(&mut self) -> Tag {
        let tag = Tag(format!("{}{}", TAG_PREFIX, self.tag));
        self.tag += 1;
        tag
    }

    fn write_line(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        self.stream.write_all(&[CR, LF])?;
        self.stream.flush()?;
        Ok(())
    }

    /// Write queued commands until one of them needs to wait for a continuation.
    fn pump(&mut self) -> Result<()> {
        while self.awaiting_literal.is_none() {
            let out = match self.blocked.pop_front() {
                Some(out) => out,
                None => break,
            };
            self.write_line(&out.line)?;
            if let (Some(tag), Some(literal)) = (out.tag, out.literal) {
                self.awaiting_literal = Some((tag, literal));
            }
        }
        Ok(())
    }

    fn on_continuation(&mut self, text: &str) -> Result<()> {
        if let Some((_, literal)) = self.awaiting_literal.take() {
            log::trace!("C: <{} bytes of literal data>", literal.len());
            self.write_line(&literal)?;
            return self.pump();
        }
        if self.idle_tag.is_some() {
            log::trace!("S: + {}", text);
            return Ok(());
        }
        log::warn!("Unexpected continuation request: {}", text);
        Ok(())
    }

    fn on_tagged(&mut self, resp: &StateResponse) {
        let tag = match resp.tag {
            Some(ref tag) => tag,
            None => return,
        };
        if self.idle_tag.as_ref() == Some(tag) {
            self.idle_tag = None;
        }
        if self
            .awaiting_literal
            .as_ref()
            .map(|(t, _)| t == tag)
            .unwrap_or(false)
        {
            self.awaiting_literal = None;
            if let Err(e) = self.pump() {
                self.lose_connection(e.to_string());
            }
        }
        if self.starttls_tag.as_ref() == Some(tag) {
            self.starttls_tag = None;
            if resp.kind == crate::types::StateKind::Ok {
                match self.stream.get_mut().start_tls() {
                    Ok((chain, errors)) => {
                        log::debug!("STARTTLS handshake finished");
                        self.queue
                            .push_back(Response::SocketEncrypted { chain, errors });
                    }
                    Err(e) => self.lose_connection(format!("STARTTLS handshake failed: {}", e)),
                }
            }
        }
    }

    fn lose_connection(&mut self, reason: String) {
        if !self.disconnected {
            self.disconnected = true;
            self.queue.push_back(Response::SocketDisconnected(reason));
        }
    }

    /// Read more input. Returns `false` when nothing is available right now.
    fn fill(&mut self) -> std::result::Result<bool, String> {
        match self.stream.read_until(LF, &mut self.buffer) {
            Ok(0) => Err("Connection closed by the server".to_string()),
            Ok(_) => Ok(true),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(false)
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(e) => Err(e.to_string()),
        }
    }
}

impl<T: Read + Write + StartTls> Parser for StreamParser<T> {
    fn send(&mut self, command: Command) -> Result<Tag> {
        if self.disconnected {
            return Err(Error::ConnectionLost);
        }
        let (line, literal) = command.render()?;

        if command == Command::IdleDone {
            let tag = self.idle_tag.clone().ok_or_else(|| {
                Error::InvalidInput("DONE sent while no IDLE is running".to_string())
            })?;
            log::trace!("C: DONE");
            self.write_line(line.as_bytes())?;
            return Ok(tag);
        }

        let tag = self.next_tag();
        log::trace!("C: {} {}", tag, command.to_log_string());
        match command {
            Command::StartTls => self.starttls_tag = Some(tag.clone()),
            Command::Idle => self.idle_tag = Some(tag.clone()),
            _ => {}
        }
        let out = Outgoing {
            tag: Some(tag.clone()),
            line: format!("{} {}", tag, line).into_bytes(),
            literal,
        };
        self.blocked.push_back(out);
        self.pump()?;
        Ok(tag)
    }

    fn next_response(&mut self) -> Option<Response> {
        loop {
            if let Some(resp) = self.queue.pop_front() {
                return Some(resp);
            }
            if self.disconnected {
                return None;
            }

            match decode(&self.buffer) {
                Ok(Decoded::Response(resp, used)) => {
                    log::trace!(
                        "S: {}",
                        String::from_utf8_lossy(&self.buffer[..used]).trim_end()
                    );
                    self.buffer.drain(..used);
                    if let Response::State(ref state) = resp {
                        self.on_tagged(state);
                    }
                    return Some(resp);
                }
                Ok(Decoded::Continuation(text, used)) => {
                    self.buffer.drain(..used);
                    if let Err(e) = self.on_continuation(&text) {
                        self.lose_connection(e.to_string());
                    }
                }
                Ok(Decoded::Incomplete) => match self.fill() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(reason) => self.lose_connection(reason),
                },
                Err(e) => {
                    let end = self
                        .buffer
                        .iter()
                        .position(|&b| b == LF)
                        .map(|p| p + 1)
                        .unwrap_or(self.buffer.len());
                    let line: Vec<u8> = self.buffer.drain(..end).collect();
                    log::warn!("Cannot parse {:?}: {}", String::from_utf8_lossy(&line), e);
                    return Some(Response::ParseError {
                        message: e.to_string(),
                        line,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_stream::MockStream;
    use crate::types::{NumberResponse, StateKind};

    fn written(parser: &StreamParser<MockStream>) -> String {
        String::from_utf8(parser.get_ref().written_buf.clone()).unwrap()
    }

    #[test]
    fn tags_are_unique_and_sequential() {
        let mut parser = StreamParser::new(MockStream::default());
        let a = parser.send(Command::Noop).unwrap();
        let b = parser.send(Command::Capability).unwrap();
        assert_eq!(a.as_str(), "y0");
        assert_eq!(b.as_str(), "y1");
        assert_eq!(written(&parser), "y0 NOOP\r\ny1 CAPABILITY\r\n");
    }

    #[test]
    fn responses_are_decoded_in_order() {
        let mut parser = StreamParser::new(MockStream::new(
            b"* 3 EXISTS\r\ny0 OK done\r\n".to_vec(),
        ));
        assert_eq!(
            parser.next_response(),
            Some(Response::Number(NumberResponse::Exists(3)))
        );
        match parser.next_response() {
            Some(Response::State(s)) => {
                assert_eq!(s.tag, Some(Tag::new("y0")));
                assert_eq!(s.kind, StateKind::Ok);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parser.next_response(), None);
    }

    #[test]
    fn partial_input_waits_for_more() {
        let mut parser =
            StreamParser::new(MockStream::new(b"* 1 FETCH (UID 5 BODY[1] {4}\r\nab".to_vec()));
        assert_eq!(parser.next_response(), None);
    }

    #[test]
    fn eof_becomes_disconnect() {
        let mut parser = StreamParser::new(MockStream::default().with_eof());
        assert!(matches!(
            parser.next_response(),
            Some(Response::SocketDisconnected(_))
        ));
        assert_eq!(parser.next_response(), None);
        assert!(parser.send(Command::Noop).is_err());
    }

    #[test]
    fn garbage_becomes_parse_error() {
        let mut parser = StreamParser::new(MockStream::new(b"* FOOBAR baz\r\n* 2 EXISTS\r\n".to_vec()));
        assert!(matches!(
            parser.next_response(),
            Some(Response::ParseError { .. })
        ));
        assert_eq!(
            parser.next_response(),
            Some(Response::Number(NumberResponse::Exists(2)))
        );
    }

    #[test]
    fn append_literal_waits_for_continuation() {
        let mut parser = StreamParser::new(MockStream::new(b"+ go ahead\r\ny0 OK appended\r\n".to_vec()));
        parser
            .send(Command::Append {
                mailbox: "Sent".to_string(),
                flags: vec![Flag::Seen],
                internal_date: None,
                message: b"hi".to_vec(),
            })
            .unwrap();
        parser.send(Command::Noop).unwrap();
        assert_eq!(written(&parser), "y0 APPEND \"Sent\" (\\Seen) {2}\r\n");
        assert!(matches!(parser.next_response(), Some(Response::State(_))));
        assert_eq!(
            written(&parser),
            "y0 APPEND \"Sent\" (\\Seen) {2}\r\nhi\r\ny1 NOOP\r\n"
        );
    }

    #[test]
    fn idle_continuation_is_swallowed() {
        let mut parser = StreamParser::new(MockStream::new(
            b"+ idling\r\n* 4 EXISTS\r\ny0 OK idle done\r\n".to_vec(),
        ));
        let idle = parser.send(Command::Idle).unwrap();
        assert_eq!(
            parser.next_response(),
            Some(Response::Number(NumberResponse::Exists(4)))
        );
        assert_eq!(parser.send(Command::IdleDone).unwrap(), idle);
        assert!(matches!(parser.next_response(), Some(Response::State(_))));
        assert_eq!(written(&parser), "y0 IDLE\r\nDONE\r\n");
        assert!(parser.send(Command::IdleDone).is_err());
    }

    #[test]
    fn starttls_upgrade_follows_tagged_ok() {
        let mut parser = StreamParser::new(MockStream::new(b"y0 OK begin TLS\r\n".to_vec()));
        parser.send(Command::StartTls).unwrap();
        assert!(matches!(parser.next_response(), Some(Response::State(_))));
        assert!(matches!(
            parser.next_response(),
            Some(Response::SocketEncrypted { .. })
        ));
        assert!(parser.get_ref().upgraded);
    }

    #[test]
    fn command_rendering() {
        let seq = Sequence::from_list(vec![1, 2, 3, 7]).unwrap();
        let cases = vec![
            (
                Command::UidStore {
                    sequence: seq.clone(),
                    mode: StoreMode::Add,
                    silent: true,
                    flags: vec![Flag::Deleted],
                },
                "UID STORE 1:3,7 +FLAGS.SILENT (\\Deleted)",
            ),
            (
                Command::UidFetch {
                    sequence: Sequence::starting_at(11),
                    items: vec!["FLAGS".to_string()],
                },
                "UID FETCH 11:* (FLAGS)",
            ),
            (
                Command::UidESort {
                    criteria: vec![SortCriterion::Arrival],
                    charset: "utf-8".to_string(),
                    search: "ALL".to_string(),
                    return_options: vec!["ALL".to_string(), "UPDATE".to_string()],
                },
                "UID SORT RETURN (ALL UPDATE) (ARRIVAL) utf-8 ALL",
            ),
            (
                Command::List {
                    reference: "".to_string(),
                    pattern: "INBOX.%".to_string(),
                    return_options: vec![],
                },
                "LIST \"\" \"INBOX.%\"",
            ),
            (
                Command::CancelUpdate(vec![Tag::new("y3")]),
                "CANCELUPDATE \"y3\"",
            ),
        ];
        for (cmd, expected) in cases {
            assert_eq!(cmd.render().unwrap().0, expected);
        }
    }

    #[test]
    fn quote_backslash() {
        assert_eq!("\"test\\\\text\"", quote!(r"test\text"));
    }

    #[test]
    fn quote_dquote() {
        assert_eq!("\"test\\\"text\"", quote!("test\"text"));
    }

    #[test]
    fn validate_random() {
        assert_eq!(
            "\"~iCQ_k;>[&\\\"sVCvUW`e<<P!wJ\"",
            &validate_str("COMMAND", "arg1", "~iCQ_k;>[&\"sVCvUW`e<<P!wJ").unwrap()
        );
    }

    #[test]
    fn validate_newline() {
        match validate_str("COMMAND", "arg1", "test\nstring") {
            Err(Error::Validate(ref ve)) => {
                assert_eq!(ve.offending_char, '\n');
                assert_eq!(ve.argument, "arg1");
            }
            other => panic!("Wrong result: {:?}", other),
        }
    }

    #[test]
    fn login_with_newline_is_rejected_before_sending() {
        let mut parser = StreamParser::new(MockStream::default());
        let res = parser.send(Command::Login {
            username: "user".to_string(),
            password: "pa\rss".to_string(),
        });
        assert!(matches!(res, Err(Error::Validate(_))));
        assert!(parser.get_ref().written_buf.is_empty());
    }
}
