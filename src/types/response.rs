use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

use chrono::{DateTime, FixedOffset};

use super::{Capabilities, Flag, Seq, Uid};

/// A per-connection command correlation key.
///
/// Minted by the [`Parser`](crate::Parser) when a command is sent, echoed back by the server in
/// the tagged completion of that command.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub(crate) String);

impl Tag {
    /// Wrap a tag string received from (or destined for) the wire.
    pub fn new<S: Into<String>>(s: S) -> Self {
        Tag(s.into())
    }

    /// The tag as it appears on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind of a status response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateKind {
    /// `OK`
    Ok,
    /// `NO`
    No,
    /// `BAD`
    Bad,
    /// `PREAUTH`, only valid as a greeting.
    PreAuth,
    /// `BYE`
    Bye,
}

/// A response code, the bracketed part of a status response.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum RespCode {
    /// `[ALERT]`: the text must be shown to the user.
    Alert,
    /// `[BADCHARSET]`
    BadCharset(Vec<String>),
    /// `[CAPABILITY ...]` piggy-backed on a status response.
    Capabilities(Capabilities),
    /// `[PARSE]`
    Parse,
    /// `[PERMANENTFLAGS (...)]`
    PermanentFlags(Vec<Flag<'static>>),
    /// `[READ-ONLY]`
    ReadOnly,
    /// `[READ-WRITE]`
    ReadWrite,
    /// `[TRYCREATE]`
    TryCreate,
    /// `[UIDNEXT n]`
    UidNext(Uid),
    /// `[UIDVALIDITY n]`
    UidValidity(u32),
    /// `[UNSEEN n]`
    Unseen(Seq),
    /// `[HIGHESTMODSEQ n]`
    HighestModSeq(u64),
    /// `[NOMODSEQ]`
    NoModSeq,
    /// `[CLOSED]`, the previously selected mailbox is now closed.
    Closed,
    /// `[NOUPDATE "tag"]`: the server stops updating the result of the given search or sort.
    NoUpdate(Tag),
    /// `[UNAVAILABLE]`
    Unavailable,
    /// `[AUTHENTICATIONFAILED]`
    AuthenticationFailed,
    /// `[AUTHORIZATIONFAILED]`
    AuthorizationFailed,
    /// `[EXPIRED]`
    Expired,
    /// `[PRIVACYREQUIRED]`
    PrivacyRequired,
    /// `[CONTACTADMIN]`
    ContactAdmin,
    /// Anything else: the atom and its raw argument.
    Other(String, Option<String>),
}

/// Tagged completion or untagged status: `OK`, `NO`, `BAD`, `PREAUTH`, `BYE`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateResponse {
    /// Tag of the completed command, `None` for untagged responses.
    pub tag: Option<Tag>,
    /// Status of the response.
    pub kind: StateKind,
    /// The optional response code.
    pub code: Option<RespCode>,
    /// Human-readable text.
    pub message: String,
}

impl StateResponse {
    /// Whether this response completes the command with the given tag.
    pub fn is_tagged(&self, tag: &Tag) -> bool {
        self.tag.as_ref() == Some(tag)
    }

    /// Whether this is an untagged response.
    pub fn is_untagged(&self) -> bool {
        self.tag.is_none()
    }
}

/// Untagged responses prefixed by a number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumberResponse {
    /// `* n EXISTS`
    Exists(u32),
    /// `* n EXPUNGE`
    Expunge(Seq),
    /// `* n RECENT`
    Recent(u32),
}

/// Whether a mailbox listing came from `LIST` or `LSUB`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    /// `LIST`
    List,
    /// `LSUB`
    Lsub,
}

/// One `LIST` or `LSUB` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListResponse {
    /// `LIST` or `LSUB`.
    pub kind: ListKind,
    /// Full mailbox name.
    pub name: String,
    /// Hierarchy separator, `None` for a flat namespace.
    pub separator: Option<String>,
    /// Name attributes such as `\Noselect` or `\HasChildren`.
    pub attributes: Vec<String>,
}

impl ListResponse {
    /// Case-insensitive check for a name attribute.
    pub fn has_attribute(&self, attr: &str) -> bool {
        self.attributes.iter().any(|a| a.eq_ignore_ascii_case(attr))
    }
}

/// An address from an envelope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailAddress {
    /// Display name.
    pub name: Option<String>,
    /// Source route.
    pub adl: Option<String>,
    /// Local part.
    pub mailbox: Option<String>,
    /// Domain.
    pub host: Option<String>,
}

/// The `ENVELOPE` of a message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    /// `Date:` header.
    pub date: Option<String>,
    /// `Subject:` header.
    pub subject: Option<String>,
    /// `From:` header.
    pub from: Vec<MailAddress>,
    /// `Sender:` header.
    pub sender: Vec<MailAddress>,
    /// `Reply-To:` header.
    pub reply_to: Vec<MailAddress>,
    /// `To:` header.
    pub to: Vec<MailAddress>,
    /// `Cc:` header.
    pub cc: Vec<MailAddress>,
    /// `Bcc:` header.
    pub bcc: Vec<MailAddress>,
    /// `In-Reply-To:` header.
    pub in_reply_to: Option<String>,
    /// `Message-Id:` header.
    pub message_id: Option<String>,
}

/// A node of a `BODYSTRUCTURE`, flattened to what the mailbox tree needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BodyStructure {
    /// IMAP part specifier, e.g. `1.2`; empty for a single-part message body.
    pub part_id: String,
    /// `type/subtype`, lower-cased.
    pub mime_type: String,
    /// Encoded size in octets, if the server told us.
    pub octets: Option<u32>,
    /// Sub-parts of a multipart or an encapsulated message.
    pub children: Vec<BodyStructure>,
}

/// One `FETCH` response, with the attributes the engine understands pulled out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchResponse {
    /// Sequence number of the message.
    pub seq: Seq,
    /// `UID`
    pub uid: Option<Uid>,
    /// `FLAGS`
    pub flags: Option<Vec<Flag<'static>>>,
    /// `ENVELOPE`
    pub envelope: Option<Envelope>,
    /// `RFC822.SIZE`
    pub size: Option<u32>,
    /// `INTERNALDATE`
    pub internal_date: Option<DateTime<FixedOffset>>,
    /// `BODYSTRUCTURE`
    pub body_structure: Option<BodyStructure>,
    /// `MODSEQ`
    pub mod_seq: Option<u64>,
    /// `BODY[...]` and `RFC822*` payloads keyed by part id.
    pub parts: BTreeMap<String, Vec<u8>>,
}

/// `* STATUS mailbox (...)`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusResponse {
    /// Mailbox the status is about.
    pub mailbox: String,
    /// `MESSAGES`
    pub messages: Option<u32>,
    /// `RECENT`
    pub recent: Option<u32>,
    /// `UNSEEN`
    pub unseen: Option<u32>,
    /// `UIDNEXT`
    pub uid_next: Option<Uid>,
    /// `UIDVALIDITY`
    pub uid_validity: Option<u32>,
    /// `HIGHESTMODSEQ`
    pub highest_mod_seq: Option<u64>,
}

/// An incremental change pushed through `ESEARCH` for a persistent search or sort.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncrementalUpdate {
    /// `ADDTO` when true, `REMOVEFROM` when false.
    pub add: bool,
    /// Position in the result the change applies to (`0` means "unknown").
    pub offset: u32,
    /// Affected UIDs.
    pub uids: Vec<Uid>,
}

/// `* ESEARCH ...` ([RFC 4731](https://tools.ietf.org/html/rfc4731)).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ESearchResponse {
    /// Tag of the command this result belongs to.
    pub tag: Option<Tag>,
    /// Whether the numbers are UIDs rather than sequence numbers.
    pub uid: bool,
    /// `ALL`, expanded.
    pub all: Option<Vec<u32>>,
    /// `COUNT`
    pub count: Option<u32>,
    /// `MIN`
    pub min: Option<u32>,
    /// `MAX`
    pub max: Option<u32>,
    /// `ADDTO` / `REMOVEFROM` items of a persistent search.
    pub incremental: Vec<IncrementalUpdate>,
    /// `INCTHREAD` items of an incremental thread request, with the previous root UID.
    pub inc_thread: Vec<(Uid, Vec<ThreadNode>)>,
}

/// A node of a `THREAD` response; `id == 0` marks a missing common parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadNode {
    /// The UID (or sequence number) of the message.
    pub id: u32,
    /// Replies to this message.
    pub children: Vec<ThreadNode>,
}

/// One namespace from `* NAMESPACE`: a prefix and its hierarchy separator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceEntry {
    /// Prefix of the namespace.
    pub prefix: String,
    /// Hierarchy separator.
    pub separator: Option<String>,
}

/// `* NAMESPACE` ([RFC 2342](https://tools.ietf.org/html/rfc2342)).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceResponse {
    /// Personal namespaces.
    pub personal: Vec<NamespaceEntry>,
    /// Other users' namespaces.
    pub other: Vec<NamespaceEntry>,
    /// Shared namespaces.
    pub shared: Vec<NamespaceEntry>,
}

/// A decoded server response, or a transport event, as delivered by a [`Parser`](crate::Parser).
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Response {
    /// `OK`/`NO`/`BAD`/`PREAUTH`/`BYE`, tagged or not.
    State(StateResponse),
    /// `* CAPABILITY ...`
    Capability(Capabilities),
    /// `* n EXISTS`, `* n EXPUNGE`, `* n RECENT`
    Number(NumberResponse),
    /// `* FLAGS (...)`
    Flags(Vec<Flag<'static>>),
    /// `* LIST ...` or `* LSUB ...`
    List(ListResponse),
    /// `* n FETCH (...)`
    Fetch(FetchResponse),
    /// `* SEARCH ...`
    Search(Vec<u32>),
    /// `* ESEARCH ...`
    ESearch(ESearchResponse),
    /// `* SORT ...`
    Sort(Vec<u32>),
    /// `* THREAD ...`
    Thread(Vec<ThreadNode>),
    /// `* NAMESPACE ...`
    Namespace(NamespaceResponse),
    /// `* STATUS ...`
    Status(StatusResponse),
    /// `* ID ...`
    Id(Option<BTreeMap<String, String>>),
    /// `* ENABLED ...`
    Enabled(Vec<String>),
    /// `* VANISHED ...`
    Vanished {
        /// Whether the `EARLIER` tag was set on the response.
        earlier: bool,
        /// The `UID`s which have been removed.
        uids: Vec<RangeInclusive<Uid>>,
    },
    /// The transport has finished a TLS handshake.
    SocketEncrypted {
        /// DER-encoded certificates presented by the peer.
        chain: Vec<Vec<u8>>,
        /// Validation problems found in the chain; empty when it verified cleanly.
        errors: Vec<String>,
    },
    /// The transport is gone.
    SocketDisconnected(String),
    /// The decoder could not make sense of what the server sent.
    ParseError {
        /// What went wrong.
        message: String,
        /// The offending input.
        line: Vec<u8>,
    },
}

impl Response {
    /// Whether this is a `BAD` status response, tagged or not.
    pub fn is_bad(&self) -> bool {
        matches!(
            self,
            Response::State(StateResponse {
                kind: StateKind::Bad,
                ..
            })
        )
    }
}
