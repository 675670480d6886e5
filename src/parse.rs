//! Turning raw server output into [`Response`] values.
//!
//! RFC 3501 responses are decoded by `imap-proto`. The extension responses it does not know
//! (`SEARCH`/`SORT` with trailing modifiers, `ESEARCH`, `THREAD`, `ENABLED`, `NAMESPACE`) are
//! recognized here first.

use std::borrow::Cow;
use std::collections::BTreeMap;

use imap_proto::{AttributeValue, MailboxDatum, StatusAttribute};
use lazy_static::lazy_static;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{char, digit1},
    combinator::{map, map_res, opt, value},
    multi::{many0, many1, separated_list1},
    sequence::{delimited, preceded, terminated, tuple},
    IResult,
};
use regex::bytes::Regex;

use crate::error::ParseError;
use crate::types::*;

lazy_static! {
    static ref NUMBER_LIST: Regex =
        Regex::new(r"(?i)^\* (SEARCH|SORT)((?: [0-9]+)*)(?: \(MODSEQ [0-9]+\))?\s*\r\n").unwrap();
    static ref ENABLED: Regex = Regex::new(r"(?i)^\* ENABLED((?: [^ \r\n]+)*)\s*\r\n").unwrap();
    static ref RESP_CODE: regex::Regex =
        regex::Regex::new(r"^\[([A-Za-z0-9.-]+)(?: ([^\]]*))?\]\s?(.*)$").unwrap();
}

/// Outcome of decoding the front of the input buffer.
#[derive(Debug)]
pub(crate) enum Decoded {
    /// A complete response, and how many bytes it took.
    Response(Response, usize),
    /// A `+` continuation request, and how many bytes it took.
    Continuation(String, usize),
    /// More input is needed (typically a literal is still in flight).
    Incomplete,
}

/// Decode one response from the front of `input`.
pub(crate) fn decode(input: &[u8]) -> Result<Decoded, ParseError> {
    if !input.contains(&b'\n') {
        return Ok(Decoded::Incomplete);
    }

    if let Some((resp, used)) = decode_extension(input)? {
        return Ok(Decoded::Response(resp, used));
    }

    match imap_proto::parser::parse_response(input) {
        Ok((rest, imap_proto::Response::Continue { information, .. })) => Ok(Decoded::Continuation(
            information.map(|s| s.to_string()).unwrap_or_default(),
            input.len() - rest.len(),
        )),
        Ok((rest, resp)) => {
            let used = input.len() - rest.len();
            match convert(resp) {
                Some(resp) => Ok(Decoded::Response(resp, used)),
                None => Err(ParseError::Unexpected(
                    String::from_utf8_lossy(&input[..used]).trim_end().to_string(),
                )),
            }
        }
        Err(nom::Err::Incomplete(_)) => Ok(Decoded::Incomplete),
        Err(_) => {
            let end = input
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| p + 1)
                .unwrap_or(input.len());
            Err(ParseError::Invalid(input[..end].to_vec()))
        }
    }
}

/// The first line (including CRLF), if it is complete.
fn first_line(input: &[u8]) -> Option<&[u8]> {
    input
        .iter()
        .position(|&b| b == b'\n')
        .map(|p| &input[..=p])
}

fn decode_extension(input: &[u8]) -> Result<Option<(Response, usize)>, ParseError> {
    let line = match first_line(input) {
        Some(line) => line,
        None => return Ok(None),
    };
    let upper = line
        .iter()
        .take(16)
        .map(|b| b.to_ascii_uppercase())
        .collect::<Vec<_>>();

    if let Some(caps) = NUMBER_LIST.captures(line) {
        let numbers = split_numbers(&caps[2]).map_err(|_| ParseError::Invalid(line.to_vec()))?;
        let resp = if caps[1].eq_ignore_ascii_case(b"SORT") {
            Response::Sort(numbers)
        } else {
            Response::Search(numbers)
        };
        return Ok(Some((resp, line.len())));
    }
    if let Some(caps) = ENABLED.captures(line) {
        let caps = String::from_utf8_lossy(&caps[1])
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        return Ok(Some((Response::Enabled(caps), line.len())));
    }

    let parsed = if upper.starts_with(b"* THREAD") {
        thread_response(line).map(|(rest, r)| (rest, Response::Thread(r)))
    } else if upper.starts_with(b"* ESEARCH") {
        esearch_response(line).map(|(rest, r)| (rest, Response::ESearch(r)))
    } else if upper.starts_with(b"* NAMESPACE") {
        namespace_response(line).map(|(rest, r)| (rest, Response::Namespace(r)))
    } else {
        return Ok(None);
    };

    match parsed {
        Ok((rest, resp)) => Ok(Some((resp, line.len() - rest.len()))),
        Err(_) => Err(ParseError::Invalid(line.to_vec())),
    }
}

fn split_numbers(raw: &[u8]) -> Result<Vec<u32>, std::num::ParseIntError> {
    String::from_utf8_lossy(raw)
        .split_whitespace()
        .map(|n| n.parse::<u32>())
        .collect()
}

fn number(i: &[u8]) -> IResult<&[u8], u32> {
    map_res(digit1, |d: &[u8]| {
        std::str::from_utf8(d)
            .map_err(|_| ())
            .and_then(|s| s.parse::<u32>().map_err(|_| ()))
    })(i)
}

fn quoted(i: &[u8]) -> IResult<&[u8], String> {
    map(
        delimited(char('"'), take_while(|c| c != b'"'), char('"')),
        |s: &[u8]| String::from_utf8_lossy(s).into_owned(),
    )(i)
}

fn nil_or_quoted(i: &[u8]) -> IResult<&[u8], Option<String>> {
    alt((value(None, tag_no_case("NIL")), map(quoted, Some)))(i)
}

/// `1:3,5,9:7` expanded into its members.
fn sequence_set(i: &[u8]) -> IResult<&[u8], Vec<u32>> {
    let range = tuple((number, opt(preceded(char(':'), number))));
    map_res(separated_list1(char(','), range), |ranges| {
        let mut out = Vec::new();
        for (lo, hi) in ranges {
            let hi = hi.unwrap_or(lo);
            let (lo, hi) = (lo.min(hi), lo.max(hi));
            if hi - lo > 1_000_000 {
                return Err(());
            }
            out.extend(lo..=hi);
        }
        Ok(out)
    })(i)
}

fn crlf(i: &[u8]) -> IResult<&[u8], &[u8]> {
    preceded(take_while(|c| c == b' '), tag("\r\n"))(i)
}

fn thread_members(i: &[u8]) -> IResult<&[u8], ThreadNode> {
    let (i, ids) = separated_list1(char(' '), number)(i)?;
    let (i, nested) = opt(preceded(char(' '), many1(thread_list)))(i)?;
    let mut nested = nested.unwrap_or_default();

    let mut node: Option<ThreadNode> = None;
    for id in ids.into_iter().rev() {
        let children = match node.take() {
            Some(child) => vec![child],
            None => std::mem::take(&mut nested),
        };
        node = Some(ThreadNode { id, children });
    }
    match node {
        Some(node) => Ok((i, node)),
        None => Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::SeparatedList,
        ))),
    }
}

fn thread_list(i: &[u8]) -> IResult<&[u8], ThreadNode> {
    delimited(
        char('('),
        alt((
            thread_members,
            map(many1(thread_list), |children| ThreadNode { id: 0, children }),
        )),
        char(')'),
    )(i)
}

fn thread_response(i: &[u8]) -> IResult<&[u8], Vec<ThreadNode>> {
    delimited(
        tuple((tag_no_case("* THREAD"), opt(char(' ')))),
        many0(thread_list),
        crlf,
    )(i)
}

enum ESearchItem {
    All(Vec<u32>),
    Count(u32),
    Min(u32),
    Max(u32),
    ModSeq,
    Incremental(IncrementalUpdate),
    IncThread(Uid, Vec<ThreadNode>),
}

fn esearch_update(i: &[u8]) -> IResult<&[u8], ESearchItem> {
    let (i, add) = alt((
        value(true, tag_no_case("ADDTO ")),
        value(false, tag_no_case("REMOVEFROM ")),
    ))(i)?;
    let (i, (offset, _, uids)) =
        delimited(char('('), tuple((number, char(' '), sequence_set)), char(')'))(i)?;
    Ok((i, ESearchItem::Incremental(IncrementalUpdate { add, offset, uids })))
}

fn esearch_item(i: &[u8]) -> IResult<&[u8], ESearchItem> {
    alt((
        map(preceded(tag_no_case("ALL "), sequence_set), ESearchItem::All),
        map(preceded(tag_no_case("COUNT "), number), ESearchItem::Count),
        map(preceded(tag_no_case("MIN "), number), ESearchItem::Min),
        map(preceded(tag_no_case("MAX "), number), ESearchItem::Max),
        map(preceded(tag_no_case("MODSEQ "), digit1), |_| ESearchItem::ModSeq),
        esearch_update,
        map(
            preceded(
                tag_no_case("INCTHREAD "),
                tuple((terminated(number, char(' ')), many1(thread_list))),
            ),
            |(prev, threads)| ESearchItem::IncThread(prev, threads),
        ),
    ))(i)
}

fn esearch_response(i: &[u8]) -> IResult<&[u8], ESearchResponse> {
    let (i, _) = tag_no_case("* ESEARCH")(i)?;
    let (i, tag) = opt(preceded(
        char(' '),
        delimited(tag_no_case("(TAG "), quoted, char(')')),
    ))(i)?;
    let (i, uid) = opt(preceded(char(' '), tag_no_case("UID")))(i)?;
    let (i, items) = many0(preceded(char(' '), esearch_item))(i)?;
    let (i, _) = crlf(i)?;

    let mut resp = ESearchResponse {
        tag: tag.map(Tag),
        uid: uid.is_some(),
        ..Default::default()
    };
    for item in items {
        match item {
            ESearchItem::All(all) => resp.all = Some(all),
            ESearchItem::Count(n) => resp.count = Some(n),
            ESearchItem::Min(n) => resp.min = Some(n),
            ESearchItem::Max(n) => resp.max = Some(n),
            ESearchItem::ModSeq => {}
            ESearchItem::Incremental(update) => resp.incremental.push(update),
            ESearchItem::IncThread(prev, threads) => resp.inc_thread.push((prev, threads)),
        }
    }
    Ok((i, resp))
}

fn namespace_entry(i: &[u8]) -> IResult<&[u8], NamespaceEntry> {
    map(
        delimited(
            char('('),
            tuple((quoted, preceded(char(' '), nil_or_quoted))),
            tuple((take_while(|c| c != b')'), char(')'))),
        ),
        |(prefix, separator)| NamespaceEntry { prefix, separator },
    )(i)
}

fn namespace_list(i: &[u8]) -> IResult<&[u8], Vec<NamespaceEntry>> {
    alt((
        value(Vec::new(), tag_no_case("NIL")),
        delimited(char('('), many1(namespace_entry), char(')')),
    ))(i)
}

fn namespace_response(i: &[u8]) -> IResult<&[u8], NamespaceResponse> {
    let (i, _) = tag_no_case("* NAMESPACE ")(i)?;
    let (i, personal) = namespace_list(i)?;
    let (i, other) = preceded(char(' '), namespace_list)(i)?;
    let (i, shared) = preceded(char(' '), namespace_list)(i)?;
    let (i, _) = crlf(i)?;
    Ok((
        i,
        NamespaceResponse {
            personal,
            other,
            shared,
        },
    ))
}

fn bytes_to_string(b: Option<Cow<'_, [u8]>>) -> Option<String> {
    b.map(|b| String::from_utf8_lossy(&b).into_owned())
}

fn convert_addresses(addrs: Option<Vec<imap_proto::Address<'_>>>) -> Vec<MailAddress> {
    addrs
        .unwrap_or_default()
        .into_iter()
        .map(|a| MailAddress {
            name: bytes_to_string(a.name),
            adl: bytes_to_string(a.adl),
            mailbox: bytes_to_string(a.mailbox),
            host: bytes_to_string(a.host),
        })
        .collect()
}

fn convert_envelope(env: imap_proto::Envelope<'_>) -> Envelope {
    Envelope {
        date: bytes_to_string(env.date),
        subject: bytes_to_string(env.subject),
        from: convert_addresses(env.from),
        sender: convert_addresses(env.sender),
        reply_to: convert_addresses(env.reply_to),
        to: convert_addresses(env.to),
        cc: convert_addresses(env.cc),
        bcc: convert_addresses(env.bcc),
        in_reply_to: bytes_to_string(env.in_reply_to),
        message_id: bytes_to_string(env.message_id),
    }
}

fn child_part_id(parent: &str, n: usize) -> String {
    if parent.is_empty() {
        n.to_string()
    } else {
        format!("{}.{}", parent, n)
    }
}

fn mime_type(ty: &imap_proto::ContentType<'_>) -> String {
    format!("{}/{}", ty.ty, ty.subtype).to_ascii_lowercase()
}

fn convert_body_structure(bs: &imap_proto::BodyStructure<'_>, part_id: String) -> BodyStructure {
    use imap_proto::BodyStructure as B;
    match bs {
        B::Multipart { common, bodies, .. } => BodyStructure {
            children: bodies
                .iter()
                .enumerate()
                .map(|(n, b)| convert_body_structure(b, child_part_id(&part_id, n + 1)))
                .collect(),
            mime_type: mime_type(&common.ty),
            octets: None,
            part_id,
        },
        B::Message {
            common,
            other,
            body,
            ..
        } => {
            let inner = match **body {
                B::Multipart { .. } => part_id.clone(),
                _ => child_part_id(&part_id, 1),
            };
            BodyStructure {
                children: vec![convert_body_structure(body, inner)],
                mime_type: mime_type(&common.ty),
                octets: Some(other.octets),
                part_id,
            }
        }
        B::Basic { common, other, .. } | B::Text { common, other, .. } => BodyStructure {
            mime_type: mime_type(&common.ty),
            octets: Some(other.octets),
            children: Vec::new(),
            part_id,
        },
    }
}

fn section_part_id(section: Option<imap_proto::SectionPath>) -> String {
    use imap_proto::{MessageSection, SectionPath};
    let text = |s: MessageSection| match s {
        MessageSection::Header => "HEADER",
        MessageSection::Mime => "MIME",
        MessageSection::Text => "TEXT",
    };
    match section {
        None => String::new(),
        Some(SectionPath::Full(s)) => text(s).to_string(),
        Some(SectionPath::Part(path, s)) => {
            let mut id = crate::utils::iter_join(path, ".");
            if let Some(s) = s {
                id.push('.');
                id.push_str(text(s));
            }
            id
        }
    }
}

fn parse_internal_date(s: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    chrono::DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z").ok()
}

fn convert_fetch(seq: Seq, attrs: Vec<AttributeValue<'_>>) -> FetchResponse {
    let mut fetch = FetchResponse {
        seq,
        ..Default::default()
    };
    for attr in attrs {
        match attr {
            AttributeValue::Uid(uid) => fetch.uid = Some(uid),
            AttributeValue::Flags(flags) => {
                fetch.flags = Some(Flag::from_strs(flags).collect());
            }
            AttributeValue::Rfc822Size(size) => fetch.size = Some(size),
            AttributeValue::InternalDate(date) => fetch.internal_date = parse_internal_date(&date),
            AttributeValue::Envelope(env) => fetch.envelope = Some(convert_envelope(*env)),
            AttributeValue::BodyStructure(bs) => {
                let top = match bs {
                    imap_proto::BodyStructure::Multipart { .. } => String::new(),
                    _ => "1".to_string(),
                };
                fetch.body_structure = Some(convert_body_structure(&bs, top));
            }
            AttributeValue::ModSeq(m) => fetch.mod_seq = Some(m),
            AttributeValue::BodySection { section, data, .. } => {
                fetch.parts.insert(
                    section_part_id(section),
                    data.map(|d| d.into_owned()).unwrap_or_default(),
                );
            }
            AttributeValue::Rfc822(data) => {
                fetch.parts.insert(
                    "RFC822".to_string(),
                    data.map(|d| d.into_owned()).unwrap_or_default(),
                );
            }
            AttributeValue::Rfc822Header(data) => {
                fetch.parts.insert(
                    "RFC822.HEADER".to_string(),
                    data.map(|d| d.into_owned()).unwrap_or_default(),
                );
            }
            AttributeValue::Rfc822Text(data) => {
                fetch.parts.insert(
                    "RFC822.TEXT".to_string(),
                    data.map(|d| d.into_owned()).unwrap_or_default(),
                );
            }
            other => log::trace!("ignoring FETCH attribute {:?}", other),
        }
    }
    fetch
}

fn convert_code(code: imap_proto::ResponseCode<'_>) -> RespCode {
    use imap_proto::ResponseCode as C;
    match code {
        C::Alert => RespCode::Alert,
        C::BadCharset(charsets) => RespCode::BadCharset(
            charsets
                .unwrap_or_default()
                .into_iter()
                .map(|c| c.into_owned())
                .collect(),
        ),
        C::Capabilities(caps) => RespCode::Capabilities(
            caps.iter()
                .map(crate::types::capability_name)
                .collect(),
        ),
        C::HighestModSeq(m) => RespCode::HighestModSeq(m),
        C::Parse => RespCode::Parse,
        C::PermanentFlags(flags) => RespCode::PermanentFlags(Flag::from_strs(flags).collect()),
        C::ReadOnly => RespCode::ReadOnly,
        C::ReadWrite => RespCode::ReadWrite,
        C::TryCreate => RespCode::TryCreate,
        C::UidNext(n) => RespCode::UidNext(n),
        C::UidValidity(n) => RespCode::UidValidity(n),
        C::Unseen(n) => RespCode::Unseen(n),
        other => RespCode::Other(format!("{:?}", other), None),
    }
}

/// Recover a response code that `imap-proto` left inside the text.
fn code_from_text(text: &str) -> Option<(RespCode, String)> {
    let caps = RESP_CODE.captures(text)?;
    let atom = caps[1].to_ascii_uppercase();
    let arg = caps.get(2).map(|m| m.as_str().to_string());
    let rest = caps[3].to_string();
    let code = match atom.as_str() {
        "NOMODSEQ" => RespCode::NoModSeq,
        "CLOSED" => RespCode::Closed,
        "UNAVAILABLE" => RespCode::Unavailable,
        "AUTHENTICATIONFAILED" => RespCode::AuthenticationFailed,
        "AUTHORIZATIONFAILED" => RespCode::AuthorizationFailed,
        "EXPIRED" => RespCode::Expired,
        "PRIVACYREQUIRED" => RespCode::PrivacyRequired,
        "CONTACTADMIN" => RespCode::ContactAdmin,
        "NOUPDATE" => RespCode::NoUpdate(Tag(
            arg.as_deref().unwrap_or("").trim_matches('"').to_string(),
        )),
        "HIGHESTMODSEQ" => match arg.as_deref().map(str::parse) {
            Some(Ok(m)) => RespCode::HighestModSeq(m),
            _ => RespCode::Other(atom, arg),
        },
        _ => RespCode::Other(atom, arg),
    };
    Some((code, rest))
}

fn convert_state(
    tag: Option<Tag>,
    status: imap_proto::Status,
    code: Option<imap_proto::ResponseCode<'_>>,
    information: Option<Cow<'_, str>>,
) -> Response {
    let kind = match status {
        imap_proto::Status::Ok => StateKind::Ok,
        imap_proto::Status::No => StateKind::No,
        imap_proto::Status::Bad => StateKind::Bad,
        imap_proto::Status::PreAuth => StateKind::PreAuth,
        imap_proto::Status::Bye => StateKind::Bye,
    };
    let mut message = information.map(|s| s.into_owned()).unwrap_or_default();
    let code = match code {
        Some(code) => Some(convert_code(code)),
        None => match code_from_text(&message) {
            Some((code, rest)) => {
                message = rest;
                Some(code)
            }
            None => None,
        },
    };
    Response::State(StateResponse {
        tag,
        kind,
        code,
        message,
    })
}

fn name_attribute(attr: imap_proto::NameAttribute<'_>) -> String {
    use imap_proto::NameAttribute as N;
    match attr {
        N::NoInferiors => "\\Noinferiors".to_string(),
        N::NoSelect => "\\Noselect".to_string(),
        N::Marked => "\\Marked".to_string(),
        N::Unmarked => "\\Unmarked".to_string(),
        N::Extension(s) => s.into_owned(),
        other => format!("\\{:?}", other),
    }
}

fn convert(resp: imap_proto::Response<'_>) -> Option<Response> {
    use imap_proto::Response as R;
    Some(match resp {
        R::Done {
            tag,
            status,
            code,
            information,
        } => convert_state(Some(Tag(tag.0)), status, code, information),
        R::Data {
            status,
            code,
            information,
        } => convert_state(None, status, code, information),
        R::Capabilities(caps) => Response::Capability(
            caps.iter()
                .map(crate::types::capability_name)
                .collect(),
        ),
        R::Expunge(n) => Response::Number(NumberResponse::Expunge(n)),
        R::Vanished { earlier, uids } => Response::Vanished { earlier, uids },
        R::Fetch(seq, attrs) => Response::Fetch(convert_fetch(seq, attrs)),
        R::Id(map) => Response::Id(map.map(|m| {
            m.into_iter()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect::<BTreeMap<_, _>>()
        })),
        R::MailboxData(MailboxDatum::Exists(n)) => Response::Number(NumberResponse::Exists(n)),
        R::MailboxData(MailboxDatum::Recent(n)) => Response::Number(NumberResponse::Recent(n)),
        R::MailboxData(MailboxDatum::Flags(flags)) => {
            Response::Flags(Flag::from_strs(flags).collect())
        }
        R::MailboxData(MailboxDatum::List {
            name_attributes,
            delimiter,
            name,
        }) => Response::List(ListResponse {
            kind: ListKind::List,
            name: name.into_owned(),
            separator: delimiter.map(|d| d.into_owned()),
            attributes: name_attributes.into_iter().map(name_attribute).collect(),
        }),
        R::MailboxData(MailboxDatum::Status { mailbox, status }) => {
            let mut resp = StatusResponse {
                mailbox: mailbox.into_owned(),
                ..Default::default()
            };
            for attr in status {
                match attr {
                    StatusAttribute::HighestModSeq(v) => resp.highest_mod_seq = Some(v),
                    StatusAttribute::Messages(v) => resp.messages = Some(v),
                    StatusAttribute::Recent(v) => resp.recent = Some(v),
                    StatusAttribute::UidNext(v) => resp.uid_next = Some(v),
                    StatusAttribute::UidValidity(v) => resp.uid_validity = Some(v),
                    StatusAttribute::Unseen(v) => resp.unseen = Some(v),
                    _ => {}
                }
            }
            Response::Status(resp)
        }
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(input: &[u8]) -> Response {
        match decode(input).unwrap() {
            Decoded::Response(resp, used) => {
                assert_eq!(used, input.len());
                resp
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tagged_completion_with_capability_code() {
        let resp = one(b"y1 OK [CAPABILITY IMAP4rev1 IDLE UIDPLUS] Logged in\r\n");
        match resp {
            Response::State(StateResponse {
                tag: Some(tag),
                kind: StateKind::Ok,
                code: Some(RespCode::Capabilities(caps)),
                message,
            }) => {
                assert_eq!(tag.as_str(), "y1");
                assert!(caps.has("IDLE"));
                assert!(caps.has("UIDPLUS"));
                assert_eq!(message, "Logged in");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn login_failure_code_is_recovered_from_text() {
        match one(b"y2 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n") {
            Response::State(s) => {
                assert_eq!(s.kind, StateKind::No);
                assert_eq!(s.code, Some(RespCode::AuthenticationFailed));
                assert_eq!(s.message, "Invalid credentials");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn select_data() {
        assert_eq!(one(b"* 172 EXISTS\r\n"), Response::Number(NumberResponse::Exists(172)));
        assert_eq!(one(b"* 1 RECENT\r\n"), Response::Number(NumberResponse::Recent(1)));
        assert_eq!(one(b"* 4 EXPUNGE\r\n"), Response::Number(NumberResponse::Expunge(4)));
        match one(b"* OK [UIDVALIDITY 3857529045] UIDs valid\r\n") {
            Response::State(s) => assert_eq!(s.code, Some(RespCode::UidValidity(3857529045))),
            other => panic!("unexpected {:?}", other),
        }
        match one(b"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n") {
            Response::Flags(flags) => assert_eq!(flags.len(), 5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn fetch_with_flags_and_uid() {
        match one(b"* 24 FETCH (FLAGS (\\Seen) UID 4827943)\r\n") {
            Response::Fetch(f) => {
                assert_eq!(f.seq, 24);
                assert_eq!(f.uid, Some(4827943));
                assert_eq!(f.flags, Some(vec![Flag::Seen]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn fetch_body_literal_needs_more_input() {
        assert!(matches!(
            decode(b"* 2 FETCH (UID 7 BODY[1] {3}\r\nfo").unwrap(),
            Decoded::Incomplete
        ));
        match one(b"* 2 FETCH (UID 7 BODY[1] {3}\r\nfoo)\r\n") {
            Response::Fetch(f) => assert_eq!(f.parts.get("1").map(|d| &d[..]), Some(&b"foo"[..])),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn search_and_sort() {
        assert_eq!(one(b"* SEARCH 2 84 882\r\n"), Response::Search(vec![2, 84, 882]));
        assert_eq!(one(b"* SEARCH\r\n"), Response::Search(vec![]));
        assert_eq!(one(b"* SORT 5 3 4\r\n"), Response::Sort(vec![5, 3, 4]));
    }

    #[test]
    fn esearch_with_tag() {
        match one(b"* ESEARCH (TAG \"y5\") UID ALL 4:6,9\r\n") {
            Response::ESearch(e) => {
                assert_eq!(e.tag, Some(Tag::new("y5")));
                assert!(e.uid);
                assert_eq!(e.all, Some(vec![4, 5, 6, 9]));
            }
            other => panic!("unexpected {:?}", other),
        }
        match one(b"* ESEARCH (TAG \"y6\") UID ADDTO (0 12) REMOVEFROM (0 3:4)\r\n") {
            Response::ESearch(e) => {
                assert_eq!(e.incremental.len(), 2);
                assert!(e.incremental[0].add);
                assert_eq!(e.incremental[1].uids, vec![3, 4]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn thread_tree() {
        match one(b"* THREAD (2)(3 6 (4 23)(44 7 96))\r\n") {
            Response::Thread(roots) => {
                assert_eq!(roots.len(), 2);
                assert_eq!(roots[0].id, 2);
                assert!(roots[0].children.is_empty());
                let three = &roots[1];
                assert_eq!(three.id, 3);
                let six = &three.children[0];
                assert_eq!(six.id, 6);
                assert_eq!(six.children.len(), 2);
                assert_eq!(six.children[0].id, 4);
                assert_eq!(six.children[0].children[0].id, 23);
                assert_eq!(six.children[1].children[0].children[0].id, 96);
            }
            other => panic!("unexpected {:?}", other),
        }
        match one(b"* THREAD ((1)(2))\r\n") {
            Response::Thread(roots) => {
                assert_eq!(roots[0].id, 0);
                assert_eq!(roots[0].children.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn enabled_and_namespace() {
        assert_eq!(
            one(b"* ENABLED QRESYNC CONDSTORE\r\n"),
            Response::Enabled(vec!["QRESYNC".to_string(), "CONDSTORE".to_string()])
        );
        match one(b"* NAMESPACE ((\"\" \"/\")) NIL ((\"Shared/\" \"/\"))\r\n") {
            Response::Namespace(ns) => {
                assert_eq!(ns.personal[0].prefix, "");
                assert_eq!(ns.personal[0].separator.as_deref(), Some("/"));
                assert!(ns.other.is_empty());
                assert_eq!(ns.shared[0].prefix, "Shared/");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn continuation() {
        match decode(b"+ idling\r\n").unwrap() {
            Decoded::Continuation(text, used) => {
                assert_eq!(text, "idling");
                assert_eq!(used, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn junk_is_rejected() {
        assert!(decode(b"* JUNK IMAP4rev1 STARTTLS\r\n").is_err());
    }
}
