use std::collections::hash_set::Iter;
use std::collections::HashSet;

/// From [section 7.2.1 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-7.2.1).
///
/// A list of capabilities that the server supports.
/// The capability list will include the atom "IMAP4rev1".
///
/// The `LOGINDISABLED` capability indicates that the `LOGIN` command is disabled, and that the
/// server will respond with a `NO` response to any attempt to use the `LOGIN` command even if
/// the user name and password are valid.  An IMAP client MUST NOT issue the `LOGIN` command if
/// the server advertises the `LOGINDISABLED` capability.
///
/// Capability names are compared case-insensitively; they are stored upper-cased.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities(HashSet<String>);

impl Capabilities {
    /// Check if the server has the given capability.
    pub fn has(&self, s: &str) -> bool {
        self.0.contains(&s.to_ascii_uppercase())
    }

    /// Iterate over all the server's capabilities
    pub fn iter(&self) -> Iter<'_, String> {
        self.0.iter()
    }

    /// Returns how many capabilities the server has.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the server purports to have no capabilities.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for Capabilities {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Capabilities(
            iter.into_iter()
                .map(|s| s.as_ref().to_ascii_uppercase())
                .collect(),
        )
    }
}

pub(crate) fn capability_name(c: &imap_proto::Capability<'_>) -> String {
    use imap_proto::Capability;
    match c {
        Capability::Imap4rev1 => "IMAP4rev1".to_string(),
        Capability::Auth(mech) => format!("AUTH={}", mech),
        Capability::Atom(atom) => atom.to_string(),
    }
}
