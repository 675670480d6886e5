//! Adds support for the IMAP SORT extension specificed in [RFC
//! 5256](https://tools.ietf.org/html/rfc5256#section-3).
//!
//! The SORT command is a variant of SEARCH with sorting semantics for
//! the results. There are two arguments before the searching
//! criteria argument: a parenthesized list of sort criteria, and the
//! searching charset.
//!
//! With [RFC 5267](https://tools.ietf.org/html/rfc5267) (`ESORT` and `CONTEXT=SORT`) the result
//! can be returned through `ESEARCH` and kept up to date by the server.

use std::fmt;

pub(crate) struct SortCriteria<'c>(pub(crate) &'c [SortCriterion]);

impl<'c> fmt::Display for SortCriteria<'c> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "")
        } else {
            write!(f, "({})", crate::utils::iter_join(self.0, " "))
        }
    }
}

/// The defined sort criteria are as follows. Refer to the Formal
/// Syntax section for the precise syntactic definitions of the
/// arguments. If the associated [RFC-822](https://tools.ietf.org/html/rfc822)
/// header for a particular criterion is absent, it is treated as the empty string.
/// The empty string always collates before non-empty strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SortCriterion {
    /// Internal date and time of the message. This differs from the
    /// ON criteria in SEARCH, which uses just the internal date.
    Arrival,

    /// [IMAP](https://tools.ietf.org/html/rfc5256#ref-IMAP) addr-mailbox
    /// of the first "cc" address.
    Cc,

    /// Sent date and time, as described in
    /// [section 2.2](https://tools.ietf.org/html/rfc5256#section-2.2).
    Date,

    /// [IMAP](https://tools.ietf.org/html/rfc5256#ref-IMAP) addr-mailbox
    /// of the first "From" address.
    From,

    /// Followed by another sort criterion, has the effect of that
    /// criterion but in reverse (descending) order.
    Reverse(Box<SortCriterion>),

    /// Size of the message in octets.
    Size,

    /// Base subject text.
    Subject,

    /// [IMAP](https://tools.ietf.org/html/rfc5256#ref-IMAP) addr-mailbox
    /// of the first "To" address.
    To,

    /// Display name of the first "From" address
    /// ([RFC 5957](https://tools.ietf.org/html/rfc5957)).
    DisplayFrom,

    /// Display name of the first "To" address
    /// ([RFC 5957](https://tools.ietf.org/html/rfc5957)).
    DisplayTo,
}

impl SortCriterion {
    /// Wrap this criterion in `REVERSE`.
    pub fn reversed(self) -> Self {
        SortCriterion::Reverse(Box::new(self))
    }
}

impl fmt::Display for SortCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SortCriterion::*;

        match self {
            Arrival => write!(f, "ARRIVAL"),
            Cc => write!(f, "CC"),
            Date => write!(f, "DATE"),
            From => write!(f, "FROM"),
            Reverse(c) => write!(f, "REVERSE {}", c),
            Size => write!(f, "SIZE"),
            Subject => write!(f, "SUBJECT"),
            To => write!(f, "TO"),
            DisplayFrom => write!(f, "DISPLAYFROM"),
            DisplayTo => write!(f, "DISPLAYTO"),
        }
    }
}

/// Threading algorithms from [RFC 5256](https://tools.ietf.org/html/rfc5256#section-3) and
/// [RFC 5957](https://tools.ietf.org/html/rfc5957).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThreadAlgorithm {
    /// `ORDEREDSUBJECT`, a poor man's threading by subject.
    OrderedSubject,
    /// `REFERENCES`, threading by the `References` and `In-Reply-To` headers.
    References,
    /// `REFS`, like `REFERENCES` but ordered by the newest message.
    Refs,
}

impl ThreadAlgorithm {
    /// The capability which advertises this algorithm.
    pub fn capability(&self) -> String {
        format!("THREAD={}", self)
    }
}

impl fmt::Display for ThreadAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadAlgorithm::OrderedSubject => write!(f, "ORDEREDSUBJECT"),
            ThreadAlgorithm::References => write!(f, "REFERENCES"),
            ThreadAlgorithm::Refs => write!(f, "REFS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criterion_to_string() {
        use SortCriterion::*;

        assert_eq!("ARRIVAL", Arrival.to_string());
        assert_eq!("CC", Cc.to_string());
        assert_eq!("DATE", Date.to_string());
        assert_eq!("FROM", From.to_string());
        assert_eq!("SIZE", Size.to_string());
        assert_eq!("SUBJECT", Subject.to_string());
        assert_eq!("TO", To.to_string());
        assert_eq!("REVERSE TO", To.reversed().to_string());
        assert_eq!("REVERSE REVERSE TO", To.reversed().reversed().to_string());
    }

    #[test]
    fn test_criteria_to_string() {
        use SortCriterion::*;

        assert_eq!("", SortCriteria(&[]).to_string());
        assert_eq!("(ARRIVAL)", SortCriteria(&[Arrival]).to_string());
        assert_eq!(
            "(ARRIVAL REVERSE FROM)",
            SortCriteria(&[Arrival, From.reversed()]).to_string()
        );
    }

    #[test]
    fn thread_algorithm_capability() {
        assert_eq!(ThreadAlgorithm::Refs.capability(), "THREAD=REFS");
    }
}
