//! IMAP engine error types.

use std::io::Error as IoError;
use std::result;
use std::str::Utf8Error;

use thiserror::Error;

/// A convenience wrapper around `Result` for `imap_engine::Error`.
pub type Result<T> = result::Result<T, Error>;

/// A set of errors that can occur while driving the engine.
///
/// Expected protocol-level failures (a tagged `NO` for a task's own command, say) never show up
/// here: they are reported through the failing task. What does show up is either a local
/// precondition failure returned from a request method, or one of the fatal conditions that
/// make the dispatch loop tear a connection down.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    #[error("{0}")]
    Io(#[from] IoError),
    /// An error from the `native_tls` library while setting up or running the TLS layer.
    #[cfg(feature = "native-tls")]
    #[error("{0}")]
    Tls(#[from] native_tls::Error),
    /// An error from the `rustls` library during the TLS handshake.
    #[cfg(feature = "rustls-tls")]
    #[error("{0}")]
    RustlsHandshake(String),
    /// A BAD response from the IMAP server.
    #[error("Bad Response: {0}")]
    Bad(String),
    /// A NO response from the IMAP server.
    #[error("No Response: {0}")]
    No(String),
    /// The connection was terminated unexpectedly.
    #[error("Connection Lost")]
    ConnectionLost,
    /// Error parsing a server response.
    #[error("{0}")]
    Parse(#[from] ParseError),
    /// Command inputs were not valid [IMAP
    /// strings](https://tools.ietf.org/html/rfc3501#section-4.3).
    #[error("{0}")]
    Validate(#[from] ValidateError),
    /// A response arrived that cannot be reconciled with what the engine is tracking.
    ///
    /// This tears down the whole connection.
    #[error("Unexpected response: {0}")]
    ProtocolViolation(String),
    /// The local copy of a mailbox disagrees with what the server reports.
    #[error("Mailbox error: {0}")]
    Mailbox(String),
    /// The network policy forbids opening a connection.
    #[error("Network is offline")]
    Offline,
    /// The request cannot be turned into a command.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// An error occured while trying to parse a server response.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Indicates an error parsing the status response. Such as OK, NO, and BAD.
    #[error("Unable to parse status response")]
    Invalid(Vec<u8>),
    /// The server sent a response that is valid IMAP, but not what we asked for.
    #[error("Unexpected response: {0}")]
    Unexpected(String),
    /// The client could not find or decode the server's authentication challenge.
    #[error("Unable to parse authentication response")]
    Authentication(String),
    /// The client received data that was not UTF-8 encoded.
    #[error("Unable to parse data as UTF-8 text")]
    DataNotUtf8(Vec<u8>, #[source] Utf8Error),
}

/// An [invalid character](https://tools.ietf.org/html/rfc3501#section-4.3) was found in a command
/// argument.
#[derive(Debug, PartialEq, Eq)]
pub struct ValidateError {
    /// the synopsis of the invalid command
    pub(crate) command_synopsis: String,
    /// the name of the invalid argument
    pub(crate) argument: String,
    /// the invalid character contained in the argument
    pub(crate) offending_char: char,
}

impl std::fmt::Display for ValidateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // print character in debug form because invalid ones are often whitespaces
        write!(
            f,
            "Invalid character {:?} in argument '{}' of command '{}'",
            self.offending_char, self.argument, self.command_synopsis
        )
    }
}

impl std::error::Error for ValidateError {}

impl Error {
    /// Whether this error means the connection it occurred on cannot be used any more.
    pub fn is_fatal_for_connection(&self) -> bool {
        !matches!(self, Error::InvalidInput(_) | Error::Validate(_) | Error::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_error_display() {
        let e = ValidateError {
            command_synopsis: "LOGIN username password".to_string(),
            argument: "password".to_string(),
            offending_char: '\n',
        };
        assert_eq!(
            e.to_string(),
            "Invalid character '\\n' in argument 'password' of command 'LOGIN username password'"
        );
    }

    #[test]
    fn fatality() {
        assert!(Error::ProtocolViolation("x".into()).is_fatal_for_connection());
        assert!(Error::ConnectionLost.is_fatal_for_connection());
        assert!(!Error::InvalidInput("empty".into()).is_fatal_for_connection());
    }
}
