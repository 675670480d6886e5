use std::fmt;

/// Where a connection is in its life, from socket setup to `LOGOUT`.
///
/// The variants are declared in the order of the happy path, so `Ord` can be used to ask
/// questions like "has this connection authenticated yet".  `Logout` is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Nothing happened yet.
    #[default]
    None,
    /// Resolving the server name.
    HostLookup,
    /// Establishing the TCP connection.
    Connecting,
    /// Performing the implicit TLS handshake.
    SslHandshake,
    /// Waiting for a decision about the certificate chain of an implicit TLS connection.
    SslVerifying,
    /// Connected, waiting for the initial capabilities.
    ConnectedPretlsPrecaps,
    /// Connected with known capabilities, before any `STARTTLS`.
    ConnectedPretls,
    /// `STARTTLS` was sent.
    StartTlsIssued,
    /// The server accepted `STARTTLS`, the handshake is running.
    StartTlsHandshake,
    /// Waiting for a decision about the certificate chain after `STARTTLS`.
    StartTlsVerifying,
    /// Encrypted, waiting for the post-`STARTTLS` capabilities.
    EstablishedPrecaps,
    /// Authenticating.
    Login,
    /// Authenticated, waiting for the post-login capabilities.
    PostauthPrecaps,
    /// Authenticated.
    Authenticated,
    /// `SELECT` in progress.
    Selecting,
    /// Synchronizing the selected mailbox.
    Syncing,
    /// A mailbox is selected and synchronized.
    Selected,
    /// Fetching message parts.
    FetchingPart,
    /// Fetching message metadata.
    FetchingMsgMetadata,
    /// The connection is gone or going away.
    Logout,
}

impl ConnectionState {
    /// Whether the connection has passed authentication and is still alive.
    pub fn is_authenticated(self) -> bool {
        self >= ConnectionState::Authenticated && self != ConnectionState::Logout
    }

    /// Whether a mailbox is currently selected (possibly still synchronizing).
    pub fn is_selected(self) -> bool {
        self >= ConnectionState::Selecting && self != ConnectionState::Logout
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::None => "Not connected",
            ConnectionState::HostLookup => "Resolving hostname...",
            ConnectionState::Connecting => "Connecting to the IMAP server...",
            ConnectionState::SslHandshake => "Starting encryption (SSL)...",
            ConnectionState::SslVerifying => "Checking certificates (SSL)...",
            ConnectionState::ConnectedPretlsPrecaps => "Checking capabilities...",
            ConnectionState::ConnectedPretls => "Connected",
            ConnectionState::StartTlsIssued => "Asking for encryption...",
            ConnectionState::StartTlsHandshake => "Starting encryption (STARTTLS)...",
            ConnectionState::StartTlsVerifying => "Checking certificates (STARTTLS)...",
            ConnectionState::EstablishedPrecaps => "Checking capabilities after STARTTLS...",
            ConnectionState::Login => "Logging in...",
            ConnectionState::PostauthPrecaps => "Checking capabilities after login...",
            ConnectionState::Authenticated => "Logged in",
            ConnectionState::Selecting => "Opening mailbox...",
            ConnectionState::Syncing => "Synchronizing mailbox...",
            ConnectionState::Selected => "Mailbox opened",
            ConnectionState::FetchingPart => "Downloading message...",
            ConnectionState::FetchingMsgMetadata => "Downloading message structure...",
            ConnectionState::Logout => "Logged out",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;

    #[test]
    fn ordering_follows_happy_path() {
        assert!(Connecting < Login);
        assert!(Authenticated.is_authenticated());
        assert!(Selected.is_authenticated());
        assert!(!Logout.is_authenticated());
        assert!(!Authenticated.is_selected());
        assert!(Syncing.is_selected());
    }
}
