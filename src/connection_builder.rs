use std::net::TcpStream;
use std::time::Duration;

use crate::conn::{Socket, TlsBackend};
use crate::error::Result;
use crate::parser::{Connector, Parser, StreamParser};

/// A [`Connector`] opening TCP connections to one server, with implicit TLS, `STARTTLS` or no
/// encryption at all.
///
/// An implicit TLS connection using `native-tls`:
/// ```no_run
/// # use imap_engine::ConnectionBuilder;
/// let connector = ConnectionBuilder::new("imap.example.com", 993).native_tls();
/// ```
///
/// To use `STARTTLS`, call `starttls()` before picking the TLS backend. The engine then refuses
/// to log in until the connection has been upgraded:
/// ```no_run
/// # use imap_engine::ConnectionBuilder;
/// let connector = ConnectionBuilder::new("imap.example.com", 143)
///     .starttls()
///     .native_tls();
/// ```
#[derive(Clone, Debug)]
pub struct ConnectionBuilder {
    domain: String,
    port: u16,
    starttls: bool,
    backend: Option<TlsBackend>,
    read_timeout: Duration,
}

impl ConnectionBuilder {
    /// Make a new `ConnectionBuilder` using the given domain and port. Without a TLS backend the
    /// connection is not encrypted.
    pub fn new<D: Into<String>>(domain: D, port: u16) -> Self {
        ConnectionBuilder {
            domain: domain.into(),
            port,
            starttls: false,
            backend: None,
            read_timeout: Duration::from_millis(10),
        }
    }

    /// Use `STARTTLS` for this connection.
    pub fn starttls(mut self) -> Self {
        self.starttls = true;
        self
    }

    /// Encrypt using `native-tls`.
    #[cfg(feature = "native-tls")]
    pub fn native_tls(mut self) -> Self {
        self.backend = Some(TlsBackend::NativeTls);
        self
    }

    /// Encrypt using `rustls`.
    #[cfg(feature = "rustls-tls")]
    pub fn rustls(mut self) -> Self {
        self.backend = Some(TlsBackend::Rustls);
        self
    }

    /// How long a single poll of the socket may wait for input.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

impl Connector for ConnectionBuilder {
    fn connect(&mut self) -> Result<Box<dyn Parser>> {
        log::debug!("Connecting to {}:{}", self.domain, self.port);
        let tcp = TcpStream::connect((self.domain.as_str(), self.port))?;
        let timeout = Some(self.read_timeout);

        match self.backend {
            Some(backend) if !self.starttls => {
                let (socket, chain) = Socket::implicit_tls(tcp, &self.domain, backend, timeout)?;
                Ok(Box::new(StreamParser::new_encrypted(socket, chain, Vec::new())))
            }
            backend => {
                let socket = Socket::plain(tcp, &self.domain, backend, timeout)?;
                Ok(Box::new(StreamParser::new(socket)))
            }
        }
    }

    fn start_tls_required(&self) -> bool {
        self.starttls
    }
}
