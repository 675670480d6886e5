use std::fmt::{Debug, Formatter};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{Error, Result};

#[cfg(feature = "native-tls")]
use native_tls::{HandshakeError, TlsConnector, TlsStream};
#[cfg(feature = "rustls-tls")]
use rustls_connector::{RustlsConnector, TlsStream as RustlsStream};

/// A stream which can be switched to TLS in place, as `STARTTLS` requires.
pub trait StartTls {
    /// Run the TLS handshake over the existing stream.
    ///
    /// Returns the DER-encoded certificate chain presented by the server and the problems found
    /// while validating it.
    fn start_tls(&mut self) -> Result<(Vec<Vec<u8>>, Vec<String>)>;
}

/// The TLS implementation used for implicit TLS and `STARTTLS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsBackend {
    /// The platform TLS library through `native-tls`.
    #[cfg(feature = "native-tls")]
    NativeTls,
    /// `rustls` with the platform's root certificates.
    #[cfg(feature = "rustls-tls")]
    Rustls,
}

enum Stream {
    Plain(TcpStream),
    #[cfg(feature = "native-tls")]
    NativeTls(TlsStream<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Rustls(RustlsStream<TcpStream>),
    Closed,
}

/// A TCP connection to an IMAP server, possibly wrapped in TLS.
pub struct Socket {
    stream: Stream,
    domain: String,
    backend: Option<TlsBackend>,
    read_timeout: Option<Duration>,
}

impl Debug for Socket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.stream {
            Stream::Plain(_) => "plain",
            #[cfg(feature = "native-tls")]
            Stream::NativeTls(_) => "native-tls",
            #[cfg(feature = "rustls-tls")]
            Stream::Rustls(_) => "rustls",
            Stream::Closed => "closed",
        };
        write!(f, "Socket({}, {})", self.domain, kind)
    }
}

impl Socket {
    /// Wrap an unencrypted TCP stream. `backend` is what a later `STARTTLS` will use.
    pub fn plain(
        tcp: TcpStream,
        domain: &str,
        backend: Option<TlsBackend>,
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        tcp.set_read_timeout(read_timeout)?;
        Ok(Socket {
            stream: Stream::Plain(tcp),
            domain: domain.to_owned(),
            backend,
            read_timeout,
        })
    }

    /// Run the TLS handshake right away, returning the encrypted socket and the server's chain.
    pub fn implicit_tls(
        tcp: TcpStream,
        domain: &str,
        backend: TlsBackend,
        read_timeout: Option<Duration>,
    ) -> Result<(Self, Vec<Vec<u8>>)> {
        let mut socket = Socket {
            stream: Stream::Plain(tcp),
            domain: domain.to_owned(),
            backend: Some(backend),
            read_timeout,
        };
        let (chain, _) = socket.start_tls()?;
        Ok((socket, chain))
    }

    fn handshake(&self, backend: TlsBackend, tcp: TcpStream) -> Result<(Stream, Vec<Vec<u8>>)> {
        // The handshake itself must not time out like an idle read does.
        tcp.set_read_timeout(None)?;
        match backend {
            #[cfg(feature = "native-tls")]
            TlsBackend::NativeTls => {
                let connector = TlsConnector::builder().build()?;
                let tls = connector.connect(&self.domain, tcp).map_err(|e| match e {
                    HandshakeError::Failure(e) => Error::Tls(e),
                    HandshakeError::WouldBlock(_) => {
                        Error::Io(io::Error::from(io::ErrorKind::WouldBlock))
                    }
                })?;
                tls.get_ref().set_read_timeout(self.read_timeout)?;
                let chain = tls
                    .peer_certificate()?
                    .map(|cert| cert.to_der())
                    .transpose()?
                    .into_iter()
                    .collect();
                Ok((Stream::NativeTls(tls), chain))
            }
            #[cfg(feature = "rustls-tls")]
            TlsBackend::Rustls => {
                let connector = RustlsConnector::new_with_native_certs()?;
                let tls = connector
                    .connect(&self.domain, tcp)
                    .map_err(|e| Error::RustlsHandshake(e.to_string()))?;
                tls.sock.set_read_timeout(self.read_timeout)?;
                let chain = tls
                    .conn
                    .peer_certificates()
                    .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                    .unwrap_or_default();
                Ok((Stream::Rustls(tls), chain))
            }
        }
    }
}

impl StartTls for Socket {
    fn start_tls(&mut self) -> Result<(Vec<Vec<u8>>, Vec<String>)> {
        let backend = self
            .backend
            .ok_or_else(|| Error::InvalidInput("no TLS backend configured".to_string()))?;
        let tcp = match std::mem::replace(&mut self.stream, Stream::Closed) {
            Stream::Plain(tcp) => tcp,
            other => {
                self.stream = other;
                return Err(Error::InvalidInput("stream is already encrypted".to_string()));
            }
        };
        let (stream, chain) = self.handshake(backend, tcp)?;
        self.stream = stream;
        // Both backends reject chains that do not verify, so a finished handshake has no errors.
        Ok((chain, Vec::new()))
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream {
            Stream::Plain(ref mut s) => s.read(buf),
            #[cfg(feature = "native-tls")]
            Stream::NativeTls(ref mut s) => s.read(buf),
            #[cfg(feature = "rustls-tls")]
            Stream::Rustls(ref mut s) => s.read(buf),
            Stream::Closed => Ok(0),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream {
            Stream::Plain(ref mut s) => s.write(buf),
            #[cfg(feature = "native-tls")]
            Stream::NativeTls(ref mut s) => s.write(buf),
            #[cfg(feature = "rustls-tls")]
            Stream::Rustls(ref mut s) => s.write(buf),
            Stream::Closed => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stream {
            Stream::Plain(ref mut s) => s.flush(),
            #[cfg(feature = "native-tls")]
            Stream::NativeTls(ref mut s) => s.flush(),
            #[cfg(feature = "rustls-tls")]
            Stream::Rustls(ref mut s) => s.flush(),
            Stream::Closed => Ok(()),
        }
    }
}
