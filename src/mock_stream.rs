use std::cmp::min;
use std::io::{Error, ErrorKind, Read, Result, Write};

use crate::conn::StartTls;

#[derive(Debug)]
pub struct MockStream {
    read_buf: Vec<u8>,
    read_pos: usize,
    pub written_buf: Vec<u8>,
    err_on_read: bool,
    eof_on_read: bool,
    read_delay: usize,
    fail_tls: bool,
    pub upgraded: bool,
}

impl Default for MockStream {
    fn default() -> Self {
        MockStream {
            read_buf: Vec::new(),
            read_pos: 0,
            written_buf: Vec::new(),
            err_on_read: false,
            eof_on_read: false,
            read_delay: 0,
            fail_tls: false,
            upgraded: false,
        }
    }
}

impl MockStream {
    pub fn new(read_buf: Vec<u8>) -> MockStream {
        MockStream::default().with_buf(read_buf)
    }

    pub fn with_buf(mut self, read_buf: Vec<u8>) -> MockStream {
        self.read_buf = read_buf;
        self
    }

    pub fn with_eof(mut self) -> MockStream {
        self.eof_on_read = true;
        self
    }

    pub fn with_err(mut self) -> MockStream {
        self.err_on_read = true;
        self
    }

    pub fn with_delay(mut self) -> MockStream {
        self.read_delay = 1;
        self
    }

    pub fn with_failing_tls(mut self) -> MockStream {
        self.fail_tls = true;
        self
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.eof_on_read {
            return Ok(0);
        }
        if self.err_on_read {
            return Err(Error::new(ErrorKind::Other, "MockStream Error"));
        }
        // An exhausted script behaves like a quiet server.
        if self.read_pos >= self.read_buf.len() {
            return Err(Error::new(ErrorKind::WouldBlock, "no more scripted input"));
        }
        let mut write_len = min(buf.len(), self.read_buf.len() - self.read_pos);
        if self.read_delay > 0 {
            self.read_delay -= 1;
            write_len = min(write_len, 1);
        }
        let max_pos = self.read_pos + write_len;
        buf[..write_len].copy_from_slice(&self.read_buf[self.read_pos..max_pos]);
        self.read_pos += write_len;
        Ok(write_len)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.written_buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl StartTls for MockStream {
    fn start_tls(&mut self) -> crate::Result<(Vec<Vec<u8>>, Vec<String>)> {
        if self.fail_tls {
            return Err(crate::Error::Io(Error::new(
                ErrorKind::ConnectionReset,
                "handshake failed",
            )));
        }
        self.upgraded = true;
        Ok((vec![b"mock certificate".to_vec()], Vec::new()))
    }
}
