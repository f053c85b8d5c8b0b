//! Minimal IMAP4 client session
//!
//! Just enough of the protocol to check a mail server: read the greeting,
//! `LOGIN`, and `LOGOUT`. Generic over any blocking stream so it runs over a
//! TLS connection in production and over an in-memory buffer in tests.
//!
//! Every socket wait is re-armed with the time left on the run's [`Deadline`],
//! so a server that trickles bytes cannot stretch the exchange past it.

use log::debug;
use openssl::ssl::SslStream;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::core::Deadline;
use crate::error::{ProbeError, ProbeResult};

/// Longest server line accepted, terminator included
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Streams whose blocking reads and writes can be given a timeout
pub trait SetTimeout {
    fn set_timeout(&self, timeout: Duration) -> io::Result<()>;
}

impl SetTimeout for TcpStream {
    fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }
}

impl<S: Read + Write + SetTimeout> SetTimeout for SslStream<S> {
    fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.get_ref().set_timeout(timeout)
    }
}

/// An open IMAP conversation
pub struct ImapSession<S: Read + Write + SetTimeout> {
    reader: BufReader<S>,
    next_tag: u32,
    deadline: Deadline,
    greeting: String,
}

impl<S: Read + Write + SetTimeout> ImapSession<S> {
    /// Wrap a connected stream and consume the server greeting
    pub fn open(stream: S, deadline: Deadline) -> ProbeResult<Self> {
        let mut session = Self {
            reader: BufReader::new(stream),
            next_tag: 1,
            deadline,
            greeting: String::new(),
        };

        let greeting = session.read_line()?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(ProbeError::ProtocolError(format!("unexpected IMAP greeting: {}", greeting)));
        }
        debug!("IMAP greeting: {}", greeting);
        session.greeting = greeting;
        Ok(session)
    }

    /// The untagged line the server opened with
    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    pub fn login(&mut self, username: &str, password: &str) -> ProbeResult<()> {
        let command = format!("LOGIN {} {}", quote(username), quote(password));
        self.command(&command).map(|_| ()).map_err(|e| context(e, "login"))
    }

    pub fn logout(&mut self) -> ProbeResult<()> {
        self.command("LOGOUT").map(|_| ()).map_err(|e| context(e, "logout"))
    }

    /// Give back the underlying stream
    pub fn into_inner(self) -> S {
        self.reader.into_inner()
    }

    /// Bound the next socket wait by what is left of the deadline
    fn arm(&self) -> ProbeResult<()> {
        let remaining = self.deadline.remaining()?;
        self.reader
            .get_ref()
            .set_timeout(remaining)
            .map_err(|e| ProbeError::from_io(e, self.deadline.budget()))
    }

    /// Send a tagged command and wait for its completion, returning the OK text
    fn command(&mut self, command: &str) -> ProbeResult<String> {
        let tag = format!("a{}", self.next_tag);
        self.next_tag += 1;

        self.arm()?;
        let budget = self.deadline.budget();
        let stream = self.reader.get_mut();
        stream
            .write_all(format!("{} {}\r\n", tag, command).as_bytes())
            .and_then(|_| stream.flush())
            .map_err(|e| ProbeError::from_io(e, budget))?;

        let prefix = format!("{} ", tag);
        loop {
            let line = self.read_line()?;
            let Some(status) = line.strip_prefix(&prefix) else {
                if line.starts_with('+') {
                    return Err(ProbeError::ProtocolError(format!("unexpected continuation: {}", line)));
                }
                debug!("IMAP untagged: {}", line);
                continue;
            };

            let (code, text) = status.split_once(' ').unwrap_or((status, ""));
            return match code.to_ascii_uppercase().as_str() {
                "OK" => Ok(text.to_string()),
                "NO" | "BAD" => Err(ProbeError::ProtocolError(status.to_string())),
                _ => Err(ProbeError::ProtocolError(format!("malformed response: {}", line))),
            };
        }
    }

    /// Read one CRLF line; 8-bit text is decoded lossily
    fn read_line(&mut self) -> ProbeResult<String> {
        let mut line = Vec::new();
        loop {
            self.arm()?;
            let budget = self.deadline.budget();
            let available = self.reader.fill_buf().map_err(|e| ProbeError::from_io(e, budget))?;
            if available.is_empty() {
                return Err(ProbeError::ProtocolError("connection closed by server".to_string()));
            }

            let (used, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(end) => (end + 1, true),
                None => (available.len(), false),
            };
            line.extend_from_slice(&available[..used]);
            self.reader.consume(used);

            if line.len() > MAX_LINE_LENGTH {
                return Err(ProbeError::ProtocolError(format!(
                    "server line exceeds {} bytes",
                    MAX_LINE_LENGTH
                )));
            }
            if complete {
                break;
            }
        }

        Ok(String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']).to_string())
    }
}

// Timeouts and socket errors pass through untouched
fn context(err: ProbeError, step: &str) -> ProbeError {
    match err {
        ProbeError::ProtocolError(message) => {
            ProbeError::ProtocolError(format!("{} failed: {}", step, message))
        }
        other => other,
    }
}

/// Encode a string as an IMAP quoted string
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
