//! IMAPS tester
//!
//! Connects to a mail server over TLS and checks that this succeeds. When both
//! a username and a password are given a login is made too, and the test fails
//! if the login, or the logout that follows it, does not succeed.
//!
//! ```text
//! mail.example.com must run imaps [with username 'steve@example.com' with password 'secret']
//! ```
//!
//! The certificate is validated against the host named on the test line.
//! Add `with tls insecure` to skip validation.

use async_trait::async_trait;
use log::debug;
use openssl::ssl::{HandshakeError, SslConnector, SslMethod, SslStream, SslVerifyMode};
use openssl::x509::X509VerifyResult;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::imap::{ImapSession, SetTimeout};
use crate::core::{join_host_port, Deadline, Options, Probe, Test};
use crate::error::{ProbeError, ProbeResult};

/// Registry name of this probe
pub const PROTOCOL: &str = "imaps";

/// Standard IMAP-over-TLS port
pub const DEFAULT_PORT: u16 = 993;

/// Secure-mail-login probe
#[derive(Debug, Default)]
pub struct ImapsProbe;

impl ImapsProbe {
    pub fn new() -> Self {
        Self
    }
}

/// Registry constructor
pub fn factory() -> Box<dyn Probe> {
    Box::new(ImapsProbe::new())
}

/// Certificate handling for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Validate the peer certificate chain and host name
    pub verify: bool,
    /// Name sent via SNI and checked against the certificate
    pub server_name: Option<String>,
}

impl TlsSettings {
    /// Derive settings from the test line
    ///
    /// The verification name is the target as written on the line, so it stays
    /// correct when `target` has already been resolved to an address.
    pub fn from_test(test: &Test) -> Self {
        if test.argument("tls") == "insecure" {
            Self {
                verify: false,
                server_name: None,
            }
        } else {
            Self {
                verify: true,
                server_name: test.input_host().map(str::to_string),
            }
        }
    }
}

/// Port to connect to, defaulting to 993
pub fn resolve_port(test: &Test) -> ProbeResult<u16> {
    match test.argument("port") {
        "" => Ok(DEFAULT_PORT),
        port => port
            .parse::<u16>()
            .map_err(|e| ProbeError::InvalidArgument(format!("invalid port '{}': {}", port, e))),
    }
}

/// Username and password, only when both are non-empty
pub fn credentials(test: &Test) -> Option<(&str, &str)> {
    match (test.argument("username"), test.argument("password")) {
        ("", _) | (_, "") => None,
        (username, password) => Some((username, password)),
    }
}

/// Open a TCP connection within `deadline`, trying each resolved address
fn dial(address: &str, deadline: &Deadline) -> ProbeResult<TcpStream> {
    let mut last_error = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, deadline.remaining()?) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connection to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => ProbeError::from_io(e, deadline.budget()),
        None => ProbeError::NetworkError(format!("no address for {}", address)),
    })
}

/// Establish the TLS session described by `settings`
pub fn connect_tls(address: &str, settings: &TlsSettings, deadline: &Deadline) -> ProbeResult<SslStream<TcpStream>> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    if !settings.verify {
        builder.set_verify(SslVerifyMode::NONE);
    }
    let config = builder.build().configure()?;

    let stream = dial(address, deadline)?;
    stream
        .set_timeout(deadline.remaining()?)
        .map_err(|e| ProbeError::from_io(e, deadline.budget()))?;

    let handshake = if settings.verify {
        let name = settings
            .server_name
            .as_deref()
            .ok_or_else(|| ProbeError::InvalidArgument("no server name to verify".to_string()))?;
        config.connect(name, stream)
    } else {
        config
            .verify_hostname(false)
            .use_server_name_indication(false)
            .connect("", stream)
    };

    handshake.map_err(|e| handshake_error(e, deadline.budget()))
}

fn handshake_error(err: HandshakeError<TcpStream>, budget: Duration) -> ProbeError {
    match err {
        HandshakeError::WouldBlock(_) => ProbeError::TimeoutError(budget),
        HandshakeError::SetupFailure(stack) => ProbeError::TlsError(stack.to_string()),
        HandshakeError::Failure(mid) => {
            if let Some(io) = mid.error().io_error() {
                if matches!(io.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) {
                    return ProbeError::TimeoutError(budget);
                }
            }
            let verify = mid.ssl().verify_result();
            if verify != X509VerifyResult::OK {
                ProbeError::TlsError(format!("certificate verification failed: {}", verify))
            } else {
                ProbeError::TlsError(mid.error().to_string())
            }
        }
    }
}

/// Run the IMAP exchange over an established stream
///
/// A login failure returns at once, without a logout. The stream is dropped
/// on every path out of this function.
pub fn run_session<S: Read + Write + SetTimeout>(
    stream: S,
    credentials: Option<(&str, &str)>,
    deadline: Deadline,
) -> ProbeResult<()> {
    let mut session = ImapSession::open(stream, deadline)?;

    if let Some((username, password)) = credentials {
        session.login(username, password)?;
        session.logout()?;
    }

    Ok(())
}

#[async_trait]
impl Probe for ImapsProbe {
    fn arguments(&self) -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("port", "^[0-9]+$"),
            ("tls", "insecure"),
            ("username", ".*"),
            ("password", ".*"),
        ])
    }

    fn should_resolve_hostname(&self) -> bool {
        true
    }

    fn example(&self) -> &'static str {
        r#"
IMAPS Tester
------------
 The IMAPS tester connects to a remote host and ensures that this succeeds.

 If you supply a username & password a login will be made, and the test will
 fail if this login does not succeed.

 This test is invoked via input like so:

    host.example.com must run imaps

 Because IMAPS uses TLS this test will ensure the validity of the certificate as
 part of the test, if you wish to disable this add "with tls insecure".
"#
    }

    async fn run_test(&self, test: &Test, target: &str, opts: Options) -> ProbeResult<()> {
        let port = resolve_port(test)?;
        let address = join_host_port(target, port);
        let settings = TlsSettings::from_test(test);
        let login = credentials(test).map(|(u, p)| (u.to_string(), p.to_string()));
        let deadline = opts.deadline();

        debug!("Connecting to {} (verify: {})", address, settings.verify);

        // openssl streams are blocking; keep them off the async workers
        let session = tokio::task::spawn_blocking(move || {
            let stream = connect_tls(&address, &settings, &deadline)?;
            run_session(stream, login.as_ref().map(|(u, p)| (u.as_str(), p.as_str())), deadline)
        });

        // The blocking side re-arms per step; this caps a single stalled step
        match tokio::time::timeout(opts.timeout, session).await {
            Ok(joined) => joined?,
            Err(_) => Err(ProbeError::TimeoutError(opts.timeout)),
        }
    }
}
