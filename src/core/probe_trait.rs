// probewatch Probe Trait System
// Core trait definitions for pluggable protocol testers

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{ProbeError, ProbeResult};

/// Network timeout applied when the caller does not choose one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A single parsed test definition
///
/// `input` is the declarative line exactly as written. It is the payload
/// pushed to the job queue, so parsing it again must give back the same test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Test {
    /// Subject of the line, before any name resolution
    pub target: String,
    /// Protocol name used to select a probe from the registry
    pub protocol: String,
    /// The original declarative line
    pub input: String,
    /// Named arguments, validated against the probe's schema at parse time
    pub arguments: HashMap<String, String>,
}

impl Test {
    pub fn new(target: impl Into<String>, protocol: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            protocol: protocol.into(),
            input: input.into(),
            arguments: HashMap::new(),
        }
    }

    /// Add an argument
    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    /// Look up an argument, treating absence as the empty string
    pub fn argument(&self, name: &str) -> &str {
        self.arguments.get(name).map(String::as_str).unwrap_or("")
    }

    /// First whitespace-delimited token of the original input
    pub fn input_host(&self) -> Option<&str> {
        self.input.split_whitespace().next()
    }
}

/// Run-time parameters that are not part of the declarative syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Deadline for every network operation in a probe run
    pub timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Options {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Start the clock for one run
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.timeout)
    }
}

/// Fixed point in time by which a whole probe run must finish
///
/// Blocking code asks for [`Deadline::remaining`] before every socket
/// operation, so the sum of all waits stays within the budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// The full allowance this deadline was created with
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left, or a timeout error once none remains
    pub fn remaining(&self) -> ProbeResult<Duration> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            Err(ProbeError::TimeoutError(self.budget))
        } else {
            Ok(left)
        }
    }
}

/// Universal Protocol Probe Trait
/// All protocol testers must implement this trait
///
/// Instances come fresh from the registry for every lookup and must not keep
/// state between runs: sockets, messages and sessions live inside `run_test`.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Accepted argument names mapped to the regular expression a value must match
    fn arguments(&self) -> HashMap<&'static str, &'static str>;

    /// Whether the caller should resolve the target to addresses first
    fn should_resolve_hostname(&self) -> bool;

    /// Usage text for self-documentation
    fn example(&self) -> &'static str;

    /// Perform the protocol interaction against `target`
    ///
    /// Succeeds only if the interaction worked and any declared expectation
    /// matched.
    async fn run_test(&self, test: &Test, target: &str, opts: Options) -> ProbeResult<()>;
}

/// Build a `host:port` address, bracketing the host when it contains a colon
///
/// A colon is the only IPv6 signal; nothing else is inspected, so a literal
/// with a zone id is bracketed verbatim and fails later when dialled.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
