//! probewatch - declarative service probes
//!
//! Test lines such as `ns.example.com must run dns with lookup example.com with type A`
//! are parsed against a registry of protocol probes, then either pushed onto a
//! Redis job queue for workers or run directly.

pub mod config;
pub mod core;
pub mod enqueue;
pub mod error;
pub mod parser;
pub mod protocols;
pub mod queue;
pub mod runner;

// Re-export commonly used types
pub use config::{Settings, SettingsOverrides};
pub use core::{Options, Probe, Test};
pub use enqueue::{EnqueueReport, Enqueuer, FileReport};
pub use error::{ConfigError, ParseError, ProbeError, ProbeResult, QueueError};
pub use parser::TestParser;
pub use queue::{JobQueue, RedisQueue};
pub use runner::{LocalRunner, RunSummary, TestOutcome};
