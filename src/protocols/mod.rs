//! Protocol testers
//!
//! Each tester implements [`crate::core::Probe`] and exposes a `factory`
//! function that the registry uses to build fresh instances.
//!
//! ## Adding New Probes
//!
//! 1. Create a new file in `src/protocols/` (e.g., `smtp.rs`)
//! 2. Implement the `Probe` trait and a `factory` function
//! 3. Register it in `core/registry.rs`, or call `core::register` at start-up

pub mod dns;
pub mod imap;
pub mod imaps;

pub use dns::DnsProbe;
pub use imaps::ImapsProbe;
