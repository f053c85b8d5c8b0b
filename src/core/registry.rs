//! Probe registry
//!
//! Process-wide table from protocol name to a factory producing a fresh probe.
//! The built-in probes are present as soon as the table is first touched;
//! additional testers plug in with [`register`]. Entries are never removed.

use log::debug;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

use super::probe_trait::Probe;
use crate::protocols::{dns, imaps};

/// Zero-argument constructor for a probe
pub type ProbeFactory = fn() -> Box<dyn Probe>;

static PROBES: Lazy<RwLock<HashMap<String, ProbeFactory>>> = Lazy::new(|| {
    let mut m: HashMap<String, ProbeFactory> = HashMap::new();

    m.insert(dns::PROTOCOL.to_string(), dns::factory as ProbeFactory);
    m.insert(imaps::PROTOCOL.to_string(), imaps::factory as ProbeFactory);

    RwLock::new(m)
});

/// Register a protocol tester, replacing any earlier entry with the same name
pub fn register(name: &str, factory: ProbeFactory) {
    // A panic while holding the lock cannot leave the map half-written
    let mut probes = PROBES.write().unwrap_or_else(|e| e.into_inner());
    if probes.insert(name.to_string(), factory).is_some() {
        debug!("Replaced probe registration for '{}'", name);
    }
}

/// Get a fresh probe instance by protocol name
pub fn lookup(name: &str) -> Option<Box<dyn Probe>> {
    let probes = PROBES.read().unwrap_or_else(|e| e.into_inner());
    probes.get(name).map(|factory| factory())
}

/// List all registered protocol names
pub fn list_probes() -> Vec<String> {
    let probes = PROBES.read().unwrap_or_else(|e| e.into_inner());
    let mut names: Vec<_> = probes.keys().cloned().collect();
    names.sort();
    names
}
