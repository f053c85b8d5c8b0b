// Core module - Probe contract and registry
pub mod probe_trait;
pub mod registry;

pub use probe_trait::{join_host_port, Deadline, Options, Probe, Test, DEFAULT_TIMEOUT};
pub use registry::{list_probes, lookup, register, ProbeFactory};
