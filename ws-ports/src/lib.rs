//! Workspace port exposure.
//!
//! Runs as a sidecar in each workspace pod: finds TCP ports the workspace
//! listens on and publishes a TLS route, a service port and a descriptor
//! entry for each of them.

pub mod exposer;
pub mod probe;
pub mod route;

pub use exposer::{ExposerConfig, PollReport, PortExposer};
pub use probe::{Discovery, PortProbe, ProbeChain, ProbeError};
