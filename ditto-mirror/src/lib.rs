//! Mirroring object layer.
//!
//! Presents two independent object stores, Prime and Alter, as one. Writes
//! are applied to Prime and then mirrored to Alter; reads are served by Prime
//! and fall back to Alter only when Prime is unavailable. Every successful
//! result reports which backend(s) served it, and every degraded condition is
//! recorded through a [`MirrorLog`].

pub mod config;
pub mod coordinator;
pub mod events;
pub mod handlers;
pub mod mirroring;
pub mod outcome;
pub mod resolver;
pub mod tee;

pub use config::{MirrorConfig, MirrorOptions, PutStrategy};
pub use coordinator::{DualWrite, EndState};
pub use events::{EventKind, MemoryLog, MirrorEvent, MirrorLog, Operation, TracingLog};
pub use mirroring::MirroringLayer;
pub use outcome::{BackendRole, Outcome, ServedBy};
pub use resolver::ReadResolver;
