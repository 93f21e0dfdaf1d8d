//! wxpush Replication - identity negotiation and delivery reliability
//!
//! This crate provides:
//! - `IdentityRegistry` / `SessionIdentity`: server-side id issuance
//! - `IdentityTable`: the client's copy, invalidated on reconnect
//! - `SampleTracker`: watermark and in-flight tracking for samples
//! - `ImageReplicator`: the persistent image retry state machine
//! - `LiveLossTracker`: live sequence gap accounting

mod identity;
mod images;
mod live;
mod samples;

pub use identity::*;
pub use images::*;
pub use live::*;
pub use samples::*;
