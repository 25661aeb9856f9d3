//! Core domain types shared by the producer and consumer paths.
//!
//! Module hierarchy follows type dependency order:
//! - ids: Vbid, Cookie (leaf identifiers)
//! - status: wire result codes
//! - value: datatype bits, xattr framing, compression
//! - item: the sequenced change record
//! - vbucket: partition states
//! - failover: failover log entries and rollback computation
//! - limits: numeric knobs

pub mod failover;
pub mod ids;
pub mod item;
pub mod limits;
pub mod status;
pub mod value;
pub mod vbucket;

pub use failover::{FailoverEntry, FailoverTable, ResumeRequest};
pub use ids::{Cookie, Vbid};
pub use item::{DurabilityLevel, Item, Operation};
pub use limits::Limits;
pub use status::Status;
pub use value::{Datatype, ValueError};
pub use vbucket::VBucketState;
