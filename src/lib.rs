#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod core;
pub mod dcp;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most hosts touch at crate root
pub use crate::core::{
    Cookie, Datatype, DurabilityLevel, FailoverEntry, FailoverTable, Item, Limits, Operation,
    Status, VBucketState, Vbid,
};
pub use crate::dcp::{
    DcpConnMap, DcpConnection, DcpConsumer, DcpEngine, DcpError, DcpProducer, DcpResponse,
    EngineContext, MessageSink, SinkError, Step,
};
