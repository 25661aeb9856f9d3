//! DCP replication: producer/consumer connections, streams and the directory.
//!
//! Module hierarchy follows ownership, leaves first:
//! - message, sink: protocol messages and the transport seam
//! - store, cursor, memory_bucket: external collaborators and their in-memory stand-in
//! - memory, ready_queue, buffer, flow_control, noop, durability: per-stream/per-connection state
//! - stream: active and passive stream state machines
//! - task: background task pool
//! - connection, producer, consumer: connection objects
//! - conn_map, engine: the directory and the engine callback surface

pub mod buffer;
pub mod conn_map;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod cursor;
pub mod durability;
pub mod engine;
pub mod error;
pub mod flow_control;
pub mod memory;
pub mod memory_bucket;
pub mod message;
pub mod noop;
pub mod notify;
pub mod producer;
pub mod ready_queue;
pub mod sink;
pub mod store;
pub mod stream;
pub mod task;

pub use conn_map::{ConnMapStats, DcpConnMap, conn_name};
pub use connection::{ConnHandler, ConnKind, DcpConnection, Step};
pub use consumer::{ConsumerStats, DcpConsumer, ProcessOutcome};
pub use context::{EngineContext, Stores};
pub use cursor::CursorBridge;
pub use durability::{DurabilityAcker, SeqnoAck};
pub use engine::{DcpEngine, StreamReqReply};
pub use error::DcpError;
pub use memory::MemoryTracker;
pub use memory_bucket::MemoryBucket;
pub use message::{DcpResponse, EndStreamReason, PeerResponse, SnapshotMarker};
pub use notify::{IoNotifier, PendingNotifications, RecordingNotifier, TracingNotifier};
pub use producer::{DcpProducer, ProducerStats};
pub use sink::{MessageSink, RecordingSink, SinkError};
pub use store::{
    Batch, CheckpointLog, CursorId, CursorRegistration, FailoverLog, StoreError, VBucketInfo,
    VBucketStore,
};
pub use stream::{ActiveStream, PassiveStream, StreamRequest, StreamState};
pub use task::{Task, TaskHandle, TaskOutcome, TaskPool, TaskPoolError};
