//! Framed event ingest for the abuse detector.
//!
//! A shipper connects over TCP and streams batches of access-log events.
//! [`frame`] is the wire codec (windowing, acks, zlib-compressed batches),
//! [`event`] turns raw events into request records, and [`server`] runs
//! the blocking single-client session the orchestrator pulls from.

pub mod event;
pub mod frame;
pub mod server;

pub use event::{LogEvent, ResolveError, ResolvedRequest};
pub use frame::{Frame, FrameError, FrameReader};
pub use server::{Batch, IngestError, IngestListener, Session, IDLE_TIMEOUT};
