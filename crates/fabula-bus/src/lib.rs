//! Event bus: pub/sub over a pluggable transport (Redis in production,
//! in-memory in tests) with a durable local replay queue, bounded
//! per-subscriber buffers, handler retry, and a dead-letter channel.
//!
//! Delivery is at-least-once; consumers are expected to be idempotent keyed
//! on `event_id` or a domain idempotency key.

pub mod bus;
pub mod error;
pub mod replay;
pub mod transport;

pub use bus::{BusCounters, DeadLetter, EventBus, EventHandler};
pub use error::{BusError, Result};
pub use replay::LocalReplayQueue;
pub use transport::{BusTransport, MemoryTransport, RedisTransport};
