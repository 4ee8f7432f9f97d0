//! Request multiplexing engine for the 42 intra API
//!
//! Drives a fleet of API applications, each with its own OAuth2 credential
//! pair, to push aggregate throughput far above any single credential's rate
//! cap while respecting each one individually. Callers enqueue URLs; the
//! engine dispatches them concurrently across credentials with round-robin
//! selection, rate-aware pacing, adaptive retry, and a fleet-wide token
//! refresh barrier. Completed responses collect in a sink that is drained by
//! the caller or checkpointed to disk in parts.
//!
//! Request lifecycle:
//! 1. `submit_get`/`submit_post` pass admission (stop file, refresh barrier,
//!    in-flight cap, checkpoint threshold) and spawn a worker
//! 2. The worker picks the next credential, shapes bearer auth, and sends
//! 3. Failures back off and re-pick; 200s land in the response sink
//! 4. `join()` drains outstanding workers; `responses*()` hand back the data
//! 5. `close()` saves credentials, flushes the sink, and logs statistics

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod pacer;
mod refresh;
pub mod shape;
pub mod sink;
pub mod stats;
mod worker;

pub use config::HydraConfig;
pub use dispatch::Dispatcher;
pub use engine::Hydra;
pub use error::{Error, Result};
pub use pacer::Pacer;
pub use shape::{AuthShaper, BearerShaper};
pub use sink::{ResponseRecord, ResponseSink, serialize_records, substitute_template};
pub use stats::{EngineStats, StatsSnapshot};
