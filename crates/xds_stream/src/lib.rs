//! Control-plane stream engine for discovery-protocol (xDS) sessions
//!
//! This crate maintains a long-lived bidirectional gRPC stream to a
//! management server on behalf of a discovery-protocol implementation. It
//! establishes the stream, recovers from disconnects with jittered exponential
//! backoff, rate limits outbound requests with a token bucket, keeps repeated
//! close events from flooding the logs, and reports connection state through
//! prometheus metrics.
//!
//! # Architecture
//!
//! ```text
//!   owner (GrpcStreamCallbacks)          transport (Transport / AsyncStream)
//!        ▲      │                                 │            ▲
//!        │      │ send / drain / queue stat       │ events     │ start / send
//!        │      ▼                                 ▼            │
//!   ┌──────────────────────── GrpcStream ─────────────────────────┐
//!   │ StreamControl   BackOffStrategy   FailureTracker   Timers   │
//!   │ TokenBucket     ControlPlaneStats                           │
//!   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager is single-threaded: transport events, the retry timer and the
//! drain timer are all serviced by [`GrpcStream::run`] on one task, so no
//! callback ever runs concurrently with another.
//!
//! The payload types are opaque. One manager is instantiated per protocol
//! variant by choosing a [`Transport`] whose associated `Request`/`Response`
//! types carry that variant's messages.

pub mod backoff;
pub mod config;
pub mod error;
pub mod failure;
pub mod stats;
pub mod stream;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod time;
pub mod timer;
pub mod token_bucket;
pub mod transport;

// Re-export commonly used types
pub use backoff::{BackOffStrategy, JitteredExponentialBackOff};
pub use config::{RateLimitSettings, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY};
pub use error::{ConfigError, StreamError, StreamResult, TransportError};
pub use failure::{CloseLog, FailureRecord, FailureTracker};
pub use stats::{ControlPlaneStats, StickyGauge, CONTROL_PLANE_REGISTRY};
pub use stream::{GrpcStream, GrpcStreamCallbacks, StreamControl};
pub use time::{ManualTimeSource, TimeSource, TokioTimeSource};
pub use timer::Timer;
pub use token_bucket::TokenBucket;
pub use transport::{
    AsyncStream, AsyncStreamCallbacks, MethodDescriptor, StreamEvent, StreamEventSender, StreamId,
    StreamOptions, Transport,
};
