//! Control-plane stream lifecycle manager
//!
//! [`GrpcStream`] oversees the bidirectional stream shared by the regular and
//! delta discovery-protocol variants. It re-establishes the stream with
//! jittered backoff whenever it fails or closes, rate limits outbound requests,
//! deduplicates close logging and keeps the connection stats current.
//!
//! The manager is split in two so the owner can act from inside its own
//! callbacks: [`StreamControl`] holds everything the owner may touch (sending,
//! rate limiting, queue stats), while retry scheduling, backoff and failure
//! tracking stay private to [`GrpcStream`].

use crate::backoff::{BackOffStrategy, JitteredExponentialBackOff};
use crate::config::{RateLimitSettings, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY};
use crate::error::{StreamError, StreamResult};
use crate::failure::FailureTracker;
use crate::stats::ControlPlaneStats;
use crate::time::{TimeSource, TokioTimeSource};
use crate::timer::Timer;
use crate::token_bucket::TokenBucket;
use crate::transport::{
    AsyncStream, AsyncStreamCallbacks, MethodDescriptor, StreamEvent, StreamEventSender, StreamId,
    StreamOptions, Transport,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::metadata::MetadataMap;
use tonic::Code;
use tracing::*;

/// Interface implemented by the discovery-protocol layer that owns a stream
///
/// All methods run on the manager's task and never overlap.
pub trait GrpcStreamCallbacks<T: Transport> {
    /// A new stream is up; pending requests may be (re)sent
    fn on_stream_established(&mut self, stream: &mut StreamControl<T>);

    /// The stream could not be started or was closed. A retry is scheduled
    /// right after this returns.
    fn on_establishment_failure(&mut self, stream: &mut StreamControl<T>);

    /// A response arrived. Stats are available through `stream.stats()`.
    fn on_discovery_response(&mut self, message: T::Response, stream: &mut StreamControl<T>);

    /// The rate limiter has a token again after refusing a drain
    fn on_writeable(&mut self, stream: &mut StreamControl<T>);
}

struct ActiveStream<S> {
    id: StreamId,
    stream: S,
}

/// Owner-facing half of a [`GrpcStream`]
pub struct StreamControl<T: Transport> {
    transport: T,
    method: MethodDescriptor,
    active: Option<ActiveStream<T::Stream>>,
    next_stream_id: u64,
    stats: ControlPlaneStats,
    // Prevents the proxy from making too many requests.
    limit_request: Option<TokenBucket>,
    drain_request_timer: Timer,
}

impl<T: Transport> StreamControl<T> {
    pub fn grpc_stream_available(&self) -> bool {
        self.active.is_some()
    }

    /// Id of the active session, if any
    pub fn active_stream_id(&self) -> Option<StreamId> {
        self.active.as_ref().map(|active| active.id)
    }

    /// Forward `request` on the active stream without waiting for a reply
    ///
    /// Callers are expected to check [`Self::grpc_stream_available`] first;
    /// sending without a stream is refused.
    pub fn send_message(&mut self, request: T::Request) -> StreamResult<()> {
        match self.active.as_mut() {
            Some(active) => {
                active.stream.send_message(request, false);
                Ok(())
            }
            None => Err(StreamError::StreamUnavailable {
                method: self.method.to_string(),
            }),
        }
    }

    /// Update the pending-requests gauge
    ///
    /// The queue only counts as non-empty once it survives a drain attempt,
    /// which is when this is called. Zero is not written until the gauge has
    /// held a non-zero value, so subsystems that never queue do not publish a
    /// pointless series.
    pub fn maybe_update_queue_size_stat(&self, size: u64) {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        self.stats.pending_requests.set_if_meaningful(size);
    }

    /// Whether a request may be sent now
    ///
    /// On refusal the drain timer is armed (unless already armed) for when the
    /// next token is due; the owner gets [`GrpcStreamCallbacks::on_writeable`]
    /// then and must not send until it does.
    pub fn check_rate_limit_allows_drain(&mut self) -> bool {
        let Some(limit_request) = self.limit_request.as_mut() else {
            return true;
        };
        if limit_request.consume(1, false) > 0 {
            return true;
        }

        self.stats.rate_limit_enforced.inc();
        if !self.drain_request_timer.enabled() {
            let wait = limit_request.next_token_available();
            debug!("{} rate limited, retrying drain in {:?}", self.method.name(), wait);
            self.drain_request_timer.enable(wait);
        }
        false
    }

    pub fn stats(&self) -> &ControlPlaneStats {
        &self.stats
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn rate_limiting_enabled(&self) -> bool {
        self.limit_request.is_some()
    }

    pub fn drain_timer(&self) -> &Timer {
        &self.drain_request_timer
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn allocate_stream_id(&mut self) -> StreamId {
        self.next_stream_id += 1;
        StreamId(self.next_stream_id)
    }
}

/// Maintains the control-plane stream for one discovery-protocol variant
pub struct GrpcStream<T: Transport, C> {
    control: StreamControl<T>,
    callbacks: C,
    // Reestablishes the stream when necessary, with some backoff politeness.
    retry_timer: Timer,
    backoff_strategy: Box<dyn BackOffStrategy>,
    // Close status and message of the first failure.
    failure: FailureTracker,
    time_source: Arc<dyn TimeSource>,
    events_tx: mpsc::UnboundedSender<(StreamId, StreamEvent<T::Response>)>,
    events_rx: mpsc::UnboundedReceiver<(StreamId, StreamEvent<T::Response>)>,
}

impl<T, C> GrpcStream<T, C>
where
    T: Transport,
    C: GrpcStreamCallbacks<T>,
{
    /// Create a manager reading the tokio clock with OS-seeded jitter
    pub fn new(
        callbacks: C,
        transport: T,
        method: MethodDescriptor,
        stats: ControlPlaneStats,
        rate_limit_settings: &RateLimitSettings,
    ) -> StreamResult<Self> {
        Self::with_sources(
            callbacks,
            transport,
            method,
            stats,
            rate_limit_settings,
            Arc::new(TokioTimeSource),
            Box::new(JitteredExponentialBackOff::new(
                RETRY_INITIAL_DELAY,
                RETRY_MAX_DELAY,
                StdRng::from_entropy(),
            )),
        )
    }

    /// Create a manager with explicit time and backoff sources
    ///
    /// `time_source` drives the token bucket and close-log dedup. The retry
    /// and drain timers always run on the tokio clock.
    pub fn with_sources(
        callbacks: C,
        transport: T,
        method: MethodDescriptor,
        stats: ControlPlaneStats,
        rate_limit_settings: &RateLimitSettings,
        time_source: Arc<dyn TimeSource>,
        backoff_strategy: Box<dyn BackOffStrategy>,
    ) -> StreamResult<Self> {
        let limit_request = if rate_limit_settings.enabled {
            rate_limit_settings.validate()?;
            // Default bucket holds 100 tokens and refills at 10 tokens/sec.
            Some(TokenBucket::new(
                rate_limit_settings.max_tokens,
                rate_limit_settings.fill_rate,
                time_source.clone(),
            ))
        } else {
            None
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            control: StreamControl {
                transport,
                method,
                active: None,
                next_stream_id: 0,
                stats,
                limit_request,
                drain_request_timer: Timer::new(),
            },
            callbacks,
            retry_timer: Timer::new(),
            backoff_strategy,
            failure: FailureTracker::new(RETRY_MAX_DELAY),
            time_source,
            events_tx,
            events_rx,
        })
    }

    /// Start a new stream unless one is already active
    ///
    /// On failure the owner is told and a retry is scheduled; on success the
    /// connection stat goes to 1 and any remembered failure is forgotten.
    pub fn establish_new_stream(&mut self) {
        debug!("Establishing new gRPC bidi stream for {}", self.control.method);
        if self.control.active.is_some() {
            warn!("gRPC bidi stream for {} already exists!", self.control.method);
            return;
        }

        let mut initial_metadata = MetadataMap::new();
        self.on_create_initial_metadata(&mut initial_metadata);

        let id = self.control.allocate_stream_id();
        let events = StreamEventSender::new(id, self.events_tx.clone());
        let started = self.control.transport.start(
            &self.control.method,
            events,
            StreamOptions { initial_metadata },
        );

        match started {
            Ok(stream) => {
                self.control.active = Some(ActiveStream { id, stream });
                self.retry_timer.disable();
                self.control.stats.connected_state.set(1);
                self.failure.clear();
                debug!("gRPC bidi stream {} for {} established", id, self.control.method);
                self.callbacks.on_stream_established(&mut self.control);
            }
            Err(e) => {
                debug!("Unable to establish new grpc config stream: {}", e);
                self.callbacks.on_establishment_failure(&mut self.control);
                self.set_retry_timer();
            }
        }
    }

    pub fn grpc_stream_available(&self) -> bool {
        self.control.grpc_stream_available()
    }

    pub fn send_message(&mut self, request: T::Request) -> StreamResult<()> {
        self.control.send_message(request)
    }

    pub fn maybe_update_queue_size_stat(&self, size: u64) {
        self.control.maybe_update_queue_size_stat(size)
    }

    pub fn check_rate_limit_allows_drain(&mut self) -> bool {
        self.control.check_rate_limit_allows_drain()
    }

    pub fn control(&self) -> &StreamControl<T> {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut StreamControl<T> {
        &mut self.control
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    pub fn retry_timer(&self) -> &Timer {
        &self.retry_timer
    }

    pub fn failure_tracker(&self) -> &FailureTracker {
        &self.failure
    }

    /// Route an event reported by the transport
    ///
    /// Events from a session other than the active one are dropped: that
    /// session has already been torn down and its failure handled.
    pub fn handle_event(&mut self, id: StreamId, event: StreamEvent<T::Response>) {
        if self.control.active_stream_id() != Some(id) {
            debug!(
                "Dropping event from stale gRPC stream {} for {}",
                id,
                self.control.method.name()
            );
            return;
        }
        event.dispatch(self);
    }

    /// Retry timer expiry
    pub fn on_retry_timer(&mut self) {
        self.retry_timer.disable();
        self.establish_new_stream();
    }

    /// Drain timer expiry
    pub fn on_drain_timer(&mut self) {
        self.control.drain_request_timer.disable();
        if self.control.grpc_stream_available() {
            self.callbacks.on_writeable(&mut self.control);
        }
    }

    /// Drive the stream until `shutdown` resolves, then hand the manager back
    ///
    /// Transport events and timer expiries are serviced one at a time on the
    /// calling task, in arrival order.
    pub async fn run<F>(mut self, shutdown: F) -> Self
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Stopping gRPC stream manager for {}", self.control.method);
                    break;
                }
                Some((id, event)) = self.events_rx.recv() => {
                    self.handle_event(id, event);
                }
                _ = self.retry_timer.expired() => {
                    self.on_retry_timer();
                }
                _ = self.control.drain_request_timer.expired() => {
                    self.on_drain_timer();
                }
            }
        }
        self
    }

    fn set_retry_timer(&mut self) {
        let delay = self.backoff_strategy.next_back_off();
        debug!("Retrying gRPC stream for {} in {:?}", self.control.method.name(), delay);
        self.retry_timer.enable(delay);
    }
}

impl<T, C> AsyncStreamCallbacks<T::Response> for GrpcStream<T, C>
where
    T: Transport,
    C: GrpcStreamCallbacks<T>,
{
    fn on_create_initial_metadata(&mut self, _metadata: &mut MetadataMap) {}

    fn on_receive_initial_metadata(&mut self, _metadata: MetadataMap) {}

    fn on_receive_message(&mut self, message: T::Response) {
        // Start from a fresh backoff interval on the next disconnect.
        self.backoff_strategy.reset();
        self.failure.clear();
        // The gauge can drift (e.g. across hot restarts); a message proves the
        // connection is up.
        self.control.stats.connected_state.set(1);
        self.callbacks.on_discovery_response(message, &mut self.control);
    }

    fn on_receive_trailing_metadata(&mut self, _metadata: MetadataMap) {}

    fn on_remote_close(&mut self, status: Code, message: &str) {
        let now = self.time_source.monotonic_time();
        let logged = self
            .failure
            .maybe_log_close(self.control.method.name(), status, message, now);
        trace!("Close of {} handled as {:?}", self.control.method.name(), logged);
        if status == Code::Ok {
            self.failure.clear();
        }

        self.control.active = None;
        self.control.stats.connected_state.set(0);
        self.callbacks.on_establishment_failure(&mut self.control);
        self.set_retry_timer();
    }
}
