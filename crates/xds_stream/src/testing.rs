//! In-memory transport and owner used by the test suites
//!
//! [`MockTransport`] and [`RecordingCallbacks`] are cheap to clone; clones
//! share state, so a test keeps one copy for inspection while the
//! [`GrpcStream`](crate::GrpcStream) owns the other.

use crate::error::TransportError;
use crate::stream::{GrpcStreamCallbacks, StreamControl};
use crate::transport::{
    AsyncStream, MethodDescriptor, StreamEventSender, StreamId, StreamOptions, Transport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tonic::metadata::MetadataMap;
use tonic::Code;

/// Install a fmt subscriber honoring `RUST_LOG`; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct MockState<Req, Resp> {
    refuse_starts: usize,
    start_attempts: usize,
    streams: Vec<StreamEventSender<Resp>>,
    sent: Vec<(StreamId, Req, bool)>,
    last_metadata: Option<MetadataMap>,
}

/// Transport whose calls live in memory
pub struct MockTransport<Req, Resp> {
    state: Arc<Mutex<MockState<Req, Resp>>>,
}

impl<Req, Resp> Clone for MockTransport<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<Req, Resp> Default for MockTransport<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> MockTransport<Req, Resp> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                refuse_starts: 0,
                start_attempts: 0,
                streams: Vec::new(),
                sent: Vec::new(),
                last_metadata: None,
            })),
        }
    }

    /// Fail the next `count` calls to `start`
    pub fn refuse_next_starts(&self, count: usize) {
        self.state.lock().refuse_starts = count;
    }

    pub fn start_attempts(&self) -> usize {
        self.state.lock().start_attempts
    }

    /// Event sender of the most recently started call
    pub fn last_stream(&self) -> Option<StreamEventSender<Resp>> {
        self.state.lock().streams.last().cloned()
    }

    /// Deliver a response on the most recently started call
    pub fn respond(&self, message: Resp) -> bool {
        self.last_stream().map_or(false, |events| events.message(message))
    }

    /// Close the most recently started call
    pub fn close(&self, status: Code, message: &str) -> bool {
        self.last_stream()
            .map_or(false, |events| events.remote_close(status, message))
    }

    pub fn last_metadata(&self) -> Option<MetadataMap> {
        self.state.lock().last_metadata.clone()
    }
}

impl<Req: Clone, Resp> MockTransport<Req, Resp> {
    /// Everything written so far, with the call it was written on
    pub fn sent(&self) -> Vec<(StreamId, Req, bool)> {
        self.state.lock().sent.clone()
    }
}

impl<Req, Resp> Transport for MockTransport<Req, Resp> {
    type Request = Req;
    type Response = Resp;
    type Stream = MockStream<Req, Resp>;

    fn start(
        &mut self,
        method: &MethodDescriptor,
        events: StreamEventSender<Resp>,
        options: StreamOptions,
    ) -> Result<Self::Stream, TransportError> {
        let mut state = self.state.lock();
        state.start_attempts += 1;
        state.last_metadata = Some(options.initial_metadata);
        if state.refuse_starts > 0 {
            state.refuse_starts -= 1;
            return Err(TransportError::StartFailed {
                method: method.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let id = events.id();
        state.streams.push(events);
        Ok(MockStream {
            id,
            state: self.state.clone(),
        })
    }
}

/// Write half of a [`MockTransport`] call
pub struct MockStream<Req, Resp> {
    id: StreamId,
    state: Arc<Mutex<MockState<Req, Resp>>>,
}

impl<Req, Resp> AsyncStream<Req> for MockStream<Req, Resp> {
    fn send_message(&mut self, request: Req, end_stream: bool) {
        self.state.lock().sent.push((self.id, request, end_stream));
    }
}

/// Owner notification observed by [`RecordingCallbacks`]
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent<Resp> {
    Established,
    EstablishmentFailure,
    Response(Resp),
    Writeable,
}

/// Owner that records every notification
///
/// When given a greeting it sends it on each new stream, as a discovery
/// client re-sends its subscriptions after reconnecting.
pub struct RecordingCallbacks<Req, Resp> {
    events: Arc<Mutex<Vec<CallbackEvent<Resp>>>>,
    greeting: Option<Req>,
}

impl<Req: Clone, Resp> Clone for RecordingCallbacks<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            greeting: self.greeting.clone(),
        }
    }
}

impl<Req, Resp> Default for RecordingCallbacks<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> RecordingCallbacks<Req, Resp> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            greeting: None,
        }
    }

    pub fn with_greeting(mut self, greeting: Req) -> Self {
        self.greeting = Some(greeting);
        self
    }

    fn push(&self, event: CallbackEvent<Resp>) {
        self.events.lock().push(event);
    }
}

impl<Req, Resp: Clone> RecordingCallbacks<Req, Resp> {
    pub fn events(&self) -> Vec<CallbackEvent<Resp>> {
        self.events.lock().clone()
    }
}

impl<T> GrpcStreamCallbacks<T> for RecordingCallbacks<T::Request, T::Response>
where
    T: Transport,
    T::Request: Clone,
{
    fn on_stream_established(&mut self, stream: &mut StreamControl<T>) {
        self.push(CallbackEvent::Established);
        if let Some(greeting) = self.greeting.clone() {
            if stream.check_rate_limit_allows_drain() {
                let _ = stream.send_message(greeting);
            }
        }
    }

    fn on_establishment_failure(&mut self, _stream: &mut StreamControl<T>) {
        self.push(CallbackEvent::EstablishmentFailure);
    }

    fn on_discovery_response(&mut self, message: T::Response, _stream: &mut StreamControl<T>) {
        self.push(CallbackEvent::Response(message));
    }

    fn on_writeable(&mut self, _stream: &mut StreamControl<T>) {
        self.push(CallbackEvent::Writeable);
    }
}
