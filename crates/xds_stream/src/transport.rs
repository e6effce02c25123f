//! Transport boundary for the control-plane stream
//!
//! The stream manager never touches the wire. A [`Transport`] opens
//! bidirectional calls and hands back an [`AsyncStream`] for writing; inbound
//! traffic comes back as [`StreamEvent`]s pushed through the
//! [`StreamEventSender`] the transport was given at start. Each sender is
//! bound to one [`StreamId`], so the manager can tell events of the current
//! session apart from stragglers of a session it already tore down.

use crate::error::TransportError;
use std::fmt;
use tokio::sync::mpsc;
use tonic::metadata::MetadataMap;
use tonic::Code;

/// Fully-qualified gRPC method the stream is opened against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    service: String,
    method: String,
}

impl MethodDescriptor {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Short method name, used as the prefix of close log lines
    pub fn name(&self) -> &str {
        &self.method
    }

    /// HTTP/2 request path, `/package.Service/Method`
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// Per-call options handed to [`Transport::start`]
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Initial request metadata
    pub initial_metadata: MetadataMap,
}

/// Identifies one started session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Inbound events of a bidirectional call
#[derive(Debug)]
pub enum StreamEvent<Resp> {
    InitialMetadata(MetadataMap),
    Message(Resp),
    TrailingMetadata(MetadataMap),
    RemoteClose { status: Code, message: String },
}

/// Reports events of one session back to the stream manager
#[derive(Debug)]
pub struct StreamEventSender<Resp> {
    id: StreamId,
    tx: mpsc::UnboundedSender<(StreamId, StreamEvent<Resp>)>,
}

impl<Resp> Clone for StreamEventSender<Resp> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<Resp> StreamEventSender<Resp> {
    pub fn new(id: StreamId, tx: mpsc::UnboundedSender<(StreamId, StreamEvent<Resp>)>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Deliver an event. Returns false once the manager is gone.
    pub fn send(&self, event: StreamEvent<Resp>) -> bool {
        self.tx.send((self.id, event)).is_ok()
    }

    pub fn initial_metadata(&self, metadata: MetadataMap) -> bool {
        self.send(StreamEvent::InitialMetadata(metadata))
    }

    pub fn message(&self, message: Resp) -> bool {
        self.send(StreamEvent::Message(message))
    }

    pub fn trailing_metadata(&self, metadata: MetadataMap) -> bool {
        self.send(StreamEvent::TrailingMetadata(metadata))
    }

    pub fn remote_close(&self, status: Code, message: impl Into<String>) -> bool {
        self.send(StreamEvent::RemoteClose {
            status,
            message: message.into(),
        })
    }
}

/// Write half of a started bidirectional call
pub trait AsyncStream<Req> {
    /// Queue `request` for sending. No reply is awaited.
    fn send_message(&mut self, request: Req, end_stream: bool);
}

/// Opens bidirectional calls to the management server
pub trait Transport {
    type Request;
    type Response;
    type Stream: AsyncStream<Self::Request>;

    /// Start a call to `method`. Events of the new call must be reported
    /// through `events`.
    fn start(
        &mut self,
        method: &MethodDescriptor,
        events: StreamEventSender<Self::Response>,
        options: StreamOptions,
    ) -> Result<Self::Stream, TransportError>;
}

/// Receiver side of the transport contract
///
/// Implementations are only ever invoked from a single task; no two calls
/// overlap.
pub trait AsyncStreamCallbacks<Resp> {
    /// Fill in request metadata before a call is started
    fn on_create_initial_metadata(&mut self, metadata: &mut MetadataMap);

    fn on_receive_initial_metadata(&mut self, metadata: MetadataMap);

    fn on_receive_message(&mut self, message: Resp);

    fn on_receive_trailing_metadata(&mut self, metadata: MetadataMap);

    /// The call ended, cleanly or not
    fn on_remote_close(&mut self, status: Code, message: &str);
}

impl<Resp> StreamEvent<Resp> {
    /// Hand this event to the matching callback
    pub fn dispatch<C: AsyncStreamCallbacks<Resp> + ?Sized>(self, callbacks: &mut C) {
        match self {
            StreamEvent::InitialMetadata(metadata) => callbacks.on_receive_initial_metadata(metadata),
            StreamEvent::Message(message) => callbacks.on_receive_message(message),
            StreamEvent::TrailingMetadata(metadata) => {
                callbacks.on_receive_trailing_metadata(metadata)
            }
            StreamEvent::RemoteClose { status, message } => {
                callbacks.on_remote_close(status, &message)
            }
        }
    }
}
