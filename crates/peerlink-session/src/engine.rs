//! Media engine boundary.
//!
//! The negotiation core never touches ICE, DTLS or SRTP itself. It drives a
//! [`MediaEngineAdapter`] created per session by an [`EngineFactory`], and the
//! engine reports back through an [`EngineEvents`] sender. Every event carries
//! the id of the session it was created for so the controller can drop events
//! from a connection it has already released.

use crate::ice::IceCandidate;
use crate::media::TrackEvent;
use crate::sdp::SessionDescription;
use peerlink_common::PeerlinkError;
use std::fmt;
use std::future::Future;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// What the local side wants to receive in an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
        }
    }
}

/// Connectivity of the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectivityState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn is_closed(self) -> bool {
        matches!(self, ConnectivityState::Closed)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::New => "new",
            ConnectivityState::Checking => "checking",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Completed => "completed",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Ready state of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Handle to the secondary byte channel of a connection.
///
/// The engine owns the channel; the handle observes its ready state and
/// queues outbound frames.
#[derive(Debug, Clone)]
pub struct DataChannelHandle {
    label: String,
    state: watch::Receiver<ReadyState>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl DataChannelHandle {
    pub fn new(
        label: impl Into<String>,
        state: watch::Receiver<ReadyState>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            label: label.into(),
            state,
            outbound,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    pub fn send(&self, bytes: Vec<u8>) -> Result<(), EngineError> {
        if self.ready_state() != ReadyState::Open {
            return Err(EngineError::ChannelNotOpen(self.label.clone()));
        }
        self.outbound.send(bytes).map_err(|_| EngineError::Closed)
    }
}

/// Engine-level errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebRTC error: {0}")]
    Rtc(#[from] str0m::RtcError),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("Invalid ICE candidate: {0}")]
    Candidate(String),

    #[error("Rejected by engine: {0}")]
    Rejected(String),

    #[error("Data channel {0} is not open")]
    ChannelNotOpen(String),

    #[error("Engine connection is closed")]
    Closed,
}

impl EngineError {
    /// Wrap as a negotiation failure at the named stage.
    pub fn at(self, stage: &str) -> PeerlinkError {
        PeerlinkError::negotiation(stage, self)
    }
}

/// Something the engine observed.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    NegotiationNeeded,
    /// A gathered local candidate; `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
    Track(TrackEvent),
    ConnectivityStateChange(ConnectivityState),
    DataChannelOpen { label: String },
    DataChannelMessage(Vec<u8>),
    DataChannelClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub session: Uuid,
    pub kind: EngineEventKind,
}

/// Session-tagged event sender handed to the engine on creation.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    session: Uuid,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEvents {
    pub fn new(session: Uuid, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Queue an event. Returns `false` once the controller is gone.
    pub fn emit(&self, kind: EngineEventKind) -> bool {
        self.tx
            .send(EngineEvent {
                session: self.session,
                kind,
            })
            .is_ok()
    }
}

/// Capability contract of the media/connectivity engine for one connection.
pub trait MediaEngineAdapter: Send {
    fn create_offer(
        &mut self,
        options: OfferOptions,
    ) -> impl Future<Output = Result<SessionDescription, EngineError>> + Send;

    fn create_answer(
        &mut self,
    ) -> impl Future<Output = Result<SessionDescription, EngineError>> + Send;

    fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn add_ice_candidate(
        &mut self,
        candidate: &IceCandidate,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn open_data_channel(&mut self, label: &str) -> Result<DataChannelHandle, EngineError>;

    fn close(&mut self) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn connectivity_state(&self) -> ConnectivityState;
}

/// Creates one engine connection per session.
pub trait EngineFactory: Send {
    type Adapter: MediaEngineAdapter;

    fn create(
        &mut self,
        events: EngineEvents,
    ) -> impl Future<Output = Result<Self::Adapter, EngineError>> + Send;
}
