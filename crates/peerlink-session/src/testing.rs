//! Test doubles: a scripted media engine and a recording render target.

use crate::engine::{
    ConnectivityState, DataChannelHandle, EngineError, EngineEvents, EngineEventKind,
    EngineFactory, MediaEngineAdapter, OfferOptions, ReadyState,
};
use crate::ice::IceCandidate;
use crate::media::{MediaStream, RenderTarget, TrackEvent};
use crate::sdp::{SdpDocument, SessionDescription, fixtures};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Everything a fake connection was asked to do.
#[derive(Debug, Clone, Default)]
pub struct FakeLog {
    pub offers_created: Vec<OfferOptions>,
    pub answers_created: usize,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub applied_candidates: Vec<IceCandidate>,
    pub data_channels: Vec<String>,
    pub close_calls: usize,
}

#[derive(Debug, Default)]
struct RecorderState {
    log: FakeLog,
    channel_state: Option<watch::Sender<ReadyState>>,
    outbound: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Test-side view of a fake connection that outlives the adapter.
#[derive(Debug, Clone, Default)]
pub struct FakeRecorder(Arc<Mutex<RecorderState>>);

impl FakeRecorder {
    pub fn log(&self) -> FakeLog {
        self.0.lock().unwrap().log.clone()
    }

    pub fn open_channel(&self) {
        if let Some(state) = &self.0.lock().unwrap().channel_state {
            state.send_replace(ReadyState::Open);
        }
    }

    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        let mut state = self.0.lock().unwrap();
        let mut sent = Vec::new();
        if let Some(rx) = state.outbound.as_mut() {
            while let Ok(frame) = rx.try_recv() {
                sent.push(frame);
            }
        }
        sent
    }
}

#[derive(Debug, Default)]
pub struct FakeAdapter {
    recorder: FakeRecorder,
    connectivity: ConnectivityState,
    rejected_candidates: Vec<String>,
    fail_remote: bool,
    fail_channel: bool,
}

impl FakeAdapter {
    pub fn log(&self) -> FakeLog {
        self.recorder.log()
    }

    /// Reject every candidate containing `needle`.
    pub fn reject_candidate(&mut self, needle: &str) {
        self.rejected_candidates.push(needle.to_string());
    }

    fn record(&self, f: impl FnOnce(&mut FakeLog)) {
        f(&mut self.recorder.0.lock().unwrap().log);
    }
}

impl MediaEngineAdapter for FakeAdapter {
    async fn create_offer(&mut self, options: OfferOptions) -> Result<SessionDescription, EngineError> {
        self.record(|log| log.offers_created.push(options));
        let document = SdpDocument::parse(&fixtures::offer_text())
            .map_err(|e| EngineError::Sdp(e.to_string()))?;
        Ok(SessionDescription::offer(document))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        if self.log().remote_descriptions.is_empty() {
            return Err(EngineError::Sdp("no remote offer to answer".into()));
        }
        self.record(|log| log.answers_created += 1);
        let document = SdpDocument::parse(&fixtures::answer_text())
            .map_err(|e| EngineError::Sdp(e.to_string()))?;
        Ok(SessionDescription::answer(document))
    }

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(|log| log.local_descriptions.push(description.clone()));
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        if self.fail_remote {
            return Err(EngineError::Rejected("remote fingerprint mismatch".into()));
        }
        self.record(|log| log.remote_descriptions.push(description.clone()));
        self.connectivity = ConnectivityState::Checking;
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), EngineError> {
        if self.connectivity.is_closed() {
            return Err(EngineError::Closed);
        }
        if self
            .rejected_candidates
            .iter()
            .any(|needle| candidate.candidate.contains(needle.as_str()))
        {
            return Err(EngineError::Candidate(candidate.candidate.clone()));
        }
        self.record(|log| log.applied_candidates.push(candidate.clone()));
        Ok(())
    }

    fn open_data_channel(&mut self, label: &str) -> Result<DataChannelHandle, EngineError> {
        if self.fail_channel {
            return Err(EngineError::Rejected("SCTP transport unavailable".into()));
        }
        let (state_tx, state_rx) = watch::channel(ReadyState::Connecting);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.recorder.0.lock().unwrap();
            state.log.data_channels.push(label.to_string());
            state.channel_state = Some(state_tx);
            state.outbound = Some(out_rx);
        }
        Ok(DataChannelHandle::new(label, state_rx, out_tx))
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.record(|log| log.close_calls += 1);
        self.connectivity = ConnectivityState::Closed;
        if let Some(state) = &self.recorder.0.lock().unwrap().channel_state {
            state.send_replace(ReadyState::Closed);
        }
        Ok(())
    }

    fn connectivity_state(&self) -> ConnectivityState {
        self.connectivity
    }
}

/// One connection handed out by [`FakeFactory`].
#[derive(Debug, Clone)]
pub struct FakeConnection {
    pub events: EngineEvents,
    pub recorder: FakeRecorder,
}

/// Creates [`FakeAdapter`]s and keeps a handle on each. Clones share state, so
/// a test can keep one while the controller owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeFactory {
    connections: Arc<Mutex<Vec<FakeConnection>>>,
    fail_remote: bool,
    fail_create: bool,
    fail_channel: bool,
}

impl FakeFactory {
    /// Every connection rejects the remote description.
    pub fn failing_remote() -> Self {
        Self {
            fail_remote: true,
            ..Self::default()
        }
    }

    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn failing_channel() -> Self {
        Self {
            fail_channel: true,
            ..Self::default()
        }
    }

    pub fn connections(&self) -> Vec<FakeConnection> {
        self.connections.lock().unwrap().clone()
    }

    pub fn last(&self) -> FakeConnection {
        self.connections().pop().expect("no connection created yet")
    }
}

impl EngineFactory for FakeFactory {
    type Adapter = FakeAdapter;

    async fn create(&mut self, events: EngineEvents) -> Result<FakeAdapter, EngineError> {
        if self.fail_create {
            return Err(EngineError::Io(std::io::Error::other("no UDP port available")));
        }
        let adapter = FakeAdapter {
            fail_remote: self.fail_remote,
            fail_channel: self.fail_channel,
            ..FakeAdapter::default()
        };
        // Browsers fire negotiation-needed once the connection has something to negotiate.
        events.emit(EngineEventKind::NegotiationNeeded);
        self.connections.lock().unwrap().push(FakeConnection {
            events,
            recorder: adapter.recorder.clone(),
        });
        Ok(adapter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCall {
    Attach(MediaStream),
    AddTrack(TrackEvent),
    Release,
}

/// Render target that records every call. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingTarget(Arc<Mutex<Vec<RenderCall>>>);

impl RecordingTarget {
    pub fn calls(&self) -> Vec<RenderCall> {
        self.0.lock().unwrap().clone()
    }
}

impl RenderTarget for RecordingTarget {
    fn attach(&mut self, stream: &MediaStream) {
        self.0.lock().unwrap().push(RenderCall::Attach(stream.clone()));
    }

    fn add_track(&mut self, track: &TrackEvent) {
        self.0.lock().unwrap().push(RenderCall::AddTrack(track.clone()));
    }

    fn release(&mut self) {
        self.0.lock().unwrap().push(RenderCall::Release);
    }
}
