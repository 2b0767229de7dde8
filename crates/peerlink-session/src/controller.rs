//! Negotiation controller: the state machine that owns the session.
//!
//! Architecture:
//! ```text
//!   commands ───────┐
//!   signaling in ───┼──▶ NegotiationController ──▶ signaling out
//!   engine events ──┘          │
//!                              ├──▶ MediaEngineAdapter (per session)
//!                              ├──▶ DataChannelBridge
//!                              └──▶ TrackRouter ──▶ RenderTarget
//! ```
//!
//! Every input is handled to completion before the next one is taken, so a
//! candidate is never applied while a description is being committed. At most
//! one [`Session`] exists. Failures are reported (log + [`SessionNotice::Error`])
//! and, when they leave the session unusable, the session is closed. Nothing is
//! retried.

use crate::data_channel::{DataChannelBridge, StatusUpdate};
use crate::engine::{
    EngineEvent, EngineEventKind, EngineEvents, EngineFactory, MediaEngineAdapter, OfferOptions,
};
use crate::ice::{DrainReport, IceCandidate, IceCandidateBuffer};
use crate::media::{RenderTarget, TrackRouter};
use crate::sdp::{CodecExclusionPolicy, SdpDocument, SessionDescription};
use crate::session::{NegotiationState, Role, Session};
use crate::signaling::{Envelope, Inbound, SignalingChannel};
use peerlink_common::config::{AppConfig, TrackAssembly};
use peerlink_common::{PeerlinkError, PeerlinkResult};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Requests from the embedding layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Connect,
    Disconnect,
    /// Write text to the data channel if it is open.
    SendData(String),
    /// Disconnect and stop the run loop.
    Shutdown,
}

/// What the controller tells the embedding layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    StateChanged {
        session: Uuid,
        state: NegotiationState,
    },
    /// The remote peer sent `close`. The embedding layer decides whether to
    /// disconnect.
    RemoteClosed,
    Status(StatusUpdate),
    Error {
        code: String,
        message: String,
    },
}

/// Negotiation parameters, usually taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub exclusions: CodecExclusionPolicy,
    pub offer: OfferOptions,
    pub data_channel_label: String,
    pub track_assembly: TrackAssembly,
}

impl ControllerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            exclusions: CodecExclusionPolicy::new(
                config.negotiation.video_codec_exclusions.iter().cloned(),
            ),
            offer: OfferOptions {
                receive_audio: config.negotiation.receive_audio,
                receive_video: config.negotiation.receive_video,
            },
            data_channel_label: config.data_channel.label.clone(),
            track_assembly: config.media.track_assembly,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            exclusions: CodecExclusionPolicy::new(["VP8", "VP9"]),
            offer: OfferOptions::default(),
            data_channel_label: "serial".into(),
            track_assembly: TrackAssembly::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Notices(Option<mpsc::UnboundedSender<SessionNotice>>);

impl Notices {
    fn emit(&self, notice: SessionNotice) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(notice);
        }
    }

    fn state(&self, session: Uuid, state: NegotiationState) {
        self.emit(SessionNotice::StateChanged { session, state });
    }
}

/// Move `session` to `next` and tell the embedding layer.
fn advance<A: MediaEngineAdapter>(
    session: &mut Session<A>,
    notices: &Notices,
    next: NegotiationState,
) {
    session.transition(next);
    notices.state(session.id, next);
}

pub struct NegotiationController<F: EngineFactory, S, R> {
    factory: F,
    signaling: S,
    render: R,
    settings: ControllerSettings,
    session: Option<Session<F::Adapter>>,
    /// State reported when no session exists: idle at start, closed after a release.
    resting_state: NegotiationState,
    /// Candidates received before any session existed.
    early_candidates: IceCandidateBuffer,
    bridge: DataChannelBridge,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    notices: Notices,
}

impl<F, S, R> NegotiationController<F, S, R>
where
    F: EngineFactory,
    S: SignalingChannel,
    R: RenderTarget,
{
    pub fn new(factory: F, signaling: S, render: R, settings: ControllerSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            signaling,
            render,
            settings,
            session: None,
            resting_state: NegotiationState::Idle,
            early_candidates: IceCandidateBuffer::new(),
            bridge: DataChannelBridge::new(),
            events_tx,
            events_rx,
            notices: Notices::default(),
        }
    }

    /// Receive notices from now on. Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.notices = Notices(Some(tx));
        rx
    }

    pub fn session(&self) -> Option<&Session<F::Adapter>> {
        self.session.as_ref()
    }

    pub fn state(&self) -> NegotiationState {
        self.session.as_ref().map_or(self.resting_state, |s| s.state)
    }

    pub fn early_candidates(&self) -> usize {
        self.early_candidates.len()
    }

    pub fn bridge_mut(&mut self) -> &mut DataChannelBridge {
        &mut self.bridge
    }

    // === Operations ===

    /// Start a session as initiator and send the filtered offer.
    pub async fn connect(&mut self) -> PeerlinkResult<()> {
        if let Some(session) = &self.session {
            tracing::warn!(
                session = %session.id,
                state = %session.state,
                "connect() while a session is active"
            );
            return Err(PeerlinkError::conflict(
                "connect",
                format!("session {} is {}", session.id, session.state),
            ));
        }

        self.open_session(Role::Initiator).await?;
        if let Err(e) = self.send_offer().await {
            self.fail_session(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Tear down the current session, if any.
    pub async fn disconnect(&mut self) {
        let dropped_early = self.early_candidates.discard();
        let Some(mut session) = self.session.take() else {
            tracing::info!(dropped_early, "disconnect() with no active session");
            return;
        };

        if session.engine.connectivity_state().is_closed() {
            tracing::info!(session = %session.id, "Connection already closed, releasing session");
        } else {
            if let Err(e) = session.engine.close().await {
                tracing::warn!(session = %session.id, error = %e, "Engine close failed");
            }
            if self.signaling.is_open() {
                if let Err(e) = self.signaling.send(Envelope::Close).await {
                    tracing::warn!(session = %session.id, error = %e, "Failed to send close");
                }
            } else {
                tracing::debug!(session = %session.id, "Signaling closed, not sending close");
            }
        }

        self.release(session);
    }

    /// Apply any buffered candidates. The session normally does this itself
    /// once the remote description is known.
    pub async fn drain_candidates(&mut self) -> PeerlinkResult<DrainReport> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| PeerlinkError::missing_session("drain_candidates"))?;
        let report = session.candidates.mark_ready(&mut session.engine).await;
        tracing::debug!(
            session = %session.id,
            applied = report.applied,
            failed = report.failed,
            "Buffered candidates drained"
        );
        Ok(report)
    }

    /// Write text to the data channel of the current session.
    pub fn send_data(&self, text: &str) -> bool {
        self.bridge.send(text)
    }

    // === Inbound signaling ===

    pub async fn handle_envelope(&mut self, envelope: Envelope) -> PeerlinkResult<()> {
        tracing::debug!(kind = envelope.kind(), "Handling signaling envelope");
        match envelope {
            Envelope::Offer { sdp } => self.on_offer(&sdp).await,
            Envelope::Answer { sdp } => self.on_answer(&sdp).await,
            Envelope::Candidate { ice } => self.on_candidate(ice).await,
            Envelope::Close => {
                tracing::info!(
                    session = ?self.session.as_ref().map(|s| s.id),
                    "Remote peer closed its session"
                );
                self.notices.emit(SessionNotice::RemoteClosed);
                Ok(())
            }
        }
    }

    async fn on_offer(&mut self, sdp: &str) -> PeerlinkResult<()> {
        if let Some(session) = &self.session {
            tracing::warn!(
                session = %session.id,
                state = %session.state,
                "Rejecting offer: a session is already active"
            );
            return Err(PeerlinkError::conflict(
                "offer",
                format!("session {} is {}", session.id, session.state),
            ));
        }

        let document =
            SdpDocument::parse(sdp).map_err(|e| PeerlinkError::malformed("offer SDP", e))?;

        self.open_session(Role::Responder).await?;
        if let Some(session) = self.session.as_mut() {
            session.pending_offer = Some(SessionDescription::offer(document));
            advance(session, &self.notices, NegotiationState::Negotiating);
        }
        Ok(())
    }

    async fn on_answer(&mut self, sdp: &str) -> PeerlinkResult<()> {
        let Some(session) = self.session.as_ref() else {
            tracing::warn!("Answer received with no active session");
            return Err(PeerlinkError::missing_session("answer"));
        };
        if !session.state.accepts_answer() {
            tracing::warn!(session = %session.id, state = %session.state, "Unexpected answer");
            return Err(PeerlinkError::conflict(
                "answer",
                format!("session {} is {}", session.id, session.state),
            ));
        }

        let document =
            SdpDocument::parse(sdp).map_err(|e| PeerlinkError::malformed("answer SDP", e))?;

        if let Err(e) = self.accept_answer(SessionDescription::answer(document)).await {
            self.fail_session(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) -> PeerlinkResult<()> {
        if candidate.is_end_of_candidates() {
            tracing::debug!("Remote end of candidates");
            return Ok(());
        }

        let Some(session) = self.session.as_mut() else {
            let _ = self.early_candidates.enqueue(candidate);
            tracing::debug!(
                buffered = self.early_candidates.len(),
                "Candidate before any session, holding it for the next one"
            );
            return Ok(());
        };

        let Some(candidate) = session.candidates.enqueue(candidate) else {
            tracing::debug!(
                session = %session.id,
                buffered = session.candidates.len(),
                "Candidate buffered until the remote description is applied"
            );
            return Ok(());
        };

        session
            .engine
            .add_ice_candidate(&candidate)
            .await
            .map_err(|e| {
                tracing::warn!(session = %session.id, error = %e, "Candidate rejected");
                PeerlinkError::malformed("ICE candidate", e)
            })
    }

    // === Engine events ===

    pub async fn handle_engine_event(&mut self, event: EngineEvent) -> PeerlinkResult<()> {
        let Some(session) = self.session.as_mut().filter(|s| s.id == event.session) else {
            tracing::debug!(
                event_session = %event.session,
                kind = ?event.kind,
                "Dropping engine event from a released session"
            );
            return Ok(());
        };

        match event.kind {
            EngineEventKind::NegotiationNeeded => {
                if let Some(offer) = session.pending_offer.take() {
                    if let Err(e) = self.answer_offer(offer).await {
                        self.fail_session(&e).await;
                        return Err(e);
                    }
                } else {
                    tracing::debug!(session = %session.id, "Negotiation needed, nothing to answer");
                }
            }
            EngineEventKind::IceCandidate(Some(candidate)) => {
                tracing::debug!(session = %session.id, candidate = %candidate.candidate, "Local candidate");
                self.signaling
                    .send(Envelope::Candidate { ice: candidate })
                    .await?;
            }
            EngineEventKind::IceCandidate(None) => {
                tracing::debug!(session = %session.id, "Local candidate gathering complete");
            }
            EngineEventKind::Track(track) => {
                tracing::info!(session = %session.id, mid = %track.mid, kind = %track.kind, "Remote track");
                session.tracks.route(track, &mut self.render);
            }
            EngineEventKind::ConnectivityStateChange(state) => {
                tracing::info!(
                    session = %session.id,
                    from = %session.connectivity,
                    to = %state,
                    "Connectivity state changed"
                );
                session.connectivity = state;
            }
            EngineEventKind::DataChannelOpen { label } => {
                tracing::info!(session = %session.id, label = %label, "Data channel open");
            }
            EngineEventKind::DataChannelMessage(bytes) => {
                let update = self.bridge.handle_frame(&bytes).inspect_err(|e| {
                    tracing::warn!(error = %e, "Undecodable data channel frame");
                })?;
                tracing::debug!(status = %update.summary(), "Device status");
                self.notices.emit(SessionNotice::Status(update));
            }
            EngineEventKind::DataChannelClosed => {
                tracing::info!(session = %session.id, "Data channel closed");
            }
        }
        Ok(())
    }

    /// Handle every engine event queued so far. Returns how many were handled.
    pub async fn pump_engine_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            let result = self.handle_engine_event(event).await;
            self.report(result);
            handled += 1;
        }
        handled
    }

    // === Run loop ===

    /// Drive the controller until [`ControlCommand::Shutdown`] or until the
    /// command sender is dropped.
    pub async fn run(
        mut self,
        mut inbound: Inbound,
        mut commands: mpsc::Receiver<ControlCommand>,
    ) -> PeerlinkResult<()> {
        let mut signaling_open = true;
        tracing::info!("Negotiation controller running");

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    let result = self.handle_engine_event(event).await;
                    self.report(result);
                }
                command = commands.recv() => match command {
                    Some(ControlCommand::Connect) => {
                        let result = self.connect().await;
                        self.report(result);
                    }
                    Some(ControlCommand::Disconnect) => self.disconnect().await,
                    Some(ControlCommand::SendData(text)) => {
                        self.send_data(&text);
                    }
                    Some(ControlCommand::Shutdown) | None => {
                        self.disconnect().await;
                        break;
                    }
                },
                message = inbound.recv(), if signaling_open => match message {
                    Some(Ok(envelope)) => {
                        let result = self.handle_envelope(envelope).await;
                        self.report(result);
                    }
                    Some(Err(e)) => self.report(Err(e)),
                    None => {
                        tracing::warn!("Signaling channel closed");
                        signaling_open = false;
                    }
                },
            }
        }

        tracing::info!("Negotiation controller stopped");
        Ok(())
    }

    // === Internals ===

    async fn open_session(&mut self, role: Role) -> PeerlinkResult<()> {
        let id = Uuid::now_v7();
        let events = EngineEvents::new(id, self.events_tx.clone());

        let mut engine = match self.factory.create(events).await {
            Ok(engine) => engine,
            Err(e) => {
                self.early_candidates.discard();
                return Err(e.at("create_connection"));
            }
        };

        let channel = match engine.open_data_channel(&self.settings.data_channel_label) {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close) = engine.close().await {
                    tracing::debug!(
                        session = %id,
                        error = %close,
                        "Engine close after channel failure"
                    );
                }
                self.early_candidates.discard();
                return Err(e.at("open_data_channel"));
            }
        };
        self.bridge.attach(channel);

        let mut tracks = TrackRouter::new(self.settings.track_assembly);
        tracks.start(&mut self.render);

        // Early candidates belong to an offer that is on its way. An initiator
        // has not offered yet, so anything held was trickled for an older session.
        let candidates = match role {
            Role::Responder => std::mem::take(&mut self.early_candidates),
            Role::Initiator => {
                let stale = self.early_candidates.discard();
                if stale > 0 {
                    tracing::debug!(
                        session = %id,
                        stale,
                        "Dropping candidates held from an earlier session"
                    );
                }
                IceCandidateBuffer::new()
            }
        };
        tracing::info!(
            session = %id,
            %role,
            adopted_candidates = candidates.len(),
            "Session created"
        );
        self.session = Some(Session::new(id, role, engine, candidates, tracks));
        self.notices.state(id, NegotiationState::Idle);
        Ok(())
    }

    async fn send_offer(&mut self) -> PeerlinkResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| PeerlinkError::missing_session("offer"))?;
        advance(session, &self.notices, NegotiationState::Offering);

        let offer = session
            .engine
            .create_offer(self.settings.offer)
            .await
            .map_err(|e| e.at("create_offer"))?;
        let filtered = SessionDescription::offer(self.settings.exclusions.apply(&offer.document));

        session
            .engine
            .set_local_description(&filtered)
            .await
            .map_err(|e| e.at("set_local_description"))?;
        let sdp = filtered.document.to_string();
        session.local_description = Some(filtered);

        self.signaling.send(Envelope::Offer { sdp }).await?;
        tracing::info!(
            session = %session.id,
            excluded = ?self.settings.exclusions.codecs(),
            "Offer sent"
        );
        advance(session, &self.notices, NegotiationState::AwaitingAnswer);
        Ok(())
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> PeerlinkResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| PeerlinkError::missing_session("answer"))?;

        session
            .engine
            .set_remote_description(&answer)
            .await
            .map_err(|e| e.at("set_remote_description"))?;
        session.remote_description = Some(answer);
        advance(session, &self.notices, NegotiationState::Connected);

        self.drain_candidates().await?;
        Ok(())
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> PeerlinkResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| PeerlinkError::missing_session("offer"))?;

        session
            .engine
            .set_remote_description(&offer)
            .await
            .map_err(|e| e.at("set_remote_description"))?;
        session.remote_description = Some(offer);

        let answer = session
            .engine
            .create_answer()
            .await
            .map_err(|e| e.at("create_answer"))?;
        session
            .engine
            .set_local_description(&answer)
            .await
            .map_err(|e| e.at("set_local_description"))?;
        let sdp = answer.document.to_string();
        session.local_description = Some(answer);

        self.signaling.send(Envelope::Answer { sdp }).await?;
        tracing::info!(session = %session.id, "Answer sent");
        advance(session, &self.notices, NegotiationState::Connected);

        self.drain_candidates().await?;
        Ok(())
    }

    /// Close the engine without notifying the peer and release the session.
    async fn fail_session(&mut self, error: &PeerlinkError) {
        self.early_candidates.discard();
        let Some(mut session) = self.session.take() else {
            return;
        };
        tracing::error!(
            session = %session.id,
            state = %session.state,
            code = error.error_code(),
            error = %error,
            "Negotiation failed, closing session"
        );
        if let Err(e) = session.engine.close().await {
            tracing::debug!(session = %session.id, error = %e, "Engine close after failure");
        }
        self.release(session);
    }

    fn release(&mut self, mut session: Session<F::Adapter>) {
        session.tracks.stop(&mut self.render);
        let dropped = session.candidates.discard();
        self.bridge.detach();
        session.transition(NegotiationState::Closed);
        self.resting_state = NegotiationState::Closed;
        self.notices.state(session.id, NegotiationState::Closed);
        tracing::info!(
            session = %session.id,
            dropped_candidates = dropped,
            lifetime_ms = (chrono::Utc::now() - session.created_at).num_milliseconds(),
            "Session released"
        );
    }

    fn report(&self, result: PeerlinkResult<()>) {
        if let Err(e) = result {
            if e.affects_session() {
                tracing::error!(code = e.error_code(), error = %e, "Operation failed");
            } else {
                tracing::warn!(code = e.error_code(), error = %e, "Operation rejected");
            }
            self.notices.emit(SessionNotice::Error {
                code: e.error_code().to_string(),
                message: e.to_string(),
            });
        }
    }
}
