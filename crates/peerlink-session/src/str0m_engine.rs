//! Media engine backed by `str0m`.
//!
//! str0m is sans-IO: we own the UDP socket and the clock, str0m handles ICE,
//! DTLS, SRTP and SDP. Each connection gets:
//! - one UDP socket bound to the configured IP (its only host candidate)
//! - a driver task that feeds datagrams and timeouts into the `Rtc` and maps
//!   its outputs to [`EngineEvent`](crate::engine::EngineEvent)s
//!
//! The adapter and the driver share the `Rtc` behind a std mutex. The lock is
//! only ever taken between awaits.

use crate::engine::{
    ConnectivityState, DataChannelHandle, EngineError, EngineEventKind, EngineEvents,
    EngineFactory, MediaEngineAdapter, OfferOptions, ReadyState,
};
use crate::ice::IceCandidate;
use crate::media::TrackEvent;
use crate::sdp::{SdpDocument, SdpType, SessionDescription};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::media::{Direction, MediaKind};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc, RtcError};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

/// Largest datagram we expect on the media socket.
const RECV_BUFFER: usize = 2000;

/// Creates one `str0m` connection per session.
#[derive(Debug, Clone)]
pub struct Str0mEngine {
    bind_ip: IpAddr,
    ice_servers: Vec<String>,
}

impl Str0mEngine {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            ice_servers: Vec::new(),
        }
    }

    /// STUN servers to advertise in logs. Only host candidates are gathered.
    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }
}

struct Shared {
    rtc: Rtc,
    pending_offer: Option<SdpPendingOffer>,
    pending_answer: Option<SdpAnswer>,
    /// Last description str0m generated, until it is committed.
    generated: Option<SessionDescription>,
    local_description: Option<SdpDocument>,
    channel_label: Option<String>,
    channel: Option<ChannelId>,
    connectivity: ConnectivityState,
    closed: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Str0mAdapter {
    shared: Arc<Mutex<Shared>>,
    wake: Arc<Notify>,
    channel_state: watch::Sender<ReadyState>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    driver: JoinHandle<()>,
}

impl EngineFactory for Str0mEngine {
    type Adapter = Str0mAdapter;

    async fn create(&mut self, events: EngineEvents) -> Result<Str0mAdapter, EngineError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await?;
        let local_addr = socket.local_addr()?;

        let mut rtc = Rtc::builder().build(Instant::now());
        let candidate = Candidate::host(local_addr, Protocol::Udp)
            .map_err(|e| EngineError::Candidate(e.to_string()))?;
        let candidate_sdp = candidate.to_sdp_string();
        rtc.add_local_candidate(candidate);

        tracing::debug!(
            session = %events.session(),
            addr = %local_addr,
            stun = ?self.ice_servers,
            "Bound media socket"
        );

        let shared = Arc::new(Mutex::new(Shared {
            rtc,
            pending_offer: None,
            pending_answer: None,
            generated: None,
            local_description: None,
            channel_label: None,
            channel: None,
            connectivity: ConnectivityState::New,
            closed: false,
        }));
        let wake = Arc::new(Notify::new());
        let (channel_state, _) = watch::channel(ReadyState::Connecting);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(drive(Driver {
            socket,
            local_addr,
            shared: Arc::clone(&shared),
            wake: Arc::clone(&wake),
            events: events.clone(),
            outbound: outbound_rx,
            channel_state: channel_state.clone(),
        }));

        events.emit(EngineEventKind::NegotiationNeeded);
        events.emit(EngineEventKind::IceCandidate(Some(IceCandidate {
            candidate: candidate_sdp,
            sdp_mid: None,
            sdp_m_line_index: Some(0),
            username_fragment: None,
        })));
        events.emit(EngineEventKind::IceCandidate(None));

        Ok(Str0mAdapter {
            shared,
            wake,
            channel_state,
            outbound,
            driver,
        })
    }
}

fn to_description(sdp_type: SdpType, sdp: &str) -> Result<SessionDescription, EngineError> {
    let document = SdpDocument::parse(sdp).map_err(|e| EngineError::Sdp(e.to_string()))?;
    Ok(SessionDescription { sdp_type, document })
}

/// Check that `committed` is `generated` with payload types removed at most:
/// same origin, same sections in the same order, formats a subset.
fn narrows(generated: &SdpDocument, committed: &SdpDocument) -> Result<(), EngineError> {
    let origin = |doc: &SdpDocument| {
        doc.session_lines()
            .find(|line| line.starts_with("o="))
            .map(str::to_owned)
    };
    if origin(generated) != origin(committed) {
        return Err(EngineError::Rejected(
            "description was not generated by this connection".into(),
        ));
    }
    if generated.media().len() != committed.media().len() {
        return Err(EngineError::Rejected(
            "media sections differ from the generated description".into(),
        ));
    }
    for (ours, theirs) in generated.media().iter().zip(committed.media()) {
        if ours.kind() != theirs.kind() {
            return Err(EngineError::Rejected(format!(
                "expected a {} section, found {}",
                ours.kind(),
                theirs.kind()
            )));
        }
        let offered = &ours.descriptor().formats;
        if let Some(extra) = theirs
            .descriptor()
            .formats
            .iter()
            .find(|format| !offered.contains(*format))
        {
            return Err(EngineError::Rejected(format!(
                "payload type {extra} is not in the generated {} section",
                ours.kind()
            )));
        }
    }
    Ok(())
}

impl MediaEngineAdapter for Str0mAdapter {
    async fn create_offer(&mut self, options: OfferOptions) -> Result<SessionDescription, EngineError> {
        let description = {
            let mut guard = lock(&self.shared);
            let shared = &mut *guard;
            let mut api = shared.rtc.sdp_api();
            if options.receive_audio {
                api.add_media(MediaKind::Audio, Direction::RecvOnly, None, None, None);
            }
            if options.receive_video {
                api.add_media(MediaKind::Video, Direction::RecvOnly, None, None, None);
            }
            if let Some(label) = &shared.channel_label {
                shared.channel = Some(api.add_channel(label.clone()));
            }
            let (offer, pending) = api
                .apply()
                .ok_or_else(|| EngineError::Sdp("nothing to negotiate".into()))?;
            let description = to_description(SdpType::Offer, &offer.to_sdp_string())?;
            shared.pending_offer = Some(pending);
            shared.generated = Some(description.clone());
            description
        };
        self.wake.notify_one();
        Ok(description)
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        let mut guard = lock(&self.shared);
        let answer = guard
            .pending_answer
            .take()
            .ok_or_else(|| EngineError::Sdp("no remote offer to answer".into()))?;
        let description = to_description(SdpType::Answer, &answer.to_sdp_string())?;
        guard.generated = Some(description.clone());
        Ok(description)
    }

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        // str0m fixes its side of the negotiation when it generates a
        // description. What gets committed may only narrow that description.
        let mut guard = lock(&self.shared);
        if guard.closed {
            return Err(EngineError::Closed);
        }
        if description.sdp_type == SdpType::Offer && guard.pending_offer.is_none() {
            return Err(EngineError::Rejected("no offer in flight".into()));
        }
        let generated = guard
            .generated
            .as_ref()
            .filter(|g| g.sdp_type == description.sdp_type)
            .ok_or_else(|| {
                EngineError::Rejected(format!("no generated {} to commit", description.sdp_type))
            })?;
        narrows(&generated.document, &description.document)?;

        guard.generated = None;
        guard.local_description = Some(description.document.clone());
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let sdp = description.document.to_string();
        {
            let mut guard = lock(&self.shared);
            let shared = &mut *guard;
            match description.sdp_type {
                SdpType::Offer => {
                    let offer =
                        SdpOffer::from_sdp_string(&sdp).map_err(|e| EngineError::Sdp(e.to_string()))?;
                    let answer = shared.rtc.sdp_api().accept_offer(offer)?;
                    shared.pending_answer = Some(answer);
                }
                SdpType::Answer => {
                    if shared.local_description.is_none() {
                        return Err(EngineError::Rejected(
                            "answer before the offer was committed".into(),
                        ));
                    }
                    let pending = shared
                        .pending_offer
                        .take()
                        .ok_or_else(|| EngineError::Rejected("answer without an offer".into()))?;
                    let answer = SdpAnswer::from_sdp_string(&sdp)
                        .map_err(|e| EngineError::Sdp(e.to_string()))?;
                    shared.rtc.sdp_api().accept_answer(pending, answer)?;
                }
            }
        }
        self.wake.notify_one();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), EngineError> {
        {
            let mut guard = lock(&self.shared);
            if guard.closed {
                return Err(EngineError::Closed);
            }
            let parsed = Candidate::from_sdp_string(&candidate.candidate)
                .map_err(|e| EngineError::Candidate(e.to_string()))?;
            guard.rtc.add_remote_candidate(parsed);
        }
        self.wake.notify_one();
        Ok(())
    }

    fn open_data_channel(&mut self, label: &str) -> Result<DataChannelHandle, EngineError> {
        // The channel is announced with the next offer. A responder binds to
        // whatever channel the remote opens.
        lock(&self.shared).channel_label = Some(label.to_string());
        Ok(DataChannelHandle::new(
            label,
            self.channel_state.subscribe(),
            self.outbound.clone(),
        ))
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        {
            let mut guard = lock(&self.shared);
            guard.rtc.disconnect();
            guard.closed = true;
            guard.connectivity = ConnectivityState::Closed;
        }
        self.channel_state.send_replace(ReadyState::Closed);
        self.wake.notify_one();
        Ok(())
    }

    fn connectivity_state(&self) -> ConnectivityState {
        lock(&self.shared).connectivity
    }
}

impl Drop for Str0mAdapter {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// ─── Driver ────────────────────────────────────────────────────────────────

struct Driver {
    socket: UdpSocket,
    local_addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    wake: Arc<Notify>,
    events: EngineEvents,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    channel_state: watch::Sender<ReadyState>,
}

async fn drive(mut driver: Driver) {
    let session = driver.events.session();
    let mut buf = vec![0u8; RECV_BUFFER];
    tracing::debug!(%session, "Media driver started");

    loop {
        let mut transmits = Vec::new();
        let deadline = {
            let mut guard = lock(&driver.shared);
            if guard.closed {
                break;
            }
            // DTLS is only set up once the answer is accepted; str0m must not
            // be polled while our offer is outstanding.
            if guard.pending_offer.is_some() {
                None
            } else {
                match poll_outputs(&mut guard, &driver, &mut transmits) {
                    Ok(deadline) => Some(deadline),
                    Err(e) => {
                        tracing::warn!(%session, error = %e, "WebRTC engine stopped");
                        break;
                    }
                }
            }
        };
        let Some(deadline) = deadline else {
            tracing::trace!(%session, "Offer outstanding, waiting for the answer");
            driver.wake.notified().await;
            continue;
        };

        for (destination, contents) in transmits {
            if let Err(e) = driver.socket.send_to(&contents, destination).await {
                tracing::debug!(%session, %destination, error = %e, "UDP send failed");
            }
        }

        let wait = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                feed(&driver.shared, Input::Timeout(Instant::now()));
            }
            _ = driver.wake.notified() => {}
            received = driver.socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => {
                    match Receive::new(Protocol::Udp, source, driver.local_addr, &buf[..len]) {
                        Ok(receive) => feed(&driver.shared, Input::Receive(Instant::now(), receive)),
                        Err(e) => tracing::trace!(%session, %source, error = ?e, "Dropping datagram"),
                    }
                }
                Err(e) => {
                    tracing::warn!(%session, error = %e, "UDP recv error");
                    break;
                }
            },
            Some(frame) = driver.outbound.recv() => {
                let mut guard = lock(&driver.shared);
                let shared = &mut *guard;
                let written = shared
                    .channel
                    .and_then(|id| shared.rtc.channel(id))
                    .map(|mut channel| channel.write(true, &frame));
                if !matches!(written, Some(Ok(_))) {
                    tracing::debug!(%session, "Data channel write dropped");
                }
            }
        }
    }

    driver.channel_state.send_replace(ReadyState::Closed);
    tracing::debug!(%session, "Media driver stopped");
}

fn feed(shared: &Mutex<Shared>, input: Input<'_>) {
    if let Err(e) = lock(shared).rtc.handle_input(input) {
        tracing::debug!(error = %e, "Input rejected by engine");
    }
}

/// Drain str0m's outputs until it asks for a timeout.
fn poll_outputs(
    shared: &mut Shared,
    driver: &Driver,
    transmits: &mut Vec<(SocketAddr, Vec<u8>)>,
) -> Result<Instant, RtcError> {
    loop {
        match shared.rtc.poll_output()? {
            Output::Timeout(at) => return Ok(at),
            Output::Transmit(t) => transmits.push((t.destination, t.contents.to_vec())),
            Output::Event(event) => on_event(shared, driver, event),
        }
    }
}

fn on_event(shared: &mut Shared, driver: &Driver, event: Event) {
    match event {
        Event::IceConnectionStateChange(state) => {
            let state = connectivity_from(state);
            shared.connectivity = state;
            driver.events.emit(EngineEventKind::ConnectivityStateChange(state));
        }
        Event::MediaAdded(media) => {
            driver.events.emit(EngineEventKind::Track(TrackEvent {
                mid: media.mid.to_string(),
                kind: media.kind.into(),
            }));
        }
        Event::ChannelOpen(id, label) => {
            let wanted = shared.channel.is_none_or(|ours| ours == id);
            if wanted {
                shared.channel = Some(id);
                driver.channel_state.send_replace(ReadyState::Open);
                driver.events.emit(EngineEventKind::DataChannelOpen { label });
            }
        }
        Event::ChannelData(data) if Some(data.id) == shared.channel => {
            driver.events.emit(EngineEventKind::DataChannelMessage(data.data));
        }
        Event::ChannelClose(id) if Some(id) == shared.channel => {
            driver.channel_state.send_replace(ReadyState::Closed);
            driver.events.emit(EngineEventKind::DataChannelClosed);
        }
        _ => {}
    }
}

fn connectivity_from(state: IceConnectionState) -> ConnectivityState {
    match state {
        IceConnectionState::New => ConnectivityState::New,
        IceConnectionState::Checking => ConnectivityState::Checking,
        IceConnectionState::Connected => ConnectivityState::Connected,
        IceConnectionState::Completed => ConnectivityState::Completed,
        IceConnectionState::Disconnected => ConnectivityState::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControlCommand, ControllerSettings, NegotiationController, SessionNotice};
    use crate::data_channel::LampStatus;
    use crate::engine::EngineEvent;
    use crate::sdp::{CodecExclusionPolicy, fixtures};
    use crate::signaling::memory_pair;
    use crate::testing::RecordingTarget;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use uuid::Uuid;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn adapter() -> (Str0mAdapter, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut engine = Str0mEngine::new(LOCALHOST);
        let adapter = engine
            .create(EngineEvents::new(Uuid::now_v7(), tx))
            .await
            .expect("bind on localhost");
        (adapter, rx)
    }

    #[tokio::test]
    async fn announces_negotiation_and_its_host_candidate() {
        let (_adapter, mut rx) = adapter().await;

        assert_eq!(rx.recv().await.unwrap().kind, EngineEventKind::NegotiationNeeded);
        let EngineEventKind::IceCandidate(Some(candidate)) = rx.recv().await.unwrap().kind else {
            panic!("expected the host candidate");
        };
        assert!(candidate.candidate.contains("127.0.0.1"));
        assert_eq!(rx.recv().await.unwrap().kind, EngineEventKind::IceCandidate(None));
    }

    #[tokio::test]
    async fn offer_carries_requested_sections_and_channel() {
        let (mut adapter, _rx) = adapter().await;
        adapter.open_data_channel("serial").unwrap();

        let offer = adapter
            .create_offer(OfferOptions {
                receive_audio: false,
                receive_video: true,
            })
            .await
            .unwrap();

        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.document.first_media("audio").is_none());
        assert!(offer.document.first_media("video").is_some());
        assert!(offer.document.first_media("application").is_some());
        adapter.set_local_description(&offer).await.unwrap();
    }

    #[tokio::test]
    async fn two_adapters_negotiate_offer_and_answer() {
        let (mut alice, _a) = adapter().await;
        let (mut bob, _b) = adapter().await;

        let offer = alice.create_offer(OfferOptions::default()).await.unwrap();
        alice.set_local_description(&offer).await.unwrap();

        bob.set_remote_description(&offer).await.unwrap();
        let answer = bob.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        bob.set_local_description(&answer).await.unwrap();

        alice.set_remote_description(&answer).await.unwrap();
        assert!(bob.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn committed_description_may_only_narrow_the_generated_one() {
        let (mut alice, _a) = adapter().await;
        let (mut bob, _b) = adapter().await;
        let offer = alice.create_offer(OfferOptions::default()).await.unwrap();

        let foreign = SessionDescription::offer(fixtures::offer_text().parse().unwrap());
        assert!(matches!(
            alice.set_local_description(&foreign).await,
            Err(EngineError::Rejected(_))
        ));

        // Answers are refused until the offer they answer has been committed.
        bob.set_remote_description(&offer).await.unwrap();
        let answer = bob.create_answer().await.unwrap();
        assert!(matches!(
            alice.set_remote_description(&answer).await,
            Err(EngineError::Rejected(_))
        ));

        let policy = CodecExclusionPolicy::new(["VP8", "VP9"]);
        let filtered = SessionDescription::offer(policy.apply(&offer.document));
        let video = filtered.document.first_media("video").unwrap();
        assert!(!video.codec_names().iter().any(|c| c.eq_ignore_ascii_case("VP8")));
        alice.set_local_description(&filtered).await.unwrap();
        assert!(matches!(
            alice.set_local_description(&filtered).await,
            Err(EngineError::Rejected(_))
        ));

        let mut lines: Vec<String> =
            answer.document.to_string().lines().map(str::to_owned).collect();
        let first_media = lines.iter().position(|l| l.starts_with("m=")).unwrap();
        lines[first_media].push_str(" 255");
        let widened = SessionDescription::answer(SdpDocument::parse(&lines.join("\r\n")).unwrap());
        assert!(matches!(
            bob.set_local_description(&widened).await,
            Err(EngineError::Rejected(_))
        ));
        bob.set_local_description(&answer).await.unwrap();
    }

    #[tokio::test]
    async fn two_controllers_carry_a_status_frame_over_the_data_channel() {
        let ((a_sig, a_in), (b_sig, b_in)) = memory_pair();
        let alice = NegotiationController::new(
            Str0mEngine::new(LOCALHOST),
            a_sig,
            RecordingTarget::default(),
            ControllerSettings::default(),
        );
        let mut bob = NegotiationController::new(
            Str0mEngine::new(LOCALHOST),
            b_sig,
            RecordingTarget::default(),
            ControllerSettings::default(),
        );
        let mut bob_notices = bob.subscribe();

        let (alice_commands, alice_rx) = mpsc::channel(8);
        let (bob_commands, bob_rx) = mpsc::channel(8);
        let alice_task = tokio::spawn(alice.run(a_in, alice_rx));
        let bob_task = tokio::spawn(bob.run(b_in, bob_rx));

        alice_commands.send(ControlCommand::Connect).await.unwrap();

        // Frames written before the channel opens are dropped, so keep sending.
        let frame = r#"{"status":"OFF","hours":3,"minutes":12}"#;
        let update = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                alice_commands
                    .send(ControlCommand::SendData(frame.into()))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                while let Ok(notice) = bob_notices.try_recv() {
                    if let SessionNotice::Status(update) = notice {
                        return update;
                    }
                }
            }
        })
        .await
        .expect("status frame should cross the data channel");

        assert_eq!(update.status, LampStatus::SwitchedOff);
        assert_eq!((update.hours, update.minutes), (3, 12));

        alice_commands.send(ControlCommand::Shutdown).await.unwrap();
        alice_task.await.unwrap().unwrap();
        bob_commands.send(ControlCommand::Shutdown).await.unwrap();
        bob_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let (mut adapter, _rx) = adapter().await;
        let channel = adapter.open_data_channel("serial").unwrap();
        adapter.close().await.unwrap();

        assert!(adapter.connectivity_state().is_closed());
        assert_eq!(channel.ready_state(), ReadyState::Closed);
        assert!(matches!(
            adapter
                .add_ice_candidate(&IceCandidate::new(
                    "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host"
                ))
                .await,
            Err(EngineError::Closed)
        ));
    }
}
