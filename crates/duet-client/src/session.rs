//! Call negotiation and telemetry orchestration
//!
//! A [`Session`] is one participant in one room. It reacts to signal
//! messages (room membership, offer/answer exchange, trickled candidates)
//! and, once a call is live, to transport events, sampler ticks and probe
//! timers. Everything runs on the task that calls [`Session::run`]; the
//! only suspension points are waiting for the next message or timer.
//!
//! ```text
//! Idle ──join──▶ Waiting{initiator} ──start_call/offer──▶ Negotiating ──▶ Connected
//!                      ▲                                        │
//!                      └──────────────── peer_left ─────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant, Interval};
use tracing::{debug, info, warn};

use duet_core::quality::QualitySnapshot;
use duet_core::stats::{codec_lines, debug_lines, extract_high_res, network_state, outbound_video};
use duet_core::{analyze_sdp, ClientConfig, Config, TelemetryConfig, PING_CHANNEL_LABEL};
use duet_signal::{CallRef, CandidatePayload, RoomRef, SdpPayload, SignalMessage};

use crate::candidate::{should_relay_candidate, PendingCandidates};
use crate::error::SessionError;
use crate::media::{LocalMedia, MediaConstraints, MediaSource};
use crate::prober::{ProbeMessage, Prober, SessionClock};
use crate::sampler::{cadence, SampleKind, Sampler};
use crate::telemetry::Telemetry;
use crate::transport::{
    ChannelState, ConnectionState, DataChannel, IceCandidate, PeerTransport, SdpType,
    SessionDescription, TransportEvent, TransportFactory,
};

/// Where the session is in the call lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// In the room, no call yet
    Waiting { initiator: bool },
    /// Descriptions exchanged or in flight
    Negotiating,
    Connected,
    Closed,
}

/// Transport and timers of the current call. Dropping it cancels every
/// timer the call started.
struct LiveCall {
    transport: Box<dyn PeerTransport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Probe channel, created by the initiator or adopted by the responder
    channel: Option<Arc<dyn DataChannel>>,
    sampler: Sampler,
    probe_tick: Interval,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
}

/// Something the live call needs handled
#[derive(Debug)]
enum LiveInput {
    Transport(Option<TransportEvent>),
    Sample(SampleKind),
    ProbeTick,
    ProbeExpired,
}

pub struct Session {
    room: String,
    client: ClientConfig,
    telemetry_config: TelemetryConfig,
    factory: Arc<dyn TransportFactory>,
    media_source: Arc<dyn MediaSource>,
    signal: mpsc::UnboundedSender<SignalMessage>,
    state: SessionState,
    initiator: bool,
    local_media: Option<LocalMedia>,
    call: Option<LiveCall>,
    pending: PendingCandidates,
    prober: Prober,
    telemetry: Telemetry,
    clock: SessionClock,
    snapshots: watch::Sender<QualitySnapshot>,
}

impl Session {
    /// Create a session for `room`. Outgoing signal messages are written to
    /// `signal`.
    pub fn new(
        room: impl Into<String>,
        config: &Config,
        factory: Arc<dyn TransportFactory>,
        media_source: Arc<dyn MediaSource>,
        signal: mpsc::UnboundedSender<SignalMessage>,
    ) -> Result<Self, SessionError> {
        config.telemetry.validate()?;

        let (snapshots, _) = watch::channel(QualitySnapshot::default());
        Ok(Self {
            room: room.into(),
            client: config.client.clone(),
            telemetry_config: config.telemetry.clone(),
            factory,
            media_source,
            signal,
            state: SessionState::Idle,
            initiator: false,
            local_media: None,
            call: None,
            pending: PendingCandidates::new(),
            prober: Prober::new(config.telemetry.probe_timeout()),
            telemetry: Telemetry::new(&config.telemetry),
            clock: SessionClock::start(),
            snapshots,
        })
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Quality snapshots, updated after every sampler tick
    pub fn subscribe(&self) -> watch::Receiver<QualitySnapshot> {
        self.snapshots.subscribe()
    }

    /// Join the room and drive the session until `shutdown` completes, the
    /// room turns out to be full, or the signal server goes away.
    pub async fn run<F>(
        &mut self,
        inbound: &mut mpsc::UnboundedReceiver<SignalMessage>,
        shutdown: F,
    ) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        info!("Joining room {}", self.room);
        self.send(SignalMessage::join(self.room.clone()))?;

        tokio::pin!(shutdown);
        let result = loop {
            let probe_deadline = self.prober.next_deadline().map(|ms| self.clock.instant_at(ms));

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Leaving room {}", self.room);
                    let _ = self.signal.send(SignalMessage::Leave(RoomRef::new(self.room.clone())));
                    break Ok(());
                }
                msg = inbound.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = self.handle_signal(msg).await {
                            break Err(e);
                        }
                    }
                    None => break Err(SessionError::SignalingClosed),
                },
                input = next_live_input(&mut self.call, probe_deadline) => {
                    if let Err(e) = self.handle_live_input(input).await {
                        break Err(e);
                    }
                }
            }
        };

        self.teardown().await;
        self.state = SessionState::Closed;
        result
    }

    /// React to one message from the signal server
    pub(crate) async fn handle_signal(&mut self, msg: SignalMessage) -> Result<(), SessionError> {
        match msg {
            SignalMessage::RoomCreated(room) => {
                info!("Created room {}; waiting for a peer", room.room_id);
                self.ensure_media().await?;
                self.initiator = true;
                self.state = SessionState::Waiting { initiator: true };
            }
            SignalMessage::RoomJoined(room) => {
                info!("Joined room {}", room.room_id);
                self.ensure_media().await?;
                self.initiator = false;
                self.state = SessionState::Waiting { initiator: false };
                self.send(SignalMessage::StartCall(CallRef {
                    room_id: Some(self.room.clone()),
                }))?;
            }
            SignalMessage::FullRoom(room) => {
                info!("Room {} is full", room.room_id);
                return Err(SessionError::RoomFull(room.room_id));
            }
            SignalMessage::StartCall(_) => {
                if !self.initiator {
                    debug!("Ignoring start_call as responder");
                    return Ok(());
                }
                if self.call.is_some() {
                    info!("Peer restarted the call");
                    self.teardown().await;
                }
                if let Err(e) = self.start_offer().await {
                    self.abort_call(e).await;
                }
            }
            SignalMessage::Offer(payload) => {
                if self.initiator {
                    warn!("Ignoring offer while initiator");
                    return Ok(());
                }
                if self.call.is_some() {
                    info!("Peer renegotiated; replacing the call");
                    self.close_call().await;
                    // Candidates from the replaced call must not reach the new one
                    self.pending.reset();
                }
                if let Err(e) = self.answer_offer(&payload).await {
                    self.abort_call(e).await;
                }
            }
            SignalMessage::Answer(payload) => {
                if let Err(e) = self.accept_answer(&payload).await {
                    self.abort_call(e).await;
                }
            }
            SignalMessage::IceCandidate(payload) => self.add_remote_candidate(&payload).await,
            SignalMessage::PeerLeft(room) => {
                info!("Peer left room {}", room.room_id);
                self.teardown().await;
                self.initiator = true;
                self.state = SessionState::Waiting { initiator: true };
            }
            SignalMessage::Error { code, message } => {
                warn!("Signal server error ({:?}): {}", code, message);
            }
            other => debug!("Ignoring unexpected {} message", other.event()),
        }
        Ok(())
    }

    async fn handle_live_input(&mut self, input: LiveInput) -> Result<(), SessionError> {
        match input {
            LiveInput::Transport(Some(event)) => self.handle_transport_event(event).await?,
            LiveInput::Transport(None) => {
                warn!("Transport event stream ended");
                self.teardown().await;
                self.state = SessionState::Waiting {
                    initiator: self.initiator,
                };
            }
            LiveInput::Sample(kind) => self.sample(kind).await,
            LiveInput::ProbeTick => self.probe().await,
            LiveInput::ProbeExpired => {
                let lost = self.prober.expire(self.clock.now_ms());
                if lost > 0 {
                    debug!("{} probe(s) timed out", lost);
                }
            }
        }
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), SessionError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.client.filter_candidates && !should_relay_candidate(&candidate.candidate) {
                    debug!("Not relaying candidate: {}", candidate.candidate);
                } else {
                    self.send(SignalMessage::IceCandidate(candidate.to_payload(&self.room)))?;
                }
            }
            TransportEvent::DataChannel(channel) => {
                if channel.label() != PING_CHANNEL_LABEL {
                    debug!("Ignoring data channel '{}'", channel.label());
                } else if let Some(call) = self.call.as_mut() {
                    debug!("Adopted probe channel from peer");
                    call.channel = Some(channel);
                }
            }
            TransportEvent::ChannelOpen { label } => info!("Data channel '{}' open", label),
            TransportEvent::ChannelMessage { label, text } => {
                if label == PING_CHANNEL_LABEL {
                    self.on_probe_message(&text).await;
                } else {
                    debug!("Ignoring message on channel '{}'", label);
                }
            }
            TransportEvent::ChannelClosed { label } => info!("Data channel '{}' closed", label),
            TransportEvent::Track { kind } => info!("Remote {} track received", kind),
            TransportEvent::StateChanged(state) => {
                info!("Peer connection {}", state);
                match state {
                    ConnectionState::Connected if self.call.is_some() => {
                        self.state = SessionState::Connected;
                    }
                    ConnectionState::Disconnected | ConnectionState::Failed => {
                        warn!("Peer connection {} in room {}", state, self.room);
                        if self.state == SessionState::Connected {
                            self.state = SessionState::Negotiating;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn ensure_media(&mut self) -> Result<(), SessionError> {
        if self.local_media.is_some() {
            return Ok(());
        }

        let constraints = MediaConstraints {
            video: true,
            audio: self.client.enable_audio,
        };
        match self.media_source.acquire(&constraints).await {
            Ok(media) => {
                debug!("Acquired {} local track(s)", media.tracks.len());
                self.local_media = Some(media);
                Ok(())
            }
            Err(e) => {
                warn!("Media acquisition failed: {}", e);
                Err(e)
            }
        }
    }

    /// New transport with local tracks attached
    async fn open_transport(
        &self,
    ) -> Result<(Box<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>), SessionError>
    {
        let media = self
            .local_media
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("call started before joining a room".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(tx).await?;
        if let Err(e) = transport.add_local_media(media).await {
            let _ = transport.close().await;
            return Err(e.into());
        }
        Ok((transport, rx))
    }

    async fn start_offer(&mut self) -> Result<(), SessionError> {
        let (transport, events) = self.open_transport().await?;

        let negotiated = async {
            let channel = transport.create_data_channel(PING_CHANNEL_LABEL).await?;
            let offer = transport.create_offer().await?;
            transport.set_local_description(offer.clone()).await?;
            self.send(SignalMessage::Offer(offer.to_payload(&self.room)))?;
            Ok::<_, SessionError>((channel, offer))
        }
        .await;

        match negotiated {
            Ok((channel, offer)) => {
                info!("Sent offer to room {}", self.room);
                self.begin_call(transport, events, Some(channel), Some(offer.sdp), None);
                Ok(())
            }
            Err(e) => {
                let _ = transport.close().await;
                Err(e)
            }
        }
    }

    async fn answer_offer(&mut self, payload: &SdpPayload) -> Result<(), SessionError> {
        let offer = SessionDescription::from_payload(payload, SdpType::Offer)?;
        let (transport, events) = self.open_transport().await?;

        let negotiated = async {
            transport.set_remote_description(offer.clone()).await?;
            apply_candidates(&*transport, self.pending.release()).await;

            let answer = transport.create_answer().await?;
            transport.set_local_description(answer.clone()).await?;
            self.send(SignalMessage::Answer(answer.to_payload(&self.room)))?;
            Ok::<_, SessionError>(answer)
        }
        .await;

        match negotiated {
            Ok(answer) => {
                info!("Sent answer to room {}", self.room);
                self.begin_call(transport, events, None, Some(answer.sdp), Some(offer.sdp));
                if let Some(call) = &self.call {
                    log_sdp_analysis(call);
                }
                Ok(())
            }
            Err(e) => {
                let _ = transport.close().await;
                Err(e)
            }
        }
    }

    async fn accept_answer(&mut self, payload: &SdpPayload) -> Result<(), SessionError> {
        if !self.initiator {
            warn!("Ignoring answer as responder");
            return Ok(());
        }
        let Some(call) = self.call.as_mut() else {
            warn!("Ignoring answer without an active call");
            return Ok(());
        };

        let answer = SessionDescription::from_payload(payload, SdpType::Answer)?;
        call.transport.set_remote_description(answer.clone()).await?;
        call.remote_sdp = Some(answer.sdp);
        apply_candidates(&*call.transport, self.pending.release()).await;

        debug!("Applied answer for room {}", self.room);
        log_sdp_analysis(call);
        Ok(())
    }

    async fn add_remote_candidate(&mut self, payload: &CandidatePayload) {
        let candidate = IceCandidate::from_payload(payload);
        let Some(candidate) = self.pending.admit(candidate) else {
            debug!("Queued remote candidate until the remote description is set");
            return;
        };

        match &self.call {
            Some(call) => {
                if let Err(e) = call.transport.add_ice_candidate(candidate).await {
                    warn!("Failed to add remote candidate: {}", e);
                }
            }
            None => debug!("Dropping remote candidate without an active call"),
        }
    }

    fn begin_call(
        &mut self,
        transport: Box<dyn PeerTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        channel: Option<Arc<dyn DataChannel>>,
        local_sdp: Option<String>,
        remote_sdp: Option<String>,
    ) {
        self.call = Some(LiveCall {
            transport,
            events,
            channel,
            sampler: Sampler::start(&self.telemetry_config),
            probe_tick: cadence(self.telemetry_config.probe_interval_ms),
            local_sdp,
            remote_sdp,
        });
        self.state = SessionState::Negotiating;
        info!("Telemetry started for room {}", self.room);
    }

    async fn on_probe_message(&mut self, text: &str) {
        let msg = match ProbeMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Ignoring malformed probe message: {}", e);
                return;
            }
        };

        match msg {
            ProbeMessage::Ping { .. } => {
                let Some(reply) = msg.respond() else {
                    return;
                };
                let Some(channel) = self.call.as_ref().and_then(|c| c.channel.clone()) else {
                    return;
                };
                match reply.to_json() {
                    Ok(json) => {
                        if let Err(e) = channel.send_text(json).await {
                            debug!("Failed to answer probe: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to encode pong: {}", e),
                }
            }
            ProbeMessage::Pong { id } => {
                let now = self.clock.now_ms();
                if let Some(rtt) = self.prober.on_pong(id, now) {
                    debug!("Probe RTT {:.1}ms", rtt);
                    self.telemetry.record_probe_rtt(now as f64, rtt);
                }
            }
        }
    }

    /// Probe tick: keep the channel alive and send one ping
    async fn probe(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.transport.connection_state() != ConnectionState::Connected {
            return;
        }

        let usable = call
            .channel
            .clone()
            .filter(|channel| channel.state() != ChannelState::Closed);
        let channel = match usable {
            Some(channel) => channel,
            None => {
                // Only the initiator opens the probe channel; the responder
                // waits for the peer's next one
                if self.initiator {
                    match call.transport.create_data_channel(PING_CHANNEL_LABEL).await {
                        Ok(channel) => {
                            info!("Reopened probe channel");
                            call.channel = Some(channel);
                        }
                        Err(e) => warn!("Failed to reopen probe channel: {}", e),
                    }
                }
                return;
            }
        };
        if channel.state() != ChannelState::Open {
            return;
        }

        let ping = self.prober.next_probe(self.clock.now_ms());
        match ping.to_json() {
            Ok(json) => {
                if let Err(e) = channel.send_text(json).await {
                    warn!("Failed to send probe: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode probe: {}", e),
        }
    }

    /// Sampler tick: query the transport and fold the results in
    async fn sample(&mut self, kind: SampleKind) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        if call.transport.connection_state() != ConnectionState::Connected {
            return;
        }

        let reports = match call.transport.get_stats().await {
            Ok(reports) => reports,
            Err(e) => {
                warn!("Stats query failed: {}", e);
                return;
            }
        };
        let now = self.clock.now_ms() as f64;

        match kind {
            SampleKind::HighRes => self.telemetry.record_high_res(extract_high_res(&reports, now)),
            SampleKind::Bitrate => {
                let bytes_sent = outbound_video(&reports).and_then(|out| out.bytes_sent);
                if let Some(bytes_sent) = bytes_sent {
                    if let Some(reading) = self.telemetry.record_outbound(bytes_sent, now) {
                        debug!(
                            "Outbound video {:.1} kbps (average {:.1} kbps)",
                            reading.instant_kbps, reading.average_kbps
                        );
                    }
                }
            }
            SampleKind::Basic => {
                self.telemetry.record_network(network_state(&reports));
                if let Some(out) = outbound_video(&reports) {
                    debug!(
                        "Outbound video: {} frames encoded, {} packets, {}x{}, limited by {}",
                        out.frames_encoded.unwrap_or(0),
                        out.packets_sent.unwrap_or(0),
                        out.frame_width.unwrap_or(0),
                        out.frame_height.unwrap_or(0),
                        out.quality_limitation_reason.as_deref().unwrap_or("none")
                    );
                }
            }
            SampleKind::Debug => {
                for line in debug_lines(&reports) {
                    debug!("{}", line);
                }
            }
            SampleKind::Codec => {
                for line in codec_lines(&reports) {
                    debug!("{}", line);
                }
            }
        }

        self.publish();
    }

    fn publish(&self) {
        self.snapshots
            .send_replace(self.telemetry.snapshot(&self.prober));
    }

    async fn abort_call(&mut self, error: SessionError) {
        warn!("Call setup in room {} failed: {}", self.room, error);
        self.teardown().await;
        self.state = SessionState::Waiting {
            initiator: self.initiator,
        };
    }

    /// Close the transport and drop the call's timers
    async fn close_call(&mut self) {
        let Some(call) = self.call.take() else {
            return;
        };
        if let Some(channel) = &call.channel {
            let _ = channel.close().await;
        }
        if let Err(e) = call.transport.close().await {
            warn!("Failed to close transport: {}", e);
        }
        info!(
            "Call in room {} torn down ({} probes answered, {} lost)",
            self.room,
            self.prober.replied(),
            self.prober.lost()
        );
    }

    /// End the current call and discard its state
    async fn teardown(&mut self) {
        self.close_call().await;
        self.prober.reset();
        self.pending.reset();
        self.telemetry.reset();
        self.publish();
    }

    fn send(&self, msg: SignalMessage) -> Result<(), SessionError> {
        self.signal
            .send(msg)
            .map_err(|_| SessionError::SignalingClosed)
    }
}

async fn apply_candidates(transport: &dyn PeerTransport, candidates: Vec<IceCandidate>) {
    if !candidates.is_empty() {
        debug!("Applying {} queued remote candidate(s)", candidates.len());
    }
    for candidate in candidates {
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("Failed to add remote candidate: {}", e);
        }
    }
}

fn log_sdp_analysis(call: &LiveCall) {
    for (side, sdp) in [("local", &call.local_sdp), ("remote", &call.remote_sdp)] {
        let Some(sdp) = sdp else {
            continue;
        };
        for line in analyze_sdp(sdp).lines() {
            debug!("{} SDP {}", side, line);
        }
    }
}

/// Next thing the live call needs; never resolves without a call
async fn next_live_input(call: &mut Option<LiveCall>, probe_deadline: Option<Instant>) -> LiveInput {
    let Some(call) = call.as_mut() else {
        return std::future::pending().await;
    };

    let expiry = async move {
        match probe_deadline {
            Some(at) => sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        event = call.events.recv() => LiveInput::Transport(event),
        kind = call.sampler.next() => LiveInput::Sample(kind),
        _ = call.probe_tick.tick() => LiveInput::ProbeTick,
        _ = expiry => LiveInput::ProbeExpired,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use duet_core::stats::parse_reports;
    use duet_core::StatsReport;

    use super::*;
    use crate::error::TransportError;
    use crate::media::StaticMediaSource;

    const OFFER_SDP: &str = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n";
    const ANSWER_SDP: &str = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\nb=AS:500\r\n";

    /// Everything the mock transport was asked to do
    struct Recorder {
        calls: Vec<&'static str>,
        remote: Vec<SessionDescription>,
        candidates: Vec<IceCandidate>,
        channels: Vec<String>,
        sent: Vec<String>,
        closed: bool,
        state: ConnectionState,
        channel_state: ChannelState,
        stats: Vec<StatsReport>,
    }

    impl Default for Recorder {
        fn default() -> Self {
            Self {
                calls: Vec::new(),
                remote: Vec::new(),
                candidates: Vec::new(),
                channels: Vec::new(),
                sent: Vec::new(),
                closed: false,
                state: ConnectionState::New,
                channel_state: ChannelState::Connecting,
                stats: Vec::new(),
            }
        }
    }

    type Log = Arc<Mutex<Recorder>>;

    struct MockChannel {
        label: String,
        log: Log,
    }

    #[async_trait]
    impl DataChannel for MockChannel {
        fn label(&self) -> &str {
            &self.label
        }

        fn state(&self) -> ChannelState {
            self.log.lock().channel_state
        }

        async fn send_text(&self, text: String) -> Result<(), TransportError> {
            let mut log = self.log.lock();
            if log.channel_state != ChannelState::Open {
                return Err(TransportError::ChannelNotOpen(self.label.clone()));
            }
            log.sent.push(text);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.log.lock().channel_state = ChannelState::Closed;
            Ok(())
        }
    }

    struct MockTransport {
        log: Log,
    }

    #[async_trait]
    impl PeerTransport for MockTransport {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            self.log.lock().calls.push("create_offer");
            Ok(SessionDescription::offer(OFFER_SDP))
        }

        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            self.log.lock().calls.push("create_answer");
            Ok(SessionDescription::answer(ANSWER_SDP))
        }

        async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), TransportError> {
            self.log.lock().calls.push("set_local_description");
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
            let mut log = self.log.lock();
            log.calls.push("set_remote_description");
            log.remote.push(desc);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
            let mut log = self.log.lock();
            log.calls.push("add_ice_candidate");
            log.candidates.push(candidate);
            Ok(())
        }

        async fn add_local_media(&self, _media: &LocalMedia) -> Result<(), TransportError> {
            self.log.lock().calls.push("add_local_media");
            Ok(())
        }

        async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
            let mut log = self.log.lock();
            log.calls.push("create_data_channel");
            log.channels.push(label.to_string());
            log.channel_state = ChannelState::Connecting;
            Ok(Arc::new(MockChannel {
                label: label.to_string(),
                log: self.log.clone(),
            }))
        }

        async fn get_stats(&self) -> Result<Vec<StatsReport>, TransportError> {
            Ok(self.log.lock().stats.clone())
        }

        fn connection_state(&self) -> ConnectionState {
            self.log.lock().state
        }

        async fn close(&self) -> Result<(), TransportError> {
            let mut log = self.log.lock();
            log.closed = true;
            log.state = ConnectionState::Closed;
            Ok(())
        }
    }

    struct MockFactory {
        log: Log,
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn create(
            &self,
            _events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<Box<dyn PeerTransport>, TransportError> {
            let mut log = self.log.lock();
            log.closed = false;
            log.calls.push("create");
            Ok(Box::new(MockTransport {
                log: self.log.clone(),
            }))
        }
    }

    fn session() -> (Session, mpsc::UnboundedReceiver<SignalMessage>, Log) {
        let log: Log = Arc::new(Mutex::new(Recorder::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            "R",
            &Config::default(),
            Arc::new(MockFactory { log: log.clone() }),
            Arc::new(StaticMediaSource::default()),
            tx,
        )
        .unwrap();
        (session, rx, log)
    }

    fn room(msg: fn(RoomRef) -> SignalMessage) -> SignalMessage {
        msg(RoomRef::new("R"))
    }

    fn candidate_payload(text: &str) -> SignalMessage {
        SignalMessage::IceCandidate(CandidatePayload {
            room_id: "R".into(),
            label: Some(0),
            candidate: text.into(),
            sdp_mid: Some("0".into()),
        })
    }

    const UDP4: &str = "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host";
    const UDP6: &str = "candidate:2 1 udp6 2122262783 ::1 5000 typ host";

    /// Initiator with a call in flight; the offer is drained
    async fn offering() -> (Session, mpsc::UnboundedReceiver<SignalMessage>, Log) {
        let (mut session, mut rx, log) = session();
        session.handle_signal(room(SignalMessage::RoomCreated)).await.unwrap();
        session
            .handle_signal(SignalMessage::StartCall(CallRef::default()))
            .await
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(SignalMessage::Offer(_))));
        (session, rx, log)
    }

    fn connect(log: &Log) {
        let mut log = log.lock();
        log.state = ConnectionState::Connected;
        log.channel_state = ChannelState::Open;
    }

    #[tokio::test]
    async fn test_room_created_waits_as_initiator() {
        let (mut session, mut rx, log) = session();
        assert_eq!(session.state(), SessionState::Idle);

        session.handle_signal(room(SignalMessage::RoomCreated)).await.unwrap();

        assert!(session.is_initiator());
        assert_eq!(session.state(), SessionState::Waiting { initiator: true });
        assert!(rx.try_recv().is_err());
        assert!(log.lock().calls.is_empty());
    }

    #[tokio::test]
    async fn test_room_joined_sends_start_call() {
        let (mut session, mut rx, _log) = session();
        session.handle_signal(room(SignalMessage::RoomJoined)).await.unwrap();

        assert!(!session.is_initiator());
        assert_eq!(
            rx.try_recv().unwrap(),
            SignalMessage::StartCall(CallRef {
                room_id: Some("R".into())
            })
        );
    }

    #[tokio::test]
    async fn test_start_call_makes_offer() {
        let (mut session, mut rx, log) = session();
        session.handle_signal(room(SignalMessage::RoomCreated)).await.unwrap();
        session
            .handle_signal(SignalMessage::StartCall(CallRef::default()))
            .await
            .unwrap();

        assert_eq!(
            log.lock().calls,
            vec![
                "create",
                "add_local_media",
                "create_data_channel",
                "create_offer",
                "set_local_description"
            ]
        );
        assert_eq!(log.lock().channels, vec![PING_CHANNEL_LABEL.to_string()]);

        match rx.try_recv().unwrap() {
            SignalMessage::Offer(payload) => {
                assert_eq!(payload.sdp_type, "offer");
                assert_eq!(payload.sdp, OFFER_SDP);
                assert_eq!(payload.room_id, "R");
            }
            other => panic!("expected an offer, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Negotiating);
    }

    #[tokio::test]
    async fn test_responder_ignores_start_call() {
        let (mut session, mut rx, log) = session();
        session.handle_signal(room(SignalMessage::RoomJoined)).await.unwrap();
        rx.try_recv().unwrap();

        session
            .handle_signal(SignalMessage::StartCall(CallRef::default()))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert!(log.lock().calls.is_empty());
    }

    #[tokio::test]
    async fn test_offer_answered_after_buffered_candidates() {
        let (mut session, mut rx, log) = session();
        session.handle_signal(room(SignalMessage::RoomJoined)).await.unwrap();
        rx.try_recv().unwrap();

        // Candidate overtakes the offer
        session.handle_signal(candidate_payload(UDP4)).await.unwrap();
        assert!(log.lock().candidates.is_empty());

        session
            .handle_signal(SignalMessage::Offer(SessionDescription::offer(OFFER_SDP).to_payload("R")))
            .await
            .unwrap();

        assert_eq!(
            log.lock().calls,
            vec![
                "create",
                "add_local_media",
                "set_remote_description",
                "add_ice_candidate",
                "create_answer",
                "set_local_description"
            ]
        );
        match rx.try_recv().unwrap() {
            SignalMessage::Answer(payload) => assert_eq!(payload.sdp, ANSWER_SDP),
            other => panic!("expected an answer, got {:?}", other),
        }

        // Later candidates go straight to the transport
        session.handle_signal(candidate_payload(UDP4)).await.unwrap();
        assert_eq!(log.lock().candidates.len(), 2);
        // The responder never opens the probe channel
        assert!(log.lock().channels.is_empty());
    }

    #[tokio::test]
    async fn test_renegotiation_starts_a_fresh_candidate_generation() {
        let (mut session, mut rx, log) = session();
        session.handle_signal(room(SignalMessage::RoomJoined)).await.unwrap();
        rx.try_recv().unwrap();

        let offer = SignalMessage::Offer(SessionDescription::offer(OFFER_SDP).to_payload("R"));
        session.handle_signal(offer.clone()).await.unwrap();
        session.handle_signal(candidate_payload(UDP4)).await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(SignalMessage::Answer(_))));
        assert!(session.pending.is_ready());

        log.lock().calls.clear();
        session.handle_signal(offer).await.unwrap();

        // The replacement call applies its remote description before any candidate
        assert_eq!(
            log.lock().calls,
            vec![
                "create",
                "add_local_media",
                "set_remote_description",
                "create_answer",
                "set_local_description"
            ]
        );
        assert!(session.pending.is_empty());
        assert!(matches!(rx.try_recv(), Ok(SignalMessage::Answer(_))));

        session.handle_signal(candidate_payload(UDP4)).await.unwrap();
        assert_eq!(log.lock().candidates.len(), 2);
        assert_eq!(log.lock().calls.last(), Some(&"add_ice_candidate"));
    }

    #[tokio::test]
    async fn test_answer_flushes_candidates() {
        let (mut session, _rx, log) = offering().await;

        session.handle_signal(candidate_payload(UDP4)).await.unwrap();
        assert!(log.lock().candidates.is_empty());

        session
            .handle_signal(SignalMessage::Answer(SessionDescription::answer(ANSWER_SDP).to_payload("R")))
            .await
            .unwrap();

        let log = log.lock();
        assert_eq!(log.remote, vec![SessionDescription::answer(ANSWER_SDP)]);
        assert_eq!(log.candidates.len(), 1);
        let n = log.calls.len();
        assert_eq!(&log.calls[n - 2..], &["set_remote_description", "add_ice_candidate"]);
    }

    #[tokio::test]
    async fn test_mislabelled_offer_abandons_call() {
        let (mut session, mut rx, log) = session();
        session.handle_signal(room(SignalMessage::RoomJoined)).await.unwrap();
        rx.try_recv().unwrap();

        session
            .handle_signal(SignalMessage::Offer(SessionDescription::answer(ANSWER_SDP).to_payload("R")))
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert!(log.lock().calls.is_empty());
        assert_eq!(session.state(), SessionState::Waiting { initiator: false });
    }

    #[tokio::test]
    async fn test_local_candidates_filtered() {
        let (mut session, mut rx, _log) = offering().await;

        let local = |text: &str| {
            LiveInput::Transport(Some(TransportEvent::LocalCandidate(IceCandidate {
                candidate: text.to_string(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            })))
        };

        session.handle_live_input(local(UDP6)).await.unwrap();
        assert!(rx.try_recv().is_err());

        session.handle_live_input(local(UDP4)).await.unwrap();
        match rx.try_recv().unwrap() {
            SignalMessage::IceCandidate(payload) => {
                assert_eq!(payload.candidate, UDP4);
                assert_eq!(payload.room_id, "R");
                assert_eq!(payload.label, Some(0));
            }
            other => panic!("expected a candidate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_candidate_filter_can_be_disabled() {
        let log: Log = Arc::new(Mutex::new(Recorder::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut config = Config::default();
        config.client.filter_candidates = false;
        let mut session = Session::new(
            "R",
            &config,
            Arc::new(MockFactory { log: log.clone() }),
            Arc::new(StaticMediaSource::default()),
            tx,
        )
        .unwrap();

        session.handle_signal(room(SignalMessage::RoomCreated)).await.unwrap();
        session
            .handle_signal(SignalMessage::StartCall(CallRef::default()))
            .await
            .unwrap();
        rx.try_recv().unwrap();

        session
            .handle_live_input(LiveInput::Transport(Some(TransportEvent::LocalCandidate(
                IceCandidate {
                    candidate: UDP6.into(),
                    sdp_mid: None,
                    sdp_mline_index: Some(0),
                },
            ))))
            .await
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(SignalMessage::IceCandidate(_))));
    }

    #[tokio::test]
    async fn test_full_room_ends_session() {
        let (mut session, _rx, _log) = session();
        let result = session.handle_signal(room(SignalMessage::FullRoom)).await;
        assert!(matches!(result, Err(SessionError::RoomFull(room)) if room == "R"));
    }

    #[tokio::test]
    async fn test_peer_left_tears_down() {
        let (mut session, _rx, log) = offering().await;
        connect(&log);

        session.handle_signal(room(SignalMessage::PeerLeft)).await.unwrap();

        assert!(log.lock().closed);
        assert!(session.call.is_none());
        assert_eq!(session.prober.outstanding(), 0);
        assert_eq!(session.state(), SessionState::Waiting { initiator: true });
    }

    #[tokio::test]
    async fn test_responder_becomes_initiator_after_peer_left() {
        let (mut session, mut rx, _log) = session();
        session.handle_signal(room(SignalMessage::RoomJoined)).await.unwrap();
        session
            .handle_signal(SignalMessage::Offer(SessionDescription::offer(OFFER_SDP).to_payload("R")))
            .await
            .unwrap();
        session.handle_signal(room(SignalMessage::PeerLeft)).await.unwrap();
        assert!(session.is_initiator());

        // A new joiner's start_call now gets an offer from us
        while rx.try_recv().is_ok() {}
        session
            .handle_signal(SignalMessage::StartCall(CallRef::default()))
            .await
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(SignalMessage::Offer(_))));
    }

    #[tokio::test]
    async fn test_media_failure_stops_session() {
        let log: Log = Arc::new(Mutex::new(Recorder::default()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = Config::default();
        config.client.enable_audio = true;

        struct NoDevices;

        #[async_trait]
        impl MediaSource for NoDevices {
            async fn acquire(&self, _c: &MediaConstraints) -> Result<LocalMedia, SessionError> {
                Err(SessionError::Media("no camera".into()))
            }
        }

        let mut session = Session::new(
            "R",
            &config,
            Arc::new(MockFactory { log }),
            Arc::new(NoDevices),
            tx,
        )
        .unwrap();
        let result = session.handle_signal(room(SignalMessage::RoomCreated)).await;
        assert!(matches!(result, Err(SessionError::Media(_))));
    }

    #[tokio::test]
    async fn test_connection_state_tracked() {
        let (mut session, _rx, _log) = offering().await;
        session
            .handle_live_input(LiveInput::Transport(Some(TransportEvent::StateChanged(
                ConnectionState::Connected,
            ))))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_round_trip() {
        let (mut session, _rx, log) = offering().await;
        connect(&log);

        session.handle_live_input(LiveInput::ProbeTick).await.unwrap();
        let sent = log.lock().sent.clone();
        assert_eq!(sent.len(), 1);
        let ping = ProbeMessage::from_json(&sent[0]).unwrap();
        assert!(matches!(ping, ProbeMessage::Ping { .. }));

        tokio::time::advance(Duration::from_millis(40)).await;
        let pong = ping.respond().unwrap().to_json().unwrap();
        session
            .handle_live_input(LiveInput::Transport(Some(TransportEvent::ChannelMessage {
                label: PING_CHANNEL_LABEL.into(),
                text: pong,
            })))
            .await
            .unwrap();

        assert_eq!(session.prober.replied(), 1);
        assert_eq!(session.prober.outstanding(), 0);
        assert_eq!(session.telemetry.probe_rtt_samples(), 1);
        assert_eq!(session.telemetry.snapshot(&session.prober).probe_rtt.current, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probe_counted_lost() {
        let (mut session, _rx, log) = offering().await;
        connect(&log);

        session.handle_live_input(LiveInput::ProbeTick).await.unwrap();
        assert_eq!(session.prober.outstanding(), 1);

        tokio::time::advance(Duration::from_millis(1000)).await;
        session.handle_live_input(LiveInput::ProbeExpired).await.unwrap();

        assert_eq!(session.prober.outstanding(), 0);
        assert_eq!(session.prober.lost(), 1);
        assert_eq!(session.telemetry.probe_rtt_samples(), 0);
    }

    #[tokio::test]
    async fn test_probe_skipped_until_connected() {
        let (mut session, _rx, log) = offering().await;
        log.lock().channel_state = ChannelState::Open;

        session.handle_live_input(LiveInput::ProbeTick).await.unwrap();
        assert!(log.lock().sent.is_empty());
        assert_eq!(session.prober.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_reopened_by_initiator() {
        let (mut session, _rx, log) = offering().await;
        connect(&log);
        log.lock().channel_state = ChannelState::Closed;

        session.handle_live_input(LiveInput::ProbeTick).await.unwrap();

        assert_eq!(log.lock().channels.len(), 2);
        assert!(log.lock().sent.is_empty());
    }

    #[tokio::test]
    async fn test_responder_adopts_channel_and_answers_pings() {
        let (mut session, mut rx, log) = session();
        session.handle_signal(room(SignalMessage::RoomJoined)).await.unwrap();
        session
            .handle_signal(SignalMessage::Offer(SessionDescription::offer(OFFER_SDP).to_payload("R")))
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}
        connect(&log);

        let channel: Arc<dyn DataChannel> = Arc::new(MockChannel {
            label: PING_CHANNEL_LABEL.into(),
            log: log.clone(),
        });
        session
            .handle_live_input(LiveInput::Transport(Some(TransportEvent::DataChannel(channel))))
            .await
            .unwrap();
        session
            .handle_live_input(LiveInput::Transport(Some(TransportEvent::ChannelMessage {
                label: PING_CHANNEL_LABEL.into(),
                text: r#"{"type":"ping","id":1234.5}"#.into(),
            })))
            .await
            .unwrap();

        let sent = log.lock().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            ProbeMessage::from_json(&sent[0]).unwrap(),
            ProbeMessage::Pong { id: 1234.5 }
        );

        // A closed channel is left for the peer to replace
        log.lock().channel_state = ChannelState::Closed;
        session.handle_live_input(LiveInput::ProbeTick).await.unwrap();
        assert!(log.lock().channels.is_empty());
    }

    #[tokio::test]
    async fn test_sample_tick_publishes_snapshot() {
        let (mut session, _rx, log) = offering().await;
        let snapshots = session.subscribe();
        log.lock().stats = parse_reports(&json!([
            {"type": "remote-inbound-rtp", "id": "r1", "kind": "video", "roundTripTime": 0.04, "jitter": 0.002},
            {"type": "candidate-pair", "id": "p1", "state": "succeeded", "currentRoundTripTime": 0.03, "availableOutgoingBitrate": 1500000.0}
        ]));

        // Not connected: nothing is sampled
        session.handle_live_input(LiveInput::Sample(SampleKind::HighRes)).await.unwrap();
        assert_eq!(snapshots.borrow().rtt_samples, 0);

        connect(&log);
        session.handle_live_input(LiveInput::Sample(SampleKind::HighRes)).await.unwrap();
        session.handle_live_input(LiveInput::Sample(SampleKind::Basic)).await.unwrap();

        let snapshot = snapshots.borrow().clone();
        assert_eq!(snapshot.rtt_samples, 1);
        assert_eq!(snapshot.rtt.current, 40.0);
        assert_eq!(snapshot.network.and_then(|n| n.available_outgoing_kbps), Some(1500.0));
    }

    #[tokio::test]
    async fn test_run_joins_and_leaves() {
        let (mut session, mut rx, _log) = session();
        let (_inbound_tx, mut inbound) = mpsc::unbounded_channel();

        session.run(&mut inbound, async {}).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), SignalMessage::join("R"));
        assert_eq!(rx.try_recv().unwrap(), SignalMessage::Leave(RoomRef::new("R")));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_run_ends_when_signaling_closes() {
        let (mut session, _rx, _log) = session();
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<SignalMessage>();
        drop(inbound_tx);

        let result = session.run(&mut inbound, std::future::pending()).await;
        assert!(matches!(result, Err(SessionError::SignalingClosed)));
    }

    #[tokio::test]
    async fn test_run_stops_on_full_room() {
        let (mut session, _rx, _log) = session();
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
        inbound_tx.send(room(SignalMessage::FullRoom)).unwrap();

        let result = session.run(&mut inbound, std::future::pending()).await;
        assert!(matches!(result, Err(SessionError::RoomFull(_))));
        assert_eq!(session.state(), SessionState::Closed);
    }
}
