//! Peer transport backed by the `webrtc` crate

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use duet_core::StatsReport;

use crate::error::TransportError;
use crate::media::LocalMedia;
use crate::transport::{
    ChannelState, ConnectionState, DataChannel, IceCandidate, MediaKind, PeerTransport, SdpType,
    SessionDescription, TransportEvent, TransportFactory,
};

/// Creates `webrtc` peer connections with the configured ICE servers
#[derive(Clone, Debug, Default)]
pub struct RtcTransportFactory {
    ice_servers: Vec<String>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        Ok(Box::new(RtcTransport::attach(pc, events)))
    }
}

/// A `webrtc` peer connection forwarding its callbacks as [`TransportEvent`]s
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl RtcTransport {
    fn attach(pc: Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to encode local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::StateChanged(connection_state(state)));
            })
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Remote data channel announced: {}", channel.label());
                forward_channel_events(&channel, &tx);
                let _ = tx.send(TransportEvent::DataChannel(Arc::new(RtcDataChannel {
                    inner: channel,
                })));
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    _ => return,
                };
                let _ = tx.send(TransportEvent::Track { kind });
            })
        }));

        Self {
            pc,
            events,
            tracks: Mutex::new(Vec::new()),
        }
    }
}

fn forward_channel_events(channel: &Arc<RTCDataChannel>, tx: &mpsc::UnboundedSender<TransportEvent>) {
    let label = channel.label().to_string();

    let (open_tx, open_label) = (tx.clone(), label.clone());
    channel.on_open(Box::new(move || {
        let tx = open_tx.clone();
        let label = open_label.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelOpen { label });
        })
    }));

    let (msg_tx, msg_label) = (tx.clone(), label.clone());
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = msg_tx.clone();
        let label = msg_label.clone();
        Box::pin(async move {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            let _ = tx.send(TransportEvent::ChannelMessage { label, text });
        })
    }));

    let (close_tx, close_label) = (tx.clone(), label);
    channel.on_close(Box::new(move || {
        let tx = close_tx.clone();
        let label = close_label.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelClosed { label });
        })
    }));
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    rtc.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), TransportError> {
        for track in &media.tracks {
            let mime_type = match track.kind {
                MediaKind::Video => MIME_TYPE_VP8,
                MediaKind::Audio => MIME_TYPE_OPUS,
            };

            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.clone(),
                track.stream_id.clone(),
            ));

            let sender = self
                .pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;

            // Drain RTCP so interceptors keep producing receiver reports
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });

            debug!("Attached local {} track {}", track.kind, track.id);
            self.tracks.lock().push(local);
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };

        let channel = self.pc.create_data_channel(label, Some(init)).await?;
        forward_channel_events(&channel, &self.events);
        Ok(Arc::new(RtcDataChannel { inner: channel }))
    }

    async fn get_stats(&self) -> Result<Vec<StatsReport>, TransportError> {
        let report = self.pc.get_stats().await;
        let snapshot = serde_json::to_value(&report.reports)
            .map_err(|e| TransportError::Rtc(format!("stats encoding: {}", e)))?;
        Ok(duet_core::stats::parse_reports(&snapshot))
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.tracks.lock().clear();
        self.pc.close().await?;
        Ok(())
    }
}

struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn state(&self) -> ChannelState {
        match self.inner.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::ChannelNotOpen(self.label().to_string()));
        }
        self.inner.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaSource, StaticMediaSource};

    async fn transport() -> (Box<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = RtcTransportFactory::default().create(tx).await.unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn test_offer_carries_media_and_channel() {
        let (offerer, _events) = transport().await;
        let media = StaticMediaSource::default()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();

        offerer.add_local_media(&media).await.unwrap();
        let channel = offerer.create_data_channel("ping").await.unwrap();
        assert_eq!(channel.label(), "ping");
        assert_ne!(channel.state(), ChannelState::Open);

        let offer = offerer.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=application"));

        offerer.set_local_description(offer).await.unwrap();
        assert_eq!(offerer.connection_state(), ConnectionState::New);
        offerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_to_offer() {
        let (offerer, _a) = transport().await;
        let (answerer, _b) = transport().await;
        offerer.create_data_channel("ping").await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();

        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        assert!(offerer.get_stats().await.is_ok());
        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_on_unopened_channel_fails() {
        let (offerer, _events) = transport().await;
        let channel = offerer.create_data_channel("ping").await.unwrap();

        assert_eq!(
            channel.send_text("{}".into()).await,
            Err(TransportError::ChannelNotOpen("ping".into()))
        );
        offerer.close().await.unwrap();
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }
}
