//! Typed extraction of transport statistics reports
//!
//! Transports hand over their statistics as browser-shaped JSON objects
//! (a `type` discriminator plus camelCase fields). This module turns those
//! into [`StatsReport`] values and derives the samples the telemetry
//! windows consume.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::window::{BitrateSample, FrameDelaySample, RttSample, SlidingWindow};

/// `remote-inbound-rtp`: what the far side reports about our stream
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteInboundRtp {
    #[serde(deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(deserialize_with = "lenient::text")]
    pub kind: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub media_type: Option<String>,
    #[serde(deserialize_with = "lenient::uint")]
    pub ssrc: Option<u64>,
    /// Seconds
    #[serde(deserialize_with = "lenient::number")]
    pub round_trip_time: Option<f64>,
    /// Seconds
    #[serde(deserialize_with = "lenient::number")]
    pub jitter: Option<f64>,
    #[serde(deserialize_with = "lenient::number")]
    pub fraction_lost: Option<f64>,
    #[serde(deserialize_with = "lenient::number")]
    pub total_round_trip_time: Option<f64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub round_trip_time_measurements: Option<u64>,
}

/// `inbound-rtp`: what we receive
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InboundRtp {
    #[serde(deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(deserialize_with = "lenient::text")]
    pub kind: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub media_type: Option<String>,
    /// Milliseconds on the report clock
    #[serde(deserialize_with = "lenient::number")]
    pub timestamp: Option<f64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub ssrc: Option<u64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub bytes_received: Option<u64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub packets_received: Option<u64>,
    #[serde(deserialize_with = "lenient::number")]
    pub packets_lost: Option<f64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub frames_decoded: Option<u64>,
    /// Milliseconds on the report clock
    #[serde(deserialize_with = "lenient::number")]
    pub estimated_capture_time: Option<f64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub frame_width: Option<u64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub frame_height: Option<u64>,
}

/// `outbound-rtp`: what we send
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutboundRtp {
    #[serde(deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(deserialize_with = "lenient::text")]
    pub kind: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub media_type: Option<String>,
    #[serde(deserialize_with = "lenient::uint")]
    pub ssrc: Option<u64>,
    /// Milliseconds
    #[serde(deserialize_with = "lenient::number")]
    pub timestamp: Option<f64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub bytes_sent: Option<u64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub packets_sent: Option<u64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub frames_encoded: Option<u64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub frame_width: Option<u64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub frame_height: Option<u64>,
    #[serde(deserialize_with = "lenient::text")]
    pub codec_id: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub encoder_implementation: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub quality_limitation_reason: Option<String>,
    /// Bits per second
    #[serde(deserialize_with = "lenient::number")]
    pub target_bitrate: Option<f64>,
    /// Legacy spelling of `targetBitrate`
    #[serde(deserialize_with = "lenient::number")]
    pub goog_target_bitrate: Option<f64>,
}

/// `candidate-pair`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CandidatePair {
    #[serde(deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(deserialize_with = "lenient::text")]
    pub state: Option<String>,
    /// Seconds
    #[serde(deserialize_with = "lenient::number")]
    pub current_round_trip_time: Option<f64>,
    /// Bits per second
    #[serde(deserialize_with = "lenient::number")]
    pub available_outgoing_bitrate: Option<f64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub bytes_sent: Option<u64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub bytes_received: Option<u64>,
}

impl CandidatePair {
    pub fn succeeded(&self) -> bool {
        self.state
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("succeeded"))
            .unwrap_or(false)
    }
}

/// `codec`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Codec {
    #[serde(deserialize_with = "lenient::id")]
    pub id: String,
    #[serde(deserialize_with = "lenient::text")]
    pub mime_type: Option<String>,
    #[serde(deserialize_with = "lenient::uint")]
    pub payload_type: Option<u64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub clock_rate: Option<u64>,
    #[serde(deserialize_with = "lenient::uint")]
    pub channels: Option<u64>,
    #[serde(deserialize_with = "lenient::text")]
    pub sdp_fmtp_line: Option<String>,
}

impl RemoteInboundRtp {
    /// `kind`, or the older `mediaType`
    pub fn media_kind(&self) -> Option<&str> {
        self.kind.as_deref().or(self.media_type.as_deref())
    }
}

impl InboundRtp {
    pub fn media_kind(&self) -> Option<&str> {
        self.kind.as_deref().or(self.media_type.as_deref())
    }

    /// Capture-to-report delay of the latest decoded frame, stamped with
    /// the caller's sample time. Both ends of the delay are read from the
    /// report itself so they share a clock.
    pub fn frame_delay(&self, sampled_at: f64) -> Option<FrameDelaySample> {
        let frames = self.frames_decoded.filter(|f| *f > 0)?;
        let capture = self.estimated_capture_time.filter(|t| *t > 0.0)?;
        let delay = self.timestamp? - capture;
        if delay < 0.0 {
            return None;
        }

        Some(FrameDelaySample {
            timestamp: sampled_at,
            delay,
            frame_seq: frames,
        })
    }
}

impl OutboundRtp {
    pub fn media_kind(&self) -> Option<&str> {
        self.kind.as_deref().or(self.media_type.as_deref())
    }

    /// Encoder target in bits per second, under either spelling
    pub fn target_bitrate_bps(&self) -> Option<f64> {
        self.goog_target_bitrate.or(self.target_bitrate)
    }
}

/// One entry of a transport statistics snapshot
#[derive(Clone, Debug, PartialEq)]
pub enum StatsReport {
    RemoteInboundRtp(RemoteInboundRtp),
    InboundRtp(InboundRtp),
    OutboundRtp(OutboundRtp),
    CandidatePair(CandidatePair),
    Codec(Codec),
    Other { id: String, report_type: String },
}

/// Fields shared by every report, read before the typed body
#[derive(Deserialize)]
struct ReportHeader {
    #[serde(rename = "type", default, deserialize_with = "lenient::text")]
    report_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::id")]
    id: String,
}

impl StatsReport {
    /// Parse a single report object. Returns `None` without a `type` field
    /// or when a known report type has a malformed body.
    pub fn from_json(value: &Value) -> Option<Self> {
        let header = ReportHeader::deserialize(value).ok()?;
        let Some(report_type) = header.report_type else {
            // Externally tagged encodings wrap the report in a one-key object
            return match value.as_object() {
                Some(map) if map.len() == 1 => map
                    .values()
                    .next()
                    .filter(|inner| inner.get("type").is_some())
                    .and_then(Self::from_json),
                _ => None,
            };
        };

        let report = match report_type.as_str() {
            "remote-inbound-rtp" => StatsReport::RemoteInboundRtp(typed(value)?),
            "inbound-rtp" => StatsReport::InboundRtp(typed(value)?),
            "outbound-rtp" => StatsReport::OutboundRtp(typed(value)?),
            "candidate-pair" => StatsReport::CandidatePair(typed(value)?),
            "codec" => StatsReport::Codec(typed(value)?),
            _ => StatsReport::Other {
                id: header.id,
                report_type,
            },
        };

        Some(report)
    }

    pub fn id(&self) -> &str {
        match self {
            StatsReport::RemoteInboundRtp(r) => &r.id,
            StatsReport::InboundRtp(r) => &r.id,
            StatsReport::OutboundRtp(r) => &r.id,
            StatsReport::CandidatePair(r) => &r.id,
            StatsReport::Codec(r) => &r.id,
            StatsReport::Other { id, .. } => id,
        }
    }

    pub fn report_type(&self) -> &str {
        match self {
            StatsReport::RemoteInboundRtp(_) => "remote-inbound-rtp",
            StatsReport::InboundRtp(_) => "inbound-rtp",
            StatsReport::OutboundRtp(_) => "outbound-rtp",
            StatsReport::CandidatePair(_) => "candidate-pair",
            StatsReport::Codec(_) => "codec",
            StatsReport::Other { report_type, .. } => report_type,
        }
    }
}

fn typed<T: DeserializeOwned>(value: &Value) -> Option<T> {
    T::deserialize(value).ok()
}

/// Parse a whole snapshot: either an array of report objects or a map of
/// id to report object.
pub fn parse_reports(snapshot: &Value) -> Vec<StatsReport> {
    match snapshot {
        Value::Array(items) => items.iter().filter_map(StatsReport::from_json).collect(),
        Value::Object(map) => map
            .iter()
            .filter_map(|(key, item)| {
                let mut report = StatsReport::from_json(item)?;
                if report.id().is_empty() {
                    set_id(&mut report, key.clone());
                }
                Some(report)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn set_id(report: &mut StatsReport, key: String) {
    match report {
        StatsReport::RemoteInboundRtp(r) => r.id = key,
        StatsReport::InboundRtp(r) => r.id = key,
        StatsReport::OutboundRtp(r) => r.id = key,
        StatsReport::CandidatePair(r) => r.id = key,
        StatsReport::Codec(r) => r.id = key,
        StatsReport::Other { id, .. } => *id = key,
    }
}

/// Field deserializers that map unexpected shapes to `None` instead of
/// failing the whole report
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Numbers, including the numeric strings some browsers emit for legacy fields
    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        let parsed: Option<f64> = match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        Ok(parsed.filter(|v| v.is_finite()))
    }

    pub fn uint<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(number(d)?.filter(|v| *v >= 0.0).map(|v| v as u64))
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(text(d)?.unwrap_or_default())
    }
}

fn is_video(kind: Option<&str>) -> bool {
    kind == Some("video")
}

/// Samples pulled from one high-resolution tick
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HighResSamples {
    pub rtt: Vec<RttSample>,
    pub frame_delay: Vec<FrameDelaySample>,
}

/// Extract transport RTT and frame-delay samples at sample time `now_ms`.
///
/// `now_ms` only stamps the samples; frame delay is measured on the
/// report's own clock.
pub fn extract_high_res(reports: &[StatsReport], now_ms: f64) -> HighResSamples {
    let mut samples = HighResSamples::default();

    for report in reports {
        match report {
            StatsReport::RemoteInboundRtp(r) if is_video(r.media_kind()) => {
                let rtt = r.round_trip_time.map(|s| s * 1000.0).unwrap_or(0.0);
                if rtt > 0.0 {
                    samples.rtt.push(RttSample {
                        timestamp: now_ms,
                        rtt,
                        jitter: r.jitter.map(|s| s * 1000.0),
                    });
                }
            }
            StatsReport::InboundRtp(r) if is_video(r.media_kind()) => {
                samples.frame_delay.extend(r.frame_delay(now_ms));
            }
            _ => {}
        }
    }

    samples
}

/// First outbound video report, if any
pub fn outbound_video(reports: &[StatsReport]) -> Option<&OutboundRtp> {
    reports.iter().find_map(|report| match report {
        StatsReport::OutboundRtp(r) if is_video(r.media_kind()) => Some(r),
        _ => None,
    })
}

/// Network state of the selected candidate pair
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub current_rtt_ms: Option<f64>,
    pub available_outgoing_kbps: Option<f64>,
}

/// Network state from the first succeeded candidate pair
pub fn network_state(reports: &[StatsReport]) -> Option<NetworkState> {
    reports.iter().find_map(|report| match report {
        StatsReport::CandidatePair(pair) if pair.succeeded() => Some(NetworkState {
            current_rtt_ms: pair.current_round_trip_time.map(|s| s * 1000.0),
            available_outgoing_kbps: pair.available_outgoing_bitrate.map(|b| b / 1000.0),
        }),
        _ => None,
    })
}

/// One bitrate derivation result
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BitrateReading {
    pub instant_kbps: f64,
    pub average_kbps: f64,
}

/// Derives outbound bitrate from cumulative byte counters
#[derive(Clone, Debug)]
pub struct BitrateTracker {
    last: Option<(u64, f64)>,
    history: SlidingWindow<BitrateSample>,
}

impl BitrateTracker {
    pub fn new(window: usize) -> Self {
        Self {
            last: None,
            history: SlidingWindow::new(window),
        }
    }

    /// Feed the cumulative byte counter observed at `timestamp_ms`.
    ///
    /// The first observation only primes the tracker. A zero or negative
    /// time delta, or a counter that went backwards, produces no sample.
    pub fn observe(&mut self, bytes_sent: u64, timestamp_ms: f64) -> Option<BitrateReading> {
        let previous = self.last.replace((bytes_sent, timestamp_ms));
        let (last_bytes, last_ts) = previous?;

        let elapsed_ms = timestamp_ms - last_ts;
        if !(elapsed_ms > 0.0) || bytes_sent < last_bytes {
            return None;
        }

        // bits per millisecond is kilobits per second
        let instant_kbps = (bytes_sent - last_bytes) as f64 * 8.0 / elapsed_ms;
        if !instant_kbps.is_finite() {
            return None;
        }

        self.history.push(BitrateSample {
            timestamp: timestamp_ms,
            kbps: instant_kbps,
        });

        Some(BitrateReading {
            instant_kbps,
            average_kbps: self.average_kbps().unwrap_or(instant_kbps),
        })
    }

    /// Moving average over the retained readings
    pub fn average_kbps(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().map(|s| s.kbps).sum::<f64>() / self.history.len() as f64)
    }

    pub fn latest_kbps(&self) -> Option<f64> {
        self.history.latest().map(|s| s.kbps)
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.history.clear();
    }
}

/// Verbose per-report dump for the deep debug cadence
pub fn debug_lines(reports: &[StatsReport]) -> Vec<String> {
    let mut lines = Vec::new();

    for report in reports {
        lines.push(format!("[{}] {}", report.report_type(), report.id()));
        match report {
            StatsReport::OutboundRtp(r) if is_video(r.media_kind()) => {
                lines.push(format!(
                    "  outbound video ssrc={} bytes_sent={} packets_sent={} frames_encoded={} size={}x{}",
                    show(r.ssrc),
                    show(r.bytes_sent),
                    show(r.packets_sent),
                    show(r.frames_encoded),
                    show(r.frame_width),
                    show(r.frame_height),
                ));
            }
            StatsReport::RemoteInboundRtp(r) if is_video(r.media_kind()) => {
                lines.push(format!(
                    "  remote inbound ssrc={} fraction_lost={} ({:.1}%) jitter={} rtt={} total_rtt={} measurements={}",
                    show(r.ssrc),
                    show(r.fraction_lost),
                    r.fraction_lost.unwrap_or(0.0) * 100.0,
                    show(r.jitter),
                    show(r.round_trip_time),
                    show(r.total_round_trip_time),
                    show(r.round_trip_time_measurements),
                ));
            }
            StatsReport::InboundRtp(r) if is_video(r.media_kind()) => {
                lines.push(format!(
                    "  inbound video ssrc={} bytes_received={} packets_received={} packets_lost={} frames_decoded={} size={}x{}",
                    show(r.ssrc),
                    show(r.bytes_received),
                    show(r.packets_received),
                    show(r.packets_lost),
                    show(r.frames_decoded),
                    show(r.frame_width),
                    show(r.frame_height),
                ));
            }
            StatsReport::CandidatePair(pair) if pair.succeeded() => {
                lines.push(format!(
                    "  network rtt={} available_outgoing_bitrate={} bytes_sent={} bytes_received={}",
                    show(pair.current_round_trip_time),
                    show(pair.available_outgoing_bitrate),
                    show(pair.bytes_sent),
                    show(pair.bytes_received),
                ));
            }
            _ => {}
        }
    }

    lines
}

const HARDWARE_ENCODER_MARKERS: [&str; 4] = ["Hardware", "VAAPI", "NVENC", "MediaFoundation"];

/// Codec and encoder analysis for the codec cadence
pub fn codec_lines(reports: &[StatsReport]) -> Vec<String> {
    let mut lines = Vec::new();

    for report in reports {
        match report {
            StatsReport::Codec(codec) => {
                lines.push(format!(
                    "codec {} payload_type={} clock_rate={} channels={} fmtp={}",
                    codec.mime_type.as_deref().unwrap_or("unknown"),
                    show(codec.payload_type),
                    show(codec.clock_rate),
                    codec.channels.unwrap_or(1),
                    codec.sdp_fmtp_line.as_deref().unwrap_or("N/A"),
                ));
                if codec
                    .sdp_fmtp_line
                    .as_deref()
                    .map(has_fixed_bitrate_hint)
                    .unwrap_or(false)
                {
                    lines.push("  fixed bitrate parameter detected".into());
                }
            }
            StatsReport::OutboundRtp(r) if is_video(r.media_kind()) => {
                let encoder = r.encoder_implementation.as_deref().unwrap_or("unknown");
                lines.push(format!(
                    "video stream codec={} quality_limitation={} encoder={}",
                    r.codec_id.as_deref().unwrap_or("unknown"),
                    r.quality_limitation_reason.as_deref().unwrap_or("none"),
                    encoder,
                ));
                if HARDWARE_ENCODER_MARKERS.iter().any(|m| encoder.contains(m)) {
                    lines.push("  hardware encoder detected, may use fixed bitrate modes".into());
                }
                if let Some(target) = r.target_bitrate_bps() {
                    let kbps = target / 1000.0;
                    lines.push(format!("  target bitrate {:.2} kbps", kbps));
                    if kbps > 0.0 && kbps < 500.0 {
                        lines.push("  low fixed bitrate suspected".into());
                    }
                }
            }
            _ => {}
        }
    }

    lines
}

/// `max-bitrate`, `bitrate` or `maxbr` in an fmtp line, case-insensitive
pub fn has_fixed_bitrate_hint(fmtp: &str) -> bool {
    let fmtp = fmtp.to_ascii_lowercase();
    fmtp.contains("max-bitrate") || fmtp.contains("bitrate") || fmtp.contains("maxbr")
}

fn show<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "N/A".into())
}
