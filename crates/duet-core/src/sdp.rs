//! Session description inspection
//!
//! Looks only at the video section of a session description and reports
//! codec mappings, bandwidth lines and codec parameters that pin the
//! encoder to a fixed bitrate.

use crate::stats::has_fixed_bitrate_hint;

/// Findings from one session description
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SdpAnalysis {
    pub video_media_lines: Vec<String>,
    pub codec_mappings: Vec<String>,
    pub bandwidth_lines: Vec<String>,
    pub codec_parameters: Vec<String>,
    /// A `b=AS:` or `b=TIAS:` line was present in the video section
    pub explicit_bandwidth_limit: bool,
    /// A video fmtp line carries a bitrate parameter
    pub fixed_bitrate: bool,
}

impl SdpAnalysis {
    /// Render as log lines
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for line in &self.video_media_lines {
            lines.push(format!("video media line: {}", line));
        }
        for line in &self.codec_mappings {
            lines.push(format!("  codec mapping: {}", line));
        }
        for line in &self.bandwidth_lines {
            lines.push(format!("  bandwidth constraint: {}", line));
        }
        if self.explicit_bandwidth_limit {
            lines.push("  explicit bandwidth limit detected".into());
        }
        for line in &self.codec_parameters {
            lines.push(format!("  codec parameters: {}", line));
        }
        if self.fixed_bitrate {
            lines.push("  fixed bitrate parameter detected".into());
        }
        lines
    }
}

pub fn analyze_sdp(sdp: &str) -> SdpAnalysis {
    let mut analysis = SdpAnalysis::default();
    let mut in_video = false;

    for line in sdp.lines().map(str::trim_end) {
        if line.starts_with("m=video") {
            in_video = true;
            analysis.video_media_lines.push(line.to_string());
        } else if line.starts_with("m=") {
            in_video = false;
        }

        if !in_video {
            continue;
        }

        if line.starts_with("a=rtpmap:") {
            analysis.codec_mappings.push(line.to_string());
        } else if line.starts_with("b=") {
            if line.contains("AS:") || line.contains("TIAS:") {
                analysis.explicit_bandwidth_limit = true;
            }
            analysis.bandwidth_lines.push(line.to_string());
        } else if line.starts_with("a=fmtp:") {
            if has_fixed_bitrate_hint(line) {
                analysis.fixed_bitrate = true;
            }
            analysis.codec_parameters.push(line.to_string());
        }
    }

    analysis
}
