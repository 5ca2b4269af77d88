//! Local media acquisition
//!
//! Capture devices are outside Duet; a [`MediaSource`] only decides which
//! local tracks a call offers. [`StaticMediaSource`] describes them
//! without opening any device.

use async_trait::async_trait;

use crate::error::SessionError;
use crate::transport::MediaKind;

/// Tracks requested for a call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub id: String,
    pub stream_id: String,
}

/// Tracks attached to the transport before negotiation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalMedia {
    pub tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, SessionError>;
}

/// Describes tracks without capturing anything
#[derive(Clone, Debug)]
pub struct StaticMediaSource {
    stream_id: String,
}

impl StaticMediaSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

impl Default for StaticMediaSource {
    fn default() -> Self {
        Self::new("duet")
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, SessionError> {
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(LocalTrack {
                kind: MediaKind::Video,
                id: "video".into(),
                stream_id: self.stream_id.clone(),
            });
        }
        if constraints.audio {
            tracks.push(LocalTrack {
                kind: MediaKind::Audio,
                id: "audio".into(),
                stream_id: self.stream_id.clone(),
            });
        }

        if tracks.is_empty() {
            return Err(SessionError::Media("no tracks requested".into()));
        }
        Ok(LocalMedia { tracks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_tracks() {
        let source = StaticMediaSource::default();
        let media = source
            .acquire(&MediaConstraints {
                video: true,
                audio: true,
            })
            .await
            .unwrap();

        assert_eq!(media.tracks.len(), 2);
        assert!(media.has(MediaKind::Video));
        assert!(media.has(MediaKind::Audio));
        assert!(media.tracks.iter().all(|t| t.stream_id == "duet"));
    }

    #[tokio::test]
    async fn test_nothing_requested_fails() {
        let source = StaticMediaSource::default();
        let result = source
            .acquire(&MediaConstraints {
                video: false,
                audio: false,
            })
            .await;
        assert!(matches!(result, Err(SessionError::Media(_))));
    }
}
