use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Unspecified,
}

impl From<RTPCodecType> for MediaKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => MediaKind::Audio,
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Unspecified,
        }
    }
}

/// A locally produced track. Cloning shares the underlying track; attaching
/// it to several connections does not affect the source.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    track: Arc<dyn TrackLocal + Send + Sync>,
}

impl LocalTrack {
    pub fn new(track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            id: track.id().to_string(),
            kind: MediaKind::from(track.kind()),
            track,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Owner of the local capture devices. The orchestrator only borrows the
/// track set it hands out.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> MeshResult<Vec<LocalTrack>>;
    fn release(&self);
}

/// Hands out a fixed track set.
#[derive(Default)]
pub struct StaticMediaSource {
    tracks: Mutex<Option<Vec<LocalTrack>>>,
}

impl StaticMediaSource {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks: Mutex::new(Some(tracks)),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_released(&self) -> bool {
        self.tracks.lock().is_none()
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self) -> MeshResult<Vec<LocalTrack>> {
        self.tracks
            .lock()
            .clone()
            .ok_or_else(|| MeshError::MediaUnavailable("media source already released".into()))
    }

    fn release(&self) {
        self.tracks.lock().take();
    }
}

/// Opus audio plus VP8 video sample tracks with nothing captured behind them.
/// Lets a headless participant negotiate full audio/video sessions.
pub struct SyntheticMediaSource {
    stream_id: String,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl SyntheticMediaSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: Mutex::new(Vec::new()),
        }
    }

    fn build(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        let audio = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            self.stream_id.clone(),
        );
        let video = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video".to_owned(),
            self.stream_id.clone(),
        );
        vec![Arc::new(audio), Arc::new(video)]
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self) -> MeshResult<Vec<LocalTrack>> {
        let mut guard = self.tracks.lock();
        if guard.is_empty() {
            *guard = self.build();
        }
        Ok(guard
            .iter()
            .map(|track| LocalTrack::new(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>))
            .collect())
    }

    fn release(&self) {
        self.tracks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthetic_source_yields_audio_and_video() {
        let source = SyntheticMediaSource::new("local");
        let tracks = source.acquire().await.expect("tracks");
        let kinds: Vec<_> = tracks.iter().map(LocalTrack::kind).collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
        assert_eq!(tracks[0].id(), "audio");

        let again = source.acquire().await.expect("tracks");
        assert!(Arc::ptr_eq(&tracks[0].rtc_track(), &again[0].rtc_track()));
    }

    #[tokio::test]
    async fn static_source_fails_after_release() {
        let source = StaticMediaSource::empty();
        assert!(source.acquire().await.expect("tracks").is_empty());
        source.release();
        assert!(source.is_released());
        assert!(matches!(
            source.acquire().await,
            Err(MeshError::MediaUnavailable(_))
        ));
    }
}
