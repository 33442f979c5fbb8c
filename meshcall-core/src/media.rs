//! Local media stream model and the capture-device interface.
//!
//! The coordinator never touches capture hardware itself; it asks a
//! [`MediaDevices`] implementation for streams and hands them back for
//! disposal. Streams and tracks here are bookkeeping handles: the actual
//! sample transport belongs to the call layer.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Errors produced while acquiring or driving capture.
#[derive(Error, Debug)]
pub enum MediaError {
    /// No capture device of the requested kind is available.
    #[error("no capture device available: {0}")]
    DeviceNotFound(String),

    /// The platform refused or aborted the capture request.
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// The kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// An audio track.
    Audio,
    /// A video track.
    Video,
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// One track of a [`MediaStream`].
///
/// Cloning yields another handle to the same underlying track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a new enabled track of the given kind.
    #[must_use]
    pub fn new(kind: MediaKind) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    /// Unique id of the track.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The kind of media this track carries.
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// Whether the track is currently transmitting.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable transmission.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Mark the track as ended (the source went away).
    pub fn end(&self) {
        let _ = self.inner.ended.send(true);
    }

    /// Whether the source has ended.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Subscribe to the ended flag.
    #[must_use]
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.inner.ended.subscribe()
    }
}

#[derive(Debug)]
struct StreamInner {
    id: String,
    tracks: RwLock<Vec<MediaTrack>>,
}

/// A set of tracks acquired from one capture request.
///
/// Cloning yields another handle to the same stream; [`MediaStream::fork`]
/// creates a distinct stream sharing the same tracks, which is how one
/// capture is fanned out to many calls.
#[derive(Debug, Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracks(Vec::new())
    }

    /// Create a stream holding the given tracks.
    #[must_use]
    pub fn with_tracks(tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: uuid::Uuid::new_v4().to_string(),
                tracks: RwLock::new(tracks),
            }),
        }
    }

    /// Create a stream with one audio and/or one video track.
    #[must_use]
    pub fn capture(audio: bool, video: bool) -> Self {
        let mut tracks = Vec::new();
        if audio {
            tracks.push(MediaTrack::new(MediaKind::Audio));
        }
        if video {
            tracks.push(MediaTrack::new(MediaKind::Video));
        }
        Self::with_tracks(tracks)
    }

    /// Unique id of the stream.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// All tracks in the stream.
    #[must_use]
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.inner.tracks.read().clone()
    }

    fn tracks_of(&self, kind: MediaKind) -> Vec<MediaTrack> {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    /// The audio tracks in the stream.
    #[must_use]
    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(MediaKind::Audio)
    }

    /// The video tracks in the stream.
    #[must_use]
    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(MediaKind::Video)
    }

    /// Whether the stream carries at least one audio track.
    #[must_use]
    pub fn has_audio(&self) -> bool {
        !self.audio_tracks().is_empty()
    }

    /// Whether the stream carries at least one video track.
    #[must_use]
    pub fn has_video(&self) -> bool {
        !self.video_tracks().is_empty()
    }

    /// Enable or disable every audio track.
    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.audio_tracks() {
            track.set_enabled(enabled);
        }
    }

    /// Enable or disable every video track.
    pub fn set_video_enabled(&self, enabled: bool) {
        for track in self.video_tracks() {
            track.set_enabled(enabled);
        }
    }

    /// A new stream, with its own id, sharing this stream's tracks.
    #[must_use]
    pub fn fork(&self) -> MediaStream {
        Self::with_tracks(self.tracks())
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for a screen-capture request.
#[derive(Debug, Clone, Default)]
pub struct ScreenshareOptions {
    /// Platform-specific id of the surface to capture.
    pub source_id: Option<String>,
    /// Capture system audio alongside the surface.
    pub capture_audio: bool,
}

/// Capture-device interface consumed by the coordinator.
///
/// Implement this against the platform media stack. Acquisitions are paired
/// with exactly one matching stop call by the coordinator.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a microphone/camera stream.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] if no device is available or capture fails.
    async fn get_user_media_stream(&self, audio: bool, video: bool)
        -> Result<MediaStream, MediaError>;

    /// Acquire a screen-capture stream.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] if the user declines or capture fails.
    async fn get_screenshare_stream(
        &self,
        opts: &ScreenshareOptions,
    ) -> Result<MediaStream, MediaError>;

    /// Whether an audio input device is currently available.
    async fn has_audio_device(&self) -> bool;

    /// Whether a video input device is currently available.
    async fn has_video_device(&self) -> bool;

    /// Release a user-media stream acquired from this handler.
    fn stop_user_media_stream(&self, stream: &MediaStream);

    /// Release a screen-capture stream acquired from this handler.
    fn stop_screenshare_stream(&self, stream: &MediaStream);

    /// Release every stream this handler is still tracking.
    fn stop_all_streams(&self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn capture_builds_requested_tracks() {
        let stream = MediaStream::capture(true, false);
        assert!(stream.has_audio());
        assert!(!stream.has_video());

        let stream = MediaStream::capture(true, true);
        assert_eq!(stream.tracks().len(), 2);
    }

    #[test]
    fn fork_shares_tracks_but_not_identity() {
        let stream = MediaStream::capture(true, true);
        let forked = stream.fork();
        assert_ne!(stream.id(), forked.id());

        stream.set_audio_enabled(false);
        assert!(!forked.audio_tracks()[0].is_enabled());
    }

    #[tokio::test]
    async fn track_end_is_observable() {
        let track = MediaTrack::new(MediaKind::Video);
        let mut ended = track.ended();
        assert!(!track.is_ended());

        track.end();
        ended.changed().await.unwrap();
        assert!(*ended.borrow());
        assert!(track.is_ended());
    }
}
