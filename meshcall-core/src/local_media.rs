//! Owns the local user-media and screen-share feeds.
//!
//! Enforces the mute contract: mute requests always proceed, unmute requests
//! are refused when no input device is available, and the committed state is
//! pushed into every live call.

use crate::feed::{CallFeed, FeedRegistry, LocalFeeds};
use crate::media::{MediaDevices, MediaStream, ScreenshareOptions};
use crate::member_state::FeedPurpose;
use crate::peer_call::PeerCall;
use crate::types::{DeviceId, GroupCallError, GroupCallEvent, GroupCallType, UserId};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Local capture and mute state for one group call.
pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    registry: Arc<FeedRegistry>,
    feeds: Arc<LocalFeeds>,
    local_user: UserId,
    local_device: DeviceId,
    call_type: GroupCallType,
    is_ptt: bool,
    init_audio_muted: AtomicBool,
    init_video_muted: AtomicBool,
    events: broadcast::Sender<GroupCallEvent>,
}

impl LocalMediaController {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        devices: Arc<dyn MediaDevices>,
        registry: Arc<FeedRegistry>,
        feeds: Arc<LocalFeeds>,
        local_user: UserId,
        local_device: DeviceId,
        call_type: GroupCallType,
        is_ptt: bool,
        events: broadcast::Sender<GroupCallEvent>,
    ) -> Self {
        Self {
            devices,
            registry,
            feeds,
            local_user,
            local_device,
            call_type,
            is_ptt,
            init_audio_muted: AtomicBool::new(false),
            init_video_muted: AtomicBool::new(false),
            events,
        }
    }

    /// Whether the local microphone is muted (the deferred bit before
    /// capture, the feed's bit after).
    #[must_use]
    pub fn is_microphone_muted(&self) -> bool {
        match self.feeds.user_media() {
            Some(feed) => feed.is_audio_muted(),
            None => self.init_audio_muted.load(Ordering::SeqCst),
        }
    }

    /// Whether local video is muted.
    #[must_use]
    pub fn is_video_muted(&self) -> bool {
        match self.feeds.user_media() {
            Some(feed) => feed.is_video_muted(),
            None => self.init_video_muted.load(Ordering::SeqCst),
        }
    }

    /// Whether the local device is screen sharing.
    #[must_use]
    pub fn is_screensharing(&self) -> bool {
        self.feeds.is_screensharing()
    }

    /// Acquire the microphone (and camera for video calls).
    ///
    /// # Errors
    ///
    /// Returns [`GroupCallError::NoUserMedia`] when capture fails.
    pub async fn capture_user_media(&self) -> Result<MediaStream, GroupCallError> {
        self.devices
            .get_user_media_stream(true, self.call_type == GroupCallType::Video)
            .await
            .map_err(|source| GroupCallError::NoUserMedia { source })
    }

    /// Release a stream that was captured but never adopted (the call was
    /// torn down while capture was in flight).
    pub fn discard_user_media(&self, stream: &MediaStream) {
        self.devices.stop_user_media_stream(stream);
    }

    /// Turn a captured stream into the local user-media feed and register it.
    pub fn adopt_user_media(&self, stream: MediaStream) -> Arc<CallFeed> {
        let audio_muted = self.init_audio_muted.load(Ordering::SeqCst)
            || !stream.has_audio()
            || self.is_ptt;
        let video_muted = self.init_video_muted.load(Ordering::SeqCst) || !stream.has_video();

        stream.set_audio_enabled(!audio_muted);
        stream.set_video_enabled(!video_muted);

        let feed = CallFeed::new(
            self.local_user.clone(),
            self.local_device.clone(),
            FeedPurpose::UserMedia,
            stream,
            true,
        );
        feed.set_audio_muted(audio_muted);
        feed.set_video_muted(video_muted);

        tracing::info!(audio_muted, video_muted, "local user media ready");
        self.registry.add_user_media_feed(feed.clone());
        self.feeds.set_user_media(Some(feed.clone()));
        feed
    }

    fn emit_mute_state(&self) {
        let _ = self.events.send(GroupCallEvent::LocalMuteStateChanged {
            audio_muted: self.is_microphone_muted(),
            video_muted: self.is_video_muted(),
        });
    }

    /// Mute or unmute the local microphone, pushing the bit into every call.
    ///
    /// Returns `false` without changing anything when an unmute is requested
    /// while no audio input device is available.
    pub async fn set_microphone_muted(&self, muted: bool, calls: &[Arc<dyn PeerCall>]) -> bool {
        if !muted && !self.devices.has_audio_device().await {
            tracing::info!("refusing to unmute: no audio input device");
            return false;
        }

        // Listeners should know we are about to speak before the tracks go
        // live; only PTT unmutes need the pre-pass.
        if !muted && self.is_ptt {
            let updates = join_all(calls.iter().map(|call| call.send_metadata_update())).await;
            for error in updates.into_iter().filter_map(Result::err) {
                tracing::warn!(%error, "metadata pre-update failed");
            }
        }

        match self.feeds.user_media() {
            Some(feed) => {
                feed.set_audio_muted(muted);
                feed.stream().set_audio_enabled(!muted);
            }
            None => self.init_audio_muted.store(muted, Ordering::SeqCst),
        }

        let pushes = join_all(calls.iter().map(|call| call.set_microphone_muted(muted))).await;
        for error in pushes.into_iter().filter_map(Result::err) {
            tracing::warn!(%error, "failed to push microphone mute into call");
        }

        self.emit_mute_state();
        true
    }

    /// Mute or unmute local video, pushing the bit into every call.
    ///
    /// Returns `false` without changing anything when an unmute is requested
    /// while no video input device is available.
    pub async fn set_video_muted(&self, muted: bool, calls: &[Arc<dyn PeerCall>]) -> bool {
        if !muted && !self.devices.has_video_device().await {
            tracing::info!("refusing to unmute video: no video input device");
            return false;
        }

        match self.feeds.user_media() {
            Some(feed) => {
                feed.set_video_muted(muted);
                feed.stream().set_video_enabled(!muted);
            }
            None => self.init_video_muted.store(muted, Ordering::SeqCst),
        }

        let pushes = join_all(calls.iter().map(|call| call.set_local_video_muted(muted))).await;
        for error in pushes.into_iter().filter_map(Result::err) {
            tracing::warn!(%error, "failed to push video mute into call");
        }

        self.emit_mute_state();
        true
    }

    /// Acquire a screen capture, register its feed, and push a copy onto
    /// every call.
    ///
    /// # Errors
    ///
    /// Returns [`GroupCallError::NoUserMedia`] when capture fails.
    pub async fn enable_screenshare(
        &self,
        opts: &ScreenshareOptions,
        calls: &[Arc<dyn PeerCall>],
    ) -> Result<Arc<CallFeed>, GroupCallError> {
        let stream = self
            .devices
            .get_screenshare_stream(opts)
            .await
            .map_err(|source| GroupCallError::NoUserMedia { source })?;

        let feed = CallFeed::new(
            self.local_user.clone(),
            self.local_device.clone(),
            FeedPurpose::Screenshare,
            stream,
            true,
        );
        self.registry.add_screenshare_feed(feed.clone());
        self.feeds.set_screenshare(Some(feed.clone()));

        let pushes = join_all(calls.iter().map(|call| call.push_local_feed(feed.fork()))).await;
        for error in pushes.into_iter().filter_map(Result::err) {
            tracing::warn!(%error, "failed to push screenshare feed into call");
        }

        tracing::info!(source_id = ?opts.source_id, "screen sharing enabled");
        let _ = self.events.send(GroupCallEvent::LocalScreenshareStateChanged {
            enabled: true,
            feed: Some(feed.clone()),
            source_id: opts.source_id.clone(),
        });
        Ok(feed)
    }

    /// Remove the screen-share feed from every call and stop the capture.
    pub async fn disable_screenshare(&self, calls: &[Arc<dyn PeerCall>]) {
        let Some(feed) = self.feeds.screenshare() else {
            return;
        };

        let removals = join_all(calls.iter().map(|call| call.remove_local_feed(&feed))).await;
        for error in removals.into_iter().filter_map(Result::err) {
            tracing::warn!(%error, "failed to remove screenshare feed from call");
        }

        self.devices.stop_screenshare_stream(feed.stream());
        if let Err(error) = self.registry.remove_screenshare_feed(&feed) {
            tracing::warn!(%error, "screenshare feed was not registered");
        }
        self.feeds.set_screenshare(None);

        tracing::info!("screen sharing disabled");
        let _ = self.events.send(GroupCallEvent::LocalScreenshareStateChanged {
            enabled: false,
            feed: None,
            source_id: None,
        });
    }

    /// Stop every local capture and drop all feeds.
    pub fn stop_all(&self) {
        if let Some(feed) = self.feeds.user_media() {
            self.devices.stop_user_media_stream(feed.stream());
            self.feeds.set_user_media(None);
        }
        if let Some(feed) = self.feeds.screenshare() {
            self.devices.stop_screenshare_stream(feed.stream());
            self.feeds.set_screenshare(None);
        }
        self.devices.stop_all_streams();
        self.registry.dispose_all();
    }
}
