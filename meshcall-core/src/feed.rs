//! Call feeds and the per-call feed registry.
//!
//! A [`CallFeed`] pairs a media stream with the `(user, device)` that
//! produces it plus mute state and speaking-volume samples. The
//! [`FeedRegistry`] owns the ordered user-media and screen-share sequences
//! and runs the active-speaker selection pass.

use crate::media::MediaStream;
use crate::member_state::{FeedAdvertisement, FeedPurpose};
use crate::types::{DeviceId, GroupCallEvent, UserId, SPEAKING_THRESHOLD};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// How many speaking-volume samples a feed retains.
const SPEAKING_SAMPLE_COUNT: usize = 8;

/// Errors from feed registry operations.
#[derive(Error, Debug)]
pub enum FeedError {
    /// No feed is registered for the given key.
    #[error("no feed registered for {user_id} ({device_id})")]
    NotFound {
        /// The user part of the key.
        user_id: UserId,
        /// The device part of the key.
        device_id: DeviceId,
    },
}

/// One media feed of a call participant (local or remote).
#[derive(Debug)]
pub struct CallFeed {
    id: String,
    user_id: UserId,
    device_id: DeviceId,
    purpose: FeedPurpose,
    local: bool,
    stream: MediaStream,
    audio_muted: AtomicBool,
    video_muted: AtomicBool,
    volume_samples: Mutex<Vec<f32>>,
    sampling: AtomicBool,
    disposed: AtomicBool,
}

impl CallFeed {
    /// Create a feed for the given owner and stream.
    #[must_use]
    pub fn new(
        user_id: UserId,
        device_id: DeviceId,
        purpose: FeedPurpose,
        stream: MediaStream,
        local: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            device_id,
            purpose,
            local,
            stream,
            audio_muted: AtomicBool::new(false),
            video_muted: AtomicBool::new(false),
            volume_samples: Mutex::new(Vec::new()),
            sampling: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Unique id of this feed object.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The user producing the feed.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device producing the feed.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The `(user, device)` key the feed is registered under.
    #[must_use]
    pub fn key(&self) -> (UserId, DeviceId) {
        (self.user_id.clone(), self.device_id.clone())
    }

    /// What the feed carries.
    #[must_use]
    pub fn purpose(&self) -> FeedPurpose {
        self.purpose
    }

    /// Whether this device produced the feed.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// The underlying stream.
    #[must_use]
    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    /// Whether the feed's audio is muted.
    #[must_use]
    pub fn is_audio_muted(&self) -> bool {
        self.audio_muted.load(Ordering::SeqCst)
    }

    /// Whether the feed's video is muted.
    #[must_use]
    pub fn is_video_muted(&self) -> bool {
        self.video_muted.load(Ordering::SeqCst)
    }

    /// Set the audio mute bit.
    pub fn set_audio_muted(&self, muted: bool) {
        self.audio_muted.store(muted, Ordering::SeqCst);
    }

    /// Set the video mute bit.
    pub fn set_video_muted(&self, muted: bool) {
        self.video_muted.store(muted, Ordering::SeqCst);
    }

    /// Enable or disable speaking-volume sampling.
    pub fn set_volume_sampling(&self, enabled: bool) {
        self.sampling.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.volume_samples.lock().clear();
        }
    }

    /// Record one speaking-volume sample; the buffer keeps the most recent
    /// [`SPEAKING_SAMPLE_COUNT`] values.
    pub fn append_volume_sample(&self, volume: f32) {
        if !self.sampling.load(Ordering::SeqCst) {
            return;
        }
        let mut samples = self.volume_samples.lock();
        samples.push(volume);
        let len = samples.len();
        if len > SPEAKING_SAMPLE_COUNT {
            samples.drain(..len - SPEAKING_SAMPLE_COUNT);
        }
    }

    /// Mean of the buffered samples clamped below at `threshold`, or `None`
    /// when no samples have been recorded (such feeds are skipped by the
    /// active-speaker pass).
    #[must_use]
    pub fn average_volume(&self, threshold: f32) -> Option<f32> {
        let samples = self.volume_samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        Some(mean.max(threshold))
    }

    /// A new feed object for the same owner, forking the stream and copying
    /// the current mute bits. Used to hand per-call copies of local feeds to
    /// the call layer.
    #[must_use]
    pub fn fork(self: &Arc<Self>) -> Arc<CallFeed> {
        let feed = CallFeed::new(
            self.user_id.clone(),
            self.device_id.clone(),
            self.purpose,
            self.stream.fork(),
            self.local,
        );
        feed.set_audio_muted(self.is_audio_muted());
        feed.set_video_muted(self.is_video_muted());
        feed
    }

    /// Release the feed. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_volume_sampling(false);
    }

    /// Whether the feed has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// The local device's own feeds, shared between the media controller, the
/// reconciler (which forks them into calls), and the membership publisher
/// (which advertises their purposes).
#[derive(Debug, Default)]
pub struct LocalFeeds {
    user_media: RwLock<Option<Arc<CallFeed>>>,
    screenshare: RwLock<Option<Arc<CallFeed>>>,
}

impl LocalFeeds {
    /// The local user-media feed, once capture has completed.
    #[must_use]
    pub fn user_media(&self) -> Option<Arc<CallFeed>> {
        self.user_media.read().clone()
    }

    /// The local screen-share feed while sharing.
    #[must_use]
    pub fn screenshare(&self) -> Option<Arc<CallFeed>> {
        self.screenshare.read().clone()
    }

    /// Install the local user-media feed.
    pub fn set_user_media(&self, feed: Option<Arc<CallFeed>>) {
        *self.user_media.write() = feed;
    }

    /// Install the local screen-share feed.
    pub fn set_screenshare(&self, feed: Option<Arc<CallFeed>>) {
        *self.screenshare.write() = feed;
    }

    /// Whether the local device is screen sharing.
    #[must_use]
    pub fn is_screensharing(&self) -> bool {
        self.screenshare.read().is_some()
    }

    /// Per-call copies of every local feed, for placement and answering.
    #[must_use]
    pub fn fork_all(&self) -> Vec<Arc<CallFeed>> {
        let mut feeds = Vec::new();
        if let Some(feed) = self.user_media() {
            feeds.push(feed.fork());
        }
        if let Some(feed) = self.screenshare() {
            feeds.push(feed.fork());
        }
        feeds
    }

    /// The feed purposes to advertise in the member-state document.
    #[must_use]
    pub fn advertisements(&self) -> Vec<FeedAdvertisement> {
        let mut ads = Vec::new();
        if self.user_media().is_some() {
            ads.push(FeedAdvertisement { purpose: FeedPurpose::UserMedia });
        }
        if self.screenshare().is_some() {
            ads.push(FeedAdvertisement { purpose: FeedPurpose::Screenshare });
        }
        ads
    }
}

/// Ordered user-media and screen-share feed sequences plus the active
/// speaker, keyed by `(user, device)`.
pub struct FeedRegistry {
    local_user: UserId,
    local_device: DeviceId,
    user_media: RwLock<Vec<Arc<CallFeed>>>,
    screenshare: RwLock<Vec<Arc<CallFeed>>>,
    active_speaker: RwLock<Option<Arc<CallFeed>>>,
    events: broadcast::Sender<GroupCallEvent>,
}

impl FeedRegistry {
    /// Create a registry emitting on the given event channel.
    #[must_use]
    pub fn new(
        local_user: UserId,
        local_device: DeviceId,
        events: broadcast::Sender<GroupCallEvent>,
    ) -> Self {
        Self {
            local_user,
            local_device,
            user_media: RwLock::new(Vec::new()),
            screenshare: RwLock::new(Vec::new()),
            active_speaker: RwLock::new(None),
            events,
        }
    }

    fn emit_user_media_changed(&self) {
        let feeds = self.user_media.read().clone();
        let _ = self.events.send(GroupCallEvent::UserMediaFeedsChanged { feeds });
    }

    fn emit_screenshare_changed(&self) {
        let feeds = self.screenshare.read().clone();
        let _ = self.events.send(GroupCallEvent::ScreenshareFeedsChanged { feeds });
    }

    /// The current user-media sequence.
    #[must_use]
    pub fn user_media_feeds(&self) -> Vec<Arc<CallFeed>> {
        self.user_media.read().clone()
    }

    /// The current screen-share sequence.
    #[must_use]
    pub fn screenshare_feeds(&self) -> Vec<Arc<CallFeed>> {
        self.screenshare.read().clone()
    }

    /// The user-media feed for the given key.
    #[must_use]
    pub fn get_user_media_feed(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Arc<CallFeed>> {
        self.user_media
            .read()
            .iter()
            .find(|f| f.user_id() == user_id && f.device_id() == device_id)
            .cloned()
    }

    /// The screen-share feed for the given key.
    #[must_use]
    pub fn get_screenshare_feed(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Arc<CallFeed>> {
        self.screenshare
            .read()
            .iter()
            .find(|f| f.user_id() == user_id && f.device_id() == device_id)
            .cloned()
    }

    /// The feed currently holding the floor.
    #[must_use]
    pub fn active_speaker(&self) -> Option<Arc<CallFeed>> {
        self.active_speaker.read().clone()
    }

    /// Append a user-media feed and enable volume sampling on it.
    pub fn add_user_media_feed(&self, feed: Arc<CallFeed>) {
        feed.set_volume_sampling(true);
        self.user_media.write().push(feed);
        self.emit_user_media_changed();
    }

    /// Swap the feed registered under `old`'s key for `new`.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::NotFound`] if no feed matches `old`'s key.
    pub fn replace_user_media_feed(
        &self,
        old: &Arc<CallFeed>,
        new: Arc<CallFeed>,
    ) -> Result<(), FeedError> {
        {
            let mut feeds = self.user_media.write();
            let index = feeds
                .iter()
                .position(|f| f.user_id() == old.user_id() && f.device_id() == old.device_id())
                .ok_or_else(|| FeedError::NotFound {
                    user_id: old.user_id().clone(),
                    device_id: old.device_id().clone(),
                })?;
            new.set_volume_sampling(true);
            let previous = std::mem::replace(&mut feeds[index], new);
            previous.dispose();
        }
        self.emit_user_media_changed();
        Ok(())
    }

    /// Remove and dispose the user-media feed registered under `feed`'s key.
    ///
    /// If the removed feed held the floor, the first remaining user-media
    /// feed is promoted (or the floor cleared) and `ActiveSpeakerChanged`
    /// is emitted.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::NotFound`] if no feed matches the key.
    pub fn remove_user_media_feed(&self, feed: &Arc<CallFeed>) -> Result<(), FeedError> {
        let removed = {
            let mut feeds = self.user_media.write();
            let index = feeds
                .iter()
                .position(|f| f.user_id() == feed.user_id() && f.device_id() == feed.device_id())
                .ok_or_else(|| FeedError::NotFound {
                    user_id: feed.user_id().clone(),
                    device_id: feed.device_id().clone(),
                })?;
            feeds.remove(index)
        };
        removed.dispose();
        self.emit_user_media_changed();

        let was_active = self
            .active_speaker
            .read()
            .as_ref()
            .is_some_and(|active| active.id() == removed.id());
        if was_active {
            let promoted = self.user_media.read().first().cloned();
            *self.active_speaker.write() = promoted.clone();
            let _ = self
                .events
                .send(GroupCallEvent::ActiveSpeakerChanged { feed: promoted });
        }
        Ok(())
    }

    /// Append a screen-share feed.
    pub fn add_screenshare_feed(&self, feed: Arc<CallFeed>) {
        self.screenshare.write().push(feed);
        self.emit_screenshare_changed();
    }

    /// Swap the screen-share feed registered under `old`'s key for `new`.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::NotFound`] if no feed matches `old`'s key.
    pub fn replace_screenshare_feed(
        &self,
        old: &Arc<CallFeed>,
        new: Arc<CallFeed>,
    ) -> Result<(), FeedError> {
        {
            let mut feeds = self.screenshare.write();
            let index = feeds
                .iter()
                .position(|f| f.user_id() == old.user_id() && f.device_id() == old.device_id())
                .ok_or_else(|| FeedError::NotFound {
                    user_id: old.user_id().clone(),
                    device_id: old.device_id().clone(),
                })?;
            let previous = std::mem::replace(&mut feeds[index], new);
            previous.dispose();
        }
        self.emit_screenshare_changed();
        Ok(())
    }

    /// Remove and dispose the screen-share feed registered under `feed`'s key.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::NotFound`] if no feed matches the key.
    pub fn remove_screenshare_feed(&self, feed: &Arc<CallFeed>) -> Result<(), FeedError> {
        let removed = {
            let mut feeds = self.screenshare.write();
            let index = feeds
                .iter()
                .position(|f| f.user_id() == feed.user_id() && f.device_id() == feed.device_id())
                .ok_or_else(|| FeedError::NotFound {
                    user_id: feed.user_id().clone(),
                    device_id: feed.device_id().clone(),
                })?;
            feeds.remove(index)
        };
        removed.dispose();
        self.emit_screenshare_changed();
        Ok(())
    }

    /// One active-speaker selection pass.
    ///
    /// Considers every non-local user-media feed, or the local feed when it
    /// is the only one. The feed with the highest clamped mean takes the
    /// floor iff it differs from the current holder and its mean strictly
    /// exceeds the speaking threshold; otherwise the floor is unchanged.
    pub fn update_active_speaker(&self) {
        let feeds = self.user_media.read().clone();
        let candidates: Vec<&Arc<CallFeed>> = if feeds.len() == 1 {
            feeds.iter().collect()
        } else {
            feeds
                .iter()
                .filter(|f| {
                    !(f.user_id() == &self.local_user && f.device_id() == &self.local_device)
                })
                .collect()
        };

        let mut best: Option<(&Arc<CallFeed>, f32)> = None;
        for feed in candidates {
            let Some(mean) = feed.average_volume(SPEAKING_THRESHOLD) else {
                continue;
            };
            if best.map_or(true, |(_, top)| mean > top) {
                best = Some((feed, mean));
            }
        }

        let Some((feed, mean)) = best else { return };
        let is_current = self
            .active_speaker
            .read()
            .as_ref()
            .is_some_and(|active| active.id() == feed.id());
        if !is_current && mean > SPEAKING_THRESHOLD {
            *self.active_speaker.write() = Some(feed.clone());
            let _ = self.events.send(GroupCallEvent::ActiveSpeakerChanged {
                feed: Some(feed.clone()),
            });
        }
    }

    /// Dispose every feed and clear the registry.
    pub fn dispose_all(&self) {
        let had_user_media = {
            let mut feeds = self.user_media.write();
            for feed in feeds.iter() {
                feed.dispose();
            }
            let had = !feeds.is_empty();
            feeds.clear();
            had
        };
        let had_screenshare = {
            let mut feeds = self.screenshare.write();
            for feed in feeds.iter() {
                feed.dispose();
            }
            let had = !feeds.is_empty();
            feeds.clear();
            had
        };
        if had_user_media {
            self.emit_user_media_changed();
        }
        if had_screenshare {
            self.emit_screenshare_changed();
        }
        if self.active_speaker.write().take().is_some() {
            let _ = self
                .events
                .send(GroupCallEvent::ActiveSpeakerChanged { feed: None });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::MediaStream;

    fn feed(user: &str, device: &str) -> Arc<CallFeed> {
        CallFeed::new(
            UserId::new(user),
            DeviceId::new(device),
            FeedPurpose::UserMedia,
            MediaStream::capture(true, false),
            false,
        )
    }

    fn registry() -> (FeedRegistry, broadcast::Receiver<GroupCallEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (
            FeedRegistry::new(UserId::new("@a:h"), DeviceId::new("DA"), tx),
            rx,
        )
    }

    #[test]
    fn remove_unknown_feed_fails() {
        let (registry, _rx) = registry();
        let result = registry.remove_user_media_feed(&feed("@b:h", "DB"));
        assert!(matches!(result, Err(FeedError::NotFound { .. })));
    }

    #[test]
    fn removing_active_speaker_promotes_first_remaining() {
        let (registry, mut rx) = registry();
        let first = feed("@b:h", "DB");
        let second = feed("@c:h", "DC");
        registry.add_user_media_feed(first.clone());
        registry.add_user_media_feed(second.clone());

        first.append_volume_sample(-10.0);
        registry.update_active_speaker();
        assert_eq!(registry.active_speaker().unwrap().id(), first.id());

        registry.remove_user_media_feed(&first).unwrap();
        assert_eq!(registry.active_speaker().unwrap().id(), second.id());

        let mut saw_promotion = false;
        while let Ok(event) = rx.try_recv() {
            if let GroupCallEvent::ActiveSpeakerChanged { feed: Some(f) } = event {
                saw_promotion = f.id() == second.id();
            }
        }
        assert!(saw_promotion);
    }

    #[test]
    fn active_speaker_skips_feeds_without_samples() {
        let (registry, _rx) = registry();
        let silent = feed("@b:h", "DB");
        let talking = feed("@c:h", "DC");
        registry.add_user_media_feed(silent);
        registry.add_user_media_feed(talking.clone());

        talking.append_volume_sample(-20.0);
        registry.update_active_speaker();
        assert_eq!(registry.active_speaker().unwrap().id(), talking.id());
    }

    #[test]
    fn quiet_feeds_do_not_take_the_floor() {
        let (registry, _rx) = registry();
        let quiet = feed("@b:h", "DB");
        registry.add_user_media_feed(quiet.clone());
        let other = feed("@c:h", "DC");
        registry.add_user_media_feed(other);

        // Mean clamps to the threshold exactly; "strictly exceeds" fails.
        quiet.append_volume_sample(-90.0);
        registry.update_active_speaker();
        assert!(registry.active_speaker().is_none());
    }

    #[test]
    fn local_feed_only_counts_when_alone() {
        let (registry, _rx) = registry();
        let local = CallFeed::new(
            UserId::new("@a:h"),
            DeviceId::new("DA"),
            FeedPurpose::UserMedia,
            MediaStream::capture(true, false),
            true,
        );
        registry.add_user_media_feed(local.clone());
        local.append_volume_sample(-5.0);

        registry.update_active_speaker();
        assert_eq!(registry.active_speaker().unwrap().id(), local.id());
    }

    #[test]
    fn replace_swaps_in_place_and_disposes_old() {
        let (registry, _rx) = registry();
        let old = feed("@b:h", "DB");
        registry.add_user_media_feed(old.clone());

        let new = feed("@b:h", "DB");
        registry.replace_user_media_feed(&old, new.clone()).unwrap();

        assert!(old.is_disposed());
        assert_eq!(
            registry
                .get_user_media_feed(&UserId::new("@b:h"), &DeviceId::new("DB"))
                .unwrap()
                .id(),
            new.id()
        );
    }

    #[test]
    fn fork_copies_mute_bits() {
        let local = feed("@a:h", "DA");
        local.set_audio_muted(true);
        let forked = local.fork();
        assert!(forked.is_audio_muted());
        assert!(!forked.is_video_muted());
        assert_ne!(forked.id(), local.id());
    }

    #[test]
    fn volume_buffer_is_bounded() {
        let f = feed("@b:h", "DB");
        f.set_volume_sampling(true);
        for i in 0..32 {
            f.append_volume_sample(i as f32);
        }
        // Only the last SPEAKING_SAMPLE_COUNT samples (24..=31) remain.
        let mean = f.average_volume(-100.0).unwrap();
        assert!((mean - 27.5).abs() < f32::EPSILON);
    }
}
