//! The group call itself: lifecycle, wiring, and timers.
//!
//! A [`GroupCall`] owns one instance of every component and serializes all
//! entry points behind a single operation lock, so no two coordinator
//! mutations ever interleave. Per-call events, room updates, inbound calls,
//! and timer ticks all funnel through that lock.

use crate::feed::{CallFeed, FeedRegistry, LocalFeeds};
use crate::local_media::LocalMediaController;
use crate::media::{MediaDevices, ScreenshareOptions};
use crate::member_state::{GroupCallContent, GROUP_CALL_EVENT_TYPE};
use crate::membership::MembershipPublisher;
use crate::participants::{compute_participants, LocalParticipant, ParticipantTracker};
use crate::peer_call::{CallFactory, HangupReason, PeerCall, PeerCallEvent};
use crate::reconciler::{CallSignal, Reconciler};
use crate::room::{RoomClient, RoomView};
use crate::types::{
    now_ms, DeviceId, GroupCallError, GroupCallEvent, GroupCallId, GroupCallIntent,
    GroupCallOptions, GroupCallState, GroupCallType, ParticipantMap, RoomId, UserId,
    ACTIVE_SPEAKER_INTERVAL, DEVICE_REFRESH_INTERVAL, PTT_MAX_TRANSMIT_TIME, RETRY_CALL_INTERVAL,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

/// Holds at most one background task; setting or cancelling aborts the
/// previous occupant, and double-cancel is a no-op.
#[derive(Debug, Default)]
struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl TaskSlot {
    fn set(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.0.lock().replace(handle) {
            old.abort();
        }
    }

    fn cancel(&self) {
        if let Some(old) = self.0.lock().take() {
            old.abort();
        }
    }
}

/// The timers owned by the coordinator; every one of them is cancelled on
/// any transition out of `Entered`.
#[derive(Debug, Default)]
struct Timers {
    active_speaker: TaskSlot,
    retry: TaskSlot,
    refresh: TaskSlot,
    expiry: TaskSlot,
    ptt: TaskSlot,
    screenshare_watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Timers {
    fn push_watcher(&self, handle: JoinHandle<()>) {
        self.screenshare_watchers.lock().push(handle);
    }

    fn cancel_watchers(&self) {
        for handle in self.screenshare_watchers.lock().drain(..) {
            handle.abort();
        }
    }

    fn cancel_all(&self) {
        self.active_speaker.cancel();
        self.retry.cancel();
        self.refresh.cancel();
        self.expiry.cancel();
        self.ptt.cancel();
        self.cancel_watchers();
    }
}

#[derive(Debug, Default)]
struct Listeners {
    dispatcher: TaskSlot,
    room: TaskSlot,
    incoming: TaskSlot,
}

impl Listeners {
    fn abort_all(&self) {
        self.dispatcher.cancel();
        self.room.cancel();
        self.incoming.cancel();
    }
}

/// A group call in one room: reconciles the room's membership view into a
/// full mesh of per-device calls and drives local capture.
pub struct GroupCall {
    options: GroupCallOptions,
    creation_ts: i64,
    state: parking_lot::RwLock<GroupCallState>,
    entered_via_another_session: AtomicBool,
    client: Arc<dyn RoomClient>,
    room: Arc<dyn RoomView>,
    registry: Arc<FeedRegistry>,
    local_feeds: Arc<LocalFeeds>,
    tracker: ParticipantTracker,
    reconciler: Arc<Reconciler>,
    publisher: MembershipPublisher,
    media: LocalMediaController,
    events: broadcast::Sender<GroupCallEvent>,
    op_lock: tokio::sync::Mutex<()>,
    timers: Timers,
    listeners: Listeners,
}

impl GroupCall {
    /// Create a group call and hook it to the room's state updates.
    ///
    /// The call starts in `LocalCallFeedUninitialized` with the participant
    /// view already computed from current room state.
    pub async fn new(
        client: Arc<dyn RoomClient>,
        room: Arc<dyn RoomView>,
        media_devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn CallFactory>,
        options: GroupCallOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let local_user = client.user_id();
        let local_device = client.device_id();
        let registry = Arc::new(FeedRegistry::new(
            local_user.clone(),
            local_device.clone(),
            events.clone(),
        ));
        let local_feeds = Arc::new(LocalFeeds::default());
        let reconciler = Arc::new(Reconciler::new(
            room.room_id(),
            options.group_call_id.clone(),
            local_user.clone(),
            local_device.clone(),
            factory,
            registry.clone(),
            local_feeds.clone(),
            options.data_channels_enabled,
            options.data_channel_options.clone(),
            events.clone(),
            signal_tx,
        ));
        let publisher =
            MembershipPublisher::new(room.clone(), client.clone(), options.group_call_id.clone());
        let media = LocalMediaController::new(
            media_devices,
            registry.clone(),
            local_feeds.clone(),
            local_user,
            local_device,
            options.call_type,
            options.is_ptt,
            events.clone(),
        );

        let group_call = Arc::new(Self {
            options,
            creation_ts: now_ms(),
            state: parking_lot::RwLock::new(GroupCallState::LocalCallFeedUninitialized),
            entered_via_another_session: AtomicBool::new(false),
            client,
            room,
            registry,
            local_feeds,
            tracker: ParticipantTracker::new(events.clone()),
            reconciler,
            publisher,
            media,
            events,
            op_lock: tokio::sync::Mutex::new(()),
            timers: Timers::default(),
            listeners: Listeners::default(),
        });

        group_call.spawn_dispatcher(signal_rx);
        group_call.spawn_room_listener();
        group_call.spawn_incoming_listener();

        {
            let _guard = group_call.op_lock.lock().await;
            let next_expiry = group_call.update_participants_locked().await;
            group_call.reschedule_expiry(next_expiry);
        }
        group_call
    }

    // ---- accessors -------------------------------------------------------

    /// Identifier of this call within its room.
    #[must_use]
    pub fn group_call_id(&self) -> &GroupCallId {
        &self.options.group_call_id
    }

    /// The room the call lives in.
    #[must_use]
    pub fn room_id(&self) -> RoomId {
        self.room.room_id()
    }

    /// Media profile of the call.
    #[must_use]
    pub fn call_type(&self) -> GroupCallType {
        self.options.call_type
    }

    /// How the call is surfaced to members.
    #[must_use]
    pub fn intent(&self) -> GroupCallIntent {
        self.options.intent
    }

    /// Whether the call runs in push-to-talk mode.
    #[must_use]
    pub fn is_ptt(&self) -> bool {
        self.options.is_ptt
    }

    /// When this instance was created, as a millisecond unix timestamp.
    #[must_use]
    pub fn creation_ts(&self) -> i64 {
        self.creation_ts
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> GroupCallState {
        *self.state.read()
    }

    /// Whether another session of this user's devices has entered the call.
    #[must_use]
    pub fn entered_via_another_session(&self) -> bool {
        self.entered_via_another_session.load(Ordering::SeqCst)
    }

    /// Update the entered-elsewhere flag and recompute the view.
    pub async fn set_entered_via_another_session(self: &Arc<Self>, entered: bool) {
        let _guard = self.op_lock.lock().await;
        self.entered_via_another_session.store(entered, Ordering::SeqCst);
        let next_expiry = self.update_participants_locked().await;
        self.reschedule_expiry(next_expiry);
    }

    /// The committed participant view.
    #[must_use]
    pub fn participants(&self) -> ParticipantMap {
        self.tracker.participants()
    }

    /// Snapshot of every call in the graph.
    #[must_use]
    pub fn calls(&self) -> Vec<Arc<dyn PeerCall>> {
        self.reconciler.calls()
    }

    /// Snapshot of the call graph keyed by user and device.
    #[must_use]
    pub fn calls_by_user(&self) -> BTreeMap<UserId, BTreeMap<DeviceId, Arc<dyn PeerCall>>> {
        self.reconciler.calls_by_user()
    }

    /// The current user-media feed sequence.
    #[must_use]
    pub fn user_media_feeds(&self) -> Vec<Arc<CallFeed>> {
        self.registry.user_media_feeds()
    }

    /// The current screen-share feed sequence.
    #[must_use]
    pub fn screenshare_feeds(&self) -> Vec<Arc<CallFeed>> {
        self.registry.screenshare_feeds()
    }

    /// The user-media feed of a participant, if present.
    #[must_use]
    pub fn get_user_media_feed(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Option<Arc<CallFeed>> {
        self.registry.get_user_media_feed(user_id, device_id)
    }

    /// The screen-share feed of a participant, if present.
    #[must_use]
    pub fn get_screenshare_feed(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Option<Arc<CallFeed>> {
        self.registry.get_screenshare_feed(user_id, device_id)
    }

    /// The feed currently holding the floor.
    #[must_use]
    pub fn active_speaker(&self) -> Option<Arc<CallFeed>> {
        self.registry.active_speaker()
    }

    /// The local user-media feed, once capture has completed.
    #[must_use]
    pub fn local_usermedia_feed(&self) -> Option<Arc<CallFeed>> {
        self.local_feeds.user_media()
    }

    /// The local screen-share feed while sharing.
    #[must_use]
    pub fn local_screenshare_feed(&self) -> Option<Arc<CallFeed>> {
        self.local_feeds.screenshare()
    }

    /// Whether the local microphone is muted.
    #[must_use]
    pub fn is_microphone_muted(&self) -> bool {
        self.media.is_microphone_muted()
    }

    /// Whether local video is muted.
    #[must_use]
    pub fn is_local_video_muted(&self) -> bool {
        self.media.is_video_muted()
    }

    /// Whether the local device is screen sharing.
    #[must_use]
    pub fn is_screensharing(&self) -> bool {
        self.media.is_screensharing()
    }

    /// Subscribe to the call's events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GroupCallEvent> {
        self.events.subscribe()
    }

    /// The call's events as a [`tokio_stream`] stream.
    #[must_use]
    pub fn event_stream(&self) -> BroadcastStream<GroupCallEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    // ---- lifecycle -------------------------------------------------------

    fn set_state(&self, new_state: GroupCallState) {
        let old_state = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state)
        };
        if old_state != new_state {
            tracing::info!(?old_state, ?new_state, "group call state changed");
            let _ = self
                .events
                .send(GroupCallEvent::StateChanged { new_state, old_state });
        }
    }

    /// Acquire the local capture and build the local user-media feed.
    ///
    /// The operation lock is released while capture is in flight so that a
    /// concurrent `leave` can proceed; if it does, the captured stream is
    /// stopped and [`GroupCallError::Disposed`] is returned without the feed
    /// ever being registered.
    ///
    /// # Errors
    ///
    /// [`GroupCallError::InvalidState`] outside `LocalCallFeedUninitialized`,
    /// [`GroupCallError::NoUserMedia`] when capture fails, or
    /// [`GroupCallError::Disposed`] when the call was torn down mid-capture.
    pub async fn init_local_call_feed(&self) -> Result<Arc<CallFeed>, GroupCallError> {
        {
            let _guard = self.op_lock.lock().await;
            let state = self.state();
            if state != GroupCallState::LocalCallFeedUninitialized {
                return Err(GroupCallError::InvalidState { actual: state });
            }
            self.set_state(GroupCallState::InitializingLocalCallFeed);
        }

        let captured = self.media.capture_user_media().await;

        let _guard = self.op_lock.lock().await;
        if self.state() != GroupCallState::InitializingLocalCallFeed {
            if let Ok(stream) = &captured {
                self.media.discard_user_media(stream);
            }
            return Err(GroupCallError::Disposed);
        }
        match captured {
            Ok(stream) => {
                let feed = self.media.adopt_user_media(stream);
                self.set_state(GroupCallState::LocalCallFeedInitialized);
                Ok(feed)
            }
            Err(error) => {
                self.set_state(GroupCallState::LocalCallFeedUninitialized);
                Err(error)
            }
        }
    }

    /// Enter the call: publish our advertisement, reconcile the mesh, and
    /// start the periodic work.
    ///
    /// Initializes the local feed first when necessary.
    ///
    /// # Errors
    ///
    /// [`GroupCallError::InvalidState`] outside
    /// `{LocalCallFeedUninitialized, LocalCallFeedInitialized}`, any error of
    /// [`GroupCall::init_local_call_feed`], or [`GroupCallError::Client`]
    /// when the membership write fails.
    pub async fn enter(self: &Arc<Self>) -> Result<(), GroupCallError> {
        {
            let _guard = self.op_lock.lock().await;
            let state = self.state();
            match state {
                GroupCallState::LocalCallFeedUninitialized
                | GroupCallState::LocalCallFeedInitialized => {}
                _ => return Err(GroupCallError::InvalidState { actual: state }),
            }
        }

        if self.state() == GroupCallState::LocalCallFeedUninitialized {
            self.init_local_call_feed().await?;
        }

        let _guard = self.op_lock.lock().await;
        let state = self.state();
        if state != GroupCallState::LocalCallFeedInitialized {
            return Err(GroupCallError::InvalidState { actual: state });
        }
        self.set_state(GroupCallState::Entered);
        tracing::info!(group_call_id = %self.options.group_call_id, "entered group call");

        self.publisher
            .publish_local_device(self.local_feeds.advertisements())
            .await?;

        let next_expiry = self.update_participants_locked().await;
        self.reschedule_expiry(next_expiry);
        self.reconciler
            .place_outgoing_calls(&self.tracker.participants())
            .await;

        for call in self.client.active_calls() {
            self.reconciler.handle_incoming_call(call).await;
        }

        self.start_entered_timers();
        Ok(())
    }

    /// Leave the call: tear down every call, stop local capture, cancel all
    /// timers, and remove our advertisement. A second `leave` is a no-op.
    pub async fn leave(self: &Arc<Self>) {
        let _guard = self.op_lock.lock().await;
        let state = self.state();
        if state == GroupCallState::LocalCallFeedUninitialized || state == GroupCallState::Ended {
            return;
        }
        let was_entered = state == GroupCallState::Entered;
        self.dispose_locked(was_entered).await;
        self.set_state(GroupCallState::LocalCallFeedUninitialized);
        let next_expiry = self.update_participants_locked().await;
        self.reschedule_expiry(next_expiry);
    }

    /// End the call permanently.
    ///
    /// When `emit_state_event` is set, rewrites the group-call state event
    /// with the termination marker, preserving its other content.
    ///
    /// # Errors
    ///
    /// [`GroupCallError::Client`] when the termination write fails. Local
    /// teardown has already completed by then.
    pub async fn terminate(self: &Arc<Self>, emit_state_event: bool) -> Result<(), GroupCallError> {
        let _guard = self.op_lock.lock().await;
        if self.state() == GroupCallState::Ended {
            return Ok(());
        }
        let was_entered = self.state() == GroupCallState::Entered;
        self.dispose_locked(was_entered).await;
        self.listeners.abort_all();
        self.set_state(GroupCallState::Ended);
        tracing::info!(group_call_id = %self.options.group_call_id, "group call terminated");

        if emit_state_event {
            let mut content = self
                .room
                .group_call_content(&self.options.group_call_id)
                .unwrap_or_else(|| self.default_content());
            content.terminated = Some(crate::types::GroupCallTerminationReason::CallEnded);
            let value = serde_json::to_value(&content).map_err(|e| {
                GroupCallError::Internal(format!("group call content serialization: {e}"))
            })?;
            self.client
                .send_state_event(
                    &self.room.room_id(),
                    GROUP_CALL_EVENT_TYPE,
                    value,
                    self.options.group_call_id.as_str(),
                    false,
                )
                .await
                .map_err(|cause| GroupCallError::Client { cause })?;
        }
        Ok(())
    }

    fn default_content(&self) -> GroupCallContent {
        GroupCallContent {
            intent: self.options.intent,
            call_type: self.options.call_type,
            ptt: self.options.is_ptt,
            data_channels_enabled: self.options.data_channels_enabled,
            data_channel_options: self.options.data_channel_options.clone(),
            terminated: None,
            extra: BTreeMap::new(),
        }
    }

    async fn dispose_locked(&self, was_entered: bool) {
        self.timers.cancel_all();
        self.reconciler.dispose_all(HangupReason::UserHangup).await;
        self.media.stop_all();
        if was_entered {
            if let Err(error) = self.publisher.remove_local_device().await {
                tracing::warn!(%error, "failed to remove member state entry");
            }
        }
    }

    // ---- local media -----------------------------------------------------

    /// Mute or unmute the local microphone.
    ///
    /// Returns `false` when an unmute was refused because no audio input
    /// device is available. In push-to-talk mode an unmute arms the transmit
    /// timer; a mute cancels it.
    pub async fn set_microphone_muted(self: &Arc<Self>, muted: bool) -> bool {
        let _guard = self.op_lock.lock().await;
        let calls = self.reconciler.calls();
        let applied = self.media.set_microphone_muted(muted, &calls).await;
        if applied && self.options.is_ptt {
            if muted {
                self.timers.ptt.cancel();
            } else {
                self.arm_ptt_timer();
            }
        }
        applied
    }

    /// Mute or unmute local video.
    ///
    /// Returns `false` when an unmute was refused because no video input
    /// device is available.
    pub async fn set_local_video_muted(self: &Arc<Self>, muted: bool) -> bool {
        let _guard = self.op_lock.lock().await;
        let calls = self.reconciler.calls();
        self.media.set_video_muted(muted, &calls).await
    }

    /// Start or stop sharing the screen.
    ///
    /// Returns the resulting sharing state. With `throw_on_fail`, a capture
    /// failure is returned as [`GroupCallError::NoUserMedia`]; otherwise it
    /// is emitted as an [`GroupCallEvent::Error`] and `Ok(false)` returned.
    ///
    /// # Errors
    ///
    /// Only with `throw_on_fail` set, and only for capture failures.
    pub async fn set_screensharing_enabled(
        self: &Arc<Self>,
        enabled: bool,
        opts: ScreenshareOptions,
        throw_on_fail: bool,
    ) -> Result<bool, GroupCallError> {
        let _guard = self.op_lock.lock().await;
        if enabled == self.media.is_screensharing() {
            return Ok(enabled);
        }

        let calls = self.reconciler.calls();
        if enabled {
            match self.media.enable_screenshare(&opts, &calls).await {
                Ok(feed) => {
                    for track in feed.stream().tracks() {
                        self.spawn_screenshare_watcher(track);
                    }
                    self.refresh_advertisement_locked().await;
                    Ok(true)
                }
                Err(error) => {
                    if throw_on_fail {
                        Err(error)
                    } else {
                        let _ = self
                            .events
                            .send(GroupCallEvent::Error { error: Arc::new(error) });
                        Ok(false)
                    }
                }
            }
        } else {
            self.media.disable_screenshare(&calls).await;
            self.refresh_advertisement_locked().await;
            // Last, and with no awaits after it: a watcher driving this very
            // call aborts itself here and must already be past its work.
            self.timers.cancel_watchers();
            Ok(false)
        }
    }

    async fn refresh_advertisement_locked(&self) {
        if self.state() != GroupCallState::Entered {
            return;
        }
        if let Err(error) = self
            .publisher
            .publish_local_device(self.local_feeds.advertisements())
            .await
        {
            tracing::warn!(%error, "failed to refresh member state after feed change");
        }
    }

    // ---- membership ------------------------------------------------------

    /// Write the local device's entry into the member-state document:
    /// a publish while entered, a removal otherwise.
    ///
    /// # Errors
    ///
    /// [`GroupCallError::Client`] when the state write fails.
    pub async fn update_member_state(&self) -> Result<(), GroupCallError> {
        let _guard = self.op_lock.lock().await;
        if self.state() == GroupCallState::Entered {
            self.publisher
                .publish_local_device(self.local_feeds.advertisements())
                .await
        } else {
            self.publisher.remove_local_device().await
        }
    }

    /// Remove advertisements for devices the identity service does not know,
    /// plus our own when we are not entered anywhere.
    ///
    /// # Errors
    ///
    /// [`GroupCallError::Client`] when the device query or state write fails.
    pub async fn clean_member_state(&self) -> Result<(), GroupCallError> {
        let _guard = self.op_lock.lock().await;
        let entered =
            self.state() == GroupCallState::Entered || self.entered_via_another_session();
        self.publisher.clean(entered).await
    }

    // ---- inbound ---------------------------------------------------------

    /// Feed an inbound call from the transport into the reconciler.
    ///
    /// Ignored unless the call is entered.
    pub async fn handle_incoming_call(&self, call: Arc<dyn PeerCall>) {
        let _guard = self.op_lock.lock().await;
        if self.state() != GroupCallState::Entered {
            return;
        }
        self.reconciler.handle_incoming_call(call).await;
    }

    /// Recompute the participant view from current room state, emitting
    /// `ParticipantsChanged` on structural change and reconciling the call
    /// graph while entered.
    pub async fn update_participants(self: &Arc<Self>) {
        let _guard = self.op_lock.lock().await;
        let next_expiry = self.update_participants_locked().await;
        self.reschedule_expiry(next_expiry);
    }

    // ---- internals -------------------------------------------------------

    /// Recompute and commit the view, returning the earliest `expires_ts`
    /// among included devices. Timer rescheduling is the caller's job.
    async fn update_participants_locked(self: &Arc<Self>) -> Option<i64> {
        let state = self.state();
        let entered = state == GroupCallState::Entered || self.entered_via_another_session();
        let user_id = self.client.user_id();
        let device_id = self.client.device_id();
        let session_id = self.client.session_id();
        let local = LocalParticipant {
            user_id: &user_id,
            device_id: &device_id,
            session_id: &session_id,
            entered,
            screensharing: self.media.is_screensharing(),
        };
        let (view, next_expiry) = compute_participants(
            &self.options.group_call_id,
            self.room.as_ref(),
            &local,
            now_ms(),
        );

        let changed = self.tracker.commit(view.clone());
        if changed && state == GroupCallState::Entered {
            self.reconciler.place_outgoing_calls(&view).await;
        }
        next_expiry
    }

    /// Cancel the expiration timer and re-arm it to the given instant.
    /// The timer only runs while entered; the view refreshes on the next
    /// room update otherwise.
    fn reschedule_expiry(self: &Arc<Self>, next_expiry: Option<i64>) {
        self.timers.expiry.cancel();
        if self.state() != GroupCallState::Entered {
            return;
        }
        if let Some(expiry) = next_expiry {
            self.arm_expiry_timer(expiry);
        }
    }

    async fn handle_call_signal(self: &Arc<Self>, signal: CallSignal) {
        let _guard = self.op_lock.lock().await;
        let CallSignal { user_id, device_id, call_id, event } = signal;
        match event {
            PeerCallEvent::FeedsChanged => {
                self.reconciler.on_feeds_changed(&user_id, &device_id, &call_id);
            }
            PeerCallEvent::StateChanged { new_state, .. } => {
                self.reconciler
                    .on_state_changed(
                        &user_id,
                        &device_id,
                        &call_id,
                        new_state,
                        self.media.is_microphone_muted(),
                        self.media.is_video_muted(),
                    )
                    .await;
            }
            PeerCallEvent::Hangup { reason } => {
                self.reconciler
                    .on_hangup(&user_id, &device_id, &call_id, reason)
                    .await;
            }
            PeerCallEvent::Replaced { new_call } => {
                self.reconciler
                    .on_replaced(&user_id, &device_id, &call_id, new_call)
                    .await;
            }
        }
    }

    fn spawn_dispatcher(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<CallSignal>) {
        let weak = Arc::downgrade(self);
        self.listeners.dispatcher.set(tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let Some(group_call) = weak.upgrade() else { break };
                group_call.handle_call_signal(signal).await;
            }
        }));
    }

    fn spawn_room_listener(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut updates = self.room.updates();
        self.listeners.room.set(tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(()) => {
                        let Some(group_call) = weak.upgrade() else { break };
                        let _guard = group_call.op_lock.lock().await;
                        let next_expiry = group_call.update_participants_locked().await;
                        group_call.reschedule_expiry(next_expiry);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    fn spawn_incoming_listener(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut incoming = self.client.incoming_calls();
        self.listeners.incoming.set(tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(call) => {
                        let Some(group_call) = weak.upgrade() else { break };
                        group_call.handle_incoming_call(call).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "incoming call stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    fn start_entered_timers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.timers.active_speaker.set(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ACTIVE_SPEAKER_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(group_call) = weak.upgrade() else { break };
                let _guard = group_call.op_lock.lock().await;
                group_call.registry.update_active_speaker();
            }
        }));

        let weak = Arc::downgrade(self);
        self.timers.retry.set(tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETRY_CALL_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(group_call) = weak.upgrade() else { break };
                let _guard = group_call.op_lock.lock().await;
                if group_call.state() != GroupCallState::Entered {
                    continue;
                }
                let participants = group_call.tracker.participants();
                group_call.reconciler.retry_tick(&participants).await;
            }
        }));

        let weak = Arc::downgrade(self);
        self.timers.refresh.set(tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEVICE_REFRESH_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(group_call) = weak.upgrade() else { break };
                let _guard = group_call.op_lock.lock().await;
                if group_call.state() != GroupCallState::Entered {
                    continue;
                }
                tracing::debug!("refreshing member state advertisement");
                if let Err(error) = group_call
                    .publisher
                    .publish_local_device(group_call.local_feeds.advertisements())
                    .await
                {
                    tracing::warn!(%error, "scheduled membership refresh failed");
                }
            }
        }));
    }

    /// Run the participant-expiration timer in its own task: sleep until the
    /// given instant, refresh the view, and keep going as long as the
    /// refreshed view reports another expiry. The task itself holds the slot,
    /// so cancelling the slot cancels the refresh work too, and the loop
    /// never replaces its own handle.
    fn arm_expiry_timer(self: &Arc<Self>, expiry: i64) {
        let weak = Arc::downgrade(self);
        self.timers.expiry.set(tokio::spawn(async move {
            let mut next_expiry = expiry;
            loop {
                let delay = Duration::from_millis((next_expiry - now_ms()).max(0) as u64);
                tokio::time::sleep(delay).await;
                let Some(group_call) = weak.upgrade() else { break };
                let _guard = group_call.op_lock.lock().await;
                if group_call.state() != GroupCallState::Entered {
                    break;
                }
                match group_call.update_participants_locked().await {
                    Some(expiry) => next_expiry = expiry,
                    None => break,
                }
            }
        }));
    }

    fn arm_ptt_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.timers.ptt.set(tokio::spawn(async move {
            tokio::time::sleep(PTT_MAX_TRANSMIT_TIME).await;
            let Some(group_call) = weak.upgrade() else { return };
            tracing::info!("push-to-talk transmit window elapsed, remuting");
            // Remuting clears the ptt slot, aborting this task; that lands
            // after the last await here, so the remute itself completes.
            let _ = group_call.set_microphone_muted(true).await;
        }));
    }

    fn spawn_screenshare_watcher(self: &Arc<Self>, track: crate::media::MediaTrack) {
        let weak = Arc::downgrade(self);
        let mut ended = track.ended();
        self.timers.push_watcher(tokio::spawn(async move {
            loop {
                if ended.changed().await.is_err() {
                    break;
                }
                if *ended.borrow() {
                    if let Some(group_call) = weak.upgrade() {
                        tracing::info!("screen capture ended by source, disabling share");
                        let _ = group_call
                            .set_screensharing_enabled(false, ScreenshareOptions::default(), false)
                            .await;
                    }
                    break;
                }
            }
        }));
    }
}

impl Drop for GroupCall {
    fn drop(&mut self) {
        self.timers.cancel_all();
        self.listeners.abort_all();
    }
}
