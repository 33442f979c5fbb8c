//! Shared mock collaborators for the integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use meshcall_core::{
    now_ms, CallFactory, CallFeed, CallId, CallMemberContent, CallMemberEvent, DataChannelOptions,
    DeviceId, FeedPurpose, GroupCall, GroupCallContent, GroupCallEvent, GroupCallId,
    GroupCallIntent, GroupCallOptions, GroupCallType, HangupReason, MediaDevices, MediaError,
    MediaStream, Membership, OutgoingCallParams, PeerCall, PeerCallError, PeerCallEvent,
    PeerCallState, RoomClient, RoomId, RoomView, ScreenshareOptions, SessionId, UserId,
    CALL_MEMBER_EVENT_TYPE, GROUP_CALL_EVENT_TYPE,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Install a tracing subscriber for debugging test runs; no-op when one is
/// already set. Enable with `RUST_LOG=meshcall_core=debug`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// ---- media devices --------------------------------------------------------

#[derive(Debug, Default)]
pub struct MockDevices {
    pub no_audio_device: AtomicBool,
    pub no_video_device: AtomicBool,
    pub fail_user_media: AtomicBool,
    pub fail_screenshare: AtomicBool,
    pub capture_delay: Mutex<Option<Duration>>,
    pub stopped_streams: Mutex<Vec<String>>,
    pub stop_all_calls: AtomicUsize,
}

impl MockDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn get_user_media_stream(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<MediaStream, MediaError> {
        let delay = *self.capture_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_user_media.load(Ordering::SeqCst) {
            return Err(MediaError::CaptureFailed("mock capture failure".into()));
        }
        Ok(MediaStream::capture(audio, video))
    }

    async fn get_screenshare_stream(
        &self,
        _opts: &ScreenshareOptions,
    ) -> Result<MediaStream, MediaError> {
        if self.fail_screenshare.load(Ordering::SeqCst) {
            return Err(MediaError::CaptureFailed("mock screen capture failure".into()));
        }
        Ok(MediaStream::capture(false, true))
    }

    async fn has_audio_device(&self) -> bool {
        !self.no_audio_device.load(Ordering::SeqCst)
    }

    async fn has_video_device(&self) -> bool {
        !self.no_video_device.load(Ordering::SeqCst)
    }

    fn stop_user_media_stream(&self, stream: &MediaStream) {
        self.stopped_streams.lock().push(stream.id().to_string());
    }

    fn stop_screenshare_stream(&self, stream: &MediaStream) {
        self.stopped_streams.lock().push(stream.id().to_string());
    }

    fn stop_all_streams(&self) {
        self.stop_all_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ---- room -----------------------------------------------------------------

pub struct MockRoom {
    room_id: RoomId,
    pub members: Mutex<HashMap<UserId, CallMemberContent>>,
    pub memberships: Mutex<HashMap<UserId, Membership>>,
    pub group_calls: Mutex<HashMap<GroupCallId, GroupCallContent>>,
    updates: broadcast::Sender<()>,
}

impl MockRoom {
    pub fn new(room_id: &str) -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        Arc::new(Self {
            room_id: RoomId::new(room_id),
            members: Mutex::new(HashMap::new()),
            memberships: Mutex::new(HashMap::new()),
            group_calls: Mutex::new(HashMap::new()),
            updates,
        })
    }

    pub fn join(&self, user: &str) {
        self.memberships
            .lock()
            .insert(UserId::new(user), Membership::Join);
    }

    pub fn notify(&self) {
        let _ = self.updates.send(());
    }

    pub fn set_member_content(&self, user: UserId, content: CallMemberContent) {
        self.members.lock().insert(user, content);
        self.notify();
    }

    pub fn member_content(&self, user: &str) -> Option<CallMemberContent> {
        self.members.lock().get(&UserId::new(user)).cloned()
    }

    /// Advertise a single device for `user` in the given group call,
    /// replacing any prior advertisement of that user for the call.
    pub fn advertise(
        &self,
        group_call_id: &str,
        user: &str,
        device: &str,
        session: &str,
        expires_ts: i64,
        screensharing: bool,
    ) {
        let mut feeds = vec![json!({ "purpose": "m.usermedia" })];
        if screensharing {
            feeds.push(json!({ "purpose": "m.screenshare" }));
        }
        let content: CallMemberContent = serde_json::from_value(json!({
            "m.calls": [{
                "m.call_id": group_call_id,
                "m.devices": [{
                    "device_id": device,
                    "session_id": session,
                    "expires_ts": expires_ts,
                    "feeds": feeds,
                }],
            }],
        }))
        .unwrap();
        self.join(user);
        self.set_member_content(UserId::new(user), content);
    }
}

impl RoomView for MockRoom {
    fn room_id(&self) -> RoomId {
        self.room_id.clone()
    }

    fn call_member_events(&self) -> Vec<CallMemberEvent> {
        self.members
            .lock()
            .iter()
            .map(|(sender, content)| CallMemberEvent {
                sender: sender.clone(),
                content: content.clone(),
            })
            .collect()
    }

    fn membership(&self, user_id: &UserId) -> Option<Membership> {
        self.memberships.lock().get(user_id).copied()
    }

    fn group_call_content(&self, group_call_id: &GroupCallId) -> Option<GroupCallContent> {
        self.group_calls.lock().get(group_call_id).cloned()
    }

    fn updates(&self) -> broadcast::Receiver<()> {
        self.updates.subscribe()
    }
}

// ---- client ---------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SentStateEvent {
    pub event_type: String,
    pub content: serde_json::Value,
    pub state_key: String,
    pub keep_alive: bool,
}

pub struct MockClient {
    user_id: UserId,
    device_id: DeviceId,
    session_id: SessionId,
    room: Arc<MockRoom>,
    pub sent: Mutex<Vec<SentStateEvent>>,
    pub known_devices: Mutex<Vec<DeviceId>>,
    pub fail_sends: AtomicBool,
    pub active: Mutex<Vec<Arc<dyn PeerCall>>>,
    incoming: broadcast::Sender<Arc<dyn PeerCall>>,
}

impl MockClient {
    pub fn new(room: Arc<MockRoom>, user: &str, device: &str, session: &str) -> Arc<Self> {
        let (incoming, _) = broadcast::channel(16);
        Arc::new(Self {
            user_id: UserId::new(user),
            device_id: DeviceId::new(device),
            session_id: SessionId::new(session),
            room,
            sent: Mutex::new(Vec::new()),
            known_devices: Mutex::new(vec![DeviceId::new(device)]),
            fail_sends: AtomicBool::new(false),
            active: Mutex::new(Vec::new()),
            incoming,
        })
    }

    pub fn deliver_incoming(&self, call: Arc<dyn PeerCall>) {
        let _ = self.incoming.send(call);
    }

    pub fn sent_of_type(&self, event_type: &str) -> Vec<SentStateEvent> {
        self.sent
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RoomClient for MockClient {
    fn user_id(&self) -> UserId {
        self.user_id.clone()
    }

    fn device_id(&self) -> DeviceId {
        self.device_id.clone()
    }

    fn session_id(&self) -> SessionId {
        self.session_id.clone()
    }

    async fn send_state_event(
        &self,
        _room_id: &RoomId,
        event_type: &str,
        content: serde_json::Value,
        state_key: &str,
        keep_alive: bool,
    ) -> anyhow::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("mock state write failure");
        }
        self.sent.lock().push(SentStateEvent {
            event_type: event_type.to_string(),
            content: content.clone(),
            state_key: state_key.to_string(),
            keep_alive,
        });
        // Echo the write back into room state, as the server would.
        if event_type == CALL_MEMBER_EVENT_TYPE {
            let parsed: CallMemberContent = serde_json::from_value(content)?;
            self.room.set_member_content(UserId::new(state_key), parsed);
        } else if event_type == GROUP_CALL_EVENT_TYPE {
            let parsed: GroupCallContent = serde_json::from_value(content)?;
            self.room
                .group_calls
                .lock()
                .insert(GroupCallId::new(state_key), parsed);
        }
        Ok(())
    }

    async fn get_devices(&self) -> anyhow::Result<Vec<DeviceId>> {
        Ok(self.known_devices.lock().clone())
    }

    fn active_calls(&self) -> Vec<Arc<dyn PeerCall>> {
        self.active.lock().clone()
    }

    fn incoming_calls(&self) -> broadcast::Receiver<Arc<dyn PeerCall>> {
        self.incoming.subscribe()
    }
}

// ---- peer calls -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementFailure {
    UnknownDevice,
    Signalling,
}

#[derive(Debug)]
pub struct MockCall {
    call_id: CallId,
    room_id: RoomId,
    group_call_id: Option<GroupCallId>,
    state: Mutex<PeerCallState>,
    hangup_reason: Mutex<Option<HangupReason>>,
    opponent_user: Option<UserId>,
    opponent_device: Option<DeviceId>,
    opponent_session: Option<SessionId>,
    remote_usermedia: Mutex<Option<Arc<CallFeed>>>,
    remote_screenshare: Mutex<Option<Arc<CallFeed>>>,
    mic_muted: AtomicBool,
    video_muted: AtomicBool,
    pub fail_placement: Mutex<Option<PlacementFailure>>,
    pub placed: Mutex<Option<(usize, bool)>>,
    pub answered: AtomicBool,
    pub rejected: AtomicBool,
    pub hangups: Mutex<Vec<(HangupReason, bool)>>,
    pub data_channels: Mutex<Vec<String>>,
    pub metadata_updates: AtomicUsize,
    pub local_feeds: Mutex<Vec<Arc<CallFeed>>>,
    pub removed_feeds: Mutex<Vec<String>>,
    events: broadcast::Sender<PeerCallEvent>,
}

impl MockCall {
    pub fn outgoing(room_id: RoomId, params: &OutgoingCallParams) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            call_id: CallId::new(uuid()),
            room_id,
            group_call_id: Some(params.group_call_id.clone()),
            state: Mutex::new(PeerCallState::Fledgling),
            hangup_reason: Mutex::new(None),
            opponent_user: Some(params.invitee.clone()),
            opponent_device: Some(params.opponent_device_id.clone()),
            opponent_session: Some(params.opponent_session_id.clone()),
            remote_usermedia: Mutex::new(None),
            remote_screenshare: Mutex::new(None),
            mic_muted: AtomicBool::new(false),
            video_muted: AtomicBool::new(false),
            fail_placement: Mutex::new(None),
            placed: Mutex::new(None),
            answered: AtomicBool::new(false),
            rejected: AtomicBool::new(false),
            hangups: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            metadata_updates: AtomicUsize::new(0),
            local_feeds: Mutex::new(Vec::new()),
            removed_feeds: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn incoming(
        room_id: RoomId,
        group_call_id: &str,
        user: &str,
        device: &str,
        session: &str,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            call_id: CallId::new(uuid()),
            room_id,
            group_call_id: Some(GroupCallId::new(group_call_id)),
            state: Mutex::new(PeerCallState::Ringing),
            hangup_reason: Mutex::new(None),
            opponent_user: Some(UserId::new(user)),
            opponent_device: Some(DeviceId::new(device)),
            opponent_session: Some(SessionId::new(session)),
            remote_usermedia: Mutex::new(None),
            remote_screenshare: Mutex::new(None),
            mic_muted: AtomicBool::new(false),
            video_muted: AtomicBool::new(false),
            fail_placement: Mutex::new(None),
            placed: Mutex::new(None),
            answered: AtomicBool::new(false),
            rejected: AtomicBool::new(false),
            hangups: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            metadata_updates: AtomicUsize::new(0),
            local_feeds: Mutex::new(Vec::new()),
            removed_feeds: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn emit_state(&self, new_state: PeerCallState) {
        let old_state = std::mem::replace(&mut *self.state.lock(), new_state);
        let _ = self
            .events
            .send(PeerCallEvent::StateChanged { new_state, old_state });
    }

    pub fn emit_hangup(&self, reason: HangupReason) {
        *self.state.lock() = PeerCallState::Ended;
        *self.hangup_reason.lock() = Some(reason);
        let _ = self.events.send(PeerCallEvent::Hangup { reason: Some(reason) });
    }

    pub fn emit_replaced(&self, new_call: Arc<dyn PeerCall>) {
        let _ = self.events.send(PeerCallEvent::Replaced { new_call });
    }

    pub fn set_remote_usermedia(&self, feed: Option<Arc<CallFeed>>) {
        *self.remote_usermedia.lock() = feed;
        let _ = self.events.send(PeerCallEvent::FeedsChanged);
    }

    pub fn set_remote_screenshare(&self, feed: Option<Arc<CallFeed>>) {
        *self.remote_screenshare.lock() = feed;
        let _ = self.events.send(PeerCallEvent::FeedsChanged);
    }

    pub fn set_mic_muted_raw(&self, muted: bool) {
        self.mic_muted.store(muted, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerCall for MockCall {
    fn call_id(&self) -> CallId {
        self.call_id.clone()
    }

    fn room_id(&self) -> RoomId {
        self.room_id.clone()
    }

    fn group_call_id(&self) -> Option<GroupCallId> {
        self.group_call_id.clone()
    }

    fn state(&self) -> PeerCallState {
        *self.state.lock()
    }

    fn hangup_reason(&self) -> Option<HangupReason> {
        *self.hangup_reason.lock()
    }

    fn opponent_user_id(&self) -> Option<UserId> {
        self.opponent_user.clone()
    }

    fn opponent_device_id(&self) -> Option<DeviceId> {
        self.opponent_device.clone()
    }

    fn opponent_session_id(&self) -> Option<SessionId> {
        self.opponent_session.clone()
    }

    fn remote_usermedia_feed(&self) -> Option<Arc<CallFeed>> {
        self.remote_usermedia.lock().clone()
    }

    fn remote_screenshare_feed(&self) -> Option<Arc<CallFeed>> {
        self.remote_screenshare.lock().clone()
    }

    fn local_usermedia_feed(&self) -> Option<Arc<CallFeed>> {
        self.local_feeds
            .lock()
            .iter()
            .find(|f| f.purpose() == FeedPurpose::UserMedia)
            .cloned()
    }

    fn is_microphone_muted(&self) -> bool {
        self.mic_muted.load(Ordering::SeqCst)
    }

    fn is_local_video_muted(&self) -> bool {
        self.video_muted.load(Ordering::SeqCst)
    }

    async fn place_call_with_feeds(
        &self,
        feeds: Vec<Arc<CallFeed>>,
        remote_screensharing: bool,
    ) -> Result<(), PeerCallError> {
        if let Some(failure) = self.fail_placement.lock().clone() {
            return Err(match failure {
                PlacementFailure::UnknownDevice => {
                    PeerCallError::UnknownDevice("mock unknown device".into())
                }
                PlacementFailure::Signalling => {
                    PeerCallError::Signalling("mock placement failure".into())
                }
            });
        }
        *self.placed.lock() = Some((feeds.len(), remote_screensharing));
        *self.local_feeds.lock() = feeds;
        *self.state.lock() = PeerCallState::InviteSent;
        Ok(())
    }

    async fn answer_with_feeds(&self, feeds: Vec<Arc<CallFeed>>) -> Result<(), PeerCallError> {
        self.answered.store(true, Ordering::SeqCst);
        *self.local_feeds.lock() = feeds;
        *self.state.lock() = PeerCallState::Connecting;
        Ok(())
    }

    async fn reject(&self) -> Result<(), PeerCallError> {
        self.rejected.store(true, Ordering::SeqCst);
        *self.state.lock() = PeerCallState::Ended;
        Ok(())
    }

    async fn hangup(
        &self,
        reason: HangupReason,
        suppress_event: bool,
    ) -> Result<(), PeerCallError> {
        self.hangups.lock().push((reason, suppress_event));
        *self.hangup_reason.lock() = Some(reason);
        *self.state.lock() = PeerCallState::Ended;
        Ok(())
    }

    async fn set_microphone_muted(&self, muted: bool) -> Result<(), PeerCallError> {
        self.mic_muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    async fn set_local_video_muted(&self, muted: bool) -> Result<(), PeerCallError> {
        self.video_muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    async fn send_metadata_update(&self) -> Result<(), PeerCallError> {
        self.metadata_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn push_local_feed(&self, feed: Arc<CallFeed>) -> Result<(), PeerCallError> {
        self.local_feeds.lock().push(feed);
        Ok(())
    }

    async fn remove_local_feed(&self, feed: &Arc<CallFeed>) -> Result<(), PeerCallError> {
        self.removed_feeds.lock().push(feed.id().to_string());
        self.local_feeds
            .lock()
            .retain(|f| f.purpose() != feed.purpose());
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _opts: &DataChannelOptions,
    ) -> Result<(), PeerCallError> {
        self.data_channels.lock().push(label.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerCallEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct MockFactory {
    pub created: Mutex<Vec<Arc<MockCall>>>,
    pub return_none: AtomicBool,
    pub fail_placements: Mutex<Option<PlacementFailure>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last_created(&self) -> Arc<MockCall> {
        self.created.lock().last().unwrap().clone()
    }
}

impl CallFactory for MockFactory {
    fn create_call(
        &self,
        room_id: &RoomId,
        params: OutgoingCallParams,
    ) -> Option<Arc<dyn PeerCall>> {
        if self.return_none.load(Ordering::SeqCst) {
            return None;
        }
        let call = MockCall::outgoing(room_id.clone(), &params);
        *call.fail_placement.lock() = *self.fail_placements.lock();
        self.created.lock().push(call.clone());
        Some(call)
    }
}

// ---- harness --------------------------------------------------------------

pub const GROUP_CALL_ID: &str = "G";
pub const ROOM_ID: &str = "!room:example.org";

pub struct Harness {
    pub client: Arc<MockClient>,
    pub room: Arc<MockRoom>,
    pub devices: Arc<MockDevices>,
    pub factory: Arc<MockFactory>,
    pub call: Arc<GroupCall>,
}

pub fn voice_options() -> GroupCallOptions {
    GroupCallOptions {
        group_call_id: GroupCallId::new(GROUP_CALL_ID),
        call_type: GroupCallType::Voice,
        intent: GroupCallIntent::Room,
        is_ptt: false,
        data_channels_enabled: false,
        data_channel_options: None,
    }
}

pub async fn harness_with(user: &str, device: &str, options: GroupCallOptions) -> Harness {
    init_tracing();
    let room = MockRoom::new(ROOM_ID);
    room.join(user);
    let client = MockClient::new(room.clone(), user, device, "local-session");
    let devices = MockDevices::new();
    let factory = MockFactory::new();
    let call = GroupCall::new(
        client.clone(),
        room.clone(),
        devices.clone(),
        factory.clone(),
        options,
    )
    .await;
    Harness { client, room, devices, factory, call }
}

pub async fn voice_harness(user: &str, device: &str) -> Harness {
    harness_with(user, device, voice_options()).await
}

/// Let spawned listener tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

/// Drain every buffered event, returning how many matched the predicate.
pub fn drain_matching(
    rx: &mut broadcast::Receiver<GroupCallEvent>,
    mut pred: impl FnMut(&GroupCallEvent) -> bool,
) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if pred(&event) {
            count += 1;
        }
    }
    count
}

pub fn expires_in(ms: i64) -> i64 {
    now_ms() + ms
}

fn uuid() -> String {
    use std::sync::atomic::AtomicU64;
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!("mock-call-{}", NEXT.fetch_add(1, Ordering::SeqCst))
}
