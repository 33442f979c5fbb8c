//! The call-graph reconciler.
//!
//! Maintains the invariant that every participant `(user, device)` slot is
//! served by exactly one call: placed by us when the directionality rule says
//! so, accepted from the far side otherwise. The reconciler is the single
//! owner of the call graph; everything else reads it through accessors.

use crate::feed::{FeedRegistry, LocalFeeds};
use crate::peer_call::{
    CallFactory, HangupReason, OutgoingCallParams, PeerCall, PeerCallError, PeerCallEvent,
    PeerCallState,
};
use crate::types::{
    CallId, DataChannelOptions, DeviceId, GroupCallError, GroupCallEvent, GroupCallId,
    ParticipantMap, RoomId, UserId, PLACEMENT_RETRY_LIMIT,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Label of the data channel opened on established calls.
const DATA_CHANNEL_LABEL: &str = "datachannel";

/// Whether the local device places the call towards the remote device.
///
/// The order is lexicographic on `(user_id, device_id)`: the side with the
/// smaller pair dials. Total and antisymmetric over distinct pairs, so
/// exactly one side of any pair originates.
#[must_use]
pub fn wants_outgoing_call(
    local_user: &UserId,
    local_device: &DeviceId,
    remote_user: &UserId,
    remote_device: &DeviceId,
) -> bool {
    match remote_user.as_str().cmp(local_user.as_str()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => remote_device.as_str() > local_device.as_str(),
    }
}

/// A per-call event tagged with the slot it belongs to, fed into the group
/// call's serialized dispatcher.
#[derive(Debug, Clone)]
pub struct CallSignal {
    /// The slot's user.
    pub user_id: UserId,
    /// The slot's device.
    pub device_id: DeviceId,
    /// The call that produced the event.
    pub call_id: CallId,
    /// The event itself.
    pub event: PeerCallEvent,
}

struct HandlerEntry {
    call_id: CallId,
    forwarder: JoinHandle<()>,
}

/// Owns the call graph, the handler table, and the retry counters.
pub struct Reconciler {
    room_id: RoomId,
    group_call_id: GroupCallId,
    local_user: UserId,
    local_device: DeviceId,
    factory: Arc<dyn CallFactory>,
    registry: Arc<FeedRegistry>,
    local_feeds: Arc<LocalFeeds>,
    data_channels_enabled: bool,
    data_channel_options: DataChannelOptions,
    graph: RwLock<BTreeMap<UserId, BTreeMap<DeviceId, Arc<dyn PeerCall>>>>,
    handlers: Mutex<HashMap<(UserId, DeviceId), HandlerEntry>>,
    retries: Mutex<HashMap<(UserId, DeviceId), u32>>,
    events: broadcast::Sender<GroupCallEvent>,
    signals: mpsc::UnboundedSender<CallSignal>,
}

impl Reconciler {
    /// Create a reconciler.
    ///
    /// Per-call events are forwarded on `signals`; the caller is responsible
    /// for draining them serially back into the `on_*` handlers.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        room_id: RoomId,
        group_call_id: GroupCallId,
        local_user: UserId,
        local_device: DeviceId,
        factory: Arc<dyn CallFactory>,
        registry: Arc<FeedRegistry>,
        local_feeds: Arc<LocalFeeds>,
        data_channels_enabled: bool,
        data_channel_options: Option<DataChannelOptions>,
        events: broadcast::Sender<GroupCallEvent>,
        signals: mpsc::UnboundedSender<CallSignal>,
    ) -> Self {
        Self {
            room_id,
            group_call_id,
            local_user,
            local_device,
            factory,
            registry,
            local_feeds,
            data_channels_enabled,
            data_channel_options: data_channel_options.unwrap_or_default(),
            graph: RwLock::new(BTreeMap::new()),
            handlers: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            events,
            signals,
        }
    }

    /// The call serving a slot, if any.
    #[must_use]
    pub fn get_call(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Arc<dyn PeerCall>> {
        self.graph.read().get(user_id)?.get(device_id).cloned()
    }

    /// Snapshot of every call in the graph.
    #[must_use]
    pub fn calls(&self) -> Vec<Arc<dyn PeerCall>> {
        self.graph
            .read()
            .values()
            .flat_map(|devices| devices.values().cloned())
            .collect()
    }

    /// Snapshot of the graph keyed by user and device.
    #[must_use]
    pub fn calls_by_user(&self) -> BTreeMap<UserId, BTreeMap<DeviceId, Arc<dyn PeerCall>>> {
        self.graph.read().clone()
    }

    /// The keys currently present in the handler table.
    #[must_use]
    pub fn handler_keys(&self) -> Vec<(UserId, DeviceId)> {
        self.handlers.lock().keys().cloned().collect()
    }

    /// The retry count recorded for a slot.
    #[must_use]
    pub fn retry_count(&self, user_id: &UserId, device_id: &DeviceId) -> u32 {
        self.retries
            .lock()
            .get(&(user_id.clone(), device_id.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn emit_calls_changed(&self) {
        let _ = self.events.send(GroupCallEvent::CallsChanged);
    }

    fn emit_error(&self, error: GroupCallError) {
        tracing::warn!(%error, "reconciler surfaced error");
        let _ = self.events.send(GroupCallEvent::Error { error: Arc::new(error) });
    }

    /// Subscribe the call's event stream and record the teardown handle.
    fn register_call(&self, call: &Arc<dyn PeerCall>, key: (UserId, DeviceId)) {
        let mut rx = call.subscribe();
        let signals = self.signals.clone();
        let call_id = call.call_id();
        let (user_id, device_id) = key.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let signal = CallSignal {
                            user_id: user_id.clone(),
                            device_id: device_id.clone(),
                            call_id: call_id.clone(),
                            event,
                        };
                        if signals.send(signal).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "call event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut handlers = self.handlers.lock();
        if let Some(previous) = handlers.insert(
            key.clone(),
            HandlerEntry { call_id: call.call_id(), forwarder },
        ) {
            previous.forwarder.abort();
            tracing::error!(
                user_id = %key.0,
                device_id = %key.1,
                "handler table already held an entry for this slot"
            );
        }
    }

    /// Unsubscribe the call's listeners and hang it up.
    ///
    /// Does not touch the graph; callers decide what happens to the slot.
    ///
    /// # Errors
    ///
    /// [`GroupCallError::MissingOpponent`] when the call has no opponent, or
    /// [`GroupCallError::Internal`] when no handler entry exists for its
    /// slot, which means the graph and the handler table diverged.
    pub async fn dispose_call(
        &self,
        call: &Arc<dyn PeerCall>,
        reason: HangupReason,
    ) -> Result<(), GroupCallError> {
        let user_id = call.opponent_user_id().ok_or(GroupCallError::MissingOpponent)?;
        let device_id = call.opponent_device_id().ok_or(GroupCallError::MissingOpponent)?;

        let entry = self.handlers.lock().remove(&(user_id.clone(), device_id.clone()));
        match entry {
            Some(entry) => {
                tracing::debug!(call_id = %entry.call_id, "unsubscribed call handlers");
                entry.forwarder.abort();
            }
            None => {
                return Err(GroupCallError::Internal(format!(
                    "no call handlers registered for {user_id} ({device_id})"
                )));
            }
        }

        if call.state() != PeerCallState::Ended {
            if let Err(error) = call.hangup(reason, false).await {
                tracing::warn!(%error, call_id = %call.call_id(), "hangup failed during disposal");
            }
        }
        Ok(())
    }

    fn insert_slot(&self, user_id: UserId, device_id: DeviceId, call: Arc<dyn PeerCall>) {
        self.graph
            .write()
            .entry(user_id)
            .or_default()
            .insert(device_id, call);
    }

    /// Remove the slot iff it is still occupied by `expected`; returns
    /// whether anything was removed. Tolerates the failure-after-overwrite
    /// race: a stale deletion must not evict a newer call.
    fn remove_slot(&self, user_id: &UserId, device_id: &DeviceId, expected: &CallId) -> bool {
        let mut graph = self.graph.write();
        let Some(devices) = graph.get_mut(user_id) else {
            return false;
        };
        let occupied = devices
            .get(device_id)
            .is_some_and(|call| &call.call_id() == expected);
        if !occupied {
            return false;
        }
        devices.remove(device_id);
        if devices.is_empty() {
            graph.remove(user_id);
        }
        true
    }

    /// One placement pass over the participant view.
    ///
    /// For every slot the directionality rule assigns to us, ensures a call
    /// with the advertised session exists: placing, replacing on session
    /// change, and freeing the slot on failure. Emits `CallsChanged` once
    /// iff any slot was added, replaced, or removed.
    pub async fn place_outgoing_calls(&self, participants: &ParticipantMap) {
        let mut changed = false;

        for (user_id, devices) in participants {
            for (device_id, participant) in devices {
                if user_id == &self.local_user && device_id == &self.local_device {
                    continue;
                }
                if !wants_outgoing_call(&self.local_user, &self.local_device, user_id, device_id) {
                    continue;
                }

                if let Some(existing) = self.get_call(user_id, device_id) {
                    if existing.opponent_session_id().as_ref() == Some(&participant.session_id) {
                        continue;
                    }
                    tracing::info!(
                        user_id = %user_id,
                        device_id = %device_id,
                        session_id = %participant.session_id,
                        "device advertised a new session, replacing call"
                    );
                    if let Err(error) = self.dispose_call(&existing, HangupReason::NewSession).await
                    {
                        tracing::error!(%error, "failed to dispose superseded call");
                    }
                    self.remove_slot(user_id, device_id, &existing.call_id());
                    changed = true;
                }

                let params = OutgoingCallParams {
                    invitee: user_id.clone(),
                    opponent_device_id: device_id.clone(),
                    opponent_session_id: participant.session_id.clone(),
                    group_call_id: self.group_call_id.clone(),
                };
                let Some(call) = self.factory.create_call(&self.room_id, params) else {
                    tracing::warn!(
                        user_id = %user_id,
                        device_id = %device_id,
                        "call layer could not construct an outbound call"
                    );
                    continue;
                };

                self.register_call(&call, (user_id.clone(), device_id.clone()));
                self.insert_slot(user_id.clone(), device_id.clone(), call.clone());
                changed = true;

                tracing::debug!(
                    user_id = %user_id,
                    device_id = %device_id,
                    call_id = %call.call_id(),
                    "placing outbound call"
                );
                let feeds = self.local_feeds.fork_all();
                match call
                    .place_call_with_feeds(feeds, participant.screensharing)
                    .await
                {
                    Ok(()) => {
                        if self.data_channels_enabled {
                            if let Err(error) = call
                                .create_data_channel(DATA_CHANNEL_LABEL, &self.data_channel_options)
                                .await
                            {
                                tracing::warn!(%error, "failed to create data channel");
                            }
                        }
                    }
                    Err(error) => {
                        let error = match error {
                            PeerCallError::UnknownDevice(_) => GroupCallError::UnknownDevice {
                                user_id: user_id.clone(),
                                device_id: device_id.clone(),
                                source: error,
                            },
                            other => GroupCallError::PlaceCallFailed {
                                user_id: user_id.clone(),
                                device_id: device_id.clone(),
                                source: other,
                            },
                        };
                        self.emit_error(error);
                        if let Err(error) =
                            self.dispose_call(&call, HangupReason::SignallingFailed).await
                        {
                            tracing::error!(%error, "failed to dispose unplaceable call");
                        }
                        self.remove_slot(user_id, device_id, &call.call_id());
                    }
                }
            }
        }

        if changed {
            self.emit_calls_changed();
        }
    }

    /// Admit (or reject) an inbound call from the transport.
    pub async fn handle_incoming_call(&self, call: Arc<dyn PeerCall>) {
        if call.room_id() != self.room_id {
            return;
        }
        if call.state() != PeerCallState::Ringing {
            return;
        }
        match call.group_call_id() {
            Some(id) if id == self.group_call_id => {}
            _ => {
                tracing::info!(
                    call_id = %call.call_id(),
                    "rejecting inbound call for a different group call"
                );
                if let Err(error) = call.reject().await {
                    tracing::warn!(%error, "failed to reject inbound call");
                }
                return;
            }
        }
        let (Some(user_id), Some(device_id)) = (call.opponent_user_id(), call.opponent_device_id())
        else {
            tracing::info!(call_id = %call.call_id(), "ignoring inbound call without opponent");
            return;
        };

        if let Some(existing) = self.get_call(&user_id, &device_id) {
            if existing.call_id() == call.call_id() {
                // Duplicate delivery of a call we already admitted.
                return;
            }
            tracing::info!(
                user_id = %user_id,
                device_id = %device_id,
                old_call = %existing.call_id(),
                new_call = %call.call_id(),
                "inbound call replaces existing call for slot"
            );
            if let Err(error) = self.dispose_call(&existing, HangupReason::Replaced).await {
                tracing::error!(%error, "failed to dispose replaced call");
            }
            self.remove_slot(&user_id, &device_id, &existing.call_id());
        }

        self.register_call(&call, (user_id.clone(), device_id.clone()));
        if let Err(error) = call.answer_with_feeds(self.local_feeds.fork_all()).await {
            tracing::warn!(%error, call_id = %call.call_id(), "failed to answer inbound call");
        }
        self.insert_slot(user_id, device_id, call);
        self.emit_calls_changed();
    }

    /// A registered call reported hangup.
    pub async fn on_hangup(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        call_id: &CallId,
        reason: Option<HangupReason>,
    ) {
        // Replacement is handled by the replace callback; the superseded
        // call's own hangup must not evict its successor.
        if reason == Some(HangupReason::Replaced) {
            return;
        }
        let Some(current) = self.get_call(user_id, device_id) else {
            return;
        };
        if &current.call_id() != call_id {
            return;
        }
        tracing::info!(user_id = %user_id, device_id = %device_id, ?reason, "call hung up");
        if let Err(error) = self
            .dispose_call(&current, reason.unwrap_or(HangupReason::UserHangup))
            .await
        {
            tracing::error!(%error, "failed to dispose hung-up call");
        }
        self.remove_slot(user_id, device_id, call_id);
        self.emit_calls_changed();
    }

    /// A registered call was superseded by a renegotiated one.
    pub async fn on_replaced(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        old_call_id: &CallId,
        new_call: Arc<dyn PeerCall>,
    ) {
        let Some(previous) = self.get_call(user_id, device_id) else {
            tracing::warn!(user_id = %user_id, device_id = %device_id, "replace for unknown slot");
            return;
        };
        if &previous.call_id() != old_call_id {
            return;
        }
        tracing::info!(
            user_id = %user_id,
            device_id = %device_id,
            old_call = %old_call_id,
            new_call = %new_call.call_id(),
            "call replaced"
        );
        if let Err(error) = self.dispose_call(&previous, HangupReason::Replaced).await {
            tracing::error!(%error, "failed to dispose replaced call");
        }
        // The slot keeps the previous call's key: the new call may not have
        // resolved its opponent yet.
        self.register_call(&new_call, (user_id.clone(), device_id.clone()));
        self.insert_slot(user_id.clone(), device_id.clone(), new_call);
        self.emit_calls_changed();
    }

    /// A registered call's feed set changed; reconcile the registry.
    pub fn on_feeds_changed(&self, user_id: &UserId, device_id: &DeviceId, call_id: &CallId) {
        let Some(call) = self.get_call(user_id, device_id) else {
            return;
        };
        if &call.call_id() != call_id {
            return;
        }

        match (
            self.registry.get_user_media_feed(user_id, device_id),
            call.remote_usermedia_feed(),
        ) {
            (None, Some(feed)) => self.registry.add_user_media_feed(feed),
            (Some(current), Some(feed)) if current.id() != feed.id() => {
                if let Err(error) = self.registry.replace_user_media_feed(&current, feed) {
                    tracing::warn!(%error, "user media feed vanished during replace");
                }
            }
            (Some(current), None) => {
                if let Err(error) = self.registry.remove_user_media_feed(&current) {
                    tracing::warn!(%error, "user media feed vanished during remove");
                }
            }
            _ => {}
        }

        match (
            self.registry.get_screenshare_feed(user_id, device_id),
            call.remote_screenshare_feed(),
        ) {
            (None, Some(feed)) => self.registry.add_screenshare_feed(feed),
            (Some(current), Some(feed)) if current.id() != feed.id() => {
                if let Err(error) = self.registry.replace_screenshare_feed(&current, feed) {
                    tracing::warn!(%error, "screenshare feed vanished during replace");
                }
            }
            (Some(current), None) => {
                if let Err(error) = self.registry.remove_screenshare_feed(&current) {
                    tracing::warn!(%error, "screenshare feed vanished during remove");
                }
            }
            _ => {}
        }
    }

    /// A registered call changed state: push local mute bits and clear the
    /// slot's retry counter on connection.
    pub async fn on_state_changed(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        call_id: &CallId,
        new_state: PeerCallState,
        audio_muted: bool,
        video_muted: bool,
    ) {
        let Some(call) = self.get_call(user_id, device_id) else {
            return;
        };
        if &call.call_id() != call_id {
            return;
        }

        if call.local_usermedia_feed().is_some() {
            if call.is_microphone_muted() != audio_muted {
                if let Err(error) = call.set_microphone_muted(audio_muted).await {
                    tracing::warn!(%error, "failed to push microphone mute into call");
                }
            }
            if call.is_local_video_muted() != video_muted {
                if let Err(error) = call.set_local_video_muted(video_muted).await {
                    tracing::warn!(%error, "failed to push video mute into call");
                }
            }
        }

        if new_state == PeerCallState::Connected {
            self.retries
                .lock()
                .remove(&(user_id.clone(), device_id.clone()));
            tracing::info!(user_id = %user_id, device_id = %device_id, "call connected");
        }
    }

    /// One retry pass: bump counters for unserved slots still under the cap
    /// and re-run placement when any slot qualified.
    pub async fn retry_tick(&self, participants: &ParticipantMap) {
        let mut pending = Vec::new();
        for (user_id, devices) in participants {
            for (device_id, participant) in devices {
                if user_id == &self.local_user && device_id == &self.local_device {
                    continue;
                }
                if !wants_outgoing_call(&self.local_user, &self.local_device, user_id, device_id) {
                    continue;
                }
                let unserved = match self.get_call(user_id, device_id) {
                    None => true,
                    Some(call) => {
                        call.opponent_session_id().as_ref() != Some(&participant.session_id)
                    }
                };
                if unserved {
                    pending.push((user_id.clone(), device_id.clone()));
                }
            }
        }

        let mut any = false;
        {
            let mut retries = self.retries.lock();
            for key in pending {
                let count = retries.entry(key.clone()).or_insert(0);
                if *count < PLACEMENT_RETRY_LIMIT {
                    *count += 1;
                    tracing::debug!(
                        user_id = %key.0,
                        device_id = %key.1,
                        attempt = *count,
                        "scheduling placement retry"
                    );
                    any = true;
                }
            }
        }
        if any {
            self.place_outgoing_calls(participants).await;
        }
    }

    /// Tear down every call and clear all bookkeeping.
    pub async fn dispose_all(&self, reason: HangupReason) {
        let calls: Vec<Arc<dyn PeerCall>> = {
            let mut graph = self.graph.write();
            let drained = std::mem::take(&mut *graph);
            drained
                .into_values()
                .flat_map(BTreeMap::into_values)
                .collect()
        };
        {
            let mut handlers = self.handlers.lock();
            for (_, entry) in handlers.drain() {
                entry.forwarder.abort();
            }
        }
        self.retries.lock().clear();

        let had_calls = !calls.is_empty();
        for call in calls {
            if call.state() != PeerCallState::Ended {
                if let Err(error) = call.hangup(reason, false).await {
                    tracing::warn!(%error, call_id = %call.call_id(), "hangup failed during teardown");
                }
            }
        }
        if had_calls {
            self.emit_calls_changed();
        }
    }
}
