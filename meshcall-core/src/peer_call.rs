//! The single-call layer consumed by the coordinator.
//!
//! One [`PeerCall`] negotiates media with exactly one remote device; the
//! coordinator never looks inside the negotiation, it only places, answers,
//! replaces, and hangs up calls and listens to their events.

use crate::feed::CallFeed;
use crate::types::{CallId, DataChannelOptions, DeviceId, GroupCallId, RoomId, SessionId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by the call layer.
#[derive(Error, Debug)]
pub enum PeerCallError {
    /// The target device is not known to the call layer.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Offer/answer/metadata signalling failed.
    #[error("signalling failed: {0}")]
    Signalling(String),

    /// The call is in a state that does not allow the operation.
    #[error("invalid call state")]
    InvalidState,
}

/// Negotiation state of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCallState {
    /// Created, nothing sent yet.
    Fledgling,
    /// Outbound invite sent, awaiting answer.
    InviteSent,
    /// Inbound call awaiting local answer.
    Ringing,
    /// Media transport is being established.
    Connecting,
    /// Media is flowing.
    Connected,
    /// The call is over.
    Ended,
}

/// Why a call was hung up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    /// The local user ended the call.
    UserHangup,
    /// The remote device advertised a new session; the call is superseded.
    NewSession,
    /// Another call for the same slot took over.
    Replaced,
    /// Negotiation failed.
    SignallingFailed,
    /// Anything the call layer could not classify.
    UnknownError,
}

/// Events a [`PeerCall`] delivers to its subscribers.
#[derive(Debug, Clone)]
pub enum PeerCallEvent {
    /// The call's local or remote feed set changed.
    FeedsChanged,
    /// The negotiation state changed.
    StateChanged {
        /// The state after the transition.
        new_state: PeerCallState,
        /// The state before the transition.
        old_state: PeerCallState,
    },
    /// The call hung up.
    Hangup {
        /// The reason reported by the far side or the call layer.
        reason: Option<HangupReason>,
    },
    /// The call was superseded by a renegotiated one for the same slot.
    Replaced {
        /// The call taking over.
        new_call: Arc<dyn PeerCall>,
    },
}

/// One peer-to-peer call towards a single remote device.
#[async_trait]
pub trait PeerCall: Send + Sync + fmt::Debug {
    /// Identifier of this call.
    fn call_id(&self) -> CallId;

    /// The room the call belongs to.
    fn room_id(&self) -> RoomId;

    /// The group call the call belongs to, if any.
    fn group_call_id(&self) -> Option<GroupCallId>;

    /// Current negotiation state.
    fn state(&self) -> PeerCallState;

    /// The hangup reason once the call has ended.
    fn hangup_reason(&self) -> Option<HangupReason>;

    /// The remote user, once identified.
    fn opponent_user_id(&self) -> Option<UserId>;

    /// The remote device, once identified.
    fn opponent_device_id(&self) -> Option<DeviceId>;

    /// The remote coordinator session, once identified.
    fn opponent_session_id(&self) -> Option<SessionId>;

    /// The remote user-media feed, once received.
    fn remote_usermedia_feed(&self) -> Option<Arc<CallFeed>>;

    /// The remote screen-share feed, once received.
    fn remote_screenshare_feed(&self) -> Option<Arc<CallFeed>>;

    /// The local user-media feed attached to this call.
    fn local_usermedia_feed(&self) -> Option<Arc<CallFeed>>;

    /// Whether the call's local microphone is muted.
    fn is_microphone_muted(&self) -> bool;

    /// Whether the call's local video is muted.
    fn is_local_video_muted(&self) -> bool;

    /// Send the invite, attaching the given local feeds.
    ///
    /// # Errors
    ///
    /// Returns [`PeerCallError::UnknownDevice`] if the target device is not
    /// recognised, or [`PeerCallError::Signalling`] on other failures.
    async fn place_call_with_feeds(
        &self,
        feeds: Vec<Arc<CallFeed>>,
        remote_screensharing: bool,
    ) -> Result<(), PeerCallError>;

    /// Answer an inbound call, attaching the given local feeds.
    ///
    /// # Errors
    ///
    /// Returns [`PeerCallError`] if the answer cannot be sent.
    async fn answer_with_feeds(&self, feeds: Vec<Arc<CallFeed>>) -> Result<(), PeerCallError>;

    /// Decline an inbound call.
    ///
    /// # Errors
    ///
    /// Returns [`PeerCallError`] if the rejection cannot be sent.
    async fn reject(&self) -> Result<(), PeerCallError>;

    /// End the call.
    ///
    /// # Errors
    ///
    /// Returns [`PeerCallError`] if the hangup cannot be sent; local state is
    /// torn down regardless.
    async fn hangup(&self, reason: HangupReason, suppress_event: bool) -> Result<(), PeerCallError>;

    /// Push the local microphone mute bit into the call.
    ///
    /// # Errors
    ///
    /// Returns [`PeerCallError`] if the accompanying metadata cannot be sent.
    async fn set_microphone_muted(&self, muted: bool) -> Result<(), PeerCallError>;

    /// Push the local video mute bit into the call.
    ///
    /// # Errors
    ///
    /// Returns [`PeerCallError`] if the accompanying metadata cannot be sent.
    async fn set_local_video_muted(&self, muted: bool) -> Result<(), PeerCallError>;

    /// Re-send the call's media metadata to the far side.
    ///
    /// # Errors
    ///
    /// Returns [`PeerCallError::Signalling`] if the update cannot be sent.
    async fn send_metadata_update(&self) -> Result<(), PeerCallError>;

    /// Attach an additional local feed mid-call.
    ///
    /// # Errors
    ///
    /// Returns [`PeerCallError`] if renegotiation fails.
    async fn push_local_feed(&self, feed: Arc<CallFeed>) -> Result<(), PeerCallError>;

    /// Detach a local feed mid-call.
    ///
    /// # Errors
    ///
    /// Returns [`PeerCallError`] if renegotiation fails.
    async fn remove_local_feed(&self, feed: &Arc<CallFeed>) -> Result<(), PeerCallError>;

    /// Open a data channel on the call.
    ///
    /// # Errors
    ///
    /// Returns [`PeerCallError`] if the channel cannot be created.
    async fn create_data_channel(
        &self,
        label: &str,
        opts: &DataChannelOptions,
    ) -> Result<(), PeerCallError>;

    /// Subscribe to the call's events.
    fn subscribe(&self) -> broadcast::Receiver<PeerCallEvent>;
}

/// Addressing for a new outbound call.
#[derive(Debug, Clone)]
pub struct OutgoingCallParams {
    /// The user to invite.
    pub invitee: UserId,
    /// The device to address.
    pub opponent_device_id: DeviceId,
    /// The session advertised by that device.
    pub opponent_session_id: SessionId,
    /// The group call the new call belongs to.
    pub group_call_id: GroupCallId,
}

/// Constructs single calls; implemented by the call layer.
pub trait CallFactory: Send + Sync {
    /// Construct a new outbound call, or `None` when the layer cannot place
    /// calls in this room right now.
    fn create_call(&self, room_id: &RoomId, params: OutgoingCallParams) -> Option<Arc<dyn PeerCall>>;
}
