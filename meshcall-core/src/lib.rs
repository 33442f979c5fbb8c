//! Meshcall - multi-party call coordination over a replicated room log
//!
//! This library turns a room's eventually-consistent membership view into a
//! full mesh of per-device peer-to-peer calls. It features:
//!
//! - **Deterministic directionality**: a total order on `(user, device)`
//!   decides who dials, so exactly one call exists between any pair
//! - **Call-graph reconciliation**: placement, inbound admission, session
//!   replacement, and bounded retries driven from the participant view
//! - **Membership publishing**: the local device's advertisement is written,
//!   refreshed, and cleaned in room state
//! - **Local media control**: capture, mute semantics, push-to-talk, screen
//!   sharing, and active-speaker selection
//!
//! The single-call signalling layer, the capture stack, and the room
//! transport are external collaborators behind the [`PeerCall`],
//! [`MediaDevices`], [`RoomView`], and [`RoomClient`] traits.
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_core::{
//!     GroupCall, GroupCallIntent, GroupCallOptions, GroupCallType,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     client: Arc<dyn meshcall_core::RoomClient>,
//! #     room: Arc<dyn meshcall_core::RoomView>,
//! #     devices: Arc<dyn meshcall_core::MediaDevices>,
//! #     factory: Arc<dyn meshcall_core::CallFactory>,
//! # ) -> Result<(), meshcall_core::GroupCallError> {
//! let call = GroupCall::new(
//!     client,
//!     room,
//!     devices,
//!     factory,
//!     GroupCallOptions {
//!         group_call_id: "confcall-1".into(),
//!         call_type: GroupCallType::Voice,
//!         intent: GroupCallIntent::Room,
//!         is_ptt: false,
//!         data_channels_enabled: false,
//!         data_channel_options: None,
//!     },
//! )
//! .await;
//!
//! call.enter().await?;
//! call.set_microphone_muted(false).await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core identifiers, configuration, events, and errors
pub mod types;

/// Wire schemas for member advertisements and the group-call state event
pub mod member_state;

/// Media stream model and the capture-device interface
pub mod media;

/// Call feeds and the per-call feed registry
pub mod feed;

/// Participant-view computation
pub mod participants;

/// The single-call layer interface
pub mod peer_call;

/// Room state and client transport interfaces
pub mod room;

/// The call-graph reconciler
pub mod reconciler;

/// Member-state publishing
pub mod membership;

/// Local capture, mute, push-to-talk, and screen-share control
pub mod local_media;

/// The group call lifecycle and wiring
pub mod group_call;

// Re-export main types at crate root
pub use feed::{CallFeed, FeedError, FeedRegistry, LocalFeeds};
pub use group_call::GroupCall;
pub use local_media::LocalMediaController;
pub use media::{MediaDevices, MediaError, MediaKind, MediaStream, MediaTrack, ScreenshareOptions};
pub use member_state::{
    CallMemberContent, DeviceAdvertisement, FeedAdvertisement, FeedPurpose, GroupCallContent,
    MemberCallEntry, CALL_MEMBER_EVENT_TYPE, GROUP_CALL_EVENT_TYPE,
};
pub use membership::MembershipPublisher;
pub use participants::{compute_participants, LocalParticipant, ParticipantTracker};
pub use peer_call::{
    CallFactory, HangupReason, OutgoingCallParams, PeerCall, PeerCallError, PeerCallEvent,
    PeerCallState,
};
pub use reconciler::{wants_outgoing_call, CallSignal, Reconciler};
pub use room::{CallMemberEvent, Membership, RoomClient, RoomView};
pub use types::{
    now_ms, CallId, DataChannelOptions, DeviceId, GroupCallError, GroupCallErrorCode,
    GroupCallEvent, GroupCallId, GroupCallIntent, GroupCallOptions, GroupCallState,
    GroupCallTerminationReason, GroupCallType, ParticipantMap, ParticipantState, RoomId,
    SessionId, UserId, ACTIVE_SPEAKER_INTERVAL, DEVICE_REFRESH_INTERVAL, DEVICE_TIMEOUT_MS,
    PLACEMENT_RETRY_LIMIT, PTT_MAX_TRANSMIT_TIME, RETRY_CALL_INTERVAL, SPEAKING_THRESHOLD,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::feed::{CallFeed, FeedRegistry};
    pub use crate::group_call::GroupCall;
    pub use crate::media::{MediaDevices, MediaStream, ScreenshareOptions};
    pub use crate::peer_call::{CallFactory, HangupReason, PeerCall, PeerCallState};
    pub use crate::room::{RoomClient, RoomView};
    pub use crate::types::{
        GroupCallEvent, GroupCallId, GroupCallIntent, GroupCallOptions, GroupCallState,
        GroupCallType,
    };
}
