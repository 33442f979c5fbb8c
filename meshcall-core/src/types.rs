//! Core identifiers, configuration, events, and errors for group calls.

use crate::feed::{CallFeed, FeedError};
use crate::media::MediaError;
use crate::peer_call::PeerCallError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long a published device advertisement stays valid, in milliseconds.
pub const DEVICE_TIMEOUT_MS: i64 = 3_600_000;

/// How often the local advertisement is refreshed while entered (3/4 of the
/// device timeout, so the entry never lapses between refreshes).
pub const DEVICE_REFRESH_INTERVAL: Duration = Duration::from_millis(DEVICE_TIMEOUT_MS as u64 * 3 / 4);

/// Interval between active-speaker selection passes.
pub const ACTIVE_SPEAKER_INTERVAL: Duration = Duration::from_millis(1_000);

/// Volume floor for active-speaker selection; feed means are clamped below at
/// this value and a feed must strictly exceed it to take the floor.
pub const SPEAKING_THRESHOLD: f32 = -60.0;

/// Interval between outbound placement retry passes.
pub const RETRY_CALL_INTERVAL: Duration = Duration::from_millis(5_000);

/// Per-slot cap on automatic placement retries.
pub const PLACEMENT_RETRY_LIMIT: u32 = 3;

/// Longest a push-to-talk unmute may transmit before auto-remuting.
pub const PTT_MAX_TRANSMIT_TIME: Duration = Duration::from_millis(20_000);

/// Current wall-clock time as a millisecond unix timestamp.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier from any string-like value.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id! {
    /// Identifier of one group call within a room.
    GroupCallId
}

opaque_id! {
    /// Identifier of a user of the messaging platform.
    UserId
}

opaque_id! {
    /// Identifier of one logged-in device of a user.
    DeviceId
}

opaque_id! {
    /// Identifier of one run of this coordinator on a device; regenerated on
    /// process restart.
    SessionId
}

opaque_id! {
    /// Identifier of the room hosting the call.
    RoomId
}

opaque_id! {
    /// Identifier of a single peer-to-peer call, assigned by the call layer.
    CallId
}

/// Media profile of the group call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupCallType {
    /// Audio only.
    #[serde(rename = "m.voice")]
    Voice,
    /// Audio and video.
    #[serde(rename = "m.video")]
    Video,
}

/// How clients should surface the call to room members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupCallIntent {
    /// Ring the other members.
    #[serde(rename = "m.ring")]
    Ring,
    /// Show a prompt without ringing.
    #[serde(rename = "m.prompt")]
    Prompt,
    /// A persistent room call users join at their leisure.
    #[serde(rename = "m.room")]
    Room,
}

/// Why a group call was terminated, as written into its state event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupCallTerminationReason {
    /// The call was ended for everyone.
    #[serde(rename = "call_ended")]
    CallEnded,
}

/// Lifecycle state of a [`crate::GroupCall`].
///
/// ```text
///  LocalCallFeedUninitialized
///        │ init_local_call_feed
///        ▼
///  InitializingLocalCallFeed ──(capture failed)──► LocalCallFeedUninitialized
///        │
///        ▼
///  LocalCallFeedInitialized
///        │ enter
///        ▼
///     Entered ──(leave)──► LocalCallFeedUninitialized
///
///  any state ──(terminate)──► Ended (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCallState {
    /// No local capture has been acquired yet.
    LocalCallFeedUninitialized,
    /// Local capture acquisition is in flight.
    InitializingLocalCallFeed,
    /// Local capture is ready; the call has not been entered.
    LocalCallFeedInitialized,
    /// The local device is participating in the call.
    Entered,
    /// The call is over; no further transitions.
    Ended,
}

/// Options for the data channel opened on each established call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChannelOptions {
    /// Deliver messages in order.
    pub ordered: bool,
    /// Maximum lifetime of an unacknowledged message, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_packet_life_time: Option<u32>,
    /// Maximum number of retransmissions of an unacknowledged message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u32>,
    /// Application sub-protocol label.
    #[serde(default)]
    pub protocol: String,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
            protocol: String::new(),
        }
    }
}

/// Configuration for one group call.
#[derive(Debug, Clone)]
pub struct GroupCallOptions {
    /// Identifier of the call within the room.
    pub group_call_id: GroupCallId,
    /// Media profile.
    pub call_type: GroupCallType,
    /// How the call is surfaced to members.
    pub intent: GroupCallIntent,
    /// Push-to-talk mode: unmutes are transient and auto-remute.
    pub is_ptt: bool,
    /// Open a data channel on every established call.
    pub data_channels_enabled: bool,
    /// Options for the per-call data channel.
    pub data_channel_options: Option<DataChannelOptions>,
}

/// Presence of one participating device, as seen in the participant view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantState {
    /// The coordinator session the device is advertising.
    pub session_id: SessionId,
    /// Whether the device advertises a screen-share feed.
    pub screensharing: bool,
}

/// The authoritative `user → device → state` view of call participants.
pub type ParticipantMap = BTreeMap<UserId, BTreeMap<DeviceId, ParticipantState>>;

/// Wire code attached to errors surfaced through [`GroupCallEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupCallErrorCode {
    /// Local media could not be acquired.
    NoUserMedia,
    /// The call layer did not recognise the target device.
    UnknownDevice,
    /// Outbound placement failed for another reason.
    PlaceCallFailed,
}

/// Errors produced by the group call coordinator.
#[derive(Debug, Error)]
pub enum GroupCallError {
    /// An operation was invoked in a lifecycle state that does not allow it.
    #[error("operation not valid in state {actual:?}")]
    InvalidState {
        /// The state the call was actually in.
        actual: GroupCallState,
    },

    /// The call was torn down while an acquisition was in flight.
    #[error("group call was disposed while acquiring media")]
    Disposed,

    /// Local media could not be acquired.
    #[error("could not acquire user media")]
    NoUserMedia {
        /// The underlying capture failure.
        #[source]
        source: MediaError,
    },

    /// The call layer did not recognise the target device.
    #[error("unknown device {device_id} for {user_id}")]
    UnknownDevice {
        /// The user the placement was addressed to.
        user_id: UserId,
        /// The device the placement was addressed to.
        device_id: DeviceId,
        /// The originating call-layer error, surfaced verbatim.
        #[source]
        source: PeerCallError,
    },

    /// Outbound placement failed.
    #[error("failed to place call to {user_id} ({device_id})")]
    PlaceCallFailed {
        /// The user the placement was addressed to.
        user_id: UserId,
        /// The device the placement was addressed to.
        device_id: DeviceId,
        /// The underlying call-layer error.
        #[source]
        source: PeerCallError,
    },

    /// A call without an identifiable opponent was handed to the coordinator.
    #[error("call has no opponent user or device id")]
    MissingOpponent,

    /// An unmute was refused because another participant holds the floor.
    #[error("another participant is currently speaking")]
    OtherUserSpeaking,

    /// A feed registry operation referenced a feed that is not registered.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// A room state write failed.
    #[error("room state write failed: {cause}")]
    Client {
        /// The transport-level failure.
        cause: anyhow::Error,
    },

    /// An internal bookkeeping invariant was violated.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl GroupCallError {
    /// The wire code for errors that are surfaced to observers, if any.
    #[must_use]
    pub fn code(&self) -> Option<GroupCallErrorCode> {
        match self {
            Self::NoUserMedia { .. } => Some(GroupCallErrorCode::NoUserMedia),
            Self::UnknownDevice { .. } => Some(GroupCallErrorCode::UnknownDevice),
            Self::PlaceCallFailed { .. } => Some(GroupCallErrorCode::PlaceCallFailed),
            _ => None,
        }
    }
}

/// Events emitted by a group call to its observers.
///
/// Delivery is synchronous with respect to the mutation that caused the
/// event: state is updated before the event is sent.
#[derive(Debug, Clone)]
pub enum GroupCallEvent {
    /// The lifecycle state changed.
    StateChanged {
        /// The state after the transition.
        new_state: GroupCallState,
        /// The state before the transition.
        old_state: GroupCallState,
    },
    /// The participant view changed structurally.
    ParticipantsChanged {
        /// The committed view.
        participants: ParticipantMap,
    },
    /// The call graph gained, replaced, or lost at least one call.
    CallsChanged,
    /// The user-media feed sequence changed.
    UserMediaFeedsChanged {
        /// The full current sequence.
        feeds: Vec<Arc<CallFeed>>,
    },
    /// The screen-share feed sequence changed.
    ScreenshareFeedsChanged {
        /// The full current sequence.
        feeds: Vec<Arc<CallFeed>>,
    },
    /// A different feed took the floor (or the floor was cleared).
    ActiveSpeakerChanged {
        /// The new active speaker, if any.
        feed: Option<Arc<CallFeed>>,
    },
    /// The local mute state changed.
    LocalMuteStateChanged {
        /// Whether the local microphone is muted.
        audio_muted: bool,
        /// Whether local video is muted.
        video_muted: bool,
    },
    /// Local screen sharing was enabled or disabled.
    LocalScreenshareStateChanged {
        /// Whether sharing is now enabled.
        enabled: bool,
        /// The local screen-share feed while enabled.
        feed: Option<Arc<CallFeed>>,
        /// The capture source, when one was requested.
        source_id: Option<String>,
    },
    /// A non-fatal error the coordinator absorbed.
    Error {
        /// The error, including its wire code where applicable.
        error: Arc<GroupCallError>,
    },
}
