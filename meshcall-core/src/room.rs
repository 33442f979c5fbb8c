//! Room-state and client transport consumed by the coordinator.
//!
//! [`RoomView`] is the read side: the replicated state of one room as the
//! local process currently sees it. [`RoomClient`] is the write side plus
//! local identity. Both are implemented by the outer client.

use crate::member_state::{CallMemberContent, GroupCallContent};
use crate::peer_call::PeerCall;
use crate::types::{DeviceId, GroupCallId, RoomId, SessionId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Room membership of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    /// The user has joined the room.
    Join,
    /// The user has been invited.
    Invite,
    /// The user has left or was never a member.
    Leave,
    /// The user is banned.
    Ban,
    /// The user has knocked.
    Knock,
}

/// One member-state event of the call-member type, as read from room state.
#[derive(Debug, Clone)]
pub struct CallMemberEvent {
    /// The member the event belongs to (also its state key).
    pub sender: UserId,
    /// The event content.
    pub content: CallMemberContent,
}

/// Read access to one room's replicated state.
pub trait RoomView: Send + Sync {
    /// Identifier of the room.
    fn room_id(&self) -> RoomId;

    /// Every member-state event of the call-member type in the room.
    fn call_member_events(&self) -> Vec<CallMemberEvent>;

    /// The room membership of a user, if known.
    fn membership(&self, user_id: &UserId) -> Option<Membership>;

    /// The group-call state event content for the given call, if present.
    fn group_call_content(&self, group_call_id: &GroupCallId) -> Option<GroupCallContent>;

    /// Subscribe to room state updates.
    fn updates(&self) -> broadcast::Receiver<()>;
}

/// The local identity plus the write/signalling side of the client.
#[async_trait]
pub trait RoomClient: Send + Sync {
    /// The local user.
    fn user_id(&self) -> UserId;

    /// The local device.
    fn device_id(&self) -> DeviceId;

    /// The coordinator session of this process run.
    fn session_id(&self) -> SessionId;

    /// Write a room state event.
    ///
    /// `keep_alive` asks the transport to let the request survive process
    /// teardown (used for the leave-time advertisement removal).
    ///
    /// # Errors
    ///
    /// Returns the transport failure; callers decide whether it propagates.
    async fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: serde_json::Value,
        state_key: &str,
        keep_alive: bool,
    ) -> anyhow::Result<()>;

    /// The device ids the identity service knows for the local user.
    ///
    /// # Errors
    ///
    /// Returns the transport failure.
    async fn get_devices(&self) -> anyhow::Result<Vec<DeviceId>>;

    /// Calls that already existed before the coordinator entered.
    fn active_calls(&self) -> Vec<Arc<dyn PeerCall>>;

    /// Subscribe to inbound calls from the transport.
    fn incoming_calls(&self) -> broadcast::Receiver<Arc<dyn PeerCall>>;
}
