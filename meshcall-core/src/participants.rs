//! Derives the authoritative participant view from room state.
//!
//! The view maps each joined member to the devices it currently advertises
//! for this group call, after structural validation and expiry filtering,
//! with a local-echo entry for this device while we are entered.

use crate::room::{Membership, RoomView};
use crate::types::{
    DeviceId, GroupCallEvent, GroupCallId, ParticipantMap, ParticipantState, SessionId, UserId,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Inputs describing the local side of the computation.
#[derive(Debug, Clone)]
pub struct LocalParticipant<'a> {
    /// The local user.
    pub user_id: &'a UserId,
    /// The local device.
    pub device_id: &'a DeviceId,
    /// The current coordinator session.
    pub session_id: &'a SessionId,
    /// Whether we count as entered (`Entered` state or entered elsewhere).
    pub entered: bool,
    /// Whether the local device is screen sharing.
    pub screensharing: bool,
}

/// Recompute the participant view.
///
/// Returns the view plus the earliest `expires_ts` among included devices,
/// which the caller uses to schedule the expiration refresh.
#[must_use]
pub fn compute_participants(
    group_call_id: &GroupCallId,
    room: &dyn RoomView,
    local: &LocalParticipant<'_>,
    now: i64,
) -> (ParticipantMap, Option<i64>) {
    let mut participants: ParticipantMap = BTreeMap::new();
    let mut next_expiry: Option<i64> = None;

    for event in room.call_member_events() {
        let Some(entry) = event.content.entry(group_call_id) else {
            continue;
        };
        let mut devices = entry.valid_devices(now);

        // Local-echo suppression: our own stale advertisement must not make
        // us appear as a participant before we have actually entered.
        if event.sender == *local.user_id && !local.entered {
            devices.retain(|d| d.device_id != *local.device_id);
        }

        if devices.is_empty() {
            continue;
        }
        if room.membership(&event.sender) != Some(Membership::Join) {
            continue;
        }

        let inner = participants.entry(event.sender.clone()).or_default();
        for device in devices {
            next_expiry = Some(match next_expiry {
                Some(current) => current.min(device.expires_ts),
                None => device.expires_ts,
            });
            inner.insert(
                device.device_id.clone(),
                ParticipantState {
                    screensharing: device.is_screensharing(),
                    session_id: device.session_id,
                },
            );
        }
    }

    if local.entered {
        let inner = participants.entry(local.user_id.clone()).or_default();
        inner.entry(local.device_id.clone()).or_insert(ParticipantState {
            session_id: local.session_id.clone(),
            screensharing: local.screensharing,
        });
    }

    (participants, next_expiry)
}

/// Holds the committed view and emits `ParticipantsChanged` on real change.
pub struct ParticipantTracker {
    participants: RwLock<ParticipantMap>,
    events: broadcast::Sender<GroupCallEvent>,
}

impl ParticipantTracker {
    /// Create a tracker emitting on the given event channel.
    #[must_use]
    pub fn new(events: broadcast::Sender<GroupCallEvent>) -> Self {
        Self {
            participants: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// The committed view.
    #[must_use]
    pub fn participants(&self) -> ParticipantMap {
        self.participants.read().clone()
    }

    /// Commit a freshly computed view.
    ///
    /// Emits `ParticipantsChanged` and returns `true` only when the view
    /// differs structurally from the committed one.
    pub fn commit(&self, new: ParticipantMap) -> bool {
        {
            let mut current = self.participants.write();
            if *current == new {
                return false;
            }
            *current = new.clone();
        }
        tracing::debug!(members = new.len(), "participant view changed");
        let _ = self
            .events
            .send(GroupCallEvent::ParticipantsChanged { participants: new });
        true
    }
}
