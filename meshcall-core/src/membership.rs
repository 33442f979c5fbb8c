//! Publishes and maintains the local device's advertisement in room state.
//!
//! Every write is a read-modify-write of the member-state document scoped to
//! the local user: entries for other group calls are preserved verbatim, and
//! only the structurally valid, unexpired devices of our own entry are fed
//! into the mutation.

use crate::member_state::{
    CallMemberContent, DeviceAdvertisement, FeedAdvertisement, MemberCallEntry,
    CALL_MEMBER_EVENT_TYPE,
};
use crate::room::{RoomClient, RoomView};
use crate::types::{now_ms, GroupCallError, GroupCallId, DEVICE_TIMEOUT_MS};
use std::sync::Arc;

/// Read-modify-writes the local member-state entry for one group call.
pub struct MembershipPublisher {
    room: Arc<dyn RoomView>,
    client: Arc<dyn RoomClient>,
    group_call_id: GroupCallId,
}

impl MembershipPublisher {
    /// Create a publisher for the given call.
    #[must_use]
    pub fn new(
        room: Arc<dyn RoomView>,
        client: Arc<dyn RoomClient>,
        group_call_id: GroupCallId,
    ) -> Self {
        Self { room, client, group_call_id }
    }

    /// Apply `mutate` to our entry's valid device list and write the result.
    ///
    /// `mutate` returning `None` aborts without writing. The local device's
    /// advertisement is stamped with a fresh `expires_ts` on every write.
    ///
    /// # Errors
    ///
    /// Returns [`GroupCallError::Client`] when the state write fails.
    pub async fn update_devices<F>(&self, keep_alive: bool, mutate: F) -> Result<(), GroupCallError>
    where
        F: FnOnce(Vec<DeviceAdvertisement>) -> Option<Vec<DeviceAdvertisement>>,
    {
        let now = now_ms();
        let user_id = self.client.user_id();

        let content = self
            .room
            .call_member_events()
            .into_iter()
            .find(|event| event.sender == user_id)
            .map(|event| event.content)
            .unwrap_or_default();
        let (ours, others) = content.partition(&self.group_call_id);

        let current = ours
            .as_ref()
            .map(|entry| entry.valid_devices(now))
            .unwrap_or_default();

        let Some(mut devices) = mutate(current) else {
            tracing::debug!(group_call_id = %self.group_call_id, "member state unchanged, skipping write");
            return Ok(());
        };

        let local_device = self.client.device_id();
        for device in &mut devices {
            if device.device_id == local_device {
                device.expires_ts = now + DEVICE_TIMEOUT_MS;
            }
        }

        let mut calls = others;
        if !devices.is_empty() {
            let mut entry = MemberCallEntry {
                call_id: self.group_call_id.clone(),
                foci: ours.and_then(|e| e.foci),
                devices: Vec::new(),
            };
            entry.set_devices(&devices);
            calls.push(entry);
        }

        let content = CallMemberContent { calls };
        let value = serde_json::to_value(&content)
            .map_err(|e| GroupCallError::Internal(format!("member state serialization: {e}")))?;

        tracing::debug!(
            group_call_id = %self.group_call_id,
            devices = devices.len(),
            keep_alive,
            "writing member state"
        );
        self.client
            .send_state_event(
                &self.room.room_id(),
                CALL_MEMBER_EVENT_TYPE,
                value,
                user_id.as_str(),
                keep_alive,
            )
            .await
            .map_err(|cause| GroupCallError::Client { cause })
    }

    /// Publish (or refresh) the local device's advertisement.
    ///
    /// # Errors
    ///
    /// Returns [`GroupCallError::Client`] when the state write fails.
    pub async fn publish_local_device(
        &self,
        feeds: Vec<FeedAdvertisement>,
    ) -> Result<(), GroupCallError> {
        let device_id = self.client.device_id();
        let session_id = self.client.session_id();
        self.update_devices(false, move |mut devices| {
            devices.retain(|d| d.device_id != device_id);
            devices.push(DeviceAdvertisement {
                device_id,
                session_id,
                expires_ts: now_ms() + DEVICE_TIMEOUT_MS,
                feeds,
            });
            Some(devices)
        })
        .await
    }

    /// Remove the local device's advertisement.
    ///
    /// The write is marked keep-alive so it survives process teardown.
    ///
    /// # Errors
    ///
    /// Returns [`GroupCallError::Client`] when the state write fails.
    pub async fn remove_local_device(&self) -> Result<(), GroupCallError> {
        let device_id = self.client.device_id();
        self.update_devices(true, move |mut devices| {
            devices.retain(|d| d.device_id != device_id);
            Some(devices)
        })
        .await
    }

    /// Drop advertisements for devices the identity service does not know,
    /// plus our own when we are not entered anywhere. Skips the write when
    /// nothing would change.
    ///
    /// # Errors
    ///
    /// Returns [`GroupCallError::Client`] when the device query or the state
    /// write fails.
    pub async fn clean(&self, entered: bool) -> Result<(), GroupCallError> {
        let known = self
            .client
            .get_devices()
            .await
            .map_err(|cause| GroupCallError::Client { cause })?;
        let local_device = self.client.device_id();

        self.update_devices(false, move |devices| {
            let filtered: Vec<DeviceAdvertisement> = devices
                .iter()
                .filter(|d| known.contains(&d.device_id))
                .filter(|d| entered || d.device_id != local_device)
                .cloned()
                .collect();
            if filtered == devices {
                None
            } else {
                Some(filtered)
            }
        })
        .await
    }
}
