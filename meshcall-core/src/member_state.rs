//! Wire schemas for the room-state documents the coordinator reads and
//! writes: per-member device advertisements and the group-call state event.
//!
//! Field names are wire-visible and fixed; unknown keys of the group-call
//! event are preserved verbatim across rewrites.

use crate::types::{
    DataChannelOptions, DeviceId, GroupCallId, GroupCallIntent, GroupCallTerminationReason,
    GroupCallType, SessionId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// State event type carrying per-member device advertisements.
pub const CALL_MEMBER_EVENT_TYPE: &str = "org.matrix.msc3401.call.member";

/// State event type declaring the group call itself.
pub const GROUP_CALL_EVENT_TYPE: &str = "org.matrix.msc3401.call";

/// Purpose of an advertised feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedPurpose {
    /// Microphone/camera media.
    #[serde(rename = "m.usermedia")]
    UserMedia,
    /// A shared screen.
    #[serde(rename = "m.screenshare")]
    Screenshare,
}

/// One advertised feed of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedAdvertisement {
    /// What the feed carries.
    pub purpose: FeedPurpose,
}

/// The record a device writes into room state to declare its presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAdvertisement {
    /// The advertising device.
    pub device_id: DeviceId,
    /// The coordinator session running on that device.
    pub session_id: SessionId,
    /// Absolute millisecond timestamp after which the entry is stale.
    pub expires_ts: i64,
    /// The feeds the device is offering.
    pub feeds: Vec<FeedAdvertisement>,
}

impl DeviceAdvertisement {
    /// Whether the advertisement has lapsed at the given wall-clock time.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_ts <= now
    }

    /// Whether the device advertises a screen-share feed.
    #[must_use]
    pub fn is_screensharing(&self) -> bool {
        self.feeds
            .iter()
            .any(|f| f.purpose == FeedPurpose::Screenshare)
    }
}

/// Structurally validate one raw device entry.
///
/// All four fields must be present with their wire types and the entry must
/// not have expired; anything else is discarded. Malformed entries are a
/// normal occurrence in an eventually-consistent room, not an error.
#[must_use]
pub fn validate_device(value: &Value, now: i64) -> Option<DeviceAdvertisement> {
    let ad: DeviceAdvertisement = serde_json::from_value(value.clone()).ok()?;
    if ad.is_expired(now) {
        return None;
    }
    Some(ad)
}

/// One member's entry for a single group call.
///
/// Devices are kept raw on the read path so that one malformed device does
/// not invalidate its siblings; [`MemberCallEntry::valid_devices`] applies
/// the validation predicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberCallEntry {
    /// The group call the entry belongs to.
    #[serde(rename = "m.call_id")]
    pub call_id: GroupCallId,
    /// Foci the member prefers, passed through untouched.
    #[serde(rename = "m.foci", default, skip_serializing_if = "Option::is_none")]
    pub foci: Option<Vec<String>>,
    /// Raw advertised devices.
    #[serde(rename = "m.devices", default)]
    pub devices: Vec<Value>,
}

impl MemberCallEntry {
    /// The structurally valid, unexpired devices of this entry.
    #[must_use]
    pub fn valid_devices(&self, now: i64) -> Vec<DeviceAdvertisement> {
        self.devices
            .iter()
            .filter_map(|v| validate_device(v, now))
            .collect()
    }

    /// Replace the device list with typed advertisements.
    pub fn set_devices(&mut self, devices: &[DeviceAdvertisement]) {
        self.devices = devices
            .iter()
            .filter_map(|d| serde_json::to_value(d).ok())
            .collect();
    }
}

/// Content of a member-state event: all calls the member participates in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallMemberContent {
    /// One entry per group call.
    #[serde(rename = "m.calls", default)]
    pub calls: Vec<MemberCallEntry>,
}

impl CallMemberContent {
    /// The entry for the given group call, if present.
    #[must_use]
    pub fn entry(&self, call_id: &GroupCallId) -> Option<&MemberCallEntry> {
        self.calls.iter().find(|e| &e.call_id == call_id)
    }

    /// Split into (our entry, every other entry preserved verbatim).
    #[must_use]
    pub fn partition(self, call_id: &GroupCallId) -> (Option<MemberCallEntry>, Vec<MemberCallEntry>) {
        let mut ours = None;
        let mut others = Vec::with_capacity(self.calls.len());
        for entry in self.calls {
            if &entry.call_id == call_id && ours.is_none() {
                ours = Some(entry);
            } else {
                others.push(entry);
            }
        }
        (ours, others)
    }
}

/// Content of the group-call state event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCallContent {
    /// How clients should surface the call.
    #[serde(rename = "m.intent")]
    pub intent: GroupCallIntent,
    /// Media profile of the call.
    #[serde(rename = "m.type")]
    pub call_type: GroupCallType,
    /// Push-to-talk mode.
    #[serde(rename = "io.element.ptt", default)]
    pub ptt: bool,
    /// Whether participants open data channels.
    #[serde(rename = "dataChannelsEnabled", default)]
    pub data_channels_enabled: bool,
    /// Data channel configuration.
    #[serde(
        rename = "dataChannelOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data_channel_options: Option<DataChannelOptions>,
    /// Set when the call has been terminated for everyone.
    #[serde(rename = "m.terminated", default, skip_serializing_if = "Option::is_none")]
    pub terminated: Option<GroupCallTerminationReason>,
    /// Keys this coordinator does not interpret, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device_json(device: &str, session: &str, expires: i64) -> Value {
        json!({
            "device_id": device,
            "session_id": session,
            "expires_ts": expires,
            "feeds": [{ "purpose": "m.usermedia" }],
        })
    }

    #[test]
    fn validation_accepts_well_formed_unexpired_devices() {
        let now = 1_000;
        let ad = validate_device(&device_json("DB", "s1", now + 60_000), now).unwrap();
        assert_eq!(ad.device_id, DeviceId::new("DB"));
        assert_eq!(ad.session_id, SessionId::new("s1"));
        assert!(!ad.is_screensharing());
    }

    #[test]
    fn validation_rejects_expired_and_malformed_devices() {
        let now = 1_000;
        assert!(validate_device(&device_json("DB", "s1", now), now).is_none());
        assert!(validate_device(&device_json("DB", "s1", now - 1), now).is_none());

        // Missing session_id.
        let bad = json!({ "device_id": "DB", "expires_ts": now + 1, "feeds": [] });
        assert!(validate_device(&bad, now).is_none());

        // feeds is not a sequence.
        let bad = json!({
            "device_id": "DB",
            "session_id": "s1",
            "expires_ts": now + 1,
            "feeds": "m.usermedia",
        });
        assert!(validate_device(&bad, now).is_none());

        // expires_ts is not an integer.
        let bad = json!({
            "device_id": "DB",
            "session_id": "s1",
            "expires_ts": "soon",
            "feeds": [],
        });
        assert!(validate_device(&bad, now).is_none());
    }

    #[test]
    fn one_bad_device_does_not_poison_the_entry() {
        let now = 1_000;
        let entry: MemberCallEntry = serde_json::from_value(json!({
            "m.call_id": "G",
            "m.devices": [
                device_json("DA", "s1", now + 10_000),
                { "device_id": 42 },
                device_json("DB", "s2", now + 20_000),
            ],
        }))
        .unwrap();

        let valid = entry.valid_devices(now);
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].device_id, DeviceId::new("DA"));
        assert_eq!(valid[1].device_id, DeviceId::new("DB"));
    }

    #[test]
    fn partition_preserves_other_entries() {
        let content: CallMemberContent = serde_json::from_value(json!({
            "m.calls": [
                { "m.call_id": "G", "m.devices": [] },
                { "m.call_id": "H", "m.foci": ["focus.example"], "m.devices": [] },
            ],
        }))
        .unwrap();

        let (ours, others) = content.partition(&GroupCallId::new("G"));
        assert_eq!(ours.unwrap().call_id, GroupCallId::new("G"));
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].call_id, GroupCallId::new("H"));
        assert_eq!(others[0].foci, Some(vec!["focus.example".to_string()]));
    }

    #[test]
    fn group_call_content_preserves_unknown_keys() {
        let json = json!({
            "m.intent": "m.room",
            "m.type": "m.voice",
            "io.element.ptt": true,
            "org.example.widget": { "w": 1 },
        });
        let mut content: GroupCallContent = serde_json::from_value(json).unwrap();
        content.terminated = Some(GroupCallTerminationReason::CallEnded);

        let out = serde_json::to_value(&content).unwrap();
        assert_eq!(out["m.terminated"], "call_ended");
        assert_eq!(out["org.example.widget"]["w"], 1);
        assert_eq!(out["m.intent"], "m.room");
    }

    #[test]
    fn set_devices_round_trips_through_validation() {
        let mut entry = MemberCallEntry {
            call_id: GroupCallId::new("G"),
            ..Default::default()
        };
        let ad = DeviceAdvertisement {
            device_id: DeviceId::new("DA"),
            session_id: SessionId::new("s1"),
            expires_ts: 500_000,
            feeds: vec![FeedAdvertisement { purpose: FeedPurpose::Screenshare }],
        };
        entry.set_devices(std::slice::from_ref(&ad));

        let valid = entry.valid_devices(0);
        assert_eq!(valid, vec![ad.clone()]);
        assert!(ad.is_screensharing());
    }
}
