//! The MQTT wire contract: topic layout, semantic channels and canonical
//! payloads. The topic scheme is server-owned; devices never pick their own
//! topics. Everything here is bit-exact; changing a literal breaks the fleet.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::model::HomeId;

/// Subscription patterns the transport installs at process start.
pub const SUBSCRIPTIONS: &[&str] = &[
    "home/+/device/+/ack",
    "home/+/device/+/state",
    "home/+/device/+/status",
    "home/hub/+/status",
    "home/hub/+/ack",
    "home/zb/+/state",
    "home/zb/+/event",
    "home/zb/+/cmd_result",
    "home/hub/+/zigbee/discovered",
];

pub fn device_set_topic(home_id: HomeId, device_uid: &str) -> String {
    format!("home/{}/device/{}/set", home_id.0, device_uid)
}

pub fn device_ack_topic(home_id: HomeId, device_uid: &str) -> String {
    format!("home/{}/device/{}/ack", home_id.0, device_uid)
}

pub fn device_state_topic(home_id: HomeId, device_uid: &str) -> String {
    format!("home/{}/device/{}/state", home_id.0, device_uid)
}

pub fn device_status_topic(home_id: HomeId, device_uid: &str) -> String {
    format!("home/{}/device/{}/status", home_id.0, device_uid)
}

pub fn hub_status_topic(hub_id: &str) -> String {
    format!("home/hub/{hub_id}/status")
}

pub fn hub_set_topic(hub_id: &str) -> String {
    format!("home/hub/{hub_id}/set")
}

pub fn zb_set_topic(ieee: &str) -> String {
    format!("home/zb/{ieee}/set")
}

pub fn hub_discovered_topic(hub_id: &str) -> String {
    format!("home/hub/{hub_id}/zigbee/discovered")
}

/// A parsed inbound topic, routed to the consumer that owns the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    DeviceAck { home_id: HomeId, device_uid: String },
    DeviceState { home_id: HomeId, device_uid: String },
    DeviceStatus { home_id: HomeId, device_uid: String },
    HubStatus { hub_id: String },
    HubAck { hub_id: String },
    ZbState { ieee: String },
    ZbEvent { ieee: String },
    ZbCmdResult { ieee: String },
    ZbDiscovered { hub_id: String },
}

impl Channel {
    /// Maps a literal topic to its semantic channel. Unknown topics return
    /// None and are dropped by the caller.
    pub fn parse(topic: &str) -> Option<Channel> {
        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            ["home", "hub", hub_id, "status"] => {
                Some(Channel::HubStatus { hub_id: (*hub_id).to_string() })
            }
            ["home", "hub", hub_id, "ack"] => {
                Some(Channel::HubAck { hub_id: (*hub_id).to_string() })
            }
            ["home", "hub", hub_id, "zigbee", "discovered"] => {
                Some(Channel::ZbDiscovered { hub_id: (*hub_id).to_string() })
            }
            ["home", "zb", ieee, tail] => {
                let ieee = (*ieee).to_string();
                match *tail {
                    "state" => Some(Channel::ZbState { ieee }),
                    "event" => Some(Channel::ZbEvent { ieee }),
                    "cmd_result" => Some(Channel::ZbCmdResult { ieee }),
                    _ => None,
                }
            }
            ["home", home, "device", device_uid, tail] => {
                let home_id = HomeId(home.parse().ok()?);
                let device_uid = (*device_uid).to_string();
                match *tail {
                    "ack" => Some(Channel::DeviceAck { home_id, device_uid }),
                    "state" => Some(Channel::DeviceState { home_id, device_uid }),
                    "status" => Some(Channel::DeviceStatus { home_id, device_uid }),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

fn epoch_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Command envelope for the MQTT plane: `{"cmdId","ts","payload"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandMsg {
    #[serde(rename = "cmdId")]
    pub cmd_id: String,
    pub ts: i64,
    pub payload: serde_json::Value,
}

/// Command envelope for the Zigbee plane: `{"cmdId","ts","action","args"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZbCommandMsg {
    #[serde(rename = "cmdId")]
    pub cmd_id: String,
    pub ts: i64,
    pub action: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckMsg {
    #[serde(rename = "cmdId")]
    pub cmd_id: String,
    pub ok: bool,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Hubs report the rule-set version they installed in rules_sync ACKs.
    #[serde(rename = "applied_version", skip_serializing_if = "Option::is_none")]
    pub applied_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateMsg {
    pub ts: i64,
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusMsg {
    pub ts: i64,
    pub online: bool,
    /// Hubs include their firmware version in status reports; devices omit it.
    #[serde(rename = "fwVersion", skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
}

/// Fingerprint a hub reports for a joining Zigbee device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredMsg {
    pub ieee: String,
    #[serde(rename = "shortAddr", skip_serializing_if = "Option::is_none")]
    pub short_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(rename = "swBuildId", skip_serializing_if = "Option::is_none")]
    pub sw_build_id: Option<String>,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZbEventMsg {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEventMsg {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub ts: i64,
}

impl CommandMsg {
    pub fn new(cmd_id: &str, sent_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self { cmd_id: cmd_id.to_string(), ts: epoch_ms(sent_at), payload }
    }
}

impl ZbCommandMsg {
    pub fn new(
        cmd_id: &str,
        sent_at: DateTime<Utc>,
        action: String,
        args: serde_json::Value,
    ) -> Self {
        Self { cmd_id: cmd_id.to_string(), ts: epoch_ms(sent_at), action, args }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topics_are_bit_exact() {
        assert_eq!(device_set_topic(HomeId(1), "d1"), "home/1/device/d1/set");
        assert_eq!(device_ack_topic(HomeId(1), "d1"), "home/1/device/d1/ack");
        assert_eq!(device_state_topic(HomeId(42), "abc"), "home/42/device/abc/state");
        assert_eq!(device_status_topic(HomeId(42), "abc"), "home/42/device/abc/status");
        assert_eq!(hub_status_topic("h7"), "home/hub/h7/status");
        assert_eq!(hub_set_topic("h7"), "home/hub/h7/set");
        assert_eq!(zb_set_topic("00124b0001abcd12"), "home/zb/00124b0001abcd12/set");
        assert_eq!(hub_discovered_topic("h7"), "home/hub/h7/zigbee/discovered");
    }

    #[test]
    fn parses_device_channels() {
        assert_eq!(
            Channel::parse("home/1/device/d1/ack"),
            Some(Channel::DeviceAck { home_id: HomeId(1), device_uid: "d1".into() })
        );
        assert_eq!(
            Channel::parse("home/9/device/xyz/state"),
            Some(Channel::DeviceState { home_id: HomeId(9), device_uid: "xyz".into() })
        );
        assert_eq!(
            Channel::parse("home/9/device/xyz/status"),
            Some(Channel::DeviceStatus { home_id: HomeId(9), device_uid: "xyz".into() })
        );
    }

    #[test]
    fn parses_hub_and_zigbee_channels() {
        assert_eq!(
            Channel::parse("home/hub/h1/status"),
            Some(Channel::HubStatus { hub_id: "h1".into() })
        );
        assert_eq!(Channel::parse("home/hub/h1/ack"), Some(Channel::HubAck { hub_id: "h1".into() }));
        assert_eq!(
            Channel::parse("home/zb/00124b0001abcd12/cmd_result"),
            Some(Channel::ZbCmdResult { ieee: "00124b0001abcd12".into() })
        );
        assert_eq!(
            Channel::parse("home/hub/h1/zigbee/discovered"),
            Some(Channel::ZbDiscovered { hub_id: "h1".into() })
        );
    }

    #[test]
    fn rejects_unknown_topics() {
        assert_eq!(Channel::parse("home/1/device/d1/set"), None); // outbound only
        assert_eq!(Channel::parse("home/notanumber/device/d1/ack"), None);
        assert_eq!(Channel::parse("foo/bar"), None);
        assert_eq!(Channel::parse("home/zb/ieee/unknown"), None);
    }

    #[test]
    fn command_payload_shape() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let msg = CommandMsg::new("C1", ts, json!({"relay": true}));
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            encoded,
            json!({"cmdId": "C1", "ts": 1_700_000_000_000_i64, "payload": {"relay": true}})
        );
    }

    #[test]
    fn zb_command_payload_shape() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let msg = ZbCommandMsg::new("C2", ts, "gate.open".into(), json!({"source": "mobile"}));
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            encoded,
            json!({
                "cmdId": "C2",
                "ts": 1_700_000_000_000_i64,
                "action": "gate.open",
                "args": {"source": "mobile"}
            })
        );
    }

    #[test]
    fn ack_decodes_with_and_without_error() {
        let ack: AckMsg =
            serde_json::from_value(json!({"cmdId": "C1", "ok": true, "ts": 5})).unwrap();
        assert!(ack.ok);
        assert_eq!(ack.error, None);

        let nack: AckMsg = serde_json::from_value(
            json!({"cmdId": "C1", "ok": false, "ts": 5, "error": "unsupported"}),
        )
        .unwrap();
        assert!(!nack.ok);
        assert_eq!(nack.error.as_deref(), Some("unsupported"));
    }
}
