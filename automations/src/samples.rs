//! Canned rule bodies used by tests and demos.

use serde_json::json;

use crate::RuleBody;
use fleet_core::model::TriggerType;

/// Motion sensor event turns on a light.
pub fn motion_light(sensor_uid: &str, light_uid: &str) -> RuleBody {
    RuleBody {
        name: "motion light".into(),
        trigger_type: TriggerType::Event,
        trigger: json!({"deviceId": sensor_uid, "type": "motion"}),
        actions: vec![json!({"deviceId": light_uid, "set": {"power": "on"}})],
        execution_policy: None,
        enabled: true,
    }
}

/// Thermostat follows a temperature reading.
pub fn thermostat_follow(sensor_uid: &str, thermostat_uid: &str, threshold: f64) -> RuleBody {
    RuleBody {
        name: "thermostat follow".into(),
        trigger_type: TriggerType::State,
        trigger: json!({"deviceId": sensor_uid, "path": "/temperature", "below": threshold}),
        actions: vec![json!({"deviceId": thermostat_uid, "set": {"mode": "heat"}})],
        execution_policy: Some(json!({"cooldownSeconds": 300})),
        enabled: true,
    }
}
