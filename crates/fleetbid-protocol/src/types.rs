use serde::{Deserialize, Serialize};

use crate::constants::{OVERLOAD_BATTERY_THRESHOLD, OVERLOAD_CPU_THRESHOLD, UNKNOWN_CPU_LOAD};

/// Live load snapshot a device reports in `register` and `status` messages.
///
/// Devices attach extra keys (model availability flags and the like); those
/// are kept verbatim in `extra` so they survive a re-encode.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// CPU load fraction in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_load: Option<f64>,
    /// Battery percentage in [0, 100]. Devices without a readable battery
    /// report a negative value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DeviceMetrics {
    pub fn new(cpu_load: f64, battery: f64) -> Self {
        Self {
            cpu_load: Some(cpu_load),
            battery: Some(battery),
            ..Default::default()
        }
    }

    /// Overloaded devices are busy (cpu_load above 0.8) or nearly flat
    /// (battery under 20%). Missing readings never count against a device.
    pub fn is_overloaded(&self) -> bool {
        let cpu = self.cpu_load.unwrap_or(0.0);
        let battery = self.battery.unwrap_or(100.0);
        cpu > OVERLOAD_CPU_THRESHOLD || (battery >= 0.0 && battery < OVERLOAD_BATTERY_THRESHOLD)
    }
}

/// A device's self-reported snapshot submitted in answer to a bid request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub cpu_load: f64,
    #[serde(default)]
    pub battery: f64,
    #[serde(default, alias = "hasNpu")]
    pub has_npu: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<serde_json::Value>,
    /// Unix seconds at which the device sampled its metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Bid {
    pub fn new(cpu_load: f64, battery: f64, has_npu: bool) -> Self {
        Self {
            cpu_load,
            battery,
            has_npu,
            ram: None,
            storage: None,
            timestamp: None,
        }
    }

    /// CPU load used for ranking. Non-finite readings rank last.
    pub fn effective_cpu_load(&self) -> f64 {
        if self.cpu_load.is_finite() {
            self.cpu_load
        } else {
            UNKNOWN_CPU_LOAD
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_thresholds() {
        assert!(!DeviceMetrics::new(0.8, 20.0).is_overloaded());
        assert!(DeviceMetrics::new(0.81, 90.0).is_overloaded());
        assert!(DeviceMetrics::new(0.1, 19.0).is_overloaded());
        assert!(!DeviceMetrics::default().is_overloaded());
    }

    #[test]
    fn unreadable_battery_is_not_overload() {
        assert!(!DeviceMetrics::new(0.2, -1.0).is_overloaded());
    }

    #[test]
    fn metrics_keep_unknown_keys() {
        let metrics: DeviceMetrics = serde_json::from_value(serde_json::json!({
            "cpu_load": 0.3,
            "battery": 85,
            "image_model_free": true
        }))
        .unwrap();
        assert_eq!(metrics.cpu_load, Some(0.3));
        assert_eq!(metrics.battery, Some(85.0));
        assert_eq!(metrics.extra.get("image_model_free"), Some(&serde_json::json!(true)));

        let back = serde_json::to_value(&metrics).unwrap();
        assert_eq!(back["image_model_free"], serde_json::json!(true));
    }
}
