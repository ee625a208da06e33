//! Read-only seam to the external configuration store.
//!
//! Configurable alarms keep their enable flag and thresholds outside of the
//! process, under paths shaped like
//! `/Settings/Devices/<dev_id>/Alarms/<name>/{Enable,Active,Restore}`. The
//! evaluator only ever reads through [`SettingsAccessor`]; whoever owns the
//! store (and its persistence, change notification and UI) implements the
//! trait. [`MemorySettings`] is the implementation backing the offline replay
//! command and the tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::alarms::Alarm;

/// Which of the two stored thresholds of a configurable alarm to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
pub enum Threshold {
    Active,
    Restore,
}

#[derive(thiserror::Error, Debug)]
#[error("could not read the setting at `{1}`")]
pub struct SettingsError(#[source] pub Box<dyn std::error::Error + Send + Sync>, pub String);

pub fn alarm_path(device_id: &str, alarm_name: &str, leaf: &str) -> String {
    format!("/Settings/Devices/{device_id}/Alarms/{alarm_name}/{leaf}")
}

pub trait SettingsAccessor {
    /// Stored enable flag for a configurable alarm.
    fn alarm_enabled(&self, device_id: &str, alarm: &Alarm) -> Result<bool, SettingsError>;

    /// Stored threshold for a configurable alarm. First use initializes the
    /// path from the descriptor's `{default, min, max}` triple.
    fn alarm_threshold(
        &self,
        device_id: &str,
        alarm: &Alarm,
        which: Threshold,
    ) -> Result<f64, SettingsError>;
}

/// In-memory settings store seeded lazily from descriptor defaults.
///
/// Alarms start out enabled; thresholds materialize on first read, clamped to
/// the descriptor's bounds. The mutex is only here to keep the type `Sync`,
/// nothing in the core contends on it.
pub struct MemorySettings {
    values: Mutex<BTreeMap<String, f64>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self { values: Mutex::new(BTreeMap::new()) }
    }

    pub fn set_enabled(&self, device_id: &str, alarm_name: &str, enabled: bool) {
        let path = alarm_path(device_id, alarm_name, "Enable");
        self.set_raw(path, f64::from(u8::from(enabled)));
    }

    pub fn set_threshold(&self, device_id: &str, alarm_name: &str, which: Threshold, value: f64) {
        let path = alarm_path(device_id, alarm_name, &which.to_string());
        self.set_raw(path, value);
    }

    /// Store a value under a verbatim settings path.
    pub fn set_raw(&self, path: String, value: f64) {
        self.values.lock().expect("settings store poisoned").insert(path, value);
    }

    fn get_or_init(&self, path: String, default: f64) -> f64 {
        *self
            .values
            .lock()
            .expect("settings store poisoned")
            .entry(path)
            .or_insert(default)
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsAccessor for MemorySettings {
    fn alarm_enabled(&self, device_id: &str, alarm: &Alarm) -> Result<bool, SettingsError> {
        let path = alarm_path(device_id, alarm.name, "Enable");
        Ok(self.get_or_init(path, 1.0) != 0.0)
    }

    fn alarm_threshold(
        &self,
        device_id: &str,
        alarm: &Alarm,
        which: Threshold,
    ) -> Result<f64, SettingsError> {
        let range = match which {
            Threshold::Active => alarm.active,
            Threshold::Restore => alarm.restore,
        };
        let path = alarm_path(device_id, alarm.name, &which.to_string());
        let Some(range) = range else {
            return Err(SettingsError(
                format!("alarm `{}` declares no `{which}` bounds", alarm.name).into(),
                path,
            ));
        };
        let value = self.get_or_init(path, range.default);
        Ok(value.clamp(range.min, range.max))
    }
}
