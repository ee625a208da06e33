//! Per-device evaluation context.
//!
//! One [`Device`] exists per discovered sensor and owns everything the engine
//! keeps between advertisements: the latest decoded value set and one alarm
//! state per alarm. Each received payload drives one tick: decode, replace
//! the value set wholesale, then evaluate every alarm in declaration order.

use std::collections::BTreeMap;

use tracing::warn;

use crate::alarms::{self, Alarm, AlarmState, DeviceContext};
use crate::devices::{DeviceClass, Registry};
use crate::registers::{self, DecodedValues};
use crate::settings::SettingsAccessor;

/// An alarm whose state changed during a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Transition {
    pub alarm: &'static str,
    pub was: bool,
    pub now: bool,
}

pub struct Device {
    id: String,
    class: &'static DeviceClass,
    alarms: Vec<&'static Alarm>,
    values: DecodedValues,
    states: BTreeMap<&'static str, AlarmState>,
}

impl Device {
    /// The registry is only consulted here, to snapshot the evaluation
    /// order; the device does not hold on to it.
    pub fn new(registry: &Registry, class: &'static DeviceClass, mac: &str) -> Self {
        Self {
            id: format!("{}_{}", class.prefix, mac),
            class,
            alarms: registry.alarms_for(class),
            values: DecodedValues::new(),
            states: BTreeMap::new(),
        }
    }

    /// Settings-store key for this device, `<prefix>_<mac>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> &'static DeviceClass {
        self.class
    }

    /// Latest decoded value set. A register missing here had no value in the
    /// most recent advertisement.
    pub fn values(&self) -> &DecodedValues {
        &self.values
    }

    pub fn alarm_state(&self, alarm: &str) -> AlarmState {
        self.states.get(alarm).copied().unwrap_or_default()
    }

    /// Run one decode-then-evaluate tick for a received payload and report
    /// which alarms changed state.
    ///
    /// A settings failure skips that alarm for this tick, keeping its prior
    /// state; the rest of the batch still runs.
    pub fn ingest(&mut self, payload: &[u8], settings: &dyn SettingsAccessor) -> Vec<Transition> {
        self.values = registers::decode(self.class.registers, payload);

        let mut transitions = Vec::new();
        for alarm in &self.alarms {
            let state = self.states.entry(alarm.name).or_default();
            let ctx = DeviceContext { device_id: &self.id, values: &self.values };
            match alarms::evaluate(alarm, *state, &self.values, &ctx, settings) {
                Ok(new_state) => {
                    if new_state.active != state.active {
                        transitions.push(Transition {
                            alarm: alarm.name,
                            was: state.active,
                            now: new_state.active,
                        });
                    }
                    *state = new_state;
                }
                Err(error) => {
                    warn!(
                        message = "alarm evaluation skipped",
                        device = self.id,
                        alarm = alarm.name,
                        error = &error as &dyn std::error::Error,
                    );
                }
            }
        }
        transitions
    }
}
