//! Threshold alarms with hysteresis over decoded sensor values.
//!
//! An [`Alarm`] watches one decoded register and compares it against a level
//! every tick. The level comes from one of three places: a fixed value baked
//! into the descriptor, a [`LevelFn`] computed from the device context, or --
//! for configurable alarms -- the externally stored settings. Alarms are
//! level-crossing comparators, not edge triggers: the verdict is recomputed
//! from scratch on every sample, and oscillation at the boundary is prevented
//! purely by the hysteresis band.

use crate::registers::{DecodedValues, Value};
use crate::settings::{SettingsAccessor, SettingsError, Threshold};

/// `{default, min, max}` bounds for an externally stored threshold.
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct SettingRange {
    pub default: f64,
    pub min: f64,
    pub max: f64,
}

impl SettingRange {
    pub const fn new(default: f64, min: f64, max: f64) -> Self {
        Self { default, min, max }
    }
}

/// Computed threshold strategies, one variant per function the device tables
/// refer to. Resolved at definition time; no name lookup happens per tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
pub enum LevelFn {
    /// Battery chemistry sags in the cold, so the low-battery cutoff for a
    /// Ruuvi tag follows its own temperature reading: 2.0 V below -20 degC,
    /// 2.3 V below freezing, 2.5 V otherwise.
    RuuviLowBattery,
}

impl LevelFn {
    pub fn level(self, ctx: &DeviceContext<'_>) -> f64 {
        match self {
            LevelFn::RuuviLowBattery => {
                match ctx.values.get("Temperature").map(Value::as_f64) {
                    Some(t) if t < -20.0 => 2.0,
                    Some(t) if t < 0.0 => 2.3,
                    _ => 2.5,
                }
            }
        }
    }
}

/// Declarative alarm description, defined once per device type or role.
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct Alarm {
    pub name: &'static str,
    /// Name of the decoded register this alarm watches.
    pub item: &'static str,
    /// Thresholds and the enable flag live in external settings.
    pub configurable: bool,
    /// Fire when the sample exceeds the level rather than falls below it.
    pub triggers_high: bool,
    pub level: Option<f64>,
    pub level_fn: Option<LevelFn>,
    /// Margin widening the band once active, so a static alarm does not
    /// chatter right at its threshold.
    pub hysteresis: f64,
    pub active: Option<SettingRange>,
    pub restore: Option<SettingRange>,
}

impl Alarm {
    pub const fn new(name: &'static str, item: &'static str) -> Self {
        Self {
            name,
            item,
            configurable: false,
            triggers_high: false,
            level: None,
            level_fn: None,
            hysteresis: 0.0,
            active: None,
            restore: None,
        }
    }

    pub const fn triggers_high(mut self) -> Self {
        self.triggers_high = true;
        self
    }

    pub const fn configurable(mut self, active: SettingRange, restore: SettingRange) -> Self {
        self.configurable = true;
        self.active = Some(active);
        self.restore = Some(restore);
        self
    }

    pub const fn level(mut self, level: f64) -> Self {
        self.level = Some(level);
        self
    }

    pub const fn level_fn(mut self, level_fn: LevelFn) -> Self {
        self.level_fn = Some(level_fn);
        self
    }

    pub const fn hysteresis(mut self, hysteresis: f64) -> Self {
        self.hysteresis = hysteresis;
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AlarmError {
    #[error("alarm `{0}` is not configurable and sets neither a level nor a level function")]
    NoLevel(&'static str),
    #[error("alarm `{0}` sets both a fixed level and a level function")]
    ConflictingLevel(&'static str),
    #[error("alarm `{0}` is configurable but does not bound its `{1}` threshold")]
    MissingRange(&'static str, Threshold),
    #[error("alarm `{0}` has a malformed `{1}` range (min {2}, default {3}, max {4})")]
    MalformedRange(&'static str, Threshold, f64, f64, f64),
    #[error("alarm name `{0}` is declared more than once")]
    DuplicateName(&'static str),
}

/// Reject malformed alarm tables at registration time.
pub fn validate(alarms: &[Alarm]) -> Result<(), AlarmError> {
    let mut names = std::collections::BTreeSet::new();
    for alarm in alarms {
        if !names.insert(alarm.name) {
            return Err(AlarmError::DuplicateName(alarm.name));
        }
        if alarm.level.is_some() && alarm.level_fn.is_some() {
            return Err(AlarmError::ConflictingLevel(alarm.name));
        }
        if alarm.configurable {
            for (which, range) in [
                (Threshold::Active, alarm.active),
                (Threshold::Restore, alarm.restore),
            ] {
                let Some(range) = range else {
                    return Err(AlarmError::MissingRange(alarm.name, which));
                };
                if !(range.min <= range.default && range.default <= range.max) {
                    return Err(AlarmError::MalformedRange(
                        alarm.name,
                        which,
                        range.min,
                        range.default,
                        range.max,
                    ));
                }
            }
        } else if alarm.level.is_none() && alarm.level_fn.is_none() {
            return Err(AlarmError::NoLevel(alarm.name));
        }
    }
    Ok(())
}

/// Per-device, per-alarm evaluation state. Lives as long as the device does
/// and is only ever written by [`evaluate`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AlarmState {
    pub enabled: bool,
    pub active: bool,
}

/// Device-scoped inputs available to computed levels: the identity the
/// settings store keys on and the latest decoded values.
pub struct DeviceContext<'a> {
    pub device_id: &'a str,
    pub values: &'a DecodedValues,
}

/// Run one alarm for one tick and return its next state.
///
/// Pure with respect to its inputs; the only side effects happen inside the
/// settings accessor. An accessor failure leaves the caller free to keep the
/// previous state, so a transient settings outage never corrupts an alarm.
pub fn evaluate(
    alarm: &Alarm,
    state: AlarmState,
    values: &DecodedValues,
    ctx: &DeviceContext<'_>,
    settings: &dyn SettingsAccessor,
) -> Result<AlarmState, SettingsError> {
    let enabled = if alarm.configurable {
        settings.alarm_enabled(ctx.device_id, alarm)?
    } else {
        true
    };
    // A disabled alarm is frozen, not cleared: its last verdict sticks until
    // it is enabled again.
    if !enabled {
        return Ok(AlarmState { enabled: false, active: state.active });
    }

    let was_active = state.active;
    let level = if alarm.configurable {
        // Two stored thresholds: the trigger one while inactive, the restore
        // one while active. The gap between them is the hysteresis band.
        let which = if was_active { Threshold::Restore } else { Threshold::Active };
        settings.alarm_threshold(ctx.device_id, alarm, which)?
    } else {
        let base = match (alarm.level_fn, alarm.level) {
            (Some(level_fn), _) => level_fn.level(ctx),
            (None, Some(level)) => level,
            // Rejected by validate(); freeze rather than guess a level.
            (None, None) => return Ok(AlarmState { enabled, active: was_active }),
        };
        if was_active {
            // Widen the band on the clearing side.
            if alarm.triggers_high {
                base - alarm.hysteresis
            } else {
                base + alarm.hysteresis
            }
        } else {
            base
        }
    };

    // No sample, no verdict.
    let Some(sample) = values.get(alarm.item).map(Value::as_f64) else {
        return Ok(AlarmState { enabled, active: was_active });
    };

    let active = if alarm.triggers_high { sample > level } else { sample < level };
    Ok(AlarmState { enabled, active })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;

    fn tick(alarm: &Alarm, state: AlarmState, sample: Option<f64>) -> AlarmState {
        tick_with(alarm, state, sample, &MemorySettings::new())
    }

    fn tick_with(
        alarm: &Alarm,
        state: AlarmState,
        sample: Option<f64>,
        settings: &MemorySettings,
    ) -> AlarmState {
        let mut values = DecodedValues::new();
        if let Some(sample) = sample {
            values.insert(alarm.item, Value::Float(sample));
        }
        let ctx = DeviceContext { device_id: "test_c0ffee", values: &values };
        evaluate(alarm, state, &values, &ctx, settings).unwrap()
    }

    #[test]
    fn static_high_alarm_hysteresis_sequence() {
        // level 50, hysteresis 4: 51 -> active, 48 -> still active (48 > 46),
        // 42 -> cleared (42 < 46).
        let alarm = Alarm::new("High", "Level").triggers_high().level(50.0).hysteresis(4.0);
        let mut state = AlarmState::default();
        state = tick(&alarm, state, Some(51.0));
        assert!(state.active && state.enabled);
        state = tick(&alarm, state, Some(48.0));
        assert!(state.active);
        state = tick(&alarm, state, Some(42.0));
        assert!(!state.active);
    }

    #[test]
    fn static_low_alarm_hysteresis_sequence() {
        // LowBattery at 3.2 V with 0.4 V hysteresis: clears only above 3.6 V.
        let alarm = Alarm::new("LowBattery", "BatteryVoltage").level(3.2).hysteresis(0.4);
        let mut state = AlarmState::default();
        state = tick(&alarm, state, Some(3.3));
        assert!(!state.active);
        state = tick(&alarm, state, Some(3.1));
        assert!(state.active);
        state = tick(&alarm, state, Some(3.4));
        assert!(state.active, "3.4 is inside the band, must not clear");
        state = tick(&alarm, state, Some(3.7));
        assert!(!state.active);
    }

    #[test]
    fn exact_level_does_not_trigger() {
        // Strict comparison: equality on either side is not a crossing.
        let high = Alarm::new("High", "Level").triggers_high().level(50.0);
        assert!(!tick(&high, AlarmState::default(), Some(50.0)).active);
        let low = Alarm::new("Low", "Level").level(50.0);
        assert!(!tick(&low, AlarmState::default(), Some(50.0)).active);
    }

    #[test]
    fn missing_sample_freezes_state() {
        let alarm = Alarm::new("High", "Level").triggers_high().level(50.0);
        let active = AlarmState { enabled: true, active: true };
        assert_eq!(tick(&alarm, active, None), active);
        let inactive = AlarmState { enabled: true, active: false };
        assert_eq!(tick(&alarm, inactive, None), inactive);
    }

    #[test]
    fn configurable_low_alarm_uses_restore_threshold_while_active() {
        // Stored thresholds: active 10, restore 15. Samples 20, 8, 12 must
        // evaluate to inactive, active, active (12 < 15).
        let alarm = Alarm::new("Low", "Level").configurable(
            SettingRange::new(10.0, 0.0, 100.0),
            SettingRange::new(15.0, 0.0, 100.0),
        );
        let settings = MemorySettings::new();
        let mut state = AlarmState::default();
        state = tick_with(&alarm, state, Some(20.0), &settings);
        assert!(!state.active);
        state = tick_with(&alarm, state, Some(8.0), &settings);
        assert!(state.active);
        state = tick_with(&alarm, state, Some(12.0), &settings);
        assert!(state.active, "12 < restore threshold 15, must stay active");
        state = tick_with(&alarm, state, Some(16.0), &settings);
        assert!(!state.active);
    }

    #[test]
    fn configurable_high_alarm_two_thresholds() {
        // Tank High: active 90, restore 80.
        let alarm = Alarm::new("High", "Level").triggers_high().configurable(
            SettingRange::new(90.0, 0.0, 100.0),
            SettingRange::new(80.0, 0.0, 100.0),
        );
        let settings = MemorySettings::new();
        let mut state = AlarmState::default();
        state = tick_with(&alarm, state, Some(85.0), &settings);
        assert!(!state.active, "85 < active threshold 90");
        state = tick_with(&alarm, state, Some(91.0), &settings);
        assert!(state.active);
        state = tick_with(&alarm, state, Some(85.0), &settings);
        assert!(state.active, "85 > restore threshold 80, must stay active");
        state = tick_with(&alarm, state, Some(79.0), &settings);
        assert!(!state.active);
    }

    #[test]
    fn disabled_alarm_is_frozen_not_reset() {
        let alarm = Alarm::new("Low", "Level").configurable(
            SettingRange::new(10.0, 0.0, 100.0),
            SettingRange::new(15.0, 0.0, 100.0),
        );
        let settings = MemorySettings::new();
        let mut state = tick_with(&alarm, AlarmState::default(), Some(5.0), &settings);
        assert!(state.active);

        settings.set_enabled("test_c0ffee", "Low", false);
        state = tick_with(&alarm, state, Some(50.0), &settings);
        assert!(!state.enabled);
        assert!(state.active, "disabled alarm must keep its prior verdict");

        settings.set_enabled("test_c0ffee", "Low", true);
        state = tick_with(&alarm, state, Some(50.0), &settings);
        assert!(state.enabled);
        assert!(!state.active);
    }

    #[test]
    fn computed_level_follows_device_context() {
        let alarm = Alarm::new("LowBattery", "BatteryVoltage")
            .level_fn(LevelFn::RuuviLowBattery)
            .hysteresis(0.4);
        let settings = MemorySettings::new();

        let mut values = DecodedValues::new();
        values.insert("BatteryVoltage", Value::Float(2.4));
        values.insert("Temperature", Value::Float(21.0));
        let ctx = DeviceContext { device_id: "ruuvi_c0ffee", values: &values };
        let state = evaluate(&alarm, AlarmState::default(), &values, &ctx, &settings).unwrap();
        assert!(state.active, "2.4 V is low at room temperature");

        // The same voltage is fine in a freezer, where the threshold drops.
        let mut values = DecodedValues::new();
        values.insert("BatteryVoltage", Value::Float(2.4));
        values.insert("Temperature", Value::Float(-25.0));
        let ctx = DeviceContext { device_id: "ruuvi_c0ffee", values: &values };
        let state = evaluate(&alarm, AlarmState::default(), &values, &ctx, &settings).unwrap();
        assert!(!state.active, "threshold is 2.0 V below -20 degC");
    }

    #[test]
    fn overridden_thresholds_take_effect() {
        let alarm = Alarm::new("Low", "Level").configurable(
            SettingRange::new(10.0, 0.0, 100.0),
            SettingRange::new(15.0, 0.0, 100.0),
        );
        let settings = MemorySettings::new();
        settings.set_threshold("test_c0ffee", "Low", Threshold::Active, 30.0);
        let state = tick_with(&alarm, AlarmState::default(), Some(25.0), &settings);
        assert!(state.active, "25 < overridden active threshold 30");
    }

    #[test]
    fn bool_sample_compares_as_number() {
        let alarm = Alarm::new("Moving", "MovementState").triggers_high().level(0.5);
        let mut values = DecodedValues::new();
        values.insert("MovementState", Value::Bool(true));
        let ctx = DeviceContext { device_id: "test_c0ffee", values: &values };
        let state = evaluate(
            &alarm,
            AlarmState::default(),
            &values,
            &ctx,
            &MemorySettings::new(),
        )
        .unwrap();
        assert!(state.active);
    }

    #[test]
    fn validation_catches_malformed_alarms() {
        let nolevel = [Alarm::new("x", "Level")];
        assert!(matches!(validate(&nolevel), Err(AlarmError::NoLevel("x"))));

        let conflict = [Alarm::new("x", "BatteryVoltage")
            .level(3.2)
            .level_fn(LevelFn::RuuviLowBattery)];
        assert!(matches!(validate(&conflict), Err(AlarmError::ConflictingLevel("x"))));

        let backwards = [Alarm::new("x", "Level").configurable(
            SettingRange::new(10.0, 20.0, 100.0),
            SettingRange::new(15.0, 0.0, 100.0),
        )];
        assert!(matches!(
            validate(&backwards),
            Err(AlarmError::MalformedRange("x", Threshold::Active, ..))
        ));

        let dup = [
            Alarm::new("x", "Level").level(1.0),
            Alarm::new("x", "Level").level(2.0),
        ];
        assert!(matches!(validate(&dup), Err(AlarmError::DuplicateName("x"))));

        let fine = [
            Alarm::new("High", "Level").triggers_high().configurable(
                SettingRange::new(90.0, 0.0, 100.0),
                SettingRange::new(80.0, 0.0, 100.0),
            ),
            Alarm::new("LowBattery", "BatteryVoltage").level(3.2).hysteresis(0.4),
        ];
        assert!(validate(&fine).is_ok());
    }
}
