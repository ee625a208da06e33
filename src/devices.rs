//! Built-in device definitions and the lookup tables tying them together.
//!
//! A [`DeviceClass`] is everything known statically about one family of
//! sensors: which manufacturer id announces it, how its advertising payload
//! is laid out ([`crate::registers::Register`] table) and which alarms it
//! raises. A [`Role`] groups the settings and alarms every device serving
//! that function shares (a tank level sender has High/Low level alarms no
//! matter who built it). The [`Registry`] indexes both and validates every
//! table once, at construction, so a bad definition fails at startup instead
//! of silently mis-decoding payloads later.

use std::collections::BTreeMap;

use tracing::debug;

use crate::alarms::{self, Alarm, LevelFn, SettingRange};
use crate::registers::{self, Kind, Register, Translate};

/// A user-editable setting declared by a role or device class.
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct Setting {
    pub name: &'static str,
    pub range: SettingRange,
}

impl Setting {
    pub const fn new(name: &'static str, default: f64, min: f64, max: f64) -> Self {
        Self { name, range: SettingRange::new(default, min, max) }
    }
}

pub struct Role {
    pub name: &'static str,
    pub settings: &'static [Setting],
    pub alarms: &'static [Alarm],
}

pub struct DeviceClass {
    pub manufacturer_id: u16,
    pub product_id: u16,
    pub product_name: &'static str,
    /// Short device id prefix, combined with the MAC into a settings key.
    pub prefix: &'static str,
    pub roles: &'static [&'static str],
    pub registers: &'static [Register],
    pub settings: &'static [Setting],
    pub alarms: &'static [Alarm],
}

pub static TEMPERATURE_ROLE: Role = Role {
    name: "temperature",
    settings: &[Setting::new("TemperatureType", 2.0, 0.0, 6.0)],
    alarms: &[],
};

pub static TANK_ROLE: Role = Role {
    name: "tank",
    settings: &[
        Setting::new("Capacity", 0.2, 0.0, 1000.0),
        Setting::new("FluidType", 0.0, 0.0, (i32::MAX - 3) as f64),
    ],
    alarms: &[
        Alarm::new("High", "Level").triggers_high().configurable(
            SettingRange::new(90.0, 0.0, 100.0),
            SettingRange::new(80.0, 0.0, 100.0),
        ),
        Alarm::new("Low", "Level").configurable(
            SettingRange::new(10.0, 0.0, 100.0),
            SettingRange::new(15.0, 0.0, 100.0),
        ),
    ],
};

/// Teltonika EYE sensor, advertising layout per the vendor's manufacturer
/// data format. Several fields share byte 3 with the flags register and byte
/// 7 with the movement bit; each decodes from the raw payload on its own.
static EYE_SENSOR: DeviceClass = DeviceClass {
    manufacturer_id: 0x089A,
    product_id: 0x3042,
    product_name: "TeltonikaEyeSensor",
    prefix: "teltonika",
    roles: &["temperature"],
    registers: &[
        Register::new("ManufacturerID", Kind::I16, 0),
        Register::new("Version", Kind::U8, 2),
        Register::new("EyeFlags", Kind::U8, 3),
        Register::new("Magnet", Kind::Bool, 3).bits(1).shift(3),
        Register::new("LowBattery", Kind::Bool, 3).bits(1).shift(6),
        Register::new("Temperature", Kind::I16, 4).scale(100.0),
        Register::new("Humidity", Kind::U8, 6),
        Register::new("MovementState", Kind::Bool, 7).bits(1),
        Register::new("MovementCount", Kind::U16, 7).shift(1).bits(15),
        Register::new("AnglePitch", Kind::U8, 9).translate(Translate::SignedByte),
        Register::new("AngleRoll", Kind::I16, 10),
        // Stored as an offset from 2000 mV in 10 mV steps.
        Register::new("BatteryVoltage", Kind::U8, 12).scale(0.1).bias(2000.0),
    ],
    settings: &[],
    alarms: &[Alarm::new("LowBattery", "BatteryVoltage").level(2600.0).hysteresis(100.0)],
};

/// Ruuvi tag broadcasting data format 5 (RAWv2). Everything is big-endian
/// and every measurement has an all-ones sentinel for "not available".
static RUUVI_TAG: DeviceClass = DeviceClass {
    manufacturer_id: 0x0499,
    product_id: 0x0005,
    product_name: "RuuviTag",
    prefix: "ruuvi",
    roles: &["temperature"],
    registers: &[
        Register::new("DataFormat", Kind::U8, 0),
        Register::new("Temperature", Kind::I16, 1).big_endian().scale(200.0).invalid(-32768),
        Register::new("Humidity", Kind::U16, 3).big_endian().scale(400.0).invalid(65535),
        // Wire value is pascals above 50 kPa; exposed in hPa.
        Register::new("Pressure", Kind::U16, 5).big_endian().scale(100.0).bias(500.0).invalid(65535),
        Register::new("AccelerationX", Kind::I16, 7).big_endian().scale(1000.0).invalid(-32768),
        Register::new("AccelerationY", Kind::I16, 9).big_endian().scale(1000.0).invalid(-32768),
        Register::new("AccelerationZ", Kind::I16, 11).big_endian().scale(1000.0).invalid(-32768),
        // Top 11 bits of the power info word, millivolts above 1.6 V.
        Register::new("BatteryVoltage", Kind::U16, 13)
            .big_endian()
            .bits(11)
            .shift(5)
            .scale(1000.0)
            .bias(1.6)
            .invalid(2047),
        Register::new("TxPower", Kind::U16, 14).bits(5).scale(0.5).bias(-40.0).invalid(31),
        Register::new("MovementCount", Kind::U8, 15),
        Register::new("SequenceNumber", Kind::U16, 16).big_endian(),
    ],
    settings: &[],
    alarms: &[Alarm::new("LowBattery", "BatteryVoltage")
        .level_fn(LevelFn::RuuviLowBattery)
        .hysteresis(0.4)],
};

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("device class `{1}` has an invalid register table")]
    Register(#[source] registers::DescriptorError, &'static str),
    #[error("device class `{1}` has an invalid alarm table")]
    Alarm(#[source] alarms::AlarmError, &'static str),
    #[error("role `{1}` has an invalid alarm table")]
    RoleAlarm(#[source] alarms::AlarmError, &'static str),
    #[error("device class `{1}` declares the unknown role `{0}`")]
    UnknownRole(&'static str, &'static str),
    #[error("manufacturer id {0:#06x} is claimed by both `{1}` and `{2}`")]
    DuplicateManufacturer(u16, &'static str, &'static str),
    #[error("role `{0}` is declared more than once")]
    DuplicateRole(&'static str),
}

/// Caller-owned index over device classes and roles.
///
/// Built once at startup and passed around by reference; nothing in here is
/// a process-wide singleton.
pub struct Registry {
    classes: Vec<&'static DeviceClass>,
    by_manufacturer: BTreeMap<u16, usize>,
    roles: BTreeMap<&'static str, &'static Role>,
}

impl Registry {
    pub fn new(
        classes: impl IntoIterator<Item = &'static DeviceClass>,
        roles: impl IntoIterator<Item = &'static Role>,
    ) -> Result<Self, RegistryError> {
        let mut role_index = BTreeMap::new();
        for role in roles {
            alarms::validate(role.alarms).map_err(|e| RegistryError::RoleAlarm(e, role.name))?;
            if role_index.insert(role.name, role).is_some() {
                return Err(RegistryError::DuplicateRole(role.name));
            }
        }

        let classes = classes.into_iter().collect::<Vec<_>>();
        let mut by_manufacturer = BTreeMap::new();
        for (index, class) in classes.iter().enumerate() {
            registers::validate(class.registers)
                .map_err(|e| RegistryError::Register(e, class.product_name))?;
            alarms::validate(class.alarms)
                .map_err(|e| RegistryError::Alarm(e, class.product_name))?;
            for role in class.roles {
                if !role_index.contains_key(role) {
                    return Err(RegistryError::UnknownRole(role, class.product_name));
                }
            }
            if let Some(previous) = by_manufacturer.insert(class.manufacturer_id, index) {
                return Err(RegistryError::DuplicateManufacturer(
                    class.manufacturer_id,
                    classes[previous].product_name,
                    class.product_name,
                ));
            }
            debug!(
                message = "registered device class",
                product = class.product_name,
                manufacturer = class.manufacturer_id,
            );
        }
        Ok(Self { classes, by_manufacturer, roles: role_index })
    }

    /// Index over everything this build knows how to decode.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::new([&EYE_SENSOR, &RUUVI_TAG], [&TEMPERATURE_ROLE, &TANK_ROLE])
    }

    pub fn by_manufacturer(&self, id: u16) -> Option<&'static DeviceClass> {
        self.by_manufacturer.get(&id).map(|&index| self.classes[index])
    }

    pub fn role(&self, name: &str) -> Option<&'static Role> {
        self.roles.get(name).copied()
    }

    pub fn classes(&self) -> impl Iterator<Item = &'static DeviceClass> + '_ {
        self.classes.iter().copied()
    }

    pub fn roles(&self) -> impl Iterator<Item = &'static Role> + '_ {
        self.roles.values().copied()
    }

    /// Alarms evaluated for a device of this class, in evaluation order:
    /// role alarms first (in role declaration order), then the class's own.
    pub fn alarms_for(&self, class: &'static DeviceClass) -> Vec<&'static Alarm> {
        let mut all = Vec::new();
        for role in class.roles {
            if let Some(role) = self.role(role) {
                all.extend(role.alarms);
            }
        }
        all.extend(class.alarms);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{decode, Value};

    #[test]
    fn builtin_registry_validates() {
        let registry = Registry::builtin().unwrap();
        assert!(registry.by_manufacturer(0x089A).is_some());
        assert!(registry.by_manufacturer(0x0499).is_some());
        assert!(registry.by_manufacturer(0xFFFF).is_none());
        assert!(registry.role("temperature").is_some());
        assert!(registry.role("tank").is_some());
    }

    #[test]
    fn tank_role_alarm_order_is_declaration_order() {
        let registry = Registry::builtin().unwrap();
        let names = TANK_ROLE.alarms.iter().map(|a| a.name).collect::<Vec<_>>();
        assert_eq!(names, ["High", "Low"]);
        // Role alarms come before class alarms.
        let ruuvi = registry.by_manufacturer(0x0499).unwrap();
        let order = registry.alarms_for(ruuvi).iter().map(|a| a.name).collect::<Vec<_>>();
        assert_eq!(order, ["LowBattery"]);
    }

    #[test]
    fn eye_sensor_payload_decodes() {
        // 0x089A LE, version 1, flags 0x48 (magnet and low battery set),
        // 21.57 degC, 44 %RH, moving with count 3, pitch -5, roll -1000,
        // battery raw 100 -> 3000 mV.
        let payload = [
            0x9A, 0x08, // ManufacturerID
            0x01, // Version
            0x48, // EyeFlags
            0x6D, 0x08, // Temperature 2157
            0x2C, // Humidity
            0x07, // MovementState 1, MovementCount 3
            0x00, // MovementCount high bits
            0xFB, // AnglePitch -5
            0x18, 0xFC, // AngleRoll -1000
            0x64, // BatteryVoltage raw 100
        ];
        let values = decode(EYE_SENSOR.registers, &payload);
        assert_eq!(values["ManufacturerID"], Value::Int(0x089A));
        assert_eq!(values["Version"], Value::Int(1));
        assert_eq!(values["EyeFlags"], Value::Int(0x48));
        assert_eq!(values["Magnet"], Value::Bool(true));
        assert_eq!(values["LowBattery"], Value::Bool(true));
        assert_eq!(values["Temperature"], Value::Float(21.57));
        assert_eq!(values["Humidity"], Value::Int(44));
        assert_eq!(values["MovementState"], Value::Bool(true));
        assert_eq!(values["MovementCount"], Value::Int(3));
        assert_eq!(values["AnglePitch"], Value::Int(-5));
        assert_eq!(values["AngleRoll"], Value::Int(-1000));
        assert_eq!(values["BatteryVoltage"], Value::Float(3000.0));
    }

    #[test]
    fn eye_sensor_short_payload_drops_tail_fields() {
        let payload = [0x9A, 0x08, 0x01, 0x08, 0x6D, 0x08];
        let values = decode(EYE_SENSOR.registers, &payload);
        assert_eq!(values["Temperature"], Value::Float(21.57));
        assert!(!values.contains_key("Humidity"));
        assert!(!values.contains_key("BatteryVoltage"));
    }

    #[test]
    fn ruuvi_rawv2_payload_decodes() {
        // Reference vector from the format 5 specification ("valid data").
        let payload = [
            0x05, // DataFormat
            0x12, 0xFC, // Temperature 24.30
            0x53, 0x94, // Humidity 53.49
            0xC3, 0x7C, // Pressure 1000.44 hPa
            0x00, 0x04, // AccelerationX
            0xFF, 0xFC, // AccelerationY
            0x04, 0x0C, // AccelerationZ
            0xAC, 0x36, // power info: 1377 mV above 1.6 V, tx 4 dBm
            0x42, // MovementCount
            0x00, 0xCD, // SequenceNumber
        ];
        let values = decode(RUUVI_TAG.registers, &payload);
        assert_eq!(values["DataFormat"], Value::Int(5));
        assert_eq!(values["Temperature"], Value::Float(24.3));
        assert_eq!(values["Humidity"], Value::Float(53.49));
        assert_eq!(values["Pressure"], Value::Float(1000.44));
        assert_eq!(values["AccelerationX"], Value::Float(0.004));
        assert_eq!(values["AccelerationY"], Value::Float(-0.004));
        assert_eq!(values["AccelerationZ"], Value::Float(1.036));
        assert!((values["BatteryVoltage"].as_f64() - 2.977).abs() < 1e-9);
        assert_eq!(values["TxPower"], Value::Float(4.0));
        assert_eq!(values["MovementCount"], Value::Int(0x42));
        assert_eq!(values["SequenceNumber"], Value::Int(0xCD));
    }

    #[test]
    fn ruuvi_sentinel_payload_omits_everything_unavailable() {
        // The "all invalid" vector: every measurement at its sentinel.
        let payload = [
            0x05, 0x80, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x80, 0x00, 0x80, 0x00, 0x80, 0x00, 0xFF,
            0xFF, 0xFF, 0xFF, 0xFF,
        ];
        let values = decode(RUUVI_TAG.registers, &payload);
        assert_eq!(values["DataFormat"], Value::Int(5));
        for absent in [
            "Temperature",
            "Humidity",
            "Pressure",
            "AccelerationX",
            "AccelerationY",
            "AccelerationZ",
            "BatteryVoltage",
            "TxPower",
        ] {
            assert!(!values.contains_key(absent), "{absent} should be omitted");
        }
        assert_eq!(values["MovementCount"], Value::Int(255));
        assert_eq!(values["SequenceNumber"], Value::Int(65535));
    }

    #[test]
    fn registry_rejects_duplicate_manufacturers() {
        static CLONE: DeviceClass = DeviceClass {
            manufacturer_id: 0x089A,
            product_id: 0x0001,
            product_name: "Impostor",
            prefix: "impostor",
            roles: &[],
            registers: &[Register::new("X", Kind::U8, 0)],
            settings: &[],
            alarms: &[],
        };
        let result = Registry::new([&EYE_SENSOR, &CLONE], [&TEMPERATURE_ROLE]);
        assert!(matches!(
            result,
            Err(RegistryError::DuplicateManufacturer(0x089A, _, _))
        ));
    }

    #[test]
    fn registry_rejects_unknown_roles() {
        static LOST: DeviceClass = DeviceClass {
            manufacturer_id: 0x1234,
            product_id: 0x0001,
            product_name: "Lost",
            prefix: "lost",
            roles: &["submarine"],
            registers: &[Register::new("X", Kind::U8, 0)],
            settings: &[],
            alarms: &[],
        };
        let result = Registry::new([&LOST], [&TEMPERATURE_ROLE]);
        assert!(matches!(
            result,
            Err(RegistryError::UnknownRole("submarine", "Lost"))
        ));
    }

    #[test]
    fn registry_rejects_bad_register_tables() {
        static BROKEN: DeviceClass = DeviceClass {
            manufacturer_id: 0x1234,
            product_id: 0x0001,
            product_name: "Broken",
            prefix: "broken",
            roles: &[],
            registers: &[Register::new("X", Kind::Opaque, 0)],
            settings: &[],
            alarms: &[],
        };
        let result = Registry::new([&BROKEN], []);
        assert!(matches!(result, Err(RegistryError::Register(_, "Broken"))));
    }
}
