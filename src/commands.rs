#[derive(thiserror::Error, Debug)]
pub enum HexError {
    #[error("hex payload has an odd number of digits ({0})")]
    OddLength(usize),
    #[error("hex payload contains the non-hex character `{0}`")]
    BadDigit(char),
}

/// Parse a payload given on the command line as hex, tolerating an `0x`
/// prefix and `:` or space separators as copied out of BLE sniffer logs.
pub fn parse_hex(payload: &str) -> Result<Vec<u8>, HexError> {
    let digits = payload
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !matches!(c, ':' | ' '))
        .map(|c| c.to_digit(16).map(|d| d as u8).ok_or(HexError::BadDigit(c)))
        .collect::<Result<Vec<_>, _>>()?;
    if digits.len() % 2 != 0 {
        return Err(HexError::OddLength(digits.len()));
    }
    Ok(digits.chunks_exact(2).map(|pair| pair[0] << 4 | pair[1]).collect())
}

#[derive(thiserror::Error, Debug)]
#[error("`{0}` is not a manufacturer id (expected e.g. `0x089A` or `2202`)")]
pub struct ManufacturerError(String);

pub fn parse_manufacturer(id: &str) -> Result<u16, ManufacturerError> {
    let parsed = match id.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => id.parse(),
    };
    parsed.map_err(|_| ManufacturerError(id.to_string()))
}

pub mod registers {
    use crate::devices::Registry;
    use crate::output;
    use crate::registers::{Kind, Register, Translate};

    /// List the advertising register tables of every built-in device class.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only show registers whose name or product matches.
        filter: Option<String>,
        #[command(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("the built-in device definitions are invalid")]
        Registry(#[source] crate::devices::RegistryError),
        #[error("could not produce output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Schema {
        product: &'static str,
        manufacturer_id: u16,
        name: &'static str,
        kind: Kind,
        offset: usize,
        shift: u32,
        bits: Option<u32>,
        big_endian: bool,
        scale: Option<f64>,
        bias: f64,
        invalid: Option<i64>,
        translate: Option<Translate>,
    }

    fn is_match(register: &Register, product: &str, pattern: &str) -> bool {
        let pattern = pattern.to_uppercase();
        register.name.to_uppercase().contains(&pattern)
            || product.to_uppercase().contains(&pattern)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let registry = Registry::builtin().map_err(Error::Registry)?;
        let mut sink = args.output.to_sink().map_err(Error::Output)?;
        sink.headers(vec![
            "Product", "Register", "Kind", "Offset", "Shift", "Bits", "Endian", "Scale", "Bias",
            "Invalid",
        ])
        .map_err(Error::Output)?;
        for class in registry.classes() {
            for register in class.registers {
                if let Some(pattern) = &args.filter {
                    if !is_match(register, class.product_name, pattern) {
                        continue;
                    }
                }
                sink.record(
                    || {
                        vec![
                            class.product_name.to_string(),
                            register.name.to_string(),
                            register.kind.to_string(),
                            register.offset.to_string(),
                            register.shift.to_string(),
                            register.width().map(|b| b.to_string()).unwrap_or_default(),
                            if register.big_endian { "big" } else { "little" }.to_string(),
                            register.scale.map(|s| s.to_string()).unwrap_or_default(),
                            register.bias.to_string(),
                            register.invalid.map(|i| i.to_string()).unwrap_or_default(),
                        ]
                    },
                    || Schema {
                        product: class.product_name,
                        manufacturer_id: class.manufacturer_id,
                        name: register.name,
                        kind: register.kind,
                        offset: register.offset,
                        shift: register.shift,
                        bits: register.width(),
                        big_endian: register.big_endian,
                        scale: register.scale,
                        bias: register.bias,
                        invalid: register.invalid,
                        translate: register.translate,
                    },
                )
                .map_err(Error::Output)?;
            }
        }
        sink.commit().map_err(Error::Output)
    }
}

pub mod alarms {
    use crate::alarms::{Alarm, LevelFn};
    use crate::devices::Registry;
    use crate::output;

    /// List the alarms every built-in device class and role declares.
    #[derive(clap::Parser)]
    pub struct Args {
        #[command(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("the built-in device definitions are invalid")]
        Registry(#[source] crate::devices::RegistryError),
        #[error("could not produce output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Schema {
        owner: &'static str,
        name: &'static str,
        item: &'static str,
        configurable: bool,
        triggers_high: bool,
        level: Option<f64>,
        level_fn: Option<LevelFn>,
        hysteresis: f64,
        active_default: Option<f64>,
        restore_default: Option<f64>,
    }

    fn emit(sink: &mut output::Sink, owner: &'static str, alarm: &Alarm) -> Result<(), Error> {
        let level = match (alarm.level_fn, alarm.level) {
            (Some(level_fn), _) => level_fn.to_string(),
            (None, Some(level)) => level.to_string(),
            (None, None) => String::new(),
        };
        sink.record(
            || {
                vec![
                    owner.to_string(),
                    alarm.name.to_string(),
                    alarm.item.to_string(),
                    if alarm.configurable { "yes" } else { "no" }.to_string(),
                    if alarm.triggers_high { "high" } else { "low" }.to_string(),
                    level,
                    alarm.hysteresis.to_string(),
                    alarm.active.map(|r| r.default.to_string()).unwrap_or_default(),
                    alarm.restore.map(|r| r.default.to_string()).unwrap_or_default(),
                ]
            },
            || Schema {
                owner,
                name: alarm.name,
                item: alarm.item,
                configurable: alarm.configurable,
                triggers_high: alarm.triggers_high,
                level: alarm.level,
                level_fn: alarm.level_fn,
                hysteresis: alarm.hysteresis,
                active_default: alarm.active.map(|r| r.default),
                restore_default: alarm.restore.map(|r| r.default),
            },
        )
        .map_err(Error::Output)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let registry = Registry::builtin().map_err(Error::Registry)?;
        let mut sink = args.output.to_sink().map_err(Error::Output)?;
        sink.headers(vec![
            "Owner",
            "Alarm",
            "Item",
            "Configurable",
            "Direction",
            "Level",
            "Hysteresis",
            "Active default",
            "Restore default",
        ])
        .map_err(Error::Output)?;
        for role in registry.roles() {
            for alarm in role.alarms {
                emit(&mut sink, role.name, alarm)?;
            }
        }
        for class in registry.classes() {
            for alarm in class.alarms {
                emit(&mut sink, class.product_name, alarm)?;
            }
        }
        sink.commit().map_err(Error::Output)
    }
}

pub mod decode {
    use super::{parse_hex, parse_manufacturer, HexError, ManufacturerError};
    use crate::devices::Registry;
    use crate::output;
    use crate::registers::{decode, Value};

    /// Decode one advertising payload against a device class.
    #[derive(clap::Parser)]
    pub struct Args {
        /// BLE manufacturer id announcing the payload, e.g. `0x089A`.
        manufacturer: String,
        /// Manufacturer data as hex.
        payload: String,
        #[command(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("the built-in device definitions are invalid")]
        Registry(#[source] crate::devices::RegistryError),
        #[error("could not parse the manufacturer id")]
        Manufacturer(#[source] ManufacturerError),
        #[error("no known device class advertises with manufacturer id {0:#06x}")]
        UnknownManufacturer(u16),
        #[error("could not parse the payload")]
        Payload(#[source] HexError),
        #[error("could not produce output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Schema {
        register: &'static str,
        value: Value,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let registry = Registry::builtin().map_err(Error::Registry)?;
        let manufacturer = parse_manufacturer(&args.manufacturer).map_err(Error::Manufacturer)?;
        let class = registry
            .by_manufacturer(manufacturer)
            .ok_or(Error::UnknownManufacturer(manufacturer))?;
        let payload = parse_hex(&args.payload).map_err(Error::Payload)?;

        let values = decode(class.registers, &payload);
        let mut sink = args.output.to_sink().map_err(Error::Output)?;
        sink.headers(vec!["Register", "Value"]).map_err(Error::Output)?;
        for (&register, &value) in &values {
            sink.record(
                || vec![register.to_string(), value.to_string()],
                || Schema { register, value },
            )
            .map_err(Error::Output)?;
        }
        sink.commit().map_err(Error::Output)
    }
}

pub mod replay {
    use super::{parse_hex, parse_manufacturer, HexError, ManufacturerError};
    use crate::device::Device;
    use crate::devices::Registry;
    use crate::output;
    use crate::settings::MemorySettings;

    /// Replay a sequence of advertising payloads through the alarm engine,
    /// reporting the state of every alarm after each tick.
    #[derive(clap::Parser)]
    pub struct Args {
        /// BLE manufacturer id announcing the payloads, e.g. `0x0499`.
        manufacturer: String,
        /// Manufacturer data of consecutive advertisements, as hex.
        #[arg(required = true)]
        payloads: Vec<String>,
        /// MAC suffix used to key the settings store.
        #[arg(long, default_value = "replay")]
        mac: String,
        /// Settings override, `PATH=VALUE`, repeatable. Booleans are 0 or 1.
        #[arg(long = "set")]
        overrides: Vec<String>,
        #[command(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("the built-in device definitions are invalid")]
        Registry(#[source] crate::devices::RegistryError),
        #[error("could not parse the manufacturer id")]
        Manufacturer(#[source] ManufacturerError),
        #[error("no known device class advertises with manufacturer id {0:#06x}")]
        UnknownManufacturer(u16),
        #[error("could not parse payload {1}")]
        Payload(#[source] HexError, usize),
        #[error("setting override `{0}` is not in the `PATH=VALUE` shape")]
        MalformedOverride(String),
        #[error("setting override `{1}` has a non-numeric value")]
        OverrideValue(#[source] std::num::ParseFloatError, String),
        #[error("could not produce output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Schema {
        tick: usize,
        alarm: &'static str,
        enabled: bool,
        active: bool,
        changed: bool,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let registry = Registry::builtin().map_err(Error::Registry)?;
        let manufacturer = parse_manufacturer(&args.manufacturer).map_err(Error::Manufacturer)?;
        let class = registry
            .by_manufacturer(manufacturer)
            .ok_or(Error::UnknownManufacturer(manufacturer))?;

        let settings = MemorySettings::new();
        for raw in &args.overrides {
            let Some((path, value)) = raw.split_once('=') else {
                return Err(Error::MalformedOverride(raw.clone()));
            };
            let value = value
                .parse::<f64>()
                .map_err(|e| Error::OverrideValue(e, raw.clone()))?;
            settings.set_raw(path.to_string(), value);
        }

        let mut device = Device::new(&registry, class, &args.mac);
        let alarms = registry.alarms_for(class);
        let mut sink = args.output.to_sink().map_err(Error::Output)?;
        sink.headers(vec!["Tick", "Alarm", "Enabled", "Active", "Changed"])
            .map_err(Error::Output)?;
        for (tick, payload) in args.payloads.iter().enumerate() {
            let payload = parse_hex(payload).map_err(|e| Error::Payload(e, tick))?;
            let transitions = device.ingest(&payload, &settings);
            for alarm in &alarms {
                let state = device.alarm_state(alarm.name);
                let changed = transitions.iter().any(|t| t.alarm == alarm.name);
                sink.record(
                    || {
                        vec![
                            tick.to_string(),
                            alarm.name.to_string(),
                            state.enabled.to_string(),
                            state.active.to_string(),
                            if changed { "*" } else { "" }.to_string(),
                        ]
                    },
                    || Schema {
                        tick,
                        alarm: alarm.name,
                        enabled: state.enabled,
                        active: state.active,
                        changed,
                    },
                )
                .map_err(Error::Output)?;
            }
        }
        sink.commit().map_err(Error::Output)
    }
}
