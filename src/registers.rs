//! Declarative extraction of bit-packed fields from vendor advertising
//! payloads.
//!
//! Every supported sensor describes its manufacturer data as a flat list of
//! [`Register`]s. A register names a field, says where it sits in the payload
//! (byte offset plus an optional bit shift), how wide it is, how to interpret
//! the bits, and how to turn the raw integer into an engineering value. The
//! whole decode is a single pass over that list; fields that cannot be
//! extracted from a particular payload are simply absent from the result.

use std::collections::BTreeMap;

use tracing::trace;

/// Wire interpretation of a single field.
///
/// `F64`, `Utf8` and `Opaque` are reserved for payload formats no supported
/// device uses yet; they decode to an omitted entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Bool,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F64,
    Utf8,
    Opaque,
}

impl Kind {
    pub const fn natural_bits(self) -> Option<u32> {
        match self {
            Kind::Bool | Kind::U8 => Some(8),
            Kind::I16 | Kind::U16 => Some(16),
            Kind::I32 | Kind::U32 => Some(32),
            Kind::I64 | Kind::U64 => Some(64),
            Kind::F64 | Kind::Utf8 | Kind::Opaque => None,
        }
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, Kind::I16 | Kind::I32 | Kind::I64)
    }

    /// Whether this kind goes through the integer extraction path at all.
    pub const fn is_integer(self) -> bool {
        !matches!(self, Kind::F64 | Kind::Utf8 | Kind::Opaque)
    }
}

/// Post-extraction transformation, resolved when the register table is
/// defined rather than looked up by name at decode time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
pub enum Translate {
    /// Reinterpret an 8-bit unsigned raw value as a two's-complement byte.
    SignedByte,
}

impl Translate {
    pub fn apply(self, raw: i64) -> Value {
        match self {
            Translate::SignedByte => Value::Int(if raw < 128 { raw } else { raw - 256 }),
        }
    }
}

/// One field of a device's manufacturer data.
///
/// The `const fn` builder methods exist so device modules can lay their
/// register tables out as `static` arrays:
///
/// ```
/// use ble_sensor_tools::registers::{Kind, Register};
/// static REGS: [Register; 2] = [
///     Register::new("Temperature", Kind::I16, 4).scale(100.0),
///     Register::new("Magnet", Kind::Bool, 3).bits(1).shift(3),
/// ];
/// ```
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct Register {
    pub name: &'static str,
    pub kind: Kind,
    pub offset: usize,
    pub shift: u32,
    pub bits: Option<u32>,
    pub big_endian: bool,
    /// Raw post-mask value meaning "no data in this sample".
    pub invalid: Option<i64>,
    pub translate: Option<Translate>,
    pub scale: Option<f64>,
    pub bias: f64,
}

impl Register {
    pub const fn new(name: &'static str, kind: Kind, offset: usize) -> Self {
        Self {
            name,
            kind,
            offset,
            shift: 0,
            bits: None,
            big_endian: false,
            invalid: None,
            translate: None,
            scale: None,
            bias: 0.0,
        }
    }

    pub const fn bits(mut self, bits: u32) -> Self {
        self.bits = Some(bits);
        self
    }

    pub const fn shift(mut self, shift: u32) -> Self {
        self.shift = shift;
        self
    }

    pub const fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    pub const fn invalid(mut self, sentinel: i64) -> Self {
        self.invalid = Some(sentinel);
        self
    }

    pub const fn translate(mut self, translate: Translate) -> Self {
        self.translate = Some(translate);
        self
    }

    pub const fn scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub const fn bias(mut self, bias: f64) -> Self {
        self.bias = bias;
        self
    }

    /// Effective bit width: explicit if given, otherwise the kind's natural
    /// width.
    pub const fn width(&self) -> Option<u32> {
        match self.bits {
            Some(bits) => Some(bits),
            None => self.kind.natural_bits(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DescriptorError {
    #[error("register `{0}` has neither an explicit bit width nor a natural one for `{1}`")]
    NoWidth(&'static str, Kind),
    #[error("register `{0}` declares a bit width of {1}, outside of the supported 1..=64")]
    WidthRange(&'static str, u32),
    #[error("register `{0}` does not fit one 64-bit read (width {1} plus shift {2})")]
    ReadTooWide(&'static str, u32, u32),
    #[error("register `{0}` sets both a translate function and a scale")]
    TranslateAndScale(&'static str),
    #[error("register `{0}` declares a scale of zero")]
    ZeroScale(&'static str),
    #[error("register name `{0}` is declared more than once")]
    DuplicateName(&'static str),
}

/// Reject malformed register tables before they ever see a payload.
///
/// A table that passes here can only produce omissions at decode time, never
/// mis-decoded garbage.
pub fn validate(registers: &[Register]) -> Result<(), DescriptorError> {
    let mut names = std::collections::BTreeSet::new();
    for reg in registers {
        if !names.insert(reg.name) {
            return Err(DescriptorError::DuplicateName(reg.name));
        }
        let Some(bits) = reg.width() else {
            return Err(DescriptorError::NoWidth(reg.name, reg.kind));
        };
        if bits < 1 || bits > 64 {
            return Err(DescriptorError::WidthRange(reg.name, bits));
        }
        if bits.checked_add(reg.shift).is_none_or(|total| total > 64) {
            return Err(DescriptorError::ReadTooWide(reg.name, bits, reg.shift));
        }
        if reg.translate.is_some() && reg.scale.is_some() {
            return Err(DescriptorError::TranslateAndScale(reg.name));
        }
        if reg.scale == Some(0.0) {
            return Err(DescriptorError::ZeroScale(reg.name));
        }
    }
    Ok(())
}

/// A decoded engineering value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Bool(b) => f64::from(u8::from(b)),
            Value::Int(n) => n as f64,
            Value::Float(f) => f,
        }
    }

    fn truthy(&self) -> bool {
        match *self {
            Value::Bool(b) => b,
            Value::Int(n) => n != 0,
            Value::Float(f) => f != 0.0,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::Bool(b) => f.write_fmt(format_args!("{}", b)),
            Value::Int(n) => f.write_fmt(format_args!("{}", n)),
            Value::Float(v) => f.write_fmt(format_args!("{}", v)),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Bool(b) => serializer.serialize_bool(b),
            Value::Int(n) => serializer.serialize_i64(n),
            Value::Float(v) => serializer.serialize_f64(v),
        }
    }
}

/// Mapping from register name to decoded value, rebuilt from scratch on every
/// payload. A name absent here means "no value this sample", never a stale
/// one.
pub type DecodedValues = BTreeMap<&'static str, Value>;

/// Decode every register independently, tolerating per-field failure.
///
/// Fields are extracted straight from the raw payload, so overlapping
/// windows (a flag bit inside a byte another register also covers) are fine.
pub fn decode(registers: &[Register], payload: &[u8]) -> DecodedValues {
    let mut values = DecodedValues::new();
    for reg in registers {
        let Some(value) = decode_one(reg, payload) else {
            trace!(message = "field omitted", register = reg.name);
            continue;
        };
        values.insert(reg.name, value);
    }
    values
}

fn decode_one(reg: &Register, payload: &[u8]) -> Option<Value> {
    if !reg.kind.is_integer() {
        return None;
    }
    let value = load_int(reg, payload)?;
    Some(match reg.kind {
        Kind::Bool => Value::Bool(value.truthy()),
        _ => value,
    })
}

fn load_int(reg: &Register, payload: &[u8]) -> Option<Value> {
    let bits = reg.width()?;
    if bits < 1 || bits.checked_add(reg.shift).is_none_or(|total| total > 64) {
        return None;
    }

    // Shortest whole-byte window covering the shifted field.
    let span = ((bits + reg.shift + 7) >> 3) as usize;
    let end = reg.offset.checked_add(span)?;
    let window = payload.get(reg.offset..end)?;

    let mut raw = 0u64;
    if reg.big_endian {
        for byte in window {
            raw = raw << 8 | u64::from(*byte);
        }
    } else {
        for byte in window.iter().rev() {
            raw = raw << 8 | u64::from(*byte);
        }
    }
    raw >>= reg.shift;

    // Truncate to `bits` and sign-extend in one move: park the field at the
    // top of the 64-bit word, then shift back down arithmetically (signed)
    // or logically (unsigned). One code path for every width 1..=64.
    let spare = 64 - bits;
    let value = if reg.kind.is_signed() {
        ((raw << spare) as i64) >> spare
    } else {
        ((raw << spare) >> spare) as i64
    };

    if reg.invalid == Some(value) {
        return None;
    }
    if let Some(translate) = reg.translate {
        Some(translate.apply(value))
    } else if let Some(scale) = reg.scale {
        Some(Value::Float(value as f64 / scale + reg.bias))
    } else {
        Some(Value::Int(value))
    }
}
