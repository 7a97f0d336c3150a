//! Primitive value types and the fixed-width transport word.
//!
//! Every value crossing the process boundary travels as an unsigned 64-bit
//! word, whatever its declared type:
//!
//! - `I32` is the two's-complement bit pattern, zero-extended.
//! - `I64` is the full two's-complement bit pattern.
//! - `F32` is the raw IEEE-754 bit pattern, zero-extended.
//! - `F64` is the full IEEE-754 bit pattern.
//!
//! Decoding truncates to the declared width and reinterprets, so sign
//! extension happens on the decoding side.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// One of the four primitive types of the guest calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl ValueType {
    /// All supported value types.
    pub const ALL: [ValueType; 4] = [ValueType::I32, ValueType::I64, ValueType::F32, ValueType::F64];

    /// Get the canonical lowercase name of this type.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
        }
    }

    /// Decode a transport word as a value of this type.
    pub fn decode(self, word: u64) -> Value {
        Value::decode(self, word)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ValueType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "i32" => Ok(ValueType::I32),
            "i64" => Ok(ValueType::I64),
            "f32" => Ok(ValueType::F32),
            "f64" => Ok(ValueType::F64),
            other => Err(CoreError::UnsupportedValueType(other.to_string())),
        }
    }
}

impl TryFrom<&str> for ValueType {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Anything a function signature can be declared from.
///
/// Typed values always succeed; textual type names fail with
/// [`CoreError::UnsupportedValueType`] outside the closed set.
pub trait TypeSpec {
    /// Resolve into a [`ValueType`].
    fn resolve(&self) -> Result<ValueType, CoreError>;
}

impl TypeSpec for ValueType {
    fn resolve(&self) -> Result<ValueType, CoreError> {
        Ok(*self)
    }
}

impl TypeSpec for &str {
    fn resolve(&self) -> Result<ValueType, CoreError> {
        self.parse()
    }
}

impl TypeSpec for String {
    fn resolve(&self) -> Result<ValueType, CoreError> {
        self.parse()
    }
}

/// A typed primitive value.
///
/// Floats are held as values, not bit patterns; use [`Value::to_bits`] when
/// NaN payloads matter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
}

impl Value {
    /// Get the type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
        }
    }

    /// Encode this value into its transport word.
    pub fn encode(&self) -> u64 {
        match *self {
            Value::I32(v) => u64::from(v as u32),
            Value::I64(v) => v as u64,
            Value::F32(v) => u64::from(v.to_bits()),
            Value::F64(v) => v.to_bits(),
        }
    }

    /// Decode a transport word as a value of the given type.
    pub fn decode(ty: ValueType, word: u64) -> Self {
        match ty {
            ValueType::I32 => Value::I32(word as u32 as i32),
            ValueType::I64 => Value::I64(word as i64),
            ValueType::F32 => Value::F32(f32::from_bits(word as u32)),
            ValueType::F64 => Value::F64(f64::from_bits(word)),
        }
    }

    /// The transport word, for bit-exact comparisons.
    pub fn to_bits(&self) -> u64 {
        self.encode()
    }

    /// Parse a value of the given type from its textual form.
    pub fn parse(ty: ValueType, text: &str) -> Option<Self> {
        let text = text.trim();
        match ty {
            ValueType::I32 => text.parse().ok().map(Value::I32),
            ValueType::I64 => text.parse().ok().map(Value::I64),
            ValueType::F32 => text.parse().ok().map(Value::F32),
            ValueType::F64 => text.parse().ok().map(Value::F64),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
        }
    }
}

/// Encode a sequence of values into transport words.
pub fn encode_all(values: &[Value]) -> Vec<u64> {
    values.iter().map(Value::encode).collect()
}

/// Decode transport words against a type list.
///
/// Returns `None` when the number of words does not match the number of types.
pub fn decode_all(types: &[ValueType], words: &[u64]) -> Option<Vec<Value>> {
    if types.len() != words.len() {
        return None;
    }
    Some(
        types
            .iter()
            .zip(words)
            .map(|(ty, word)| Value::decode(*ty, *word))
            .collect(),
    )
}

/// A Rust primitive that maps onto one [`ValueType`].
///
/// Implemented for `i32`, `i64`, `f32`, `f64` and nothing else, which is what
/// keeps typed export handlers inside the closed set at compile time.
pub trait Primitive: Copy + Send + 'static {
    /// The value type this primitive travels as.
    const TYPE: ValueType;

    /// Decode from a transport word.
    fn from_word(word: u64) -> Self;

    /// Encode into a transport word.
    fn into_word(self) -> u64;
}

macro_rules! impl_primitive {
    ($ty:ty, $variant:ident, |$word:ident| $decode:expr) => {
        impl Primitive for $ty {
            const TYPE: ValueType = ValueType::$variant;

            fn from_word($word: u64) -> Self {
                $decode
            }

            fn into_word(self) -> u64 {
                Value::$variant(self).encode()
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

impl_primitive!(i32, I32, |word| word as u32 as i32);
impl_primitive!(i64, I64, |word| word as i64);
impl_primitive!(f32, F32, |word| f32::from_bits(word as u32));
impl_primitive!(f64, F64, |word| f64::from_bits(word));
