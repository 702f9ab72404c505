//! Opcode coercion from the integer kinds callers register routes with.
//!
//! Every route table keys by `u16`. Registration accepts wider integers and
//! narrows them with a range check; opcode 0 is reserved and always rejected.

use crate::core::packet::NO_OPCODE;
use crate::error::{ProtocolError, Result};

/// An opcode as supplied at registration, before narrowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOpcode {
    I32(i32),
    I64(i64),
    Isize(isize),
    U16(u16),
    U32(u32),
    Usize(usize),
}

impl RawOpcode {
    /// Narrow to the wire width.
    pub fn narrow(self) -> Result<u16> {
        let narrowed = match self {
            RawOpcode::I32(v) => u16::try_from(v).map_err(|_| v.to_string()),
            RawOpcode::I64(v) => u16::try_from(v).map_err(|_| v.to_string()),
            RawOpcode::Isize(v) => u16::try_from(v).map_err(|_| v.to_string()),
            RawOpcode::U16(v) => Ok(v),
            RawOpcode::U32(v) => u16::try_from(v).map_err(|_| v.to_string()),
            RawOpcode::Usize(v) => u16::try_from(v).map_err(|_| v.to_string()),
        };

        match narrowed {
            Ok(NO_OPCODE) => Err(ProtocolError::ReservedOpcode),
            Ok(opcode) => Ok(opcode),
            Err(raw) => Err(ProtocolError::OpcodeOutOfRange(raw)),
        }
    }
}

macro_rules! raw_opcode_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for RawOpcode {
                fn from(value: $ty) -> Self {
                    RawOpcode::$variant(value)
                }
            }
        )*
    };
}

raw_opcode_from! {
    i32 => I32,
    i64 => I64,
    isize => Isize,
    u16 => U16,
    u32 => U32,
    usize => Usize,
}

/// Opcodes read from TOML route tables arrive as `toml::Value`.
impl TryFrom<&toml::Value> for RawOpcode {
    type Error = ProtocolError;

    fn try_from(value: &toml::Value) -> Result<Self> {
        match value {
            toml::Value::Integer(v) => Ok(RawOpcode::I64(*v)),
            other => Err(ProtocolError::UnsupportedOpcodeKind(
                other.type_str().to_string(),
            )),
        }
    }
}
