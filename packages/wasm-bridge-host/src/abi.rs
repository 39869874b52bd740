//! Wire-level constants and tags shared with guests.
//!
//! Every field crossing the boundary is a little-endian `u32`. Numbering
//! matches the guests already compiled against the `env` imports, so the
//! values here must never be renumbered.

use crate::error::{BridgeError, Result};
use crate::memory::LinearMemory;

/// Import namespace for every bridge function.
pub const IMPORT_MODULE: &str = "env";

pub const IMPORT_ACQUIRE: &str = "acquire";
pub const IMPORT_RETAIN: &str = "retain";
pub const IMPORT_RELEASE: &str = "release";
pub const IMPORT_MEMORY_SIZE: &str = "memorySize";
pub const IMPORT_GROW_MEMORY: &str = "growMemory";
pub const IMPORT_ABORT: &str = "abort";
pub const IMPORT_UNWIND_RESUME: &str = "_Unwind_Resume";

/// Returned by `acquire` when the control data cannot be honoured.
pub const SENTINEL_FAILURE: i32 = -1;

/// Returned by `acquire` for [`ReturnType::Void`].
pub const SENTINEL_VOID: i32 = 0;

/// Size of one packed argument triple `(tag, ptr, len)`.
pub const ARG_STRIDE: u32 = 12;

/// Size of the length prefix in front of allocated payloads.
pub const LENGTH_PREFIX: u32 = 4;

/// How `acquire` encodes the host logic's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnType {
    Void,
    Integer,
    Float,
    BoxedObject,
    BufferProvided,
    BufferAllocated,
    StringProvided,
    StringAllocated,
    FunctionBoxed,
}

impl ReturnType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => ReturnType::Void,
            1 => ReturnType::Integer,
            2 => ReturnType::Float,
            3 => ReturnType::BoxedObject,
            4 => ReturnType::BufferProvided,
            5 => ReturnType::BufferAllocated,
            6 => ReturnType::StringProvided,
            7 => ReturnType::StringAllocated,
            8 => ReturnType::FunctionBoxed,
            _ => return None,
        })
    }

    pub fn tag(self) -> u32 {
        match self {
            ReturnType::Void => 0,
            ReturnType::Integer => 1,
            ReturnType::Float => 2,
            ReturnType::BoxedObject => 3,
            ReturnType::BufferProvided => 4,
            ReturnType::BufferAllocated => 5,
            ReturnType::StringProvided => 6,
            ReturnType::StringAllocated => 7,
            ReturnType::FunctionBoxed => 8,
        }
    }

    /// Tags reserved in the ABI that have no defined behavior yet.
    pub fn is_implemented(self) -> bool {
        !matches!(
            self,
            ReturnType::BufferProvided | ReturnType::StringProvided | ReturnType::FunctionBoxed
        )
    }

    /// Parse and validate a return-type tag in one step.
    pub fn parse(tag: u32) -> Result<Self> {
        let ty = Self::from_tag(tag).ok_or(BridgeError::UnrecognizedReturnType(tag))?;
        if !ty.is_implemented() {
            return Err(BridgeError::UnimplementedReturnType(ty));
        }
        Ok(ty)
    }
}

/// Argument type tags inside the packed triple array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgTag {
    /// `ptr` carries the integer itself.
    Integer,
    /// `[ptr, ptr + len)` is UTF-8 text.
    String,
    /// `ptr` is a handle table index.
    Handle,
}

impl ArgTag {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(ArgTag::Integer),
            1 => Some(ArgTag::String),
            2 => Some(ArgTag::Handle),
            _ => None,
        }
    }
}

/// One undecoded `(tag, ptr, len)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawArg {
    pub tag: u32,
    pub ptr: u32,
    pub len: u32,
}

/// Read `count` packed triples starting at `args_ptr`.
///
/// The whole array is bounds-checked before any triple is returned.
pub fn read_raw_args<M: LinearMemory + ?Sized>(
    memory: &M,
    args_ptr: u32,
    count: u32,
) -> Result<Vec<RawArg>> {
    let total = u64::from(count) * u64::from(ARG_STRIDE);
    let bytes = memory.slice(u64::from(args_ptr), total)?;
    Ok(bytes
        .chunks_exact(ARG_STRIDE as usize)
        .map(|triple| RawArg {
            tag: le_u32(&triple[0..4]),
            ptr: le_u32(&triple[4..8]),
            len: le_u32(&triple[8..12]),
        })
        .collect())
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// A decoded argument, ready to be bound to a host logic parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument<V> {
    Integer(u32),
    String(String),
    Handle(V),
}
