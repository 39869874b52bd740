use std::time::Duration;

use crate::abi::ReturnType;

/// Errors raised by bridge operations.
///
/// Only malformed control data is recoverable (see [`BridgeError::is_recoverable`]);
/// the linker maps those to the `-1` sentinel. Everything else traps the guest call.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid handle {0}")]
    InvalidHandle(u32),

    #[error("memory access out of bounds: ptr={ptr} len={len} memory size={size}")]
    MemoryOutOfBounds { ptr: u64, len: u64, size: usize },

    #[error("failed to grow linear memory by {pages} page(s): {reason}")]
    GrowFailed { pages: u64, reason: String },

    #[error("host logic failed: {0}")]
    Execution(String),

    #[error("host logic interrupted after {0:?}")]
    Interrupted(Duration),

    #[error("guest allocator failed: {0}")]
    Allocator(String),

    #[error("unrecognized return type tag {0}")]
    UnrecognizedReturnType(u32),

    #[error("return type {0:?} is not implemented")]
    UnimplementedReturnType(ReturnType),

    #[error("argument {index} has unknown type tag {tag}")]
    UnknownArgumentType { index: u32, tag: u32 },

    #[error("bridge is busy (re-entrant call)")]
    Busy,

    #[error("guest called abort()")]
    Aborted,

    #[error("guest does not export {kind} `{name}`")]
    MissingExport { kind: &'static str, name: String },

    #[error("script engine error: {0}")]
    Engine(String),
}

impl BridgeError {
    /// Whether the error degrades to the `-1` sentinel instead of a trap.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::UnrecognizedReturnType(_)
                | BridgeError::UnimplementedReturnType(_)
                | BridgeError::UnknownArgumentType { .. }
        )
    }
}

impl From<rquickjs::Error> for BridgeError {
    fn from(e: rquickjs::Error) -> Self {
        BridgeError::Engine(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
