//! Host side of the wasm object bridge.
//!
//! A sandboxed guest reaches host objects only through small integer
//! handles. It asks the host to run a piece of JavaScript on its behalf
//! (`acquire`), receives the result as an integer, a boxed handle or a
//! length-prefixed buffer in its own memory, and manages handle lifetimes
//! with `retain` / `release`.
//!
//! - [`memory`]: view over the guest's linear memory
//! - [`handles`]: refcounted handle table
//! - [`alloc`]: writing results through the guest's allocator
//! - [`script`]: the embedded engine and per-module contexts
//! - [`bridge`]: the `acquire` marshaller tying these together
//! - [`linker`]: wasmtime imports

pub mod abi;
pub mod alloc;
pub mod bridge;
pub mod config;
pub mod error;
pub mod handles;
pub mod linker;
pub mod memory;
pub mod script;

#[cfg(test)]
pub(crate) mod test_support;

pub use abi::{Argument, ReturnType};
pub use bridge::{AcquireCall, Bridge, Region};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use handles::HandleTable;
pub use linker::{add_to_linker, BridgeHost, GuestInstance};
pub use memory::{GrowthPolicy, LinearMemory, PAGE_SIZE};
