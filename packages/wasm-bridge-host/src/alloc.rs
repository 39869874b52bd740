//! Collaboration with the guest's own allocator.
//!
//! Returned buffers are written into memory the guest hands out through its
//! exported allocation function. Ownership moves to the guest as soon as the
//! pointer is returned; the host never frees it.

use crate::abi::LENGTH_PREFIX;
use crate::error::{BridgeError, Result};
use crate::memory::LinearMemory;

/// The guest-exported `allocate(byteCount) -> pointer` capability.
pub trait GuestAllocator {
    /// May grow linear memory; callers must re-derive views afterwards.
    fn allocate(&mut self, len: u32) -> Result<u32>;
}

/// Allocate `LENGTH_PREFIX + payload.len()` bytes and write
/// `[u32 LE length][payload]` there. Returns the pointer to the prefix.
pub fn write_length_prefixed<G>(guest: &mut G, payload: &[u8]) -> Result<u32>
where
    G: LinearMemory + GuestAllocator + ?Sized,
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| len.checked_add(LENGTH_PREFIX).is_some())
        .ok_or_else(|| {
            BridgeError::Allocator(format!("payload of {} bytes exceeds u32", payload.len()))
        })?;

    let ptr = guest.allocate(len + LENGTH_PREFIX)?;
    if ptr == 0 {
        return Err(BridgeError::Allocator(format!(
            "allocation of {} bytes returned null",
            len + LENGTH_PREFIX
        )));
    }
    let base = u64::from(ptr);
    guest
        .write(base, &len.to_le_bytes())
        .and_then(|()| guest.write(base + u64::from(LENGTH_PREFIX), payload))
        .map_err(|e| BridgeError::Allocator(format!("allocation at {ptr} is unusable: {e}")))?;
    Ok(ptr)
}
