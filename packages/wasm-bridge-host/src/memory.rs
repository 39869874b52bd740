//! Host view over the guest's linear memory.
//!
//! Implementors hand out the current byte buffer; every accessor here
//! re-reads it, so no slice outlives a call that may grow memory.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{BridgeError, Result};

/// WebAssembly page size.
pub const PAGE_SIZE: u64 = 64 * 1024;

/// How many pages `growMemory(requested)` adds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthPolicy {
    /// `(requested + PAGE_SIZE) / PAGE_SIZE` pages, always at least one.
    /// This is what deployed guests were built against.
    #[default]
    Slack,
    /// `ceil(requested / PAGE_SIZE)` pages; zero requests do nothing.
    Exact,
}

impl GrowthPolicy {
    pub fn pages_for(self, requested: u32) -> u64 {
        let requested = u64::from(requested);
        match self {
            GrowthPolicy::Slack => (requested + PAGE_SIZE) / PAGE_SIZE,
            GrowthPolicy::Exact => requested.div_ceil(PAGE_SIZE),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GrowthPolicy::Slack => "slack",
            GrowthPolicy::Exact => "exact",
        }
    }
}

impl fmt::Display for GrowthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrowthPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slack" => Ok(GrowthPolicy::Slack),
            "exact" => Ok(GrowthPolicy::Exact),
            other => Err(format!(
                "invalid growth policy {other:?} (expected one of: slack, exact)"
            )),
        }
    }
}

/// A guest's linear memory as seen from the host.
pub trait LinearMemory {
    fn data(&self) -> &[u8];

    fn data_mut(&mut self) -> &mut [u8];

    /// Grow by exactly `pages` pages.
    fn grow_pages(&mut self, pages: u64) -> Result<()>;

    fn size(&self) -> usize {
        self.data().len()
    }

    /// Bounds-checked view of `[ptr, ptr + len)`.
    fn slice(&self, ptr: u64, len: u64) -> Result<&[u8]> {
        let data = self.data();
        let range = checked_range(ptr, len, data.len())?;
        Ok(&data[range])
    }

    /// Decode `[ptr, ptr + len)` as UTF-8, replacing invalid sequences.
    fn read_str(&self, ptr: u32, len: u32) -> Result<String> {
        let bytes = self.slice(u64::from(ptr), u64::from(len))?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn read_u32_le(&self, ptr: u32) -> Result<u32> {
        let b = self.slice(u64::from(ptr), 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write(&mut self, ptr: u64, bytes: &[u8]) -> Result<()> {
        let data = self.data_mut();
        let range = checked_range(ptr, bytes.len() as u64, data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }
}

fn checked_range(ptr: u64, len: u64, size: usize) -> Result<std::ops::Range<usize>> {
    match ptr.checked_add(len) {
        Some(end) if end <= size as u64 => Ok(ptr as usize..end as usize),
        _ => Err(BridgeError::MemoryOutOfBounds { ptr, len, size }),
    }
}

/// Grow `memory` to cover `requested` more bytes and return the new size.
pub fn grow<M: LinearMemory + ?Sized>(
    memory: &mut M,
    requested: u32,
    policy: GrowthPolicy,
) -> Result<usize> {
    let pages = policy.pages_for(requested);
    if pages > 0 {
        memory.grow_pages(pages)?;
    }
    Ok(memory.size())
}
