//! Refcounted table of host objects addressed by small integers.
//!
//! Slot 0 is a permanent sentinel. Released slots are tombstoned and never
//! reused; the table only shrinks when the last slot itself is released.

use tracing::trace;

use crate::error::{BridgeError, Result};

#[derive(Debug)]
pub struct HandleEntry<T> {
    pub refcount: u32,
    pub object: T,
}

#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Option<HandleEntry<T>>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self { slots: vec![None] }
    }

    /// Box `object` with a refcount of 1 and return its handle.
    pub fn allocate(&mut self, object: T) -> u32 {
        let handle = self.slots.len() as u32;
        self.slots.push(Some(HandleEntry {
            refcount: 1,
            object,
        }));
        trace!(handle, "handle allocated");
        handle
    }

    pub fn retain(&mut self, handle: u32) -> Result<()> {
        let entry = self.entry_mut(handle)?;
        entry.refcount = entry.refcount.saturating_add(1);
        trace!(handle, refcount = entry.refcount, "handle retained");
        Ok(())
    }

    /// Drop one reference; returns the object once the last one is gone.
    pub fn release(&mut self, handle: u32) -> Result<Option<T>> {
        let entry = self.entry_mut(handle)?;
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            trace!(handle, refcount = entry.refcount, "handle released");
            return Ok(None);
        }

        let freed = self.slots[handle as usize].take().map(|e| e.object);
        if handle as usize + 1 == self.slots.len() {
            self.slots.pop();
        }
        trace!(handle, len = self.slots.len(), "handle freed");
        Ok(freed)
    }

    pub fn get(&self, handle: u32) -> Result<&T> {
        self.slot(handle).map(|e| &e.object)
    }

    pub fn refcount(&self, handle: u32) -> Result<u32> {
        self.slot(handle).map(|e| e.refcount)
    }

    /// Slot count, including the sentinel and tombstones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when only the sentinel slot remains.
    pub fn is_empty(&self) -> bool {
        self.slots.len() <= 1
    }

    /// Number of live entries.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn slot(&self, handle: u32) -> Result<&HandleEntry<T>> {
        self.slots
            .get(handle as usize)
            .and_then(Option::as_ref)
            .ok_or(BridgeError::InvalidHandle(handle))
    }

    fn entry_mut(&mut self, handle: u32) -> Result<&mut HandleEntry<T>> {
        self.slots
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or(BridgeError::InvalidHandle(handle))
    }
}
