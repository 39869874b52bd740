//! In-memory guest used by unit tests.

use crate::alloc::GuestAllocator;
use crate::error::{BridgeError, Result};
use crate::memory::{LinearMemory, PAGE_SIZE};

/// Default start of the bump heap; everything below is free for fixtures.
const HEAP_BASE: u32 = 32 * 1024;

/// A `Vec<u8>` standing in for a guest's linear memory plus a bump
/// allocator that grows memory on demand, like a guest `malloc` would.
pub struct VecMemory {
    bytes: Vec<u8>,
    heap: u32,
    allocations: Vec<(u32, u32)>,
    bogus: bool,
    null: bool,
}

impl VecMemory {
    pub fn new(pages: u64) -> Self {
        Self {
            bytes: vec![0; (pages * PAGE_SIZE) as usize],
            heap: HEAP_BASE,
            allocations: Vec::new(),
            bogus: false,
            null: false,
        }
    }

    pub fn with_heap_at(mut self, offset: u32) -> Self {
        self.heap = offset;
        self
    }

    /// Make `allocate` return pointers past the end of memory.
    pub fn with_bogus_allocations(mut self) -> Self {
        self.bogus = true;
        self
    }

    /// Make `allocate` return 0, as a failing `malloc` does.
    pub fn with_null_allocations(mut self) -> Self {
        self.null = true;
        self
    }

    pub fn allocations(&self) -> &[(u32, u32)] {
        &self.allocations
    }

    /// Write `s` at `ptr` and return `(ptr, len)`.
    pub fn put_str(&mut self, ptr: u32, s: &str) -> (u32, u32) {
        self.write(u64::from(ptr), s.as_bytes()).unwrap();
        (ptr, s.len() as u32)
    }

    pub fn write_args(&mut self, ptr: u32, args: &[(u32, u32, u32)]) {
        let mut packed = Vec::with_capacity(args.len() * 12);
        for (tag, p, len) in args {
            packed.extend_from_slice(&tag.to_le_bytes());
            packed.extend_from_slice(&p.to_le_bytes());
            packed.extend_from_slice(&len.to_le_bytes());
        }
        self.write(u64::from(ptr), &packed).unwrap();
    }
}

impl LinearMemory for VecMemory {
    fn data(&self) -> &[u8] {
        &self.bytes
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn grow_pages(&mut self, pages: u64) -> Result<()> {
        let new_len = self.bytes.len() + (pages * PAGE_SIZE) as usize;
        self.bytes.resize(new_len, 0);
        Ok(())
    }
}

impl GuestAllocator for VecMemory {
    fn allocate(&mut self, len: u32) -> Result<u32> {
        if self.null {
            return Ok(0);
        }
        if self.bogus {
            return Ok(self.bytes.len() as u32);
        }
        let ptr = self.heap;
        let end = ptr
            .checked_add(len)
            .ok_or_else(|| BridgeError::Allocator("heap exhausted".into()))?;
        while (end as usize) > self.bytes.len() {
            self.grow_pages(1)?;
        }
        self.heap = end;
        self.allocations.push((ptr, len));
        Ok(ptr)
    }
}
