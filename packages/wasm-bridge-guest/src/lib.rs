//! Guest-side bindings for the object bridge.
//!
//! Wraps the raw `env` imports in a [`Call`] builder and a reference-counted
//! [`Handle`]. Build for `wasm32-unknown-unknown`; on other targets the
//! imports are replaced by stubs that panic, so only the packing logic is
//! usable there.

use std::alloc::Layout;

/// Return-type tags understood by the host's `acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReturnType {
    Void = 0,
    Integer = 1,
    Float = 2,
    BoxedObject = 3,
    BufferAllocated = 5,
    StringAllocated = 7,
}

/// Value `acquire` returns when the host rejects the control data.
pub const REJECTED: i32 = -1;

const ARG_INTEGER: u32 = 0;
const ARG_STRING: u32 = 1;
const ARG_HANDLE: u32 = 2;

mod sys {
    #[cfg(target_arch = "wasm32")]
    #[link(wasm_import_module = "env")]
    extern "C" {
        pub fn acquire(
            return_type: u32,
            module_len: u32,
            module_ptr: *const u8,
            source_len: u32,
            source_ptr: *const u8,
            arg_count: u32,
            args_ptr: *const u32,
        ) -> i32;
        pub fn retain(handle: u32);
        pub fn release(handle: u32);
        #[link_name = "memorySize"]
        pub fn memory_size() -> u32;
        #[link_name = "growMemory"]
        pub fn grow_memory(bytes: u32) -> u32;
        pub fn abort() -> !;
    }

    #[cfg(not(target_arch = "wasm32"))]
    mod native {
        fn unavailable(name: &str) -> ! {
            panic!("bridge import `{name}` is only available on wasm32")
        }

        pub unsafe fn acquire(
            _return_type: u32,
            _module_len: u32,
            _module_ptr: *const u8,
            _source_len: u32,
            _source_ptr: *const u8,
            _arg_count: u32,
            _args_ptr: *const u32,
        ) -> i32 {
            unavailable("acquire")
        }

        pub unsafe fn retain(_handle: u32) {
            unavailable("retain")
        }

        pub unsafe fn release(_handle: u32) {
            unavailable("release")
        }

        pub unsafe fn memory_size() -> u32 {
            unavailable("memorySize")
        }

        pub unsafe fn grow_memory(_bytes: u32) -> u32 {
            unavailable("growMemory")
        }

        pub unsafe fn abort() -> ! {
            unavailable("abort")
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub use native::*;
}

/// Allocate `size` bytes for the host to write a returned payload into.
///
/// Payloads are freed by [`take_allocated`], which rebuilds the same layout.
#[cfg(feature = "export-allocator")]
#[no_mangle]
pub extern "C" fn allocate(size: u32) -> *mut u8 {
    match Layout::from_size_align(size.max(1) as usize, 1) {
        Ok(layout) => unsafe { std::alloc::alloc(layout) },
        Err(_) => std::ptr::null_mut(),
    }
}

/// Copy out and free a length-prefixed payload written by the host.
///
/// # Safety
///
/// `ptr` must be a value just returned by `acquire` for a
/// `StringAllocated` or `BufferAllocated` call, and must not be used again.
pub unsafe fn take_allocated(ptr: *mut u8) -> Vec<u8> {
    let len = u32::from_le_bytes(ptr.cast::<[u8; 4]>().read_unaligned()) as usize;
    let bytes = std::slice::from_raw_parts(ptr.add(4), len).to_vec();
    if let Ok(layout) = Layout::from_size_align((len + 4).max(1), 1) {
        std::alloc::dealloc(ptr, layout);
    }
    bytes
}

/// Current size of linear memory in bytes, as the host sees it.
pub fn memory_size() -> u32 {
    unsafe { sys::memory_size() }
}

/// Grow linear memory by at least `bytes`; returns the new size.
pub fn grow_memory(bytes: u32) -> u32 {
    unsafe { sys::grow_memory(bytes) }
}

/// Trap the instance through the host.
pub fn abort() -> ! {
    unsafe { sys::abort() }
}

/// An owned reference to a host object.
///
/// Cloning retains the host entry and dropping releases it.
#[derive(Debug, PartialEq, Eq)]
pub struct Handle(u32);

impl Handle {
    /// Take ownership of a raw handle already counted for this caller.
    ///
    /// # Safety
    ///
    /// The caller must own one reference to `raw` and give it up.
    pub unsafe fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }

    /// Give up ownership without releasing.
    pub fn into_raw(self) -> u32 {
        let raw = self.0;
        std::mem::forget(self);
        raw
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        unsafe { sys::retain(self.0) };
        Handle(self.0)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe { sys::release(self.0) };
    }
}

/// One argument of a [`Call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    Integer(u32),
    Str(&'a str),
    Handle(u32),
}

impl Arg<'_> {
    fn triple(&self) -> [u32; 3] {
        match *self {
            Arg::Integer(value) => [ARG_INTEGER, value, 0],
            Arg::Str(text) => [ARG_STRING, text.as_ptr() as usize as u32, text.len() as u32],
            Arg::Handle(raw) => [ARG_HANDLE, raw, 0],
        }
    }
}

/// Flatten arguments into the `(tag, ptr, len)` array `acquire` reads.
pub fn pack_args(args: &[Arg<'_>]) -> Vec<u32> {
    args.iter().flat_map(|arg| arg.triple()).collect()
}

/// Builder for one `acquire` call.
///
/// ```ignore
/// let sum = Call::new("math", "return a + b").arg_int(2).arg_int(3).integer();
/// ```
#[derive(Debug, Clone)]
pub struct Call<'a> {
    module: &'a str,
    source: &'a str,
    args: Vec<Arg<'a>>,
}

impl<'a> Call<'a> {
    pub fn new(module: &'a str, source: &'a str) -> Self {
        Self {
            module,
            source,
            args: Vec::new(),
        }
    }

    pub fn arg_int(mut self, value: u32) -> Self {
        self.args.push(Arg::Integer(value));
        self
    }

    pub fn arg_str(mut self, text: &'a str) -> Self {
        self.args.push(Arg::Str(text));
        self
    }

    /// Borrow a handle for the call; ownership stays with the caller.
    pub fn arg_handle(mut self, handle: &'a Handle) -> Self {
        self.args.push(Arg::Handle(handle.as_raw()));
        self
    }

    pub fn args(&self) -> &[Arg<'a>] {
        &self.args
    }

    /// Issue the call and return the raw `acquire` result.
    pub fn raw(&self, return_type: ReturnType) -> i32 {
        let packed = pack_args(&self.args);
        unsafe {
            sys::acquire(
                return_type as u32,
                self.module.len() as u32,
                self.module.as_ptr(),
                self.source.len() as u32,
                self.source.as_ptr(),
                self.args.len() as u32,
                packed.as_ptr(),
            )
        }
    }

    pub fn void(&self) {
        self.raw(ReturnType::Void);
    }

    pub fn integer(&self) -> i32 {
        self.raw(ReturnType::Integer)
    }

    pub fn boxed(&self) -> Option<Handle> {
        self.handle_result(ReturnType::BoxedObject)
    }

    /// The host boxes numbers, so a float comes back as a handle.
    pub fn float(&self) -> Option<Handle> {
        self.handle_result(ReturnType::Float)
    }

    pub fn string(&self) -> Option<String> {
        self.allocated(ReturnType::StringAllocated)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.allocated(ReturnType::BufferAllocated)
    }

    fn handle_result(&self, return_type: ReturnType) -> Option<Handle> {
        match self.raw(return_type) {
            REJECTED => None,
            raw => Some(Handle(raw as u32)),
        }
    }

    fn allocated(&self, return_type: ReturnType) -> Option<Vec<u8>> {
        match self.raw(return_type) {
            REJECTED => None,
            ptr => Some(unsafe { take_allocated(ptr as u32 as usize as *mut u8) }),
        }
    }
}
