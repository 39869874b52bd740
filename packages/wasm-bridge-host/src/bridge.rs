//! The guest-facing bridge: handle table, module contexts and the `acquire`
//! call marshaller.
//!
//! A [`Bridge`] owns all mutable bridge state, so independent guests get
//! independent bridges. Memory and the guest allocator are passed in per
//! call because they belong to the running instance, not to the bridge;
//! `memorySize` / `growMemory` need no bridge state and live in [`crate::memory`].

use tracing::{debug, error, warn};

use crate::abi::{self, ArgTag, Argument, ReturnType, SENTINEL_FAILURE, SENTINEL_VOID};
use crate::alloc::{self, GuestAllocator};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::handles::HandleTable;
use crate::memory::LinearMemory;
use crate::script::{HostValue, ScriptEngine};

/// A `(ptr, len)` pair addressing guest memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    pub ptr: u32,
    pub len: u32,
}

impl Region {
    pub fn new(ptr: u32, len: u32) -> Self {
        Self { ptr, len }
    }
}

/// Raw operands of one `acquire` call, as received from the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireCall {
    pub return_type: u32,
    pub module: Region,
    pub source: Region,
    pub arg_count: u32,
    pub args_ptr: u32,
}

pub struct Bridge {
    // Boxed values are engine objects; drop them before the engine.
    handles: HandleTable<HostValue>,
    engine: ScriptEngine,
}

impl Bridge {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        Ok(Self {
            handles: HandleTable::new(),
            engine: ScriptEngine::new(&config.script_limits())?,
        })
    }

    pub fn handles(&self) -> &HandleTable<HostValue> {
        &self.handles
    }

    pub fn engine(&self) -> &ScriptEngine {
        &self.engine
    }

    /// Run one guest call. Malformed control data yields `-1`; any other
    /// failure is returned as an error and must abort the guest call.
    pub fn acquire<G>(&mut self, guest: &mut G, call: &AcquireCall) -> Result<i32>
    where
        G: LinearMemory + GuestAllocator + ?Sized,
    {
        match self.try_acquire(guest, call) {
            Ok(value) => Ok(value),
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, return_type = call.return_type, "acquire rejected");
                Ok(SENTINEL_FAILURE)
            }
            Err(e) => {
                error!(error = %e, return_type = call.return_type, "acquire failed");
                Err(e)
            }
        }
    }

    fn try_acquire<G>(&mut self, guest: &mut G, call: &AcquireCall) -> Result<i32>
    where
        G: LinearMemory + GuestAllocator + ?Sized,
    {
        let return_type = ReturnType::parse(call.return_type)?;
        let module = guest.read_str(call.module.ptr, call.module.len)?;
        let source = guest.read_str(call.source.ptr, call.source.len)?;
        let args = self.decode_args(&*guest, call.args_ptr, call.arg_count)?;

        debug!(
            module = %module,
            ?return_type,
            argc = args.len(),
            "acquire"
        );

        let ret = self.engine.invoke(&module, &source, &args)?;
        self.encode(guest, return_type, ret)
    }

    fn decode_args<M>(&self, memory: &M, args_ptr: u32, count: u32) -> Result<Vec<Argument<HostValue>>>
    where
        M: LinearMemory + ?Sized,
    {
        let raw = abi::read_raw_args(memory, args_ptr, count)?;
        let mut args = Vec::with_capacity(raw.len());
        for (index, arg) in raw.into_iter().enumerate() {
            let tag = ArgTag::from_tag(arg.tag).ok_or(BridgeError::UnknownArgumentType {
                index: index as u32,
                tag: arg.tag,
            })?;
            args.push(match tag {
                ArgTag::Integer => Argument::Integer(arg.ptr),
                ArgTag::String => Argument::String(memory.read_str(arg.ptr, arg.len)?),
                ArgTag::Handle => Argument::Handle(self.handles.get(arg.ptr)?.clone()),
            });
        }
        Ok(args)
    }

    fn encode<G>(&mut self, guest: &mut G, return_type: ReturnType, ret: HostValue) -> Result<i32>
    where
        G: LinearMemory + GuestAllocator + ?Sized,
    {
        match return_type {
            ReturnType::Void => Ok(SENTINEL_VOID),
            ReturnType::Integer => self.engine.to_i32(&ret),
            ReturnType::Float | ReturnType::BoxedObject => Ok(self.handles.allocate(ret) as i32),
            ReturnType::StringAllocated => {
                let bytes = self.engine.to_utf8(&ret)?;
                alloc::write_length_prefixed(guest, &bytes).map(|ptr| ptr as i32)
            }
            ReturnType::BufferAllocated => {
                let bytes = self.engine.to_bytes(&ret)?;
                alloc::write_length_prefixed(guest, &bytes).map(|ptr| ptr as i32)
            }
            ReturnType::BufferProvided | ReturnType::StringProvided | ReturnType::FunctionBoxed => {
                Err(BridgeError::UnimplementedReturnType(return_type))
            }
        }
    }

    pub fn retain(&mut self, handle: u32) -> Result<()> {
        self.handles.retain(handle)
    }

    pub fn release(&mut self, handle: u32) -> Result<()> {
        self.handles.release(handle).map(drop)
    }

    /// JSON snapshot of a boxed object.
    pub fn inspect(&self, handle: u32) -> Result<Option<serde_json::Value>> {
        let value = self.handles.get(handle)?;
        self.engine.to_json(value)
    }

    /// Box a host-built value so it can be handed to the guest.
    pub fn box_json(&mut self, json: &serde_json::Value) -> Result<u32> {
        let value = self.engine.value_from_json(json)?;
        Ok(self.handles.allocate(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;
    use crate::test_support::VecMemory;
    use serde_json::json;

    const MODULE_AT: u32 = 0;
    const SOURCE_AT: u32 = 256;
    const ARGS_AT: u32 = 4096;
    const STRINGS_AT: u32 = 8192;

    fn bridge() -> Bridge {
        Bridge::new(&BridgeConfig::default()).unwrap()
    }

    fn call(mem: &mut VecMemory, return_type: u32, module: &str, source: &str) -> AcquireCall {
        let (mp, ml) = mem.put_str(MODULE_AT, module);
        let (sp, sl) = mem.put_str(SOURCE_AT, source);
        AcquireCall {
            return_type,
            module: Region::new(mp, ml),
            source: Region::new(sp, sl),
            arg_count: 0,
            args_ptr: ARGS_AT,
        }
    }

    fn with_args(mut call: AcquireCall, mem: &mut VecMemory, args: &[(u32, u32, u32)]) -> AcquireCall {
        mem.write_args(ARGS_AT, args);
        call.arg_count = args.len() as u32;
        call
    }

    #[test]
    fn boxed_object_scenario() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, ReturnType::BoxedObject.tag(), "m", "return {a:1}");

        let h = bridge.acquire(&mut mem, &c).unwrap();
        assert!(h > 0);
        assert_eq!(bridge.inspect(h as u32).unwrap(), Some(json!({"a": 1})));
        assert_eq!(bridge.handles().refcount(h as u32).unwrap(), 1);

        bridge.release(h as u32).unwrap();
        assert!(matches!(
            bridge.inspect(h as u32),
            Err(BridgeError::InvalidHandle(_))
        ));
    }

    #[test]
    fn string_allocated_scenario() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, ReturnType::StringAllocated.tag(), "m", "return \"hi\"");

        let p = bridge.acquire(&mut mem, &c).unwrap() as u32;
        assert_eq!(mem.read_u32_le(p).unwrap(), 2);
        assert_eq!(mem.slice(u64::from(p) + 4, 2).unwrap(), b"hi");
        assert_eq!(mem.allocations(), &[(p, 6)]);
    }

    #[test]
    fn string_allocated_encodes_utf8_length() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, ReturnType::StringAllocated.tag(), "m", "return '\u{e9}\u{1f600}'");

        let p = bridge.acquire(&mut mem, &c).unwrap() as u32;
        let expected = "\u{e9}\u{1f600}".as_bytes();
        assert_eq!(mem.read_u32_le(p).unwrap() as usize, expected.len());
        assert_eq!(mem.slice(u64::from(p) + 4, expected.len() as u64).unwrap(), expected);
    }

    #[test]
    fn string_allocated_replaces_lone_surrogates() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, ReturnType::StringAllocated.tag(), "m", r"return 'a\uD800b'");

        let p = bridge.acquire(&mut mem, &c).unwrap() as u32;
        assert_eq!(mem.read_u32_le(p).unwrap(), 5);
        assert_eq!(
            mem.slice(u64::from(p) + 4, 5).unwrap(),
            &[0x61, 0xEF, 0xBF, 0xBD, 0x62]
        );
    }

    #[test]
    fn buffer_allocated_copies_any_buffer_view() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let cases: [(&str, &[u8]); 2] = [
            ("return new Int8Array([1, -1])", &[1, 255]),
            (
                "const b = new Uint8Array([9, 8, 7, 6]).buffer; return new DataView(b, 1, 2)",
                &[8, 7],
            ),
        ];
        for (src, expected) in cases {
            let c = call(&mut mem, ReturnType::BufferAllocated.tag(), "m", src);
            let p = bridge.acquire(&mut mem, &c).unwrap() as u32;
            assert_eq!(mem.read_u32_le(p).unwrap() as usize, expected.len(), "{src}");
            assert_eq!(
                mem.slice(u64::from(p) + 4, expected.len() as u64).unwrap(),
                expected,
                "{src}"
            );
        }
    }

    #[test]
    fn buffer_allocated_copies_typed_arrays() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(
            &mut mem,
            ReturnType::BufferAllocated.tag(),
            "m",
            "return new Uint8Array([0, 1, 2, 250])",
        );

        let p = bridge.acquire(&mut mem, &c).unwrap() as u32;
        assert_eq!(mem.read_u32_le(p).unwrap(), 4);
        assert_eq!(mem.slice(u64::from(p) + 4, 4).unwrap(), &[0, 1, 2, 250]);
    }

    #[test]
    fn void_returns_zero_and_integer_passes_through() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);

        let c = call(&mut mem, ReturnType::Void.tag(), "m", "return 123");
        assert_eq!(bridge.acquire(&mut mem, &c).unwrap(), 0);

        let c = call(&mut mem, ReturnType::Integer.tag(), "m", "return -77");
        assert_eq!(bridge.acquire(&mut mem, &c).unwrap(), -77);
        assert_eq!(bridge.handles().len(), 1);
    }

    #[test]
    fn float_results_are_boxed() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, ReturnType::Float.tag(), "m", "return 1.5");

        let h = bridge.acquire(&mut mem, &c).unwrap() as u32;
        assert_eq!(bridge.inspect(h).unwrap(), Some(json!(1.5)));
    }

    #[test]
    fn arguments_decode_by_tag() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let boxed = bridge.box_json(&json!({"x": 5})).unwrap();
        let (sp, sl) = mem.put_str(STRINGS_AT, "hi");

        let c = call(
            &mut mem,
            ReturnType::BoxedObject.tag(),
            "m",
            "return [$0, typeof $0, $1, $2.x]",
        );
        let c = with_args(c, &mut mem, &[(0, 42, 0), (1, sp, sl), (2, boxed, 0)]);

        let h = bridge.acquire(&mut mem, &c).unwrap() as u32;
        assert_eq!(
            bridge.inspect(h).unwrap(),
            Some(json!([42, "number", "hi", 5]))
        );
    }

    #[test]
    fn handle_arguments_reference_the_boxed_object() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);

        let c = call(&mut mem, ReturnType::BoxedObject.tag(), "m", "return {hits: 0}");
        let h = bridge.acquire(&mut mem, &c).unwrap() as u32;

        let c = call(&mut mem, ReturnType::Integer.tag(), "m", "$0.hits += 1; return $0.hits");
        let c = with_args(c, &mut mem, &[(2, h, 0)]);
        assert_eq!(bridge.acquire(&mut mem, &c).unwrap(), 1);
        assert_eq!(bridge.acquire(&mut mem, &c).unwrap(), 2);
        assert_eq!(bridge.inspect(h).unwrap(), Some(json!({"hits": 2})));
    }

    #[test]
    fn module_context_persists_between_calls() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, ReturnType::Integer.tag(), "counter", "return this.n = (this.n || 0) + 1");

        assert_eq!(bridge.acquire(&mut mem, &c).unwrap(), 1);
        assert_eq!(bridge.acquire(&mut mem, &c).unwrap(), 2);

        let c = call(&mut mem, ReturnType::Integer.tag(), "fresh", "return this.n = (this.n || 0) + 1");
        assert_eq!(bridge.acquire(&mut mem, &c).unwrap(), 1);
        assert_eq!(bridge.engine().module_count(), 2);
    }

    #[test]
    fn unknown_return_type_changes_nothing() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, 99, "m", "this.touched = 1; return {}");

        assert_eq!(bridge.acquire(&mut mem, &c).unwrap(), -1);
        assert_eq!(bridge.handles().len(), 1);
        assert_eq!(bridge.engine().module_count(), 0);
        assert!(mem.allocations().is_empty());
    }

    #[test]
    fn reserved_return_types_are_rejected_without_running() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        for ty in [
            ReturnType::BufferProvided,
            ReturnType::StringProvided,
            ReturnType::FunctionBoxed,
        ] {
            let c = call(&mut mem, ty.tag(), "m", "throw new Error('must not run')");
            assert_eq!(bridge.acquire(&mut mem, &c).unwrap(), -1);
        }
        assert_eq!(bridge.engine().module_count(), 0);
    }

    #[test]
    fn unknown_argument_tag_is_rejected() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, ReturnType::Integer.tag(), "m", "return 1");
        let c = with_args(c, &mut mem, &[(0, 1, 0), (9, 0, 0)]);

        assert_eq!(bridge.acquire(&mut mem, &c).unwrap(), -1);
        assert_eq!(bridge.engine().module_count(), 0);
    }

    #[test]
    fn stale_handle_argument_faults() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, ReturnType::Void.tag(), "m", "return");
        let c = with_args(c, &mut mem, &[(2, 3, 0)]);

        let err = bridge.acquire(&mut mem, &c).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidHandle(3)));
        assert_eq!(bridge.engine().module_count(), 0);
    }

    #[test]
    fn out_of_bounds_regions_fault() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let mut c = call(&mut mem, ReturnType::Void.tag(), "m", "return");
        c.source = Region::new(PAGE_SIZE as u32 - 2, 10);
        assert!(matches!(
            bridge.acquire(&mut mem, &c),
            Err(BridgeError::MemoryOutOfBounds { .. })
        ));

        let c = call(&mut mem, ReturnType::Void.tag(), "m", "return");
        let c = AcquireCall {
            arg_count: 1,
            args_ptr: PAGE_SIZE as u32 - 4,
            ..c
        };
        assert!(matches!(
            bridge.acquire(&mut mem, &c),
            Err(BridgeError::MemoryOutOfBounds { .. })
        ));

        let (sp, _) = mem.put_str(STRINGS_AT, "x");
        let c = call(&mut mem, ReturnType::Void.tag(), "m", "return");
        let c = with_args(c, &mut mem, &[(1, sp, u32::MAX)]);
        assert!(matches!(
            bridge.acquire(&mut mem, &c),
            Err(BridgeError::MemoryOutOfBounds { .. })
        ));
    }

    #[test]
    fn exceptions_are_fatal() {
        let mut bridge = bridge();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, ReturnType::BoxedObject.tag(), "m", "throw new TypeError('nope')");

        let err = bridge.acquire(&mut mem, &c).unwrap_err();
        assert!(matches!(err, BridgeError::Execution(ref m) if m.contains("nope")));
        assert_eq!(bridge.handles().len(), 1);
    }

    #[test]
    fn timeouts_are_fatal() {
        let config = BridgeConfig {
            execution_timeout_ms: Some(50),
            ..BridgeConfig::default()
        };
        let mut bridge = Bridge::new(&config).unwrap();
        let mut mem = VecMemory::new(1);
        let c = call(&mut mem, ReturnType::Void.tag(), "m", "while (true) {}");

        assert!(matches!(
            bridge.acquire(&mut mem, &c),
            Err(BridgeError::Interrupted(_))
        ));
    }

    #[test]
    fn retain_and_release_follow_refcounts() {
        let mut bridge = bridge();
        let h = bridge.box_json(&json!("v")).unwrap();
        bridge.retain(h).unwrap();
        bridge.release(h).unwrap();
        assert!(bridge.inspect(h).is_ok());
        bridge.release(h).unwrap();
        assert!(matches!(bridge.release(h), Err(BridgeError::InvalidHandle(_))));
        assert!(matches!(bridge.retain(h), Err(BridgeError::InvalidHandle(_))));
    }
}
