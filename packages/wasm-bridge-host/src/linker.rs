//! Wasmtime wiring for the bridge imports.
//!
//! The bridge lives in the store data behind an accessor, the same shape
//! wasmtime-wasi uses for its context. `acquire` takes the bridge out of
//! the store while it runs so the guest allocator can be called with the
//! full `Caller`; a nested bridge call in that window traps as busy.

use anyhow::Context as _;
use tracing::{debug, error};
use wasmtime::{Caller, Engine, Extern, Func, Instance, Linker, Memory, Module, Store};

use crate::abi::{
    IMPORT_ABORT, IMPORT_ACQUIRE, IMPORT_GROW_MEMORY, IMPORT_MEMORY_SIZE, IMPORT_MODULE,
    IMPORT_RELEASE, IMPORT_RETAIN, IMPORT_UNWIND_RESUME,
};
use crate::alloc::GuestAllocator;
use crate::bridge::{AcquireCall, Bridge, Region};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::memory::{self, GrowthPolicy, LinearMemory};

/// Store-side state for one guest instance.
pub struct BridgeHost {
    bridge: Option<Bridge>,
    memory_export: String,
    allocator_export: String,
    growth: GrowthPolicy,
}

impl BridgeHost {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        Ok(Self {
            bridge: Some(Bridge::new(config)?),
            memory_export: config.memory_export.clone(),
            allocator_export: config.allocator_export.clone(),
            growth: config.growth,
        })
    }

    /// `None` only while an `acquire` is in flight.
    pub fn bridge(&self) -> Option<&Bridge> {
        self.bridge.as_ref()
    }

    fn busy_bridge(&mut self) -> Result<&mut Bridge> {
        self.bridge.as_mut().ok_or(BridgeError::Busy)
    }
}

/// Linear memory and allocator of the calling instance.
struct CallerGuest<'a, 'c, T: 'static> {
    caller: &'a mut Caller<'c, T>,
    memory: Memory,
    allocator: Option<Func>,
    allocator_name: &'a str,
}

impl<T: 'static> LinearMemory for CallerGuest<'_, '_, T> {
    fn data(&self) -> &[u8] {
        self.memory.data(&*self.caller)
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut *self.caller)
    }

    fn grow_pages(&mut self, pages: u64) -> Result<()> {
        self.memory
            .grow(&mut *self.caller, pages)
            .map(drop)
            .map_err(|e| BridgeError::GrowFailed {
                pages,
                reason: format!("{e:#}"),
            })
    }
}

impl<T: 'static> GuestAllocator for CallerGuest<'_, '_, T> {
    fn allocate(&mut self, len: u32) -> Result<u32> {
        let func = self.allocator.ok_or_else(|| BridgeError::MissingExport {
            kind: "function",
            name: self.allocator_name.to_owned(),
        })?;
        let typed = func
            .typed::<u32, u32>(&*self.caller)
            .map_err(|e| BridgeError::Allocator(format!("{}: {e:#}", self.allocator_name)))?;
        typed
            .call(&mut *self.caller, len)
            .map_err(|e| BridgeError::Allocator(format!("{}({len}) trapped: {e:#}", self.allocator_name)))
    }
}

fn exported_memory<T: 'static>(caller: &mut Caller<'_, T>, name: &str) -> Result<Memory> {
    caller
        .get_export(name)
        .and_then(Extern::into_memory)
        .ok_or_else(|| BridgeError::MissingExport {
            kind: "memory",
            name: name.to_owned(),
        })
}

/// Register the bridge imports under `env`.
///
/// `get` projects the store data onto its [`BridgeHost`].
pub fn add_to_linker<T: 'static>(
    linker: &mut Linker<T>,
    get: fn(&mut T) -> &mut BridgeHost,
) -> anyhow::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        IMPORT_MEMORY_SIZE,
        move |mut caller: Caller<'_, T>| -> anyhow::Result<u32> {
            let name = get(caller.data_mut()).memory_export.clone();
            let memory = exported_memory(&mut caller, &name)?;
            Ok(u32::try_from(memory.data_size(&caller)).unwrap_or(u32::MAX))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        IMPORT_GROW_MEMORY,
        move |mut caller: Caller<'_, T>, requested: u32| -> anyhow::Result<u32> {
            let host = get(caller.data_mut());
            let (name, growth) = (host.memory_export.clone(), host.growth);
            let memory = exported_memory(&mut caller, &name)?;
            let mut guest = CallerGuest {
                caller: &mut caller,
                memory,
                allocator: None,
                allocator_name: "",
            };
            let size = memory::grow(&mut guest, requested, growth)?;
            debug!(requested, size, "memory grown");
            Ok(u32::try_from(size).unwrap_or(u32::MAX))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        IMPORT_ACQUIRE,
        move |mut caller: Caller<'_, T>,
              return_type: u32,
              module_len: u32,
              module_ptr: u32,
              source_len: u32,
              source_ptr: u32,
              arg_count: u32,
              args_ptr: u32|
              -> anyhow::Result<i32> {
            let call = AcquireCall {
                return_type,
                module: Region::new(module_ptr, module_len),
                source: Region::new(source_ptr, source_len),
                arg_count,
                args_ptr,
            };

            let host = get(caller.data_mut());
            let memory_name = host.memory_export.clone();
            let allocator_name = host.allocator_export.clone();
            let mut bridge = host.bridge.take().ok_or(BridgeError::Busy)?;

            let result = match exported_memory(&mut caller, &memory_name) {
                Ok(memory) => {
                    let allocator = caller.get_export(&allocator_name).and_then(Extern::into_func);
                    let mut guest = CallerGuest {
                        caller: &mut caller,
                        memory,
                        allocator,
                        allocator_name: &allocator_name,
                    };
                    bridge.acquire(&mut guest, &call)
                }
                Err(e) => Err(e),
            };

            get(caller.data_mut()).bridge = Some(bridge);
            Ok(result?)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        IMPORT_RETAIN,
        move |mut caller: Caller<'_, T>, handle: u32| -> anyhow::Result<()> {
            get(caller.data_mut()).busy_bridge()?.retain(handle)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        IMPORT_RELEASE,
        move |mut caller: Caller<'_, T>, handle: u32| -> anyhow::Result<()> {
            get(caller.data_mut()).busy_bridge()?.release(handle)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        IMPORT_ABORT,
        |_caller: Caller<'_, T>| -> anyhow::Result<()> {
            error!("guest aborted");
            Err(BridgeError::Aborted.into())
        },
    )?;

    linker.func_wrap(IMPORT_MODULE, IMPORT_UNWIND_RESUME, |_caller: Caller<'_, T>| {})?;

    Ok(())
}

/// A guest module instantiated against a fresh bridge.
pub struct GuestInstance {
    store: Store<BridgeHost>,
    instance: Instance,
}

fn host_state(host: &mut BridgeHost) -> &mut BridgeHost {
    host
}

impl GuestInstance {
    pub fn new(engine: &Engine, module: &Module, config: &BridgeConfig) -> anyhow::Result<Self> {
        let mut linker = Linker::new(engine);
        add_to_linker(&mut linker, host_state)?;

        let host = BridgeHost::new(config).context("creating bridge")?;
        let mut store = Store::new(engine, host);
        let instance = linker
            .instantiate(&mut store, module)
            .context("instantiating guest module")?;
        Ok(Self { store, instance })
    }

    /// Call a `() -> i32` or `() -> ()` export.
    pub fn call_entry(&mut self, name: &str) -> anyhow::Result<Option<i32>> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .with_context(|| format!("guest does not export function `{name}`"))?;

        if let Ok(entry) = func.typed::<(), i32>(&self.store) {
            return Ok(Some(entry.call(&mut self.store, ())?));
        }
        let entry = func
            .typed::<(), ()>(&self.store)
            .with_context(|| format!("export `{name}` must have type () -> () or () -> i32"))?;
        entry.call(&mut self.store, ())?;
        Ok(None)
    }

    pub fn bridge(&self) -> Option<&Bridge> {
        self.store.data().bridge()
    }

    pub fn instance(&self) -> Instance {
        self.instance
    }

    pub fn store(&self) -> &Store<BridgeHost> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store<BridgeHost> {
        &mut self.store
    }
}
