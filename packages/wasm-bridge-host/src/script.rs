//! Host logic supplied by the guest as JavaScript source.
//!
//! Each call compiles the source with the global `Function` constructor into
//! a function of `$0 .. $n-1`, then runs it once with the calling module's
//! context object as `this`. Module contexts persist for the engine's
//! lifetime so state can accumulate across calls from the same module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::convert::Coerced;
use rquickjs::function::{Rest, This};
use rquickjs::{Context, Ctx, FromJs, Function, Object, Persistent, Runtime, TypedArray, Value};
use tracing::debug;

use crate::abi::Argument;
use crate::error::{BridgeError, Result};

/// A host value kept alive outside of any engine scope.
pub type HostValue = Persistent<Value<'static>>;

type ModuleScope = Persistent<Object<'static>>;

type Helper = Persistent<Function<'static>>;

/// String conversion with lone surrogates replaced by U+FFFD, so the result
/// always has a UTF-8 encoding.
const WELL_FORMED_STRING: &str = r"(function (v) {
    return String(v).replace(
        /[\uD800-\uDBFF](?![\uDC00-\uDFFF])|(?<![\uD800-\uDBFF])[\uDC00-\uDFFF]/g,
        '\uFFFD');
})";

/// A `Uint8Array` over the bytes of any buffer or buffer view, else `undefined`.
const BYTE_VIEW: &str = r"(function (v) {
    if (v instanceof ArrayBuffer) return new Uint8Array(v);
    if (ArrayBuffer.isView(v)) return new Uint8Array(v.buffer, v.byteOffset, v.byteLength);
    return undefined;
})";

/// Resource limits applied to the embedded runtime.
#[derive(Debug, Clone, Default)]
pub struct ScriptLimits {
    /// Abort host logic that runs longer than this.
    pub timeout: Option<Duration>,
    pub memory_limit: Option<usize>,
    pub max_stack: Option<usize>,
}

pub struct ScriptEngine {
    // Persistent values must be dropped before the runtime that owns them.
    modules: HashMap<String, ModuleScope>,
    well_formed: Helper,
    byte_view: Helper,
    deadline: Arc<Mutex<Option<Instant>>>,
    timeout: Option<Duration>,
    context: Context,
    #[allow(dead_code)]
    runtime: Runtime,
}

impl ScriptEngine {
    pub fn new(limits: &ScriptLimits) -> Result<Self> {
        let runtime = Runtime::new()?;
        if let Some(bytes) = limits.memory_limit {
            runtime.set_memory_limit(bytes);
        }
        if let Some(bytes) = limits.max_stack {
            runtime.set_max_stack_size(bytes);
        }

        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let watched = Arc::clone(&deadline);
        runtime.set_interrupt_handler(Some(Box::new(move || {
            watched
                .lock()
                .map(|d| d.is_some_and(|at| Instant::now() >= at))
                .unwrap_or(false)
        })));

        let context = Context::full(&runtime)?;
        let (well_formed, byte_view) = context.with(|ctx| -> Result<(Helper, Helper)> {
            let well_formed: Function = ctx.eval(WELL_FORMED_STRING)?;
            let byte_view: Function = ctx.eval(BYTE_VIEW)?;
            Ok((Persistent::save(&ctx, well_formed), Persistent::save(&ctx, byte_view)))
        })?;
        Ok(Self {
            modules: HashMap::new(),
            well_formed,
            byte_view,
            deadline,
            timeout: limits.timeout,
            context,
            runtime,
        })
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Compile `source` and run it on behalf of `module`.
    pub fn invoke(
        &mut self,
        module: &str,
        source: &str,
        args: &[Argument<HostValue>],
    ) -> Result<HostValue> {
        let scope = self.module_scope(module)?;
        self.arm_deadline();

        let result = self.context.with(|ctx| -> Result<HostValue> {
            let this = scope.restore(&ctx)?;

            let mut parts: Vec<String> = (0..args.len()).map(|i| format!("${i}")).collect();
            parts.push(source.to_owned());
            let constructor: Function = ctx.globals().get("Function")?;
            let func: Function = constructor
                .call((Rest(parts),))
                .map_err(|e| failure(&ctx, e))?;

            let values = args
                .iter()
                .map(|arg| argument_to_js(&ctx, arg))
                .collect::<Result<Vec<_>>>()?;
            let ret: Value = func
                .call((This(this), Rest(values)))
                .map_err(|e| failure(&ctx, e))?;
            Ok(Persistent::save(&ctx, ret))
        });

        let expired = self.disarm_deadline();
        match (result, self.timeout) {
            (Err(BridgeError::Execution(_)), Some(timeout)) if expired => {
                Err(BridgeError::Interrupted(timeout))
            }
            (result, _) => result,
        }
    }

    /// ToInt32, as a wasm `i32` return would apply.
    pub fn to_i32(&self, value: &HostValue) -> Result<i32> {
        self.context.with(|ctx| -> Result<i32> {
            let v = value.clone().restore(&ctx)?;
            Coerced::<i32>::from_js(&ctx, v)
                .map(|c| c.0)
                .map_err(|e| failure(&ctx, e))
        })
    }

    /// UTF-8 encoding of the value's string conversion; `undefined` is empty.
    pub fn to_utf8(&self, value: &HostValue) -> Result<Vec<u8>> {
        self.context.with(|ctx| -> Result<Vec<u8>> {
            let v = value.clone().restore(&ctx)?;
            self.string_bytes(&ctx, v)
        })
    }

    /// Raw bytes of an `ArrayBuffer`, typed array or `DataView`, else
    /// [`Self::to_utf8`].
    pub fn to_bytes(&self, value: &HostValue) -> Result<Vec<u8>> {
        self.context.with(|ctx| -> Result<Vec<u8>> {
            let v = value.clone().restore(&ctx)?;
            let byte_view = self.byte_view.clone().restore(&ctx)?;
            let view: Value = byte_view
                .call((v.clone(),))
                .map_err(|e| failure(&ctx, e))?;
            if let Ok(array) = TypedArray::<u8>::from_js(&ctx, view) {
                if let Some(bytes) = array.as_bytes() {
                    return Ok(bytes.to_vec());
                }
            }
            self.string_bytes(&ctx, v)
        })
    }

    /// JSON snapshot of a value; `None` for values JSON cannot represent.
    pub fn to_json(&self, value: &HostValue) -> Result<Option<serde_json::Value>> {
        self.context.with(|ctx| -> Result<Option<serde_json::Value>> {
            let v = value.clone().restore(&ctx)?;
            let Some(text) = ctx.json_stringify(v).map_err(|e| failure(&ctx, e))? else {
                return Ok(None);
            };
            let text = text.to_string()?;
            serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| BridgeError::Engine(format!("unreadable JSON from engine: {e}")))
        })
    }

    /// Build a host value from Rust data, for embedders that box host objects.
    pub fn value_from_json(&self, json: &serde_json::Value) -> Result<HostValue> {
        let text = json.to_string();
        self.context.with(|ctx| -> Result<HostValue> {
            let v: Value = ctx.json_parse(text).map_err(|e| failure(&ctx, e))?;
            Ok(Persistent::save(&ctx, v))
        })
    }

    fn module_scope(&mut self, module: &str) -> Result<ModuleScope> {
        if let Some(scope) = self.modules.get(module) {
            return Ok(scope.clone());
        }
        let scope = self.context.with(|ctx| -> Result<ModuleScope> {
            let scope = Object::new(ctx.clone())?;
            Ok(Persistent::save(&ctx, scope))
        })?;
        debug!(module, "module context created");
        self.modules.insert(module.to_owned(), scope.clone());
        Ok(scope)
    }

    fn string_bytes<'js>(&self, ctx: &Ctx<'js>, v: Value<'js>) -> Result<Vec<u8>> {
        if v.is_undefined() {
            return Ok(Vec::new());
        }
        let well_formed = self.well_formed.clone().restore(ctx)?;
        let text: String = well_formed.call((v,)).map_err(|e| failure(ctx, e))?;
        Ok(text.into_bytes())
    }

    fn arm_deadline(&self) {
        if let (Some(timeout), Ok(mut deadline)) = (self.timeout, self.deadline.lock()) {
            *deadline = Some(Instant::now() + timeout);
        }
    }

    /// Clear the deadline and report whether it had passed.
    fn disarm_deadline(&self) -> bool {
        match self.deadline.lock() {
            Ok(mut deadline) => deadline
                .take()
                .is_some_and(|at| Instant::now() >= at),
            Err(_) => false,
        }
    }
}

fn argument_to_js<'js>(ctx: &Ctx<'js>, arg: &Argument<HostValue>) -> Result<Value<'js>> {
    Ok(match arg {
        Argument::Integer(n) => Value::new_number(ctx.clone(), f64::from(*n)),
        Argument::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into_value(),
        Argument::Handle(v) => v.clone().restore(ctx)?,
    })
}

/// Turn an engine error into an execution fault, pulling the pending
/// exception's message when there is one.
fn failure(ctx: &Ctx<'_>, err: rquickjs::Error) -> BridgeError {
    if !err.is_exception() {
        return BridgeError::Execution(err.to_string());
    }
    let thrown = ctx.catch();
    let message = match thrown.as_exception() {
        Some(exception) => exception
            .message()
            .unwrap_or_else(|| "exception without message".to_owned()),
        None => Coerced::<String>::from_js(ctx, thrown)
            .map(|c| c.0)
            .unwrap_or_else(|_| "uncaught exception".to_owned()),
    };
    BridgeError::Execution(message)
}
