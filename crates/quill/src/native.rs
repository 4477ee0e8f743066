//! Native (host) functions and the extension surface.
//!
//! Natives are plain Rust functions invoked by `CALL` like any other
//! callable. The built-in set covers the language's tiny runtime library;
//! extensions register additional natives through the versioned
//! [`NativeCapabilities`] table, which is the only surface handed to a
//! loaded plugin.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    error::{RunError, RunResult},
    heap::Heap,
    intern::Interner,
    io::PrintWriter,
    object::HeapData,
    value::{Value, display_value},
};

/// ABI version of the native capability table.
pub const NATIVE_API_VERSION: u32 = 1;

/// Handle to a registered native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeId(u16);

impl NativeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Context handed to a native call: the VM's heap, interner, and writer.
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub interns: &'a mut Interner,
    pub writer: &'a mut dyn PrintWriter,
}

/// Signature of a native function.
pub type NativeFn = fn(&mut NativeCtx<'_>, &[Value]) -> RunResult<Value>;

/// One registered native.
pub struct Native {
    pub name: &'static str,
    /// Fixed arity, or `None` for variadic.
    pub arity: Option<u8>,
    pub func: NativeFn,
}

impl std::fmt::Debug for Native {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Native")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// Opaque record of a loaded extension library, kept for teardown order.
#[derive(Debug)]
pub struct LibraryHandle {
    pub name: String,
}

/// Registry of native functions plus loaded extension handles.
#[derive(Debug, Default)]
pub struct NativeRegistry {
    natives: Vec<Native>,
    libraries: Vec<LibraryHandle>,
}

impl NativeRegistry {
    /// Creates a registry populated with the built-in natives.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.define("print", None, native_print);
        registry.define("clock", Some(0), native_clock);
        registry.define("len", Some(1), native_len);
        registry.define("keys", Some(1), native_keys);
        registry.define("str", Some(1), native_str);
        registry.define("num", Some(1), native_num);
        // Hidden foreach-lowering helpers. `#` cannot appear in user
        // identifiers, so these names are unreachable from source code.
        registry.define("#items", Some(1), native_iter_items);
        registry.define("#keys", Some(1), native_iter_keys);
        registry.define("#len", Some(1), native_len);
        registry
    }

    /// Registers a native and returns its handle.
    pub fn define(&mut self, name: &'static str, arity: Option<u8>, func: NativeFn) -> NativeId {
        let id = NativeId(u16::try_from(self.natives.len()).expect("native registry exceeds u16 ids"));
        self.natives.push(Native { name, arity, func });
        id
    }

    pub fn get(&self, id: NativeId) -> &Native {
        &self.natives[id.index()]
    }

    /// Iterates `(id, native)` pairs; the VM binds these into the globals
    /// environment at session start.
    pub fn iter(&self) -> impl Iterator<Item = (NativeId, &Native)> + '_ {
        self.natives
            .iter()
            .enumerate()
            .map(|(i, native)| (NativeId(i as u16), native))
    }

    /// Installs an extension: hands it the capability table and records its
    /// library handle for teardown. Loading the dynamic library itself is
    /// the driver's concern.
    pub fn install_extension(&mut self, library: LibraryHandle, entry: fn(&mut NativeCapabilities<'_>)) {
        tracing::debug!(library = %library.name, "installing native extension");
        let mut capabilities = NativeCapabilities {
            api_version: NATIVE_API_VERSION,
            registry: self,
        };
        entry(&mut capabilities);
        self.libraries.push(library);
    }
}

/// The versioned capability table passed to a native extension at load time.
pub struct NativeCapabilities<'a> {
    pub api_version: u32,
    registry: &'a mut NativeRegistry,
}

impl NativeCapabilities<'_> {
    /// Registers a native on behalf of the extension.
    pub fn define_native(&mut self, name: &'static str, arity: Option<u8>, func: NativeFn) -> NativeId {
        self.registry.define(name, arity, func)
    }
}

// ---- built-in natives --------------------------------------------------

fn native_print(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    for (i, &arg) in args.iter().enumerate() {
        if i > 0 {
            ctx.writer.stdout_push(' ');
        }
        let text = display_value(ctx.heap, ctx.interns, arg);
        ctx.writer.stdout_write(&text);
    }
    ctx.writer.stdout_push('\n');
    Ok(Value::Null)
}

fn native_clock(_ctx: &mut NativeCtx<'_>, _args: &[Value]) -> RunResult<Value> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RunError::runtime("system clock before epoch"))?;
    Ok(Value::Num(now.as_secs_f64()))
}

fn native_len(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    let value = args[0];
    if let Some(text) = ctx.heap.str_content(ctx.interns, value) {
        return Ok(Value::Num(text.chars().count() as f64));
    }
    if let Value::Ref(id) = value {
        match ctx.heap.get(id) {
            HeapData::Array(array) => return Ok(Value::Num(array.items.len() as f64)),
            HeapData::Map(map) => return Ok(Value::Num(map.entries.len() as f64)),
            _ => {}
        }
    }
    Err(RunError::runtime(format!(
        "len() expects a string, array, or map, got {}",
        value.type_name(ctx.heap)
    )))
}

fn native_keys(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    let value = args[0];
    if let Value::Ref(id) = value {
        if let HeapData::Map(map) = ctx.heap.get(id) {
            let keys: Vec<String> = map.entries.keys().map(|k| k.to_string()).collect();
            let mut items = Vec::with_capacity(keys.len());
            for key in keys {
                items.push(ctx.heap.alloc_str(key));
            }
            let array = crate::object::Array { items };
            return Ok(Value::Ref(ctx.heap.allocate(HeapData::Array(array))));
        }
    }
    Err(RunError::runtime(format!(
        "keys() expects a map, got {}",
        value.type_name(ctx.heap)
    )))
}

/// `#items`: the element sequence of a foreach — arrays iterate themselves,
/// maps iterate their keys, strings iterate their characters.
fn native_iter_items(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    let value = args[0];
    if let Value::Ref(id) = value {
        match ctx.heap.get(id) {
            HeapData::Array(_) => return Ok(value),
            HeapData::Map(_) => return native_keys(ctx, args),
            _ => {}
        }
    }
    if let Some(text) = ctx.heap.str_content(ctx.interns, value) {
        let chars: Vec<String> = text.chars().map(String::from).collect();
        let mut items = Vec::with_capacity(chars.len());
        for c in chars {
            items.push(ctx.heap.alloc_str(c));
        }
        let array = crate::object::Array { items };
        return Ok(Value::Ref(ctx.heap.allocate(HeapData::Array(array))));
    }
    Err(RunError::runtime(format!(
        "foreach expects an array, map, or string, got {}",
        value.type_name(ctx.heap)
    )))
}

/// `#keys`: the key sequence of a two-variable foreach — integer indices for
/// arrays and strings, key strings for maps.
fn native_iter_keys(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    let value = args[0];
    if let Value::Ref(id) = value {
        match ctx.heap.get(id) {
            HeapData::Array(array) => {
                let items: Vec<Value> = (0..array.items.len()).map(|i| Value::Num(i as f64)).collect();
                let array = crate::object::Array { items };
                return Ok(Value::Ref(ctx.heap.allocate(HeapData::Array(array))));
            }
            HeapData::Map(_) => return native_keys(ctx, args),
            _ => {}
        }
    }
    if let Some(text) = ctx.heap.str_content(ctx.interns, value) {
        let count = text.chars().count();
        let items: Vec<Value> = (0..count).map(|i| Value::Num(i as f64)).collect();
        let array = crate::object::Array { items };
        return Ok(Value::Ref(ctx.heap.allocate(HeapData::Array(array))));
    }
    Err(RunError::runtime(format!(
        "foreach expects an array, map, or string, got {}",
        value.type_name(ctx.heap)
    )))
}

fn native_str(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    let text = display_value(ctx.heap, ctx.interns, args[0]);
    Ok(ctx.heap.alloc_str(text))
}

fn native_num(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    match args[0] {
        Value::Num(n) => Ok(Value::Num(n)),
        value => match ctx.heap.str_content(ctx.interns, value) {
            Some(text) => Ok(text.trim().parse::<f64>().map_or(Value::Null, Value::Num)),
            None => Ok(Value::Null),
        },
    }
}
