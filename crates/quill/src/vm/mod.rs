//! The bytecode interpreter.
//!
//! A `Vm` executes frames against a [`Session`], which owns everything that
//! outlives a single run: the heap, interner, function table, module
//! registry, native registry, typechecker (shared across imports), and the
//! globals environment. The dispatch loop keeps the current frame's function
//! and instruction pointer in a local cache (reloaded after every call,
//! return, or import) so operand fetches never touch the frame stack.
//!
//! Runtime errors unwind to the module boundary: the raising instruction's
//! source token plus the call tokens recorded in each frame become the
//! backtrace of the resulting [`Exception`].

use std::rc::Rc;

use crate::{
    error::{ErrorKind, Exception, RunError, RunResult, TraceFrame},
    function::{FnId, Function, FunctionTable},
    heap::{Heap, RootSet},
    intern::{Interner, StringId},
    io::PrintWriter,
    module::ModuleRegistry,
    native::NativeRegistry,
    object::HeapData,
    token::Token,
    typecheck::TypeChecker,
    value::Value,
};

mod call;
mod property;

pub(crate) use call::CallOutcome;

/// Operand stack capacity.
pub(crate) const STACK_MAX: usize = 16 * 1024;

/// Call-frame capacity; exceeding it is a stack-overflow runtime error.
pub(crate) const FRAMES_MAX: usize = 1024;

/// Everything that survives across runs (and across REPL lines).
#[derive(Debug)]
pub struct Session {
    pub(crate) heap: Heap,
    pub(crate) interns: Interner,
    pub(crate) funcs: FunctionTable,
    pub(crate) modules: ModuleRegistry,
    pub(crate) natives: NativeRegistry,
    pub(crate) checker: TypeChecker,
    pub(crate) globals: crate::env::EnvId,
}

impl Session {
    /// Creates a session with natives bound into the globals environment.
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let globals = heap.alloc_env(None);
        let mut interns = Interner::new();
        let natives = NativeRegistry::with_builtins();
        for (id, native) in natives.iter() {
            let name = interns.intern(native.name);
            heap.envs
                .define(globals, name, Value::Native(id), true)
                .expect("globals start empty");
        }
        Self {
            heap,
            interns,
            funcs: FunctionTable::new(),
            modules: ModuleRegistry::new(),
            natives,
            checker: TypeChecker::new(),
            globals,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// A single function activation record.
#[derive(Debug)]
pub(crate) struct Frame {
    pub func: Rc<Function>,
    pub ip: usize,
    pub stack_base: usize,
    pub env: crate::env::EnvId,
    pub arg_count: u8,
    /// Token of the call instruction in the caller's chunk, for backtraces.
    pub call_token: Token,
}

/// Cached view of the current frame, rebuilt after frame-stack changes.
pub(crate) struct Cached {
    pub func: Rc<Function>,
    pub ip: usize,
}

/// Failure modes of a module load.
pub(crate) enum ModuleError {
    /// Raise at the import site as a runtime/module error.
    Local(RunError),
    /// Already-decorated failure from inside the module's execution.
    Failure(Box<Exception>),
}

/// Fetches one code byte through the cache, advancing the ip.
macro_rules! fetch_u8 {
    ($cached:expr) => {{
        let byte = $cached.func.chunk.code()[$cached.ip];
        $cached.ip += 1;
        byte
    }};
}

/// Fetches a big-endian u16 operand through the cache.
macro_rules! fetch_u16 {
    ($cached:expr) => {{
        let hi = $cached.func.chunk.code()[$cached.ip];
        let lo = $cached.func.chunk.code()[$cached.ip + 1];
        $cached.ip += 2;
        u16::from_be_bytes([hi, lo])
    }};
}

/// Unwraps a `RunResult` inside the dispatch loop, converting an error into
/// a positioned exception with a backtrace.
macro_rules! vm_try {
    ($self:expr, $cached:expr, $op_start:expr, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return Err($self.runtime_exception(err, &$cached, $op_start)),
        }
    };
}

/// The interpreter: a session plus transient run state.
pub struct Vm<'s, P: PrintWriter> {
    pub(crate) session: &'s mut Session,
    pub(crate) writer: &'s mut P,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
}

impl<'s, P: PrintWriter> Vm<'s, P> {
    pub fn new(session: &'s mut Session, writer: &'s mut P) -> Self {
        Self {
            session,
            writer,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
        }
    }

    // ---- stack ----------------------------------------------------------

    #[inline]
    pub(crate) fn push(&mut self, value: Value) -> RunResult<()> {
        if self.stack.len() >= STACK_MAX {
            return Err(RunError::runtime("operand stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    #[inline]
    pub(crate) fn peek(&self, depth: usize) -> Value {
        self.stack[self.stack.len() - 1 - depth]
    }

    // ---- entry points ----------------------------------------------------

    /// Runs a compiled top-level function to completion.
    ///
    /// The function executes in a fresh environment whose parent is the
    /// globals environment.
    pub fn run_top_level(&mut self, fn_id: FnId) -> Result<Value, Exception> {
        let env = self.session.heap.alloc_env(Some(self.session.globals));
        self.run_function(fn_id, env, Token::synthetic())
    }

    /// Pushes a frame for `fn_id` (zero arguments) and interprets until it
    /// returns. Used for top-level code and synchronous module execution.
    pub(crate) fn run_function(&mut self, fn_id: FnId, env: crate::env::EnvId, call_token: Token) -> Result<Value, Exception> {
        let func = Rc::clone(self.session.funcs.get(fn_id));
        let entry_depth = self.frames.len();
        let entry_stack = self.stack.len();
        self.frames.push(Frame {
            func,
            ip: 0,
            stack_base: entry_stack,
            env,
            arg_count: 0,
            call_token,
        });
        let result = self.dispatch(entry_depth);
        if result.is_err() {
            // Unwind everything this entry pushed.
            self.frames.truncate(entry_depth);
            self.stack.truncate(entry_stack);
        }
        result
    }

    fn load_cache(&self) -> Cached {
        let frame = self.frames.last().expect("dispatch without a frame");
        Cached {
            func: Rc::clone(&frame.func),
            ip: frame.ip,
        }
    }

    /// Writes the cached ip back to the current frame. Called before any
    /// operation that can push frames or raise through them.
    fn sync_ip(&mut self, cached: &Cached) {
        self.frames.last_mut().expect("frame present").ip = cached.ip;
    }

    // ---- the dispatch loop ----------------------------------------------

    fn dispatch(&mut self, entry_depth: usize) -> Result<Value, Exception> {
        use crate::bytecode::Opcode;

        let mut cached = self.load_cache();
        loop {
            let op_start = cached.ip;
            let op = Opcode::at(cached.func.chunk.code(), op_start);
            cached.ip += 1;
            match op {
                Opcode::Constant => {
                    let idx = fetch_u16!(cached);
                    let value = cached.func.chunk.constant(idx);
                    vm_try!(self, cached, op_start, self.push(value));
                }
                Opcode::Null => vm_try!(self, cached, op_start, self.push(Value::Null)),
                Opcode::True => vm_try!(self, cached, op_start, self.push(Value::Bool(true))),
                Opcode::False => vm_try!(self, cached, op_start, self.push(Value::Bool(false))),
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Negate => {
                    let value = self.pop();
                    let result = vm_try!(self, cached, op_start, self.negate(value));
                    vm_try!(self, cached, op_start, self.push(result));
                }
                Opcode::Not => {
                    let value = self.pop();
                    vm_try!(self, cached, op_start, self.push(Value::Bool(!value.is_truthy())));
                }
                Opcode::Stringify => {
                    let value = self.pop();
                    let result = self.stringify(value);
                    vm_try!(self, cached, op_start, self.push(result));
                }
                Opcode::Add
                | Opcode::Subtract
                | Opcode::Multiply
                | Opcode::Divide
                | Opcode::Modulo
                | Opcode::Equal
                | Opcode::Greater
                | Opcode::GreaterEqual
                | Opcode::Less
                | Opcode::LessEqual => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    let result = vm_try!(self, cached, op_start, self.binary_op(op, lhs, rhs));
                    vm_try!(self, cached, op_start, self.push(result));
                }
                Opcode::GetVar => {
                    let name = self.name_operand(&mut cached);
                    let env = self.current_env();
                    match self.session.heap.envs.lookup(env, name) {
                        Some(value) => vm_try!(self, cached, op_start, self.push(value)),
                        None => {
                            let err = RunError::runtime(format!(
                                "undefined variable '{}'",
                                self.session.interns.get(name)
                            ));
                            return Err(self.runtime_exception(err, &cached, op_start));
                        }
                    }
                }
                Opcode::SetVar => {
                    let name = self.name_operand(&mut cached);
                    let value = self.peek(0);
                    let env = self.current_env();
                    vm_try!(
                        self,
                        cached,
                        op_start,
                        self.session
                            .heap
                            .envs
                            .assign(env, name, value)
                            .map_err(|e| self.env_error(e, name))
                    );
                }
                Opcode::DefineVar | Opcode::DefineConst => {
                    let name = self.name_operand(&mut cached);
                    let value = self.pop();
                    let env = self.current_env();
                    let constant = op == Opcode::DefineConst;
                    vm_try!(
                        self,
                        cached,
                        op_start,
                        self.session
                            .heap
                            .envs
                            .define(env, name, value, constant)
                            .map_err(|e| self.env_error(e, name))
                    );
                }
                Opcode::GetProperty | Opcode::GetPropertyOptional => {
                    let name = self.name_operand(&mut cached);
                    let optional = op == Opcode::GetPropertyOptional;
                    let receiver = self.pop();
                    if optional && receiver == Value::Null {
                        vm_try!(self, cached, op_start, self.push(Value::Null));
                    } else {
                        let result = vm_try!(
                            self,
                            cached,
                            op_start,
                            self.property_get(&cached, op_start, receiver, name, optional)
                        );
                        vm_try!(self, cached, op_start, self.push(result));
                    }
                }
                Opcode::SetProperty => {
                    let name = self.name_operand(&mut cached);
                    let value = self.pop();
                    let receiver = self.pop();
                    vm_try!(
                        self,
                        cached,
                        op_start,
                        self.property_set(&cached, op_start, receiver, name, value)
                    );
                    vm_try!(self, cached, op_start, self.push(value));
                }
                Opcode::GetIndex | Opcode::GetIndexOptional => {
                    let index = self.pop();
                    let receiver = self.pop();
                    if op == Opcode::GetIndexOptional && receiver == Value::Null {
                        vm_try!(self, cached, op_start, self.push(Value::Null));
                    } else {
                        let result = vm_try!(self, cached, op_start, self.index_get(receiver, index));
                        vm_try!(self, cached, op_start, self.push(result));
                    }
                }
                Opcode::SetIndex => {
                    let value = self.pop();
                    let index = self.pop();
                    let receiver = self.pop();
                    vm_try!(self, cached, op_start, self.index_set(receiver, index, value));
                    vm_try!(self, cached, op_start, self.push(value));
                }
                Opcode::Array => {
                    let capacity = fetch_u16!(cached) as usize;
                    let id = self
                        .session
                        .heap
                        .allocate(HeapData::Array(crate::object::Array::with_capacity(capacity)));
                    vm_try!(self, cached, op_start, self.push(Value::Ref(id)));
                }
                Opcode::Map => {
                    let capacity = fetch_u16!(cached) as usize;
                    let id = self
                        .session
                        .heap
                        .allocate(HeapData::Map(crate::object::MapObj::with_capacity(capacity)));
                    vm_try!(self, cached, op_start, self.push(Value::Ref(id)));
                }
                Opcode::ArrayAppend => {
                    let value = self.pop();
                    let array = self.peek(0);
                    let Value::Ref(id) = array else {
                        let err = RunError::runtime("ARRAY_APPEND on a non-array");
                        return Err(self.runtime_exception(err, &cached, op_start));
                    };
                    vm_try!(self, cached, op_start, self.session.heap.array_push(id, value));
                }
                Opcode::MapSet => {
                    let value = self.pop();
                    let key = self.pop();
                    let map = self.peek(0);
                    let Value::Ref(id) = map else {
                        let err = RunError::runtime("MAP_SET on a non-map");
                        return Err(self.runtime_exception(err, &cached, op_start));
                    };
                    let key = vm_try!(self, cached, op_start, self.key_string(key));
                    vm_try!(self, cached, op_start, self.session.heap.map_set(id, key, value));
                }
                Opcode::Jump => {
                    let delta = fetch_u16!(cached) as usize;
                    cached.ip += delta;
                }
                Opcode::JumpIfFalse => {
                    let delta = fetch_u16!(cached) as usize;
                    if !self.peek(0).is_truthy() {
                        cached.ip += delta;
                    }
                }
                Opcode::Loop => {
                    let delta = fetch_u16!(cached) as usize;
                    cached.ip -= delta;
                }
                Opcode::Call | Opcode::CallOptional => {
                    let argc = fetch_u8!(cached);
                    let callee = self.peek(argc as usize);
                    if op == Opcode::CallOptional && callee == Value::Null {
                        for _ in 0..=argc {
                            self.pop();
                        }
                        vm_try!(self, cached, op_start, self.push(Value::Null));
                    } else {
                        self.sync_ip(&cached);
                        let call_token = cached.func.chunk.token_at(op_start);
                        let outcome = vm_try!(self, cached, op_start, self.call_value(callee, argc, call_token));
                        match outcome {
                            CallOutcome::FramePushed => cached = self.load_cache(),
                            CallOutcome::Returned(value) => {
                                vm_try!(self, cached, op_start, self.push(value));
                            }
                        }
                    }
                }
                Opcode::Invoke => {
                    let name = self.name_operand(&mut cached);
                    let argc = fetch_u8!(cached);
                    self.sync_ip(&cached);
                    let call_token = cached.func.chunk.token_at(op_start);
                    let outcome = vm_try!(
                        self,
                        cached,
                        op_start,
                        self.invoke(&cached, op_start, name, argc, call_token)
                    );
                    match outcome {
                        CallOutcome::FramePushed => cached = self.load_cache(),
                        CallOutcome::Returned(value) => {
                            vm_try!(self, cached, op_start, self.push(value));
                        }
                    }
                }
                Opcode::Closure => {
                    let idx = fetch_u16!(cached);
                    let Value::Fn(fn_id) = cached.func.chunk.constant(idx) else {
                        let err = RunError::runtime("CLOSURE operand is not a function constant");
                        return Err(self.runtime_exception(err, &cached, op_start));
                    };
                    let env = self.current_env();
                    let id = self
                        .session
                        .heap
                        .allocate(HeapData::Closure(crate::object::Closure { function: fn_id, env }));
                    vm_try!(self, cached, op_start, self.push(Value::Ref(id)));
                }
                Opcode::Class => {
                    let name = self.name_operand(&mut cached);
                    let method_count = fetch_u16!(cached);
                    let result = vm_try!(self, cached, op_start, self.build_class(name, method_count));
                    vm_try!(self, cached, op_start, self.push(result));
                }
                Opcode::EnumCtor => {
                    let enum_name = self.name_operand(&mut cached);
                    let ctor = self.name_operand(&mut cached);
                    let arity = fetch_u8!(cached);
                    let data = if arity == 0 {
                        HeapData::EnumValue(crate::object::EnumValue {
                            enum_name,
                            ctor,
                            fields: Vec::new(),
                        })
                    } else {
                        HeapData::EnumCtor(crate::object::EnumCtor {
                            enum_name,
                            ctor,
                            arity,
                        })
                    };
                    let id = self.session.heap.allocate(data);
                    vm_try!(self, cached, op_start, self.push(Value::Ref(id)));
                }
                Opcode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return without a frame");
                    self.stack.truncate(frame.stack_base);
                    if self.frames.len() == entry_depth {
                        return Ok(result);
                    }
                    vm_try!(self, cached, op_start, self.push(result));
                    cached = self.load_cache();
                }
                Opcode::Import | Opcode::ImportModule => {
                    let spec = self.name_operand(&mut cached);
                    self.sync_ip(&cached);
                    match self.load_module(spec) {
                        Ok(value) => vm_try!(self, cached, op_start, self.push(value)),
                        Err(ModuleError::Failure(exception)) => return Err(*exception),
                        Err(ModuleError::Local(err)) => {
                            return Err(self.runtime_exception(err, &cached, op_start));
                        }
                    }
                    cached = self.load_cache();
                }
                Opcode::Export => {
                    let name = self.name_operand(&mut cached);
                    let env = self.current_env();
                    let Some(value) = self.session.heap.envs.lookup(env, name) else {
                        let err = RunError::module(format!(
                            "cannot export undefined name '{}'",
                            self.session.interns.get(name)
                        ));
                        return Err(self.runtime_exception(err, &cached, op_start));
                    };
                    cached.func.program.export(name, value);
                }
                Opcode::ExportValue => {
                    let name = self.name_operand(&mut cached);
                    let value = self.pop();
                    cached.func.program.export(name, value);
                }
                Opcode::ExportFrom => {
                    let count = fetch_u8!(cached);
                    let mut pairs = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let from = self.name_operand(&mut cached);
                        let to = self.name_operand(&mut cached);
                        pairs.push((from, to));
                    }
                    let source = self.pop();
                    vm_try!(self, cached, op_start, self.export_from(&cached, source, &pairs));
                }
                Opcode::BeginScope => {
                    let parent = self.current_env();
                    let env = self.session.heap.alloc_env(Some(parent));
                    self.frames.last_mut().expect("frame present").env = env;
                }
                Opcode::EndScope => {
                    let env = self.current_env();
                    let parent = self
                        .session
                        .heap
                        .envs
                        .get(env)
                        .parent()
                        .expect("END_SCOPE at the outermost environment");
                    self.frames.last_mut().expect("frame present").env = parent;
                }
                Opcode::ArgCount => {
                    let argc = self.frames.last().expect("frame present").arg_count;
                    vm_try!(self, cached, op_start, self.push(Value::Num(f64::from(argc))));
                }
                Opcode::Gc => {
                    if self.session.heap.collection_pending() {
                        let roots = self.collect_roots();
                        self.session.heap.gc_maybe(&roots);
                    }
                }
            }
        }
    }

    // ---- small op helpers ------------------------------------------------

    /// Reads a u16 name operand and resolves it through the constant pool.
    fn name_operand(&self, cached: &mut Cached) -> StringId {
        let idx = fetch_u16!(cached);
        match cached.func.chunk.constant(idx) {
            Value::Str(id) => id,
            other => unreachable!("name operand resolved to {other:?}"),
        }
    }

    pub(crate) fn current_env(&self) -> crate::env::EnvId {
        self.frames.last().expect("frame present").env
    }

    fn negate(&self, value: Value) -> RunResult<Value> {
        match value {
            Value::Num(n) => Ok(Value::Num(-n)),
            other => Err(RunError::runtime(format!(
                "unary - expects a number, got {}",
                other.type_name(&self.session.heap)
            ))),
        }
    }

    /// Converts a value to its string form, reusing existing strings.
    fn stringify(&mut self, value: Value) -> Value {
        if self
            .session
            .heap
            .str_content(&self.session.interns, value)
            .is_some()
        {
            return value;
        }
        let text = crate::value::display_value(&self.session.heap, &self.session.interns, value);
        self.session.heap.alloc_str(text)
    }

    fn binary_op(&mut self, op: crate::bytecode::Opcode, lhs: Value, rhs: Value) -> RunResult<Value> {
        use crate::bytecode::Opcode;
        match op {
            Opcode::Add => match (lhs, rhs) {
                (Value::Num(a), Value::Num(b)) => Ok(Value::Num(a + b)),
                _ => {
                    let left = self.session.heap.str_content(&self.session.interns, lhs);
                    let right = self.session.heap.str_content(&self.session.interns, rhs);
                    if let (Some(a), Some(b)) = (left, right) {
                        let joined = format!("{a}{b}");
                        Ok(self.session.heap.alloc_str(joined))
                    } else {
                        Err(self.binary_type_error("+", lhs, rhs))
                    }
                }
            },
            Opcode::Subtract => self.num_op(lhs, rhs, "-", |a, b| a - b),
            Opcode::Multiply => self.num_op(lhs, rhs, "*", |a, b| a * b),
            Opcode::Divide => match (lhs, rhs) {
                (Value::Num(_), Value::Num(b)) if b == 0.0 => Err(RunError::runtime("division by zero")),
                _ => self.num_op(lhs, rhs, "/", |a, b| a / b),
            },
            Opcode::Modulo => match (lhs, rhs) {
                (Value::Num(_), Value::Num(b)) if b == 0.0 => Err(RunError::runtime("division by zero")),
                _ => self.num_op(lhs, rhs, "%", |a, b| a % b),
            },
            Opcode::Equal => Ok(Value::Bool(
                self.session.heap.values_equal(&self.session.interns, lhs, rhs),
            )),
            Opcode::Greater => self.cmp_op(lhs, rhs, ">", |a, b| a > b),
            Opcode::GreaterEqual => self.cmp_op(lhs, rhs, ">=", |a, b| a >= b),
            Opcode::Less => self.cmp_op(lhs, rhs, "<", |a, b| a < b),
            Opcode::LessEqual => self.cmp_op(lhs, rhs, "<=", |a, b| a <= b),
            _ => unreachable!("binary_op on non-binary opcode"),
        }
    }

    fn num_op(&self, lhs: Value, rhs: Value, symbol: &str, f: impl FnOnce(f64, f64) -> f64) -> RunResult<Value> {
        match (lhs, rhs) {
            (Value::Num(a), Value::Num(b)) => Ok(Value::Num(f(a, b))),
            _ => Err(self.binary_type_error(symbol, lhs, rhs)),
        }
    }

    fn cmp_op(&self, lhs: Value, rhs: Value, symbol: &str, f: impl FnOnce(f64, f64) -> bool) -> RunResult<Value> {
        match (lhs, rhs) {
            (Value::Num(a), Value::Num(b)) => Ok(Value::Bool(f(a, b))),
            _ => Err(self.binary_type_error(symbol, lhs, rhs)),
        }
    }

    fn binary_type_error(&self, symbol: &str, lhs: Value, rhs: Value) -> RunError {
        RunError::runtime(format!(
            "operator {symbol} cannot combine {} and {}",
            lhs.type_name(&self.session.heap),
            rhs.type_name(&self.session.heap)
        ))
    }

    fn env_error(&self, err: crate::env::EnvError, name: StringId) -> RunError {
        let name = self.session.interns.get(name);
        match err {
            crate::env::EnvError::Unbound => RunError::runtime(format!("undefined variable '{name}'")),
            crate::env::EnvError::ConstWrite => RunError::runtime(format!("cannot assign to constant '{name}'")),
            crate::env::EnvError::ConstRedefine => {
                RunError::runtime(format!("cannot redefine constant binding '{name}'"))
            }
        }
    }

    /// Converts a stack value into a map key.
    pub(crate) fn key_string(&self, value: Value) -> RunResult<Box<str>> {
        self.session
            .heap
            .str_content(&self.session.interns, value)
            .map(Box::from)
            .ok_or_else(|| {
                RunError::runtime(format!(
                    "map keys must be strings, got {}",
                    value.type_name(&self.session.heap)
                ))
            })
    }

    // ---- GC roots --------------------------------------------------------

    /// Enumerates roots for the collector: the operand stack, module export
    /// tables, frame environments, and the globals environment.
    fn collect_roots(&self) -> RootSet {
        let mut values = self.stack.clone();
        for program in self.session.modules.programs() {
            values.extend(program.exports.borrow().values().copied());
        }
        let mut envs: Vec<crate::env::EnvId> = self.frames.iter().map(|f| f.env).collect();
        envs.push(self.session.globals);
        RootSet { values, envs }
    }

    // ---- error decoration ------------------------------------------------

    /// Builds the user-visible exception for a runtime error raised at
    /// `op_start` of the cached frame, with a full backtrace.
    pub(crate) fn runtime_exception(&self, err: RunError, cached: &Cached, op_start: usize) -> Exception {
        let token = cached.func.chunk.token_at(op_start);
        let program = &cached.func.program;
        let context = crate::error::source_line(&program.source, token.line)
            .map(|text| (text.to_owned(), token.col, token.len.max(1)));

        // Deepest frame reports the faulting token; each caller reports the
        // call instruction that got it there.
        let mut backtrace = Vec::with_capacity(self.frames.len());
        let mut site = token;
        for frame in self.frames.iter().rev() {
            backtrace.push(TraceFrame {
                function: self.session.interns.get(frame.func.name).to_owned(),
                line: site.line,
                col: site.col,
            });
            site = frame.call_token;
        }

        Exception {
            kind: if err.kind == ErrorKind::Module {
                ErrorKind::Module
            } else {
                ErrorKind::Runtime
            },
            message: err.message,
            path: program.path.clone(),
            line: token.line,
            col: token.col,
            context,
            backtrace,
        }
    }
}
