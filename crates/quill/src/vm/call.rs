//! Calls: closures, classes, bound methods, enum constructors, natives,
//! plus synchronous module loading and re-export handling.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    compiler::compile,
    error::{RunError, RunResult},
    intern::StringId,
    io::PrintWriter,
    module::{ModuleState, Program},
    native::{NativeCtx, NativeId},
    object::{Closure, EnumValue, HeapData, Instance},
    token::Token,
    value::Value,
};

use super::{Cached, Frame, FRAMES_MAX, ModuleError, Vm};

/// What a call did: pushed a frame (bytecode callee) or produced a value
/// immediately (native, enum constructor, argument-free construction).
pub(crate) enum CallOutcome {
    FramePushed,
    Returned(Value),
}

impl<P: PrintWriter> Vm<'_, P> {
    /// Calls the value sitting `argc` slots below the stack top.
    pub(crate) fn call_value(&mut self, callee: Value, argc: u8, call_token: Token) -> RunResult<CallOutcome> {
        match callee {
            Value::Ref(id) => match self.session.heap.get(id) {
                HeapData::Closure(closure) => {
                    let closure = *closure;
                    self.call_closure(closure, argc, None, call_token)
                }
                HeapData::Class(_) => self.construct_instance(id, argc, call_token),
                HeapData::BoundMethod(bound) => {
                    let bound = *bound;
                    let Value::Ref(method_id) = bound.method else {
                        return Err(RunError::runtime("bound method target is not callable"));
                    };
                    let HeapData::Closure(closure) = self.session.heap.get(method_id) else {
                        return Err(RunError::runtime("bound method target is not callable"));
                    };
                    let closure = *closure;
                    self.call_closure(closure, argc, Some(bound.receiver), call_token)
                }
                HeapData::EnumCtor(ctor) => {
                    let ctor = *ctor;
                    self.construct_enum_value(ctor, argc)
                }
                other => Err(RunError::runtime(format!(
                    "can only call functions and classes, got {}",
                    other.kind_name()
                ))),
            },
            Value::Native(id) => self.call_native(id, argc),
            Value::Fn(fn_id) => {
                // A bare function constant behaves like a closure over the
                // globals environment.
                let closure = Closure {
                    function: fn_id,
                    env: self.session.globals,
                };
                self.call_closure(closure, argc, None, call_token)
            }
            other => Err(RunError::runtime(format!(
                "can only call functions and classes, got {}",
                other.type_name(&self.session.heap)
            ))),
        }
    }

    /// Pushes a frame for a closure call.
    ///
    /// Arguments were pushed left-to-right above the callee. Fewer arguments
    /// than declared parameters bind the tail to null; the callee's default
    /// preamble (guarded by `ARG_COUNT`) fills them in.
    pub(crate) fn call_closure(
        &mut self,
        closure: Closure,
        argc: u8,
        receiver: Option<Value>,
        call_token: Token,
    ) -> RunResult<CallOutcome> {
        if self.frames.len() >= FRAMES_MAX {
            return Err(RunError::runtime("call stack overflow"));
        }
        let func = Rc::clone(self.session.funcs.get(closure.function));
        if argc < func.min_arity || argc > func.arity {
            let name = self.session.interns.get(func.name);
            let expected = if func.min_arity == func.arity {
                format!("exactly {}", func.arity)
            } else {
                format!("between {} and {}", func.min_arity, func.arity)
            };
            return Err(RunError::arity(name, &expected, argc));
        }

        let env = self.session.heap.alloc_env(Some(closure.env));
        let base = self.stack.len() - 1 - argc as usize;
        for (i, &param) in func.params.iter().enumerate() {
            let value = if i < argc as usize {
                self.stack[base + 1 + i]
            } else {
                Value::Null
            };
            self.session
                .heap
                .envs
                .define(env, param, value, false)
                .map_err(|_| RunError::runtime("duplicate constant parameter binding"))?;
        }
        if let Some(receiver) = receiver {
            self.session
                .heap
                .envs
                .define(env, StringId::THIS, receiver, true)
                .map_err(|_| RunError::runtime("receiver rebinding"))?;
        }

        // Parameters now live in the environment; the callee and arguments
        // leave the stack before the frame starts executing.
        self.stack.truncate(base);
        self.frames.push(Frame {
            func,
            ip: 0,
            stack_base: base,
            env,
            arg_count: argc,
            call_token,
        });
        Ok(CallOutcome::FramePushed)
    }

    /// `ClassName(args)`: allocates an instance and runs `init` with the
    /// receiver bound; without an `init`, only zero arguments are accepted.
    fn construct_instance(&mut self, class_id: crate::heap::HeapId, argc: u8, call_token: Token) -> RunResult<CallOutcome> {
        let (init, class_name) = match self.session.heap.get(class_id) {
            HeapData::Class(class) => (class.methods.get(&StringId::INIT).copied(), class.name),
            _ => unreachable!("construct_instance on a non-class"),
        };
        let instance = Value::Ref(self.session.heap.allocate(HeapData::Instance(Instance::new(class_id))));
        match init {
            Some(Value::Ref(method_id)) => {
                let HeapData::Closure(closure) = self.session.heap.get(method_id) else {
                    return Err(RunError::runtime("class initializer is not callable"));
                };
                let closure = *closure;
                // The initializer's implicit return yields the receiver.
                self.call_closure(closure, argc, Some(instance), call_token)
            }
            Some(_) => Err(RunError::runtime("class initializer is not callable")),
            None => {
                if argc != 0 {
                    let name = self.session.interns.get(class_name);
                    return Err(RunError::arity(name, "exactly 0", argc));
                }
                // Pop the class itself.
                self.pop();
                Ok(CallOutcome::Returned(instance))
            }
        }
    }

    /// Calls an enum constructor: pops the payload and builds a tagged value.
    fn construct_enum_value(&mut self, ctor: crate::object::EnumCtor, argc: u8) -> RunResult<CallOutcome> {
        if argc != ctor.arity {
            let name = self.session.interns.get(ctor.ctor);
            return Err(RunError::arity(name, &format!("exactly {}", ctor.arity), argc));
        }
        let base = self.stack.len() - argc as usize;
        let fields: Vec<Value> = self.stack[base..].to_vec();
        self.stack.truncate(base - 1);
        let id = self.session.heap.allocate(HeapData::EnumValue(EnumValue {
            enum_name: ctor.enum_name,
            ctor: ctor.ctor,
            fields,
        }));
        Ok(CallOutcome::Returned(Value::Ref(id)))
    }

    fn call_native(&mut self, id: NativeId, argc: u8) -> RunResult<CallOutcome> {
        let (arity, func, name) = {
            let native = self.session.natives.get(id);
            (native.arity, native.func, native.name)
        };
        if let Some(expected) = arity {
            if argc != expected {
                return Err(RunError::arity(name, &format!("exactly {expected}"), argc));
            }
        }
        let base = self.stack.len() - argc as usize;
        let args: SmallVec<[Value; 8]> = SmallVec::from_slice(&self.stack[base..]);
        self.stack.truncate(base - 1);
        let mut ctx = NativeCtx {
            heap: &mut self.session.heap,
            interns: &mut self.session.interns,
            writer: &mut *self.writer,
        };
        let result = func(&mut ctx, &args)?;
        Ok(CallOutcome::Returned(result))
    }

    /// `CLASS name methodCount`: pops the method closures pushed in
    /// declaration order and builds the class object.
    pub(crate) fn build_class(&mut self, name: StringId, method_count: u16) -> RunResult<Value> {
        let mut popped = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            popped.push(self.pop());
        }
        popped.reverse();
        let mut methods = indexmap::IndexMap::with_capacity_and_hasher(
            method_count as usize,
            crate::object::ObjectHasher::default(),
        );
        for value in popped {
            let Value::Ref(id) = value else {
                return Err(RunError::runtime("class method is not a closure"));
            };
            let HeapData::Closure(closure) = self.session.heap.get(id) else {
                return Err(RunError::runtime("class method is not a closure"));
            };
            let method_name = self.session.funcs.get(closure.function).name;
            methods.insert(method_name, value);
        }
        let uid = self.session.heap.next_class_uid();
        let id = self.session.heap.allocate(HeapData::Class(crate::object::Class {
            uid,
            name,
            methods,
        }));
        Ok(Value::Ref(id))
    }

    // ---- modules --------------------------------------------------------

    /// Resolves, loads, and (if needed) compiles and executes a module, then
    /// returns its export-map object.
    ///
    /// A module found in `Loading` state is a cycle: its partial export
    /// table is returned as-is.
    pub(crate) fn load_module(&mut self, spec: StringId) -> Result<Value, ModuleError> {
        let spec_text = self.session.interns.get(spec).to_owned();
        let importer = self
            .frames
            .last()
            .map(|frame| frame.func.program.path.clone())
            .unwrap_or_default();

        let Some(resolved) = self.session.modules.resolve(&spec_text, &importer) else {
            return Err(ModuleError::Local(RunError::module(format!(
                "module '{spec_text}' not found"
            ))));
        };
        let canonical = std::fs::canonicalize(&resolved)
            .unwrap_or_else(|_| resolved.clone())
            .to_string_lossy()
            .into_owned();

        if let Some(existing) = self.session.modules.get(&canonical) {
            let existing = Rc::clone(existing);
            return match existing.state.get() {
                ModuleState::Loaded | ModuleState::Loading => Ok(self.export_map_value(existing)),
                ModuleState::Failed => Err(ModuleError::Local(RunError::module(format!(
                    "module '{spec_text}' previously failed to load"
                )))),
                ModuleState::Unloaded => Err(ModuleError::Local(RunError::module(format!(
                    "module '{spec_text}' is registered but was never loaded"
                )))),
            };
        }

        tracing::debug!(module = %canonical, "loading module");
        let source = match std::fs::read_to_string(&resolved) {
            Ok(source) => source,
            Err(err) => {
                return Err(ModuleError::Local(RunError::module(format!(
                    "cannot read module '{spec_text}': {err}"
                ))));
            }
        };

        let program = Rc::new(Program::new(source, canonical.clone()));
        program.state.set(ModuleState::Loading);
        self.session.modules.insert(canonical, Rc::clone(&program));

        let top_level = match compile(
            &program,
            &mut self.session.interns,
            &mut self.session.funcs,
            &mut self.session.checker,
            false,
        ) {
            Ok(top_level) => top_level,
            Err(diagnostics) => {
                program.state.set(ModuleState::Failed);
                let diagnostic = diagnostics.first().expect("failed compile has diagnostics");
                let exception =
                    crate::error::Exception::from_diagnostic(diagnostic, &program.path, &program.source);
                return Err(ModuleError::Failure(Box::new(exception)));
            }
        };

        let env = self.session.heap.alloc_env(Some(self.session.globals));
        match self.run_function(top_level, env, Token::synthetic()) {
            Ok(_) => program.state.set(ModuleState::Loaded),
            Err(exception) => {
                program.state.set(ModuleState::Failed);
                return Err(ModuleError::Failure(Box::new(exception)));
            }
        }
        Ok(self.export_map_value(program))
    }

    fn export_map_value(&mut self, program: Rc<Program>) -> Value {
        Value::Ref(
            self.session
                .heap
                .allocate(HeapData::ExportMap(crate::object::ExportMap { program })),
        )
    }

    /// `EXPORT_FROM`: re-exports names from a source module's export map
    /// into the current program. An empty pair list re-exports everything.
    pub(crate) fn export_from(&mut self, cached: &Cached, source: Value, pairs: &[(StringId, StringId)]) -> RunResult<()> {
        let Value::Ref(id) = source else {
            return Err(RunError::runtime("EXPORT_FROM expects a module"));
        };
        let HeapData::ExportMap(map) = self.session.heap.get(id) else {
            return Err(RunError::runtime("EXPORT_FROM expects a module"));
        };
        let src = Rc::clone(&map.program);
        let dst = &cached.func.program;
        if pairs.is_empty() {
            let entries: Vec<(StringId, Value)> =
                src.exports.borrow().iter().map(|(&k, &v)| (k, v)).collect();
            for (name, value) in entries {
                dst.export(name, value);
            }
            return Ok(());
        }
        for &(from, to) in pairs {
            match src.read_export(from) {
                Some(value) => dst.export(to, value),
                // Mid-cycle re-export: the name may simply not be bound yet.
                None if src.state.get() == ModuleState::Loading => dst.export(to, Value::Null),
                None => {
                    return Err(RunError::module(format!(
                        "module '{}' has no export '{}'",
                        src.path,
                        self.session.interns.get(from)
                    )));
                }
            }
        }
        Ok(())
    }
}
