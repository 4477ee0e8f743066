//! Property and index access, including the inline caches.
//!
//! Each `GET_PROPERTY` / `SET_PROPERTY` / `INVOKE` offset owns an
//! [`InlineCache`] slot in its chunk. A hit compares the receiver's class
//! uid and verifies the key at the cached table index, so behavior is
//! identical with or without the cache; a miss falls back to the hash
//! lookup and overwrites the slot. Class uids are never reused and classes
//! are immutable after construction, so caches never need invalidation.

use std::rc::Rc;

use crate::{
    bytecode::InlineCache,
    error::{RunError, RunResult},
    intern::StringId,
    io::PrintWriter,
    module::ModuleState,
    object::{BoundMethod, HeapData},
    token::Token,
    value::Value,
};

use super::{Cached, CallOutcome, Vm};

/// Outcome of the immutable lookup phase of a property read.
enum PropertyHit {
    Value(Value),
    /// Field found by hash lookup; cache it.
    CacheField { index: usize, uid: u64, value: Value },
    /// Class method found; allocate a bound method and cache the slot.
    BindMethod { index: usize, uid: u64, method: Value },
    Missing,
}

impl<P: PrintWriter> Vm<'_, P> {
    /// `GET_PROPERTY` / `GET_PROPERTY_OPTIONAL` on a non-null receiver.
    pub(crate) fn property_get(
        &mut self,
        cached: &Cached,
        op_start: usize,
        receiver: Value,
        name: StringId,
        optional: bool,
    ) -> RunResult<Value> {
        let hit = match receiver {
            Value::Ref(id) => match self.session.heap.get(id) {
                HeapData::Instance(instance) => self.instance_lookup(cached, op_start, instance, name),
                HeapData::Map(map) => match map.entries.get(self.session.interns.get(name)) {
                    Some(&value) => PropertyHit::Value(value),
                    None => PropertyHit::Missing,
                },
                HeapData::ExportMap(map) => {
                    return self.export_read(&Rc::clone(&map.program), name, optional);
                }
                _ => PropertyHit::Missing,
            },
            _ => PropertyHit::Missing,
        };
        match hit {
            PropertyHit::Value(value) => Ok(value),
            PropertyHit::CacheField { index, uid, value } => {
                cached.func.chunk.ic_set(
                    op_start,
                    InlineCache::Field {
                        class_uid: uid,
                        index: index as u32,
                    },
                );
                Ok(value)
            }
            PropertyHit::BindMethod { index, uid, method } => {
                cached.func.chunk.ic_set(
                    op_start,
                    InlineCache::Method {
                        class_uid: uid,
                        index: index as u32,
                    },
                );
                let id = self
                    .session
                    .heap
                    .allocate(HeapData::BoundMethod(BoundMethod { receiver, method }));
                Ok(Value::Ref(id))
            }
            PropertyHit::Missing => {
                if optional {
                    Ok(Value::Null)
                } else {
                    Err(self.missing_property(receiver, name))
                }
            }
        }
    }

    /// Field-before-method lookup on an instance, consulting the cache.
    fn instance_lookup(
        &self,
        cached: &Cached,
        op_start: usize,
        instance: &crate::object::Instance,
        name: StringId,
    ) -> PropertyHit {
        let HeapData::Class(class) = self.session.heap.get(instance.class) else {
            return PropertyHit::Missing;
        };

        match cached.func.chunk.ic_get(op_start) {
            InlineCache::Field { class_uid, index } if class_uid == class.uid => {
                if let Some((&key, &value)) = instance.fields.get_index(index as usize) {
                    if key == name {
                        return PropertyHit::Value(value);
                    }
                }
            }
            InlineCache::Method { class_uid, index } if class_uid == class.uid => {
                if let Some((&key, &method)) = class.methods.get_index(index as usize) {
                    if key == name {
                        // Still allocates the bound pair; only the lookup is
                        // memoized.
                        return PropertyHit::BindMethod {
                            index: index as usize,
                            uid: class.uid,
                            method,
                        };
                    }
                }
            }
            _ => {}
        }

        if let Some(index) = instance.fields.get_index_of(&name) {
            let (_, &value) = instance.fields.get_index(index).expect("index just found");
            return PropertyHit::CacheField {
                index,
                uid: class.uid,
                value,
            };
        }
        if let Some(index) = class.methods.get_index_of(&name) {
            let (_, &method) = class.methods.get_index(index).expect("index just found");
            return PropertyHit::BindMethod {
                index,
                uid: class.uid,
                method,
            };
        }
        PropertyHit::Missing
    }

    /// Reads an export, applying the cycle rule: a `Loading` module serves
    /// nulls for names its top level has not bound yet.
    fn export_read(&self, program: &Rc<crate::module::Program>, name: StringId, optional: bool) -> RunResult<Value> {
        match program.read_export(name) {
            Some(value) => Ok(value),
            None if program.state.get() == ModuleState::Loading => Ok(Value::Null),
            None if optional => Ok(Value::Null),
            None => Err(RunError::module(format!(
                "module '{}' has no export '{}'",
                program.path,
                self.session.interns.get(name)
            ))),
        }
    }

    fn missing_property(&self, receiver: Value, name: StringId) -> RunError {
        RunError::runtime(format!(
            "{} has no property '{}'",
            receiver.type_name(&self.session.heap),
            self.session.interns.get(name)
        ))
    }

    /// `SET_PROPERTY`: instances and maps only. Instance sites consult the
    /// inline cache so repeated stores skip the hash lookup.
    pub(crate) fn property_set(
        &mut self,
        cached: &Cached,
        op_start: usize,
        receiver: Value,
        name: StringId,
        value: Value,
    ) -> RunResult<()> {
        let Value::Ref(id) = receiver else {
            return Err(RunError::runtime(format!(
                "cannot set properties on {}",
                receiver.type_name(&self.session.heap)
            )));
        };

        // Cache hit: verified slot write, barrier included.
        if let InlineCache::Field { class_uid, index } = cached.func.chunk.ic_get(op_start) {
            let verified = match self.session.heap.get(id) {
                HeapData::Instance(instance) => match self.session.heap.get(instance.class) {
                    HeapData::Class(class) if class.uid == class_uid => instance
                        .fields
                        .get_index(index as usize)
                        .is_some_and(|(&key, _)| key == name),
                    _ => false,
                },
                _ => false,
            };
            if verified {
                self.session.heap.write_barrier(id, value);
                if let HeapData::Instance(instance) = self.session.heap.get_mut(id) {
                    let (_, slot) = instance
                        .fields
                        .get_index_mut(index as usize)
                        .expect("cache index verified");
                    *slot = value;
                }
                return Ok(());
            }
        }

        match self.session.heap.get(id) {
            HeapData::Instance(instance) => {
                let class_id = instance.class;
                self.session.heap.field_set(id, name, value)?;
                // Memoize the slot for the next store through this site.
                if let (HeapData::Instance(instance), HeapData::Class(class)) =
                    (self.session.heap.get(id), self.session.heap.get(class_id))
                {
                    if let Some(index) = instance.fields.get_index_of(&name) {
                        cached.func.chunk.ic_set(
                            op_start,
                            InlineCache::Field {
                                class_uid: class.uid,
                                index: index as u32,
                            },
                        );
                    }
                }
                Ok(())
            }
            HeapData::Map(_) => {
                let key = Box::from(self.session.interns.get(name));
                self.session.heap.map_set(id, key, value)
            }
            other => Err(RunError::runtime(format!(
                "cannot set properties on {}",
                other.kind_name()
            ))),
        }
    }

    /// `GET_INDEX` / `GET_INDEX_OPTIONAL` on a non-null receiver.
    pub(crate) fn index_get(&mut self, receiver: Value, index: Value) -> RunResult<Value> {
        enum Outcome {
            Value(Value),
            Char(String),
        }
        let outcome = match receiver {
            Value::Ref(id) => match self.session.heap.get(id) {
                HeapData::Array(array) => {
                    let i = self.array_index(index, array.items.len())?;
                    Outcome::Value(array.items[i])
                }
                HeapData::Map(map) => {
                    let key = self.key_string(index)?;
                    // A missing key reads as null; arrays are the bounds-
                    // checked container.
                    Outcome::Value(map.entries.get(&*key).copied().unwrap_or(Value::Null))
                }
                HeapData::ExportMap(map) => {
                    let key = self.key_string(index)?;
                    let program = Rc::clone(&map.program);
                    return match self.session.interns.lookup(&key) {
                        Some(name) => self.export_read(&program, name, false),
                        None if program.state.get() == ModuleState::Loading => Ok(Value::Null),
                        None => Err(RunError::module(format!(
                            "module '{}' has no export '{key}'",
                            program.path
                        ))),
                    };
                }
                HeapData::Str(s) => Outcome::Char(self.string_index(s, index)?),
                other => {
                    return Err(RunError::runtime(format!("cannot index {}", other.kind_name())));
                }
            },
            Value::Str(id) => {
                let text = self.session.interns.get(id);
                Outcome::Char(self.string_index(text, index)?)
            }
            other => {
                return Err(RunError::runtime(format!(
                    "cannot index {}",
                    other.type_name(&self.session.heap)
                )));
            }
        };
        match outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::Char(text) => Ok(self.session.heap.alloc_str(text)),
        }
    }

    fn array_index(&self, index: Value, len: usize) -> RunResult<usize> {
        let Value::Num(n) = index else {
            return Err(RunError::runtime(format!(
                "array index must be a number, got {}",
                index.type_name(&self.session.heap)
            )));
        };
        if n.fract() != 0.0 {
            return Err(RunError::runtime("array index must be an integer"));
        }
        if n < 0.0 || n >= len as f64 {
            return Err(RunError::runtime(format!(
                "array index {} out of range (length {len})",
                crate::value::format_num(n)
            )));
        }
        Ok(n as usize)
    }

    fn string_index(&self, text: &str, index: Value) -> RunResult<String> {
        let Value::Num(n) = index else {
            return Err(RunError::runtime("string index must be a number"));
        };
        if n.fract() != 0.0 || n < 0.0 {
            return Err(RunError::runtime("string index must be a non-negative integer"));
        }
        text.chars()
            .nth(n as usize)
            .map(String::from)
            .ok_or_else(|| RunError::runtime(format!("string index {} out of range", crate::value::format_num(n))))
    }

    /// `SET_INDEX`.
    pub(crate) fn index_set(&mut self, receiver: Value, index: Value, value: Value) -> RunResult<()> {
        let Value::Ref(id) = receiver else {
            return Err(RunError::runtime(format!(
                "cannot index {}",
                receiver.type_name(&self.session.heap)
            )));
        };
        match self.session.heap.get(id) {
            HeapData::Array(array) => {
                let i = self.array_index(index, array.items.len())?;
                self.session.heap.array_set(id, i, value)
            }
            HeapData::Map(_) => {
                let key = self.key_string(index)?;
                self.session.heap.map_set(id, key, value)
            }
            other => Err(RunError::runtime(format!("cannot index {}", other.kind_name()))),
        }
    }

    /// `INVOKE name argc`: semantically `GET_PROPERTY name; CALL argc`, fused
    /// so the method-table lookup can be cached without allocating a bound
    /// method.
    pub(crate) fn invoke(
        &mut self,
        cached: &Cached,
        op_start: usize,
        name: StringId,
        argc: u8,
        call_token: Token,
    ) -> RunResult<CallOutcome> {
        let receiver = self.peek(argc as usize);
        let Value::Ref(id) = receiver else {
            return Err(self.missing_property(receiver, name));
        };

        enum Resolved {
            /// Class method: call directly with the receiver bound.
            Method(crate::object::Closure),
            /// Arbitrary callable found as a field/entry/export: it replaces
            /// the receiver slot and is called plainly.
            Field(Value),
        }

        let resolved = match self.session.heap.get(id) {
            HeapData::Instance(instance) => {
                let HeapData::Class(class) = self.session.heap.get(instance.class) else {
                    return Err(RunError::runtime("instance without a class"));
                };
                // Cache fast path.
                if let InlineCache::Method { class_uid, index } = cached.func.chunk.ic_get(op_start) {
                    if class_uid == class.uid {
                        if let Some((&key, &method)) = class.methods.get_index(index as usize) {
                            if key == name {
                                if let Value::Ref(method_id) = method {
                                    if let HeapData::Closure(closure) = self.session.heap.get(method_id) {
                                        let closure = *closure;
                                        return self.call_closure(closure, argc, Some(receiver), call_token);
                                    }
                                }
                            }
                        }
                    }
                }
                // Fields shadow methods.
                if let Some(&field) = instance.fields.get(&name) {
                    Resolved::Field(field)
                } else if let Some(index) = class.methods.get_index_of(&name) {
                    let (_, &method) = class.methods.get_index(index).expect("index just found");
                    cached.func.chunk.ic_set(
                        op_start,
                        InlineCache::Method {
                            class_uid: class.uid,
                            index: index as u32,
                        },
                    );
                    let Value::Ref(method_id) = method else {
                        return Err(RunError::runtime("class method is not callable"));
                    };
                    let HeapData::Closure(closure) = self.session.heap.get(method_id) else {
                        return Err(RunError::runtime("class method is not callable"));
                    };
                    Resolved::Method(*closure)
                } else {
                    return Err(self.missing_property(receiver, name));
                }
            }
            HeapData::Map(map) => match map.entries.get(self.session.interns.get(name)) {
                Some(&value) => Resolved::Field(value),
                None => return Err(self.missing_property(receiver, name)),
            },
            HeapData::ExportMap(map) => {
                let program = Rc::clone(&map.program);
                Resolved::Field(self.export_read(&program, name, false)?)
            }
            other => {
                return Err(RunError::runtime(format!(
                    "{} has no methods",
                    other.kind_name()
                )));
            }
        };

        match resolved {
            Resolved::Method(closure) => self.call_closure(closure, argc, Some(receiver), call_token),
            Resolved::Field(value) => {
                let slot = self.stack.len() - 1 - argc as usize;
                self.stack[slot] = value;
                self.call_value(value, argc, call_token)
            }
        }
    }
}
