//! Heap object payloads.
//!
//! `HeapData` captures every runtime value that lives in the collected
//! arena. Each variant's payload is a plain struct; reference enumeration
//! for the collector and byte-size estimates for generation accounting are
//! implemented here so the heap itself stays payload-agnostic.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::{
    env::EnvId,
    function::FnId,
    heap::HeapId,
    intern::StringId,
    module::Program,
    value::Value,
};

/// Hasher used for all object-level tables.
pub type ObjectHasher = ahash::RandomState;

/// A child edge of a heap object, as seen by the collector.
#[derive(Debug, Clone, Copy)]
pub enum Child {
    Obj(HeapId),
    Env(EnvId),
}

/// Payload of one arena slot.
#[derive(Debug)]
pub enum HeapData {
    /// Runtime-built string (concatenation, stringify, slicing).
    Str(Box<str>),
    Array(Array),
    Map(MapObj),
    /// A function paired with its captured defining environment.
    Closure(Closure),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    /// Callable that builds tagged values for one enum constructor.
    EnumCtor(EnumCtor),
    /// A tagged value produced by an enum constructor.
    EnumValue(EnumValue),
    /// Live view of a module's export table, pushed by import opcodes.
    ExportMap(ExportMap),
}

/// Dynamic sequence with independent length and capacity.
#[derive(Debug, Default)]
pub struct Array {
    pub items: Vec<Value>,
}

impl Array {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }
}

/// String-keyed map preserving insertion order.
#[derive(Debug, Default)]
pub struct MapObj {
    pub entries: IndexMap<Box<str>, Value, ObjectHasher>,
}

impl MapObj {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity_and_hasher(capacity, ObjectHasher::default()),
        }
    }
}

/// Pairing of a compiled function with the environment it closed over.
#[derive(Debug, Clone, Copy)]
pub struct Closure {
    pub function: FnId,
    pub env: EnvId,
}

/// A class: identity, name, and method table.
///
/// The `uid` is a session-wide monotone counter and is never reused, which
/// is what makes inline-cache hits safe without invalidation.
#[derive(Debug)]
pub struct Class {
    pub uid: u64,
    pub name: StringId,
    pub methods: IndexMap<StringId, Value, ObjectHasher>,
}

/// An instance: class reference plus field map.
#[derive(Debug)]
pub struct Instance {
    pub class: HeapId,
    pub fields: IndexMap<StringId, Value, ObjectHasher>,
}

impl Instance {
    pub fn new(class: HeapId) -> Self {
        Self {
            class,
            fields: IndexMap::with_hasher(ObjectHasher::default()),
        }
    }
}

/// A method extracted from an instance, with the receiver pre-bound.
#[derive(Debug, Clone, Copy)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}

/// Constructor for one enum variant.
#[derive(Debug, Clone, Copy)]
pub struct EnumCtor {
    pub enum_name: StringId,
    pub ctor: StringId,
    pub arity: u8,
}

/// A constructed enum value. Compares structurally.
#[derive(Debug)]
pub struct EnumValue {
    pub enum_name: StringId,
    pub ctor: StringId,
    pub fields: Vec<Value>,
}

/// Live view over a module's export table.
#[derive(Debug)]
pub struct ExportMap {
    pub program: Rc<Program>,
}

/// Fixed per-object overhead used in size accounting.
const OBJECT_BASE_SIZE: usize = std::mem::size_of::<HeapData>() + 24;
const VALUE_SIZE: usize = std::mem::size_of::<Value>();
/// Approximate per-entry cost of the keyed tables (key handle + value +
/// index-map bookkeeping).
const TABLE_ENTRY_SIZE: usize = VALUE_SIZE + 24;

impl HeapData {
    /// Discriminant name for error messages and statistics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Closure(_) => "function",
            Self::Class(_) => "class",
            Self::Instance(_) => "instance",
            Self::BoundMethod(_) => "bound method",
            Self::EnumCtor(_) => "enum constructor",
            Self::EnumValue(_) => "enum value",
            Self::ExportMap(_) => "module",
        }
    }

    /// Byte size used for generation accounting.
    ///
    /// Estimates capacity, not length, so growth is visible to the GC
    /// triggers. The heap refreshes this after any mutating operation.
    pub fn size_estimate(&self) -> usize {
        let payload = match self {
            Self::Str(s) => s.len(),
            Self::Array(array) => array.items.capacity() * VALUE_SIZE,
            Self::Map(map) => map.entries.capacity() * TABLE_ENTRY_SIZE,
            Self::Closure(_) | Self::BoundMethod(_) | Self::EnumCtor(_) => 0,
            Self::Class(class) => class.methods.capacity() * TABLE_ENTRY_SIZE,
            Self::Instance(instance) => instance.fields.capacity() * TABLE_ENTRY_SIZE,
            Self::EnumValue(value) => value.fields.capacity() * VALUE_SIZE,
            Self::ExportMap(_) => 0,
        };
        OBJECT_BASE_SIZE + payload
    }

    /// Enumerates every outgoing reference of this object.
    pub fn for_each_child(&self, f: &mut impl FnMut(Child)) {
        fn value_edge(value: Value, f: &mut impl FnMut(Child)) {
            if let Value::Ref(id) = value {
                f(Child::Obj(id));
            }
        }
        match self {
            Self::Str(_) | Self::EnumCtor(_) => {}
            Self::Array(array) => {
                for &item in &array.items {
                    value_edge(item, f);
                }
            }
            Self::Map(map) => {
                for &item in map.entries.values() {
                    value_edge(item, f);
                }
            }
            Self::Closure(closure) => f(Child::Env(closure.env)),
            Self::Class(class) => {
                for &method in class.methods.values() {
                    value_edge(method, f);
                }
            }
            Self::Instance(instance) => {
                f(Child::Obj(instance.class));
                for &field in instance.fields.values() {
                    value_edge(field, f);
                }
            }
            Self::BoundMethod(bound) => {
                value_edge(bound.receiver, f);
                value_edge(bound.method, f);
            }
            Self::EnumValue(value) => {
                for &field in &value.fields {
                    value_edge(field, f);
                }
            }
            Self::ExportMap(map) => {
                for &value in map.program.exports.borrow().values() {
                    value_edge(value, f);
                }
            }
        }
    }
}
