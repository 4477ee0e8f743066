//! Lexical environments.
//!
//! Environments form the scope chain: each holds name → binding entries and
//! a parent link. They are arena-allocated and owned by the memory manager
//! (their own free list and byte counter, separate from object accounting)
//! because closures keep captured environments alive past frame exit; only
//! full collections reclaim them.

use ahash::AHashMap;

use crate::{intern::StringId, value::Value};

/// Index of an environment in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(u32);

impl EnvId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("environment arena exceeds u32 ids"))
    }
}

/// Outcome of a failed environment write, formatted by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    /// Name not bound anywhere on the chain.
    Unbound,
    /// Attempted write to a `const` binding.
    ConstWrite,
    /// `const` redefinition of an existing name in the same scope.
    ConstRedefine,
}

/// One binding: the value plus its `let`/`const` discriminant.
#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub value: Value,
    pub constant: bool,
}

/// One environment: bindings plus a parent link.
#[derive(Debug)]
pub struct Env {
    bindings: AHashMap<StringId, Binding>,
    parent: Option<EnvId>,
    /// Mark bit, used only during full collections.
    pub(crate) marked: bool,
}

const ENV_BASE_SIZE: usize = std::mem::size_of::<Env>() + 24;
const BINDING_SIZE: usize = std::mem::size_of::<StringId>() + std::mem::size_of::<Binding>() + 8;

impl Env {
    fn size_estimate(&self) -> usize {
        ENV_BASE_SIZE + self.bindings.len() * BINDING_SIZE
    }

    pub fn parent(&self) -> Option<EnvId> {
        self.parent
    }

    /// Iterates the values bound in this environment.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.bindings.values().map(|b| b.value)
    }
}

/// The environment arena: slots, free list, and byte accounting.
#[derive(Debug, Default)]
pub struct Environments {
    slots: Vec<Option<Env>>,
    free: Vec<EnvId>,
    /// Total estimated bytes of live environments; feeds the full-collection
    /// trigger together with the object generations.
    bytes: usize,
}

impl Environments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of live environments.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Allocates a fresh environment with the given parent.
    pub fn alloc(&mut self, parent: Option<EnvId>) -> EnvId {
        let env = Env {
            bindings: AHashMap::new(),
            parent,
            marked: false,
        };
        self.bytes += env.size_estimate();
        if let Some(id) = self.free.pop() {
            self.slots[id.index()] = Some(env);
            id
        } else {
            let id = EnvId::new(self.slots.len());
            self.slots.push(Some(env));
            id
        }
    }

    pub fn get(&self, id: EnvId) -> &Env {
        self.slots[id.index()].as_ref().expect("environment already freed")
    }

    fn get_mut(&mut self, id: EnvId) -> &mut Env {
        self.slots[id.index()].as_mut().expect("environment already freed")
    }

    /// Defines `name` in `env` itself. `let` replaces an existing binding;
    /// `const` refuses to overwrite one.
    pub fn define(&mut self, env: EnvId, name: StringId, value: Value, constant: bool) -> Result<(), EnvError> {
        let entry = self.get_mut(env);
        if let Some(existing) = entry.bindings.get(&name) {
            if constant || existing.constant {
                return Err(EnvError::ConstRedefine);
            }
            entry.bindings.insert(name, Binding { value, constant });
            return Ok(());
        }
        entry.bindings.insert(name, Binding { value, constant });
        self.bytes += BINDING_SIZE;
        Ok(())
    }

    /// Assigns to the nearest binding of `name`, walking the parent chain.
    pub fn assign(&mut self, env: EnvId, name: StringId, value: Value) -> Result<(), EnvError> {
        let mut cursor = Some(env);
        while let Some(id) = cursor {
            let entry = self.get_mut(id);
            if let Some(binding) = entry.bindings.get_mut(&name) {
                if binding.constant {
                    return Err(EnvError::ConstWrite);
                }
                binding.value = value;
                return Ok(());
            }
            cursor = entry.parent;
        }
        Err(EnvError::Unbound)
    }

    /// Reads the nearest binding of `name`, walking the parent chain.
    pub fn lookup(&self, env: EnvId, name: StringId) -> Option<Value> {
        let mut cursor = Some(env);
        while let Some(id) = cursor {
            let entry = self.get(id);
            if let Some(binding) = entry.bindings.get(&name) {
                return Some(binding.value);
            }
            cursor = entry.parent;
        }
        None
    }

    /// Iterates all live environments. Minor collections scan every live
    /// environment as a root into young space.
    pub fn iter_live(&self) -> impl Iterator<Item = (EnvId, &Env)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|env| (EnvId::new(i), env)))
    }

    pub(crate) fn is_marked(&self, id: EnvId) -> bool {
        self.get(id).marked
    }

    pub(crate) fn set_marked(&mut self, id: EnvId, marked: bool) {
        self.get_mut(id).marked = marked;
    }

    /// Frees one environment, returning its slot to the free list.
    pub(crate) fn release(&mut self, id: EnvId) {
        let env = self.slots[id.index()].take().expect("environment already freed");
        self.bytes -= env.size_estimate();
        self.free.push(id);
    }

    /// Number of slots, live or free, for sweep cursors.
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot_is_live(&self, index: usize) -> bool {
        self.slots[index].is_some()
    }

    pub(crate) fn id_at(&self, index: usize) -> EnvId {
        EnvId::new(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(id: u32) -> StringId {
        // StringId construction goes through an interner in real code; tests
        // use an interner to stay honest about ids.
        let mut interns = crate::intern::Interner::new();
        let mut last = StringId::INIT;
        for i in 0..=id {
            last = interns.intern(&format!("n{i}"));
        }
        last
    }

    #[test]
    fn define_and_lookup_walk_the_chain() {
        let mut envs = Environments::new();
        let outer = envs.alloc(None);
        let inner = envs.alloc(Some(outer));
        let x = name(0);
        envs.define(outer, x, Value::Num(1.0), false).unwrap();
        assert_eq!(envs.lookup(inner, x), Some(Value::Num(1.0)));
        envs.assign(inner, x, Value::Num(2.0)).unwrap();
        assert_eq!(envs.lookup(outer, x), Some(Value::Num(2.0)));
    }

    #[test]
    fn const_rules() {
        let mut envs = Environments::new();
        let env = envs.alloc(None);
        let x = name(0);
        envs.define(env, x, Value::Num(1.0), true).unwrap();
        assert_eq!(envs.assign(env, x, Value::Num(2.0)), Err(EnvError::ConstWrite));
        assert_eq!(
            envs.define(env, x, Value::Num(2.0), true),
            Err(EnvError::ConstRedefine)
        );
        // `let` over an existing `const` is also refused.
        assert_eq!(
            envs.define(env, x, Value::Num(2.0), false),
            Err(EnvError::ConstRedefine)
        );
    }

    #[test]
    fn unbound_assignment_fails() {
        let mut envs = Environments::new();
        let env = envs.alloc(None);
        assert_eq!(envs.assign(env, name(0), Value::Null), Err(EnvError::Unbound));
    }

    #[test]
    fn release_reuses_slots() {
        let mut envs = Environments::new();
        let a = envs.alloc(None);
        let before = envs.bytes();
        envs.release(a);
        assert!(envs.bytes() < before);
        let b = envs.alloc(None);
        assert_eq!(a, b);
    }
}
