//! Compiled functions and the session-wide function table.

use std::rc::Rc;

use crate::{bytecode::Chunk, intern::StringId, module::Program};

/// Handle to a compiled function in the [`FunctionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FnId(u32);

impl FnId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A compiled function.
///
/// Holds its chunk and a shared reference to the owning program, which keeps
/// the program's source text alive for as long as any bytecode can raise a
/// diagnostic pointing into it.
#[derive(Debug)]
pub struct Function {
    pub name: StringId,
    /// Declared parameter count.
    pub arity: u8,
    /// Arity minus trailing defaulted parameters: the fewest arguments a
    /// call may pass.
    pub min_arity: u8,
    /// True for `init` methods, which return the receiver.
    pub is_initializer: bool,
    /// Parameter names in declaration order.
    pub params: Vec<StringId>,
    pub chunk: Chunk,
    pub program: Rc<Program>,
}

/// Append-only registry of every function compiled in this session,
/// including functions compiled at runtime by `import`.
#[derive(Debug, Default)]
pub struct FunctionTable {
    functions: Vec<Rc<Function>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, function: Function) -> FnId {
        let id = FnId(u32::try_from(self.functions.len()).expect("function table exceeds u32 ids"));
        self.functions.push(Rc::new(function));
        id
    }

    pub fn get(&self, id: FnId) -> &Rc<Function> {
        &self.functions[id.index()]
    }

    /// Iterates every registered function, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (FnId, &Rc<Function>)> + '_ {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, func)| (FnId(i as u32), func))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
