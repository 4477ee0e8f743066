//! Programs (modules) and the module registry.
//!
//! A `Program` is one compiled source file: the retained source text (for
//! diagnostics), the canonical path, the top-level function, the export
//! table, and the module lifecycle state. Programs are shared via `Rc`: the
//! registry holds one reference and every function compiled from the program
//! holds another, so a program's source outlives all bytecode that points
//! into it.

use std::{
    cell::{Cell, RefCell},
    path::{Path, PathBuf},
    rc::Rc,
};

use indexmap::IndexMap;

use crate::{function::FnId, intern::StringId, object::ObjectHasher, value::Value};

/// Module lifecycle state.
///
/// `Loading` is observable by other modules during a cyclic import: the
/// partial export table is served, and names not yet bound read as null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// One compiled module.
#[derive(Debug)]
pub struct Program {
    /// Source text, retained so every diagnostic can resolve its line.
    pub source: String,
    /// Canonical path used as the registry key and in diagnostics.
    pub path: String,
    /// Top-level function; set once compilation finishes.
    pub top_level: Cell<Option<FnId>>,
    /// Export table: name → value, in export order.
    pub exports: RefCell<IndexMap<StringId, Value, ObjectHasher>>,
    pub state: Cell<ModuleState>,
}

impl Program {
    pub fn new(source: String, path: String) -> Self {
        Self {
            source,
            path,
            top_level: Cell::new(None),
            exports: RefCell::new(IndexMap::with_hasher(ObjectHasher::default())),
            state: Cell::new(ModuleState::Unloaded),
        }
    }

    /// Binds an export. Rebinding an existing name replaces it.
    pub fn export(&self, name: StringId, value: Value) {
        self.exports.borrow_mut().insert(name, value);
    }

    /// Reads an export by name.
    pub fn read_export(&self, name: StringId) -> Option<Value> {
        self.exports.borrow().get(&name).copied()
    }
}

/// Canonical-path → program map plus the module search path.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: IndexMap<String, Rc<Program>, ObjectHasher>,
    /// Fallback directories searched after the importer-relative path.
    search_paths: Vec<PathBuf>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a directory to the module search path.
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.push(path);
    }

    pub fn get(&self, canonical: &str) -> Option<&Rc<Program>> {
        self.modules.get(canonical)
    }

    pub fn insert(&mut self, canonical: String, program: Rc<Program>) {
        tracing::debug!(module = %canonical, "module registered");
        self.modules.insert(canonical, program);
    }

    /// Iterates all registered programs; their export tables are GC roots.
    pub fn programs(&self) -> impl Iterator<Item = &Rc<Program>> + '_ {
        self.modules.values()
    }

    /// Resolves an import spec against the importing file, then the module
    /// search path. Returns the canonical path of an existing file.
    ///
    /// The spec may be a bare name (`geometry`, completed to
    /// `geometry.ql`) or a relative path with extension.
    pub fn resolve(&self, spec: &str, importer_path: &str) -> Option<PathBuf> {
        let file_name = if Path::new(spec).extension().is_some() {
            PathBuf::from(spec)
        } else {
            PathBuf::from(format!("{spec}.ql"))
        };

        let importer_dir = Path::new(importer_path).parent().map(Path::to_path_buf);
        let mut candidates = Vec::new();
        if let Some(dir) = importer_dir {
            candidates.push(dir.join(&file_name));
        }
        for search in &self.search_paths {
            candidates.push(search.join(&file_name));
        }

        candidates.into_iter().find(|c| c.is_file())
    }
}

/// Derives the default binding name for an import spec: the file stem.
pub fn binding_name(spec: &str) -> &str {
    let trimmed = spec.rsplit(['/', '\\']).next().unwrap_or(spec);
    trimmed.strip_suffix(".ql").unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_name_strips_directories_and_extension() {
        assert_eq!(binding_name("geometry"), "geometry");
        assert_eq!(binding_name("lib/geometry.ql"), "geometry");
        assert_eq!(binding_name("a\\b\\m.ql"), "m");
    }

    #[test]
    fn export_table_round_trips() {
        let program = Program::new(String::new(), "m.ql".to_owned());
        let mut interns = crate::intern::Interner::new();
        let x = interns.intern("x");
        program.export(x, Value::Num(7.0));
        assert_eq!(program.read_export(x), Some(Value::Num(7.0)));
    }
}
