//! Opt-in structural typechecker.
//!
//! Runs in lockstep with the compiler: a parallel stack of `Ty` mirrors the
//! operand stack at expression boundaries, and scope maps mirror the
//! environment chain. Diagnostics are collected and reported, but never stop
//! bytecode emission — the VM always sees complete code. The `typecheck`
//! driver mode is the only place where a type error affects the exit code.

use ahash::AHashMap;

use crate::{
    error::{Diagnostic, ErrorKind},
    intern::{Interner, StringId},
    token::Token,
};

/// A type with its nullable flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Ty {
    pub kind: TyKind,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TyKind {
    Any,
    Unknown,
    Number,
    Str,
    Bool,
    Null,
    Array(Box<Ty>),
    Map(Box<Ty>, Box<Ty>),
    Function {
        params: Vec<Ty>,
        ret: Box<Ty>,
    },
    /// A class or interface by name, with type arguments.
    Named(StringId, Vec<Ty>),
    /// An in-scope type parameter.
    Generic(StringId),
}

impl Ty {
    pub fn new(kind: TyKind) -> Self {
        Self {
            kind,
            nullable: false,
        }
    }

    pub fn any() -> Self {
        Self::new(TyKind::Any)
    }

    pub fn number() -> Self {
        Self::new(TyKind::Number)
    }

    pub fn string() -> Self {
        Self::new(TyKind::Str)
    }

    pub fn boolean() -> Self {
        Self::new(TyKind::Bool)
    }

    pub fn null() -> Self {
        Self::new(TyKind::Null)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn non_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    fn is_any(&self) -> bool {
        matches!(self.kind, TyKind::Any)
    }

    /// Name used in diagnostics.
    pub fn describe(&self, interns: &Interner) -> String {
        let base = match &self.kind {
            TyKind::Any => "any".to_owned(),
            TyKind::Unknown => "unknown".to_owned(),
            TyKind::Number => "number".to_owned(),
            TyKind::Str => "string".to_owned(),
            TyKind::Bool => "bool".to_owned(),
            TyKind::Null => "null".to_owned(),
            TyKind::Array(item) => format!("array<{}>", item.describe(interns)),
            TyKind::Map(key, value) => {
                format!("map<{}, {}>", key.describe(interns), value.describe(interns))
            }
            TyKind::Function { params, ret } => {
                let params: Vec<String> = params.iter().map(|p| p.describe(interns)).collect();
                format!("fun({}) -> {}", params.join(", "), ret.describe(interns))
            }
            TyKind::Named(name, args) => {
                if args.is_empty() {
                    interns.get(*name).to_owned()
                } else {
                    let args: Vec<String> = args.iter().map(|a| a.describe(interns)).collect();
                    format!("{}<{}>", interns.get(*name), args.join(", "))
                }
            }
            TyKind::Generic(name) => interns.get(*name).to_owned(),
        };
        if self.nullable && !matches!(self.kind, TyKind::Null | TyKind::Any) {
            format!("{base}?")
        } else {
            base
        }
    }
}

/// Method signature recorded for classes and interfaces.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncSig {
    pub params: Vec<Ty>,
    pub ret: Ty,
}

/// Process-wide registry of interface contracts and class declarations,
/// used for structural subsumption of named types.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    interfaces: AHashMap<StringId, Vec<(StringId, FuncSig)>>,
    classes: AHashMap<StringId, ClassEntry>,
}

#[derive(Debug)]
struct ClassEntry {
    implements: Vec<StringId>,
    methods: Vec<(StringId, FuncSig)>,
}

impl TypeRegistry {
    pub fn declare_interface(&mut self, name: StringId, methods: Vec<(StringId, FuncSig)>) {
        self.interfaces.insert(name, methods);
    }

    pub fn declare_class(&mut self, name: StringId, implements: Vec<StringId>, methods: Vec<(StringId, FuncSig)>) {
        self.classes.insert(name, ClassEntry { implements, methods });
    }

    pub fn is_interface(&self, name: StringId) -> bool {
        self.interfaces.contains_key(&name)
    }

    /// True when class `class_name` declares `interface_name`.
    pub fn class_implements(&self, class_name: StringId, interface_name: StringId) -> bool {
        self.classes
            .get(&class_name)
            .is_some_and(|entry| entry.implements.contains(&interface_name))
    }

    /// Checks a class's method table against one declared interface,
    /// returning the names of missing methods.
    pub fn missing_interface_methods(&self, class_name: StringId, interface_name: StringId) -> Vec<StringId> {
        let Some(contract) = self.interfaces.get(&interface_name) else {
            return Vec::new();
        };
        let Some(entry) = self.classes.get(&class_name) else {
            return Vec::new();
        };
        contract
            .iter()
            .filter(|(name, sig)| {
                !entry
                    .methods
                    .iter()
                    .any(|(method, method_sig)| method == name && method_sig.params.len() == sig.params.len())
            })
            .map(|(name, _)| *name)
            .collect()
    }

    /// Looks up a method signature on a class.
    pub fn class_method(&self, class_name: StringId, method: StringId) -> Option<&FuncSig> {
        self.classes
            .get(&class_name)?
            .methods
            .iter()
            .find(|(name, _)| *name == method)
            .map(|(_, sig)| sig)
    }
}

/// The lockstep checker.
#[derive(Debug, Default)]
pub struct TypeChecker {
    stack: Vec<Ty>,
    scopes: Vec<AHashMap<StringId, Ty>>,
    pub registry: TypeRegistry,
    diagnostics: Vec<Diagnostic>,
    error_count: usize,
}

impl TypeChecker {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            scopes: vec![AHashMap::new()],
            registry: TypeRegistry::default(),
            diagnostics: Vec::new(),
            error_count: 0,
        }
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    fn error(&mut self, token: Token, message: String) {
        self.error_count += 1;
        self.diagnostics.push(Diagnostic::new(ErrorKind::Type, message, token));
    }

    /// Reports a type error from the compiler's own checks (return types,
    /// narrowing shapes) without exposing the internal reporter.
    pub fn type_error(&mut self, token: Token, message: String) {
        self.error(token, message);
    }

    // ---- stack mirror --------------------------------------------------

    pub fn push(&mut self, ty: Ty) {
        self.stack.push(ty);
    }

    pub fn pop(&mut self) -> Ty {
        // The mirror may under-run after a parse error; degrade to `any`
        // rather than cascading.
        self.stack.pop().unwrap_or_else(Ty::any)
    }

    pub fn peek(&self) -> Ty {
        self.stack.last().cloned().unwrap_or_else(Ty::any)
    }

    /// Resets the mirror at statement boundaries; parse errors can leave
    /// residue that must not leak between statements.
    pub fn reset_stack(&mut self) {
        self.stack.clear();
    }

    // ---- scopes --------------------------------------------------------

    pub fn begin_scope(&mut self) {
        self.scopes.push(AHashMap::new());
    }

    pub fn end_scope(&mut self) {
        self.scopes.pop();
        if self.scopes.is_empty() {
            self.scopes.push(AHashMap::new());
        }
    }

    /// Records a variable's declared or inferred type.
    pub fn declare(&mut self, name: StringId, ty: Ty) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name, ty);
    }

    fn lookup(&self, name: StringId) -> Option<&Ty> {
        self.scopes.iter().rev().find_map(|scope| scope.get(&name))
    }

    /// Narrows `name` to non-null in the current scope (`!= null` test).
    pub fn narrow_non_null(&mut self, name: StringId) {
        if let Some(ty) = self.lookup(name).cloned() {
            self.declare(name, ty.non_null());
        }
    }

    // ---- checks driven by the compiler ---------------------------------

    /// `let name [: annotation] = <top of stack>`.
    pub fn check_declaration(&mut self, name: StringId, annotation: Option<Ty>, token: Token, interns: &Interner) {
        let initializer = self.pop();
        let declared = match annotation {
            Some(annotated) => {
                if !self.assignable(&initializer, &annotated) {
                    self.error(
                        token,
                        format!(
                            "cannot assign {} to {}",
                            initializer.describe(interns),
                            annotated.describe(interns)
                        ),
                    );
                }
                annotated
            }
            None => initializer,
        };
        self.declare(name, declared);
    }

    /// `name = <top of stack>`; the value stays on the mirror, matching the
    /// operand stack, and the variable keeps its declared type.
    pub fn check_assignment(&mut self, name: StringId, token: Token, interns: &Interner) {
        let value = self.peek();
        if let Some(declared) = self.lookup(name).cloned() {
            if !self.assignable(&value, &declared) {
                self.error(
                    token,
                    format!(
                        "cannot assign {} to {} (declared {})",
                        value.describe(interns),
                        interns.get(name),
                        declared.describe(interns)
                    ),
                );
            }
        }
    }

    /// Variable read: pushes the recorded type, or `any` for unknown names
    /// (natives, imports, forward references).
    pub fn check_var(&mut self, name: StringId) {
        let ty = self.lookup(name).cloned().unwrap_or_else(Ty::any);
        self.push(ty);
    }

    /// Binary arithmetic / comparison, mirroring one pop-2-push-1 opcode.
    pub fn check_binary(&mut self, op: BinaryTy, token: Token, interns: &Interner) {
        let rhs = self.pop();
        let lhs = self.pop();
        let result = match op {
            BinaryTy::Add => {
                if lhs.is_any() || rhs.is_any() {
                    Ty::any()
                } else if matches!(lhs.kind, TyKind::Number) && matches!(rhs.kind, TyKind::Number) {
                    Ty::number()
                } else if matches!(lhs.kind, TyKind::Str) && matches!(rhs.kind, TyKind::Str) {
                    Ty::string()
                } else {
                    self.error(
                        token,
                        format!(
                            "operator + expects two numbers or two strings, got {} and {}",
                            lhs.describe(interns),
                            rhs.describe(interns)
                        ),
                    );
                    Ty::any()
                }
            }
            BinaryTy::Arithmetic => {
                if (lhs.is_any() || matches!(lhs.kind, TyKind::Number))
                    && (rhs.is_any() || matches!(rhs.kind, TyKind::Number))
                {
                    Ty::number()
                } else {
                    self.error(
                        token,
                        format!(
                            "arithmetic expects numbers, got {} and {}",
                            lhs.describe(interns),
                            rhs.describe(interns)
                        ),
                    );
                    Ty::number()
                }
            }
            BinaryTy::Comparison => {
                if (lhs.is_any() || matches!(lhs.kind, TyKind::Number))
                    && (rhs.is_any() || matches!(rhs.kind, TyKind::Number))
                {
                    Ty::boolean()
                } else {
                    self.error(
                        token,
                        format!(
                            "comparison expects numbers, got {} and {}",
                            lhs.describe(interns),
                            rhs.describe(interns)
                        ),
                    );
                    Ty::boolean()
                }
            }
            BinaryTy::Equality => Ty::boolean(),
        };
        self.push(result);
    }

    /// `and` / `or` produce one of their operands.
    pub fn check_logical(&mut self) {
        let rhs = self.pop();
        let lhs = self.pop();
        if lhs == rhs {
            self.push(lhs);
        } else {
            self.push(Ty::any());
        }
    }

    pub fn check_negate(&mut self, token: Token, interns: &Interner) {
        let operand = self.pop();
        if !operand.is_any() && !matches!(operand.kind, TyKind::Number) {
            self.error(
                token,
                format!("unary - expects a number, got {}", operand.describe(interns)),
            );
        }
        self.push(Ty::number());
    }

    pub fn check_not(&mut self) {
        self.pop();
        self.push(Ty::boolean());
    }

    pub fn check_stringify(&mut self) {
        self.pop();
        self.push(Ty::string());
    }

    /// Call with `argc` arguments above the callee on the mirror.
    pub fn check_call(&mut self, argc: u8, optional: bool, token: Token, interns: &Interner) {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop());
        }
        args.reverse();
        let callee = self.pop();
        if callee.nullable && !optional {
            self.error(
                token,
                "call target may be null; use ?. to call optionally".to_owned(),
            );
        }
        let result = match &callee.kind {
            TyKind::Function { params, ret } => {
                if params.len() == args.len() {
                    for (arg, param) in args.iter().zip(params.iter()) {
                        if !self.assignable(arg, param) {
                            self.error(
                                token,
                                format!(
                                    "argument of type {} is not assignable to parameter of type {}",
                                    arg.describe(interns),
                                    param.describe(interns)
                                ),
                            );
                            break;
                        }
                    }
                }
                (**ret).clone()
            }
            _ => Ty::any(),
        };
        self.push(if optional { result.nullable() } else { result });
    }

    /// Property access. Optional access yields a nullable result; plain
    /// access on a nullable receiver is an error.
    pub fn check_property(&mut self, name: StringId, optional: bool, token: Token, interns: &Interner) {
        let receiver = self.pop();
        if receiver.nullable && !optional {
            self.error(
                token,
                format!(
                    "property {} accessed on possibly-null {}; use ?.",
                    interns.get(name),
                    receiver.describe(interns)
                ),
            );
        }
        let result = match &receiver.kind {
            TyKind::Named(class_name, _) => self
                .registry
                .class_method(*class_name, name)
                .map(|sig| {
                    Ty::new(TyKind::Function {
                        params: sig.params.clone(),
                        ret: Box::new(sig.ret.clone()),
                    })
                })
                .unwrap_or_else(Ty::any),
            _ => Ty::any(),
        };
        self.push(if optional { result.nullable() } else { result });
    }

    /// `receiver[index]`.
    pub fn check_index(&mut self, optional: bool) {
        let _index = self.pop();
        let receiver = self.pop();
        let result = match receiver.kind {
            TyKind::Array(item) => *item,
            TyKind::Map(_, value) => *value,
            _ => Ty::any(),
        };
        self.push(if optional { result.nullable() } else { result });
    }

    /// Verifies a class's declared interfaces structurally.
    pub fn check_implements(&mut self, class_name: StringId, token: Token, interns: &Interner) {
        let implements: Vec<StringId> = self
            .registry
            .classes
            .get(&class_name)
            .map(|entry| entry.implements.clone())
            .unwrap_or_default();
        for interface in implements {
            if !self.registry.is_interface(interface) {
                self.error(
                    token,
                    format!("unknown interface {}", interns.get(interface)),
                );
                continue;
            }
            for missing in self.registry.missing_interface_methods(class_name, interface) {
                self.error(
                    token,
                    format!(
                        "class {} does not satisfy interface {}: missing method {}",
                        interns.get(class_name),
                        interns.get(interface),
                        interns.get(missing)
                    ),
                );
            }
        }
    }

    // ---- assignability -------------------------------------------------

    /// `from` flows into `to`.
    pub fn assignable(&self, from: &Ty, to: &Ty) -> bool {
        if matches!(to.kind, TyKind::Any | TyKind::Unknown) || matches!(from.kind, TyKind::Any) {
            return true;
        }
        // A nullable source cannot flow into a non-nullable destination.
        if (from.nullable || matches!(from.kind, TyKind::Null)) && !to.nullable {
            return matches!(to.kind, TyKind::Null) && matches!(from.kind, TyKind::Null);
        }
        match (&from.kind, &to.kind) {
            (TyKind::Null, _) => to.nullable,
            (TyKind::Number, TyKind::Number)
            | (TyKind::Str, TyKind::Str)
            | (TyKind::Bool, TyKind::Bool) => true,
            (TyKind::Array(a), TyKind::Array(b)) => self.assignable(a, b),
            (TyKind::Map(ak, av), TyKind::Map(bk, bv)) => self.assignable(ak, bk) && self.assignable(av, bv),
            (
                TyKind::Function {
                    params: from_params,
                    ret: from_ret,
                },
                TyKind::Function {
                    params: to_params,
                    ret: to_ret,
                },
            ) => {
                from_params.len() == to_params.len()
                    && from_params
                        .iter()
                        .zip(to_params.iter())
                        .all(|(f, t)| self.assignable(t, f))
                    && self.assignable(from_ret, to_ret)
            }
            (TyKind::Named(from_name, _), TyKind::Named(to_name, _)) => {
                from_name == to_name || self.registry.class_implements(*from_name, *to_name)
            }
            (TyKind::Generic(a), TyKind::Generic(b)) => a == b,
            _ => false,
        }
    }
}

/// Shape classes for `check_binary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryTy {
    Add,
    Arithmetic,
    Comparison,
    Equality,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(interns: &mut Interner, items: &[&str]) -> Vec<StringId> {
        items.iter().map(|s| interns.intern(s)).collect()
    }

    #[test]
    fn nullable_does_not_flow_into_non_nullable() {
        let checker = TypeChecker::new();
        assert!(!checker.assignable(&Ty::string().nullable(), &Ty::string()));
        assert!(checker.assignable(&Ty::string().nullable(), &Ty::string().nullable()));
        assert!(checker.assignable(&Ty::string(), &Ty::string().nullable()));
        assert!(checker.assignable(&Ty::string().nullable(), &Ty::any()));
    }

    #[test]
    fn any_flows_anywhere() {
        let checker = TypeChecker::new();
        assert!(checker.assignable(&Ty::any(), &Ty::number()));
        assert!(checker.assignable(&Ty::number(), &Ty::any()));
    }

    #[test]
    fn string_to_number_declaration_is_an_error() {
        let mut interns = Interner::new();
        let ids = names(&mut interns, &["n"]);
        let mut checker = TypeChecker::new();
        checker.push(Ty::string());
        checker.check_declaration(ids[0], Some(Ty::number()), Token::synthetic(), &interns);
        assert_eq!(checker.error_count(), 1);
    }

    #[test]
    fn narrowing_removes_nullability() {
        let mut interns = Interner::new();
        let ids = names(&mut interns, &["x"]);
        let mut checker = TypeChecker::new();
        checker.declare(ids[0], Ty::string().nullable());
        checker.begin_scope();
        checker.narrow_non_null(ids[0]);
        checker.check_var(ids[0]);
        assert_eq!(checker.pop(), Ty::string());
        checker.end_scope();
        checker.check_var(ids[0]);
        assert_eq!(checker.pop(), Ty::string().nullable());
    }

    #[test]
    fn class_satisfies_interface_through_registry() {
        let mut interns = Interner::new();
        let ids = names(&mut interns, &["Shape", "Circle", "area"]);
        let (shape, circle, area) = (ids[0], ids[1], ids[2]);
        let mut checker = TypeChecker::new();
        let sig = FuncSig {
            params: vec![],
            ret: Ty::number(),
        };
        checker.registry.declare_interface(shape, vec![(area, sig.clone())]);
        checker.registry.declare_class(circle, vec![shape], vec![(area, sig)]);
        checker.check_implements(circle, Token::synthetic(), &interns);
        assert_eq!(checker.error_count(), 0);
        assert!(checker.assignable(
            &Ty::new(TyKind::Named(circle, vec![])),
            &Ty::new(TyKind::Named(shape, vec![]))
        ));
    }

    #[test]
    fn missing_interface_method_is_reported() {
        let mut interns = Interner::new();
        let ids = names(&mut interns, &["Shape", "Square", "area"]);
        let (shape, square, area) = (ids[0], ids[1], ids[2]);
        let mut checker = TypeChecker::new();
        checker.registry.declare_interface(
            shape,
            vec![(
                area,
                FuncSig {
                    params: vec![],
                    ret: Ty::number(),
                },
            )],
        );
        checker.registry.declare_class(square, vec![shape], vec![]);
        checker.check_implements(square, Token::synthetic(), &interns);
        assert_eq!(checker.error_count(), 1);
    }
}
