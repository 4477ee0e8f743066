//! Single-pass compiler: tokens → bytecode.
//!
//! Lexing, Pratt parsing, and emission are fused into one linear pass over
//! the token stream. There is no AST: expression handlers emit into the
//! current function's `ChunkBuilder` as they parse, and the structural
//! typechecker is driven in lockstep so its type stack mirrors the operand
//! stack at expression boundaries. Each finished chunk goes through the
//! constant-folding peephole pass before the function is registered.
//!
//! Two constructs need source that runs out of order — parameter defaults
//! (emitted into the callee preamble) and `for` increments (emitted after
//! the body). Both use token replay: the span is skipped on first contact
//! and the parser position is rewound to it when the code is needed.
//!
//! Parse errors use panic-mode recovery: the diagnostic is recorded, tokens
//! are skipped to the next `;` or statement-starting keyword, and parsing
//! resumes. Type errors never stop emission.

use std::rc::Rc;

use crate::{
    bytecode::{ChunkBuilder, JumpLabel, Opcode, optimize},
    error::{Diagnostic, ErrorKind},
    function::{FnId, Function, FunctionTable},
    intern::{Interner, StringId},
    lexer::{lex, unescape},
    module::{Program, binding_name},
    token::{Token, TokenKind},
    typecheck::{BinaryTy, FuncSig, Ty, TyKind, TypeChecker},
    value::Value,
};

/// Compiles one program's source to its top-level function.
///
/// Lex and parse errors are returned; type diagnostics accumulate in the
/// checker and never fail the compile. On success the program's `top_level`
/// is set and all compiled functions are registered in `funcs`.
pub fn compile(
    program: &Rc<Program>,
    interns: &mut Interner,
    funcs: &mut FunctionTable,
    checker: &mut TypeChecker,
    repl_mode: bool,
) -> Result<FnId, Vec<Diagnostic>> {
    let (tokens, lex_diagnostics) = lex(&program.source);
    let mut compiler = Compiler {
        tokens,
        source: program.source.clone(),
        pos: 0,
        interns,
        funcs,
        checker,
        program: Rc::clone(program),
        diagnostics: lex_diagnostics,
        panic_mode: false,
        states: vec![FuncState::new(FuncKind::Script)],
        current_class: None,
        type_params: Vec::new(),
        optional_chain: false,
        repl_mode,
    };

    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
        if compiler.panic_mode {
            compiler.synchronize();
        }
    }

    let state = compiler.states.pop().expect("script state present");
    let mut builder = state.builder;
    builder.set_token(compiler.peek());
    builder.emit(Opcode::Null);
    builder.emit(Opcode::Return);

    if !compiler.diagnostics.is_empty() {
        return Err(compiler.diagnostics);
    }

    let chunk = optimize(&builder.build(), compiler.interns);
    let top_level = compiler.funcs.add(Function {
        name: StringId::MODULE,
        arity: 0,
        min_arity: 0,
        is_initializer: false,
        params: Vec::new(),
        chunk,
        program: Rc::clone(program),
    });
    program.top_level.set(Some(top_level));
    Ok(top_level)
}

/// Expression precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
}

impl Prec {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary | Self::Call => Self::Call,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuncKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// Per-function compile state.
struct FuncState {
    builder: ChunkBuilder,
    kind: FuncKind,
    scope_depth: u32,
    loops: Vec<LoopCtx>,
    return_type: Option<Ty>,
}

impl FuncState {
    fn new(kind: FuncKind) -> Self {
        Self {
            builder: ChunkBuilder::new(),
            kind,
            scope_depth: 0,
            loops: Vec::new(),
            return_type: None,
        }
    }
}

/// Open loop: jump bookkeeping for `break`/`continue` plus the scope depth
/// to unwind to before leaving the loop body.
struct LoopCtx {
    start: usize,
    scope_depth: u32,
    breaks: Vec<JumpLabel>,
    continues: Vec<JumpLabel>,
    /// True when `continue` can jump straight back to `start` (while);
    /// false when it must jump forward to a later patch point (for).
    continue_to_start: bool,
}

struct Compiler<'a> {
    tokens: Vec<Token>,
    source: String,
    pos: usize,
    interns: &'a mut Interner,
    funcs: &'a mut FunctionTable,
    checker: &'a mut TypeChecker,
    program: Rc<Program>,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
    states: Vec<FuncState>,
    current_class: Option<StringId>,
    /// In-scope generic type parameter names.
    type_params: Vec<StringId>,
    /// True once `?.` appeared in the current postfix chain; later links
    /// compile to their optional variants so null keeps propagating.
    optional_chain: bool,
    repl_mode: bool,
}

impl Compiler<'_> {
    // ---- token plumbing ------------------------------------------------

    fn peek(&self) -> Token {
        self.tokens[self.pos]
    }

    fn peek_kind(&self) -> TokenKind {
        self.tokens[self.pos].kind
    }

    fn peek_ahead(&self, n: usize) -> TokenKind {
        self.tokens
            .get(self.pos + n)
            .map_or(TokenKind::Eof, |t| t.kind)
    }

    fn previous(&self) -> Token {
        self.tokens[self.pos.saturating_sub(1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos];
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Token {
        if self.check(kind) {
            self.advance()
        } else {
            self.error_here(message);
            self.peek()
        }
    }

    fn token_text(&self, token: Token) -> &str {
        let start = token.start as usize;
        &self.source[start..start + token.len as usize]
    }

    // ---- diagnostics ---------------------------------------------------

    fn error_at(&mut self, token: Token, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.diagnostics
            .push(Diagnostic::new(ErrorKind::Parse, message, token));
    }

    fn error_here(&mut self, message: impl Into<String>) {
        self.error_at(self.peek(), message);
    }

    /// Panic-mode recovery: skip to the next statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        self.checker.reset_stack();
        while !self.check(TokenKind::Eof) {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }
            if self.peek_kind().starts_statement() {
                return;
            }
            self.advance();
        }
    }

    // ---- emission plumbing ---------------------------------------------

    fn state(&mut self) -> &mut FuncState {
        self.states.last_mut().expect("function state present")
    }

    fn builder(&mut self) -> &mut ChunkBuilder {
        &mut self.state().builder
    }

    fn mark(&mut self) {
        let token = self.previous();
        self.builder().set_token(token);
    }

    fn emit(&mut self, op: Opcode) {
        self.builder().emit(op);
    }

    fn name_constant(&mut self, name: StringId) -> u16 {
        self.builder().add_constant(Value::Str(name))
    }

    fn intern_token(&mut self, token: Token) -> StringId {
        let start = token.start as usize;
        let text = &self.source[start..start + token.len as usize];
        self.interns.intern(text)
    }

    // ---- scopes --------------------------------------------------------

    fn begin_scope(&mut self) {
        self.emit(Opcode::BeginScope);
        self.state().scope_depth += 1;
        self.checker.begin_scope();
    }

    fn end_scope(&mut self) {
        self.emit(Opcode::EndScope);
        self.state().scope_depth -= 1;
        self.checker.end_scope();
    }

    // ---- declarations --------------------------------------------------

    fn declaration(&mut self) {
        match self.peek_kind() {
            TokenKind::Class => {
                self.advance();
                self.class_declaration(false);
            }
            TokenKind::Fun => {
                self.advance();
                self.fun_declaration(false);
            }
            TokenKind::Let => {
                self.advance();
                self.var_declaration(false, false);
            }
            TokenKind::Const => {
                self.advance();
                self.var_declaration(true, false);
            }
            TokenKind::Enum => {
                self.advance();
                self.enum_declaration(false);
            }
            TokenKind::Interface => {
                self.advance();
                self.interface_declaration();
            }
            TokenKind::Import => {
                self.advance();
                self.import_statement();
            }
            TokenKind::From => {
                self.advance();
                self.from_import_statement();
            }
            TokenKind::Export => {
                self.advance();
                self.export_declaration();
            }
            _ => self.statement(),
        }
        // Safe point after every statement.
        self.emit(Opcode::Gc);
        self.checker.reset_stack();
    }

    fn var_declaration(&mut self, constant: bool, export: bool) {
        let name_token = self.consume(TokenKind::Identifier, "expected variable name");
        let name = self.intern_token(name_token);
        let annotation = if self.matches(TokenKind::Colon) {
            Some(self.parse_type())
        } else {
            None
        };
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.mark();
            self.emit(Opcode::Null);
            self.checker.push(Ty::null());
        }
        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration");
        self.checker
            .check_declaration(name, annotation, name_token, self.interns);
        let name_idx = self.name_constant(name);
        self.builder().set_token(name_token);
        let op = if constant { Opcode::DefineConst } else { Opcode::DefineVar };
        self.builder().emit_u16(op, name_idx);
        if export {
            self.builder().emit_u16(Opcode::Export, name_idx);
        }
    }

    fn fun_declaration(&mut self, export: bool) {
        let name_token = self.consume(TokenKind::Identifier, "expected function name");
        let name = self.intern_token(name_token);
        // Recursive calls inside the body resolve at runtime through the
        // environment; the checker sees them as `any` until this declare.
        let (fn_id, sig) = self.compile_function(FuncKind::Function, name, name_token);
        self.checker.declare(
            name,
            Ty::new(TyKind::Function {
                params: sig.params.clone(),
                ret: Box::new(sig.ret.clone()),
            }),
        );
        let fn_const = self.builder().add_constant(Value::Fn(fn_id));
        self.builder().set_token(name_token);
        self.builder().emit_u16(Opcode::Closure, fn_const);
        let name_idx = self.name_constant(name);
        self.builder().emit_u16(Opcode::DefineVar, name_idx);
        if export {
            self.builder().emit_u16(Opcode::Export, name_idx);
        }
    }

    /// Compiles a function body into its own chunk and registers it.
    ///
    /// The parameter list is pre-scanned once to count arity and trailing
    /// defaults, then re-parsed for real. Default expressions are emitted as
    /// per-parameter preambles guarded by `ARG_COUNT`, in declaration order.
    fn compile_function(&mut self, kind: FuncKind, name: StringId, name_token: Token) -> (FnId, FuncSig) {
        // Optional generic type parameters: `fun id<T>(x: T) -> ...`.
        let type_param_base = self.type_params.len();
        if self.matches(TokenKind::Less) {
            loop {
                let token = self.consume(TokenKind::Identifier, "expected type parameter name");
                let id = self.intern_token(token);
                self.type_params.push(id);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::Greater, "expected '>' after type parameters");
        }

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        let (arity, default_count) = self.scan_parameter_counts();
        let min_arity = arity - default_count;

        self.states.push(FuncState::new(kind));
        self.checker.begin_scope();

        // Parse parameters for real: names, annotations, default spans.
        let mut params: Vec<StringId> = Vec::new();
        let mut param_types: Vec<Ty> = Vec::new();
        let mut defaults: Vec<(StringId, usize, usize)> = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                let token = self.consume(TokenKind::Identifier, "expected parameter name");
                let param = self.intern_token(token);
                let ty = if self.matches(TokenKind::Colon) {
                    self.parse_type()
                } else {
                    Ty::any()
                };
                if self.matches(TokenKind::Equal) {
                    let start = self.pos;
                    self.skip_expression_tokens();
                    defaults.push((param, start, self.pos));
                } else if !defaults.is_empty() {
                    self.error_at(token, "parameters without defaults cannot follow defaulted ones");
                }
                self.checker.declare(param, ty.clone());
                params.push(param);
                param_types.push(ty);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");

        let return_type = if self.matches(TokenKind::Colon) {
            self.parse_type()
        } else {
            Ty::any()
        };
        self.state().return_type = Some(return_type.clone());

        // Default preambles, in declaration order: if fewer arguments than
        // the parameter's position were passed, evaluate the default.
        for (index, param) in params.iter().enumerate() {
            let Some(&(_, start, end)) = defaults.iter().find(|(p, _, _)| p == param) else {
                continue;
            };
            let param = *param;
            self.builder().set_token(name_token);
            self.emit(Opcode::ArgCount);
            let threshold = self.builder().add_constant(Value::Num((index + 1) as f64));
            self.builder().emit_u16(Opcode::Constant, threshold);
            self.emit(Opcode::Less);
            let skip = self.builder().emit_jump(Opcode::JumpIfFalse);
            self.emit(Opcode::Pop);
            let resume = self.pos;
            self.pos = start;
            self.expression();
            debug_assert_eq!(self.pos, end, "default span replay must consume exactly its tokens");
            self.pos = resume;
            let name_idx = self.name_constant(param);
            self.builder().emit_u16(Opcode::SetVar, name_idx);
            self.emit(Opcode::Pop);
            self.checker.pop();
            let done = self.builder().emit_jump(Opcode::Jump);
            self.builder().patch_jump(skip);
            self.emit(Opcode::Pop);
            self.builder().patch_jump(done);
        }

        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after function body");

        self.emit_implicit_return();
        self.checker.end_scope();
        self.type_params.truncate(type_param_base);

        let state = self.states.pop().expect("function state present");
        let chunk = optimize(&state.builder.build(), self.interns);
        let function = Function {
            name,
            arity,
            min_arity,
            is_initializer: kind == FuncKind::Initializer,
            params,
            chunk,
            program: Rc::clone(&self.program),
        };
        let fn_id = self.funcs.add(function);
        let sig = FuncSig {
            params: param_types,
            ret: return_type,
        };
        (fn_id, sig)
    }

    /// Pre-scan of the parameter list (cursor stays put): counts parameters
    /// and how many carry defaults. Walks the same structure the real parse
    /// will, so type annotations containing `<`, `>`, and `,` do not confuse
    /// the counts.
    fn scan_parameter_counts(&self) -> (u8, u8) {
        let mut arity: u8 = 0;
        let mut defaults: u8 = 0;
        let mut cursor = self.pos;
        let kind_at = |c: usize| self.tokens.get(c).map_or(TokenKind::Eof, |t| t.kind);
        while !matches!(kind_at(cursor), TokenKind::RightParen | TokenKind::Eof) {
            if kind_at(cursor) != TokenKind::Identifier {
                break;
            }
            cursor += 1;
            arity = arity.saturating_add(1);
            if kind_at(cursor) == TokenKind::Colon {
                cursor += 1;
                cursor = self.skip_type_tokens(cursor);
            }
            if kind_at(cursor) == TokenKind::Equal {
                defaults = defaults.saturating_add(1);
                cursor += 1;
                // Skip the default expression up to a top-level `,` or `)`.
                let mut depth = 0u32;
                loop {
                    match kind_at(cursor) {
                        TokenKind::Eof => break,
                        TokenKind::LeftParen
                        | TokenKind::LeftBracket
                        | TokenKind::LeftBrace
                        | TokenKind::InterpStart => depth += 1,
                        TokenKind::RightParen if depth == 0 => break,
                        TokenKind::Comma if depth == 0 => break,
                        TokenKind::RightParen
                        | TokenKind::RightBracket
                        | TokenKind::RightBrace
                        | TokenKind::InterpEnd => depth = depth.saturating_sub(1),
                        _ => {}
                    }
                    cursor += 1;
                }
            }
            if kind_at(cursor) == TokenKind::Comma {
                cursor += 1;
            }
        }
        (arity, defaults)
    }

    /// Advances past one type annotation's tokens; mirrors `parse_type`.
    fn skip_type_tokens(&self, cursor: usize) -> usize {
        let kind_at = |c: usize| self.tokens.get(c).map_or(TokenKind::Eof, |t| t.kind);
        let mut c = cursor;
        match kind_at(c) {
            TokenKind::Null => c += 1,
            TokenKind::Fun => {
                c += 1;
                if kind_at(c) == TokenKind::LeftParen {
                    c += 1;
                    if kind_at(c) != TokenKind::RightParen {
                        loop {
                            c = self.skip_type_tokens(c);
                            if kind_at(c) == TokenKind::Comma {
                                c += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    if kind_at(c) == TokenKind::RightParen {
                        c += 1;
                    }
                }
                if kind_at(c) == TokenKind::Arrow {
                    c += 1;
                    c = self.skip_type_tokens(c);
                }
            }
            TokenKind::Identifier => {
                c += 1;
                if kind_at(c) == TokenKind::Less {
                    c += 1;
                    loop {
                        c = self.skip_type_tokens(c);
                        if kind_at(c) == TokenKind::Comma {
                            c += 1;
                        } else {
                            break;
                        }
                    }
                    if kind_at(c) == TokenKind::Greater {
                        c += 1;
                    }
                }
            }
            _ => {}
        }
        if kind_at(c) == TokenKind::Question {
            c += 1;
        }
        c
    }

    /// Skips one expression's tokens without emitting: stops at a top-level
    /// `,`, `;`, or closing delimiter.
    fn skip_expression_tokens(&mut self) {
        let mut depth = 0u32;
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace | TokenKind::InterpStart => {
                    depth += 1;
                }
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace | TokenKind::InterpEnd => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                }
                TokenKind::Comma | TokenKind::Semicolon if depth == 0 => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn emit_implicit_return(&mut self) {
        if self.state().kind == FuncKind::Initializer {
            let this_idx = self.name_constant(StringId::THIS);
            self.builder().emit_u16(Opcode::GetVar, this_idx);
        } else {
            self.emit(Opcode::Null);
        }
        self.emit(Opcode::Return);
    }

    fn class_declaration(&mut self, export: bool) {
        let name_token = self.consume(TokenKind::Identifier, "expected class name");
        let name = self.intern_token(name_token);
        let previous_class = self.current_class.replace(name);

        // `implements` is contextual, not a keyword.
        let mut implements = Vec::new();
        if self.check(TokenKind::Identifier) && self.token_text(self.peek()) == "implements" {
            self.advance();
            loop {
                let token = self.consume(TokenKind::Identifier, "expected interface name");
                implements.push(self.intern_token(token));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(TokenKind::LeftBrace, "expected '{' before class body");
        let mut method_count: u16 = 0;
        let mut method_sigs: Vec<(StringId, FuncSig)> = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Fun, "expected method declaration");
            let method_token = self.consume(TokenKind::Identifier, "expected method name");
            let method_name = self.intern_token(method_token);
            let kind = if method_name == StringId::INIT {
                FuncKind::Initializer
            } else {
                FuncKind::Method
            };
            let (fn_id, sig) = self.compile_function(kind, method_name, method_token);
            let fn_const = self.builder().add_constant(Value::Fn(fn_id));
            self.builder().set_token(method_token);
            self.builder().emit_u16(Opcode::Closure, fn_const);
            self.checker.push(Ty::any());
            method_count += 1;
            method_sigs.push((method_name, sig));
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after class body");

        let init_sig = method_sigs
            .iter()
            .find(|(method, _)| *method == StringId::INIT)
            .map(|(_, sig)| sig.clone());
        self.checker
            .registry
            .declare_class(name, implements, method_sigs);
        self.checker.check_implements(name, name_token, self.interns);

        let name_idx = self.name_constant(name);
        self.builder().set_token(name_token);
        self.builder().emit_u16(Opcode::Class, name_idx);
        self.builder().emit_operand_u16(method_count);
        for _ in 0..method_count {
            self.checker.pop();
        }
        self.builder().emit_u16(Opcode::DefineVar, name_idx);

        // Calling the class constructs an instance through `init`.
        let ctor_params = init_sig.map(|sig| sig.params).unwrap_or_default();
        self.checker.declare(
            name,
            Ty::new(TyKind::Function {
                params: ctor_params,
                ret: Box::new(Ty::new(TyKind::Named(name, Vec::new()))),
            }),
        );
        if export {
            self.builder().emit_u16(Opcode::Export, name_idx);
        }
        self.current_class = previous_class;
    }

    fn enum_declaration(&mut self, export: bool) {
        let name_token = self.consume(TokenKind::Identifier, "expected enum name");
        let name = self.intern_token(name_token);
        let name_idx = self.name_constant(name);
        self.consume(TokenKind::LeftBrace, "expected '{' before enum body");

        // Collect constructors first so the map capacity operand is exact.
        let mut ctors: Vec<(StringId, u8)> = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            let ctor_token = self.consume(TokenKind::Identifier, "expected enum constructor name");
            let ctor = self.intern_token(ctor_token);
            let mut arity: u8 = 0;
            if self.matches(TokenKind::LeftParen) {
                if !self.check(TokenKind::RightParen) {
                    loop {
                        self.consume(TokenKind::Identifier, "expected constructor field name");
                        arity = arity.saturating_add(1);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightParen, "expected ')' after constructor fields");
            }
            ctors.push((ctor, arity));
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after enum body");

        self.builder().set_token(name_token);
        let count = u16::try_from(ctors.len()).expect("enum constructor count exceeds u16");
        self.builder().emit_u16(Opcode::Map, count);
        for (ctor, arity) in ctors {
            let key_idx = self.name_constant(ctor);
            self.builder().emit_u16(Opcode::Constant, key_idx);
            self.builder().emit_u16(Opcode::EnumCtor, name_idx);
            self.builder().emit_operand_u16(key_idx);
            self.builder().emit_operand_u8(arity);
            self.emit(Opcode::MapSet);
        }
        self.builder().emit_u16(Opcode::DefineVar, name_idx);
        self.checker.declare(name, Ty::any());
        if export {
            self.builder().emit_u16(Opcode::Export, name_idx);
        }
    }

    fn interface_declaration(&mut self) {
        let name_token = self.consume(TokenKind::Identifier, "expected interface name");
        let name = self.intern_token(name_token);
        self.consume(TokenKind::LeftBrace, "expected '{' before interface body");
        let mut methods: Vec<(StringId, FuncSig)> = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            let method_token = self.consume(TokenKind::Identifier, "expected method name");
            let method = self.intern_token(method_token);
            self.consume(TokenKind::LeftParen, "expected '(' after method name");
            let mut params = Vec::new();
            if !self.check(TokenKind::RightParen) {
                loop {
                    self.consume(TokenKind::Identifier, "expected parameter name");
                    let ty = if self.matches(TokenKind::Colon) {
                        self.parse_type()
                    } else {
                        Ty::any()
                    };
                    params.push(ty);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::RightParen, "expected ')' after parameters");
            let ret = if self.matches(TokenKind::Colon) {
                self.parse_type()
            } else {
                Ty::any()
            };
            self.consume(TokenKind::Semicolon, "expected ';' after interface method");
            methods.push((method, FuncSig { params, ret }));
        }
        self.consume(TokenKind::RightBrace, "expected '}' after interface body");
        self.checker.registry.declare_interface(name, methods);
        // Interfaces have no runtime representation; nothing is emitted.
    }

    // ---- imports and exports -------------------------------------------

    /// Parses an import spec: a string literal or a bare identifier.
    /// Returns (constant index of the path, default binding name).
    fn import_spec(&mut self) -> (u16, StringId) {
        if self.matches(TokenKind::Str) {
            let token = self.previous();
            let raw = self.token_text(token);
            let spec = string_literal_content(raw);
            let binding = self.interns.intern(binding_name(&spec));
            let path_id = self.interns.intern(&spec);
            (self.name_constant(path_id), binding)
        } else {
            let token = self.consume(TokenKind::Identifier, "expected module path or name");
            let spec = self.intern_token(token);
            (self.name_constant(spec), spec)
        }
    }

    fn import_statement(&mut self) {
        let spec_token = self.peek();
        let (path_idx, default_binding) = self.import_spec();
        let binding = if self.matches(TokenKind::As) {
            let token = self.consume(TokenKind::Identifier, "expected binding name after 'as'");
            self.intern_token(token)
        } else {
            default_binding
        };
        self.consume(TokenKind::Semicolon, "expected ';' after import");
        self.builder().set_token(spec_token);
        self.builder().emit_u16(Opcode::Import, path_idx);
        let binding_idx = self.name_constant(binding);
        self.builder().emit_u16(Opcode::DefineVar, binding_idx);
        self.checker.declare(binding, Ty::any());
    }

    fn from_import_statement(&mut self) {
        let spec_token = self.peek();
        let (path_idx, _) = self.import_spec();
        self.consume(TokenKind::Import, "expected 'import' after module path");
        loop {
            let token = self.consume(TokenKind::Identifier, "expected imported name");
            let name = self.intern_token(token);
            let binding = if self.matches(TokenKind::As) {
                let alias = self.consume(TokenKind::Identifier, "expected binding name after 'as'");
                self.intern_token(alias)
            } else {
                name
            };
            self.builder().set_token(spec_token);
            self.builder().emit_u16(Opcode::ImportModule, path_idx);
            let name_idx = self.name_constant(name);
            self.builder().set_token(token);
            self.builder().emit_u16(Opcode::GetProperty, name_idx);
            let binding_idx = self.name_constant(binding);
            self.builder().emit_u16(Opcode::DefineVar, binding_idx);
            self.checker.declare(binding, Ty::any());
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::Semicolon, "expected ';' after import list");
    }

    fn export_declaration(&mut self) {
        match self.peek_kind() {
            TokenKind::Default => {
                self.advance();
                self.expression();
                self.consume(TokenKind::Semicolon, "expected ';' after export default");
                let default_idx = self.name_constant(StringId::DEFAULT);
                self.builder().emit_u16(Opcode::ExportValue, default_idx);
                self.checker.pop();
            }
            TokenKind::Let => {
                self.advance();
                self.var_declaration(false, true);
            }
            TokenKind::Const => {
                self.advance();
                self.var_declaration(true, true);
            }
            TokenKind::Fun => {
                self.advance();
                self.fun_declaration(true);
            }
            TokenKind::Class => {
                self.advance();
                self.class_declaration(true);
            }
            TokenKind::Enum => {
                self.advance();
                self.enum_declaration(true);
            }
            TokenKind::Interface => {
                self.advance();
                self.interface_declaration();
            }
            TokenKind::Star => {
                self.advance();
                self.consume(TokenKind::From, "expected 'from' after 'export *'");
                let spec_token = self.peek();
                let (path_idx, _) = self.import_spec();
                self.consume(TokenKind::Semicolon, "expected ';' after export");
                self.builder().set_token(spec_token);
                self.builder().emit_u16(Opcode::ImportModule, path_idx);
                // Pair count 0 re-exports every name.
                self.emit(Opcode::ExportFrom);
                self.builder().emit_operand_u8(0);
            }
            TokenKind::LeftBrace => {
                self.advance();
                let mut names: Vec<(StringId, StringId)> = Vec::new();
                loop {
                    let token = self.consume(TokenKind::Identifier, "expected export name");
                    let name = self.intern_token(token);
                    let alias = if self.matches(TokenKind::As) {
                        let alias = self.consume(TokenKind::Identifier, "expected name after 'as'");
                        self.intern_token(alias)
                    } else {
                        name
                    };
                    names.push((name, alias));
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
                self.consume(TokenKind::RightBrace, "expected '}' after export list");
                if self.matches(TokenKind::From) {
                    let spec_token = self.peek();
                    let (path_idx, _) = self.import_spec();
                    self.consume(TokenKind::Semicolon, "expected ';' after export");
                    self.builder().set_token(spec_token);
                    self.builder().emit_u16(Opcode::ImportModule, path_idx);
                    self.emit(Opcode::ExportFrom);
                    let count = u8::try_from(names.len()).expect("export list exceeds u8");
                    self.builder().emit_operand_u8(count);
                    for (name, alias) in names {
                        let from_idx = self.name_constant(name);
                        let to_idx = self.name_constant(alias);
                        self.builder().emit_operand_u16(from_idx);
                        self.builder().emit_operand_u16(to_idx);
                    }
                } else {
                    self.consume(TokenKind::Semicolon, "expected ';' after export");
                    for (name, alias) in names {
                        let name_idx = self.name_constant(name);
                        if name == alias {
                            self.builder().emit_u16(Opcode::Export, name_idx);
                        } else {
                            self.builder().emit_u16(Opcode::GetVar, name_idx);
                            let alias_idx = self.name_constant(alias);
                            self.builder().emit_u16(Opcode::ExportValue, alias_idx);
                        }
                    }
                }
            }
            _ => self.error_here("expected a declaration or export list after 'export'"),
        }
    }

    // ---- statements ----------------------------------------------------

    fn statement(&mut self) {
        match self.peek_kind() {
            TokenKind::If => {
                self.advance();
                self.if_statement();
            }
            TokenKind::While => {
                self.advance();
                self.while_statement();
            }
            TokenKind::For => {
                self.advance();
                self.for_statement();
            }
            TokenKind::Foreach => {
                self.advance();
                self.foreach_statement();
            }
            TokenKind::Switch | TokenKind::Match => {
                self.advance();
                self.switch_statement();
            }
            TokenKind::Return => {
                self.advance();
                self.return_statement();
            }
            TokenKind::Break => {
                self.advance();
                self.break_statement();
            }
            TokenKind::Continue => {
                self.advance();
                self.continue_statement();
            }
            TokenKind::LeftBrace => {
                self.advance();
                self.begin_scope();
                self.block();
                self.end_scope();
            }
            _ => self.expression_statement(),
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn expression_statement(&mut self) {
        self.expression();
        if self.repl_mode && self.states.len() == 1 && !self.check(TokenKind::Semicolon) && self.check(TokenKind::Eof) {
            // REPL: a trailing expression becomes the line's value.
            self.emit(Opcode::Return);
            self.checker.pop();
            return;
        }
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit(Opcode::Pop);
        self.checker.pop();
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        // `x != null` in the condition narrows x inside the then-branch.
        let narrowed = self.null_check_pattern();
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");
        self.checker.pop();

        let else_jump = self.builder().emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        if let Some(name) = narrowed {
            self.checker.begin_scope();
            self.checker.narrow_non_null(name);
            self.statement();
            self.checker.end_scope();
        } else {
            self.statement();
        }
        let end_jump = self.builder().emit_jump(Opcode::Jump);
        self.builder().patch_jump(else_jump);
        self.emit(Opcode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.builder().patch_jump(end_jump);
    }

    /// Detects `ident != null` at the cursor (the whole condition) and
    /// returns the identifier for narrowing.
    fn null_check_pattern(&mut self) -> Option<StringId> {
        if self.peek_kind() == TokenKind::Identifier
            && self.peek_ahead(1) == TokenKind::BangEqual
            && self.peek_ahead(2) == TokenKind::Null
            && self.peek_ahead(3) == TokenKind::RightParen
        {
            let token = self.peek();
            Some(self.intern_token(token))
        } else {
            None
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.builder().current_offset();
        let scope_depth = self.state().scope_depth;
        self.state().loops.push(LoopCtx {
            start: loop_start,
            scope_depth,
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_to_start: true,
        });

        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");
        self.checker.pop();

        let exit_jump = self.builder().emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement();
        // Safe point on the back edge.
        self.emit(Opcode::Gc);
        self.builder().emit_loop(loop_start);
        self.builder().patch_jump(exit_jump);
        self.emit(Opcode::Pop);

        let ctx = self.state().loops.pop().expect("loop context present");
        for label in ctx.breaks {
            self.builder().patch_jump(label);
        }
        debug_assert!(ctx.continues.is_empty(), "while continues jump backward");
    }

    fn for_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");
        self.begin_scope();

        // Initializer.
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Let) {
            self.var_declaration(false, false);
        } else if self.matches(TokenKind::Const) {
            self.var_declaration(true, false);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop initializer");
            self.emit(Opcode::Pop);
            self.checker.pop();
        }

        let loop_start = self.builder().current_offset();
        let scope_depth = self.state().scope_depth;
        self.state().loops.push(LoopCtx {
            start: loop_start,
            scope_depth,
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_to_start: false,
        });

        // Condition (empty means true).
        if self.check(TokenKind::Semicolon) {
            self.mark();
            self.emit(Opcode::True);
            self.checker.push(Ty::boolean());
        } else {
            self.expression();
        }
        self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
        self.checker.pop();
        let exit_jump = self.builder().emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);

        // The increment clause appears before the body in source but runs
        // after it; skip it now and replay its tokens later.
        let increment_start = self.pos;
        self.skip_for_increment();
        let increment_end = self.pos;
        self.consume(TokenKind::RightParen, "expected ')' after for clauses");

        self.statement();

        // `continue` lands here, before the increment.
        let continues = std::mem::take(
            &mut self
                .state()
                .loops
                .last_mut()
                .expect("loop context present")
                .continues,
        );
        for label in continues {
            self.builder().patch_jump(label);
        }

        if increment_end > increment_start {
            let resume = self.pos;
            self.pos = increment_start;
            self.expression();
            self.pos = resume;
            self.emit(Opcode::Pop);
            self.checker.pop();
        }

        self.emit(Opcode::Gc);
        self.builder().emit_loop(loop_start);
        self.builder().patch_jump(exit_jump);
        self.emit(Opcode::Pop);

        let ctx = self.state().loops.pop().expect("loop context present");
        for label in ctx.breaks {
            self.builder().patch_jump(label);
        }
        self.end_scope();
    }

    /// Skips the (possibly empty) increment clause up to the closing `)`.
    fn skip_for_increment(&mut self) {
        let mut depth = 0u32;
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace | TokenKind::InterpStart => {
                    depth += 1;
                }
                TokenKind::RightParen if depth == 0 => return,
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace | TokenKind::InterpEnd => {
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            }
            self.advance();
        }
    }

    /// `foreach (x in iter)` / `foreach (k, v in iter)`.
    ///
    /// Lowers to an integer-index loop over a normalized sequence: arrays
    /// iterate themselves, maps iterate their key array (via the hidden
    /// `#items` / `#keys` natives, which share the public `keys()` logic).
    fn foreach_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'foreach'");
        let first_token = self.consume(TokenKind::Identifier, "expected loop variable");
        let first = self.intern_token(first_token);
        let second = if self.matches(TokenKind::Comma) {
            let token = self.consume(TokenKind::Identifier, "expected second loop variable");
            Some(self.intern_token(token))
        } else {
            None
        };
        self.consume(TokenKind::In, "expected 'in' in foreach");

        self.begin_scope();

        // Hidden locals; `#` cannot appear in user identifiers.
        let seq = self.interns.intern("#seq");
        let items = self.interns.intern("#it");
        let index = self.interns.intern("#i");

        // #seq = <iterable>
        self.expression();
        self.checker.pop();
        let seq_idx = self.name_constant(seq);
        self.builder().emit_u16(Opcode::DefineVar, seq_idx);
        self.consume(TokenKind::RightParen, "expected ')' after foreach iterable");

        // #it = items-or-keys(#seq)
        let normalizer = if second.is_some() { "#keys" } else { "#items" };
        let normalizer = self.interns.intern(normalizer);
        let normalizer_idx = self.name_constant(normalizer);
        self.builder().emit_u16(Opcode::GetVar, normalizer_idx);
        self.builder().emit_u16(Opcode::GetVar, seq_idx);
        self.builder().emit_u8(Opcode::Call, 1);
        let items_idx = self.name_constant(items);
        self.builder().emit_u16(Opcode::DefineVar, items_idx);

        // #i = 0
        let zero = self.builder().add_constant(Value::Num(0.0));
        self.builder().emit_u16(Opcode::Constant, zero);
        let index_idx = self.name_constant(index);
        self.builder().emit_u16(Opcode::DefineVar, index_idx);

        // Loop variables live in the scope, assigned each iteration.
        self.emit(Opcode::Null);
        let first_idx = self.name_constant(first);
        self.builder().emit_u16(Opcode::DefineVar, first_idx);
        self.checker.declare(first, Ty::any());
        let second_idx = second.map(|name| {
            self.emit(Opcode::Null);
            let idx = self.name_constant(name);
            self.builder().emit_u16(Opcode::DefineVar, idx);
            self.checker.declare(name, Ty::any());
            idx
        });

        let loop_start = self.builder().current_offset();
        let scope_depth = self.state().scope_depth;
        self.state().loops.push(LoopCtx {
            start: loop_start,
            scope_depth,
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_to_start: false,
        });

        // while (#i < #len(#it))
        let len_native = self.interns.intern("#len");
        let len_idx = self.name_constant(len_native);
        self.builder().emit_u16(Opcode::GetVar, index_idx);
        self.builder().emit_u16(Opcode::GetVar, len_idx);
        self.builder().emit_u16(Opcode::GetVar, items_idx);
        self.builder().emit_u8(Opcode::Call, 1);
        self.emit(Opcode::Less);
        let exit_jump = self.builder().emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);

        // first = #it[#i]  (element for arrays, key for maps)
        self.builder().emit_u16(Opcode::GetVar, items_idx);
        self.builder().emit_u16(Opcode::GetVar, index_idx);
        self.emit(Opcode::GetIndex);
        self.builder().emit_u16(Opcode::SetVar, first_idx);
        self.emit(Opcode::Pop);

        // second = #seq[first]
        if let Some(second_idx) = second_idx {
            self.builder().emit_u16(Opcode::GetVar, seq_idx);
            self.builder().emit_u16(Opcode::GetVar, first_idx);
            self.emit(Opcode::GetIndex);
            self.builder().emit_u16(Opcode::SetVar, second_idx);
            self.emit(Opcode::Pop);
        }

        self.statement();

        // `continue` lands on the index increment.
        let continues = std::mem::take(
            &mut self
                .state()
                .loops
                .last_mut()
                .expect("loop context present")
                .continues,
        );
        for label in continues {
            self.builder().patch_jump(label);
        }

        // #i = #i + 1
        self.builder().emit_u16(Opcode::GetVar, index_idx);
        let one = self.builder().add_constant(Value::Num(1.0));
        self.builder().emit_u16(Opcode::Constant, one);
        self.emit(Opcode::Add);
        self.builder().emit_u16(Opcode::SetVar, index_idx);
        self.emit(Opcode::Pop);

        self.emit(Opcode::Gc);
        self.builder().emit_loop(loop_start);
        self.builder().patch_jump(exit_jump);
        self.emit(Opcode::Pop);

        let ctx = self.state().loops.pop().expect("loop context present");
        for label in ctx.breaks {
            self.builder().patch_jump(label);
        }
        self.end_scope();
    }

    /// `switch` / `match`: linear `EQUAL` + `JUMP_IF_FALSE` ladder against a
    /// cached temporary; `default` has no equality test.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'switch'");
        self.begin_scope();
        // Cache the scrutinee once.
        let scrutinee = self.interns.intern("#sw");
        self.expression();
        self.checker.pop();
        let scrutinee_idx = self.name_constant(scrutinee);
        self.builder().emit_u16(Opcode::DefineVar, scrutinee_idx);
        self.consume(TokenKind::RightParen, "expected ')' after switch value");
        self.consume(TokenKind::LeftBrace, "expected '{' before switch cases");

        let mut end_jumps: Vec<JumpLabel> = Vec::new();
        let mut seen_default = false;
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Case) {
                self.builder().emit_u16(Opcode::GetVar, scrutinee_idx);
                self.checker.push(Ty::any());
                self.expression();
                self.consume(TokenKind::Colon, "expected ':' after case value");
                self.emit(Opcode::Equal);
                self.checker.pop();
                self.checker.pop();
                let miss = self.builder().emit_jump(Opcode::JumpIfFalse);
                self.emit(Opcode::Pop);
                while !matches!(
                    self.peek_kind(),
                    TokenKind::Case | TokenKind::Default | TokenKind::RightBrace | TokenKind::Eof
                ) {
                    self.declaration();
                    if self.panic_mode {
                        self.synchronize();
                    }
                }
                end_jumps.push(self.builder().emit_jump(Opcode::Jump));
                self.builder().patch_jump(miss);
                self.emit(Opcode::Pop);
            } else if self.matches(TokenKind::Default) {
                self.consume(TokenKind::Colon, "expected ':' after 'default'");
                if seen_default {
                    let token = self.previous();
                    self.error_at(token, "duplicate default case");
                }
                seen_default = true;
                while !matches!(
                    self.peek_kind(),
                    TokenKind::Case | TokenKind::Default | TokenKind::RightBrace | TokenKind::Eof
                ) {
                    self.declaration();
                    if self.panic_mode {
                        self.synchronize();
                    }
                }
                end_jumps.push(self.builder().emit_jump(Opcode::Jump));
            } else {
                self.error_here("expected 'case' or 'default' in switch body");
                self.synchronize();
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after switch cases");
        for label in end_jumps {
            self.builder().patch_jump(label);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        let keyword = self.previous();
        if self.matches(TokenKind::Semicolon) {
            self.builder().set_token(keyword);
            self.emit_implicit_return();
            return;
        }
        if self.state().kind == FuncKind::Initializer {
            self.error_at(keyword, "cannot return a value from an initializer");
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after return value");
        let value_ty = self.checker.pop();
        if let Some(expected) = self.state().return_type.clone() {
            if !self.checker.assignable(&value_ty, &expected) {
                let message = format!(
                    "cannot return {} from a function declared to return {}",
                    value_ty.describe(self.interns),
                    expected.describe(self.interns)
                );
                self.checker.type_error(keyword, message);
            }
        }
        self.builder().set_token(keyword);
        self.emit(Opcode::Return);
    }

    fn break_statement(&mut self) {
        let keyword = self.previous();
        self.consume(TokenKind::Semicolon, "expected ';' after 'break'");
        let Some(depth) = self.state().loops.last().map(|l| l.scope_depth) else {
            self.error_at(keyword, "'break' outside of a loop");
            return;
        };
        let current = self.state().scope_depth;
        self.builder().set_token(keyword);
        for _ in depth..current {
            self.emit(Opcode::EndScope);
        }
        let label = self.builder().emit_jump(Opcode::Jump);
        self.state()
            .loops
            .last_mut()
            .expect("loop context present")
            .breaks
            .push(label);
    }

    fn continue_statement(&mut self) {
        let keyword = self.previous();
        self.consume(TokenKind::Semicolon, "expected ';' after 'continue'");
        let Some(ctx) = self.state().loops.last() else {
            self.error_at(keyword, "'continue' outside of a loop");
            return;
        };
        let (depth, to_start, start) = (ctx.scope_depth, ctx.continue_to_start, ctx.start);
        let current = self.state().scope_depth;
        self.builder().set_token(keyword);
        for _ in depth..current {
            self.emit(Opcode::EndScope);
        }
        if to_start {
            self.builder().emit_loop(start);
        } else {
            let label = self.builder().emit_jump(Opcode::Jump);
            self.state()
                .loops
                .last_mut()
                .expect("loop context present")
                .continues
                .push(label);
        }
    }

    // ---- expressions ---------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Prec::Assignment);
    }

    fn parse_precedence(&mut self, prec: Prec) {
        let saved_chain = std::mem::replace(&mut self.optional_chain, false);
        self.advance();
        let can_assign = prec <= Prec::Assignment;
        if !self.prefix(can_assign) {
            let token = self.previous();
            self.error_at(token, "expected expression");
            self.optional_chain = saved_chain;
            return;
        }
        while prec <= self.infix_precedence(self.peek_kind()) {
            self.advance();
            self.infix(can_assign);
        }
        if can_assign && self.check(TokenKind::Equal) {
            let token = self.peek();
            self.error_at(token, "invalid assignment target");
            self.advance();
        }
        self.optional_chain = saved_chain;
    }

    fn infix_precedence(&self, kind: TokenKind) -> Prec {
        match kind {
            TokenKind::Or => Prec::Or,
            TokenKind::And => Prec::And,
            TokenKind::EqualEqual | TokenKind::BangEqual => Prec::Equality,
            TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual => Prec::Comparison,
            TokenKind::Plus | TokenKind::Minus => Prec::Term,
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Prec::Factor,
            TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::Dot | TokenKind::QuestionDot => Prec::Call,
            _ => Prec::None,
        }
    }

    /// Dispatches the prefix rule for the just-consumed token. Returns false
    /// when the token cannot start an expression.
    fn prefix(&mut self, can_assign: bool) -> bool {
        match self.previous().kind {
            TokenKind::Number => self.number(),
            TokenKind::Str => self.plain_string(),
            TokenKind::StrSegment => self.interpolated_string(),
            TokenKind::True => {
                self.mark();
                self.emit(Opcode::True);
                self.checker.push(Ty::boolean());
            }
            TokenKind::False => {
                self.mark();
                self.emit(Opcode::False);
                self.checker.push(Ty::boolean());
            }
            TokenKind::Null => {
                self.mark();
                self.emit(Opcode::Null);
                self.checker.push(Ty::null());
            }
            TokenKind::LeftParen => {
                self.expression();
                self.consume(TokenKind::RightParen, "expected ')' after expression");
            }
            TokenKind::LeftBracket => self.array_literal(),
            TokenKind::LeftBrace => self.map_literal(),
            TokenKind::Minus => {
                let token = self.previous();
                self.parse_precedence(Prec::Unary);
                self.builder().set_token(token);
                self.emit(Opcode::Negate);
                self.checker.check_negate(token, self.interns);
            }
            TokenKind::Bang => {
                self.parse_precedence(Prec::Unary);
                self.emit(Opcode::Not);
                self.checker.check_not();
            }
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expression(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, can_assign: bool) {
        match self.previous().kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(),
            TokenKind::And => self.logical_and(),
            TokenKind::Or => self.logical_or(),
            TokenKind::LeftParen => self.call_arguments(self.optional_chain),
            TokenKind::LeftBracket => self.index(can_assign),
            TokenKind::Dot => self.dot(can_assign, self.optional_chain),
            TokenKind::QuestionDot => self.question_dot(can_assign),
            _ => unreachable!("infix dispatch on non-infix token"),
        }
    }

    fn number(&mut self) {
        let token = self.previous();
        let value: f64 = self
            .token_text(token)
            .parse()
            .expect("lexer produced an unparseable number");
        self.builder().set_token(token);
        self.builder().emit_constant(Value::Num(value));
        self.checker.push(Ty::number());
    }

    fn plain_string(&mut self) {
        let token = self.previous();
        let content = string_literal_content(self.token_text(token));
        let id = self.interns.intern(&content);
        self.builder().set_token(token);
        self.builder().emit_constant(Value::Str(id));
        self.checker.push(Ty::string());
    }

    /// Compiles a `StrSegment (InterpStart expr InterpEnd StrSegment)*`
    /// run into constant pushes and runtime concatenation.
    fn interpolated_string(&mut self) {
        let first = self.previous();
        let first_text = self.token_text(first);
        let triple = first_text.starts_with("\"\"\"");
        let content = segment_content(first_text, triple, true, false);
        let id = self.interns.intern(&content);
        self.builder().set_token(first);
        self.builder().emit_constant(Value::Str(id));
        self.checker.push(Ty::string());

        while self.matches(TokenKind::InterpStart) {
            self.expression();
            self.consume(TokenKind::InterpEnd, "expected '}' after interpolation");
            self.emit(Opcode::Stringify);
            self.checker.check_stringify();
            self.emit(Opcode::Add);
            self.checker.check_binary(BinaryTy::Add, self.previous(), self.interns);

            let segment = self.consume(TokenKind::StrSegment, "unterminated interpolated string");
            let text = self.token_text(segment).to_owned();
            let last = !self.check(TokenKind::InterpStart);
            let content = segment_content(&text, triple, false, last);
            if !content.is_empty() {
                let id = self.interns.intern(&content);
                self.builder().set_token(segment);
                self.builder().emit_constant(Value::Str(id));
                self.checker.push(Ty::string());
                self.emit(Opcode::Add);
                self.checker.check_binary(BinaryTy::Add, segment, self.interns);
            }
        }
    }

    fn array_literal(&mut self) {
        let token = self.previous();
        // Count elements by pre-scanning so the capacity operand is exact.
        let count = self.count_list_elements(TokenKind::RightBracket);
        self.builder().set_token(token);
        self.builder().emit_u16(Opcode::Array, count);
        self.checker.push(Ty::new(TyKind::Array(Box::new(Ty::any()))));
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                self.emit(Opcode::ArrayAppend);
                self.checker.pop();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "expected ']' after array elements");
    }

    fn map_literal(&mut self) {
        let token = self.previous();
        let count = self.count_list_elements(TokenKind::RightBrace);
        self.builder().set_token(token);
        self.builder().emit_u16(Opcode::Map, count);
        self.checker
            .push(Ty::new(TyKind::Map(Box::new(Ty::string()), Box::new(Ty::any()))));
        if !self.check(TokenKind::RightBrace) {
            loop {
                let key = if self.matches(TokenKind::Str) {
                    let token = self.previous();
                    string_literal_content(self.token_text(token))
                } else {
                    let token = self.consume(TokenKind::Identifier, "expected map key");
                    self.token_text(token).to_owned()
                };
                let key_id = self.interns.intern(&key);
                let key_idx = self.builder().add_constant(Value::Str(key_id));
                self.builder().emit_u16(Opcode::Constant, key_idx);
                self.consume(TokenKind::Colon, "expected ':' after map key");
                self.expression();
                self.emit(Opcode::MapSet);
                self.checker.pop();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after map entries");
    }

    /// Counts top-level comma-separated elements ahead of the cursor, up to
    /// the closing delimiter.
    fn count_list_elements(&self, closing: TokenKind) -> u16 {
        let mut cursor = self.pos;
        let mut depth = 0u32;
        let mut count: u16 = 0;
        let mut any = false;
        loop {
            let kind = self.tokens.get(cursor).map_or(TokenKind::Eof, |t| t.kind);
            if kind == TokenKind::Eof {
                break;
            }
            if depth == 0 && kind == closing {
                break;
            }
            match kind {
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace | TokenKind::InterpStart => {
                    depth += 1;
                }
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace | TokenKind::InterpEnd => {
                    depth = depth.saturating_sub(1);
                }
                TokenKind::Comma if depth == 0 => count = count.saturating_add(1),
                _ => {}
            }
            any = true;
            cursor += 1;
        }
        if any { count.saturating_add(1) } else { 0 }
    }

    fn variable(&mut self, can_assign: bool) {
        let token = self.previous();
        let name = self.intern_token(token);
        let name_idx = self.name_constant(name);
        self.builder().set_token(token);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.builder().set_token(token);
            self.builder().emit_u16(Opcode::SetVar, name_idx);
            self.checker.check_assignment(name, token, self.interns);
        } else {
            self.builder().emit_u16(Opcode::GetVar, name_idx);
            self.checker.check_var(name);
        }
    }

    fn this_expression(&mut self) {
        let token = self.previous();
        if self.current_class.is_none() {
            self.error_at(token, "'this' outside of a class method");
        }
        let this_idx = self.name_constant(StringId::THIS);
        self.builder().set_token(token);
        self.builder().emit_u16(Opcode::GetVar, this_idx);
        let ty = self
            .current_class
            .map(|class| Ty::new(TyKind::Named(class, Vec::new())))
            .unwrap_or_else(Ty::any);
        self.checker.push(ty);
    }

    fn binary(&mut self) {
        let operator = self.previous();
        let prec = self.infix_precedence(operator.kind);
        self.parse_precedence(prec.next());
        self.builder().set_token(operator);
        match operator.kind {
            TokenKind::Plus => {
                self.emit(Opcode::Add);
                self.checker.check_binary(BinaryTy::Add, operator, self.interns);
            }
            TokenKind::Minus => {
                self.emit(Opcode::Subtract);
                self.checker.check_binary(BinaryTy::Arithmetic, operator, self.interns);
            }
            TokenKind::Star => {
                self.emit(Opcode::Multiply);
                self.checker.check_binary(BinaryTy::Arithmetic, operator, self.interns);
            }
            TokenKind::Slash => {
                self.emit(Opcode::Divide);
                self.checker.check_binary(BinaryTy::Arithmetic, operator, self.interns);
            }
            TokenKind::Percent => {
                self.emit(Opcode::Modulo);
                self.checker.check_binary(BinaryTy::Arithmetic, operator, self.interns);
            }
            TokenKind::EqualEqual => {
                self.emit(Opcode::Equal);
                self.checker.check_binary(BinaryTy::Equality, operator, self.interns);
            }
            TokenKind::BangEqual => {
                self.emit(Opcode::Equal);
                self.emit(Opcode::Not);
                self.checker.check_binary(BinaryTy::Equality, operator, self.interns);
            }
            TokenKind::Greater => {
                self.emit(Opcode::Greater);
                self.checker.check_binary(BinaryTy::Comparison, operator, self.interns);
            }
            TokenKind::GreaterEqual => {
                self.emit(Opcode::GreaterEqual);
                self.checker.check_binary(BinaryTy::Comparison, operator, self.interns);
            }
            TokenKind::Less => {
                self.emit(Opcode::Less);
                self.checker.check_binary(BinaryTy::Comparison, operator, self.interns);
            }
            TokenKind::LessEqual => {
                self.emit(Opcode::LessEqual);
                self.checker.check_binary(BinaryTy::Comparison, operator, self.interns);
            }
            _ => unreachable!("binary dispatch on non-binary token"),
        }
    }

    fn logical_and(&mut self) {
        let short = self.builder().emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.parse_precedence(Prec::And.next());
        self.builder().patch_jump(short);
        self.checker.check_logical();
    }

    fn logical_or(&mut self) {
        let rhs = self.builder().emit_jump(Opcode::JumpIfFalse);
        let short = self.builder().emit_jump(Opcode::Jump);
        self.builder().patch_jump(rhs);
        self.emit(Opcode::Pop);
        self.parse_precedence(Prec::Or.next());
        self.builder().patch_jump(short);
        self.checker.check_logical();
    }

    /// Parses `(args)` and emits the call. The callee is already on the
    /// stack; `optional` selects `CALL_OPTIONAL`.
    fn call_arguments(&mut self, optional: bool) {
        let paren = self.previous();
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == u8::MAX {
                    self.error_here("too many call arguments");
                }
                argc = argc.saturating_add(1);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        self.builder().set_token(paren);
        let op = if optional { Opcode::CallOptional } else { Opcode::Call };
        self.builder().emit_u8(op, argc);
        self.checker.check_call(argc, optional, paren, self.interns);
    }

    fn index(&mut self, can_assign: bool) {
        let bracket = self.previous();
        let optional = self.optional_chain;
        self.expression();
        self.consume(TokenKind::RightBracket, "expected ']' after index");
        self.builder().set_token(bracket);
        if can_assign && !optional && self.matches(TokenKind::Equal) {
            self.expression();
            let value_ty = self.checker.pop();
            self.emit(Opcode::SetIndex);
            self.checker.check_index(false);
            self.checker.pop();
            self.checker.push(value_ty);
        } else {
            let op = if optional { Opcode::GetIndexOptional } else { Opcode::GetIndex };
            self.emit(op);
            self.checker.check_index(optional);
        }
    }

    fn dot(&mut self, can_assign: bool, optional: bool) {
        // `default` is a keyword but also the default-export binding name.
        let name_token = if self.check(TokenKind::Identifier) || self.check(TokenKind::Default) {
            self.advance()
        } else {
            self.error_here("expected property name after '.'");
            self.peek()
        };
        let name = self.intern_token(name_token);
        let name_idx = self.name_constant(name);
        self.builder().set_token(name_token);
        if can_assign && !optional && self.matches(TokenKind::Equal) {
            self.checker.check_property(name, false, name_token, self.interns);
            self.checker.pop();
            self.expression();
            self.builder().set_token(name_token);
            self.builder().emit_u16(Opcode::SetProperty, name_idx);
        } else if self.matches(TokenKind::LeftParen) && !optional {
            // Fused method-call fast path.
            self.checker.check_property(name, false, name_token, self.interns);
            let paren = self.previous();
            let mut argc: u8 = 0;
            if !self.check(TokenKind::RightParen) {
                loop {
                    self.expression();
                    argc = argc.saturating_add(1);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::RightParen, "expected ')' after arguments");
            self.builder().set_token(name_token);
            self.builder().emit_u16(Opcode::Invoke, name_idx);
            self.builder().emit_operand_u8(argc);
            self.checker.check_call(argc, false, paren, self.interns);
        } else {
            let op = if optional {
                Opcode::GetPropertyOptional
            } else {
                Opcode::GetProperty
            };
            self.builder().emit_u16(op, name_idx);
            self.checker.check_property(name, optional, name_token, self.interns);
        }
    }

    /// `?.name`, `?.[index]`, or `?.(args)`. Marks the rest of the postfix
    /// chain optional so null propagates instead of erroring.
    fn question_dot(&mut self, can_assign: bool) {
        self.optional_chain = true;
        if self.matches(TokenKind::LeftBracket) {
            self.index(false);
        } else if self.matches(TokenKind::LeftParen) {
            self.call_arguments(true);
        } else {
            self.dot(can_assign, true);
        }
    }

    // ---- type annotations ----------------------------------------------

    /// Parses a type annotation into a checker type.
    fn parse_type(&mut self) -> Ty {
        let base = if self.matches(TokenKind::Null) {
            Ty::null()
        } else if self.matches(TokenKind::Fun) {
            self.consume(TokenKind::LeftParen, "expected '(' in function type");
            let mut params = Vec::new();
            if !self.check(TokenKind::RightParen) {
                loop {
                    params.push(self.parse_type());
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::RightParen, "expected ')' in function type");
            self.consume(TokenKind::Arrow, "expected '->' in function type");
            let ret = self.parse_type();
            Ty::new(TyKind::Function {
                params,
                ret: Box::new(ret),
            })
        } else {
            let token = self.consume(TokenKind::Identifier, "expected type name");
            let text = self.token_text(token).to_owned();
            match text.as_str() {
                "any" => Ty::any(),
                "unknown" => Ty::new(TyKind::Unknown),
                "number" => Ty::number(),
                "string" => Ty::string(),
                "bool" => Ty::boolean(),
                "array" => {
                    self.consume(TokenKind::Less, "expected '<' after 'array'");
                    let item = self.parse_type();
                    self.consume(TokenKind::Greater, "expected '>' after array element type");
                    Ty::new(TyKind::Array(Box::new(item)))
                }
                "map" => {
                    self.consume(TokenKind::Less, "expected '<' after 'map'");
                    let key = self.parse_type();
                    self.consume(TokenKind::Comma, "expected ',' between map type arguments");
                    let value = self.parse_type();
                    self.consume(TokenKind::Greater, "expected '>' after map value type");
                    Ty::new(TyKind::Map(Box::new(key), Box::new(value)))
                }
                _ => {
                    let name = self.interns.intern(&text);
                    if self.type_params.contains(&name) {
                        Ty::new(TyKind::Generic(name))
                    } else {
                        let mut args = Vec::new();
                        if self.matches(TokenKind::Less) {
                            loop {
                                args.push(self.parse_type());
                                if !self.matches(TokenKind::Comma) {
                                    break;
                                }
                            }
                            self.consume(TokenKind::Greater, "expected '>' after type arguments");
                        }
                        Ty::new(TyKind::Named(name, args))
                    }
                }
            }
        };
        if self.matches(TokenKind::Question) {
            base.nullable()
        } else {
            base
        }
    }
}

/// Strips quotes from a plain string literal and decodes escapes.
fn string_literal_content(raw: &str) -> String {
    let inner = if let Some(stripped) = raw.strip_prefix("\"\"\"") {
        stripped.strip_suffix("\"\"\"").unwrap_or(stripped)
    } else {
        let stripped = raw.strip_prefix('"').unwrap_or(raw);
        stripped.strip_suffix('"').unwrap_or(stripped)
    };
    unescape(inner)
}

/// Strips the delimiters a segment carries by position and decodes escapes.
fn segment_content(raw: &str, triple: bool, first: bool, last: bool) -> String {
    let quote = if triple { "\"\"\"" } else { "\"" };
    let mut inner = raw;
    if first {
        inner = inner.strip_prefix(quote).unwrap_or(inner);
    }
    if last {
        inner = inner.strip_suffix(quote).unwrap_or(inner);
    }
    unescape(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, typecheck::TypeChecker};

    fn try_compile(source: &str) -> Result<(), Vec<Diagnostic>> {
        let program = Rc::new(Program::new(source.to_owned(), "test.ql".to_owned()));
        let mut interns = Interner::new();
        let mut funcs = FunctionTable::new();
        let mut checker = TypeChecker::new();
        compile(&program, &mut interns, &mut funcs, &mut checker, false).map(|_| ())
    }

    #[test]
    fn compiles_straight_line_code() {
        try_compile("let x = 1 + 2;\nprint(x);\n").unwrap();
    }

    #[test]
    fn panic_mode_recovers_and_collects_multiple_errors() {
        let diagnostics = try_compile("let = 1;\nlet y = 2;\nfun () {}\n").unwrap_err();
        assert!(diagnostics.len() >= 2, "expected both errors, got {diagnostics:?}");
        assert!(diagnostics.iter().all(|d| d.kind == ErrorKind::Parse));
    }

    #[test]
    fn invalid_assignment_target_is_rejected() {
        let diagnostics = try_compile("1 + 2 = 3;").unwrap_err();
        assert!(
            diagnostics.iter().any(|d| d.message.contains("invalid assignment target")),
            "unexpected diagnostics: {diagnostics:?}"
        );
    }

    #[test]
    fn defaults_must_trail() {
        let diagnostics = try_compile("fun f(a = 1, b) { return b; }").unwrap_err();
        assert!(
            diagnostics
                .iter()
                .any(|d| d.message.contains("parameters without defaults")),
            "unexpected diagnostics: {diagnostics:?}"
        );
    }

    #[test]
    fn type_errors_do_not_fail_compilation() {
        let program = Rc::new(Program::new(
            "let n: number = \"hello\";\nprint(n);\n".to_owned(),
            "test.ql".to_owned(),
        ));
        let mut interns = Interner::new();
        let mut funcs = FunctionTable::new();
        let mut checker = TypeChecker::new();
        compile(&program, &mut interns, &mut funcs, &mut checker, false).unwrap();
        assert_eq!(checker.error_count(), 1);
    }

    #[test]
    fn functions_record_arity_and_minimum_arity() {
        let program = Rc::new(Program::new(
            "fun f(a, b = 2, c = 3) { return a + b + c; }".to_owned(),
            "test.ql".to_owned(),
        ));
        let mut interns = Interner::new();
        let mut funcs = FunctionTable::new();
        let mut checker = TypeChecker::new();
        compile(&program, &mut interns, &mut funcs, &mut checker, false).unwrap();
        let f = funcs
            .iter()
            .map(|(_, f)| f)
            .find(|f| interns.get(f.name) == "f")
            .expect("f compiled");
        assert_eq!(f.arity, 3);
        assert_eq!(f.min_arity, 1);
    }

    #[test]
    fn chunks_have_valid_jump_targets_after_optimization() {
        let program = Rc::new(Program::new(
            "let i = 0;\nwhile (i < 10) { if (i % 2 == 0) { i = i + 1; } else { i = i + 3; } }\n".to_owned(),
            "test.ql".to_owned(),
        ));
        let mut interns = Interner::new();
        let mut funcs = FunctionTable::new();
        let mut checker = TypeChecker::new();
        let top = compile(&program, &mut interns, &mut funcs, &mut checker, false).unwrap();
        funcs.get(top).chunk.verify_jump_targets().unwrap();
    }
}
