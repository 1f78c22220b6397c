//! Single-pass compiler.
//!
//! Tokens go straight to bytecode: a Pratt rule table maps each token kind
//! to prefix/infix parsers and a precedence, and every parser emits into the
//! chunk of the function currently being built. Function compilations nest
//! as a stack of [`CompilerState`]s (the innermost is `self.state()`), and
//! enclosing class bodies as a stack of [`ClassState`]s.
//!
//! Three constructs backtrack instead of looking ahead: comprehensions and
//! ternaries re-parse their head expression after discovering what follows
//! (rewinding both the scanner and the emitted bytecode), and the
//! `else`/`elif`/`except` search after a dedent pushes one token back when
//! it finds an unrelated statement.
//!
//! Errors record the first diagnostic, then `synchronize` skips to the next
//! statement boundary so scanning stays sane; the recorded diagnostic is
//! what the embedder sees.

mod expr;
mod stmt;

use crate::heap::{HeapData, HeapId};
use crate::objects::{FunctionObj, LocalEntry};
use crate::chunk::{Chunk, OpCode};
use crate::scanner::{Scanner, ScannerState, Token, TokenKind};
use crate::value::Value;
use crate::vm::Vm;
use crate::KurokoError;

/// Compiles a module body into a function object.
pub(crate) fn compile(vm: &mut Vm, source: &str, filename: &str) -> Result<HeapId, KurokoError> {
    let filename_id = vm.heap.intern(filename);
    let mut compiler = Compiler::new(vm, source, filename_id);
    compiler.push_state(FunctionType::Module, None);

    compiler.advance();
    // A leading string literal is the module docstring.
    if compiler.match_token(TokenKind::String) || compiler.match_token(TokenKind::BigString) {
        compiler.string_expr(false);
        if let Some(&doc) = compiler.chunk().constants.last() {
            let module = compiler.vm.thread.module;
            compiler.vm.set_field(module, "__doc__", doc);
        }
        compiler.emit_op(OpCode::Pop);
        compiler.consume(TokenKind::Eol, "Garbage after docstring");
    }

    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
        if compiler.check(TokenKind::Eol)
            || compiler.check(TokenKind::Indentation)
            || compiler.check(TokenKind::Eof)
        {
            compiler.advance();
        }
    }

    let (function, _) = compiler.end_state();
    match compiler.error.take() {
        Some(diagnostic) => Err(KurokoError::Compile {
            message: diagnostic.message,
            line: diagnostic.line,
            col: diagnostic.col,
            file: filename.to_string(),
        }),
        None => Ok(function),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Diagnostic {
    pub message: String,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Parser {
    pub current: Token,
    pub previous: Token,
    pub had_error: bool,
    pub panic_mode: bool,
    pub eating_whitespace: u32,
}

/// How a local's name is stored: a source span, or a compiler-invented name.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LocalName {
    Source { start: usize, length: usize },
    Synthetic(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Local {
    pub name: LocalName,
    /// `-1` while declared but not yet initialized.
    pub depth: isize,
    pub is_captured: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UpvalueRef {
    pub index: usize,
    pub is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionType {
    Function,
    Module,
    Method,
    Init,
    Lambda,
    Static,
    Property,
}

impl FunctionType {
    fn is_method(self) -> bool {
        matches!(
            self,
            FunctionType::Method | FunctionType::Init | FunctionType::Property
        )
    }
}

/// One function being compiled.
#[derive(Debug)]
pub(crate) struct CompilerState {
    pub function: FunctionObj,
    pub ftype: FunctionType,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueRef>,
    pub scope_depth: usize,
    /// Number of required (then keyword) parameters seen so far.
    pub required_args: usize,
    pub keyword_args: usize,
    /// Locals below this index belong to enclosing loops; `break` and
    /// `continue` pop everything above it.
    pub loop_local_count: usize,
    pub breaks: Vec<usize>,
    pub continues: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ClassState {
    pub name: Token,
}

pub(crate) struct Compiler<'vm, 'src> {
    pub vm: &'vm mut Vm,
    pub scanner: Scanner<'src>,
    pub parser: Parser,
    pub states: Vec<CompilerState>,
    pub classes: Vec<ClassState>,
    /// 0 outside `del`, 1 while parsing a target, 2 once a deletion emitted.
    pub in_del: u8,
    pub error: Option<Diagnostic>,
    pub filename: HeapId,
}

// ---------------------------------------------------------------------
// Precedence and rules
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::FromRepr)]
#[repr(u8)]
pub(crate) enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Term,
    Factor,
    Unary,
    Exponent,
    Call,
    Primary,
}

impl Precedence {
    pub fn one_higher(self) -> Precedence {
        Precedence::from_repr(self as u8 + 1).unwrap_or(Precedence::Primary)
    }
}

pub(crate) type ParseFn = fn(&mut Compiler<'_, '_>, bool);

#[derive(Clone, Copy)]
pub(crate) struct ParseRule {
    pub prefix: Option<ParseFn>,
    pub infix: Option<ParseFn>,
    pub precedence: Precedence,
}

fn rule(
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
) -> ParseRule {
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

// Free-function wrappers: these methods' fn-item types don't coerce to
// `ParseFn` directly (their impl-block lifetimes aren't independently
// higher-ranked), so route through a standalone fn with the exact ParseFn
// signature.
fn literal_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.literal(can_assign)
}
fn self_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.self_(can_assign)
}
fn super_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.super_(can_assign)
}
fn lambda_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.lambda(can_assign)
}
fn yield_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.yield_(can_assign)
}
fn and_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.and_(can_assign)
}
fn binary_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.binary(can_assign)
}
fn call_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.call(can_assign)
}
fn dict_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.dict(can_assign)
}
fn dot_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.dot(can_assign)
}
fn grouping_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.grouping(can_assign)
}
fn in_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.in_(can_assign)
}
fn is_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.is_(can_assign)
}
fn list_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.list(can_assign)
}
fn not_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.not_(can_assign)
}
fn number_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.number(can_assign)
}
fn or_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.or_(can_assign)
}
fn string_expr_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.string_expr(can_assign)
}
fn subscript_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.subscript(can_assign)
}
fn ternary_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.ternary(can_assign)
}
fn unary_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.unary(can_assign)
}
fn variable_fn(c: &mut Compiler<'_, '_>, can_assign: bool) {
    c.variable(can_assign)
}

pub(crate) fn get_rule(kind: TokenKind) -> ParseRule {
    use Precedence as P;
    match kind {
        TokenKind::LeftParen => rule(Some(grouping_fn), Some(call_fn), P::Call),
        TokenKind::LeftBrace => rule(Some(dict_fn), None, P::None),
        TokenKind::LeftSquare => rule(Some(list_fn), Some(subscript_fn), P::Call),
        TokenKind::Dot => rule(None, Some(dot_fn), P::Call),

        TokenKind::Minus => rule(Some(unary_fn), Some(binary_fn), P::Term),
        TokenKind::Plus => rule(None, Some(binary_fn), P::Term),
        TokenKind::Solidus => rule(None, Some(binary_fn), P::Factor),
        TokenKind::Asterisk => rule(None, Some(binary_fn), P::Factor),
        TokenKind::Modulo => rule(None, Some(binary_fn), P::Factor),
        TokenKind::Pow => rule(None, Some(binary_fn), P::Exponent),
        TokenKind::Pipe => rule(None, Some(binary_fn), P::BitOr),
        TokenKind::Caret => rule(None, Some(binary_fn), P::BitXor),
        TokenKind::Ampersand => rule(None, Some(binary_fn), P::BitAnd),
        TokenKind::LeftShift => rule(None, Some(binary_fn), P::Shift),
        TokenKind::RightShift => rule(None, Some(binary_fn), P::Shift),

        TokenKind::Bang => rule(Some(unary_fn), None, P::None),
        TokenKind::Tilde => rule(Some(unary_fn), None, P::None),
        TokenKind::BangEqual => rule(None, Some(binary_fn), P::Comparison),
        TokenKind::EqualEqual => rule(None, Some(binary_fn), P::Comparison),
        TokenKind::Greater => rule(None, Some(binary_fn), P::Comparison),
        TokenKind::GreaterEqual => rule(None, Some(binary_fn), P::Comparison),
        TokenKind::Less => rule(None, Some(binary_fn), P::Comparison),
        TokenKind::LessEqual => rule(None, Some(binary_fn), P::Comparison),

        TokenKind::Identifier => rule(Some(variable_fn), None, P::None),
        TokenKind::String | TokenKind::BigString => rule(Some(string_expr_fn), None, P::None),
        TokenKind::PrefixB | TokenKind::PrefixF => rule(Some(string_expr_fn), None, P::None),
        TokenKind::Number => rule(Some(number_fn), None, P::None),

        TokenKind::And => rule(None, Some(and_fn), P::And),
        TokenKind::Or => rule(None, Some(or_fn), P::Or),
        TokenKind::If => rule(None, Some(ternary_fn), P::Ternary),
        TokenKind::In => rule(None, Some(in_fn), P::Comparison),
        TokenKind::Not => rule(Some(unary_fn), Some(not_fn), P::Comparison),
        TokenKind::Is => rule(None, Some(is_fn), P::Comparison),

        TokenKind::None => rule(Some(literal_fn), None, P::None),
        TokenKind::True => rule(Some(literal_fn), None, P::None),
        TokenKind::False => rule(Some(literal_fn), None, P::None),
        TokenKind::Self_ => rule(Some(self_fn), None, P::None),
        TokenKind::Super => rule(Some(super_fn), None, P::None),
        TokenKind::Lambda => rule(Some(lambda_fn), None, P::None),
        TokenKind::Yield => rule(Some(yield_fn), None, P::None),

        _ => rule(None, None, P::None),
    }
}

// ---------------------------------------------------------------------
// Infrastructure
// ---------------------------------------------------------------------

impl<'vm, 'src> Compiler<'vm, 'src> {
    fn new(vm: &'vm mut Vm, source: &'src str, filename: HeapId) -> Self {
        let placeholder = Token::synthetic(TokenKind::Eof);
        Self {
            vm,
            scanner: Scanner::new(source),
            parser: Parser {
                current: placeholder,
                previous: placeholder,
                had_error: false,
                panic_mode: false,
                eating_whitespace: 0,
            },
            states: Vec::new(),
            classes: Vec::new(),
            in_del: 0,
            error: None,
            filename,
        }
    }

    pub(crate) fn push_state(&mut self, ftype: FunctionType, name: Option<Token>) {
        let mut function = FunctionObj::new();
        function.chunk.filename = Some(self.filename);
        function.globals = Some(self.vm.thread.module);
        if let Some(token) = name {
            let text = self.token_text(&token).to_string();
            function.name = Some(self.vm.heap.take_string(text));
        }
        let mut state = CompilerState {
            function,
            ftype,
            locals: Vec::with_capacity(8),
            upvalues: Vec::new(),
            scope_depth: 0,
            required_args: 0,
            keyword_args: 0,
            loop_local_count: 0,
            breaks: Vec::new(),
            continues: Vec::new(),
        };
        if ftype.is_method() {
            state.locals.push(Local {
                name: LocalName::Synthetic("self"),
                depth: 0,
                is_captured: false,
            });
            state.required_args = 1;
        }
        self.states.push(state);
    }

    /// Finishes the innermost function: emits the implicit return, records
    /// parameter names and local debug info, and allocates the function.
    /// Also hands back the upvalue descriptors the enclosing compiler must
    /// emit after its `Closure` instruction.
    pub(crate) fn end_state(&mut self) -> (HeapId, Vec<UpvalueRef>) {
        self.emit_return();

        let end_offset = self.chunk().count() as u32;
        let mut state = self.states.pop().expect("unbalanced compiler states");
        for entry in &mut state.function.local_names {
            if entry.deathday == 0 {
                entry.deathday = end_offset;
            }
        }

        // Record parameter names for keyword binding.
        let mut arg_names = Vec::new();
        let total = state.required_args
            + state.keyword_args
            + usize::from(state.function.flags.collects_args)
            + usize::from(state.function.flags.collects_kwargs);
        for local in state.locals.iter().take(total) {
            let name = match local.name {
                LocalName::Source { start, length } => {
                    let text = &self.scanner.source()[start..start + length];
                    self.vm.heap.intern(text)
                }
                LocalName::Synthetic(text) => self.vm.heap.intern(text),
            };
            arg_names.push(name);
        }
        let keyword_names = arg_names.split_off(state.required_args);
        state.function.required_args = arg_names;
        state.function.keyword_args = keyword_names;
        state.function.upvalue_count = state.upvalues.len();

        let function = self.vm.heap.allocate(HeapData::Function(state.function));
        (function, state.upvalues)
    }

    fn emit_return(&mut self) {
        match self.state().ftype {
            FunctionType::Init => self.emit_operand_op(OpCode::GetLocal, 0),
            // Lambdas (and class-body functions) return the value already on
            // the stack top.
            FunctionType::Lambda => {}
            _ => self.emit_op(OpCode::None),
        }
        self.emit_op(OpCode::Return);
    }

    #[inline]
    pub(crate) fn state(&self) -> &CompilerState {
        self.states.last().expect("no active compiler state")
    }

    #[inline]
    pub(crate) fn state_mut(&mut self) -> &mut CompilerState {
        self.states.last_mut().expect("no active compiler state")
    }

    #[inline]
    pub(crate) fn chunk(&mut self) -> &mut Chunk {
        &mut self.state_mut().function.chunk
    }

    pub(crate) fn token_text(&self, token: &Token) -> &'src str {
        token.text(self.scanner.source())
    }

    // ------------------------------------------------------------------
    // Token flow
    // ------------------------------------------------------------------

    pub(crate) fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.scanner.scan_token();
            match self.parser.current.kind {
                TokenKind::Retry => continue,
                TokenKind::Eol | TokenKind::Indentation if self.parser.eating_whitespace > 0 => {
                    continue
                }
                TokenKind::Error => {
                    let message = self
                        .parser
                        .current
                        .error
                        .unwrap_or("Unexpected lexer error.");
                    self.error_at_current(message);
                    return;
                }
                _ => return,
            }
        }
    }

    pub(crate) fn start_eating_whitespace(&mut self) {
        self.parser.eating_whitespace += 1;
        if matches!(
            self.parser.current.kind,
            TokenKind::Eol | TokenKind::Indentation
        ) {
            self.advance();
        }
    }

    pub(crate) fn stop_eating_whitespace(&mut self) {
        debug_assert!(self.parser.eating_whitespace > 0);
        self.parser.eating_whitespace -= 1;
    }

    pub(crate) fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    #[inline]
    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    pub(crate) fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    pub(crate) fn error(&mut self, message: impl Into<String>) {
        let token = self.parser.previous;
        self.error_at(&token, message.into());
    }

    pub(crate) fn error_at_current(&mut self, message: impl Into<String>) {
        let token = self.parser.current;
        self.error_at(&token, message.into());
    }

    fn error_at(&mut self, token: &Token, message: String) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;
        if self.error.is_none() {
            self.error = Some(Diagnostic {
                message,
                line: token.line,
                col: token.col,
            });
        }
    }

    pub(crate) fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Eol {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Def
                | TokenKind::Let
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.chunk().write(byte, line);
    }

    #[inline]
    pub(crate) fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    pub(crate) fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    /// One-byte-operand instruction, long form when needed.
    pub(crate) fn emit_operand_op(&mut self, op: OpCode, operand: usize) {
        let line = self.parser.previous.line;
        self.chunk().write_operand_op(op, operand, line);
    }

    pub(crate) fn emit_constant(&mut self, value: Value) -> usize {
        let line = self.parser.previous.line;
        self.chunk().write_constant(value, line)
    }

    /// Adds the token's text to the constant pool as an interned string.
    pub(crate) fn identifier_constant(&mut self, token: &Token) -> usize {
        let text = self.token_text(token).to_string();
        let id = self.vm.heap.intern(&text);
        self.chunk().add_constant(Value::Ref(id))
    }

    pub(crate) fn synthetic_constant(&mut self, text: &str) -> usize {
        let id = self.vm.heap.intern(text);
        self.chunk().add_constant(Value::Ref(id))
    }

    /// Emits a jump with a placeholder offset; returns the patch position.
    pub(crate) fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().count() - 2
    }

    pub(crate) fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().count() - offset - 2;
        if jump > 0xffff {
            self.error("Unsupported far jump");
        }
        self.chunk().code[offset] = (jump >> 8) as u8;
        self.chunk().code[offset + 1] = jump as u8;
    }

    /// Backward jump to `loop_start`, patching pending `continue`s first.
    pub(crate) fn emit_loop(&mut self, loop_start: usize) {
        while let Some(&offset) = self.state().continues.last() {
            if offset <= loop_start {
                break;
            }
            self.patch_jump(offset);
            self.state_mut().continues.pop();
        }

        self.emit_op(OpCode::Loop);
        let offset = self.chunk().count() - loop_start + 2;
        if offset > 0xffff {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    pub(crate) fn patch_breaks(&mut self, loop_start: usize) {
        while let Some(&offset) = self.state().breaks.last() {
            if offset <= loop_start {
                break;
            }
            self.patch_jump(offset);
            self.state_mut().breaks.pop();
        }
    }

    // ------------------------------------------------------------------
    // Scopes and locals
    // ------------------------------------------------------------------

    pub(crate) fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    pub(crate) fn end_scope(&mut self) {
        let depth = {
            let state = self.state_mut();
            state.scope_depth -= 1;
            state.scope_depth
        };
        loop {
            let Some(local) = self.state().locals.last().copied() else {
                break;
            };
            if local.depth <= depth as isize {
                break;
            }
            let index = self.state().locals.len() - 1;
            let death = self.state_mut().function.chunk.count() as u32;
            for entry in &mut self.state_mut().function.local_names {
                if entry.slot as usize == index && entry.deathday == 0 {
                    entry.deathday = death;
                }
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    pub(crate) fn local_name_text(&self, name: LocalName) -> &str {
        match name {
            LocalName::Source { start, length } => &self.scanner.source()[start..start + length],
            LocalName::Synthetic(text) => text,
        }
    }

    pub(crate) fn add_local_token(&mut self, token: Token) {
        self.add_local(LocalName::Source {
            start: token.start,
            length: token.length,
        });
    }

    pub(crate) fn add_local(&mut self, name: LocalName) {
        let slot = self.state().locals.len() as u32;
        let birthday = self.state_mut().function.chunk.count() as u32;
        let text = self.local_name_text(name).to_string();
        let name_id = self.vm.heap.intern(&text);
        let state = self.state_mut();
        state.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
        state.function.local_names.push(LocalEntry {
            slot,
            birthday,
            deathday: 0,
            name: name_id,
        });
    }

    pub(crate) fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth as isize;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Declares the variable named by `parser.previous` in the current
    /// scope; duplicate declarations in the same scope are an error.
    pub(crate) fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let token = self.parser.previous;
        let text = self.token_text(&token).to_string();
        let depth = self.state().scope_depth as isize;
        let mut duplicate = false;
        for local in self.state().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if self.local_name_text(local.name) == text {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error(format!(
                "Duplicate definition for local '{text}' in this scope."
            ));
        }
        self.add_local_token(token);
    }

    /// Consumes an identifier; at depth 0 returns its constant index, else
    /// declares a local and returns 0.
    pub(crate) fn parse_variable(&mut self, message: &str) -> usize {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        let token = self.parser.previous;
        self.identifier_constant(&token)
    }

    pub(crate) fn define_variable(&mut self, global: usize) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_operand_op(OpCode::DefineGlobal, global);
    }

    pub(crate) fn resolve_local(&mut self, state_index: usize, text: &str) -> Option<usize> {
        let mut recursive_init = false;
        let mut found = None;
        {
            let state = &self.states[state_index];
            for (i, local) in state.locals.iter().enumerate().rev() {
                if self.local_name_text(local.name) == text {
                    if local.depth == -1 {
                        recursive_init = true;
                    }
                    found = Some(i);
                    break;
                }
            }
        }
        if recursive_init {
            self.error("Can not initialize value recursively (are you shadowing something?)");
        }
        found
    }

    /// Upvalue resolution across the enclosing chain; returns the upvalue
    /// index in state `state_index`.
    pub(crate) fn resolve_upvalue(&mut self, state_index: usize, text: &str) -> Option<usize> {
        if state_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(state_index - 1, text) {
            self.states[state_index - 1].locals[local].is_captured = true;
            return Some(self.add_upvalue(state_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(state_index - 1, text) {
            return Some(self.add_upvalue(state_index, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, state_index: usize, index: usize, is_local: bool) -> usize {
        let state = &mut self.states[state_index];
        for (i, upvalue) in state.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i;
            }
        }
        state.upvalues.push(UpvalueRef { index, is_local });
        state.upvalues.len() - 1
    }

    /// Emits the upvalue descriptors that follow a `Closure` instruction:
    /// a flag byte (bit 0 set when capturing an enclosing local, bit 1 set
    /// when a three-byte index follows), then the index.
    pub(crate) fn emit_upvalue_descriptors(&mut self, upvalues: Vec<UpvalueRef>) {
        for upvalue in upvalues {
            let wide = upvalue.index > 255;
            self.emit_byte(u8::from(upvalue.is_local) | if wide { 2 } else { 0 });
            if wide {
                self.emit_byte((upvalue.index >> 16) as u8);
                self.emit_byte((upvalue.index >> 8) as u8);
            }
            self.emit_byte(upvalue.index as u8);
        }
    }

    // ------------------------------------------------------------------
    // Pratt driver
    // ------------------------------------------------------------------

    pub(crate) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    pub(crate) fn parse_precedence(&mut self, precedence: Precedence) {
        // Remember where this expression began in case an infix `if` turns
        // it into a ternary, which must evaluate its condition first.
        let count_before = self.chunk().count();
        let scanner_before = self.scanner.tell();
        let parser_before = self.parser;

        self.advance();
        let Some(prefix) = get_rule(self.parser.previous.kind).prefix else {
            self.error("Unexpected token.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.parser.current.kind).precedence {
            self.advance();
            let infix_kind = self.parser.previous.kind;
            if infix_kind == TokenKind::If {
                self.actual_ternary(count_before, scanner_before, parser_before);
            } else if let Some(infix) = get_rule(infix_kind).infix {
                infix(self, can_assign);
            }
            if self.parser.had_error {
                return;
            }
        }

        if can_assign && self.match_assignment() {
            self.error("invalid assignment target");
        }
        if self.in_del == 1 && self.match_end_of_del() {
            self.error("invalid del target");
        }
    }

    /// `x if cond else y`: the head `x` was already compiled; roll it back,
    /// compile `cond`, then re-parse `x` from the saved position.
    fn actual_ternary(
        &mut self,
        count_before: usize,
        scanner_before: ScannerState,
        parser_before: Parser,
    ) {
        self.chunk().code.truncate(count_before);
        rollback_lines(self.chunk(), count_before);

        self.parse_precedence(Precedence::Or);

        let then_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.consume(TokenKind::Else, "Expected 'else' after ternary condition");

        self.parse_precedence(Precedence::Or);

        let scanner_out = self.scanner.tell();
        let parser_out = self.parser;

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        self.scanner.rewind(scanner_before);
        self.parser = parser_before;
        self.parse_precedence(Precedence::Or);
        self.patch_jump(else_jump);

        self.scanner.rewind(scanner_out);
        self.parser = parser_out;
    }

    /// Matches any assignment operator, including bare `=`: handlers that
    /// can assign consume `=` themselves first, so reaching this with an
    /// `=` pending means the target was not assignable.
    pub(crate) fn match_assignment(&mut self) -> bool {
        let is_assignment = matches!(
            self.parser.current.kind,
            TokenKind::Equal
                | TokenKind::PlusEqual
                | TokenKind::MinusEqual
                | TokenKind::PlusPlus
                | TokenKind::MinusMinus
                | TokenKind::AsteriskEqual
                | TokenKind::PowEqual
                | TokenKind::SolidusEqual
                | TokenKind::ModuloEqual
                | TokenKind::AmpEqual
                | TokenKind::PipeEqual
                | TokenKind::CaretEqual
                | TokenKind::LshiftEqual
                | TokenKind::RshiftEqual
        );
        if is_assignment {
            self.advance();
        }
        is_assignment
    }

    pub(crate) fn match_end_of_del(&self) -> bool {
        matches!(
            self.parser.current.kind,
            TokenKind::Comma | TokenKind::Eol | TokenKind::Eof | TokenKind::Semicolon
        )
    }
}

/// Drops line-map entries that point past a rolled-back chunk position.
pub(crate) fn rollback_lines(chunk: &mut Chunk, count: usize) {
    while let Some(last) = chunk.lines.last() {
        if (last.start_offset as usize) <= count {
            break;
        }
        chunk.lines.pop();
    }
}
