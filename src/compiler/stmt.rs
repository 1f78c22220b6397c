//! Declarations and statements.
//!
//! Indentation drives block structure: `block` reads statements while the
//! indentation width stays at the level established by the first line of the
//! block. Because the scanner can't see whether the token after a dedent
//! begins an `else`/`elif`/`except` continuation or a fresh statement, those
//! statements advance, look, and push the token back when the lookahead
//! fails.

use crate::chunk::OpCode;
use crate::scanner::{Token, TokenKind};

use super::{rollback_lines, Compiler, FunctionType, LocalName};

impl Compiler<'_, '_> {
    pub(crate) fn declaration(&mut self) {
        if self.check(TokenKind::Def) {
            self.def_declaration();
        } else if self.match_token(TokenKind::Let) {
            self.let_declaration();
        } else if self.check(TokenKind::Class) {
            let class_name = self.class_declaration();
            let constant = self.identifier_constant(&class_name);
            self.parser.previous = class_name;
            self.declare_variable();
            self.define_variable(constant);
        } else if self.check(TokenKind::At) {
            self.decorator(0, FunctionType::Function);
        } else if self.match_token(TokenKind::Eol) || self.match_token(TokenKind::Eof) {
            return;
        } else if self.check(TokenKind::Indentation) {
            return;
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    pub(crate) fn statement(&mut self) {
        if self.match_token(TokenKind::Eol) || self.match_token(TokenKind::Eof) {
            return;
        }

        if self.check(TokenKind::If) {
            self.if_statement();
        } else if self.check(TokenKind::While) {
            self.while_statement();
        } else if self.check(TokenKind::For) {
            self.for_statement();
        } else if self.check(TokenKind::Try) {
            self.try_statement();
        } else if self.check(TokenKind::With) {
            self.with_statement();
        } else {
            // Simple statements; semicolons chain them on one line.
            loop {
                if self.match_token(TokenKind::Raise) {
                    self.raise_statement();
                } else if self.match_token(TokenKind::Return) {
                    self.return_statement();
                } else if self.match_token(TokenKind::Import) {
                    self.import_statement();
                } else if self.match_token(TokenKind::From) {
                    self.from_import_statement();
                } else if self.match_token(TokenKind::Break) {
                    self.break_statement();
                } else if self.match_token(TokenKind::Continue) {
                    self.continue_statement();
                } else if self.match_token(TokenKind::Del) {
                    self.del_statement();
                } else if self.match_token(TokenKind::Pass) {
                    // Nothing to emit.
                } else {
                    self.expression_statement();
                }
                if self.match_token(TokenKind::Semicolon) {
                    continue;
                }
                break;
            }
            if !self.match_token(TokenKind::Eol) && !self.match_token(TokenKind::Eof) {
                self.error_at_current("Unexpected token after statement.");
            }
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.emit_op(OpCode::Pop);
    }

    fn block_width(&self) -> usize {
        if self.parser.previous.kind == TokenKind::Indentation {
            self.parser.previous.length
        } else {
            0
        }
    }

    /// An indented suite (or a single inline statement after the colon).
    /// `block_name` distinguishes `def` bodies, which may start with a
    /// docstring.
    pub(crate) fn block(&mut self, indentation: usize, block_name: &str) {
        if !self.match_token(TokenKind::Eol) {
            self.statement();
            return;
        }
        if !self.check(TokenKind::Indentation) {
            return;
        }
        let current_indent = self.parser.current.length;
        if current_indent <= indentation {
            return;
        }
        self.advance();

        if block_name == "def"
            && (self.match_token(TokenKind::String) || self.match_token(TokenKind::BigString))
        {
            // Compile the docstring, then remove the emitted load; only the
            // constant matters.
            let before = self.chunk().count();
            self.string_expr(false);
            self.chunk().code.truncate(before);
            rollback_lines(self.chunk(), before);
            let doc = self.chunk().constants.last().and_then(|v| v.as_ref_id());
            self.state_mut().function.docstring = doc;
            self.consume(TokenKind::Eol, "Garbage after docstring definition");
            if !self.check(TokenKind::Indentation) || self.parser.current.length != current_indent
            {
                self.error("Expected at least one statement in function with docstring.");
            }
            self.advance();
        }

        self.declaration();
        while self.check(TokenKind::Indentation) {
            if self.parser.current.length < current_indent {
                break;
            }
            self.advance();
            self.declaration();
            if self.check(TokenKind::Eol) {
                self.advance();
            }
        }
    }

    // ------------------------------------------------------------------
    // let
    // ------------------------------------------------------------------

    fn let_declaration(&mut self) {
        let mut targets: Vec<usize> = Vec::new();
        loop {
            let constant = self.parse_variable("Expected variable name.");
            if self.state().scope_depth > 0 {
                targets.push(self.state().locals.len() - 1);
            } else {
                targets.push(constant);
            }
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        if self.match_token(TokenKind::Equal) {
            let mut expression_count = 0;
            loop {
                expression_count += 1;
                self.expression();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            if expression_count == 1 && targets.len() > 1 {
                self.emit_operand_op(OpCode::Unpack, targets.len());
            } else if expression_count == targets.len() {
                // One value per target.
            } else if expression_count > 1 && targets.len() == 1 {
                self.emit_operand_op(OpCode::Tuple, expression_count);
            } else {
                self.error("Invalid sequence unpack in 'let' statement");
            }
        } else {
            for _ in 0..targets.len() {
                self.emit_op(OpCode::None);
            }
        }

        if self.state().scope_depth == 0 {
            for &target in targets.iter().rev() {
                self.define_variable(target);
            }
        } else {
            let depth = self.state().scope_depth as isize;
            let count = self.state().locals.len();
            for i in 0..targets.len() {
                self.state_mut().locals[count - 1 - i].depth = depth;
            }
        }

        if !self.match_token(TokenKind::Eol) && !self.match_token(TokenKind::Eof) {
            self.error("Expected end of line after 'let' statement.");
        }
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    fn def_declaration(&mut self) {
        let block_width = self.block_width();
        self.advance();

        let global = self.parse_variable("Expected function name.");
        self.mark_initialized();
        self.function(FunctionType::Function, block_width);
        self.define_variable(global);
    }

    /// Compiles a function body, leaving a closure on the stack.
    pub(crate) fn function(&mut self, ftype: FunctionType, block_width: usize) {
        let name_token = self.parser.previous;
        self.push_state(ftype, Some(name_token));
        if ftype == FunctionType::Static {
            self.state_mut().function.flags.is_static_method = true;
        }
        self.begin_scope();

        self.consume(
            TokenKind::LeftParen,
            "Expected start of parameter list after function name.",
        );
        self.start_eating_whitespace();
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.match_token(TokenKind::Self_) {
                    if !matches!(
                        ftype,
                        FunctionType::Method | FunctionType::Init | FunctionType::Property
                    ) {
                        self.error("Invalid use of `self` as a function parameter.");
                    }
                } else if self.match_token(TokenKind::Asterisk) || self.check(TokenKind::Pow) {
                    self.collector_parameter();
                } else {
                    let constant = self.parse_variable("Expect parameter name.");
                    self.define_variable(constant);
                    if self.match_token(TokenKind::Equal) {
                        self.default_parameter();
                        self.state_mut().keyword_args += 1;
                    } else {
                        self.state_mut().required_args += 1;
                    }
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.stop_eating_whitespace();
        self.consume(TokenKind::RightParen, "Expected end of parameter list.");
        self.consume(TokenKind::Colon, "Expected colon after function signature.");
        self.block(block_width, "def");

        let (function, upvalues) = self.end_state();
        let constant = self
            .chunk()
            .add_constant(crate::value::Value::Ref(function));
        self.emit_operand_op(OpCode::Closure, constant);
        self.emit_upvalue_descriptors(upvalues);
    }

    /// Defaults are compiled inline: the VM fills unsupplied slots with the
    /// unset sentinel and the prologue replaces them.
    fn default_parameter(&mut self) {
        let slot = self.state().locals.len() - 1;
        self.emit_operand_op(OpCode::GetLocal, slot);
        self.emit_unset_sentinel();
        self.emit_op(OpCode::Is);
        let jump = self.emit_jump(OpCode::JumpIfFalse);
        self.expression();
        self.emit_operand_op(OpCode::SetLocal, slot);
        self.emit_op(OpCode::Pop);
        self.patch_jump(jump);
        self.emit_op(OpCode::Pop);
    }

    /// `*args` / `**kwargs`: unset slots become a fresh list / dict.
    fn collector_parameter(&mut self) {
        let builder = if self.match_token(TokenKind::Pow) {
            if self.state().function.flags.collects_kwargs {
                self.error("Duplicate ** in parameter list.");
                return;
            }
            self.state_mut().function.flags.collects_kwargs = true;
            "dictOf"
        } else {
            if self.state().function.flags.collects_args
                || self.state().function.flags.collects_kwargs
            {
                self.error("Syntax error.");
                return;
            }
            self.state_mut().function.flags.collects_args = true;
            "listOf"
        };
        let constant = self.parse_variable("Expect parameter name.");
        self.define_variable(constant);
        let slot = self.state().locals.len() - 1;
        self.emit_operand_op(OpCode::GetLocal, slot);
        self.emit_unset_sentinel();
        self.emit_op(OpCode::Is);
        let jump = self.emit_jump(OpCode::JumpIfFalse);
        let builder_const = self.synthetic_constant(builder);
        self.emit_operand_op(OpCode::GetGlobal, builder_const);
        self.emit_operand_op(OpCode::Call, 0);
        self.emit_operand_op(OpCode::SetLocal, slot);
        self.emit_op(OpCode::Pop);
        self.patch_jump(jump);
        self.emit_op(OpCode::Pop);
    }

    /// `yield [expr]` marks the enclosing function a generator.
    pub(crate) fn yield_(&mut self, _can_assign: bool) {
        match self.state().ftype {
            FunctionType::Module => {
                self.error("'yield' outside function");
                return;
            }
            FunctionType::Init => {
                self.error("'yield' is not allowed in __init__");
                return;
            }
            _ => {}
        }
        self.state_mut().function.flags.is_generator = true;
        if self.check(TokenKind::Eol)
            || self.check(TokenKind::Eof)
            || self.check(TokenKind::Semicolon)
            || self.check(TokenKind::RightParen)
        {
            self.emit_op(OpCode::None);
        } else {
            self.expression();
        }
        self.emit_op(OpCode::Yield);
    }

    // ------------------------------------------------------------------
    // Classes
    // ------------------------------------------------------------------

    /// Compiles `class Name(Base): ...` into an immediately-called synthetic
    /// function that builds and returns the class object.
    pub(crate) fn class_declaration(&mut self) -> Token {
        let block_width = self.block_width();
        self.advance(); // `class`

        self.consume(TokenKind::Identifier, "Expected class name.");
        let class_name = self.parser.previous;
        self.push_state(FunctionType::Lambda, Some(class_name));
        self.begin_scope();

        let constant = self.identifier_constant(&class_name);
        self.declare_variable();
        self.emit_operand_op(OpCode::Class, constant);
        self.define_variable(constant);

        self.classes.push(super::ClassState { name: class_name });

        let mut has_superclass = false;
        if self.match_token(TokenKind::LeftParen) {
            self.start_eating_whitespace();
            if !self.check(TokenKind::RightParen) {
                self.expression();
                has_superclass = true;
            }
            self.stop_eating_whitespace();
            self.consume(TokenKind::RightParen, "Expected ) after superclass.");
        }
        if !has_superclass {
            let object = self.synthetic_constant("object");
            self.emit_operand_op(OpCode::GetGlobal, object);
        }

        self.begin_scope();
        // The base class doubles as the `super` binding for method bodies.
        self.add_local(LocalName::Synthetic("super"));
        self.mark_initialized();

        if has_superclass {
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
        }
        self.named_variable(class_name, false);

        self.consume(TokenKind::Colon, "Expected colon after class");
        'body: {
            if !self.match_token(TokenKind::Eol) {
                break 'body;
            }
            if !self.check(TokenKind::Indentation) {
                break 'body;
            }
            let current_indent = self.parser.current.length;
            if current_indent <= block_width {
                self.error_at_current("Unexpected indentation level for class");
            }
            self.advance();
            if self.match_token(TokenKind::String) || self.match_token(TokenKind::BigString) {
                self.string_expr(false);
                self.emit_op(OpCode::Docstring);
                self.consume(TokenKind::Eol, "Garbage after docstring definition");
                if !self.check(TokenKind::Indentation)
                    || self.parser.current.length != current_indent
                {
                    break 'body;
                }
                self.advance();
            }
            self.method(current_indent);
            while self.check(TokenKind::Indentation) {
                if self.parser.current.length < current_indent {
                    break;
                }
                self.advance();
                self.method(current_indent);
            }
        }

        self.emit_op(OpCode::Finalize);
        self.classes.pop();

        let (function, upvalues) = self.end_state();
        let constant = self
            .chunk()
            .add_constant(crate::value::Value::Ref(function));
        self.emit_operand_op(OpCode::Closure, constant);
        self.emit_upvalue_descriptors(upvalues);
        self.emit_operand_op(OpCode::Call, 0);

        class_name
    }

    /// One entry of a class body: a method, a class field, a decorated
    /// method, or filler.
    fn method(&mut self, block_width: usize) {
        // Class bodies tolerate blank lines.
        if self.match_token(TokenKind::Eol) {
            return;
        }

        if self.check(TokenKind::At) {
            self.decorator(0, FunctionType::Method);
        } else if self.match_token(TokenKind::Identifier) {
            // A class-level field: Name = value.
            self.emit_operand_op(OpCode::Dup, 0);
            let token = self.parser.previous;
            let constant = self.identifier_constant(&token);
            self.consume(TokenKind::Equal, "Class field must have value.");
            self.expression();
            self.emit_operand_op(OpCode::SetProperty, constant);
            self.emit_op(OpCode::Pop);
            if !self.match_token(TokenKind::Eol) && !self.match_token(TokenKind::Eof) {
                self.error_at_current("Expected end of line after class attribute declaration");
            }
        } else if self.match_token(TokenKind::Pass) {
            self.consume(TokenKind::Eol, "Expected linefeed after 'pass' in class body.");
        } else {
            self.consume(TokenKind::Def, "expected a definition, got nothing");
            self.consume(TokenKind::Identifier, "expected method name");
            let token = self.parser.previous;
            let constant = self.identifier_constant(&token);
            let ftype = if self.token_text(&token) == "__init__" {
                FunctionType::Init
            } else {
                FunctionType::Method
            };
            self.function(ftype, block_width);
            self.emit_operand_op(OpCode::Method, constant);
        }
    }

    /// `@decorator` chains over functions, methods and classes.
    /// `@staticmethod` and `@property` are recognized by name when they are
    /// the outermost decorator of a method.
    fn decorator(&mut self, level: usize, mut ftype: FunctionType) -> Token {
        let block_width = self.block_width();
        self.advance(); // `@`

        let mut func_name = Token::synthetic(TokenKind::Identifier);
        let mut have_callable = false;

        let decorator_text = self.token_text(&self.parser.current.clone()).to_string();
        if decorator_text == "staticmethod" && self.check(TokenKind::Identifier) {
            if level != 0 || ftype != FunctionType::Method {
                self.error(
                    "Invalid use of @staticmethod, which must be the top decorator of a class method.",
                );
                return func_name;
            }
            self.advance();
            ftype = FunctionType::Static;
            self.emit_operand_op(OpCode::Dup, 0);
        } else if decorator_text == "property" && self.check(TokenKind::Identifier) {
            if level != 0 || ftype != FunctionType::Method {
                self.error(
                    "Invalid use of @property, which must be the top decorator of a class method.",
                );
                return func_name;
            }
            self.advance();
            ftype = FunctionType::Property;
            self.emit_operand_op(OpCode::Dup, 0);
        } else {
            self.expression();
            have_callable = true;
        }

        self.consume(TokenKind::Eol, "Expected line feed after decorator.");
        if block_width > 0 {
            self.consume(
                TokenKind::Indentation,
                "Expected next line after decorator to have same indentation.",
            );
            if self.parser.previous.length != block_width {
                self.error("Expected next line after decorator to have same indentation.");
            }
        }

        if self.check(TokenKind::Def) {
            self.advance();
            self.consume(TokenKind::Identifier, "Expected function name.");
            func_name = self.parser.previous;
            if ftype == FunctionType::Method && self.token_text(&func_name) == "__init__" {
                ftype = FunctionType::Init;
            }
            self.function(ftype, block_width);
        } else if self.check(TokenKind::At) {
            func_name = self.decorator(level + 1, ftype);
        } else if self.check(TokenKind::Class) {
            if ftype != FunctionType::Function {
                self.error("Invalid decorator applied to class");
                return func_name;
            }
            func_name = self.class_declaration();
        } else {
            self.error("Expected a function declaration or another decorator.");
            return func_name;
        }

        if have_callable {
            self.emit_operand_op(OpCode::Call, 1);
        }

        if level == 0 {
            match ftype {
                FunctionType::Function => {
                    self.parser.previous = func_name;
                    self.declare_variable();
                    let constant = if self.state().scope_depth > 0 {
                        0
                    } else {
                        self.identifier_constant(&func_name)
                    };
                    self.define_variable(constant);
                }
                FunctionType::Static => {
                    let constant = self.identifier_constant(&func_name);
                    self.emit_operand_op(OpCode::SetProperty, constant);
                    self.emit_op(OpCode::Pop);
                }
                FunctionType::Property => {
                    self.emit_op(OpCode::CreateProperty);
                    let constant = self.identifier_constant(&func_name);
                    self.emit_operand_op(OpCode::SetProperty, constant);
                    self.emit_op(OpCode::Pop);
                }
                _ => {
                    let constant = self.identifier_constant(&func_name);
                    self.emit_operand_op(OpCode::Method, constant);
                }
            }
        }

        func_name
    }

    // ------------------------------------------------------------------
    // Conditionals
    // ------------------------------------------------------------------

    fn if_statement(&mut self) {
        let block_width = self.block_width();
        let my_previous = self.parser.previous;
        self.advance(); // `if`

        self.expression();
        self.consume(TokenKind::Colon, "Expect ':' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.begin_scope();
        self.block(block_width, "if");
        self.end_scope();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        // Same-indentation lookahead for an else/elif continuation.
        if block_width == 0
            || (self.check(TokenKind::Indentation) && self.parser.current.length == block_width)
        {
            let saved_previous = if block_width > 0 {
                let p = self.parser.previous;
                self.advance();
                Some(p)
            } else {
                None
            };
            if self.match_token(TokenKind::Else) || self.check(TokenKind::Elif) {
                if self.check(TokenKind::Elif) || self.check(TokenKind::If) {
                    // `elif` (or `else if`): restart as a nested if.
                    self.parser.previous = my_previous;
                    self.if_statement();
                } else {
                    self.consume(TokenKind::Colon, "Expect ':' after else.");
                    self.begin_scope();
                    self.block(block_width, "else");
                    self.end_scope();
                }
            } else if !self.check(TokenKind::Eof) && !self.check(TokenKind::Eol) {
                // Not ours; put the token back.
                self.scanner.unget(self.parser.current);
                self.parser.current = self.parser.previous;
                if let Some(p) = saved_previous {
                    self.parser.previous = p;
                }
            } else {
                self.advance();
            }
        }

        self.patch_jump(else_jump);
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    fn while_statement(&mut self) {
        let block_width = self.block_width();
        self.advance(); // `while`

        let loop_start = self.chunk().count();
        self.expression();
        self.consume(TokenKind::Colon, "Expect ':' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let old_loop_locals = self.state().loop_local_count;
        self.state_mut().loop_local_count = self.state().locals.len();
        self.begin_scope();
        self.block(block_width, "while");
        self.end_scope();
        self.state_mut().loop_local_count = old_loop_locals;

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.patch_breaks(loop_start);
    }

    /// Both loop forms: `for x in it:` over the iterator protocol, and the
    /// C-style `for x = 0; cond; step:`.
    fn for_statement(&mut self) {
        let block_width = self.block_width();
        self.advance(); // `for`

        self.begin_scope();

        let loop_var_slot = self.state().locals.len();
        let mut var_count = 0;
        let mut matched_equals = false;
        loop {
            self.parse_variable("Expected name for loop iterator.");
            if self.match_token(TokenKind::Equal) {
                matched_equals = true;
                self.expression();
            } else {
                self.emit_op(OpCode::None);
            }
            self.mark_initialized();
            var_count += 1;
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        let loop_start;
        let exit_jump;

        if !matched_equals && self.match_token(TokenKind::In) {
            self.expression();

            let iter_slot = self.state().locals.len();
            self.add_local(LocalName::Synthetic(""));
            self.mark_initialized();

            let iter_const = self.synthetic_constant("__iter__");
            self.emit_operand_op(OpCode::GetProperty, iter_const);
            self.emit_operand_op(OpCode::Call, 0);
            self.emit_operand_op(OpCode::SetLocal, iter_slot);

            loop_start = self.chunk().count();

            // Call the iterator; it returns itself when exhausted.
            self.emit_operand_op(OpCode::GetLocal, iter_slot);
            self.emit_operand_op(OpCode::Call, 0);
            self.emit_operand_op(OpCode::SetLocal, loop_var_slot);
            self.emit_operand_op(OpCode::GetLocal, iter_slot);
            self.emit_op(OpCode::Is);
            exit_jump = self.emit_jump(OpCode::JumpIfTrue);
            self.emit_op(OpCode::Pop);

            if var_count > 1 {
                self.emit_operand_op(OpCode::GetLocal, loop_var_slot);
                self.emit_operand_op(OpCode::Unpack, var_count);
                for i in (loop_var_slot..loop_var_slot + var_count).rev() {
                    self.emit_operand_op(OpCode::SetLocal, i);
                    self.emit_op(OpCode::Pop);
                }
            }
        } else {
            self.consume(
                TokenKind::Semicolon,
                "expect ; after var declaration in for loop",
            );
            let mut condition_start = self.chunk().count();
            self.expression();
            exit_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);

            if self.match_token(TokenKind::Semicolon) {
                let body_jump = self.emit_jump(OpCode::Jump);
                let increment_start = self.chunk().count();
                loop {
                    self.expression();
                    self.emit_op(OpCode::Pop);
                    if !self.match_token(TokenKind::Comma) {
                        break;
                    }
                }
                self.emit_loop(condition_start);
                condition_start = increment_start;
                self.patch_jump(body_jump);
            }
            loop_start = condition_start;
        }

        self.consume(TokenKind::Colon, "expect :");

        let old_loop_locals = self.state().loop_local_count;
        self.state_mut().loop_local_count = self.state().locals.len();
        self.begin_scope();
        self.block(block_width, "for");
        self.end_scope();
        self.state_mut().loop_local_count = old_loop_locals;

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.patch_breaks(loop_start);

        self.end_scope();
    }

    fn break_statement(&mut self) {
        let base = self.state().loop_local_count;
        for _ in base..self.state().locals.len() {
            self.emit_op(OpCode::Pop);
        }
        let jump = self.emit_jump(OpCode::Jump);
        self.state_mut().breaks.push(jump);
    }

    fn continue_statement(&mut self) {
        let base = self.state().loop_local_count;
        for _ in base..self.state().locals.len() {
            self.emit_op(OpCode::Pop);
        }
        let jump = self.emit_jump(OpCode::Jump);
        self.state_mut().continues.push(jump);
    }

    // ------------------------------------------------------------------
    // return / raise / del
    // ------------------------------------------------------------------

    fn return_statement(&mut self) {
        if self.check(TokenKind::Eol) || self.check(TokenKind::Eof) {
            match self.state().ftype {
                FunctionType::Init => {
                    self.emit_operand_op(OpCode::GetLocal, 0);
                }
                _ => self.emit_op(OpCode::None),
            }
            self.emit_op(OpCode::Return);
            return;
        }
        if self.state().ftype == FunctionType::Init {
            self.error("Can not return values from __init__");
        }
        self.expression();
        self.emit_op(OpCode::Return);
    }

    fn raise_statement(&mut self) {
        self.expression();
        self.emit_op(OpCode::Raise);
    }

    fn del_statement(&mut self) {
        loop {
            self.in_del = 1;
            self.expression();
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.in_del = 0;
    }

    // ------------------------------------------------------------------
    // try / except
    // ------------------------------------------------------------------

    fn try_statement(&mut self) {
        let block_width = self.block_width();
        self.advance(); // `try`
        self.consume(TokenKind::Colon, "Expect ':' after try.");

        self.begin_scope();
        let try_jump = self.emit_jump(OpCode::PushTry);
        // Slot for the caught exception, then the handler record itself.
        let exception_slot = self.state().locals.len();
        self.add_local(LocalName::Synthetic("exception"));
        self.mark_initialized();
        self.add_local(LocalName::Synthetic(""));
        self.mark_initialized();

        self.begin_scope();
        self.block(block_width, "try");
        self.end_scope();

        let success_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(try_jump);

        if block_width == 0
            || (self.check(TokenKind::Indentation) && self.parser.current.length == block_width)
        {
            let saved_previous = if block_width > 0 {
                let p = self.parser.previous;
                self.advance();
                Some(p)
            } else {
                None
            };
            if self.match_token(TokenKind::Except) {
                if !self.check(TokenKind::Colon) && !self.check(TokenKind::As) {
                    // Filtered handler: re-raise on mismatch.
                    self.expression();
                    self.emit_op(OpCode::FilterExcept);
                    let matched = self.emit_jump(OpCode::JumpIfTrue);
                    self.emit_op(OpCode::Pop);
                    self.emit_operand_op(OpCode::GetLocal, exception_slot);
                    self.emit_op(OpCode::Raise);
                    self.patch_jump(matched);
                    self.emit_op(OpCode::Pop);
                }
                if self.match_token(TokenKind::As) {
                    self.consume(TokenKind::Identifier, "Expected name after 'as'");
                    let token = self.parser.previous;
                    self.state_mut().locals[exception_slot].name = LocalName::Source {
                        start: token.start,
                        length: token.length,
                    };
                }
                self.consume(TokenKind::Colon, "Expect ':' after except.");
                self.begin_scope();
                self.block(block_width, "except");
                self.end_scope();
            } else if !self.check(TokenKind::Eol) && !self.check(TokenKind::Eof) {
                self.scanner.unget(self.parser.current);
                self.parser.current = self.parser.previous;
                if let Some(p) = saved_previous {
                    self.parser.previous = p;
                }
            } else {
                self.advance();
            }
        }

        self.patch_jump(success_jump);
        self.end_scope(); // pops the handler and the exception slot
    }

    // ------------------------------------------------------------------
    // with
    // ------------------------------------------------------------------

    fn with_statement(&mut self) {
        let block_width = self.block_width();
        self.advance(); // `with`
        self.with_item(block_width);
    }

    fn with_item(&mut self, block_width: usize) {
        self.begin_scope();
        self.expression();

        if self.match_token(TokenKind::As) {
            self.consume(TokenKind::Identifier, "Expected variable name after 'as'");
            self.declare_variable();
            self.mark_initialized();
        } else {
            self.add_local(LocalName::Synthetic(""));
            self.mark_initialized();
        }

        let with_jump = self.emit_jump(OpCode::PushWith);
        // Exception/result slot, then the handler record.
        self.add_local(LocalName::Synthetic(""));
        self.mark_initialized();
        self.add_local(LocalName::Synthetic(""));
        self.mark_initialized();

        if self.match_token(TokenKind::Comma) {
            // Additional managers on the same line nest.
            self.with_item(block_width);
        } else {
            self.consume(TokenKind::Colon, "Expected ':' after with statement");
            self.begin_scope();
            self.block(block_width, "with");
            self.end_scope();
        }

        self.patch_jump(with_jump);
        self.emit_op(OpCode::CleanupWith);
        self.end_scope(); // pops handler, slot and context manager
    }

    // ------------------------------------------------------------------
    // Imports
    // ------------------------------------------------------------------

    /// Parses a dotted module name and emits its import; returns the name's
    /// constant index and the first-component token.
    fn import_module(&mut self) -> (usize, Token, String) {
        self.consume(TokenKind::Identifier, "Expected module name");
        let first = self.parser.previous;
        let mut dotted = self.token_text(&first).to_string();
        while self.match_token(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "Expected module path element after '.'");
            dotted.push('.');
            dotted.push_str(self.token_text(&self.parser.previous.clone()));
        }
        let constant = {
            let id = self.vm.heap.intern(&dotted);
            self.chunk().add_constant(crate::value::Value::Ref(id))
        };
        self.emit_operand_op(OpCode::Import, constant);
        (constant, first, dotted)
    }

    fn import_statement(&mut self) {
        loop {
            let (mut constant, first, dotted) = self.import_module();
            if self.match_token(TokenKind::As) {
                self.consume(TokenKind::Identifier, "Expected identifier after `as`");
                let token = self.parser.previous;
                constant = self.identifier_constant(&token);
            } else if dotted.contains('.') {
                // `import a.b.c` binds `a`; the chain is already cached, so
                // drop the leaf and re-import the root.
                self.emit_op(OpCode::Pop);
                constant = self.identifier_constant(&first);
                self.emit_operand_op(OpCode::Import, constant);
                self.parser.previous = first;
            }
            self.declare_variable();
            self.define_variable(constant);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
    }

    fn from_import_statement(&mut self) {
        self.import_module();
        self.consume(TokenKind::Import, "Expected 'import' after module name");
        loop {
            self.consume(TokenKind::Identifier, "Expected member name");
            let token = self.parser.previous;
            let mut member = self.identifier_constant(&token);
            self.emit_operand_op(OpCode::Dup, 0);
            self.emit_operand_op(OpCode::ImportFrom, member);
            if self.match_token(TokenKind::As) {
                self.consume(TokenKind::Identifier, "Expected identifier after `as`");
                let token = self.parser.previous;
                member = self.identifier_constant(&token);
            }
            if self.state().scope_depth > 0 {
                // Keep the module under the new local.
                self.emit_op(OpCode::Swap);
            }
            self.declare_variable();
            self.define_variable(member);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.emit_op(OpCode::Pop);
    }
}
