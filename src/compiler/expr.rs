//! Expression parsers: the handlers referenced by the Pratt rule table.

use crate::chunk::OpCode;
use crate::heap::HeapData;
use crate::objects::BytesObj;
use crate::scanner::{Token, TokenKind};
use crate::value::{Value, KWARGS_UNSET};

use super::{rollback_lines, Compiler, FunctionType, LocalName, Precedence};

impl Compiler<'_, '_> {
    // ------------------------------------------------------------------
    // Literals
    // ------------------------------------------------------------------

    pub(crate) fn number(&mut self, _can_assign: bool) {
        let token = self.parser.previous;
        let text = self.token_text(&token);

        let (digits, base) = match text.as_bytes() {
            [b'0', b'x' | b'X', ..] => (&text[2..], 16),
            [b'0', b'b' | b'B', ..] => (&text[2..], 2),
            [b'0', b'o' | b'O', ..] => (&text[2..], 8),
            _ => (text, 10),
        };

        if base == 10 && text.contains('.') {
            match text.parse::<f64>() {
                Ok(value) => {
                    self.emit_constant(Value::Float(value));
                }
                Err(_) => self.error("Invalid floating point literal."),
            }
            return;
        }

        match i64::from_str_radix(digits, base) {
            Ok(value) => {
                self.emit_constant(Value::Int(value));
            }
            Err(_) => self.error("Integer literal out of range."),
        }
    }

    pub(crate) fn literal(&mut self, _can_assign: bool) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::None => self.emit_op(OpCode::None),
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Strings (escapes, concatenation, b"" and f"")
    // ------------------------------------------------------------------

    pub(crate) fn string_expr(&mut self, _can_assign: bool) {
        let is_bytes = self.parser.previous.kind == TokenKind::PrefixB;
        let is_format = self.parser.previous.kind == TokenKind::PrefixF;

        if (is_bytes || is_format)
            && !(self.match_token(TokenKind::String) || self.match_token(TokenKind::BigString))
        {
            self.error("Expected string after prefix.");
            return;
        }

        let mut buffer: Vec<u8> = Vec::new();
        let mut emitted_any = false;

        loop {
            let token = self.parser.previous;
            let quote_width = if token.kind == TokenKind::BigString { 3 } else { 1 };
            let segment_start = token.start + quote_width;
            let segment_end = token.start + token.length - quote_width;
            let source = self.scanner.source().as_bytes();

            let mut c = segment_start;
            while c < segment_end {
                let byte = source[c];
                if byte == b'\\' {
                    let escape = source.get(c + 1).copied().unwrap_or(0);
                    match escape {
                        b'\\' => buffer.push(b'\\'),
                        b'\'' => buffer.push(b'\''),
                        b'"' => buffer.push(b'"'),
                        b'a' => buffer.push(0x07),
                        b'b' => buffer.push(0x08),
                        b'f' => buffer.push(0x0c),
                        b'n' => buffer.push(b'\n'),
                        b'r' => buffer.push(b'\r'),
                        b't' => buffer.push(b'\t'),
                        b'v' => buffer.push(0x0b),
                        b'[' => buffer.push(0x1b),
                        b'x' => {
                            if !self.push_hex_escape(&mut buffer, source, c + 2, 2, is_bytes) {
                                return;
                            }
                            c += 2;
                        }
                        b'u' => {
                            if is_bytes {
                                buffer.push(b'\\');
                                buffer.push(b'u');
                            } else {
                                if !self.push_hex_escape(&mut buffer, source, c + 2, 4, false) {
                                    return;
                                }
                                c += 4;
                            }
                        }
                        b'U' => {
                            if is_bytes {
                                buffer.push(b'\\');
                                buffer.push(b'U');
                            } else {
                                if !self.push_hex_escape(&mut buffer, source, c + 2, 8, false) {
                                    return;
                                }
                                c += 8;
                            }
                        }
                        b'\n' => {}
                        _ => {
                            buffer.push(byte);
                            c += 1;
                            continue;
                        }
                    }
                    c += 2;
                } else if is_format && byte == b'{' {
                    // Flush the literal prefix so concatenation order holds.
                    if !emitted_any || !buffer.is_empty() {
                        self.emit_buffer_constant(&buffer, false);
                        if emitted_any {
                            self.emit_op(OpCode::Add);
                        }
                        emitted_any = true;
                        buffer.clear();
                    }
                    match self.fstring_expression(c + 1, token.line) {
                        Some(resume) => {
                            if emitted_any {
                                self.emit_op(OpCode::Add);
                            }
                            emitted_any = true;
                            c = resume;
                        }
                        None => return,
                    }
                } else {
                    if byte > 0x7f && is_bytes {
                        self.error("bytes literal can only contain ASCII characters");
                        return;
                    }
                    buffer.push(byte);
                    c += 1;
                }
            }

            let more = if is_bytes {
                self.match_token(TokenKind::PrefixB)
                    && (self.match_token(TokenKind::String)
                        || self.match_token(TokenKind::BigString))
            } else {
                self.match_token(TokenKind::String) || self.match_token(TokenKind::BigString)
            };
            if !more {
                break;
            }
        }

        if is_bytes
            && (self.check(TokenKind::String) || self.check(TokenKind::BigString))
        {
            self.error("can not mix bytes and string literals");
            return;
        }

        if is_bytes {
            let id = self.vm.heap.allocate(HeapData::Bytes(BytesObj::new(buffer)));
            self.emit_constant(Value::Ref(id));
            return;
        }

        if !is_format || !buffer.is_empty() || !emitted_any {
            self.emit_buffer_constant(&buffer, false);
            if emitted_any {
                self.emit_op(OpCode::Add);
            }
        }
    }

    fn emit_buffer_constant(&mut self, buffer: &[u8], _big: bool) {
        let text = String::from_utf8_lossy(buffer).into_owned();
        let id = self.vm.heap.take_string(text);
        self.emit_constant(Value::Ref(id));
    }

    fn push_hex_escape(
        &mut self,
        buffer: &mut Vec<u8>,
        source: &[u8],
        start: usize,
        len: usize,
        is_bytes: bool,
    ) -> bool {
        let Some(digits) = source.get(start..start + len) else {
            self.error("truncated hex escape");
            return false;
        };
        if !digits.iter().all(u8::is_ascii_hexdigit) {
            self.error("truncated hex escape");
            return false;
        }
        let text = std::str::from_utf8(digits).expect("hex digits are ascii");
        let value = u32::from_str_radix(text, 16).expect("validated hex");
        if value >= 0x110000 {
            self.error("invalid codepoint in unicode escape");
            return false;
        }
        if is_bytes || value < 0x80 && len == 2 {
            buffer.push(value as u8);
            return true;
        }
        match char::from_u32(value) {
            Some(c) => {
                let mut encoded = [0u8; 4];
                buffer.extend_from_slice(c.encode_utf8(&mut encoded).as_bytes());
                true
            }
            None => {
                self.error("invalid codepoint in unicode escape");
                false
            }
        }
    }

    /// Compiles the `{expr[!r|!s]}` interior of an f-string starting at
    /// absolute byte offset `start`. Returns the offset just past the `}`.
    fn fstring_expression(&mut self, start: usize, line: u32) -> Option<usize> {
        let outer_scanner = self.scanner.tell();
        let outer_parser = self.parser;

        let line_start = start - (self.parser.previous.col as usize).min(start);
        self.scanner.rewind_to_offset(start, line, line_start);
        self.advance();
        self.expression();
        if self.parser.had_error {
            return None;
        }
        // Where the embedded parse stopped: the start of its lookahead
        // token, which is the '!' or '}' terminator.
        let mut resume = self.parser.current.start;

        self.scanner.rewind(outer_scanner);
        self.parser = outer_parser;

        let source = self.scanner.source().as_bytes();
        let mut conversion = "str";
        if source.get(resume) == Some(&b'!') {
            resume += 1;
            match source.get(resume) {
                Some(b'r') => conversion = "repr",
                Some(b's') => conversion = "str",
                _ => {
                    self.error("Unsupported conversion flag for f-string expression");
                    return None;
                }
            }
            resume += 1;
        }
        if source.get(resume) == Some(&b':') {
            self.error("Format spec not supported in f-string");
            return None;
        }
        if source.get(resume) != Some(&b'}') {
            self.error("Expected closing } after expression in f-string");
            return None;
        }

        let conversion_const = self.synthetic_constant(conversion);
        self.emit_operand_op(OpCode::GetGlobal, conversion_const);
        self.emit_op(OpCode::Swap);
        self.emit_operand_op(OpCode::Call, 1);
        Some(resume + 1)
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    pub(crate) fn variable(&mut self, can_assign: bool) {
        let token = self.parser.previous;
        self.named_variable(token, can_assign);
    }

    pub(crate) fn named_variable(&mut self, token: Token, can_assign: bool) {
        let text = self.token_text(&token).to_string();
        let top = self.states.len() - 1;

        let (get_op, set_op, arg, is_global) =
            if let Some(slot) = self.resolve_local(top, &text) {
                (OpCode::GetLocal, OpCode::SetLocal, slot, false)
            } else if let Some(slot) = self.resolve_upvalue(top, &text) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, slot, false)
            } else {
                let constant = self.identifier_constant(&token);
                (OpCode::GetGlobal, OpCode::SetGlobal, constant, true)
            };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_operand_op(set_op, arg);
        } else if can_assign && self.match_assignment() {
            self.emit_operand_op(get_op, arg);
            self.assignment_value();
            self.emit_operand_op(set_op, arg);
        } else if self.in_del == 1 && self.match_end_of_del() {
            if is_global {
                self.emit_operand_op(OpCode::DelGlobal, arg);
                self.in_del = 2;
            } else {
                self.error("invalid del target");
            }
        } else {
            self.emit_operand_op(get_op, arg);
        }
    }

    /// Value side of a compound assignment: `++`/`--` imply 1, every other
    /// operator reads an expression, then the arithmetic op applies.
    pub(crate) fn assignment_value(&mut self) {
        let kind = self.parser.previous.kind;
        if matches!(kind, TokenKind::PlusPlus | TokenKind::MinusMinus) {
            self.emit_constant(Value::Int(1));
        } else {
            self.expression();
        }
        let op = match kind {
            TokenKind::PlusEqual | TokenKind::PlusPlus => OpCode::Add,
            TokenKind::MinusEqual | TokenKind::MinusMinus => OpCode::Subtract,
            TokenKind::AsteriskEqual => OpCode::Multiply,
            TokenKind::SolidusEqual => OpCode::Divide,
            TokenKind::ModuloEqual => OpCode::Modulo,
            TokenKind::PowEqual => OpCode::Pow,
            TokenKind::AmpEqual => OpCode::BitAnd,
            TokenKind::PipeEqual => OpCode::BitOr,
            TokenKind::CaretEqual => OpCode::BitXor,
            TokenKind::LshiftEqual => OpCode::ShiftLeft,
            TokenKind::RshiftEqual => OpCode::ShiftRight,
            _ => {
                self.error("Unexpected operand in assignment");
                return;
            }
        };
        self.emit_op(op);
    }

    pub(crate) fn self_(&mut self, _can_assign: bool) {
        // `self` is local slot 0 of a method body; resolving it by name lets
        // nested functions capture it as an upvalue.
        self.push_named("self");
    }

    pub(crate) fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Invalid use of `super` outside of a class.");
        }
        self.consume(TokenKind::Dot, "Expected . after super");
        self.consume(TokenKind::Identifier, "Expected member name");
        let token = self.parser.previous;
        let constant = self.identifier_constant(&token);
        // Push the receiver, then the base class bound to the `super` local.
        self.push_named("self");
        self.push_named("super");
        self.emit_operand_op(OpCode::GetSuper, constant);
    }

    fn push_named(&mut self, name: &'static str) {
        let top = self.states.len() - 1;
        if let Some(slot) = self.resolve_local(top, name) {
            self.emit_operand_op(OpCode::GetLocal, slot);
        } else if let Some(slot) = self.resolve_upvalue(top, name) {
            self.emit_operand_op(OpCode::GetUpvalue, slot);
        } else {
            self.error(format!("`{name}` is not valid here."));
        }
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    pub(crate) fn unary(&mut self, _can_assign: bool) {
        let kind = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Tilde => self.emit_op(OpCode::BitNegate),
            TokenKind::Bang | TokenKind::Not => self.emit_op(OpCode::Not),
            _ => {}
        }
    }

    pub(crate) fn binary(&mut self, _can_assign: bool) {
        let kind = self.parser.previous.kind;
        let rule = super::get_rule(kind);
        // `**` is right-associative; everything else parses one level up.
        let next = if kind == TokenKind::Pow {
            Precedence::Exponent
        } else {
            rule.precedence.one_higher()
        };
        self.parse_precedence(next);

        match kind {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Pipe => self.emit_op(OpCode::BitOr),
            TokenKind::Caret => self.emit_op(OpCode::BitXor),
            TokenKind::Ampersand => self.emit_op(OpCode::BitAnd),
            TokenKind::LeftShift => self.emit_op(OpCode::ShiftLeft),
            TokenKind::RightShift => self.emit_op(OpCode::ShiftRight),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Asterisk => self.emit_op(OpCode::Multiply),
            TokenKind::Pow => self.emit_op(OpCode::Pow),
            TokenKind::Solidus => self.emit_op(OpCode::Divide),
            TokenKind::Modulo => self.emit_op(OpCode::Modulo),
            _ => {}
        }
    }

    pub(crate) fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    pub(crate) fn or_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    /// Placeholder: the real work happens in `actual_ternary`, driven from
    /// `parse_precedence` so the condition can be evaluated first.
    pub(crate) fn ternary(&mut self, _can_assign: bool) {
        self.error("This function should not run.");
    }

    /// `x in container` => `container.__contains__(x)`.
    pub(crate) fn in_(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Comparison);
        let contains = self.synthetic_constant("__contains__");
        self.emit_operand_op(OpCode::GetProperty, contains);
        self.emit_op(OpCode::Swap);
        self.emit_operand_op(OpCode::Call, 1);
    }

    /// Infix `not` must be `not in`.
    pub(crate) fn not_(&mut self, can_assign: bool) {
        self.consume(TokenKind::In, "infix not must be followed by in");
        self.in_(can_assign);
        self.emit_op(OpCode::Not);
    }

    pub(crate) fn is_(&mut self, _can_assign: bool) {
        let invert = self.match_token(TokenKind::Not);
        self.parse_precedence(Precedence::Comparison);
        self.emit_op(OpCode::Is);
        if invert {
            self.emit_op(OpCode::Not);
        }
    }

    // ------------------------------------------------------------------
    // Attribute access and subscripting
    // ------------------------------------------------------------------

    pub(crate) fn dot(&mut self, can_assign: bool) {
        if self.match_token(TokenKind::LeftParen) {
            self.attribute_pack(can_assign);
            return;
        }
        self.consume(TokenKind::Identifier, "Expected property name");
        let token = self.parser.previous;
        let constant = self.identifier_constant(&token);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_operand_op(OpCode::SetProperty, constant);
        } else if can_assign && self.match_assignment() {
            self.emit_operand_op(OpCode::Dup, 0);
            self.emit_operand_op(OpCode::GetProperty, constant);
            self.assignment_value();
            self.emit_operand_op(OpCode::SetProperty, constant);
        } else if self.in_del == 1 && self.match_end_of_del() {
            self.emit_operand_op(OpCode::DelProperty, constant);
            self.in_del = 2;
        } else {
            self.emit_operand_op(OpCode::GetProperty, constant);
        }
    }

    /// `obj.(a, b)` reads or assigns several attributes at once.
    fn attribute_pack(&mut self, can_assign: bool) {
        self.start_eating_whitespace();
        let mut names: Vec<usize> = Vec::new();
        loop {
            self.consume(TokenKind::Identifier, "Expected attribute name");
            let token = self.parser.previous;
            names.push(self.identifier_constant(&token));
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.stop_eating_whitespace();
        self.consume(TokenKind::RightParen, "Expected ) after attribute list");

        if can_assign && self.match_token(TokenKind::Equal) {
            let mut expression_count = 0;
            loop {
                expression_count += 1;
                self.expression();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            if expression_count == 1 && names.len() > 1 {
                self.emit_operand_op(OpCode::Unpack, names.len());
            } else if expression_count > 1 && names.len() == 1 {
                self.emit_operand_op(OpCode::Tuple, expression_count);
            } else if expression_count != names.len() {
                self.error("Invalid assignment to attribute pack");
                return;
            }
            for i in (1..=names.len()).rev() {
                if i != 1 {
                    self.emit_operand_op(OpCode::Dup, i);
                    self.emit_op(OpCode::Swap);
                }
                self.emit_operand_op(OpCode::SetProperty, names[i - 1]);
                if i != 1 {
                    self.emit_op(OpCode::Pop);
                }
            }
        } else {
            for &name in &names {
                self.emit_operand_op(OpCode::Dup, 0);
                self.emit_operand_op(OpCode::GetProperty, name);
                self.emit_op(OpCode::Swap);
            }
            self.emit_op(OpCode::Pop);
            self.emit_operand_op(OpCode::Tuple, names.len());
        }
    }

    /// `[index]` and `[start:end]` with all assignment forms.
    pub(crate) fn subscript(&mut self, can_assign: bool) {
        let mut is_slice = false;
        if self.match_token(TokenKind::Colon) {
            self.emit_op(OpCode::None);
            is_slice = true;
        } else {
            self.expression();
        }

        if is_slice || self.match_token(TokenKind::Colon) {
            if is_slice && self.match_token(TokenKind::Colon) {
                self.error("Step value not supported in slice.");
                return;
            }
            if self.match_token(TokenKind::RightSquare) {
                self.emit_op(OpCode::None);
            } else {
                self.expression();
                self.consume(
                    TokenKind::RightSquare,
                    "Expected ending square bracket after slice.",
                );
            }
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_op(OpCode::InvokeSetSlice);
            } else if can_assign && self.match_assignment() {
                self.emit_operand_op(OpCode::Dup, 2);
                self.emit_operand_op(OpCode::Dup, 2);
                self.emit_operand_op(OpCode::Dup, 2);
                self.emit_op(OpCode::InvokeGetSlice);
                self.assignment_value();
                self.emit_op(OpCode::InvokeSetSlice);
            } else if self.in_del == 1 && self.match_end_of_del() {
                self.emit_op(OpCode::InvokeDelSlice);
                self.in_del = 2;
            } else {
                self.emit_op(OpCode::InvokeGetSlice);
            }
            return;
        }

        self.consume(
            TokenKind::RightSquare,
            "Expected ending square bracket after index.",
        );
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::InvokeSetter);
        } else if can_assign && self.match_assignment() {
            self.emit_operand_op(OpCode::Dup, 1);
            self.emit_operand_op(OpCode::Dup, 1);
            self.emit_op(OpCode::InvokeGetter);
            self.assignment_value();
            self.emit_op(OpCode::InvokeSetter);
        } else if self.in_del == 1 && self.match_end_of_del() {
            self.emit_op(OpCode::InvokeDelete);
            self.in_del = 2;
        } else {
            self.emit_op(OpCode::InvokeGetter);
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    pub(crate) fn call(&mut self, _can_assign: bool) {
        self.start_eating_whitespace();
        let mut arg_count = 0usize;
        let mut special_args = 0usize;
        let mut keyword_args = 0usize;
        let mut seen_keyword_unpacking = false;

        if !self.check(TokenKind::RightParen) {
            loop {
                if self.match_token(TokenKind::Asterisk) || self.check(TokenKind::Pow) {
                    special_args += 1;
                    if self.match_token(TokenKind::Pow) {
                        seen_keyword_unpacking = true;
                        self.emit_operand_op(OpCode::ExpandArgs, 2);
                        self.expression();
                    } else {
                        if seen_keyword_unpacking {
                            self.error("Iterable expansion follows keyword argument unpacking.");
                            return;
                        }
                        self.emit_operand_op(OpCode::ExpandArgs, 1);
                        self.expression();
                    }
                } else if self.check(TokenKind::Identifier) {
                    self.advance();
                    let name = self.parser.previous;
                    if self.check(TokenKind::Equal) {
                        self.advance();
                        let constant = self.identifier_constant(&name);
                        self.emit_operand_op(OpCode::Constant, constant);
                        self.expression();
                        keyword_args += 1;
                        special_args += 1;
                    } else {
                        // A plain argument that starts with an identifier;
                        // back up and parse it as an expression.
                        self.scanner.unget(self.parser.current);
                        self.parser.current = name;
                        self.positional_argument(
                            seen_keyword_unpacking,
                            keyword_args,
                            &mut special_args,
                            &mut arg_count,
                        );
                        if self.parser.had_error {
                            return;
                        }
                    }
                } else {
                    self.positional_argument(
                        seen_keyword_unpacking,
                        keyword_args,
                        &mut special_args,
                        &mut arg_count,
                    );
                    if self.parser.had_error {
                        return;
                    }
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.stop_eating_whitespace();
        self.consume(TokenKind::RightParen, "Expected ')' after arguments.");

        if special_args > 0 {
            // Sentinel telling the call machinery how many marker pairs sit
            // on the stack above the plain positionals.
            self.emit_operand_op(OpCode::Kwargs, special_args);
            arg_count += 1 + 2 * special_args;
        }
        self.emit_operand_op(OpCode::Call, arg_count);
    }

    fn positional_argument(
        &mut self,
        seen_keyword_unpacking: bool,
        keyword_args: usize,
        special_args: &mut usize,
        arg_count: &mut usize,
    ) {
        if seen_keyword_unpacking {
            self.error("positional argument follows keyword argument unpacking");
            return;
        }
        if keyword_args > 0 {
            self.error("Positional argument follows keyword argument");
            return;
        }
        if *special_args > 0 {
            self.emit_operand_op(OpCode::ExpandArgs, 0);
            self.expression();
            *special_args += 1;
            return;
        }
        self.expression();
        *arg_count += 1;
    }

    // ------------------------------------------------------------------
    // Groupings, collections, comprehensions
    // ------------------------------------------------------------------

    pub(crate) fn grouping(&mut self, _can_assign: bool) {
        self.start_eating_whitespace();
        if self.check(TokenKind::RightParen) {
            self.emit_operand_op(OpCode::Tuple, 0);
        } else {
            let count_before = self.chunk().count();
            let scanner_before = self.scanner.tell();
            let parser_before = self.parser;
            self.expression();
            if self.match_token(TokenKind::For) {
                self.chunk().code.truncate(count_before);
                rollback_lines(self.chunk(), count_before);
                self.comprehension(scanner_before, parser_before, "tupleOf", Self::single_inner);
            } else if self.match_token(TokenKind::Comma) {
                let mut arg_count = 1;
                if !self.check(TokenKind::RightParen) {
                    loop {
                        self.expression();
                        arg_count += 1;
                        if !(self.match_token(TokenKind::Comma)
                            && !self.check(TokenKind::RightParen))
                        {
                            break;
                        }
                    }
                }
                self.emit_operand_op(OpCode::Tuple, arg_count);
            }
        }
        self.stop_eating_whitespace();
        self.consume(TokenKind::RightParen, "Expected ')' after expression.");
    }

    pub(crate) fn list(&mut self, _can_assign: bool) {
        let count_before = self.chunk().count();
        self.start_eating_whitespace();

        let builder = self.synthetic_constant("listOf");
        self.emit_operand_op(OpCode::GetGlobal, builder);

        if !self.check(TokenKind::RightSquare) {
            let scanner_before = self.scanner.tell();
            let parser_before = self.parser;
            self.expression();

            if self.match_token(TokenKind::For) {
                // It was a comprehension head; discard and start over with
                // the loop variables in scope.
                self.chunk().code.truncate(count_before);
                rollback_lines(self.chunk(), count_before);
                self.comprehension(scanner_before, parser_before, "listOf", Self::single_inner);
            } else {
                let mut arg_count = 1;
                while self.match_token(TokenKind::Comma) && !self.check(TokenKind::RightSquare) {
                    self.expression();
                    arg_count += 1;
                }
                self.emit_operand_op(OpCode::Call, arg_count);
            }
        } else {
            self.emit_operand_op(OpCode::Call, 0);
        }
        self.stop_eating_whitespace();
        self.consume(
            TokenKind::RightSquare,
            "Expected ] at end of list expression.",
        );
    }

    /// `{}` literals: dicts, sets, and both kinds of comprehension.
    pub(crate) fn dict(&mut self, _can_assign: bool) {
        let count_before = self.chunk().count();
        self.start_eating_whitespace();

        let builder = self.synthetic_constant("dictOf");
        self.emit_operand_op(OpCode::GetGlobal, builder);

        if !self.check(TokenKind::RightBrace) {
            let scanner_before = self.scanner.tell();
            let parser_before = self.parser;

            self.expression();
            if self.check(TokenKind::Comma) || self.check(TokenKind::RightBrace) {
                // A set literal; restart with the set builder.
                self.scanner.rewind(scanner_before);
                self.parser = parser_before;
                self.chunk().code.truncate(count_before);
                rollback_lines(self.chunk(), count_before);
                let builder = self.synthetic_constant("setOf");
                self.emit_operand_op(OpCode::GetGlobal, builder);
                let mut arg_count = 0;
                loop {
                    self.expression();
                    arg_count += 1;
                    if !self.match_token(TokenKind::Comma) {
                        break;
                    }
                }
                self.emit_operand_op(OpCode::Call, arg_count);
            } else if self.match_token(TokenKind::For) {
                self.chunk().code.truncate(count_before);
                rollback_lines(self.chunk(), count_before);
                self.comprehension(scanner_before, parser_before, "setOf", Self::single_inner);
            } else {
                self.consume(TokenKind::Colon, "Expect colon after dict key.");
                self.expression();
                if self.match_token(TokenKind::For) {
                    self.chunk().code.truncate(count_before);
                    rollback_lines(self.chunk(), count_before);
                    self.comprehension(scanner_before, parser_before, "dictOf", Self::dict_inner);
                } else {
                    let mut arg_count = 2;
                    while self.match_token(TokenKind::Comma) && !self.check(TokenKind::RightBrace)
                    {
                        self.expression();
                        self.consume(TokenKind::Colon, "Expect colon after dict key.");
                        self.expression();
                        arg_count += 2;
                    }
                    self.emit_operand_op(OpCode::Call, arg_count);
                }
            }
        } else {
            self.emit_operand_op(OpCode::Call, 0);
        }
        self.stop_eating_whitespace();
        self.consume(
            TokenKind::RightBrace,
            "Expected } at end of dict expression.",
        );
    }

    fn single_inner(&mut self, _counter_slot: usize) {
        self.expression();
    }

    fn dict_inner(&mut self, counter_slot: usize) {
        self.expression();
        self.consume(TokenKind::Colon, "Expect colon after dict key.");
        self.expression();
        // Keys and values are separate stack entries; count the extra one.
        self.emit_operand_op(OpCode::Inc, counter_slot);
    }

    /// Compiles a comprehension as a synthetic function: iterate, evaluate
    /// the (re-parsed) head per element, count results on the stack, then
    /// call the collection builder over them.
    fn comprehension(
        &mut self,
        scanner_before: crate::scanner::ScannerState,
        parser_before: super::Parser,
        build_func: &'static str,
        inner: fn(&mut Self, usize),
    ) {
        self.push_state(FunctionType::Function, None);
        self.begin_scope();

        // Result counter.
        self.emit_constant(Value::Int(0));
        let counter_slot = self.state().locals.len();
        self.add_local(LocalName::Synthetic(""));
        self.mark_initialized();

        // Loop variables.
        let loop_var_slot = self.state().locals.len();
        let mut var_count = 0;
        loop {
            self.consume(TokenKind::Identifier, "Expected name for iteration variable.");
            let token = self.parser.previous;
            self.emit_op(OpCode::None);
            self.add_local_token(token);
            self.mark_initialized();
            var_count += 1;
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        self.consume(
            TokenKind::In,
            "Only iterator loops (for ... in ...) are allowed in comprehensions.",
        );

        self.parse_precedence(Precedence::Or);

        let iter_slot = self.state().locals.len();
        self.add_local(LocalName::Synthetic(""));
        self.mark_initialized();

        let iter_const = self.synthetic_constant("__iter__");
        self.emit_operand_op(OpCode::GetProperty, iter_const);
        self.emit_operand_op(OpCode::Call, 0);
        self.emit_operand_op(OpCode::SetLocal, iter_slot);

        let loop_start = self.chunk().count();

        self.emit_operand_op(OpCode::GetLocal, iter_slot);
        self.emit_operand_op(OpCode::Call, 0);
        self.emit_operand_op(OpCode::SetLocal, loop_var_slot);
        self.emit_operand_op(OpCode::GetLocal, iter_slot);
        self.emit_op(OpCode::Is);
        let exit_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);

        if var_count > 1 {
            self.emit_operand_op(OpCode::GetLocal, loop_var_slot);
            self.emit_operand_op(OpCode::Unpack, var_count);
            for i in (loop_var_slot..loop_var_slot + var_count).rev() {
                self.emit_operand_op(OpCode::SetLocal, i);
                self.emit_op(OpCode::Pop);
            }
        }

        if self.match_token(TokenKind::If) {
            self.parse_precedence(Precedence::Or);
            let accept_jump = self.emit_jump(OpCode::JumpIfTrue);
            self.emit_op(OpCode::Pop);
            self.emit_loop(loop_start);
            self.patch_jump(accept_jump);
            self.emit_op(OpCode::Pop);
        }

        // Now rewind and compile the head expression with the loop
        // variables in scope.
        let scanner_after = self.scanner.tell();
        let parser_after = self.parser;
        self.scanner.rewind(scanner_before);
        self.parser = parser_before;

        self.begin_scope();
        inner(self, counter_slot);
        self.end_scope();

        self.scanner.rewind(scanner_after);
        self.parser = parser_after;

        self.emit_operand_op(OpCode::Inc, counter_slot);
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let builder = self.synthetic_constant(build_func);
        self.emit_operand_op(OpCode::GetGlobal, builder);
        self.emit_operand_op(OpCode::SetLocal, iter_slot);
        self.emit_op(OpCode::Pop);
        self.emit_operand_op(OpCode::GetLocal, counter_slot);
        self.emit_op(OpCode::CallStack);
        self.emit_op(OpCode::Return);

        let (function, upvalues) = self.end_state();
        let constant = self.chunk().add_constant(Value::Ref(function));
        self.emit_operand_op(OpCode::Closure, constant);
        self.emit_upvalue_descriptors(upvalues);
        self.emit_operand_op(OpCode::Call, 0);
    }

    // ------------------------------------------------------------------
    // Lambdas
    // ------------------------------------------------------------------

    pub(crate) fn lambda(&mut self, _can_assign: bool) {
        self.push_state(FunctionType::Lambda, None);
        let name = self.vm.heap.intern("<lambda>");
        self.state_mut().function.name = Some(name);
        self.begin_scope();

        if !self.check(TokenKind::Colon) {
            loop {
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                self.state_mut().required_args += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::Colon, "expected : after lambda arguments");
        self.expression();

        let (function, upvalues) = self.end_state();
        let constant = self.chunk().add_constant(Value::Ref(function));
        self.emit_operand_op(OpCode::Closure, constant);
        self.emit_upvalue_descriptors(upvalues);
    }

    /// Value expected to be `Kwargs(0)` at run time marks unset parameters;
    /// compiled default prologues compare against it.
    pub(crate) fn emit_unset_sentinel(&mut self) {
        self.emit_constant(Value::Kwargs(KWARGS_UNSET));
    }
}
