use super::chunk::{Chunk, OpCode};
use super::object::{GcObject, ObjFunction};
use super::scanner::Scanner;
use super::token::{Token, TokenType};
use super::value::Value;
use super::vm::Vm;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    Script,
    Expression,
}

/// Compiles `source` into a top-level function. Returns `None` if any
/// diagnostic was reported; parsing still continues to the end of the file
/// so every error surfaces.
pub fn compile(
    source: &str,
    vm: &mut Vm,
    mode: CompileMode,
) -> Option<*mut GcObject<ObjFunction>> {
    let mut parser = Parser::new(source, vm);
    parser.begin_compiler(FunctionKind::Script);
    parser.advance();
    match mode {
        CompileMode::Script => {
            while !parser.matches(TokenType::Eof) {
                parser.declaration();
            }
        }
        CompileMode::Expression => {
            parser.expression();
            parser.consume(TokenType::Eof, "Expect end of expression.");
            parser.emit_op(OpCode::Print);
        }
    }
    let compiler = parser.end_compiler();
    let had_error = parser.had_error;
    parser.vm.heap.pop_root();
    if had_error {
        None
    } else {
        Some(compiler.function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
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
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'vm> = fn(&mut Parser<'src, 'vm>, bool);

#[derive(Clone, Copy)]
struct ParseRule<'src, 'vm> {
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

const UNINITIALIZED: i32 = -1;
const MAX_LOCALS: usize = 256;

struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. The chain of enclosing functions is an
/// explicit stack on the parser; the locals array mirrors the layout the
/// VM's value stack will have at runtime.
struct Compiler<'src> {
    function: *mut GcObject<ObjFunction>,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
}

struct ClassCompiler {
    has_superclass: bool,
}

struct Parser<'src, 'vm> {
    scanner: Scanner<'src>,
    vm: &'vm mut Vm,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    compilers: Vec<Compiler<'src>>,
    classes: Vec<ClassCompiler>,
    rules: [ParseRule<'src, 'vm>; TokenType::VARIANT_COUNT],
}

impl<'src, 'vm> Parser<'src, 'vm> {
    fn new(source: &'src str, vm: &'vm mut Vm) -> Self {
        let placeholder = Token::new(TokenType::Eof, "", 0);
        Self {
            scanner: Scanner::new(source),
            vm,
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            compilers: Vec::new(),
            classes: Vec::new(),
            rules: Self::build_rules(),
        }
    }

    fn build_rules() -> [ParseRule<'src, 'vm>; TokenType::VARIANT_COUNT] {
        let none = ParseRule {
            prefix: None,
            infix: None,
            precedence: Precedence::None,
        };
        let mut rules = [none; TokenType::VARIANT_COUNT];
        let mut rule = |typ: TokenType,
                        prefix: Option<ParseFn<'src, 'vm>>,
                        infix: Option<ParseFn<'src, 'vm>>,
                        precedence: Precedence| {
            rules[typ as usize] = ParseRule {
                prefix,
                infix,
                precedence,
            };
        };
        rule(
            TokenType::LeftParen,
            Some(Self::grouping),
            Some(Self::call),
            Precedence::Call,
        );
        rule(TokenType::Dot, None, Some(Self::dot), Precedence::Call);
        rule(
            TokenType::Minus,
            Some(Self::unary),
            Some(Self::binary),
            Precedence::Term,
        );
        rule(TokenType::Plus, None, Some(Self::binary), Precedence::Term);
        rule(TokenType::Slash, None, Some(Self::binary), Precedence::Factor);
        rule(TokenType::Star, None, Some(Self::binary), Precedence::Factor);
        rule(TokenType::Bang, Some(Self::unary), None, Precedence::None);
        rule(
            TokenType::BangEqual,
            None,
            Some(Self::binary),
            Precedence::Equality,
        );
        rule(
            TokenType::EqualEqual,
            None,
            Some(Self::binary),
            Precedence::Equality,
        );
        rule(
            TokenType::Greater,
            None,
            Some(Self::binary),
            Precedence::Comparison,
        );
        rule(
            TokenType::GreaterEqual,
            None,
            Some(Self::binary),
            Precedence::Comparison,
        );
        rule(
            TokenType::Less,
            None,
            Some(Self::binary),
            Precedence::Comparison,
        );
        rule(
            TokenType::LessEqual,
            None,
            Some(Self::binary),
            Precedence::Comparison,
        );
        rule(
            TokenType::Identifier,
            Some(Self::variable),
            None,
            Precedence::None,
        );
        rule(TokenType::String, Some(Self::string), None, Precedence::None);
        rule(TokenType::Number, Some(Self::number), None, Precedence::None);
        rule(TokenType::And, None, Some(Self::and_), Precedence::And);
        rule(TokenType::Or, None, Some(Self::or_), Precedence::Or);
        rule(TokenType::False, Some(Self::literal), None, Precedence::None);
        rule(TokenType::Nil, Some(Self::literal), None, Precedence::None);
        rule(TokenType::True, Some(Self::literal), None, Precedence::None);
        rule(TokenType::This, Some(Self::this_), None, Precedence::None);
        rule(TokenType::Super, Some(Self::super_), None, Precedence::None);
        rules
    }

    fn rule(&self, typ: TokenType) -> ParseRule<'src, 'vm> {
        self.rules[typ as usize]
    }

    // ---- token plumbing ----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.typ != TokenType::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, typ: TokenType, message: &str) {
        if self.current.typ != typ {
            self.error_at_current(message);
            return;
        }
        self.advance();
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if !self.check(typ) {
            return false;
        }
        self.advance();
        true
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        eprint!("[line {}] Error", token.line);
        match token.typ {
            TokenType::Eof => eprint!(" at end"),
            TokenType::Error => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", message);
        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.typ != TokenType::Eof {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            match self.current.typ {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- bytecode plumbing ----

    fn current_chunk(&mut self) -> &mut Chunk {
        let function = self.compilers.last().unwrap().function;
        unsafe { &mut (*function).data.chunk }
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_return(&mut self) {
        if self.compilers.last().unwrap().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(constant);
    }

    /// Emits a jump with a two-byte placeholder; returns the placeholder's
    /// offset for patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // adjust for the offset bytes themselves
        let jump = self.current_chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.current_chunk().code[offset] = (jump >> 8) as u8;
        self.current_chunk().code[offset + 1] = jump as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    // ---- compiler frames ----

    fn begin_compiler(&mut self, kind: FunctionKind) {
        let function = self.vm.new_function();
        // anchor the in-progress function: it is a GC root until it becomes
        // a constant of the enclosing chunk
        self.vm.heap.push_root(Value::from(function));
        if kind != FunctionKind::Script {
            let name = self.vm.copy_string(self.previous.lexeme);
            unsafe {
                (*function).data.name = name;
            }
        }
        // slot 0 belongs to the callee; methods and initializers expose it
        // as 'this'
        let slot_zero = if kind == FunctionKind::Function {
            Token::synthetic("")
        } else {
            Token::synthetic("this")
        };
        let mut locals = Vec::new();
        locals.push(Local {
            name: slot_zero,
            depth: 0,
            is_captured: false,
        });
        self.compilers.push(Compiler {
            function,
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        });
    }

    fn end_compiler(&mut self) -> Compiler<'src> {
        self.emit_return();
        let compiler = self.compilers.pop().unwrap();
        #[cfg(feature = "debug-bytecode")]
        if !self.had_error {
            unsafe {
                let function = &(*compiler.function).data;
                let name = if function.name.is_null() {
                    "<script>".to_string()
                } else {
                    (*function.name).data.chars.clone()
                };
                eprint!("{}", function.chunk.disassemble(&name));
            }
        }
        compiler
    }

    fn begin_scope(&mut self) {
        self.compilers.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compilers.last_mut().unwrap().scope_depth -= 1;
        loop {
            let (is_captured, done) = {
                let compiler = self.compilers.last().unwrap();
                match compiler.locals.last() {
                    Some(local) if local.depth > compiler.scope_depth => {
                        (local.is_captured, false)
                    }
                    _ => (false, true),
                }
            };
            if done {
                break;
            }
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.compilers.last_mut().unwrap().locals.pop();
        }
    }

    // ---- variables ----

    fn identifier_constant(&mut self, name: Token) -> u8 {
        let string = self.vm.copy_string(name.lexeme);
        self.make_constant(Value::from(string))
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &Token) -> Option<u8> {
        let mut found = None;
        {
            let compiler = &self.compilers[compiler_index];
            for (index, local) in compiler.locals.iter().enumerate().rev() {
                if local.name.lexeme == name.lexeme {
                    found = Some((index as u8, local.depth == UNINITIALIZED));
                    break;
                }
            }
        }
        match found {
            Some((index, uninitialized)) => {
                if uninitialized {
                    self.error("Can't read local variable in its own initializer.");
                }
                Some(index)
            }
            None => None,
        }
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: u8, is_local: bool) -> u8 {
        let count = self.compilers[compiler_index].upvalues.len();
        for i in 0..count {
            let upvalue = self.compilers[compiler_index].upvalues[i];
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }
        if count == MAX_LOCALS {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.compilers[compiler_index]
            .upvalues
            .push(CompilerUpvalue { index, is_local });
        let function = self.compilers[compiler_index].function;
        unsafe {
            (*function).data.upvalue_count = count + 1;
        }
        count as u8
    }

    /// Walks outward through the enclosing functions. A hit in a direct
    /// enclosing scope becomes a local upvalue there and a non-local link in
    /// every function in between, and the originating local is flagged so
    /// its scope exit closes it.
    fn resolve_upvalue(&mut self, compiler_index: usize, name: &Token) -> Option<u8> {
        if compiler_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(compiler_index - 1, name) {
            self.compilers[compiler_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(compiler_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(compiler_index - 1, name) {
            return Some(self.add_upvalue(compiler_index, upvalue, false));
        }
        None
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.compilers.last().unwrap().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.compilers.last_mut().unwrap().locals.push(Local {
            name,
            depth: UNINITIALIZED,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.compilers.last().unwrap().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let mut duplicate = false;
        {
            let compiler = self.compilers.last().unwrap();
            for local in compiler.locals.iter().rev() {
                if local.depth != UNINITIALIZED && local.depth < compiler.scope_depth {
                    break;
                }
                if local.name.lexeme == name.lexeme {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
        if self.compilers.last().unwrap().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous)
    }

    /// Promotes the newest local to the current depth. Until this runs the
    /// local is unreadable, which is what rejects `var a = a;`.
    fn mark_initialized(&mut self) {
        let compiler = self.compilers.last_mut().unwrap();
        if compiler.scope_depth == 0 {
            return;
        }
        let depth = compiler.scope_depth;
        compiler.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.compilers.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let top = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, &name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(top, &name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };
        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(arg);
        } else {
            self.emit_op(get_op);
            self.emit_byte(arg);
        }
    }

    // ---- expressions ----

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match self.rule(self.previous.typ).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);
        while precedence <= self.rule(self.current.typ).precedence {
            self.advance();
            if let Some(infix) = self.rule(self.previous.typ).infix {
                infix(self, can_assign);
            }
        }
        if can_assign && self.matches(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let string = self.vm.copy_string(contents);
        self.emit_constant(Value::from(string));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.typ {
            TokenType::Nil => self.emit_op(OpCode::Nil),
            TokenType::False => self.emit_op(OpCode::False),
            TokenType::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.typ;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenType::Minus => self.emit_op(OpCode::Negate),
            TokenType::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.typ;
        let precedence = self.rule(operator).precedence.next();
        self.parse_precedence(precedence);
        match operator {
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            TokenType::EqualEqual => self.emit_op(OpCode::Equal),
            TokenType::BangEqual => self.emit_op(OpCode::NotEqual),
            TokenType::Greater => self.emit_op(OpCode::Greater),
            TokenType::GreaterEqual => self.emit_op(OpCode::GreaterEqual),
            TokenType::Less => self.emit_op(OpCode::Less),
            TokenType::LessEqual => self.emit_op(OpCode::LessEqual),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        arg_count as u8
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous);
        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name);
        } else if self.matches(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(name);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
            return;
        }
        if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
            return;
        }
        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous);
        self.named_variable(Token::synthetic("this"), false);
        if self.matches(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(name);
        }
    }

    // ---- declarations and statements ----

    fn declaration(&mut self) {
        if self.matches(TokenType::Var) {
            self.var_declaration();
        } else if self.matches(TokenType::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenType::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // a function may refer to itself by name while its body compiles
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.begin_compiler(kind);
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                let function = self.compilers.last().unwrap().function;
                let arity = unsafe { (*function).data.arity };
                if arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    unsafe {
                        (*function).data.arity = arity + 1;
                    }
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();
        let compiler = self.end_compiler();
        let constant = self.make_constant(Value::from(compiler.function));
        self.emit_op(OpCode::Closure);
        self.emit_byte(constant);
        for upvalue in &compiler.upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
        // the function is now reachable through the enclosing chunk
        self.vm.heap.pop_root();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.identifier_constant(self.previous);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op(OpCode::Method);
        self.emit_byte(name);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(self.previous);
        self.declare_variable();
        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);
        self.classes.push(ClassCompiler {
            has_superclass: false,
        });
        if self.matches(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // the superclass lives in a hidden scope as the 'super' local so
            // methods can capture it
            self.begin_scope();
            self.add_local(Token::synthetic("super"));
            self.define_variable(0);
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }
        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);
        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn statement(&mut self) {
        if self.matches(TokenType::Print) {
            self.print_statement();
        } else if self.matches(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }
        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }
        if !self.matches(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }
        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.compilers.last().unwrap().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.compilers.last().unwrap().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjString;
    use std::io;

    fn test_vm() -> Vm {
        Vm::with_output(Box::new(io::sink()))
    }

    fn compile_ok(vm: &mut Vm, source: &str) -> *mut GcObject<ObjFunction> {
        compile(source, vm, CompileMode::Script).expect("expected compilation to succeed")
    }

    fn code(function: *mut GcObject<ObjFunction>) -> Vec<u8> {
        unsafe { (*function).data.chunk.code.clone() }
    }

    #[test]
    fn arithmetic_respects_precedence() {
        let mut vm = test_vm();
        let function = compile_ok(&mut vm, "1 + 2 * 3;");
        assert_eq!(
            code(function),
            vec![
                OpCode::Constant as u8,
                0,
                OpCode::Constant as u8,
                1,
                OpCode::Constant as u8,
                2,
                OpCode::Multiply as u8,
                OpCode::Add as u8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn block_locals_use_slots() {
        let mut vm = test_vm();
        let function = compile_ok(&mut vm, "{ var a = 1; print a; }");
        assert_eq!(
            code(function),
            vec![
                OpCode::Constant as u8,
                0,
                OpCode::GetLocal as u8,
                1,
                OpCode::Print as u8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn globals_go_through_the_constant_table() {
        let mut vm = test_vm();
        let function = compile_ok(&mut vm, "var answer = 42; print answer;");
        let bytes = code(function);
        assert_eq!(bytes[2], OpCode::DefineGlobal as u8);
        assert_eq!(bytes[4], OpCode::GetGlobal as u8);
    }

    #[test]
    fn every_instruction_has_a_line() {
        let mut vm = test_vm();
        let function = compile_ok(&mut vm, "var a = 1;\nprint a;\n");
        unsafe {
            let chunk = &(*function).data.chunk;
            assert_eq!(chunk.code.len(), chunk.lines.len());
            assert!(chunk.lines.contains(&1));
            assert!(chunk.lines.contains(&2));
        }
    }

    #[test]
    fn if_else_jumps_are_patched_forward() {
        let mut vm = test_vm();
        let function = compile_ok(&mut vm, "if (true) print 1; else print 2;");
        let bytes = code(function);
        let jump_if_false = bytes
            .iter()
            .position(|&b| b == OpCode::JumpIfFalse as u8)
            .unwrap();
        let offset = ((bytes[jump_if_false + 1] as usize) << 8) | bytes[jump_if_false + 2] as usize;
        let target = jump_if_false + 3 + offset;
        // lands on the POP before the else branch
        assert_eq!(bytes[target], OpCode::Pop as u8);
    }

    #[test]
    fn closures_record_their_captures() {
        let mut vm = test_vm();
        let function = compile_ok(
            &mut vm,
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let outer = unsafe {
            (*function)
                .data
                .chunk
                .constants
                .iter()
                .find(|c| c.kind() == Some(crate::object::ObjectKind::Function))
                .copied()
                .unwrap()
                .as_function()
        };
        let inner = unsafe {
            (*outer)
                .data
                .chunk
                .constants
                .iter()
                .find(|c| c.kind() == Some(crate::object::ObjectKind::Function))
                .copied()
                .unwrap()
                .as_function()
        };
        unsafe {
            assert_eq!((*inner).data.upvalue_count, 1);
            assert_eq!((*outer).data.upvalue_count, 0);
        }
        // the CLOSURE for inner is followed by an (is_local, index) pair
        let outer_code = unsafe { (*outer).data.chunk.code.clone() };
        let closure_at = outer_code
            .iter()
            .position(|&b| b == OpCode::Closure as u8)
            .unwrap();
        assert_eq!(outer_code[closure_at + 2], 1); // captures a local
        assert_eq!(outer_code[closure_at + 3], 1); // slot of x
    }

    #[test]
    fn expression_mode_prints_the_result() {
        let mut vm = test_vm();
        let function =
            compile("1 + 2", &mut vm, CompileMode::Expression).expect("expression compiles");
        let bytes = code(function);
        assert!(bytes.contains(&(OpCode::Print as u8)));
    }

    #[test]
    fn reading_a_local_in_its_own_initializer_fails() {
        let mut vm = test_vm();
        assert!(compile("{ var a = a; }", &mut vm, CompileMode::Script).is_none());
    }

    #[test]
    fn duplicate_local_names_fail() {
        let mut vm = test_vm();
        assert!(compile("{ var a = 1; var a = 2; }", &mut vm, CompileMode::Script).is_none());
    }

    #[test]
    fn invalid_assignment_target_fails() {
        let mut vm = test_vm();
        assert!(compile("1 + 2 = 3;", &mut vm, CompileMode::Script).is_none());
    }

    #[test]
    fn top_level_return_fails() {
        let mut vm = test_vm();
        assert!(compile("return 1;", &mut vm, CompileMode::Script).is_none());
    }

    #[test]
    fn initializer_cannot_return_a_value() {
        let mut vm = test_vm();
        assert!(compile(
            "class Point { init() { return 1; } }",
            &mut vm,
            CompileMode::Script
        )
        .is_none());
        assert!(compile(
            "class Point { init() { return; } }",
            &mut vm,
            CompileMode::Script
        )
        .is_some());
    }

    #[test]
    fn self_inheritance_fails() {
        let mut vm = test_vm();
        assert!(compile("class Loop < Loop {}", &mut vm, CompileMode::Script).is_none());
    }

    #[test]
    fn this_and_super_require_a_class() {
        let mut vm = test_vm();
        assert!(compile("print this;", &mut vm, CompileMode::Script).is_none());
        assert!(compile(
            "class Lone { f() { return super.f(); } }",
            &mut vm,
            CompileMode::Script
        )
        .is_none());
    }

    #[test]
    fn errors_recover_at_statement_boundaries() {
        let mut vm = test_vm();
        // both statements are bad; both should be reported, neither fatally
        assert!(compile("var; print 1 +;", &mut vm, CompileMode::Script).is_none());
    }

    #[test]
    fn identical_sources_produce_identical_bytecode() {
        let mut vm = test_vm();
        let first = code(compile_ok(&mut vm, "var a = 1; { var b = a; print b; }"));
        let second = code(compile_ok(&mut vm, "var a = 1; { var b = a; print b; }"));
        assert_eq!(first, second);
    }

    #[test]
    fn method_names_are_interned_once() {
        let mut vm = test_vm();
        let function = compile_ok(&mut vm, "class A { f() { return 1; } } var x = A().f;");
        let constants = unsafe { &(*function).data.chunk.constants };
        let f_names: Vec<*mut GcObject<ObjString>> = constants
            .iter()
            .filter(|c| c.is_string())
            .map(|c| c.as_string())
            .filter(|s| unsafe { (**s).data.chars == "f" })
            .collect();
        // two constant slots, one interned object
        assert_eq!(f_names.len(), 2);
        assert!(std::ptr::eq(f_names[0], f_names[1]));
    }
}
