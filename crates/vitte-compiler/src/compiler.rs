//! Single-pass Pratt parser that emits a [`Chunk`] directly — there is no
//! intermediate AST. Each nested function body compiles into its own
//! [`FunctionState`] (chunk + locals + upvalues); the stack of these states
//! stands in for clox's linked list of `Compiler` structs, since Rust's
//! borrow checker doesn't get along with a compiler holding a raw pointer
//! to its enclosing compiler. Resolving an upvalue walks this stack by
//! index instead of by following an `enclosing` pointer.

use std::fmt;

use vitte_core::bytecode::chunk::{Chunk, ChunkFlags, ConstValue};
use vitte_core::bytecode::ops::{Op, UpvalueDesc};

use crate::lexer::{Lexer, Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub messages: Vec<String>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.messages {
            writeln!(f, "{m}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    /// `-1` while the initializing expression is still being compiled, so a
    /// reference to the same name inside it resolves to an outer scope
    /// instead of this not-yet-ready slot.
    depth: i32,
    is_captured: bool,
}

struct FunctionState {
    kind: FunctionKind,
    name: String,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    scope_depth: i32,
    upvalues: Vec<UpvalueDesc>,
}

impl FunctionState {
    fn new(kind: FunctionKind, name: String) -> Self {
        // Slot 0 is reserved: the receiver for methods/initializers, or the
        // closure itself (unreachable from source) for plain functions.
        let slot0_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(ChunkFlags::default()),
            locals: vec![Local { name: slot0_name.to_string(), depth: 0, is_captured: false }],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

type ParseFn<'src> = fn(&mut Compiler<'src>, bool);

fn rule<'src>(kind: TokenKind) -> (Option<ParseFn<'src>>, Option<ParseFn<'src>>, Precedence) {
    use TokenKind::*;
    match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        Dot => (None, Some(Compiler::dot), Precedence::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Slash => (None, Some(Compiler::binary), Precedence::Factor),
        Star => (None, Some(Compiler::binary), Precedence::Factor),
        Bang => (Some(Compiler::unary), None, Precedence::None),
        BangEqual => (None, Some(Compiler::binary), Precedence::Equality),
        EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(Compiler::binary), Precedence::Comparison)
        }
        Identifier => (Some(Compiler::variable), None, Precedence::None),
        String => (Some(Compiler::string_lit), None, Precedence::None),
        Number => (Some(Compiler::number), None, Precedence::None),
        And => (None, Some(Compiler::and_), Precedence::And),
        Or => (None, Some(Compiler::or_), Precedence::Or),
        False | Nil | True => (Some(Compiler::literal), None, Precedence::None),
        Super => (Some(Compiler::super_), None, Precedence::None),
        This => (Some(Compiler::this_), None, Precedence::None),
        _ => (None, None, Precedence::None),
    }
}

/// Compiles `source` into a top-level function chunk, or collects every
/// `[line N] Error ...` diagnostic it can find along the way.
pub fn compile(source: &str) -> Result<Chunk, CompileError> {
    #[cfg(feature = "tracing")]
    let _span = tracing::debug_span!("compile", source_len = source.len()).entered();

    let mut compiler = Compiler::new(source);
    compiler.advance();
    while !compiler.match_tok(TokenKind::Eof) {
        compiler.declaration();
    }
    let chunk = compiler.finish_script();
    if compiler.had_error {
        Err(CompileError { messages: compiler.messages })
    } else {
        Ok(chunk)
    }
}

struct Compiler<'src> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    messages: Vec<String>,
    functions: Vec<FunctionState>,
    classes: Vec<ClassState>,
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str) -> Self {
        let placeholder = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Self {
            lexer: Lexer::new(source),
            previous: placeholder,
            current: placeholder,
            had_error: false,
            panic_mode: false,
            messages: Vec::new(),
            functions: vec![FunctionState::new(FunctionKind::Script, String::new())],
            classes: Vec::new(),
        }
    }

    // ---------------- token stream ----------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme;
            self.error_at_current(msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(msg);
        }
    }

    fn error_at(&mut self, token: Token<'src>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(target: "vitte-compiler", line = token.line, location = %location, msg, "compile diagnostic");
        self.messages.push(format!("[line {}] Error{}: {}", token.line, location, msg));
    }

    fn error(&mut self, msg: &str) {
        self.error_at(self.previous, msg);
    }

    fn error_at_current(&mut self, msg: &str) {
        self.error_at(self.current, msg);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---------------- function-state helpers ----------------

    fn current_fn(&self) -> &FunctionState {
        self.functions.last().expect("at least the script frame is always present")
    }

    fn current_fn_mut(&mut self) -> &mut FunctionState {
        self.functions.last_mut().expect("at least the script frame is always present")
    }

    fn emit(&mut self, op: Op) {
        let line = self.previous.line;
        self.current_fn_mut().chunk.push_op(op, line);
    }

    fn emit_jump(&mut self, make: fn(u32) -> Op) -> usize {
        self.emit(make(0));
        self.current_fn().chunk.ops.len() - 1
    }

    fn patch_jump(&mut self, ix: usize) {
        let target = self.current_fn().chunk.ops.len() as u32;
        match &mut self.current_fn_mut().chunk.ops[ix] {
            Op::Jump(t) | Op::JumpIfFalse(t) => *t = target,
            _ => unreachable!("patch_jump on a non-jump instruction"),
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit(Op::Loop(loop_start as u32));
    }

    fn emit_constant(&mut self, value: ConstValue) {
        let ix = self.current_fn_mut().chunk.add_const(value);
        self.emit(Op::Constant(ix));
    }

    fn emit_return(&mut self) {
        if matches!(self.current_fn().kind, FunctionKind::Initializer) {
            self.emit(Op::GetLocal(0));
        } else {
            self.emit(Op::Nil);
        }
        self.emit(Op::Return);
    }

    fn identifier_constant(&mut self, name: &str) -> u32 {
        self.current_fn_mut().chunk.add_const(ConstValue::Str(name.to_string()))
    }

    // ---------------- scopes and locals ----------------

    fn begin_scope(&mut self) {
        self.current_fn_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_fn_mut().scope_depth -= 1;
        let depth = self.current_fn().scope_depth;
        loop {
            let Some(last) = self.current_fn().locals.last() else { break };
            if last.depth <= depth {
                break;
            }
            if last.is_captured {
                self.emit(Op::CloseUpvalue);
            } else {
                self.emit(Op::Pop);
            }
            self.current_fn_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: String) {
        if self.current_fn().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_fn_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.to_string();
        let depth = self.current_fn().scope_depth;
        for i in (0..self.current_fn().locals.len()).rev() {
            let local = &self.current_fn().locals[i];
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                break;
            }
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let depth = self.current_fn().scope_depth;
        if let Some(l) = self.current_fn_mut().locals.last_mut() {
            l.depth = depth;
        }
    }

    fn parse_variable(&mut self, msg: &str) -> u32 {
        self.consume(TokenKind::Identifier, msg);
        self.declare_variable();
        if self.current_fn().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u32) {
        if self.current_fn().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(Op::DefineGlobal(global));
    }

    fn resolve_local(&mut self, fn_index: usize, name: &str) -> Option<u8> {
        let locals = &self.functions[fn_index].locals;
        for i in (0..locals.len()).rev() {
            if locals[i].name == name {
                if locals[i].depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, fn_index: usize, name: &str) -> Option<u8> {
        if fn_index == 0 {
            return None;
        }
        let enclosing = fn_index - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(fn_index, local_slot, true));
        }
        if let Some(up_slot) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(fn_index, up_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, fn_index: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &self.functions[fn_index].upvalues;
        for (i, u) in upvalues.iter().enumerate() {
            if u.index == index && u.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.functions[fn_index].upvalues.push(UpvalueDesc { is_local, index });
        (self.functions[fn_index].upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let fn_index = self.functions.len() - 1;
        let (get_op, set_op) = if let Some(slot) = self.resolve_local(fn_index, name) {
            (Op::GetLocal(slot), Op::SetLocal(slot))
        } else if let Some(slot) = self.resolve_upvalue(fn_index, name) {
            (Op::GetUpvalue(slot), Op::SetUpvalue(slot))
        } else {
            let ix = self.identifier_constant(name);
            (Op::GetGlobal(ix), Op::SetGlobal(ix))
        };
        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
    }

    // ---------------- declarations ----------------

    fn declaration(&mut self) {
        if self.match_tok(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_tok(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_tok(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.previous.lexeme.to_string();
        self.mark_initialized();
        self.function(FunctionKind::Function, &name);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name: &str) {
        self.functions.push(FunctionState::new(kind, name.to_string()));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current_fn().arity >= 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.current_fn_mut().arity += 1;
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        self.end_function();
    }

    fn end_function(&mut self) {
        self.emit_return();
        let finished = self.functions.pop().expect("function() always pushes a frame first");
        let name = finished.name;
        let arity = finished.arity;
        let upvalue_count = finished.upvalues.len() as u8;
        let const_ix = self.current_fn_mut().chunk.add_const(ConstValue::Function {
            name,
            arity,
            upvalue_count,
            chunk: Box::new(finished.chunk),
        });
        let line = self.previous.line;
        self.current_fn_mut().chunk.push_op(Op::Closure(const_ix, finished.upvalues), line);
    }

    fn finish_script(&mut self) -> Chunk {
        self.emit_return();
        self.functions.pop().expect("script frame is pushed by Compiler::new").chunk
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&class_name);
        self.declare_variable();
        self.emit(Op::Class(name_const));
        self.define_variable(name_const);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_tok(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.to_string();
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(&super_name, false);

            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit(Op::Inherit);
            self.classes.last_mut().expect("just pushed").has_superclass = true;
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit(Op::Pop);

        if self.classes.last().expect("just pushed").has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&name);
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, &name);
        self.emit(Op::Method(name_const));
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_tok(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(Op::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    // ---------------- statements ----------------

    fn statement(&mut self) {
        if self.match_tok(TokenKind::Print) {
            self.print_statement();
        } else if self.match_tok(TokenKind::For) {
            self.for_statement();
        } else if self.match_tok(TokenKind::If) {
            self.if_statement();
        } else if self.match_tok(TokenKind::Return) {
            self.return_statement();
        } else if self.match_tok(TokenKind::While) {
            self.while_statement();
        } else if self.match_tok(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.statement();

        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);
        self.emit(Op::Pop);

        if self.match_tok(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_fn().chunk.ops.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Op::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_tok(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.match_tok(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_fn().chunk.ops.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_tok(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit(Op::Pop);
        }

        if !self.match_tok(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.current_fn().chunk.ops.len();
            self.expression();
            self.emit(Op::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(ej) = exit_jump {
            self.patch_jump(ej);
            self.emit(Op::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if matches!(self.current_fn().kind, FunctionKind::Script) {
            self.error("Can't return from top-level code.");
        }
        if self.match_tok(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if matches!(self.current_fn().kind, FunctionKind::Initializer) {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(Op::Return);
        }
    }

    // ---------------- expressions ----------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        match rule(self.previous.kind).0 {
            Some(prefix) => prefix(self, can_assign),
            None => {
                self.error("Expect expression.");
                return;
            }
        }

        while precedence <= rule(self.current.kind).2 {
            self.advance();
            let infix = rule(self.previous.kind)
                .1
                .expect("every token reachable as an infix operator has an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_tok(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Bang => self.emit(Op::Not),
            TokenKind::Minus => self.emit(Op::Negate),
            _ => unreachable!("unary rule only registered for ! and -"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let next_prec = rule(op_kind).2.next();
        self.parse_precedence(next_prec);
        match op_kind {
            TokenKind::BangEqual => {
                self.emit(Op::Equal);
                self.emit(Op::Not);
            }
            TokenKind::EqualEqual => self.emit(Op::Equal),
            TokenKind::Greater => self.emit(Op::Greater),
            TokenKind::GreaterEqual => {
                self.emit(Op::Less);
                self.emit(Op::Not);
            }
            TokenKind::Less => self.emit(Op::Less),
            TokenKind::LessEqual => {
                self.emit(Op::Greater);
                self.emit(Op::Not);
            }
            TokenKind::Plus => self.emit(Op::Add),
            TokenKind::Minus => self.emit(Op::Subtract),
            TokenKind::Star => self.emit(Op::Multiply),
            TokenKind::Slash => self.emit(Op::Divide),
            _ => unreachable!("binary rule only registered for the operators matched above"),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit(Op::Call(argc));
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&name);
        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            self.emit(Op::SetProperty(name_const));
        } else if self.match_tok(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit(Op::Invoke(name_const, argc));
        } else {
            self.emit(Op::GetProperty(name_const));
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argc += 1;
                }
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 =
            self.previous.lexeme.parse().expect("lexer only ever emits well-formed numerals");
        self.emit_constant(ConstValue::Number(value));
    }

    fn string_lit(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let s = &lexeme[1..lexeme.len() - 1];
        self.emit_constant(ConstValue::Str(s.to_string()));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit(Op::False),
            TokenKind::Nil => self.emit(Op::Nil),
            TokenKind::True => self.emit(Op::True),
            _ => unreachable!("literal rule only registered for false/nil/true"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().expect("checked non-empty above").has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&name);
        self.named_variable("this", false);
        if self.match_tok(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit(Op::SuperInvoke(name_const, argc));
        } else {
            self.named_variable("super", false);
            self.emit(Op::GetSuper(name_const));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(src: &str) -> Vec<Op> {
        compile(src).expect("source compiles").ops
    }

    #[test]
    fn arithmetic_precedence_emits_multiply_before_add() {
        let ops = ops("1 + 2 * 3;");
        assert!(ops.contains(&Op::Multiply));
        assert!(ops.contains(&Op::Add));
        let mul_pos = ops.iter().position(|o| *o == Op::Multiply).unwrap();
        let add_pos = ops.iter().position(|o| *o == Op::Add).unwrap();
        assert!(mul_pos < add_pos, "* must be emitted before + given precedence climbing");
    }

    #[test]
    fn undefined_variable_is_not_a_compile_error() {
        // resolving globals happens at runtime, not compile time.
        assert!(compile("print nope;").is_ok());
    }

    #[test]
    fn reports_missing_semicolon() {
        let err = compile("print 1").unwrap_err();
        assert!(err.messages[0].contains("Expect ';'"));
    }

    #[test]
    fn return_at_top_level_is_an_error() {
        let err = compile("return 1;").unwrap_err();
        assert!(err.messages.iter().any(|m| m.contains("Can't return from top-level code.")));
    }

    #[test]
    fn this_outside_class_is_an_error() {
        let err = compile("fun f() { return this; }").unwrap_err();
        assert!(err.messages.iter().any(|m| m.contains("'this' outside of a class")));
    }

    #[test]
    fn closure_emits_upvalue_descriptors() {
        let chunk = compile("fun outer(){var x=1; fun inner(){return x;} return inner;}").unwrap();
        let has_closure_with_upvalue = chunk.consts.iter().any(|c| {
            matches!(c, ConstValue::Function { chunk: inner, .. }
                if inner.ops.iter().any(|op| matches!(op, Op::Closure(_, ups) if !ups.is_empty())))
        });
        assert!(has_closure_with_upvalue);
    }

    #[test]
    fn class_with_superclass_emits_inherit() {
        let chunk = compile("class A{} class B < A{}").unwrap();
        assert!(chunk.ops.contains(&Op::Inherit));
    }

    #[test]
    fn multiline_class_hierarchy_compiles_and_methods_resolve() {
        let src = indoc::indoc! {"
            class Animal {
                speak() {
                    return \"...\";
                }
            }

            class Dog < Animal {
                speak() {
                    super.speak();
                    return \"Woof\";
                }
            }
        "};
        let chunk = compile(src).expect("multiline source compiles");
        assert!(chunk.ops.contains(&Op::Class(0)));
        assert!(chunk.ops.contains(&Op::Inherit));
        assert!(chunk.ops.iter().any(|op| matches!(op, Op::SuperInvoke(_, _))));
    }
}
