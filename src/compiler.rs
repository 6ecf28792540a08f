//! Contains the Lox parser and bytecode compiler.
use std::rc::Rc;

use crate::chunk::{Chunk, OpCode, WrittenOpcode, MAX_JUMP};
use crate::error::CompileError;
use crate::gc::ActiveGC;
use crate::scanner::{Lexeme, Scanner, Token};
use crate::value::{self, Function, Value};

/////////////////////////////////////////// Public API ////////////////////////////////////////////

/// Compiles the given Lox source code and, if successful, returns the top-level script
/// [Function]. An [ActiveGC] is required because string literals and identifier names are
/// allocated and owned by the GC.
///
/// `debug_level` gates the diagnostic hook described at the top of this module: 0 is silent, 1
/// disassembles each finished function, 2 also streams token kinds, 3 also traces scope
/// operations.
pub fn compile(
    source: &str,
    gc: &ActiveGC,
    debug_level: u8,
) -> std::result::Result<Rc<Function>, CompileError> {
    let parser = Parser::new(source, gc, debug_level);
    let compiler = Compiler::new(parser);
    compiler.compile()
}

///////////////////////////////////// Implementation details //////////////////////////////////////

const U8_COUNT: usize = u8::MAX as usize + 1;

/// Contains the compiler state: the shared [Parser] plus a stack of per-function
/// [CompilerState]s. The top of the stack is the function currently being built; compiling a
/// nested `fun` pushes a new state, and `end_compiler` pops it back off once the function body is
/// fully parsed.
struct Compiler<'a> {
    parser: Parser<'a>,
    states: Vec<CompilerState<'a>>,
}

/// State belonging to one function's compilation: the [Function] under construction, its locals,
/// and the scope depth they're declared at. `function_type` distinguishes the implicit top-level
/// script from a real `fun` so `return` at the top level can be rejected.
struct CompilerState<'a> {
    function: Function,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    scope_depth: isize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
}

#[derive(Clone, Copy)]
struct Local<'a> {
    name: Lexeme<'a>,
    /// `-1` while the initializer is still being compiled, else the scope depth it was declared
    /// at.
    depth: isize,
}

/// Contains the parser state. For some strange reason, this also includes error status.
///
/// The reference to [ActiveGC] is required so that string literals and identifier constants can
/// be interned for the lifetime of the compile call.
struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Lexeme<'a>,
    previous: Lexeme<'a>,
    had_error: bool,
    panic_mode: bool,
    debug_level: u8,
    active_gc: &'a ActiveGC,
}

/// A rule in the Pratt parser table. See [Compiler::parse_precedence()] for usage.
#[derive(Copy, Clone)]
struct ParserRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

/// Any possible action taken from the parsing table. Actions take the entire compiler state, and
/// convert it, usually emitting bytecode.
type ParserFn = fn(&mut Compiler, bool);

/// Precedence rules for [Token]s in Lox.
///
/// Precedence rules have a well-defined partial ordering ([PartialOrd]), which is required for use
/// in the Pratt parsing algorithm.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq)]
enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// + -
    Term,
    /// `*` `/`
    Factor,
    /// `!` `-`
    Unary,
    /// `.` `()`
    Call,
    /// Literals, and groupings
    Primary,
}

///////////////////////////////////////// Implementations /////////////////////////////////////////

impl Precedence {
    /// Returns the next higher level of precedence.
    ///
    /// # Panics
    ///
    /// Panics if trying to obtain a higher-level of precedence than the maximum,
    /// [Precedence::Primary], which is the precedence of literals and l-values.
    #[inline]
    fn higher_precedence(self) -> Precedence {
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
            Call => Primary,
            Primary => panic!("Tried to get higher precedence than primary"),
        }
    }
}

impl ParserRule {
    /// Returns one level of precedence higher than the rule's precedence.
    /// See [Precedence::higher_precedence()].
    #[inline(always)]
    fn higher_precedence(&self) -> Precedence {
        self.precedence.higher_precedence()
    }
}

impl<'a> Parser<'a> {
    /// Creates a new parser for the given source code. `advance()` must be called once before
    /// the first token is available in `current`.
    fn new(source: &'a str, active_gc: &'a ActiveGC, debug_level: u8) -> Parser<'a> {
        let sentinel = Lexeme::synthetic("<before first token>");

        Parser {
            scanner: Scanner::new(source),
            previous: sentinel,
            current: sentinel,
            had_error: false,
            panic_mode: false,
            debug_level,
            active_gc,
        }
    }

    /// The active GC, kept alive for the whole compile call so string constants can be interned.
    #[inline(always)]
    fn gc(&self) -> &'a ActiveGC {
        self.active_gc
    }

    /// Update self.previous and self.current such that they move one token further in the token
    /// stream.
    fn advance(&mut self) {
        self.previous = self.current;

        // Get tokens until we get a non-error token.
        loop {
            self.current = self.scanner.scan_token();

            if self.debug_level >= 2 {
                eprintln!("{:?}", self.current.token());
            }

            if self.current.token() != Token::Error {
                break;
            }

            self.error_at_current(self.current.text())
        }
    }

    /// Scan the next token. If the token is not of the desired type, an error message is printed.
    fn consume(&mut self, desired_token: Token, message: &'static str) {
        if self.current.token() == desired_token {
            return self.advance();
        }

        self.error_at_current(message);
    }

    /// Return true if the current token is equal to the given token.
    fn check(&self, token: Token) -> bool {
        self.current.token() == token
    }

    /// Scan the next token. Advances if the token matches `desired_token`. Returns whether
    /// `desired_token` was matched.
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        if self.check(desired_token) {
            self.advance();
            return true;
        }
        false
    }

    /// Emit a compiler error, located at the previous [Lexeme]. In Pratt parsing, this is the
    /// handler you usually want to call, because the previous lexeme decided which [ParserRule]
    /// was accepted.
    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message)
    }

    /// Emit a compiler error, located at the current [Lexeme].
    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message)
    }

    /// Emit a compiler error, located at the given [Lexeme].
    fn error_at(&mut self, lexeme: Lexeme<'a>, message: &str) {
        // *Attempt* to prevent a deluge of spurious syntax errors:
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        self.had_error = true;

        // Print the actual message:
        eprint!("[line {}] Error", lexeme.line());
        if lexeme.token() == Token::Eof {
            eprint!(" at end");
        } else if lexeme.token() == Token::Error {
            // Nothing
        } else {
            eprint!(" at '{}'", lexeme.text());
        }
        eprintln!(": {message}");
    }

    /// Synchronize after being in panic mode.
    ///
    /// The heuristic is that we're going to gobble up and discard tokens until we **think** we're
    /// at a point that makes sense in the grammar. Points that make sense in a grammar are the
    /// start of statements (statement boundaries). We could be wrong!
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.token() != Token::Eof {
            if self.previous.token() == Token::Semicolon {
                return;
            }

            match self.current.token() {
                Token::Class
                | Token::Fun
                | Token::Var
                | Token::For
                | Token::If
                | Token::While
                | Token::Print
                | Token::Return => return,
                _ => (), // continue panicing
            }

            self.advance();
        }
    }
}

impl<'a> Compiler<'a> {
    /// Creates a new compiler with the given [Parser], bootstrapping the top-level script
    /// function's [CompilerState].
    fn new(parser: Parser<'a>) -> Compiler<'a> {
        let mut compiler = Compiler {
            parser,
            states: Vec::new(),
        };
        compiler.push_compiler_state(FunctionType::Script, None);
        compiler
    }

    /// Takes ownership of the compiler, and returns the top-level script [Function].
    fn compile(mut self) -> std::result::Result<Rc<Function>, CompileError> {
        if self.parser.debug_level >= 2 {
            eprintln!("== tokens ==");
        }

        self.advance();
        while !self.match_and_advance(Token::Eof) {
            self.declaration();
        }

        let function = self.end_compiler();

        if self.parser.had_error {
            return Err(CompileError);
        }

        Ok(Rc::new(function))
    }

    /// Push a new per-function [CompilerState], reserving slot 0 for "the function itself".
    fn push_compiler_state(&mut self, function_type: FunctionType, name: Option<&'static str>) {
        let mut locals = Vec::with_capacity(U8_COUNT);
        locals.push(Local {
            name: Lexeme::synthetic(""),
            depth: 0,
        });

        self.states.push(CompilerState {
            function: Function::new(name),
            function_type,
            locals,
            scope_depth: 0,
        });
    }

    /// Pops the innermost [CompilerState], emits the implicit `nil; return;`, and (at
    /// `debug_level >= 1`) disassembles the finished chunk.
    fn end_compiler(&mut self) -> Function {
        self.emit_return();

        let state = self.states.pop().expect("compiler state stack underflow");

        if self.parser.debug_level >= 1 && !self.parser.had_error {
            crate::debug::disassemble_chunk(&state.function.chunk, state.function.display_name());
        }

        state.function
    }

    /// Create a new block scope. Make sure to decrement it later.
    fn begin_scope(&mut self) {
        self.current_state_mut().scope_depth += 1;
    }

    /// Pop one scope from the block.
    fn end_scope(&mut self) {
        let scope_depth = self.current_state_mut().scope_depth - 1;
        self.current_state_mut().scope_depth = scope_depth;

        while self.has_locals_beyond_current_scope() {
            // The compile-time vector of locals will parallel the runtime stack;
            // so we both pop the compiler's stack AND the runtime stack!
            self.current_state_mut().locals.pop();
            self.emit_instruction(OpCode::Pop);
        }
    }

    /// Returns true if there is a local variable at a scope that is no longer accessible.
    fn has_locals_beyond_current_scope(&self) -> bool {
        let state = self.current_state();
        state
            .locals
            .last()
            .map(|local| local.depth > state.scope_depth)
            .unwrap_or(false)
    }

    /// The core of the Pratt parsing algorithm.
    ///
    /// See: <https://en.wikipedia.org/wiki/Operator-precedence_parser#Pratt_parsing>
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;

        // First, figure out how to parse the prefix.
        if let Some(prefix_rule) = self.rule_from_previous().prefix {
            prefix_rule(self, can_assign);
        } else {
            self.parser.error("Expect expression.");
            return;
        }

        while precedence <= self.rule_from_current().precedence {
            // current is now previous:
            self.advance();
            let infix_rule = self
                .rule_from_previous()
                .infix
                .expect("a rule with a defined precedence must always have an infix rule");

            infix_rule(self, can_assign);
        }

        if can_assign && self.match_and_advance(Token::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    /// Add the identifier text to the current chunk's constants table, interning its text.
    fn identifier_constant(&mut self, lexeme: Lexeme) -> u8 {
        let interned = value::intern(lexeme.text(), self.parser.gc());
        self.make_constant(interned)
    }

    /// Finds the slot for a local in the *current* function's locals, or `None` if it's not a
    /// local (either a global or a mistake).
    fn resolve_local(&mut self, name: Lexeme) -> Option<u8> {
        if self.parser.debug_level >= 3 {
            eprintln!("  resolve_local");
        }

        let found = self
            .current_state()
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name.text() == name.text())
            .map(|(i, local)| (i, local.depth == -1));

        if let Some((i, uninitialized)) = found {
            if uninitialized {
                self.parser
                    .error("Cannot read local variable in its own initializer.");
            }
            return u8::try_from(i).ok();
        }

        None
    }

    /// Indicate that we need a slot for another local variable.
    fn declare_variable(&mut self) {
        if self.parser.debug_level >= 3 {
            eprintln!("  declare_variable");
        }

        let scope_depth = self.current_state().scope_depth;
        if scope_depth == 0 {
            // Global variables don't need to be "declared"
            return;
        }

        let name = self.parser.previous;

        let collision = self
            .current_state()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth == -1 || local.depth >= scope_depth)
            .any(|local| local.name.text() == name.text());

        if collision {
            self.parser
                .error("Variable with this name already declared in this scope.");
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: Lexeme<'a>) {
        if self.parser.debug_level >= 3 {
            eprintln!("  add_local");
        }

        if self.current_state().locals.len() >= U8_COUNT {
            self.parser
                .error("Too many local variables in function.");
            return;
        }

        self.current_state_mut().locals.push(Local { name, depth: -1 });
    }

    /// Consume the next identifer and interpret it as a variable.
    /// Returns the constant index for the identifier name (unused when it's a local).
    fn parse_variable(&mut self, error_message: &'static str) -> u8 {
        self.parser.consume(Token::Identifier, error_message);

        self.declare_variable();
        if self.current_state().scope_depth > 0 {
            // In a local scope.
            return 0;
        }

        self.identifier_constant(self.parser.previous)
    }

    /// Mark the last local as being initialized.
    fn mark_initialized(&mut self) {
        if self.parser.debug_level >= 3 {
            eprintln!("  mark_initialized");
        }

        let state = self.current_state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        state
            .locals
            .last_mut()
            .expect("mark_initialized called with no locals declared")
            .depth = depth;
    }

    /// Define a new variable.
    fn define_variable(&mut self, global: u8) {
        if self.parser.debug_level >= 3 {
            eprintln!("  define_variable");
        }

        if self.current_state().scope_depth > 0 {
            // It's a local variable. Set that it's ready to be used:
            self.mark_initialized();
            return;
        }

        self.emit_instruction(OpCode::DefineGlobal)
            .with_operand(global);
    }

    /// Parse a variable. This could either be a variable access or an assignment, depending on
    /// `can_assign` and the syntactic context.
    fn named_variable(&mut self, name: Lexeme, can_assign: bool) {
        let (get_op, set_op, arg) = {
            if let Some(arg) = self.resolve_local(name) {
                (OpCode::GetLocal, OpCode::SetLocal, arg)
            } else {
                let arg = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, arg)
            }
        };

        // Peek ahead and look if we're assigning.
        // This only works if we're parsing at a lower or equal precedence to assignment.
        if can_assign && self.match_and_advance(Token::Equal) {
            // We're in an assignment expression!
            self.expression();
            self.emit_instruction(set_op).with_operand(arg);
        } else {
            // A reference to an existing variable.
            self.emit_instruction(get_op).with_operand(arg);
        }
    }

    /// Parse a declaration.
    fn declaration(&mut self) {
        if self.match_and_advance(Token::Fun) {
            self.fun_declaration();
        } else if self.match_and_advance(Token::Var) {
            self.var_statement();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    /// Parse a statement.
    fn statement(&mut self) {
        if self.match_and_advance(Token::Print) {
            self.print_statement();
        } else if self.match_and_advance(Token::For) {
            self.for_statement();
        } else if self.match_and_advance(Token::If) {
            self.if_statement();
        } else if self.match_and_advance(Token::Return) {
            self.return_statement();
        } else if self.match_and_advance(Token::While) {
            self.while_statement();
        } else if self.match_and_advance(Token::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    /// Parse an expression.
    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Parse a block.
    /// Assumes a new scope has already been created for this block.
    fn block(&mut self) {
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.declaration();
        }

        self.parser
            .consume(Token::RightBrace, "Expect '}' after block.");
    }

    /// Parse a `fun` declaration. Assumes `fun` has already been consumed.
    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Mark the function's own name initialized before compiling the body, so it can recurse.
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    /// Compile a function's parameter list and body, then embed the completed [Function] as a
    /// constant in the *enclosing* chunk.
    fn function(&mut self, function_type: FunctionType) {
        let name = value::intern(self.parser.previous.text(), self.parser.gc());
        let name = match name {
            Value::String(s) => s,
            _ => unreachable!("intern always returns Value::String"),
        };

        self.push_compiler_state(function_type, Some(name));
        self.begin_scope();

        self.parser
            .consume(Token::LeftParen, "Expect '(' after function name.");

        if !self.parser.check(Token::RightParen) {
            loop {
                let too_many = self.current_state().function.arity >= 255;
                if too_many {
                    self.parser
                        .error_at_current("Cannot have more than 255 parameters.");
                } else {
                    self.current_state_mut().function.arity += 1;
                }

                let param_constant = self.parse_variable("Expect parameter name.");
                self.define_variable(param_constant);

                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }

        self.parser
            .consume(Token::RightParen, "Expect ')' after parameters.");
        self.parser
            .consume(Token::LeftBrace, "Expect '{' before function body.");
        self.block();

        let function = self.end_compiler();
        let index = self.make_constant(Rc::new(function).into());
        self.emit_instruction(OpCode::Constant).with_operand(index);
    }

    /// Parse comma-separated call arguments. Returns the argument count.
    fn argument_list(&mut self) -> usize {
        let mut arg_count = 0;

        if !self.parser.check(Token::RightParen) {
            loop {
                self.expression();

                if arg_count == 255 {
                    self.parser.error("Cannot have more than 255 arguments.");
                }
                arg_count += 1;

                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }

        self.parser
            .consume(Token::RightParen, "Expect ')' after arguments.");
        arg_count
    }

    /// Parse a variable declaration. Assumes `var` has already been consumed.
    fn var_statement(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_and_advance(Token::Equal) {
            self.expression();
        } else {
            self.emit_instruction(OpCode::Nil);
        }

        self.parser
            .consume(Token::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    /// Parse an expression statement (e.g., assignments, function calls).
    fn expression_statement(&mut self) {
        self.expression();
        self.parser
            .consume(Token::Semicolon, "Expect ';' after expression.");
        // Expressions have 0 stack effect, meaning they can't leave anything on the stack.
        self.emit_instruction(OpCode::Pop);
    }

    /// Parse a print statement. Assumes `print` has already been consumed.
    fn print_statement(&mut self) {
        self.expression();
        self.parser
            .consume(Token::Semicolon, "Expect ';' after value.");
        self.emit_instruction(OpCode::Print);
    }

    /// Parse an `if` statement. Assumes `if` has already been consumed.
    fn if_statement(&mut self) {
        self.parser.consume(Token::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_instruction(OpCode::Pop);

        if self.match_and_advance(Token::Else) {
            self.statement();
        }

        self.patch_jump(else_jump);
    }

    /// Parse a `while` statement. Assumes `while` has already been consumed.
    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();

        self.parser
            .consume(Token::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_instruction(OpCode::Pop);
    }

    /// Parse a `for` statement. Assumes `for` has already been consumed. Desugars entirely to
    /// jumps and loops; there is no dedicated `OP_FOR` instruction.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.parser.consume(Token::LeftParen, "Expect '(' after 'for'.");

        if self.match_and_advance(Token::Semicolon) {
            // No initializer.
        } else if self.match_and_advance(Token::Var) {
            self.var_statement();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;

        if !self.match_and_advance(Token::Semicolon) {
            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_instruction(OpCode::Pop);
        }

        if !self.match_and_advance(Token::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();

            self.expression();
            self.emit_instruction(OpCode::Pop);
            self.parser
                .consume(Token::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_instruction(OpCode::Pop);
        }

        self.end_scope();
    }

    /// Parse a `return` statement. Assumes `return` has already been consumed.
    fn return_statement(&mut self) {
        if self.current_state().function_type == FunctionType::Script {
            self.parser.error("Cannot return from top-level code.");
        }

        if self.match_and_advance(Token::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expect ';' after return value.");
            self.emit_instruction(OpCode::Return);
        }
    }

    /// Appends the implicit `nil; return;` pair used both at the end of every function and by a
    /// bare `return;`.
    fn emit_return(&mut self) {
        self.emit_instruction(OpCode::Nil);
        self.emit_instruction(OpCode::Return);
    }

    /// Appends [OpCode::Constant] to current [Chunk], using the current value.
    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_instruction(OpCode::Constant).with_operand(index);
    }

    /// Appends a new constant to the current [Chunk].
    ///
    /// # Error
    ///
    /// When the constant pool already holds 256 entries, this signals a compiler error and
    /// returns `0u8`. The current [Chunk] can still be appended to, however, it is invalid, and
    /// should not be emitted as a valid program.
    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().add_constant(value) {
            index
        } else {
            self.parser.error("Too many constants in one chunk.");
            0
        }
    }

    /// Writes an [OpCode] to the current [Chunk].
    /// Returns a [WrittenOpcode], with which you can write an operand.
    fn emit_instruction(&mut self, opcode: OpCode) -> WrittenOpcode {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(opcode, line)
    }

    /// Emits a jump instruction with a placeholder 2-byte big-endian offset, returning the offset
    /// of the placeholder's first byte so it can be patched once the target is known.
    fn emit_jump(&mut self, opcode: OpCode) -> usize {
        let line = self.line_number_of_prefix();
        self.emit_instruction(opcode).with_operand(0xff);
        self.current_chunk().write_byte(0xff, line);
        self.current_chunk().len() - 2
    }

    /// Patches a previously-emitted jump placeholder to land at the current bytecode offset.
    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().len() - offset - 2;

        if jump > MAX_JUMP {
            self.parser.error("Too much code to jump over.");
        }

        self.current_chunk()
            .patch_byte(offset, ((jump >> 8) & 0xff) as u8);
        self.current_chunk().patch_byte(offset + 1, (jump & 0xff) as u8);
    }

    /// Emits `OP_LOOP`, a backward jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_instruction(OpCode::Loop);

        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > MAX_JUMP {
            self.parser.error("Loop body too large.");
        }

        let line = self.line_number_of_prefix();
        self.current_chunk()
            .write_byte(((offset >> 8) & 0xff) as u8, line);
        self.current_chunk().write_byte((offset & 0xff) as u8, line);
    }

    ///////////////////////////////////////// Aliases /////////////////////////////////////////////

    /// Returns the innermost (currently active) [CompilerState].
    #[inline(always)]
    fn current_state(&self) -> &CompilerState<'a> {
        self.states.last().expect("compiler state stack is empty")
    }

    /// Returns the innermost (currently active) [CompilerState], mutably.
    #[inline(always)]
    fn current_state_mut(&mut self) -> &mut CompilerState<'a> {
        self.states.last_mut().expect("compiler state stack is empty")
    }

    /// Returns the current [Chunk].
    #[inline(always)]
    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_state_mut().function.chunk
    }

    /// Advance one token in scanner, such that:
    /// ```text
    /// (previous, current) = (current, scanner.next_token())
    /// ```
    #[inline(always)]
    fn advance(&mut self) {
        self.parser.advance()
    }

    /// Returns the line number of the prefix token, a.k.a., `self.parser.previous`.
    #[inline(always)]
    fn line_number_of_prefix(&self) -> usize {
        self.parser.previous.line()
    }

    /// Delegates to [Parser::match_and_advance]. Returns true if the token was matched.
    #[inline(always)]
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        self.parser.match_and_advance(desired_token)
    }

    /// Returns the rule for the token of the prefix in the process of being parsed.
    #[inline(always)]
    fn rule_from_previous(&self) -> ParserRule {
        get_rule(self.previous_token())
    }

    /// Returns the rule for the current (lookahead) token.
    #[inline(always)]
    fn rule_from_current(&self) -> ParserRule {
        get_rule(self.parser.current.token())
    }

    /// Return the token (type) of the previous value. This is useful in prefix parser functions.
    #[inline(always)]
    fn previous_token(&self) -> Token {
        self.parser.previous.token()
    }
}

////////////////////////////////////////// Parser rules ///////////////////////////////////////////

/// Makes defining [ParserRule]s a bit cleaner looking.
macro_rules! rule {
    ($prefix:expr, $infix:expr, $precedence:expr) => {
        ParserRule {
            prefix: $prefix,
            infix: $infix,
            precedence: $precedence,
        }
    };
}

static RULES: once_cell::sync::Lazy<enum_map::EnumMap<Token, ParserRule>> =
    once_cell::sync::Lazy::new(build_rules);

#[rustfmt::skip]
fn build_rules() -> enum_map::EnumMap<Token, ParserRule> {
    use Token::*;
    enum_map::enum_map! {
        //                     Prefix          Infix         Precedence
        LeftParen    => rule!{ Some(grouping), Some(call),   Precedence::Call },
        RightParen   => rule!{ None,           None,         Precedence::None },
        LeftBrace    => rule!{ None,           None,         Precedence::None },
        RightBrace   => rule!{ None,           None,         Precedence::None },
        Comma        => rule!{ None,           None,         Precedence::None },
        Dot          => rule!{ None,           None,         Precedence::None },
        Minus        => rule!{ Some(unary),    Some(binary), Precedence::Term },
        Plus         => rule!{ None,           Some(binary), Precedence::Term },
        Semicolon    => rule!{ None,           None,         Precedence::None },
        Star         => rule!{ None,           Some(binary), Precedence::Factor },
        Slash        => rule!{ None,           Some(binary), Precedence::Factor },
        Bang         => rule!{ Some(unary),    None,         Precedence::None },
        BangEqual    => rule!{ None,           Some(binary), Precedence::Equality },
        Equal        => rule!{ None,           None,         Precedence::None },
        EqualEqual   => rule!{ None,           Some(binary), Precedence::Equality },
        Greater      => rule!{ None,           Some(binary), Precedence::Comparison },
        GreaterEqual => rule!{ None,           Some(binary), Precedence::Comparison },
        Less         => rule!{ None,           Some(binary), Precedence::Comparison },
        LessEqual    => rule!{ None,           Some(binary), Precedence::Comparison },
        Identifier   => rule!{ Some(variable), None,         Precedence::None },
        StrLiteral   => rule!{ Some(string),   None,         Precedence::None },
        Number       => rule!{ Some(number),   None,         Precedence::None },
        And          => rule!{ None,           Some(and_op), Precedence::And },
        Class        => rule!{ None,           None,         Precedence::None },
        Else         => rule!{ None,           None,         Precedence::None },
        False        => rule!{ Some(literal),  None,         Precedence::None },
        For          => rule!{ None,           None,         Precedence::None },
        Fun          => rule!{ None,           None,         Precedence::None },
        If           => rule!{ None,           None,         Precedence::None },
        Nil          => rule!{ Some(literal),  None,         Precedence::None },
        Or           => rule!{ None,           Some(or_op),  Precedence::Or },
        Print        => rule!{ None,           None,         Precedence::None },
        Return       => rule!{ None,           None,         Precedence::None },
        Super        => rule!{ None,           None,         Precedence::None },
        This         => rule!{ None,           None,         Precedence::None },
        True         => rule!{ Some(literal),  None,         Precedence::None },
        Var          => rule!{ None,           None,         Precedence::None },
        While        => rule!{ None,           None,         Precedence::None },
        Error        => rule!{ None,           None,         Precedence::None },
        Eof          => rule!{ None,           None,         Precedence::None },
    }
}

fn get_rule(token: Token) -> ParserRule {
    RULES[token]
}

/// Parse '(' as a prefix. Assumes '(' has been consumed.
fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::LeftParen, compiler.previous_token());
    compiler.expression();
    compiler
        .parser
        .consume(Token::RightParen, "Expect ')' after expression.");
}

/// Parse a number literal as a prefix. Assumes number has been consumed.
fn number(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::Number, compiler.previous_token());
    let value = compiler
        .parser
        .previous
        .text()
        .parse::<f64>()
        .expect("Internal error: Token::Number MUST parse as a float, but didn't?");
    compiler.emit_constant(value.into());
}

/// Parse an unary operator as a prefix. Assumes the operator has been consumed.
fn unary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();

    // Compile the operand, so that it's placed on the stack.
    compiler.parse_precedence(Precedence::Unary);

    match operator {
        Token::Bang => compiler.emit_instruction(OpCode::Not),
        Token::Minus => compiler.emit_instruction(OpCode::Negate),
        _ => unreachable!(),
    };
}

/// Parse a binary operator as an infix. Assumes the operator has been consumed.
fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();
    let rule = get_rule(operator);

    compiler.parse_precedence(rule.higher_precedence());
    match operator {
        Token::BangEqual => compiler.emit_instruction(OpCode::Equal),
        Token::EqualEqual => compiler.emit_instruction(OpCode::Equal),
        Token::Greater => compiler.emit_instruction(OpCode::Greater),
        Token::GreaterEqual => compiler.emit_instruction(OpCode::Less),
        Token::Less => compiler.emit_instruction(OpCode::Less),
        Token::LessEqual => compiler.emit_instruction(OpCode::Greater),
        Token::Plus => compiler.emit_instruction(OpCode::Add),
        Token::Minus => compiler.emit_instruction(OpCode::Subtract),
        Token::Star => compiler.emit_instruction(OpCode::Multiply),
        Token::Slash => compiler.emit_instruction(OpCode::Divide),
        _ => unreachable!(),
    };

    // `!=`, `>=`, and `<=` are synthesized from their complementary opcode followed by a `not`.
    match operator {
        Token::BangEqual | Token::GreaterEqual | Token::LessEqual => {
            compiler.emit_instruction(OpCode::Not);
        }
        _ => {}
    }
}

/// Parse a call `(` as an infix. Assumes the callee is already on the stack and `(` has been
/// consumed.
fn call(compiler: &mut Compiler, _can_assign: bool) {
    let arg_count = compiler.argument_list();
    compiler
        .emit_instruction(OpCode::Call)
        .with_operand(arg_count as u8);
}

/// Parse `and` as an infix, short-circuiting when the left operand is falsy.
fn and_op(compiler: &mut Compiler, _can_assign: bool) {
    let end_jump = compiler.emit_jump(OpCode::JumpIfFalse);

    compiler.emit_instruction(OpCode::Pop);
    compiler.parse_precedence(Precedence::And);

    compiler.patch_jump(end_jump);
}

/// Parse `or` as an infix, short-circuiting when the left operand is truthy.
fn or_op(compiler: &mut Compiler, _can_assign: bool) {
    let else_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    let end_jump = compiler.emit_jump(OpCode::Jump);

    compiler.patch_jump(else_jump);
    compiler.emit_instruction(OpCode::Pop);

    compiler.parse_precedence(Precedence::Or);
    compiler.patch_jump(end_jump);
}

/// Parse a keyword literal as a prefix. Assumes the keyword has been consumed.
fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.previous_token() {
        Token::False => compiler.emit_instruction(OpCode::False),
        Token::Nil => compiler.emit_instruction(OpCode::Nil),
        Token::True => compiler.emit_instruction(OpCode::True),
        _ => unreachable!(),
    };
}

/// Parse a string literal. Add it to the constant pool via the interning arena.
fn string(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::StrLiteral, compiler.previous_token());

    // Access the string contents (without the quotes)
    let literal = compiler.parser.previous.text();
    debug_assert!(literal.len() >= 2);
    debug_assert!(literal.starts_with('"'));
    debug_assert!(literal.ends_with('"'));

    let last_index = literal.len() - 1;
    let contents = &literal[1..last_index];
    let value = value::intern(contents, compiler.parser.gc());
    compiler.emit_constant(value);
}

/// Parse a variable. It can be either a variable access or assignment, which is why `can_assign`
/// is required by all callbacks!
fn variable(compiler: &mut Compiler, can_assign: bool) {
    compiler.named_variable(compiler.parser.previous, can_assign);
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::OpCode;
    use crate::gc::ActiveGC;

    fn compile_ok(source: &str) -> Rc<Function> {
        let gc = ActiveGC::install();
        compile(source, &gc, 0).expect("expected successful compilation")
    }

    fn opcodes(function: &Function) -> Vec<OpCode> {
        let mut offset = 0;
        let mut out = Vec::new();
        while let Some(entry) = function.chunk.get(offset) {
            let op = entry.as_opcode().expect("invalid opcode byte");
            out.push(op);
            offset += match op {
                OpCode::Constant
                | OpCode::GetLocal
                | OpCode::SetLocal
                | OpCode::GetGlobal
                | OpCode::DefineGlobal
                | OpCode::SetGlobal
                | OpCode::Call => 2,
                OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => 3,
                _ => 1,
            };
        }
        out
    }

    #[test]
    #[serial_test::serial]
    fn precedence_confidence_check() {
        // High-level precedence (C-like)
        assert!(Precedence::Assignment < Precedence::Or);
        assert!(Precedence::Or < Precedence::And);
        assert!(Precedence::And < Precedence::Equality);
        assert!(Precedence::Equality < Precedence::Comparison);

        // PEDMAS
        assert!(Precedence::Call > Precedence::Factor);
        assert!(Precedence::Factor > Precedence::Term);

        // `and` should be one level of precedence higher than `or`
        assert_eq!(Precedence::And, Precedence::Or.higher_precedence());
        assert_eq!(Precedence::Factor, Precedence::Term.higher_precedence());
    }

    #[test]
    #[serial_test::serial]
    fn compiles_a_simple_print_statement() {
        let function = compile_ok("print 1 + 2;");
        assert_eq!(
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Add,
                OpCode::Print,
                OpCode::Nil,
                OpCode::Return,
            ],
            opcodes(&function)
        );
    }

    #[test]
    #[serial_test::serial]
    fn block_scoped_local_uses_get_set_local() {
        let function = compile_ok("{ var x = 1; x = x + 1; print x; }");
        assert!(opcodes(&function).contains(&OpCode::GetLocal));
        assert!(opcodes(&function).contains(&OpCode::SetLocal));
        assert!(opcodes(&function).contains(&OpCode::Pop));
    }

    #[test]
    #[serial_test::serial]
    fn if_else_emits_two_forward_jumps() {
        let function = compile_ok("if (true) print 1; else print 2;");
        let jump_count = opcodes(&function)
            .into_iter()
            .filter(|op| matches!(op, OpCode::Jump | OpCode::JumpIfFalse))
            .count();
        assert_eq!(2, jump_count);
    }

    #[test]
    #[serial_test::serial]
    fn redeclaring_a_local_in_the_same_scope_is_an_error() {
        let gc = ActiveGC::install();
        let result = compile("{ var a; var a; }", &gc, 0);
        assert!(result.is_err());
    }

    #[test]
    #[serial_test::serial]
    fn redeclaring_a_global_at_top_level_is_allowed() {
        let gc = ActiveGC::install();
        let result = compile("var a; var a;", &gc, 0);
        assert!(result.is_ok());
    }

    #[test]
    #[serial_test::serial]
    fn returning_from_top_level_is_an_error() {
        let gc = ActiveGC::install();
        let result = compile("return 1;", &gc, 0);
        assert!(result.is_err());
    }

    #[test]
    #[serial_test::serial]
    fn function_call_emits_call_with_argument_count() {
        let function = compile_ok("fun add(a, b) { return a + b; } add(1, 2);");
        assert!(opcodes(&function).contains(&OpCode::Call));
    }
}
