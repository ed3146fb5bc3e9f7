/// Single-pass compiler: Khonsu source → Proto bytecode.
///
/// The grammar is LL(1) recursive descent; every rule emits instructions as
/// it parses. Expressions are described by [`expr::ExprDesc`] values that
/// defer materialisation until the parser knows whether it has a load, a
/// store, or a call whose result count is still open.
pub mod expr;
pub mod scope;

use crate::lexer::{LexError, Lexer};
use crate::opcode::{Instruction, OpCode, MAXARG_A, MAXARG_S, MAXARG_U, MULT_RET};
use crate::proto::{LocalVar, Proto};
use crate::token::Token;
use expr::{ArithOp, ExprDesc, ExprList, OpStack, PartDesc, PartKind};
use khonsu_core::globals::GlobalRegistry;
use khonsu_core::string::{StringId, StringInterner};
use scope::{LocalScope, UpvalDesc};
use std::fmt;

/// Hard limit on a function's operand stack (locals + temporaries).
pub const MAXSTACK: usize = 256;
/// Most local variables live at once in one function.
pub const MAXLOCALS: usize = 200;
/// Most parameters of one function (an implicit `self` counts).
pub const MAXPARAMS: usize = 100;
/// Most upvalues captured by one function.
pub const MAXUPVALUES: usize = 32;
/// Most targets on the left of a multiple assignment.
pub const MAXVARSLH: usize = 64;
/// Most instructions a `while` condition may span.
pub const MAX_WHILE_EXP: usize = 200;
/// List-constructor values flushed per SETLIST.
pub const LFIELDS_PER_FLUSH: u32 = 64;
/// Record-constructor pairs flushed per SETMAP.
pub const RFIELDS_PER_FLUSH: u32 = 32;

/// Compiler error.
#[derive(Clone, Debug)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError {
            message: e.message,
            line: e.line,
        }
    }
}

/// Construction-time compiler options.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompileOptions {
    /// Emit SETLINE instructions and the local-variable debug vector.
    pub debug_info: bool,
}

/// A compiled chunk: the outermost prototype plus the interner and the
/// global names the code references.
#[derive(Debug)]
pub struct Chunk {
    pub proto: Proto,
    pub strings: StringInterner,
    pub globals: GlobalRegistry,
}

/// State for a single function being compiled.
struct FuncState {
    proto: Proto,
    scope: LocalScope,
    /// Captured upvalues, resolved in the parent's scope.
    upvalues: Vec<UpvalDesc>,
    /// Symbolic operand-stack depth.
    stack_size: i32,
    /// Last line marked with SETLINE.
    last_set_line: u32,
}

impl FuncState {
    fn new(debug_info: bool, source: Option<StringId>, line_defined: u32) -> Self {
        let mut proto = Proto::new(debug_info);
        proto.source = source;
        proto.line_defined = line_defined;
        FuncState {
            proto,
            scope: LocalScope::new(),
            upvalues: Vec::new(),
            stack_size: 0,
            last_set_line: 0,
        }
    }
}

/// The compiler: holds the lexer and the stack of open function states.
/// The outermost state is the main chunk; inner states form the parent
/// chain used for upvalue resolution.
struct Compiler<'a> {
    lexer: Lexer<'a>,
    func_stack: Vec<FuncState>,
    globals: GlobalRegistry,
    debug_info: bool,
}

impl<'a> Compiler<'a> {
    fn new(source: &'a [u8], options: CompileOptions) -> Self {
        Compiler {
            lexer: Lexer::new(source),
            func_stack: Vec::new(),
            globals: GlobalRegistry::new(),
            debug_info: options.debug_info,
        }
    }

    fn fs(&self) -> &FuncState {
        self.func_stack.last().unwrap()
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.func_stack.last_mut().unwrap()
    }

    fn line(&self) -> u32 {
        self.lexer.line()
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        let mut message = msg.into();
        if !self.lexer.token_text.is_empty() {
            message.push_str(" near '");
            message.push_str(&self.lexer.token_text);
            message.push('\'');
        }
        CompileError {
            message,
            line: self.line(),
        }
    }

    fn error_for_name(&self, msg: &str, name: StringId) -> CompileError {
        let name = String::from_utf8_lossy(self.lexer.strings.get_bytes(name)).into_owned();
        CompileError {
            message: format!("{msg} '{name}'"),
            line: self.line(),
        }
    }

    fn check_limit(&self, val: usize, limit: usize, what: &str) -> Result<(), CompileError> {
        if val > limit {
            Err(self.error(format!("too many {what} (limit={limit})")))
        } else {
            Ok(())
        }
    }

    // ---- Token helpers ----

    fn current_token(&self) -> Result<&Token, CompileError> {
        self.lexer
            .current()
            .map(|st| &st.token)
            .map_err(|e| CompileError {
                message: e.message.clone(),
                line: e.line,
            })
    }

    fn check(&self, expected: &Token) -> bool {
        self.current_token().map(|t| t == expected).unwrap_or(false)
    }

    fn advance(&mut self) -> Result<Token, CompileError> {
        let st = self.lexer.advance()?;
        Ok(st.token)
    }

    fn expect(&mut self, expected: &Token) -> Result<(), CompileError> {
        if self.check(expected) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.error(format!("'{expected}' expected")))
        }
    }

    fn test_next(&mut self, expected: &Token) -> Result<bool, CompileError> {
        if self.check(expected) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Expect `what`, naming the still-open `who` when it sits on an
    /// earlier line.
    fn check_match(&mut self, what: &Token, who: &Token, where_line: u32) -> Result<(), CompileError> {
        if !self.check(what) {
            return Err(if self.line() == where_line {
                self.error(format!("'{what}' expected"))
            } else {
                self.error(format!(
                    "'{what}' expected (to close '{who}' at line {where_line})"
                ))
            });
        }
        self.check_debugline()?; // mark the closer's line
        self.advance()?;
        Ok(())
    }

    /// Consume a NAME, returning its index in the current string pool.
    fn checkname(&mut self) -> Result<u32, CompileError> {
        let id = match self.current_token()? {
            Token::Name(id) => *id,
            _ => return Err(self.error("<name> expected")),
        };
        let top = self.func_stack.len() - 1;
        let c = self.string_constant(top, id)?;
        self.advance()?;
        Ok(c)
    }

    /// Consume a NAME, returning the interned string itself.
    fn str_checkname(&mut self) -> Result<StringId, CompileError> {
        let i = self.checkname()?;
        Ok(self.fs().proto.kstr[i as usize])
    }

    // ---- Emitter ----

    /// Track an instruction's net stack effect; raises the prototype's
    /// high-water mark and enforces MAXSTACK.
    fn delta_stack(&mut self, delta: i32) -> Result<(), CompileError> {
        let fs = self.fs_mut();
        fs.stack_size += delta;
        let new_size = fs.stack_size;
        if delta > 0 && new_size > fs.proto.max_stack_size as i32 {
            self.check_limit(new_size as usize, MAXSTACK, "temporaries or local variables")?;
            self.fs_mut().proto.max_stack_size = new_size as u32;
        }
        Ok(())
    }

    fn code(&mut self, inst: Instruction, delta: i32) -> Result<usize, CompileError> {
        self.delta_stack(delta)?;
        Ok(self.fs_mut().proto.emit(inst))
    }

    fn code_0(&mut self, op: OpCode, delta: i32) -> Result<usize, CompileError> {
        self.code(Instruction::plain(op), delta)
    }

    fn code_u(&mut self, op: OpCode, u: u32, delta: i32) -> Result<usize, CompileError> {
        self.code(Instruction::u(op, u), delta)
    }

    fn code_s(&mut self, op: OpCode, s: i32, delta: i32) -> Result<usize, CompileError> {
        self.code(Instruction::s(op, s), delta)
    }

    fn code_ab(&mut self, op: OpCode, a: u32, b: u32, delta: i32) -> Result<usize, CompileError> {
        self.code(Instruction::ab(op, a, b), delta)
    }

    /// Append an already-built instruction without stack tracking (used
    /// when splicing the saved `while` condition back in).
    fn primitive_code(&mut self, inst: Instruction) -> usize {
        self.fs_mut().proto.emit(inst)
    }

    fn current_pc(&self) -> usize {
        self.fs().proto.code_len()
    }

    /// Point the jump at `pc` to `target`. Offsets are relative to the
    /// instruction after the jump.
    fn fix_jump(&mut self, pc: usize, target: usize) {
        let offset = target as i32 - (pc as i32 + 1);
        self.fs_mut().proto.get_mut(pc).set_s(offset);
    }

    /// Emit SETLINE when debug info is on and the line advanced.
    fn check_debugline(&mut self) -> Result<(), CompileError> {
        if self.debug_info {
            let line = self.line();
            if line != self.fs().last_set_line {
                self.code_u(OpCode::SetLine, line, 0)?;
                self.fs_mut().last_set_line = line;
            }
        }
        Ok(())
    }

    // ---- Constant pools ----

    /// Find or add an interned string in `fs_idx`'s string pool.
    ///
    /// The string's cached index is trusted when it is in range and refers
    /// to the same interned object; otherwise the string is appended and
    /// the cache updated.
    fn string_constant(&mut self, fs_idx: usize, s: StringId) -> Result<u32, CompileError> {
        let f = &self.func_stack[fs_idx].proto;
        if let Some(hint) = self.lexer.strings.const_hint(s) {
            if (hint as usize) < f.kstr.len() && f.kstr[hint as usize] == s {
                return Ok(hint);
            }
        }
        self.check_limit(f.kstr.len() + 1, MAXARG_U as usize, "string constants")?;
        let f = &mut self.func_stack[fs_idx].proto;
        let c = f.kstr.len() as u32;
        f.kstr.push(s);
        self.lexer.strings.set_const_hint(s, c);
        Ok(c)
    }

    /// Find or add a number in the current number pool.
    fn real_constant(&mut self, r: f64) -> Result<u32, CompileError> {
        let before = self.fs().proto.knum.len();
        let c = self.fs_mut().proto.number_constant(r);
        if self.fs().proto.knum.len() > before {
            self.check_limit(before + 1, MAXARG_U as usize, "number constants")?;
        }
        Ok(c as u32)
    }

    /// Push a number literal: small integral values go inline as PUSHINT,
    /// everything else through the number pool.
    fn code_number(&mut self, r: f64) -> Result<(), CompileError> {
        if r >= -(MAXARG_S as f64) && r <= MAXARG_S as f64 && r as i32 as f64 == r {
            self.code_s(OpCode::PushInt, r as i32, 1)?;
        } else {
            let c = self.real_constant(r)?;
            self.code_u(OpCode::PushNum, c, 1)?;
        }
        Ok(())
    }

    /// Push string-pool[c].
    fn code_kstr(&mut self, c: u32) -> Result<(), CompileError> {
        self.code_u(OpCode::PushString, c, 1)?;
        Ok(())
    }

    /// Push a string literal.
    fn code_string(&mut self, id: StringId) -> Result<(), CompileError> {
        let top = self.func_stack.len() - 1;
        let c = self.string_constant(top, id)?;
        self.code_kstr(c)
    }

    /// Record that string-pool[k] names a referenced global.
    fn assert_global(&mut self, k: u32) {
        let id = self.fs().proto.kstr[k as usize];
        self.globals.note(id);
    }

    // ---- Locals, upvalues, name resolution ----

    /// Reserve (but do not yet activate) the `n`-th local slot for `name`.
    fn store_localvar(&mut self, name: StringId, n: usize) -> Result<(), CompileError> {
        self.check_limit(self.fs().scope.active() + n + 1, MAXLOCALS, "local variables")?;
        self.fs_mut().scope.reserve(name, n);
        Ok(())
    }

    /// Activate the next `nvars` reserved names, registering debug entries.
    fn adjustlocalvars(&mut self, nvars: usize, line: i32) {
        let newly: Vec<StringId> = self.fs_mut().scope.activate(nvars).to_vec();
        for name in newly {
            self.register_localvar(Some(name), line);
        }
    }

    fn register_localvar(&mut self, name: Option<StringId>, line: i32) {
        if let Some(locvars) = self.fs_mut().proto.locvars.as_mut() {
            locvars.push(LocalVar { name, line });
        }
    }

    fn add_localvar(&mut self, name: StringId) -> Result<(), CompileError> {
        self.store_localvar(name, 0)?;
        self.adjustlocalvars(1, 0);
        Ok(())
    }

    /// Resolve `name` in the current (or parent) function's scope.
    ///
    /// A local of an *outer* function is an error: closures capture
    /// explicitly through the `%` syntax.
    fn singlevar(&mut self, name: StringId, in_parent: bool) -> Result<ExprDesc, CompileError> {
        let top = self.func_stack.len() - 1;
        let fs_idx = if in_parent { top - 1 } else { top };
        if let Some(i) = self.func_stack[fs_idx].scope.resolve(name) {
            return Ok(ExprDesc::Local(i as u32));
        }
        for level in (0..fs_idx).rev() {
            if self.func_stack[level].scope.resolve(name).is_some() {
                return Err(self.error_for_name("cannot access a variable in outer scope:", name));
            }
        }
        let k = self.string_constant(fs_idx, name)?;
        Ok(ExprDesc::Global(k))
    }

    /// Find or add an upvalue for `name`, resolving it in the parent scope.
    fn indexupvalue(&mut self, name: StringId) -> Result<u32, CompileError> {
        let desc = match self.singlevar(name, true)? {
            ExprDesc::Local(i) => UpvalDesc::Local(i),
            ExprDesc::Global(k) => UpvalDesc::Global(k),
            _ => unreachable!("singlevar yields locals or globals"),
        };
        if let Some(i) = self.fs().upvalues.iter().position(|u| *u == desc) {
            return Ok(i as u32);
        }
        self.check_limit(self.fs().upvalues.len() + 1, MAXUPVALUES, "upvalues")?;
        self.fs_mut().upvalues.push(desc);
        Ok((self.fs().upvalues.len() - 1) as u32)
    }

    /// `%name`: push an explicitly captured upvalue.
    fn pushupvalue(&mut self, name: StringId) -> Result<(), CompileError> {
        if self.func_stack.len() == 1 {
            return Err(self.error_for_name("cannot access upvalue in main:", name));
        }
        if self.fs().scope.resolve(name).is_some() {
            return Err(self.error_for_name("cannot access an upvalue in current scope:", name));
        }
        let i = self.indexupvalue(name)?;
        self.code_u(OpCode::PushUpvalue, i, 1)?;
        Ok(())
    }

    // ---- Expression plumbing ----

    /// Pop or push to move the stack by `n` (positive pops, negative
    /// pushes nils).
    fn adjuststack(&mut self, n: i32) -> Result<(), CompileError> {
        if n > 0 {
            self.code_u(OpCode::Pop, n as u32, -n)?;
        } else if n < 0 {
            self.code_u(OpCode::PushNil, (-n - 1) as u32, -n)?;
        }
        Ok(())
    }

    /// Fix an open call's result count.
    fn close_call(&mut self, open: Option<usize>, nresults: u32) -> Result<(), CompileError> {
        if let Some(pc) = open {
            self.fs_mut().proto.get_mut(pc).set_b(nresults);
            if nresults != MULT_RET {
                self.delta_stack(nresults as i32)?;
            }
        }
        Ok(())
    }

    /// Materialise a descriptor: whatever `v` describes ends up on top of
    /// the operand stack and `v` becomes `Pushed`.
    fn close_exp(&mut self, v: &mut ExprDesc) -> Result<(), CompileError> {
        match *v {
            ExprDesc::Local(i) => {
                self.code_u(OpCode::PushLocal, i, 1)?;
            }
            ExprDesc::Global(k) => {
                self.code_u(OpCode::GetGlobal, k, 1)?;
                self.assert_global(k);
            }
            ExprDesc::Indexed => {
                self.code_0(OpCode::GetTable, -1)?;
            }
            ExprDesc::Call { pc } => {
                self.close_call(Some(pc), 1)?; // call must return 1 value
            }
            ExprDesc::Pushed => {}
        }
        *v = ExprDesc::Pushed;
        Ok(())
    }

    /// Store the value on top of the stack into `v`.
    fn storevar(&mut self, v: &ExprDesc) -> Result<(), CompileError> {
        match *v {
            ExprDesc::Local(i) => {
                self.code_u(OpCode::SetLocal, i, -1)?;
            }
            ExprDesc::Global(k) => {
                self.code_u(OpCode::SetGlobal, k, -1)?;
                self.assert_global(k);
            }
            ExprDesc::Indexed => {
                self.code_0(OpCode::SetTablePop, -3)?;
            }
            ExprDesc::Call { .. } | ExprDesc::Pushed => {
                return Err(self.error("cannot assign to this expression"));
            }
        }
        Ok(())
    }

    /// Balance `nvars` assignment targets against an expression list,
    /// negotiating an open trailing call's result count.
    fn adjust_mult_assign(&mut self, nvars: usize, d: &ExprList) -> Result<(), CompileError> {
        let diff = d.n as i32 - nvars as i32;
        match d.open {
            None => self.adjuststack(diff),
            Some(pc) => {
                let diff = diff - 1; // do not count the call itself
                if diff <= 0 {
                    // call provides the missing values
                    self.close_call(Some(pc), (-diff) as u32)
                } else {
                    // more values than variables: call provides none
                    self.close_call(Some(pc), 0)?;
                    self.adjuststack(diff)
                }
            }
        }
    }

    // ---- Expressions ----

    /// `expr -> arith_exp { (and | or) arith_exp }`
    ///
    /// Each short-circuit jump pops the left value on fall-through, so its
    /// stack delta is -1: the right operand replaces it.
    fn expr(&mut self) -> Result<ExprDesc, CompileError> {
        let mut v = self.arith_exp()?;
        loop {
            let op = match self.current_token()? {
                Token::And => OpCode::OnFJmp,
                Token::Or => OpCode::OnTJmp,
                _ => break,
            };
            self.close_exp(&mut v)?;
            self.advance()?;
            let pc = self.code_s(op, 0, -1)?;
            v = self.arith_exp()?;
            self.close_exp(&mut v)?;
            let target = self.current_pc();
            self.fix_jump(pc, target);
        }
        Ok(v)
    }

    /// Parse an expression and materialise it.
    fn exp1(&mut self) -> Result<(), CompileError> {
        let mut v = self.expr()?;
        self.close_exp(&mut v)
    }

    fn binop_of(token: &Token) -> Option<ArithOp> {
        Some(match token {
            Token::Eq => ArithOp::Eq,
            Token::Ne => ArithOp::Ne,
            Token::Greater => ArithOp::Gt,
            Token::Less => ArithOp::Lt,
            Token::Le => ArithOp::Le,
            Token::Ge => ArithOp::Ge,
            Token::Concat => ArithOp::Concat,
            Token::Plus => ArithOp::Add,
            Token::Minus => ArithOp::Sub,
            Token::Star => ArithOp::Mult,
            Token::Slash => ArithOp::Div,
            Token::Caret => ArithOp::Pow,
            _ => return None,
        })
    }

    fn push_op(&mut self, stack: &mut OpStack, op: ArithOp) -> Result<(), CompileError> {
        if !stack.try_push(op) {
            return Err(self.error("expression too complex"));
        }
        Ok(())
    }

    /// Emit every pending operator of priority >= `prio`.
    fn pop_ops_to(&mut self, stack: &mut OpStack, prio: u8) -> Result<(), CompileError> {
        while let Some(op) = stack.top() {
            if op.priority() < prio {
                break;
            }
            let delta = if op.is_unary() { 0 } else { -1 };
            self.code_0(op.opcode(), delta)?;
            stack.pop();
        }
        Ok(())
    }

    /// `prefix_exp -> { not | '-' } simple_exp` — unary operators ride the
    /// same pending stack as binary ones.
    fn prefix_exp(&mut self, stack: &mut OpStack) -> Result<ExprDesc, CompileError> {
        loop {
            let op = match self.current_token()? {
                Token::Not => ArithOp::Not,
                Token::Minus => ArithOp::Minus,
                _ => break,
            };
            self.push_op(stack, op)?;
            self.advance()?;
        }
        self.simple_exp()
    }

    /// The operator-precedence engine: a shunting-yard over a bounded
    /// pending-operator stack.
    fn arith_exp(&mut self) -> Result<ExprDesc, CompileError> {
        let mut stack = OpStack::new();
        let mut v = self.prefix_exp(&mut stack)?;
        loop {
            let op = match Self::binop_of(self.current_token()?) {
                Some(op) => op,
                None => break,
            };
            self.close_exp(&mut v)?;
            // '^' is right associative: simulate a higher priority so only
            // strictly tighter operators are flushed.
            let prio = if op == ArithOp::Pow {
                op.priority() + 1
            } else {
                op.priority()
            };
            self.pop_ops_to(&mut stack, prio)?;
            self.push_op(&mut stack, op)?;
            self.advance()?;
            v = self.prefix_exp(&mut stack)?;
            self.close_exp(&mut v)?;
        }
        if !stack.is_empty() {
            self.close_exp(&mut v)?;
            self.pop_ops_to(&mut stack, 0)?;
        }
        Ok(v)
    }

    /// Terminals of the expression grammar.
    fn simple_exp(&mut self) -> Result<ExprDesc, CompileError> {
        self.check_debugline()?;
        match self.current_token()?.clone() {
            Token::Number(r) => {
                self.advance()?;
                self.code_number(r)?;
                Ok(ExprDesc::Pushed)
            }
            Token::String(id) => {
                self.code_string(id)?;
                self.advance()?;
                Ok(ExprDesc::Pushed)
            }
            Token::Nil => {
                self.adjuststack(-1)?;
                self.advance()?;
                Ok(ExprDesc::Pushed)
            }
            Token::LBrace => {
                self.constructor()?;
                Ok(ExprDesc::Pushed)
            }
            Token::Function => {
                self.advance()?;
                let line = self.line();
                self.body(false, line)?;
                Ok(ExprDesc::Pushed)
            }
            Token::LParen => {
                self.advance()?;
                let v = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(v)
            }
            Token::Name(_) | Token::Percent => self.var_or_func(),
            _ => Err(self.error("<expression> expected")),
        }
    }

    /// `var_or_func -> ['%'] NAME var_or_func_tail`
    fn var_or_func(&mut self) -> Result<ExprDesc, CompileError> {
        let mut v = if self.test_next(&Token::Percent)? {
            let name = self.str_checkname()?;
            self.pushupvalue(name)?;
            ExprDesc::Pushed
        } else {
            let name = self.str_checkname()?;
            self.singlevar(name, false)?
        };
        self.var_or_func_tail(&mut v)?;
        Ok(v)
    }

    /// Suffix chain: `.NAME`, `[expr]`, `:NAME args`, `args`.
    fn var_or_func_tail(&mut self, v: &mut ExprDesc) -> Result<(), CompileError> {
        loop {
            match self.current_token()? {
                Token::Dot => {
                    self.advance()?;
                    self.close_exp(v)?; // table must be on the stack
                    let k = self.checkname()?;
                    self.code_kstr(k)?;
                    *v = ExprDesc::Indexed;
                }
                Token::LBracket => {
                    self.advance()?;
                    self.close_exp(v)?; // table must be on the stack
                    self.exp1()?;
                    self.expect(&Token::RBracket)?;
                    *v = ExprDesc::Indexed;
                }
                Token::Colon => {
                    self.advance()?;
                    let name = self.checkname()?;
                    self.close_exp(v)?;
                    self.code_u(OpCode::PushSelf, name, 1)?;
                    let pc = self.funcparams(1)?;
                    *v = ExprDesc::Call { pc };
                }
                Token::LParen | Token::String(_) | Token::LBrace => {
                    self.close_exp(v)?;
                    let pc = self.funcparams(0)?;
                    *v = ExprDesc::Call { pc };
                }
                _ => return Ok(()),
            }
        }
    }

    /// Call arguments. The function sits `slf + 1` slots below the current
    /// stack top; the emitted CALL leaves the symbolic stack at the
    /// function's slot, results to be added once the count is known.
    fn funcparams(&mut self, slf: u32) -> Result<usize, CompileError> {
        let slevel = self.fs().stack_size - slf as i32 - 1; // where the function is
        match self.current_token()?.clone() {
            Token::LParen => {
                let line = self.line();
                self.advance()?;
                let e = self.explist()?;
                self.check_match(&Token::RParen, &Token::LParen, line)?;
                self.close_call(e.open, MULT_RET)?; // inner call passes all results
            }
            Token::LBrace => {
                self.constructor()?;
            }
            Token::String(id) => {
                self.code_string(id)?;
                self.advance()?;
            }
            _ => return Err(self.error("function arguments expected")),
        }
        self.fs_mut().stack_size = slevel; // the call removes func and params
        self.code_ab(OpCode::Call, slevel as u32, 0, 0)
    }

    /// A possibly-empty expression list.
    fn explist(&mut self) -> Result<ExprList, CompileError> {
        match self.current_token()? {
            Token::Else | Token::ElseIf | Token::End | Token::Until | Token::Eos | Token::Semi
            | Token::RParen => Ok(ExprList { n: 0, open: None }),
            _ => self.explist1(),
        }
    }

    /// A non-empty expression list; the last expression may stay open.
    fn explist1(&mut self) -> Result<ExprList, CompileError> {
        let mut v = self.expr()?;
        let mut n = 1;
        while self.check(&Token::Comma) {
            n += 1;
            self.close_exp(&mut v)?;
            self.advance()?;
            v = self.expr()?;
        }
        match v {
            ExprDesc::Call { pc } => Ok(ExprList { n, open: Some(pc) }),
            ExprDesc::Pushed => Ok(ExprList { n, open: None }),
            mut other => {
                self.close_exp(&mut other)?;
                Ok(ExprList { n, open: None })
            }
        }
    }

    // ---- Table constructors ----

    /// `constructor -> '{' part [';' part] '}'`
    ///
    /// The CREATETABLE size hint is back-patched once the element count is
    /// known. The two halves must be of different kinds.
    fn constructor(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        let pc = self.code_u(OpCode::CreateTable, 0, 1)?;
        self.expect(&Token::LBrace)?;
        let cd = self.constructor_part()?;
        let mut nelems = cd.n;
        if self.test_next(&Token::Semi)? {
            let other = self.constructor_part()?;
            if cd.kind == other.kind && cd.kind != PartKind::Empty {
                return Err(self.error("invalid constructor syntax"));
            }
            nelems += other.n;
        }
        self.check_match(&Token::RBrace, &Token::LBrace, line)?;
        self.fs_mut().proto.get_mut(pc).set_u(nelems);
        Ok(())
    }

    /// One half of a constructor; its kind is inferred from the first item.
    fn constructor_part(&mut self) -> Result<PartDesc, CompileError> {
        match self.current_token()?.clone() {
            Token::Semi | Token::RBrace => Ok(PartDesc {
                n: 0,
                kind: PartKind::Empty,
            }),
            Token::Name(_) => {
                // `NAME = ...` starts a record half; anything else is the
                // first expression of a list half.
                let mut v = self.expr()?;
                if self.check(&Token::Assign) {
                    let k = self.getvarname(&v)?;
                    self.code_kstr(k)?;
                    self.advance()?; // skip '='
                    self.exp1()?;
                    let n = self.recfields()?;
                    Ok(PartDesc {
                        n,
                        kind: PartKind::Record,
                    })
                } else {
                    self.close_exp(&mut v)?;
                    let n = self.listfields()?;
                    Ok(PartDesc {
                        n,
                        kind: PartKind::List,
                    })
                }
            }
            Token::LBracket => {
                self.recfield()?;
                let n = self.recfields()?;
                Ok(PartDesc {
                    n,
                    kind: PartKind::Record,
                })
            }
            _ => {
                self.exp1()?;
                let n = self.listfields()?;
                Ok(PartDesc {
                    n,
                    kind: PartKind::List,
                })
            }
        }
    }

    /// Recover the name constant of a bare variable used as a record key.
    fn getvarname(&mut self, v: &ExprDesc) -> Result<u32, CompileError> {
        match *v {
            ExprDesc::Global(k) => Ok(k),
            ExprDesc::Local(i) => {
                let name = self.fs().scope.name(i as usize);
                let top = self.func_stack.len() - 1;
                self.string_constant(top, name)
            }
            _ => Err(self.error("unexpected token")),
        }
    }

    /// `recfield -> (NAME | '[' exp1 ']') = exp1`
    fn recfield(&mut self) -> Result<(), CompileError> {
        match self.current_token()? {
            Token::Name(_) => {
                let k = self.checkname()?;
                self.code_kstr(k)?;
            }
            Token::LBracket => {
                self.advance()?;
                self.exp1()?;
                self.expect(&Token::RBracket)?;
            }
            _ => return Err(self.error("<name> or '[' expected")),
        }
        self.expect(&Token::Assign)?;
        self.exp1()
    }

    /// Remaining record fields; one has been read before. Pairs are
    /// flushed into the table every RFIELDS_PER_FLUSH entries.
    fn recfields(&mut self) -> Result<u32, CompileError> {
        let mut n = 1u32;
        let mut mod_n = 1u32;
        while self.check(&Token::Comma) {
            self.advance()?;
            if self.check(&Token::Semi) || self.check(&Token::RBrace) {
                break;
            }
            self.recfield()?;
            n += 1;
            mod_n += 1;
            if mod_n == RFIELDS_PER_FLUSH {
                self.code_u(
                    OpCode::SetMap,
                    RFIELDS_PER_FLUSH - 1,
                    -2 * RFIELDS_PER_FLUSH as i32,
                )?;
                mod_n = 0;
            }
        }
        if mod_n > 0 {
            self.code_u(OpCode::SetMap, mod_n - 1, -2 * mod_n as i32)?;
        }
        Ok(n)
    }

    /// Remaining list values; one has been read before. Values are flushed
    /// every LFIELDS_PER_FLUSH entries, SETLIST carrying the batch index.
    fn listfields(&mut self) -> Result<u32, CompileError> {
        let mut n = 1u32;
        let mut mod_n = 1u32;
        while self.check(&Token::Comma) {
            self.advance()?;
            if self.check(&Token::Semi) || self.check(&Token::RBrace) {
                break;
            }
            self.exp1()?;
            n += 1;
            self.check_limit(
                n as usize,
                (MAXARG_A * LFIELDS_PER_FLUSH) as usize,
                "items in a list initializer",
            )?;
            mod_n += 1;
            if mod_n == LFIELDS_PER_FLUSH {
                self.code_ab(
                    OpCode::SetList,
                    n / LFIELDS_PER_FLUSH - 1,
                    LFIELDS_PER_FLUSH - 1,
                    -(LFIELDS_PER_FLUSH as i32),
                )?;
                mod_n = 0;
            }
        }
        if mod_n > 0 {
            self.code_ab(
                OpCode::SetList,
                n / LFIELDS_PER_FLUSH,
                mod_n - 1,
                -(mod_n as i32),
            )?;
        }
        Ok(n)
    }

    // ---- Function bodies ----

    /// `parlist -> [ NAME { ',' NAME } [',' '...'] | '...' ]`
    fn parlist(&mut self) -> Result<(), CompileError> {
        let mut nparams = 0usize;
        let mut dots = false;
        match self.current_token()? {
            Token::Dots => {
                self.advance()?;
                dots = true;
            }
            Token::Name(_) => loop {
                let name = self.str_checkname()?;
                self.store_localvar(name, nparams)?;
                nparams += 1;
                if !self.test_next(&Token::Comma)? {
                    break;
                }
                match self.current_token()? {
                    Token::Dots => {
                        self.advance()?;
                        dots = true;
                        break;
                    }
                    Token::Name(_) => {}
                    _ => return Err(self.error("<name> or '...' expected")),
                }
            },
            Token::RParen => {}
            _ => return Err(self.error("<name> or '...' expected")),
        }
        self.code_args(nparams, dots)
    }

    /// Activate parameters; a vararg function gets an implicit extra local
    /// `arg` holding the collected extras.
    fn code_args(&mut self, nparams: usize, dots: bool) -> Result<(), CompileError> {
        self.adjustlocalvars(nparams, 0);
        self.check_limit(self.fs().scope.active(), MAXPARAMS, "parameters")?;
        let nparams = self.fs().scope.active() as u32; // `self` may be there already
        self.fs_mut().proto.num_params = nparams;
        self.fs_mut().proto.is_vararg = dots;
        if !dots {
            self.delta_stack(nparams as i32)
        } else {
            self.delta_stack(nparams as i32 + 1)?;
            let arg = self.lexer.strings.intern(b"arg");
            self.add_localvar(arg)
        }
    }

    /// `body -> '(' parlist ')' chunk end`
    ///
    /// Opens a fresh compilation state; on close the child prototype joins
    /// the parent's pool and a CLOSURE captures the pushed upvalues.
    fn body(&mut self, needself: bool, line: u32) -> Result<(), CompileError> {
        let source = self.fs().proto.source;
        self.func_stack
            .push(FuncState::new(self.debug_info, source, line));
        self.expect(&Token::LParen)?;
        if needself {
            let self_name = self.lexer.strings.intern(b"self");
            self.add_localvar(self_name)?;
        }
        self.parlist()?;
        self.expect(&Token::RParen)?;
        self.chunk()?;
        self.check_match(&Token::End, &Token::Function, line)?;
        let child = self.close_func()?;
        self.func_onstack(child)
    }

    /// Terminate and seal the current function; pops its state.
    fn close_func(&mut self) -> Result<FuncState, CompileError> {
        self.code_0(OpCode::EndCode, 0)?;
        let fs = self.fs_mut();
        if let Some(locvars) = fs.proto.locvars.as_mut() {
            locvars.push(LocalVar {
                name: None,
                line: -1,
            }); // end-of-vector sentinel
        }
        fs.proto.trim();
        Ok(self.func_stack.pop().unwrap())
    }

    /// Materialise a closed child function as a value in the current one:
    /// push each captured upvalue, then CLOSURE. The ordering makes the
    /// closure capture the upvalues' current values.
    fn func_onstack(&mut self, child: FuncState) -> Result<(), CompileError> {
        for up in &child.upvalues {
            match *up {
                UpvalDesc::Local(i) => {
                    self.code_u(OpCode::PushLocal, i, 1)?;
                }
                UpvalDesc::Global(k) => {
                    self.code_u(OpCode::GetGlobal, k, 1)?;
                    self.assert_global(k);
                }
            }
        }
        let f = &self.fs().proto;
        self.check_limit(f.kproto.len() + 1, MAXARG_A as usize, "nested prototypes")?;
        let nup = child.upvalues.len() as u32;
        self.fs_mut().proto.kproto.push(child.proto);
        let idx = (self.fs().proto.kproto.len() - 1) as u32;
        self.delta_stack(1)?; // CLOSURE pushes before consuming the upvalues
        self.code_ab(OpCode::Closure, idx, nup, -(nup as i32))?;
        Ok(())
    }

    // ---- Statements ----

    /// `block -> chunk`, restoring the local count on exit.
    fn block(&mut self) -> Result<(), CompileError> {
        let nlocal = self.fs().scope.active();
        self.chunk()?;
        let cur = self.fs().scope.active();
        self.adjuststack((cur - nlocal) as i32)?;
        let lastline = self.fs().last_set_line as i32;
        for _ in nlocal..cur {
            self.register_localvar(None, lastline);
        }
        self.fs_mut().scope.deactivate_to(nlocal);
        Ok(())
    }

    /// `ifpart -> cond then block [else block | elseif ifpart]`
    fn ifpart(&mut self, line: u32) -> Result<(), CompileError> {
        self.advance()?; // skip IF or ELSEIF
        self.exp1()?; // condition
        let c = self.code_s(OpCode::IfFJmp, 0, -1)?; // jump over 'then' when false
        self.expect(&Token::Then)?;
        self.block()?;
        let je = self.code_s(OpCode::Jmp, 0, 0)?; // jump over the else part
        let mut elseinit = self.current_pc();
        if self.check(&Token::ElseIf) {
            self.ifpart(line)?;
        } else {
            if self.test_next(&Token::Else)? {
                self.block()?;
            }
            self.check_match(&Token::End, &Token::If, line)?;
        }
        if self.current_pc() > elseinit {
            self.fix_jump(je, self.current_pc());
        } else {
            // no else part: the unconditional jump is dead, remove it
            self.fs_mut().proto.code.pop();
            elseinit -= 1;
            debug_assert_eq!(self.current_pc(), je, "jump out of place");
        }
        self.fix_jump(c, elseinit);
        Ok(())
    }

    /// `whilestat -> while exp1 do block end`
    ///
    /// The condition runs *after* the body in the emitted code. Since this
    /// is a single pass, the condition's instructions are parsed into
    /// place, saved, rewound, and spliced back in after the body, with an
    /// initial jump transferring entry control to them.
    fn whilestat(&mut self, line: u32) -> Result<(), CompileError> {
        let while_init = self.current_pc();
        self.advance()?; // skip WHILE
        self.exp1()?; // condition
        let cond_size = self.current_pc() - while_init;
        if cond_size > MAX_WHILE_EXP {
            return Err(self.error("while condition too complex"));
        }
        let buffer: Vec<Instruction> = self.fs_mut().proto.code.drain(while_init..).collect();
        self.delta_stack(-1)?; // condition value no longer on the stack
        self.code_s(OpCode::Jmp, 0, 0)?; // entry jump to the condition
        self.expect(&Token::Do)?;
        self.block()?;
        self.check_match(&Token::End, &Token::While, line)?;
        let cond_start = self.current_pc();
        self.fix_jump(while_init, cond_start);
        for inst in buffer {
            self.primitive_code(inst);
        }
        self.delta_stack(1)?;
        let pc = self.code_s(OpCode::IfTJmp, 0, -1)?; // re-enter the body while true
        self.fix_jump(pc, while_init + 1);
        Ok(())
    }

    /// `repeatstat -> repeat block until exp1`
    fn repeatstat(&mut self, line: u32) -> Result<(), CompileError> {
        let repeat_init = self.current_pc();
        self.advance()?; // skip REPEAT
        self.block()?;
        self.check_match(&Token::Until, &Token::Repeat, line)?;
        self.exp1()?;
        let pc = self.code_s(OpCode::IfFJmp, 0, -1)?;
        self.fix_jump(pc, repeat_init);
        Ok(())
    }

    /// `localstat -> local NAME { ',' NAME } ['=' explist1]`
    ///
    /// Names are activated only after the initialiser list is parsed, so
    /// the initialiser cannot see them.
    fn localstat(&mut self) -> Result<(), CompileError> {
        self.check_debugline()?;
        self.advance()?; // skip LOCAL
        let nvars = self.localnamelist()?;
        let d = self.decinit()?;
        let line = self.fs().last_set_line as i32;
        self.adjustlocalvars(nvars, line);
        self.adjust_mult_assign(nvars, &d)
    }

    fn localnamelist(&mut self) -> Result<usize, CompileError> {
        let name = self.str_checkname()?;
        self.store_localvar(name, 0)?;
        let mut i = 1;
        while self.test_next(&Token::Comma)? {
            let name = self.str_checkname()?;
            self.store_localvar(name, i)?;
            i += 1;
        }
        Ok(i)
    }

    fn decinit(&mut self) -> Result<ExprList, CompileError> {
        if self.test_next(&Token::Assign)? {
            self.explist1()
        } else {
            Ok(ExprList { n: 0, open: None })
        }
    }

    /// `funcname -> NAME { '.' NAME } [':' NAME]`
    fn funcname(&mut self) -> Result<(ExprDesc, bool), CompileError> {
        let name = self.str_checkname()?;
        let mut v = self.singlevar(name, false)?;
        let mut needself = false;
        loop {
            if self.check(&Token::Dot) {
                self.advance()?;
                self.close_exp(&mut v)?;
                let k = self.checkname()?;
                self.code_kstr(k)?;
                v = ExprDesc::Indexed;
            } else if self.check(&Token::Colon) {
                self.advance()?;
                self.close_exp(&mut v)?;
                let k = self.checkname()?;
                self.code_kstr(k)?;
                v = ExprDesc::Indexed;
                needself = true;
                break;
            } else {
                break;
            }
        }
        Ok((v, needself))
    }

    /// `funcstat -> function funcname body`; main chunk only. A `:name`
    /// suffix adds an implicit first parameter named `self`.
    fn funcstat(&mut self, line: u32) -> Result<(), CompileError> {
        if self.func_stack.len() > 1 {
            return Err(self.error(
                "'function' statement not allowed inside a function (use a function expression)",
            ));
        }
        self.check_debugline()?;
        self.advance()?; // skip FUNCTION
        let (v, needself) = self.funcname()?;
        self.body(needself, line)?;
        self.storevar(&v)
    }

    /// A statement starting with a name: either a call or an assignment.
    fn namestat(&mut self) -> Result<(), CompileError> {
        self.check_debugline()?;
        let v = self.var_or_func()?;
        match v {
            ExprDesc::Call { pc } => {
                // call statement: discard every result
                self.close_call(Some(pc), 0)
            }
            ExprDesc::Pushed => Err(self.error("syntax error")),
            _ => {
                let left = self.assignment(&v, 1)?;
                self.adjuststack(left) // drop leftover table/key pairs
            }
        }
    }

    /// `assignment -> { ',' var_or_func } '=' explist1`, right-recursive.
    ///
    /// Stores happen in reverse order. An indexed target whose table/key
    /// pair is buried under later values stores through SETTABLE with the
    /// pair's depth; the pairs themselves are popped by the caller.
    fn assignment(&mut self, v: &ExprDesc, nvars: usize) -> Result<i32, CompileError> {
        self.check_limit(nvars, MAXVARSLH, "variables in a multiple assignment")?;
        let mut left = 0i32;
        if self.check(&Token::Comma) {
            self.advance()?;
            let nv = self.var_or_func()?;
            if matches!(nv, ExprDesc::Call { .. } | ExprDesc::Pushed) {
                return Err(self.error("syntax error"));
            }
            left = self.assignment(&nv, nvars + 1)?;
        } else {
            if !self.check(&Token::Assign) {
                return Err(self.error("unexpected token"));
            }
            self.advance()?;
            let d = self.explist1()?;
            self.adjust_mult_assign(nvars, &d)?;
        }
        if !matches!(v, ExprDesc::Indexed) || left + (nvars as i32 - 1) == 0 {
            // plain variable, or an indexed target with its value on top
            self.storevar(v)?;
        } else {
            self.code_u(OpCode::SetTable, (left + nvars as i32 - 1) as u32, -1)?;
            left += 2; // table and key stay on the stack for now
        }
        Ok(left)
    }

    /// `ret -> [return explist [';']]`
    fn ret(&mut self) -> Result<(), CompileError> {
        if self.check(&Token::Return) {
            self.check_debugline()?;
            self.advance()?;
            let e = self.explist()?;
            self.close_call(e.open, MULT_RET)?;
            let nlocal = self.fs().scope.active() as u32;
            self.code_u(OpCode::RetCode, nlocal, 0)?;
            self.fs_mut().stack_size = nlocal as i32; // return drops all temporaries
            self.test_next(&Token::Semi)?;
        }
        Ok(())
    }

    /// One statement; false on a follow token.
    fn stat(&mut self) -> Result<bool, CompileError> {
        let line = self.line();
        match self.current_token()? {
            Token::If => {
                self.ifpart(line)?;
                Ok(true)
            }
            Token::While => {
                self.whilestat(line)?;
                Ok(true)
            }
            Token::Do => {
                self.advance()?;
                self.block()?;
                self.check_match(&Token::End, &Token::Do, line)?;
                Ok(true)
            }
            Token::Repeat => {
                self.repeatstat(line)?;
                Ok(true)
            }
            Token::Function => {
                self.funcstat(line)?;
                Ok(true)
            }
            Token::Local => {
                self.localstat()?;
                Ok(true)
            }
            Token::Name(_) | Token::Percent => {
                self.namestat()?;
                Ok(true)
            }
            Token::Return
            | Token::Semi
            | Token::Else
            | Token::ElseIf
            | Token::End
            | Token::Until
            | Token::Eos => Ok(false),
            _ => Err(self.error("unexpected token")),
        }
    }

    /// `chunk -> { stat [';'] } ret`
    fn chunk(&mut self) -> Result<(), CompileError> {
        while self.stat()? {
            debug_assert_eq!(
                self.fs().stack_size,
                self.fs().scope.active() as i32,
                "stack size != # local vars"
            );
            self.test_next(&Token::Semi)?;
        }
        self.ret()
    }
}

/// Compile Khonsu source to a [`Chunk`]. Public API — the entry point.
pub fn compile(source: &[u8], name: &str) -> Result<Chunk, CompileError> {
    compile_with(source, name, CompileOptions::default())
}

/// Compile with explicit options.
pub fn compile_with(
    source: &[u8],
    name: &str,
    options: CompileOptions,
) -> Result<Chunk, CompileError> {
    let mut compiler = Compiler::new(source, options);
    let source_name = compiler.lexer.strings.intern(name.as_bytes());
    compiler
        .func_stack
        .push(FuncState::new(compiler.debug_info, Some(source_name), 0));
    compiler.chunk()?;
    if !compiler.check(&Token::Eos) {
        return Err(compiler.error("<eof> expected"));
    }
    let fs = compiler.close_func()?;
    Ok(Chunk {
        proto: fs.proto,
        strings: compiler.lexer.strings,
        globals: compiler.globals,
    })
}
