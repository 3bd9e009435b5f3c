//! Single-pass recursive-descent compiler.
//!
//! Each grammar form is compiled by one method that appends instructions to
//! the growing code vector. The symbol table (globals, the active lambda's
//! locals, function and native descriptors, the interned string pool) lives
//! on the compiler and is discarded once the [`Script`] is built; only the
//! value-shaped arrays survive. Compilation aborts on the first error.

use std::rc::Rc;

use crate::bytecode::{Const, FuncDesc, NativeSlot, Op, Script};
use crate::lexer::{SourceStream, SpannedToken, Token};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("{file}:{line}: lex error: {message}")]
    Lex { file: String, line: u32, message: String },
    #[error("{file}:{line}: include error: {message}")]
    Include { file: String, line: u32, message: String },
    #[error("{file}:{line}: parse error: {message}")]
    Parse { file: String, line: u32, message: String },
}

impl CompileError {
    pub fn file(&self) -> &str {
        match self {
            CompileError::Lex { file, .. }
            | CompileError::Include { file, .. }
            | CompileError::Parse { file, .. } => file,
        }
    }

    pub fn line(&self) -> u32 {
        match self {
            CompileError::Lex { line, .. }
            | CompileError::Include { line, .. }
            | CompileError::Parse { line, .. } => *line,
        }
    }
}

type Result<T> = std::result::Result<T, CompileError>;

/// Nesting deeper than this aborts compilation instead of exhausting the
/// call stack on pathological input.
const MAX_NESTING: usize = 512;

pub fn compile(source: &str, file: &str) -> Result<Script> {
    Compiler::new(source, file).compile_program()
}

struct Compiler {
    stream: SourceStream,
    code: Vec<Op>,
    globals: Vec<String>,
    locals: Vec<String>,
    frames: Vec<usize>,
    funcs: Vec<FuncDesc>,
    natives: Vec<NativeSlot>,
    strings: Vec<Rc<str>>,
    depth: usize,
}

impl Compiler {
    fn new(source: &str, file: &str) -> Self {
        Compiler {
            stream: SourceStream::new(source, file),
            code: Vec::new(),
            globals: Vec::new(),
            locals: Vec::new(),
            frames: Vec::new(),
            funcs: Vec::new(),
            natives: Vec::new(),
            strings: Vec::new(),
            depth: 0,
        }
    }

    fn compile_program(mut self) -> Result<Script> {
        while let Some(tok) = self.stream.next()? {
            self.compile_expression(tok)?;
        }
        self.code.push(Op::End);
        Ok(Script {
            code: self.code,
            globals: vec![Value::Unknown; self.globals.len()],
            funcs: self.funcs,
            natives: self.natives,
            strings: self.strings,
        })
    }

    // ── helpers ──────────────────────────────────────────────────────────

    fn parse_err(&self, at: &SpannedToken, message: impl Into<String>) -> CompileError {
        CompileError::Parse {
            file: at.file.to_string(),
            line: at.line,
            message: message.into(),
        }
    }

    /// A parse error at the current read position, for truncated input.
    fn parse_err_here(&self, message: impl Into<String>) -> CompileError {
        let (file, line) = self.stream.position();
        CompileError::Parse {
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }

    fn next_in_form(&mut self, form: &str) -> Result<SpannedToken> {
        match self.stream.next()? {
            Some(t) => Ok(t),
            None => Err(self.parse_err_here(format!("missing ')' in {form}"))),
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(i) = self.strings.iter().position(|x| &**x == s) {
            return i as u32;
        }
        self.strings.push(Rc::from(s));
        (self.strings.len() - 1) as u32
    }

    /// Name lookup: the innermost lambda's parameters first (most recent
    /// binding wins), then globals, again most recent first so duplicate
    /// defines shadow.
    fn resolve(&self, name: &str) -> Option<Op> {
        if let Some(&base) = self.frames.last() {
            if let Some(i) = self.locals[base..].iter().rev().position(|n| n == name) {
                return Some(Op::LocalRead(i as u32));
            }
        }
        self.globals
            .iter()
            .rposition(|n| n == name)
            .map(|i| Op::GlobalRead(i as u32))
    }

    // ── expressions ──────────────────────────────────────────────────────

    fn compile_expression(&mut self, tok: SpannedToken) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.parse_err(&tok, "expression nesting too deep"));
        }
        let out = self.expression_inner(tok);
        self.depth -= 1;
        out
    }

    fn expression_inner(&mut self, tok: SpannedToken) -> Result<()> {
        match tok.token {
            Token::LParen => {
                let head = self.next_in_form("form")?;
                self.compile_form(head)
            }
            Token::RParen => Err(self.parse_err(&tok, "unexpected ')'")),
            Token::Int(i) => {
                self.code.push(Op::Const(Const::Int(i)));
                Ok(())
            }
            Token::Float(x) => {
                self.code.push(Op::Const(Const::Float(x)));
                Ok(())
            }
            Token::Str(ref s) => {
                let i = self.intern(s);
                self.code.push(Op::Const(Const::Str(i)));
                Ok(())
            }
            Token::Ident(ref name) => match self.resolve(name) {
                Some(op) => {
                    self.code.push(op);
                    Ok(())
                }
                None => Err(self.parse_err(&tok, format!("undefined variable '{name}'"))),
            },
            ref other => Err(self.parse_err(&tok, format!("unexpected {other:?} in expression"))),
        }
    }

    fn compile_form(&mut self, head: SpannedToken) -> Result<()> {
        match head.token {
            Token::Plus => self.compile_operator(Op::Add, "+"),
            Token::Minus => self.compile_operator(Op::Sub, "-"),
            Token::Star => self.compile_operator(Op::Mul, "*"),
            Token::Slash => self.compile_operator(Op::Div, "/"),
            Token::Equal => self.compile_operator(Op::Eq, "="),
            Token::Less => self.compile_operator(Op::Lt, "<"),
            Token::Greater => self.compile_operator(Op::Gt, ">"),
            Token::Car => self.compile_car_cdr(Op::Car),
            Token::Cdr => self.compile_car_cdr(Op::Cdr),
            Token::Define => self.compile_define(),
            Token::Set => self.compile_set(),
            Token::If => self.compile_if(),
            Token::Begin => self.compile_sequence(Op::Begin, "begin"),
            Token::List => self.compile_sequence(Op::List, "list"),
            Token::While => self.compile_while(),
            Token::Lambda => self.compile_lambda(&head),
            Token::Native => self.compile_native(),
            Token::Ident(_) | Token::LParen => self.compile_call(head),
            ref other => Err(self.parse_err(&head, format!("a form cannot start with {other:?}"))),
        }
    }

    fn compile_operator(&mut self, op: Op, sym: &str) -> Result<()> {
        self.code.push(op);
        for _ in 0..2 {
            let t = self.next_in_form(sym)?;
            if t.token == Token::RParen {
                return Err(self.parse_err(&t, format!("operator '{sym}' needs exactly two arguments")));
            }
            self.compile_expression(t)?;
        }
        let t = self.next_in_form(sym)?;
        if t.token != Token::RParen {
            return Err(self.parse_err(&t, format!("missing ')' or too many arguments for '{sym}'")));
        }
        self.code.push(Op::End);
        Ok(())
    }

    fn compile_car_cdr(&mut self, op: Op) -> Result<()> {
        let sym = if matches!(op, Op::Car) { "car" } else { "cdr" };
        self.code.push(op);
        let t = self.next_in_form(sym)?;
        if t.token == Token::RParen {
            return Err(self.parse_err(&t, format!("{sym} needs one argument")));
        }
        self.compile_expression(t)?;
        let t = self.next_in_form(sym)?;
        if t.token != Token::RParen {
            return Err(self.parse_err(&t, format!("missing ')' or too many arguments for '{sym}'")));
        }
        self.code.push(Op::End);
        Ok(())
    }

    fn compile_define(&mut self) -> Result<()> {
        self.code.push(Op::Set);
        let t = self.next_in_form("define")?;
        let Token::Ident(name) = t.token.clone() else {
            return Err(self.parse_err(&t, "missing variable name in define"));
        };
        // a fresh slot every time: duplicate defines shadow the older slot
        let idx = self.globals.len() as u32;
        self.globals.push(name);
        self.code.push(Op::GlobalRead(idx));
        let v = self.next_in_form("define")?;
        if v.token == Token::RParen {
            return Err(self.parse_err(&v, "missing value in define"));
        }
        self.compile_expression(v)?;
        let t = self.next_in_form("define")?;
        if t.token != Token::RParen {
            return Err(self.parse_err(&t, "missing ')' in define"));
        }
        self.code.push(Op::End);
        Ok(())
    }

    fn compile_set(&mut self) -> Result<()> {
        self.code.push(Op::Set);
        let target = self.next_in_form("set")?;
        match target.token {
            Token::Ident(ref name) => match self.resolve(name) {
                Some(op) => self.code.push(op),
                None => {
                    return Err(self.parse_err(&target, format!("undefined variable '{name}'")));
                }
            },
            Token::LParen => {
                let inner = self.next_in_form("set")?;
                if inner.token != Token::Car {
                    return Err(
                        self.parse_err(&inner, "set target must be a variable or a (car ...) form")
                    );
                }
                self.compile_car_cdr(Op::Car)?;
            }
            _ => {
                return Err(
                    self.parse_err(&target, "set target must be a variable or a (car ...) form")
                );
            }
        }
        let v = self.next_in_form("set")?;
        if v.token == Token::RParen {
            return Err(self.parse_err(&v, "missing value in set"));
        }
        self.compile_expression(v)?;
        let t = self.next_in_form("set")?;
        if t.token != Token::RParen {
            return Err(self.parse_err(&t, "missing ')' in set"));
        }
        self.code.push(Op::End);
        Ok(())
    }

    fn compile_if(&mut self) -> Result<()> {
        let at = self.code.len();
        self.code.push(Op::If { second: 0, end: 0 });
        for _ in 0..2 {
            let t = self.next_in_form("if")?;
            if t.token == Token::RParen {
                return Err(self.parse_err(&t, "if needs two or three arguments"));
            }
            self.compile_expression(t)?;
        }
        let second = self.code.len() as u32;
        let mut t = self.next_in_form("if")?;
        if t.token != Token::RParen {
            self.compile_expression(t)?;
            t = self.next_in_form("if")?;
        }
        if t.token != Token::RParen {
            return Err(self.parse_err(&t, "missing ')' or too many arguments for 'if'"));
        }
        let end = self.code.len() as u32;
        self.code[at] = Op::If { second, end };
        self.code.push(Op::End);
        Ok(())
    }

    fn compile_sequence(&mut self, op: Op, form: &str) -> Result<()> {
        self.code.push(op);
        loop {
            let t = self.next_in_form(form)?;
            if t.token == Token::RParen {
                break;
            }
            self.compile_expression(t)?;
        }
        self.code.push(Op::End);
        Ok(())
    }

    fn compile_while(&mut self) -> Result<()> {
        let at = self.code.len();
        self.code.push(Op::While { end: 0 });
        let c = self.next_in_form("while")?;
        if c.token == Token::RParen {
            return Err(self.parse_err(&c, "missing condition in while"));
        }
        self.compile_expression(c)?;
        let b = self.next_in_form("while")?;
        if b.token == Token::RParen {
            return Err(self.parse_err(&b, "missing loop body in while"));
        }
        self.compile_expression(b)?;
        let t = self.next_in_form("while")?;
        if t.token != Token::RParen {
            return Err(self.parse_err(&t, "missing ')' or too many arguments for 'while'"));
        }
        let end = self.code.len() as u32;
        self.code[at] = Op::While { end };
        self.code.push(Op::End);
        Ok(())
    }

    fn compile_lambda(&mut self, head: &SpannedToken) -> Result<()> {
        let t = self.next_in_form("lambda")?;
        if t.token != Token::LParen {
            return Err(self.parse_err(&t, "missing lambda parameter list"));
        }
        let frame = self.locals.len();
        self.frames.push(frame);
        let mut arg_count = 0u32;
        loop {
            let p = self.next_in_form("lambda")?;
            match p.token {
                Token::RParen => break,
                Token::Ident(name) => {
                    self.locals.push(name);
                    arg_count += 1;
                }
                _ => return Err(self.parse_err(&p, "bad lambda parameter list")),
            }
        }
        let fidx = self.funcs.len();
        self.funcs.push(FuncDesc { arg_count, entry: 0, end: 0 });
        self.code.push(Op::Lambda(fidx as u32));
        self.funcs[fidx].entry = self.code.len() as u32;
        loop {
            let Some(t) = self.stream.next()? else {
                return Err(self.parse_err(head, "missing ')' in lambda"));
            };
            if t.token == Token::RParen {
                break;
            }
            self.compile_expression(t)?;
        }
        self.funcs[fidx].end = self.code.len() as u32;
        self.locals.truncate(frame);
        self.frames.pop();
        self.code.push(Op::End);
        Ok(())
    }

    fn compile_native(&mut self) -> Result<()> {
        let t = self.next_in_form("native")?;
        let Token::Str(name) = t.token.clone() else {
            return Err(self.parse_err(&t, "missing native function name"));
        };
        let name_idx = self.intern(&name);
        let nidx = self.natives.len() as u32;
        self.natives.push(NativeSlot { name: name_idx, binding: None });
        self.code.push(Op::Native(nidx));
        let t = self.next_in_form("native")?;
        if t.token != Token::RParen {
            return Err(self.parse_err(&t, "missing ')' in native"));
        }
        self.code.push(Op::End);
        Ok(())
    }

    fn compile_call(&mut self, head: SpannedToken) -> Result<()> {
        self.code.push(Op::Call { tail: false });
        match head.token {
            Token::Ident(ref name) => match self.resolve(name) {
                Some(op) => self.code.push(op),
                None => return Err(self.parse_err(&head, format!("unknown function '{name}'"))),
            },
            Token::LParen => {
                let inner = self.next_in_form("call")?;
                self.compile_form(inner)?;
            }
            _ => return Err(self.parse_err(&head, "a call must start with a name or a form")),
        }
        loop {
            let Some(t) = self.stream.next()? else {
                return Err(self.parse_err(&head, "missing ')' in call"));
            };
            if t.token == Token::RParen {
                break;
            }
            self.compile_expression(t)?;
        }
        self.code.push(Op::End);
        Ok(())
    }
}
