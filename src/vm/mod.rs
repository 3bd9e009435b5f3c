//! Stack-based bytecode VM.
//!
//! One [`Run`] owns everything with run scope: the shared operand stack,
//! the cons-cell arena, and the instruction cursor. Evaluation is one
//! recursive `eval` per form; call frames are index-addressed regions of
//! the shared stack (a frame's arguments sit just below its locals base).
//! A tail-flagged call to the executing function unwinds to the frame loop
//! as [`Flow::Tail`], which overwrites the live argument slots and jumps
//! back to the entry instead of growing a new frame.

use std::rc::Rc;

use crate::bytecode::{Const, FuncDesc, NativeSlot, Op, Script};
use crate::native::{HostValue, NativeType};
use crate::value::Value;

/// Hard cap on the shared operand stack, in value slots.
pub const STACK_LIMIT: usize = 4096;
/// Hard cap on nested call frames. Self tail calls reuse the active frame
/// and are not counted, so iteration depth is unbounded. Each frame costs
/// several recursive `eval` activations on the host stack, so the cap must
/// stay small enough to fire inside the default thread stack of an
/// unoptimized build.
pub const CALL_DEPTH_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("wrong operand types for '{op}': {lhs} and {rhs}")]
    OperandTypes { op: &'static str, lhs: &'static str, rhs: &'static str },
    #[error("division by zero")]
    DivisionByZero,
    #[error("'{op}' works only on lists, got {got}")]
    NotAList { op: &'static str, got: &'static str },
    #[error("car of an empty list")]
    EmptyList,
    #[error("cannot call a value of type {0}")]
    NotCallable(&'static str),
    #[error("{what} got too few arguments: expected {expected}, got {got}")]
    TooFewArgs { what: String, expected: usize, got: usize },
    #[error("{what} got too many arguments: expected {expected}, got {got}")]
    TooManyArgs { what: String, expected: usize, got: usize },
    #[error("native function '{0}' was never registered")]
    UnboundNative(String),
    #[error("native function '{name}' argument {index}: declared {declared}, got {got}")]
    NativeArgType { name: String, index: usize, declared: &'static str, got: &'static str },
    #[error("native function '{name}' returned {got}, declared {declared}")]
    NativeRetType { name: String, declared: &'static str, got: &'static str },
    #[error("condition must be a number, got {0}")]
    BadCondition(&'static str),
    #[error("operand stack overflow (limit {0})")]
    StackOverflow(usize),
    #[error("call depth limit exceeded (limit {0})")]
    CallDepth(usize),
    #[error("corrupt bytecode: {0}")]
    Corrupt(&'static str),
}

type VmResult<T> = Result<T, RuntimeError>;

enum Flow {
    Done,
    /// A tail-flagged call to the lambda at this index; the frame loop of
    /// that lambda consumes it, anything else propagates it upward.
    Tail(u32),
}

/// Evaluate a sub-expression, handing a tail signal to the caller.
macro_rules! subeval {
    ($self:ident) => {
        match $self.eval()? {
            Flow::Done => {}
            Flow::Tail(f) => return Ok(Flow::Tail(f)),
        }
    };
}

struct ConsCell {
    head: Value,
    tail: Option<u32>,
}

struct Run<'a> {
    code: &'a [Op],
    funcs: &'a [FuncDesc],
    natives: &'a [NativeSlot],
    strings: &'a [Rc<str>],
    globals: &'a mut [Value],
    stack: Vec<Value>,
    cells: Vec<ConsCell>,
    pc: usize,
    locals_base: usize,
    current_fn: Option<u32>,
    depth: usize,
}

/// Executes the script from its first instruction and formats the value of
/// its final top-level form. List values are run-scoped: the arena dies
/// with the run, so any global still holding one resets to `Unknown`.
pub fn run(script: &mut Script) -> Result<String, RuntimeError> {
    let mut run = Run {
        code: &script.code,
        funcs: &script.funcs,
        natives: &script.natives,
        strings: &script.strings,
        globals: &mut script.globals,
        stack: Vec::new(),
        cells: Vec::new(),
        pc: 0,
        locals_base: 0,
        current_fn: None,
        depth: 0,
    };
    let outcome = run.execute();
    drop(run);
    for g in script.globals.iter_mut() {
        if matches!(g, Value::List(_)) {
            *g = Value::Unknown;
        }
    }
    outcome.map(|v| v.to_string())
}

impl Run<'_> {
    fn execute(&mut self) -> VmResult<Value> {
        let mut last = Value::Void;
        while !matches!(self.op()?, Op::End) {
            match self.eval()? {
                Flow::Done => last = self.pop()?,
                // a stray tail flag outside any frame degrades to a plain call
                Flow::Tail(f) => {
                    self.call_lambda(f)?;
                    last = self.pop()?;
                }
            }
        }
        Ok(last)
    }

    // ── plumbing ─────────────────────────────────────────────────────────

    fn op(&self) -> VmResult<Op> {
        self.code
            .get(self.pc)
            .copied()
            .ok_or(RuntimeError::Corrupt("instruction cursor out of range"))
    }

    fn func(&self, f: u32) -> VmResult<FuncDesc> {
        self.funcs
            .get(f as usize)
            .copied()
            .ok_or(RuntimeError::Corrupt("function index out of range"))
    }

    fn push(&mut self, v: Value) -> VmResult<()> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(RuntimeError::StackOverflow(STACK_LIMIT));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or(RuntimeError::Corrupt("operand stack underflow"))
    }

    /// Absolute stack slot of local `i`: locals count down from the frame's
    /// base, so the most recent parameter is index 0.
    fn local_slot(&self, i: u32) -> VmResult<usize> {
        let at = self
            .locals_base
            .checked_sub(1 + i as usize)
            .ok_or(RuntimeError::Corrupt("local read outside a call frame"))?;
        if at >= self.stack.len() {
            return Err(RuntimeError::Corrupt("local slot out of range"));
        }
        Ok(at)
    }

    fn cell(&self, c: u32) -> VmResult<&ConsCell> {
        self.cells
            .get(c as usize)
            .ok_or(RuntimeError::Corrupt("cons cell out of range"))
    }

    // ── evaluation ───────────────────────────────────────────────────────

    fn eval(&mut self) -> VmResult<Flow> {
        match self.op()? {
            Op::Const(c) => {
                let v = match c {
                    Const::Int(i) => Value::Int(i),
                    Const::Float(x) => Value::Float(x),
                    Const::Str(i) => Value::Str(
                        self.strings
                            .get(i as usize)
                            .ok_or(RuntimeError::Corrupt("string index out of range"))?
                            .clone(),
                    ),
                };
                self.push(v)?;
                self.pc += 1;
            }
            Op::GlobalRead(i) => {
                let v = self
                    .globals
                    .get(i as usize)
                    .ok_or(RuntimeError::Corrupt("global index out of range"))?
                    .clone();
                self.push(v)?;
                self.pc += 1;
            }
            Op::LocalRead(i) => {
                let v = self.stack[self.local_slot(i)?].clone();
                self.push(v)?;
                self.pc += 1;
            }
            Op::Lambda(f) => {
                // a literal reference: push it and step over the body
                let desc = self.func(f)?;
                self.push(Value::Lambda(f))?;
                self.pc = desc.end as usize + 1;
            }
            Op::Native(n) => {
                if n as usize >= self.natives.len() {
                    return Err(RuntimeError::Corrupt("native index out of range"));
                }
                self.push(Value::Native(n))?;
                self.pc += 2; // the stub form is Native plus End
            }
            op @ (Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Eq | Op::Lt | Op::Gt) => {
                return self.eval_operator(op);
            }
            Op::Set => return self.eval_set(),
            Op::If { second, end } => return self.eval_if(second, end),
            Op::Begin => return self.eval_begin(),
            Op::List => return self.eval_list(),
            Op::Car => return self.eval_car(),
            Op::Cdr => return self.eval_cdr(),
            Op::While { end } => return self.eval_while(end),
            Op::Call { tail } => return self.eval_call(tail),
            Op::End => return Err(RuntimeError::Corrupt("unexpected End instruction")),
        }
        Ok(Flow::Done)
    }

    fn eval_operator(&mut self, op: Op) -> VmResult<Flow> {
        self.pc += 1;
        subeval!(self);
        subeval!(self);
        let b = self.pop()?;
        let a = self.pop()?;
        let v = apply_operator(op, a, b)?;
        self.push(v)?;
        self.pc += 1; // End
        Ok(Flow::Done)
    }

    fn eval_set(&mut self) -> VmResult<Flow> {
        enum Target {
            Global(usize),
            Local(usize),
            Cell(u32),
        }
        self.pc += 1;
        // the target resolves before the value expression evaluates
        let target = match self.op()? {
            Op::GlobalRead(i) => {
                if i as usize >= self.globals.len() {
                    return Err(RuntimeError::Corrupt("global index out of range"));
                }
                self.pc += 1;
                Target::Global(i as usize)
            }
            Op::LocalRead(i) => {
                let at = self.local_slot(i)?;
                self.pc += 1;
                Target::Local(at)
            }
            Op::Car => {
                self.pc += 1;
                subeval!(self);
                let cell = match self.pop()? {
                    Value::List(Some(c)) => c,
                    Value::List(None) => return Err(RuntimeError::EmptyList),
                    other => {
                        return Err(RuntimeError::NotAList { op: "set (car ...)", got: other.type_name() });
                    }
                };
                self.pc += 1; // the car form's End
                Target::Cell(cell)
            }
            _ => return Err(RuntimeError::Corrupt("set target is not assignable")),
        };
        subeval!(self);
        let v = self.pop()?;
        match target {
            Target::Global(i) => self.globals[i] = v.clone(),
            Target::Local(at) => self.stack[at] = v.clone(),
            Target::Cell(c) => {
                self.cell(c)?;
                self.cells[c as usize].head = v.clone();
            }
        }
        self.push(v)?;
        self.pc += 1; // End
        Ok(Flow::Done)
    }

    fn eval_if(&mut self, second: u32, end: u32) -> VmResult<Flow> {
        self.pc += 1;
        subeval!(self);
        let c = self.pop()?;
        if truthy(&c)? {
            subeval!(self);
            self.pc = end as usize + 1;
        } else {
            self.pc = second as usize;
            if matches!(self.op()?, Op::End) {
                // no else branch: the form's value is integer zero
                self.push(Value::Int(0))?;
                self.pc += 1;
            } else {
                subeval!(self);
                self.pc += 1;
            }
        }
        Ok(Flow::Done)
    }

    fn eval_begin(&mut self) -> VmResult<Flow> {
        self.pc += 1;
        let mut last = Value::Void;
        while !matches!(self.op()?, Op::End) {
            subeval!(self);
            last = self.pop()?;
        }
        self.push(last)?;
        self.pc += 1;
        Ok(Flow::Done)
    }

    fn eval_list(&mut self) -> VmResult<Flow> {
        self.pc += 1;
        // elements are prepended as they evaluate: the chain head is the
        // last syntactic element
        let mut chain: Option<u32> = None;
        while !matches!(self.op()?, Op::End) {
            subeval!(self);
            let head = self.pop()?;
            let idx = self.cells.len() as u32;
            self.cells.push(ConsCell { head, tail: chain });
            chain = Some(idx);
        }
        self.push(Value::List(chain))?;
        self.pc += 1;
        Ok(Flow::Done)
    }

    fn eval_car(&mut self) -> VmResult<Flow> {
        self.pc += 1;
        subeval!(self);
        match self.pop()? {
            Value::List(Some(c)) => {
                let v = self.cell(c)?.head.clone();
                self.push(v)?;
            }
            Value::List(None) => return Err(RuntimeError::EmptyList),
            other => return Err(RuntimeError::NotAList { op: "car", got: other.type_name() }),
        }
        self.pc += 1;
        Ok(Flow::Done)
    }

    fn eval_cdr(&mut self) -> VmResult<Flow> {
        self.pc += 1;
        subeval!(self);
        match self.pop()? {
            Value::List(Some(c)) => {
                let tail = self.cell(c)?.tail;
                self.push(Value::List(tail))?;
            }
            Value::List(None) => self.push(Value::List(None))?,
            other => return Err(RuntimeError::NotAList { op: "cdr", got: other.type_name() }),
        }
        self.pc += 1;
        Ok(Flow::Done)
    }

    fn eval_while(&mut self, end: u32) -> VmResult<Flow> {
        self.pc += 1;
        let top = self.pc;
        loop {
            subeval!(self);
            let c = self.pop()?;
            if truthy(&c)? {
                subeval!(self);
                self.pop()?; // each iteration's body value is discarded
                self.pc = top;
            } else {
                // the loop's value is its final condition value
                self.push(c)?;
                self.pc = end as usize + 1;
                break;
            }
        }
        Ok(Flow::Done)
    }

    // ── calls ────────────────────────────────────────────────────────────

    fn eval_call(&mut self, tail: bool) -> VmResult<Flow> {
        self.pc += 1;
        subeval!(self);
        match self.pop()? {
            Value::Lambda(f) if tail && self.current_fn == Some(f) => Ok(Flow::Tail(f)),
            Value::Lambda(f) => {
                self.call_lambda(f)?;
                Ok(Flow::Done)
            }
            Value::Native(n) => {
                self.call_native(n)?;
                Ok(Flow::Done)
            }
            other => Err(RuntimeError::NotCallable(other.type_name())),
        }
    }

    /// Evaluates arguments up to the call form's `End`, leaving them on the
    /// stack; the cursor ends up on the `End`.
    fn eval_args(&mut self) -> VmResult<usize> {
        let mut n = 0;
        while !matches!(self.op()?, Op::End) {
            match self.eval()? {
                Flow::Done => n += 1,
                Flow::Tail(_) => {
                    return Err(RuntimeError::Corrupt("tail call in argument position"));
                }
            }
        }
        Ok(n)
    }

    fn check_arity(what: &str, expected: usize, got: usize) -> VmResult<()> {
        if got < expected {
            return Err(RuntimeError::TooFewArgs { what: what.to_string(), expected, got });
        }
        if got > expected {
            return Err(RuntimeError::TooManyArgs { what: what.to_string(), expected, got });
        }
        Ok(())
    }

    fn call_lambda(&mut self, f: u32) -> VmResult<()> {
        if self.depth >= CALL_DEPTH_LIMIT {
            return Err(RuntimeError::CallDepth(CALL_DEPTH_LIMIT));
        }
        self.depth += 1;
        let out = self.lambda_frame(f);
        self.depth -= 1;
        out
    }

    fn lambda_frame(&mut self, f: u32) -> VmResult<()> {
        let desc = self.func(f)?;
        let argc = desc.arg_count as usize;
        let got = self.eval_args()?;
        Self::check_arity("function", argc, got)?;

        let return_pc = self.pc + 1; // past the call form's End
        let saved_base = self.locals_base;
        let saved_fn = self.current_fn;
        self.locals_base = self.stack.len();
        self.current_fn = Some(f);
        self.pc = desc.entry as usize;

        let mut last = Value::Void;
        loop {
            if matches!(self.op()?, Op::End) {
                break;
            }
            match self.eval()? {
                Flow::Done => last = self.pop()?,
                Flow::Tail(g) if g == f => {
                    // self tail call: overwrite the live argument slots and
                    // start the body over, no new frame
                    let got = self.eval_args()?;
                    Self::check_arity("function", argc, got)?;
                    let sp = self.stack.len();
                    for k in 0..got {
                        let v = self.stack[sp - got + k].clone();
                        self.stack[self.locals_base - got + k] = v;
                    }
                    self.stack.truncate(self.locals_base);
                    self.pc = desc.entry as usize;
                    last = Value::Void;
                }
                Flow::Tail(g) => {
                    // tail position but a different function: an ordinary
                    // call whose value becomes the body's result
                    self.call_lambda(g)?;
                    last = self.pop()?;
                    break;
                }
            }
        }

        self.stack.truncate(self.locals_base - argc);
        self.pc = return_pc;
        self.locals_base = saved_base;
        self.current_fn = saved_fn;
        self.push(last)?;
        Ok(())
    }

    fn call_native(&mut self, n: u32) -> VmResult<()> {
        let slot = self
            .natives
            .get(n as usize)
            .ok_or(RuntimeError::Corrupt("native index out of range"))?;
        let name = self
            .strings
            .get(slot.name as usize)
            .ok_or(RuntimeError::Corrupt("string index out of range"))?
            .clone();
        let got = self.eval_args()?;
        let Some(binding) = self.natives[n as usize].binding.as_ref() else {
            return Err(RuntimeError::UnboundNative(name.to_string()));
        };
        Self::check_arity(&format!("native function '{name}'"), binding.sig.params.len(), got)?;

        let base = self.stack.len() - got;
        let mut args = Vec::with_capacity(got);
        for (i, want) in binding.sig.params.iter().enumerate() {
            args.push(marshal_arg(&name, i, *want, &self.stack[base + i])?);
        }
        let ret = (binding.handler)(&args);
        let result = unmarshal_ret(&name, binding.sig.ret, ret)?;

        self.stack.truncate(base);
        self.pc += 1; // End
        self.push(result)?;
        Ok(())
    }
}

// ── operators and coercion ───────────────────────────────────────────────

fn truthy(v: &Value) -> VmResult<bool> {
    match v {
        Value::Int(i) => Ok(*i != 0),
        Value::Float(x) => Ok(*x != 0.0),
        other => Err(RuntimeError::BadCondition(other.type_name())),
    }
}

fn apply_operator(op: Op, a: Value, b: Value) -> VmResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => int_op(op, x, y),
        (Value::Int(x), Value::Float(y)) => float_op(op, x as f64, y),
        (Value::Float(x), Value::Int(y)) => float_op(op, x, y as f64),
        (Value::Float(x), Value::Float(y)) => float_op(op, x, y),
        (a, b) => Err(RuntimeError::OperandTypes {
            op: op.operator_symbol().unwrap_or("?"),
            lhs: a.type_name(),
            rhs: b.type_name(),
        }),
    }
}

fn int_op(op: Op, x: i64, y: i64) -> VmResult<Value> {
    Ok(match op {
        Op::Add => Value::Int(x.wrapping_add(y)),
        Op::Sub => Value::Int(x.wrapping_sub(y)),
        Op::Mul => Value::Int(x.wrapping_mul(y)),
        Op::Div => {
            if y == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            Value::Int(x.wrapping_div(y))
        }
        Op::Eq => Value::Int((x == y) as i64),
        Op::Lt => Value::Int((x < y) as i64),
        Op::Gt => Value::Int((x > y) as i64),
        _ => return Err(RuntimeError::Corrupt("not an operator opcode")),
    })
}

fn float_op(op: Op, x: f64, y: f64) -> VmResult<Value> {
    Ok(match op {
        Op::Add => Value::Float(x + y),
        Op::Sub => Value::Float(x - y),
        Op::Mul => Value::Float(x * y),
        Op::Div => {
            if y == 0.0 {
                return Err(RuntimeError::DivisionByZero);
            }
            Value::Float(x / y)
        }
        Op::Eq => Value::Int((x == y) as i64),
        Op::Lt => Value::Int((x < y) as i64),
        Op::Gt => Value::Int((x > y) as i64),
        _ => return Err(RuntimeError::Corrupt("not an operator opcode")),
    })
}

fn marshal_arg(name: &Rc<str>, index: usize, want: NativeType, v: &Value) -> VmResult<HostValue> {
    Ok(match (want, v) {
        (NativeType::Int, Value::Int(i)) => HostValue::Int(*i),
        (NativeType::Int, Value::Float(x)) => HostValue::Int(*x as i64),
        (NativeType::Float, Value::Float(x)) => HostValue::Float(*x),
        (NativeType::Float, Value::Int(i)) => HostValue::Float(*i as f64),
        (NativeType::Str, Value::Str(s)) => HostValue::Str(s.clone()),
        (NativeType::Data, Value::Data(p)) => HostValue::Data(*p),
        _ => {
            return Err(RuntimeError::NativeArgType {
                name: name.to_string(),
                index,
                declared: want.name(),
                got: v.type_name(),
            });
        }
    })
}

fn unmarshal_ret(name: &Rc<str>, declared: NativeType, ret: HostValue) -> VmResult<Value> {
    Ok(match (declared, ret) {
        // void returns surface as integer zero
        (NativeType::Void, _) => Value::Int(0),
        (NativeType::Int, HostValue::Int(i)) => Value::Int(i),
        (NativeType::Float, HostValue::Float(x)) => Value::Float(x),
        (NativeType::Str, HostValue::Str(s)) => Value::Str(s),
        (NativeType::Data, HostValue::Data(p)) => Value::Data(p),
        (_, ret) => {
            return Err(RuntimeError::NativeRetType {
                name: name.to_string(),
                declared: declared.name(),
                got: ret.type_name(),
            });
        }
    })
}
