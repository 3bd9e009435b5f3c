//! Flat bytecode representation shared by the compiler, optimizer, VM and
//! serializer. Every compound form closes with an [`Op::End`] at its own
//! nesting depth, which makes form boundaries discoverable by a structural
//! skip without any jump-target bookkeeping.

use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::native::NativeBinding;
use crate::value::Value;

/// A literal embedded in the instruction stream. String constants refer
/// into the script's interned pool by index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Const {
    Int(i64),
    Float(f64),
    Str(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Op {
    Const(Const),
    /// Read the global slot at the operand index.
    GlobalRead(u32),
    /// Read the local `i` slots below the frame's locals base.
    LocalRead(u32),
    /// Push a reference to the function descriptor and skip its body.
    Lambda(u32),
    /// Push a reference to the native stub at the operand index.
    Native(u32),
    /// Evaluate callee, then arguments to `End`, then dispatch. `tail` is
    /// set by the optimizer for calls in tail position.
    Call { tail: bool },
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Lt,
    Gt,
    /// Target operand (global/local read or a `Car` form) follows, then the
    /// value expression.
    Set,
    /// `second` is the index of the else branch (or of this form's `End`
    /// when there is none); `end` is the index of this form's `End`.
    If { second: u32, end: u32 },
    Begin,
    List,
    Car,
    Cdr,
    /// `end` is the index of this form's `End`.
    While { end: u32 },
    End,
}

impl Op {
    /// Compound ops open a form that runs to a matching `End` at the same
    /// nesting depth; the rest occupy exactly one instruction.
    pub fn is_compound(&self) -> bool {
        !matches!(
            self,
            Op::Const(_) | Op::GlobalRead(_) | Op::LocalRead(_) | Op::End
        )
    }

    /// Printable symbol for the arithmetic/comparison opcodes.
    pub fn operator_symbol(&self) -> Option<&'static str> {
        match self {
            Op::Add => Some("+"),
            Op::Sub => Some("-"),
            Op::Mul => Some("*"),
            Op::Div => Some("/"),
            Op::Eq => Some("="),
            Op::Lt => Some("<"),
            Op::Gt => Some(">"),
            _ => None,
        }
    }
}

/// Function descriptor: `entry` is the first body instruction, `end` the
/// index of the body's closing `End`, so a lambda literal can be skipped
/// and a self tail call can jump back without scanning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FuncDesc {
    pub arg_count: u32,
    pub entry: u32,
    pub end: u32,
}

/// A `native` stub. `name` is a string-pool index; `binding` is filled in
/// by registration and never serialized.
pub struct NativeSlot {
    pub name: u32,
    pub binding: Option<NativeBinding>,
}

// the handler box has no useful representation, so only bound-ness shows
impl fmt::Debug for NativeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSlot")
            .field("name", &self.name)
            .field("bound", &self.binding.is_some())
            .finish()
    }
}

/// A compiled script: the flat instruction array plus its companion tables.
/// Global slots persist across runs of the same script.
#[derive(Debug)]
pub struct Script {
    pub code: Vec<Op>,
    pub globals: Vec<Value>,
    pub funcs: Vec<FuncDesc>,
    pub natives: Vec<NativeSlot>,
    pub strings: Vec<Rc<str>>,
}
