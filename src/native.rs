//! Native-function bridge.
//!
//! A script declares a stub with `(native "name")`; the host binds a handler
//! to it with [`crate::Script::register`], passing a C-like signature text
//! such as `"int (*)(int, char*)"`. The signature drives arity checking and
//! argument/return marshaling at every invocation. In place of a raw
//! foreign-call trampoline the handler is an ordinary boxed closure over
//! [`HostValue`]s, so the bridge is portable and safe.

use std::ffi::c_void;
use std::rc::Rc;

/// Most parameters a native signature may declare.
pub const MAX_NATIVE_ARGS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    Int,
    Float,
    Str,
    Data,
    Void,
}

impl NativeType {
    pub fn name(&self) -> &'static str {
        match self {
            NativeType::Int => "int",
            NativeType::Float => "float",
            NativeType::Str => "string",
            NativeType::Data => "data",
            NativeType::Void => "void",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub ret: NativeType,
    pub params: Vec<NativeType>,
}

/// Values crossing the host boundary in either direction.
#[derive(Debug, Clone)]
pub enum HostValue {
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Data(*mut c_void),
    Void,
}

impl HostValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Int(_) => "int",
            HostValue::Float(_) => "float",
            HostValue::Str(_) => "string",
            HostValue::Data(_) => "data",
            HostValue::Void => "void",
        }
    }
}

pub type HostFn = Box<dyn Fn(&[HostValue]) -> HostValue>;

pub struct NativeBinding {
    pub sig: Signature,
    pub handler: HostFn,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegisterError {
    #[error("no native stub named '{0}' in this script")]
    UnknownStub(String),
    #[error("bad native signature: {0}")]
    BadSignature(String),
    #[error("native signature declares {0} parameters, the limit is 16")]
    TooManyParams(usize),
}

/// Parses `ret (*)(params)`. Whitespace is ignored throughout. Unrecognized
/// type names coerce to `int`, matching the registration contract for
/// non-standard host types; `char`/`wchar_t` parameters marshal as strings,
/// any other `*` as opaque data, and a pointer return type is always data.
pub fn parse_signature(text: &str) -> Result<Signature, RegisterError> {
    let flat: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let mut rest = flat.as_str();

    let mut ret = word_type(read_word(&mut rest));
    if let Some(r) = rest.strip_prefix('*') {
        ret = NativeType::Data;
        rest = r;
    }
    rest = rest.strip_prefix("(*)(").ok_or_else(|| {
        RegisterError::BadSignature(format!("expected '(*)(' after the return type in '{text}'"))
    })?;

    let mut params = Vec::new();
    'params: loop {
        if let Some(r) = rest.strip_prefix(')') {
            rest = r;
            break;
        }
        if rest.is_empty() {
            return Err(RegisterError::BadSignature(format!("missing ')' in '{text}'")));
        }
        let word = read_word(&mut rest);
        if word.is_empty() {
            return Err(RegisterError::BadSignature(format!("empty parameter in '{text}'")));
        }
        let base = word_type(word);
        let starred = match rest.strip_prefix('*') {
            Some(r) => {
                rest = r;
                true
            }
            None => false,
        };
        let ty = match (base, starred) {
            (NativeType::Str, _) => NativeType::Str,
            (_, true) => NativeType::Data,
            (NativeType::Void, false) => {
                // C-style empty parameter list
                if params.is_empty() {
                    if let Some(r) = rest.strip_prefix(')') {
                        rest = r;
                        break 'params;
                    }
                }
                return Err(RegisterError::BadSignature(format!(
                    "'void' is not a parameter type in '{text}'"
                )));
            }
            (t, false) => t,
        };
        params.push(ty);
        if let Some(r) = rest.strip_prefix(',') {
            rest = r;
        }
    }
    if !rest.is_empty() {
        return Err(RegisterError::BadSignature(format!("trailing text after ')' in '{text}'")));
    }
    if params.len() > MAX_NATIVE_ARGS {
        return Err(RegisterError::TooManyParams(params.len()));
    }
    Ok(Signature { ret, params })
}

fn read_word<'a>(rest: &mut &'a str) -> &'a str {
    let cut = rest
        .find(|c| matches!(c, '*' | '(' | ')' | ','))
        .unwrap_or(rest.len());
    let (word, tail) = rest.split_at(cut);
    *rest = tail;
    word
}

fn word_type(word: &str) -> NativeType {
    match word {
        "double" => NativeType::Float,
        "void" => NativeType::Void,
        "char" | "wchar_t" => NativeType::Str,
        _ => NativeType::Int,
    }
}
