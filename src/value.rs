use std::ffi::c_void;
use std::fmt;
use std::rc::Rc;

/// A runtime value.
///
/// Cons cells live in the arena of the run that built them and are referred
/// to by index; `List(None)` is the empty list. `Lambda` and `Native` carry
/// indices into the script's descriptor tables. `Data` is an opaque host
/// pointer passed through the native bridge untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Lambda(u32),
    Native(u32),
    Data(*mut c_void),
    List(Option<u32>),
    Void,
    Unknown,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Lambda(_) => "lambda",
            Value::Native(_) => "native function",
            Value::Data(_) => "data",
            Value::List(_) => "list",
            Value::Void => "void",
            Value::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(n) => {
                // whole floats print without the fractional part: (+ 2 3.0) is "5"
                if *n == (*n as i64) as f64 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Value::Str(s) => write!(f, "{s}"),
            Value::Lambda(_) => write!(f, "#lambda"),
            Value::Native(_) => write!(f, "#native function"),
            Value::Data(p) => write!(f, "#data {p:p}"),
            Value::List(_) => write!(f, "#list"),
            Value::Void => write!(f, "#void"),
            Value::Unknown => write!(f, "#unknown"),
        }
    }
}
