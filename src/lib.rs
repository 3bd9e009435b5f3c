//! An embeddable Lisp-like scripting engine.
//!
//! Source text compiles in a single pass to flat bytecode, a tail-call
//! pass flags self-recursive calls so the VM can iterate in a fixed-size
//! frame, and the compiled form serializes to a compact binary file. Host
//! programs expose functions to scripts through `(native "name")` stubs
//! bound at registration time.
//!
//! ```no_run
//! use blisp::Script;
//!
//! let mut script = Script::open("(define x 5) (set x (+ x 1)) x")?;
//! assert_eq!(script.run()?, "6");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::Path;

pub mod bytecode;
pub mod compiler;
pub mod lexer;
pub mod native;
pub mod optimizer;
pub mod value;
pub mod vm;
pub mod wire;

pub use bytecode::Script;
pub use compiler::CompileError;
pub use native::{HostFn, HostValue, RegisterError};
pub use value::Value;
pub use vm::RuntimeError;
pub use wire::WireError;

impl Script {
    /// Compiles `source` and prepares it for execution.
    pub fn open(source: &str) -> Result<Script, CompileError> {
        Script::open_named(source, "<script>")
    }

    /// Like [`Script::open`], with `file` naming the source in diagnostics.
    pub fn open_named(source: &str, file: &str) -> Result<Script, CompileError> {
        let mut script = compiler::compile(source, file)?;
        optimizer::mark_tail_calls(&mut script);
        Ok(script)
    }

    /// Reads a script previously written by [`Script::write`]. Native stubs
    /// come back unbound and need registering again.
    pub fn load(path: impl AsRef<Path>) -> Result<Script, WireError> {
        wire::load(path.as_ref())
    }

    /// Writes the compiled form to `path`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), WireError> {
        wire::write(self, path.as_ref())
    }

    /// Binds a host handler to the `(native "name")` stub. `signature` is
    /// the C-like text driving arity checks and marshaling, for example
    /// `"int (*)(int, char*)"`. Must happen before a run calls the stub.
    pub fn register(
        &mut self,
        name: &str,
        handler: HostFn,
        signature: &str,
    ) -> Result<(), RegisterError> {
        let slot = self
            .natives
            .iter()
            .position(|n| {
                self.strings
                    .get(n.name as usize)
                    .is_some_and(|s| &**s == name)
            })
            .ok_or_else(|| RegisterError::UnknownStub(name.to_string()))?;
        let sig = native::parse_signature(signature)?;
        self.natives[slot].binding = Some(native::NativeBinding { sig, handler });
        Ok(())
    }

    /// Runs the script and returns the value of its final top-level form as
    /// text. Globals persist across runs; lists do not (their cells belong
    /// to the run).
    pub fn run(&mut self) -> Result<String, RuntimeError> {
        vm::run(self)
    }
}
