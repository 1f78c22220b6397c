//! Kuroko: a bytecode interpreter for an indentation-sensitive, Python-like
//! scripting language.
//!
//! The pipeline is a single-pass Pratt compiler that lowers source text
//! directly to stack bytecode, executed by a dispatch-loop VM with closures
//! and upvalues, suspendable generators, stack-resident exception handlers,
//! context managers, and a tracing mark-sweep collector over an arena heap.
//!
//! ```
//! use kuroko::{Vm, VmFlags};
//!
//! let mut vm = Vm::new(VmFlags::default());
//! vm.capture_output();
//! vm.interpret("def f(x=10): return x\nprint(f(), f(3))", "<demo>").unwrap();
//! assert_eq!(vm.take_output(), "10 3\n");
//! ```

mod builtins;
mod chunk;
mod compiler;
mod debug;
mod exceptions;
mod heap;
mod modules;
mod objects;
mod scanner;
mod table;
mod value;
mod vm;

pub use crate::chunk::{Chunk, LineEntry, OpCode};
pub use crate::heap::HeapId;
pub use crate::objects::NativeFn;
pub use crate::scanner::{Scanner, ScannerState, Token, TokenKind};
pub use crate::value::{Handler, HandlerKind, Value};
pub use crate::vm::{BaseClasses, ExceptionClasses, Raised, Vm, VmFlags, VmResult};

/// Errors surfaced to embedders; in-language exceptions that escape the top
/// frame arrive here as `Runtime` with a rendered traceback.
#[derive(Debug, thiserror::Error)]
pub enum KurokoError {
    #[error("{file}:{line}:{col}: {message}")]
    Compile {
        message: String,
        line: u32,
        col: u32,
        file: String,
    },
    #[error("{traceback}")]
    Runtime { traceback: String },
}

impl Vm {
    /// Accessors for the class registries, for embedders authoring classes
    /// or signaling errors.
    pub fn base_classes(&self) -> &BaseClasses {
        &self.base
    }

    pub fn exception_classes(&self) -> &ExceptionClasses {
        &self.exceptions
    }

    /// Renders `repr(value)` for embedding code.
    pub fn repr(&mut self, value: Value) -> Result<String, KurokoError> {
        self.repr_value(value).map_err(|_| self.take_runtime_error())
    }

    /// Disassembles a compiled function for tooling.
    pub fn disassemble(&self, function: Value) -> Option<String> {
        let id = function.as_ref_id()?;
        let (chunk, name) = match self.heap_data(id) {
            Some((chunk, name)) => (chunk, name),
            None => return None,
        };
        Some(crate::debug::disassemble_chunk(chunk, &self.heap, &name))
    }

    fn heap_data(&self, id: HeapId) -> Option<(&Chunk, String)> {
        match self.heap_get(id) {
            crate::heap::HeapData::Function(f) => {
                let name = f
                    .name
                    .map(|n| self.heap_str(n).to_string())
                    .unwrap_or_else(|| "<module>".to_string());
                Some((&f.chunk, name))
            }
            crate::heap::HeapData::Closure(c) => self.heap_data(c.function),
            _ => None,
        }
    }

    fn heap_get(&self, id: HeapId) -> &crate::heap::HeapData {
        self.heap.get(id)
    }

    fn heap_str(&self, id: HeapId) -> &str {
        self.heap.str_content(id)
    }
}
