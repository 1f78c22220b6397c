//! Callable objects: compiled functions, closures, upvalues, natives, bound
//! methods and properties.

use crate::chunk::Chunk;
use crate::heap::HeapId;
use crate::value::Value;
use crate::vm::{Vm, VmResult};

/// Signature flags recorded by the compiler.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FunctionFlags {
    /// Has a `*args` collector parameter.
    pub collects_args: bool,
    /// Has a `**kwargs` collector parameter.
    pub collects_kwargs: bool,
    /// Body contains `yield`; calls construct a generator instead of a frame.
    pub is_generator: bool,
    /// Declared `@staticmethod`; attribute access returns it unbound.
    pub is_static_method: bool,
}

/// Debug record mapping a local slot to its name and live bytecode range.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalEntry {
    pub slot: u32,
    pub birthday: u32,
    pub deathday: u32,
    pub name: HeapId,
}

/// A compiled function: a chunk plus everything the call machinery needs to
/// bind arguments and everything tooling needs to describe the function.
#[derive(Debug)]
pub(crate) struct FunctionObj {
    pub chunk: Chunk,
    pub name: Option<HeapId>,
    pub docstring: Option<HeapId>,
    /// Names of required positional parameters, in order.
    pub required_args: Vec<HeapId>,
    /// Names of defaulted (keyword) parameters, in order, followed by the
    /// collector names when present.
    pub keyword_args: Vec<HeapId>,
    pub upvalue_count: usize,
    pub flags: FunctionFlags,
    pub local_names: Vec<LocalEntry>,
    /// Module instance whose field table is this function's global namespace.
    pub globals: Option<HeapId>,
}

impl FunctionObj {
    pub fn new() -> Self {
        Self {
            chunk: Chunk::new(),
            name: None,
            docstring: None,
            required_args: Vec::new(),
            keyword_args: Vec::new(),
            upvalue_count: 0,
            flags: FunctionFlags::default(),
            local_names: Vec::new(),
            globals: None,
        }
    }
}

/// A function together with its captured upvalues.
#[derive(Debug)]
pub(crate) struct ClosureObj {
    pub function: HeapId,
    pub upvalues: Vec<HeapId>,
}

/// A captured variable: open while its stack slot is live, closed after.
#[derive(Debug)]
pub(crate) struct UpvalueObj {
    /// Absolute stack slot while open; `None` once closed.
    pub location: Option<usize>,
    /// The captured value once closed.
    pub closed: Value,
}

/// Native function signature. `args[0]` is the receiver for methods. When
/// `has_kwargs` is set the final argument is a dict of keyword arguments.
pub type NativeFn = fn(&mut Vm, &[Value], bool) -> VmResult<Value>;

/// A function implemented in Rust.
#[derive(Debug)]
pub(crate) struct NativeObj {
    pub function: NativeFn,
    pub name: &'static str,
    pub doc: Option<&'static str>,
    pub is_method: bool,
    /// Attribute access calls the function instead of binding it.
    pub is_dynamic_property: bool,
    /// Attribute access returns the native unbound.
    pub is_static: bool,
}

/// A receiver paired with a method, produced by attribute access.
#[derive(Debug)]
pub(crate) struct BoundMethodObj {
    pub receiver: Value,
    pub method: Value,
}

/// A getter wrapper created by `@property`.
#[derive(Debug)]
pub(crate) struct PropertyObj {
    pub method: Value,
}
