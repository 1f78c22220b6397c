//! Interpreter state and the embedding surface.
//!
//! [`Vm`] owns everything: the heap, the (single) interpreter thread with its
//! value and frame stacks, the module table, the builtin and exception class
//! registries, and the cache of interned special-method names. There are no
//! globals; embedders construct a `Vm` and drive it through the methods here.
//!
//! The dispatch loop lives in `execution`, call assembly in `call`, operator
//! dispatch in `operators`. This module holds state, small shared helpers,
//! and the public API: compile / interpret / call, stack manipulation,
//! object creation, class authoring and error signaling.

mod call;
mod execution;
mod operators;

use ahash::AHashMap;
use tracing::debug;

use crate::chunk::Chunk;
use crate::compiler;
use crate::heap::{Heap, HeapData, HeapId};
use crate::modules;
use crate::objects::{
    ClassObj, ClosureObj, FunctionObj, InstanceObj, NativeFn, NativeObj, Special, TupleObj,
};
use crate::value::Value;
use crate::KurokoError;

pub(crate) use call::CallStatus;

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;

/// Marker meaning "an exception is pending on the thread". Carries no data;
/// the exception object itself lives in the thread state so the collector
/// can see it.
#[derive(Debug, Clone, Copy)]
pub struct Raised;

pub type VmResult<T> = Result<T, Raised>;

/// Execution record for one function invocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallFrame {
    pub closure: HeapId,
    /// Offset of the next instruction in the function's chunk.
    pub ip: usize,
    /// Stack offset of local slot 0.
    pub slots: usize,
    /// Where the caller expects the result; the stack is truncated here on
    /// return.
    pub out_slots: usize,
    /// Module instance whose field table is the global namespace.
    pub globals: HeapId,
    /// When the frame was pushed, for the call trace.
    pub entered: std::time::Instant,
}

/// Everything that changes during execution and belongs to one thread.
#[derive(Debug)]
pub(crate) struct ThreadState {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Upvalues whose stack slot is still live, sorted by descending slot.
    pub open_upvalues: Vec<HeapId>,
    pub current_exception: Option<Value>,
    /// Frame index a nested `run` should not unwind past.
    pub exit_on_frame: Option<usize>,
    /// Module currently being executed.
    pub module: HeapId,
    /// Rooted scratch for native-call arguments: the GC treats this as part
    /// of the stack, so natives can re-enter the VM safely.
    pub scratch: Vec<Value>,
    /// Set by `Yield` so the generator driver can capture the resume point.
    pub yield_state: Option<(usize, usize)>,
}

/// Handles to the built-in type objects.
#[derive(Debug, Clone, Copy)]
pub struct BaseClasses {
    pub object: HeapId,
    pub module: HeapId,
    pub type_: HeapId,
    pub int: HeapId,
    pub float: HeapId,
    pub bool_: HeapId,
    pub none_type: HeapId,
    pub str_: HeapId,
    pub function: HeapId,
    pub method: HeapId,
    pub tuple: HeapId,
    pub bytes: HeapId,
    pub list: HeapId,
    pub dict: HeapId,
    pub set: HeapId,
    pub generator: HeapId,
    pub property: HeapId,
    pub range: HeapId,
    pub list_iterator: HeapId,
    pub tuple_iterator: HeapId,
    pub str_iterator: HeapId,
    pub range_iterator: HeapId,
    pub dict_iterator: HeapId,
    pub set_iterator: HeapId,
}

impl BaseClasses {
    pub(crate) fn ids(&self) -> [HeapId; 24] {
        [
            self.object,
            self.module,
            self.type_,
            self.int,
            self.float,
            self.bool_,
            self.none_type,
            self.str_,
            self.function,
            self.method,
            self.tuple,
            self.bytes,
            self.list,
            self.dict,
            self.set,
            self.generator,
            self.property,
            self.range,
            self.list_iterator,
            self.tuple_iterator,
            self.str_iterator,
            self.range_iterator,
            self.dict_iterator,
            self.set_iterator,
        ]
    }
}

/// Handles to the exception hierarchy.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionClasses {
    pub base: HeapId,
    pub syntax_error: HeapId,
    pub type_error: HeapId,
    pub value_error: HeapId,
    pub name_error: HeapId,
    pub attribute_error: HeapId,
    pub index_error: HeapId,
    pub key_error: HeapId,
    pub argument_error: HeapId,
    pub import_error: HeapId,
    pub not_implemented_error: HeapId,
    pub zero_division_error: HeapId,
    pub overflow_error: HeapId,
    pub stop_iteration: HeapId,
}

impl ExceptionClasses {
    pub(crate) fn ids(&self) -> [HeapId; 14] {
        [
            self.base,
            self.syntax_error,
            self.type_error,
            self.value_error,
            self.name_error,
            self.attribute_error,
            self.index_error,
            self.key_error,
            self.argument_error,
            self.import_error,
            self.not_implemented_error,
            self.zero_division_error,
            self.overflow_error,
            self.stop_iteration,
        ]
    }
}

/// Behavior switches, settable at construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmFlags {
    /// Disassemble each instruction as it executes (via `tracing`).
    pub trace: bool,
    /// Collect at every safe point instead of on the allocation threshold.
    pub stress_gc: bool,
    /// Suppress the traceback dump for uncaught exceptions.
    pub clean_output: bool,
}

use strum::EnumCount as _;
const SPECIAL_COUNT: usize = Special::COUNT;

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) thread: ThreadState,
    pub(crate) modules: AHashMap<Box<str>, HeapId>,
    pub(crate) builtins: HeapId,
    pub(crate) system: HeapId,
    pub(crate) base: BaseClasses,
    pub(crate) exceptions: ExceptionClasses,
    pub(crate) specials: [HeapId; SPECIAL_COUNT],
    pub(crate) flags: VmFlags,
    /// When set, `print` appends here instead of writing to stdout.
    pub(crate) captured_output: Option<String>,
    /// When set, every returned call appends a trace line here.
    pub(crate) call_trace: Option<String>,
}

impl Vm {
    pub fn new(flags: VmFlags) -> Self {
        let mut heap = Heap::new();
        heap.set_stress(flags.stress_gc);

        let mut specials = [HeapId::invalid(); SPECIAL_COUNT];
        for special in Special::all() {
            let id = heap.intern(special.method_name());
            heap.make_immortal(id);
            specials[special as usize] = id;
        }

        let (base, exceptions, builtins, system, main_module) =
            crate::builtins::bootstrap(&mut heap);

        let mut vm = Vm {
            heap,
            thread: ThreadState {
                stack: Vec::with_capacity(256),
                frames: Vec::with_capacity(FRAMES_MAX),
                open_upvalues: Vec::new(),
                current_exception: None,
                exit_on_frame: None,
                module: main_module,
                scratch: Vec::new(),
                yield_state: None,
            },
            modules: AHashMap::new(),
            builtins,
            system,
            base,
            exceptions,
            specials,
            flags,
            captured_output: None,
            call_trace: None,
        };
        crate::builtins::install(&mut vm);
        vm.modules.insert("__builtins__".into(), builtins);
        vm.modules.insert("kuroko".into(), system);
        vm.modules.insert("__main__".into(), main_module);
        vm
    }

    // ------------------------------------------------------------------
    // Stack manipulation (embedding API)
    // ------------------------------------------------------------------

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.thread.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        self.thread.stack.pop().expect("value stack underflow")
    }

    /// Value `distance` slots below the top.
    #[inline]
    pub fn peek(&self, distance: usize) -> Value {
        let len = self.thread.stack.len();
        self.thread.stack[len - 1 - distance]
    }

    #[inline]
    pub fn stack_top(&self) -> usize {
        self.thread.stack.len()
    }

    pub(crate) fn swap(&mut self, distance: usize) {
        let len = self.thread.stack.len();
        self.thread.stack.swap(len - 1, len - 1 - distance);
    }

    pub fn reset_stack(&mut self) {
        self.thread.stack.clear();
        self.thread.frames.clear();
        self.thread.open_upvalues.clear();
        self.thread.scratch.clear();
        self.thread.exit_on_frame = None;
        self.thread.yield_state = None;
    }

    // ------------------------------------------------------------------
    // Object creation (embedding API)
    // ------------------------------------------------------------------

    pub fn copy_string(&mut self, s: &str) -> Value {
        Value::Ref(self.heap.intern(s))
    }

    pub fn take_string(&mut self, s: String) -> Value {
        Value::Ref(self.heap.take_string(s))
    }

    pub fn new_tuple(&mut self, items: Vec<Value>) -> Value {
        Value::Ref(self.heap.allocate(HeapData::Tuple(TupleObj::new(items))))
    }

    pub fn new_bytes(&mut self, bytes: Vec<u8>) -> Value {
        Value::Ref(
            self.heap
                .allocate(HeapData::Bytes(crate::objects::BytesObj::new(bytes))),
        )
    }

    pub fn new_instance(&mut self, class: HeapId) -> Value {
        Value::Ref(self.heap.allocate(HeapData::Instance(InstanceObj::new(class))))
    }

    pub(crate) fn new_list(&mut self, items: Vec<Value>) -> Value {
        Value::Ref(
            self.heap
                .allocate(HeapData::List(crate::objects::ListObj::new(items))),
        )
    }

    // ------------------------------------------------------------------
    // Class authoring (embedding API)
    // ------------------------------------------------------------------

    /// Creates a class and, when a module is given, binds it there by name.
    pub fn make_class(&mut self, module: Option<HeapId>, name: &str, base: HeapId) -> HeapId {
        let name_id = self.heap.intern(name);
        let class = self
            .heap
            .allocate(HeapData::Class(ClassObj::new(name_id, Some(base))));
        if let Some(module) = module {
            self.set_field(module, name, Value::Ref(class));
        }
        class
    }

    /// Registers a native method on a class. Names follow the original
    /// convention: a leading `.` marks a method, a leading `:` a dynamic
    /// property, a leading `!` a static method; the prefix is stripped.
    pub fn define_native(&mut self, class: HeapId, name: &'static str, function: NativeFn) {
        let (clean, is_method, is_dynamic, is_static) = match name.as_bytes().first() {
            Some(b'.') => (&name[1..], true, false, false),
            Some(b':') => (&name[1..], true, true, false),
            Some(b'!') => (&name[1..], false, false, true),
            _ => (name, false, false, false),
        };
        let native = self.heap.allocate(HeapData::Native(NativeObj {
            function,
            name: clean,
            doc: None,
            is_method,
            is_dynamic_property: is_dynamic,
            is_static,
        }));
        let key = self.heap.intern(clean);
        self.heap.with_entry(class, |heap, data| {
            if let HeapData::Class(c) = data {
                c.methods.set(heap, Value::Ref(key), Value::Ref(native));
            }
        });
    }

    /// Binds a native function into a module namespace.
    pub fn define_module_native(&mut self, module: HeapId, name: &'static str, function: NativeFn) {
        let native = self.heap.allocate(HeapData::Native(NativeObj {
            function,
            name,
            doc: None,
            is_method: false,
            is_dynamic_property: false,
            is_static: false,
        }));
        self.set_field(module, name, Value::Ref(native));
    }

    /// Looks up a native registered on `class` and attaches its docstring.
    /// Returns whether the method was found.
    pub fn set_method_doc(&mut self, class: HeapId, name: &str, doc: &'static str) -> bool {
        let Some(key) = self.heap.lookup_interned(name) else {
            return false;
        };
        let found = match self.heap.get(class) {
            HeapData::Class(c) => c.methods.get(&self.heap, Value::Ref(key)),
            _ => None,
        };
        match found.and_then(|v| v.as_ref_id()) {
            Some(id) => match self.heap.get_mut(id) {
                HeapData::Native(n) => {
                    n.doc = Some(doc);
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Populates the protocol-slot cache from the method tables, walking the
    /// base chain. Call after attaching methods; the `Finalize` opcode does
    /// this for class bodies.
    pub fn finalize_class(&mut self, class: HeapId) {
        for special in Special::all() {
            let name = self.specials[special as usize];
            let mut found = None;
            let mut cursor = Some(class);
            while let Some(current) = cursor {
                let HeapData::Class(c) = self.heap.get(current) else {
                    break;
                };
                if let Some(v) = c.methods.get(&self.heap, Value::Ref(name)) {
                    found = Some(v);
                    break;
                }
                cursor = c.base;
            }
            // Only callables belong in the cache.
            let found = found.filter(|v| {
                matches!(
                    v.as_ref_id().map(|id| self.heap.get(id)),
                    Some(HeapData::Closure(_) | HeapData::Native(_))
                )
            });
            if let HeapData::Class(c) = self.heap.get_mut(class) {
                c.cache[special as usize] = found;
            }
        }
    }

    // ------------------------------------------------------------------
    // Compilation and execution (embedding API)
    // ------------------------------------------------------------------

    /// Compiles source into a function object without running it.
    pub fn compile(&mut self, source: &str, filename: &str) -> Result<Value, KurokoError> {
        compiler::compile(self, source, filename).map(Value::Ref)
    }

    /// Compiles and runs `source` in the `__main__` module.
    pub fn interpret(&mut self, source: &str, filename: &str) -> Result<Value, KurokoError> {
        let function = compiler::compile(self, source, filename)?;
        let closure = self
            .heap
            .allocate(HeapData::Closure(ClosureObj {
                function,
                upvalues: Vec::new(),
            }));
        self.reset_stack();
        self.thread.current_exception = None;
        self.push(Value::Ref(closure));
        let status = self
            .call_value(Value::Ref(closure), 0, 1)
            .map_err(|_| self.take_runtime_error())?;
        let result = match status {
            CallStatus::Returned => self.pop(),
            CallStatus::FramePushed => self.run().map_err(|_| self.take_runtime_error())?,
        };
        Ok(result)
    }

    /// Calls a callable with already-materialized arguments.
    pub fn call(&mut self, callable: Value, args: Vec<Value>) -> Result<Value, KurokoError> {
        let argc = args.len();
        self.push(callable);
        for arg in args {
            self.push(arg);
        }
        // The callee slot under the args lets bound methods and classes
        // rewrite it, mirroring the `Call` instruction's layout.
        let result = (|| {
            let status = self.call_value(self.peek(argc), argc, 1)?;
            match status {
                CallStatus::Returned => Ok(self.pop()),
                CallStatus::FramePushed => self.run_next(),
            }
        })();
        result.map_err(|_| self.take_runtime_error())
    }

    /// Reads a global from the `__main__` module (then builtins).
    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let key = Value::Ref(self.heap.intern(name));
        let main = *self.modules.get("__main__")?;
        self.fields_get(main, key)
            .or_else(|| self.fields_get(self.builtins, key))
    }

    /// Runs a full collection cycle. Safe to call from embedding code at any
    /// point where no VM call is mid-flight.
    pub fn collect(&mut self) {
        let Vm {
            heap,
            thread,
            modules,
            builtins,
            system,
            base,
            exceptions,
            specials,
            ..
        } = self;
        for &v in &thread.stack {
            heap.mark_value(v);
        }
        for frame in &thread.frames {
            heap.mark_object(frame.closure);
            heap.mark_object(frame.globals);
        }
        for &upvalue in &thread.open_upvalues {
            heap.mark_object(upvalue);
        }
        for &v in &thread.scratch {
            heap.mark_value(v);
        }
        if let Some(exc) = thread.current_exception {
            heap.mark_value(exc);
        }
        heap.mark_object(thread.module);
        for &module in modules.values() {
            heap.mark_object(module);
        }
        heap.mark_object(*builtins);
        heap.mark_object(*system);
        for id in base.ids() {
            heap.mark_object(id);
        }
        for id in exceptions.ids() {
            heap.mark_object(id);
        }
        for &id in specials.iter() {
            heap.mark_object(id);
        }
        heap.trace_references();
        heap.sweep();
        debug!(live = self.heap.live_objects(), "gc cycle complete");
    }

    #[inline]
    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect();
        }
    }

    // ------------------------------------------------------------------
    // Output capture
    // ------------------------------------------------------------------

    /// Routes `print` into an internal buffer instead of stdout.
    pub fn capture_output(&mut self) {
        self.captured_output = Some(String::new());
    }

    /// Takes everything printed since the last call.
    pub fn take_output(&mut self) -> String {
        match &mut self.captured_output {
            Some(buffer) => std::mem::take(buffer),
            None => String::new(),
        }
    }

    pub(crate) fn write_output(&mut self, text: &str) {
        match &mut self.captured_output {
            Some(buffer) => buffer.push_str(text),
            None => print!("{text}"),
        }
    }

    // ------------------------------------------------------------------
    // Call tracing
    // ------------------------------------------------------------------

    /// Starts recording one line per returned call, in the profiler format
    /// `callerFile callerFunc callerLine calleeFile calleeFunc calleeLine
    /// nanoseconds`.
    pub fn start_call_trace(&mut self) {
        self.call_trace = Some(String::new());
    }

    /// Takes everything traced since the last call.
    pub fn take_call_trace(&mut self) -> String {
        match &mut self.call_trace {
            Some(buffer) => std::mem::take(buffer),
            None => String::new(),
        }
    }

    /// Appends the trace line for a frame that just returned. The caller is
    /// whatever frame is now on top; top-level returns have none and are not
    /// traced.
    pub(crate) fn record_call_return(&mut self, returned: &CallFrame) {
        let Some(caller) = self.thread.frames.last().copied() else {
            return;
        };
        let elapsed = returned.entered.elapsed().as_nanos();
        let describe = |vm: &Vm, frame: &CallFrame, offset: usize| {
            let function = vm.function_of(frame.closure);
            let file = function
                .chunk
                .filename
                .map(|f| vm.heap.str_content(f).to_string())
                .unwrap_or_else(|| "?".to_string());
            let name = function
                .name
                .map(|n| vm.heap.str_content(n).to_string())
                .unwrap_or_else(|| "<module>".to_string());
            (file, name, function.chunk.line_for_offset(offset))
        };
        let (caller_file, caller_func, caller_line) =
            describe(self, &caller, caller.ip.saturating_sub(1));
        let (callee_file, callee_func, callee_line) = describe(self, returned, 0);
        if let Some(trace) = &mut self.call_trace {
            trace.push_str(&format!(
                "{caller_file} {caller_func} {caller_line} {callee_file} {callee_func} {callee_line} {elapsed}\n"
            ));
        }
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Builds an exception instance, attaches source location from the
    /// active frame, and marks it pending. Returns the `Raised` marker so
    /// call sites can `return Err(vm.runtime_error(...))`.
    pub fn runtime_error(&mut self, class: HeapId, message: impl Into<String>) -> Raised {
        let message = message.into();
        let instance = self.heap.allocate(HeapData::Instance(InstanceObj::new(class)));
        let arg = self.heap.take_string(message);
        self.set_field(instance, "arg", Value::Ref(arg));
        self.attach_traceback(instance);
        self.thread.current_exception = Some(Value::Ref(instance));
        Raised
    }

    /// Fills in `file` / `func` / `lineno` fields from the active frame.
    pub(crate) fn attach_traceback(&mut self, instance: HeapId) {
        let Some(frame) = self.thread.frames.last().copied() else {
            return;
        };
        let (file, func, lineno) = {
            let function = self.closure_function(frame.closure);
            let HeapData::Function(f) = self.heap.get(function) else {
                return;
            };
            let offset = frame.ip.saturating_sub(1);
            (
                f.chunk.filename,
                f.name,
                f.chunk.line_for_offset(offset),
            )
        };
        if let Some(file) = file {
            self.set_field(instance, "file", Value::Ref(file));
        }
        if let Some(func) = func {
            self.set_field(instance, "func", Value::Ref(func));
        }
        self.set_field(instance, "lineno", Value::Int(i64::from(lineno)));
    }

    /// Formats the pending exception (without calling managed code) and
    /// clears it, for surfacing through [`KurokoError`].
    pub(crate) fn take_runtime_error(&mut self) -> KurokoError {
        let Some(exc) = self.thread.current_exception.take() else {
            return KurokoError::Runtime {
                traceback: "unknown error".to_string(),
            };
        };
        KurokoError::Runtime {
            traceback: self.describe_exception(exc),
        }
    }

    /// A `ClassName: arg` one-liner plus location, safe against re-raising.
    pub(crate) fn describe_exception(&mut self, exc: Value) -> String {
        let class = self.class_of(exc);
        let class_name = self.heap.str_content(self.class_name(class)).to_string();
        let mut out = String::new();
        if let Some(instance) = exc.as_ref_id() {
            if matches!(self.heap.get(instance), HeapData::Instance(_)) {
                let file = self
                    .get_field(instance, "file")
                    .and_then(|v| v.as_ref_id())
                    .map(|id| self.heap.str_content(id).to_string());
                let lineno = self
                    .get_field(instance, "lineno")
                    .and_then(|v| v.as_int());
                if let (Some(file), Some(lineno)) = (file, lineno) {
                    out.push_str(&format!("  File \"{file}\", line {lineno}\n"));
                }
                out.push_str(&class_name);
                if let Some(arg) = self.get_field(instance, "arg") {
                    if let Some(id) = arg.as_ref_id() {
                        if let HeapData::Str(s) = self.heap.get(id) {
                            out.push_str(": ");
                            out.push_str(s.as_str());
                            return out;
                        }
                    }
                    if !matches!(arg, Value::None) {
                        out.push_str(&format!(": {arg:?}"));
                    }
                }
                return out;
            }
        }
        match self.repr_no_reenter(exc) {
            Some(repr) => repr,
            None => class_name,
        }
    }

    // ------------------------------------------------------------------
    // Type queries
    // ------------------------------------------------------------------

    /// The class object for any value.
    pub fn class_of(&self, v: Value) -> HeapId {
        match v {
            Value::None => self.base.none_type,
            Value::Bool(_) => self.base.bool_,
            Value::Int(_) => self.base.int,
            Value::Float(_) => self.base.float,
            Value::Handler(_) | Value::Kwargs(_) => self.base.object,
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(_) => self.base.str_,
                HeapData::Bytes(_) => self.base.bytes,
                HeapData::Tuple(_) => self.base.tuple,
                HeapData::List(_) => self.base.list,
                HeapData::Dict(_) => self.base.dict,
                HeapData::Set(_) => self.base.set,
                HeapData::Function(_) | HeapData::Closure(_) | HeapData::Native(_) => {
                    self.base.function
                }
                HeapData::Upvalue(_) | HeapData::Moved => self.base.object,
                HeapData::Class(_) => self.base.type_,
                HeapData::Instance(i) => i.class,
                HeapData::BoundMethod(_) => self.base.method,
                HeapData::Property(_) => self.base.property,
                HeapData::Generator(_) => self.base.generator,
            },
        }
    }

    pub fn is_instance_of(&self, v: Value, class: HeapId) -> bool {
        let mut cursor = Some(self.class_of(v));
        while let Some(current) = cursor {
            if current == class {
                return true;
            }
            cursor = match self.heap.get(current) {
                HeapData::Class(c) => c.base,
                _ => None,
            };
        }
        false
    }

    pub(crate) fn type_name(&self, v: Value) -> &str {
        self.heap.str_content(self.class_name(self.class_of(v)))
    }

    pub(crate) fn class_name(&self, class: HeapId) -> HeapId {
        match self.heap.get(class) {
            HeapData::Class(c) => c.name,
            _ => panic!("class_name of non-class"),
        }
    }

    /// Protocol-slot lookup on a value's class.
    pub(crate) fn special_of(&self, v: Value, which: Special) -> Option<Value> {
        match self.heap.get(self.class_of(v)) {
            HeapData::Class(c) => c.special(which),
            _ => None,
        }
    }

    /// Truthiness: `None`, `False`, numeric zero and empty containers are
    /// falsey.
    pub(crate) fn is_falsey(&self, v: Value) -> bool {
        match v {
            Value::None => true,
            Value::Bool(b) => !b,
            Value::Int(i) => i == 0,
            Value::Float(f) => f == 0.0,
            Value::Handler(_) | Value::Kwargs(_) => false,
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(s) => s.byte_len() == 0,
                HeapData::Bytes(b) => b.bytes.is_empty(),
                HeapData::Tuple(t) => t.items.is_empty(),
                HeapData::List(l) => l.items.is_empty(),
                HeapData::Dict(d) => d.entries.is_empty(),
                HeapData::Set(s) => s.entries.is_empty(),
                _ => false,
            },
        }
    }

    // ------------------------------------------------------------------
    // Field access helpers
    // ------------------------------------------------------------------

    /// Sets a named field on an instance (or method on a class).
    pub(crate) fn set_field(&mut self, target: HeapId, name: &str, value: Value) {
        let key = self.heap.intern(name);
        self.set_field_by_id(target, key, value);
    }

    pub(crate) fn set_field_by_id(&mut self, target: HeapId, name: HeapId, value: Value) {
        self.heap.with_entry(target, |heap, data| match data {
            HeapData::Instance(i) => {
                i.fields.set(heap, Value::Ref(name), value);
            }
            HeapData::Class(c) => {
                c.methods.set(heap, Value::Ref(name), value);
            }
            other => panic!("set_field on {}", other.kind_name()),
        });
    }

    pub(crate) fn get_field(&self, target: HeapId, name: &str) -> Option<Value> {
        let key = self.heap.lookup_interned(name)?;
        self.fields_get(target, Value::Ref(key))
    }

    pub(crate) fn fields_get(&self, target: HeapId, key: Value) -> Option<Value> {
        match self.heap.get(target) {
            HeapData::Instance(i) => i.fields.get(&self.heap, key),
            HeapData::Class(c) => c.methods.get(&self.heap, key),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Frame and chunk access
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn frame(&self) -> &CallFrame {
        self.thread.frames.last().expect("no active frame")
    }

    #[inline]
    pub(crate) fn frame_mut(&mut self) -> &mut CallFrame {
        self.thread.frames.last_mut().expect("no active frame")
    }

    /// The function object backing a closure.
    pub(crate) fn closure_function(&self, closure: HeapId) -> HeapId {
        match self.heap.get(closure) {
            HeapData::Closure(c) => c.function,
            _ => panic!("expected closure"),
        }
    }

    pub(crate) fn chunk_for(&self, closure: HeapId) -> &Chunk {
        match self.heap.get(self.closure_function(closure)) {
            HeapData::Function(f) => &f.chunk,
            _ => panic!("closure without function"),
        }
    }

    pub(crate) fn function_of(&self, closure: HeapId) -> &FunctionObj {
        match self.heap.get(self.closure_function(closure)) {
            HeapData::Function(f) => f,
            _ => panic!("closure without function"),
        }
    }

    // ------------------------------------------------------------------
    // repr / str
    // ------------------------------------------------------------------

    /// `repr(v)` as a Rust string; dispatches `__repr__`.
    pub(crate) fn repr_value(&mut self, v: Value) -> VmResult<String> {
        match self.special_of(v, Special::Repr) {
            Some(repr_fn) => {
                self.push(v);
                let result = self.call_simple(repr_fn, 1)?;
                self.expect_str(result, "__repr__ must return a str")
            }
            None => Ok(format!("<{} object>", self.type_name(v))),
        }
    }

    /// `str(v)`: `__str__` when present, `repr` otherwise.
    pub(crate) fn str_value(&mut self, v: Value) -> VmResult<String> {
        match self.special_of(v, Special::Str) {
            Some(str_fn) => {
                self.push(v);
                let result = self.call_simple(str_fn, 1)?;
                self.expect_str(result, "__str__ must return a str")
            }
            None => self.repr_value(v),
        }
    }

    fn expect_str(&mut self, v: Value, message: &str) -> VmResult<String> {
        if let Some(id) = v.as_ref_id() {
            if let HeapData::Str(s) = self.heap.get(id) {
                return Ok(s.as_str().to_string());
            }
        }
        Err(self.runtime_error(self.exceptions.type_error, message.to_string()))
    }

    /// Primitive-only repr that cannot call managed code; used by error
    /// reporting where re-raising must be impossible.
    fn repr_no_reenter(&self, v: Value) -> Option<String> {
        match v {
            Value::None => Some("None".to_string()),
            Value::Bool(b) => Some(if b { "True" } else { "False" }.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(format_float(f)),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(s) => Some(crate::objects::string_repr(s.as_str())),
                _ => None,
            },
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    /// Recursive dotted import; leaves the final module on the stack.
    pub(crate) fn import_module(&mut self, name: HeapId) -> VmResult<()> {
        modules::do_recursive_module_load(self, name)
    }

    /// Loads (or returns the cached) module for a dotted name.
    pub fn load_module(&mut self, dotted: &str) -> Result<Value, KurokoError> {
        let name = self.heap.intern(dotted);
        self.import_module(name)
            .map_err(|_| self.take_runtime_error())?;
        Ok(self.pop())
    }
}

/// Floats always display with a decimal point (`1.0`, not `1`).
pub(crate) fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}
