//! The dispatch loop.
//!
//! One instruction per iteration: decode the opcode, pull its operand using
//! the width encoded in the opcode's top two bits, advance the frame's
//! instruction pointer, then execute. Collection runs between instructions
//! (the GC safe point). Exceptions are data, not Rust panics or `?`-style
//! early exits out of the loop: a `Raised` result from a handler sends
//! control to `handle_exception`, which walks the stack for `try`/`with`
//! handler records, invoking `__exit__` along the way, and either transfers
//! control or reports the exception to the caller.

use tracing::trace;

use super::{CallFrame, CallStatus, Raised, Vm, VmResult};
use crate::chunk::OpCode;
use crate::heap::{HeapData, HeapId};
use crate::objects::{ClassObj, ClosureObj, PropertyObj, Special, TupleObj, UpvalueObj};
use crate::value::{values_same, Handler, HandlerKind, Value, KWARGS_SINGLE, KWARGS_UNSET};

/// What the instruction that just executed wants the loop to do.
enum Flow {
    Continue,
    /// Leave `run` with this value (top frame returned, or a yield).
    Exit(Value),
}

impl Vm {
    /// Runs until the current frame chain unwinds past the exit boundary.
    /// On success the result value is returned (not pushed). On `Err` the
    /// pending exception was not handled below the boundary.
    pub(crate) fn run(&mut self) -> VmResult<Value> {
        loop {
            self.maybe_collect();

            let frame = *self.frame();
            let (op, operand, next_ip) = self.decode(&frame);
            if self.flags.trace {
                let chunk = self.chunk_for(frame.closure);
                trace!(
                    "{}",
                    crate::debug::disassemble_instruction(chunk, &self.heap, frame.ip).0
                );
            }
            self.frame_mut().ip = next_ip;

            match self.execute(op, operand) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(value)) => return Ok(value),
                Err(Raised) => {
                    if !self.handle_exception() {
                        return Err(Raised);
                    }
                }
            }
        }
    }

    /// Runs the just-pushed frame to completion; used by natives and by the
    /// VM itself to call managed code mid-instruction.
    pub(crate) fn run_next(&mut self) -> VmResult<Value> {
        let previous = self.thread.exit_on_frame;
        self.thread.exit_on_frame = Some(self.thread.frames.len() - 1);
        let result = self.run();
        self.thread.exit_on_frame = previous;
        result
    }

    fn decode(&self, frame: &CallFrame) -> (OpCode, usize, usize) {
        let chunk = self.chunk_for(frame.closure);
        let byte = chunk.code[frame.ip];
        let op = OpCode::from_repr(byte).unwrap_or_else(|| {
            panic!(
                "corrupt chunk: byte {byte:#04x} at offset {} is not an opcode",
                frame.ip
            )
        });
        let width = op.operand_width();
        let mut operand = 0usize;
        for i in 0..width {
            operand = operand << 8 | usize::from(chunk.code[frame.ip + 1 + i]);
        }
        (op, operand, frame.ip + 1 + width)
    }

    fn execute(&mut self, op: OpCode, operand: usize) -> VmResult<Flow> {
        match op {
            // ---------------- simple stack and literals ----------------
            OpCode::None => self.push(Value::None),
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::Pop => {
                self.pop();
            }
            OpCode::Swap => self.swap(1),
            OpCode::Dup | OpCode::DupLong => {
                let v = self.peek(operand);
                self.push(v);
            }
            OpCode::Not => {
                let v = self.pop();
                let falsey = self.is_falsey(v);
                self.push(Value::Bool(falsey));
            }
            OpCode::Is => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(values_same(a, b)));
            }
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                let eq = self.values_equal_dispatch(a, b)?;
                self.push(Value::Bool(eq));
            }

            // ---------------- arithmetic ----------------
            OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Modulo
            | OpCode::Pow
            | OpCode::BitAnd
            | OpCode::BitOr
            | OpCode::BitXor
            | OpCode::ShiftLeft
            | OpCode::ShiftRight
            | OpCode::Less
            | OpCode::Greater => {
                let b = self.pop();
                let a = self.pop();
                let result = self.binary_operator(op, a, b)?;
                self.push(result);
            }
            OpCode::Negate => {
                let v = self.pop();
                let result = match v {
                    Value::Int(i) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| {
                            self.runtime_error(
                                self.exceptions.overflow_error,
                                "integer negation overflows",
                            )
                        })?,
                    Value::Float(f) => Value::Float(-f),
                    Value::Bool(b) => Value::Int(-i64::from(b)),
                    _ => {
                        return Err(self.runtime_error(
                            self.exceptions.type_error,
                            format!("bad operand type for unary -: '{}'", self.type_name(v)),
                        ))
                    }
                };
                self.push(result);
            }
            OpCode::BitNegate => {
                let v = self.pop();
                match v.as_int() {
                    Some(i) => self.push(Value::Int(!i)),
                    None => {
                        return Err(self.runtime_error(
                            self.exceptions.type_error,
                            format!("bad operand type for unary ~: '{}'", self.type_name(v)),
                        ))
                    }
                }
            }

            // ---------------- locals, globals, upvalues ----------------
            OpCode::Constant | OpCode::ConstantLong => {
                let constant = self.frame_constant(operand);
                self.push(constant);
            }
            OpCode::GetLocal | OpCode::GetLocalLong => {
                let slot = self.frame().slots + operand;
                self.push(self.thread.stack[slot]);
            }
            OpCode::SetLocal | OpCode::SetLocalLong => {
                let slot = self.frame().slots + operand;
                self.thread.stack[slot] = self.peek(0);
            }
            OpCode::Inc | OpCode::IncLong => {
                let slot = self.frame().slots + operand;
                let old = self.thread.stack[slot].as_int().expect("Inc on non-int");
                self.thread.stack[slot] = Value::Int(old.wrapping_add(1));
            }
            OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                let name = self.frame_string(operand);
                let globals = self.frame().globals;
                let value = self.peek(0);
                self.set_field_by_id(globals, name, value);
                self.pop();
            }
            OpCode::GetGlobal | OpCode::GetGlobalLong => {
                let name = self.frame_string(operand);
                let globals = self.frame().globals;
                let value = self
                    .fields_get(globals, Value::Ref(name))
                    .or_else(|| self.fields_get(self.builtins, Value::Ref(name)));
                match value {
                    Some(v) => self.push(v),
                    None => return Err(self.undefined_variable(name)),
                }
            }
            OpCode::SetGlobal | OpCode::SetGlobalLong => {
                // Assignment to an unlisted name defines it in the module
                // namespace.
                let name = self.frame_string(operand);
                let globals = self.frame().globals;
                let value = self.peek(0);
                self.set_field_by_id(globals, name, value);
            }
            OpCode::DelGlobal | OpCode::DelGlobalLong => {
                let name = self.frame_string(operand);
                let globals = self.frame().globals;
                let removed = self.heap.with_entry(globals, |heap, data| match data {
                    HeapData::Instance(i) => i.fields.delete(heap, Value::Ref(name)),
                    _ => false,
                });
                if !removed {
                    return Err(self.undefined_variable(name));
                }
            }
            OpCode::GetUpvalue | OpCode::GetUpvalueLong => {
                let upvalue = self.frame_upvalue(operand);
                let value = match self.heap.get(upvalue) {
                    HeapData::Upvalue(u) => match u.location {
                        Some(slot) => self.thread.stack[slot],
                        None => u.closed,
                    },
                    _ => unreachable!("closure upvalue is not an upvalue"),
                };
                self.push(value);
            }
            OpCode::SetUpvalue | OpCode::SetUpvalueLong => {
                let upvalue = self.frame_upvalue(operand);
                let value = self.peek(0);
                let slot = match self.heap.get_mut(upvalue) {
                    HeapData::Upvalue(u) => match u.location {
                        Some(slot) => Some(slot),
                        None => {
                            u.closed = value;
                            None
                        }
                    },
                    _ => unreachable!(),
                };
                if let Some(slot) = slot {
                    self.thread.stack[slot] = value;
                }
            }
            OpCode::CloseUpvalue => {
                let top = self.stack_top() - 1;
                self.close_upvalues(top);
                self.pop();
            }

            // ---------------- closures and classes ----------------
            OpCode::Closure | OpCode::ClosureLong => {
                let function = self
                    .frame_constant(operand)
                    .as_ref_id()
                    .expect("closure constant");
                let upvalue_count = match self.heap.get(function) {
                    HeapData::Function(f) => f.upvalue_count,
                    _ => panic!("Closure operand is not a function"),
                };
                let closure = self.heap.allocate(HeapData::Closure(ClosureObj {
                    function,
                    upvalues: Vec::with_capacity(upvalue_count),
                }));
                self.push(Value::Ref(closure));
                let frame = *self.frame();
                let mut upvalues = Vec::with_capacity(upvalue_count);
                for _ in 0..upvalue_count {
                    let flags = self.read_frame_byte();
                    let index = self.read_frame_operand(if flags & 2 != 0 { 3 } else { 1 });
                    if flags & 1 != 0 {
                        upvalues.push(self.capture_upvalue(frame.slots + index));
                    } else {
                        let parent = match self.heap.get(frame.closure) {
                            HeapData::Closure(c) => c.upvalues[index],
                            _ => unreachable!(),
                        };
                        upvalues.push(parent);
                    }
                }
                if let HeapData::Closure(c) = self.heap.get_mut(closure) {
                    c.upvalues = upvalues;
                }
            }
            OpCode::Class | OpCode::ClassLong => {
                let name = self.frame_string(operand);
                let mut class = ClassObj::new(name, Some(self.base.object));
                class.filename = self.chunk_for(self.frame().closure).filename;
                let id = self.heap.allocate(HeapData::Class(class));
                self.push(Value::Ref(id));
            }
            OpCode::Inherit => {
                let superclass = self.peek(1);
                let subclass = self.peek(0);
                let Some(base) = superclass
                    .as_ref_id()
                    .filter(|&id| matches!(self.heap.get(id), HeapData::Class(_)))
                else {
                    return Err(self.runtime_error(
                        self.exceptions.type_error,
                        format!(
                            "Superclass must be a class, not '{}'",
                            self.type_name(superclass)
                        ),
                    ));
                };
                let sub = subclass.as_ref_id().expect("Inherit on non-class");
                if let HeapData::Class(c) = self.heap.get_mut(sub) {
                    c.base = Some(base);
                }
            }
            OpCode::Method | OpCode::MethodLong => {
                let name = self.frame_string(operand);
                let method = self.peek(0);
                let class = self.peek(1).as_ref_id().expect("Method outside class body");
                self.heap.with_entry(class, |heap, data| {
                    if let HeapData::Class(c) = data {
                        c.methods.set(heap, Value::Ref(name), method);
                    }
                });
                self.pop();
            }
            OpCode::Finalize => {
                let class = self.peek(0).as_ref_id().expect("Finalize on non-class");
                self.finalize_class(class);
            }
            OpCode::Docstring => {
                let doc = self.pop();
                let class = self.peek(0).as_ref_id().expect("Docstring outside class");
                if let (Some(doc_id), HeapData::Class(c)) =
                    (doc.as_ref_id(), self.heap.get_mut(class))
                {
                    c.docstring = Some(doc_id);
                }
            }
            OpCode::CreateProperty => {
                let method = self.pop();
                let id = self.heap.allocate(HeapData::Property(PropertyObj { method }));
                self.push(Value::Ref(id));
            }

            // ---------------- attribute access ----------------
            OpCode::GetProperty | OpCode::GetPropertyLong => {
                let name = self.frame_string(operand);
                if !self.value_get_property(name)? {
                    let target = self.peek(0);
                    return Err(self.attribute_error(target, name));
                }
            }
            OpCode::SetProperty | OpCode::SetPropertyLong => {
                let name = self.frame_string(operand);
                if !self.value_set_property(name) {
                    let target = self.peek(1);
                    return Err(self.attribute_error(target, name));
                }
            }
            OpCode::DelProperty | OpCode::DelPropertyLong => {
                let name = self.frame_string(operand);
                if !self.value_del_property(name) {
                    let target = self.peek(0);
                    return Err(self.attribute_error(target, name));
                }
            }
            OpCode::GetSuper | OpCode::GetSuperLong => {
                let name = self.frame_string(operand);
                let superclass = self.pop().as_ref_id().expect("super is always a class");
                if !self.bind_method(superclass, name)? {
                    let class_name = self.heap.str_content(self.class_name(superclass));
                    let attr = self.heap.str_content(name);
                    let message =
                        format!("'{class_name}' object has no attribute '{attr}'");
                    return Err(self.runtime_error(self.exceptions.attribute_error, message));
                }
            }

            // ---------------- subscripting ----------------
            OpCode::InvokeGetter => {
                let target = self.peek(1);
                match self.special_of(target, Special::Getter) {
                    Some(getter) => {
                        let result = self.call_simple(getter, 2)?;
                        self.push(result);
                    }
                    None => return Err(self.not_subscriptable(target)),
                }
            }
            OpCode::InvokeSetter => {
                let target = self.peek(2);
                match self.special_of(target, Special::Setter) {
                    Some(setter) => {
                        let result = self.call_simple(setter, 3)?;
                        self.push(result);
                    }
                    None => return Err(self.not_subscriptable(target)),
                }
            }
            OpCode::InvokeDelete => {
                let target = self.peek(1);
                match self.special_of(target, Special::DelItem) {
                    Some(delitem) => {
                        self.call_simple(delitem, 2)?;
                    }
                    None => return Err(self.not_subscriptable(target)),
                }
            }
            OpCode::InvokeGetSlice => {
                let target = self.peek(2);
                match self.special_of(target, Special::GetSlice) {
                    Some(getslice) => {
                        let result = self.call_simple(getslice, 3)?;
                        self.push(result);
                    }
                    None => return Err(self.not_sliceable(target)),
                }
            }
            OpCode::InvokeSetSlice => {
                let target = self.peek(3);
                match self.special_of(target, Special::SetSlice) {
                    Some(setslice) => {
                        let result = self.call_simple(setslice, 4)?;
                        self.push(result);
                    }
                    None => return Err(self.not_sliceable(target)),
                }
            }
            OpCode::InvokeDelSlice => {
                let target = self.peek(2);
                match self.special_of(target, Special::DelSlice) {
                    Some(delslice) => {
                        self.call_simple(delslice, 3)?;
                    }
                    None => return Err(self.not_sliceable(target)),
                }
            }

            // ---------------- tuples and unpacking ----------------
            OpCode::Tuple | OpCode::TupleLong => {
                let len = self.stack_top();
                let items = self.thread.stack.split_off(len - operand);
                let id = self.heap.allocate(HeapData::Tuple(TupleObj::new(items)));
                self.push(Value::Ref(id));
            }
            OpCode::Unpack | OpCode::UnpackLong => self.unpack(operand)?,

            // ---------------- calls ----------------
            OpCode::Call | OpCode::CallLong => {
                let callee = self.peek(operand);
                self.call_value(callee, operand, 1)?;
            }
            OpCode::CallStack => {
                let count = self
                    .pop()
                    .as_int()
                    .expect("CallStack count is always an int") as usize;
                let callee = self.peek(count);
                self.call_value(callee, count, 1)?;
            }
            OpCode::ExpandArgs | OpCode::ExpandArgsLong => {
                self.push(Value::Kwargs(KWARGS_SINGLE - operand as u32));
            }
            OpCode::Kwargs | OpCode::KwargsLong => {
                self.push(Value::Kwargs(operand as u32));
            }

            // ---------------- control flow ----------------
            OpCode::Jump => {
                self.frame_mut().ip += operand;
            }
            OpCode::JumpIfFalse => {
                let condition = self.peek(0);
                if self.is_falsey(condition) {
                    self.frame_mut().ip += operand;
                }
            }
            OpCode::JumpIfTrue => {
                let condition = self.peek(0);
                if !self.is_falsey(condition) {
                    self.frame_mut().ip += operand;
                }
            }
            OpCode::Loop => {
                self.frame_mut().ip -= operand;
            }

            // ---------------- exceptions and context managers ----------------
            OpCode::PushTry => {
                let target = (self.frame().ip + operand) as u32;
                self.push(Value::None);
                self.push(Value::Handler(Handler {
                    kind: HandlerKind::Try,
                    target,
                }));
            }
            OpCode::PushWith => {
                let target = (self.frame().ip + operand) as u32;
                let manager = self.peek(0);
                let enter = self.special_of(manager, Special::Enter);
                let exit = self.special_of(manager, Special::Exit);
                let (Some(enter), Some(_)) = (enter, exit) else {
                    let missing = if enter.is_none() { "__enter__" } else { "__exit__" };
                    return Err(
                        self.runtime_error(self.exceptions.attribute_error, missing.to_string())
                    );
                };
                self.push(manager);
                self.call_simple(enter, 1)?;
                self.push(Value::None);
                self.push(Value::Handler(Handler {
                    kind: HandlerKind::With,
                    target,
                }));
            }
            OpCode::CleanupWith => return self.cleanup_with(),
            OpCode::FilterExcept => {
                let filter = self.pop();
                let exception = self.peek(1);
                let matched = self.exception_matches(exception, filter)?;
                self.push(Value::Bool(matched));
            }
            OpCode::Raise => {
                let raised = self.peek(0);
                let exception = if matches!(
                    raised.as_ref_id().map(|id| self.heap.get(id)),
                    Some(HeapData::Class(_))
                ) {
                    // `raise ValueError` instantiates with no arguments.
                    match self.call_value(raised, 0, 1)? {
                        CallStatus::Returned => self.pop(),
                        CallStatus::FramePushed => self.run_next()?,
                    }
                } else {
                    self.pop()
                };
                if let Some(id) = exception.as_ref_id() {
                    if matches!(self.heap.get(id), HeapData::Instance(_)) {
                        self.attach_traceback(id);
                    }
                }
                self.thread.current_exception = Some(exception);
                return Err(Raised);
            }

            // ---------------- returns and yields ----------------
            OpCode::Return => {
                let result = self.pop();
                if let Some(exit_value) = self.do_return(result)? {
                    return Ok(Flow::Exit(exit_value));
                }
            }
            OpCode::Yield => {
                let result = self.peek(0);
                let frame = self.thread.frames.pop().expect("yield without a frame");
                debug_assert_eq!(Some(self.thread.frames.len()), self.thread.exit_on_frame);
                self.thread.yield_state = Some((frame.ip, frame.slots));
                return Ok(Flow::Exit(result));
            }

            // ---------------- imports ----------------
            OpCode::Import | OpCode::ImportLong => {
                let name = self.frame_string(operand);
                self.import_module(name)?;
            }
            OpCode::ImportFrom | OpCode::ImportFromLong => {
                let name = self.frame_string(operand);
                if !self.value_get_property(name)? {
                    let module = self.peek(0);
                    let attr = self.heap.str_content(name).to_string();
                    let message = format!(
                        "Can not import '{attr}' from '{}'",
                        self.type_name(module)
                    );
                    return Err(self.runtime_error(self.exceptions.import_error, message));
                }
            }

            // Long-only twins never decoded on their own and width-2 ops are
            // all listed above.
            other => panic!("unhandled opcode {other}"),
        }
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // Returns, unwinding, handlers
    // ------------------------------------------------------------------

    /// Shared return path. Close upvalues, run any `with` cleanups between
    /// here and the frame base, then pop the frame. Returns `Some` when
    /// `run` should exit with the value.
    pub(super) fn do_return(&mut self, result: Value) -> VmResult<Option<Value>> {
        let frame = *self.frame();
        self.close_upvalues(frame.slots);

        // A `with` body exited by `return` still owes its __exit__ call.
        let mut offset = self.stack_top();
        while offset > frame.slots {
            offset -= 1;
            if let Value::Handler(h) = self.thread.stack[offset] {
                if h.kind == HandlerKind::With {
                    self.thread.stack.truncate(offset + 1);
                    self.thread.stack[offset - 1] = result;
                    self.thread.stack[offset] = Value::Handler(Handler {
                        kind: HandlerKind::ReturnWith,
                        target: h.target,
                    });
                    self.frame_mut().ip = h.target as usize;
                    return Ok(None);
                }
            }
        }

        let frame = self.thread.frames.pop().expect("return without a frame");
        if self.call_trace.is_some() {
            self.record_call_return(&frame);
        }
        let is_generator = self.function_of(frame.closure).flags.is_generator;
        self.thread.stack.truncate(frame.out_slots);
        if self.thread.frames.is_empty() {
            return Ok(Some(result));
        }
        if Some(self.thread.frames.len()) == self.thread.exit_on_frame {
            if is_generator {
                // Tell the generator driver this was a return, not a yield.
                self.push(result);
                return Ok(Some(Value::Kwargs(KWARGS_UNSET)));
            }
            return Ok(Some(result));
        }
        self.push(result);
        Ok(None)
    }

    /// `CleanupWith` sits at every `with` region's exit and inspects the
    /// handler to learn how the region is being left.
    fn cleanup_with(&mut self) -> VmResult<Flow> {
        let handler = self
            .peek(0)
            .try_handler()
            .expect("CleanupWith without a handler");
        let manager = self.peek(2);
        let exit = self
            .special_of(manager, Special::Exit)
            .expect("validated by PushWith");

        match handler.kind {
            HandlerKind::With => {
                // Normal fall-through exit.
                self.push(manager);
                self.push(Value::None);
                self.push(Value::None);
                self.push(Value::None);
                self.call_simple(exit, 4)?;
            }
            HandlerKind::WithUnwind => {
                let exception = self.peek(1);
                let exc_class = self.class_of(exception);
                self.push(manager);
                self.push(Value::Ref(exc_class));
                self.push(exception);
                self.push(Value::None);
                let result = self.call_simple(exit, 4)?;
                if self.is_falsey(result) {
                    // Not suppressed; keep unwinding with the original.
                    self.thread.current_exception = Some(exception);
                    return Err(Raised);
                }
            }
            HandlerKind::ReturnWith => {
                let result = self.peek(1);
                self.push(manager);
                self.push(Value::None);
                self.push(Value::None);
                self.push(Value::None);
                self.call_simple(exit, 4)?;
                // Drop the handler pair and resume the interrupted return.
                let top = self.stack_top();
                self.thread.stack.truncate(top - 2);
                if let Some(exit_value) = self.do_return(result)? {
                    return Ok(Flow::Exit(exit_value));
                }
            }
            _ => panic!("CleanupWith on {:?}", handler.kind),
        }
        Ok(Flow::Continue)
    }

    /// Walks the stack for the nearest live handler at or above the exit
    /// boundary; transfers control to it and returns `true`, or reports
    /// failure so `run` can surface the exception.
    fn handle_exception(&mut self) -> bool {
        let exit_slot = self
            .thread
            .exit_on_frame
            .map(|f| self.thread.frames[f].out_slots)
            .unwrap_or(0);

        let mut offset = self.stack_top();
        let found = loop {
            if offset == 0 || offset <= exit_slot {
                break None;
            }
            offset -= 1;
            if let Value::Handler(h) = self.thread.stack[offset] {
                if matches!(h.kind, HandlerKind::Try | HandlerKind::With) {
                    break Some((offset, h));
                }
            }
        };

        let Some((offset, handler)) = found else {
            if exit_slot == 0 {
                // Top of the thread: report and reset.
                if !self.flags.clean_output {
                    if let Some(exc) = self.thread.current_exception {
                        let report = self.describe_exception(exc);
                        eprintln!("Traceback (most recent call last):\n{report}");
                    }
                }
                self.thread.frames.clear();
            }
            return false;
        };

        // Find the frame owning the handler slot and drop everything above.
        let frame_index = self
            .thread
            .frames
            .iter()
            .rposition(|f| f.slots <= offset)
            .expect("handler below every frame");
        self.close_upvalues(offset);
        self.thread.frames.truncate(frame_index + 1);
        self.thread.stack.truncate(offset + 1);

        let exception = self
            .thread
            .current_exception
            .take()
            .expect("unwinding without a pending exception");
        self.thread.stack[offset - 1] = exception;
        self.thread.stack[offset] = Value::Handler(Handler {
            kind: match handler.kind {
                HandlerKind::Try => HandlerKind::ExceptActive,
                HandlerKind::With => HandlerKind::WithUnwind,
                _ => unreachable!(),
            },
            target: handler.target,
        });
        self.frame_mut().ip = handler.target as usize;
        true
    }

    /// `except Class` / `except (A, B)` filtering.
    fn exception_matches(&mut self, exception: Value, filter: Value) -> VmResult<bool> {
        if let Some(id) = filter.as_ref_id() {
            if matches!(self.heap.get(id), HeapData::Class(_)) {
                return Ok(self.is_instance_of(exception, id));
            }
            let classes = match self.heap.get(id) {
                HeapData::Tuple(t) => Some(t.items.to_vec()),
                _ => None,
            };
            if let Some(classes) = classes {
                for class in classes {
                    if self.exception_matches(exception, class)? {
                        return Ok(true);
                    }
                }
                return Ok(false);
            }
        }
        Err(self.runtime_error(
            self.exceptions.type_error,
            "catching classes that do not inherit from Exception is not allowed",
        ))
    }

    // ------------------------------------------------------------------
    // Upvalues
    // ------------------------------------------------------------------

    /// Finds or creates the open upvalue for a stack slot. The open list is
    /// kept sorted by descending slot.
    pub(super) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let position = self.thread.open_upvalues.iter().position(|&id| {
            let HeapData::Upvalue(u) = self.heap.get(id) else {
                unreachable!()
            };
            u.location.expect("open list holds only open upvalues") <= slot
        });
        if let Some(pos) = position {
            let id = self.thread.open_upvalues[pos];
            if let HeapData::Upvalue(u) = self.heap.get(id) {
                if u.location == Some(slot) {
                    return id;
                }
            }
            let created = self.heap.allocate(HeapData::Upvalue(UpvalueObj {
                location: Some(slot),
                closed: Value::None,
            }));
            self.thread.open_upvalues.insert(pos, created);
            created
        } else {
            let created = self.heap.allocate(HeapData::Upvalue(UpvalueObj {
                location: Some(slot),
                closed: Value::None,
            }));
            self.thread.open_upvalues.push(created);
            created
        }
    }

    /// Closes every open upvalue at or above `last`: the stack value moves
    /// into the upvalue and it leaves the open list.
    pub(super) fn close_upvalues(&mut self, last: usize) {
        while let Some(&id) = self.thread.open_upvalues.first() {
            let slot = match self.heap.get(id) {
                HeapData::Upvalue(u) => u.location.expect("open list invariant"),
                _ => unreachable!(),
            };
            if slot < last {
                break;
            }
            let value = self.thread.stack[slot];
            if let HeapData::Upvalue(u) = self.heap.get_mut(id) {
                u.location = None;
                u.closed = value;
            }
            self.thread.open_upvalues.remove(0);
        }
    }

    // ------------------------------------------------------------------
    // Attribute machinery
    // ------------------------------------------------------------------

    /// `GetProperty`: instance fields, then bound class methods, then
    /// `__getattr__`. Replaces the object on the stack top with the result;
    /// `false` means not found.
    pub(crate) fn value_get_property(&mut self, name: HeapId) -> VmResult<bool> {
        let target = self.peek(0);
        let class = match target.as_ref_id() {
            Some(id) => match self.heap.get(id) {
                HeapData::Instance(i) => {
                    if let Some(v) = i.fields.get(&self.heap, Value::Ref(name)) {
                        self.pop();
                        self.push(v);
                        return Ok(true);
                    }
                    i.class
                }
                HeapData::Class(_) => {
                    // Walk the class's own method chain; found values are
                    // returned raw (functions stay unbound on the class).
                    let mut cursor = Some(id);
                    while let Some(current) = cursor {
                        let HeapData::Class(c) = self.heap.get(current) else {
                            break;
                        };
                        if let Some(v) = c.methods.get(&self.heap, Value::Ref(name)) {
                            self.pop();
                            self.push(v);
                            return Ok(true);
                        }
                        cursor = c.base;
                    }
                    self.class_of(target)
                }
                _ => self.class_of(target),
            },
            None => self.class_of(target),
        };

        if self.bind_method(class, name)? {
            return Ok(true);
        }

        // Docstrings stored on functions, natives and classes surface as
        // `__doc__`; modules carry theirs as an ordinary field.
        if self.heap.str_content(name) == "__doc__" {
            let mut native_doc: Option<&'static str> = None;
            let stored = match target.as_ref_id().map(|id| self.heap.get(id)) {
                Some(HeapData::Closure(c)) => match self.heap.get(c.function) {
                    HeapData::Function(f) => f.docstring,
                    _ => None,
                },
                Some(HeapData::Class(c)) => c.docstring,
                Some(HeapData::Native(n)) => {
                    native_doc = n.doc;
                    None
                }
                _ => None,
            };
            let doc = match (stored, native_doc) {
                (Some(id), _) => Some(Value::Ref(id)),
                (None, Some(text)) => Some(Value::Ref(self.heap.intern(text))),
                (None, None) => None,
            };
            if let Some(doc) = doc {
                self.pop();
                self.push(doc);
                return Ok(true);
            }
        }

        if let Some(getattr) = self.class_special(class, Special::GetAttr) {
            self.push(Value::Ref(name));
            let result = self.call_simple(getattr, 2)?;
            self.push(result);
            return Ok(true);
        }
        Ok(false)
    }

    /// `SetProperty`: stack is `[owner, value]`; leaves the value.
    fn value_set_property(&mut self, name: HeapId) -> bool {
        let owner = self.peek(1);
        let value = self.peek(0);
        let Some(id) = owner.as_ref_id() else {
            return false;
        };
        match self.heap.get(id) {
            HeapData::Instance(_) => {
                self.set_field_by_id(id, name, value);
            }
            HeapData::Class(_) => {
                self.set_field_by_id(id, name, value);
                // Keep the protocol-slot cache coherent when a special
                // method is assigned after finalization.
                if self.heap.str_content(name).starts_with('_') {
                    self.finalize_class(id);
                }
            }
            _ => return false,
        }
        self.swap(1);
        self.pop();
        true
    }

    fn value_del_property(&mut self, name: HeapId) -> bool {
        let target = self.peek(0);
        let Some(id) = target.as_ref_id() else {
            return false;
        };
        let removed = self.heap.with_entry(id, |heap, data| match data {
            HeapData::Instance(i) => i.fields.delete(heap, Value::Ref(name)),
            HeapData::Class(c) => c.methods.delete(heap, Value::Ref(name)),
            _ => false,
        });
        if removed {
            self.pop();
        }
        removed
    }

    /// Slot lookup on a specific class object (not a value's class).
    pub(super) fn class_special(&self, class: HeapId, which: Special) -> Option<Value> {
        match self.heap.get(class) {
            HeapData::Class(c) => c.special(which),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Unpacking
    // ------------------------------------------------------------------

    fn unpack(&mut self, count: usize) -> VmResult<()> {
        let sequence = self.peek(0);
        let items: Option<Vec<Value>> = match sequence.as_ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Tuple(t)) => Some(t.items.to_vec()),
            Some(HeapData::List(l)) => Some(l.items.clone()),
            Some(HeapData::Dict(d)) => Some(d.entries.iter().map(|(k, _)| k).collect()),
            _ => None,
        };
        let is_str = matches!(
            sequence.as_ref_id().map(|id| self.heap.get(id)),
            Some(HeapData::Str(_))
        );
        let items = match items {
            Some(items) => items,
            None if is_str => self.unpack_str(sequence),
            // Generic iterator protocol; elements are rooted in scratch
            // while the iterator runs.
            None => self.unpack_via_iterator(sequence)?,
        };
        if items.len() != count {
            return Err(self.runtime_error(
                self.exceptions.value_error,
                format!(
                    "Wrong number of values to unpack (wanted {count}, got {})",
                    items.len()
                ),
            ));
        }
        self.pop();
        for item in items {
            self.push(item);
        }
        Ok(())
    }

    fn unpack_str(&mut self, value: Value) -> Vec<Value> {
        let id = value.as_ref_id().expect("checked by caller");
        let content = match self.heap.get(id) {
            HeapData::Str(s) => s.as_str().to_string(),
            _ => unreachable!(),
        };
        content
            .chars()
            .map(|c| {
                let s = self.heap.intern(&c.to_string());
                Value::Ref(s)
            })
            .collect()
    }

    fn unpack_via_iterator(&mut self, sequence: Value) -> VmResult<Vec<Value>> {
        let iterator = self.get_iterator(sequence)?;
        let scratch_base = self.thread.scratch.len();
        self.thread.scratch.push(iterator);
        let result = (|| {
            let mut items = Vec::new();
            loop {
                let item = self.call_simple(iterator, 0)?;
                if values_same(item, iterator) {
                    return Ok(items);
                }
                self.thread.scratch.push(item);
                items.push(item);
            }
        })();
        self.thread.scratch.truncate(scratch_base);
        result
    }

    /// `iter(v)`: dispatches `__iter__`.
    pub(crate) fn get_iterator(&mut self, value: Value) -> VmResult<Value> {
        match self.special_of(value, Special::Iter) {
            Some(iter_fn) => {
                self.push(value);
                self.call_simple(iter_fn, 1)
            }
            None => Err(self.runtime_error(
                self.exceptions.type_error,
                format!("'{}' object is not iterable", self.type_name(value)),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Frame/operand helpers
    // ------------------------------------------------------------------

    pub(super) fn frame_constant(&self, index: usize) -> Value {
        self.chunk_for(self.frame().closure).constants[index]
    }

    /// Constant that must be an interned string (a name).
    pub(super) fn frame_string(&self, index: usize) -> HeapId {
        self.frame_constant(index)
            .as_ref_id()
            .expect("name constant is always a string")
    }

    fn frame_upvalue(&self, index: usize) -> HeapId {
        match self.heap.get(self.frame().closure) {
            HeapData::Closure(c) => c.upvalues[index],
            _ => unreachable!(),
        }
    }

    fn read_frame_byte(&mut self) -> u8 {
        let frame = self.frame();
        let byte = self.chunk_for(frame.closure).code[frame.ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_frame_operand(&mut self, width: usize) -> usize {
        let mut value = 0usize;
        for _ in 0..width {
            value = value << 8 | usize::from(self.read_frame_byte());
        }
        value
    }

    // ------------------------------------------------------------------
    // Error constructors
    // ------------------------------------------------------------------

    fn undefined_variable(&mut self, name: HeapId) -> Raised {
        let text = self.heap.str_content(name).to_string();
        self.runtime_error(
            self.exceptions.name_error,
            format!("Undefined variable '{text}'."),
        )
    }

    pub(crate) fn attribute_error(&mut self, target: Value, name: HeapId) -> Raised {
        let type_name = self.type_name(target).to_string();
        let attr = self.heap.str_content(name).to_string();
        self.runtime_error(
            self.exceptions.attribute_error,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
    }

    fn not_subscriptable(&mut self, target: Value) -> Raised {
        let type_name = self.type_name(target).to_string();
        self.runtime_error(
            self.exceptions.attribute_error,
            format!("'{type_name}' object is not subscriptable"),
        )
    }

    fn not_sliceable(&mut self, target: Value) -> Raised {
        let type_name = self.type_name(target).to_string();
        self.runtime_error(
            self.exceptions.attribute_error,
            format!("'{type_name}' object is not sliceable"),
        )
    }
}
