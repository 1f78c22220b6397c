//! Call assembly and dispatch.
//!
//! `call_value` dispatches by callee kind with a uniform stack layout:
//! `extra` slots (usually the callee itself) sit under `arg_count` argument
//! values. Receiver-introducing callees (bound methods, classes, callable
//! instances) rewrite the slot under the arguments and recurse with one
//! more argument and one less extra, exactly the original trick that makes
//! `self` land in local slot 0 for free.
//!
//! Complex calls (keyword arguments and `*`/`**` splats) are marked by a
//! kwargs sentinel on the stack top. `process_complex_arguments` flattens
//! them into a positional vector and a keyword list, and `call_closure`
//! rebuilds the callee's locals from those, filling unsupplied keyword slots
//! with the unset sentinel that the compiled default-prologue tests for.

use smallvec::SmallVec;

use super::{CallFrame, Raised, Vm, VmResult, FRAMES_MAX};
use crate::heap::{HeapData, HeapId};
use crate::objects::{BoundMethodObj, DictObj, GeneratorObj, Special};
use crate::value::{values_same, Value, KWARGS_DICT, KWARGS_LIST, KWARGS_SINGLE, KWARGS_UNSET};

/// What happened to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallStatus {
    /// The result value is on the stack.
    Returned,
    /// A managed frame was pushed; run the VM to get the result.
    FramePushed,
}

impl Vm {
    /// Calls `callee` with `arg_count` arguments on the stack, above `extra`
    /// slots the call also owns (the callee slot for `Call` instructions).
    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        arg_count: usize,
        extra: usize,
    ) -> VmResult<CallStatus> {
        let Some(id) = callee.as_ref_id() else {
            return Err(self.not_callable(callee));
        };
        match self.heap.get(id) {
            HeapData::Closure(_) => self.call_closure(id, arg_count, extra),
            HeapData::Native(_) => self.call_native(id, arg_count, extra),
            HeapData::Class(_) => {
                let init = match self.heap.get(id) {
                    HeapData::Class(c) => c.special(Special::Init),
                    _ => unreachable!(),
                };
                let instance = self.new_instance(id);
                match init {
                    Some(init_fn) => {
                        self.place_receiver(instance, arg_count, extra);
                        self.call_value(init_fn, arg_count + 1, extra.saturating_sub(1))
                    }
                    None if arg_count == 0 => {
                        if extra > 0 {
                            let top = self.stack_top();
                            self.thread.stack[top - 1] = instance;
                        } else {
                            self.push(instance);
                        }
                        Ok(CallStatus::Returned)
                    }
                    None => {
                        let name = self.heap.str_content(self.class_name(id)).to_string();
                        Err(self.runtime_error(
                            self.exceptions.type_error,
                            format!("{name}() takes no arguments ({arg_count} given)"),
                        ))
                    }
                }
            }
            HeapData::BoundMethod(_) => {
                let (receiver, method) = match self.heap.get(id) {
                    HeapData::BoundMethod(b) => (b.receiver, b.method),
                    _ => unreachable!(),
                };
                self.place_receiver(receiver, arg_count, extra);
                self.call_value(method, arg_count + 1, extra.saturating_sub(1))
            }
            HeapData::Instance(_) | HeapData::Generator(_) => {
                match self.special_of(callee, Special::Call) {
                    Some(call_fn) => {
                        self.place_receiver(callee, arg_count, extra);
                        self.call_value(call_fn, arg_count + 1, extra.saturating_sub(1))
                    }
                    None => Err(self.not_callable(callee)),
                }
            }
            _ => Err(self.not_callable(callee)),
        }
    }

    /// Calls with arguments already pushed (no callee slot) and returns the
    /// result value directly.
    pub(crate) fn call_simple(&mut self, callable: Value, arg_count: usize) -> VmResult<Value> {
        match self.call_value(callable, arg_count, 0)? {
            CallStatus::Returned => Ok(self.pop()),
            CallStatus::FramePushed => self.run_next(),
        }
    }

    /// Writes a receiver into the slot below the arguments, creating it when
    /// the caller owns no extra slot there.
    fn place_receiver(&mut self, receiver: Value, arg_count: usize, extra: usize) {
        let len = self.stack_top();
        if extra > 0 {
            self.thread.stack[len - arg_count - 1] = receiver;
        } else {
            self.thread.stack.insert(len - arg_count, receiver);
        }
    }

    fn not_callable(&mut self, callee: Value) -> Raised {
        let type_name = self.type_name(callee).to_string();
        self.runtime_error(
            self.exceptions.type_error,
            format!("'{type_name}' object is not callable"),
        )
    }

    // ------------------------------------------------------------------
    // Managed calls
    // ------------------------------------------------------------------

    fn call_closure(
        &mut self,
        closure: HeapId,
        mut arg_count: usize,
        extra: usize,
    ) -> VmResult<CallStatus> {
        let function = self.function_of(closure);
        let required: SmallVec<[HeapId; 8]> = function.required_args.iter().copied().collect();
        let keyword: SmallVec<[HeapId; 8]> = function.keyword_args.iter().copied().collect();
        let flags = function.flags;
        let name = function
            .name
            .map(|n| self.heap.str_content(n).to_string())
            .unwrap_or_else(|| "<unnamed>".to_string());

        let named_count = required.len() + keyword.len();
        let total_slots =
            named_count + usize::from(flags.collects_args) + usize::from(flags.collects_kwargs);

        if arg_count > 0 && self.peek(0).is_kwargs() {
            let (positionals, keywords) = self.process_complex_arguments(arg_count, &name)?;

            if positionals.len() > named_count && !flags.collects_args {
                return Err(self.argument_count_error(&name, required.len(), named_count, positionals.len()));
            }

            // Lay out the named slots, unset-marked, then fill.
            let base = self.stack_top();
            for i in 0..named_count {
                let v = positionals
                    .get(i)
                    .copied()
                    .unwrap_or(Value::Kwargs(KWARGS_UNSET));
                self.push(v);
            }
            if flags.collects_args {
                let rest: Vec<Value> = positionals
                    .get(named_count..)
                    .map(|s| s.to_vec())
                    .unwrap_or_default();
                let list = self.new_list(rest);
                self.push(list);
            }

            let mut extra_keywords: Vec<(HeapId, Value)> = Vec::new();
            for (kw_name, kw_value) in keywords {
                let slot = required
                    .iter()
                    .chain(keyword.iter())
                    .position(|&n| n == kw_name);
                match slot {
                    Some(slot) => {
                        if !self.thread.stack[base + slot].is_kwargs() {
                            let arg = self.heap.str_content(kw_name).to_string();
                            return Err(self.runtime_error(
                                self.exceptions.type_error,
                                format!("{name}() got multiple values for argument '{arg}'"),
                            ));
                        }
                        self.thread.stack[base + slot] = kw_value;
                    }
                    None if flags.collects_kwargs => extra_keywords.push((kw_name, kw_value)),
                    None => {
                        let arg = self.heap.str_content(kw_name).to_string();
                        return Err(self.runtime_error(
                            self.exceptions.type_error,
                            format!("{name}() got an unexpected keyword argument '{arg}'"),
                        ));
                    }
                }
            }
            if flags.collects_kwargs {
                let mut dict = DictObj::default();
                for (kw_name, kw_value) in extra_keywords {
                    dict.entries.set(&self.heap, Value::Ref(kw_name), kw_value);
                }
                let id = self.heap.allocate(HeapData::Dict(dict));
                self.push(Value::Ref(id));
            }

            for (i, &arg_name) in required.iter().enumerate() {
                if self.thread.stack[base + i].is_kwargs() {
                    let arg = self.heap.str_content(arg_name).to_string();
                    return Err(self.runtime_error(
                        self.exceptions.type_error,
                        format!("{name}() missing required positional argument: '{arg}'"),
                    ));
                }
            }
            arg_count = total_slots;
        } else {
            if arg_count > named_count && flags.collects_args {
                let len = self.stack_top();
                let rest = self.thread.stack.split_off(len - (arg_count - named_count));
                let list = self.new_list(rest);
                self.push(list);
                arg_count = named_count + 1;
            } else if arg_count < required.len() || arg_count > named_count {
                return Err(self.argument_count_error(
                    &name,
                    required.len(),
                    named_count,
                    arg_count,
                ));
            }
            while arg_count < total_slots {
                self.push(Value::Kwargs(KWARGS_UNSET));
                arg_count += 1;
            }
        }

        if flags.is_generator {
            let len = self.stack_top();
            let args = self.thread.stack.split_off(len - arg_count);
            let len = self.stack_top();
            self.thread.stack.truncate(len - extra);
            let generator = self
                .heap
                .allocate(HeapData::Generator(GeneratorObj::new(closure, args)));
            self.push(Value::Ref(generator));
            return Ok(CallStatus::Returned);
        }

        self.push_frame(closure, arg_count, extra)
    }

    fn push_frame(
        &mut self,
        closure: HeapId,
        arg_count: usize,
        extra: usize,
    ) -> VmResult<CallStatus> {
        if self.thread.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error(self.exceptions.base, "Too many call frames."));
        }
        let slots = self.stack_top() - arg_count;
        let globals = self
            .function_of(closure)
            .globals
            .unwrap_or(self.thread.module);
        self.thread.frames.push(CallFrame {
            closure,
            ip: 0,
            slots,
            out_slots: slots - extra,
            globals,
            entered: std::time::Instant::now(),
        });
        Ok(CallStatus::FramePushed)
    }

    fn argument_count_error(
        &mut self,
        name: &str,
        min: usize,
        max: usize,
        given: usize,
    ) -> Raised {
        let (qualifier, wanted) = if min == max {
            ("exactly", min)
        } else if given < min {
            ("at least", min)
        } else {
            ("at most", max)
        };
        let plural = if wanted == 1 { "" } else { "s" };
        self.runtime_error(
            self.exceptions.argument_error,
            format!("{name}() takes {qualifier} {wanted} argument{plural} ({given} given)"),
        )
    }

    // ------------------------------------------------------------------
    // Natives
    // ------------------------------------------------------------------

    fn call_native(
        &mut self,
        native: HeapId,
        arg_count: usize,
        extra: usize,
    ) -> VmResult<CallStatus> {
        let (function, name) = match self.heap.get(native) {
            HeapData::Native(n) => (n.function, n.name),
            _ => unreachable!(),
        };

        let (args, has_kwargs) = if arg_count > 0 && self.peek(0).is_kwargs() {
            let (positionals, keywords) = self.process_complex_arguments(arg_count, name)?;
            let mut dict = DictObj::default();
            for (kw_name, kw_value) in keywords {
                dict.entries.set(&self.heap, Value::Ref(kw_name), kw_value);
            }
            let dict_id = self.heap.allocate(HeapData::Dict(dict));
            let mut args = positionals;
            args.push(Value::Ref(dict_id));
            (args, true)
        } else {
            let len = self.stack_top();
            (self.thread.stack.split_off(len - arg_count), false)
        };

        let len = self.stack_top();
        self.thread.stack.truncate(len - extra);

        // Root the argument copies for the duration of the call so a native
        // that re-enters the VM can't lose them to a collection.
        let scratch_base = self.thread.scratch.len();
        self.thread.scratch.extend(args.iter().copied());
        let result = function(self, &args, has_kwargs);
        self.thread.scratch.truncate(scratch_base);

        let value = result?;
        self.push(value);
        Ok(CallStatus::Returned)
    }

    // ------------------------------------------------------------------
    // Complex argument processing
    // ------------------------------------------------------------------

    /// Pops a complex argument region (positionals, then marker pairs, then
    /// the count sentinel) and flattens it. Keyword names come back as
    /// interned string handles; duplicates raise `TypeError`.
    fn process_complex_arguments(
        &mut self,
        arg_count: usize,
        name: &str,
    ) -> VmResult<(Vec<Value>, Vec<(HeapId, Value)>)> {
        let Value::Kwargs(special_count) = self.pop() else {
            unreachable!("caller checked the sentinel");
        };
        let special_count = special_count as usize;
        let remaining = arg_count - 1;
        let len = self.stack_top();
        let raw = self.thread.stack.split_off(len - remaining);

        // Keep everything reachable while splats may run managed iterators.
        let scratch_base = self.thread.scratch.len();
        self.thread.scratch.extend(raw.iter().copied());
        let result = self.process_complex_inner(&raw, remaining - special_count * 2, name);
        self.thread.scratch.truncate(scratch_base);
        result
    }

    fn process_complex_inner(
        &mut self,
        raw: &[Value],
        plain: usize,
        name: &str,
    ) -> VmResult<(Vec<Value>, Vec<(HeapId, Value)>)> {
        let mut positionals: Vec<Value> = raw[..plain].to_vec();
        let mut keywords: Vec<(HeapId, Value)> = Vec::new();

        let mut push_keyword = |vm: &mut Vm,
                                keywords: &mut Vec<(HeapId, Value)>,
                                key: HeapId,
                                value: Value|
         -> VmResult<()> {
            if keywords.iter().any(|&(k, _)| k == key) {
                let arg = vm.heap.str_content(key).to_string();
                return Err(vm.runtime_error(
                    vm.exceptions.type_error,
                    format!("{name}() got multiple values for argument '{arg}'"),
                ));
            }
            keywords.push((key, value));
            Ok(())
        };

        let mut i = plain;
        while i + 1 < raw.len() {
            let key = raw[i];
            let value = raw[i + 1];
            i += 2;
            match key {
                Value::Kwargs(KWARGS_SINGLE) => positionals.push(value),
                Value::Kwargs(KWARGS_LIST) => {
                    self.unpack_iterable_into(value, &mut positionals)?;
                }
                Value::Kwargs(KWARGS_DICT) => {
                    let entries: Option<Vec<(Value, Value)>> =
                        match value.as_ref_id().map(|id| self.heap.get(id)) {
                            Some(HeapData::Dict(d)) => Some(d.entries.iter().collect()),
                            _ => None,
                        };
                    let Some(entries) = entries else {
                        return Err(self.runtime_error(
                            self.exceptions.type_error,
                            format!("{name}(): **expression value is not a dict."),
                        ));
                    };
                    for (k, v) in entries {
                        let Some(key_id) = k.as_ref_id().filter(|&id| {
                            matches!(self.heap.get(id), HeapData::Str(_))
                        }) else {
                            return Err(self.runtime_error(
                                self.exceptions.type_error,
                                format!("{name}(): **expression contains non-string key"),
                            ));
                        };
                        push_keyword(self, &mut keywords, key_id, v)?;
                    }
                }
                Value::Ref(key_id) => {
                    push_keyword(self, &mut keywords, key_id, value)?;
                }
                _ => unreachable!("malformed complex argument region"),
            }
        }
        Ok((positionals, keywords))
    }

    /// Splats an iterable into `out`. Lists, tuples, dicts (keys) and sets
    /// are read directly; anything else goes through the iterator protocol
    /// with the produced values rooted in scratch.
    pub(crate) fn unpack_iterable_into(
        &mut self,
        value: Value,
        out: &mut Vec<Value>,
    ) -> VmResult<()> {
        let direct: Option<Vec<Value>> = match value.as_ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::List(l)) => Some(l.items.clone()),
            Some(HeapData::Tuple(t)) => Some(t.items.to_vec()),
            Some(HeapData::Dict(d)) => Some(d.entries.iter().map(|(k, _)| k).collect()),
            Some(HeapData::Set(s)) => Some(s.entries.iter().map(|(k, _)| k).collect()),
            _ => None,
        };
        if let Some(items) = direct {
            out.extend(items);
            return Ok(());
        }

        let iterator = self.get_iterator(value)?;
        let scratch_base = self.thread.scratch.len();
        self.thread.scratch.push(iterator);
        let result = (|| loop {
            let item = self.call_simple(iterator, 0)?;
            if values_same(item, iterator) {
                return Ok(());
            }
            self.thread.scratch.push(item);
            out.push(item);
        })();
        self.thread.scratch.truncate(scratch_base);
        result
    }

    // ------------------------------------------------------------------
    // Method binding
    // ------------------------------------------------------------------

    /// Attribute lookup through a class chain with the receiver on the stack
    /// top. Plain functions bind, statics and raw values pass through,
    /// dynamic properties and `@property` wrappers evaluate immediately.
    pub(crate) fn bind_method(&mut self, class: HeapId, name: HeapId) -> VmResult<bool> {
        let mut cursor = Some(class);
        let mut found = None;
        while let Some(current) = cursor {
            let HeapData::Class(c) = self.heap.get(current) else {
                break;
            };
            if let Some(m) = c.methods.get(&self.heap, Value::Ref(name)) {
                found = Some(m);
                break;
            }
            cursor = c.base;
        }
        let Some(method) = found else {
            return Ok(false);
        };

        let receiver = self.peek(0);
        enum Binding {
            Raw,
            Bound,
            CallGetter(Value),
        }
        let binding = match method.as_ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Native(n)) => {
                if n.is_dynamic_property {
                    Binding::CallGetter(method)
                } else if n.is_static {
                    Binding::Raw
                } else {
                    Binding::Bound
                }
            }
            Some(HeapData::Closure(c)) => {
                let is_static = match self.heap.get(c.function) {
                    HeapData::Function(f) => f.flags.is_static_method,
                    _ => false,
                };
                if is_static {
                    Binding::Raw
                } else {
                    Binding::Bound
                }
            }
            Some(HeapData::Property(p)) => Binding::CallGetter(p.method),
            _ => Binding::Raw,
        };

        let out = match binding {
            Binding::Raw => method,
            Binding::Bound => {
                let bound = self.heap.allocate(HeapData::BoundMethod(BoundMethodObj {
                    receiver,
                    method,
                }));
                Value::Ref(bound)
            }
            Binding::CallGetter(getter) => {
                self.push(receiver);
                self.call_simple(getter, 1)?
            }
        };
        self.pop();
        self.push(out);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Generator driving
    // ------------------------------------------------------------------

    /// Resumes a generator: splice its saved stack slice under a fresh
    /// frame, run to the next suspension, then capture the live slice back.
    /// Returns the yielded value, or the generator itself when exhausted.
    pub(crate) fn resume_generator(
        &mut self,
        generator: HeapId,
        sent: Option<Value>,
    ) -> VmResult<Value> {
        let (closure, resume_ip, started, finished) = match self.heap.get(generator) {
            HeapData::Generator(g) => (g.closure, g.ip, g.started, g.finished()),
            _ => panic!("resume_generator on non-generator"),
        };
        if finished {
            return Ok(Value::Ref(generator));
        }
        if self.thread.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error(self.exceptions.base, "Too many call frames."));
        }

        let slots = self.stack_top();
        let globals = self
            .function_of(closure)
            .globals
            .unwrap_or(self.thread.module);
        self.thread.frames.push(CallFrame {
            closure,
            ip: resume_ip.expect("not finished"),
            slots,
            out_slots: slots,
            globals,
            entered: std::time::Instant::now(),
        });

        let saved = match self.heap.get_mut(generator) {
            HeapData::Generator(g) => {
                g.running = true;
                std::mem::take(&mut g.stack)
            }
            _ => unreachable!(),
        };
        self.thread.stack.extend(saved);
        if started {
            // Replace the suspended yield's placeholder with the sent value.
            self.pop();
            self.push(sent.unwrap_or(Value::None));
        }

        let result = self.run_next();

        match self.heap.get_mut(generator) {
            HeapData::Generator(g) => {
                g.running = false;
                g.started = true;
            }
            _ => unreachable!(),
        }

        match result {
            Err(raised) => {
                if let HeapData::Generator(g) = self.heap.get_mut(generator) {
                    g.ip = None;
                }
                Err(raised)
            }
            Ok(Value::Kwargs(KWARGS_UNSET)) => {
                // The function returned; the return value is on the stack.
                let value = self.pop();
                if let HeapData::Generator(g) = self.heap.get_mut(generator) {
                    g.result = value;
                    g.ip = None;
                }
                Ok(Value::Ref(generator))
            }
            Ok(yielded) => {
                let (yield_ip, yield_slots) = self
                    .thread
                    .yield_state
                    .take()
                    .expect("suspension without yield state");
                debug_assert_eq!(yield_slots, slots);
                // The slice leaves the thread stack, so upvalues pointing
                // into it close over their current values; the next resume
                // may splice the slice in at a different depth.
                self.close_upvalues(yield_slots);
                let slice = self.thread.stack.split_off(yield_slots);
                if let HeapData::Generator(g) = self.heap.get_mut(generator) {
                    g.stack = slice;
                    g.ip = Some(yield_ip);
                }
                Ok(yielded)
            }
        }
    }
}
